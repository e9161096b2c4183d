// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Decoding of Python's pickle format
//!
//! # Pickle format
//!
//! Please see the [Python docs](http://docs.python.org/library/pickle) for
//! details on the Pickle format.
//!
//! This crate reads all Pickle protocols (0 to 5).  The headerless protocols
//! 0 and 1 are told apart by looking ahead for an opcode only one of them
//! uses; from protocol 2 on, the stream announces its version.
//!
//! # Architecture
//!
//! Unpickling happens in two stages:
//!
//! * A [`protocol::Decoder`] turns bytes into [`Instruction`]s.  It accepts
//!   exactly the opcodes of its protocol version and follows protocol 4
//!   frames transparently.
//! * A [`Deserializer`] executes the instructions on a stack machine with a
//!   memo, a constant table (for `GLOBAL`), an extension table (for `EXT*`),
//!   and optional out-of-band buffers (for `NEXT_BUFFER`).
//!
//! # Supported types
//!
//! Python's built-in types that map easily to Rust constructs are restored
//! as such:
//!
//! * None
//! * Boolean (Rust `bool`)
//! * Integers (Rust `i64` or bigints from num)
//! * Floats (Rust `f64`)
//! * Bytes objects and bytearrays
//! * (Unicode) strings (Rust `String`)
//! * Lists and tuples (Rust `Vec<Value>`)
//! * Sets and frozensets (Rust `BTreeSet<HashableValue>`)
//! * Dictionaries (Rust `BTreeMap<HashableValue, Value>`)
//!
//! Classes that are not in the constant table are represented by a
//! [`PyClass`] placeholder; "instantiating" one yields a [`PyObject`] that
//! records its constructor arguments and the attributes set on it.  No code
//! named by the pickle is ever executed, only the host functions registered
//! in the [`Constants`] table.
//!
//! *Note on enums:* On deserialization into Rust enums, the tuple form
//! `(name, [data])`, the string form and the single-entry mapping form are
//! accepted.
//!
//! *Note on bytes objects:* when deserializing bytes objects, you have to use a
//! Rust wrapper type that enables deserialization from the serde data model's
//! "bytes" type.  The [`serde_bytes`](https://docs.serde.rs/serde_bytes/) crate
//! provides such wrappers.
//!
//! # Exported API
//!
//! The library exports generic serde deserializing functions `from_*`.  It
//! also exports functions that produce the specific `Value` type exposed by
//! this library, which supports all built-in Python types (notably, long
//! integers and sets, which serde's generic types don't handle).  These
//! functions are called `value_from_*`.  `parse_*` return the decoded
//! instructions without executing them.
//!
//! # Minimum Supported Rust Version
//!
//! The minimum supported version of the toolchain is 1.58.1.

pub use self::de::{
    Deserializer,
    DeOptions,
    PersistentLoadFn,
    Status,
    run,
    from_reader,
    from_slice,
    from_iter,
    value_from_reader,
    value_from_slice,
    value_from_iter,
    parse_reader,
    parse_slice,
};

pub use self::value::{
    Value,
    HashableValue,
    from_value,
};

pub use self::codec::IntLiteral;
pub use self::constants::Constants;
pub use self::error::{Error, ErrorCode, Result};
pub use self::infer::infer_version;
pub use self::instruction::Instruction;
pub use self::object::{ByteArray, Callable, CallableKind, CallFn, Encoding, PyClass, PyObject,
                       call};
pub use self::source::Source;

pub mod consts;
pub mod de;
pub mod error;
pub mod protocol;
pub mod value;
mod codec;
mod constants;
mod infer;
mod instruction;
mod object;
mod source;
mod value_impls;

#[cfg(test)]
#[path = "../test/mod.rs"]
mod test;
