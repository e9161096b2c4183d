// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Values without a native Rust counterpart: placeholder classes and their
//! instances, byte arrays, and host-implemented callables.

use std::fmt;
use std::collections::BTreeMap;

use crate::error::{Error, ErrorCode, Result};
use crate::value::{Value, HashableValue};

/// A class that was referenced by the pickle, but that the constant table
/// does not know about.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PyClass {
    namespace: String,
    name: String,
}

impl PyClass {
    pub fn new<N: Into<String>, M: Into<String>>(namespace: N, name: M) -> PyClass {
        PyClass { namespace: namespace.into(), name: name.into() }
    }

    /// The module the class was looked up in.
    pub fn namespace(&self) -> &str { &self.namespace }

    pub fn name(&self) -> &str { &self.name }

    /// "Calls" the class, recording the constructor arguments.
    pub fn instantiate(&self, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> PyObject {
        PyObject::new(self.clone(), args, kwargs)
    }
}

impl fmt::Display for PyClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}.{}", self.namespace, self.name)
        }
    }
}

/// An instance of a `PyClass`.
///
/// The object keeps the arguments it was constructed with, and the
/// attributes that were set by `BUILD`, `SETITEM` and `SETITEMS`.  A
/// `BUILD` state that is not an attribute dictionary is kept as is.
#[derive(Clone, Debug, PartialEq)]
pub struct PyObject {
    pub(crate) class: PyClass,
    pub(crate) args: Vec<Value>,
    pub(crate) kwargs: BTreeMap<String, Value>,
    pub(crate) attributes: BTreeMap<HashableValue, Value>,
    pub(crate) state: Option<Box<Value>>,
}

impl PyObject {
    pub fn new(class: PyClass, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> PyObject {
        PyObject {
            class,
            args,
            kwargs,
            attributes: BTreeMap::new(),
            state: None,
        }
    }

    pub fn class(&self) -> &PyClass { &self.class }

    /// Positional constructor arguments.
    pub fn args(&self) -> &[Value] { &self.args }

    /// Keyword constructor arguments (from `NEWOBJ_EX`).
    pub fn kwargs(&self) -> &BTreeMap<String, Value> { &self.kwargs }

    pub fn attributes(&self) -> &BTreeMap<HashableValue, Value> { &self.attributes }

    /// State passed to `BUILD` that was not a dictionary of attributes.
    pub fn state(&self) -> Option<&Value> { self.state.as_ref().map(|s| &**s) }

    /// Looks up an attribute by name.  Python 2 pickles use byte strings as
    /// attribute names, so those are tried as well.
    pub fn getattr(&self, name: &str) -> Option<&Value> {
        self.attributes.get(&HashableValue::String(name.into()))
            .or_else(|| self.attributes.get(&HashableValue::Bytes(name.as_bytes().to_vec())))
    }

    pub fn setattr(&mut self, name: HashableValue, value: Value) {
        self.attributes.insert(name, value);
    }

    pub fn set_state(&mut self, state: Value) {
        self.state = Some(Box::new(state));
    }

    /// Unwraps the object into its attribute mapping.
    pub fn into_attributes(self) -> BTreeMap<HashableValue, Value> {
        self.attributes
    }
}

impl fmt::Display for PyObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<{} object", self.class)?;
        for (i, (key, value)) in self.attributes.iter().enumerate() {
            write!(f, "{}{}={}", if i == 0 { ": " } else { ", " }, key, value)?;
        }
        if let Some(ref state) = self.state {
            write!(f, " state={}", state)?;
        }
        f.write_str(">")
    }
}

/// Character encoding a `ByteArray` was tagged with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    /// Raw binary data; the default.
    Ascii8Bit,
    /// Latin-1, as used by Python 2's `bytearray(u'...', 'latin-1')`.
    Iso8859_1,
}

impl Encoding {
    /// Maps a Python codec name to an encoding.
    pub fn from_name(name: &str) -> Option<Encoding> {
        match &*name.to_ascii_lowercase() {
            "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" => Some(Encoding::Iso8859_1),
            "ascii" | "binary" => Some(Encoding::Ascii8Bit),
            _ => None,
        }
    }
}

impl Default for Encoding {
    fn default() -> Encoding { Encoding::Ascii8Bit }
}

/// A mutable byte sequence (Python's `bytearray`).
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ByteArray {
    bytes: Vec<u8>,
    encoding: Encoding,
    readonly: bool,
}

impl ByteArray {
    pub fn new(bytes: Vec<u8>) -> ByteArray {
        ByteArray { bytes, encoding: Encoding::default(), readonly: false }
    }

    pub fn with_encoding(bytes: Vec<u8>, encoding: Encoding) -> ByteArray {
        ByteArray { bytes, encoding, readonly: false }
    }

    pub fn as_bytes(&self) -> &[u8] { &self.bytes }

    pub fn into_bytes(self) -> Vec<u8> { self.bytes }

    pub fn encoding(&self) -> Encoding { self.encoding }

    pub fn len(&self) -> usize { self.bytes.len() }

    pub fn is_empty(&self) -> bool { self.bytes.is_empty() }

    /// Whether the array came from a read-only out-of-band buffer.
    pub fn is_readonly(&self) -> bool { self.readonly }

    pub fn make_readonly(&mut self) {
        self.readonly = true;
    }
}

impl fmt::Display for ByteArray {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bytearray(b{:?})", self.bytes)
    }
}

/// Signature of host functions that can be registered as constants.
pub type CallFn = fn(Vec<Value>, BTreeMap<String, Value>) -> Result<Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallableKind {
    /// Calling it creates an instance.
    Class,
    /// Calling it computes a result.
    Function,
}

/// A class or function implemented on the host side, found by `GLOBAL` or
/// `STACK_GLOBAL` in the constant table.
#[derive(Clone, Copy)]
pub struct Callable {
    namespace: &'static str,
    name: &'static str,
    kind: CallableKind,
    func: CallFn,
}

impl Callable {
    pub fn class(namespace: &'static str, name: &'static str, func: CallFn) -> Callable {
        Callable { namespace, name, kind: CallableKind::Class, func }
    }

    pub fn function(namespace: &'static str, name: &'static str, func: CallFn) -> Callable {
        Callable { namespace, name, kind: CallableKind::Function, func }
    }

    pub fn namespace(&self) -> &'static str { self.namespace }

    pub fn name(&self) -> &'static str { self.name }

    pub fn kind(&self) -> CallableKind { self.kind }

    pub fn call(&self, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Value> {
        (self.func)(args, kwargs)
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Callable) -> bool {
        self.namespace == other.namespace && self.name == other.name && self.kind == other.kind
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Callable")
         .field("namespace", &self.namespace)
         .field("name", &self.name)
         .field("kind", &self.kind)
         .finish()
    }
}

impl fmt::Display for Callable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            CallableKind::Class => "class",
            CallableKind::Function => "function",
        };
        write!(f, "<{} {}.{}>", kind, self.namespace, self.name)
    }
}

/// Calls a class or callable value with the given arguments.
pub fn call(callee: &Value, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Value> {
    match *callee {
        Value::Class(ref class) => Ok(Value::Object(class.instantiate(args, kwargs))),
        Value::Callable(ref func) => func.call(args, kwargs),
        ref other => Err(Error::Eval(ErrorCode::NotCallable { opcode: "call",
                                                              value: other.type_name().into() },
                                     None)),
    }
}
