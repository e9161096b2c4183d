// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Error objects and codes

use std::fmt;
use std::io;
use std::error;
use std::result;
use serde::de;

#[derive(Clone, PartialEq, Debug)]
pub enum ErrorCode {
    /// Opcode not valid for the protocol version in use
    UnknownOpcode { opcode: u8, version: u8 },
    /// EOF while parsing an opcode or a header
    EOFWhileParsing,
    /// EOF while reading the argument of the named opcode
    TruncatedArgument(&'static str),
    /// Protocol version outside of the supported range
    UnsupportedProtocol(u8),
    /// The protocol version cannot be inferred from this opcode
    UninferableOpcode(u8),
    /// Character that is not part of a number found in a numeric field
    NonNumeric { field: &'static str, byte: u8 },
    /// Malformed backslash escape in a textual string
    InvalidEscape(Vec<u8>),
    /// Textual string without matching quotes
    MissingQuote(Vec<u8>),
    /// Invalid literal found
    InvalidLiteral(Vec<u8>),
    /// Length prefix found negative
    NegativeLength,
    /// String decoding as UTF-8 failed
    StringNotUTF8,
    /// Stack underflowed
    StackUnderflow,
    /// Wrong stack top type for opcode
    InvalidStackTop(&'static str, String),
    /// A container opcode found an incompatible target below its operand
    InvalidTarget { opcode: &'static str, target: String, operand: String },
    /// Value not hashable, but used as dict key or set item
    ValueNotHashable,
    /// Recursive structure found, which we don't support
    Recursive,
    /// Containers nested deeper than the given limit
    NestingTooDeep(usize),
    /// The unpickled value would hold more nodes than the given limit
    TooManyValues(usize),
    /// A value was missing from the memo
    MissingMemo(u32),
    /// Extension code not present in the extension table
    UnknownExtension(u32),
    /// NEXT_BUFFER found, but no out-of-band buffers were supplied
    MissingBuffers,
    /// NEXT_BUFFER found, but all supplied buffers were already consumed
    BuffersExhausted,
    /// REDUCE and friends applied to something that cannot be called
    NotCallable { opcode: &'static str, value: String },
    /// A built-in callable got arguments it cannot handle
    InvalidArguments(String),
    /// Persistent id found, but no persistent loader configured
    PersistentLoad(String),
    /// The stream ended before a STOP opcode
    MissingStop,
    /// Found trailing bytes after STOP opcode
    TrailingBytes,
    /// Structure deserialization error (e.g., unknown variant)
    Structure(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ErrorCode::UnknownOpcode { opcode, version } =>
                write!(fmt, "invalid opcode {:#04x} for protocol {}", opcode, version),
            ErrorCode::EOFWhileParsing => write!(fmt, "EOF while parsing"),
            ErrorCode::TruncatedArgument(opcode) =>
                write!(fmt, "EOF while reading the argument of {}", opcode),
            ErrorCode::UnsupportedProtocol(v) => write!(fmt, "unsupported protocol {}", v),
            ErrorCode::UninferableOpcode(op) =>
                write!(fmt, "cannot infer protocol version from opcode {:#04x}", op),
            ErrorCode::NonNumeric { field, byte } =>
                write!(fmt, "non-numeric character {:?} while reading {}",
                       byte as char, field),
            ErrorCode::InvalidEscape(ref e) =>
                write!(fmt, "invalid backslash escape: \\{}", String::from_utf8_lossy(e)),
            ErrorCode::MissingQuote(ref l) =>
                write!(fmt, "string is not quoted: {}", String::from_utf8_lossy(l)),
            ErrorCode::InvalidLiteral(ref l) =>
                write!(fmt, "literal is invalid: {}", String::from_utf8_lossy(l)),
            ErrorCode::NegativeLength => write!(fmt, "negative length prefix"),
            ErrorCode::StringNotUTF8 => write!(fmt, "string is not UTF-8 encoded"),
            ErrorCode::StackUnderflow => write!(fmt, "pickle stack underflow"),
            ErrorCode::InvalidStackTop(what, ref it) =>
                write!(fmt, "invalid stack top, expected {}, got {}", what, it),
            ErrorCode::InvalidTarget { opcode, ref target, ref operand } =>
                write!(fmt, "cannot apply {} with {} onto {}", opcode, operand, target),
            ErrorCode::ValueNotHashable => write!(fmt, "dict key or set item not hashable"),
            ErrorCode::Recursive => write!(fmt, "recursive structure found"),
            ErrorCode::NestingTooDeep(limit) =>
                write!(fmt, "containers nested deeper than {} levels", limit),
            ErrorCode::TooManyValues(limit) =>
                write!(fmt, "unpickled value exceeds {} nodes", limit),
            ErrorCode::MissingMemo(n) => write!(fmt, "missing memo with id {}", n),
            ErrorCode::UnknownExtension(code) => write!(fmt, "unknown extension code {}", code),
            ErrorCode::MissingBuffers =>
                write!(fmt, "pickle stream refers to out-of-band data but no buffers were given"),
            ErrorCode::BuffersExhausted => write!(fmt, "not enough out-of-band buffers"),
            ErrorCode::NotCallable { opcode, ref value } =>
                write!(fmt, "cannot execute {} on a non-callable: {}", opcode, value),
            ErrorCode::InvalidArguments(ref s) => write!(fmt, "invalid arguments: {}", s),
            ErrorCode::PersistentLoad(ref id) =>
                write!(fmt, "no persistent loader for persistent id {}", id),
            ErrorCode::MissingStop => write!(fmt, "stream ended without a STOP opcode"),
            ErrorCode::TrailingBytes => write!(fmt, "trailing bytes found"),
            ErrorCode::Structure(ref s) => fmt.write_str(s),
        }
    }
}

/// This type represents all possible errors that can occur when
/// deserializing a value.
#[derive(Debug)]
pub enum Error {
    /// Some IO error occurred when reading the pickle stream.
    Io(io::Error),
    /// The pickle stream is malformed at the given byte offset.
    Format(ErrorCode, usize),
    /// The pickle had some error while interpreting.  The second field names
    /// the opcode that was executing, if any.
    Eval(ErrorCode, Option<&'static str>),
    /// Syntax error while transforming into Rust values.
    Syntax(ErrorCode),
}

impl Error {
    /// The reason behind the error, if it is not an IO error.
    pub fn code(&self) -> Option<&ErrorCode> {
        match *self {
            Error::Io(_) => None,
            Error::Format(ref code, _) | Error::Eval(ref code, _) | Error::Syntax(ref code) =>
                Some(code),
        }
    }

    /// Attributes an interpreting error to `opcode`, unless it already names
    /// one.
    pub fn in_opcode(self, opcode: &'static str) -> Error {
        match self {
            Error::Eval(code, None) => Error::Eval(code, Some(opcode)),
            other => other,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Error {
        Error::Io(error)
    }
}

pub type Result<T> = result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref error) => error.fmt(fmt),
            Error::Format(ref code, offset) => write!(fmt, "format error at offset {}: {}",
                                                      offset, code),
            Error::Eval(ref code, None) => write!(fmt, "deserialization error: {}", code),
            Error::Eval(ref code, Some(opcode)) =>
                write!(fmt, "deserialization error in {}: {}", opcode, code),
            Error::Syntax(ref code) => write!(fmt, "decoding error: {}", code)
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Io(ref error) => Some(error),
            _ => None,
        }
    }
}

impl de::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Error {
        Error::Syntax(ErrorCode::Structure(msg.to_string()))
    }
}
