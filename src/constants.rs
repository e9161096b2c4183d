// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! The constant table consulted by `GLOBAL` and `STACK_GLOBAL`.
//!
//! The default table knows the few builtins that pickles of plain data
//! refer to: `object`, `set`, `frozenset`, `bytes` and `bytearray` from both
//! the Python 2 and Python 3 builtins modules, `copy_reg._reconstructor`, and
//! `_codecs.encode`, which Python 3 uses to pickle `bytes` under protocol 2.
//! Names that are not found resolve to a `PyClass` placeholder.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::error::{Error, ErrorCode, Result};
use crate::object::{call, ByteArray, Callable, CallFn, Encoding, PyClass};
use crate::value::{Value, HashableValue};

const BUILTIN_MODULES: [&str; 2] = ["__builtin__", "builtins"];
const COPYREG_MODULES: [&str; 2] = ["copy_reg", "copyreg"];

/// Nested namespace -> name -> value mapping.
#[derive(Clone, Debug, PartialEq)]
pub struct Constants {
    namespaces: BTreeMap<String, BTreeMap<String, Value>>,
}

impl Constants {
    /// Creates a table without any entries.
    pub fn empty() -> Constants {
        Constants { namespaces: BTreeMap::new() }
    }

    pub fn insert<N, M>(&mut self, namespace: N, name: M, value: Value)
        where N: Into<String>, M: Into<String>
    {
        self.namespaces.entry(namespace.into()).or_insert_with(BTreeMap::new)
                       .insert(name.into(), value);
    }

    /// Registers a host class under its own namespace and name.
    pub fn insert_class(&mut self, namespace: &'static str, name: &'static str, func: CallFn) {
        self.insert(namespace, name, Value::Callable(Callable::class(namespace, name, func)));
    }

    /// Registers a host function under its own namespace and name.
    pub fn insert_function(&mut self, namespace: &'static str, name: &'static str, func: CallFn) {
        self.insert(namespace, name, Value::Callable(Callable::function(namespace, name, func)));
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<&Value> {
        self.namespaces.get(namespace).and_then(|names| names.get(name))
    }

    /// Looks up a name, falling back to a placeholder class.
    pub fn resolve(&self, namespace: &str, name: &str) -> Value {
        match self.get(namespace, name) {
            Some(value) => value.clone(),
            None => {
                log::debug!("unresolved global {}.{}, using a placeholder", namespace, name);
                Value::Class(PyClass::new(namespace, name))
            }
        }
    }

    /// Adds all entries of `other`, replacing entries with the same
    /// namespace and name.
    pub fn overlay(&mut self, other: Constants) {
        for (namespace, names) in other.namespaces {
            self.namespaces.entry(namespace).or_insert_with(BTreeMap::new).extend(names);
        }
    }
}

impl Default for Constants {
    fn default() -> Constants {
        let mut constants = Constants::empty();
        for &module in BUILTIN_MODULES.iter() {
            constants.insert(module, "object", Value::Class(PyClass::new("builtins", "object")));
            constants.insert(module, "set",
                             Value::Callable(Callable::class(module, "set", make_set)));
            constants.insert(module, "frozenset",
                             Value::Callable(Callable::class(module, "frozenset", make_frozenset)));
            constants.insert(module, "bytes",
                             Value::Callable(Callable::class(module, "bytes", make_bytes)));
            constants.insert(module, "bytearray",
                             Value::Callable(Callable::class(module, "bytearray", make_bytearray)));
        }
        for &module in COPYREG_MODULES.iter() {
            constants.insert(module, "_reconstructor",
                             Value::Callable(Callable::function(module, "_reconstructor",
                                                                reconstructor)));
        }
        constants.insert_function("_codecs", "encode", codecs_encode);
        constants
    }
}

fn invalid<T>(what: String) -> Result<T> {
    Err(Error::Eval(ErrorCode::InvalidArguments(what), None))
}

fn no_kwargs(func: &str, kwargs: &BTreeMap<String, Value>) -> Result<()> {
    match kwargs.keys().next() {
        Some(key) => invalid(format!("{}() got an unexpected keyword argument {:?}", func, key)),
        None => Ok(()),
    }
}

fn set_items(func: &str, mut args: Vec<Value>) -> Result<BTreeSet<HashableValue>> {
    let items = match args.len() {
        0 => return Ok(BTreeSet::new()),
        1 => match args.remove(0) {
            Value::List(v) | Value::Tuple(v) => v,
            Value::Set(s) | Value::FrozenSet(s) => return Ok(s),
            other => return invalid(format!("{}() argument is not iterable: {}", func, other)),
        },
        n => return invalid(format!("{}() takes at most 1 argument ({} given)", func, n)),
    };
    items.into_iter().map(|item| {
        item.into_hashable().map_err(|_| Error::Eval(ErrorCode::ValueNotHashable, None))
    }).collect()
}

fn make_set(args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Value> {
    no_kwargs("set", &kwargs)?;
    set_items("set", args).map(Value::Set)
}

fn make_frozenset(args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Value> {
    no_kwargs("frozenset", &kwargs)?;
    set_items("frozenset", args).map(Value::FrozenSet)
}

/// Encodes text as Latin-1, one byte per code point.
fn latin1_bytes(s: &str) -> Result<Vec<u8>> {
    s.chars().map(|c| {
        if (c as u32) < 256 {
            Ok(c as u32 as u8)
        } else {
            invalid(format!("character {:?} cannot be encoded as latin-1", c))
        }
    }).collect()
}

fn encode_text(s: &str, encoding: &str) -> Result<(Vec<u8>, Encoding)> {
    match &*encoding.to_ascii_lowercase() {
        "utf-8" | "utf8" => Ok((s.as_bytes().to_vec(), Encoding::Ascii8Bit)),
        _ => match Encoding::from_name(encoding) {
            Some(enc) => Ok((latin1_bytes(s)?, enc)),
            None => invalid(format!("unknown encoding {:?}", encoding)),
        },
    }
}

/// Converts the arguments of `bytes()` and `bytearray()`: nothing, a bytes
/// object, a sequence of ints below 256, or text and an encoding name.
fn byte_args(func: &str, args: Vec<Value>) -> Result<(Vec<u8>, Encoding)> {
    let mut args = args.into_iter();
    match (args.next(), args.next(), args.next()) {
        (None, _, _) => Ok((vec![], Encoding::default())),
        (Some(Value::Bytes(b)), None, _) => Ok((b, Encoding::default())),
        (Some(Value::ByteArray(b)), None, _) => Ok((b.into_bytes(), Encoding::default())),
        (Some(Value::List(items)), None, _) | (Some(Value::Tuple(items)), None, _) => {
            let bytes = items.into_iter().map(|item| match item {
                Value::I64(i) if 0 <= i && i < 256 => Ok(i as u8),
                other => invalid(format!("{}() item out of range: {}", func, other)),
            }).collect::<Result<Vec<_>>>()?;
            Ok((bytes, Encoding::default()))
        }
        (Some(Value::String(s)), Some(Value::String(enc)), None) => encode_text(&s, &enc),
        (Some(Value::Bytes(b)), Some(Value::String(enc)), None) =>
            Ok((b, Encoding::from_name(&enc).unwrap_or_default())),
        (Some(first), _, _) => invalid(format!("{}() cannot convert {}", func, first)),
    }
}

fn make_bytes(args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Value> {
    no_kwargs("bytes", &kwargs)?;
    byte_args("bytes", args).map(|(bytes, _)| Value::Bytes(bytes))
}

fn make_bytearray(args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Value> {
    no_kwargs("bytearray", &kwargs)?;
    let (bytes, encoding) = byte_args("bytearray", args)?;
    Ok(Value::ByteArray(ByteArray::with_encoding(bytes, encoding)))
}

/// `copy_reg._reconstructor(cls, base, state)`: calls `cls` with the
/// state as its arguments.
fn reconstructor(args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Value> {
    no_kwargs("_reconstructor", &kwargs)?;
    let mut args = args.into_iter();
    match (args.next(), args.next(), args.next(), args.next()) {
        (Some(cls), Some(_base), Some(state), None) => {
            let init = match state {
                Value::None => vec![],
                Value::Tuple(v) | Value::List(v) => v,
                other => vec![other],
            };
            call(&cls, init, BTreeMap::new())
        }
        _ => invalid("_reconstructor() takes exactly 3 arguments".into()),
    }
}

/// `_codecs.encode(text, encoding)`.
fn codecs_encode(args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Value> {
    no_kwargs("encode", &kwargs)?;
    let mut args = args.into_iter();
    match (args.next(), args.next(), args.next()) {
        (Some(Value::String(s)), None, None) => Ok(Value::Bytes(s.into_bytes())),
        (Some(Value::String(s)), Some(Value::String(enc)), None) =>
            encode_text(&s, &enc).map(|(bytes, _)| Value::Bytes(bytes)),
        _ => invalid("encode() takes a string and an encoding name".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_default(ns: &str, name: &str, args: Vec<Value>) -> Result<Value> {
        call(&Constants::default().resolve(ns, name), args, BTreeMap::new())
    }

    #[test]
    fn placeholder_fallback() {
        let constants = Constants::default();
        assert_eq!(constants.resolve("foo", "Bar"), Value::Class(PyClass::new("foo", "Bar")));
        assert_eq!(constants.resolve("__builtin__", "object"),
                   Value::Class(PyClass::new("builtins", "object")));
        assert_eq!(constants.get("foo", "Bar"), None);
    }

    #[test]
    fn overlay_is_entry_wise() {
        let mut constants = Constants::default();
        let mut extra = Constants::empty();
        extra.insert("builtins", "object", Value::None);
        extra.insert("mymod", "X", Value::I64(1));
        constants.overlay(extra);
        assert_eq!(constants.get("builtins", "object"), Some(&Value::None));
        assert_eq!(constants.get("mymod", "X"), Some(&Value::I64(1)));
        assert!(constants.get("builtins", "set").is_some());
    }

    #[test]
    fn builtin_sets() {
        let set = call_default("builtins", "set",
                               vec![Value::List(vec![Value::I64(1), Value::I64(1)])]).unwrap();
        let mut expected = BTreeSet::new();
        expected.insert(HashableValue::I64(1));
        assert_eq!(set, Value::Set(expected.clone()));
        assert_eq!(call_default("__builtin__", "frozenset", vec![]).unwrap(),
                   Value::FrozenSet(BTreeSet::new()));
        match call_default("builtins", "set", vec![Value::List(vec![Value::List(vec![])])]) {
            Err(Error::Eval(ErrorCode::ValueNotHashable, None)) => { }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn builtin_bytes() {
        for &module in BUILTIN_MODULES.iter() {
            assert_eq!(call_default(module, "bytes", vec![]).unwrap(), Value::Bytes(vec![]));
        }
        assert_eq!(call_default("builtins", "bytes", vec![Value::Bytes(b"ab".to_vec())]).unwrap(),
                   Value::Bytes(b"ab".to_vec()));
        assert_eq!(call_default("builtins", "bytes",
                                vec![Value::List(vec![Value::I64(104), Value::I64(105)])])
                   .unwrap(), Value::Bytes(b"hi".to_vec()));
        assert_eq!(call_default("__builtin__", "bytes",
                                vec![Value::String("\u{e9}".into()),
                                     Value::String("latin-1".into())]).unwrap(),
                   Value::Bytes(vec![0xe9]));
        assert!(call_default("builtins", "bytes", vec![Value::List(vec![Value::I64(256)])])
                .is_err());
        assert!(call_default("builtins", "bytes", vec![Value::None]).is_err());
    }

    #[test]
    fn builtin_bytearray() {
        let ba = call_default("__builtin__", "bytearray",
                              vec![Value::String("a\u{e9}".into()),
                                   Value::String("latin-1".into())]).unwrap();
        assert_eq!(ba, Value::ByteArray(ByteArray::with_encoding(vec![b'a', 0xe9],
                                                                 Encoding::Iso8859_1)));
        let ba = call_default("builtins", "bytearray", vec![Value::Bytes(b"xy".to_vec())]).unwrap();
        assert_eq!(ba, Value::ByteArray(ByteArray::new(b"xy".to_vec())));
        assert_eq!(call_default("builtins", "bytearray", vec![]).unwrap(),
                   Value::ByteArray(ByteArray::default()));
        assert!(call_default("builtins", "bytearray", vec![Value::F64(1.0)]).is_err());
    }

    #[test]
    fn reconstructor_calls_class() {
        let obj = call_default("copy_reg", "_reconstructor",
                               vec![Value::Class(PyClass::new("m", "C")),
                                    Value::Class(PyClass::new("builtins", "object")),
                                    Value::None]).unwrap();
        match obj {
            Value::Object(obj) => {
                assert_eq!(obj.class(), &PyClass::new("m", "C"));
                assert!(obj.args().is_empty());
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(call_default("copyreg", "_reconstructor", vec![]).is_err());
    }

    #[test]
    fn codecs_encode_latin1() {
        assert_eq!(call_default("_codecs", "encode",
                                vec![Value::String("\u{ff}".into()),
                                     Value::String("latin1".into())]).unwrap(),
                   Value::Bytes(vec![0xff]));
        assert!(call_default("_codecs", "encode",
                             vec![Value::String("\u{100}".into()),
                                  Value::String("latin1".into())]).is_err());
    }
}
