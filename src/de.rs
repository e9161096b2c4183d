// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! # Pickle deserialization
//!
//! Note: Pickles are not a declarative format, but a program for a stack-based
//! VM.  Each value that is decoded is simply put on the stack, and some
//! operations pop items from the stack and construct new data with them.
//!
//! Decoding therefore happens in two steps: a `protocol::Decoder` turns the
//! bytes into `Instruction`s, and the `Deserializer` executes them.  Once
//! `STOP` is reached, the result is converted into a `value::Value`, which
//! can then be deserialized into other serde-supported data types.
//!
//! In turn, this means that using the generic `from_` functions with
//! `value::Value` as the output type will construct Values, and then let
//! serde de- and reconstruct them.  Don't do that, use the `value_from_`
//! functions instead.

use std::io;
use std::mem;
use std::vec;
use std::collections::{BTreeMap, BTreeSet};
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use iter_read::{IterRead, IterReadItem};
use serde::de;

use crate::codec::IntLiteral;
use crate::constants::Constants;
use crate::error::{Error, ErrorCode, Result};
use crate::instruction::Instruction;
use crate::object::{ByteArray, Callable, PyClass, PyObject};
use crate::protocol::Decoder;
use crate::value::{self, HashableValue, from_value};

/// Signature of a loader for persistent ids (`PERSID` and `BINPERSID`).
pub type PersistentLoadFn = fn(value::Value) -> Result<value::Value>;

/// Options for deserializing.
#[derive(Clone, Debug, Default)]
pub struct DeOptions {
    decode_strings: bool,
    protocol: Option<u8>,
    constants: Option<Constants>,
    extensions: BTreeMap<u32, value::Value>,
    buffers: Option<Vec<Vec<u8>>>,
    persistent_load: Option<PersistentLoadFn>,
    allow_trailing_bytes: bool,
}

impl DeOptions {
    /// Construct with default options:
    ///
    /// - don't decode strings saved as STRING opcodes (only protocols 0-2) as UTF-8
    /// - infer the protocol version from the stream
    /// - use the default constant table, an empty extension table, and no
    ///   out-of-band buffers
    /// - fail on trailing bytes after the pickle
    pub fn new() -> Self {
        Default::default()
    }

    /// Activate decoding strings saved as STRING.
    pub fn decode_strings(mut self) -> Self {
        self.decode_strings = true;
        self
    }

    /// Decode with the given protocol version instead of inferring it.
    pub fn protocol(mut self, version: u8) -> Self {
        self.protocol = Some(version);
        self
    }

    /// Entries to overlay onto the default constant table.
    pub fn constants(mut self, constants: Constants) -> Self {
        self.constants = Some(constants);
        self
    }

    /// The extension table consulted by `EXT1`, `EXT2` and `EXT4`.
    pub fn extensions(mut self, extensions: BTreeMap<u32, value::Value>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Out-of-band buffers, consumed in order by `NEXT_BUFFER`.
    pub fn buffers(mut self, buffers: Vec<Vec<u8>>) -> Self {
        self.buffers = Some(buffers);
        self
    }

    /// Loader for persistent ids.
    pub fn persistent_load(mut self, load: PersistentLoadFn) -> Self {
        self.persistent_load = Some(load);
        self
    }

    /// Allow (ignore) bytes after the STOP opcode.
    pub fn allow_trailing_bytes(mut self) -> Self {
        self.allow_trailing_bytes = true;
        self
    }

    fn decoder<R: io::Read>(&self, rdr: R) -> Result<Decoder<R>> {
        match self.protocol {
            Some(version) => Decoder::new(rdr, version),
            None => Decoder::infer(rdr),
        }
    }
}

/// Containers nested deeper than this are rejected, both in the unpickled
/// value and in values handed in by the host.
pub const MAX_DEPTH: usize = 256;

/// Every unpickled value may hold this many nodes, plus `NODE_FACTOR` for
/// each value the pickle created.  Shared references are expanded into
/// copies, so a few memo entries referring to each other could otherwise
/// describe an exponentially large value.
pub const MIN_NODES: usize = 1 << 20;
pub const NODE_FACTOR: usize = 16;

/// Values as they live on the stack while the pickle is executed.
///
/// Every container is moved into a slot of the deserializer as soon as it
/// is created, and referred to by `MemoRef`, so that mutations are visible
/// through every reference (memo entries and `DUP` copies share the slot).
/// Containers therefore only ever own references, which keeps dropping
/// and cloning them shallow however deep the pickle nests.  Dicts and sets
/// are kept as plain sequences until the final conversion, since their
/// items may still be references at this point.
#[derive(Clone, Debug)]
enum Value {
    MemoRef(usize),
    None,
    Bool(bool),
    I64(i64),
    Int(BigInt),
    F64(f64),
    Bytes(Vec<u8>),
    ByteArray(ByteArray),
    String(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    FrozenSet(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Class(PyClass),
    Callable(Callable),
    Object(Box<Object>),
}

#[derive(Clone, Debug)]
struct Object {
    class: PyClass,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
    attrs: Vec<(Value, Value)>,
    state: Option<Value>,
}

impl Value {
    fn kind(&self) -> &'static str {
        match *self {
            Value::MemoRef(_)   => "memo reference",
            Value::None         => "None",
            Value::Bool(_)      => "bool",
            Value::I64(_)       |
            Value::Int(_)       => "int",
            Value::F64(_)       => "float",
            Value::Bytes(_)     => "bytes",
            Value::ByteArray(_) => "bytearray",
            Value::String(_)    => "str",
            Value::List(_)      => "list",
            Value::Tuple(_)     => "tuple",
            Value::Set(_)       => "set",
            Value::FrozenSet(_) => "frozenset",
            Value::Dict(_)      => "dict",
            Value::Class(_)     => "class",
            Value::Callable(_)  => "callable",
            Value::Object(_)    => "object",
        }
    }
}

fn int_value(i: BigInt) -> Value {
    match i.to_i64() {
        Some(i) => Value::I64(i),
        None => Value::Int(i),
    }
}

fn hashable(value: value::Value) -> Result<HashableValue> {
    value.into_hashable().map_err(|_| Error::Eval(ErrorCode::ValueNotHashable, None))
}

/// Converts stack values into `value::Value`s, following memo references.
struct Resolver<'a> {
    slots: &'a [Value],
    active: BTreeSet<usize>,
    depth: usize,
    budget: usize,
    limit: usize,
}

impl<'a> Resolver<'a> {
    fn new(slots: &'a [Value], limit: usize) -> Resolver<'a> {
        Resolver { slots, active: BTreeSet::new(), depth: 0, budget: limit, limit }
    }

    fn resolve(&mut self, value: &Value) -> Result<value::Value> {
        if self.budget == 0 {
            return Err(Error::Eval(ErrorCode::TooManyValues(self.limit), None));
        }
        self.budget -= 1;
        Ok(match *value {
            Value::MemoRef(slot) => {
                if self.depth == MAX_DEPTH {
                    return Err(Error::Eval(ErrorCode::NestingTooDeep(MAX_DEPTH), None));
                }
                if !self.active.insert(slot) {
                    return Err(Error::Eval(ErrorCode::Recursive, None));
                }
                let slots = self.slots;
                self.depth += 1;
                let result = self.resolve(&slots[slot]);
                self.depth -= 1;
                self.active.remove(&slot);
                return result;
            }
            Value::None             => value::Value::None,
            Value::Bool(b)          => value::Value::Bool(b),
            Value::I64(i)           => value::Value::I64(i),
            Value::Int(ref i)       => value::Value::Int(i.clone()),
            Value::F64(f)           => value::Value::F64(f),
            Value::Bytes(ref b)     => value::Value::Bytes(b.clone()),
            Value::ByteArray(ref b) => value::Value::ByteArray(b.clone()),
            Value::String(ref s)    => value::Value::String(s.clone()),
            Value::List(ref v)      => value::Value::List(self.resolve_all(v)?),
            Value::Tuple(ref v)     => value::Value::Tuple(self.resolve_all(v)?),
            Value::Set(ref v)       => value::Value::Set(self.resolve_set(v)?),
            Value::FrozenSet(ref v) => value::Value::FrozenSet(self.resolve_set(v)?),
            Value::Dict(ref pairs)  => value::Value::Dict(self.resolve_pairs(pairs)?),
            Value::Class(ref c)     => value::Value::Class(c.clone()),
            Value::Callable(c)      => value::Value::Callable(c),
            Value::Object(ref obj)  => {
                let mut kwargs = BTreeMap::new();
                for &(ref key, ref value) in &obj.kwargs {
                    kwargs.insert(key.clone(), self.resolve(value)?);
                }
                let mut res = PyObject::new(obj.class.clone(), self.resolve_all(&obj.args)?,
                                            kwargs);
                res.attributes = self.resolve_pairs(&obj.attrs)?;
                if let Some(ref state) = obj.state {
                    res.set_state(self.resolve(state)?);
                }
                value::Value::Object(res)
            }
        })
    }

    fn resolve_all(&mut self, values: &[Value]) -> Result<Vec<value::Value>> {
        values.iter().map(|v| self.resolve(v)).collect()
    }

    fn resolve_set(&mut self, values: &[Value]) -> Result<BTreeSet<HashableValue>> {
        values.iter().map(|v| hashable(self.resolve(v)?)).collect()
    }

    fn resolve_pairs(&mut self, pairs: &[(Value, Value)])
                     -> Result<BTreeMap<HashableValue, value::Value>> {
        let mut map = BTreeMap::new();
        for &(ref key, ref value) in pairs {
            map.insert(hashable(self.resolve(key)?)?, self.resolve(value)?);
        }
        Ok(map)
    }
}

fn invalid_target(opcode: &'static str, target: &str, operand: &str) -> Error {
    Error::Eval(ErrorCode::InvalidTarget { opcode, target: target.into(),
                                           operand: operand.into() }, None)
}

/// Outcome of executing a single instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Status {
    /// More instructions are needed.
    Continue,
    /// `STOP` was executed; this is the unpickled value.
    Halt(value::Value),
}

/// Executes pickle instructions.
///
/// The deserializer owns the operand stack, the stack of stacks saved by
/// `MARK`, the memo, and the constant and extension tables of one unpickling
/// run.
pub struct Deserializer {
    stack: Vec<Value>,
    stacks: Vec<Vec<Value>>,
    memo: BTreeMap<u32, usize>,
    slots: Vec<Value>,
    // Upper bound on the number of distinct values created so far.
    created: usize,
    constants: Constants,
    extensions: BTreeMap<u32, value::Value>,
    buffers: Option<vec::IntoIter<Vec<u8>>>,
    persistent_load: Option<PersistentLoadFn>,
    decode_strings: bool,
}

impl Deserializer {
    pub fn new(options: DeOptions) -> Deserializer {
        let mut constants = Constants::default();
        if let Some(extra) = options.constants {
            constants.overlay(extra);
        }
        Deserializer {
            stack: Vec::with_capacity(128),
            stacks: Vec::with_capacity(16),
            memo: BTreeMap::new(),
            slots: Vec::new(),
            created: 0,
            constants,
            extensions: options.extensions,
            buffers: options.buffers.map(|b| b.into_iter()),
            persistent_load: options.persistent_load,
            decode_strings: options.decode_strings,
        }
    }

    /// Executes one instruction.  Errors name the instruction's opcode.
    pub fn execute(&mut self, instruction: Instruction) -> Result<Status> {
        log::trace!("{} (stack depth {}, mark depth {})",
                    instruction, self.stack.len(), self.stacks.len());
        let opcode = instruction.name();
        self.created += 1;
        self.step(instruction).map_err(|err| err.in_opcode(opcode))
    }

    fn step(&mut self, instruction: Instruction) -> Result<Status> {
        match instruction {
            // Specials
            Instruction::Stop => {
                let value = self.pop()?;
                return self.finish(value).map(Status::Halt);
            }
            Instruction::Proto(_) | Instruction::Frame(_) => { }
            Instruction::Mark => {
                let stack = mem::replace(&mut self.stack, Vec::with_capacity(128));
                self.stacks.push(stack);
            }
            Instruction::PopMark => { self.pop_mark()?; }
            Instruction::Pop => {
                if self.stack.is_empty() {
                    self.pop_mark()?;
                } else {
                    self.pop()?;
                }
            }
            Instruction::Dup => {
                let slot = self.share_top()?;
                self.stack.push(Value::MemoRef(slot));
            }

            // Memo
            Instruction::Get(id) | Instruction::LongBinGet(id) => self.memo_get(id)?,
            Instruction::BinGet(id) => self.memo_get(id as u32)?,
            Instruction::Put(id) | Instruction::LongBinPut(id) => self.memo_put(id)?,
            Instruction::BinPut(id) => self.memo_put(id as u32)?,
            Instruction::Memoize => {
                let id = self.memo.len() as u32;
                self.memo_put(id)?;
            }

            // Singletons
            Instruction::None => self.stack.push(Value::None),
            Instruction::NewTrue => self.stack.push(Value::Bool(true)),
            Instruction::NewFalse => self.stack.push(Value::Bool(false)),

            // Numbers
            Instruction::Int(IntLiteral::Bool(b)) => self.stack.push(Value::Bool(b)),
            Instruction::Int(IntLiteral::Int(i)) |
            Instruction::Long(i) |
            Instruction::Long1 { value: i, .. } |
            Instruction::Long4 { value: i, .. } => self.stack.push(int_value(i)),
            Instruction::BinInt(i) => self.stack.push(Value::I64(i as i64)),
            Instruction::BinInt1(i) => self.stack.push(Value::I64(i as i64)),
            Instruction::BinInt2(i) => self.stack.push(Value::I64(i as i64)),
            Instruction::Float(f) | Instruction::BinFloat(f) => self.stack.push(Value::F64(f)),

            // Strings
            Instruction::String(s) |
            Instruction::BinString { value: s, .. } |
            Instruction::ShortBinString { value: s, .. } => {
                let string = self.decode_string(s)?;
                self.stack.push(string);
            }
            Instruction::Unicode(s) |
            Instruction::BinUnicode { value: s, .. } |
            Instruction::ShortBinUnicode { value: s, .. } |
            Instruction::BinUnicode8 { value: s, .. } => self.stack.push(Value::String(s)),
            Instruction::BinBytes { value, .. } |
            Instruction::ShortBinBytes { value, .. } |
            Instruction::BinBytes8 { value, .. } => self.stack.push(Value::Bytes(value)),
            Instruction::ByteArray8 { value, .. } =>
                self.stack.push(Value::ByteArray(ByteArray::new(value))),

            // Containers
            Instruction::EmptyTuple => self.push_new(Value::Tuple(vec![])),
            Instruction::Tuple1 => {
                let item = self.pop()?;
                self.push_new(Value::Tuple(vec![item]));
            }
            Instruction::Tuple2 => {
                let item2 = self.pop()?;
                let item1 = self.pop()?;
                self.push_new(Value::Tuple(vec![item1, item2]));
            }
            Instruction::Tuple3 => {
                let item3 = self.pop()?;
                let item2 = self.pop()?;
                let item1 = self.pop()?;
                self.push_new(Value::Tuple(vec![item1, item2, item3]));
            }
            Instruction::Tuple => {
                let items = self.pop_mark()?;
                self.push_new(Value::Tuple(items));
            }
            Instruction::EmptyList => self.push_new(Value::List(vec![])),
            Instruction::List => {
                let items = self.pop_mark()?;
                self.push_new(Value::List(items));
            }
            Instruction::Append => {
                let value = self.pop()?;
                let operand = self.kind_of(&value);
                match self.top_mut()? {
                    Value::List(list) => list.push(value),
                    other => return Err(invalid_target("APPEND", other.kind(), operand)),
                }
            }
            Instruction::Appends => {
                let items = self.pop_mark()?;
                match self.top_mut()? {
                    Value::List(list) => list.extend(items),
                    other => return Err(invalid_target("APPENDS", other.kind(), "items")),
                }
            }
            Instruction::EmptyDict => self.push_new(Value::Dict(vec![])),
            Instruction::Dict => {
                let items = self.pop_mark()?;
                let pairs = pairs(items)?;
                self.push_new(Value::Dict(pairs));
            }
            Instruction::SetItem => {
                let value = self.pop()?;
                let key = self.pop()?;
                let operand = self.kind_of(&key);
                match self.top_mut()? {
                    Value::Dict(dict) => dict.push((key, value)),
                    Value::Object(obj) => obj.attrs.push((key, value)),
                    other => return Err(invalid_target("SETITEM", other.kind(), operand)),
                }
            }
            Instruction::SetItems => {
                let items = self.pop_mark()?;
                let items = pairs(items)?;
                match self.top_mut()? {
                    Value::Dict(dict) => dict.extend(items),
                    Value::Object(obj) => obj.attrs.extend(items),
                    other => return Err(invalid_target("SETITEMS", other.kind(), "items")),
                }
            }
            Instruction::EmptySet => self.push_new(Value::Set(vec![])),
            Instruction::AddItems => {
                let items = self.pop_mark()?;
                match self.top_mut()? {
                    Value::Set(set) => set.extend(items),
                    other => return Err(invalid_target("ADDITEMS", other.kind(), "items")),
                }
            }
            Instruction::FrozenSet => {
                let items = self.pop_mark()?;
                self.push_new(Value::FrozenSet(items));
            }

            // Globals and object construction
            Instruction::Global { namespace, name } => {
                let global = self.global(&namespace, &name)?;
                self.stack.push(global);
            }
            Instruction::StackGlobal => {
                let name = self.pop_string()?;
                let namespace = self.pop_string()?;
                let global = self.global(&namespace, &name)?;
                self.stack.push(global);
            }
            Instruction::Reduce => {
                let args = self.pop_args()?;
                let callable = self.pop()?;
                let result = self.call("REDUCE", callable, args, vec![])?;
                self.stack.push(result);
            }
            Instruction::NewObj => {
                let args = self.pop_args()?;
                let class = self.pop()?;
                let result = self.call("NEWOBJ", class, args, vec![])?;
                self.stack.push(result);
            }
            Instruction::NewObjEx => {
                let kwargs = self.pop_kwargs()?;
                let args = self.pop_args()?;
                let class = self.pop()?;
                let result = self.call("NEWOBJ_EX", class, args, kwargs)?;
                self.stack.push(result);
            }
            Instruction::Inst { namespace, name } => {
                let args = self.pop_mark()?;
                let class = self.global(&namespace, &name)?;
                let result = self.call("INST", class, args, vec![])?;
                self.stack.push(result);
            }
            Instruction::Obj => {
                let mut items = self.pop_mark()?.into_iter();
                let class = match items.next() {
                    Some(class) => class,
                    None => return Err(Error::Eval(ErrorCode::StackUnderflow, None)),
                };
                let result = self.call("OBJ", class, items.collect(), vec![])?;
                self.stack.push(result);
            }
            Instruction::Build => {
                let state = self.pop()?;
                let attrs = self.state_attributes(&state);
                let operand = self.kind_of(&state);
                match self.top_mut()? {
                    Value::Object(obj) => match attrs {
                        Some(attrs) => obj.attrs.extend(attrs),
                        None => obj.state = Some(state),
                    },
                    Value::Dict(dict) => match attrs {
                        Some(attrs) => dict.extend(attrs),
                        None => return Err(invalid_target("BUILD", "dict", operand)),
                    },
                    other => return Err(invalid_target("BUILD", other.kind(), operand)),
                }
            }
            Instruction::PersId(id) => {
                let value = self.persistent(value::Value::String(id))?;
                self.stack.push(value);
            }
            Instruction::BinPersId => {
                let id = self.pop()?;
                let id = self.to_public(&id)?;
                let value = self.persistent(id)?;
                self.stack.push(value);
            }
            Instruction::Ext1(code) => self.extension(code as u32)?,
            Instruction::Ext2(code) => self.extension(code as u32)?,
            Instruction::Ext4(code) => self.extension(code)?,

            // Out-of-band buffers
            Instruction::NextBuffer => {
                let buffer = match self.buffers {
                    None => return Err(Error::Eval(ErrorCode::MissingBuffers, None)),
                    Some(ref mut buffers) => match buffers.next() {
                        Some(buffer) => buffer,
                        None => return Err(Error::Eval(ErrorCode::BuffersExhausted, None)),
                    },
                };
                self.stack.push(Value::ByteArray(ByteArray::new(buffer)));
            }
            Instruction::ReadonlyBuffer => {
                match self.top_mut()? {
                    Value::ByteArray(array) => array.make_readonly(),
                    Value::Bytes(_) => { }
                    other => return Err(Error::Eval(ErrorCode::InvalidStackTop(
                        "buffer", other.kind().into()), None)),
                }
            }
        }
        Ok(Status::Continue)
    }

    fn finish(&mut self, value: Value) -> Result<value::Value> {
        if !self.stacks.is_empty() || !self.stack.is_empty() {
            log::debug!("STOP with {} value(s) and {} mark(s) left on the stack",
                        self.stack.len(), self.stacks.len());
        }
        self.to_public(&value)
    }

    fn to_public(&self, value: &Value) -> Result<value::Value> {
        let limit = self.created.saturating_mul(NODE_FACTOR).saturating_add(MIN_NODES);
        Resolver::new(&self.slots, limit).resolve(value)
    }

    /// Moves a value into a new slot and returns a reference to it.
    fn alloc(&mut self, value: Value) -> Value {
        let slot = self.slots.len();
        self.slots.push(value);
        Value::MemoRef(slot)
    }

    fn push_new(&mut self, container: Value) {
        let value = self.alloc(container);
        self.stack.push(value);
    }

    /// Moves a host value (from the constant or extension table, or returned
    /// by a host function) into the slots.
    fn import(&mut self, value: value::Value) -> Result<Value> {
        self.import_at(value, 0)
    }

    fn import_at(&mut self, value: value::Value, depth: usize) -> Result<Value> {
        if depth == MAX_DEPTH {
            return Err(Error::Eval(ErrorCode::NestingTooDeep(MAX_DEPTH), None));
        }
        self.created += 1;
        let depth = depth + 1;
        let container = match value {
            value::Value::None         => return Ok(Value::None),
            value::Value::Bool(b)      => return Ok(Value::Bool(b)),
            value::Value::I64(i)       => return Ok(Value::I64(i)),
            value::Value::Int(i)       => return Ok(Value::Int(i)),
            value::Value::F64(f)       => return Ok(Value::F64(f)),
            value::Value::Bytes(b)     => return Ok(Value::Bytes(b)),
            value::Value::ByteArray(b) => return Ok(Value::ByteArray(b)),
            value::Value::String(s)    => return Ok(Value::String(s)),
            value::Value::Class(c)     => return Ok(Value::Class(c)),
            value::Value::Callable(c)  => return Ok(Value::Callable(c)),
            value::Value::List(v)      => Value::List(self.import_all(v, depth)?),
            value::Value::Tuple(v)     => Value::Tuple(self.import_all(v, depth)?),
            value::Value::Set(v)       => Value::Set(self.import_all(
                v.into_iter().map(HashableValue::into_value), depth)?),
            value::Value::FrozenSet(v) => Value::FrozenSet(self.import_all(
                v.into_iter().map(HashableValue::into_value), depth)?),
            value::Value::Dict(v)      => Value::Dict(self.import_pairs(v, depth)?),
            value::Value::Object(obj)  => {
                let args = self.import_all(obj.args, depth)?;
                let mut kwargs = Vec::with_capacity(obj.kwargs.len());
                for (key, value) in obj.kwargs {
                    kwargs.push((key, self.import_at(value, depth)?));
                }
                let attrs = self.import_pairs(obj.attributes, depth)?;
                let state = match obj.state {
                    Some(state) => Some(self.import_at(*state, depth)?),
                    None => None,
                };
                Value::Object(Box::new(Object { class: obj.class, args, kwargs, attrs, state }))
            }
        };
        Ok(self.alloc(container))
    }

    fn import_all<I>(&mut self, values: I, depth: usize) -> Result<Vec<Value>>
        where I: IntoIterator<Item=value::Value>
    {
        values.into_iter().map(|v| self.import_at(v, depth)).collect()
    }

    fn import_pairs(&mut self, pairs: BTreeMap<HashableValue, value::Value>, depth: usize)
                    -> Result<Vec<(Value, Value)>> {
        let mut result = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            result.push((self.import_at(key.into_value(), depth)?,
                         self.import_at(value, depth)?));
        }
        Ok(result)
    }

    fn pop(&mut self) -> Result<Value> {
        match self.stack.pop() {
            Some(v) => Ok(v),
            None    => Err(Error::Eval(ErrorCode::StackUnderflow, None)),
        }
    }

    /// The top of the stack, as a mutable value: memo references are
    /// followed to the referenced slot.
    fn top_mut(&mut self) -> Result<&mut Value> {
        let slot = match self.stack.last() {
            None => return Err(Error::Eval(ErrorCode::StackUnderflow, None)),
            Some(&Value::MemoRef(slot)) => Some(slot),
            Some(_) => None,
        };
        match slot {
            Some(slot) => Ok(&mut self.slots[slot]),
            None => self.stack.last_mut().ok_or(Error::Eval(ErrorCode::StackUnderflow, None)),
        }
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        match self.stacks.pop() {
            Some(new) => Ok(mem::replace(&mut self.stack, new)),
            None      => Err(Error::Eval(ErrorCode::StackUnderflow, None)),
        }
    }

    /// Moves the top of the stack into a slot (unless it already is a
    /// reference) and returns the slot.
    fn share_top(&mut self) -> Result<usize> {
        match self.stack.last_mut() {
            None => Err(Error::Eval(ErrorCode::StackUnderflow, None)),
            Some(&mut Value::MemoRef(slot)) => Ok(slot),
            Some(top) => {
                let slot = self.slots.len();
                let value = mem::replace(top, Value::MemoRef(slot));
                self.slots.push(value);
                Ok(slot)
            }
        }
    }

    fn memo_get(&mut self, id: u32) -> Result<()> {
        match self.memo.get(&id) {
            Some(&slot) => {
                self.stack.push(Value::MemoRef(slot));
                Ok(())
            }
            None => Err(Error::Eval(ErrorCode::MissingMemo(id), None)),
        }
    }

    fn memo_put(&mut self, id: u32) -> Result<()> {
        let slot = self.share_top()?;
        self.memo.insert(id, slot);
        Ok(())
    }

    fn deref(&self, value: Value) -> Value {
        match value {
            Value::MemoRef(slot) => self.slots[slot].clone(),
            value => value,
        }
    }

    fn deref_ref<'a>(&'a self, value: &'a Value) -> &'a Value {
        match *value {
            Value::MemoRef(slot) => &self.slots[slot],
            ref value => value,
        }
    }

    fn kind_of(&self, value: &Value) -> &'static str {
        self.deref_ref(value).kind()
    }

    fn pop_string(&mut self) -> Result<String> {
        let value = self.pop()?;
        match self.deref(value) {
            Value::String(s) => Ok(s),
            other => Err(Error::Eval(ErrorCode::InvalidStackTop("string", other.kind().into()),
                                     None)),
        }
    }

    fn pop_args(&mut self) -> Result<Vec<Value>> {
        let value = self.pop()?;
        match self.deref(value) {
            Value::Tuple(items) => Ok(items),
            other => Err(Error::Eval(ErrorCode::InvalidStackTop("tuple", other.kind().into()),
                                     None)),
        }
    }

    fn pop_kwargs(&mut self) -> Result<Vec<(String, Value)>> {
        let value = self.pop()?;
        let pairs = match self.deref(value) {
            Value::Dict(pairs) => pairs,
            Value::None => return Ok(vec![]),
            other => return Err(Error::Eval(ErrorCode::InvalidStackTop("dict",
                                                                       other.kind().into()),
                                            None)),
        };
        pairs.into_iter().map(|(key, value)| match self.deref(key) {
            Value::String(key) => Ok((key, value)),
            other => Err(Error::Eval(ErrorCode::InvalidStackTop("keyword string",
                                                                other.kind().into()), None)),
        }).collect()
    }

    /// Extracts the attributes set by a `BUILD` state: either a dict, or a
    /// pair of a dict (or None) and a dict of slot values (or None).
    fn state_attributes(&self, state: &Value) -> Option<Vec<(Value, Value)>> {
        match *self.deref_ref(state) {
            Value::Dict(ref pairs) => Some(pairs.clone()),
            Value::Tuple(ref items) if items.len() == 2 => {
                let mut attrs = Vec::new();
                for item in items {
                    match *self.deref_ref(item) {
                        Value::Dict(ref pairs) => attrs.extend(pairs.iter().cloned()),
                        Value::None => { }
                        _ => return None,
                    }
                }
                Some(attrs)
            }
            _ => None,
        }
    }

    fn global(&mut self, namespace: &str, name: &str) -> Result<Value> {
        let value = self.constants.resolve(namespace, name);
        self.import(value)
    }

    fn call(&mut self, opcode: &'static str, callee: Value, args: Vec<Value>,
            kwargs: Vec<(String, Value)>) -> Result<Value> {
        match self.deref(callee) {
            Value::Class(class) => Ok(self.alloc(Value::Object(Box::new(Object {
                class,
                args,
                kwargs,
                attrs: vec![],
                state: None,
            })))),
            Value::Callable(func) => {
                let args = args.iter().map(|arg| self.to_public(arg))
                                      .collect::<Result<Vec<_>>>()?;
                let mut kw = BTreeMap::new();
                for (key, value) in kwargs {
                    kw.insert(key, self.to_public(&value)?);
                }
                log::debug!("calling {} for {}", func, opcode);
                let result = func.call(args, kw)?;
                self.import(result)
            }
            other => Err(Error::Eval(ErrorCode::NotCallable { opcode,
                                                              value: other.kind().into() },
                                     None)),
        }
    }

    fn persistent(&mut self, id: value::Value) -> Result<Value> {
        match self.persistent_load {
            Some(load) => {
                let value = load(id)?;
                self.import(value)
            }
            None => Err(Error::Eval(ErrorCode::PersistentLoad(id.to_string()), None)),
        }
    }

    fn extension(&mut self, code: u32) -> Result<()> {
        let value = match self.extensions.get(&code) {
            Some(value) => value.clone(),
            None => return Err(Error::Eval(ErrorCode::UnknownExtension(code), None)),
        };
        let value = self.import(value)?;
        self.stack.push(value);
        Ok(())
    }

    fn decode_string(&self, string: Vec<u8>) -> Result<Value> {
        if self.decode_strings {
            match String::from_utf8(string) {
                Ok(v)  => Ok(Value::String(v)),
                Err(_) => Err(Error::Eval(ErrorCode::StringNotUTF8, None)),
            }
        } else {
            Ok(Value::Bytes(string))
        }
    }
}

impl Default for Deserializer {
    fn default() -> Self {
        Deserializer::new(DeOptions::default())
    }
}

/// Groups the items of a `DICT` or `SETITEMS` into key/value pairs.
fn pairs(items: Vec<Value>) -> Result<Vec<(Value, Value)>> {
    if items.len() % 2 != 0 {
        return Err(Error::Eval(ErrorCode::StackUnderflow, None));
    }
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        pairs.push((key, value));
    }
    Ok(pairs)
}

/// Executes instructions until `STOP`, and returns the unpickled value.
pub fn run<I>(instructions: I, options: DeOptions) -> Result<value::Value>
    where I: IntoIterator<Item=Result<Instruction>>
{
    let mut machine = Deserializer::new(options);
    for instruction in instructions {
        if let Status::Halt(value) = machine.execute(instruction?)? {
            return Ok(value);
        }
    }
    Err(Error::Eval(ErrorCode::MissingStop, None))
}

fn decode<R: io::Read>(rdr: R, options: DeOptions) -> Result<value::Value> {
    let allow_trailing_bytes = options.allow_trailing_bytes;
    let mut decoder = options.decoder(rdr)?;
    let value = run(&mut decoder, options)?;
    // Make sure the whole stream has been consumed.
    if !allow_trailing_bytes {
        decoder.end()?;
    }
    Ok(value)
}

/// Decodes a value directly from an iterator.
pub fn value_from_iter<E, I>(iter: I, options: DeOptions) -> Result<value::Value>
    where E: IterReadItem, I: Iterator<Item=E>
{
    decode(IterRead::new(iter.fuse()), options)
}

/// Decodes a value from a `std::io::Read`.
pub fn value_from_reader<R: io::Read>(rdr: R, options: DeOptions) -> Result<value::Value> {
    decode(io::BufReader::new(rdr), options)
}

/// Decodes a value from a byte slice `&[u8]`.
pub fn value_from_slice(v: &[u8], options: DeOptions) -> Result<value::Value> {
    decode(v, options)
}

/// Decodes a value directly from an iterator.
pub fn from_iter<E, I, T>(iter: I, options: DeOptions) -> Result<T>
    where E: IterReadItem, I: Iterator<Item=E>, T: de::DeserializeOwned
{
    from_value(value_from_iter(iter, options)?)
}

/// Decodes a value from a `std::io::Read`.
pub fn from_reader<R: io::Read, T: de::DeserializeOwned>(rdr: R, options: DeOptions) -> Result<T> {
    from_value(value_from_reader(rdr, options)?)
}

/// Decodes a value from a byte slice `&[u8]`.
pub fn from_slice<T: de::DeserializeOwned>(v: &[u8], options: DeOptions) -> Result<T> {
    from_value(value_from_slice(v, options)?)
}

/// Decodes the instructions of a pickle without executing them.  The
/// protocol version is inferred if not given.
pub fn parse_reader<R: io::Read>(rdr: R, protocol: Option<u8>) -> Result<Vec<Instruction>> {
    let decoder = match protocol {
        Some(version) => Decoder::new(io::BufReader::new(rdr), version)?,
        None => Decoder::infer(io::BufReader::new(rdr))?,
    };
    decoder.collect()
}

/// Decodes the instructions of a pickle in a byte slice without executing
/// them.
pub fn parse_slice(v: &[u8], protocol: Option<u8>) -> Result<Vec<Instruction>> {
    let decoder = match protocol {
        Some(version) => Decoder::new(v, version)?,
        None => Decoder::infer(v)?,
    };
    decoder.collect()
}
