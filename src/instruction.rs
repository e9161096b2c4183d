// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Decoded pickle instructions.
//!
//! An `Instruction` is one opcode together with its decoded argument.  It
//! carries no behavior; the stack machine in `de` gives it meaning.
//! Arguments that are length-prefixed on the wire keep the declared length.

use std::fmt;
use num_bigint::BigInt;

use crate::codec::IntLiteral;
use crate::consts::*;

#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    // Stack and memo manipulation
    Mark,
    Stop,
    Pop,
    PopMark,
    Dup,
    Get(u32),
    BinGet(u8),
    LongBinGet(u32),
    Put(u32),
    BinPut(u8),
    LongBinPut(u32),
    Memoize,
    Proto(u8),
    Frame(u64),

    // Singletons
    None,
    NewTrue,
    NewFalse,

    // Numbers
    Int(IntLiteral),
    BinInt(i32),
    BinInt1(u8),
    BinInt2(u16),
    Long(BigInt),
    Long1 { len: u8, value: BigInt },
    Long4 { len: u32, value: BigInt },
    Float(f64),
    BinFloat(f64),

    // Byte and text strings
    String(Vec<u8>),
    BinString { len: u32, value: Vec<u8> },
    ShortBinString { len: u8, value: Vec<u8> },
    Unicode(String),
    BinUnicode { len: u32, value: String },
    ShortBinUnicode { len: u8, value: String },
    BinUnicode8 { len: u64, value: String },
    BinBytes { len: u32, value: Vec<u8> },
    ShortBinBytes { len: u8, value: Vec<u8> },
    BinBytes8 { len: u64, value: Vec<u8> },
    ByteArray8 { len: u64, value: Vec<u8> },

    // Containers
    EmptyTuple,
    Tuple,
    Tuple1,
    Tuple2,
    Tuple3,
    EmptyList,
    List,
    Append,
    Appends,
    EmptyDict,
    Dict,
    SetItem,
    SetItems,
    EmptySet,
    AddItems,
    FrozenSet,

    // Objects
    Global { namespace: String, name: String },
    StackGlobal,
    Reduce,
    Build,
    Inst { namespace: String, name: String },
    Obj,
    NewObj,
    NewObjEx,
    PersId(String),
    BinPersId,
    Ext1(u8),
    Ext2(u16),
    Ext4(u32),

    // Out-of-band buffers
    NextBuffer,
    ReadonlyBuffer,
}

impl Instruction {
    /// The opcode byte this instruction is encoded with.
    pub fn opcode(&self) -> u8 {
        use self::Instruction::*;
        match *self {
            Mark => MARK,
            Stop => STOP,
            Pop => POP,
            PopMark => POP_MARK,
            Dup => DUP,
            Get(_) => GET,
            BinGet(_) => BINGET,
            LongBinGet(_) => LONG_BINGET,
            Put(_) => PUT,
            BinPut(_) => BINPUT,
            LongBinPut(_) => LONG_BINPUT,
            Memoize => MEMOIZE,
            Proto(_) => PROTO,
            Frame(_) => FRAME,
            None => NONE,
            NewTrue => NEWTRUE,
            NewFalse => NEWFALSE,
            Int(_) => INT,
            BinInt(_) => BININT,
            BinInt1(_) => BININT1,
            BinInt2(_) => BININT2,
            Long(_) => LONG,
            Long1 { .. } => LONG1,
            Long4 { .. } => LONG4,
            Float(_) => FLOAT,
            BinFloat(_) => BINFLOAT,
            String(_) => STRING,
            BinString { .. } => BINSTRING,
            ShortBinString { .. } => SHORT_BINSTRING,
            Unicode(_) => UNICODE,
            BinUnicode { .. } => BINUNICODE,
            ShortBinUnicode { .. } => SHORT_BINUNICODE,
            BinUnicode8 { .. } => BINUNICODE8,
            BinBytes { .. } => BINBYTES,
            ShortBinBytes { .. } => SHORT_BINBYTES,
            BinBytes8 { .. } => BINBYTES8,
            ByteArray8 { .. } => BYTEARRAY8,
            EmptyTuple => EMPTY_TUPLE,
            Tuple => TUPLE,
            Tuple1 => TUPLE1,
            Tuple2 => TUPLE2,
            Tuple3 => TUPLE3,
            EmptyList => EMPTY_LIST,
            List => LIST,
            Append => APPEND,
            Appends => APPENDS,
            EmptyDict => EMPTY_DICT,
            Dict => DICT,
            SetItem => SETITEM,
            SetItems => SETITEMS,
            EmptySet => EMPTY_SET,
            AddItems => ADDITEMS,
            FrozenSet => FROZENSET,
            Global { .. } => GLOBAL,
            StackGlobal => STACK_GLOBAL,
            Reduce => REDUCE,
            Build => BUILD,
            Inst { .. } => INST,
            Obj => OBJ,
            NewObj => NEWOBJ,
            NewObjEx => NEWOBJ_EX,
            PersId(_) => PERSID,
            BinPersId => BINPERSID,
            Ext1(_) => EXT1,
            Ext2(_) => EXT2,
            Ext4(_) => EXT4,
            NextBuffer => NEXT_BUFFER,
            ReadonlyBuffer => READONLY_BUFFER,
        }
    }

    /// The opcode name, as spelled by Python's pickletools.
    pub fn name(&self) -> &'static str {
        opcode_name(self.opcode())
    }
}

/// Returns the pickletools name of an opcode byte.
pub fn opcode_name(opcode: u8) -> &'static str {
    match opcode {
        MARK => "MARK",
        STOP => "STOP",
        POP => "POP",
        POP_MARK => "POP_MARK",
        DUP => "DUP",
        FLOAT => "FLOAT",
        INT => "INT",
        BININT => "BININT",
        BININT1 => "BININT1",
        LONG => "LONG",
        BININT2 => "BININT2",
        NONE => "NONE",
        PERSID => "PERSID",
        BINPERSID => "BINPERSID",
        REDUCE => "REDUCE",
        STRING => "STRING",
        BINSTRING => "BINSTRING",
        SHORT_BINSTRING => "SHORT_BINSTRING",
        UNICODE => "UNICODE",
        BINUNICODE => "BINUNICODE",
        APPEND => "APPEND",
        BUILD => "BUILD",
        GLOBAL => "GLOBAL",
        DICT => "DICT",
        EMPTY_DICT => "EMPTY_DICT",
        APPENDS => "APPENDS",
        GET => "GET",
        BINGET => "BINGET",
        INST => "INST",
        LONG_BINGET => "LONG_BINGET",
        LIST => "LIST",
        EMPTY_LIST => "EMPTY_LIST",
        OBJ => "OBJ",
        PUT => "PUT",
        BINPUT => "BINPUT",
        LONG_BINPUT => "LONG_BINPUT",
        SETITEM => "SETITEM",
        TUPLE => "TUPLE",
        EMPTY_TUPLE => "EMPTY_TUPLE",
        SETITEMS => "SETITEMS",
        BINFLOAT => "BINFLOAT",
        PROTO => "PROTO",
        NEWOBJ => "NEWOBJ",
        EXT1 => "EXT1",
        EXT2 => "EXT2",
        EXT4 => "EXT4",
        TUPLE1 => "TUPLE1",
        TUPLE2 => "TUPLE2",
        TUPLE3 => "TUPLE3",
        NEWTRUE => "NEWTRUE",
        NEWFALSE => "NEWFALSE",
        LONG1 => "LONG1",
        LONG4 => "LONG4",
        BINBYTES => "BINBYTES",
        SHORT_BINBYTES => "SHORT_BINBYTES",
        SHORT_BINUNICODE => "SHORT_BINUNICODE",
        BINUNICODE8 => "BINUNICODE8",
        BINBYTES8 => "BINBYTES8",
        EMPTY_SET => "EMPTY_SET",
        ADDITEMS => "ADDITEMS",
        FROZENSET => "FROZENSET",
        NEWOBJ_EX => "NEWOBJ_EX",
        STACK_GLOBAL => "STACK_GLOBAL",
        MEMOIZE => "MEMOIZE",
        FRAME => "FRAME",
        BYTEARRAY8 => "BYTEARRAY8",
        NEXT_BUFFER => "NEXT_BUFFER",
        READONLY_BUFFER => "READONLY_BUFFER",
        _ => "<unknown>",
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Instruction::*;
        f.write_str(self.name())?;
        match *self {
            Get(i) | Put(i) | LongBinGet(i) | LongBinPut(i) => write!(f, " {}", i),
            BinGet(i) | BinPut(i) | BinInt1(i) | Ext1(i) | Proto(i) => write!(f, " {}", i),
            BinInt2(i) | Ext2(i) => write!(f, " {}", i),
            BinInt(i) => write!(f, " {}", i),
            Ext4(i) => write!(f, " {}", i),
            Frame(len) => write!(f, " {}", len),
            Int(IntLiteral::Bool(b)) => write!(f, " {}", if b { "True" } else { "False" }),
            Int(IntLiteral::Int(ref i)) | Long(ref i) => write!(f, " {}", i),
            Long1 { ref value, .. } | Long4 { ref value, .. } => write!(f, " {}", value),
            Float(v) | BinFloat(v) => write!(f, " {}", v),
            String(ref b) => write!(f, " {:?}", std::string::String::from_utf8_lossy(b)),
            BinString { ref value, .. } | ShortBinString { ref value, .. } |
            BinBytes { ref value, .. } | ShortBinBytes { ref value, .. } |
            BinBytes8 { ref value, .. } | ByteArray8 { ref value, .. } =>
                write!(f, " b{:?}", value),
            Unicode(ref s) | PersId(ref s) => write!(f, " {:?}", s),
            BinUnicode { ref value, .. } | ShortBinUnicode { ref value, .. } |
            BinUnicode8 { ref value, .. } => write!(f, " {:?}", value),
            Global { ref namespace, ref name } | Inst { ref namespace, ref name } =>
                write!(f, " {} {}", namespace, name),
            _ => Ok(()),
        }
    }
}
