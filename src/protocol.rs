// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Protocol decoders: pickle bytes to `Instruction`s.
//!
//! There is a single decoder, parameterized by the protocol version.  The
//! set of accepted opcodes is the union of the opcodes introduced by every
//! protocol up to that version (see `consts::PROTOCOL_OPCODES`), so a
//! protocol 2 decoder rejects e.g. `SHORT_BINBYTES`.
//!
//! From protocol 4 on, `FRAME` redirects reading into the announced number
//! of bytes.  Since a frame may end after any instruction, the decoder
//! checks for exhausted frames after each one.

use std::io::Read;

use crate::codec::decode_long;
use crate::consts::*;
use crate::error::{Error, ErrorCode, Result};
use crate::instruction::{Instruction, opcode_name};
use crate::source::Source;

/// Decodes the instructions of one pickle stream.
pub struct Decoder<R> {
    src: Source<R>,
    version: u8,
    table: [bool; 256],
    failed: bool,
}

impl<R: Read> Decoder<R> {
    /// Creates a decoder for protocol `version` reading from `rdr`.
    pub fn new(rdr: R, version: u8) -> Result<Decoder<R>> {
        Decoder::from_source(Source::new(rdr), version)
    }

    pub fn from_source(src: Source<R>, version: u8) -> Result<Decoder<R>> {
        if version > HIGHEST_PROTOCOL {
            return src.error(ErrorCode::UnsupportedProtocol(version));
        }
        log::debug!("decoding with protocol {}", version);
        Ok(Decoder {
            src,
            version,
            table: opcode_table(version),
            failed: false,
        })
    }

    pub fn version(&self) -> u8 { self.version }

    /// Offset of the next byte to decode.
    pub fn pos(&self) -> usize { self.src.pos() }

    /// Makes sure that no more bytes follow.
    pub fn end(&mut self) -> Result<()> {
        match self.src.next_byte()? {
            Some(_) => self.src.error(ErrorCode::TrailingBytes),
            None => Ok(()),
        }
    }

    /// Decodes the next instruction, or returns `None` at a clean end of
    /// the stream.
    pub fn next_instruction(&mut self) -> Result<Option<Instruction>> {
        let start = self.src.pos();
        let opcode = match self.src.next_byte()? {
            Some(opcode) => opcode,
            None => return Ok(None),
        };
        if !self.table[opcode as usize] {
            return self.src.error_at(ErrorCode::UnknownOpcode { opcode, version: self.version },
                                     start);
        }
        let instruction = self.decode(opcode).map_err(|err| match err {
            Error::Format(ErrorCode::EOFWhileParsing, pos) =>
                Error::Format(ErrorCode::TruncatedArgument(opcode_name(opcode)), pos),
            err => err,
        })?;
        let left = self.src.leave_exhausted_frames();
        if left > 0 {
            log::debug!("left {} exhausted frame(s) at offset {}", left, self.src.pos());
        }
        Ok(Some(instruction))
    }

    fn decode(&mut self, opcode: u8) -> Result<Instruction> {
        let src = &mut self.src;
        Ok(match opcode {
            MARK => Instruction::Mark,
            STOP => Instruction::Stop,
            POP => Instruction::Pop,
            POP_MARK => Instruction::PopMark,
            DUP => Instruction::Dup,
            NONE => Instruction::None,
            NEWTRUE => Instruction::NewTrue,
            NEWFALSE => Instruction::NewFalse,
            MEMOIZE => Instruction::Memoize,

            PROTO => Instruction::Proto(src.read_u8()?),
            FRAME => {
                let len = src.read_u64()?;
                src.enter_frame(len)?;
                log::debug!("entered frame of {} bytes at offset {}", len, src.pos());
                Instruction::Frame(len)
            }

            // Memo access
            GET => Instruction::Get(src.read_index_line()?),
            BINGET => Instruction::BinGet(src.read_u8()?),
            LONG_BINGET => Instruction::LongBinGet(src.read_u32()?),
            PUT => Instruction::Put(src.read_index_line()?),
            BINPUT => Instruction::BinPut(src.read_u8()?),
            LONG_BINPUT => Instruction::LongBinPut(src.read_u32()?),

            // ASCII-formatted numbers
            INT => Instruction::Int(src.read_int_line()?),
            LONG => Instruction::Long(src.read_long_line()?),
            FLOAT => Instruction::Float(src.read_float_line()?),

            // Binary-coded numbers
            BININT => Instruction::BinInt(src.read_i32()?),
            BININT1 => Instruction::BinInt1(src.read_u8()?),
            BININT2 => Instruction::BinInt2(src.read_u16()?),
            BINFLOAT => Instruction::BinFloat(src.read_f64()?),
            LONG1 => {
                let len = src.read_u8()?;
                let bytes = src.read_bytes(len as u64)?;
                Instruction::Long1 { len, value: decode_long(&bytes) }
            }
            LONG4 => {
                let len = src.read_length()?;
                let bytes = src.read_bytes(len as u64)?;
                Instruction::Long4 { len, value: decode_long(&bytes) }
            }

            // Until-EOL strings
            STRING => Instruction::String(src.read_quoted_line()?),
            UNICODE => Instruction::Unicode(src.read_unicode_line()?),

            // Length-prefixed (byte)strings
            BINSTRING => {
                let len = src.read_length()?;
                Instruction::BinString { len, value: src.read_bytes(len as u64)? }
            }
            SHORT_BINSTRING => {
                let len = src.read_u8()?;
                Instruction::ShortBinString { len, value: src.read_bytes(len as u64)? }
            }
            BINUNICODE => {
                let len = src.read_u32()?;
                Instruction::BinUnicode { len, value: src.read_utf8(len as u64)? }
            }
            SHORT_BINUNICODE => {
                let len = src.read_u8()?;
                Instruction::ShortBinUnicode { len, value: src.read_utf8(len as u64)? }
            }
            BINUNICODE8 => {
                let len = src.read_u64()?;
                Instruction::BinUnicode8 { len, value: src.read_utf8(len)? }
            }
            BINBYTES => {
                let len = src.read_u32()?;
                Instruction::BinBytes { len, value: src.read_bytes(len as u64)? }
            }
            SHORT_BINBYTES => {
                let len = src.read_u8()?;
                Instruction::ShortBinBytes { len, value: src.read_bytes(len as u64)? }
            }
            BINBYTES8 => {
                let len = src.read_u64()?;
                Instruction::BinBytes8 { len, value: src.read_bytes(len)? }
            }
            BYTEARRAY8 => {
                let len = src.read_u64()?;
                Instruction::ByteArray8 { len, value: src.read_bytes(len)? }
            }

            // Containers
            EMPTY_TUPLE => Instruction::EmptyTuple,
            TUPLE => Instruction::Tuple,
            TUPLE1 => Instruction::Tuple1,
            TUPLE2 => Instruction::Tuple2,
            TUPLE3 => Instruction::Tuple3,
            EMPTY_LIST => Instruction::EmptyList,
            LIST => Instruction::List,
            APPEND => Instruction::Append,
            APPENDS => Instruction::Appends,
            EMPTY_DICT => Instruction::EmptyDict,
            DICT => Instruction::Dict,
            SETITEM => Instruction::SetItem,
            SETITEMS => Instruction::SetItems,
            EMPTY_SET => Instruction::EmptySet,
            ADDITEMS => Instruction::AddItems,
            FROZENSET => Instruction::FrozenSet,

            // Object construction
            GLOBAL => {
                let namespace = src.read_utf8_line()?;
                let name = src.read_utf8_line()?;
                Instruction::Global { namespace, name }
            }
            INST => {
                let namespace = src.read_utf8_line()?;
                let name = src.read_utf8_line()?;
                Instruction::Inst { namespace, name }
            }
            STACK_GLOBAL => Instruction::StackGlobal,
            REDUCE => Instruction::Reduce,
            BUILD => Instruction::Build,
            OBJ => Instruction::Obj,
            NEWOBJ => Instruction::NewObj,
            NEWOBJ_EX => Instruction::NewObjEx,
            PERSID => Instruction::PersId(src.read_utf8_line()?),
            BINPERSID => Instruction::BinPersId,
            EXT1 => Instruction::Ext1(src.read_u8()?),
            EXT2 => Instruction::Ext2(src.read_u16()?),
            EXT4 => Instruction::Ext4(src.read_u32()?),

            // Out-of-band buffers
            NEXT_BUFFER => Instruction::NextBuffer,
            READONLY_BUFFER => Instruction::ReadonlyBuffer,

            code => return src.error(ErrorCode::UnknownOpcode { opcode: code,
                                                                version: self.version }),
        })
    }
}

impl<R: Read> Iterator for Decoder<R> {
    type Item = Result<Instruction>;

    /// Yields instructions up to the end of the stream or the first error.
    fn next(&mut self) -> Option<Result<Instruction>> {
        if self.failed {
            return None;
        }
        match self.next_instruction() {
            Ok(Some(instruction)) => Some(Ok(instruction)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
