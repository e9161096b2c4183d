// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Protocol version inference.
//!
//! Protocols 2 and up start with `PROTO`, which names the version.  The two
//! older protocols have no header, and many opcodes mean the same in both,
//! so the stream is scanned forward until an opcode exclusive to one of them
//! turns up.  Everything looked at is pushed back afterwards, so the stream
//! is left exactly as found.

use std::io::Read;

use crate::consts::*;
use crate::error::{ErrorCode, Result};
use crate::protocol::Decoder;
use crate::source::Source;

/// Guesses the protocol version of the pickle `src` is positioned at,
/// without consuming any bytes.
pub fn infer_version<R: Read>(src: &mut Source<R>) -> Result<u8> {
    let mut consumed = Vec::new();
    let result = scan(src, &mut consumed);
    src.unread(&consumed);
    if let Ok(version) = result {
        log::debug!("inferred protocol {} after {} byte(s)", version, consumed.len());
    }
    result
}

fn scan<R: Read>(src: &mut Source<R>, consumed: &mut Vec<u8>) -> Result<u8> {
    loop {
        let at = src.pos();
        let opcode = match src.next_byte()? {
            Some(opcode) => opcode,
            None => return src.error(ErrorCode::EOFWhileParsing),
        };
        consumed.push(opcode);
        match opcode {
            PROTO => {
                let version = src.read_byte()?;
                consumed.push(version);
                return Ok(version);
            }
            // A stream made only of shared opcodes is taken as protocol 0.
            STOP => return Ok(0),
            POP | DUP | FLOAT | STRING | UNICODE | DICT | GET | LIST | PUT | INST | PERSID =>
                return Ok(0),
            EMPTY_TUPLE | BINFLOAT | BININT | BININT1 | BININT2 | BINSTRING | SHORT_BINSTRING |
            BINUNICODE | EMPTY_LIST | APPENDS | BINGET | LONG_BINGET | BINPUT | LONG_BINPUT |
            SETITEMS | EMPTY_DICT | OBJ | BINPERSID =>
                return Ok(1),
            MARK | POP_MARK | NONE | REDUCE | APPEND | BUILD | SETITEM | TUPLE => { }
            INT | LONG => skip_line(src, consumed)?,
            GLOBAL => {
                skip_line(src, consumed)?;
                skip_line(src, consumed)?;
            }
            _ => return src.error_at(ErrorCode::UninferableOpcode(opcode), at),
        }
    }
}

fn skip_line<R: Read>(src: &mut Source<R>, consumed: &mut Vec<u8>) -> Result<()> {
    loop {
        let byte = src.read_byte()?;
        consumed.push(byte);
        if byte == b'\n' {
            return Ok(());
        }
    }
}

impl<R: Read> Decoder<R> {
    /// Creates a decoder for the protocol version the stream announces or,
    /// for the headerless protocols, appears to use.
    pub fn infer(rdr: R) -> Result<Decoder<R>> {
        let mut src = Source::new(rdr);
        let version = infer_version(&mut src)?;
        Decoder::from_source(src, version)
    }
}
