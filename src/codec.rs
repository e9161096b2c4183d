// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Primitive readers for pickle op arguments.
//!
//! Binary arguments are little-endian fixed-width integers, length-prefixed
//! payloads, and big-endian doubles.  The text-based protocol spells numbers
//! and strings as newline-terminated lines; the pure functions at the bottom
//! of this module decode those lines and report the offset of the first
//! offending byte, which the readers turn into a stream position.

use std::char;
use std::io::Read;
use std::str;
use byteorder::{ByteOrder, BigEndian, LittleEndian};
use num_bigint::{BigInt, Sign};

use crate::error::{ErrorCode, Result};
use crate::source::Source;

/// Decoded argument of the text-based `INT` opcode.
#[derive(Clone, Debug, PartialEq)]
pub enum IntLiteral {
    /// `00` and `01`, the protocol 0 spelling of False and True.
    Bool(bool),
    Int(BigInt),
}

/// Reason and line offset of a malformed textual argument.
#[derive(Clone, Debug, PartialEq)]
pub struct Malformed {
    pub code: ErrorCode,
    pub at: usize,
}

type ParseResult<T> = std::result::Result<T, Malformed>;

impl Malformed {
    fn new(code: ErrorCode, at: usize) -> Malformed {
        Malformed { code, at }
    }
}

impl<R: Read> Source<R> {
    pub fn read_u8(&mut self) -> Result<u8> {
        self.read_byte()
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(LittleEndian::read_u16(&bytes))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(LittleEndian::read_u32(&bytes))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.read_bytes(4)?;
        Ok(LittleEndian::read_i32(&bytes))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        Ok(LittleEndian::read_u64(&bytes))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let bytes = self.read_bytes(8)?;
        Ok(BigEndian::read_f64(&bytes))
    }

    /// Reads a signed 4-byte length, rejecting negative values.
    pub fn read_length(&mut self) -> Result<u32> {
        let start = self.pos();
        match self.read_i32()? {
            l if l < 0 => self.error_at(ErrorCode::NegativeLength, start),
            l => Ok(l as u32),
        }
    }

    /// Reads up to (excluding) the next newline.  A trailing carriage
    /// return is dropped as well.
    pub fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity(16);
        loop {
            match self.read_byte()? {
                b'\n' => {
                    if result.last() == Some(&b'\r') { result.pop(); }
                    return Ok(result)
                }
                ch => result.push(ch)
            }
        }
    }

    /// Reads a line and decodes it with `decode`, mapping failures to the
    /// position of the offending byte.
    fn read_line_with<T, F>(&mut self, decode: F) -> Result<T>
        where F: FnOnce(&[u8]) -> ParseResult<T>
    {
        let start = self.pos();
        let line = self.read_line()?;
        match decode(&line) {
            Ok(v) => Ok(v),
            Err(m) => self.error_at(m.code, start + m.at),
        }
    }

    pub fn read_int_line(&mut self) -> Result<IntLiteral> {
        self.read_line_with(parse_int)
    }

    pub fn read_long_line(&mut self) -> Result<BigInt> {
        self.read_line_with(parse_long)
    }

    pub fn read_float_line(&mut self) -> Result<f64> {
        self.read_line_with(parse_float)
    }

    pub fn read_index_line(&mut self) -> Result<u32> {
        self.read_line_with(parse_index)
    }

    pub fn read_quoted_line(&mut self) -> Result<Vec<u8>> {
        self.read_line_with(unquote_string)
    }

    pub fn read_unicode_line(&mut self) -> Result<String> {
        self.read_line_with(unescape_unicode)
    }

    pub fn read_utf8_line(&mut self) -> Result<String> {
        let start = self.pos();
        let line = self.read_line()?;
        match String::from_utf8(line) {
            Ok(s) => Ok(s),
            Err(_) => self.error_at(ErrorCode::StringNotUTF8, start),
        }
    }

    pub fn read_utf8(&mut self, len: u64) -> Result<String> {
        let start = self.pos();
        let bytes = self.read_bytes(len)?;
        match String::from_utf8(bytes) {
            Ok(s) => Ok(s),
            Err(_) => self.error_at(ErrorCode::StringNotUTF8, start),
        }
    }
}

/// Checks that `line` consists of decimal digits, allowing a leading sign.
fn check_digits(line: &[u8], field: &'static str) -> ParseResult<()> {
    for (i, &b) in line.iter().enumerate() {
        let sign = i == 0 && (b == b'-' || b == b'+');
        if !sign && !b.is_ascii_digit() {
            return Err(Malformed::new(ErrorCode::NonNumeric { field, byte: b }, i));
        }
    }
    if line.is_empty() || !line[line.len() - 1].is_ascii_digit() {
        return Err(Malformed::new(ErrorCode::InvalidLiteral(line.into()), 0));
    }
    Ok(())
}

/// Decodes the argument of `INT`: `00` is False, `01` is True, and any
/// other digit run is a genuine integer.
pub fn parse_int(line: &[u8]) -> ParseResult<IntLiteral> {
    match line {
        b"00" => return Ok(IntLiteral::Bool(false)),
        b"01" => return Ok(IntLiteral::Bool(true)),
        _ => {}
    }
    check_digits(line, "INT")?;
    BigInt::parse_bytes(line, 10)
        .map(IntLiteral::Int)
        .ok_or_else(|| Malformed::new(ErrorCode::InvalidLiteral(line.into()), 0))
}

/// Decodes the argument of `LONG`, with or without the `L` suffix.
pub fn parse_long(line: &[u8]) -> ParseResult<BigInt> {
    let digits = match line.split_last() {
        Some((&b'L', rest)) => rest,
        _ => line,
    };
    check_digits(digits, "LONG")?;
    BigInt::parse_bytes(digits, 10)
        .ok_or_else(|| Malformed::new(ErrorCode::InvalidLiteral(line.into()), 0))
}

/// Decodes the argument of `FLOAT`, as written by Python's `repr`.
pub fn parse_float(line: &[u8]) -> ParseResult<f64> {
    if let Some(f) = str::from_utf8(line).ok().and_then(|s| s.parse::<f64>().ok()) {
        return Ok(f);
    }
    match line.iter().position(|&b| !b"0123456789.+-eE".contains(&b)) {
        Some(i) => Err(Malformed::new(ErrorCode::NonNumeric { field: "FLOAT", byte: line[i] }, i)),
        None => Err(Malformed::new(ErrorCode::InvalidLiteral(line.into()), 0)),
    }
}

/// Decodes the memo index argument of `GET` and `PUT`.
pub fn parse_index(line: &[u8]) -> ParseResult<u32> {
    if let Some(i) = line.iter().position(|b| !b.is_ascii_digit()) {
        return Err(Malformed::new(ErrorCode::NonNumeric { field: "memo index", byte: line[i] }, i));
    }
    str::from_utf8(line).ok()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| Malformed::new(ErrorCode::InvalidLiteral(line.into()), 0))
}

/// Strips the quotes of a `STRING` argument and resolves its escapes.
pub fn unquote_string(line: &[u8]) -> ParseResult<Vec<u8>> {
    let quoted = line.len() >= 2 && line[0] == line[line.len() - 1] &&
        (line[0] == b'\'' || line[0] == b'"');
    if !quoted {
        return Err(Malformed::new(ErrorCode::MissingQuote(line.into()), 0));
    }
    unescape_string(&line[1..line.len() - 1]).map_err(|m| Malformed::new(m.code, m.at + 1))
}

fn hex_value(digits: &[u8]) -> Option<u32> {
    digits.iter().try_fold(0u32, |acc, &ch| (ch as char).to_digit(16).map(|v| acc * 16 + v))
}

/// Resolves Python string escapes in the body of a `STRING` argument.
pub fn unescape_string(s: &[u8]) -> ParseResult<Vec<u8>> {
    let mut result = Vec::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        if s[i] != b'\\' {
            result.push(s[i]);
            i += 1;
            continue;
        }
        let escape = match s.get(i + 1) {
            Some(&b'\\') => b'\\',
            Some(&b'\'') => b'\'',
            Some(&b'"') => b'"',
            Some(&b'a') => b'\x07',
            Some(&b'b') => b'\x08',
            Some(&b't') => b'\t',
            Some(&b'n') => b'\n',
            Some(&b'v') => b'\x0b',
            Some(&b'f') => b'\x0c',
            Some(&b'r') => b'\r',
            Some(&b'x') => {
                match s.get(i + 2..i + 4).and_then(hex_value) {
                    Some(v) => {
                        result.push(v as u8);
                        i += 4;
                        continue;
                    }
                    None => {
                        let end = (i + 4).min(s.len());
                        return Err(Malformed::new(ErrorCode::InvalidEscape(s[i + 1..end].into()), i));
                    }
                }
            }
            _ => {
                let end = (i + 2).min(s.len());
                return Err(Malformed::new(ErrorCode::InvalidEscape(s[i + 1..end].into()), i));
            }
        };
        result.push(escape);
        i += 2;
    }
    Ok(result)
}

/// Decodes the raw-unicode-escape argument of `UNICODE`.
///
/// Bytes outside of escapes stand for the Latin-1 code point of the same
/// value; `\uXXXX`, `\UXXXXXXXX`, `\xXX` and `\\` are the escapes.
pub fn unescape_unicode(s: &[u8]) -> ParseResult<String> {
    let mut result = String::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        if s[i] != b'\\' {
            result.push(s[i] as char);
            i += 1;
            continue;
        }
        let ndigits = match s.get(i + 1) {
            Some(&b'\\') => {
                result.push('\\');
                i += 2;
                continue;
            }
            Some(&b'x') => 2,
            Some(&b'u') => 4,
            Some(&b'U') => 8,
            _ => {
                let end = (i + 2).min(s.len());
                return Err(Malformed::new(ErrorCode::InvalidEscape(s[i + 1..end].into()), i));
            }
        };
        match s.get(i + 2..i + 2 + ndigits).and_then(hex_value).and_then(char::from_u32) {
            Some(ch) => result.push(ch),
            None => {
                let end = (i + 2 + ndigits).min(s.len());
                return Err(Malformed::new(ErrorCode::InvalidEscape(s[i + 1..end].into()), i));
            }
        }
        i += 2 + ndigits;
    }
    Ok(result)
}

/// Decodes the little-endian two's complement payload of `LONG1`/`LONG4`.
pub fn decode_long(bytes: &[u8]) -> BigInt {
    // BigInt::from_bytes_le doesn't like a sign bit in the bytes, therefore
    // we have to extract that ourselves and do the two-s complement.
    let negative = !bytes.is_empty() && (bytes[bytes.len() - 1] & 0x80 != 0);
    let mut val = BigInt::from_bytes_le(Sign::Plus, bytes);
    if negative {
        val -= BigInt::from(1) << (bytes.len() * 8);
    }
    val
}
