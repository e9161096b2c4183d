// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Byte source shared by the protocol decoders and version inference.
//!
//! A `Source` reads forward from an `io::Read`, tracking the offset into the
//! logical pickle stream for error reporting.  Two detours are layered on
//! top of the reader:
//!
//! * a push-back buffer, used by version inference to restore bytes it had
//!   to look at, and
//! * a stack of frame buffers: once a protocol 4 `FRAME` is entered, reads
//!   are served from the frame's bytes until it is exhausted, after which
//!   the enclosing source is used again.

use std::cmp;
use std::io::{self, Read};

use crate::error::{Error, ErrorCode, Result};

/// Upper bound for buffers preallocated from untrusted length prefixes.
const MAX_PREALLOC: u64 = 64 * 1024;

pub struct Source<R> {
    rdr: R,
    pos: usize,
    pushback: Vec<u8>,
    frames: Vec<io::Cursor<Vec<u8>>>,
}

impl<R: Read> Source<R> {
    pub fn new(rdr: R) -> Source<R> {
        Source {
            rdr,
            pos: 0,
            pushback: Vec::new(),
            frames: Vec::new(),
        }
    }

    /// Offset of the next byte within the pickle stream.
    pub fn pos(&self) -> usize { self.pos }

    /// Number of frames currently being read from.
    pub fn frame_depth(&self) -> usize { self.frames.len() }

    /// Reads the next byte, or `None` at a clean end of the active source.
    pub fn next_byte(&mut self) -> Result<Option<u8>> {
        if let Some(byte) = self.pushback.pop() {
            self.pos += 1;
            return Ok(Some(byte));
        }
        let mut buf = [0u8; 1];
        let read = match self.frames.last_mut() {
            Some(frame) => frame.read(&mut buf)?,
            None => loop {
                match self.rdr.read(&mut buf) {
                    Ok(n) => break n,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(Error::Io(e)),
                }
            },
        };
        if read == 0 {
            Ok(None)
        } else {
            self.pos += 1;
            Ok(Some(buf[0]))
        }
    }

    /// Reads the next byte, failing at the end of the stream.
    pub fn read_byte(&mut self) -> Result<u8> {
        match self.next_byte()? {
            Some(byte) => Ok(byte),
            None => self.error(ErrorCode::EOFWhileParsing),
        }
    }

    /// Reads exactly `n` bytes from the active source.
    pub fn read_bytes(&mut self, n: u64) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(cmp::min(n, MAX_PREALLOC) as usize);
        while (buf.len() as u64) < n {
            match self.pushback.pop() {
                Some(byte) => buf.push(byte),
                None => break,
            }
        }
        let rest = n - buf.len() as u64;
        if rest > 0 {
            match self.frames.last_mut() {
                Some(frame) => { frame.take(rest).read_to_end(&mut buf)?; }
                None => { (&mut self.rdr).take(rest).read_to_end(&mut buf)?; }
            }
        }
        self.pos += buf.len();
        if (buf.len() as u64) < n {
            return self.error(ErrorCode::EOFWhileParsing);
        }
        Ok(buf)
    }

    /// Pushes previously read bytes back, so that they are read again in
    /// the same order.
    pub fn unread(&mut self, bytes: &[u8]) {
        self.pushback.extend(bytes.iter().rev());
        self.pos -= bytes.len();
    }

    /// Redirects subsequent reads into the next `len` bytes.
    pub fn enter_frame(&mut self, len: u64) -> Result<()> {
        let data = self.read_bytes(len)?;
        // Frame contents are counted as they are consumed.
        self.pos -= data.len();
        self.frames.push(io::Cursor::new(data));
        Ok(())
    }

    /// Drops all frames that have been read completely, returning how many
    /// were left.
    pub fn leave_exhausted_frames(&mut self) -> usize {
        if !self.pushback.is_empty() {
            return 0;
        }
        let mut left = 0;
        while let Some(frame) = self.frames.last() {
            if frame.position() < frame.get_ref().len() as u64 {
                break;
            }
            self.frames.pop();
            left += 1;
        }
        left
    }

    pub fn error<T>(&self, reason: ErrorCode) -> Result<T> {
        Err(Error::Format(reason, self.pos))
    }

    pub fn error_at<T>(&self, reason: ErrorCode, pos: usize) -> Result<T> {
        Err(Error::Format(reason, pos))
    }
}
