//! Byte codec for dispatch arguments and results.
//!
//! Integers use LEB128 (unsigned and signed), byte strings are
//! `[uvarint len][raw]`, identifiers are raw fixed-width bytes. Decoding
//! works on a borrowed slice and never panics; every malformed input is a
//! [`CodecError`].

use thiserror::Error;

use crate::ids::{
    IdError, ScAddress, ScAgentId, ScChainId, ScColor, ScHash, ScHname, ScRequestId,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unexpected end of buffer: needed {needed} more bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },
    #[error("varint overflows 64 bits")]
    Overflow,
    #[error("length {0} does not fit the target integer")]
    LengthOverflow(u64),
    #[error("{0} trailing bytes after decoding")]
    TrailingBytes(usize),
    #[error("invalid utf-8 string")]
    BadUtf8,
    #[error(transparent)]
    Id(#[from] IdError),
}

/// Sequential reader over an argument buffer.
#[derive(Debug)]
pub struct BytesDecoder<'a> {
    buf: &'a [u8],
}

impl<'a> BytesDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Fails when unread bytes remain.
    pub fn finish(self) -> Result<(), CodecError> {
        match self.buf.len() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_fixed(1)?[0])
    }

    pub fn read_fixed(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < len {
            return Err(CodecError::Truncated {
                needed: len,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_uvarint(&mut self) -> Result<u64, CodecError> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift == 63 && byte > 1 {
                return Err(CodecError::Overflow);
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift > 63 {
                return Err(CodecError::Overflow);
            }
        }
    }

    pub fn read_varint(&mut self) -> Result<i64, CodecError> {
        let mut result = 0i64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            // the tenth byte only carries the sign bit
            if shift == 63 && byte != 0x00 && byte != 0x7f {
                return Err(CodecError::Overflow);
            }
            result |= i64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
            if shift > 63 {
                return Err(CodecError::Overflow);
            }
        }
    }

    /// Unsigned varint that must fit a `u32`.
    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let value = self.read_uvarint()?;
        u32::try_from(value).map_err(|_| CodecError::LengthOverflow(value))
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_uvarint()?;
        let len = usize::try_from(len).map_err(|_| CodecError::LengthOverflow(len))?;
        self.read_fixed(len)
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::BadUtf8)
    }

    pub fn read_address(&mut self) -> Result<ScAddress, CodecError> {
        Ok(ScAddress::from_bytes(self.read_fixed(ScAddress::LENGTH)?)?)
    }

    pub fn read_agent_id(&mut self) -> Result<ScAgentId, CodecError> {
        Ok(ScAgentId::from_bytes(self.read_fixed(ScAgentId::LENGTH)?)?)
    }

    pub fn read_chain_id(&mut self) -> Result<ScChainId, CodecError> {
        Ok(ScChainId::from_bytes(self.read_fixed(ScChainId::LENGTH)?)?)
    }

    pub fn read_color(&mut self) -> Result<ScColor, CodecError> {
        Ok(ScColor::from_bytes(self.read_fixed(ScColor::LENGTH)?)?)
    }

    pub fn read_hash(&mut self) -> Result<ScHash, CodecError> {
        Ok(ScHash::from_bytes(self.read_fixed(ScHash::LENGTH)?)?)
    }

    pub fn read_hname(&mut self) -> Result<ScHname, CodecError> {
        Ok(ScHname::from_bytes(self.read_fixed(ScHname::LENGTH)?)?)
    }

    pub fn read_request_id(&mut self) -> Result<ScRequestId, CodecError> {
        Ok(ScRequestId::from_bytes(self.read_fixed(ScRequestId::LENGTH)?)?)
    }
}

/// Append-only writer producing result buffers.
#[derive(Debug, Default, Clone)]
pub struct BytesEncoder {
    buf: Vec<u8>,
}

impl BytesEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_uvarint(&mut self, mut value: u64) -> &mut Self {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return self;
            }
            self.buf.push(byte | 0x80);
        }
    }

    pub fn write_varint(&mut self, mut value: i64) -> &mut Self {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
            if done {
                self.buf.push(byte);
                return self;
            }
            self.buf.push(byte | 0x80);
        }
    }

    pub fn write_fixed(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_uvarint(bytes.len() as u64);
        self.write_fixed(bytes)
    }

    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.write_bytes(value.as_bytes())
    }

    pub fn write_hname(&mut self, hname: ScHname) -> &mut Self {
        self.write_fixed(&hname.to_bytes())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
