// src/core/protocol/pack.rs

//! Little-endian packing primitives for the wire protocol and the
//! state-save files.
//!
//! All integers are little-endian. Strings and opaque blobs are `u32`
//! length-prefixed; an optional string uses `u32::MAX` as the "absent"
//! sentinel so the empty string stays representable. Arrays are `u32`
//! count-prefixed.

use crate::core::ControllerError;
use crate::core::bitmap::Bitmap;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const NO_VAL_LEN: u32 = u32::MAX;

/// Serialises values into a growable buffer.
#[derive(Debug, Default)]
pub struct Packer {
    buf: BytesMut,
}

impl Packer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    /// Wall-clock seconds; the wire `time_t` is a `u64`.
    pub fn time(&mut self, v: i64) {
        self.buf.put_u64_le(v.max(0) as u64);
    }

    pub fn bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn str(&mut self, s: &str) {
        self.buf.put_u32_le(s.len() as u32);
        self.buf.put_slice(s.as_bytes());
    }

    pub fn opt_str(&mut self, s: Option<&str>) {
        match s {
            None => self.buf.put_u32_le(NO_VAL_LEN),
            Some(s) => self.str(s),
        }
    }

    pub fn bytes(&mut self, b: &[u8]) {
        self.buf.put_u32_le(b.len() as u32);
        self.buf.put_slice(b);
    }

    /// Count prefix for a following sequence of records.
    pub fn count(&mut self, n: usize) {
        self.buf.put_u32_le(n as u32);
    }

    pub fn bitmap(&mut self, bm: &Bitmap) {
        self.buf.put_u32_le(bm.size() as u32);
        for w in bm.words() {
            self.buf.put_u64_le(*w);
        }
    }

    pub fn opt_bitmap(&mut self, bm: Option<&Bitmap>) {
        match bm {
            None => self.buf.put_u32_le(NO_VAL_LEN),
            Some(bm) => self.bitmap(bm),
        }
    }
}

/// Deserialises values from a received buffer, with bounds checking on
/// every read so a truncated or hostile frame can never panic.
#[derive(Debug)]
pub struct Unpacker {
    buf: Bytes,
}

impl Unpacker {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<(), ControllerError> {
        if self.buf.remaining() < n {
            return Err(ControllerError::Protocol(format!(
                "short buffer: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, ControllerError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, ControllerError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn u32(&mut self) -> Result<u32, ControllerError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn u64(&mut self) -> Result<u64, ControllerError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn time(&mut self) -> Result<i64, ControllerError> {
        Ok(self.u64()? as i64)
    }

    pub fn bool(&mut self) -> Result<bool, ControllerError> {
        Ok(self.u8()? != 0)
    }

    pub fn str(&mut self) -> Result<String, ControllerError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let raw = self.buf.copy_to_bytes(len);
        Ok(String::from_utf8(raw.to_vec())?)
    }

    pub fn opt_str(&mut self) -> Result<Option<String>, ControllerError> {
        let len = self.u32()?;
        if len == NO_VAL_LEN {
            return Ok(None);
        }
        let len = len as usize;
        self.need(len)?;
        let raw = self.buf.copy_to_bytes(len);
        Ok(Some(String::from_utf8(raw.to_vec())?))
    }

    pub fn bytes(&mut self) -> Result<Bytes, ControllerError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    pub fn count(&mut self) -> Result<usize, ControllerError> {
        Ok(self.u32()? as usize)
    }

    pub fn bitmap(&mut self) -> Result<Bitmap, ControllerError> {
        let nbits = self.u32()? as usize;
        let nwords = nbits.div_ceil(64);
        self.need(nwords * 8)?;
        let mut words = Vec::with_capacity(nwords);
        for _ in 0..nwords {
            words.push(self.buf.get_u64_le());
        }
        Bitmap::from_words(nbits, words)
    }

    pub fn opt_bitmap(&mut self) -> Result<Option<Bitmap>, ControllerError> {
        let nbits = self.u32()?;
        if nbits == NO_VAL_LEN {
            return Ok(None);
        }
        let nbits = nbits as usize;
        let nwords = nbits.div_ceil(64);
        self.need(nwords * 8)?;
        let mut words = Vec::with_capacity(nwords);
        for _ in 0..nwords {
            words.push(self.buf.get_u64_le());
        }
        Ok(Some(Bitmap::from_words(nbits, words)?))
    }
}
