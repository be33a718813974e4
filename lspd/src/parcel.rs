// src/parcel.rs

//! Request and reply framing for handle transactions.
//!
//! Layout follows the platform convention: little-endian 32-bit words,
//! UTF-16 strings prefixed with their length in code units and terminated
//! by a zero unit, everything padded to four bytes. Handles do not travel as
//! bytes; the data stream carries a slot index into a side table of objects,
//! the way the kernel driver keeps an offsets array beside the payload.

use crate::binder::BinderRef;
use crate::error::{Error, Result};

/// No exception was thrown by the remote side.
pub const EX_NONE: i32 = 0;
pub const EX_SECURITY: i32 = -1;
pub const EX_ILLEGAL_ARGUMENT: i32 = -3;
pub const EX_ILLEGAL_STATE: i32 = -5;

const NULL_OBJECT: i32 = 0;
const STRONG_BINDER: i32 = 1;

#[derive(Clone, Default)]
pub struct Parcel {
    data: Vec<u8>,
    position: usize,
    objects: Vec<BinderRef>,
}

impl Parcel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub fn set_data_position(&mut self, position: usize) {
        self.position = position.min(self.data.len());
    }

    /// Drops all content so the parcel can be reused for a reply.
    pub fn clear(&mut self) {
        self.data.clear();
        self.objects.clear();
        self.position = 0;
    }

    // --- Primitives ---

    pub fn write_i32(&mut self, value: i32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        let end = self.position.saturating_add(len);
        if end > self.data.len() {
            return Err(Error::ProtocolMismatch(format!(
                "read of {} bytes at {} overruns parcel of {}",
                len,
                self.position,
                self.data.len()
            )));
        }
        let start = self.position;
        self.position = end;
        Ok(&self.data[start..end])
    }

    fn pad(&mut self) {
        while self.data.len() % 4 != 0 {
            self.data.push(0);
        }
    }

    fn skip_padding(&mut self) {
        self.position = (self.position.div_ceil(4) * 4).min(self.data.len());
    }

    // --- Strings ---

    /// Writes a UTF-16 string; `None` is encoded as length -1.
    pub fn write_string16(&mut self, value: Option<&str>) {
        let Some(value) = value else {
            self.write_i32(-1);
            return;
        };
        let units: Vec<u16> = value.encode_utf16().collect();
        self.write_i32(units.len() as i32);
        for unit in units.iter().chain(std::iter::once(&0)) {
            self.data.extend_from_slice(&unit.to_le_bytes());
        }
        self.pad();
    }

    pub fn read_string16(&mut self) -> Result<Option<String>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        let bytes = self.take((len as usize).saturating_add(1).saturating_mul(2))?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take(len as usize)
            .collect();
        let value = String::from_utf16(&units)
            .map_err(|e| Error::ProtocolMismatch(format!("invalid UTF-16 string: {e}")))?;
        self.skip_padding();
        Ok(Some(value))
    }

    pub fn write_string_list(&mut self, values: &[String]) {
        self.write_i32(values.len() as i32);
        for value in values {
            self.write_string16(Some(value));
        }
    }

    /// A negative length is a null list and reads as empty.
    pub fn read_string_list(&mut self) -> Result<Vec<String>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(Vec::new());
        }
        // Every entry takes at least one word.
        if len as usize > self.remaining() / 4 {
            return Err(Error::ProtocolMismatch(format!(
                "list of {} strings overruns parcel of {}",
                len,
                self.data.len()
            )));
        }
        let mut values = Vec::with_capacity(len as usize);
        for _ in 0..len {
            values.push(self.read_string16()?.unwrap_or_default());
        }
        Ok(values)
    }

    // --- Interface tokens ---

    pub fn write_interface_token(&mut self, descriptor: &str) {
        self.write_string16(Some(descriptor));
    }

    /// Reads the interface token without judging it.
    pub fn read_interface_descriptor(&mut self) -> Result<String> {
        self.read_string16()?
            .ok_or_else(|| Error::ProtocolMismatch("missing interface token".to_string()))
    }

    pub fn enforce_interface(&mut self, expected: &str) -> Result<()> {
        let descriptor = self.read_interface_descriptor()?;
        if descriptor != expected {
            return Err(Error::ProtocolMismatch(format!(
                "expected interface {expected}, got {descriptor}"
            )));
        }
        Ok(())
    }

    // --- Handles ---

    pub fn write_strong_binder(&mut self, binder: Option<&BinderRef>) {
        match binder {
            Some(binder) => {
                self.write_i32(STRONG_BINDER);
                self.write_i32(self.objects.len() as i32);
                self.objects.push(binder.clone());
            }
            None => self.write_i32(NULL_OBJECT),
        }
    }

    pub fn read_strong_binder(&mut self) -> Result<Option<BinderRef>> {
        match self.read_i32()? {
            NULL_OBJECT => Ok(None),
            STRONG_BINDER => {
                let slot = self.read_i32()?;
                self.objects
                    .get(slot as usize)
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| Error::ProtocolMismatch(format!("no object in slot {slot}")))
            }
            tag => Err(Error::ProtocolMismatch(format!("unknown object tag {tag}"))),
        }
    }

    // --- Exceptions ---

    pub fn write_no_exception(&mut self) {
        self.write_i32(EX_NONE);
    }

    pub fn write_exception(&mut self, code: i32, message: &str) {
        self.write_i32(code);
        self.write_string16(Some(message));
    }

    /// Turns a marshalled exception at the current position into an error.
    pub fn read_exception(&mut self) -> Result<()> {
        match self.read_i32()? {
            EX_NONE => Ok(()),
            code => Err(Error::RemoteException {
                code,
                message: self.read_string16()?.unwrap_or_default(),
            }),
        }
    }
}
