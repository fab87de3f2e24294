//! Tag-Length-Value records inside frame payloads
//!
//! Each record is a 1-byte tag, a 2-byte big-endian length and `length`
//! bytes of value. Records are packed back to back with no padding.

use bytes::BufMut;

use crate::error::{NeptunError, Result};

/// Tag + big-endian length
pub const TLV_HEADER_LEN: usize = 3;

/// One record borrowed from a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvRecord<'a> {
    /// Tag byte
    pub tag: u8,
    /// Value bytes
    pub value: &'a [u8],
}

impl<'a> TlvRecord<'a> {
    /// Create a record
    pub fn new(tag: u8, value: &'a [u8]) -> Self {
        Self { tag, value }
    }

    /// Encoded size including the header
    pub fn encoded_len(&self) -> usize {
        TLV_HEADER_LEN + self.value.len()
    }
}

/// Iterator over the records of a payload
///
/// Iteration stops at the first record whose header or declared value
/// length does not fit in the remaining bytes; [`TlvReader::truncated_at`]
/// then reports the payload offset of that record.
#[derive(Debug, Clone)]
pub struct TlvReader<'a> {
    buf: &'a [u8],
    pos: usize,
    truncated_at: Option<usize>,
}

impl<'a> TlvReader<'a> {
    /// Start reading at the beginning of `payload`
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            buf: payload,
            pos: 0,
            truncated_at: None,
        }
    }

    /// Offset of the record that could not be read, if iteration stopped early
    pub fn truncated_at(&self) -> Option<usize> {
        self.truncated_at
    }

    fn stop(&mut self) -> Option<TlvRecord<'a>> {
        self.truncated_at = Some(self.pos);
        self.pos = self.buf.len();
        None
    }
}

impl<'a> Iterator for TlvReader<'a> {
    type Item = TlvRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.buf.len() - self.pos;
        if remaining == 0 {
            return None;
        }
        if remaining < TLV_HEADER_LEN {
            return self.stop();
        }

        let tag = self.buf[self.pos];
        let len = usize::from(u16::from_be_bytes([
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
        ]));
        let start = self.pos + TLV_HEADER_LEN;
        if start + len > self.buf.len() {
            return self.stop();
        }

        self.pos = start + len;
        Some(TlvRecord {
            tag,
            value: &self.buf[start..start + len],
        })
    }
}

/// Collect all readable records and the truncation offset, if any
pub fn parse_records(payload: &[u8]) -> (Vec<TlvRecord<'_>>, Option<usize>) {
    let mut reader = TlvReader::new(payload);
    let records: Vec<_> = reader.by_ref().collect();
    (records, reader.truncated_at())
}

/// Append one record to `out`
pub fn put_record(out: &mut Vec<u8>, tag: u8, value: &[u8]) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        NeptunError::InvalidParameter(format!(
            "TLV 0x{:02X} value of {} bytes is too long",
            tag,
            value.len()
        ))
    })?;
    out.put_u8(tag);
    out.put_u16(len);
    out.put_slice(value);
    Ok(())
}

/// Encode records back to back
pub fn encode_records(records: &[TlvRecord<'_>]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(records.iter().map(TlvRecord::encoded_len).sum());
    for record in records {
        put_record(&mut out, record.tag, record.value)?;
    }
    Ok(out)
}
