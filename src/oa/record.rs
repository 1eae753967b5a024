//! Record framing for bytes drained from a stream.
//!
//! Two transports exist. `Framed` prefixes every record with an 8-byte
//! header (`u32 type`, `u16 pad`, `u16 size`). `Raw` returns bare reports
//! and signals loss out of band through the status query.

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use super::format::FormatDescriptor;
use super::report::{read_u16_le, read_u32_le, ReportView};

/// Record header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 8;

/// Hardware ring size used as the drain sizing reference.
pub const MAX_OA_BUF_SIZE: usize = 16 * 1024 * 1024;

/// Record type tag. Values match the driver's record header types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RecordType {
    Sample = 1,
    ReportLost = 2,
    BufferLost = 3,
}

impl RecordType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sample => "sample",
            Self::ReportLost => "report_lost",
            Self::BufferLost => "buffer_lost",
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Sample),
            2 => Some(Self::ReportLost),
            3 => Some(Self::BufferLost),
            _ => None,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How records are delimited in the bytes returned by a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Framed,
    Raw,
}

impl Transport {
    /// Bytes occupied by one sample record.
    pub const fn record_size(self, format: &FormatDescriptor) -> usize {
        match self {
            Self::Framed => RECORD_HEADER_SIZE + format.size,
            Self::Raw => format.size,
        }
    }

    /// Read buffer large enough to drain a full hardware ring in one pass,
    /// with headroom for reports written during the read.
    pub fn read_buffer_size(self, format: &FormatDescriptor) -> usize {
        if format.size == 0 {
            return 0;
        }
        let reports = MAX_OA_BUF_SIZE / format.size;
        self.record_size(format) * reports * 3 / 2
    }
}

/// Errors from splitting a read buffer into records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record at offset {offset} truncated: {remaining} bytes left")]
    Truncated { offset: usize, remaining: usize },

    #[error("unknown record type {raw} at offset {offset}")]
    UnknownType { raw: u32, offset: usize },

    #[error("{record_type} record at offset {offset} has size {size}, expected {expected}")]
    BadSize {
        record_type: RecordType,
        offset: usize,
        size: usize,
        expected: usize,
    },
}

/// Parsed record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub record_type: u32,
    pub pad: u16,
    pub size: u16,
}

impl RecordHeader {
    pub fn new(record_type: RecordType, payload: usize) -> Self {
        Self {
            record_type: record_type as u32,
            pad: 0,
            size: (RECORD_HEADER_SIZE + payload) as u16,
        }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < RECORD_HEADER_SIZE {
            return None;
        }
        Some(Self {
            record_type: read_u32_le(data, 0),
            pad: read_u16_le(data, 4),
            size: read_u16_le(data, 6),
        })
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut out = [0u8; RECORD_HEADER_SIZE];
        out[..4].copy_from_slice(&self.record_type.to_le_bytes());
        out[4..6].copy_from_slice(&self.pad.to_le_bytes());
        out[6..].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

/// One classified record.
#[derive(Debug, Clone, Copy)]
pub enum Record<'a> {
    Sample(ReportView<'a>),
    ReportLost,
    BufferLost,
}

impl Record<'_> {
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Sample(_) => RecordType::Sample,
            Self::ReportLost => RecordType::ReportLost,
            Self::BufferLost => RecordType::BufferLost,
        }
    }
}

/// Iterator splitting one read's bytes into records, oldest first.
pub struct Records<'a> {
    data: &'a [u8],
    offset: usize,
    format: &'a FormatDescriptor,
    transport: Transport,
    failed: bool,
}

impl<'a> Records<'a> {
    pub fn new(data: &'a [u8], format: &'a FormatDescriptor, transport: Transport) -> Self {
        Self {
            data,
            offset: 0,
            format,
            transport,
            failed: false,
        }
    }

    fn next_framed(&mut self) -> Result<Record<'a>, RecordError> {
        let offset = self.offset;
        let rest = &self.data[offset..];
        let header = RecordHeader::parse(rest).ok_or(RecordError::Truncated {
            offset,
            remaining: rest.len(),
        })?;
        let record_type = RecordType::from_u32(header.record_type).ok_or(
            RecordError::UnknownType {
                raw: header.record_type,
                offset,
            },
        )?;
        let size = usize::from(header.size);
        let expected = match record_type {
            RecordType::Sample => RECORD_HEADER_SIZE + self.format.size,
            RecordType::ReportLost | RecordType::BufferLost => RECORD_HEADER_SIZE,
        };
        if size != expected {
            return Err(RecordError::BadSize {
                record_type,
                offset,
                size,
                expected,
            });
        }
        if rest.len() < size {
            return Err(RecordError::Truncated {
                offset,
                remaining: rest.len(),
            });
        }
        self.offset += size;
        Ok(match record_type {
            RecordType::Sample => {
                Record::Sample(ReportView::new(&rest[RECORD_HEADER_SIZE..size], self.format))
            }
            RecordType::ReportLost => Record::ReportLost,
            RecordType::BufferLost => Record::BufferLost,
        })
    }

    fn next_raw(&mut self) -> Result<Record<'a>, RecordError> {
        let offset = self.offset;
        let rest = &self.data[offset..];
        if rest.len() < self.format.size {
            return Err(RecordError::Truncated {
                offset,
                remaining: rest.len(),
            });
        }
        self.offset += self.format.size;
        Ok(Record::Sample(ReportView::new(rest, self.format)))
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Record<'a>, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }
        let item = match self.transport {
            Transport::Framed => self.next_framed(),
            Transport::Raw => self.next_raw(),
        };
        self.failed = item.is_err();
        Some(item)
    }
}

/// Append one framed sample record to `out`.
pub fn encode_sample(out: &mut Vec<u8>, report: &[u8]) {
    out.extend_from_slice(&RecordHeader::new(RecordType::Sample, report.len()).encode());
    out.extend_from_slice(report);
}

/// Append one framed loss record to `out`.
pub fn encode_marker(out: &mut Vec<u8>, record_type: RecordType) {
    out.extend_from_slice(&RecordHeader::new(record_type, 0).encode());
}
