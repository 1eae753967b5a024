//! Recording file: a framed stream of samples with device metadata.
//!
//! Every item uses the 8-byte record header. A file starts with a version
//! record, a device info record and a CPU/GPU timestamp correlation, then
//! carries samples and loss markers in drain order.

use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::debug;

use crate::oa::delta::Accumulator;
use crate::oa::devinfo::DeviceInfo;
use crate::oa::drain::Pairing;
use crate::oa::format::{lookup_id, FormatDescriptor, FormatId, HardwareFamily};
use crate::oa::record::{RecordHeader, RecordType, RECORD_HEADER_SIZE};
use crate::oa::report::{read_u32_le, read_u64_le, ReportView};

/// Recording format version.
pub const RECORDING_VERSION: u32 = 1;

pub const RECORD_TYPE_VERSION: u32 = 1 << 16;
pub const RECORD_TYPE_DEVICE_INFO: u32 = RECORD_TYPE_VERSION + 1;
pub const RECORD_TYPE_TIMESTAMP_CORRELATION: u32 = RECORD_TYPE_VERSION + 3;

const VERSION_PAYLOAD: usize = 8;
const METRIC_SET_NAME_LEN: usize = 256;
const METRIC_SET_UUID_LEN: usize = 40;
const DEVICE_INFO_PAYLOAD: usize = 8 + 4 * 7 + METRIC_SET_NAME_LEN + METRIC_SET_UUID_LEN + 4;
const CORRELATION_PAYLOAD: usize = 16;

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("recording I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("record at offset {offset} truncated")]
    Truncated { offset: u64 },

    #[error("unknown record type {raw:#x} at offset {offset}")]
    UnknownType { raw: u32, offset: u64 },

    #[error("record type {raw:#x} at offset {offset} has size {size}, expected {expected}")]
    BadSize {
        raw: u32,
        offset: u64,
        size: usize,
        expected: usize,
    },

    #[error("recording does not start with a version record")]
    MissingVersion,

    #[error("unsupported recording version {0}")]
    UnsupportedVersion(u32),

    #[error("recording has no device info record")]
    MissingDeviceInfo,

    #[error("recording uses format {0}, which no supported family defines")]
    UnknownFormat(u32),

    #[error("{field} is longer than {max} bytes")]
    FieldTooLong { field: &'static str, max: usize },
}

/// Device metadata stored at the start of a recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub timestamp_frequency: u64,
    pub device_id: u32,
    pub revision: u32,
    pub gt_min_frequency: u32,
    pub gt_max_frequency: u32,
    pub engine_class: u32,
    pub engine_instance: u32,
    pub oa_format: u32,
    pub metric_set_name: String,
    pub metric_set_uuid: String,
}

impl DeviceRecord {
    pub fn new(info: &DeviceInfo, format: &FormatDescriptor, metric_set_name: &str) -> Self {
        Self {
            timestamp_frequency: info.timestamp_frequency,
            device_id: info.device_id,
            revision: info.revision,
            gt_min_frequency: info.gt_min_frequency_mhz,
            gt_max_frequency: info.gt_max_frequency_mhz,
            engine_class: 0,
            engine_instance: 0,
            oa_format: format.id as u32,
            metric_set_name: metric_set_name.to_string(),
            metric_set_uuid: String::new(),
        }
    }

    fn encode(&self) -> Result<Vec<u8>, RecordingError> {
        let mut out = Vec::with_capacity(DEVICE_INFO_PAYLOAD);
        out.extend_from_slice(&self.timestamp_frequency.to_le_bytes());
        for v in [
            self.device_id,
            self.revision,
            self.gt_min_frequency,
            self.gt_max_frequency,
            self.engine_class,
            self.engine_instance,
            self.oa_format,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        put_cstr(&mut out, "metric_set_name", &self.metric_set_name, METRIC_SET_NAME_LEN)?;
        put_cstr(&mut out, "metric_set_uuid", &self.metric_set_uuid, METRIC_SET_UUID_LEN)?;
        out.extend_from_slice(&0u32.to_le_bytes());
        Ok(out)
    }

    fn decode(data: &[u8]) -> Self {
        let name_off = 8 + 4 * 7;
        let uuid_off = name_off + METRIC_SET_NAME_LEN;
        Self {
            timestamp_frequency: read_u64_le(data, 0),
            device_id: read_u32_le(data, 8),
            revision: read_u32_le(data, 12),
            gt_min_frequency: read_u32_le(data, 16),
            gt_max_frequency: read_u32_le(data, 20),
            engine_class: read_u32_le(data, 24),
            engine_instance: read_u32_le(data, 28),
            oa_format: read_u32_le(data, 32),
            metric_set_name: get_cstr(&data[name_off..uuid_off]),
            metric_set_uuid: get_cstr(&data[uuid_off..uuid_off + METRIC_SET_UUID_LEN]),
        }
    }
}

/// CPU and GPU timestamps taken at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlation {
    pub cpu_timestamp: u64,
    pub gpu_timestamp: u64,
}

/// One decoded recording item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingItem {
    Version(u32),
    DeviceInfo(DeviceRecord),
    Correlation(Correlation),
    Sample(Vec<u8>),
    ReportLost,
    BufferLost,
}

fn put_cstr(
    out: &mut Vec<u8>,
    field: &'static str,
    s: &str,
    len: usize,
) -> Result<(), RecordingError> {
    // Keep room for the terminating NUL.
    if s.len() >= len {
        return Err(RecordingError::FieldTooLong { field, max: len - 1 });
    }
    out.extend_from_slice(s.as_bytes());
    out.resize(out.len() + len - s.len(), 0);
    Ok(())
}

fn get_cstr(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Appends records to a recording.
pub struct RecordingWriter<W: Write> {
    out: W,
    format_size: usize,
    samples: u64,
}

impl<W: Write> RecordingWriter<W> {
    /// Write the version, device info and initial correlation records.
    pub fn new(
        mut out: W,
        device: &DeviceRecord,
        format: &FormatDescriptor,
        correlation: Correlation,
    ) -> Result<Self, RecordingError> {
        let mut version = Vec::with_capacity(VERSION_PAYLOAD);
        version.extend_from_slice(&RECORDING_VERSION.to_le_bytes());
        version.extend_from_slice(&0u32.to_le_bytes());
        write_record(&mut out, RECORD_TYPE_VERSION, &version)?;
        write_record(&mut out, RECORD_TYPE_DEVICE_INFO, &device.encode()?)?;

        let mut writer = Self {
            out,
            format_size: format.size,
            samples: 0,
        };
        writer.write_correlation(correlation)?;
        Ok(writer)
    }

    pub fn write_sample(&mut self, report: &[u8]) -> Result<(), RecordingError> {
        assert_eq!(
            report.len(),
            self.format_size,
            "sample size does not match the recording format"
        );
        write_record(&mut self.out, RecordType::Sample as u32, report)?;
        self.samples += 1;
        Ok(())
    }

    pub fn write_marker(&mut self, record_type: RecordType) -> Result<(), RecordingError> {
        write_record(&mut self.out, record_type as u32, &[])
    }

    pub fn write_correlation(&mut self, c: Correlation) -> Result<(), RecordingError> {
        let mut payload = Vec::with_capacity(CORRELATION_PAYLOAD);
        payload.extend_from_slice(&c.cpu_timestamp.to_le_bytes());
        payload.extend_from_slice(&c.gpu_timestamp.to_le_bytes());
        write_record(&mut self.out, RECORD_TYPE_TIMESTAMP_CORRELATION, &payload)
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Flush and return the underlying writer.
    pub fn finish(mut self) -> Result<W, RecordingError> {
        self.out.flush()?;
        debug!(samples = self.samples, "recording finished");
        Ok(self.out)
    }
}

fn write_record<W: Write>(out: &mut W, record_type: u32, payload: &[u8]) -> Result<(), RecordingError> {
    let header = RecordHeader {
        record_type,
        pad: 0,
        size: (RECORD_HEADER_SIZE + payload.len()) as u16,
    };
    out.write_all(&header.encode())?;
    out.write_all(payload)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Iterates the items of a recording. Iteration ends after the first error.
pub struct RecordingReader<R: Read> {
    input: R,
    offset: u64,
    failed: bool,
}

impl<R: Read> RecordingReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            offset: 0,
            failed: false,
        }
    }

    /// Byte offset just past the last record read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_item(&mut self) -> Result<Option<RecordingItem>, RecordingError> {
        let offset = self.offset;
        let mut raw = [0u8; RECORD_HEADER_SIZE];
        if !read_exact_or_eof(&mut self.input, &mut raw, offset)? {
            return Ok(None);
        }
        let header = RecordHeader::parse(&raw).ok_or(RecordingError::Truncated { offset })?;
        let size = usize::from(header.size);
        if size < RECORD_HEADER_SIZE {
            return Err(RecordingError::BadSize {
                raw: header.record_type,
                offset,
                size,
                expected: RECORD_HEADER_SIZE,
            });
        }

        let mut payload = vec![0u8; size - RECORD_HEADER_SIZE];
        if !payload.is_empty() && !read_exact_or_eof(&mut self.input, &mut payload, offset)? {
            return Err(RecordingError::Truncated { offset });
        }
        self.offset += size as u64;

        let expect = |expected: usize| {
            if payload.len() == expected {
                Ok(())
            } else {
                Err(RecordingError::BadSize {
                    raw: header.record_type,
                    offset,
                    size,
                    expected: RECORD_HEADER_SIZE + expected,
                })
            }
        };

        let item = match header.record_type {
            RECORD_TYPE_VERSION => {
                expect(VERSION_PAYLOAD)?;
                RecordingItem::Version(read_u32_le(&payload, 0))
            }
            RECORD_TYPE_DEVICE_INFO => {
                expect(DEVICE_INFO_PAYLOAD)?;
                RecordingItem::DeviceInfo(DeviceRecord::decode(&payload))
            }
            RECORD_TYPE_TIMESTAMP_CORRELATION => {
                expect(CORRELATION_PAYLOAD)?;
                RecordingItem::Correlation(Correlation {
                    cpu_timestamp: read_u64_le(&payload, 0),
                    gpu_timestamp: read_u64_le(&payload, 8),
                })
            }
            raw => match RecordType::from_u32(raw) {
                Some(RecordType::Sample) => RecordingItem::Sample(payload),
                Some(RecordType::ReportLost) => {
                    expect(0)?;
                    RecordingItem::ReportLost
                }
                Some(RecordType::BufferLost) => {
                    expect(0)?;
                    RecordingItem::BufferLost
                }
                None => return Err(RecordingError::UnknownType { raw, offset }),
            },
        };
        Ok(Some(item))
    }
}

/// Fill `buf`. Returns false on a clean end of input before any byte.
fn read_exact_or_eof<R: Read>(input: &mut R, buf: &mut [u8], offset: u64) -> Result<bool, RecordingError> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(RecordingError::Truncated { offset }),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

impl<R: Read> Iterator for RecordingReader<R> {
    type Item = Result<RecordingItem, RecordingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.read_item().transpose();
        self.failed = matches!(item, Some(Err(_)));
        item
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// Totals computed from a recording.
#[derive(Debug, Clone)]
pub struct ReplaySummary {
    pub device: DeviceRecord,
    pub format: &'static FormatDescriptor,
    pub samples: u64,
    pub report_lost: u64,
    pub buffer_lost: u64,
    pub correlations: u64,
    pub accumulator: Accumulator,
}

/// First family defining format `raw`, with its descriptor.
pub fn format_for_id(raw: u32) -> Option<(HardwareFamily, &'static FormatDescriptor)> {
    let id = FormatId::from_u64(u64::from(raw))?;
    HardwareFamily::all()
        .iter()
        .find_map(|family| lookup_id(*family, id).ok().map(|desc| (*family, desc)))
}

/// Read a recording and accumulate deltas over consecutive samples.
///
/// Loss markers break pairing exactly like a live drain does.
pub fn replay<R: Read>(reader: RecordingReader<R>) -> Result<ReplaySummary, RecordingError> {
    let mut items = reader;
    match items.next().transpose()? {
        Some(RecordingItem::Version(RECORDING_VERSION)) => {}
        Some(RecordingItem::Version(v)) => return Err(RecordingError::UnsupportedVersion(v)),
        _ => return Err(RecordingError::MissingVersion),
    }
    let device = match items.next().transpose()? {
        Some(RecordingItem::DeviceInfo(device)) => device,
        _ => return Err(RecordingError::MissingDeviceInfo),
    };
    let (family, format) =
        format_for_id(device.oa_format).ok_or(RecordingError::UnknownFormat(device.oa_format))?;
    let info = DeviceInfo::for_family(family, 0, device.timestamp_frequency);

    let mut summary = ReplaySummary {
        device,
        format,
        samples: 0,
        report_lost: 0,
        buffer_lost: 0,
        correlations: 0,
        accumulator: Accumulator::new(format, info.timestamp_width()),
    };
    let mut pairing = Pairing::new(false);

    while let Some(item) = items.next() {
        match item? {
            RecordingItem::Sample(bytes) => {
                if bytes.len() != format.size {
                    let size = RECORD_HEADER_SIZE + bytes.len();
                    return Err(RecordingError::BadSize {
                        raw: RecordType::Sample as u32,
                        offset: items.offset() - size as u64,
                        size,
                        expected: RECORD_HEADER_SIZE + format.size,
                    });
                }
                summary.samples += 1;
                let report = ReportView::new(&bytes, format);
                let acc = &mut summary.accumulator;
                pairing.push(&report, |prev, cur| acc.accumulate(prev, cur));
            }
            RecordingItem::ReportLost => {
                summary.report_lost += 1;
                pairing.reset();
            }
            RecordingItem::BufferLost => {
                summary.buffer_lost += 1;
                pairing.reset();
            }
            RecordingItem::Correlation(_) => summary.correlations += 1,
            RecordingItem::Version(_) | RecordingItem::DeviceInfo(_) => {}
        }
    }

    Ok(summary)
}
