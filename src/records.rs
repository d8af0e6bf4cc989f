//! Record frames read out of the kernel ring buffers.
//!
//! The core routes records without interpreting them: each frame is
//! attributed to its event via the kernel-assigned id and handed to the
//! consumer callback as raw bytes plus the frame header. Just enough of the
//! payload is decoded to find the id and, for exclude_perf, the
//! originating pid.

use std::collections::HashMap;

use plain::Plain;

use crate::attr::*;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordHeader {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}

unsafe impl Plain for RecordHeader {}

pub const RECORD_HEADER_SIZE: usize = 8;

#[derive(Debug)]
pub struct Record {
    pub header: RecordHeader,
    /// Index of the owning event selection within the set.
    pub attr_index: usize,
    /// The whole frame, header included.
    pub data: Vec<u8>,
}

impl Record {
    pub fn record_type(&self) -> u32 {
        self.header.type_
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[RECORD_HEADER_SIZE..]
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_ne_bytes(b.try_into().unwrap()))
}

fn read_u64(buf: &[u8], offset: usize) -> Option<u64> {
    buf.get(offset..offset + 8)
        .map(|b| u64::from_ne_bytes(b.try_into().unwrap()))
}

/// Splits drained ring-buffer bytes into records and attributes each to its
/// event attribute. All attributes in a set share one sample_type, so a
/// single parser instance serves every buffer.
pub struct RecordParser {
    sample_type: u64,
    sample_id_all: bool,
    id_to_attr: HashMap<u64, usize>,
    single_attr: bool,
}

impl RecordParser {
    pub fn new(sample_type: u64, sample_id_all: bool, single_attr: bool) -> Self {
        RecordParser {
            sample_type,
            sample_id_all,
            id_to_attr: HashMap::new(),
            single_attr,
        }
    }

    /// Register the kernel ids belonging to the selection at `attr_index`.
    pub fn add_ids(&mut self, attr_index: usize, ids: &[u64]) {
        for &id in ids {
            self.id_to_attr.insert(id, attr_index);
        }
    }

    /// Resolve a frame to its event selection, or None when the frame
    /// carries no identifier (the caller then falls back to the event that
    /// owns the ring buffer the frame came from).
    fn attr_index_for(&self, header: &RecordHeader, frame: &[u8]) -> Option<usize> {
        if self.single_attr || self.sample_type & PERF_SAMPLE_IDENTIFIER == 0 {
            return None;
        }
        let id = if header.type_ == PERF_RECORD_SAMPLE {
            // The identifier leads the sample payload.
            read_u64(frame, RECORD_HEADER_SIZE)
        } else if self.sample_id_all {
            // For every other record the sample_id trailer ends with the
            // identifier.
            read_u64(frame, frame.len().saturating_sub(8))
        } else {
            None
        };
        id.and_then(|id| self.id_to_attr.get(&id).copied())
    }

    /// Originating pid of a record, where one is recoverable. Used by the
    /// exclude_perf filter at reader-thread ingress.
    pub fn record_pid(&self, record: &Record) -> Option<u32> {
        let payload = record.payload();
        match record.record_type() {
            PERF_RECORD_SAMPLE => {
                if self.sample_type & PERF_SAMPLE_TID == 0 {
                    return None;
                }
                let mut offset = 0;
                if self.sample_type & PERF_SAMPLE_IDENTIFIER != 0 {
                    offset += 8;
                }
                if self.sample_type & PERF_SAMPLE_IP != 0 {
                    offset += 8;
                }
                read_u32(payload, offset)
            }
            PERF_RECORD_MMAP | PERF_RECORD_MMAP2 | PERF_RECORD_COMM | PERF_RECORD_EXIT
            | PERF_RECORD_FORK => read_u32(payload, 0),
            _ => None,
        }
    }

    /// Walk the frames in a drained byte range, handing each to `f`.
    /// Frames without a resolvable identifier are attributed to
    /// `default_attr`. Returns the number of records seen. A truncated
    /// trailing frame stops the walk; full drains never produce one.
    pub fn parse_frames(&self, buf: &[u8], default_attr: usize, mut f: impl FnMut(Record)) -> usize {
        let mut offset = 0;
        let mut count = 0;
        while offset + RECORD_HEADER_SIZE <= buf.len() {
            let mut header = RecordHeader::default();
            plain::copy_from_bytes(&mut header, &buf[offset..offset + RECORD_HEADER_SIZE])
                .expect("header size is fixed");
            let size = header.size as usize;
            if size < RECORD_HEADER_SIZE || offset + size > buf.len() {
                tracing::warn!(
                    "truncated record frame (type {}, size {}) dropped",
                    header.type_,
                    size
                );
                break;
            }
            let frame = &buf[offset..offset + size];
            let attr_index = self.attr_index_for(&header, frame).unwrap_or(default_attr);
            f(Record {
                header,
                attr_index,
                data: frame.to_vec(),
            });
            offset += size;
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_header(buf: &mut Vec<u8>, type_: u32, size: u16) {
        buf.extend_from_slice(&type_.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());
        buf.extend_from_slice(&size.to_ne_bytes());
    }

    fn sample_frame(id: u64, ip: u64, pid: u32, tid: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        push_header(&mut buf, PERF_RECORD_SAMPLE, 8 + 8 + 8 + 8);
        buf.extend_from_slice(&id.to_ne_bytes());
        buf.extend_from_slice(&ip.to_ne_bytes());
        buf.extend_from_slice(&pid.to_ne_bytes());
        buf.extend_from_slice(&tid.to_ne_bytes());
        buf
    }

    fn comm_frame(pid: u32, tid: u32, name: &[u8; 8], trailer_id: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        push_header(&mut buf, PERF_RECORD_COMM, 8 + 8 + 8 + 8);
        buf.extend_from_slice(&pid.to_ne_bytes());
        buf.extend_from_slice(&tid.to_ne_bytes());
        buf.extend_from_slice(name);
        buf.extend_from_slice(&trailer_id.to_ne_bytes());
        buf
    }

    fn parser() -> RecordParser {
        let sample_type =
            PERF_SAMPLE_IDENTIFIER | PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_TIME;
        let mut parser = RecordParser::new(sample_type, true, false);
        parser.add_ids(0, &[100, 101]);
        parser.add_ids(1, &[200]);
        parser
    }

    #[test]
    fn samples_attribute_by_leading_identifier() {
        let parser = parser();
        let mut buf = sample_frame(200, 0xdead, 42, 43);
        buf.extend_from_slice(&sample_frame(101, 0xbeef, 1, 1));

        let mut records = Vec::new();
        let n = parser.parse_frames(&buf, 0, |r| records.push(r));
        assert_eq!(n, 2);
        assert_eq!(records[0].attr_index, 1);
        assert_eq!(records[1].attr_index, 0);
        assert_eq!(records[0].record_type(), PERF_RECORD_SAMPLE);
    }

    #[test]
    fn sideband_attributes_by_trailing_identifier() {
        let parser = parser();
        let buf = comm_frame(7, 7, b"worker\0\0", 200);
        let mut records = Vec::new();
        parser.parse_frames(&buf, 0, |r| records.push(r));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attr_index, 1);
    }

    #[test]
    fn pid_extraction_for_samples_and_sideband() {
        let parser = parser();
        let mut records = Vec::new();
        let mut buf = sample_frame(100, 0, 1234, 5678);
        buf.extend_from_slice(&comm_frame(4321, 4321, b"main\0\0\0\0", 100));
        parser.parse_frames(&buf, 0, |r| records.push(r));
        assert_eq!(parser.record_pid(&records[0]), Some(1234));
        assert_eq!(parser.record_pid(&records[1]), Some(4321));
    }

    #[test]
    fn truncated_frame_stops_the_walk() {
        let parser = parser();
        let mut buf = sample_frame(100, 0, 1, 1);
        // A header claiming more bytes than the buffer holds.
        push_header(&mut buf, PERF_RECORD_SAMPLE, 64);
        let n = parser.parse_frames(&buf, 0, |_| {});
        assert_eq!(n, 1);
    }

    #[test]
    fn single_attr_needs_no_identifier() {
        let parser = RecordParser::new(PERF_SAMPLE_IP | PERF_SAMPLE_TID, true, true);
        let mut buf = Vec::new();
        push_header(&mut buf, PERF_RECORD_SAMPLE, 8 + 8 + 8);
        buf.extend_from_slice(&0xabcdu64.to_ne_bytes());
        buf.extend_from_slice(&9u32.to_ne_bytes());
        buf.extend_from_slice(&9u32.to_ne_bytes());
        let mut records = Vec::new();
        parser.parse_frames(&buf, 0, |r| records.push(r));
        assert_eq!(records[0].attr_index, 0);
        assert_eq!(parser.record_pid(&records[0]), Some(9));
    }
}
