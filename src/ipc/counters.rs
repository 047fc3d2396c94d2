//! Reader for the driver's counters, exposed through the CnC file.
//!
//! Counters are split across two regions: fixed-stride metadata records
//! describing each counter, and one cache-line-aligned 64-bit value slot
//! per counter. The driver allocates counters densely, so iteration stops
//! at the first unused record. Labels are US-ASCII.

use std::sync::Arc;

use crate::cnc::mapped::CncFile;
use crate::ipc::region::Region;

/// Stride of one metadata record.
pub const METADATA_RECORD_LENGTH: usize = 128;

/// Stride of one value slot (a cache line holding a single `i64`).
pub const COUNTER_LENGTH: usize = 64;

/// Metadata state: the record has never been allocated. Iteration stops here.
pub const RECORD_UNUSED: i32 = 0;

/// Metadata state: the counter is live.
pub const RECORD_ALLOCATED: i32 = 1;

/// Metadata state: the counter was freed and may be reused.
pub const RECORD_RECLAIMED: i32 = -1;

/// Offset of the state field within a metadata record.
pub const STATE_OFFSET: usize = 0;

/// Offset of the type-id field within a metadata record.
pub const TYPE_ID_OFFSET: usize = 4;

/// Offset of the label length within a metadata record.
pub const LABEL_LENGTH_OFFSET: usize = 8;

/// Offset of the label bytes within a metadata record.
pub const LABEL_OFFSET: usize = 12;

/// Maximum label length in bytes.
pub const MAX_LABEL_LENGTH: usize = METADATA_RECORD_LENGTH - LABEL_OFFSET;

/// Read-only view of the driver's counters.
///
/// Constructed lazily per caller; lifetime is tied to the mapped CnC file
/// through the held `Arc`.
pub struct CountersReader {
    // Keeps the mapping alive for the lifetime of this handle.
    _mem: Arc<CncFile>,
    metadata: Region,
    values: Region,
}

impl CountersReader {
    /// Wraps the counters metadata and values regions.
    #[must_use]
    pub fn new(mem: Arc<CncFile>, metadata: Region, values: Region) -> Self {
        Self {
            _mem: mem,
            metadata,
            values,
        }
    }

    /// Highest counter id the values region can hold, exclusive.
    #[must_use]
    pub fn max_counter_id(&self) -> i32 {
        (self.values.len() / COUNTER_LENGTH) as i32
    }

    /// Current value of the counter.
    ///
    /// # Panics
    ///
    /// Panics if `counter_id` is outside `0..max_counter_id()`.
    #[must_use]
    pub fn counter_value(&self, counter_id: i32) -> i64 {
        self.values
            .get_i64_volatile(counter_id as usize * COUNTER_LENGTH)
    }

    /// Allocation state of the counter's metadata record.
    ///
    /// # Panics
    ///
    /// Panics if the metadata region does not cover `counter_id`.
    #[must_use]
    pub fn counter_state(&self, counter_id: i32) -> i32 {
        self.metadata
            .get_i32_volatile(counter_id as usize * METADATA_RECORD_LENGTH + STATE_OFFSET)
    }

    /// Label of the counter. Non-ASCII bytes are replaced with `?`.
    ///
    /// # Panics
    ///
    /// Panics if the metadata region does not cover `counter_id`.
    #[must_use]
    pub fn label(&self, counter_id: i32) -> String {
        let record = counter_id as usize * METADATA_RECORD_LENGTH;
        let length = self.metadata.get_i32(record + LABEL_LENGTH_OFFSET);
        let length = (length.max(0) as usize).min(MAX_LABEL_LENGTH);

        let mut bytes = vec![0u8; length];
        self.metadata.get_bytes(record + LABEL_OFFSET, &mut bytes);
        bytes
            .iter()
            .map(|&b| if b.is_ascii() { b as char } else { '?' })
            .collect()
    }

    /// Visits every allocated counter as `(counter_id, type_id, label)`.
    ///
    /// Stops at the first unused record; reclaimed records are skipped.
    pub fn for_each(&self, handler: &mut dyn FnMut(i32, i32, &str)) {
        let record_count = self.metadata.len() / METADATA_RECORD_LENGTH;
        let value_count = self.values.len() / COUNTER_LENGTH;

        for id in 0..record_count.min(value_count) {
            let state = self
                .metadata
                .get_i32_volatile(id * METADATA_RECORD_LENGTH + STATE_OFFSET);
            match state {
                RECORD_UNUSED => break,
                RECORD_ALLOCATED => {
                    let type_id = self
                        .metadata
                        .get_i32(id * METADATA_RECORD_LENGTH + TYPE_ID_OFFSET);
                    let label = self.label(id as i32);
                    handler(id as i32, type_id, &label);
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_record(metadata: Region, id: usize, state: i32, type_id: i32, label: &str) {
        let record = id * METADATA_RECORD_LENGTH;
        metadata.put_i32(record + TYPE_ID_OFFSET, type_id);
        metadata.put_i32(record + LABEL_LENGTH_OFFSET, label.len() as i32);
        metadata.put_bytes(record + LABEL_OFFSET, label.as_bytes());
        metadata.put_i32_ordered(record + STATE_OFFSET, state);
    }

    fn reader(records: usize) -> (TempDir, CountersReader) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counters.dat");
        let metadata_len = records * METADATA_RECORD_LENGTH;
        let values_len = records * COUNTER_LENGTH;
        let file = Arc::new(CncFile::create(&path, metadata_len + values_len).unwrap());
        let metadata = file.region().slice(0, metadata_len);
        let values = file.region().slice(metadata_len, values_len);
        (dir, CountersReader::new(file, metadata, values))
    }

    #[test]
    fn reads_values_and_labels() {
        let (_dir, reader) = reader(8);
        write_record(reader.metadata, 0, RECORD_ALLOCATED, 3, "bytes-sent");
        reader.values.put_i64_ordered(0, 42);

        assert_eq!(reader.counter_value(0), 42);
        assert_eq!(reader.counter_state(0), RECORD_ALLOCATED);
        assert_eq!(reader.label(0), "bytes-sent");
        assert_eq!(reader.max_counter_id(), 8);
    }

    #[test]
    fn for_each_skips_reclaimed_and_stops_at_unused() {
        let (_dir, reader) = reader(8);
        write_record(reader.metadata, 0, RECORD_ALLOCATED, 1, "first");
        write_record(reader.metadata, 1, RECORD_RECLAIMED, 2, "gone");
        write_record(reader.metadata, 2, RECORD_ALLOCATED, 3, "third");
        // Record 3 left unused; record 4 allocated but unreachable.
        write_record(reader.metadata, 4, RECORD_ALLOCATED, 5, "orphan");

        let mut seen = Vec::new();
        reader.for_each(&mut |id, type_id, label| {
            seen.push((id, type_id, label.to_string()));
        });

        assert_eq!(
            seen,
            vec![(0, 1, "first".to_string()), (2, 3, "third".to_string())]
        );
    }

    #[test]
    fn label_clamps_bogus_length() {
        let (_dir, reader) = reader(2);
        let record = 0;
        reader.metadata.put_i32(record + LABEL_LENGTH_OFFSET, -5);
        assert_eq!(reader.label(0), "");

        reader.metadata.put_i32(record + LABEL_LENGTH_OFFSET, 10_000);
        assert_eq!(reader.label(0).len(), MAX_LABEL_LENGTH);
    }
}
