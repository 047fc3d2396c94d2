//! Many-producer/one-consumer command ring over the CnC to-driver region.
//!
//! Records are length-prefixed byte blobs with an 8-byte header:
//!
//! ```text
//! 0        4        8
//! | length | type   | payload ... padded to 8 bytes
//! ```
//!
//! Producers reserve space by CAS on the tail position and publish by a
//! release store of the positive record length; a record whose length reads
//! `<= 0` is empty or still being written. When a record does not fit in the
//! space before the buffer end, a padding record (`type == -1`) fills the
//! gap and the record starts back at offset zero. The consumer zeroes what
//! it consumed before advancing the head so producers always claim cleared
//! memory.
//!
//! A trailer after the data capacity carries one field per cache line:
//! tail position, cached head, head position, the driver-wide correlation
//! counter, and the consumer (driver) heartbeat timestamp.

use std::sync::Arc;

use crate::cnc::mapped::CncFile;
use crate::error::{ClientError, Result};
use crate::ipc::region::Region;

/// Bytes of `{length, type}` prefix on every record.
pub const RECORD_HEADER_LENGTH: usize = 8;

/// Records are padded to this alignment.
pub const RECORD_ALIGNMENT: usize = 8;

/// Message type of a padding record inserted before a buffer wrap.
pub const PADDING_MSG_TYPE: i32 = -1;

/// Trailer bytes after the data capacity: five fields, one cache line each.
pub const RING_TRAILER_LENGTH: usize = 320;

const TAIL_POSITION_OFFSET: usize = 0;
const HEAD_CACHE_POSITION_OFFSET: usize = 64;
const HEAD_POSITION_OFFSET: usize = 128;
const CORRELATION_COUNTER_OFFSET: usize = 192;
const CONSUMER_HEARTBEAT_OFFSET: usize = 256;

#[inline]
const fn align_record(length: usize) -> usize {
    (length + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
}

#[inline]
const fn length_offset(record_index: usize) -> usize {
    record_index
}

#[inline]
const fn type_offset(record_index: usize) -> usize {
    record_index + 4
}

/// Handle to the many-producer/one-consumer ring inside the CnC file.
///
/// Any number of producer handles may write concurrently. Reading requires
/// `&mut self` and there must be exactly one consumer of the ring across
/// all processes (for the CnC to-driver ring, that is the driver).
#[derive(Clone)]
pub struct CommandRing {
    // Keeps the mapping alive for the lifetime of this handle.
    _mem: Arc<CncFile>,
    buf: Region,
    capacity: usize,
    max_msg_length: usize,
}

impl CommandRing {
    /// Wraps the given region, which must be `capacity + trailer` bytes
    /// with a power-of-two capacity.
    ///
    /// # Errors
    ///
    /// [`ClientError::Cnc`] if the region is too short or the implied
    /// capacity is not a power of two.
    pub fn new(mem: Arc<CncFile>, buf: Region) -> Result<Self> {
        let total = buf.len();
        if total <= RING_TRAILER_LENGTH {
            return Err(ClientError::Cnc(format!(
                "to-driver buffer of {total} bytes cannot hold the ring trailer"
            )));
        }
        let capacity = total - RING_TRAILER_LENGTH;
        if !capacity.is_power_of_two() {
            return Err(ClientError::Cnc(format!(
                "to-driver ring capacity must be a power of two, got {capacity}"
            )));
        }

        Ok(Self {
            _mem: mem,
            buf,
            capacity,
            max_msg_length: capacity / 8,
        })
    }

    /// Data capacity in bytes, excluding the trailer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest payload accepted by [`CommandRing::write`].
    #[must_use]
    pub fn max_msg_length(&self) -> usize {
        self.max_msg_length - RECORD_HEADER_LENGTH
    }

    /// Writes one record. Lock-free; safe from any number of producers.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Backpressure`] if the ring has no space; transient
    /// - [`ClientError::Protocol`] if `msg_type` is not positive or the
    ///   payload exceeds [`CommandRing::max_msg_length`]
    pub fn write(&self, msg_type: i32, payload: &[u8]) -> Result<()> {
        if msg_type < 1 {
            return Err(ClientError::Protocol(format!(
                "message type must be positive, got {msg_type}"
            )));
        }
        let record_length = payload.len() + RECORD_HEADER_LENGTH;
        if record_length > self.max_msg_length {
            return Err(ClientError::Protocol(format!(
                "payload of {} bytes exceeds max of {}",
                payload.len(),
                self.max_msg_length()
            )));
        }

        let record_index = self.claim(align_record(record_length))?;

        // Negative length marks the record in-flight until the final
        // release store publishes it.
        self.buf
            .put_i32_ordered(length_offset(record_index), -(record_length as i32));
        self.buf.put_i32(type_offset(record_index), msg_type);
        self.buf
            .put_bytes(record_index + RECORD_HEADER_LENGTH, payload);
        self.buf
            .put_i32_ordered(length_offset(record_index), record_length as i32);

        Ok(())
    }

    /// Reserves `required` bytes, inserting a padding record when the claim
    /// would straddle the buffer end. Returns the record index.
    fn claim(&self, required: usize) -> Result<usize> {
        let mask = (self.capacity - 1) as i64;
        let mut head = self.buf.get_i64(HEAD_CACHE_POSITION_OFFSET + self.capacity);

        loop {
            let tail = self.buf.get_i64_volatile(TAIL_POSITION_OFFSET + self.capacity);
            let available = self.capacity as i64 - (tail - head);

            if (required as i64) > available {
                head = self.buf.get_i64_volatile(HEAD_POSITION_OFFSET + self.capacity);
                if (required as i64) > self.capacity as i64 - (tail - head) {
                    return Err(ClientError::Backpressure);
                }
                self.buf
                    .put_i64_ordered(HEAD_CACHE_POSITION_OFFSET + self.capacity, head);
            }

            let tail_index = (tail & mask) as usize;
            let to_end = self.capacity - tail_index;
            let mut padding = 0usize;

            if required > to_end {
                // Wrapping: the record goes at offset zero, so the space up
                // to the head index must also be free.
                let mut head_index = (head & mask) as usize;
                if required > head_index {
                    head = self.buf.get_i64_volatile(HEAD_POSITION_OFFSET + self.capacity);
                    head_index = (head & mask) as usize;
                    if required > head_index {
                        return Err(ClientError::Backpressure);
                    }
                    self.buf
                        .put_i64_ordered(HEAD_CACHE_POSITION_OFFSET + self.capacity, head);
                }
                padding = to_end;
            }

            if self.buf.compare_and_set_i64(
                TAIL_POSITION_OFFSET + self.capacity,
                tail,
                tail + (required + padding) as i64,
            ) {
                return Ok(if padding != 0 {
                    self.buf.put_i32(type_offset(tail_index), PADDING_MSG_TYPE);
                    self.buf
                        .put_i32_ordered(length_offset(tail_index), padding as i32);
                    0
                } else {
                    tail_index
                });
            }
            // CAS lost to another producer; retry with a fresh tail.
        }
    }

    /// Reads up to `message_limit` records, invoking `handler` with the
    /// message type and payload of each.
    ///
    /// Single consumer only: this is the driver end of the CnC ring and is
    /// exercised by fixtures and tests in this crate.
    pub fn read(&mut self, handler: &mut dyn FnMut(i32, &[u8]), message_limit: usize) -> usize {
        let mask = (self.capacity - 1) as i64;
        let head = self.buf.get_i64(HEAD_POSITION_OFFSET + self.capacity);
        let head_index = (head & mask) as usize;
        let contiguous = self.capacity - head_index;

        let mut bytes_read = 0usize;
        let mut messages = 0usize;
        let mut scratch = Vec::new();

        while bytes_read < contiguous && messages < message_limit {
            let record_index = head_index + bytes_read;
            let record_length = self.buf.get_i32_volatile(length_offset(record_index));
            if record_length <= 0 {
                break;
            }

            bytes_read += align_record(record_length as usize);

            let msg_type = self.buf.get_i32(type_offset(record_index));
            if msg_type == PADDING_MSG_TYPE {
                continue;
            }

            let payload_length = record_length as usize - RECORD_HEADER_LENGTH;
            scratch.resize(payload_length, 0);
            self.buf
                .get_bytes(record_index + RECORD_HEADER_LENGTH, &mut scratch);
            handler(msg_type, &scratch);
            messages += 1;
        }

        if bytes_read > 0 {
            // Clear consumed space before releasing it so producers always
            // claim zeroed memory.
            self.buf.set_memory(head_index, bytes_read, 0);
            self.buf
                .put_i64_ordered(HEAD_POSITION_OFFSET + self.capacity, head + bytes_read as i64);
        }

        messages
    }

    /// Allocates the next driver-wide correlation id.
    ///
    /// The counter lives in the shared trailer, so ids are unique across
    /// every client attached to the same driver.
    pub fn next_correlation_id(&self) -> i64 {
        self.buf
            .get_and_add_i64(CORRELATION_COUNTER_OFFSET + self.capacity, 1)
    }

    /// Timestamp (epoch ms) the consumer last proved liveness at.
    #[must_use]
    pub fn consumer_heartbeat_time(&self) -> i64 {
        self.buf
            .get_i64_volatile(CONSUMER_HEARTBEAT_OFFSET + self.capacity)
    }

    /// Publishes the consumer heartbeat. Driver-end operation, used by
    /// fixtures and tests.
    pub fn update_consumer_heartbeat(&self, time_ms: i64) {
        self.buf
            .put_i64_ordered(CONSUMER_HEARTBEAT_OFFSET + self.capacity, time_ms);
    }
}

impl std::fmt::Debug for CommandRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRing")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    fn ring(capacity: usize) -> (TempDir, CommandRing) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ring.dat");
        let file = Arc::new(CncFile::create(&path, capacity + RING_TRAILER_LENGTH).unwrap());
        let region = file.region();
        let ring = CommandRing::new(file, region).unwrap();
        (dir, ring)
    }

    #[test]
    fn rejects_non_power_of_two_capacity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ring.dat");
        let file = Arc::new(CncFile::create(&path, 1000 + RING_TRAILER_LENGTH).unwrap());
        let region = file.region();
        assert!(matches!(
            CommandRing::new(file, region),
            Err(ClientError::Cnc(_))
        ));
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (_dir, mut ring) = ring(1024);

        ring.write(7, b"first").unwrap();
        ring.write(9, b"second message").unwrap();

        let mut seen = Vec::new();
        let count = ring.read(&mut |t, p| seen.push((t, p.to_vec())), 10);

        assert_eq!(count, 2);
        assert_eq!(seen[0], (7, b"first".to_vec()));
        assert_eq!(seen[1], (9, b"second message".to_vec()));
    }

    #[test]
    fn read_honours_message_limit() {
        let (_dir, mut ring) = ring(1024);
        for _ in 0..5 {
            ring.write(1, b"x").unwrap();
        }

        let mut seen = 0;
        assert_eq!(ring.read(&mut |_, _| seen += 1, 3), 3);
        assert_eq!(ring.read(&mut |_, _| seen += 1, 10), 2);
        assert_eq!(seen, 5);
    }

    #[test]
    fn backpressure_when_full_then_recovers() {
        let (_dir, mut ring) = ring(1024);
        let payload = [0u8; 120];

        let mut written = 0;
        loop {
            match ring.write(1, &payload) {
                Ok(()) => written += 1,
                Err(ClientError::Backpressure) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(written, 1024 / 128);

        let drained = ring.read(&mut |_, _| {}, usize::MAX);
        assert_eq!(drained, written);
        assert!(ring.write(1, &payload).is_ok());
    }

    #[test]
    fn wraps_with_padding_preserving_order() {
        let (_dir, mut ring) = ring(512);

        // Uneven sizes force records to straddle the buffer end repeatedly.
        let mut expected = Vec::new();
        for round in 0u8..40 {
            let payload = vec![round; 24 + (round as usize % 5) * 8];
            ring.write(i32::from(round) + 1, &payload).unwrap();
            expected.push((i32::from(round) + 1, payload));

            if round % 3 == 2 {
                let mut seen = Vec::new();
                ring.read(&mut |t, p| seen.push((t, p.to_vec())), usize::MAX);
                let drained: Vec<_> = expected.drain(..seen.len()).collect();
                assert_eq!(seen, drained);
            }
        }
        let mut seen = Vec::new();
        ring.read(&mut |t, p| seen.push((t, p.to_vec())), usize::MAX);
        assert_eq!(seen, expected);
    }

    #[test]
    fn rejects_oversized_and_invalid_messages() {
        let (_dir, ring) = ring(1024);
        let oversized = vec![0u8; ring.max_msg_length() + 1];
        assert!(matches!(
            ring.write(1, &oversized),
            Err(ClientError::Protocol(_))
        ));
        assert!(matches!(ring.write(0, b"x"), Err(ClientError::Protocol(_))));
        assert!(matches!(
            ring.write(PADDING_MSG_TYPE, b"x"),
            Err(ClientError::Protocol(_))
        ));
    }

    #[test]
    fn correlation_ids_are_monotonic_across_handles() {
        let (_dir, ring) = ring(1024);
        let other = ring.clone();

        let a = ring.next_correlation_id();
        let b = other.next_correlation_id();
        let c = ring.next_correlation_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn heartbeat_roundtrip() {
        let (_dir, ring) = ring(1024);
        assert_eq!(ring.consumer_heartbeat_time(), 0);
        ring.update_consumer_heartbeat(1_234_567);
        assert_eq!(ring.consumer_heartbeat_time(), 1_234_567);
    }

    #[test]
    fn concurrent_producers_deliver_every_record() {
        let (_dir, ring) = ring(4096);
        let num_producers = 4u64;
        let per_producer = 100u64;

        let mut consumer = ring.clone();
        let mut handles = vec![];
        for p in 0..num_producers {
            let producer = ring.clone();
            handles.push(thread::spawn(move || {
                for i in 0..per_producer {
                    let value = p * 1_000 + i;
                    loop {
                        match producer.write(1, &value.to_le_bytes()) {
                            Ok(()) => break,
                            Err(ClientError::Backpressure) => thread::yield_now(),
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                }
            }));
        }

        let mut items = Vec::new();
        while items.len() < (num_producers * per_producer) as usize {
            ring_read_into(&mut consumer, &mut items);
            thread::yield_now();
        }
        for h in handles {
            h.join().unwrap();
        }

        items.sort_unstable();
        for p in 0..num_producers {
            for i in 0..per_producer {
                assert!(items.binary_search(&(p * 1_000 + i)).is_ok());
            }
        }
    }

    fn ring_read_into(ring: &mut CommandRing, items: &mut Vec<u64>) {
        ring.read(
            &mut |_, payload| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(payload);
                items.push(u64::from_le_bytes(bytes));
            },
            usize::MAX,
        );
    }
}
