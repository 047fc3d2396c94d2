//! Single-producer/many-observer broadcast over the CnC to-clients region.
//!
//! The driver transmits length-prefixed records that every attached client
//! observes independently; nobody consumes, so a slow observer is simply
//! lapped and must resynchronise. Records share the `{length, type}` header
//! and padding convention of the command ring. The trailer carries three
//! fields, one cache line each: the tail intent (advanced before a write
//! begins), the tail (advanced after it completes), and the start position
//! of the latest record (where a lapped or new observer joins).
//!
//! Observers must copy a record out and then validate that the transmitter
//! did not overwrite it mid-copy; [`CopyBroadcastReceiver`] packages that
//! sequence.

use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use crate::cnc::mapped::CncFile;
use crate::error::{ClientError, Result};
use crate::ipc::region::Region;

/// Trailer bytes after the data capacity: three fields, one cache line each.
pub const BROADCAST_TRAILER_LENGTH: usize = 192;

const TAIL_INTENT_COUNTER_OFFSET: usize = 0;
const TAIL_COUNTER_OFFSET: usize = 64;
const LATEST_COUNTER_OFFSET: usize = 128;

const RECORD_HEADER_LENGTH: usize = 8;
const RECORD_ALIGNMENT: usize = 8;
const PADDING_MSG_TYPE: i32 = -1;

#[inline]
const fn align_record(length: usize) -> usize {
    (length + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
}

#[inline]
const fn length_offset(record_offset: usize) -> usize {
    record_offset
}

#[inline]
const fn type_offset(record_offset: usize) -> usize {
    record_offset + 4
}

fn check_layout(buf: &Region) -> Result<usize> {
    let total = buf.len();
    if total <= BROADCAST_TRAILER_LENGTH {
        return Err(ClientError::Cnc(format!(
            "to-clients buffer of {total} bytes cannot hold the broadcast trailer"
        )));
    }
    let capacity = total - BROADCAST_TRAILER_LENGTH;
    if !capacity.is_power_of_two() {
        return Err(ClientError::Cnc(format!(
            "to-clients broadcast capacity must be a power of two, got {capacity}"
        )));
    }
    Ok(capacity)
}

/// The transmitting (driver) end of the broadcast.
///
/// Single producer. This end is exercised by fixtures and tests standing in
/// for the driver.
pub struct BroadcastTransmitter {
    // Keeps the mapping alive for the lifetime of this handle.
    _mem: Arc<CncFile>,
    buf: Region,
    capacity: usize,
    max_msg_length: usize,
}

impl BroadcastTransmitter {
    /// Wraps the given region (`capacity + trailer`, power-of-two capacity).
    ///
    /// # Errors
    ///
    /// [`ClientError::Cnc`] on a malformed region.
    pub fn new(mem: Arc<CncFile>, buf: Region) -> Result<Self> {
        let capacity = check_layout(&buf)?;
        Ok(Self {
            _mem: mem,
            buf,
            capacity,
            max_msg_length: capacity / 8,
        })
    }

    /// Broadcasts one record. Never blocks: observers that cannot keep up
    /// are lapped.
    ///
    /// # Errors
    ///
    /// [`ClientError::Protocol`] if `msg_type` is not positive or the
    /// payload exceeds one eighth of the capacity.
    pub fn transmit(&self, msg_type: i32, payload: &[u8]) -> Result<()> {
        if msg_type < 1 {
            return Err(ClientError::Protocol(format!(
                "message type must be positive, got {msg_type}"
            )));
        }
        let record_length = payload.len() + RECORD_HEADER_LENGTH;
        if record_length > self.max_msg_length {
            return Err(ClientError::Protocol(format!(
                "payload of {} bytes exceeds broadcast max of {}",
                payload.len(),
                self.max_msg_length - RECORD_HEADER_LENGTH
            )));
        }

        let mask = (self.capacity - 1) as i64;
        let aligned_length = align_record(record_length);
        let mut tail = self.buf.get_i64(TAIL_COUNTER_OFFSET + self.capacity);
        let mut record_offset = (tail & mask) as usize;
        let to_end = self.capacity - record_offset;

        if aligned_length > to_end {
            // Pad out the rest of the buffer; the record starts at zero.
            self.buf.put_i64_ordered(
                TAIL_INTENT_COUNTER_OFFSET + self.capacity,
                tail + (to_end + aligned_length) as i64,
            );
            self.buf.put_i32(type_offset(record_offset), PADDING_MSG_TYPE);
            self.buf.put_i32(length_offset(record_offset), to_end as i32);
            tail += to_end as i64;
            record_offset = 0;
        } else {
            self.buf.put_i64_ordered(
                TAIL_INTENT_COUNTER_OFFSET + self.capacity,
                tail + aligned_length as i64,
            );
        }

        self.buf
            .put_i32(length_offset(record_offset), record_length as i32);
        self.buf.put_i32(type_offset(record_offset), msg_type);
        self.buf
            .put_bytes(record_offset + RECORD_HEADER_LENGTH, payload);

        self.buf.put_i64(LATEST_COUNTER_OFFSET + self.capacity, tail);
        self.buf.put_i64_ordered(
            TAIL_COUNTER_OFFSET + self.capacity,
            tail + aligned_length as i64,
        );

        Ok(())
    }
}

/// An observer cursor over the broadcast.
///
/// Tracks its own position; a fresh receiver joins at the latest record.
pub struct BroadcastReceiver {
    // Keeps the mapping alive for the lifetime of this handle.
    _mem: Arc<CncFile>,
    buf: Region,
    capacity: usize,
    cursor: i64,
    next_record: i64,
    record_offset: usize,
    lapped_count: u64,
}

impl BroadcastReceiver {
    /// Wraps the given region and joins at the latest record.
    ///
    /// # Errors
    ///
    /// [`ClientError::Cnc`] on a malformed region.
    pub fn new(mem: Arc<CncFile>, buf: Region) -> Result<Self> {
        let capacity = check_layout(&buf)?;
        let latest = buf.get_i64_volatile(LATEST_COUNTER_OFFSET + capacity);
        Ok(Self {
            _mem: mem,
            buf,
            capacity,
            cursor: latest,
            next_record: latest,
            record_offset: (latest & (capacity as i64 - 1)) as usize,
            lapped_count: 0,
        })
    }

    /// Number of times the transmitter has lapped this receiver.
    #[must_use]
    pub fn lapped_count(&self) -> u64 {
        self.lapped_count
    }

    /// Advances to the next record if one is available.
    ///
    /// If the receiver was lapped it resynchronises to the latest record
    /// and increments [`BroadcastReceiver::lapped_count`].
    pub fn receive_next(&mut self) -> bool {
        let mask = (self.capacity - 1) as i64;
        let tail = self.buf.get_i64_volatile(TAIL_COUNTER_OFFSET + self.capacity);
        let mut cursor = self.next_record;

        if tail <= cursor {
            return false;
        }

        if !self.validate_at(cursor) {
            self.lapped_count += 1;
            cursor = self.buf.get_i64(LATEST_COUNTER_OFFSET + self.capacity);
        }

        let mut record_offset = (cursor & mask) as usize;
        self.cursor = cursor;
        self.next_record =
            cursor + align_record(self.buf.get_i32(length_offset(record_offset)) as usize) as i64;

        if self.buf.get_i32(type_offset(record_offset)) == PADDING_MSG_TYPE {
            record_offset = 0;
            self.cursor = self.next_record;
            self.next_record +=
                align_record(self.buf.get_i32(length_offset(0)) as usize) as i64;
        }

        self.record_offset = record_offset;
        true
    }

    /// Message type of the current record.
    #[must_use]
    pub fn msg_type(&self) -> i32 {
        self.buf.get_i32(type_offset(self.record_offset))
    }

    /// Payload length of the current record.
    #[must_use]
    pub fn length(&self) -> usize {
        self.buf.get_i32(length_offset(self.record_offset)) as usize - RECORD_HEADER_LENGTH
    }

    /// Copies the current record's payload into `dst` (which must be sized
    /// to [`BroadcastReceiver::length`]).
    pub fn copy_payload_into(&self, dst: &mut [u8]) {
        self.buf
            .get_bytes(self.record_offset + RECORD_HEADER_LENGTH, dst);
    }

    /// Confirms the record read since the last [`BroadcastReceiver::receive_next`]
    /// was not overwritten while being observed.
    #[must_use]
    pub fn validate(&self) -> bool {
        // Order the payload copy before the tail-intent read.
        fence(Ordering::Acquire);
        self.validate_at(self.cursor)
    }

    fn validate_at(&self, cursor: i64) -> bool {
        cursor + self.capacity as i64
            > self
                .buf
                .get_i64_volatile(TAIL_INTENT_COUNTER_OFFSET + self.capacity)
    }
}

/// Observer that copies each record out before handing it to a handler,
/// so the handler never sees bytes the transmitter may be rewriting.
pub struct CopyBroadcastReceiver {
    receiver: BroadcastReceiver,
    scratch: Vec<u8>,
}

impl CopyBroadcastReceiver {
    /// Wraps a positioned receiver.
    #[must_use]
    pub fn new(receiver: BroadcastReceiver) -> Self {
        Self {
            receiver,
            scratch: Vec::new(),
        }
    }

    /// Drains available records, invoking `handler` with each message type
    /// and a stable copy of its payload. Returns the number delivered.
    ///
    /// # Errors
    ///
    /// [`ClientError::BroadcastLapped`] if the transmitter overran this
    /// receiver; the cursor has already resynchronised to the latest record
    /// and records delivered before the overrun were valid.
    pub fn receive(&mut self, handler: &mut dyn FnMut(i32, &[u8])) -> Result<usize> {
        let mut messages = 0;

        loop {
            let last_seen_lapped = self.receiver.lapped_count();
            if !self.receiver.receive_next() {
                break;
            }
            if last_seen_lapped != self.receiver.lapped_count() {
                return Err(ClientError::BroadcastLapped);
            }

            let msg_type = self.receiver.msg_type();
            let length = self.receiver.length();
            self.scratch.resize(length, 0);
            self.receiver.copy_payload_into(&mut self.scratch);

            if !self.receiver.validate() {
                return Err(ClientError::BroadcastLapped);
            }

            handler(msg_type, &self.scratch);
            messages += 1;
        }

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn broadcast(capacity: usize) -> (TempDir, BroadcastTransmitter, CopyBroadcastReceiver) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broadcast.dat");
        let file =
            Arc::new(CncFile::create(&path, capacity + BROADCAST_TRAILER_LENGTH).unwrap());
        let region = file.region();
        let tx = BroadcastTransmitter::new(Arc::clone(&file), region).unwrap();
        let rx = CopyBroadcastReceiver::new(BroadcastReceiver::new(file, region).unwrap());
        (dir, tx, rx)
    }

    #[test]
    fn transmit_receive_roundtrip() {
        let (_dir, tx, mut rx) = broadcast(1024);

        tx.transmit(5, b"status").unwrap();
        tx.transmit(6, b"another one").unwrap();

        let mut seen = Vec::new();
        let count = rx
            .receive(&mut |t, p| seen.push((t, p.to_vec())))
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(seen[0], (5, b"status".to_vec()));
        assert_eq!(seen[1], (6, b"another one".to_vec()));
    }

    #[test]
    fn wraps_with_padding_preserving_order() {
        let (_dir, tx, mut rx) = broadcast(512);

        for round in 0u8..30 {
            let payload = vec![round; 24 + (round as usize % 5) * 8];
            tx.transmit(i32::from(round) + 1, &payload).unwrap();

            let mut seen = Vec::new();
            rx.receive(&mut |t, p| seen.push((t, p.to_vec()))).unwrap();
            assert_eq!(seen, vec![(i32::from(round) + 1, payload)]);
        }
    }

    #[test]
    fn new_receiver_joins_at_latest_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broadcast.dat");
        let file = Arc::new(CncFile::create(&path, 1024 + BROADCAST_TRAILER_LENGTH).unwrap());
        let region = file.region();
        let tx = BroadcastTransmitter::new(Arc::clone(&file), region).unwrap();

        tx.transmit(1, b"old").unwrap();
        tx.transmit(2, b"latest").unwrap();

        let mut rx =
            CopyBroadcastReceiver::new(BroadcastReceiver::new(file, region).unwrap());
        let mut seen = Vec::new();
        rx.receive(&mut |t, p| seen.push((t, p.to_vec()))).unwrap();

        assert_eq!(seen, vec![(2, b"latest".to_vec())]);
    }

    #[test]
    fn lapped_receiver_errors_then_resynchronises() {
        let (_dir, tx, mut rx) = broadcast(128);

        // Join at position zero, then overrun the whole buffer many times.
        for i in 0..100u64 {
            tx.transmit(1, &i.to_le_bytes()).unwrap();
        }

        let result = rx.receive(&mut |_, _| {});
        assert!(matches!(result, Err(ClientError::BroadcastLapped)));

        // After resync the receiver tracks new transmissions again.
        tx.transmit(2, b"fresh").unwrap();
        let mut seen = Vec::new();
        rx.receive(&mut |t, p| seen.push((t, p.to_vec()))).unwrap();
        assert!(seen.contains(&(2, b"fresh".to_vec())));
    }

    #[test]
    fn rejects_oversized_payload() {
        let (_dir, tx, _rx) = broadcast(1024);
        let oversized = vec![0u8; 1024 / 8];
        assert!(matches!(
            tx.transmit(1, &oversized),
            Err(ClientError::Protocol(_))
        ));
    }
}
