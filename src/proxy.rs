//! Command encoder writing client requests onto the driver ring.

use crate::command::{self, DriverCommand};
use crate::error::Result;
use crate::ipc::ring::CommandRing;

/// Encodes and publishes commands to the driver.
///
/// Every command carries this client's id and a correlation id freshly
/// allocated from the driver-wide counter. Writes never block: a full ring
/// surfaces as [`crate::ClientError::Backpressure`] for the caller to retry
/// on its next tick.
pub struct DriverProxy {
    to_driver: CommandRing,
    client_id: i64,
    encode_buf: Vec<u8>,
}

impl DriverProxy {
    /// Creates a proxy for the given client id.
    #[must_use]
    pub fn new(to_driver: CommandRing, client_id: i64) -> Self {
        Self {
            to_driver,
            client_id,
            encode_buf: Vec::with_capacity(256),
        }
    }

    /// The client id stamped on every outbound command.
    #[must_use]
    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    fn send(&mut self, command: &DriverCommand) -> Result<()> {
        let msg_type = command::encode_command(&mut self.encode_buf, command);
        self.to_driver.write(msg_type, &self.encode_buf)
    }

    /// Requests a new publication. Returns the correlation id to await.
    ///
    /// # Errors
    ///
    /// [`crate::ClientError::Backpressure`] if the ring is full.
    pub fn add_publication(&mut self, channel: &str, stream_id: i32) -> Result<i64> {
        let correlation_id = self.to_driver.next_correlation_id();
        self.send(&DriverCommand::AddPublication {
            client_id: self.client_id,
            correlation_id,
            stream_id,
            channel: channel.to_string(),
        })?;
        Ok(correlation_id)
    }

    /// Requests a new exclusive publication. Returns the correlation id.
    ///
    /// # Errors
    ///
    /// [`crate::ClientError::Backpressure`] if the ring is full.
    pub fn add_exclusive_publication(&mut self, channel: &str, stream_id: i32) -> Result<i64> {
        let correlation_id = self.to_driver.next_correlation_id();
        self.send(&DriverCommand::AddExclusivePublication {
            client_id: self.client_id,
            correlation_id,
            stream_id,
            channel: channel.to_string(),
        })?;
        Ok(correlation_id)
    }

    /// Requests removal of a publication. Returns the correlation id.
    ///
    /// # Errors
    ///
    /// [`crate::ClientError::Backpressure`] if the ring is full.
    pub fn remove_publication(&mut self, registration_id: i64) -> Result<i64> {
        let correlation_id = self.to_driver.next_correlation_id();
        self.send(&DriverCommand::RemovePublication {
            client_id: self.client_id,
            correlation_id,
            registration_id,
        })?;
        Ok(correlation_id)
    }

    /// Requests a new subscription. Returns the correlation id.
    ///
    /// # Errors
    ///
    /// [`crate::ClientError::Backpressure`] if the ring is full.
    pub fn add_subscription(&mut self, channel: &str, stream_id: i32) -> Result<i64> {
        let correlation_id = self.to_driver.next_correlation_id();
        self.send(&DriverCommand::AddSubscription {
            client_id: self.client_id,
            correlation_id,
            stream_id,
            channel: channel.to_string(),
        })?;
        Ok(correlation_id)
    }

    /// Requests removal of a subscription. Returns the correlation id.
    ///
    /// # Errors
    ///
    /// [`crate::ClientError::Backpressure`] if the ring is full.
    pub fn remove_subscription(&mut self, registration_id: i64) -> Result<i64> {
        let correlation_id = self.to_driver.next_correlation_id();
        self.send(&DriverCommand::RemoveSubscription {
            client_id: self.client_id,
            correlation_id,
            registration_id,
        })?;
        Ok(correlation_id)
    }

    /// Sends a keepalive proving this client is alive.
    ///
    /// # Errors
    ///
    /// [`crate::ClientError::Backpressure`] if the ring is full; the
    /// conductor retries on its next duty cycle.
    pub fn send_client_keepalive(&mut self) -> Result<()> {
        self.send(&DriverCommand::Keepalive {
            client_id: self.client_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cnc::mapped::CncFile;
    use crate::command::{ADD_PUBLICATION, decode_command};
    use crate::ipc::ring::RING_TRAILER_LENGTH;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn proxy() -> (TempDir, DriverProxy, CommandRing) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ring.dat");
        let file = Arc::new(CncFile::create(&path, 1024 + RING_TRAILER_LENGTH).unwrap());
        let region = file.region();
        let ring = CommandRing::new(file, region).unwrap();
        let client_id = ring.next_correlation_id();
        (dir, DriverProxy::new(ring.clone(), client_id), ring)
    }

    #[test]
    fn commands_carry_client_and_fresh_correlation_ids() {
        let (_dir, mut proxy, mut ring) = proxy();
        let client_id = proxy.client_id();

        let first = proxy.add_publication("ipc://a", 1).unwrap();
        let second = proxy.add_subscription("ipc://b", 2).unwrap();
        assert!(second > first);

        let mut seen = Vec::new();
        ring.read(
            &mut |t, bytes| seen.push(decode_command(t, bytes).unwrap()),
            10,
        );

        assert_eq!(
            seen,
            vec![
                DriverCommand::AddPublication {
                    client_id,
                    correlation_id: first,
                    stream_id: 1,
                    channel: "ipc://a".to_string(),
                },
                DriverCommand::AddSubscription {
                    client_id,
                    correlation_id: second,
                    stream_id: 2,
                    channel: "ipc://b".to_string(),
                },
            ]
        );
    }

    #[test]
    fn keepalive_is_tagged_with_client_id() {
        let (_dir, mut proxy, mut ring) = proxy();
        proxy.send_client_keepalive().unwrap();

        let mut seen = Vec::new();
        ring.read(
            &mut |t, bytes| seen.push(decode_command(t, bytes).unwrap()),
            10,
        );
        assert_eq!(
            seen,
            vec![DriverCommand::Keepalive {
                client_id: proxy.client_id()
            }]
        );
    }

    #[test]
    fn first_command_type_on_ring_is_publication() {
        let (_dir, mut proxy, mut ring) = proxy();
        proxy.add_publication("ipc://a", 1).unwrap();

        let mut types = Vec::new();
        ring.read(&mut |t, _| types.push(t), 10);
        assert_eq!(types, vec![ADD_PUBLICATION]);
    }
}
