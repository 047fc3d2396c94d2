//! Wire protocol between client and driver.
//!
//! Commands travel client→driver on the command ring; responses travel
//! driver→client on the broadcast. Records are fixed little-endian layouts
//! prefixed by `{client_id: i64, correlation_id: i64}` on the command side
//! and keyed by correlation id on the response side. Strings are encoded
//! as an `i32` length followed by UTF-8 bytes.

use crate::error::{ClientError, Result};

/// Command type: add a publication.
pub const ADD_PUBLICATION: i32 = 0x01;
/// Command type: add an exclusive publication.
pub const ADD_EXCLUSIVE_PUBLICATION: i32 = 0x02;
/// Command type: remove a publication.
pub const REMOVE_PUBLICATION: i32 = 0x03;
/// Command type: add a subscription.
pub const ADD_SUBSCRIPTION: i32 = 0x04;
/// Command type: remove a subscription.
pub const REMOVE_SUBSCRIPTION: i32 = 0x05;
/// Command type: client keepalive.
pub const CLIENT_KEEPALIVE: i32 = 0x06;

/// Response type: the referenced command succeeded.
pub const ON_OPERATION_SUCCESS: i32 = 0x0F01;
/// Response type: the referenced command failed.
pub const ON_ERROR: i32 = 0x0F02;
/// Response type: an image became available on a subscription.
pub const ON_AVAILABLE_IMAGE: i32 = 0x0F03;
/// Response type: an image went away.
pub const ON_UNAVAILABLE_IMAGE: i32 = 0x0F04;
/// Response type: a counter is ready.
pub const ON_COUNTER_READY: i32 = 0x0F05;
/// Response type: a counter went away.
pub const ON_COUNTER_UNAVAILABLE: i32 = 0x0F06;

/// Driver error code: unspecified failure.
pub const ERROR_CODE_GENERIC: i32 = 0;
/// Driver error code: the channel could not be parsed or used.
pub const ERROR_CODE_INVALID_CHANNEL: i32 = 1;
/// Driver error code: unknown publication registration id.
pub const ERROR_CODE_UNKNOWN_PUBLICATION: i32 = 2;
/// Driver error code: unknown subscription registration id.
pub const ERROR_CODE_UNKNOWN_SUBSCRIPTION: i32 = 3;

/// A decoded client→driver command, as seen by the driver end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCommand {
    /// Register a publication on `channel`/`stream_id`.
    AddPublication {
        client_id: i64,
        correlation_id: i64,
        stream_id: i32,
        channel: String,
    },
    /// Register a single-writer publication.
    AddExclusivePublication {
        client_id: i64,
        correlation_id: i64,
        stream_id: i32,
        channel: String,
    },
    /// Release a previously registered publication.
    RemovePublication {
        client_id: i64,
        correlation_id: i64,
        registration_id: i64,
    },
    /// Register a subscription on `channel`/`stream_id`.
    AddSubscription {
        client_id: i64,
        correlation_id: i64,
        stream_id: i32,
        channel: String,
    },
    /// Release a previously registered subscription.
    RemoveSubscription {
        client_id: i64,
        correlation_id: i64,
        registration_id: i64,
    },
    /// Liveness proof from the client.
    Keepalive { client_id: i64 },
}

/// A decoded driver→client response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverResponse {
    /// The command with this correlation id succeeded.
    OperationSuccess { correlation_id: i64 },
    /// The command with this correlation id was rejected.
    Error {
        offending_correlation_id: i64,
        code: i32,
        message: String,
    },
    /// An image appeared on a subscription.
    AvailableImage {
        correlation_id: i64,
        subscription_registration_id: i64,
        session_id: i32,
        stream_id: i32,
        source_identity: String,
    },
    /// An image disappeared from a subscription.
    UnavailableImage {
        correlation_id: i64,
        subscription_registration_id: i64,
        stream_id: i32,
    },
    /// A counter is ready for reading.
    CounterReady { correlation_id: i64, counter_id: i32 },
    /// A counter went away.
    CounterUnavailable { correlation_id: i64, counter_id: i32 },
}

struct Writer<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        Self { buf }
    }

    fn i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn i64(&mut self, value: i64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn string(&mut self, value: &str) -> &mut Self {
        self.i32(value.len() as i32);
        self.buf.extend_from_slice(value.as_bytes());
        self
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, cursor: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.cursor.checked_add(len).ok_or_else(|| {
            ClientError::Protocol("record length overflow".to_string())
        })?;
        if end > self.bytes.len() {
            return Err(ClientError::Protocol(format!(
                "record truncated: wanted {len} bytes at {}, have {}",
                self.cursor,
                self.bytes.len()
            )));
        }
        let slice = &self.bytes[self.cursor..end];
        self.cursor = end;
        Ok(slice)
    }

    fn i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i64(&mut self) -> Result<i64> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(arr))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.i32()?;
        if len < 0 {
            return Err(ClientError::Protocol(format!(
                "negative string length {len}"
            )));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ClientError::Protocol("string is not UTF-8".to_string()))
    }
}

/// Encodes a command into `buf`, returning the ring message type.
pub fn encode_command(buf: &mut Vec<u8>, command: &DriverCommand) -> i32 {
    let mut w = Writer::new(buf);
    match command {
        DriverCommand::AddPublication {
            client_id,
            correlation_id,
            stream_id,
            channel,
        } => {
            w.i64(*client_id).i64(*correlation_id).i32(*stream_id).string(channel);
            ADD_PUBLICATION
        }
        DriverCommand::AddExclusivePublication {
            client_id,
            correlation_id,
            stream_id,
            channel,
        } => {
            w.i64(*client_id).i64(*correlation_id).i32(*stream_id).string(channel);
            ADD_EXCLUSIVE_PUBLICATION
        }
        DriverCommand::RemovePublication {
            client_id,
            correlation_id,
            registration_id,
        } => {
            w.i64(*client_id).i64(*correlation_id).i64(*registration_id);
            REMOVE_PUBLICATION
        }
        DriverCommand::AddSubscription {
            client_id,
            correlation_id,
            stream_id,
            channel,
        } => {
            w.i64(*client_id).i64(*correlation_id).i32(*stream_id).string(channel);
            ADD_SUBSCRIPTION
        }
        DriverCommand::RemoveSubscription {
            client_id,
            correlation_id,
            registration_id,
        } => {
            w.i64(*client_id).i64(*correlation_id).i64(*registration_id);
            REMOVE_SUBSCRIPTION
        }
        DriverCommand::Keepalive { client_id } => {
            w.i64(*client_id).i64(0);
            CLIENT_KEEPALIVE
        }
    }
}

/// Decodes a command record from the ring.
///
/// # Errors
///
/// [`ClientError::Protocol`] on an unknown type or truncated record.
pub fn decode_command(msg_type: i32, bytes: &[u8]) -> Result<DriverCommand> {
    let mut r = Reader::new(bytes);
    match msg_type {
        ADD_PUBLICATION => Ok(DriverCommand::AddPublication {
            client_id: r.i64()?,
            correlation_id: r.i64()?,
            stream_id: r.i32()?,
            channel: r.string()?,
        }),
        ADD_EXCLUSIVE_PUBLICATION => Ok(DriverCommand::AddExclusivePublication {
            client_id: r.i64()?,
            correlation_id: r.i64()?,
            stream_id: r.i32()?,
            channel: r.string()?,
        }),
        REMOVE_PUBLICATION => Ok(DriverCommand::RemovePublication {
            client_id: r.i64()?,
            correlation_id: r.i64()?,
            registration_id: r.i64()?,
        }),
        ADD_SUBSCRIPTION => Ok(DriverCommand::AddSubscription {
            client_id: r.i64()?,
            correlation_id: r.i64()?,
            stream_id: r.i32()?,
            channel: r.string()?,
        }),
        REMOVE_SUBSCRIPTION => Ok(DriverCommand::RemoveSubscription {
            client_id: r.i64()?,
            correlation_id: r.i64()?,
            registration_id: r.i64()?,
        }),
        CLIENT_KEEPALIVE => Ok(DriverCommand::Keepalive {
            client_id: r.i64()?,
        }),
        other => Err(ClientError::Protocol(format!(
            "unknown command type {other:#x}"
        ))),
    }
}

/// Encodes a response into `buf`, returning the broadcast message type.
pub fn encode_response(buf: &mut Vec<u8>, response: &DriverResponse) -> i32 {
    let mut w = Writer::new(buf);
    match response {
        DriverResponse::OperationSuccess { correlation_id } => {
            w.i64(*correlation_id);
            ON_OPERATION_SUCCESS
        }
        DriverResponse::Error {
            offending_correlation_id,
            code,
            message,
        } => {
            w.i64(*offending_correlation_id).i32(*code).string(message);
            ON_ERROR
        }
        DriverResponse::AvailableImage {
            correlation_id,
            subscription_registration_id,
            session_id,
            stream_id,
            source_identity,
        } => {
            w.i64(*correlation_id)
                .i64(*subscription_registration_id)
                .i32(*session_id)
                .i32(*stream_id)
                .string(source_identity);
            ON_AVAILABLE_IMAGE
        }
        DriverResponse::UnavailableImage {
            correlation_id,
            subscription_registration_id,
            stream_id,
        } => {
            w.i64(*correlation_id)
                .i64(*subscription_registration_id)
                .i32(*stream_id);
            ON_UNAVAILABLE_IMAGE
        }
        DriverResponse::CounterReady {
            correlation_id,
            counter_id,
        } => {
            w.i64(*correlation_id).i32(*counter_id);
            ON_COUNTER_READY
        }
        DriverResponse::CounterUnavailable {
            correlation_id,
            counter_id,
        } => {
            w.i64(*correlation_id).i32(*counter_id);
            ON_COUNTER_UNAVAILABLE
        }
    }
}

/// Decodes a response record from the broadcast.
///
/// # Errors
///
/// [`ClientError::Protocol`] on an unknown type or truncated record.
pub fn decode_response(msg_type: i32, bytes: &[u8]) -> Result<DriverResponse> {
    let mut r = Reader::new(bytes);
    match msg_type {
        ON_OPERATION_SUCCESS => Ok(DriverResponse::OperationSuccess {
            correlation_id: r.i64()?,
        }),
        ON_ERROR => Ok(DriverResponse::Error {
            offending_correlation_id: r.i64()?,
            code: r.i32()?,
            message: r.string()?,
        }),
        ON_AVAILABLE_IMAGE => Ok(DriverResponse::AvailableImage {
            correlation_id: r.i64()?,
            subscription_registration_id: r.i64()?,
            session_id: r.i32()?,
            stream_id: r.i32()?,
            source_identity: r.string()?,
        }),
        ON_UNAVAILABLE_IMAGE => Ok(DriverResponse::UnavailableImage {
            correlation_id: r.i64()?,
            subscription_registration_id: r.i64()?,
            stream_id: r.i32()?,
        }),
        ON_COUNTER_READY => Ok(DriverResponse::CounterReady {
            correlation_id: r.i64()?,
            counter_id: r.i32()?,
        }),
        ON_COUNTER_UNAVAILABLE => Ok(DriverResponse::CounterUnavailable {
            correlation_id: r.i64()?,
            counter_id: r.i32()?,
        }),
        other => Err(ClientError::Protocol(format!(
            "unknown response type {other:#x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publication_command_roundtrip() {
        let command = DriverCommand::AddPublication {
            client_id: 7,
            correlation_id: 42,
            stream_id: 1001,
            channel: "ipc://control".to_string(),
        };
        let mut buf = Vec::new();
        let msg_type = encode_command(&mut buf, &command);

        assert_eq!(msg_type, ADD_PUBLICATION);
        assert_eq!(decode_command(msg_type, &buf).unwrap(), command);
    }

    #[test]
    fn error_response_roundtrip() {
        let response = DriverResponse::Error {
            offending_correlation_id: 42,
            code: ERROR_CODE_INVALID_CHANNEL,
            message: "no such channel".to_string(),
        };
        let mut buf = Vec::new();
        let msg_type = encode_response(&mut buf, &response);

        assert_eq!(msg_type, ON_ERROR);
        assert_eq!(decode_response(msg_type, &buf).unwrap(), response);
    }

    #[test]
    fn truncated_record_is_rejected() {
        let mut buf = Vec::new();
        encode_command(
            &mut buf,
            &DriverCommand::RemovePublication {
                client_id: 1,
                correlation_id: 2,
                registration_id: 3,
            },
        );
        let result = decode_command(REMOVE_PUBLICATION, &buf[..buf.len() - 4]);
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(matches!(
            decode_command(0x7777, &[]),
            Err(ClientError::Protocol(_))
        ));
        assert!(matches!(
            decode_response(0x7777, &[]),
            Err(ClientError::Protocol(_))
        ));
    }
}
