//! Binary codec for wire messages.
//!
//! All encoding goes through one bincode configuration: the standard layout with
//! fixed-size integers, so a message's size depends only on its shape.
//!
//! ```
//! use rollback_session::network::codec::{decode_value, encode, encode_into};
//!
//! let bytes = encode(&42u32).unwrap();
//! let value: u32 = decode_value(&bytes).unwrap();
//! assert_eq!(value, 42);
//!
//! let mut buffer = [0u8; 16];
//! let len = encode_into(&7u64, &mut buffer).unwrap();
//! assert_eq!(len, 8);
//! ```

use std::fmt;

use serde::{de::DeserializeOwned, Serialize};

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// The operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecOperation {
    /// Encoding into a fresh vector.
    Encode,
    /// Encoding into a caller-provided slice.
    EncodeIntoBuffer,
    /// Appending to a vector.
    AppendToBuffer,
    /// Decoding.
    Decode,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode => write!(f, "encoding"),
            Self::EncodeIntoBuffer => write!(f, "encoding into buffer"),
            Self::AppendToBuffer => write!(f, "appending to buffer"),
            Self::Decode => write!(f, "decoding"),
        }
    }
}

/// Errors raised while encoding or decoding.
///
/// bincode only describes its failures as text, so the message is kept as a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Encoding failed.
    EncodeError {
        /// bincode's description.
        message: String,
        /// What was being done.
        operation: CodecOperation,
    },
    /// Decoding failed.
    DecodeError {
        /// bincode's description.
        message: String,
        /// What was being done.
        operation: CodecOperation,
    },
    /// The destination slice could not hold the encoded value.
    BufferTooSmall {
        /// Size of the slice.
        provided: usize,
    },
}

impl CodecError {
    fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::BufferTooSmall { provided } => {
                write!(f, "buffer too small: only {provided} bytes provided")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type of codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new vector.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::Encode))
}

/// Encodes a value into `buffer` and returns the number of bytes written.
pub fn encode_into<T: Serialize>(value: &T, buffer: &mut [u8]) -> CodecResult<usize> {
    bincode::serde::encode_into_slice(value, buffer, config()).map_err(|e| match e {
        bincode::error::EncodeError::UnexpectedEnd => CodecError::BufferTooSmall {
            provided: buffer.len(),
        },
        other => CodecError::encode(other.to_string(), CodecOperation::EncodeIntoBuffer),
    })
}

/// Appends the encoding of a value to `buffer` and returns the number of bytes added.
pub fn encode_append<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> CodecResult<usize> {
    let start_len = buffer.len();
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| buffer.len() - start_len)
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::AppendToBuffer))
}

/// Decodes a value and returns it with the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::Decode))
}

/// Decodes a value, ignoring trailing bytes.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    decode(bytes).map(|(value, _)| value)
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::messages::{Message, MessageBody, MessageHeader, SyncRequest};

    fn sync_request(magic: u16) -> Message {
        Message {
            header: MessageHeader { magic },
            body: MessageBody::SyncRequest(SyncRequest {
                random_request: 999,
            }),
        }
    }

    #[test]
    fn integers_have_fixed_width() {
        assert_eq!(encode(&1u32).unwrap().len(), 4);
        assert_eq!(encode(&u32::MAX).unwrap().len(), 4);
        assert_eq!(encode(&-1i64).unwrap().len(), 8);
    }

    #[test]
    fn decode_reports_consumed_bytes() {
        let bytes = encode(&sync_request(0x1234)).unwrap();
        let (msg, len): (Message, _) = decode(&bytes).unwrap();
        assert_eq!(msg, sync_request(0x1234));
        assert_eq!(len, bytes.len());
    }

    #[test]
    fn encode_into_matches_encode() {
        let msg = sync_request(3);
        let mut buffer = [0u8; 64];
        let len = encode_into(&msg, &mut buffer).unwrap();
        assert_eq!(&buffer[..len], encode(&msg).unwrap().as_slice());
    }

    #[test]
    fn encode_into_small_buffer_fails() {
        let mut buffer = [0u8; 2];
        let err = encode_into(&sync_request(3), &mut buffer).unwrap_err();
        assert_eq!(err, CodecError::BufferTooSmall { provided: 2 });
    }

    #[test]
    fn encode_append_extends() {
        let mut buffer = vec![0xFF];
        let written = encode_append(&5u16, &mut buffer).unwrap();
        assert_eq!(written, 2);
        assert_eq!(buffer, vec![0xFF, 5, 0]);
    }

    #[test]
    fn garbage_does_not_decode() {
        let result: CodecResult<Message> = decode_value(&[0xFF; 3]);
        let err = result.unwrap_err();
        assert!(matches!(err, CodecError::DecodeError { .. }));
        assert!(err.to_string().starts_with("decoding failed while decoding"));
    }
}
