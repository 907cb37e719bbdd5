//! Input bundle compression.
//!
//! A bundle is a run of fixed-size input records. Each record is XOR-ed with the
//! last record the receiver acknowledged, which turns unchanged inputs into zero
//! bytes, and the result is bitfield run-length encoded.

mod rle;

use std::error::Error;
use std::fmt;

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};

/// Why a bundle could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionError {
    /// A run header points past the end of the data.
    TruncatedRun {
        /// Offset the run would end at.
        offset: usize,
        /// Length of the encoded data.
        len: usize,
    },
    /// A run header claims more output than any bundle can hold.
    RunTooLong {
        /// The claimed length.
        len: usize,
    },
    /// The reference record is empty.
    EmptyReference,
    /// The decoded data is not a whole number of records.
    LengthMismatch {
        /// Decoded length.
        data_len: usize,
        /// Size of one record.
        record_len: usize,
    },
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedRun { offset, len } => {
                write!(f, "run ends at offset {offset}, but the data has {len} bytes")
            },
            Self::RunTooLong { len } => write!(f, "run of {len} bytes exceeds the limit"),
            Self::EmptyReference => write!(f, "reference record is empty"),
            Self::LengthMismatch {
                data_len,
                record_len,
            } => write!(
                f,
                "{data_len} decoded bytes are not a multiple of the record size {record_len}"
            ),
        }
    }
}

impl Error for CompressionError {}

/// XOR-encodes every pending record against `reference`, then RLE-compresses the result.
pub fn encode<'a>(reference: &[u8], pending: impl Iterator<Item = &'a [u8]>) -> Vec<u8> {
    rle::encode(&delta_encode(reference, pending))
}

/// Inverse of [`encode`].
pub fn decode(reference: &[u8], data: &[u8]) -> Result<Vec<Vec<u8>>, CompressionError> {
    let buf = rle::decode(data)?;
    delta_decode(reference, &buf)
}

fn delta_encode<'a>(reference: &[u8], pending: impl Iterator<Item = &'a [u8]>) -> Vec<u8> {
    let (lower, upper) = pending.size_hint();
    let mut bytes = Vec::with_capacity(upper.unwrap_or(lower) * reference.len());

    for record in pending {
        if record.len() != reference.len() {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "record of {} bytes does not match reference of {} bytes; skipped",
                record.len(),
                reference.len()
            );
            continue;
        }
        bytes.extend(reference.iter().zip(record).map(|(r, b)| r ^ b));
    }
    bytes
}

fn delta_decode(reference: &[u8], data: &[u8]) -> Result<Vec<Vec<u8>>, CompressionError> {
    if reference.is_empty() {
        return Err(CompressionError::EmptyReference);
    }
    if data.len() % reference.len() != 0 {
        return Err(CompressionError::LengthMismatch {
            data_len: data.len(),
            record_len: reference.len(),
        });
    }

    Ok(data
        .chunks_exact(reference.len())
        .map(|chunk| reference.iter().zip(chunk).map(|(r, b)| r ^ b).collect())
        .collect())
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

    fn record(value: i64) -> Vec<u8> {
        value.to_le_bytes().to_vec()
    }

    #[test]
    fn repeated_inputs_shrink() {
        let reference = record(5);
        let pending: Vec<Vec<u8>> = (0..16).map(|_| record(5)).collect();
        let encoded = encode(&reference, pending.iter().map(Vec::as_slice));
        assert!(encoded.len() < 4, "16 unchanged records took {} bytes", encoded.len());

        let decoded = decode(&reference, &encoded).unwrap();
        assert_eq!(decoded, pending);
    }

    #[test]
    fn changing_inputs_decode_in_order() {
        let reference = record(0);
        let pending = vec![record(1), record(-1), record(i64::MAX), record(300)];
        let encoded = encode(&reference, pending.iter().map(Vec::as_slice));
        assert_eq!(decode(&reference, &encoded).unwrap(), pending);
    }

    #[test]
    fn mismatched_records_are_skipped() {
        let reference = record(0);
        let pending = vec![record(1), vec![1, 2, 3], record(2)];
        let encoded = encode(&reference, pending.iter().map(Vec::as_slice));
        assert_eq!(decode(&reference, &encoded).unwrap(), vec![record(1), record(2)]);
    }

    #[test]
    fn empty_reference_is_rejected() {
        assert_eq!(decode(&[], &[]), Err(CompressionError::EmptyReference));
    }

    #[test]
    fn partial_record_is_rejected() {
        let reference = record(0);
        let encoded = rle::encode(&[1, 2, 3]);
        assert_eq!(
            decode(&reference, &encoded),
            Err(CompressionError::LengthMismatch {
                data_len: 3,
                record_len: 8
            })
        );
    }

    #[test]
    fn nothing_pending_encodes_to_nothing() {
        let encoded = encode(&record(9), std::iter::empty());
        assert!(encoded.is_empty());
        assert!(decode(&record(9), &encoded).unwrap().is_empty());
    }
}
