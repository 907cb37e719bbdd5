//! Bitfield run-length encoding.
//!
//! The output is a sequence of runs, each introduced by a LEB128 varint header:
//!
//! - repeated run: `len << 2 | bit << 1 | 1`, where `bit` selects `0xFF` over `0x00`
//! - literal run: `len << 1`, followed by `len` raw bytes

use super::CompressionError;

/// Upper bound on decoded output; far above any bundle the protocol produces.
const MAX_DECODED_LEN: usize = 1 << 20;

fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Returns the value and the number of bytes read. A truncated varint yields what
/// was read so far.
fn read_varint(buf: &[u8], offset: usize) -> (u64, usize) {
    let mut value = 0u64;
    let mut shift = 0;
    let mut read = 0;
    for &byte in buf.iter().skip(offset) {
        value |= u64::from(byte & 0x7F) << shift;
        read += 1;
        if byte & 0x80 == 0 || shift >= 57 {
            break;
        }
        shift += 7;
    }
    (value, read)
}

fn flush_literal(out: &mut Vec<u8>, literal: &mut Vec<u8>) {
    if literal.is_empty() {
        return;
    }
    write_varint((literal.len() as u64) << 1, out);
    out.append(literal);
}

fn flush_repeat(out: &mut Vec<u8>, len: u64, byte: u8) {
    let bit = u64::from(byte == 0xFF);
    write_varint((len << 2) | (bit << 1) | 1, out);
}

pub(super) fn encode(buf: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len() / 4 + 2);
    let mut literal = Vec::new();
    let mut run: Option<(u8, u64)> = None;

    for &byte in buf {
        match run {
            Some((value, len)) if value == byte => {
                run = Some((value, len + 1));
                continue;
            },
            Some((value, len)) => {
                flush_repeat(&mut out, len, value);
                run = None;
            },
            None => {},
        }

        if byte == 0x00 || byte == 0xFF {
            flush_literal(&mut out, &mut literal);
            run = Some((byte, 1));
        } else {
            literal.push(byte);
        }
    }

    if let Some((value, len)) = run {
        flush_repeat(&mut out, len, value);
    }
    flush_literal(&mut out, &mut literal);
    out
}

pub(super) fn decode(buf: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let (header, read) = read_varint(buf, offset);
        offset += read;

        let repeated = header & 1 == 1;
        let len = if repeated { header >> 2 } else { header >> 1 };
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len > MAX_DECODED_LEN.saturating_sub(out.len()) {
            return Err(CompressionError::RunTooLong { len });
        }

        if repeated {
            let byte = if header & 2 == 2 { 0xFF } else { 0x00 };
            out.resize(out.len() + len, byte);
        } else {
            let end = offset + len;
            let literal = buf.get(offset..end).ok_or(CompressionError::TruncatedRun {
                offset: end,
                len: buf.len(),
            })?;
            out.extend_from_slice(literal);
            offset = end;
        }
    }
    Ok(out)
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
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn known_layout() {
        // four zeros, two 0xFF, then three literals
        let data = [0, 0, 0, 0, 255, 255, 1, 2, 3];
        let encoded = encode(&data);
        assert_eq!(encoded, vec![(4 << 2) | 1, (2 << 2) | 2 | 1, 3 << 1, 1, 2, 3]);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn long_runs_use_multi_byte_headers() {
        let data = vec![0u8; 1000];
        let encoded = encode(&data);
        assert_eq!(encoded.len(), 2);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn truncated_literal_is_rejected() {
        // literal of 5 bytes, only 2 present
        let err = decode(&[5 << 1, 9, 9]).unwrap_err();
        assert_eq!(err, CompressionError::TruncatedRun { offset: 6, len: 3 });
    }

    #[test]
    fn absurd_run_is_rejected() {
        let mut encoded = Vec::new();
        write_varint((1u64 << 40) << 2 | 1, &mut encoded);
        assert!(matches!(
            decode(&encoded),
            Err(CompressionError::RunTooLong { .. })
        ));
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(data in proptest::collection::vec(
            prop_oneof![Just(0u8), Just(255u8), any::<u8>()], 0..256)
        ) {
            prop_assert_eq!(decode(&encode(&data)).unwrap(), data);
        }
    }
}
