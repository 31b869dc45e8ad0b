//! Several encoded packets packed into one frame plaintext.
//!
//! Layout: `(varint length ‖ packet bytes)*`. An empty batch is zero bytes.

use crate::codec::primitives::{read_varint, varint_len, write_varint};
use crate::error::{ProtocolError, Result};

/// Concatenate length-prefixed packets.
///
/// # Errors
/// Whatever the length prefix write reports.
pub fn encode_batch<P: AsRef<[u8]>>(packets: &[P]) -> Result<Vec<u8>> {
    let total: usize = packets
        .iter()
        .map(|p| {
            let len = p.as_ref().len();
            varint_len(len as u64) + len
        })
        .sum();
    let mut out = vec![0u8; total];
    let mut offset = 0;
    for packet in packets {
        let bytes = packet.as_ref();
        offset = write_varint(bytes.len() as u64, &mut out, offset)?;
        out[offset..offset + bytes.len()].copy_from_slice(bytes);
        offset += bytes.len();
    }
    Ok(out)
}

/// Split a batch back into packet byte strings.
///
/// # Errors
/// `ProtocolError::Malformed` if an entry's length runs past the end. A batch
/// arrives whole inside one frame, so a short batch can never be completed.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut packets = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (len, n) = read_varint(bytes, offset).map_err(|e| match e {
            ProtocolError::Truncated { .. } => {
                ProtocolError::Malformed("batch entry length cut short".to_string())
            }
            other => other,
        })?;
        offset += n;
        let end = usize::try_from(len)
            .ok()
            .and_then(|len| offset.checked_add(len))
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| {
                ProtocolError::Malformed(format!(
                    "batch entry of {len} bytes exceeds the {} remaining",
                    bytes.len() - offset
                ))
            })?;
        packets.push(bytes[offset..end].to_vec());
        offset = end;
    }
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_batch_layout() {
        let batch = encode_batch(&[vec![0x0a, 0x01], vec![0x0b]]).unwrap();
        assert_eq!(batch, [2, 0x0a, 0x01, 1, 0x0b]);
        assert_eq!(decode_batch(&batch).unwrap(), vec![vec![0x0a, 0x01], vec![0x0b]]);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_long_entry_uses_multibyte_length() {
        let big = vec![7u8; 300];
        let batch = encode_batch(&[&big]).unwrap();
        assert_eq!(&batch[..2], &[0xac, 0x02]);
        assert_eq!(decode_batch(&batch).unwrap(), vec![big]);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_empty_batch() {
        let empty: [Vec<u8>; 0] = [];
        assert!(encode_batch(&empty).unwrap().is_empty());
        assert!(decode_batch(&[]).unwrap().is_empty());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_prefix_boundaries_fill_exactly() {
        for len in [0usize, 127, 128, 16_383, 16_384] {
            let packets = [vec![0xee; len], vec![0x01]];
            let batch = encode_batch(&packets).unwrap();
            assert_eq!(batch.len(), varint_len(len as u64) + len + 2);
            assert_eq!(batch.last(), Some(&0x01));
            assert_eq!(decode_batch(&batch).unwrap(), packets);
        }
    }

    #[test]
    fn test_overlong_entry_is_malformed() {
        assert!(matches!(
            decode_batch(&[5, 1, 2]),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_batch(&[0x80]),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
