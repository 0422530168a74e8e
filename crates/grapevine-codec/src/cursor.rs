// ABOUTME: Replay cursor wire codec for the event bus.
// ABOUTME: Cursors are unsigned 64-bit big-endian integers in exactly 8 bytes.

use crate::error::CodecError;

/// Serialize a replay cursor to its 8-byte big-endian wire form.
pub fn encode_replay_id(replay_id: u64) -> [u8; 8] {
    replay_id.to_be_bytes()
}

/// Decode a replay cursor from its wire form.
///
/// The bus always sends exactly 8 bytes; anything else is a protocol error.
pub fn decode_replay_id(bytes: &[u8]) -> Result<u64, CodecError> {
    let fixed: [u8; 8] = bytes
        .try_into()
        .map_err(|_| CodecError::CursorLength(bytes.len()))?;
    Ok(u64::from_be_bytes(fixed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_roundtrip() {
        for n in [0u64, 1, 42, 1 << 33, u64::MAX - 1, u64::MAX] {
            let bytes = encode_replay_id(n);
            assert_eq!(bytes.len(), 8);
            assert_eq!(decode_replay_id(&bytes).unwrap(), n);
        }
    }

    #[test]
    fn test_cursor_is_big_endian() {
        assert_eq!(encode_replay_id(1), [0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(decode_replay_id(&[0, 0, 0, 0, 0, 0, 1, 0]).unwrap(), 256);
    }

    #[test]
    fn test_cursor_rejects_wrong_length() {
        for bad in [&[][..], &[1, 2, 3][..], &[0; 7][..], &[0; 9][..]] {
            let err = decode_replay_id(bad).unwrap_err();
            assert!(matches!(err, CodecError::CursorLength(len) if len == bad.len()));
        }
    }

    #[test]
    fn test_cursor_ordering_matches_numeric_ordering() {
        // Big-endian encoding preserves the total order over cursors.
        let a = encode_replay_id(500);
        let b = encode_replay_id(501);
        assert!(a < b);
    }
}
