//! SSH binary packet framing (RFC 4253 Section 6).
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload
//! byte[n2]  random padding
//! ```
//!
//! The frame (without the length word) must be a multiple of the block
//! size, padding is 4-255 random bytes, and the whole packet is capped
//! at 35000 bytes. The AEAD tag appended by the packet ciphers lives
//! outside this framing and is handled by the transport.

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use sshpiper_platform::{PiperError, PiperResult};

/// Maximum packet size in bytes (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Block size used for padding alignment.
const BLOCK_SIZE: usize = 8;

/// Builds the frame body for a payload: `padding_length || payload ||
/// padding`, aligned so that the body plus the 4-byte length word is a
/// multiple of the block size.
///
/// # Errors
///
/// Returns [`PiperError::Protocol`] if the payload exceeds
/// [`MAX_PACKET_SIZE`].
pub fn frame_payload(payload: &[u8]) -> PiperResult<Vec<u8>> {
    // 4 (length word) + 1 (padding_length) + payload + padding must be
    // a multiple of BLOCK_SIZE with at least MIN_PADDING_LEN padding.
    let unpadded = 4 + 1 + payload.len();
    let mut padding_len = MIN_PADDING_LEN;
    while (unpadded + padding_len) % BLOCK_SIZE != 0 {
        padding_len += 1;
    }

    let body_len = 1 + payload.len() + padding_len;
    if 4 + body_len > MAX_PACKET_SIZE {
        return Err(PiperError::Protocol(format!(
            "payload of {} bytes exceeds maximum packet size",
            payload.len()
        )));
    }

    let mut padding = vec![0u8; padding_len];
    rand::thread_rng().fill_bytes(&mut padding);

    let mut body = BytesMut::with_capacity(body_len);
    body.put_u8(padding_len as u8);
    body.put_slice(payload);
    body.put_slice(&padding);
    Ok(body.to_vec())
}

/// Extracts the payload from a decrypted frame body
/// (`padding_length || payload || padding`).
///
/// # Errors
///
/// Returns [`PiperError::Protocol`] on truncation or an out-of-range
/// padding length.
pub fn unframe_body(body: &[u8]) -> PiperResult<Vec<u8>> {
    if body.is_empty() {
        return Err(PiperError::Protocol("empty packet body".to_string()));
    }

    let padding_len = body[0] as usize;
    if padding_len < MIN_PADDING_LEN {
        return Err(PiperError::Protocol(format!(
            "padding too short: {} bytes (minimum {})",
            padding_len, MIN_PADDING_LEN
        )));
    }
    if 1 + padding_len > body.len() {
        return Err(PiperError::Protocol(format!(
            "padding of {} bytes overruns {}-byte packet body",
            padding_len,
            body.len()
        )));
    }

    Ok(body[1..body.len() - padding_len].to_vec())
}

/// Validates a packet length read off the wire before allocating.
pub fn check_packet_length(packet_length: usize) -> PiperResult<()> {
    if packet_length > MAX_PACKET_SIZE {
        return Err(PiperError::Protocol(format!(
            "packet too large: {} bytes (maximum {})",
            packet_length, MAX_PACKET_SIZE
        )));
    }
    // padding_length byte + minimum padding
    if packet_length < 1 + MIN_PADDING_LEN {
        return Err(PiperError::Protocol(format!(
            "packet too small: {} bytes",
            packet_length
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_alignment() {
        for payload_len in [0usize, 1, 7, 8, 16, 100, 1021] {
            let payload = vec![0x55u8; payload_len];
            let body = frame_payload(&payload).unwrap();
            assert_eq!((4 + body.len()) % BLOCK_SIZE, 0, "payload {}", payload_len);
            assert!(body[0] as usize >= MIN_PADDING_LEN);
        }
    }

    #[test]
    fn test_frame_round_trip() {
        let payload = b"SSH_MSG_USERAUTH_REQUEST payload".to_vec();
        let body = frame_payload(&payload).unwrap();
        assert_eq!(unframe_body(&body).unwrap(), payload);
    }

    #[test]
    fn test_unframe_rejects_short_padding() {
        // padding_length = 2 < 4
        let body = [2u8, b'h', b'i', 0, 0];
        assert!(unframe_body(&body).is_err());
    }

    #[test]
    fn test_unframe_rejects_overrun_padding() {
        let body = [200u8, b'h', b'i'];
        assert!(unframe_body(&body).is_err());
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![0u8; MAX_PACKET_SIZE + 1];
        assert!(frame_payload(&payload).is_err());
    }

    #[test]
    fn test_check_packet_length() {
        assert!(check_packet_length(16).is_ok());
        assert!(check_packet_length(MAX_PACKET_SIZE + 1).is_err());
        assert!(check_packet_length(2).is_err());
    }
}
