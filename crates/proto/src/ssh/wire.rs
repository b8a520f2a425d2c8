//! SSH wire-format primitives (RFC 4251 Section 5).
//!
//! Every SSH message is built from a handful of primitive encodings:
//! `byte`, `boolean`, `uint32`, `string` (length-prefixed bytes),
//! `name-list` (comma-separated names in a string) and `mpint`. The
//! helpers here are shared by all message modules so that parsing
//! bounds checks live in exactly one place.

use bytes::{BufMut, BytesMut};
use sshpiper_platform::{PiperError, PiperResult};

/// Appends a `string` field (uint32 length + raw bytes).
pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Appends a `string` field holding UTF-8 text.
pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Appends a `boolean` field.
pub fn put_bool(buf: &mut BytesMut, v: bool) {
    buf.put_u8(u8::from(v));
}

/// Appends a `name-list` field (RFC 4251 Section 5).
pub fn put_name_list(buf: &mut BytesMut, names: &[String]) {
    put_string(buf, &names.join(","));
}

/// Reads a single `byte` field.
pub fn take_u8(data: &[u8], offset: &mut usize) -> PiperResult<u8> {
    let b = data
        .get(*offset)
        .copied()
        .ok_or_else(|| PiperError::Protocol(format!("truncated byte at offset {}", offset)))?;
    *offset += 1;
    Ok(b)
}

/// Reads a `boolean` field.
pub fn take_bool(data: &[u8], offset: &mut usize) -> PiperResult<bool> {
    Ok(take_u8(data, offset)? != 0)
}

/// Reads a `uint32` field.
pub fn take_u32(data: &[u8], offset: &mut usize) -> PiperResult<u32> {
    if *offset + 4 > data.len() {
        return Err(PiperError::Protocol(format!(
            "truncated uint32 at offset {}",
            offset
        )));
    }
    let v = u32::from_be_bytes([
        data[*offset],
        data[*offset + 1],
        data[*offset + 2],
        data[*offset + 3],
    ]);
    *offset += 4;
    Ok(v)
}

/// Reads a `string` field as raw bytes.
pub fn take_bytes(data: &[u8], offset: &mut usize) -> PiperResult<Vec<u8>> {
    let length = take_u32(data, offset)? as usize;
    if *offset + length > data.len() {
        return Err(PiperError::Protocol(format!(
            "string field of {} bytes overruns message at offset {}",
            length, offset
        )));
    }
    let bytes = data[*offset..*offset + length].to_vec();
    *offset += length;
    Ok(bytes)
}

/// Reads a `string` field as UTF-8 text.
pub fn take_string(data: &[u8], offset: &mut usize) -> PiperResult<String> {
    let bytes = take_bytes(data, offset)?;
    String::from_utf8(bytes)
        .map_err(|_| PiperError::Protocol("string field contains invalid UTF-8".to_string()))
}

/// Reads a `name-list` field.
pub fn take_name_list(data: &[u8], offset: &mut usize) -> PiperResult<Vec<String>> {
    let joined = take_string(data, offset)?;
    if joined.is_empty() {
        return Ok(vec![]);
    }
    Ok(joined.split(',').map(String::from).collect())
}

/// Encodes a big integer as an SSH `mpint` (uint32 length + two's
/// complement bytes, 0x00-prefixed when the high bit is set).
pub fn encode_mpint(data: &[u8]) -> Vec<u8> {
    let trimmed: Vec<u8> = data.iter().skip_while(|&&b| b == 0).copied().collect();

    if trimmed.is_empty() {
        return vec![0, 0, 0, 0];
    }

    let needs_padding = trimmed[0] & 0x80 != 0;
    let length = trimmed.len() + usize::from(needs_padding);

    let mut out = Vec::with_capacity(4 + length);
    out.extend_from_slice(&(length as u32).to_be_bytes());
    if needs_padding {
        out.push(0);
    }
    out.extend_from_slice(&trimmed);
    out
}
