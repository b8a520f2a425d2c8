//! Connection-layer messages (RFC 4254).
//!
//! The pump forwards channel traffic opaquely; these types exist for
//! code that needs to look inside individual packets: per-packet hooks
//! rewriting CHANNEL_DATA, and test drivers running a session over a
//! piped connection.

use bytes::{BufMut, BytesMut};
use sshpiper_platform::{PiperError, PiperResult};

use crate::ssh::message::MessageType;
use crate::ssh::wire;

/// Default initial window size offered when opening a channel.
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default maximum packet size offered when opening a channel.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 32 * 1024;

/// SSH_MSG_CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    channel_type: String,
    sender_channel: u32,
    initial_window_size: u32,
    max_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a channel-open request.
    pub fn new(channel_type: &str, sender_channel: u32) -> Self {
        Self {
            channel_type: channel_type.to_string(),
            sender_channel,
            initial_window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Returns the channel type (e.g. "session").
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Returns the sender's channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Serializes to message bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        wire::put_string(&mut buf, &self.channel_type);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.max_packet_size);
        buf.to_vec()
    }

    /// Parses from message bytes.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        if wire::take_u8(data, &mut offset)? != MessageType::ChannelOpen as u8 {
            return Err(PiperError::Protocol(
                "expected SSH_MSG_CHANNEL_OPEN".to_string(),
            ));
        }
        Ok(Self {
            channel_type: wire::take_string(data, &mut offset)?,
            sender_channel: wire::take_u32(data, &mut offset)?,
            initial_window_size: wire::take_u32(data, &mut offset)?,
            max_packet_size: wire::take_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    recipient_channel: u32,
    sender_channel: u32,
    initial_window_size: u32,
    max_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Creates a confirmation for an accepted channel.
    pub fn new(recipient_channel: u32, sender_channel: u32) -> Self {
        Self {
            recipient_channel,
            sender_channel,
            initial_window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Returns the recipient's channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the sender's channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Serializes to message bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.max_packet_size);
        buf.to_vec()
    }

    /// Parses from message bytes.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        if wire::take_u8(data, &mut offset)? != MessageType::ChannelOpenConfirmation as u8 {
            return Err(PiperError::Protocol(
                "expected SSH_MSG_CHANNEL_OPEN_CONFIRMATION".to_string(),
            ));
        }
        Ok(Self {
            recipient_channel: wire::take_u32(data, &mut offset)?,
            sender_channel: wire::take_u32(data, &mut offset)?,
            initial_window_size: wire::take_u32(data, &mut offset)?,
            max_packet_size: wire::take_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    recipient_channel: u32,
    data: Vec<u8>,
}

impl ChannelData {
    /// Creates a data message for a channel.
    pub fn new(recipient_channel: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data,
        }
    }

    /// Returns the recipient's channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the carried data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serializes to message bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelData as u8);
        buf.put_u32(self.recipient_channel);
        wire::put_bytes(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from message bytes.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        if wire::take_u8(data, &mut offset)? != MessageType::ChannelData as u8 {
            return Err(PiperError::Protocol(
                "expected SSH_MSG_CHANNEL_DATA".to_string(),
            ));
        }
        Ok(Self {
            recipient_channel: wire::take_u32(data, &mut offset)?,
            data: wire::take_bytes(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEof {
    recipient_channel: u32,
}

impl ChannelEof {
    /// Creates an EOF message for a channel.
    pub fn new(recipient_channel: u32) -> Self {
        Self { recipient_channel }
    }

    /// Returns the recipient's channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Serializes to message bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelEof as u8);
        buf.put_u32(self.recipient_channel);
        buf.to_vec()
    }

    /// Parses from message bytes.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        if wire::take_u8(data, &mut offset)? != MessageType::ChannelEof as u8 {
            return Err(PiperError::Protocol(
                "expected SSH_MSG_CHANNEL_EOF".to_string(),
            ));
        }
        Ok(Self {
            recipient_channel: wire::take_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_CLOSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClose {
    recipient_channel: u32,
}

impl ChannelClose {
    /// Creates a close message for a channel.
    pub fn new(recipient_channel: u32) -> Self {
        Self { recipient_channel }
    }

    /// Returns the recipient's channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Serializes to message bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelClose as u8);
        buf.put_u32(self.recipient_channel);
        buf.to_vec()
    }

    /// Parses from message bytes.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        if wire::take_u8(data, &mut offset)? != MessageType::ChannelClose as u8 {
            return Err(PiperError::Protocol(
                "expected SSH_MSG_CHANNEL_CLOSE".to_string(),
            ));
        }
        Ok(Self {
            recipient_channel: wire::take_u32(data, &mut offset)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_open_round_trip() {
        let open = ChannelOpen::new("session", 3);
        let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
        assert_eq!(parsed, open);
        assert_eq!(parsed.channel_type(), "session");
        assert_eq!(parsed.sender_channel(), 3);
    }

    #[test]
    fn test_confirmation_round_trip() {
        let confirmation = ChannelOpenConfirmation::new(3, 0);
        let parsed = ChannelOpenConfirmation::from_bytes(&confirmation.to_bytes()).unwrap();
        assert_eq!(parsed.recipient_channel(), 3);
        assert_eq!(parsed.sender_channel(), 0);
    }

    #[test]
    fn test_channel_data_round_trip() {
        let data = ChannelData::new(1, b"123456".to_vec());
        let bytes = data.to_bytes();
        assert_eq!(bytes[0], MessageType::ChannelData as u8);

        let parsed = ChannelData::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.recipient_channel(), 1);
        assert_eq!(parsed.data(), b"123456");
    }

    #[test]
    fn test_eof_and_close_round_trip() {
        let eof = ChannelEof::new(7);
        assert_eq!(ChannelEof::from_bytes(&eof.to_bytes()).unwrap(), eof);

        let close = ChannelClose::new(7);
        assert_eq!(ChannelClose::from_bytes(&close.to_bytes()).unwrap(), close);
    }

    #[test]
    fn test_wrong_message_type_rejected() {
        let data = ChannelData::new(1, b"x".to_vec()).to_bytes();
        assert!(ChannelEof::from_bytes(&data).is_err());
    }
}
