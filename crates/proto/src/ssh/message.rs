//! SSH protocol message numbers (RFC 4253 Section 12).
//!
//! The range 60-79 is reserved for method-specific userauth messages:
//! 60 is SSH_MSG_USERAUTH_PK_OK while a public-key exchange is in
//! flight, and SSH_MSG_USERAUTH_INFO_REQUEST during keyboard-
//! interactive. The enum carries the public-key reading; the
//! keyboard-interactive messages in [`crate::ssh::auth`] match on the
//! raw byte.

/// SSH message types used by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Terminates the connection.
    Disconnect = 1,
    /// Padding / keep-alive; always ignored.
    Ignore = 2,
    /// Response to an unknown message type.
    Unimplemented = 3,
    /// Debugging information.
    Debug = 4,
    /// Request a service (e.g. "ssh-userauth").
    ServiceRequest = 5,
    /// Service request accepted.
    ServiceAccept = 6,

    // Algorithm negotiation (20-29)
    /// Algorithm negotiation.
    KexInit = 20,
    /// Signals the switch to the newly derived keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// ECDH key exchange init (client ephemeral key).
    KexEcdhInit = 30,
    /// ECDH key exchange reply (host key, server ephemeral key, signature).
    KexEcdhReply = 31,

    // User authentication (50-79)
    /// Client authentication request.
    UserauthRequest = 50,
    /// Authentication failed; carries the methods that can continue.
    UserauthFailure = 51,
    /// Authentication succeeded.
    UserauthSuccess = 52,
    /// Server banner shown during authentication.
    UserauthBanner = 53,
    /// Public key acceptable (also USERAUTH_INFO_REQUEST, see module docs).
    UserauthPkOk = 60,
    /// Keyboard-interactive answers from the client.
    UserauthInfoResponse = 61,

    // Connection protocol (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Global request succeeded.
    RequestSuccess = 81,
    /// Global request failed.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel request succeeded.
    ChannelSuccess = 99,
    /// Channel request failed.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a message number to a known message type.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexEcdhInit),
            31 => Some(MessageType::KexEcdhReply),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            60 => Some(MessageType::UserauthPkOk),
            61 => Some(MessageType::UserauthInfoResponse),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns the RFC name of this message type.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexEcdhInit => "SSH_MSG_KEX_ECDH_INIT",
            MessageType::KexEcdhReply => "SSH_MSG_KEX_ECDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::UserauthInfoResponse => "SSH_MSG_USERAUTH_INFO_RESPONSE",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}
