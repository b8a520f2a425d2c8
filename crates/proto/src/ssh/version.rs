//! SSH identification string exchange (RFC 4253 Section 4.2).
//!
//! Both sides open the connection with a line of the form
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! The line is capped at 255 bytes and must not contain NUL bytes.

use sshpiper_platform::{PiperError, PiperResult};

/// Maximum length of the identification line (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// An SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates a protocol 2.0 identification string.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Parses an identification line (with or without trailing CR LF).
    ///
    /// # Errors
    ///
    /// Returns [`PiperError::Protocol`] if the line is too long,
    /// contains NUL bytes, does not start with `SSH-`, or names a
    /// protocol version other than 2.0 / 1.99.
    pub fn parse(line: &str) -> PiperResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(PiperError::Protocol(format!(
                "identification line too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(PiperError::Protocol(
                "identification line contains NUL byte".to_string(),
            ));
        }

        let rest = line.strip_prefix("SSH-").ok_or_else(|| {
            PiperError::Protocol(format!("identification line does not start with SSH-: {line:?}"))
        })?;

        let (proto_version, software_and_comments) = rest.split_once('-').ok_or_else(|| {
            PiperError::Protocol("identification line missing software version".to_string())
        })?;

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(PiperError::Protocol(format!(
                "unsupported protocol version: {}",
                proto_version
            )));
        }

        let (software_version, comments) = match software_and_comments.split_once(' ') {
            Some((sw, c)) => (sw.to_string(), Some(c.to_string())),
            None => (software_and_comments.to_string(), None),
        };

        if software_version.is_empty() {
            return Err(PiperError::Protocol(
                "empty software version".to_string(),
            ));
        }

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Returns the protocol version ("2.0" or "1.99").
    pub fn protocol(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comment field, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}
