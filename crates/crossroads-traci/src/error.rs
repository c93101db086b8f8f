//! Error types for the control-port protocol client.

/// Errors that can occur while talking to the simulator's control port.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Nothing accepted the connection (the simulator is not listening yet).
    #[error("simulator not listening on port {port}: {source}")]
    NotListening {
        /// The control port that was dialed.
        port: u16,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// An established connection failed mid-run (EOF, reset, timeout).
    #[error("connection to simulator lost: {reason}")]
    ConnectionLost {
        /// What went wrong on the wire.
        reason: String,
    },

    /// The simulator speaks an older protocol than this client supports.
    #[error("unsupported protocol API version {found} (need at least {minimum})")]
    VersionMismatch {
        /// Version reported by the simulator.
        found: i32,
        /// Oldest version this client understands.
        minimum: i32,
    },

    /// A frame could not be decoded.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The simulator answered a command with an error status.
    #[error("command 0x{command:02x} failed: {description}")]
    CommandFailed {
        /// The command id that failed.
        command: u8,
        /// The simulator's error description.
        description: String,
    },
}

impl ProtocolError {
    /// Whether a connection attempt that failed this way may be retried.
    ///
    /// Only "not listening yet" is transient. A protocol mismatch or a
    /// garbled handshake will not fix itself.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NotListening { .. })
    }

    /// Whether the connection itself is gone.
    pub const fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }

    /// Build a [`ProtocolError::ConnectionLost`] from any displayable cause.
    pub fn lost(reason: impl core::fmt::Display) -> Self {
        Self::ConnectionLost {
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_not_listening_is_retryable() {
        let refused = ProtocolError::NotListening {
            port: 8813,
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(refused.is_retryable());
        assert!(!ProtocolError::VersionMismatch { found: 1, minimum: 18 }.is_retryable());
        assert!(!ProtocolError::Malformed(String::from("x")).is_retryable());
        assert!(!ProtocolError::lost("eof").is_retryable());
    }

    #[test]
    fn lost_is_connection_lost() {
        assert!(ProtocolError::lost("reset").is_connection_lost());
        assert!(!ProtocolError::Malformed(String::from("x")).is_connection_lost());
    }
}
