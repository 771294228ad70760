//! Connection Status
//!
//! The state machine shared by clients and servers. Every actor holds exactly
//! one [`Status`] at a time; changes go through [`Status::can_transition_to`]
//! and are announced to the consumer as internal messages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection status of an actor
///
/// The declaration order is significant: statuses up to and including
/// [`Status::ReConnecting`] are "flushable", meaning the write loop still
/// flushes outbound frames to the transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Created, nothing attempted yet
    #[default]
    NotConnected,
    /// Server bound and waiting for a peer
    Listening,
    /// Client dial loop running
    Connecting,
    /// Handshake complete, traffic flowing
    Connected,
    /// Client lost its peer and is dialing again
    ReConnecting,
    /// Local close finished
    Closed,
    /// Local close requested
    Closing,
    /// Handshake or dial failure
    Error,
    /// Dial deadline exceeded (client only)
    Timeout,
    /// Server lost its peer and waits for a new one
    Disconnected,
}

impl Status {
    /// Human readable name, as shown to consumers
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotConnected => "Not Connected",
            Self::Listening => "Listening",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::ReConnecting => "Reconnecting",
            Self::Closed => "Closed",
            Self::Closing => "Closing",
            Self::Error => "Error",
            Self::Timeout => "Timeout",
            Self::Disconnected => "Disconnected",
        }
    }

    /// Whether no further transitions (other than a local close) can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error | Self::Timeout)
    }

    /// Whether the write loop should still flush frames in this status
    pub fn is_flushable(&self) -> bool {
        *self <= Self::ReConnecting
    }

    /// Check whether moving from `self` to `next` is a legal transition
    ///
    /// A local close is accepted from every status except `Closing` and
    /// `Closed` themselves.
    pub fn can_transition_to(&self, next: Status) -> bool {
        use Status::*;

        if next == Closing {
            return !matches!(self, Closing | Closed);
        }

        matches!(
            (self, next),
            (NotConnected, Connecting)
                | (NotConnected, Listening)
                | (Listening, Connected)
                | (Listening, Error)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Timeout)
                | (Connected, Disconnected)
                | (Connected, ReConnecting)
                | (ReConnecting, Connected)
                | (ReConnecting, Timeout)
                | (ReConnecting, Error)
                | (Disconnected, Connected)
                | (Disconnected, Error)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names() {
        assert_eq!(Status::NotConnected.to_string(), "Not Connected");
        assert_eq!(Status::ReConnecting.to_string(), "Reconnecting");
        assert_eq!(Status::Disconnected.to_string(), "Disconnected");
    }

    #[test]
    fn test_flushable_range() {
        assert!(Status::NotConnected.is_flushable());
        assert!(Status::Connected.is_flushable());
        assert!(Status::ReConnecting.is_flushable());
        assert!(!Status::Closed.is_flushable());
        assert!(!Status::Closing.is_flushable());
        assert!(!Status::Disconnected.is_flushable());
    }

    #[test]
    fn test_client_lifecycle_transitions() {
        assert!(Status::NotConnected.can_transition_to(Status::Connecting));
        assert!(Status::Connecting.can_transition_to(Status::Connected));
        assert!(Status::Connected.can_transition_to(Status::ReConnecting));
        assert!(Status::ReConnecting.can_transition_to(Status::Connected));
        assert!(Status::ReConnecting.can_transition_to(Status::Timeout));
    }

    #[test]
    fn test_server_lifecycle_transitions() {
        assert!(Status::NotConnected.can_transition_to(Status::Listening));
        assert!(Status::Listening.can_transition_to(Status::Connected));
        assert!(Status::Connected.can_transition_to(Status::Disconnected));
        assert!(Status::Disconnected.can_transition_to(Status::Connected));
        assert!(Status::Listening.can_transition_to(Status::Error));
    }

    #[test]
    fn test_close_is_accepted_from_any_open_status() {
        for status in [
            Status::NotConnected,
            Status::Listening,
            Status::Connecting,
            Status::Connected,
            Status::ReConnecting,
            Status::Error,
            Status::Timeout,
            Status::Disconnected,
        ] {
            assert!(status.can_transition_to(Status::Closing), "{status}");
        }
        assert!(!Status::Closing.can_transition_to(Status::Closing));
        assert!(!Status::Closed.can_transition_to(Status::Closing));
        assert!(Status::Closing.can_transition_to(Status::Closed));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Status::NotConnected.can_transition_to(Status::Connected));
        assert!(!Status::Timeout.can_transition_to(Status::Connected));
        assert!(!Status::Error.can_transition_to(Status::Listening));
        assert!(!Status::Closed.can_transition_to(Status::Connected));
        assert!(!Status::Connected.can_transition_to(Status::Closed));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(Status::Closed.is_terminal());
        assert!(Status::Error.is_terminal());
        assert!(Status::Timeout.is_terminal());
        assert!(!Status::Disconnected.is_terminal());
    }
}
