//! Transport Configuration
//!
//! Selects which backend a server or client uses.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::tcp::{DEFAULT_HOST, DEFAULT_PORT};

/// Transport type selection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportType {
    /// Endpoints inside the current process
    ///
    /// Both sides must share one `InProcessTransport` value, so this variant
    /// cannot be built from configuration alone.
    InProcess,

    /// Unix domain socket (local process separation)
    #[cfg(unix)]
    UnixSocket {
        /// Directory for socket files (None = /tmp)
        dir: Option<PathBuf>,
    },

    /// TCP socket
    Tcp {
        host: String,
        port: u16,
        /// Draw a per-name port from a window above `port`
        #[serde(default)]
        randomize_ports: bool,
    },
}

impl TransportType {
    /// TCP on the default loopback address
    pub fn tcp() -> Self {
        Self::Tcp {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            randomize_ports: false,
        }
    }
}

impl Default for TransportType {
    #[cfg(unix)]
    fn default() -> Self {
        Self::UnixSocket { dir: None }
    }

    #[cfg(not(unix))]
    fn default() -> Self {
        Self::tcp()
    }
}
