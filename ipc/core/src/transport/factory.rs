//! Transport Factory
//!
//! Builds the transport named by configuration at startup.

use std::sync::Arc;

use super::config::TransportType;
use super::tcp::{PortRegistry, TcpTransport};
use super::traits::{Transport, TransportError};

#[cfg(unix)]
use super::unix_socket::UnixSocketTransport;

/// Create a transport based on configuration
///
/// Every call returns a fresh transport. For TCP that includes a fresh
/// [`PortRegistry`]; share one `Arc<dyn Transport>` between a server and a
/// client in the same process when randomized ports are in use.
///
/// # Errors
///
/// Returns `TransportError::InvalidState` if `InProcess` is requested; both
/// sides must share the same `InProcessTransport`, so build it directly.
pub fn create_transport(transport: &TransportType) -> Result<Arc<dyn Transport>, TransportError> {
    match transport {
        TransportType::InProcess => Err(TransportError::InvalidState(
            "InProcess transport must be shared by both sides; use InProcessTransport::new() directly".into(),
        )),

        #[cfg(unix)]
        TransportType::UnixSocket { dir } => {
            let transport = match dir {
                Some(dir) => UnixSocketTransport::new(dir.clone()),
                None => UnixSocketTransport::default(),
            };
            Ok(Arc::new(transport))
        }

        TransportType::Tcp {
            host,
            port,
            randomize_ports,
        } => {
            let registry = if *randomize_ports {
                PortRegistry::randomized(*port)
            } else {
                PortRegistry::new(*port)
            };
            Ok(Arc::new(TcpTransport::new(host.clone(), Arc::new(registry))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_inprocess_transport_fails() {
        let result = create_transport(&TransportType::InProcess);
        match result {
            Err(TransportError::InvalidState(msg)) => assert!(msg.contains("InProcess")),
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_create_unix_socket_transport() {
        let transport = create_transport(&TransportType::UnixSocket {
            dir: Some("/tmp/ipc-test".into()),
        })
        .unwrap();
        assert!(format!("{transport:?}").contains("/tmp/ipc-test"));
    }

    #[test]
    fn test_create_tcp_transport() {
        let transport = create_transport(&TransportType::tcp()).unwrap();
        assert!(format!("{transport:?}").contains("127.0.0.1"));
    }
}
