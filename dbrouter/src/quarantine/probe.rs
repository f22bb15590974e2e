use std::io;
use std::time::Duration;

use socket2::SockRef;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use crate::cluster::NodeAddress;

/// Why a probe did not confirm that a destination is reachable.
#[derive(Error, Debug)]
pub(crate) enum ProbeError {
    /// The destination did not accept the connection.
    #[error("Destination unreachable: {0}")]
    Unreachable(io::Error),

    /// The probe itself could not be carried out.
    #[error("Probe failed: {0}")]
    Internal(io::Error),
}

impl From<io::Error> for ProbeError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::Unsupported | io::ErrorKind::OutOfMemory => ProbeError::Internal(error),
            _ => ProbeError::Unreachable(error),
        }
    }
}

/// Checks that `address` accepts TCP connections within `timeout`.
///
/// The connection is closed right away with a zero linger, so that repeated
/// probes do not leave sockets in TIME_WAIT behind.
pub(crate) async fn probe(address: &NodeAddress, timeout: Duration) -> Result<(), ProbeError> {
    let connect = TcpStream::connect((address.host(), address.port()));
    let stream = match tokio::time::timeout(timeout, connect).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ProbeError::Unreachable(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no answer within {timeout:?}"),
            )))
        }
    };

    if let Err(err) = SockRef::from(&stream).set_linger(Some(Duration::ZERO)) {
        debug!(address = %address, error = %err, "Failed to set SO_LINGER on probe socket");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn probe_of_listening_socket_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let address = NodeAddress::new("127.0.0.1", port).unwrap();

        probe(&address, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn probe_of_closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let address = NodeAddress::new("127.0.0.1", port).unwrap();

        let result = probe(&address, Duration::from_secs(1)).await;
        assert_matches!(result, Err(ProbeError::Unreachable(_)));
    }

    #[test]
    fn io_errors_are_classified() {
        assert_matches!(
            ProbeError::from(io::Error::from(io::ErrorKind::ConnectionRefused)),
            ProbeError::Unreachable(_)
        );
        // A host name resolving to nothing is as good as unreachable.
        assert_matches!(
            ProbeError::from(io::Error::from(io::ErrorKind::InvalidInput)),
            ProbeError::Unreachable(_)
        );
        assert_matches!(
            ProbeError::from(io::Error::from(io::ErrorKind::OutOfMemory)),
            ProbeError::Internal(_)
        );
    }
}
