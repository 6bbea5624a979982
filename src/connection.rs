use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, ProtocolWriteError};
use crate::protocol::DeviceCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected { peer: SocketAddrV4 },
}

/// Sole owner of the controller socket.
///
/// Never reconnects on its own: after a failed write the connection is
/// dropped and the caller decides when to try again.
#[derive(Debug)]
pub struct Connection {
    stream: Option<(TcpStream, SocketAddrV4)>,
    activity: watch::Sender<u64>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        let (activity, _) = watch::channel(0);
        Self {
            stream: None,
            activity,
        }
    }

    /// Receiver that observes a new value after every successful send.
    pub fn subscribe_activity(&self) -> watch::Receiver<u64> {
        self.activity.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        match &self.stream {
            Some((_, peer)) => ConnectionState::Connected { peer: *peer },
            None => ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn connect(
        &mut self,
        endpoint: SocketAddrV4,
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        if let Some((_, peer)) = &self.stream {
            return Err(ConnectionError::AlreadyConnected(*peer));
        }

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ConnectionError::Io {
                    addr: endpoint,
                    source,
                });
            }
            Err(_) => {
                return Err(ConnectionError::Timeout {
                    addr: endpoint,
                    timeout,
                });
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%endpoint, "failed to disable nagle: {err}");
        }

        info!(%endpoint, "connected to led controller");
        self.stream = Some((stream, endpoint));
        Ok(())
    }

    /// Writes one encoded frame. A failed write tears the connection down.
    pub async fn send(&mut self, command: &DeviceCommand) -> Result<(), ProtocolWriteError> {
        let frame = command.encode()?;
        let Some((stream, peer)) = self.stream.as_mut() else {
            return Err(ProtocolWriteError::NotConnected);
        };

        if let Err(err) = stream.write_all(&frame).await {
            warn!(peer = %peer, opcode = command.opcode(), "write failed; dropping connection: {err}");
            self.stream = None;
            return Err(ProtocolWriteError::Io(err));
        }

        self.activity
            .send_modify(|count| *count = count.wrapping_add(1));
        Ok(())
    }

    /// Closes the socket if one is open. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        if let Some((mut stream, peer)) = self.stream.take() {
            if let Err(err) = stream.shutdown().await {
                debug!(%peer, "socket shutdown reported an error: {err}");
            }
            info!(%peer, "disconnected from led controller");
        }
    }
}

/// Builds an IPv4 address from four user-supplied octet fields.
pub fn parse_octets<S: AsRef<str>>(octets: &[S]) -> Result<Ipv4Addr, ConnectionError> {
    if octets.len() != 4 {
        return Err(ConnectionError::InvalidEndpoint(format!(
            "expected 4 octets, got {}",
            octets.len()
        )));
    }
    let mut parsed = [0u8; 4];
    for (slot, raw) in parsed.iter_mut().zip(octets) {
        let raw = raw.as_ref().trim();
        *slot = raw.parse::<u8>().map_err(|_| {
            ConnectionError::InvalidEndpoint(format!("'{raw}' is not an octet (0-255)"))
        })?;
    }
    Ok(Ipv4Addr::from(parsed))
}
