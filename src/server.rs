use std::sync::Arc;

use tokio::net::{ToSocketAddrs, UdpSocket};
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::Result;
use crate::machine::MachineControl;
use crate::observe;
use crate::state::BmcState;

/// Maximum UDP datagram we accept.
///
/// IPMI packets are small; 4 KiB is a conservative upper bound.
const MAX_DATAGRAM_SIZE: usize = 4096;

/// The IPMI LAN server: RMCP / RMCP+ over UDP, conventionally port 623.
///
/// Each datagram is processed to completion before the next read; handler
/// execution is bounded and non-blocking apart from brief machine-control
/// calls.
pub struct IpmiServer {
    engine: Arc<Engine>,
}

impl IpmiServer {
    /// Create a server over the given machine and BMC state.
    ///
    /// `admin_user` / `admin_pass` form the fallback RAKP identity used
    /// when a console authenticates with a name that is not in the user
    /// table.
    pub fn new(
        machine: Arc<dyn MachineControl>,
        state: Arc<BmcState>,
        admin_user: &str,
        admin_pass: &str,
    ) -> Self {
        Self {
            engine: Arc::new(Engine::new(machine, state, admin_user, admin_pass)),
        }
    }

    /// Bind a UDP socket and serve until the socket fails.
    pub async fn listen_and_serve(&self, addr: impl ToSocketAddrs) -> Result<()> {
        let socket = UdpSocket::bind(addr).await?;
        info!(addr = %socket.local_addr()?, "IPMI server listening");
        self.serve(&socket).await
    }

    /// Serve on an existing socket (useful for tests and for callers that
    /// pick the port themselves).
    pub async fn serve(&self, socket: &UdpSocket) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, peer) = socket.recv_from(&mut buf).await?;

            match self.engine.handle_datagram(&buf[..n]) {
                Ok(Some(resp)) => {
                    if let Err(err) = socket.send_to(&resp, peer).await {
                        warn!(%peer, error = %err, "IPMI response send failed");
                    }
                }
                Ok(None) => {}
                Err(err) => observe::record_dropped("udp", &err),
            }
        }
    }

    /// Process a single raw datagram and return the reply, if any.
    ///
    /// This is the transport-free entry point the UDP loop uses; it is
    /// public so embedders and tests can drive the protocol engine
    /// without a socket.
    pub fn handle_datagram(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        self.engine.handle_datagram(data)
    }
}
