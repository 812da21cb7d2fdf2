use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, info, warn};

use crate::commands::{self, CommandContext};
use crate::error::Result;
use crate::machine::MachineControl;
use crate::observe;
use crate::session::Ipmi15State;
use crate::state::BmcState;
use crate::vm_protocol::{
    self, VM_CMD_CHAR, VM_MSG_CHAR, VmIpmiRequest, vm_cmd,
};
use crate::wire::{BMC_ADDR, Message, REMOTE_CONSOLE_ADDR};

struct VmInner {
    machine: Arc<dyn MachineControl>,
    state: Arc<BmcState>,
    ipmi15: Ipmi15State,
    /// Capability bitmap last announced by the peer.
    vm_caps: Mutex<u8>,
}

/// TCP server speaking the OpenIPMI VM wire protocol.
///
/// This is the side a hypervisor's external-BMC character device connects
/// to; IPMI requests received here run through the same command
/// dispatcher as the LAN path. Exactly one peer is expected per
/// connection.
#[derive(Clone)]
pub struct VmServer {
    inner: Arc<VmInner>,
}

impl VmServer {
    /// Create a VM-transport server over the given machine and BMC state.
    pub fn new(machine: Arc<dyn MachineControl>, state: Arc<BmcState>) -> Self {
        Self {
            inner: Arc::new(VmInner {
                machine,
                state,
                ipmi15: Ipmi15State::new(),
                vm_caps: Mutex::new(0),
            }),
        }
    }

    /// Bind a TCP listener and serve until it fails.
    pub async fn listen_and_serve(&self, addr: impl ToSocketAddrs) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "VM transport listening");
        self.serve(listener).await
    }

    /// Accept connections on an existing listener, one worker task per
    /// connection.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "VM transport connection accepted");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.handle_connection(stream).await {
                    warn!(%peer, error = %err, "VM transport connection failed");
                }
            });
        }
    }

    /// Drive a single connection: read framed messages, dispatch control
    /// commands and IPMI requests, and reply in kind. Returns `Ok(())`
    /// on EOF.
    pub async fn handle_connection<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut pending: Vec<u8> = Vec::new();
        let mut buf = [0u8; 512];

        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                debug!("VM transport connection closed");
                return Ok(());
            }

            for &byte in &buf[..n] {
                if byte != VM_MSG_CHAR && byte != VM_CMD_CHAR {
                    pending.push(byte);
                    continue;
                }

                // Unescape errors are fatal for the connection; the peer's
                // framing is broken.
                let body = vm_protocol::unescape(&pending)?;
                pending.clear();

                match byte {
                    VM_CMD_CHAR => self.handle_control_command(&body, &mut stream).await?,
                    _ => self.handle_ipmi_request(&body, &mut stream).await?,
                }
            }
        }
    }

    async fn handle_control_command<S>(&self, body: &[u8], stream: &mut S) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let (cmd, rest) = match vm_protocol::parse_control_command(body) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "invalid VM control command");
                return Ok(());
            }
        };

        match cmd {
            vm_cmd::VERSION => {
                let version = rest.first().copied().unwrap_or(0);
                info!(version, "VM peer announced protocol version");
            }
            vm_cmd::CAPABILITIES => {
                let caps = rest.first().copied().unwrap_or(0);
                *self.inner.vm_caps.lock().expect("caps lock") = caps;
                info!(caps, "VM peer announced capabilities");

                let frame = vm_protocol::frame(&[vm_cmd::NO_ATTN], VM_CMD_CHAR);
                stream.write_all(&frame).await?;
            }
            other => {
                debug!(cmd = other, "ignoring VM control command");
            }
        }
        Ok(())
    }

    async fn handle_ipmi_request<S>(&self, body: &[u8], stream: &mut S) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let req = match vm_protocol::parse_ipmi_request(body) {
            Ok(req) => req,
            Err(err) => {
                warn!(error = %err, "dropping invalid VM IPMI request");
                return Ok(());
            }
        };

        let response = self.dispatch(&req);
        let frame = vm_protocol::frame(&response, VM_MSG_CHAR);
        stream.write_all(&frame).await?;
        Ok(())
    }

    /// Feed a VM-transport request through the shared command dispatcher
    /// and build the response frame body.
    fn dispatch(&self, req: &VmIpmiRequest) -> Vec<u8> {
        let msg = Message {
            target_addr: BMC_ADDR,
            netfn_lun: (req.netfn << 2) | (req.lun & 0x03),
            source_addr: REMOTE_CONSOLE_ADDR,
            seq_lun: req.seq,
            command: req.cmd,
            data: req.data.clone(),
        };

        let ctx = CommandContext {
            machine: self.inner.machine.as_ref(),
            state: self.inner.state.as_ref(),
            ipmi15: &self.inner.ipmi15,
        };

        let started = Instant::now();
        let (code, data) = commands::dispatch(&msg, &ctx);
        observe::record_command("vm", req.netfn, req.cmd, started.elapsed(), code);

        vm_protocol::build_ipmi_response(
            req.seq,
            req.netfn | 0x01,
            req.lun,
            req.cmd,
            code.as_u8(),
            &data,
        )
    }

    /// Capability bitmap last announced by the peer (zero before any
    /// announcement).
    pub fn peer_capabilities(&self) -> u8 {
        *self.inner.vm_caps.lock().expect("caps lock")
    }
}
