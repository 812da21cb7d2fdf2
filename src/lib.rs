#![deny(unsafe_code)]
#![warn(missing_docs)]

//! The IPMI core of a virtual BMC for hypervisor-hosted machines.
//!
//! The crate implements the managed-system side of IPMI v2.0 over
//! RMCP/RMCP+ (UDP, conventionally port 623):
//! - ASF presence ping/pong discovery
//! - RMCP+ Open Session handshake, cipher suite 3 only
//! - RAKP 1-4 key exchange with per-session SIK/K1/K2 derivation
//! - Integrity (HMAC-SHA1-96) and confidentiality (AES-CBC-128)
//! - A command dispatcher covering the App, Chassis, and Transport
//!   network functions, backed by an in-memory BMC state store
//!
//! A secondary server ([`VmServer`]) multiplexes the same command
//! dispatcher over the OpenIPMI VM escaped-byte-stream transport, the
//! protocol a hypervisor's external-BMC character device speaks.
//!
//! Power and boot operations are delegated to a [`MachineControl`]
//! implementation supplied by the embedder; everything else (Redfish,
//! process supervision, configuration) lives outside this crate.

mod commands;
mod crypto;
mod debug;
mod engine;
mod error;
mod machine;
mod observe;
mod server;
mod session;
mod state;
mod types;
mod vm_protocol;
mod vm_server;
mod wire;

pub use crate::error::{Error, Result};
pub use crate::machine::{
    BootMode, BootOverride, BootOverrideEnabled, BootTarget, MachineControl, MachineError,
    PowerState, ResetKind,
};
pub use crate::server::IpmiServer;
pub use crate::state::{BmcState, ChannelAccess, ChannelInfo, UserAccess};
pub use crate::types::CompletionCode;
pub use crate::vm_server::VmServer;
