use thiserror::Error;

/// Error reported by a [`MachineControl`] implementation.
///
/// The IPMI layer never inspects the message; handlers map any machine
/// failure to the `Unspecified` completion code.
#[derive(Debug, Error)]
#[error("machine control error: {0}")]
pub struct MachineError(pub String);

impl MachineError {
    /// Convenience constructor.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Power state of the managed machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// The machine is powered on.
    On,
    /// The machine is powered off.
    Off,
}

/// Reset operations the machine layer can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Power the machine on.
    On,
    /// Immediately power the machine off.
    ForceOff,
    /// Immediately restart the machine.
    ForceRestart,
    /// Request an orderly guest shutdown.
    GracefulShutdown,
    /// Request an orderly guest restart.
    GracefulRestart,
}

/// Whether a boot source override is in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOverrideEnabled {
    /// No override; the machine boots normally.
    Disabled,
    /// Override applies to the next boot only.
    Once,
    /// Override applies to every boot.
    Continuous,
}

/// The boot device an override selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootTarget {
    /// No specific device.
    None,
    /// Network (PXE) boot.
    Pxe,
    /// Local disk.
    Hdd,
    /// Optical media.
    Cd,
    /// Firmware setup screen.
    BiosSetup,
}

/// Firmware mode used for the override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// UEFI boot.
    Uefi,
    /// Legacy BIOS boot.
    Legacy,
}

/// A boot source override record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootOverride {
    /// Whether the override is active, and for how long.
    pub enabled: BootOverrideEnabled,
    /// The device to boot from.
    pub target: BootTarget,
    /// The firmware mode to boot in.
    pub mode: BootMode,
}

impl Default for BootOverride {
    fn default() -> Self {
        Self {
            enabled: BootOverrideEnabled::Disabled,
            target: BootTarget::None,
            mode: BootMode::Uefi,
        }
    }
}

/// Power and boot operations the IPMI core needs from the machine layer.
///
/// Implementations may block briefly (a control-channel query), but must
/// not block indefinitely; handlers call these without holding any BMC
/// state lock.
pub trait MachineControl: Send + Sync {
    /// Current power state. May fail transiently.
    fn power_state(&self) -> Result<PowerState, MachineError>;

    /// Perform a power/reset operation.
    fn reset(&self, kind: ResetKind) -> Result<(), MachineError>;

    /// The current boot source override.
    fn boot_override(&self) -> BootOverride;

    /// Validate and store a boot source override.
    fn set_boot_override(&self, record: BootOverride) -> Result<(), MachineError>;
}
