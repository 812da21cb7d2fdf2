use tracing::info;

use crate::machine::{
    BootMode, BootOverride, BootOverrideEnabled, BootTarget, MachineControl, PowerState, ResetKind,
};
use crate::types::{CompletionCode, chassis_control};

/// Get Chassis Status: bit 0 of byte 0 reflects the power state.
pub(super) fn get_chassis_status(machine: &dyn MachineControl) -> (CompletionCode, Vec<u8>) {
    let state = match machine.power_state() {
        Ok(state) => state,
        Err(_) => return (CompletionCode::Unspecified, Vec::new()),
    };

    let power_byte = if state == PowerState::On { 0x01 } else { 0x00 };
    let data = vec![
        power_byte, // Current power state
        0x00,       // Last power event
        0x00,       // Misc chassis state
        0x00,       // Front panel button capabilities
    ];
    (CompletionCode::Ok, data)
}

/// Chassis Control: map the control value onto machine reset operations.
pub(super) fn chassis_control(
    req: &[u8],
    machine: &dyn MachineControl,
) -> (CompletionCode, Vec<u8>) {
    if req.is_empty() {
        return (CompletionCode::InvalidField, Vec::new());
    }

    let control = req[0];
    let result = match control {
        chassis_control::POWER_DOWN => machine.reset(ResetKind::ForceOff),
        chassis_control::POWER_UP => machine.reset(ResetKind::On),
        chassis_control::POWER_CYCLE => machine
            .reset(ResetKind::ForceOff)
            .and_then(|()| machine.reset(ResetKind::On)),
        chassis_control::HARD_RESET => machine.reset(ResetKind::ForceRestart),
        chassis_control::PULSE | chassis_control::SOFT_OFF => {
            info!(control, "chassis control accepted as no-op");
            Ok(())
        }
        _ => return (CompletionCode::InvalidField, Vec::new()),
    };

    match result {
        Ok(()) => (CompletionCode::Ok, Vec::new()),
        Err(_) => (CompletionCode::Unspecified, Vec::new()),
    }
}

/// Chassis Identify: a virtual chassis has no beacon LED; accept and log.
pub(super) fn chassis_identify() -> (CompletionCode, Vec<u8>) {
    info!("chassis identify requested");
    (CompletionCode::Ok, Vec::new())
}

/// Set System Boot Options: only parameter 5 (boot flags) is meaningful;
/// other selectors are accepted and ignored.
pub(super) fn set_boot_options(
    req: &[u8],
    machine: &dyn MachineControl,
) -> (CompletionCode, Vec<u8>) {
    if req.is_empty() {
        return (CompletionCode::InvalidField, Vec::new());
    }

    let param = req[0] & 0x7F;
    if param != 5 {
        return (CompletionCode::Ok, Vec::new());
    }

    if req.len() < 6 {
        return (CompletionCode::InvalidField, Vec::new());
    }
    let flags = &req[1..];

    let enabled = if flags[0] & 0x80 != 0 {
        BootOverrideEnabled::Once
    } else {
        BootOverrideEnabled::Disabled
    };
    let mode = if flags[0] & 0x20 != 0 {
        BootMode::Uefi
    } else {
        BootMode::Legacy
    };
    let target = match (flags[1] >> 2) & 0x0F {
        0x01 => BootTarget::Pxe,
        0x02 => BootTarget::Hdd,
        0x05 => BootTarget::Cd,
        0x06 => BootTarget::BiosSetup,
        _ => BootTarget::None,
    };

    let record = BootOverride {
        enabled,
        target,
        mode,
    };
    match machine.set_boot_override(record) {
        Ok(()) => (CompletionCode::Ok, Vec::new()),
        Err(_) => (CompletionCode::InvalidField, Vec::new()),
    }
}

/// Get System Boot Options: reconstruct parameter 5 from the current
/// override; other selectors are out of range.
pub(super) fn get_boot_options(
    req: &[u8],
    machine: &dyn MachineControl,
) -> (CompletionCode, Vec<u8>) {
    if req.is_empty() {
        return (CompletionCode::InvalidField, Vec::new());
    }

    let param = req[0] & 0x7F;
    if param != 5 {
        return (CompletionCode::ParameterOutOfRange, Vec::new());
    }

    let boot = machine.boot_override();
    let mut data = vec![0u8; 5];

    data[0] = 0x01; // parameter version

    if boot.enabled != BootOverrideEnabled::Disabled {
        data[1] = 0x80;
    }
    if boot.mode == BootMode::Uefi {
        data[1] |= 0x20;
    }

    let device_bits: u8 = match boot.target {
        BootTarget::Pxe => 0x01,
        BootTarget::Hdd => 0x02,
        BootTarget::Cd => 0x05,
        BootTarget::BiosSetup => 0x06,
        BootTarget::None => 0x00,
    };
    data[2] = device_bits << 2;

    (CompletionCode::Ok, data)
}
