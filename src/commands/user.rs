use crate::state::{BmcState, UserAccess};
use crate::types::CompletionCode;

fn trim_trailing_nuls(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |pos| pos + 1);
    &bytes[..end]
}

/// Get User Access.
///
/// Request: `[channel (bits 3:0)] [user_id (bits 5:0)]`.
/// Response: `[max_users] [enabled_count] [fixed_name_count] [priv | flags]`.
pub(super) fn get_user_access(req: &[u8], state: &BmcState) -> (CompletionCode, Vec<u8>) {
    if req.len() < 2 {
        return (CompletionCode::InvalidField, Vec::new());
    }

    let user_id = req[1] & 0x3F;
    let Some(access) = state.user_access(user_id) else {
        return (CompletionCode::ParameterOutOfRange, Vec::new());
    };

    let mut flags = access.privilege_limit & 0x0F;
    if access.ipmi_messaging {
        flags |= 0x10;
    }
    if access.link_auth {
        flags |= 0x20;
    }
    if access.callin_callback {
        flags |= 0x40;
    }

    let data = vec![
        state.max_users() & 0x3F,
        state.enabled_user_count() & 0x3F,
        0x01, // one fixed-name user (the null user)
        flags,
    ];
    (CompletionCode::Ok, data)
}

/// Get User Name: a 16-byte zero-padded name field.
pub(super) fn get_user_name(req: &[u8], state: &BmcState) -> (CompletionCode, Vec<u8>) {
    if req.is_empty() {
        return (CompletionCode::InvalidField, Vec::new());
    }

    let user_id = req[0] & 0x3F;
    let Some(name) = state.user_name(user_id) else {
        return (CompletionCode::ParameterOutOfRange, Vec::new());
    };

    let mut data = vec![0u8; 16];
    let n = name.len().min(16);
    data[..n].copy_from_slice(&name[..n]);
    (CompletionCode::Ok, data)
}

/// Set User Name: `[user_id] [name (16 bytes, NUL padded)]`.
pub(super) fn set_user_name(req: &[u8], state: &BmcState) -> (CompletionCode, Vec<u8>) {
    if req.len() < 17 {
        return (CompletionCode::InvalidField, Vec::new());
    }

    let user_id = req[0] & 0x3F;
    let name = trim_trailing_nuls(&req[1..17]);

    if !state.set_user_name(user_id, name) {
        return (CompletionCode::ParameterOutOfRange, Vec::new());
    }
    (CompletionCode::Ok, Vec::new())
}

/// Set User Password: operation in bits 1:0 of byte 1.
///
/// 0 = disable user, 1 = enable user, 2 = set password, 3 = test password.
/// Bit 7 of byte 0 selects a 20-byte password field instead of 16.
pub(super) fn set_user_password(req: &[u8], state: &BmcState) -> (CompletionCode, Vec<u8>) {
    if req.len() < 2 {
        return (CompletionCode::InvalidField, Vec::new());
    }

    let user_id = req[0] & 0x3F;
    let pass_len = if req[0] & 0x80 != 0 { 20 } else { 16 };
    let operation = req[1] & 0x03;

    match operation {
        0x00 | 0x01 => {
            // Disable/enable the user; the rest of the access record is
            // left alone.
            let Some(mut access) = state.user_access(user_id) else {
                return (CompletionCode::ParameterOutOfRange, Vec::new());
            };
            access.enabled = operation == 0x01;
            state.set_user_access(user_id, access);
            (CompletionCode::Ok, Vec::new())
        }
        0x02 => {
            if req.len() < 2 + pass_len {
                return (CompletionCode::InvalidField, Vec::new());
            }
            let password = trim_trailing_nuls(&req[2..2 + pass_len]);
            if !state.set_user_password(user_id, password) {
                return (CompletionCode::ParameterOutOfRange, Vec::new());
            }
            (CompletionCode::Ok, Vec::new())
        }
        0x03 => {
            if req.len() < 2 + pass_len {
                return (CompletionCode::InvalidField, Vec::new());
            }
            let password = trim_trailing_nuls(&req[2..2 + pass_len]);
            if state.check_password(user_id, password) {
                (CompletionCode::Ok, Vec::new())
            } else {
                (CompletionCode::InvalidField, Vec::new())
            }
        }
        _ => (CompletionCode::InvalidField, Vec::new()),
    }
}

/// Set User Access. The Enabled flag is preserved; enable/disable only
/// happens through Set User Password.
pub(super) fn set_user_access(req: &[u8], state: &BmcState) -> (CompletionCode, Vec<u8>) {
    if req.len() < 4 {
        return (CompletionCode::InvalidField, Vec::new());
    }

    let ipmi_messaging = req[0] & 0x10 != 0;
    let link_auth = req[0] & 0x20 != 0;
    let callin_callback = req[0] & 0x40 != 0;
    let user_id = req[1] & 0x3F;
    let privilege_limit = req[2] & 0x0F;

    let Some(existing) = state.user_access(user_id) else {
        return (CompletionCode::ParameterOutOfRange, Vec::new());
    };

    let access = UserAccess {
        privilege_limit,
        enabled: existing.enabled,
        ipmi_messaging,
        link_auth,
        callin_callback,
    };
    state.set_user_access(user_id, access);
    (CompletionCode::Ok, Vec::new())
}
