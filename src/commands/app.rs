use crate::session::Ipmi15State;
use crate::types::CompletionCode;

/// Get Device ID: a static descriptor for a virtual BMC speaking IPMI 2.0.
pub(super) fn get_device_id() -> (CompletionCode, Vec<u8>) {
    let data = vec![
        0x20, // Device ID
        0x01, // Device Revision
        0x02, // Firmware Revision 1
        0x00, // Firmware Revision 2
        0x02, // IPMI Version (2.0)
        0xBF, // Additional Device Support
        0x00, 0x00, 0x00, // Manufacturer ID
        0x00, 0x00, // Product ID
        0x00, 0x00, 0x00, 0x00, // Aux Firmware Revision
    ];
    (CompletionCode::Ok, data)
}

/// Get Channel Authentication Capabilities.
pub(super) fn get_channel_auth_capabilities(_req: &[u8]) -> (CompletionCode, Vec<u8>) {
    let data = vec![
        0x01, // Channel number
        0x97, // Auth type support: RMCP+ | password | MD5 | MD2 | none
        0x06, // Auth status: non-null users + null users
        0x02, // Extended capabilities: IPMI 2.0 connections
        0x00, 0x00, 0x00, // OEM ID
        0x00, // OEM aux data
    ];
    (CompletionCode::Ok, data)
}

/// Get Session Challenge: returns a temporary session ID and a 16-byte
/// challenge for the IPMI v1.5 activation flow.
pub(super) fn get_session_challenge(
    req: &[u8],
    ipmi15: &Ipmi15State,
) -> (CompletionCode, Vec<u8>) {
    if req.is_empty() {
        return (CompletionCode::InvalidField, Vec::new());
    }

    let (session_id, challenge) = ipmi15.new_challenge();
    let mut data = Vec::with_capacity(20);
    data.extend_from_slice(&session_id.to_le_bytes());
    data.extend_from_slice(&challenge);
    (CompletionCode::Ok, data)
}

/// Activate Session: echoes the requested auth type and privilege,
/// allocates a non-zero session ID, and starts the inbound sequence at 1.
///
/// Request: `[auth_type] [max_priv] [challenge(16)] [initial_outbound_seq(4)]`.
pub(super) fn activate_session(req: &[u8], ipmi15: &Ipmi15State) -> (CompletionCode, Vec<u8>) {
    if req.len() < 22 {
        return (CompletionCode::InvalidField, Vec::new());
    }

    let auth_type = req[0];
    let max_priv = req[1] & 0x0F;
    let session_id = ipmi15.activate();

    let mut data = Vec::with_capacity(10);
    data.push(auth_type);
    data.extend_from_slice(&session_id.to_le_bytes());
    data.extend_from_slice(&1u32.to_le_bytes()); // initial inbound sequence
    data.push(max_priv);
    (CompletionCode::Ok, data)
}

/// Set Session Privilege Level: echo the requested privilege.
pub(super) fn set_session_privilege(req: &[u8]) -> (CompletionCode, Vec<u8>) {
    if req.is_empty() {
        return (CompletionCode::InvalidField, Vec::new());
    }
    (CompletionCode::Ok, vec![req[0]])
}

/// Close Session: always succeeds; the engine tears the session down
/// after the response is produced.
pub(super) fn close_session() -> (CompletionCode, Vec<u8>) {
    (CompletionCode::Ok, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_reports_ipmi_2_0() {
        let (code, data) = get_device_id();
        assert_eq!(code, CompletionCode::Ok);
        assert_eq!(data.len(), 15);
        assert_eq!(data[0], 0x20);
        assert_eq!(data[4], 0x02);
    }

    #[test]
    fn channel_auth_capabilities_advertise_rmcpplus() {
        let (code, data) = get_channel_auth_capabilities(&[0x8E, 0x04]);
        assert_eq!(code, CompletionCode::Ok);
        assert_eq!(data[0], 0x01);
        assert_eq!(data[1], 0x97);
        assert_eq!(data[2], 0x06);
        assert_eq!(data[3], 0x02);
    }

    #[test]
    fn session_challenge_returns_id_and_challenge() {
        let ipmi15 = Ipmi15State::new();
        let (code, data) = get_session_challenge(&[0x02], &ipmi15);
        assert_eq!(code, CompletionCode::Ok);
        assert_eq!(data.len(), 20);

        let (code, _) = get_session_challenge(&[], &ipmi15);
        assert_eq!(code, CompletionCode::InvalidField);
    }

    #[test]
    fn activate_session_echoes_and_starts_at_one() {
        let ipmi15 = Ipmi15State::new();
        let mut req = vec![0x02, 0x04];
        req.extend_from_slice(&[0u8; 16]);
        req.extend_from_slice(&[1, 0, 0, 0]);

        let (code, data) = activate_session(&req, &ipmi15);
        assert_eq!(code, CompletionCode::Ok);
        assert_eq!(data.len(), 10);
        assert_eq!(data[0], 0x02);
        assert_ne!(u32::from_le_bytes(data[1..5].try_into().expect("sid")), 0);
        assert_eq!(u32::from_le_bytes(data[5..9].try_into().expect("seq")), 1);
        assert_eq!(data[9], 0x04);

        let (code, _) = activate_session(&req[..10], &ipmi15);
        assert_eq!(code, CompletionCode::InvalidField);
    }

    #[test]
    fn set_session_privilege_echoes_request() {
        let (code, data) = set_session_privilege(&[0x04]);
        assert_eq!(code, CompletionCode::Ok);
        assert_eq!(data, vec![0x04]);

        let (code, _) = set_session_privilege(&[]);
        assert_eq!(code, CompletionCode::InvalidField);
    }
}
