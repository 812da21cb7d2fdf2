use crate::state::{BmcState, ChannelAccess};
use crate::types::CompletionCode;

/// Get Channel Access.
///
/// Response byte 0:
/// `[alerting_disabled(7)] [per_msg_auth(6)] [user_level_auth(5)] [reserved(4:3)] [access_mode(2:0)]`.
/// The alerting bit is the inverse of the stored flag.
pub(super) fn get_channel_access(req: &[u8], state: &BmcState) -> (CompletionCode, Vec<u8>) {
    if req.len() < 2 {
        return (CompletionCode::InvalidField, Vec::new());
    }

    let channel = req[0] & 0x0F;
    let access = state.channel_access(channel);

    let mut byte0 = access.access_mode & 0x07;
    if access.user_level_auth {
        byte0 |= 0x20;
    }
    if access.per_msg_auth {
        byte0 |= 0x40;
    }
    if !access.alerting_enabled {
        byte0 |= 0x80;
    }

    let byte1 = access.privilege_limit & 0x0F;
    (CompletionCode::Ok, vec![byte0, byte1])
}

/// Set Channel Access: parses the same bit layout, three bytes in.
pub(super) fn set_channel_access(req: &[u8], state: &BmcState) -> (CompletionCode, Vec<u8>) {
    if req.len() < 3 {
        return (CompletionCode::InvalidField, Vec::new());
    }

    let channel = req[0] & 0x0F;
    let access = ChannelAccess {
        access_mode: req[1] & 0x07,
        user_level_auth: req[1] & 0x20 != 0,
        per_msg_auth: req[1] & 0x40 != 0,
        alerting_enabled: req[1] & 0x80 == 0,
        privilege_limit: req[2] & 0x0F,
    };

    state.set_channel_access(channel, access);
    (CompletionCode::Ok, Vec::new())
}

/// Get Channel Info. Channel 0x0E means "the channel this request arrived
/// on" and resolves to the LAN channel.
pub(super) fn get_channel_info(req: &[u8], state: &BmcState) -> (CompletionCode, Vec<u8>) {
    if req.is_empty() {
        return (CompletionCode::InvalidField, Vec::new());
    }

    let mut channel = req[0] & 0x0F;
    if channel == 0x0E {
        channel = 1;
    }

    let info = state.channel_info(channel);
    let byte3 = ((info.session_support & 0x03) << 6) | (info.active_sessions & 0x3F);

    let data = vec![
        info.channel_number,
        info.channel_medium,
        info.channel_protocol,
        byte3,
        0x00,
        0x00,
        0x00, // vendor ID
        0x00,
        0x00, // aux channel info
    ];
    (CompletionCode::Ok, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> BmcState {
        BmcState::new("admin", "password")
    }

    #[test]
    fn get_channel_access_reports_inverted_alerting() {
        let s = state();
        let (code, data) = get_channel_access(&[0x01, 0x40], &s);
        assert_eq!(code, CompletionCode::Ok);
        // Channel 1 stores alerting_enabled = false, so the wire reports
        // alerting_disabled = 1 along with per-msg and user-level auth
        // over access mode 2.
        assert_eq!(data[0], 0xE2);
        assert_eq!(data[1], 0x04);
    }

    #[test]
    fn channel_access_round_trip() {
        let s = state();
        // Shared mode, user-level auth, alerting enabled (bit 7 clear).
        let (code, _) = set_channel_access(&[0x02, 0x23, 0x03], &s);
        assert_eq!(code, CompletionCode::Ok);

        let stored = s.channel_access(2);
        assert_eq!(stored.access_mode, 3);
        assert!(stored.user_level_auth);
        assert!(!stored.per_msg_auth);
        assert!(stored.alerting_enabled);
        assert_eq!(stored.privilege_limit, 3);

        let (code, data) = get_channel_access(&[0x02, 0x40], &s);
        assert_eq!(code, CompletionCode::Ok);
        assert_eq!(data[0], 0x23);
        assert_eq!(data[1], 0x03);
    }

    #[test]
    fn channel_access_rejects_short_requests() {
        let s = state();
        let (code, _) = get_channel_access(&[0x01], &s);
        assert_eq!(code, CompletionCode::InvalidField);
        let (code, _) = set_channel_access(&[0x01, 0x22], &s);
        assert_eq!(code, CompletionCode::InvalidField);
    }

    #[test]
    fn channel_info_resolves_current_channel() {
        let s = state();
        let (code, data) = get_channel_info(&[0x0E], &s);
        assert_eq!(code, CompletionCode::Ok);
        assert_eq!(data.len(), 9);
        assert_eq!(data[0], 0x01);
        assert_eq!(data[1], 0x04); // 802.3 LAN
        assert_eq!(data[2], 0x01); // IPMB-1.0
        assert_eq!(data[3], 0x02 << 6); // multi-session, no active count
    }

    #[test]
    fn channel_info_for_explicit_channel() {
        let s = state();
        let (code, data) = get_channel_info(&[0x03], &s);
        assert_eq!(code, CompletionCode::Ok);
        assert_eq!(data[0], 0x03);

        let (code, _) = get_channel_info(&[], &s);
        assert_eq!(code, CompletionCode::InvalidField);
    }
}
