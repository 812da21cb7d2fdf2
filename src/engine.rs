use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::commands::{self, CommandContext};
use crate::crypto::{self, SecretBytes};
use crate::debug::dump_hex;
use crate::error::{Error, Result};
use crate::machine::MachineControl;
use crate::observe;
use crate::session::{Ipmi15State, SessionKeys, SessionStore};
use crate::state::BmcState;
use crate::types::{CompletionCode, app_cmd, netfn};
use crate::wire::{self, Message, PlusHeader, algorithm, payload_type, rmcpplus_status};

/// ASF IANA Enterprise Number, carried in presence ping/pong frames.
const ASF_IANA: u32 = 0x0000_11BE;
/// ASF message type: Presence Ping.
const ASF_PRESENCE_PING: u8 = 0x80;
/// ASF message type: Presence Pong.
const ASF_PRESENCE_PONG: u8 = 0x40;

/// The RMCP / RMCP+ protocol engine.
///
/// Demultiplexes inbound datagrams into ASF pings, IPMI v1.5 frames, and
/// RMCP+ session traffic; orchestrates the Open Session / RAKP handshake;
/// and runs authenticated+encrypted data payloads through the command
/// dispatcher.
pub(crate) struct Engine {
    machine: Arc<dyn MachineControl>,
    state: Arc<BmcState>,
    sessions: SessionStore,
    ipmi15: Ipmi15State,
    admin_user: Vec<u8>,
    admin_pass: SecretBytes,
}

impl Engine {
    pub(crate) fn new(
        machine: Arc<dyn MachineControl>,
        state: Arc<BmcState>,
        admin_user: &str,
        admin_pass: &str,
    ) -> Self {
        Self {
            machine,
            state,
            sessions: SessionStore::new(),
            ipmi15: Ipmi15State::new(),
            admin_user: admin_user.as_bytes().to_vec(),
            admin_pass: SecretBytes::new(admin_pass.as_bytes().to_vec()),
        }
    }

    /// Process one datagram and produce the reply, if any.
    pub(crate) fn handle_datagram(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        dump_hex("rx datagram", data);

        let (class, payload) = wire::parse_rmcp(data)?;

        if class == wire::RMCP_CLASS_ASF {
            return self.handle_asf(payload);
        }
        if class != wire::RMCP_CLASS_IPMI {
            return Err(Error::protocol_owned(format!(
                "unsupported RMCP class {class:#04x}"
            )));
        }

        let response = if payload.first() == Some(&wire::RMCPPLUS_AUTH_TYPE) {
            self.handle_rmcpplus(payload)?
        } else {
            self.handle_ipmi15(payload)?
        };

        Ok(response.map(|frame| wire::serialize_rmcp(wire::RMCP_CLASS_IPMI, &frame)))
    }

    /// Answer an ASF Presence Ping with a Presence Pong; other ASF types
    /// are dropped silently.
    fn handle_asf(&self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        if payload.len() < 8 {
            return Err(Error::Protocol("ASF message too short"));
        }

        let msg_type = payload[4];
        let msg_tag = payload[5];
        if msg_type != ASF_PRESENCE_PING {
            debug!(msg_type, "ignoring ASF message");
            return Ok(None);
        }

        let mut resp = vec![0u8; 28];
        resp[0] = wire::RMCP_VERSION;
        resp[1] = wire::RMCP_RESERVED;
        resp[2] = wire::RMCP_SEQ_NO_ACK;
        resp[3] = wire::RMCP_CLASS_ASF;

        resp[4..8].copy_from_slice(&ASF_IANA.to_be_bytes());
        resp[8] = ASF_PRESENCE_PONG;
        resp[9] = msg_tag;
        resp[10] = 0x00; // reserved
        resp[11] = 0x10; // data length

        resp[12..16].copy_from_slice(&ASF_IANA.to_be_bytes());
        // OEM-defined field stays zero.
        resp[20] = 0x81; // supported entities: IPMI + ASF 1.0
        // Supported interactions and the trailing reserved bytes stay zero.

        Ok(Some(resp))
    }

    /// IPMI v1.5 session-wrapped request.
    fn handle_ipmi15(&self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        let (header, msg) = wire::parse_ipmi15(payload)?;

        let (code, data) = self.dispatch_timed("udp", &msg);
        let body =
            wire::build_response_message(msg.netfn() | 0x01, msg.command, code.as_u8(), &data, msg.seq_lun);

        Ok(Some(wire::serialize_ipmi15_response(&header, &body)))
    }

    /// RMCP+ session frame: session setup or a data payload.
    fn handle_rmcpplus(&self, frame: &[u8]) -> Result<Option<Vec<u8>>> {
        let header = wire::parse_plus_header(frame)?;

        let payload_end = 12usize + header.payload_len as usize;
        if frame.len() < payload_end {
            return Err(Error::Protocol("RMCP+ payload exceeds frame"));
        }
        let payload = &frame[12..payload_end];

        match header.payload_type_num() {
            payload_type::OPEN_SESSION_REQUEST => self.handle_open_session(payload),
            payload_type::RAKP_1 => self.handle_rakp1(payload),
            payload_type::RAKP_3 => self.handle_rakp3(payload),
            payload_type::IPMI => self.handle_data_payload(frame, &header, payload),
            other => {
                warn!(payload_type = other, "unsupported RMCP+ payload type");
                Ok(None)
            }
        }
    }

    /// Open Session Request: only cipher suite 3 is accepted.
    fn handle_open_session(&self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        if payload.len() < 32 {
            return Err(Error::Protocol("open session request too short"));
        }

        let tag = payload[0];
        let remote_console_session_id = u32::from_le_bytes(
            payload[4..8]
                .try_into()
                .map_err(|_| Error::Protocol("invalid remote session id"))?,
        );
        let auth_alg = payload[12] & 0x3F;
        let integrity_alg = payload[20] & 0x3F;
        let confidentiality_alg = payload[28] & 0x3F;

        let status = if auth_alg != algorithm::AUTH_RAKP_HMAC_SHA1 {
            rmcpplus_status::INVALID_AUTH_ALGORITHM
        } else if integrity_alg != algorithm::INTEGRITY_HMAC_SHA1_96 {
            rmcpplus_status::INVALID_INTEGRITY_ALGORITHM
        } else if confidentiality_alg != algorithm::CONFIDENTIALITY_AES_CBC_128 {
            rmcpplus_status::INVALID_CONFIDENTIALITY_ALGORITHM
        } else {
            rmcpplus_status::NO_ERRORS
        };

        if status != rmcpplus_status::NO_ERRORS {
            debug!(auth_alg, integrity_alg, confidentiality_alg, status, "refusing cipher suite");
            return Ok(Some(open_session_error(tag, status, remote_console_session_id)));
        }

        let Some(session_id) = self.sessions.create(remote_console_session_id) else {
            warn!("session store full, refusing open session");
            return Ok(Some(open_session_error(
                tag,
                rmcpplus_status::INSUFFICIENT_RESOURCES,
                remote_console_session_id,
            )));
        };

        let mut resp = Vec::with_capacity(36);
        resp.push(tag);
        resp.push(rmcpplus_status::NO_ERRORS);
        resp.push(0x04); // maximum privilege level: Administrator
        resp.push(0x00); // reserved
        resp.extend_from_slice(&remote_console_session_id.to_le_bytes());
        resp.extend_from_slice(&session_id.to_le_bytes());
        for (kind, alg) in [
            (0x00u8, auth_alg),
            (0x01, integrity_alg),
            (0x02, confidentiality_alg),
        ] {
            resp.extend_from_slice(&[kind, 0x00, 0x00, 0x08, alg, 0x00, 0x00, 0x00]);
        }

        Ok(Some(wire::encode_plus_frame(
            payload_type::OPEN_SESSION_RESPONSE,
            0,
            0,
            &resp,
        )))
    }

    /// RAKP Message 1: resolve the user, record the console's nonce, and
    /// answer with our nonce, GUID, and the RAKP2 auth code.
    fn handle_rakp1(&self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        if payload.len() < 28 {
            return Err(Error::Protocol("RAKP message 1 too short"));
        }

        let tag = payload[0];
        let session_id = u32::from_le_bytes(
            payload[4..8]
                .try_into()
                .map_err(|_| Error::Protocol("invalid managed session id"))?,
        );
        let console_random: [u8; 16] = payload[8..24]
            .try_into()
            .map_err(|_| Error::Protocol("invalid console random"))?;
        let privilege = payload[24];
        let user_len = payload[27] as usize;

        let Some(remote_console_session_id) =
            self.sessions.with_session(session_id, |s| s.remote_console_session_id)
        else {
            warn!(session_id, "RAKP1 for unknown session");
            return Ok(None);
        };

        if user_len > 16 || payload.len() < 28 + user_len {
            debug!(user_len, "RAKP1 user name rejected");
            return Ok(Some(rakp_status_frame(
                payload_type::RAKP_2,
                tag,
                rmcpplus_status::INVALID_USER_NAME,
                remote_console_session_id,
            )));
        }
        let user_name = payload[28..28 + user_len].to_vec();

        // Resolve the password: BMC user table first, then the configured
        // admin identity.
        let password = match self.state.lookup_user_by_name(&user_name) {
            Some(user_id) => self
                .state
                .user_password(user_id)
                .map(SecretBytes::new),
            None if user_name == self.admin_user => Some(self.admin_pass.clone()),
            None => None,
        };
        let Some(password) = password else {
            debug!("RAKP1 for unknown user");
            return Ok(Some(rakp_status_frame(
                payload_type::RAKP_2,
                tag,
                rmcpplus_status::INVALID_USER_NAME,
                remote_console_session_id,
            )));
        };

        let (managed_system_random, managed_system_guid) = self
            .sessions
            .with_session_mut(session_id, |s| {
                s.remote_console_random = console_random;
                s.requested_privilege = privilege;
                s.user_name = user_name.clone();
                s.password = Some(password.clone());
                (s.managed_system_random, s.managed_system_guid)
            })
            .ok_or(Error::Protocol("session vanished during RAKP1"))?;

        // RAKP2 auth code:
        // HMAC(pass, SIDrc | SIDms | Rrc | Rms | GUIDms | priv | ulen | uname)
        let mut input = Vec::with_capacity(58 + user_name.len());
        input.extend_from_slice(&remote_console_session_id.to_le_bytes());
        input.extend_from_slice(&session_id.to_le_bytes());
        input.extend_from_slice(&console_random);
        input.extend_from_slice(&managed_system_random);
        input.extend_from_slice(&managed_system_guid);
        input.push(privilege);
        input.push(user_name.len() as u8);
        input.extend_from_slice(&user_name);

        let auth_code = crypto::hmac_sha1(password.expose(), &input)?;

        let mut resp = Vec::with_capacity(60);
        resp.push(tag);
        resp.push(rmcpplus_status::NO_ERRORS);
        resp.extend_from_slice(&[0x00, 0x00]);
        resp.extend_from_slice(&remote_console_session_id.to_le_bytes());
        resp.extend_from_slice(&managed_system_random);
        resp.extend_from_slice(&managed_system_guid);
        resp.extend_from_slice(&auth_code);

        Ok(Some(wire::encode_plus_frame(payload_type::RAKP_2, 0, 0, &resp)))
    }

    /// RAKP Message 3: verify the console's auth code, derive the session
    /// keys, and answer RAKP4 with the integrity check value.
    fn handle_rakp3(&self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        if payload.len() < 28 {
            return Err(Error::Protocol("RAKP message 3 too short"));
        }

        let tag = payload[0];
        let status = payload[1];
        let session_id = u32::from_le_bytes(
            payload[4..8]
                .try_into()
                .map_err(|_| Error::Protocol("invalid managed session id"))?,
        );
        let auth_code = &payload[8..28];

        struct Rakp3Context {
            remote_console_session_id: u32,
            remote_console_random: [u8; 16],
            managed_system_random: [u8; 16],
            managed_system_guid: [u8; 16],
            privilege: u8,
            user_name: Vec<u8>,
            password: Option<SecretBytes>,
        }

        let Some(ctx) = self.sessions.with_session(session_id, |s| Rakp3Context {
            remote_console_session_id: s.remote_console_session_id,
            remote_console_random: s.remote_console_random,
            managed_system_random: s.managed_system_random,
            managed_system_guid: s.managed_system_guid,
            privilege: s.requested_privilege,
            user_name: s.user_name.clone(),
            password: s.password.clone(),
        }) else {
            warn!(session_id, "RAKP3 for unknown session");
            return Ok(None);
        };

        if status != rmcpplus_status::NO_ERRORS {
            // The console is reporting an error with our RAKP2; the
            // handshake is abandoned.
            debug!(session_id, status, "console aborted RAKP handshake");
            self.sessions.remove(session_id);
            return Ok(None);
        }

        let Some(password) = ctx.password else {
            warn!(session_id, "RAKP3 before RAKP1");
            return Ok(None);
        };

        // Expected auth code: HMAC(pass, Rms | SIDrc | priv | ulen | uname)
        let mut input = Vec::with_capacity(22 + ctx.user_name.len());
        input.extend_from_slice(&ctx.managed_system_random);
        input.extend_from_slice(&ctx.remote_console_session_id.to_le_bytes());
        input.push(ctx.privilege);
        input.push(ctx.user_name.len() as u8);
        input.extend_from_slice(&ctx.user_name);
        let expected = crypto::hmac_sha1(password.expose(), &input)?;

        if !crypto::ct_eq(auth_code, &expected) {
            debug!(session_id, "RAKP3 auth code mismatch");
            return Ok(Some(rakp_status_frame(
                payload_type::RAKP_4,
                tag,
                rmcpplus_status::INVALID_INTEGRITY_CHECK,
                ctx.remote_console_session_id,
            )));
        }

        // SIK = HMAC(pass, Rrc | Rms | priv | ulen | uname)
        let mut input = Vec::with_capacity(34 + ctx.user_name.len());
        input.extend_from_slice(&ctx.remote_console_random);
        input.extend_from_slice(&ctx.managed_system_random);
        input.push(ctx.privilege);
        input.push(ctx.user_name.len() as u8);
        input.extend_from_slice(&ctx.user_name);
        let sik = crypto::hmac_sha1(password.expose(), &input)?;

        let (k1, k2) = crypto::derive_k1_k2_sha1(&sik)?;
        let keys = SessionKeys {
            sik,
            k1,
            aes_key: crypto::derive_aes_key_from_k2(&k2),
        };

        self.sessions
            .with_session_mut(session_id, |s| {
                s.keys = Some(keys.clone());
                s.authenticated = true;
            })
            .ok_or(Error::Protocol("session vanished during RAKP3"))?;

        // ICV = HMAC-SHA1-96(SIK, Rrc | SIDms | GUIDms)
        let mut input = Vec::with_capacity(36);
        input.extend_from_slice(&ctx.remote_console_random);
        input.extend_from_slice(&session_id.to_le_bytes());
        input.extend_from_slice(&ctx.managed_system_guid);
        let icv = crypto::hmac_sha1_truncated_12(&sik, &input)?;

        let mut resp = Vec::with_capacity(20);
        resp.push(tag);
        resp.push(rmcpplus_status::NO_ERRORS);
        resp.extend_from_slice(&[0x00, 0x00]);
        resp.extend_from_slice(&ctx.remote_console_session_id.to_le_bytes());
        resp.extend_from_slice(&icv);

        Ok(Some(wire::encode_plus_frame(payload_type::RAKP_4, 0, 0, &resp)))
    }

    /// Authenticated (and usually encrypted) IPMI payload on an
    /// established session.
    fn handle_data_payload(
        &self,
        frame: &[u8],
        header: &PlusHeader,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let session_id = header.session_id;

        let Some((authenticated, keys, remote_console_session_id)) =
            self.sessions.with_session(session_id, |s| {
                (s.authenticated, s.keys.clone(), s.remote_console_session_id)
            })
        else {
            warn!(session_id, "data payload for unknown session");
            return Ok(None);
        };

        if !authenticated {
            warn!(session_id, "data payload on unauthenticated session");
            return Ok(None);
        }
        let keys = keys.ok_or(Error::Protocol("authenticated session without keys"))?;

        if header.is_authenticated() {
            verify_integrity_trailer(frame, header, &keys.k1)?;
        }

        let plaintext = if header.is_encrypted() {
            crypto::decrypt_ipmi_payload(&keys.aes_key, payload)?
        } else {
            payload.to_vec()
        };

        let msg = wire::parse_message(&plaintext)?;
        let (code, data) = self.dispatch_timed("udp", &msg);

        let resp_msg = wire::build_response_message(
            msg.netfn() | 0x01,
            msg.command,
            code.as_u8(),
            &data,
            msg.seq_lun,
        );

        let resp_payload = if header.is_encrypted() {
            crypto::encrypt_ipmi_payload(&keys.aes_key, &resp_msg)?
        } else {
            resp_msg
        };

        // Failed requests must not consume sequence numbers; allocate
        // only once a response exists.
        let Some(out_seq) = self.sessions.with_session(session_id, |s| s.next_out_seq()) else {
            return Ok(None);
        };

        let mut out = wire::encode_plus_frame(
            header.payload_type,
            remote_console_session_id,
            out_seq,
            &resp_payload,
        );

        if header.is_authenticated() {
            append_integrity_trailer(&mut out, &keys.k1)?;
        }

        if (msg.netfn(), msg.command) == (netfn::APP, app_cmd::CLOSE_SESSION) {
            debug!(session_id, "closing session");
            self.sessions.remove(session_id);
        }

        Ok(Some(out))
    }

    /// Dispatch a command and record the outcome.
    fn dispatch_timed(&self, mode: &'static str, msg: &Message) -> (CompletionCode, Vec<u8>) {
        let ctx = CommandContext {
            machine: self.machine.as_ref(),
            state: self.state.as_ref(),
            ipmi15: &self.ipmi15,
        };

        let started = Instant::now();
        let (code, data) = commands::dispatch(msg, &ctx);
        observe::record_command(mode, msg.netfn(), msg.command, started.elapsed(), code);
        (code, data)
    }

    #[cfg(test)]
    pub(crate) fn sessions(&self) -> &SessionStore {
        &self.sessions
    }
}

/// Short Open Session response carrying only an error status.
fn open_session_error(tag: u8, status: u8, remote_console_session_id: u32) -> Vec<u8> {
    let mut resp = Vec::with_capacity(8);
    resp.push(tag);
    resp.push(status);
    resp.extend_from_slice(&[0x00, 0x00]);
    resp.extend_from_slice(&remote_console_session_id.to_le_bytes());
    wire::encode_plus_frame(payload_type::OPEN_SESSION_RESPONSE, 0, 0, &resp)
}

/// Short RAKP2/RAKP4 frame carrying only a status byte.
fn rakp_status_frame(
    payload_type_num: u8,
    tag: u8,
    status: u8,
    remote_console_session_id: u32,
) -> Vec<u8> {
    let mut resp = Vec::with_capacity(8);
    resp.push(tag);
    resp.push(status);
    resp.extend_from_slice(&[0x00, 0x00]);
    resp.extend_from_slice(&remote_console_session_id.to_le_bytes());
    wire::encode_plus_frame(payload_type_num, 0, 0, &resp)
}

/// Verify the HMAC-SHA1-96 trailer on an inbound session frame. The
/// authenticated range runs from the auth-type byte through next-header.
fn verify_integrity_trailer(frame: &[u8], header: &PlusHeader, k1: &[u8; 20]) -> Result<()> {
    let payload_end = 12 + header.payload_len as usize;
    if frame.len() < payload_end + 2 + 12 {
        return Err(Error::Protocol("authenticated frame too short"));
    }

    let auth_code_start = frame.len() - 12;
    let expected = crypto::hmac_sha1_truncated_12(k1, &frame[..auth_code_start])?;
    if !crypto::ct_eq(&frame[auth_code_start..], &expected) {
        return Err(Error::AuthenticationFailed("session frame auth code mismatch"));
    }

    let next_header = frame[auth_code_start - 1];
    if next_header != wire::RMCPPLUS_NEXT_HEADER {
        return Err(Error::Protocol("unexpected session trailer next header"));
    }

    let pad_len = frame[auth_code_start - 2] as usize;
    let pad_start = (auth_code_start - 2)
        .checked_sub(pad_len)
        .ok_or(Error::Protocol("session trailer pad length mismatch"))?;
    if pad_start < payload_end {
        return Err(Error::Protocol("session trailer pad length mismatch"));
    }
    if frame[pad_start..auth_code_start - 2].iter().any(|&b| b != 0xFF) {
        return Err(Error::Protocol("invalid integrity pad bytes"));
    }

    Ok(())
}

/// Append integrity padding, pad length, next header, and the
/// HMAC-SHA1-96 auth code to an outbound session frame.
///
/// The padding aligns the authenticated range (session header through
/// next-header) to 4 bytes; it is computed per frame, not assumed.
fn append_integrity_trailer(frame: &mut Vec<u8>, k1: &[u8; 20]) -> Result<()> {
    let pad_len = (4 - ((frame.len() + 2) % 4)) % 4;
    frame.extend(std::iter::repeat_n(0xFF, pad_len));
    frame.push(pad_len as u8);
    frame.push(wire::RMCPPLUS_NEXT_HEADER);

    let auth_code = crypto::hmac_sha1_truncated_12(k1, frame)?;
    frame.extend_from_slice(&auth_code);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::testing::FakeMachine;
    use crate::machine::{BootMode, BootOverrideEnabled, BootTarget};

    const ADMIN: &str = "admin";
    const PASSWORD: &str = "password";

    struct Fixture {
        engine: Engine,
        machine: Arc<FakeMachine>,
        state: Arc<BmcState>,
    }

    fn fixture() -> Fixture {
        let machine = Arc::new(FakeMachine::on());
        let state = Arc::new(BmcState::new(ADMIN, PASSWORD));
        let engine = Engine::new(machine.clone(), state.clone(), ADMIN, PASSWORD);
        Fixture {
            engine,
            machine,
            state,
        }
    }

    /// Wrap a session frame in RMCP and run it through the engine,
    /// returning the response session frame (RMCP header stripped).
    fn exchange(engine: &Engine, session_frame: Vec<u8>) -> Vec<u8> {
        let datagram = wire::serialize_rmcp(wire::RMCP_CLASS_IPMI, &session_frame);
        let resp = engine
            .handle_datagram(&datagram)
            .expect("handle datagram")
            .expect("response expected");
        assert_eq!(resp[3], wire::RMCP_CLASS_IPMI);
        resp[4..].to_vec()
    }

    fn open_session_request(tag: u8, rc_sid: u32, auth: u8, integrity: u8, conf: u8) -> Vec<u8> {
        let mut p = Vec::with_capacity(32);
        p.push(tag);
        p.push(0x00); // requested privilege: highest
        p.extend_from_slice(&[0x00, 0x00]);
        p.extend_from_slice(&rc_sid.to_le_bytes());
        for (kind, alg) in [(0x00u8, auth), (0x01, integrity), (0x02, conf)] {
            p.extend_from_slice(&[kind, 0x00, 0x00, 0x08, alg, 0x00, 0x00, 0x00]);
        }
        wire::encode_plus_frame(payload_type::OPEN_SESSION_REQUEST, 0, 0, &p)
    }

    fn rakp1_request(tag: u8, ms_sid: u32, console_random: &[u8; 16], user: &[u8]) -> Vec<u8> {
        let mut p = Vec::with_capacity(28 + user.len());
        p.push(tag);
        p.extend_from_slice(&[0x00, 0x00, 0x00]);
        p.extend_from_slice(&ms_sid.to_le_bytes());
        p.extend_from_slice(console_random);
        p.push(0x04); // requested privilege: Administrator
        p.extend_from_slice(&[0x00, 0x00]);
        p.push(user.len() as u8);
        p.extend_from_slice(user);
        wire::encode_plus_frame(payload_type::RAKP_1, 0, 0, &p)
    }

    fn rakp3_request(tag: u8, ms_sid: u32, auth_code: &[u8; 20]) -> Vec<u8> {
        let mut p = Vec::with_capacity(28);
        p.push(tag);
        p.push(0x00);
        p.extend_from_slice(&[0x00, 0x00]);
        p.extend_from_slice(&ms_sid.to_le_bytes());
        p.extend_from_slice(auth_code);
        wire::encode_plus_frame(payload_type::RAKP_3, 0, 0, &p)
    }

    /// A request message as the remote console builds it.
    fn request_message(netfn_val: u8, cmd: u8, seq_lun: u8, data: &[u8]) -> Vec<u8> {
        let netfn_lun = netfn_val << 2;
        let mut msg = vec![
            wire::BMC_ADDR,
            netfn_lun,
            wire::ipmi_checksum(&[wire::BMC_ADDR, netfn_lun]),
            wire::REMOTE_CONSOLE_ADDR,
            seq_lun,
            cmd,
        ];
        msg.extend_from_slice(data);
        let cksum = wire::ipmi_checksum(&msg[3..]);
        msg.push(cksum);
        msg
    }

    struct EstablishedSession {
        ms_sid: u32,
        keys: SessionKeys,
    }

    /// Drive a complete Open Session + RAKP handshake as "admin".
    fn establish(engine: &Engine) -> EstablishedSession {
        let rc_sid = 0xAAAA_BBBB;
        let open_resp = exchange(
            engine,
            open_session_request(0x01, rc_sid, 0x01, 0x01, 0x01),
        );
        assert_eq!(open_resp[13], rmcpplus_status::NO_ERRORS);
        let ms_sid = u32::from_le_bytes(open_resp[20..24].try_into().expect("sid"));

        let console_random = [0x5Au8; 16];
        let rakp2 = exchange(engine, rakp1_request(0x02, ms_sid, &console_random, ADMIN.as_bytes()));
        assert_eq!(rakp2[13], rmcpplus_status::NO_ERRORS);
        let ms_random: [u8; 16] = rakp2[20..36].try_into().expect("random");
        let ms_guid: [u8; 16] = rakp2[36..52].try_into().expect("guid");

        // Console side of RAKP3: HMAC(pass, Rms | SIDrc | priv | ulen | uname)
        let mut input = Vec::new();
        input.extend_from_slice(&ms_random);
        input.extend_from_slice(&rc_sid.to_le_bytes());
        input.push(0x04);
        input.push(ADMIN.len() as u8);
        input.extend_from_slice(ADMIN.as_bytes());
        let auth_code = crypto::hmac_sha1(PASSWORD.as_bytes(), &input).expect("hmac");

        let rakp4 = exchange(engine, rakp3_request(0x03, ms_sid, &auth_code));
        assert_eq!(rakp4[13], rmcpplus_status::NO_ERRORS);

        // Derive the same keys the BMC did and check the RAKP4 ICV.
        let mut input = Vec::new();
        input.extend_from_slice(&console_random);
        input.extend_from_slice(&ms_random);
        input.push(0x04);
        input.push(ADMIN.len() as u8);
        input.extend_from_slice(ADMIN.as_bytes());
        let sik = crypto::hmac_sha1(PASSWORD.as_bytes(), &input).expect("sik");

        let mut input = Vec::new();
        input.extend_from_slice(&console_random);
        input.extend_from_slice(&ms_sid.to_le_bytes());
        input.extend_from_slice(&ms_guid);
        let expected_icv = crypto::hmac_sha1_truncated_12(&sik, &input).expect("icv");
        assert_eq!(&rakp4[20..32], &expected_icv);

        let (k1, k2) = crypto::derive_k1_k2_sha1(&sik).expect("derive");
        EstablishedSession {
            ms_sid,
            keys: SessionKeys {
                sik,
                k1,
                aes_key: crypto::derive_aes_key_from_k2(&k2),
            },
        }
    }

    /// Build an encrypted+authenticated data packet for the session.
    fn data_packet(session: &EstablishedSession, inbound_seq: u32, msg: &[u8]) -> Vec<u8> {
        let payload =
            crypto::encrypt_ipmi_payload(&session.keys.aes_key, msg).expect("encrypt");
        let mut frame = wire::encode_plus_frame(
            0x80 | 0x40 | payload_type::IPMI,
            session.ms_sid,
            inbound_seq,
            &payload,
        );
        append_integrity_trailer(&mut frame, &session.keys.k1).expect("trailer");
        frame
    }

    /// Verify and decrypt a data response, returning (out_seq, body).
    fn open_data_response(session: &EstablishedSession, frame: &[u8]) -> (u32, Vec<u8>) {
        let header = wire::parse_plus_header(frame).expect("header");
        assert!(header.is_encrypted());
        assert!(header.is_authenticated());
        verify_integrity_trailer(frame, &header, &session.keys.k1).expect("verify");

        let payload = &frame[12..12 + header.payload_len as usize];
        let body =
            crypto::decrypt_ipmi_payload(&session.keys.aes_key, payload).expect("decrypt");
        (header.session_seq, body)
    }

    #[test]
    fn asf_presence_ping_gets_pong() {
        let f = fixture();
        let ping = [
            0x06, 0x00, 0xFF, 0x06, 0x00, 0x00, 0x11, 0xBE, 0x80, 0x42, 0x00, 0x00,
        ];
        let pong = f
            .engine
            .handle_datagram(&ping)
            .expect("handle")
            .expect("pong");

        assert_eq!(pong.len(), 28);
        assert_eq!(pong[3], wire::RMCP_CLASS_ASF);
        assert_eq!(pong[8], 0x40);
        assert_eq!(pong[9], 0x42); // echoed tag
        assert_eq!(pong[20], 0x81); // IPMI + ASF 1.0
    }

    #[test]
    fn other_asf_types_are_dropped() {
        let f = fixture();
        let mut ping = vec![0x06, 0x00, 0xFF, 0x06, 0x00, 0x00, 0x11, 0xBE, 0x81, 0x42, 0x00, 0x00];
        assert!(f.engine.handle_datagram(&ping).expect("handle").is_none());
        ping.truncate(7);
        assert!(f.engine.handle_datagram(&ping).is_err());
    }

    #[test]
    fn open_session_accepts_cipher_suite_3() {
        let f = fixture();
        let resp = exchange(
            &f.engine,
            open_session_request(0x01, 0x1234_5678, 0x01, 0x01, 0x01),
        );

        assert_eq!(resp[1], payload_type::OPEN_SESSION_RESPONSE);
        assert_eq!(resp[12], 0x01); // echoed tag
        assert_eq!(resp[13], rmcpplus_status::NO_ERRORS);
        assert_eq!(
            u32::from_le_bytes(resp[16..20].try_into().expect("sid")),
            0x1234_5678
        );
        let ms_sid = u32::from_le_bytes(resp[20..24].try_into().expect("sid"));
        assert_ne!(ms_sid, 0);
        // The algorithm triple is echoed back.
        assert_eq!(resp[28], 0x01);
        assert_eq!(resp[36], 0x01);
        assert_eq!(resp[44], 0x01);
    }

    #[test]
    fn open_session_refuses_other_cipher_suites() {
        let f = fixture();

        let resp = exchange(&f.engine, open_session_request(0x01, 1, 0x00, 0x00, 0x00));
        assert_eq!(resp[13], rmcpplus_status::INVALID_AUTH_ALGORITHM);

        let resp = exchange(&f.engine, open_session_request(0x01, 1, 0x01, 0x00, 0x00));
        assert_eq!(resp[13], rmcpplus_status::INVALID_INTEGRITY_ALGORITHM);

        let resp = exchange(&f.engine, open_session_request(0x01, 1, 0x01, 0x01, 0x00));
        assert_eq!(resp[13], rmcpplus_status::INVALID_CONFIDENTIALITY_ALGORITHM);

        // No sessions were allocated for refused suites.
        assert_eq!(f.engine.sessions().len(), 0);
    }

    #[test]
    fn session_store_exhaustion_is_reported() {
        let f = fixture();
        for i in 0..crate::session::MAX_SESSIONS {
            let resp = exchange(
                &f.engine,
                open_session_request(0x01, i as u32, 0x01, 0x01, 0x01),
            );
            assert_eq!(resp[13], rmcpplus_status::NO_ERRORS);
        }

        let resp = exchange(&f.engine, open_session_request(0x01, 999, 0x01, 0x01, 0x01));
        assert_eq!(resp[13], rmcpplus_status::INSUFFICIENT_RESOURCES);
    }

    #[test]
    fn full_rakp_handshake_authenticates_session() {
        let f = fixture();
        let session = establish(&f.engine);

        let authenticated = f
            .engine
            .sessions()
            .with_session(session.ms_sid, |s| (s.authenticated, s.keys.is_some()))
            .expect("session");
        assert_eq!(authenticated, (true, true));
    }

    #[test]
    fn rakp1_unknown_user_is_refused() {
        let f = fixture();
        let open_resp = exchange(
            &f.engine,
            open_session_request(0x01, 0x1111_2222, 0x01, 0x01, 0x01),
        );
        let ms_sid = u32::from_le_bytes(open_resp[20..24].try_into().expect("sid"));

        let rakp2 = exchange(
            &f.engine,
            rakp1_request(0x02, ms_sid, &[0u8; 16], b"nobody"),
        );
        assert_eq!(rakp2[1], payload_type::RAKP_2);
        assert_eq!(rakp2[13], rmcpplus_status::INVALID_USER_NAME);
    }

    #[test]
    fn rakp1_resolves_users_from_bmc_state() {
        let f = fixture();
        f.state.set_user_name(3, b"maas");
        f.state.set_user_password(3, b"maas-secret");

        let open_resp = exchange(
            &f.engine,
            open_session_request(0x01, 0x3333_4444, 0x01, 0x01, 0x01),
        );
        let ms_sid = u32::from_le_bytes(open_resp[20..24].try_into().expect("sid"));

        let console_random = [0x11u8; 16];
        let rakp2 = exchange(
            &f.engine,
            rakp1_request(0x02, ms_sid, &console_random, b"maas"),
        );
        assert_eq!(rakp2[13], rmcpplus_status::NO_ERRORS);

        // The RAKP2 auth code must be keyed with the slot's password.
        let ms_random: [u8; 16] = rakp2[20..36].try_into().expect("random");
        let ms_guid: [u8; 16] = rakp2[36..52].try_into().expect("guid");
        let mut input = Vec::new();
        input.extend_from_slice(&0x3333_4444u32.to_le_bytes());
        input.extend_from_slice(&ms_sid.to_le_bytes());
        input.extend_from_slice(&console_random);
        input.extend_from_slice(&ms_random);
        input.extend_from_slice(&ms_guid);
        input.push(0x04);
        input.push(4);
        input.extend_from_slice(b"maas");
        let expected = crypto::hmac_sha1(b"maas-secret", &input).expect("hmac");
        assert_eq!(&rakp2[52..72], &expected);
    }

    #[test]
    fn rakp3_with_wrong_password_fails() {
        let f = fixture();
        let open_resp = exchange(
            &f.engine,
            open_session_request(0x01, 0x5555_6666, 0x01, 0x01, 0x01),
        );
        let ms_sid = u32::from_le_bytes(open_resp[20..24].try_into().expect("sid"));

        let rakp2 = exchange(
            &f.engine,
            rakp1_request(0x02, ms_sid, &[0x77u8; 16], ADMIN.as_bytes()),
        );
        assert_eq!(rakp2[13], rmcpplus_status::NO_ERRORS);

        let rakp4 = exchange(&f.engine, rakp3_request(0x03, ms_sid, &[0u8; 20]));
        assert_eq!(rakp4[1], payload_type::RAKP_4);
        assert_eq!(rakp4[13], rmcpplus_status::INVALID_INTEGRITY_CHECK);

        let authenticated = f
            .engine
            .sessions()
            .with_session(ms_sid, |s| s.authenticated)
            .expect("session");
        assert!(!authenticated);
    }

    #[test]
    fn encrypted_get_chassis_status() {
        let f = fixture();
        let session = establish(&f.engine);

        let msg = request_message(netfn::CHASSIS, 0x01, 0x04, &[]);
        let resp = exchange(&f.engine, data_packet(&session, 1, &msg));

        let (out_seq, body) = open_data_response(&session, &resp);
        assert_eq!(out_seq, 1);

        let parsed = wire::parse_message(&body).expect("parse");
        assert_eq!(parsed.netfn(), netfn::CHASSIS | 0x01);
        assert_eq!(parsed.command, 0x01);
        assert_eq!(parsed.seq_lun, 0x04); // echoed
        assert_eq!(parsed.data[0], 0x00); // completion code
        assert_eq!(parsed.data[1] & 0x01, 0x01); // power on
    }

    #[test]
    fn outbound_sequence_increments_per_response() {
        let f = fixture();
        let session = establish(&f.engine);

        for expected_seq in 1..=4u32 {
            let msg = request_message(netfn::APP, app_cmd::GET_DEVICE_ID, 0x00, &[]);
            let resp = exchange(&f.engine, data_packet(&session, expected_seq, &msg));
            let (out_seq, _) = open_data_response(&session, &resp);
            assert_eq!(out_seq, expected_seq);
        }
    }

    #[test]
    fn boot_override_via_encrypted_set_boot_options() {
        let f = fixture();
        let session = establish(&f.engine);

        let msg = request_message(
            netfn::CHASSIS,
            0x08,
            0x08,
            &[0x05, 0xA0, 0x04, 0x00, 0x00, 0x00],
        );
        let resp = exchange(&f.engine, data_packet(&session, 1, &msg));
        let (_, body) = open_data_response(&session, &resp);
        let parsed = wire::parse_message(&body).expect("parse");
        assert_eq!(parsed.data[0], 0x00);

        let boot = f.machine.boot_override();
        assert_eq!(boot.enabled, BootOverrideEnabled::Once);
        assert_eq!(boot.target, BootTarget::Pxe);
        assert_eq!(boot.mode, BootMode::Uefi);

        let msg = request_message(netfn::CHASSIS, 0x09, 0x0C, &[0x05, 0x00, 0x00]);
        let resp = exchange(&f.engine, data_packet(&session, 2, &msg));
        let (_, body) = open_data_response(&session, &resp);
        let parsed = wire::parse_message(&body).expect("parse");
        assert_eq!(parsed.data[0], 0x00);
        assert_eq!(parsed.data[1], 0x01);
        assert_eq!(parsed.data[2], 0x80 | 0x20);
        assert_eq!(parsed.data[3], 0x04);
    }

    #[test]
    fn tampered_data_packet_is_rejected() {
        let f = fixture();
        let session = establish(&f.engine);

        let msg = request_message(netfn::APP, app_cmd::GET_DEVICE_ID, 0x00, &[]);
        let mut frame = data_packet(&session, 1, &msg);
        let len = frame.len();
        frame[len - 1] ^= 0xFF; // corrupt the auth code

        let datagram = wire::serialize_rmcp(wire::RMCP_CLASS_IPMI, &frame);
        let err = f.engine.handle_datagram(&datagram).unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
    }

    #[test]
    fn close_session_removes_the_session() {
        let f = fixture();
        let session = establish(&f.engine);
        assert_eq!(f.engine.sessions().len(), 1);

        let msg = request_message(netfn::APP, app_cmd::CLOSE_SESSION, 0x10, &[]);
        let resp = exchange(&f.engine, data_packet(&session, 1, &msg));
        let (_, body) = open_data_response(&session, &resp);
        let parsed = wire::parse_message(&body).expect("parse");
        assert_eq!(parsed.data[0], 0x00);

        assert_eq!(f.engine.sessions().len(), 0);
    }

    #[test]
    fn ipmi15_get_channel_auth_capabilities() {
        let f = fixture();

        // ipmitool opens with an unauthenticated v1.5 request.
        let body = request_message(netfn::APP, app_cmd::GET_CHANNEL_AUTH_CAPABILITIES, 0x00, &[0x8E, 0x04]);
        let mut frame = vec![wire::AUTH_TYPE_NONE];
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.push(body.len() as u8);
        frame.extend_from_slice(&body);

        let resp = exchange(&f.engine, frame);
        assert_eq!(resp[0], wire::AUTH_TYPE_NONE);
        let msg_len = resp[9] as usize;
        let msg = wire::parse_message(&resp[10..10 + msg_len]).expect("parse");
        assert_eq!(msg.netfn(), netfn::APP | 0x01);
        assert_eq!(msg.data[0], 0x00); // completion code
        assert_eq!(msg.data[1], 0x01); // channel
        assert_eq!(msg.data[2], 0x97); // auth type support
    }

    #[test]
    fn ipmi15_session_challenge_and_activation() {
        let f = fixture();

        let mut challenge_req = vec![0x00];
        challenge_req.extend_from_slice(b"admin");
        challenge_req.resize(17, 0);
        let body = request_message(netfn::APP, app_cmd::GET_SESSION_CHALLENGE, 0x04, &challenge_req);
        let mut frame = vec![wire::AUTH_TYPE_NONE];
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.push(body.len() as u8);
        frame.extend_from_slice(&body);

        let resp = exchange(&f.engine, frame);
        let msg_len = resp[9] as usize;
        let msg = wire::parse_message(&resp[10..10 + msg_len]).expect("parse");
        assert_eq!(msg.data[0], 0x00);
        assert_eq!(msg.data.len(), 1 + 20);
    }
}
