use crate::error::{Error, Result};

/// RMCP header values.
pub(crate) const RMCP_VERSION: u8 = 0x06;
pub(crate) const RMCP_RESERVED: u8 = 0x00;
pub(crate) const RMCP_SEQ_NO_ACK: u8 = 0xFF;
pub(crate) const RMCP_CLASS_ASF: u8 = 0x06;
pub(crate) const RMCP_CLASS_IPMI: u8 = 0x07;

/// RMCP+ session auth type/format.
pub(crate) const RMCPPLUS_AUTH_TYPE: u8 = 0x06;

/// RMCP+ session trailer next header value.
pub(crate) const RMCPPLUS_NEXT_HEADER: u8 = 0x07;

/// IPMI v1.5 auth type for unauthenticated sessions.
pub(crate) const AUTH_TYPE_NONE: u8 = 0x00;

/// LAN message addresses: the BMC and the remote console software ID.
pub(crate) const BMC_ADDR: u8 = 0x20;
pub(crate) const REMOTE_CONSOLE_ADDR: u8 = 0x81;

/// Payload type numbers (see IPMI v2.0 Table 13-16).
///
/// Only the baseline types needed for IPMI messaging and session setup.
pub(crate) mod payload_type {
    /// Standard IPMI payload (LAN message) wrapped in RMCP+.
    pub const IPMI: u8 = 0x00;
    /// RMCP+ Open Session Request.
    pub const OPEN_SESSION_REQUEST: u8 = 0x10;
    /// RMCP+ Open Session Response.
    pub const OPEN_SESSION_RESPONSE: u8 = 0x11;
    /// RAKP Message 1.
    pub const RAKP_1: u8 = 0x12;
    /// RAKP Message 2.
    pub const RAKP_2: u8 = 0x13;
    /// RAKP Message 3.
    pub const RAKP_3: u8 = 0x14;
    /// RAKP Message 4.
    pub const RAKP_4: u8 = 0x15;
}

/// Algorithm numbers for cipher suite 3, the only suite served.
pub(crate) mod algorithm {
    /// Authentication algorithm: RAKP-HMAC-SHA1.
    pub const AUTH_RAKP_HMAC_SHA1: u8 = 0x01;
    /// Integrity algorithm: HMAC-SHA1-96.
    pub const INTEGRITY_HMAC_SHA1_96: u8 = 0x01;
    /// Confidentiality algorithm: AES-CBC-128.
    pub const CONFIDENTIALITY_AES_CBC_128: u8 = 0x01;
}

/// RMCP+ / RAKP status codes carried in session-setup responses.
pub(crate) mod rmcpplus_status {
    pub const NO_ERRORS: u8 = 0x00;
    pub const INSUFFICIENT_RESOURCES: u8 = 0x02;
    pub const INVALID_USER_NAME: u8 = 0x0D;
    pub const INVALID_INTEGRITY_CHECK: u8 = 0x0F;
    pub const INVALID_AUTH_ALGORITHM: u8 = 0x11;
    pub const INVALID_INTEGRITY_ALGORITHM: u8 = 0x12;
    pub const INVALID_CONFIDENTIALITY_ALGORITHM: u8 = 0x13;
}

/// Parse the 4-byte RMCP header, returning the class and the payload.
pub(crate) fn parse_rmcp(data: &[u8]) -> Result<(u8, &[u8])> {
    if data.len() < 4 {
        return Err(Error::Protocol("RMCP frame too short"));
    }
    if data[0] != RMCP_VERSION {
        return Err(Error::Protocol("unsupported RMCP version"));
    }
    Ok((data[3], &data[4..]))
}

/// Wrap a payload in an RMCP frame of the given class.
pub(crate) fn serialize_rmcp(class: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.push(RMCP_VERSION);
    out.push(RMCP_RESERVED);
    out.push(RMCP_SEQ_NO_ACK);
    out.push(class);
    out.extend_from_slice(payload);
    out
}

/// An IPMI message body, shared by the LAN and VM-transport paths.
///
/// The source sequence/LUN byte of a request is echoed unchanged in the
/// response; it is how consoles pair requests with responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Message {
    #[allow(dead_code)]
    pub target_addr: u8,
    pub netfn_lun: u8,
    #[allow(dead_code)]
    pub source_addr: u8,
    pub seq_lun: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

impl Message {
    pub(crate) fn netfn(&self) -> u8 {
        (self.netfn_lun >> 2) & 0x3F
    }

    #[allow(dead_code)]
    pub(crate) fn lun(&self) -> u8 {
        self.netfn_lun & 0x03
    }
}

/// Compute the standard 2's complement checksum used by IPMI messages.
pub(crate) fn ipmi_checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

/// Parse an IPMI message body:
/// `[t-addr][netfn/lun][hdr-cksum][s-addr][s-seq-lun][cmd][data...][data-cksum]`.
pub(crate) fn parse_message(data: &[u8]) -> Result<Message> {
    if data.len() < 7 {
        return Err(Error::Protocol("IPMI message too short"));
    }

    let msg_data = if data.len() > 7 {
        data[6..data.len() - 1].to_vec()
    } else {
        Vec::new()
    };

    Ok(Message {
        target_addr: data[0],
        netfn_lun: data[1],
        source_addr: data[3],
        seq_lun: data[4],
        command: data[5],
        data: msg_data,
    })
}

/// Build a response message to the remote console: the BMC becomes the
/// source, the response bit is set in the netfn, and the request's
/// sequence/LUN byte is echoed.
pub(crate) fn build_response_message(
    netfn: u8,
    cmd: u8,
    code: u8,
    data: &[u8],
    req_seq_lun: u8,
) -> Vec<u8> {
    let target_lun = netfn << 2;

    let mut msg = Vec::with_capacity(8 + data.len());
    msg.push(REMOTE_CONSOLE_ADDR);
    msg.push(target_lun);
    msg.push(ipmi_checksum(&[REMOTE_CONSOLE_ADDR, target_lun]));

    msg.push(BMC_ADDR);
    msg.push(req_seq_lun);
    msg.push(cmd);
    msg.push(code);
    msg.extend_from_slice(data);

    let cksum = ipmi_checksum(&msg[3..]);
    msg.push(cksum);

    msg
}

/// The IPMI v1.5 session wrapper preceding a LAN message.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ipmi15Header {
    pub auth_type: u8,
    pub sequence: u32,
    pub session_id: u32,
}

/// Parse an IPMI v1.5 session wrapper and the message it carries.
pub(crate) fn parse_ipmi15(data: &[u8]) -> Result<(Ipmi15Header, Message)> {
    if data.len() < 10 {
        return Err(Error::Protocol("IPMI v1.5 session frame too short"));
    }

    let header = Ipmi15Header {
        auth_type: data[0],
        sequence: u32::from_le_bytes(
            data[1..5]
                .try_into()
                .map_err(|_| Error::Protocol("invalid session sequence"))?,
        ),
        session_id: u32::from_le_bytes(
            data[5..9]
                .try_into()
                .map_err(|_| Error::Protocol("invalid session id"))?,
        ),
    };

    // Authenticated sessions carry a 16-byte auth code before the length.
    let mut offset = 9;
    if header.auth_type != AUTH_TYPE_NONE {
        offset += 16;
        if data.len() < offset + 1 {
            return Err(Error::Protocol("IPMI v1.5 auth code truncated"));
        }
    }

    let msg_len = data[offset] as usize;
    offset += 1;
    if data.len() < offset + msg_len {
        return Err(Error::Protocol("IPMI v1.5 message truncated"));
    }

    let msg = parse_message(&data[offset..offset + msg_len])?;
    Ok((header, msg))
}

/// Serialize an IPMI v1.5 response frame, mirroring the request's auth
/// type and echoing its session ID and sequence number.
pub(crate) fn serialize_ipmi15_response(header: &Ipmi15Header, msg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(26 + msg.len());
    out.push(header.auth_type);
    out.extend_from_slice(&header.sequence.to_le_bytes());
    out.extend_from_slice(&header.session_id.to_le_bytes());

    if header.auth_type != AUTH_TYPE_NONE {
        out.extend_from_slice(&[0u8; 16]);
    }

    out.push(msg.len() as u8);
    out.extend_from_slice(msg);
    out
}

/// The RMCP+ session header (12 bytes, after the RMCP frame header).
#[derive(Debug, Clone, Copy)]
pub(crate) struct PlusHeader {
    pub payload_type: u8,
    pub session_id: u32,
    #[allow(dead_code)]
    pub session_seq: u32,
    pub payload_len: u16,
}

impl PlusHeader {
    pub(crate) fn payload_type_num(&self) -> u8 {
        self.payload_type & 0x3F
    }

    pub(crate) fn is_encrypted(&self) -> bool {
        self.payload_type & 0x80 != 0
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.payload_type & 0x40 != 0
    }
}

/// Parse an RMCP+ session header from a session frame (starting at the
/// auth-type byte).
pub(crate) fn parse_plus_header(data: &[u8]) -> Result<PlusHeader> {
    if data.len() < 12 {
        return Err(Error::Protocol("RMCP+ session frame too short"));
    }
    if data[0] != RMCPPLUS_AUTH_TYPE {
        return Err(Error::Protocol("unsupported RMCP+ auth type"));
    }

    Ok(PlusHeader {
        payload_type: data[1],
        session_id: u32::from_le_bytes(
            data[2..6]
                .try_into()
                .map_err(|_| Error::Protocol("invalid session id"))?,
        ),
        session_seq: u32::from_le_bytes(
            data[6..10]
                .try_into()
                .map_err(|_| Error::Protocol("invalid session seq"))?,
        ),
        payload_len: u16::from_le_bytes(
            data[10..12]
                .try_into()
                .map_err(|_| Error::Protocol("invalid payload len"))?,
        ),
    })
}

/// Encode an RMCP+ session frame (auth type through payload, no trailer).
pub(crate) fn encode_plus_frame(
    payload_type: u8,
    session_id: u32,
    session_seq: u32,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + payload.len());
    out.push(RMCPPLUS_AUTH_TYPE);
    out.push(payload_type);
    out.extend_from_slice(&session_id.to_le_bytes());
    out.extend_from_slice(&session_seq.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out
}
