use crate::error::{Error, Result};
use crate::wire::ipmi_checksum;

/// Framing byte terminating an IPMI message.
pub(crate) const VM_MSG_CHAR: u8 = 0xA0;
/// Framing byte terminating a control command.
pub(crate) const VM_CMD_CHAR: u8 = 0xA1;
/// Escape byte; the following byte carries the original value with bit 4
/// set.
pub(crate) const VM_ESCAPE_CHAR: u8 = 0xAA;

/// VM hardware control command codes.
///
/// Only `VERSION` and `CAPABILITIES` have receive-side behavior; the
/// rest belong to the BMC-to-VM direction of the protocol.
#[allow(dead_code)]
pub(crate) mod vm_cmd {
    pub const NO_ATTN: u8 = 0x00;
    pub const ATTN: u8 = 0x01;
    pub const ATTN_IRQ: u8 = 0x02;
    pub const POWER_OFF: u8 = 0x03;
    pub const RESET: u8 = 0x04;
    pub const ENABLE_IRQ: u8 = 0x05;
    pub const DISABLE_IRQ: u8 = 0x06;
    pub const SEND_NMI: u8 = 0x07;
    pub const CAPABILITIES: u8 = 0x08;
    pub const GRACEFUL_SHUTDOWN: u8 = 0x09;
    pub const VERSION: u8 = 0xFF;
}

/// VM capability bitmap flags.
#[allow(dead_code)]
pub(crate) mod vm_cap {
    pub const POWER: u8 = 0x01;
    pub const RESET: u8 = 0x02;
    pub const IRQ: u8 = 0x04;
    pub const NMI: u8 = 0x08;
    pub const ATTN: u8 = 0x10;
    pub const GRACEFUL_SHUTDOWN: u8 = 0x20;
}

/// An IPMI request received over the VM transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VmIpmiRequest {
    pub seq: u8,
    pub netfn: u8,
    pub lun: u8,
    pub cmd: u8,
    pub data: Vec<u8>,
}

/// Escape the three framing bytes inside a frame body.
pub(crate) fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        if b == VM_MSG_CHAR || b == VM_CMD_CHAR || b == VM_ESCAPE_CHAR {
            out.push(VM_ESCAPE_CHAR);
            out.push(b | 0x10);
        } else {
            out.push(b);
        }
    }
    out
}

/// Reverse the escape encoding. A trailing escape byte with no follow
/// byte is a hard error.
pub(crate) fn unescape(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&b) = iter.next() {
        if b == VM_ESCAPE_CHAR {
            let &next = iter
                .next()
                .ok_or(Error::Protocol("trailing escape byte in VM frame"))?;
            out.push(next & !0x10);
        } else {
            out.push(b);
        }
    }
    Ok(out)
}

/// Parse an unescaped IPMI request: `[seq] [netfn<<2|lun] [cmd] [data...]
/// [checksum]`. The checksum covers the entire frame.
pub(crate) fn parse_ipmi_request(data: &[u8]) -> Result<VmIpmiRequest> {
    if data.len() < 4 {
        return Err(Error::Protocol("VM IPMI request too short"));
    }

    let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    if sum != 0 {
        return Err(Error::Protocol("VM IPMI request checksum mismatch"));
    }

    Ok(VmIpmiRequest {
        seq: data[0],
        netfn: (data[1] >> 2) & 0x3F,
        lun: data[1] & 0x03,
        cmd: data[2],
        data: data[3..data.len() - 1].to_vec(),
    })
}

/// Build an IPMI response frame: `[seq] [netfn<<2|lun] [cmd] [cc]
/// [data...] [checksum]`.
pub(crate) fn build_ipmi_response(
    seq: u8,
    netfn: u8,
    lun: u8,
    cmd: u8,
    code: u8,
    data: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + data.len());
    out.push(seq);
    out.push((netfn << 2) | (lun & 0x03));
    out.push(cmd);
    out.push(code);
    out.extend_from_slice(data);
    out.push(ipmi_checksum(&out));
    out
}

/// Split a control command into its code and argument bytes.
pub(crate) fn parse_control_command(data: &[u8]) -> Result<(u8, &[u8])> {
    let (&cmd, rest) = data
        .split_first()
        .ok_or(Error::Protocol("empty VM control command"))?;
    Ok((cmd, rest))
}

/// Escape a frame body and append its terminator.
pub(crate) fn frame(body: &[u8], terminator: u8) -> Vec<u8> {
    let mut out = escape(body);
    out.push(terminator);
    out
}
