// TPKT / X.224 framing for the RDP connection sequence
//
// Only the first exchange is covered: the client's Connection Request with
// an RDP Negotiation Request, and the server's Connection Confirm with an
// optional Negotiation Response or Negotiation Failure.

use crate::probe::error::DecodeError;

pub const TPKT_VERSION: u8 = 0x03;
pub const TPKT_HEADER_LEN: usize = 4;
/// Largest Connection Confirm we are willing to buffer.
pub const MAX_CONFIRM_LEN: usize = 1024;

const MAX_COOKIE_USER: usize = 64;

const X224_CONNECTION_REQUEST: u8 = 0xE0;
const X224_CONNECTION_CONFIRM: u8 = 0xD0;
const X224_FIXED_HEADER_LEN: usize = 7;

const TYPE_RDP_NEG_REQ: u8 = 0x01;
const TYPE_RDP_NEG_RSP: u8 = 0x02;
const TYPE_RDP_NEG_FAILURE: u8 = 0x03;
const NEG_BLOCK_LEN: usize = 8;

pub const PROTOCOL_RDP: u32 = 0x0000_0000;
pub const PROTOCOL_SSL: u32 = 0x0000_0001;
pub const PROTOCOL_HYBRID: u32 = 0x0000_0002;
pub const PROTOCOL_RDSTLS: u32 = 0x0000_0004;
pub const PROTOCOL_HYBRID_EX: u32 = 0x0000_0008;
pub const PROTOCOL_RDSAAD: u32 = 0x0000_0010;

pub const EXTENDED_CLIENT_DATA_SUPPORTED: u8 = 0x01;
pub const DYNVC_GFX_PROTOCOL_SUPPORTED: u8 = 0x02;
pub const NEGRSP_FLAG_RESERVED: u8 = 0x04;
pub const RESTRICTED_ADMIN_MODE_SUPPORTED: u8 = 0x08;
pub const REDIRECTED_AUTHENTICATION_MODE_SUPPORTED: u8 = 0x10;

pub const SSL_REQUIRED_BY_SERVER: u32 = 0x0000_0001;
pub const SSL_NOT_ALLOWED_BY_SERVER: u32 = 0x0000_0002;
pub const SSL_CERT_NOT_ON_SERVER: u32 = 0x0000_0003;
pub const INCONSISTENT_FLAGS: u32 = 0x0000_0004;
pub const HYBRID_REQUIRED_BY_SERVER: u32 = 0x0000_0005;
pub const SSL_WITH_USER_AUTH_REQUIRED_BY_SERVER: u32 = 0x0000_0006;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// Legacy server: the Connection Confirm carries no negotiation block.
    Absent,
    Response { flags: u8, selected_protocol: u32 },
    Failure { code: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfirm {
    pub negotiation: Negotiation,
}

impl ConnectionConfirm {
    /// Best-effort Windows family guessed from what the server negotiated.
    pub fn os_label(&self) -> String {
        let label = match self.negotiation {
            Negotiation::Absent => "Windows 2000/XP/Server 2003",
            Negotiation::Failure { .. } => "Windows XP/Server 2003",
            Negotiation::Response { flags, .. } => {
                if flags & RESTRICTED_ADMIN_MODE_SUPPORTED != 0 {
                    "Windows 10/Server 2016+"
                } else if flags & DYNVC_GFX_PROTOCOL_SUPPORTED != 0 {
                    "Windows 8/Server 2012"
                } else if flags & EXTENDED_CLIENT_DATA_SUPPORTED != 0 {
                    "Windows 7/Server 2008 R2"
                } else {
                    "Windows Vista/Server 2008"
                }
            }
        };
        label.to_string()
    }

    /// True when the server insists on CredSSP (network-level authentication).
    pub fn requires_nla(&self) -> bool {
        match self.negotiation {
            Negotiation::Response { selected_protocol, .. } => {
                selected_protocol & (PROTOCOL_HYBRID | PROTOCOL_HYBRID_EX) != 0
            }
            Negotiation::Failure { code } => code == HYBRID_REQUIRED_BY_SERVER,
            Negotiation::Absent => false,
        }
    }
}

/// Build a TPKT-wrapped X.224 Connection Request with a routing cookie and
/// an RDP Negotiation Request for `requested_protocols`.
pub fn connection_request(cookie_user: &str, requested_protocols: u32) -> Vec<u8> {
    // The X.224 length indicator is a single byte.
    let user: String = cookie_user.chars().filter(|c| c.is_ascii_graphic()).take(MAX_COOKIE_USER).collect();
    let cookie = format!("Cookie: mstshash={}\r\n", user);
    let li = X224_FIXED_HEADER_LEN - 1 + cookie.len() + NEG_BLOCK_LEN;
    let total = TPKT_HEADER_LEN + 1 + li;

    let mut buf = Vec::with_capacity(total);
    buf.push(TPKT_VERSION);
    buf.push(0x00);
    buf.extend_from_slice(&(total as u16).to_be_bytes());

    buf.push(li as u8);
    buf.push(X224_CONNECTION_REQUEST);
    buf.extend_from_slice(&[0x00, 0x00]); // dst-ref
    buf.extend_from_slice(&[0x00, 0x00]); // src-ref
    buf.push(0x00); // class 0
    buf.extend_from_slice(cookie.as_bytes());

    buf.push(TYPE_RDP_NEG_REQ);
    buf.push(0x00);
    buf.extend_from_slice(&(NEG_BLOCK_LEN as u16).to_le_bytes());
    buf.extend_from_slice(&requested_protocols.to_le_bytes());

    buf
}

/// Length of the whole TPKT packet announced by `header`, or `None` if the
/// bytes are not a TPKT header at all.
pub fn tpkt_length(header: &[u8; TPKT_HEADER_LEN]) -> Option<usize> {
    if header[0] != TPKT_VERSION || header[1] != 0x00 {
        return None;
    }
    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
    if len < TPKT_HEADER_LEN + X224_FIXED_HEADER_LEN || len > MAX_CONFIRM_LEN {
        return None;
    }
    Some(len)
}

/// Parse a complete TPKT packet holding an X.224 Connection Confirm.
pub fn parse_connection_confirm(packet: &[u8]) -> Result<ConnectionConfirm, DecodeError> {
    if packet.len() < TPKT_HEADER_LEN + X224_FIXED_HEADER_LEN {
        return Err(DecodeError::Malformed(format!("short packet ({} bytes)", packet.len())));
    }
    let header = [packet[0], packet[1], packet[2], packet[3]];
    let declared = tpkt_length(&header).ok_or(DecodeError::NotRdp)?;
    if declared != packet.len() {
        return Err(DecodeError::Malformed(format!(
            "tpkt length {} does not match {} bytes read",
            declared,
            packet.len()
        )));
    }

    let tpdu = &packet[TPKT_HEADER_LEN..];
    let li = tpdu[0] as usize;
    if li + 1 > tpdu.len() || li < X224_FIXED_HEADER_LEN - 1 {
        return Err(DecodeError::Malformed(format!("bad x.224 length indicator {}", li)));
    }
    if tpdu[1] & 0xF0 != X224_CONNECTION_CONFIRM {
        return Err(DecodeError::NotRdp);
    }

    let variable = &tpdu[X224_FIXED_HEADER_LEN..li + 1];
    let negotiation = if variable.len() >= NEG_BLOCK_LEN {
        parse_negotiation(&variable[..NEG_BLOCK_LEN])?
    } else {
        Negotiation::Absent
    };

    Ok(ConnectionConfirm { negotiation })
}

fn parse_negotiation(block: &[u8]) -> Result<Negotiation, DecodeError> {
    let length = u16::from_le_bytes([block[2], block[3]]) as usize;
    if length != NEG_BLOCK_LEN {
        return Err(DecodeError::Malformed(format!("negotiation block length {}", length)));
    }
    let value = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);

    match block[0] {
        TYPE_RDP_NEG_RSP => Ok(Negotiation::Response {
            flags: block[1],
            selected_protocol: value,
        }),
        TYPE_RDP_NEG_FAILURE => Ok(Negotiation::Failure { code: value }),
        other => Err(DecodeError::Malformed(format!("unknown negotiation type {:#04x}", other))),
    }
}

pub fn protocol_name(protocol: u32) -> &'static str {
    match protocol {
        PROTOCOL_RDP => "RDP",
        PROTOCOL_SSL => "SSL",
        PROTOCOL_HYBRID => "HYBRID",
        PROTOCOL_RDSTLS => "RDSTLS",
        PROTOCOL_HYBRID_EX => "HYBRID_EX",
        PROTOCOL_RDSAAD => "RDSAAD",
        _ => "UNKNOWN",
    }
}

pub fn failure_name(code: u32) -> &'static str {
    match code {
        SSL_REQUIRED_BY_SERVER => "SSL_REQUIRED_BY_SERVER",
        SSL_NOT_ALLOWED_BY_SERVER => "SSL_NOT_ALLOWED_BY_SERVER",
        SSL_CERT_NOT_ON_SERVER => "SSL_CERT_NOT_ON_SERVER",
        INCONSISTENT_FLAGS => "INCONSISTENT_FLAGS",
        HYBRID_REQUIRED_BY_SERVER => "HYBRID_REQUIRED_BY_SERVER",
        SSL_WITH_USER_AUTH_REQUIRED_BY_SERVER => "SSL_WITH_USER_AUTH_REQUIRED_BY_SERVER",
        _ => "UNKNOWN_FAILURE",
    }
}

pub fn flag_names(flags: u8) -> Vec<String> {
    [
        (EXTENDED_CLIENT_DATA_SUPPORTED, "EXTENDED_CLIENT_DATA_SUPPORTED"),
        (DYNVC_GFX_PROTOCOL_SUPPORTED, "DYNVC_GFX_PROTOCOL_SUPPORTED"),
        (NEGRSP_FLAG_RESERVED, "NEGRSP_FLAG_RESERVED"),
        (RESTRICTED_ADMIN_MODE_SUPPORTED, "RESTRICTED_ADMIN_MODE_SUPPORTED"),
        (REDIRECTED_AUTHENTICATION_MODE_SUPPORTED, "REDIRECTED_AUTHENTICATION_MODE_SUPPORTED"),
    ]
    .iter()
    .filter(|(bit, _)| flags & bit != 0)
    .map(|(_, name)| name.to_string())
    .collect()
}

/// Build a Connection Confirm packet, used by tests and fake servers.
pub fn connection_confirm(negotiation: Negotiation) -> Vec<u8> {
    let block: Option<[u8; NEG_BLOCK_LEN]> = match negotiation {
        Negotiation::Absent => None,
        Negotiation::Response { flags, selected_protocol } => {
            let v = selected_protocol.to_le_bytes();
            Some([TYPE_RDP_NEG_RSP, flags, 0x08, 0x00, v[0], v[1], v[2], v[3]])
        }
        Negotiation::Failure { code } => {
            let v = code.to_le_bytes();
            Some([TYPE_RDP_NEG_FAILURE, 0x00, 0x08, 0x00, v[0], v[1], v[2], v[3]])
        }
    };

    let li = X224_FIXED_HEADER_LEN - 1 + block.map(|b| b.len()).unwrap_or(0);
    let total = TPKT_HEADER_LEN + 1 + li;

    let mut buf = Vec::with_capacity(total);
    buf.push(TPKT_VERSION);
    buf.push(0x00);
    buf.extend_from_slice(&(total as u16).to_be_bytes());
    buf.push(li as u8);
    buf.push(X224_CONNECTION_CONFIRM);
    buf.extend_from_slice(&[0x00, 0x00, 0x12, 0x34, 0x00]);
    if let Some(block) = block {
        buf.extend_from_slice(&block);
    }
    buf
}
