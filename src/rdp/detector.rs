use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use crate::probe::dialer::ProbeStream;
use crate::probe::error::DecodeError;
use crate::probe::results::ServiceRdp;
use crate::rdp::x224::{self, ConnectionConfirm, Negotiation};
use crate::rdp::RdpDecoder;

const PRESENCE_PROTOCOLS: u32 = x224::PROTOCOL_SSL | x224::PROTOCOL_HYBRID;
const AUTH_PROTOCOLS: u32 =
    x224::PROTOCOL_SSL | x224::PROTOCOL_HYBRID | x224::PROTOCOL_HYBRID_EX;

/// Fingerprints RDP from the X.224 Connection Request / Confirm exchange.
#[derive(Debug, Clone)]
pub struct X224Decoder {
    cookie_user: String,
}

impl Default for X224Decoder {
    fn default() -> Self {
        Self::new("rdpscope")
    }
}

impl X224Decoder {
    pub fn new(cookie_user: impl Into<String>) -> Self {
        Self { cookie_user: cookie_user.into() }
    }

    /// Send a Connection Request and read back one TPKT packet.
    ///
    /// `Ok(None)` means the peer answered with something that is not TPKT,
    /// or hung up before a full packet arrived.
    async fn exchange(
        &self,
        stream: &mut dyn ProbeStream,
        requested_protocols: u32,
        limit: Duration,
    ) -> Result<Option<ConnectionConfirm>, DecodeError> {
        let request = x224::connection_request(&self.cookie_user, requested_protocols);

        let io = async {
            stream.write_all(&request).await?;
            stream.flush().await?;

            let mut header = [0u8; x224::TPKT_HEADER_LEN];
            stream.read_exact(&mut header).await?;
            let Some(len) = x224::tpkt_length(&header) else {
                return Ok::<Option<Vec<u8>>, io::Error>(None);
            };

            let mut packet = vec![0u8; len];
            packet[..x224::TPKT_HEADER_LEN].copy_from_slice(&header);
            stream.read_exact(&mut packet[x224::TPKT_HEADER_LEN..]).await?;
            Ok(Some(packet))
        };

        let packet = match timeout(limit, io).await {
            Err(_) => return Err(DecodeError::Timeout(limit)),
            Ok(Ok(Some(packet))) => packet,
            Ok(Ok(None)) => return Ok(None),
            Ok(Err(e)) if hung_up(&e) => {
                debug!("peer closed during x.224 exchange: {}", e);
                return Ok(None);
            }
            Ok(Err(e)) => return Err(DecodeError::from(e)),
        };

        match x224::parse_connection_confirm(&packet) {
            Ok(cc) => Ok(Some(cc)),
            Err(DecodeError::NotRdp) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn service_info(&self, cc: &ConnectionConfirm) -> ServiceRdp {
        let mut info = ServiceRdp {
            os_fingerprint: Some(cc.os_label()),
            cookie: Some(format!("mstshash={}", self.cookie_user)),
            ..Default::default()
        };
        match cc.negotiation {
            Negotiation::Response { flags, selected_protocol } => {
                info.selected_protocol = Some(x224::protocol_name(selected_protocol).to_string());
                info.negotiation_flags = x224::flag_names(flags);
            }
            Negotiation::Failure { code } => {
                info.negotiation_flags = vec![x224::failure_name(code).to_string()];
            }
            Negotiation::Absent => {
                info.selected_protocol = Some(x224::protocol_name(x224::PROTOCOL_RDP).to_string());
            }
        }
        info
    }
}

fn hung_up(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

#[async_trait]
impl RdpDecoder for X224Decoder {
    async fn detect_rdp(
        &self,
        stream: &mut dyn ProbeStream,
        timeout: Duration,
    ) -> Result<(String, bool), DecodeError> {
        match self.exchange(stream, PRESENCE_PROTOCOLS, timeout).await? {
            Some(cc) => Ok((cc.os_label(), true)),
            None => Ok((String::new(), false)),
        }
    }

    async fn detect_rdp_auth(
        &self,
        stream: &mut dyn ProbeStream,
        timeout: Duration,
    ) -> Result<(ServiceRdp, bool), DecodeError> {
        let cc = self
            .exchange(stream, AUTH_PROTOCOLS, timeout)
            .await?
            .ok_or(DecodeError::NotRdp)?;
        Ok((self.service_info(&cc), cc.requires_nla()))
    }
}
