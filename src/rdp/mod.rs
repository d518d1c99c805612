// RDP handshake decoders
// The probe layer only sees the `RdpDecoder` trait; `X224Decoder` is the
// built-in implementation used by the CLI.

pub mod detector;
pub mod x224;

use std::time::Duration;

use async_trait::async_trait;

use crate::probe::dialer::ProbeStream;
use crate::probe::error::DecodeError;
use crate::probe::results::ServiceRdp;

pub use detector::X224Decoder;

/// Performs the RDP handshake bytes over an already-open stream.
///
/// Implementations must respect `timeout` and must not touch anything but
/// the stream they are given.
#[async_trait]
pub trait RdpDecoder: Send + Sync {
    /// Returns the best-effort OS label and whether the peer speaks RDP.
    async fn detect_rdp(
        &self,
        stream: &mut dyn ProbeStream,
        timeout: Duration,
    ) -> Result<(String, bool), DecodeError>;

    /// Returns service metadata and whether the peer requires authentication.
    async fn detect_rdp_auth(
        &self,
        stream: &mut dyn ProbeStream,
        timeout: Duration,
    ) -> Result<(ServiceRdp, bool), DecodeError>;
}
