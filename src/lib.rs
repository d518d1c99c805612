//! Run-scoped, memoized RDP fingerprinting.
//!
//! [`RdpProber`] answers two questions about a `host:port` within a scan run:
//! does it speak RDP (and which OS does it advertise), and does it require
//! network-level authentication. Each answer is computed at most once per
//! run, even under concurrent callers.

pub mod cli;
pub mod network;
pub mod output;
pub mod probe;
pub mod rdp;
pub mod scanner;

pub use probe::{
    AuthResult, Dialer, DialerRegistry, FailurePolicy, PresenceResult, ProbeConfig, ProbeError,
    RdpProber, RunId, RunRegistry, ServiceRdp, TcpDialer,
};
pub use rdp::{RdpDecoder, X224Decoder};
