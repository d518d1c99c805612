use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};

use crate::probe::dialer::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbeKind {
    Presence,
    AuthCheck,
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeKind::Presence => write!(f, "presence"),
            ProbeKind::AuthCheck => write!(f, "auth"),
        }
    }
}

/// Where a single probe got to before it finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    NotStarted,
    DialerResolved,
    Connected,
    Decoded,
    Success,
    Failure,
}

/// Host and port inside one run. Together with the run and the probe kind it
/// identifies one cacheable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
}

impl ProbeTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl std::fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", crate::probe::connection::join_host_port(&self.host, self.port))
    }
}

/// Outcome of the presence probe. `os` is empty unless `is_rdp`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceResult {
    #[serde(rename = "IsRDP")]
    pub is_rdp: bool,
    #[serde(rename = "OS")]
    pub os: String,
}

impl PresenceResult {
    pub fn not_rdp() -> Self {
        Self::default()
    }

    /// Shape raw decoder output; the label is dropped for non-RDP services.
    pub fn from_detection(os: String, is_rdp: bool) -> Self {
        if is_rdp {
            Self { is_rdp: true, os }
        } else {
            Self::not_rdp()
        }
    }
}

/// Outcome of the auth probe. `service_info` is present only if auth is required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    #[serde(rename = "PluginInfo")]
    pub service_info: Option<ServiceRdp>,
    #[serde(rename = "Auth")]
    pub auth_required: bool,
}

impl AuthResult {
    pub fn no_auth() -> Self {
        Self::default()
    }

    pub fn from_detection(info: ServiceRdp, auth_required: bool) -> Self {
        if auth_required {
            Self {
                service_info: Some(info),
                auth_required: true,
            }
        } else {
            Self::no_auth()
        }
    }
}

/// Service metadata for an RDP listener. Decoders fill what they can observe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRdp {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netbios_computer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netbios_domain_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_computer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_domain_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forest_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub negotiation_flags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetReport {
    pub host: String,
    pub port: u16,
    pub presence: Option<PresenceResult>,
    pub auth: Option<AuthResult>,
    pub errors: Vec<String>,
}

impl TargetReport {
    pub fn is_rdp(&self) -> bool {
        self.presence.as_ref().map(|p| p.is_rdp).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub run_id: RunId,
    pub target_spec: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub targets: Vec<TargetReport>,
}
