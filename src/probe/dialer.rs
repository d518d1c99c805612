// Run-scoped dial resources: run identity, dialer capability and registry
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::probe::error::DialError;

/// Opaque token identifying one scan execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for RunId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RunId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
        }
    }
}

/// Byte stream handed to the protocol decoder.
pub trait ProbeStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ProbeStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn ProbeStream>;

/// Capability to open connections subject to whatever policy the run imposes.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        network: Network,
        address: &str,
        deadline: Duration,
    ) -> Result<BoxedStream, DialError>;
}

/// Plain TCP dialer with no proxying or filtering.
#[derive(Debug, Default, Clone)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(
        &self,
        network: Network,
        address: &str,
        deadline: Duration,
    ) -> Result<BoxedStream, DialError> {
        debug!("dialing {} {} (deadline {:?})", network, address, deadline);
        match timeout(deadline, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(Box::new(stream))
            }
            Ok(Err(e)) => Err(DialError::from(e)),
            Err(_) => Err(DialError::Timeout(deadline)),
        }
    }
}

/// Lookup from a run identity to the dialer registered for it.
pub trait DialerRegistry: Send + Sync {
    fn resolve(&self, run: &RunId) -> Option<Arc<dyn Dialer>>;
}

/// In-memory registry, populated by the host when a run starts.
#[derive(Default)]
pub struct RunRegistry {
    dialers: DashMap<RunId, Arc<dyn Dialer>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, run: RunId, dialer: Arc<dyn Dialer>) {
        debug!("registering dialer for run {}", run);
        self.dialers.insert(run, dialer);
    }

    pub fn unregister(&self, run: &RunId) -> bool {
        self.dialers.remove(run).is_some()
    }

    pub fn contains(&self, run: &RunId) -> bool {
        self.dialers.contains_key(run)
    }

    pub fn len(&self) -> usize {
        self.dialers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialers.is_empty()
    }
}

impl DialerRegistry for RunRegistry {
    fn resolve(&self, run: &RunId) -> Option<Arc<dyn Dialer>> {
        self.dialers.get(run).map(|entry| Arc::clone(entry.value()))
    }
}
