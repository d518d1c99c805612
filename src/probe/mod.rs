pub mod config;
pub mod connection;
pub mod dialer;
pub mod error;
pub mod memo;
pub mod results;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::rdp::RdpDecoder;
pub use config::{FailurePolicy, ProbeConfig};
pub use connection::{acquire, ScopedConnection, DEFAULT_PROBE_TIMEOUT};
pub use dialer::{BoxedStream, Dialer, DialerRegistry, Network, ProbeStream, RunId, RunRegistry, TcpDialer};
pub use error::{DecodeError, DialError, ProbeError};
pub use memo::{CacheStats, ProbeCache};
pub use results::{
    AuthResult, PresenceResult, ProbeKind, ProbeReport, ProbeState, ProbeTarget, ServiceRdp,
    TargetReport,
};

/// Per-run state: one cache per probe kind plus the run's cancel signal.
struct RunScope {
    presence: ProbeCache<ProbeTarget, Result<PresenceResult, ProbeError>>,
    auth: ProbeCache<ProbeTarget, Result<AuthResult, ProbeError>>,
    cancel: watch::Sender<bool>,
}

impl RunScope {
    fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            presence: ProbeCache::new(),
            auth: ProbeCache::new(),
            cancel,
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

async fn cancelled(mut rx: watch::Receiver<bool>) {
    // A closed channel means the scope is gone; nothing will ever cancel.
    let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Memoized, run-scoped RDP prober.
///
/// Each (run, host, port, kind) is probed at most once; concurrent callers
/// for the same key share the single in-flight probe. Distinct keys never
/// wait on each other.
pub struct RdpProber {
    registry: Arc<dyn DialerRegistry>,
    decoder: Arc<dyn RdpDecoder>,
    config: ProbeConfig,
    runs: DashMap<RunId, Arc<RunScope>>,
}

impl RdpProber {
    pub fn new(
        registry: Arc<dyn DialerRegistry>,
        decoder: Arc<dyn RdpDecoder>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            registry,
            decoder,
            config,
            runs: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Check whether `host:port` speaks RDP and, if so, which OS it advertises.
    pub async fn probe_presence(
        &self,
        run: &RunId,
        host: &str,
        port: u16,
    ) -> Result<PresenceResult, ProbeError> {
        let dialer = self.resolve(run)?;
        let scope = self.scope(run);
        let target = ProbeTarget::new(host, port);
        let decoder = Arc::clone(&self.decoder);
        let limit = self.config.timeout;

        self.memoized(run, &scope, &scope.presence, ProbeKind::Presence, target, move |target| async move {
            let mut conn = acquire(dialer.as_ref(), &target.host, target.port, limit)
                .await
                .map_err(|source| ProbeError::Dial {
                    address: target.to_string(),
                    source,
                })?;
            trace_state(ProbeKind::Presence, &target, ProbeState::Connected);

            let decoded = bounded(limit, decoder.detect_rdp(conn.stream(), limit)).await;
            conn.close().await;
            let (os, is_rdp) = decoded?;
            trace_state(ProbeKind::Presence, &target, ProbeState::Decoded);

            Ok(PresenceResult::from_detection(os, is_rdp))
        })
        .await
    }

    /// Check whether the RDP service at `host:port` requires authentication.
    pub async fn probe_auth(
        &self,
        run: &RunId,
        host: &str,
        port: u16,
    ) -> Result<AuthResult, ProbeError> {
        let dialer = self.resolve(run)?;
        let scope = self.scope(run);
        let target = ProbeTarget::new(host, port);
        let decoder = Arc::clone(&self.decoder);
        let limit = self.config.timeout;

        self.memoized(run, &scope, &scope.auth, ProbeKind::AuthCheck, target, move |target| async move {
            let mut conn = acquire(dialer.as_ref(), &target.host, target.port, limit)
                .await
                .map_err(|source| ProbeError::Dial {
                    address: target.to_string(),
                    source,
                })?;
            trace_state(ProbeKind::AuthCheck, &target, ProbeState::Connected);

            let decoded = bounded(limit, decoder.detect_rdp_auth(conn.stream(), limit)).await;
            conn.close().await;
            let (info, auth_required) = decoded?;
            trace_state(ProbeKind::AuthCheck, &target, ProbeState::Decoded);

            Ok(AuthResult::from_detection(info, auth_required))
        })
        .await
    }

    /// Abort in-flight probes of `run` and refuse new ones. Cancelled probes
    /// are not cached.
    pub fn cancel_run(&self, run: &RunId) {
        let scope = self.scope(run);
        scope.cancel.send_replace(true);
        info!("cancelled run {}", run);
    }

    /// Tear down the run: cancel in-flight work and drop its cached results.
    pub fn finish_run(&self, run: &RunId) {
        if let Some((_, scope)) = self.runs.remove(run) {
            scope.cancel.send_replace(true);
            debug!(
                "finished run {} ({} presence, {} auth results dropped)",
                run,
                scope.presence.len(),
                scope.auth.len()
            );
        }
    }

    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }

    /// Cache statistics for one run and probe kind.
    pub fn stats(&self, run: &RunId, kind: ProbeKind) -> CacheStats {
        match self.runs.get(run) {
            Some(scope) => match kind {
                ProbeKind::Presence => scope.presence.stats(),
                ProbeKind::AuthCheck => scope.auth.stats(),
            },
            None => CacheStats::default(),
        }
    }

    fn resolve(&self, run: &RunId) -> Result<Arc<dyn Dialer>, ProbeError> {
        if run.is_blank() {
            return Err(ProbeError::MissingRunIdentity);
        }
        self.registry.resolve(run).ok_or_else(|| {
            warn!("dialers not initialized for {}", run);
            ProbeError::RunNotInitialized(run.clone())
        })
    }

    fn scope(&self, run: &RunId) -> Arc<RunScope> {
        Arc::clone(
            self.runs
                .entry(run.clone())
                .or_insert_with(|| Arc::new(RunScope::new()))
                .value(),
        )
    }

    /// Run `probe` through `cache` under the configured failure policy,
    /// racing it against the run's cancel signal.
    async fn memoized<T, F, Fut>(
        &self,
        run: &RunId,
        scope: &RunScope,
        cache: &ProbeCache<ProbeTarget, Result<T, ProbeError>>,
        kind: ProbeKind,
        target: ProbeTarget,
        probe: F,
    ) -> Result<T, ProbeError>
    where
        T: Clone,
        F: FnOnce(ProbeTarget) -> Fut,
        Fut: std::future::Future<Output = Result<T, ProbeError>>,
    {
        trace_state(kind, &target, ProbeState::NotStarted);
        if scope.is_cancelled() {
            return Err(ProbeError::Cancelled(run.clone()));
        }
        trace_state(kind, &target, ProbeState::DialerResolved);

        let policy = self.config.failure_policy;
        let cancel = scope.cancel.subscribe();
        let key = target.clone();

        let outcome = cache
            .get_or_try_compute_evicting(
                key,
                || async move {
                    // A waiter taking over after a cancelled flight must not dial.
                    let revoked = *cancel.borrow();
                    if revoked {
                        return Err(ProbeError::Cancelled(run.clone()));
                    }
                    let result = tokio::select! {
                        biased;
                        _ = cancelled(cancel) => Err(ProbeError::Cancelled(run.clone())),
                        result = probe(target.clone()) => result,
                    };
                    match result {
                        Ok(value) => {
                            trace_state(kind, &target, ProbeState::Success);
                            Ok(Ok(value))
                        }
                        Err(e) if e.is_cancelled() => Err(e),
                        Err(e) => {
                            trace_state(kind, &target, ProbeState::Failure);
                            debug!("{} probe of {} failed: {}", kind, target, e);
                            Ok(Err(e))
                        }
                    }
                },
                |result| policy == FailurePolicy::RetryOnFailure && result.is_err(),
            )
            .await;

        match outcome {
            Ok(shared) => shared,
            Err(e) => Err(e),
        }
    }
}

/// Bound a decoder call by `limit` in case it ignores its own timeout.
async fn bounded<T, Fut>(limit: Duration, fut: Fut) -> Result<T, ProbeError>
where
    Fut: std::future::Future<Output = Result<T, DecodeError>>,
{
    match timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ProbeError::Decode(e)),
        Err(_) => Err(ProbeError::Decode(DecodeError::Timeout(limit))),
    }
}

fn trace_state(kind: ProbeKind, target: &ProbeTarget, state: ProbeState) {
    debug!("{} probe {} -> {:?}", kind, target, state);
}
