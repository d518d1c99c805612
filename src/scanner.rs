// Fan-out of presence/auth probes over a target list
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Semaphore;
use futures::future::join_all;
use tracing::{debug, info};

use crate::network::{parse_targets, parse_ports};
use crate::probe::{ProbeReport, RdpProber, RunId, TargetReport};

pub struct Scanner {
    prober: Arc<RdpProber>,
    parallel: usize,
    check_auth: bool,
}

impl Scanner {
    pub fn new(prober: Arc<RdpProber>, parallel: usize, check_auth: bool) -> Self {
        Self {
            prober,
            parallel: parallel.max(1),
            check_auth,
        }
    }

    /// Probe every host/port pair of the spec under `run`. Auth is only
    /// checked on listeners that answered the presence probe as RDP.
    pub async fn scan(&self, run: &RunId, target: &str, ports: &str) -> Result<ProbeReport> {
        let targets = parse_targets(target)?;
        let port_list = parse_ports(ports)?;
        info!(
            "probing {} hosts x {} ports under run {}",
            targets.len(),
            port_list.len(),
            run
        );

        let start_time = chrono::Utc::now();
        let semaphore = Arc::new(Semaphore::new(self.parallel));
        let mut tasks = Vec::new();

        for host in &targets {
            for &port in &port_list {
                let semaphore = Arc::clone(&semaphore);
                let prober = Arc::clone(&self.prober);
                let run = run.clone();
                let host = host.clone();
                let check_auth = self.check_auth;

                tasks.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await?;
                    Ok::<_, anyhow::Error>(probe_target(&prober, &run, host, port, check_auth).await)
                }));
            }
        }

        let reports = join_all(tasks)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ProbeReport {
            run_id: run.clone(),
            target_spec: target.to_string(),
            start_time,
            end_time: chrono::Utc::now(),
            targets: reports,
        })
    }
}

async fn probe_target(
    prober: &RdpProber,
    run: &RunId,
    host: String,
    port: u16,
    check_auth: bool,
) -> TargetReport {
    let mut report = TargetReport {
        host,
        port,
        presence: None,
        auth: None,
        errors: Vec::new(),
    };

    match prober.probe_presence(run, &report.host, port).await {
        Ok(presence) => report.presence = Some(presence),
        Err(e) => {
            debug!("presence {}:{} failed: {}", report.host, port, e);
            report.errors.push(e.to_string());
        }
    }

    if check_auth && report.is_rdp() {
        match prober.probe_auth(run, &report.host, port).await {
            Ok(auth) => report.auth = Some(auth),
            Err(e) => report.errors.push(e.to_string()),
        }
    }

    report
}
