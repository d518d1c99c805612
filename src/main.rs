use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use colored::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rdpscope::cli::Cli;
use rdpscope::output::OutputWriter;
use rdpscope::scanner::Scanner;
use rdpscope::{RdpProber, RunId, RunRegistry, TcpDialer, X224Decoder};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "rdpscope=debug" } else { "rdpscope=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if cli.target.is_empty() {
        eprintln!("{}", "Error: No target specified.".red());
        eprintln!("Example: rdpscope 10.0.0.0/24 --auth");
        eprintln!("Run 'rdpscope --help' for more information.");
        std::process::exit(1);
    }

    let config = cli.probe_config();
    let run = RunId::new(
        cli.run_id
            .clone()
            .unwrap_or_else(|| format!("run-{}", chrono::Utc::now().timestamp_millis())),
    );

    let registry = Arc::new(RunRegistry::new());
    registry.register(run.clone(), Arc::new(TcpDialer));

    let decoder = Arc::new(X224Decoder::new(config.mstshash_user.clone()));
    let prober = Arc::new(RdpProber::new(registry.clone(), decoder, config));
    let scanner = Scanner::new(Arc::clone(&prober), cli.parallel, cli.auth);

    let output_writer = OutputWriter::new(cli.output_format, cli.output_file.clone())?;

    let report = scanner.scan(&run, &cli.target.join(","), &cli.ports_spec()).await?;
    info!("run {} finished with {} endpoints", run, report.targets.len());

    prober.finish_run(&run);
    registry.unregister(&run);

    output_writer.write(&report)?;

    Ok(())
}
