use std::path::PathBuf;
use std::process::ExitCode;

use fleetrun::config::FleetConfig;
use fleetrun::orchestrator::{Orchestrator, RunSummary};

fn print_summary(summary: &RunSummary) {
    for line in summary.report_lines() {
        println!("{line}");
    }
    for result in summary.results.values() {
        if let Some(path) = &result.output_file {
            println!("{}: output written to {}", result.device, path.display());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let config_path: PathBuf = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "fleet.json".to_string())
        .into();

    let config = FleetConfig::load(&config_path)?;
    println!(
        "fleet run: {} devices, up to {} in parallel, output in {}",
        config.devices.len(),
        config.max_parallel,
        config.output_dir.display()
    );

    let orchestrator = Orchestrator::new(config)?;

    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, cancelling fleet run");
            cancel.cancel();
        }
    });

    let summary = orchestrator.run().await;
    print_summary(&summary);

    if summary.overall_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("failed devices: {}", summary.failed_devices().join(", "));
        Ok(ExitCode::FAILURE)
    }
}
