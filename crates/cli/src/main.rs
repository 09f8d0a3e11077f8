use std::time::Duration;

use anyhow::{Context, Result};
use berth_api::{Config, SandboxStatus, StatusFetcher};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};

mod telemetry;

use telemetry::Telemetry;

#[derive(Parser, Debug)]
#[command(name = "berthctl", version, about = "Sandbox status from the cluster watch cache")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Label marking sandbox member pods (overrides BERTH_MEMBER_LABEL)
    #[arg(long = "member-label", global = true)]
    member_label: Option<String>,

    /// Label naming a pod's service (overrides BERTH_SERVICE_LABEL)
    #[arg(long = "service-label", global = true)]
    service_label: Option<String>,

    /// Give up if the initial cache sync takes longer (overrides BERTH_SYNC_TIMEOUT_SECS)
    #[arg(long = "sync-timeout-secs", global = true)]
    sync_timeout_secs: Option<u64>,

    /// Raise berth log verbosity (-v debug, -vv trace); ignored when BERTH_LOG is set
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the current status of a sandbox namespace
    Get {
        namespace: String,
    },
    /// Print the status of a sandbox namespace every time it changes
    Watch {
        namespace: String,
    },
}

impl Cli {
    fn config(&self) -> Config {
        let mut cfg = Config::from_env();
        if let Some(l) = &self.member_label { cfg.member_label = l.clone(); }
        if let Some(l) = &self.service_label { cfg.service_label = l.clone(); }
        if let Some(secs) = self.sync_timeout_secs { cfg.sync_timeout = Some(Duration::from_secs(secs)); }
        cfg
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = Telemetry::from_env()?;
    telemetry.init_tracing(cli.verbose)?;
    telemetry.init_metrics()?;
    let config = cli.config();

    let client = kube::Client::try_default().await.context("building kube client")?;
    let fetcher = StatusFetcher::start(client, config).await.context("starting status fetcher")?;

    match &cli.command {
        Commands::Get { namespace } => {
            info!(ns = %namespace, "get invoked");
            let status = fetcher.get(namespace)?;
            print_status(cli.output, namespace, &status)?;
        }
        Commands::Watch { namespace } => {
            info!(ns = %namespace, "watch invoked");
            let (mut notifier, stop) = fetcher.watch(namespace);
            print_status(cli.output, namespace, &fetcher.get(namespace)?)?;
            loop {
                tokio::select! {
                    woke = notifier.changed() => {
                        if !woke {
                            warn!("notifier closed; exiting watch loop");
                            break;
                        }
                        match fetcher.get(namespace) {
                            Ok(status) => print_status(cli.output, namespace, &status)?,
                            Err(e) => warn!(ns = %namespace, error = %e, "get after wake-up failed"),
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            stop.stop();
        }
    }
    Ok(())
}

fn print_status(output: Output, namespace: &str, status: &SandboxStatus) -> Result<()> {
    match output {
        Output::Human => print!("{}", render_human(namespace, status)),
        Output::Json => println!("{}", serde_json::to_string(status)?),
    }
    Ok(())
}

fn render_human(namespace: &str, status: &SandboxStatus) -> String {
    let mut out = format!("{}: {}\n", namespace, status.phase);
    if status.services.is_empty() {
        return out;
    }
    out.push_str(&format!("  {:<20} {:<22} {:<8} {}\n", "SERVICE", "PHASE", "STARTED", "MESSAGE"));
    for (name, svc) in &status.services {
        let started = if svc.has_started { "yes" } else { "no" };
        out.push_str(&format!("  {:<20} {:<22} {:<8} {}\n", name, svc.phase.as_str(), started, svc.message.as_deref().unwrap_or("-")));
    }
    out
}
