//! certshift - Main entry point
//!
//! Certificate-aware deployment orchestrator for a reverse-proxied application.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use certshift::{
    Components, ForceFlag, Orchestrator, RecurringTask, RunOptions, SignalManager, TaskRunner,
};
use certshift_common::{DomainGroup, ReportCheck, StatusReport};
use certshift_config::Config;

/// certshift - keep a site reachable while TLS certificates come and go
#[derive(Parser, Debug)]
#[command(name = "certshift")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        env = "CERTSHIFT_CONFIG",
        default_value = "/etc/certshift/certshift.kdl",
        global = true
    )]
    config: PathBuf,

    /// Use the ACME staging directory
    #[arg(long = "staging", global = true)]
    staging: bool,

    /// Serve every group over plaintext regardless of certificates
    #[arg(long = "force-http", global = true, conflicts_with = "force_ssl")]
    force_http: bool,

    /// Serve every group encrypted; abort if any certificate is not valid
    #[arg(long = "force-ssl", global = true)]
    force_ssl: bool,

    /// Validate without applying; obtain and renew only check reachability
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,

    /// Acquire certificates for groups without a valid bundle
    #[arg(long = "acquire", global = true)]
    acquire: bool,

    /// Enable verbose logging (debug level)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Print the report as JSON
    #[arg(long = "json", global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan certificates, pick a mode and switch the serving layer
    Deploy,
    /// Obtain certificates and make them live
    Obtain {
        /// Group to obtain; repeat for several (default: all groups)
        #[arg(short = 'g', long = "group")]
        groups: Vec<String>,
    },
    /// Renew certificates close to expiry
    Renew,
    /// Check certificate expiry and dispatch alerts
    Monitor,
    /// Verify services, dependencies and endpoints
    Health,
    /// Show certificates, the applied plan and task heartbeats
    Status,
    /// Validate the configuration file and exit
    CheckConfig {
        /// Also probe dependency addresses
        #[arg(long = "network")]
        network: bool,
    },
    /// Run renewal and monitoring on their schedule until stopped
    Daemon,
}

impl Cli {
    fn force(&self) -> ForceFlag {
        match (self.force_http, self.force_ssl) {
            (true, _) => ForceFlag::Http,
            (_, true) => ForceFlag::Https,
            _ => ForceFlag::None,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("certshift: {:#}", e);
            2
        }
    };
    std::process::exit(code);
}

/// Logs go to stderr; stdout carries the report
fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();
}

fn run(cli: Cli) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            let report = StatusReport::from_checks(vec![ReportCheck::critical(
                "config",
                format!("{}: {}", cli.config.display(), e),
            )]);
            return emit(&report, cli.json);
        }
    };

    // check-config reports structural errors itself
    let check_only = matches!(cli.command, Commands::CheckConfig { .. });
    if !check_only {
        if let Err(e) = config.validate() {
            let report =
                StatusReport::from_checks(vec![ReportCheck::critical("config", e.to_string())]);
            return emit(&report, cli.json);
        }
    }

    let staging = cli.staging || config.acme.staging;
    let options = RunOptions {
        force: cli.force(),
        dry_run: cli.dry_run,
        acquire: cli.acquire,
    };
    let json = cli.json;

    runtime.block_on(async move {
        let signals = SignalManager::new();
        signals.install().context("Failed to install signal handlers")?;

        let components = Components::from_config(&config, staging)
            .context("Failed to initialise components")?;
        let orchestrator = Orchestrator::new(config, components, signals.interrupt_flag());
        debug!(command = ?cli.command, "Dispatching command");

        let report = match cli.command {
            Commands::Deploy => orchestrator.deploy(options).await.report,
            Commands::Obtain { groups } => {
                let selected = select_groups(&orchestrator.config().groups, &groups)?;
                orchestrator.obtain(&selected, options.dry_run).await
            }
            Commands::Renew => orchestrator.renew(options.dry_run).await,
            Commands::Monitor => orchestrator.monitor().await,
            Commands::Health => orchestrator.health().await,
            Commands::Status => orchestrator.status(),
            Commands::CheckConfig { network } => orchestrator.check_config(network).await,
            Commands::Daemon => {
                let components = orchestrator.components();
                let tasks: Vec<Arc<dyn RecurringTask>> = vec![
                    components.renewal.clone() as Arc<dyn RecurringTask>,
                    components.monitor.clone() as Arc<dyn RecurringTask>,
                ];
                info!(tasks = tasks.len(), "Starting daemon");
                TaskRunner::new(&orchestrator.config().paths.state_dir)
                    .run(&tasks, signals.subscribe())
                    .await;
                info!("Daemon stopped");
                return Ok(0);
            }
        };
        emit(&report, json)
    })
}

fn select_groups(groups: &[DomainGroup], names: &[String]) -> Result<Vec<DomainGroup>> {
    if names.is_empty() {
        return Ok(groups.to_vec());
    }
    names
        .iter()
        .map(|name| match groups.iter().find(|g| &g.name == name) {
            Some(group) => Ok(group.clone()),
            None => bail!("Unknown group '{}'", name),
        })
        .collect()
}

fn emit(report: &StatusReport, json: bool) -> Result<i32> {
    if json {
        let out = serde_json::to_string_pretty(report).context("Failed to serialise report")?;
        println!("{}", out);
    } else {
        print!("{}", report.render_text());
    }
    Ok(report.exit_code())
}
