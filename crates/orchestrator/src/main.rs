//! Certpilot - Main entry point
//!
//! Certificate lifecycle orchestrator for an nginx reverse proxy.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use certpilot::signals::cancel_on_signal;
use certpilot::triage::{render_failure, render_status, render_summary};
use certpilot::{Collaborators, Orchestrator, OrchestratorError, RunConfig, RunOverrides, Workflow};
use certpilot_common::observability::{init_logging, LogFormat};
use certpilot_config::{Config, ConfigError};

/// Exit code for configuration and usage errors
const EXIT_CONFIG: i32 = 2;

/// Certpilot - certificate lifecycle orchestrator
#[derive(Parser, Debug)]
#[command(name = "certpilot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTPILOT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that the domain resolves to this server
    Validate(RunArgs),
    /// Check that the challenge path is reachable through the live proxy
    Probe(RunArgs),
    /// Issue the first certificate and switch the proxy to TLS
    Setup(RunArgs),
    /// Re-issue the certificate and switch the proxy to TLS
    Fix(RunArgs),
    /// Renew certificates near expiry and reload the proxy
    Renew {
        #[command(flatten)]
        run: RunArgs,

        /// Exercise renewal without saving certificates or reloading
        #[arg(long = "dry-run")]
        dry_run: bool,
    },
    /// Show the active configuration and certificate expiry
    Status {
        /// Domain whose certificate to inspect
        #[arg(long = "domain")]
        domain: Option<String>,

        /// Print JSON instead of text
        #[arg(long = "json")]
        json: bool,
    },
    /// Validate the configuration file and exit
    CheckConfig,
}

#[derive(Args, Debug, Clone, Default)]
struct RunArgs {
    /// Domain to issue for (overrides the configuration file)
    #[arg(long = "domain")]
    domain: Option<String>,

    /// Contact email for the certificate authority
    #[arg(long = "email")]
    email: Option<String>,

    /// Continue when the domain resolves to another address than this server
    #[arg(long = "allow-ip-mismatch")]
    allow_ip_mismatch: bool,

    /// Re-issue even when a valid certificate exists
    #[arg(long = "force-renewal")]
    force_renewal: bool,

    /// Use the certificate authority's staging environment
    #[arg(long = "staging")]
    staging: bool,
}

impl RunArgs {
    fn overrides(&self, dry_run: bool) -> RunOverrides {
        RunOverrides {
            domain: self.domain.clone(),
            email: self.email.clone(),
            allow_ip_mismatch: self.allow_ip_mismatch,
            force_renewal: self.force_renewal,
            staging: self.staging,
            dry_run,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let code = match run_cli(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("certpilot: {:#}", e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

/// Map errors that escaped before a run started
fn exit_code_for(error: &anyhow::Error) -> i32 {
    if let Some(e) = error.downcast_ref::<OrchestratorError>() {
        return e.exit_code();
    }
    if error.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG;
    }
    1
}

fn run_cli(cli: Cli) -> Result<i32> {
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let (workflow, args, dry_run) = match cli.command {
        Commands::CheckConfig => return Ok(check_config(&config, cli.config.as_deref())),
        Commands::Status { domain, json } => return status(config, domain, json),
        Commands::Validate(args) => (Workflow::Validate, args, false),
        Commands::Probe(args) => (Workflow::Probe, args, false),
        Commands::Setup(args) => (Workflow::Setup, args, false),
        Commands::Fix(args) => (Workflow::Fix, args, false),
        Commands::Renew { run, dry_run } => (Workflow::Renew, run, dry_run),
    };

    let validation = config.validate();
    for warning in &validation.warnings {
        warn!("{}", warning.message);
    }
    if !validation.is_ok() {
        return Err(ConfigError::Invalid(validation)).context("Configuration validation failed");
    }

    let run = RunConfig::resolve(&config, &args.overrides(dry_run), workflow)
        .context("Invalid run parameters")?;
    let collaborators =
        Collaborators::production(&config).context("Failed to initialise HTTP client")?;
    let orchestrator = Orchestrator::new(config, collaborators);

    let runtime = tokio::runtime::Runtime::new()?;
    let report = runtime.block_on(async {
        let signals = cancel_on_signal(orchestrator.cancel_token());
        let report = orchestrator.run(&run).await;
        signals.abort();
        report
    });

    if report.is_success() {
        println!("{}", render_summary(&report));
    } else {
        eprintln!("{}", render_failure(&report));
    }
    Ok(report.exit_code())
}

/// Load and validate the configuration, like `nginx -t`
fn check_config(config: &Config, path: Option<&std::path::Path>) -> i32 {
    let result = config.validate();
    for warning in &result.warnings {
        println!("warning: {}", warning.message);
    }
    if !result.is_ok() {
        for error in &result.errors {
            eprintln!("error: {}", error);
        }
        return EXIT_CONFIG;
    }

    let source = path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults)".to_string());
    info!(source = %source, "Configuration test successful");
    println!("certpilot: configuration {} test is successful", source);
    0
}

fn status(config: Config, domain: Option<String>, json: bool) -> Result<i32> {
    let domain = domain.or_else(|| config.domain.clone());
    let collaborators =
        Collaborators::production(&config).context("Failed to initialise HTTP client")?;
    let orchestrator = Orchestrator::new(config, collaborators);

    let status = orchestrator.status(domain.as_deref())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("{}", render_status(&status));
    }
    Ok(0)
}
