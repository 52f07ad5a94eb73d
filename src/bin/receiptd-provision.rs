use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::env;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use receiptd_provision::account::{BackendKind, ServiceAccount};
use receiptd_provision::check::{self, Status};
use receiptd_provision::config::{self, ProvisionConfig};
use receiptd_provision::paths::HostLayout;
use receiptd_provision::source::SourceBundle;
use receiptd_provision::{Options, Provisioner, StepFailure};

/// Prepare a host to run the receiptd daemon
#[derive(Parser)]
#[command(
    name = "receiptd-provision",
    version,
    subcommand_required = true,
    arg_required_else_help = true
)]
struct Cli {
    /// Directory treated as / of the target host
    #[arg(long, global = true, default_value = "/")]
    root: PathBuf,

    /// Source bundle with fonts/ and templates [default: current directory]
    #[arg(long, global = true)]
    source: Option<PathBuf>,

    /// YAML or JSON configuration file
    #[arg(long, global = true, env = "RECEIPTD_PROVISION_CONFIG")]
    config: Option<PathBuf>,

    /// Output a JSON report
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the account, directories, assets, init script and config
    Provision(ProvisionArgs),

    /// Report drift without changing anything
    Check,
}

#[derive(Args)]
struct ProvisionArgs {
    /// Do not install receiptd.conf
    #[arg(long)]
    skip_config: bool,

    /// Replace an existing receiptd.conf that differs from the template
    #[arg(long)]
    overwrite_config: bool,

    /// Account backend [default: pw on FreeBSD, shadow elsewhere]
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            report_error(&cli, &e);
            1
        }
    };

    std::process::exit(code);
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: &Cli) -> Result<i32> {
    let config = config::load(cli.config.as_deref())?;
    let account = config.service_account()?;
    let layout = HostLayout::new(&cli.root);

    match &cli.command {
        Command::Provision(args) => provision(cli, args, &config, &account, &layout),
        Command::Check => check(cli, &config, &account, &layout),
    }
}

fn source_dir(cli: &Cli, config: &ProvisionConfig) -> Result<(PathBuf, bool)> {
    if let Some(dir) = cli.source.as_ref().or(config.source_dir.as_ref()) {
        return Ok((dir.clone(), true));
    }
    let cwd = env::current_dir().context("Failed to determine current directory")?;
    Ok((cwd, false))
}

fn provision(
    cli: &Cli,
    args: &ProvisionArgs,
    config: &ProvisionConfig,
    account: &ServiceAccount,
    layout: &HostLayout,
) -> Result<i32> {
    if !layout.root().is_dir() {
        bail!("Host root {} is not a directory", layout.root().display());
    }

    let (dir, _) = source_dir(cli, config)?;
    let source = SourceBundle::locate(&dir)
        .with_context(|| format!("Invalid source bundle: {}", dir.display()))?;

    let privileged = nix::unistd::Uid::effective().is_root();
    let backend_kind = args.backend.unwrap_or_else(|| config.backend());
    let backend = backend_kind.create();
    let options = Options {
        privileged,
        install_config: config.install_config && !args.skip_config,
        overwrite_config: config.overwrite_config || args.overwrite_config,
    };

    if !cli.json {
        println!("\n=== receiptd provisioning ===\n");
        println!("Host root: {}", layout.root().display());
        println!("Source:    {}", source.dir().display());
        println!("Backend:   {}\n", backend.name());

        if !privileged {
            println!("Warning: not running as root; account creation and chown may fail\n");
        }
        for font in source.missing_fonts() {
            println!("Warning: source bundle is missing fonts/{}", font);
        }
    }

    let provisioner = Provisioner::new(layout, &source, account, backend.as_ref(), options);
    let reports = provisioner.run(|report| {
        if !cli.json {
            println!("✓ {:<12} {:<9} {}", report.step, report.outcome, report.detail);
        }
    })?;

    if cli.json {
        let out = json!({
            "status": "ok",
            "root": layout.root(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "steps": reports,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("\n=== Provisioning Complete ===\n");
    }

    Ok(0)
}

fn check(cli: &Cli, config: &ProvisionConfig, account: &ServiceAccount, layout: &HostLayout) -> Result<i32> {
    let (dir, explicit) = source_dir(cli, config)?;
    let source = match SourceBundle::locate(&dir) {
        Ok(source) => Some(source),
        Err(e) if explicit => {
            return Err(e).with_context(|| format!("Invalid source bundle: {}", dir.display()))
        }
        Err(e) => {
            tracing::debug!("No source bundle in {}: {}", dir.display(), e);
            None
        }
    };

    let report = check::inspect(layout, account, source.as_ref())?;
    let converged = report.converged();

    if cli.json {
        let out = json!({
            "converged": converged,
            "root": layout.root(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "findings": report.findings,
            "warnings": report.warnings,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for finding in &report.findings {
            match finding.status {
                Status::Ok => println!("✓ {}", finding.resource),
                status if finding.detail.is_empty() => println!("✗ {}: {}", finding.resource, status),
                status => println!("✗ {}: {} ({})", finding.resource, status, finding.detail),
            }
        }
        for warning in &report.warnings {
            println!("Warning: {}", warning);
        }
        if converged {
            println!("\nHost is provisioned.");
        } else {
            println!("\nHost needs provisioning; run: receiptd-provision provision");
        }
    }

    Ok(if converged { 0 } else { 2 })
}

/// Full cause chain of an error, without repeating a step failure's own cause
fn describe(e: &anyhow::Error) -> String {
    let skip = if e.downcast_ref::<StepFailure>().is_some() { 2 } else { 1 };
    let mut msg = e.to_string();
    for cause in e.chain().skip(skip) {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
    }
    msg
}

fn report_error(cli: &Cli, e: &anyhow::Error) {
    if !cli.json {
        eprintln!("Error: {}", describe(e));
        return;
    }

    let failure = e.downcast_ref::<StepFailure>();
    let out = json!({
        "status": "failed",
        "root": cli.root.as_path(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "step": failure.map(|f| f.step),
        "completed": failure.map(|f| f.completed.as_slice()).unwrap_or_default(),
        "error": describe(e),
    });
    match serde_json::to_string_pretty(&out) {
        Ok(s) => println!("{}", s),
        Err(_) => eprintln!("Error: {}", describe(e)),
    }
}
