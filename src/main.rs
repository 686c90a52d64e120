use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};

use testsmith::config::{create_default_config, TestGenConfig};
use testsmith::control::CancelToken;
use testsmith::coverage::runner_for;
use testsmith::llm::backend::{ModelGateway, Unavailable};
use testsmith::llm::client::HttpGateway;
use testsmith::logger;
use testsmith::orchestrator::{self, Collaborators, RunMode};
use testsmith::report::REPORT_FILE;
use testsmith::testgen::runner::ProcessToolchain;

const DEFAULT_CONFIG: &str = "config.yaml";
const LOG_FILE: &str = "test_generation.log";

#[derive(Parser)]
#[command(
    name = "testsmith",
    version,
    about = "Generate, validate and integrate unit tests with a language model."
)]
struct Cli {
    /// Root of the project to generate tests for
    project_root: PathBuf,

    /// YAML or TOML configuration (defaults to <project_root>/config.yaml when present)
    config: Option<PathBuf>,

    /// DEBUG, INFO, WARNING or ERROR
    #[arg(long, default_value = "INFO")]
    log_level: String,

    /// Extract functions and build prompts without calling the model or writing files
    #[arg(long)]
    dry_run: bool,

    /// Write the default configuration and exit
    #[arg(long)]
    create_config: bool,

    /// Where to write the JSON report (defaults to <project_root>/test_generation_report.json)
    #[arg(long)]
    report: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.create_config {
        let path = cli.config.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
        return match create_default_config(&path) {
            Ok(()) => {
                println!("wrote default configuration to {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::from(2)
            }
        };
    }

    let log_file = (!cli.dry_run && cli.project_root.is_dir()).then(|| cli.project_root.join(LOG_FILE));
    if let Err(e) = logger::init(&cli.log_level, log_file.as_deref()) {
        eprintln!("warning: cannot open log file: {e}");
        let _ = logger::init(&cli.log_level, None);
    }

    ExitCode::from(run(&cli))
}

fn run(cli: &Cli) -> u8 {
    let config = match load_config(&cli.project_root, cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return 2;
        }
    };

    let cancel = CancelToken::new();
    for sig in [SIGINT, SIGTERM] {
        if let Err(e) = signal_hook::flag::register(sig, cancel.flag()) {
            tracing::warn!(signal = sig, error = %e, "cannot install signal handler");
        }
    }

    let mode = if cli.dry_run {
        RunMode::DryRun
    } else {
        RunMode::Generate
    };

    // A dry run never sends a request, so missing credentials only matter
    // when generating.
    let gateway: Box<dyn ModelGateway> = match HttpGateway::from_config(&config) {
        Ok(g) => Box::new(g),
        Err(e) if cli.dry_run => Box::new(Unavailable(e.to_string())),
        Err(e) => {
            eprintln!("error: {e}");
            return 2;
        }
    };
    let toolchain = ProcessToolchain::new(config.compile_command.clone());
    let coverage = if config.use_coverage {
        runner_for(&config, &cli.project_root)
    } else {
        None
    };

    let collab = Collaborators {
        gateway: gateway.as_ref(),
        toolchain: &toolchain,
        coverage: coverage.as_deref(),
        mode,
    };

    let report = match orchestrator::run(&cli.project_root, &config, &collab, &cancel) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "run aborted");
            eprintln!("error: {e}");
            return 2;
        }
    };

    report.print_summary();

    if !cli.dry_run || cli.report.is_some() {
        let path = cli
            .report
            .clone()
            .unwrap_or_else(|| cli.project_root.join(REPORT_FILE));
        match report.save(&path) {
            Ok(()) => tracing::info!(path = %path.display(), "report saved"),
            Err(e) => tracing::error!(path = %path.display(), error = %e, "cannot save report"),
        }
    }

    report.exit_code() as u8
}

fn load_config(
    project_root: &Path,
    explicit: Option<&Path>,
) -> Result<TestGenConfig, testsmith::error::ConfigError> {
    if let Some(path) = explicit {
        return TestGenConfig::load(path);
    }

    let fallback = project_root.join(DEFAULT_CONFIG);
    if fallback.is_file() {
        TestGenConfig::load(&fallback)
    } else {
        tracing::info!("no configuration file, using defaults");
        Ok(TestGenConfig::default())
    }
}
