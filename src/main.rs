use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use tether::barrier::{ConsoleDialog, OperatorSurface, Outcome, PanicBarrier};
use tether::config::Config;
use tether::log::{self, DiagnosticsSink};
use tether::{app, Result};

/// tether - keeps a dashboard, control server, event bus and notifiers
/// running together, and shuts them down together
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    TETHER_DEBUG=1    Enable debug logging (alternative to --debug)\n    TETHER_LOG        tracing filter directive, e.g. tether=trace")]
pub struct Cli {
    /// Configuration file (default: ~/.tether/tether.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Run without the terminal dashboard
    #[arg(long)]
    pub headless: bool,

    /// Control server port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Detached until the configured log directory is known.
    let sink = Arc::new(DiagnosticsSink::detached());
    let barrier = PanicBarrier::new(Arc::clone(&sink), Box::new(ConsoleDialog));

    let outcome = barrier.run(|| run(cli, &sink));
    sink.flush();

    match outcome {
        Outcome::Completed(Ok(())) => ExitCode::SUCCESS,
        Outcome::Completed(Err(failure)) => {
            failure.report(&ConsoleDialog);
            ExitCode::FAILURE
        }
        Outcome::Faulted(_) => ExitCode::FAILURE,
    }
}

/// Why `run` gave up. Each failure is reported to the operator exactly once.
#[derive(Debug)]
enum Failure {
    /// The configuration could not be loaded or is invalid.
    Config(tether::Error),
    Run(tether::Error),
}

impl Failure {
    fn report(&self, surface: &dyn OperatorSurface) {
        match self {
            Failure::Config(e) => {
                if surface.show("tether: invalid configuration", &e.to_string()).is_err() {
                    eprintln!("tether: invalid configuration: {}", e);
                }
            }
            Failure::Run(e) => eprintln!("tether: {}", e),
        }
    }
}

fn run(cli: Cli, sink: &Arc<DiagnosticsSink>) -> std::result::Result<(), Failure> {
    let debug = cli.debug || log::debug_from_env();
    let config = load_config(&cli, debug).map_err(Failure::Config)?;
    start(config, sink).map_err(Failure::Run)
}

fn start(config: Config, sink: &Arc<DiagnosticsSink>) -> Result<()> {
    let log_path = sink.attach_file(&config.log_dir()?)?;
    log::init_tracing(Arc::clone(sink), config.debug)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log = %log_path.display(),
        debug = config.debug,
        "tether starting"
    );

    app::run(config)
}

fn load_config(cli: &Cli, debug: bool) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.debug |= debug;
    config.front_end.headless |= cli.headless;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.validate()?;
    Ok(config)
}
