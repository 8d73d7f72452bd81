use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use webserv::{Server, config};

#[derive(Debug, Parser)]
#[command(name = "webserv", version, about)]
struct Cli {
    /// Configuration file; `.json` files are read as JSON, anything else in the directive format.
    #[arg(default_value = "conf/default.conf")]
    config: PathBuf,

    /// Parse and validate the configuration, print it as JSON and exit.
    #[arg(long)]
    check: bool,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "webserv stopped");
            eprintln!("webserv: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn run(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let configs = config::load(&cli.config)?;

    if cli.check {
        println!("{}", serde_json::to_string_pretty(&configs)?);
        return Ok(());
    }

    info!(
        config = %cli.config.display(),
        servers = configs.len(),
        "configuration loaded"
    );

    let mut server = Server::new(configs)?;
    server.install_signal_handlers()?;
    server.init()?;
    server.run()?;

    info!("bye");
    Ok(())
}
