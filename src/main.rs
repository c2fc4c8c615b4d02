use clap::Parser;
use tracing_subscriber::EnvFilter;

use session_pairing::cli::{Cli, Command, run_detach_command, run_inspect_command};
use session_pairing::{Config, SessionEngine, connect_from_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{}", e))?;
    let cache = connect_from_config(&config.cache)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let engine = SessionEngine::new(cache).with_scan_count(config.cache.scan_count);

    let mut stdout = std::io::stdout();
    match cli.command {
        Command::Inspect(cmd) => run_inspect_command(cmd, &engine, &mut stdout).await,
        Command::Detach(cmd) => {
            run_detach_command(cmd, &engine, &config.retry, &mut stdout).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "session_pairing=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
