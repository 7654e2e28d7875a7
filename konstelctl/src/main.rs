use clap::Parser;
use konstelctl::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { "warn,konstelctl=debug,konstel_api=debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    log::debug!("konstelctl {}", konstelctl::constants::CLI_VERSION);
    if let Err(err) = cli.run().await {
	eprintln!("Error: {}", err);
	std::process::exit(1);
    }
}
