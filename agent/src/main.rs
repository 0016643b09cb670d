use clap::Parser;
use waypoint_agent::config::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug { log::Level::Debug } else { log::Level::Info };
    simple_logger::init_with_level(level)?;

    if let Err(err) = waypoint_agent::run(cli).await {
        log::error!("{err:#}");
        let code = if err.is::<waypoint_agent::ValidationError>() { 2 } else { 1 };
        std::process::exit(code);
    }

    Ok(())
}
