use waypoint_relay::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    simple_logger::init_with_level(config.log_level.as_level())?;
    waypoint_relay::startup(config).await
}
