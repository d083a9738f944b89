use media_relay_core::{config::Config, log, metrics, publisher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;
    log::set(cfg.log_level.clone());
    metrics::register();
    publisher::run(cfg).await
}
