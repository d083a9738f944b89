use media_relay_core::{broker, config::Config, helper, log, metrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;
    log::set(cfg.log_level.clone());
    metrics::register();

    let listener = tokio::net::TcpListener::bind(cfg.http.listen()?).await?;
    broker::serve(
        listener,
        cfg.allowed_origins,
        cfg!(debug_assertions),
        helper::shutdown_signal(),
    )
    .await
}
