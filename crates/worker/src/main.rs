use atelier_infra::config::AtelierConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    atelier_observability::init();

    let config = AtelierConfig::from_env()?;
    let app = atelier_worker::app::build_app(&config).await?;
    tracing::info!(kinds = ?app.registry().kinds(), "atelier worker running");

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("shutdown requested");
            Ok(())
        }
        fatal = app.manager().wait_fatal() => {
            tracing::error!(error = %fatal, "job intake halted");
            Err(anyhow::Error::new(fatal))
        }
    };

    app.shutdown().await;
    outcome
}
