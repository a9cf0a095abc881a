use anyhow::{Context, Result};
use group_viewer::api::ApiClient;
use group_viewer::{Viewer, ViewerConfig, ViewerServices};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("group_viewer=info")),
        )
        .init();

    let mut config = ViewerConfig::load().context("Failed to load configuration")?;
    if let Some(key) = std::env::args().nth(1) {
        config.group_key = Some(key);
    }
    let group_key = config
        .group_key
        .clone()
        .context("No group key given (argument or VIEWER_GROUP_KEY)")?;

    let api = ApiClient::new(&config.api_base, config.auth_token.clone());
    let initial = api
        .fetch_group(&group_key)
        .await
        .with_context(|| format!("Failed to fetch group {}", group_key))?;
    if initial.is_empty() {
        tracing::error!("Group {} not found or empty", group_key);
        return Ok(());
    }

    let services = ViewerServices::from_config(&config).await;

    #[cfg(feature = "gst")]
    let surface = group_viewer::video::GstSurface::init()?;
    #[cfg(not(feature = "gst"))]
    let surface = group_viewer::surface::HeadlessSurface::new(config.headless_clip());

    let viewer = Viewer::mount(initial, group_key, services, surface);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    viewer.shutdown().await;

    Ok(())
}
