//! API process: serves the read API and the manual sync trigger.

use mf_analytics::config::Config;
use mf_analytics::web::server::WebServer;
use mf_analytics::{db, logging};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    logging::init_logging(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "api starting");

    let pool = db::pool::create_pool(&config.database_url).await?;
    db::pool::run_migrations(&pool).await?;

    let server = WebServer::new(config.bind_addr(), pool);
    server.start().await?;

    info!("api shutdown complete");
    Ok(())
}
