use anyhow::{Context, Result};
use sqlm::config::DatabaseConfig;
use sqlm::Database;

/// Connect to DATABASE_URL, or None when it is not set so live tests can skip
pub async fn database() -> Result<Option<Database>> {
    // Pick up DATABASE_URL from .env the same way the binary does
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping live Postgres test");
        return Ok(None);
    };

    let config = DatabaseConfig { url: Some(url.clone()), max_connections: 4, connection_timeout: 5 };
    let db = Database::connect_with(&url, &config)
        .await
        .context("failed to connect to DATABASE_URL")?;
    Ok(Some(db))
}
