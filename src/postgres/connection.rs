// ABOUTME: PostgreSQL connection pool construction with TLS support
// ABOUTME: Pins search_path to the sync schema and verifies connectivity before use

use anyhow::{Context, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::OnceLock;
use std::time::Duration;

use crate::utils::{sanitize_url, validate_identifier};

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Set the process-wide certificate policy. Only the first call has any effect.
pub fn init_tls_policy(allow_self_signed: bool) {
    if ALLOW_SELF_SIGNED.set(allow_self_signed).is_ok() && allow_self_signed {
        tracing::warn!(
            "⚠ TLS certificate verification is disabled (--allow-self-signed-certs). Use only for testing."
        );
    }
}

fn allow_self_signed() -> bool {
    ALLOW_SELF_SIGNED.get().copied().unwrap_or(false)
}

fn make_tls_connector() -> Result<MakeTlsConnector> {
    let allow = allow_self_signed();
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(allow)
        .danger_accept_invalid_hostnames(allow)
        .build()
        .context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Parse `url` and apply the session settings every sync connection needs.
fn build_config(url: &str, schema: &str) -> Result<tokio_postgres::Config> {
    validate_identifier(schema).context("Invalid schema name")?;

    let mut config: tokio_postgres::Config = url
        .parse()
        .with_context(|| format!("Invalid connection URL: {}", sanitize_url(url)))?;

    let search_path = format!("-c search_path={}", schema);
    let options = match config.get_options() {
        Some(existing) if !existing.trim().is_empty() => format!("{} {}", existing, search_path),
        _ => search_path,
    };
    config.options(&options);

    if config.get_connect_timeout().is_none() {
        config.connect_timeout(Duration::from_secs(30));
    }
    config.keepalives(true);
    config.keepalives_idle(Duration::from_secs(60));

    Ok(config)
}

/// Create a connection pool for `url` and check that it can serve a query.
///
/// # Arguments
///
/// * `url` - PostgreSQL connection URL
/// * `schema` - Schema every connection resolves table names in
/// * `max_size` - Pool size; one per chunk worker plus one for reconciliation
///
/// # Returns
///
/// A pool whose connections are verified on recycle.
pub async fn create_pool(url: &str, schema: &str, max_size: usize) -> Result<Pool> {
    let config = build_config(url, schema)?;
    let manager = Manager::from_config(
        config,
        make_tls_connector()?,
        ManagerConfig {
            recycling_method: RecyclingMethod::Verified,
        },
    );
    let pool = Pool::builder(manager)
        .max_size(max_size.max(1))
        .build()
        .context("Failed to create connection pool")?;

    let client = pool
        .get()
        .await
        .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))?;
    client
        .simple_query("SELECT 1")
        .await
        .with_context(|| format!("Connection test failed for {}", sanitize_url(url)))?;

    tracing::info!("Connected to {} (schema {})", sanitize_url(url), schema);
    Ok(pool)
}
