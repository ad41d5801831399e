// ABOUTME: Sync configuration - tunables from TOML, named environments and chain resolution
// ABOUTME: Produces the SyncOptions and TransformPolicy handed to the orchestrator

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::SyncError;
use crate::table_sync::{SourceConsistency, SyncOptions};
use crate::transform::{MaskRule, TransformPolicy};
use crate::upsert::UpsertStrategy;
use crate::utils::validate_identifier;

/// Largest accepted chunk size; bigger pages only inflate statement size.
pub const MAX_CHUNK_SIZE: u64 = 10_000;

/// Environment variable naming the environment a run starts from.
pub const MIGRATION_FROM_VAR: &str = "MIGRATION_FROM";

/// A named database environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Production,
    Staging,
    Local,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Staging => "staging",
            Environment::Local => "local",
        }
    }

    /// Name of the variable holding this environment's connection URL.
    pub fn url_var(&self) -> String {
        format!("{}_DATABASE_URL", self.as_str().to_uppercase())
    }

    /// Read this environment's connection URL from the process environment.
    pub fn database_url(&self) -> Result<String> {
        let var = self.url_var();
        std::env::var(&var).with_context(|| {
            format!(
                "No connection URL for the {} environment. Set {} (a .env file in the working directory is read automatically)",
                self, var
            )
        })
    }

    /// The environment data flows into from this one, if any.
    pub fn next(&self) -> Option<Environment> {
        match self {
            Environment::Production => Some(Environment::Staging),
            Environment::Staging => Some(Environment::Local),
            Environment::Local => None,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = SyncError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "staging" => Ok(Environment::Staging),
            "local" => Ok(Environment::Local),
            other => Err(SyncError::Config(format!(
                "unknown environment '{}' (expected production, staging or local)",
                other
            ))),
        }
    }
}

/// Work out which environments a run synchronizes, in order.
///
/// An explicit chain wins. Otherwise `migration_from` names the first
/// environment and the chain is that environment plus the next one down.
///
/// # Examples
///
/// ```
/// use staging_sync::config::{resolve_chain, Environment};
///
/// let chain = resolve_chain(&[], Some("production")).unwrap();
/// assert_eq!(chain, vec![Environment::Production, Environment::Staging]);
/// ```
pub fn resolve_chain(
    explicit: &[Environment],
    migration_from: Option<&str>,
) -> std::result::Result<Vec<Environment>, SyncError> {
    let chain = if !explicit.is_empty() {
        explicit.to_vec()
    } else {
        let from = migration_from
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                SyncError::Config(format!(
                    "no sync chain given; pass --chain or set {}",
                    MIGRATION_FROM_VAR
                ))
            })?
            .parse::<Environment>()?;
        let to = from.next().ok_or_else(|| {
            SyncError::Config(format!("nothing to migrate to from the {} environment", from))
        })?;
        vec![from, to]
    };

    if chain.len() < 2 {
        return Err(SyncError::Config(
            "a sync chain needs at least two environments".to_string(),
        ));
    }
    // Masked rows must never be written back into production
    if chain[1..].contains(&Environment::Production) {
        return Err(SyncError::Config(
            "production can only be the first environment of a sync chain".to_string(),
        ));
    }
    for (i, env) in chain.iter().enumerate() {
        if chain[..i].contains(env) {
            return Err(SyncError::Config(format!(
                "environment {} appears more than once in the sync chain",
                env
            )));
        }
    }

    Ok(chain)
}

/// Tunables for a sync run, as read from a TOML file.
///
/// Every field has a default, so an empty file (or no file) is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub chunk_size: u64,
    pub workers: usize,
    pub skip_tables: Vec<String>,
    pub strategy: UpsertStrategy,
    pub statement_timeout_secs: u64,
    pub chunk_pause_ms: u64,
    pub source_consistency: SourceConsistency,
    /// Schema tables are read from and written to
    pub schema: String,
    /// Column masking rules layered over the built-in ones
    pub masking: BTreeMap<String, MaskRule>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            workers: 4,
            skip_tables: Vec::new(),
            strategy: UpsertStrategy::OnConflict,
            statement_timeout_secs: 30,
            chunk_pause_ms: 10,
            source_consistency: SourceConsistency::Offline,
            schema: "public".to_string(),
            masking: BTreeMap::new(),
        }
    }
}

impl SyncConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), SyncError> {
        if self.chunk_size == 0 {
            return Err(SyncError::Config("chunk_size must be at least 1".to_string()));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(SyncError::Config(format!(
                "chunk_size {} exceeds the maximum of {}",
                self.chunk_size, MAX_CHUNK_SIZE
            )));
        }
        if self.workers == 0 {
            return Err(SyncError::Config("workers must be at least 1".to_string()));
        }
        if self.statement_timeout_secs == 0 {
            return Err(SyncError::Config(
                "statement_timeout_secs must be at least 1".to_string(),
            ));
        }
        validate_identifier(&self.schema)
            .map_err(|e| SyncError::Config(format!("invalid schema: {}", e)))?;
        // Skip-list names are only compared with listed tables, never put into SQL
        if self.skip_tables.iter().any(|t| t.trim().is_empty()) {
            return Err(SyncError::Config("skip_tables entries must not be empty".to_string()));
        }
        for column in self.masking.keys() {
            validate_identifier(column)
                .map_err(|e| SyncError::Config(format!("invalid masking column: {}", e)))?;
        }
        Ok(())
    }

    pub fn to_options(&self, show_progress: bool) -> SyncOptions {
        SyncOptions {
            chunk_size: self.chunk_size,
            workers: self.workers,
            strategy: self.strategy,
            statement_timeout: Duration::from_secs(self.statement_timeout_secs),
            chunk_pause: Duration::from_millis(self.chunk_pause_ms),
            source_consistency: self.source_consistency,
            show_progress,
        }
    }

    /// Built-in masking rules with this config's overrides applied.
    pub fn policy(&self) -> TransformPolicy {
        TransformPolicy::default().merged(&self.masking)
    }
}
