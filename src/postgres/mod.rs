// ABOUTME: PostgreSQL backend for the sync engine
// ABOUTME: Exposes the pooled DatabaseAccess implementation and TLS policy setup

pub mod access;
pub mod connection;
pub mod types;

pub use access::PostgresDatabase;
pub use connection::init_tls_policy;
