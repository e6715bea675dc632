// Marketpost Infrastructure - SQLite Adapter
// Implements: VersionedStore, Maintenance

mod connection;
mod error;
mod maintenance_impl;
mod migration;
mod record_store;

pub use connection::create_pool;
pub use maintenance_impl::SqliteMaintenance;
pub use migration::run_migrations;
pub use record_store::SqliteRecordStore;

// Note: sqlx::Error conversion is handled by the map_sqlx_error helper
// due to Rust's orphan rules (cannot implement From<sqlx::Error> for AppError here)
