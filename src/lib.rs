//! # Colombier - data lifecycle core for a pigeon breeding register
//!
//! Colombier keeps each breeder's register (couples, egg records, pigeonneaux,
//! health records, sales, preferences and notifications) in an embedded sled
//! store and manages the register's lifecycle:
//!
//! - **Export**: an ownership-scoped, self-contained JSON snapshot of one breeder.
//! - **Restore**: replay a snapshot into any breeder with fresh primary keys and
//!   remapped foreign keys, all-or-nothing.
//! - **Backups**: snapshots on disk, one isolated directory per breeder, with
//!   count and age retention.
//! - **Archival**: read notifications and push notifications move to archive
//!   tables; stale audit logs and reset codes are purged.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use colombier::config::Config;
//! use colombier::lifecycle::{Lifecycle, RestoreOptions};
//! use colombier::store::Store;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let store = Store::open(config.db_path())?;
//!     let lifecycle = Lifecycle::new(store, &config);
//!
//!     let backup = lifecycle.save_backup(1)?;
//!     lifecycle.restore_from_backup(1, &backup.filename, RestoreOptions::default())?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`model`] - register rows and the snapshot document
//! - [`store`] - sled persistence and staged transactions
//! - [`lifecycle`] - export, restore, backup and archive engines
//! - [`config`] - TOML configuration
//! - [`validation`] - backup filename parsing and field checks
//! - [`metrics`] - process-wide counters

pub mod config;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod store;
pub mod validation;
