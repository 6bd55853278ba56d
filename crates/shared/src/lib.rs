//! Payledger shared configuration and database utilities
//!
//! This crate contains the pieces every Payledger binary needs: the
//! process-wide configuration struct, the Postgres pool builders, and the
//! fixed-rate pacer used by batch jobs talking to the payment processor.

pub mod config;
pub mod db;
pub mod pace;

pub use config::{Config, ConfigError};
pub use db::{create_pool, run_migrations};
pub use pace::Pacer;
