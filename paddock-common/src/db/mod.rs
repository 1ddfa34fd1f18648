//! Relational store access: pool initialization, schema migrations and
//! instrumented transactions

pub mod init;
pub mod migrations;
pub mod monitor;

pub use init::{init_database, init_memory_database};
pub use migrations::{run_migrations, CURRENT_SCHEMA_VERSION};
pub use monitor::{begin_monitored, MonitoredTransaction};
