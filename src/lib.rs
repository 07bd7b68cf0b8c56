pub mod auth;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod identity;
pub mod limits;
pub mod model;
pub mod observability;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
