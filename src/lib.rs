//! duplex-pool - Bounded async pool of reusable duplex connections

pub mod config;
pub mod pool;

pub use config::Config;
pub use pool::{
    ConnArgs, Connection, ConnectionPool, Connector, PoolConfig, PoolError, PooledConnection,
};
