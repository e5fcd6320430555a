//! Connection pooling module
//!
//! This module provides:
//! - A bounded pool of duplex connections with min/max sizing
//! - Warm-up toward a minimum number of connections
//! - Stale connection detection on checkout and release
//! - Pluggable connectors for TCP, Unix sockets, or custom transports

pub mod args;
pub mod connection;
pub mod connector;
pub mod stream;

pub use args::{ArgValue, ConnArgs};
pub use connection::{ConnectionPool, PoolConfig, PoolError, PoolStats, PooledConnection};
#[cfg(unix)]
pub use connector::UnixConnector;
pub use connector::{BoxedStream, Connector, Duplex, EndpointConnector, FnConnector, TcpConnector};
pub use stream::{Connection, ConnectionId, ReadState};
