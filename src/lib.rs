//! Core RESP3 client primitives: wire codec, value model, request/result
//! handles, a multiplexed connection, pipelining, pub/sub and push routing,
//! client-side caching, connection pooling, `MONITOR` parsing, byte-level
//! tracing, and configuration.
//!
//! This crate is deliberately scoped to the protocol core: it does not ship
//! a generated command table, cluster topology awareness, or Sentinel
//! support. [`commands`] carries only the handful of commands the core
//! itself needs to issue.

pub mod arg;
pub mod cache;
pub mod codec;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod monitor;
pub mod pipeline;
pub mod pool;
pub mod pubsub;
pub mod request;
pub mod tracer;
pub mod value;
pub mod version;

/// The common set of types most callers need.
pub mod prelude {
    pub use crate::cache::ClientCache;
    pub use crate::config::{Dialer, TlsConfig};
    pub use crate::connection::{Connection, ConnectionState};
    pub use crate::error::{RedisError, RedisResult};
    pub use crate::pipeline::Pipeline;
    pub use crate::pool::{Pool, PooledConnection, PoolStats};
    pub use crate::request::{RequestState, ResultHandle};
    pub use crate::tracer::{Direction, Tracer};
    pub use crate::value::{Attributes, PushKind, RedisValue, ScoreBound, Tree, ValueKind};
    pub use crate::version::Version;
}
