//! Connection configuration: a builder that resolves an
//! address, clamps channel sizes to a sane floor, and carries the optional
//! callback hooks every other module plugs into.

use crate::pubsub::{InvalidateCallback, MonitorCallback};
use crate::request::SubscribeCallback;
use crate::tracer::TraceCallback;
use std::time::Duration;

/// Channel capacities below this are rejected in favor of the floor: a
/// smaller buffer turns ordinary pipelining into a deadlock the moment the
/// sender and dispatcher both need to make progress before either side can
/// drain.
const MIN_CHANNEL_SIZE: usize = 16;
const DEFAULT_CHANNEL_SIZE: usize = 256;

/// TLS configuration slot. Left as a plain enum rather than pulling in a TLS
/// crate: the core's job is to exercise the hook, not to pick a TLS stack.
#[derive(Debug, Clone, Default)]
pub enum TlsConfig {
    #[default]
    Disabled,
    Enabled {
        insecure_skip_verify: bool,
    },
}

/// Builds a `Dialer` describing how to reach and authenticate against a
/// server, and which callback hooks to wire into the resulting connection.
#[derive(Clone)]
pub struct Dialer {
    pub address: String,
    pub tls: TlsConfig,
    pub channel_size: usize,
    pub async_timeout: Option<Duration>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_name: Option<String>,
    pub invalidate_callback: Option<InvalidateCallback>,
    pub monitor_callback: Option<MonitorCallback>,
    pub trace_callback: Option<TraceCallback>,
    pub push_callback: Option<SubscribeCallback>,
}

impl Dialer {
    /// Resolves the default address from `REDIS_HOST`/`REDIS_PORT`, falling
    /// back to `127.0.0.1:6379`.
    pub fn new() -> Self {
        let host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = std::env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
        Dialer {
            address: format!("{host}:{port}"),
            tls: TlsConfig::Disabled,
            channel_size: DEFAULT_CHANNEL_SIZE,
            async_timeout: None,
            username: None,
            password: None,
            client_name: None,
            invalidate_callback: None,
            monitor_callback: None,
            trace_callback: None,
            push_callback: None,
        }
    }

    pub fn address<S: Into<String>>(mut self, address: S) -> Self {
        self.address = address.into();
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Requested sizes below `MIN_CHANNEL_SIZE` are clamped up rather than
    /// rejected.
    pub fn channel_size(mut self, size: usize) -> Self {
        self.channel_size = size.max(MIN_CHANNEL_SIZE);
        self
    }

    pub fn async_timeout(mut self, timeout: Duration) -> Self {
        self.async_timeout = Some(timeout);
        self
    }

    pub fn credentials<S: Into<String>>(mut self, username: S, password: S) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn client_name<S: Into<String>>(mut self, name: S) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn on_invalidate(mut self, callback: InvalidateCallback) -> Self {
        self.invalidate_callback = Some(callback);
        self
    }

    pub fn on_monitor(mut self, callback: MonitorCallback) -> Self {
        self.monitor_callback = Some(callback);
        self
    }

    pub fn on_trace(mut self, callback: TraceCallback) -> Self {
        self.trace_callback = Some(callback);
        self
    }

    pub fn on_push(mut self, callback: SubscribeCallback) -> Self {
        self.push_callback = Some(callback);
        self
    }
}

impl Default for Dialer {
    fn default() -> Self {
        Dialer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_localhost_when_env_unset() {
        std::env::remove_var("REDIS_HOST");
        std::env::remove_var("REDIS_PORT");
        let dialer = Dialer::new();
        assert_eq!(dialer.address, "127.0.0.1:6379");
    }

    #[test]
    fn channel_size_is_clamped_to_floor() {
        let dialer = Dialer::new().channel_size(2);
        assert_eq!(dialer.channel_size, MIN_CHANNEL_SIZE);
    }

    #[test]
    fn channel_size_above_floor_is_kept() {
        let dialer = Dialer::new().channel_size(1024);
        assert_eq!(dialer.channel_size, 1024);
    }

    #[test]
    fn builder_chains_address_and_credentials() {
        let dialer = Dialer::new()
            .address("example.com:6380")
            .credentials("user", "pw");
        assert_eq!(dialer.address, "example.com:6380");
        assert_eq!(dialer.username.as_deref(), Some("user"));
        assert_eq!(dialer.password.as_deref(), Some("pw"));
    }
}
