//! Pub/sub and push routing: the dispatcher's channel→callback
//! table plus the logic that tells an incoming push apart from an ordinary
//! reply and, for subscribe/unsubscribe acknowledgements, from the request
//! that is waiting on it.

use crate::cache::ClientCache;
use crate::request::SubscribeCallback;
use crate::value::{PushKind, RedisValue, ValueKind};
use arc_swap::ArcSwapOption;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Invoked once per monitor notification, handed the decoded
/// entry as a value tree.
pub type MonitorCallback = Arc<dyn Fn(RedisValue) + Send + Sync>;

/// Invoked once per `invalidate` push, handed the decoded key list —
/// `None` for a flush-all invalidation (a null payload, or a shape the
/// decoder couldn't read as a key array), `Some(keys)` otherwise. Fires
/// whether or not a client-side cache is configured.
pub type InvalidateCallback = Arc<dyn Fn(Option<Vec<String>>) + Send + Sync>;

/// Owned by the connection's dispatcher task: routes `message`/`pmessage`
/// pushes to the subscriber that registered for that channel/pattern, and
/// `invalidate` pushes into the client-side cache.
pub struct PushRouter {
    channels: parking_lot::Mutex<HashMap<String, SubscribeCallback>>,
    patterns: parking_lot::Mutex<HashMap<String, SubscribeCallback>>,
    cache: Option<Arc<ClientCache>>,
    monitor_callback: ArcSwapOption<MonitorCallback>,
    invalidate_callback: Option<InvalidateCallback>,
}

impl PushRouter {
    pub fn new(cache: Option<Arc<ClientCache>>, invalidate_callback: Option<InvalidateCallback>) -> Self {
        PushRouter {
            channels: parking_lot::Mutex::new(HashMap::new()),
            patterns: parking_lot::Mutex::new(HashMap::new()),
            cache,
            monitor_callback: ArcSwapOption::empty(),
            invalidate_callback,
        }
    }

    pub fn set_monitor_callback(&self, callback: Option<MonitorCallback>) {
        self.monitor_callback.store(callback.map(Arc::new));
    }

    pub fn register_channel(&self, channel: String, callback: SubscribeCallback) {
        self.channels.lock().insert(channel, callback);
    }

    pub fn register_pattern(&self, pattern: String, callback: SubscribeCallback) {
        self.patterns.lock().insert(pattern, callback);
    }

    pub fn unregister_channel(&self, channel: &str) {
        self.channels.lock().remove(channel);
    }

    pub fn unregister_pattern(&self, pattern: &str) {
        self.patterns.lock().remove(pattern);
    }

    /// Routes a decoded push value. Returns `true` if it was consumed here
    /// (message delivery, invalidation, monitor); the dispatcher only needs
    /// to fall back to its own logic for subscription acks, which it
    /// consumes itself to satisfy the matching request.
    pub fn route(&self, value: &RedisValue) -> bool {
        let (kind, data) = match &value.kind {
            ValueKind::Push { kind, data } => (kind, data),
            _ => return false,
        };

        match kind {
            PushKind::Message => {
                if let Some(channel) = data.first().and_then(|v| v.to_string().ok()) {
                    if let Some(cb) = self.channels.lock().get(&channel).cloned() {
                        let payload = data.get(1).cloned().unwrap_or_else(RedisValue::nil);
                        cb(None, channel, payload);
                    } else {
                        trace!(channel, "message for unregistered channel dropped");
                    }
                }
                true
            }
            PushKind::PMessage => {
                if let (Some(pattern), Some(channel)) = (
                    data.first().and_then(|v| v.to_string().ok()),
                    data.get(1).and_then(|v| v.to_string().ok()),
                ) {
                    if let Some(cb) = self.patterns.lock().get(&pattern).cloned() {
                        let payload = data.get(2).cloned().unwrap_or_else(RedisValue::nil);
                        cb(Some(pattern), channel, payload);
                    } else {
                        trace!(pattern, channel, "pmessage for unregistered pattern dropped");
                    }
                }
                true
            }
            PushKind::SMessage => {
                if let Some(channel) = data.first().and_then(|v| v.to_string().ok()) {
                    if let Some(cb) = self.channels.lock().get(&channel).cloned() {
                        let payload = data.get(1).cloned().unwrap_or_else(RedisValue::nil);
                        cb(None, channel, payload);
                    }
                }
                true
            }
            PushKind::Invalidate => {
                self.route_invalidation(data);
                true
            }
            PushKind::Monitor => {
                if let Some(cb) = self.monitor_callback.load().as_ref() {
                    if let Some(entry) = data.first() {
                        cb(entry.clone());
                    }
                } else {
                    debug!("monitor push dropped: no callback registered");
                }
                true
            }
            _ => false,
        }
    }

    /// An `invalidate` push carries either a null payload (flush everything)
    /// or an array of keys to drop. The core hashes each key back down to
    /// its slot rather than trusting a slot number on the wire, since
    /// servers send keys, not slots. The configured invalidation callback
    /// fires with the same decoded key list regardless of whether a
    /// client-side cache is enabled.
    fn route_invalidation(&self, data: &[RedisValue]) {
        let keys: Option<Vec<String>> = match data.first() {
            None => None,
            Some(v) if v.is_nil() => None,
            Some(v) => match v.to_slice() {
                Ok(items) => Some(items.iter().filter_map(|k| k.to_string().ok()).collect()),
                Err(_) => {
                    warn!("invalidate push had unexpected shape, treating as flush-all");
                    None
                }
            },
        };

        if let Some(cache) = &self.cache {
            match &keys {
                None => cache.invalidate(None),
                Some(keys) => {
                    for key in keys {
                        let slot = crate::cache::slot_for_key(key.as_bytes());
                        cache.invalidate(Some(slot));
                    }
                }
            }
        }

        if let Some(cb) = &self.invalidate_callback {
            cb(keys);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn push(kind: PushKind, data: Vec<RedisValue>) -> RedisValue {
        RedisValue::new(ValueKind::Push { kind, data })
    }

    #[test]
    fn routes_message_to_registered_channel() {
        let router = PushRouter::new(None, None);
        let seen = Arc::new(AtomicBool::new(false));
        let seen2 = seen.clone();
        router.register_channel(
            "chan".into(),
            Arc::new(move |_, channel, payload| {
                assert_eq!(channel, "chan");
                assert_eq!(payload.to_string().unwrap(), "hello");
                seen2.store(true, Ordering::SeqCst);
            }),
        );
        let value = push(
            PushKind::Message,
            vec![
                RedisValue::new(ValueKind::SimpleString("chan".into())),
                RedisValue::new(ValueKind::SimpleString("hello".into())),
            ],
        );
        assert!(router.route(&value));
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn unregistered_channel_is_silently_dropped() {
        let router = PushRouter::new(None, None);
        let value = push(
            PushKind::Message,
            vec![
                RedisValue::new(ValueKind::SimpleString("ghost".into())),
                RedisValue::new(ValueKind::SimpleString("x".into())),
            ],
        );
        assert!(router.route(&value));
    }

    #[test]
    fn invalidate_with_keys_drops_only_their_slots() {
        let cache = Arc::new(ClientCache::new());
        cache.put(b"foo", RedisValue::new(ValueKind::SimpleString("v".into())));
        let router = PushRouter::new(Some(cache.clone()), None);
        let value = push(
            PushKind::Invalidate,
            vec![RedisValue::new(ValueKind::Array(vec![RedisValue::new(
                ValueKind::SimpleString("foo".into()),
            )]))],
        );
        assert!(router.route(&value));
        assert!(cache.get(b"foo").is_none());
    }

    #[test]
    fn invalidate_with_null_flushes_everything() {
        let cache = Arc::new(ClientCache::new());
        cache.put(b"foo", RedisValue::new(ValueKind::SimpleString("v".into())));
        let router = PushRouter::new(Some(cache.clone()), None);
        let value = push(PushKind::Invalidate, vec![RedisValue::nil()]);
        assert!(router.route(&value));
        assert!(cache.is_empty());
    }

    #[test]
    fn subscription_acks_are_not_routed_here() {
        let router = PushRouter::new(None, None);
        let value = push(
            PushKind::Subscribe,
            vec![
                RedisValue::new(ValueKind::SimpleString("chan".into())),
                RedisValue::new(ValueKind::Number(1)),
            ],
        );
        assert!(!router.route(&value));
    }

    #[test]
    fn invalidate_callback_fires_with_decoded_keys() {
        let seen: Arc<parking_lot::Mutex<Option<Option<Vec<String>>>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let seen2 = seen.clone();
        let router = PushRouter::new(
            None,
            Some(Arc::new(move |keys| *seen2.lock() = Some(keys))),
        );
        let value = push(
            PushKind::Invalidate,
            vec![RedisValue::new(ValueKind::Array(vec![RedisValue::new(
                ValueKind::SimpleString("foo".into()),
            )]))],
        );
        assert!(router.route(&value));
        assert_eq!(seen.lock().clone(), Some(Some(vec!["foo".to_string()])));
    }

    #[test]
    fn invalidate_callback_fires_with_none_on_flush_all() {
        let seen: Arc<parking_lot::Mutex<Option<Option<Vec<String>>>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let seen2 = seen.clone();
        let router = PushRouter::new(
            None,
            Some(Arc::new(move |keys| *seen2.lock() = Some(keys))),
        );
        let value = push(PushKind::Invalidate, vec![RedisValue::nil()]);
        assert!(router.route(&value));
        assert_eq!(seen.lock().clone(), Some(None));
    }
}
