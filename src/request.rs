//! Per-command request/result handle: a one-shot state machine
//! that the caller polls (via blocking `wait`) and the connection's
//! dispatcher publishes into, without ever requiring the two sides to take
//! a lock around the handoff itself.

use crate::error::{RedisError, RedisResult};
use crate::value::{Attributes, RedisValue};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::Notify;

const NOT_FLUSHED: u8 = 0;
const FLUSHED: u8 = 1;
const WAITING: u8 = 2;
const SETTING: u8 = 3;
const AVAILABLE: u8 = 4;

/// A request's lifecycle. All transitions are single CAS
/// operations on the shared `state` word; there is no lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    NotFlushed,
    Flushed,
    Waiting,
    Setting,
    Available,
}

impl From<u8> for RequestState {
    fn from(v: u8) -> Self {
        match v {
            NOT_FLUSHED => RequestState::NotFlushed,
            FLUSHED => RequestState::Flushed,
            WAITING => RequestState::Waiting,
            SETTING => RequestState::Setting,
            _ => RequestState::Available,
        }
    }
}

/// An optional pub/sub callback carried by subscribe-type requests: called
/// with `(pattern, channel, payload)` for each delivered message.
pub type SubscribeCallback = Arc<dyn Fn(Option<String>, String, RedisValue) + Send + Sync>;

/// How many subscription-family pushes complete a request's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// An ordinary command: exactly one reply, no push correlation.
    Single,
    /// `SUBSCRIBE`/`PSUBSCRIBE`/`UNSUBSCRIBE`/`PUNSUBSCRIBE` with an
    /// explicit channel/pattern list: one push per argument.
    Count(usize),
    /// `UNSUBSCRIBE`/`PUNSUBSCRIBE` with no arguments: the channel count
    /// isn't known up front, so pushes are consumed until the server's
    /// trailing subscription count reaches zero.
    UntilZero,
}

struct Shared {
    state: AtomicU8,
    notify: Notify,
    value: parking_lot::Mutex<Option<RedisResult<RedisValue>>>,
    attributes: parking_lot::Mutex<Option<Attributes>>,
}

/// A single command's wire-ready token vector plus everything the
/// multiplexer needs to correlate and deliver its reply.
pub struct Request {
    pub tokens: Vec<Vec<u8>>,
    pub callback: Option<SubscribeCallback>,
    pub ack_mode: AckMode,
    shared: Arc<Shared>,
}

/// The caller-visible one-shot handle for a request's eventual result.
#[derive(Clone)]
pub struct ResultHandle {
    shared: Arc<Shared>,
}

/// Builds a fresh `(Request, ResultHandle)` pair in the `NotFlushed` state.
pub fn new_request(tokens: Vec<Vec<u8>>) -> (Request, ResultHandle) {
    new_request_with_callback(tokens, None, AckMode::Single)
}

pub fn new_request_with_callback(
    tokens: Vec<Vec<u8>>,
    callback: Option<SubscribeCallback>,
    ack_mode: AckMode,
) -> (Request, ResultHandle) {
    let shared = Arc::new(Shared {
        state: AtomicU8::new(NOT_FLUSHED),
        notify: Notify::new(),
        value: parking_lot::Mutex::new(None),
        attributes: parking_lot::Mutex::new(None),
    });
    (
        Request {
            tokens,
            callback,
            ack_mode,
            shared: shared.clone(),
        },
        ResultHandle { shared },
    )
}

impl Request {
    pub fn state(&self) -> RequestState {
        self.shared.state.load(Ordering::Acquire).into()
    }

    /// `NotFlushed -> Flushed`. Called by the sender once the command's
    /// bytes have actually been written and the batch flushed.
    pub fn mark_flushed(&self) {
        self.shared
            .state
            .compare_exchange(NOT_FLUSHED, FLUSHED, Ordering::AcqRel, Ordering::Acquire)
            .ok();
    }

    /// Publishes a pre-flush error (e.g. an encoding failure) and
    /// transitions straight to `Available` without ever touching the wire.
    pub fn set_err_before_flush(&self, err: RedisError) {
        *self.shared.value.lock() = Some(Err(err));
        self.shared.state.store(AVAILABLE, Ordering::Release);
        self.shared.notify.notify_waiters();
    }

    /// Publishes the server's reply. Implements the Flushed/Waiting/Setting
    /// race: if a caller is already `Waiting`, publish and
    /// wake it; otherwise CAS `Flushed -> Setting`, publish, then CAS
    /// `Setting -> Available` so a late waiter sees the value without ever
    /// blocking.
    pub fn ack(&self, result: RedisResult<RedisValue>, attributes: Option<Attributes>) {
        *self.shared.value.lock() = Some(result);
        *self.shared.attributes.lock() = attributes;

        match self.shared.state.compare_exchange(
            WAITING,
            AVAILABLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.shared.notify.notify_waiters();
            }
            Err(_) => {
                // No one was waiting yet (or we raced a fresh Flushed
                // state); CAS into Setting to publish, then straight to
                // Available. A caller that calls `wait()` afterward sees
                // Available directly.
                self.shared
                    .state
                    .compare_exchange(FLUSHED, SETTING, Ordering::AcqRel, Ordering::Acquire)
                    .ok();
                self.shared.state.store(AVAILABLE, Ordering::Release);
                self.shared.notify.notify_waiters();
            }
        }
    }
}

impl ResultHandle {
    pub fn state(&self) -> RequestState {
        self.shared.state.load(Ordering::Acquire).into()
    }

    /// Blocks (cooperatively) until the handle reaches `Available`, bounded
    /// by `deadline`. Returns `NotFlushed` immediately if the handle was
    /// never flushed.
    pub async fn wait(&self, deadline: Option<Duration>) -> RedisResult<()> {
        if self.state() == RequestState::NotFlushed {
            return Err(RedisError::NotFlushed);
        }
        if self.state() == RequestState::Available {
            return Ok(());
        }

        // Announce that someone is waiting so `ack` knows to wake us
        // instead of silently publishing into Setting.
        self.shared
            .state
            .compare_exchange(FLUSHED, WAITING, Ordering::AcqRel, Ordering::Acquire)
            .ok();

        let wait_fut = WaitForAvailable {
            shared: &self.shared,
        };
        match deadline {
            None => {
                wait_fut.await;
                Ok(())
            }
            Some(d) => match tokio::time::timeout(d, wait_fut).await {
                Ok(()) => Ok(()),
                Err(_) => Err(RedisError::Timeout),
            },
        }
    }

    /// Returns the carried server error, if any, blocking for the reply.
    /// `NotFlushed` short-circuits before blocking.
    pub async fn err(&self, deadline: Option<Duration>) -> RedisResult<Option<RedisError>> {
        if self.state() == RequestState::NotFlushed {
            return Err(RedisError::NotFlushed);
        }
        self.wait(deadline).await?;
        let guard = self.shared.value.lock();
        match guard.as_ref() {
            Some(Err(e)) => Ok(Some(e.clone())),
            _ => Ok(None),
        }
    }

    /// Returns the value, blocking for the reply.
    pub async fn value(&self, deadline: Option<Duration>) -> RedisResult<RedisValue> {
        if self.state() == RequestState::NotFlushed {
            return Err(RedisError::NotFlushed);
        }
        self.wait(deadline).await?;
        let guard = self.shared.value.lock();
        match guard.as_ref() {
            Some(result) => result.clone(),
            None => Ok(RedisValue::nil()),
        }
    }

    pub async fn to_string(&self, deadline: Option<Duration>) -> RedisResult<String> {
        self.value(deadline).await?.to_string()
    }

    pub async fn to_i64(&self, deadline: Option<Duration>) -> RedisResult<i64> {
        self.value(deadline).await?.to_i64()
    }

    /// Exposes the attributes the server attached to the reply, if the
    /// handle has reached `Available`.
    pub async fn attr(&self, deadline: Option<Duration>) -> RedisResult<Option<Attributes>> {
        if self.state() == RequestState::NotFlushed {
            return Err(RedisError::NotFlushed);
        }
        self.wait(deadline).await?;
        Ok(self.shared.attributes.lock().clone())
    }
}

/// A future that resolves once `shared.state` reaches `Available`,
/// registering interest on `shared.notify` before each re-check to avoid
/// the classic missed-wakeup race.
struct WaitForAvailable<'a> {
    shared: &'a Shared,
}

impl<'a> Future for WaitForAvailable<'a> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.shared.state.load(Ordering::Acquire) == AVAILABLE {
            return Poll::Ready(());
        }
        let notified = self.shared.notify.notified();
        tokio::pin!(notified);
        if self.shared.state.load(Ordering::Acquire) == AVAILABLE {
            return Poll::Ready(());
        }
        match notified.poll(cx) {
            Poll::Ready(()) => {
                if self.shared.state.load(Ordering::Acquire) == AVAILABLE {
                    Poll::Ready(())
                } else {
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueKind;

    #[tokio::test]
    async fn not_flushed_is_observed_as_error() {
        let (_req, handle) = new_request(vec![b"PING".to_vec()]);
        assert_eq!(handle.state(), RequestState::NotFlushed);
        assert!(matches!(
            handle.value(None).await,
            Err(RedisError::NotFlushed)
        ));
    }

    #[tokio::test]
    async fn ack_before_wait_publishes_via_setting() {
        let (req, handle) = new_request(vec![b"PING".to_vec()]);
        req.mark_flushed();
        req.ack(Ok(RedisValue::new(ValueKind::SimpleString("PONG".into()))), None);
        assert_eq!(handle.to_string(None).await.unwrap(), "PONG");
    }

    #[tokio::test]
    async fn wait_then_ack_wakes_caller() {
        let (req, handle) = new_request(vec![b"PING".to_vec()]);
        req.mark_flushed();
        let handle2 = handle.clone();
        let waiter = tokio::spawn(async move { handle2.to_string(None).await });
        tokio::task::yield_now().await;
        req.ack(Ok(RedisValue::new(ValueKind::SimpleString("PONG".into()))), None);
        assert_eq!(waiter.await.unwrap().unwrap(), "PONG");
    }

    #[tokio::test]
    async fn timeout_elapses_without_ack() {
        let (req, handle) = new_request(vec![b"PING".to_vec()]);
        req.mark_flushed();
        let result = handle.value(Some(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(RedisError::Timeout)));
    }

    #[tokio::test]
    async fn server_error_surfaces_on_err() {
        let (req, handle) = new_request(vec![b"GET".to_vec(), b"missing".to_vec()]);
        req.mark_flushed();
        req.ack(
            Err(RedisError::Server {
                code: "ERR".into(),
                message: "boom".into(),
            }),
            None,
        );
        let err = handle.err(None).await.unwrap().unwrap();
        assert!(matches!(err, RedisError::Server { .. }));
    }
}
