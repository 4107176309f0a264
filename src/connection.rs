//! The connection multiplexer: owns one TCP half-duplex pair
//! and runs four cooperative tasks over it —
//!
//! - **sender**: drains whatever requests are currently queued into one
//!   encode-and-flush, so a burst of pipelined commands costs one write
//!   syscall instead of N.
//! - **reader**: decodes one value at a time off the wire.
//! - **dispatcher**: matches each decoded reply to the oldest still-open
//!   request (RESP3 carries no correlation id, so FIFO order is the only
//!   signal) and routes pushes that aren't subscription acks.
//! - **watcher**: notices when sender or reader dies and tears the
//!   connection down, failing every outstanding handle exactly once.
//!
//! This mirrors the FIFO in-flight queue a Redis multiplexed connection
//! keeps, restructured from one combinator task into four so that a slow
//! subscriber callback can't stall the read side.

use crate::cache::ClientCache;
use crate::codec::{Decoder, TeeReader};
use crate::commands;
use crate::config::Dialer;
use crate::error::{RedisError, RedisResult};
use crate::pubsub::PushRouter;
use crate::request::{
    new_request_with_callback, AckMode, Request, ResultHandle, SubscribeCallback,
};
use crate::tracer::{Direction, Tracer};
use crate::value::{PushKind, RedisValue, ValueKind};
use crate::version::Version;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, error, warn};

/// The connection's lifecycle, observable by anyone holding a `Connection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    ShuttingDown,
    Closed,
}

/// What `HELLO` told us about the server on handshake.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub server_version: Option<Version>,
    pub proto: i64,
}

struct InFlight {
    request: Arc<Request>,
    /// How many subscribe/unsubscribe-family pushes have acked this request
    /// so far; meaningless (and unused) for `AckMode::Single` requests.
    acks_seen: usize,
}

type InFlightQueue = parking_lot::Mutex<VecDeque<InFlight>>;

/// A handle to a running connection. Cloning shares the same underlying
/// tasks; dropping the last clone does not by itself close the connection —
/// call `close()` or let the pool do it.
#[derive(Clone)]
pub struct Connection {
    submit_tx: mpsc::UnboundedSender<Arc<Request>>,
    /// Held for the full duration of a submit (single or batch) so a
    /// pipeline's requests land contiguously in the FIFO queue regardless of
    /// what else is submitting on this connection concurrently.
    submit_order: Arc<parking_lot::Mutex<()>>,
    state_rx: watch::Receiver<ConnectionState>,
    info: Arc<ConnInfo>,
    cache: Option<Arc<ClientCache>>,
    shutting_down: Arc<AtomicBool>,
}

impl Connection {
    /// Dials `dialer.address` over TCP and hands the stream to
    /// [`Connection::from_stream`]. TLS/Unix-socket dialing is a caller
    /// concern: anything implementing
    /// `AsyncRead + AsyncWrite` can be passed to `from_stream` directly.
    pub async fn connect(dialer: &Dialer) -> RedisResult<Self> {
        let stream = TcpStream::connect(&dialer.address)
            .await
            .map_err(RedisError::Io)?;
        stream.set_nodelay(true).ok();
        Connection::from_stream(stream, dialer).await
    }

    /// Performs the `HELLO 3` handshake over an already-established stream
    /// and spawns the four cooperative tasks. This is the core entry point;
    /// `connect` is a thin TCP-dialing convenience on top of it.
    pub async fn from_stream<S>(stream: S, dialer: &Dialer) -> RedisResult<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = split(stream);

        let cache = dialer
            .invalidate_callback
            .is_some()
            .then(|| Arc::new(ClientCache::new()));
        let tracer = Tracer::new(dialer.trace_callback.clone());
        let router = Arc::new(PushRouter::new(cache.clone(), dialer.invalidate_callback.clone()));
        if let Some(cb) = &dialer.monitor_callback {
            router.set_monitor_callback(Some(cb.clone()));
        }
        if let Some(cb) = &dialer.push_callback {
            // A catch-all subscriber can still be layered on via
            // register_channel/register_pattern by the caller; storing it
            // here is not required by the core and is intentionally not
            // auto-wired, since routing is channel-scoped.
            let _ = cb;
        }

        let (submit_tx, submit_rx) = mpsc::unbounded_channel::<Arc<Request>>();
        let (decoded_tx, decoded_rx) = mpsc::unbounded_channel::<RedisResult<RedisValue>>();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Active);
        let in_flight: Arc<InFlightQueue> = Arc::new(parking_lot::Mutex::new(VecDeque::new()));
        let encode_mutex = Arc::new(AsyncMutex::new(write_half));

        let sender_handle = tokio::spawn(sender_task(
            submit_rx,
            encode_mutex.clone(),
            in_flight.clone(),
            tracer.clone(),
        ));
        let reader_handle = tokio::spawn(reader_task(read_half, decoded_tx, tracer.clone()));
        tokio::spawn(dispatcher_task(decoded_rx, in_flight.clone(), router));
        tokio::spawn(watcher_task(
            sender_handle,
            reader_handle,
            state_tx,
            in_flight,
        ));

        let conn = Connection {
            submit_tx,
            submit_order: Arc::new(parking_lot::Mutex::new(())),
            state_rx,
            info: Arc::new(ConnInfo {
                server_version: None,
                proto: 3,
            }),
            cache,
            shutting_down: Arc::new(AtomicBool::new(false)),
        };

        let hello_tokens = commands::hello(
            3,
            dialer.username.as_deref(),
            dialer.password.as_deref(),
            dialer.client_name.as_deref(),
        )?;
        let handle = conn.submit_raw(hello_tokens, None, AckMode::Single)?;
        let reply = handle.value(dialer.async_timeout).await?;
        let server_version = reply
            .to_map()
            .ok()
            .and_then(|pairs| {
                pairs.iter().find_map(|(k, v)| {
                    (k.to_string().ok()? == "version").then(|| v.to_string().ok()).flatten()
                })
            })
            .and_then(|v| Version::parse(&v));

        Ok(Connection {
            info: Arc::new(ConnInfo {
                server_version,
                proto: 3,
            }),
            ..conn
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn info(&self) -> &ConnInfo {
        &self.info
    }

    pub fn cache(&self) -> Option<&Arc<ClientCache>> {
        self.cache.as_ref()
    }

    /// Submits a single already-built command and returns its handle.
    pub fn submit(&self, tokens: Vec<Vec<u8>>) -> RedisResult<ResultHandle> {
        self.submit_raw(tokens, None, AckMode::Single)
    }

    /// Submits a `SUBSCRIBE`/`PSUBSCRIBE`/`UNSUBSCRIBE`/`PUNSUBSCRIBE` with an
    /// explicit, non-empty channel/pattern list: the server replies with
    /// exactly one push per entry, so the ack count is known up front.
    pub fn submit_with_callback(
        &self,
        tokens: Vec<Vec<u8>>,
        callback: SubscribeCallback,
        channels: Vec<String>,
    ) -> RedisResult<ResultHandle> {
        self.submit_raw(tokens, Some(callback), AckMode::Count(channels.len()))
    }

    /// Submits an argument-less `UNSUBSCRIBE`/`PUNSUBSCRIBE` ("unsubscribe
    /// everything"): the server emits one push per currently-subscribed
    /// channel with a trailing running count, and the client can't know that
    /// count in advance. The request stays at the front of the queue until a
    /// push reports the count has reached zero.
    pub fn submit_unsubscribe_all(&self, tokens: Vec<Vec<u8>>) -> RedisResult<ResultHandle> {
        self.submit_raw(tokens, None, AckMode::UntilZero)
    }

    fn submit_raw(
        &self,
        tokens: Vec<Vec<u8>>,
        callback: Option<SubscribeCallback>,
        ack_mode: AckMode,
    ) -> RedisResult<ResultHandle> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(RedisError::InShutdown);
        }
        if self.state() == ConnectionState::Closed {
            return Err(RedisError::Closed);
        }
        let (request, handle) = new_request_with_callback(tokens, callback, ack_mode);
        let request = Arc::new(request);
        let _order = self.submit_order.lock();
        self.submit_tx
            .send(request)
            .map_err(|_| RedisError::Closed)?;
        Ok(handle)
    }

    /// Submits a pre-built batch of requests in one call, preserving their
    /// relative order in the FIFO queue. Holds `submit_order` for the whole
    /// loop so no other submitter on this connection can interleave a
    /// request between two members of the batch.
    pub(crate) fn submit_batch(&self, requests: Vec<Arc<Request>>) -> RedisResult<()> {
        if self.shutting_down.load(Ordering::Acquire) || self.state() == ConnectionState::Closed {
            return Err(RedisError::Closed);
        }
        let _order = self.submit_order.lock();
        for request in requests {
            self.submit_tx.send(request).map_err(|_| RedisError::Closed)?;
        }
        Ok(())
    }

    /// Initiates a graceful shutdown: no new commands are accepted, a
    /// `QUIT` is sent, and the connection closes once its reply arrives.
    /// Idempotent; skipped for pool-owned connections, which the pool
    /// recycles instead of quitting.
    pub async fn close(&self) -> RedisResult<()> {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let tokens = commands::quit()?;
        let (request, handle) = new_request_with_callback(tokens, None, AckMode::Single);
        let _order = self.submit_order.lock();
        let _ = self.submit_tx.send(Arc::new(request));
        drop(_order);
        let _ = handle.value(Some(std::time::Duration::from_secs(2))).await;
        Ok(())
    }
}

/// Drains the submit channel in bursts: block for the first request, then
/// greedily pull whatever else is already queued so a flood of pipelined
/// commands shares one write.
async fn sender_task<S>(
    mut submit_rx: mpsc::UnboundedReceiver<Arc<Request>>,
    write_half: Arc<AsyncMutex<WriteHalf<S>>>,
    in_flight: Arc<InFlightQueue>,
    tracer: Tracer,
) where
    S: AsyncWrite + Send + 'static,
{
    let mut batch = Vec::new();
    loop {
        batch.clear();
        match submit_rx.recv().await {
            Some(req) => batch.push(req),
            None => return,
        }
        while let Ok(req) = submit_rx.try_recv() {
            batch.push(req);
        }

        let mut out = Vec::new();
        for req in &batch {
            crate::codec::encode_command(&req.tokens, &mut out);
        }

        let mut writer = write_half.lock().await;
        tracer.observe(Direction::Sent, &out);
        if let Err(e) = writer.write_all(&out).await {
            error!(error = %e, "sender: write failed, connection is dead");
            return;
        }
        if let Err(e) = writer.flush().await {
            error!(error = %e, "sender: flush failed, connection is dead");
            return;
        }
        drop(writer);

        let mut queue = in_flight.lock();
        for req in batch.drain(..) {
            req.mark_flushed();
            queue.push_back(InFlight {
                request: req,
                acks_seen: 0,
            });
        }
    }
}

async fn reader_task<S>(
    read_half: ReadHalf<S>,
    decoded_tx: mpsc::UnboundedSender<RedisResult<RedisValue>>,
    tracer: Tracer,
) where
    S: AsyncRead + Send + 'static,
{
    let mut decoder = Decoder::new(TeeReader::new(BufReader::new(read_half)));
    loop {
        let (result, raw) = decoder.decode_value_traced().await;
        let fatal = matches!(&result, Err(e) if e.is_protocol_fatal());
        if tracer.is_enabled() && !raw.is_empty() {
            tracer.observe(Direction::Received, &raw);
        }
        if decoded_tx.send(result).is_err() {
            return;
        }
        if fatal {
            return;
        }
    }
}

/// Correlates decoded replies with the in-flight queue in arrival order and
/// routes pushes that aren't part of that correlation.
async fn dispatcher_task(
    mut decoded_rx: mpsc::UnboundedReceiver<RedisResult<RedisValue>>,
    in_flight: Arc<InFlightQueue>,
    router: Arc<PushRouter>,
) {
    while let Some(result) = decoded_rx.recv().await {
        let value = match result {
            Ok(v) => v,
            Err(e) => {
                // A protocol-fatal error here is handled by the watcher,
                // which drains and fails the whole queue; nothing more to
                // correlate.
                warn!(error = %e, "dispatcher: decode error, yielding to watcher");
                return;
            }
        };

        if let ValueKind::Push { kind, .. } = &value.kind {
            if kind.is_subscription_ack() {
                consume_subscription_ack(&in_flight, &router, &value);
                continue;
            }
            if router.route(&value) {
                continue;
            }
        }

        let front = {
            let mut queue = in_flight.lock();
            queue.pop_front()
        };
        match front {
            Some(in_flight_entry) => {
                let attrs = value.attributes.clone();
                in_flight_entry.request.ack(value.into_result(), attrs);
            }
            None => {
                debug!("dispatcher: reply with no matching request, dropping");
            }
        }
    }
}

/// Registers or unregisters the front request's callback against the
/// channel/pattern named in this ack, then decides whether the request's
/// reply is complete: `Count(n)` pops once `n` acks have arrived;
/// `UntilZero` (an argument-less unsubscribe-all) pops once the push's own
/// trailing count reaches zero, since the number of pushes isn't known
/// ahead of time.
fn consume_subscription_ack(in_flight: &InFlightQueue, router: &PushRouter, push: &RedisValue) {
    let (kind, data) = match &push.kind {
        ValueKind::Push { kind, data } => (kind, data),
        _ => return,
    };
    let name = data.first().and_then(|v| v.to_string().ok());

    let mut queue = in_flight.lock();
    let Some(front) = queue.front_mut() else {
        return;
    };

    if let Some(name) = &name {
        if let Some(cb) = front.request.callback.clone() {
            match kind {
                PushKind::Subscribe | PushKind::SSubscribe => {
                    router.register_channel(name.clone(), cb)
                }
                PushKind::PSubscribe => router.register_pattern(name.clone(), cb),
                _ => {}
            }
        }
        match kind {
            PushKind::Unsubscribe | PushKind::SUnsubscribe => router.unregister_channel(name),
            PushKind::PUnsubscribe => router.unregister_pattern(name),
            _ => {}
        }
    }

    let done = match front.request.ack_mode {
        AckMode::Single => {
            warn!("subscription ack arrived for a request with no ack correlation, acking anyway");
            true
        }
        AckMode::Count(needed) => {
            front.acks_seen += 1;
            front.acks_seen >= needed
        }
        AckMode::UntilZero => data.get(1).and_then(|v| v.to_i64().ok()).unwrap_or(0) <= 0,
    };

    if done {
        let entry = queue.pop_front().expect("front checked above");
        drop(queue);
        entry.request.ack(Ok(push.clone()), push.attributes.clone());
    }
}

/// Supervises the sender and reader: when either exits (the only way they
/// do is a fatal I/O or protocol error), flips the connection to `Closed`
/// and fails every request still waiting in the queue exactly once.
async fn watcher_task(
    sender_handle: tokio::task::JoinHandle<()>,
    reader_handle: tokio::task::JoinHandle<()>,
    state_tx: watch::Sender<ConnectionState>,
    in_flight: Arc<InFlightQueue>,
) {
    tokio::select! {
        _ = sender_handle => {},
        _ = reader_handle => {},
    }
    state_tx.send(ConnectionState::Closed).ok();
    let mut queue = in_flight.lock();
    while let Some(entry) = queue.pop_front() {
        entry.request.ack(Err(RedisError::Closed), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestState;

    #[test]
    fn subscribe_request_carries_explicit_count() {
        let (req, _handle) = new_request_with_callback(
            commands::subscribe(&["a".into(), "b".into()]).unwrap(),
            None,
            AckMode::Count(2),
        );
        assert_eq!(req.ack_mode, AckMode::Count(2));
    }

    #[test]
    fn ordinary_request_acks_single() {
        let (req, _handle) =
            new_request_with_callback(commands::get("k").unwrap(), None, AckMode::Single);
        assert_eq!(req.ack_mode, AckMode::Single);
    }

    fn push(kind: PushKind, data: Vec<RedisValue>) -> RedisValue {
        RedisValue::new(ValueKind::Push { kind, data })
    }

    #[test]
    fn unsubscribe_all_stays_front_until_trailing_count_hits_zero() {
        let (req, handle) = new_request_with_callback(
            commands::unsubscribe(&[]).unwrap(),
            None,
            AckMode::UntilZero,
        );
        req.mark_flushed();
        let in_flight: InFlightQueue = parking_lot::Mutex::new(VecDeque::new());
        in_flight.lock().push_back(InFlight {
            request: Arc::new(req),
            acks_seen: 0,
        });
        let router = PushRouter::new(None, None);

        consume_subscription_ack(
            &in_flight,
            &router,
            &push(
                PushKind::Unsubscribe,
                vec![
                    RedisValue::new(ValueKind::SimpleString("chan-a".into())),
                    RedisValue::new(ValueKind::Number(1)),
                ],
            ),
        );
        assert_eq!(in_flight.lock().len(), 1, "front request stays queued while count > 0");
        assert_eq!(handle.state(), RequestState::Flushed);

        consume_subscription_ack(
            &in_flight,
            &router,
            &push(
                PushKind::Unsubscribe,
                vec![RedisValue::new(ValueKind::Null), RedisValue::new(ValueKind::Number(0))],
            ),
        );
        assert!(in_flight.lock().is_empty(), "front request pops once the count reaches zero");
        assert_eq!(handle.state(), RequestState::Available);
    }

    #[test]
    fn subscribe_count_pops_after_every_channel_acks() {
        let (req, handle) = new_request_with_callback(
            commands::subscribe(&["a".into(), "b".into()]).unwrap(),
            None,
            AckMode::Count(2),
        );
        req.mark_flushed();
        let in_flight: InFlightQueue = parking_lot::Mutex::new(VecDeque::new());
        in_flight.lock().push_back(InFlight {
            request: Arc::new(req),
            acks_seen: 0,
        });
        let router = PushRouter::new(None, None);

        consume_subscription_ack(
            &in_flight,
            &router,
            &push(
                PushKind::Subscribe,
                vec![
                    RedisValue::new(ValueKind::SimpleString("a".into())),
                    RedisValue::new(ValueKind::Number(1)),
                ],
            ),
        );
        assert_eq!(handle.state(), RequestState::Flushed);

        consume_subscription_ack(
            &in_flight,
            &router,
            &push(
                PushKind::Subscribe,
                vec![
                    RedisValue::new(ValueKind::SimpleString("b".into())),
                    RedisValue::new(ValueKind::Number(2)),
                ],
            ),
        );
        assert!(in_flight.lock().is_empty());
        assert_eq!(handle.state(), RequestState::Available);
    }
}
