//! Byte-level tracing: a tee sitting between the codec and the
//! wire, handing every frame's raw bytes to a callback before (outbound) or
//! after (inbound) it crosses the socket.

use std::sync::Arc;

/// Which direction a traced frame crossed the wire in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

pub type TraceCallback = Arc<dyn Fn(Direction, &[u8]) + Send + Sync>;

/// Owned by the connection; `None` is the common case and costs a single
/// branch per frame.
#[derive(Clone, Default)]
pub struct Tracer {
    callback: Option<TraceCallback>,
}

impl Tracer {
    pub fn new(callback: Option<TraceCallback>) -> Self {
        Tracer { callback }
    }

    pub fn disabled() -> Self {
        Tracer { callback: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.callback.is_some()
    }

    /// Invoked by the sender task immediately before the batch is flushed to
    /// the socket, and by the reader task on each value's raw bytes as they
    /// come off the wire. Calls are serialized by the caller's own
    /// single-task ownership of the stream half it is tracing, so no
    /// internal lock is needed here.
    pub fn observe(&self, direction: Direction, bytes: &[u8]) {
        if let Some(cb) = &self.callback {
            cb(direction, bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn disabled_tracer_is_a_no_op() {
        let tracer = Tracer::disabled();
        assert!(!tracer.is_enabled());
        tracer.observe(Direction::Sent, b"*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn enabled_tracer_observes_both_directions() {
        let sent = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(AtomicUsize::new(0));
        let sent2 = sent.clone();
        let received2 = received.clone();
        let tracer = Tracer::new(Some(Arc::new(move |dir, bytes| match dir {
            Direction::Sent => {
                sent2.fetch_add(bytes.len(), Ordering::SeqCst);
            }
            Direction::Received => {
                received2.fetch_add(bytes.len(), Ordering::SeqCst);
            }
        })));
        tracer.observe(Direction::Sent, b"abc");
        tracer.observe(Direction::Received, b"de");
        assert_eq!(sent.load(Ordering::SeqCst), 3);
        assert_eq!(received.load(Ordering::SeqCst), 2);
    }
}
