//! Client-owned command accumulator: queue up any number of
//! commands locally, then hand them to the connection as one atomic batch
//! so their FIFO position in the in-flight queue is contiguous.

use crate::connection::Connection;
use crate::error::RedisResult;
use crate::request::{new_request, ResultHandle};
use std::sync::Arc;

/// Accumulates requests that have not yet been flushed to a connection:
/// build up commands, then send them together, but hand back a live handle
/// per command instead of a single aggregated reply, since each command
/// here is already an independent async result.
#[derive(Default)]
pub struct Pipeline {
    requests: Vec<Arc<crate::request::Request>>,
    handles: Vec<ResultHandle>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline {
            requests: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// Queues one command's tokens and returns its handle immediately; the
    /// handle stays `NotFlushed` until `flush()` runs.
    pub fn queue(&mut self, tokens: Vec<Vec<u8>>) -> ResultHandle {
        let (request, handle) = new_request(tokens);
        self.requests.push(Arc::new(request));
        self.handles.push(handle.clone());
        handle
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Hands the whole queued batch to `connection` in one call, preserving
    /// order, and returns every handle in the order they were queued.
    pub fn flush(&mut self, connection: &Connection) -> RedisResult<Vec<ResultHandle>> {
        let requests = std::mem::take(&mut self.requests);
        let handles = std::mem::take(&mut self.handles);
        connection.submit_batch(requests)?;
        Ok(handles)
    }

    /// Drops every queued-but-unflushed request without sending them.
    pub fn reset(&mut self) {
        self.requests.clear();
        self.handles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_tracks_length_until_flush_or_reset() {
        let mut pipeline = Pipeline::new();
        assert!(pipeline.is_empty());
        pipeline.queue(vec![b"PING".to_vec()]);
        pipeline.queue(vec![b"PING".to_vec()]);
        assert_eq!(pipeline.len(), 2);
        pipeline.reset();
        assert!(pipeline.is_empty());
    }

    #[test]
    fn queue_returns_not_flushed_handles() {
        let mut pipeline = Pipeline::new();
        let handle = pipeline.queue(vec![b"PING".to_vec()]);
        assert_eq!(
            handle.state(),
            crate::request::RequestState::NotFlushed
        );
    }
}
