//! Client connections waiting for an agent

use crate::error::LocalRpError;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use veil_io::BoxedStream;

/// Outcome reported to the waiting client
pub type Completion = Result<(), LocalRpError>;

/// Holds the hijacked client connection until exactly one party takes it
pub type ConnSlot = Arc<Mutex<Option<BoxedStream>>>;

/// Take the connection out of a slot, if still present
pub fn take_conn(slot: &ConnSlot) -> Option<BoxedStream> {
    match slot.lock() {
        Ok(mut conn) => conn.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

fn is_empty(slot: &ConnSlot) -> bool {
    match slot.lock() {
        Ok(conn) => conn.is_none(),
        Err(poisoned) => poisoned.into_inner().is_none(),
    }
}

/// A queued client request, owned by the queue and then by the waiting map
pub struct PendingRequest {
    pub id: u64,
    pub destination: String,
    pub conn: ConnSlot,
    pub raw_request: Bytes,
    completion: oneshot::Sender<Completion>,
}

/// The client side's view of its pending request
pub struct PendingHandle {
    pub id: u64,
    pub conn: ConnSlot,
    pub completion: oneshot::Receiver<Completion>,
}

impl PendingRequest {
    pub fn new(
        id: u64,
        destination: impl Into<String>,
        conn: BoxedStream,
        raw_request: Bytes,
    ) -> (Self, PendingHandle) {
        let slot: ConnSlot = Arc::new(Mutex::new(Some(conn)));
        let (tx, rx) = oneshot::channel();

        let request = Self {
            id,
            destination: destination.into(),
            conn: slot.clone(),
            raw_request,
            completion: tx,
        };
        let handle = PendingHandle {
            id,
            conn: slot,
            completion: rx,
        };

        (request, handle)
    }

    /// The client already gave up and took its connection back
    pub fn is_abandoned(&self) -> bool {
        is_empty(&self.conn)
    }

    /// Take the original client connection
    pub fn take_conn(&self) -> Option<BoxedStream> {
        take_conn(&self.conn)
    }

    /// Report the outcome to the waiting client
    pub fn complete(self, result: Completion) {
        let _ = self.completion.send(result);
    }
}

impl PendingHandle {
    /// Take the connection back, unless a fulfiller already claimed it
    pub fn take_conn(&self) -> Option<BoxedStream> {
        take_conn(&self.conn)
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("raw_len", &self.raw_request.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed() -> BoxedStream {
        let (a, _b) = tokio::io::duplex(16);
        Box::new(a)
    }

    #[tokio::test]
    async fn test_conn_taken_once() {
        let (request, handle) = PendingRequest::new(1, "dest", boxed(), Bytes::new());

        assert!(!request.is_abandoned());
        assert!(request.take_conn().is_some());
        assert!(handle.take_conn().is_none());
        assert!(request.is_abandoned());
    }

    #[tokio::test]
    async fn test_completion_delivered() {
        let (request, handle) = PendingRequest::new(2, "dest", boxed(), Bytes::new());

        request.complete(Err(LocalRpError::TooLong));
        let result = handle.completion.await.unwrap();
        assert_eq!(result.unwrap_err().to_string(), "request too long");
    }

    #[tokio::test]
    async fn test_dropped_request_closes_channel() {
        let (request, handle) = PendingRequest::new(3, "dest", boxed(), Bytes::new());
        drop(request);

        assert!(handle.completion.await.is_err());
        assert!(handle.conn.lock().unwrap().is_some());
    }
}
