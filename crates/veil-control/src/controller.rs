//! LocalRP session controller
//!
//! A session starts with the first registered agent and ends when the last
//! agent fails its heartbeat. While it is active, a single routing task pops
//! pending requests off a bounded queue, mints a correlation token for each,
//! and notifies a randomly chosen agent over its control connection.

use crate::agent_set::{AgentSet, TunnelAgent};
use crate::error::LocalRpError;
use crate::pending::PendingRequest;
use crate::task_tracker::TaskTracker;
use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use veil_io::{bridge, virtual_pair, BoxedStream, IoConfig, VirtualHandle};
use veil_proto::{
    Cipher, ControlMessage, CorrelationToken, Iv, HEARTBEAT_LEN, MAX_DESTINATION_LEN,
};

/// Response written on a control connection before anything else
const REGISTRATION_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// LocalRP settings
#[derive(Debug, Clone)]
pub struct LocalRpConfig {
    pub disabled: bool,
    /// Capacity of the pending-request queue
    pub capacity: usize,
    pub heartbeat_interval: Duration,
    /// Longest wait for room in a full queue
    pub bind_timeout: Duration,
}

impl Default for LocalRpConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            capacity: 100,
            heartbeat_interval: Duration::from_secs(1),
            bind_timeout: Duration::from_secs(10),
        }
    }
}

/// Snapshot of the session for periodic logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalRpStats {
    pub active: bool,
    pub agents: usize,
    pub waiting: usize,
    pub queued: usize,
}

enum QueueEntry {
    Request(PendingRequest),
    /// Poison entry ending the routing loop
    End,
}

struct Session {
    id: u64,
    agents: AgentSet,
    /// Routed requests keyed by correlation token
    waiting: HashMap<CorrelationToken, PendingRequest>,
    queue: mpsc::Sender<QueueEntry>,
}

enum SessionState {
    Idle,
    Active(Session),
}

/// Owns LocalRP rendezvous state
pub struct LocalRpController {
    config: LocalRpConfig,
    cipher: Cipher,
    state: Mutex<SessionState>,
    bridges: TaskTracker,
    next_session_id: AtomicU64,
    next_agent_id: AtomicU64,
    next_request_id: AtomicU64,
}

impl LocalRpController {
    pub fn new(config: LocalRpConfig, cipher: Cipher) -> Arc<Self> {
        Arc::new(Self {
            config,
            cipher,
            state: Mutex::new(SessionState::Idle),
            bridges: TaskTracker::new(),
            next_session_id: AtomicU64::new(1),
            next_agent_id: AtomicU64::new(1),
            next_request_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &LocalRpConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Id for a new pending request
    pub fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.lock_state(), SessionState::Active(_))
    }

    pub fn agent_count(&self) -> usize {
        match &*self.lock_state() {
            SessionState::Active(session) => session.agents.len(),
            SessionState::Idle => 0,
        }
    }

    pub fn stats(&self) -> LocalRpStats {
        match &*self.lock_state() {
            SessionState::Active(session) => LocalRpStats {
                active: true,
                agents: session.agents.len(),
                waiting: session.waiting.len(),
                queued: session.queue.max_capacity() - session.queue.capacity(),
            },
            SessionState::Idle => LocalRpStats::default(),
        }
    }

    /// Register the control connection of an agent.
    ///
    /// `conn` is the hijacked connection, `iv` and `ioc` those of the
    /// registration request. Returns the agent id.
    pub async fn register_agent(
        self: &Arc<Self>,
        mut conn: BoxedStream,
        addr: SocketAddr,
        iv: Iv,
        ioc: IoConfig,
    ) -> Result<u64, LocalRpError> {
        conn.write_all(REGISTRATION_RESPONSE).await?;
        conn.flush().await?;

        if self.config.disabled {
            let _ = conn.shutdown().await;
            return Err(LocalRpError::Disabled);
        }

        let (handle, vconn) = virtual_pair();
        let endpoint = Arc::new(handle);
        let agent_id = self.next_agent_id.fetch_add(1, Ordering::Relaxed);

        let started = {
            let mut state = self.lock_state();

            let mut started = None;
            if matches!(*state, SessionState::Idle) {
                let (tx, rx) = mpsc::channel(self.config.capacity.max(1));
                let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                *state = SessionState::Active(Session {
                    id: session_id,
                    agents: AgentSet::new(),
                    waiting: HashMap::new(),
                    queue: tx,
                });
                started = Some((session_id, rx));
            }

            if let SessionState::Active(session) = &mut *state {
                session.agents.push(TunnelAgent {
                    id: agent_id,
                    addr,
                    endpoint: endpoint.clone(),
                    connected_at: Utc::now(),
                });
            }

            started
        };

        if let Some((session_id, rx)) = started {
            info!(session_id, "LocalRP session started");
            let controller = self.clone();
            tokio::spawn(async move {
                controller.route(session_id, rx).await;
            });
        }

        info!(agent_id, addr = %addr, "🔗 LocalRP agent registered");

        let cipher = self.cipher.clone();
        let bridge_task = tokio::spawn(async move {
            if let Err(e) = bridge(conn, vconn, &cipher, &iv, &ioc).await {
                debug!(agent_id, "Agent bridge ended: {}", e);
            }
        });
        self.bridges.reap();
        self.bridges.register(agent_id, bridge_task);

        let controller = self.clone();
        tokio::spawn(async move {
            controller.heartbeat(agent_id, endpoint).await;
        });

        Ok(agent_id)
    }

    /// Queue a request for routing, waiting at most the bind timeout for room
    pub async fn enqueue(&self, request: PendingRequest) -> Result<(), LocalRpError> {
        let queue = match &*self.lock_state() {
            SessionState::Active(session) => session.queue.clone(),
            SessionState::Idle => return Err(LocalRpError::NoAgent),
        };

        match tokio::time::timeout(
            self.config.bind_timeout,
            queue.send(QueueEntry::Request(request)),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(LocalRpError::NoAgent),
            Err(_) => Err(LocalRpError::QueueFull),
        }
    }

    /// Remove and return the request bound to a correlation token.
    /// Each token is claimed at most once.
    pub fn claim(&self, token: &CorrelationToken) -> Option<PendingRequest> {
        match &mut *self.lock_state() {
            SessionState::Active(session) => session.waiting.remove(token),
            SessionState::Idle => None,
        }
    }

    /// Drop any waiting-map entry still referring to `request_id`
    pub fn forget(&self, request_id: u64) {
        if let SessionState::Active(session) = &mut *self.lock_state() {
            session.waiting.retain(|_, request| request.id != request_id);
        }
    }

    async fn route(self: Arc<Self>, session_id: u64, mut rx: mpsc::Receiver<QueueEntry>) {
        while let Some(entry) = rx.recv().await {
            let request = match entry {
                QueueEntry::Request(request) => request,
                QueueEntry::End => break,
            };

            if request.is_abandoned() {
                debug!(request_id = request.id, "Skipping abandoned LocalRP request");
                continue;
            }

            if request.destination.len() >= MAX_DESTINATION_LEN {
                request.complete(Err(LocalRpError::TooLong));
                continue;
            }

            match self.bind(session_id, request) {
                Ok((agent_id, token, endpoint, frame)) => {
                    debug!(agent_id, token = %token, "Routing LocalRP request");
                    tokio::spawn(async move {
                        if let Err(e) = endpoint.write_all(&frame).await {
                            warn!(agent_id, token = %token, "Failed to notify agent: {}", e);
                        }
                    });
                }
                Err((request, e)) => request.complete(Err(e)),
            }
        }

        // Requests that raced with teardown
        rx.close();
        while let Some(entry) = rx.recv().await {
            if let QueueEntry::Request(request) = entry {
                request.complete(Err(LocalRpError::NoAgent));
            }
        }

        debug!(session_id, "LocalRP routing loop stopped");
    }

    /// Mint a token for `request`, store it in the waiting map and pick the
    /// agent to notify
    #[allow(clippy::type_complexity)]
    fn bind(
        &self,
        session_id: u64,
        request: PendingRequest,
    ) -> Result<
        (u64, CorrelationToken, Arc<VirtualHandle>, bytes::Bytes),
        (PendingRequest, LocalRpError),
    > {
        let mut state = self.lock_state();

        let session = match &mut *state {
            SessionState::Active(session) if session.id == session_id => session,
            _ => return Err((request, LocalRpError::NoAgent)),
        };

        let (agent_id, endpoint) = match session.agents.pick(&mut rand::thread_rng()) {
            Some(agent) => (agent.id, agent.endpoint.clone()),
            None => return Err((request, LocalRpError::NoAgent)),
        };

        let mut token = CorrelationToken::generate();
        while session.waiting.contains_key(&token) {
            token = CorrelationToken::generate();
        }

        let frame = match ControlMessage::new(token, request.raw_request.clone()).encode() {
            Ok(frame) => frame,
            Err(e) => return Err((request, e.into())),
        };

        session.waiting.insert(token, request);
        Ok((agent_id, token, endpoint, frame))
    }

    async fn heartbeat(self: Arc<Self>, agent_id: u64, endpoint: Arc<VirtualHandle>) {
        let ping = [0u8; HEARTBEAT_LEN];
        let mut pong = [0u8; HEARTBEAT_LEN];

        loop {
            let round_trip = async {
                endpoint.write_all(&ping).await?;
                endpoint.read_exact(&mut pong).await
            };

            if let Err(e) = round_trip.await {
                debug!(agent_id, "Agent heartbeat failed: {}", e);
                break;
            }

            tokio::time::sleep(self.config.heartbeat_interval).await;
        }

        self.deregister(agent_id, &endpoint).await;
    }

    async fn deregister(&self, agent_id: u64, endpoint: &VirtualHandle) {
        let teardown = {
            let mut state = self.lock_state();

            let mut last = false;
            if let SessionState::Active(session) = &mut *state {
                if let Some(agent) = session.agents.remove(agent_id) {
                    let uptime = Utc::now() - agent.connected_at;
                    info!(
                        agent_id,
                        addr = %agent.addr,
                        uptime_secs = uptime.num_seconds(),
                        "LocalRP agent disconnected"
                    );
                }
                last = session.agents.is_empty();
            }

            if last {
                match std::mem::replace(&mut *state, SessionState::Idle) {
                    SessionState::Active(session) => Some(session),
                    SessionState::Idle => None,
                }
            } else {
                None
            }
        };

        if let Some(session) = teardown {
            let Session {
                id, waiting, queue, ..
            } = session;
            info!(
                session_id = id,
                waiting = waiting.len(),
                "LocalRP session ended"
            );
            drop(waiting);
            let _ = queue.send(QueueEntry::End).await;
        }

        endpoint.close().await;
        self.bridges.unregister(agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn boxed() -> BoxedStream {
        let (a, _b) = tokio::io::duplex(16);
        Box::new(a)
    }

    /// Activate a session whose queue nobody consumes
    fn stalled_session(
        controller: &LocalRpController,
        capacity: usize,
    ) -> mpsc::Receiver<QueueEntry> {
        let (tx, rx) = mpsc::channel(capacity);
        *controller.lock_state() = SessionState::Active(Session {
            id: 99,
            agents: AgentSet::new(),
            waiting: HashMap::new(),
            queue: tx,
        });
        rx
    }

    #[tokio::test]
    async fn test_idle_controller() {
        let controller = LocalRpController::new(LocalRpConfig::default(), Cipher::new("k"));

        assert!(!controller.is_active());
        assert_eq!(controller.stats(), LocalRpStats::default());
        assert!(controller
            .claim(&CorrelationToken::from_bytes([1; 16]))
            .is_none());

        let (request, _handle) = PendingRequest::new(1, "x", boxed(), Bytes::new());
        assert!(matches!(
            controller.enqueue(request).await,
            Err(LocalRpError::NoAgent)
        ));
    }

    #[tokio::test]
    async fn test_full_queue_times_out() {
        let config = LocalRpConfig {
            capacity: 1,
            bind_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let controller = LocalRpController::new(config, Cipher::new("k"));
        let _rx = stalled_session(&controller, 1);

        let (first, _h1) = PendingRequest::new(1, "a", boxed(), Bytes::new());
        controller.enqueue(first).await.unwrap();
        assert_eq!(controller.stats().queued, 1);

        let (second, h2) = PendingRequest::new(2, "b", boxed(), Bytes::new());
        assert!(matches!(
            controller.enqueue(second).await,
            Err(LocalRpError::QueueFull)
        ));
        // the caller still owns its connection
        assert!(h2.take_conn().is_some());
    }

    #[tokio::test]
    async fn test_bind_without_agents() {
        let controller = LocalRpController::new(LocalRpConfig::default(), Cipher::new("k"));
        let _rx = stalled_session(&controller, 4);

        let (request, _handle) = PendingRequest::new(5, "a", boxed(), Bytes::new());
        let err = controller.bind(99, request).err().map(|(_, e)| e);
        assert!(matches!(err, Some(LocalRpError::NoAgent)));

        let (request, _handle) = PendingRequest::new(6, "a", boxed(), Bytes::new());
        let err = controller.bind(1, request).err().map(|(_, e)| e);
        assert!(matches!(err, Some(LocalRpError::NoAgent)));
    }

    #[tokio::test]
    async fn test_forget_removes_waiting_entry() {
        let controller = LocalRpController::new(LocalRpConfig::default(), Cipher::new("k"));
        let _rx = stalled_session(&controller, 4);

        let (handle, _conn) = virtual_pair();
        if let SessionState::Active(session) = &mut *controller.lock_state() {
            session.agents.push(TunnelAgent {
                id: 1,
                addr: "127.0.0.1:1".parse().unwrap(),
                endpoint: Arc::new(handle),
                connected_at: Utc::now(),
            });
        }

        let (request, _h) = PendingRequest::new(7, "a", boxed(), Bytes::new());
        let (_, token, _, _) = controller.bind(99, request).unwrap();
        assert_eq!(controller.stats().waiting, 1);

        controller.forget(7);
        assert_eq!(controller.stats().waiting, 0);
        assert!(controller.claim(&token).is_none());
    }
}
