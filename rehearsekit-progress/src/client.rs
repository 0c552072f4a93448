//! Per-job progress subscription with bounded reconnection

use crate::backoff::{ReconnectBudget, ReconnectPolicy};
use crate::channel::{Channel, Connector, Frame, WebSocketConnector};
use crate::endpoint::ProgressEndpoint;
use rehearsekit_shared::{ProgressUpdate, RehearseError};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Upper bound on waiting for the peer during an explicit close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub type UpdateCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&RehearseError) + Send + Sync>;

/// Lifecycle phase of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// State visible to both the owner and the connection task
struct Shared {
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
    /// Set by the task when it stops after spending its reconnect budget
    exhausted: AtomicBool,
}

/// The one connection task an instance may have
struct LiveChannel {
    handle: JoinHandle<()>,
    stopped: Arc<AtomicBool>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl LiveChannel {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(stop_tx) = self.stop_tx.take() {
            // The task may already have exited
            let _ = stop_tx.send(());
        }
    }
}

/// Everything the connection task needs, owned by the task
struct Worker {
    job_id: String,
    url: Url,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    on_update: UpdateCallback,
    on_error: Option<ErrorCallback>,
    shared: Arc<Shared>,
    stopped: Arc<AtomicBool>,
}

/// Live progress subscription for one job
pub struct ProgressStreamClient {
    job_id: String,
    endpoint: ProgressEndpoint,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    on_update: UpdateCallback,
    on_error: Option<ErrorCallback>,
    shared: Arc<Shared>,
    live: Option<LiveChannel>,
}

impl ProgressStreamClient {
    /// Create an idle client. No I/O happens until [`connect`](Self::connect).
    pub fn new<F>(
        job_id: impl Into<String>,
        endpoint: ProgressEndpoint,
        connector: Arc<dyn Connector>,
        on_update: F,
    ) -> Self
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        let (state, _) = watch::channel(ConnectionState::Idle);

        Self {
            job_id: job_id.into(),
            endpoint,
            connector,
            policy: ReconnectPolicy::default(),
            on_update: Arc::new(on_update),
            on_error: None,
            shared: Arc::new(Shared {
                state,
                attempts: AtomicU32::new(0),
                exhausted: AtomicBool::new(false),
            }),
            live: None,
        }
    }

    /// Client backed by the websocket transport
    pub fn websocket<F>(job_id: impl Into<String>, endpoint: ProgressEndpoint, on_update: F) -> Self
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        Self::new(job_id, endpoint, Arc::new(WebSocketConnector), on_update)
    }

    pub fn with_error_callback<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&RehearseError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Automatic reconnects consumed since the last successful open
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Whether a connection task currently exists
    pub fn has_handle(&self) -> bool {
        self.live.is_some()
    }

    /// Whether the task gave up after its last allowed reconnect failed. Only a new
    /// [`connect`](Self::connect) clears this.
    pub fn is_exhausted(&self) -> bool {
        self.shared.exhausted.load(Ordering::SeqCst) && self.state() == ConnectionState::Closed
    }

    pub fn is_connected(&self) -> bool {
        self.live.as_ref().is_some_and(LiveChannel::is_running)
            && self.state() == ConnectionState::Open
    }

    /// Open the channel. A no-op while connecting or open; otherwise (idle, waiting out a
    /// backoff, or after the budget was spent) it starts over with a full budget.
    pub fn connect(&mut self) {
        if let Some(live) = &self.live {
            if live.is_running()
                && matches!(
                    self.state(),
                    ConnectionState::Connecting | ConnectionState::Open
                )
            {
                debug!("Progress channel for job {} already active", self.job_id);
                return;
            }
        }

        // Stop any previous task before its replacement exists
        self.live = None;

        let url = match self.endpoint.channel_url(&self.job_id) {
            Ok(url) => url,
            Err(e) => {
                warn!("Failed to build progress channel URL for job {}: {}", self.job_id, e);
                self.fail_to_start(&e);
                return;
            }
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                let e = RehearseError::Channel("no async runtime available".to_string());
                warn!("Cannot connect progress channel for job {}: {}", self.job_id, e);
                self.fail_to_start(&e);
                return;
            }
        };

        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.exhausted.store(false, Ordering::SeqCst);
        self.shared.state.send_replace(ConnectionState::Connecting);

        let stopped = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = Worker {
            job_id: self.job_id.clone(),
            url,
            connector: Arc::clone(&self.connector),
            policy: self.policy,
            on_update: Arc::clone(&self.on_update),
            on_error: self.on_error.clone(),
            shared: Arc::clone(&self.shared),
            stopped: Arc::clone(&stopped),
        };

        let handle = runtime.spawn(worker.run(stop_rx));
        self.live = Some(LiveChannel {
            handle,
            stopped,
            stop_tx: Some(stop_tx),
        });
    }

    /// Close the channel and cancel any pending reconnect. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if let Some(live) = self.live.take() {
            drop(live);
            self.shared.state.send_replace(ConnectionState::Closed);
            info!("Progress channel for job {} disconnected", self.job_id);
        }
    }

    fn fail_to_start(&self, e: &RehearseError) {
        if let Some(on_error) = &self.on_error {
            on_error(e);
        }
        self.shared.state.send_replace(ConnectionState::Closed);
    }
}

impl Drop for ProgressStreamClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Worker {
    async fn run(self, mut stop_rx: oneshot::Receiver<()>) {
        let mut budget = ReconnectBudget::new(self.policy);

        loop {
            self.set_state(ConnectionState::Connecting);
            info!("WebSocket connecting to: {}", self.url);

            let opened = tokio::select! {
                biased;
                _ = &mut stop_rx => return,
                opened = self.connector.open(&self.url) => opened,
            };

            match opened {
                Ok(mut channel) => {
                    budget.reset();
                    self.shared.attempts.store(0, Ordering::SeqCst);
                    self.set_state(ConnectionState::Open);
                    info!("Progress channel connected for job {}", self.job_id);

                    if self.pump(channel.as_mut(), &mut stop_rx).await {
                        if tokio::time::timeout(CLOSE_TIMEOUT, channel.close()).await.is_err() {
                            debug!("Peer did not acknowledge close for job {}", self.job_id);
                        }
                        return;
                    }

                    self.set_state(ConnectionState::Closed);
                    info!("Progress channel closed for job {}", self.job_id);
                }
                Err(e) => {
                    warn!("Progress channel for job {} failed to open: {}", self.job_id, e);
                    self.report_error(&e);
                    self.set_state(ConnectionState::Closed);
                }
            }

            let Some(delay) = budget.next_delay() else {
                warn!("Max reconnection attempts reached for job {}", self.job_id);
                self.give_up();
                return;
            };

            self.shared.attempts.store(budget.attempts(), Ordering::SeqCst);
            info!(
                "Attempting to reconnect ({}/{})...",
                budget.attempts(),
                budget.max_attempts()
            );

            tokio::select! {
                biased;
                _ = &mut stop_rx => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Deliver frames until the channel drops. Returns true if stopped by the owner.
    async fn pump(&self, channel: &mut dyn Channel, stop_rx: &mut oneshot::Receiver<()>) -> bool {
        loop {
            let frame = tokio::select! {
                biased;
                _ = &mut *stop_rx => return true,
                frame = channel.next_frame() => frame,
            };

            match frame {
                Some(Ok(Frame::Text(text))) => self.deliver(text.as_bytes()),
                Some(Ok(Frame::Binary(bytes))) => self.deliver(&bytes),
                Some(Ok(Frame::Close)) => return false,
                Some(Err(e)) => {
                    warn!("WebSocket error for job {}: {}", self.job_id, e);
                    self.report_error(&e);
                    return false;
                }
                None => return false,
            }
        }
    }

    fn deliver(&self, payload: &[u8]) {
        let update = match ProgressUpdate::decode(payload) {
            Ok(update) => update,
            Err(e) => {
                warn!("Failed to parse progress message for job {}: {}", self.job_id, e);
                return;
            }
        };

        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        (self.on_update)(update);
    }

    fn report_error(&self, e: &RehearseError) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if let Some(on_error) = &self.on_error {
            on_error(e);
        }
    }

    /// Record exhaustion and wake state observers even though the state stays `Closed`
    fn give_up(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.shared.exhausted.store(true, Ordering::SeqCst);
        self.shared.state.send_modify(|_| {});
    }

    /// State writes from a stopped task are dropped; the owner already recorded `Closed`
    fn set_state(&self, next: ConnectionState) {
        self.shared.state.send_if_modified(|state| {
            if self.stopped.load(Ordering::SeqCst) || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rehearsekit_shared::{JobStatus, Result};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    type FrameSender = mpsc::UnboundedSender<Result<Frame>>;

    enum Outcome {
        Refuse,
        /// Handshake that never completes
        Hang,
        Accept(mpsc::UnboundedReceiver<Result<Frame>>, Arc<AtomicBool>),
    }

    #[derive(Default)]
    struct ScriptedConnector {
        outcomes: Mutex<VecDeque<Outcome>>,
        opened: Mutex<Vec<(Instant, String)>>,
    }

    impl ScriptedConnector {
        /// Queue an accepted connection; returns its frame sender and closed-by-us flag
        fn accept(&self) -> (FrameSender, Arc<AtomicBool>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let closed = Arc::new(AtomicBool::new(false));
            self.outcomes
                .lock()
                .unwrap()
                .push_back(Outcome::Accept(rx, closed.clone()));
            (tx, closed)
        }

        fn hang(&self) {
            self.outcomes.lock().unwrap().push_back(Outcome::Hang);
        }

        fn refuse(&self) {
            self.outcomes.lock().unwrap().push_back(Outcome::Refuse);
        }

        fn open_count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }

        fn open_times(&self) -> Vec<Instant> {
            self.opened.lock().unwrap().iter().map(|(at, _)| *at).collect()
        }

        fn urls(&self) -> Vec<String> {
            self.opened
                .lock()
                .unwrap()
                .iter()
                .map(|(_, url)| url.clone())
                .collect()
        }
    }

    struct ScriptedChannel {
        frames: mpsc::UnboundedReceiver<Result<Frame>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Channel for ScriptedChannel {
        async fn next_frame(&mut self) -> Option<Result<Frame>> {
            self.frames.recv().await
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn open(&self, url: &Url) -> Result<Box<dyn Channel>> {
            self.opened
                .lock()
                .unwrap()
                .push((Instant::now(), url.to_string()));

            let outcome = self.outcomes.lock().unwrap().pop_front();
            match outcome {
                Some(Outcome::Hang) => std::future::pending().await,
                Some(Outcome::Accept(frames, closed)) => {
                    Ok(Box::new(ScriptedChannel { frames, closed }))
                }
                Some(Outcome::Refuse) | None => {
                    Err(RehearseError::Channel("connection refused".to_string()))
                }
            }
        }
    }

    struct Harness {
        client: ProgressStreamClient,
        connector: Arc<ScriptedConnector>,
        updates: Arc<Mutex<Vec<ProgressUpdate>>>,
        errors: Arc<AtomicU32>,
    }

    fn harness(job_id: &str) -> Harness {
        let connector = Arc::new(ScriptedConnector::default());
        let updates = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(AtomicU32::new(0));

        let endpoint = ProgressEndpoint::new("ws://localhost:8001", "/ws").unwrap();
        let dyn_connector: Arc<dyn Connector> = connector.clone();
        let client = ProgressStreamClient::new(job_id, endpoint, dyn_connector, {
            let updates = updates.clone();
            move |update| updates.lock().unwrap().push(update)
        })
        .with_error_callback({
            let errors = errors.clone();
            move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            }
        });

        Harness {
            client,
            connector,
            updates,
            errors,
        }
    }

    impl Harness {
        fn updates(&self) -> Vec<ProgressUpdate> {
            self.updates.lock().unwrap().clone()
        }
    }

    fn text(payload: &str) -> Result<Frame> {
        Ok(Frame::Text(payload.to_string()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_update_for_job() {
        let mut h = harness("job-42");
        let (frames, _) = h.connector.accept();

        assert_eq!(h.client.state(), ConnectionState::Idle);
        h.client.connect();
        settle().await;

        assert!(h.client.is_connected());
        assert_eq!(
            h.connector.urls(),
            vec!["ws://localhost:8001/ws/jobs/job-42/progress"]
        );

        frames
            .send(text(
                r#"{"job_id":"job-42","status":"SEPARATING","progress_percent":55}"#,
            ))
            .unwrap();
        settle().await;

        assert_eq!(
            h.updates(),
            vec![ProgressUpdate {
                job_id: "job-42".to_string(),
                status: JobStatus::Separating,
                progress_percent: 55,
                message: None,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_are_discarded() {
        let mut h = harness("job-7");
        let (frames, _) = h.connector.accept();
        h.client.connect();
        settle().await;

        frames.send(text("not json at all")).unwrap();
        frames.send(text(r#"{"job_id":"job-7"}"#)).unwrap();
        frames.send(Ok(Frame::Binary(vec![0xff, 0x00]))).unwrap();
        frames
            .send(text(
                r#"{"job_id":"job-7","status":"PACKAGING","progress_percent":90,"message":"Zipping stems"}"#,
            ))
            .unwrap();
        settle().await;

        let updates = h.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].message.as_deref(), Some("Zipping stems"));
        assert!(h.client.is_connected());
        assert_eq!(h.errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_arrive_in_order() {
        let mut h = harness("job-1");
        let (frames, _) = h.connector.accept();
        h.client.connect();
        settle().await;

        for percent in [10, 20, 30, 100] {
            let status = if percent == 100 { "COMPLETED" } else { "ANALYZING" };
            frames
                .send(text(&format!(
                    r#"{{"job_id":"job-1","status":"{status}","progress_percent":{percent}}}"#
                )))
                .unwrap();
        }
        settle().await;

        let percents: Vec<u8> = h.updates().iter().map(|u| u.progress_percent).collect();
        assert_eq!(percents, vec![10, 20, 30, 100]);
        assert!(h.updates().last().unwrap().status.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_schedules_first_attempt_then_reconnects() {
        let mut h = harness("job-42");
        let (frames, _) = h.connector.accept();
        let (_second, _) = h.connector.accept();
        h.client.connect();
        settle().await;

        drop(frames);
        settle().await;
        assert_eq!(h.client.reconnect_attempts(), 1);
        assert_eq!(h.client.state(), ConnectionState::Closed);
        assert!(!h.client.is_connected());
        assert_eq!(h.connector.open_count(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.connector.open_count(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.connector.open_count(), 2);
        assert!(h.client.is_connected());
        assert_eq!(h.client.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_are_bounded_with_linear_backoff() {
        let mut h = harness("job-42");
        h.client.connect();

        tokio::time::sleep(Duration::from_secs(60)).await;

        // Initial open plus five reconnects, nothing after that
        let times = h.connector.open_times();
        assert_eq!(times.len(), 6);
        for (i, pair) in times.windows(2).enumerate() {
            let gap = pair[1] - pair[0];
            let expected = Duration::from_secs(i as u64 + 1);
            assert!(
                gap >= expected && gap < expected + Duration::from_millis(5),
                "gap {i} was {gap:?}"
            );
        }

        assert_eq!(h.client.reconnect_attempts(), 5);
        assert_eq!(h.client.state(), ConnectionState::Closed);
        assert!(!h.client.is_connected());
        assert_eq!(h.errors.load(Ordering::SeqCst), 6);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.connector.open_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_open_resets_attempts() {
        let mut h = harness("job-42");
        h.connector.refuse();
        h.connector.refuse();
        let (frames, _) = h.connector.accept();
        h.client.connect();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.connector.open_count(), 3);
        assert!(h.client.is_connected());
        assert_eq!(h.client.reconnect_attempts(), 0);

        drop(frames);
        settle().await;
        // 1/5 again, not 3/5
        assert_eq!(h.client.reconnect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent_and_final() {
        let mut h = harness("job-42");
        let (frames, closed) = h.connector.accept();
        h.client.connect();
        settle().await;
        assert!(h.client.has_handle());

        h.client.disconnect();
        assert!(!h.client.has_handle());
        assert_eq!(h.client.state(), ConnectionState::Closed);

        h.client.disconnect();
        assert!(!h.client.has_handle());
        assert_eq!(h.client.state(), ConnectionState::Closed);

        settle().await;
        assert!(closed.load(Ordering::SeqCst));

        // Late frames go nowhere and no reconnect happens
        let _ = frames.send(text(
            r#"{"job_id":"job-42","status":"FINALIZING","progress_percent":95}"#,
        ));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.updates().is_empty());
        assert_eq!(h.connector.open_count(), 1);
        assert_eq!(h.client.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let mut h = harness("job-42");
        h.client.connect();
        settle().await;
        assert_eq!(h.client.reconnect_attempts(), 1);

        h.client.disconnect();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.connector.open_count(), 1);
        assert_eq!(h.client.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_open_is_a_no_op() {
        let mut h = harness("job-42");
        let (_frames, _) = h.connector.accept();
        h.client.connect();
        settle().await;

        h.client.connect();
        settle().await;

        assert_eq!(h.connector.open_count(), 1);
        assert!(h.client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_after_budget_spent_starts_over() {
        let mut h = harness("job-42");
        h.client.connect();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.connector.open_count(), 6);
        assert!(h.client.has_handle());

        let (_frames, _) = h.connector.accept();
        h.client.connect();
        settle().await;

        assert_eq!(h.connector.open_count(), 7);
        assert!(h.client.is_connected());
        assert_eq!(h.client.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_reaches_error_callback() {
        let mut h = harness("job-42");
        let (frames, _) = h.connector.accept();
        h.client.connect();
        settle().await;

        frames
            .send(Err(RehearseError::Channel("connection reset".to_string())))
            .unwrap();
        settle().await;

        assert_eq!(h.errors.load(Ordering::SeqCst), 1);
        assert_eq!(h.client.reconnect_attempts(), 1);
        assert_eq!(h.client.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_client_stops_task() {
        let h = harness("job-42");
        let connector = h.connector.clone();
        let (frames, closed) = connector.accept();

        let mut client = h.client;
        client.connect();
        settle().await;
        drop(client);
        settle().await;

        assert!(closed.load(Ordering::SeqCst));
        drop(frames);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_frame_triggers_reconnect_path() {
        let mut h = harness("job-42");
        let (frames, _) = h.connector.accept();
        h.client.connect();
        settle().await;

        frames.send(Ok(Frame::Close)).unwrap();
        settle().await;

        assert_eq!(h.client.state(), ConnectionState::Closed);
        assert_eq!(h.client.reconnect_attempts(), 1);
        h.client.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_waits_for_last_reconnect() {
        let mut h = harness("job-42");
        let mut state = h.client.subscribe_state();
        h.client.connect();

        // Observe the way a watcher would: stop at the first exhausted state
        loop {
            state.changed().await.unwrap();
            state.borrow_and_update();
            if h.client.is_exhausted() {
                break;
            }
        }

        assert_eq!(h.connector.open_count(), 6);
        assert_eq!(h.client.reconnect_attempts(), 5);
        assert_eq!(h.client.state(), ConnectionState::Closed);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.connector.open_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_exhausted_while_backing_off() {
        let mut h = harness("job-42");
        h.client.connect();

        // Fourth reconnect fails at t=10s, the fifth is due at t=15s
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(h.connector.open_count(), 5);
        assert_eq!(h.client.state(), ConnectionState::Closed);
        assert!(!h.client.is_exhausted());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.connector.open_count(), 6);
        assert!(h.client.is_exhausted());

        let (_frames, _) = h.connector.accept();
        h.client.connect();
        assert!(!h.client.is_exhausted());
        settle().await;
        assert!(h.client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_during_pending_handshake_is_a_no_op() {
        let mut h = harness("job-42");
        h.connector.hang();
        h.client.connect();
        settle().await;

        assert_eq!(h.client.state(), ConnectionState::Connecting);
        assert!(!h.client.is_connected());

        h.client.connect();
        settle().await;

        assert_eq!(h.connector.open_count(), 1);
        assert_eq!(h.client.state(), ConnectionState::Connecting);

        h.client.disconnect();
        assert_eq!(h.client.state(), ConnectionState::Closed);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_without_error_callback() {
        let connector = Arc::new(ScriptedConnector::default());
        let updates = Arc::new(Mutex::new(Vec::new()));
        connector.refuse();
        let (frames, _) = connector.accept();

        let endpoint = ProgressEndpoint::new("ws://localhost:8001", "/ws").unwrap();
        let dyn_connector: Arc<dyn Connector> = connector.clone();
        let mut client = ProgressStreamClient::new("job-3", endpoint, dyn_connector, {
            let updates = updates.clone();
            move |update: ProgressUpdate| updates.lock().unwrap().push(update)
        });

        client.connect();
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(connector.open_count(), 2);
        assert!(client.is_connected());

        frames
            .send(Err(RehearseError::Channel("connection reset".to_string())))
            .unwrap();
        settle().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.reconnect_attempts(), 1);
        assert!(updates.lock().unwrap().is_empty());
        client.disconnect();
    }
}
