//! Connection pool and feed lifecycle.
//!
//! [`FeedService`] owns every piece of mutable relay state: the subscriber
//! interest map, the pool of upstream connections (at most one per event
//! id), reconnect supervision, and the keepalive sweep. Pool mutations are
//! serialized through a single mutex; per-event connections run fully in
//! parallel.

use crate::broadcast::Broadcast;
use crate::config::FeedConfig;
use crate::connection::{self, ConnCommand, ConnShared};
use crate::interest::{InterestMap, SessionId};
use crate::keepalive;
use crate::router::UpdateRouter;
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of a connection's command channel.
const COMMAND_CHANNEL_SIZE: usize = 8;

/// One pool entry; at most one exists per event id at any instant.
struct PoolEntry {
    /// Distinguishes this instance from any later one for the same event
    /// id, so a dead task can never tear down its replacement.
    generation: u64,
    shared: Arc<ConnShared>,
    command_tx: mpsc::Sender<ConnCommand>,
    task: JoinHandle<()>,
}

struct Inner {
    config: FeedConfig,
    interest: Arc<InterestMap>,
    router: Arc<UpdateRouter>,
    sink: Arc<dyn Broadcast>,
    pool: Mutex<HashMap<String, PoolEntry>>,
    generation: AtomicU64,
    draining: AtomicBool,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the feed engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct FeedService {
    inner: Arc<Inner>,
}

impl FeedService {
    /// Build the service and start its keepalive sweep.
    pub fn start(config: FeedConfig, sink: Arc<dyn Broadcast>) -> FeedService {
        let interest = Arc::new(InterestMap::new());
        let router = Arc::new(UpdateRouter::new(interest.clone(), sink.clone()));
        let service = FeedService {
            inner: Arc::new(Inner {
                config,
                interest,
                router,
                sink,
                pool: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                draining: AtomicBool::new(false),
                sweep: Mutex::new(None),
            }),
        };

        let sweep = tokio::spawn(keepalive::sweep(service.clone()));
        *service.inner.sweep.lock().unwrap() = Some(sweep);

        service
    }

    /// Record a session's interest in an event and ensure an upstream
    /// connection exists for it.
    pub fn subscribe(&self, session: SessionId, event_id: &str) {
        let watchers = self.inner.interest.add(event_id, session);
        debug!("[{}] session {} subscribed ({} watching)", event_id, session, watchers);
        self.acquire(event_id);
    }

    /// Withdraw a session's interest; events left with no watchers get
    /// their connection torn down immediately.
    pub fn unsubscribe(&self, session: &SessionId, event_ids: &[String]) {
        for event_id in event_ids {
            let remaining = self.inner.interest.remove(event_id, session);
            debug!("[{}] session {} unsubscribed ({} watching)", event_id, session, remaining);
            if remaining == 0 {
                self.release(event_id);
            }
        }
    }

    /// Ensure a live upstream connection exists for `event_id`.
    /// Idempotent: concurrent acquires observe the same single connection.
    pub fn acquire(&self, event_id: &str) {
        self.spawn_connection(event_id, 0);
    }

    /// Tear down the connection for `event_id`, if any. The connection
    /// task sends a best-effort leave (only when open) before closing.
    /// No-op when no entry exists.
    pub fn release(&self, event_id: &str) {
        let entry = {
            let mut pool = self.inner.pool.lock().unwrap();
            let entry = pool.remove(event_id);
            gauge!("feed_pool_size").set(pool.len() as f64);
            entry
        };
        let Some(entry) = entry else { return };

        info!("[{}] no watchers left, closing upstream connection", event_id);
        if entry.command_tx.try_send(ConnCommand::Shutdown).is_err() {
            // Task already gone or wedged; make sure it cannot linger.
            entry.task.abort();
        }
    }

    /// Shut down every connection and stop background activity.
    pub async fn drain(&self) {
        self.inner.draining.store(true, Ordering::SeqCst);

        if let Some(sweep) = self.inner.sweep.lock().unwrap().take() {
            sweep.abort();
        }

        let entries: Vec<PoolEntry> = {
            let mut pool = self.inner.pool.lock().unwrap();
            pool.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            if entry.command_tx.try_send(ConnCommand::Shutdown).is_err() {
                entry.task.abort();
            }
        }
        for entry in entries {
            let _ = entry.task.await;
        }

        gauge!("feed_pool_size").set(0.0);
        info!("feed service drained");
    }

    /// Number of live pool entries.
    pub fn pool_size(&self) -> usize {
        self.inner.pool.lock().unwrap().len()
    }

    pub(crate) fn config(&self) -> &FeedConfig {
        &self.inner.config
    }

    /// Snapshot of every pooled connection, for the keepalive sweep.
    pub(crate) fn connections(&self) -> Vec<(Arc<ConnShared>, mpsc::Sender<ConnCommand>)> {
        self.inner
            .pool
            .lock()
            .unwrap()
            .values()
            .map(|entry| (entry.shared.clone(), entry.command_tx.clone()))
            .collect()
    }

    /// Insert a pool entry and spawn its connection task, unless one
    /// already exists. `attempt` is the consecutive-failure count carried
    /// by reconnection. Returns whether a connection was spawned.
    fn spawn_connection(&self, event_id: &str, attempt: u32) -> bool {
        let mut pool = self.inner.pool.lock().unwrap();
        if self.inner.draining.load(Ordering::SeqCst) || pool.contains_key(event_id) {
            return false;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(ConnShared::new(event_id.to_string()));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

        info!("[{}] opening upstream connection", event_id);
        if attempt > 0 {
            counter!("feed_reconnects_total").increment(1);
        }

        let task = tokio::spawn(connection_main(
            self.clone(),
            shared.clone(),
            command_rx,
            generation,
            attempt,
        ));
        pool.insert(
            event_id.to_string(),
            PoolEntry { generation, shared, command_tx, task },
        );
        gauge!("feed_pool_size").set(pool.len() as f64);
        true
    }

    /// Supervise a failed connection: drop its entry and schedule a
    /// recreation attempt with bounded exponential backoff.
    fn handle_connection_loss(&self, event_id: &str, generation: u64, attempt: u32, was_open: bool) {
        {
            let mut pool = self.inner.pool.lock().unwrap();
            match pool.get(event_id) {
                Some(entry) if entry.generation == generation => {
                    pool.remove(event_id);
                    gauge!("feed_pool_size").set(pool.len() as f64);
                }
                // Released or already replaced; nothing to supervise.
                _ => return,
            }
        }

        // A connection that made it to Open starts a fresh failure streak.
        let failures = if was_open { 1 } else { attempt + 1 };

        if failures >= self.inner.config.max_reconnect_attempts {
            error!(
                "[{}] upstream unavailable after {} attempts, giving up until next subscribe",
                event_id, failures
            );
            counter!("feed_reconnects_exhausted_total").increment(1);
            let sessions = self.inner.interest.sessions_of(event_id);
            if !sessions.is_empty() {
                self.inner.sink.unavailable(&sessions, event_id);
            }
            return;
        }

        let delay = reconnect_delay(&self.inner.config, failures);
        info!("[{}] scheduling reconnect attempt {} in {:?}", event_id, failures, delay);

        let service = self.clone();
        let event_id = event_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Re-validate: interest may have vanished while we slept, or a
            // fresh subscribe may have already created a replacement.
            if service.inner.draining.load(Ordering::SeqCst) {
                return;
            }
            if service.inner.interest.watcher_count(&event_id) == 0 {
                debug!("[{}] skipping reconnect, no watchers left", event_id);
                return;
            }
            service.spawn_connection(&event_id, failures);
        });
    }
}

/// Run one connection instance and hand its outcome to the supervisor.
async fn connection_main(
    service: FeedService,
    shared: Arc<ConnShared>,
    command_rx: mpsc::Receiver<ConnCommand>,
    generation: u64,
    attempt: u32,
) {
    let event_id = shared.event_id().to_string();
    let config = service.inner.config.clone();
    let router = service.inner.router.clone();

    match connection::run(shared.clone(), config, command_rx, router).await {
        // Commanded shutdown; the entry was already removed.
        Ok(()) => {}
        Err(e) => {
            warn!("[{}] upstream connection lost: {}", event_id, e);
            counter!("feed_connection_failures_total").increment(1);
            service.handle_connection_loss(&event_id, generation, attempt, shared.ever_open());
        }
    }
}

fn reconnect_delay(config: &FeedConfig, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    (config.reconnect_base_delay * 2u32.saturating_pow(exp)).min(config.reconnect_max_delay)
}
