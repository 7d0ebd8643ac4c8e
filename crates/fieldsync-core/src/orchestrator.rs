//! Owns one queue per domain and decides when to push them.
//!
//! Screens call [`SyncOrchestrator::submit`] and read pending counts; the
//! orchestrator pushes every queue when connectivity comes back and keeps
//! the count badges fresh on a timer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::auth::{current_bearer_token, SessionPersistence};
use crate::cache::ReadThroughCache;
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::domain::{FormDomain, SyncDomain};
use crate::http::{HttpTransport, ReqwestTransport, ServerAck};
use crate::notice::{NoticeSender, SyncNotice};
use crate::queue::{QueueEntry, WriteQueue};
use crate::reconcile::{ListResource, Reconciler};
use crate::state::SyncState;
use crate::store::{KeyValueStore, LibSqlStore};
use crate::util::join_url;
use crate::Result;

/// What happened to one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The server accepted it directly.
    Sent,
    /// Stored offline; `pending` is the domain's queue length afterwards.
    Queued { pending: usize },
    /// The server answered and refused it. Nothing was queued.
    Rejected { message: String },
}

pub struct SyncOrchestrator<S, T, P, D = FormDomain> {
    domains: Arc<[D]>,
    base_url: Arc<str>,
    refresh_interval: Duration,
    probe: Option<(String, Duration)>,
    queue: WriteQueue<S>,
    dispatcher: Dispatcher<S, T, P>,
    cache: ReadThroughCache<S, T>,
    reconciler: Reconciler<S, T>,
    transport: Arc<T>,
    session: P,
    connectivity: ConnectivityMonitor,
    notices: NoticeSender,
    counts: Arc<watch::Sender<HashMap<D, usize>>>,
}

impl<S, T, P: Clone, D> Clone for SyncOrchestrator<S, T, P, D> {
    fn clone(&self) -> Self {
        Self {
            domains: Arc::clone(&self.domains),
            base_url: Arc::clone(&self.base_url),
            refresh_interval: self.refresh_interval,
            probe: self.probe.clone(),
            queue: self.queue.clone(),
            dispatcher: self.dispatcher.clone(),
            cache: self.cache.clone(),
            reconciler: self.reconciler.clone(),
            transport: Arc::clone(&self.transport),
            session: self.session.clone(),
            connectivity: self.connectivity.clone(),
            notices: self.notices.clone(),
            counts: Arc::clone(&self.counts),
        }
    }
}

impl<P: SessionPersistence> SyncOrchestrator<LibSqlStore, ReqwestTransport, P, FormDomain> {
    /// Production wiring: libSQL file store, reqwest transport and every
    /// built-in form domain.
    pub async fn open(config: &SyncConfig, db_path: impl Into<PathBuf>, session: P) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(LibSqlStore::open_path(db_path).await?);
        let transport = Arc::new(ReqwestTransport::new(config.http_timeout)?);
        Ok(Self::new(config, store, transport, session, FormDomain::ALL))
    }
}

impl<S, T, P, D> SyncOrchestrator<S, T, P, D>
where
    S: KeyValueStore,
    T: HttpTransport,
    P: SessionPersistence,
    D: SyncDomain,
{
    pub fn new(
        config: &SyncConfig,
        store: Arc<S>,
        transport: Arc<T>,
        session: P,
        domains: impl IntoIterator<Item = D>,
    ) -> Self {
        let notices = NoticeSender::new();
        let queue = WriteQueue::with_policy(Arc::clone(&store), config.queue_policy);
        let dispatcher = Dispatcher::new(
            queue.clone(),
            Arc::clone(&transport),
            session.clone(),
            notices.clone(),
        );
        let cache = ReadThroughCache::new(Arc::clone(&store), Arc::clone(&transport), notices.clone());
        let reconciler = Reconciler::new(
            store,
            Arc::clone(&transport),
            notices.clone(),
            config.base_url.clone(),
            Vec::new(),
        );
        let domains: Arc<[D]> = domains.into_iter().collect();
        let initial: HashMap<D, usize> = domains.iter().map(|domain| (*domain, 0)).collect();
        let (counts, _) = watch::channel(initial);

        Self {
            domains,
            base_url: Arc::from(config.base_url.as_str()),
            refresh_interval: config.refresh_interval,
            probe: config
                .probe_url
                .clone()
                .map(|url| (url, config.probe_interval)),
            queue,
            dispatcher,
            cache,
            reconciler,
            transport,
            session,
            connectivity: ConnectivityMonitor::default(),
            notices,
            counts: Arc::new(counts),
        }
    }

    /// Register the list resources guarded by change summaries.
    #[must_use]
    pub fn with_resources(mut self, resources: Vec<ListResource>) -> Self {
        self.reconciler = Reconciler::new(
            self.queue.store(),
            Arc::clone(&self.transport),
            self.notices.clone(),
            self.base_url.to_string(),
            resources,
        );
        self
    }

    /// Share a connectivity signal fed by the platform.
    #[must_use]
    pub fn with_connectivity(mut self, connectivity: ConnectivityMonitor) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn domains(&self) -> &[D] {
        &self.domains
    }

    pub const fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub const fn notices(&self) -> &NoticeSender {
        &self.notices
    }

    pub const fn cache(&self) -> &ReadThroughCache<S, T> {
        &self.cache
    }

    pub const fn reconciler(&self) -> &Reconciler<S, T> {
        &self.reconciler
    }

    /// Load watermarks and pending counts from storage.
    pub async fn init(&self) {
        let watermarks = self.reconciler.init().await;
        self.refresh_counts().await;
        tracing::info!(
            "Sync engine ready: {} domains, {} pending, {} watermarks",
            self.domains.len(),
            self.total_pending(),
            watermarks
        );
    }

    /// Validate and send one submission, falling back to the offline queue
    /// when the device is offline or the server gave no usable answer.
    pub async fn submit(&self, domain: D, payload: Value) -> Result<SubmitOutcome> {
        let entry = QueueEntry::new(domain.validate(&payload)?);

        if !self.connectivity.is_online() {
            return self.enqueue(domain, entry).await;
        }

        let url = join_url(&self.base_url, domain.endpoint());
        let token = match current_bearer_token(&self.session) {
            Ok(token) => token,
            Err(error) => {
                // The dispatcher reads the session again on its next run.
                tracing::warn!("Could not read session for {}; queueing: {}", domain.label(), error);
                return self.enqueue(domain, entry).await;
            }
        };
        match self
            .transport
            .post_json(&url, token.as_deref(), &entry.body())
            .await
        {
            Ok(response) => match ServerAck::from_response(&response) {
                ServerAck::Accepted => {
                    tracing::info!("Submitted {} entry {} directly", domain.label(), entry.id_local);
                    Ok(SubmitOutcome::Sent)
                }
                ServerAck::Rejected { message } if response.is_success() => {
                    tracing::warn!("Server rejected {} submission: {}", domain.label(), message);
                    Ok(SubmitOutcome::Rejected { message })
                }
                ServerAck::Rejected { message } => {
                    tracing::warn!(
                        "{} submission got HTTP {}; queueing: {}",
                        domain.label(),
                        response.status,
                        message
                    );
                    self.enqueue(domain, entry).await
                }
            },
            Err(error) => {
                tracing::warn!("{} submission failed; queueing: {}", domain.label(), error);
                self.enqueue(domain, entry).await
            }
        }
    }

    async fn enqueue(&self, domain: D, entry: QueueEntry) -> Result<SubmitOutcome> {
        let queue_key = domain.queue_key();
        let enqueued = self.queue.push(queue_key, entry).await?;
        self.set_count(domain, enqueued.pending);
        self.notices.publish(SyncNotice::Queued {
            domain: queue_key.to_string(),
            pending: enqueued.pending,
        });
        if enqueued.dead_lettered > 0 {
            self.notices.publish(SyncNotice::DeadLettered {
                domain: queue_key.to_string(),
                count: enqueued.dead_lettered,
            });
        }
        Ok(SubmitOutcome::Queued {
            pending: enqueued.pending,
        })
    }

    /// Last known pending count of a domain.
    pub fn pending_count(&self, domain: D) -> usize {
        self.counts.borrow().get(&domain).copied().unwrap_or_default()
    }

    pub fn pending_counts(&self) -> HashMap<D, usize> {
        self.counts.borrow().clone()
    }

    pub fn total_pending(&self) -> usize {
        self.counts.borrow().values().sum()
    }

    /// Count badges; changes whenever a queue length changes.
    pub fn subscribe_counts(&self) -> watch::Receiver<HashMap<D, usize>> {
        self.counts.subscribe()
    }

    pub fn sync_state(&self, domain: D) -> SyncState {
        SyncState::derive(
            self.connectivity.is_online(),
            self.dispatcher.is_dispatching(domain.queue_key()),
            self.pending_count(domain),
        )
    }

    /// Re-read one domain's queue length from storage.
    pub async fn refresh_count(&self, domain: D) -> usize {
        let pending = self.queue.count(domain.queue_key()).await;
        self.set_count(domain, pending);
        pending
    }

    pub async fn refresh_counts(&self) {
        for domain in self.domains.iter().copied() {
            self.refresh_count(domain).await;
        }
    }

    fn set_count(&self, domain: D, pending: usize) {
        self.counts.send_if_modified(|counts| {
            counts.insert(domain, pending) != Some(pending)
        });
    }

    /// Dispatch one domain's queue now.
    pub async fn push_now(&self, domain: D) -> Result<DispatchReport> {
        let report = self
            .dispatcher
            .run(domain.queue_key(), domain.endpoint(), &self.base_url)
            .await;
        self.refresh_count(domain).await;
        report
    }

    /// Dispatch every domain in registration order. A domain whose run
    /// fails is logged and skipped.
    pub async fn push_all(&self) -> Vec<(D, DispatchReport)> {
        let mut reports = Vec::with_capacity(self.domains.len());
        for domain in self.domains.iter().copied() {
            match self.push_now(domain).await {
                Ok(report) => reports.push((domain, report)),
                Err(error) => {
                    tracing::warn!("Dispatch for {} failed: {}", domain.label(), error);
                }
            }
        }
        reports
    }

    /// Operator discard of every pending entry of a domain.
    pub async fn clear(&self, domain: D) -> Result<()> {
        self.queue.clear(domain.queue_key()).await?;
        self.set_count(domain, 0);
        Ok(())
    }

    pub async fn dead_letters(&self, domain: D) -> Vec<QueueEntry> {
        self.queue.dead_letters(domain.queue_key()).await
    }

    /// Move a domain's dead-lettered entries back into its live queue.
    pub async fn requeue_dead_letters(&self, domain: D) -> Result<usize> {
        let moved = self.queue.requeue_dead_letters(domain.queue_key()).await?;
        self.refresh_count(domain).await;
        Ok(moved)
    }

    pub async fn clear_dead_letters(&self, domain: D) -> Result<()> {
        self.queue.clear_dead_letters(domain.queue_key()).await
    }

    /// Read-through fetch of `path` relative to the base URL.
    pub async fn fetch(&self, cache_key: &str, path: &str, headers: &[(&str, &str)]) -> Result<Value> {
        self.cache
            .fetch(cache_key, &join_url(&self.base_url, path), headers)
            .await
    }

    /// Load a registered list resource, downloading only when it changed.
    pub async fn load_list(&self, name: &str, force: bool, headers: &[(&str, &str)]) -> Result<Value> {
        self.reconciler.load_list(name, force, headers).await
    }

    /// Spawn the background tasks: auto-push on regaining connectivity, the
    /// periodic count refresh and, when configured, the reachability probe.
    pub fn start(&self) -> OrchestratorHandle {
        let mut tasks = vec![self.spawn_auto_push(), self.spawn_refresh()];
        if let Some((url, interval)) = self.probe.clone() {
            tasks.push(
                self.connectivity
                    .spawn_probe(Arc::clone(&self.transport), url, interval),
            );
        }
        OrchestratorHandle { tasks }
    }

    fn spawn_auto_push(&self) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let connectivity = self.connectivity.clone();
        let mut online = connectivity.subscribe();
        // Read before spawning so a reconnect racing the task start still counts.
        let mut pushed_for = connectivity.reconnects();
        tokio::spawn(async move {
            while online.changed().await.is_ok() {
                // Re-check after each push: a flap during the push shows up
                // only in the counter.
                while connectivity.reconnects() != pushed_for {
                    pushed_for = connectivity.reconnects();
                    tracing::info!("Back online; pushing offline queues");
                    orchestrator.push_all().await;
                }
            }
        })
    }

    fn spawn_refresh(&self) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let period = self.refresh_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                orchestrator.refresh_counts().await;
            }
        })
    }
}

/// Background tasks of a started orchestrator; aborted on shutdown or drop.
#[derive(Debug)]
pub struct OrchestratorHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl OrchestratorHandle {
    pub fn shutdown(mut self) {
        self.abort_all();
    }

    fn abort_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for OrchestratorHandle {
    fn drop(&mut self) {
        self.abort_all();
    }
}
