//! Drains a domain queue against the server.
//!
//! A run works on the snapshot read at its start. Accepted entries are
//! dropped; everything else stays queued in its original order. Entries
//! enqueued while a run is in flight are left for the next run.

use std::collections::HashSet;
use std::sync::Arc;

use crate::auth::{current_bearer_token, SessionPersistence};
use crate::http::{HttpTransport, ServerAck};
use crate::keyed_lock::KeyedLocks;
use crate::notice::{NoticeSender, SyncNotice};
use crate::queue::{QueueEntry, WriteQueue};
use crate::store::KeyValueStore;
use crate::util::join_url;
use crate::Result;

/// Outcome of one dispatch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Entries the server acknowledged; they are gone from the queue.
    pub delivered: usize,
    /// Entries the server answered but refused.
    pub rejected: usize,
    /// Entries that got no response.
    pub failed: usize,
    /// Rejected entries moved to the dead-letter queue.
    pub dead_lettered: usize,
    /// Another run for the same queue was already in flight.
    pub skipped: bool,
}

impl DispatchReport {
    const fn skipped() -> Self {
        Self {
            delivered: 0,
            rejected: 0,
            failed: 0,
            dead_lettered: 0,
            skipped: true,
        }
    }
}

pub struct Dispatcher<S, T, P> {
    queue: WriteQueue<S>,
    transport: Arc<T>,
    session: P,
    notices: NoticeSender,
    in_flight: KeyedLocks,
}

impl<S, T, P: Clone> Clone for Dispatcher<S, T, P> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            transport: Arc::clone(&self.transport),
            session: self.session.clone(),
            notices: self.notices.clone(),
            in_flight: self.in_flight.clone(),
        }
    }
}

impl<S, T, P> Dispatcher<S, T, P>
where
    S: KeyValueStore,
    T: HttpTransport,
    P: SessionPersistence,
{
    pub fn new(queue: WriteQueue<S>, transport: Arc<T>, session: P, notices: NoticeSender) -> Self {
        Self {
            queue,
            transport,
            session,
            notices,
            in_flight: KeyedLocks::new(),
        }
    }

    /// Whether a run for `queue_key` is currently in flight.
    pub fn is_dispatching(&self, queue_key: &str) -> bool {
        self.in_flight.is_locked(queue_key)
    }

    /// Push every entry of `queue_key` to `base_url + endpoint_path` and
    /// return how many the server accepted. Returns 0 without touching the
    /// queue when a run for the same key is already in flight.
    pub async fn dispatch(&self, queue_key: &str, endpoint_path: &str, base_url: &str) -> Result<usize> {
        Ok(self.run(queue_key, endpoint_path, base_url).await?.delivered)
    }

    /// Same as [`Self::dispatch`] with the full per-entry breakdown.
    pub async fn run(
        &self,
        queue_key: &str,
        endpoint_path: &str,
        base_url: &str,
    ) -> Result<DispatchReport> {
        // Held until return; dropping it is what moves the queue back to idle.
        let Some(_in_flight) = self.in_flight.try_lock(queue_key) else {
            tracing::debug!("Dispatch for '{}' already in flight; skipping", queue_key);
            return Ok(DispatchReport::skipped());
        };

        let snapshot = self.queue.entries(queue_key).await;
        if snapshot.is_empty() {
            return Ok(DispatchReport::default());
        }

        let url = join_url(base_url, endpoint_path);
        let snapshot_ids: HashSet<String> =
            snapshot.iter().map(|entry| entry.id_local.clone()).collect();
        let max_rejections = self.queue.policy().max_rejections;

        let mut report = DispatchReport::default();
        let mut kept: Vec<QueueEntry> = Vec::new();
        let mut dead: Vec<QueueEntry> = Vec::new();

        tracing::info!("Dispatching {} entries from '{}' to {}", snapshot.len(), queue_key, url);

        for mut entry in snapshot {
            let token = current_bearer_token(&self.session).unwrap_or_else(|error| {
                tracing::warn!("Could not read session for '{}': {}", queue_key, error);
                None
            });

            match self
                .transport
                .post_json(&url, token.as_deref(), &entry.body())
                .await
            {
                Ok(response) => match ServerAck::from_response(&response) {
                    ServerAck::Accepted => {
                        tracing::debug!("Entry {} delivered", entry.id_local);
                        report.delivered += 1;
                    }
                    ServerAck::Rejected { message } => {
                        tracing::warn!(
                            "Server rejected entry {} from '{}': {}",
                            entry.id_local,
                            queue_key,
                            message
                        );
                        report.rejected += 1;
                        entry.rejections = entry.rejections.saturating_add(1);
                        self.notices.publish(SyncNotice::Rejected {
                            domain: queue_key.to_string(),
                            id_local: entry.id_local.clone(),
                            message,
                        });
                        if max_rejections.is_some_and(|limit| entry.rejections >= limit) {
                            dead.push(entry);
                        } else {
                            kept.push(entry);
                        }
                    }
                },
                Err(error) => {
                    tracing::warn!(
                        "Connection failed for entry {} from '{}': {}",
                        entry.id_local,
                        queue_key,
                        error
                    );
                    report.failed += 1;
                    self.notices.publish(SyncNotice::ConnectionFailed {
                        domain: queue_key.to_string(),
                        id_local: entry.id_local.clone(),
                        error: error.to_string(),
                    });
                    kept.push(entry);
                }
            }
        }

        report.dead_lettered = dead.len();
        if !dead.is_empty() {
            // Dead-letter before trimming the live queue: a crash in between
            // duplicates, never loses.
            self.queue.dead_letter(queue_key, dead).await?;
            self.notices.publish(SyncNotice::DeadLettered {
                domain: queue_key.to_string(),
                count: report.dead_lettered,
            });
        }

        self.queue
            .update(queue_key, move |current| {
                let present: HashSet<String> =
                    current.iter().map(|entry| entry.id_local.clone()).collect();
                let arrived: Vec<QueueEntry> = current
                    .drain(..)
                    .filter(|entry| !snapshot_ids.contains(&entry.id_local))
                    .collect();
                // Entries cleared by the operator mid-run stay cleared.
                kept.retain(|entry| present.contains(&entry.id_local));
                kept.extend(arrived);
                *current = kept;
            })
            .await?;

        if report.delivered > 0 {
            self.notices.publish(SyncNotice::Delivered {
                domain: queue_key.to_string(),
                count: report.delivered,
            });
        }
        tracing::info!(
            "Dispatch for '{}' finished: {} delivered, {} rejected, {} failed",
            queue_key,
            report.delivered,
            report.rejected,
            report.failed
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthSession, AuthUser, MemorySessionStore};
    use crate::queue::QueuePolicy;
    use crate::store::MemoryStore;
    use crate::testing::{ok, shared, unreachable_error, MockTransport};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map, Value};
    use std::time::Duration;

    const BASE: &str = "https://api.example.com";

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn session(token: &str) -> AuthSession {
        AuthSession {
            access_token: token.to_string(),
            expires_at: None,
            user: AuthUser {
                id: "op".to_string(),
                jde_no: None,
            },
        }
    }

    fn dispatcher(
        transport: Arc<MockTransport>,
        policy: QueuePolicy,
    ) -> (WriteQueue<MemoryStore>, Dispatcher<MemoryStore, MockTransport, MemorySessionStore>) {
        let queue = WriteQueue::with_policy(Arc::new(MemoryStore::new()), policy);
        let dispatcher = Dispatcher::new(
            queue.clone(),
            transport,
            MemorySessionStore::with_session(session("token-1")),
            NoticeSender::new(),
        );
        (queue, dispatcher)
    }

    fn names(queue_entries: &[QueueEntry]) -> Vec<Value> {
        queue_entries.iter().map(|entry| entry.payload["name"].clone()).collect()
    }

    #[tokio::test]
    async fn daily_queue_scenario() {
        let transport = shared(MockTransport::accepting());
        let (queue, dispatcher) = dispatcher(Arc::clone(&transport), QueuePolicy::default());

        queue
            .enqueue("daily_queue_offline", payload(json!({"jde_no": "123", "total_hour": "2"})))
            .await
            .unwrap();
        assert_eq!(queue.count("daily_queue_offline").await, 1);

        let delivered = dispatcher
            .dispatch("daily_queue_offline", "/daily-activity/store", BASE)
            .await
            .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(queue.count("daily_queue_offline").await, 0);

        let posts = transport.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].url, "https://api.example.com/daily-activity/store");
        assert_eq!(posts[0].bearer_token.as_deref(), Some("token-1"));
        assert_eq!(posts[0].body, json!({"jde_no": "123", "total_hour": "2"}));
    }

    #[tokio::test]
    async fn second_run_on_drained_queue_delivers_nothing() {
        let transport = shared(MockTransport::accepting());
        let (queue, dispatcher) = dispatcher(Arc::clone(&transport), QueuePolicy::default());
        for name in ["a", "b"] {
            queue.enqueue("q", payload(json!({ "name": name }))).await.unwrap();
        }

        assert_eq!(dispatcher.dispatch("q", "/x", BASE).await.unwrap(), 2);
        assert_eq!(dispatcher.dispatch("q", "/x", BASE).await.unwrap(), 0);
        assert_eq!(transport.posts().len(), 2);
    }

    #[tokio::test]
    async fn partial_failure_keeps_rejected_entry_in_order() {
        let transport = shared(MockTransport::with_post(|_, body| {
            if body["name"] == "B" {
                Ok(ok(json!({"success": false, "message": "duplicate"})))
            } else {
                Ok(ok(json!({"status": true})))
            }
        }));
        let (queue, dispatcher) = dispatcher(transport, QueuePolicy::default());
        let mut notices = dispatcher.notices.subscribe();
        for name in ["A", "B", "C"] {
            queue.enqueue("q", payload(json!({ "name": name }))).await.unwrap();
        }

        let report = dispatcher.run("q", "/x", BASE).await.unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(report.rejected, 1);
        let remaining = queue.entries("q").await;
        assert_eq!(names(&remaining), vec![json!("B")]);
        assert_eq!(remaining[0].rejections, 1);

        match notices.recv().await.unwrap() {
            SyncNotice::Rejected { message, .. } => assert_eq!(message, "duplicate"),
            other => panic!("unexpected notice {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_failures_keep_everything_and_raise_connection_notice() {
        let transport = shared(MockTransport::offline());
        let (queue, dispatcher) = dispatcher(transport, QueuePolicy::default());
        let mut notices = dispatcher.notices.subscribe();
        for name in ["A", "B"] {
            queue.enqueue("q", payload(json!({ "name": name }))).await.unwrap();
        }

        let report = dispatcher.run("q", "/x", BASE).await.unwrap();

        assert_eq!(report.failed, 2);
        assert_eq!(report.delivered, 0);
        assert_eq!(names(&queue.entries("q").await), vec![json!("A"), json!("B")]);
        assert!(matches!(
            notices.recv().await.unwrap(),
            SyncNotice::ConnectionFailed { .. }
        ));
        assert!(!dispatcher.is_dispatching("q"));
    }

    #[tokio::test]
    async fn error_status_is_kept_as_rejection() {
        let transport = shared(MockTransport::with_post(|_, _| {
            Ok(crate::http::HttpResponse {
                status: 500,
                body: Value::String("Internal Server Error".to_string()),
            })
        }));
        let (queue, dispatcher) = dispatcher(transport, QueuePolicy::default());
        queue.enqueue("q", payload(json!({"name": "A"}))).await.unwrap();

        let report = dispatcher.run("q", "/x", BASE).await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(queue.count("q").await, 1);
    }

    #[tokio::test]
    async fn concurrent_runs_make_a_single_pass() {
        let transport = shared(MockTransport::accepting().with_post_delay(Duration::from_millis(100)));
        let (queue, dispatcher) = dispatcher(Arc::clone(&transport), QueuePolicy::default());
        queue.enqueue("q", payload(json!({"name": "A"}))).await.unwrap();

        let first = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch("q", "/x", BASE).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(dispatcher.is_dispatching("q"));
        let second = dispatcher.run("q", "/x", BASE).await.unwrap();
        assert!(second.skipped);
        assert_eq!(queue.count("q").await, 1);

        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert_eq!(transport.posts().len(), 1);
        assert!(!dispatcher.is_dispatching("q"));
    }

    #[tokio::test]
    async fn entries_enqueued_mid_run_wait_for_next_run() {
        let transport = shared(MockTransport::accepting().with_post_delay(Duration::from_millis(100)));
        let (queue, dispatcher) = dispatcher(Arc::clone(&transport), QueuePolicy::default());
        queue.enqueue("q", payload(json!({"name": "A"}))).await.unwrap();

        let run = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch("q", "/x", BASE).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue("q", payload(json!({"name": "late"}))).await.unwrap();

        assert_eq!(run.await.unwrap().unwrap(), 1);
        assert_eq!(names(&queue.entries("q").await), vec![json!("late")]);
        assert_eq!(transport.posts().len(), 1);

        assert_eq!(dispatcher.dispatch("q", "/x", BASE).await.unwrap(), 1);
        assert_eq!(queue.count("q").await, 0);
    }

    #[tokio::test]
    async fn token_is_read_per_request() {
        let sessions = MemorySessionStore::with_session(session("old"));
        let relogin = sessions.clone();
        let transport = shared(MockTransport::with_post(move |_, body| {
            if body["name"] == "A" {
                relogin.save(&session("new")).unwrap();
            }
            Ok(ok(json!({"success": true})))
        }));
        let queue = WriteQueue::new(Arc::new(MemoryStore::new()));
        let dispatcher = Dispatcher::new(
            queue.clone(),
            Arc::clone(&transport),
            sessions,
            NoticeSender::new(),
        );
        for name in ["A", "B"] {
            queue.enqueue("q", payload(json!({ "name": name }))).await.unwrap();
        }

        dispatcher.dispatch("q", "/x", BASE).await.unwrap();

        let tokens: Vec<Option<String>> =
            transport.posts().into_iter().map(|post| post.bearer_token).collect();
        assert_eq!(tokens, vec![Some("old".to_string()), Some("new".to_string())]);
    }

    #[tokio::test]
    async fn repeated_rejections_move_entry_to_dead_letter() {
        let transport = shared(MockTransport::with_post(|_, _| {
            Ok(ok(json!({"success": false, "message": "invalid unit"})))
        }));
        let (queue, dispatcher) = dispatcher(
            transport,
            QueuePolicy {
                max_len: None,
                max_rejections: Some(2),
            },
        );
        queue.enqueue("q", payload(json!({"name": "bad"}))).await.unwrap();

        let first = dispatcher.run("q", "/x", BASE).await.unwrap();
        assert_eq!(first.dead_lettered, 0);
        assert_eq!(queue.count("q").await, 1);

        let second = dispatcher.run("q", "/x", BASE).await.unwrap();
        assert_eq!(second.dead_lettered, 1);
        assert_eq!(queue.count("q").await, 0);
        assert_eq!(names(&queue.dead_letters("q").await), vec![json!("bad")]);
    }

    #[tokio::test]
    async fn empty_queue_makes_no_requests() {
        let transport = shared(MockTransport::with_post(|_, _| Err(unreachable_error())));
        let (_, dispatcher) = dispatcher(Arc::clone(&transport), QueuePolicy::default());

        let report = dispatcher.run("q", "/x", BASE).await.unwrap();
        assert_eq!(report, DispatchReport::default());
        assert!(transport.posts().is_empty());
    }

    #[tokio::test]
    async fn entry_stored_without_id_is_delivered_once() {
        let transport = shared(MockTransport::accepting());
        let (queue, dispatcher) = dispatcher(Arc::clone(&transport), QueuePolicy::default());
        queue.store().set("q", r#"[{"name":"legacy"}]"#).await.unwrap();

        assert_eq!(dispatcher.dispatch("q", "/x", BASE).await.unwrap(), 1);
        assert_eq!(queue.count("q").await, 0);
        assert_eq!(dispatcher.dispatch("q", "/x", BASE).await.unwrap(), 0);
        assert_eq!(transport.posts().len(), 1);
        assert_eq!(transport.posts()[0].body, json!({"name": "legacy"}));
    }
}
