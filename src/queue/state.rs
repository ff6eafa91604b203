//! Queue bookkeeping, owned exclusively by the main worker.
//!
//! Clients and jobs live in arenas keyed by connection id and job id; records
//! reference each other through those ids only, so disconnect reconciliation
//! is a linear walk over the maps. State transitions return the messages to
//! deliver instead of sending them, which keeps this module free of I/O.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::message::{Message, MsgKind, Status};

pub type ClientId = u64;

/// An active connection. Every connection is treated as a pool, possibly
/// with capacity 0; the same connection may submit and execute jobs.
pub(crate) struct Client {
    pub outbound: mpsc::Sender<Message>,

    /// Number of parallel jobs this pool can handle.
    pub capacity: usize,

    /// Jobs currently running in this pool.
    pub running: HashSet<String>,

    /// Jobs submitted by this client and not yet done.
    pub submitted: HashSet<String>,
}

/// A job from admission to completion.
///
/// Invariant: the job is in the waiting list exactly when `pool` is `None`.
pub(crate) struct JobEntry {
    /// The launch message, replayed on dispatch.
    pub launch: Message,

    /// The submitting client, cleared once it disconnects.
    pub origin: Option<ClientId>,

    /// The pool executing this job, `None` while waiting.
    pub pool: Option<ClientId>,
}

/// Messages a state transition decided to deliver.
pub(crate) type Sends = Vec<(ClientId, Message)>;

pub(crate) struct State {
    /// Maximum number of jobs waiting to be dispatched.
    pub capacity: usize,

    pub clients: BTreeMap<ClientId, Client>,
    pub jobs: HashMap<String, JobEntry>,
    pub waiting: VecDeque<String>,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of the queue state, reported on a `status` request.
#[derive(Debug, Serialize)]
pub struct QueueStatus {
    pub capacity: usize,
    pub available: usize,
    pub clients: Vec<ClientStatus>,
    pub waiting: Vec<String>,
    pub creation_date: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ClientStatus {
    pub id: ClientId,
    pub capacity: usize,
    pub running: Vec<String>,
    pub submitted: Vec<String>,
}

impl State {
    pub fn new(capacity: usize) -> State {
        State {
            capacity,
            clients: BTreeMap::new(),
            jobs: HashMap::new(),
            waiting: VecDeque::new(),
            created_at: Utc::now(),
        }
    }

    pub fn connect(&mut self, id: ClientId, outbound: mpsc::Sender<Message>) {
        tracing::info!(client_id = id, "Client connected");
        self.clients.insert(
            id,
            Client {
                outbound,
                capacity: 0,
                running: HashSet::new(),
                submitted: HashSet::new(),
            },
        );
    }

    /// Dispatch one inbound message to its handler.
    pub fn handle(&mut self, client_id: ClientId, msg: Message) -> Sends {
        match msg.message {
            MsgKind::RegisterPool => {
                self.register_pool(client_id, msg.capacity);
                Vec::new()
            }
            MsgKind::Launch => self.launch(client_id, msg),
            MsgKind::Done => self.done(client_id, msg),
            MsgKind::Abort => self.abort(client_id, msg),
            MsgKind::Status => self.status(client_id, msg),
            // Everything else was filtered out by the receiver.
            _ => Vec::new(),
        }
    }

    fn register_pool(&mut self, client_id: ClientId, capacity: usize) {
        if capacity < 1 {
            tracing::warn!(client_id, capacity, "Invalid pool capacity");
            return;
        }
        tracing::info!(client_id, capacity, "Pool registered");
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.capacity = capacity;
        }
    }

    fn launch(&mut self, client_id: ClientId, msg: Message) -> Sends {
        let id = msg.id.clone();
        if self.jobs.contains_key(&id) {
            tracing::warn!(job_id = %id, "Job already launched, rejecting");
            return vec![(
                client_id,
                Message::done(id, Status::Fatal, "Job already launched"),
            )];
        }
        if self.waiting.len() >= self.capacity {
            tracing::warn!(job_id = %id, "Queue full, rejecting");
            return vec![(client_id, Message::done(id, Status::Error, "Queue full"))];
        }
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.submitted.insert(id.clone());
        }
        self.jobs.insert(
            id.clone(),
            JobEntry {
                launch: msg,
                origin: Some(client_id),
                pool: None,
            },
        );
        tracing::info!(job_id = %id, "Job queued");
        self.waiting.push_back(id);
        Vec::new()
    }

    fn done(&mut self, client_id: ClientId, msg: Message) -> Sends {
        match self.jobs.get(&msg.id) {
            None => {
                tracing::warn!(job_id = %msg.id, "Ignoring result for unknown job");
                return Vec::new();
            }
            Some(job) if job.pool != Some(client_id) => {
                tracing::warn!(job_id = %msg.id, client_id, "Ignoring result from wrong source");
                return Vec::new();
            }
            Some(_) => {}
        }
        tracing::info!(job_id = %msg.id, "Job done");
        let Some(job) = self.jobs.remove(&msg.id) else {
            return Vec::new();
        };
        if let Some(pool) = self.clients.get_mut(&client_id) {
            pool.running.remove(&msg.id);
        }
        // The origin is gone if the submitter disconnected before the result
        // arrived; the result is then dropped silently.
        if let Some(origin_id) = job.origin {
            if let Some(origin) = self.clients.get_mut(&origin_id) {
                origin.submitted.remove(&msg.id);
                return vec![(origin_id, msg)];
            }
        }
        Vec::new()
    }

    /// An explicit abort from the submitting client. A waiting job is
    /// discarded and answered directly; a running one is aborted in its pool
    /// and the pool's `done` flows back as usual.
    fn abort(&mut self, client_id: ClientId, msg: Message) -> Sends {
        match self.jobs.get(&msg.id) {
            None => {
                tracing::warn!(job_id = %msg.id, "Ignoring abort for unknown job");
                Vec::new()
            }
            Some(job) if job.origin != Some(client_id) => {
                tracing::warn!(job_id = %msg.id, client_id, "Ignoring abort from wrong source");
                Vec::new()
            }
            Some(job) => {
                if let Some(pool_id) = job.pool {
                    tracing::info!(job_id = %msg.id, "Aborting running job");
                    vec![(pool_id, Message::abort(msg.id))]
                } else {
                    tracing::info!(job_id = %msg.id, "Aborting waiting job");
                    self.waiting.retain(|id| *id != msg.id);
                    self.jobs.remove(&msg.id);
                    if let Some(client) = self.clients.get_mut(&client_id) {
                        client.submitted.remove(&msg.id);
                    }
                    vec![(client_id, Message::done(msg.id, Status::Abort, ""))]
                }
            }
        }
    }

    /// Reconcile after a connection closed: jobs running in that pool are
    /// retried elsewhere (or forgotten if their submitter is gone too), and
    /// jobs it submitted are discarded or aborted in their pools.
    pub fn closed(&mut self, client_id: ClientId) -> Sends {
        let Some(client) = self.clients.remove(&client_id) else {
            return Vec::new();
        };
        tracing::info!(client_id, "Client disconnected");
        let mut sends = Vec::new();
        for job_id in client.running {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.origin.is_none() {
                // Submitter already gone, nobody wants the result.
                self.jobs.remove(&job_id);
            } else {
                job.pool = None;
                // Front of the line so it is retried promptly.
                self.waiting.push_front(job_id);
            }
        }
        for job_id in client.submitted {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            if let Some(pool_id) = job.pool {
                // Keep the job keyed so the pool's eventual result can be
                // correlated and cleaned up.
                job.origin = None;
                sends.push((pool_id, Message::abort(job_id)));
            } else {
                self.waiting.retain(|id| *id != job_id);
                self.jobs.remove(&job_id);
            }
        }
        sends
    }

    /// Assign waiting jobs to free pools, iterating clients in ascending
    /// connection id so dispatch order is stable.
    pub fn schedule(&mut self) -> Sends {
        let mut sends = Vec::new();
        if self.waiting.is_empty() {
            return sends;
        }
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for client_id in ids {
            while let Some(client) = self.clients.get_mut(&client_id) {
                if client.running.len() >= client.capacity {
                    break;
                }
                let Some(job_id) = self.waiting.pop_front() else {
                    return sends;
                };
                client.running.insert(job_id.clone());
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.pool = Some(client_id);
                    tracing::info!(job_id = %job_id, client_id, "Job dispatched");
                    sends.push((client_id, job.launch.clone()));
                }
            }
        }
        sends
    }

    fn status(&mut self, client_id: ClientId, msg: Message) -> Sends {
        let snapshot = self.snapshot();
        let reply = match serde_json::to_string(&snapshot) {
            Ok(body) => Message::done(msg.id, Status::Success, body),
            Err(e) => Message::done(msg.id, Status::Error, e.to_string()),
        };
        vec![(client_id, reply)]
    }

    pub fn snapshot(&self) -> QueueStatus {
        let clients = self
            .clients
            .iter()
            .map(|(id, client)| {
                let mut running: Vec<String> = client.running.iter().cloned().collect();
                let mut submitted: Vec<String> = client.submitted.iter().cloned().collect();
                running.sort();
                submitted.sort();
                ClientStatus {
                    id: *id,
                    capacity: client.capacity,
                    running,
                    submitted,
                }
            })
            .collect();
        QueueStatus {
            capacity: self.capacity,
            available: self.capacity.saturating_sub(self.waiting.len()),
            clients,
            waiting: self.waiting.iter().cloned().collect(),
            creation_date: self.created_at,
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        for (id, job) in &self.jobs {
            let waiting = self.waiting.contains(id);
            assert!(
                waiting != job.pool.is_some(),
                "job {} must be waiting or running, not both or neither",
                id
            );
            if let Some(origin) = job.origin {
                let client = self.clients.get(&origin).expect("origin client exists");
                assert!(client.submitted.contains(id));
            }
            if let Some(pool) = job.pool {
                let client = self.clients.get(&pool).expect("pool client exists");
                assert!(client.running.contains(id));
            }
        }
        assert!(self.waiting.len() <= self.capacity);
        for (id, client) in &self.clients {
            assert!(
                client.capacity == 0 || client.running.len() <= client.capacity,
                "client {} over capacity",
                id
            );
            for job_id in client.running.iter().chain(client.submitted.iter()) {
                assert!(self.jobs.contains_key(job_id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Task;

    // State transitions return their messages instead of sending them, so a
    // closed channel works as the outbound sink.
    fn sink() -> mpsc::Sender<Message> {
        mpsc::channel(8).0
    }

    fn launch(id: &str) -> Message {
        Message::launch(id, Task::default(), "")
    }

    fn setup(capacity: usize) -> State {
        let mut state = State::new(capacity);
        state.connect(0, sink());
        state.connect(1, sink());
        state
    }

    #[test]
    fn dispatches_to_registered_pool() {
        let mut state = setup(500);
        state.handle(1, Message::register_pool(1));
        assert!(state.handle(0, launch("0:t")).is_empty());
        let sends = state.schedule();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, 1);
        assert_eq!(sends[0].1.id, "0:t");
        state.check_invariants();

        let done = Message::done("0:t", Status::Success, "hi");
        let sends = state.handle(1, done.clone());
        assert_eq!(sends, vec![(0, done)]);
        assert!(state.jobs.is_empty());
        state.check_invariants();
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut state = setup(500);
        state.handle(0, launch("0:t"));
        let sends = state.handle(0, launch("0:t"));
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].1.status, Some(Status::Fatal));
        assert_eq!(sends[0].1.output, "Job already launched");
        state.check_invariants();
    }

    #[test]
    fn same_raw_id_from_two_submitters_does_not_collide() {
        let mut state = setup(500);
        assert!(state.handle(0, launch("0:t")).is_empty());
        assert!(state.handle(1, launch("1:t")).is_empty());
        assert_eq!(state.waiting.len(), 2);
        state.check_invariants();
    }

    #[test]
    fn rejects_when_waiting_list_is_full() {
        let mut state = setup(1);
        assert!(state.handle(0, launch("0:a")).is_empty());
        let sends = state.handle(0, launch("0:b"));
        assert_eq!(sends[0].1.status, Some(Status::Error));
        assert_eq!(sends[0].1.output, "Queue full");
        state.check_invariants();
    }

    #[test]
    fn running_jobs_do_not_count_against_capacity() {
        let mut state = setup(1);
        state.handle(1, Message::register_pool(1));
        state.handle(0, launch("0:a"));
        state.schedule();
        // "0:a" is running now, so the waiting list has room again.
        assert!(state.handle(0, launch("0:b")).is_empty());
        state.check_invariants();
    }

    #[test]
    fn ignores_done_from_wrong_source() {
        let mut state = setup(500);
        state.handle(1, Message::register_pool(1));
        state.handle(0, launch("0:t"));
        state.schedule();
        // Client 0 is not the pool executing the job.
        let sends = state.handle(0, Message::done("0:t", Status::Success, ""));
        assert!(sends.is_empty());
        assert!(state.jobs.contains_key("0:t"));
        state.check_invariants();
    }

    #[test]
    fn ignores_done_for_unknown_job() {
        let mut state = setup(500);
        assert!(state
            .handle(1, Message::done("0:ghost", Status::Success, ""))
            .is_empty());
    }

    #[test]
    fn pool_disconnect_requeues_at_the_front() {
        let mut state = setup(500);
        state.handle(1, Message::register_pool(2));
        state.handle(0, launch("0:a"));
        state.handle(0, launch("0:b"));
        state.schedule();
        state.handle(0, launch("0:c"));
        assert_eq!(state.waiting.len(), 1);
        assert_eq!(state.waiting[0], "0:c");

        let sends = state.closed(1);
        assert!(sends.is_empty());
        // Requeued jobs go in front of the already-waiting one.
        assert_eq!(state.waiting.len(), 3);
        assert_eq!(state.waiting.back().unwrap(), "0:c");
        assert!(state.waiting.iter().take(2).all(|id| id != "0:c"));
        state.check_invariants();
    }

    #[test]
    fn submitter_disconnect_discards_waiting_and_aborts_running() {
        let mut state = setup(500);
        state.handle(1, Message::register_pool(1));
        state.handle(0, launch("0:run"));
        state.schedule();
        state.handle(0, launch("0:wait"));

        let sends = state.closed(0);
        assert_eq!(sends, vec![(1, Message::abort("0:run"))]);
        assert!(state.waiting.is_empty());
        // The running job stays keyed so the pool's result can be cleaned.
        assert!(state.jobs.contains_key("0:run"));
        assert!(!state.jobs.contains_key("0:wait"));

        // The pool's eventual done is dropped and clears the entry.
        let sends = state.handle(1, Message::done("0:run", Status::Abort, ""));
        assert!(sends.is_empty());
        assert!(state.jobs.is_empty());
        state.check_invariants();
    }

    #[test]
    fn orphaned_jobs_are_forgotten_when_their_pool_dies() {
        let mut state = setup(500);
        state.handle(1, Message::register_pool(1));
        state.handle(0, launch("0:t"));
        state.schedule();
        state.closed(0);
        // Pool dies while holding a job whose submitter is already gone.
        let sends = state.closed(1);
        assert!(sends.is_empty());
        assert!(state.jobs.is_empty());
        assert!(state.waiting.is_empty());
    }

    #[test]
    fn abort_of_waiting_job_answers_directly() {
        let mut state = setup(500);
        state.handle(0, launch("0:t"));
        let sends = state.handle(0, Message::abort("0:t"));
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, 0);
        assert_eq!(sends[0].1.status, Some(Status::Abort));
        assert!(state.jobs.is_empty());
        state.check_invariants();
    }

    #[test]
    fn abort_of_running_job_is_forwarded_to_the_pool() {
        let mut state = setup(500);
        state.handle(1, Message::register_pool(1));
        state.handle(0, launch("0:t"));
        state.schedule();
        let sends = state.handle(0, Message::abort("0:t"));
        assert_eq!(sends, vec![(1, Message::abort("0:t"))]);
        assert!(state.jobs.contains_key("0:t"));
        state.check_invariants();
    }

    #[test]
    fn abort_from_non_origin_is_ignored() {
        let mut state = setup(500);
        state.handle(0, launch("0:t"));
        let sends = state.handle(1, Message::abort("0:t"));
        assert!(sends.is_empty());
        assert!(state.jobs.contains_key("0:t"));
    }

    #[test]
    fn scheduler_fills_pools_in_connection_order() {
        let mut state = setup(500);
        state.connect(2, sink());
        state.handle(1, Message::register_pool(1));
        state.handle(2, Message::register_pool(2));
        for id in ["0:a", "0:b", "0:c", "0:d"] {
            state.handle(0, launch(id));
        }
        let sends = state.schedule();
        let targets: Vec<ClientId> = sends.iter().map(|(id, _)| *id).collect();
        assert_eq!(targets, vec![1, 2, 2]);
        assert_eq!(state.waiting.len(), 1);
        state.check_invariants();
    }

    #[test]
    fn status_snapshot_reports_load() {
        let mut state = setup(2);
        state.handle(1, Message::register_pool(1));
        state.handle(0, launch("0:run"));
        state.schedule();
        state.handle(0, launch("0:wait"));

        let sends = state.handle(0, Message::status_request("s"));
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].1.status, Some(Status::Success));
        let snapshot: serde_json::Value = serde_json::from_str(&sends[0].1.output).unwrap();
        assert_eq!(snapshot["capacity"], 2);
        assert_eq!(snapshot["available"], 1);
        assert_eq!(snapshot["waiting"][0], "0:wait");
        let pool = snapshot["clients"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["id"] == 1)
            .unwrap();
        assert_eq!(pool["running"][0], "0:run");
    }
}
