//! The worker pool: a fixed number of sandbox execution slots offered to the
//! queue.
//!
//! The pool dials the queue, advertises its capacity and executes whatever
//! arrives. Each accepted launch runs in its own task; completions funnel
//! back through the pool's main loop, which owns the running-jobs map.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::Result;
use crate::message::{Message, MsgKind, Status};
use crate::net::{dial_retry, Conn, ConnSender};
use crate::runner::{Job, JobHandle};

pub struct Pool {
    config: PoolConfig,
    shutdown: CancellationToken,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Pool {
        Pool {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Request shutdown: stop accepting launches, abort in-flight jobs and
    /// return once their results went out. Safe to call from any task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Connect to the queue and serve jobs until the connection closes or
    /// shutdown is requested.
    pub async fn run(&self) -> Result<()> {
        let mut conn = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            conn = dial_retry(&self.config.queue, self.config.conn) => conn,
        };
        tracing::info!(queue = %self.config.queue, capacity = self.config.capacity, "Pool connected");
        conn.send(Message::register_pool(self.config.capacity))
            .await?;

        // The token bag bounding parallel sandboxes.
        let tokens = Arc::new(Semaphore::new(self.config.capacity));
        let mut running: HashMap<String, JobHandle> = HashMap::new();
        let (done_tx, mut done_rx) = mpsc::channel::<Message>(self.config.capacity.max(1));
        let sender = conn.sender();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = conn.recv() => match msg {
                    Some(msg) => {
                        self.handle_message(msg, &tokens, &mut running, &done_tx, &sender)
                            .await;
                    }
                    None => {
                        tracing::info!("Queue connection closed");
                        break;
                    }
                },
                Some(done) = done_rx.recv() => {
                    running.remove(&done.id);
                    if let Err(e) = sender.send(done).await {
                        tracing::debug!(error = %e, "Dropping job result");
                    }
                }
            }
        }

        // Drain: abort everything in flight and forward the results while
        // the connection still accepts writes; once it is gone they are
        // dropped.
        for handle in running.values() {
            handle.abort();
        }
        while !running.is_empty() {
            let Some(done) = done_rx.recv().await else {
                break;
            };
            running.remove(&done.id);
            if let Err(e) = sender.send(done).await {
                tracing::debug!(error = %e, "Dropping job result");
            }
        }
        conn.close();
        tracing::info!("Pool stopped");
        Ok(())
    }

    async fn handle_message(
        &self,
        msg: Message,
        tokens: &Arc<Semaphore>,
        running: &mut HashMap<String, JobHandle>,
        done_tx: &mpsc::Sender<Message>,
        sender: &ConnSender,
    ) {
        match msg.message {
            MsgKind::Launch => {
                let Some(task) = msg.task else {
                    let reply = Message::done(msg.id, Status::Fatal, "Missing task description");
                    if let Err(e) = sender.send(reply).await {
                        tracing::debug!(error = %e, "Dropping reply");
                    }
                    return;
                };
                match tokens.clone().try_acquire_owned() {
                    Ok(token) => {
                        let job = Job::new(task, msg.input, self.config.paths.clone());
                        running.insert(msg.id.clone(), job.handle());
                        let done_tx = done_tx.clone();
                        let id = msg.id;
                        tokio::spawn(async move {
                            tracing::info!(job_id = %id, "Job started");
                            let (status, output) = job.execute().await;
                            tracing::info!(job_id = %id, status = %status, "Job finished");
                            let _ = done_tx.send(Message::done(id, status, output)).await;
                            drop(token);
                        });
                    }
                    Err(_) => {
                        tracing::warn!(job_id = %msg.id, "Capacity exceeded, cannot handle job");
                        let reply = Message::done(msg.id, Status::Error, "Pool capacity exceeded");
                        if let Err(e) = sender.send(reply).await {
                            tracing::debug!(error = %e, "Dropping reply");
                        }
                    }
                }
            }
            MsgKind::Abort => {
                if let Some(handle) = running.get(&msg.id) {
                    tracing::info!(job_id = %msg.id, "Aborting job");
                    handle.abort();
                } else {
                    tracing::debug!(job_id = %msg.id, "Abort for unknown job");
                }
            }
            kind => {
                tracing::warn!(kind = ?kind, "Ignoring message");
            }
        }
    }
}
