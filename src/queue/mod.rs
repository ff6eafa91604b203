//! The central queue, the single authority over queued and running work.
//!
//! The queue is the only listening component; front-ends and pools all dial
//! it. Each accepted connection gets a receiver task and a sender task; both
//! hand off to a single main worker that owns every piece of mutable state,
//! so no handler ever observes a half-applied transition.

mod state;

pub use state::{ClientId, ClientStatus, QueueStatus};

use std::collections::HashSet;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::error::{PythiaError, Result};
use crate::message::{Message, MsgKind};
use crate::net::{Conn, ConnSender, Listener};

use state::State;

/// Envelope from a connection handler to the main worker.
enum Envelope {
    Connect {
        id: ClientId,
        outbound: mpsc::Sender<Message>,
    },
    Inbound {
        id: ClientId,
        msg: Message,
    },
    Closed {
        id: ClientId,
    },
    Quit,
}

pub struct Queue {
    config: QueueConfig,
    shutdown: CancellationToken,
}

impl Queue {
    pub fn new(config: QueueConfig) -> Queue {
        Queue {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Request shutdown. Safe to call from any task, any number of times.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the configured address and run until shutdown.
    pub async fn run(&self) -> Result<()> {
        let listener = Listener::bind(&self.config.listen).await?;
        tracing::info!(addr = %self.config.listen, "Queue listening");
        self.serve(listener).await
    }

    /// Run on an already-bound listener.
    pub async fn serve(&self, listener: Listener) -> Result<()> {
        let (master_tx, master_rx) = mpsc::channel(64);
        let main = tokio::spawn(main_loop(self.config.capacity, master_rx));

        let mut next_id: ClientId = 0;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok(stream) => stream,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let conn = Conn::wrap(stream, self.config.conn);
                    tokio::spawn(handle_client(next_id, conn, master_tx.clone()));
                    next_id += 1;
                }
            }
        }

        // Stop accepting, then let the main worker drive every connection
        // shut before returning.
        drop(listener);
        let _ = master_tx.send(Envelope::Quit).await;
        drop(master_tx);
        main.await
            .map_err(|e| PythiaError::Internal(e.to_string()))?;
        tracing::info!("Queue stopped");
        Ok(())
    }
}

/// Per-connection entry point: registers the client, then splits into the
/// receiver (this task) and sender halves.
async fn handle_client(id: ClientId, mut conn: Conn, master: mpsc::Sender<Envelope>) {
    let (out_tx, out_rx) = mpsc::channel(1);
    if master
        .send(Envelope::Connect {
            id,
            outbound: out_tx,
        })
        .await
        .is_err()
    {
        conn.close();
        return;
    }
    let sender = tokio::spawn(client_sender(conn.sender(), out_rx));
    client_receiver(id, &mut conn, &master).await;
    let _ = master.send(Envelope::Closed { id }).await;
    let _ = sender.await;
}

/// Decodes inbound messages, filters them by kind and rewrites job ids to
/// the globally unique `{conn}:{id}` form before handing off to the main
/// worker.
async fn client_receiver(id: ClientId, conn: &mut Conn, master: &mpsc::Sender<Envelope>) {
    while let Some(mut msg) = conn.recv().await {
        match msg.message {
            MsgKind::RegisterPool => {
                if msg.capacity < 1 {
                    tracing::warn!(client_id = id, capacity = msg.capacity, "Invalid pool capacity");
                    continue;
                }
            }
            MsgKind::Launch | MsgKind::Abort => {
                msg.id = format!("{}:{}", id, msg.id);
            }
            MsgKind::Done | MsgKind::Status => {}
            _ => {
                tracing::warn!(client_id = id, kind = ?msg.message, "Ignoring message");
                continue;
            }
        }
        if master.send(Envelope::Inbound { id, msg }).await.is_err() {
            break;
        }
    }
}

/// Forwards messages from the main worker onto the wire, stripping the
/// connection prefix from results so the originator sees its own ids. Ends
/// when the main worker drops the outbound channel, and then shuts the
/// connection down.
async fn client_sender(sender: ConnSender, mut outbound: mpsc::Receiver<Message>) {
    while let Some(mut msg) = outbound.recv().await {
        if msg.message == MsgKind::Done {
            if let Some((_, raw)) = msg.id.split_once(':') {
                msg.id = raw.to_string();
            }
        }
        if let Err(e) = sender.send(msg).await {
            tracing::debug!(error = %e, "Dropping outbound message");
        }
    }
    sender.close();
}

/// The main worker: owns all queue state, applies each envelope atomically
/// and reschedules after every event.
async fn main_loop(capacity: usize, mut master: mpsc::Receiver<Envelope>) {
    let mut state = State::new(capacity);
    while let Some(envelope) = master.recv().await {
        let sends = match envelope {
            Envelope::Connect { id, outbound } => {
                state.connect(id, outbound);
                Vec::new()
            }
            Envelope::Inbound { id, msg } => state.handle(id, msg),
            Envelope::Closed { id } => state.closed(id),
            Envelope::Quit => break,
        };
        deliver(&state, sends).await;
        let dispatched = state.schedule();
        deliver(&state, dispatched).await;
    }

    // Shutdown: dropping every outbound sink drives each sender task and
    // then each connection shut. Drain the envelope stream, keeping only
    // the resulting close notifications, until no client remains.
    tracing::info!("Queue shutting down");
    let mut pending: HashSet<ClientId> = state.clients.keys().copied().collect();
    state.clients.clear();
    while !pending.is_empty() {
        match master.recv().await {
            Some(Envelope::Closed { id }) => {
                pending.remove(&id);
            }
            // A connection that raced the shutdown: dropping its sink closes it.
            Some(Envelope::Connect { .. }) => {}
            Some(_) => {}
            None => break,
        }
    }
}

async fn deliver(state: &State, sends: Vec<(ClientId, Message)>) {
    for (client_id, msg) in sends {
        let Some(outbound) = state.clients.get(&client_id).map(|c| c.outbound.clone()) else {
            continue;
        };
        if outbound.send(msg).await.is_err() {
            tracing::debug!(client_id, "Dropping message for closed connection");
        }
    }
}
