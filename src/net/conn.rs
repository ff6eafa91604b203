//! Message-oriented connection over a raw byte stream.
//!
//! Each message is one JSON object per line. A reader task decodes inbound
//! frames and a writer task encodes outbound ones, so the connection stays
//! live in both directions regardless of what the owner is doing. Keep-alive
//! messages are generated and consumed here and never reach application code.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnConfig, INITIAL_RETRY_INTERVAL, MAX_RETRY_INTERVAL};
use crate::error::{PythiaError, Result};
use crate::message::{Message, MsgKind};

use super::listener::connect;
use super::Addr;

struct SendRequest {
    msg: Message,
    result: oneshot::Sender<Result<()>>,
}

/// Cloneable handle for sending on a [`Conn`] and closing it.
#[derive(Clone)]
pub struct ConnSender {
    outbound: mpsc::Sender<SendRequest>,
    token: CancellationToken,
}

impl ConnSender {
    /// Send one message. Resolves once the frame has been written out, or
    /// with [`PythiaError::ConnectionClosed`] if the connection is gone.
    pub async fn send(&self, msg: Message) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let req = SendRequest { msg, result: tx };
        tokio::select! {
            _ = self.token.cancelled() => return Err(PythiaError::ConnectionClosed),
            sent = self.outbound.send(req) => {
                if sent.is_err() {
                    return Err(PythiaError::ConnectionClosed);
                }
            }
        }
        tokio::select! {
            _ = self.token.cancelled() => Err(PythiaError::ConnectionClosed),
            result = rx => result.unwrap_or(Err(PythiaError::ConnectionClosed)),
        }
    }

    /// Close the connection. Idempotent; both directions terminate promptly.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A message-oriented duplex connection.
pub struct Conn {
    sender: ConnSender,
    inbound: mpsc::Receiver<Message>,
}

impl Conn {
    /// Wrap a raw stream into a message-oriented connection. The stream
    /// shall not be used directly anymore.
    pub fn wrap<S>(stream: S, config: ConnConfig) -> Conn
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let token = CancellationToken::new();
        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, out_rx) = mpsc::channel(1);

        tokio::spawn(reader(
            read_half,
            in_tx,
            token.clone(),
            config.read_timeout(),
        ));
        tokio::spawn(writer(write_half, out_rx, token.clone(), config.keep_alive));

        Conn {
            sender: ConnSender {
                outbound: out_tx,
                token,
            },
            inbound: in_rx,
        }
    }

    /// Receive the next inbound message. Returns `None` once the peer has
    /// closed, a read error occurred, or liveness failed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    /// A cloneable sending handle, letting send and receive sides live in
    /// different tasks.
    pub fn sender(&self) -> ConnSender {
        self.sender.clone()
    }

    pub async fn send(&self, msg: Message) -> Result<()> {
        self.sender.send(msg).await
    }

    pub fn close(&self) {
        self.sender.close();
    }
}

/// Reader task: decodes frames, filters keep-alives, and terminates the
/// connection on EOF, read errors, or a liveness timeout.
async fn reader<R>(
    read_half: R,
    inbound: mpsc::Sender<Message>,
    token: CancellationToken,
    read_timeout: Duration,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = token.cancelled() => break,
            read = tokio::time::timeout(read_timeout, lines.read_line(&mut line)) => read,
        };
        match read {
            Err(_) => {
                tracing::warn!("Connection timed out");
                break;
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Connection read error");
                break;
            }
            Ok(Ok(0)) => {
                tracing::debug!("Connection closed on remote side");
                break;
            }
            Ok(Ok(_)) => {
                let frame = line.trim();
                if frame.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Message>(frame) {
                    Ok(msg) if msg.message == MsgKind::KeepAlive => continue,
                    Ok(msg) => {
                        let delivered = tokio::select! {
                            _ = token.cancelled() => false,
                            sent = inbound.send(msg) => sent.is_ok(),
                        };
                        if !delivered {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, frame, "Dropping malformed message");
                    }
                }
            }
        }
    }
    token.cancel();
}

/// Writer task: encodes outbound frames and emits keep-alives on intervals
/// in which no application message was sent.
async fn writer<W>(
    mut write_half: W,
    mut outbound: mpsc::Receiver<SendRequest>,
    token: CancellationToken,
    keep_alive: Duration,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let start = tokio::time::Instant::now() + keep_alive;
    let mut ticker = tokio::time::interval_at(start, keep_alive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut idle = true;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            req = outbound.recv() => match req {
                Some(SendRequest { msg, result }) => {
                    let written = write_frame(&mut write_half, &msg).await;
                    // The caller learns about a failed write; the reader side
                    // notices the broken stream and tears the connection down.
                    let _ = result.send(written);
                    idle = false;
                }
                None => break,
            },
            _ = ticker.tick() => {
                if idle {
                    if let Err(e) = write_frame(&mut write_half, &Message::keep_alive()).await {
                        tracing::warn!(error = %e, "Error sending keep-alive message");
                    }
                }
                idle = true;
            }
        }
    }
    token.cancel();
    let _ = write_half.shutdown().await;
}

async fn write_frame<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    let mut frame = serde_json::to_vec(msg)?;
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Connect to `addr` and return a message-oriented connection.
pub async fn dial(addr: &Addr, config: ConnConfig) -> Result<Conn> {
    let stream = connect(addr).await?;
    Ok(Conn::wrap(stream, config))
}

/// Connect to `addr`, retrying with exponential backoff until the endpoint
/// accepts. Useful for components starting before the queue is up.
pub async fn dial_retry(addr: &Addr, config: ConnConfig) -> Conn {
    let mut interval = INITIAL_RETRY_INTERVAL;
    loop {
        match dial(addr, config).await {
            Ok(conn) => return conn,
            Err(e) => {
                tracing::debug!(addr = %addr, error = %e, "Dial failed, retrying");
                tokio::time::sleep(interval).await;
                interval = (2 * interval).min(MAX_RETRY_INTERVAL);
            }
        }
    }
}
