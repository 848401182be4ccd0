//! Role-typed socket contexts over TCP with newline-delimited JSON frames.
//!
//! Six nominal types, one per role, each exposing only its role's primary
//! operation plus an idempotent `close`:
//!
//! - [`Publisher`] / [`Subscriber`]: 1-to-N broadcast. The publisher binds;
//!   subscribers only see frames sent after they connect.
//! - [`Pusher`] / [`Puller`]: load-balanced distribution. The pusher binds;
//!   each pushed frame reaches exactly one connected puller, round-robin.
//! - [`Requester`] / [`Responder`]: strict alternation. The responder binds
//!   and replies exactly once per request.
//!
//! Subscriber and Puller hand their traffic to the consumer through an
//! `mpsc` channel fed by a reader task; the channel closes when the
//! underlying socket goes away or a protocol violation ends the stream.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{GridError, Result};
use crate::fabric::wire::{Channel, Message};

/// Buffered frames between a reader task and its consumer.
const CHANNEL_CAPACITY: usize = 32;

/// How long a pusher naps while no puller is connected.
const PUSH_RETRY_DELAY: Duration = Duration::from_millis(200);

fn transport(e: std::io::Error) -> GridError {
    GridError::Transport(e.to_string())
}

async fn write_frame(writer: &mut OwnedWriteHalf, message: &Message) -> Result<()> {
    let mut bytes = message.to_bytes();
    bytes.push(b'\n');
    writer.write_all(&bytes).await.map_err(transport)?;
    writer.flush().await.map_err(transport)
}

/// Read one frame. `Ok(None)` means the peer closed the connection.
async fn read_frame(
    reader: &mut BufReader<OwnedReadHalf>,
    channel: Channel,
) -> Result<Option<Message>> {
    let mut line = Vec::new();
    let read = reader.read_until(b'\n', &mut line).await.map_err(transport)?;
    if read == 0 {
        return Ok(None);
    }
    Message::decode(&line, channel).map(Some)
}

/// Broadcast side of the heartbeat channel. Binds and fans every frame out
/// to all currently-connected subscribers.
pub struct Publisher {
    subscribers: Arc<Mutex<Vec<OwnedWriteHalf>>>,
    token: CancellationToken,
}

impl Publisher {
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(transport)?;
        let subscribers: Arc<Mutex<Vec<OwnedWriteHalf>>> = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();

        let accept_subscribers = subscribers.clone();
        let accept_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_token.cancelled() => return,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                tracing::debug!(peer = %peer, "Subscriber connected");
                                let (_read, write) = stream.into_split();
                                accept_subscribers.lock().await.push(write);
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Publisher accept failed");
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { subscribers, token })
    }

    /// Fire-and-forget broadcast. Connections that fail to take the frame
    /// are dropped; sending to zero subscribers succeeds.
    pub async fn send(&self, message: &Message) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(GridError::Shutdown);
        }
        let mut subscribers = self.subscribers.lock().await;
        let mut alive = Vec::with_capacity(subscribers.len());
        for mut writer in subscribers.drain(..) {
            if write_frame(&mut writer, message).await.is_ok() {
                alive.push(writer);
            }
        }
        *subscribers = alive;
        Ok(())
    }

    pub async fn close(&self) {
        self.token.cancel();
        self.subscribers.lock().await.clear();
    }
}

/// Receiving side of the heartbeat channel. `connect` returns the frame
/// stream; the channel ends when the publisher goes away or on `close`.
pub struct Subscriber {
    token: CancellationToken,
}

impl Subscriber {
    pub async fn connect(addr: &str) -> Result<(Self, mpsc::Receiver<Message>)> {
        let stream = TcpStream::connect(addr).await.map_err(transport)?;
        let token = CancellationToken::new();
        let rx = spawn_reader(stream, Channel::Heartbeat, token.clone());
        Ok((Self { token }, rx))
    }

    pub fn close(&self) {
        self.token.cancel();
    }
}

/// Distributing side of the work channel. Each `push` is taken by exactly
/// one connected puller, round-robin; with no puller connected, `push`
/// waits for one.
pub struct Pusher {
    pullers: Arc<Mutex<VecDeque<OwnedWriteHalf>>>,
    token: CancellationToken,
}

impl Pusher {
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(transport)?;
        let pullers: Arc<Mutex<VecDeque<OwnedWriteHalf>>> = Arc::new(Mutex::new(VecDeque::new()));
        let token = CancellationToken::new();

        let accept_pullers = pullers.clone();
        let accept_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_token.cancelled() => return,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                tracing::debug!(peer = %peer, "Puller connected");
                                let (_read, write) = stream.into_split();
                                accept_pullers.lock().await.push_back(write);
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Pusher accept failed");
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { pullers, token })
    }

    pub async fn push(&self, message: &Message) -> Result<()> {
        loop {
            {
                let mut pullers = self.pullers.lock().await;
                while let Some(mut writer) = pullers.pop_front() {
                    if write_frame(&mut writer, message).await.is_ok() {
                        pullers.push_back(writer);
                        return Ok(());
                    }
                    // Dead puller; fall through to the next one.
                }
            }
            tokio::select! {
                _ = self.token.cancelled() => return Err(GridError::Shutdown),
                _ = tokio::time::sleep(PUSH_RETRY_DELAY) => {}
            }
        }
    }

    pub async fn close(&self) {
        self.token.cancel();
        self.pullers.lock().await.clear();
    }
}

/// Receiving side of the work channel.
pub struct Puller {
    token: CancellationToken,
}

impl Puller {
    pub async fn connect(addr: &str) -> Result<(Self, mpsc::Receiver<Message>)> {
        let stream = TcpStream::connect(addr).await.map_err(transport)?;
        let token = CancellationToken::new();
        let rx = spawn_reader(stream, Channel::Work, token.clone());
        Ok((Self { token }, rx))
    }

    pub fn close(&self) {
        self.token.cancel();
    }
}

fn spawn_reader(
    stream: TcpStream,
    channel: Channel,
    token: CancellationToken,
) -> mpsc::Receiver<Message> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let (read, _write) = stream.into_split();
        let mut reader = BufReader::new(read);
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => return,
                frame = read_frame(&mut reader, channel) => frame,
            };
            match frame {
                Ok(Some(message)) => {
                    if tx.send(message).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    // A frame this channel cannot carry ends the stream;
                    // dropping the sender closes the consumer's channel.
                    tracing::warn!(error = %e, "Closing stream after protocol error");
                    return;
                }
            }
        }
    });
    rx
}

/// Client side of a request/reply channel. `request` blocks for the single
/// reply; strict alternation is enforced by the internal lock.
pub struct Requester {
    io: Mutex<Option<(BufReader<OwnedReadHalf>, OwnedWriteHalf)>>,
}

impl Requester {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(transport)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            io: Mutex::new(Some((BufReader::new(read), write))),
        })
    }

    pub async fn request(&self, message: &Message) -> Result<Message> {
        let mut guard = self.io.lock().await;
        let Some((reader, writer)) = guard.as_mut() else {
            return Err(GridError::Shutdown);
        };
        write_frame(writer, message).await?;
        match read_frame(reader, Channel::Reply).await? {
            Some(reply) => Ok(reply),
            None => {
                *guard = None;
                Err(GridError::Shutdown)
            }
        }
    }

    pub async fn close(&self) {
        self.io.lock().await.take();
    }
}

/// Server side of a request/reply channel. `serve` accepts connections and
/// replies exactly once per request until closed.
pub struct Responder {
    listener: Mutex<Option<TcpListener>>,
    token: CancellationToken,
}

impl Responder {
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(transport)?;
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            token: CancellationToken::new(),
        })
    }

    /// Serve requests until `close`. The handler produces exactly one reply
    /// per incoming request.
    pub async fn serve<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(Message) -> Message + Send + Sync + 'static,
    {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or(GridError::Shutdown)?;
        let handler = Arc::new(handler);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.map_err(transport)?;
                    tracing::debug!(peer = %peer, "Requester connected");
                    let handler = handler.clone();
                    let token = self.token.clone();
                    tokio::spawn(serve_connection(stream, handler, token));
                }
            }
        }
    }

    pub fn close(&self) {
        self.token.cancel();
    }
}

async fn serve_connection<F>(stream: TcpStream, handler: Arc<F>, token: CancellationToken)
where
    F: Fn(Message) -> Message + Send + Sync + 'static,
{
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => return,
            frame = read_frame(&mut reader, Channel::Request) => frame,
        };
        match frame {
            Ok(Some(request)) => {
                let reply = handler(request);
                if write_frame(&mut write, &reply).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping connection after protocol error");
                return;
            }
        }
    }
}
