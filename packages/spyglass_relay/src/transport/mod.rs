//! Point-to-point link to a render engine.
//!
//! One `Transport` per engine host. The link multiplexes three kinds of
//! traffic: ping/pong health probes, strictly serialized request/response
//! instructions, and a one-way stream of published display messages fanned
//! out to subscribers. Consumers only see the contract surface (`connect`,
//! `disconnect`, `send_ping`, `is_connected`, `subscribe`, `request`,
//! `serializer`), so tests can stand up a scripted engine behind a real
//! socket.

pub mod framing;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::TransportError;
use framing::{Frame, FrameKind, read_frame, write_frame};

/// First frame on the wire after dialing.
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    standalone: bool,
}

/// The engine's answer, declaring how its payloads are serialized
/// (`"binary"` or a textual serializer name such as `"json"`).
#[derive(Debug, Serialize, Deserialize)]
struct HelloAck {
    serializer: String,
}

/// Pairs response frames with the request they answer. The wire carries no
/// correlation id; the engine answers in send order, so pairing is by
/// position. A request abandoned on timeout leaves a gap: its response is
/// dropped on arrival instead of answering a later request.
#[derive(Default)]
struct RequestExchange {
    sent: u64,
    answered: u64,
    waiter: Option<(u64, oneshot::Sender<Vec<u8>>)>,
}

struct LinkShared {
    connected: AtomicBool,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    pong_waiter: Mutex<Option<oneshot::Sender<()>>>,
    exchange: Mutex<RequestExchange>,
}

struct Link {
    addr: String,
    serializer: String,
    socket_timeout: Duration,
    writer: Mutex<OwnedWriteHalf>,
    read_task: JoinHandle<()>,
    shared: Arc<LinkShared>,
}

/// Connection to one engine endpoint. Reconnectable: `connect` after a
/// `disconnect` (or after the peer dropped the link) builds a fresh link;
/// subscriptions do not survive reconnects and must be re-established.
pub struct Transport {
    link: Mutex<Option<Arc<Link>>>,
    request_gate: Mutex<()>,
}

impl Transport {
    pub fn new() -> Self {
        Transport {
            link: Mutex::new(None),
            request_gate: Mutex::new(()),
        }
    }

    /// Dials the engine and performs the hello handshake. No-op when the
    /// link is already up. `socket_timeout` bounds the dial, the handshake
    /// and every subsequent ping/request round trip on this link.
    pub async fn connect(
        &self,
        hostname: &str,
        port: u16,
        socket_timeout: Duration,
        standalone: bool,
    ) -> Result<(), TransportError> {
        if self.is_connected().await {
            return Ok(());
        }

        let addr = format!("{hostname}:{port}");
        let mut stream = tokio::time::timeout(socket_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout(socket_timeout))?
            .map_err(|err| TransportError::Connect {
                addr: addr.clone(),
                reason: err.to_string(),
            })?;

        let serializer = handshake(&mut stream, &addr, socket_timeout, standalone).await?;

        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(LinkShared {
            connected: AtomicBool::new(true),
            subscribers: Mutex::new(Vec::new()),
            pong_waiter: Mutex::new(None),
            exchange: Mutex::new(RequestExchange::default()),
        });
        let read_task = tokio::spawn(read_loop(read_half, Arc::clone(&shared), addr.clone()));

        let link = Arc::new(Link {
            addr: addr.clone(),
            serializer,
            socket_timeout,
            writer: Mutex::new(write_half),
            read_task,
            shared,
        });
        *self.link.lock().await = Some(link);

        debug!(%addr, "engine link established");
        Ok(())
    }

    /// Tears the link down. Idempotent.
    pub async fn disconnect(&self) {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            link.shared.connected.store(false, Ordering::Relaxed);
            link.read_task.abort();
            let mut writer = link.writer.lock().await;
            let _ = writer.shutdown().await;
            debug!(addr = %link.addr, "engine link closed");
        }
    }

    pub async fn is_connected(&self) -> bool {
        match &*self.link.lock().await {
            Some(link) => link.shared.connected.load(Ordering::Relaxed),
            None => false,
        }
    }

    /// Round-trips a ping. Any failure means the engine is gone as far as
    /// the health check is concerned.
    pub async fn send_ping(&self) -> Result<(), TransportError> {
        let link = self.current_link().await.ok_or(TransportError::Disconnected)?;

        let (tx, rx) = oneshot::channel();
        *link.shared.pong_waiter.lock().await = Some(tx);
        self.write(&link, Frame::empty(FrameKind::Ping)).await?;

        match tokio::time::timeout(link.socket_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                link.shared.pong_waiter.lock().await.take();
                Err(TransportError::Timeout(link.socket_timeout))
            }
        }
    }

    /// Sends an instruction and waits for the engine's single response.
    /// Requests are strictly serialized; the engine answers in order.
    pub async fn request(&self, data: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let _gate = self.request_gate.lock().await;
        let link = self.current_link().await.ok_or(TransportError::Disconnected)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut exchange = link.shared.exchange.lock().await;
            exchange.sent += 1;
            exchange.waiter = Some((exchange.sent, tx));
        }
        self.write(&link, Frame::new(FrameKind::Request, data)).await?;

        match tokio::time::timeout(link.socket_timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                // Abandon the exchange; the read loop drops the matching
                // response whenever it arrives.
                link.shared.exchange.lock().await.waiter.take();
                Err(TransportError::Timeout(link.socket_timeout))
            }
        }
    }

    /// Subscribes to published display messages on the current link. The
    /// backlog is unbounded: a subscriber that stalls buffers messages
    /// instead of losing them.
    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError> {
        let link = self.current_link().await.ok_or(TransportError::Disconnected)?;
        let (tx, rx) = mpsc::unbounded_channel();
        link.shared.subscribers.lock().await.push(tx);
        Ok(rx)
    }

    /// Serializer name declared by the engine during the handshake.
    pub async fn serializer(&self) -> Option<String> {
        self.current_link().await.map(|link| link.serializer.clone())
    }

    async fn current_link(&self) -> Option<Arc<Link>> {
        self.link.lock().await.clone()
    }

    async fn write(&self, link: &Link, frame: Frame) -> Result<(), TransportError> {
        let mut writer = link.writer.lock().await;
        match write_frame(&mut *writer, &frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                link.shared.connected.store(false, Ordering::Relaxed);
                Err(err)
            }
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Transport::new()
    }
}

async fn handshake(
    stream: &mut TcpStream,
    addr: &str,
    socket_timeout: Duration,
    standalone: bool,
) -> Result<String, TransportError> {
    let handshake_err = |reason: String| TransportError::Handshake {
        addr: addr.to_string(),
        reason,
    };

    let hello =
        serde_json::to_vec(&Hello { standalone }).map_err(|err| handshake_err(err.to_string()))?;
    write_frame(stream, &Frame::new(FrameKind::Hello, hello))
        .await
        .map_err(|err| handshake_err(err.to_string()))?;

    let ack = tokio::time::timeout(socket_timeout, read_frame(stream))
        .await
        .map_err(|_| handshake_err("timed out waiting for hello-ack".to_string()))?
        .map_err(|err| handshake_err(err.to_string()))?;
    if ack.kind != FrameKind::HelloAck {
        return Err(handshake_err(format!("expected hello-ack, got {:?}", ack.kind)));
    }

    let ack: HelloAck =
        serde_json::from_slice(&ack.payload).map_err(|err| handshake_err(err.to_string()))?;
    Ok(ack.serializer)
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<LinkShared>, addr: String) {
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => match frame.kind {
                FrameKind::Pong => {
                    if let Some(waiter) = shared.pong_waiter.lock().await.take() {
                        let _ = waiter.send(());
                    } else {
                        debug!(%addr, "unsolicited pong dropped");
                    }
                }
                FrameKind::Response => {
                    let mut exchange = shared.exchange.lock().await;
                    exchange.answered += 1;
                    match exchange.waiter.take() {
                        Some((seq, waiter)) if seq == exchange.answered => {
                            let _ = waiter.send(frame.payload);
                        }
                        Some(pending) => {
                            // Answer to an abandoned earlier request; keep
                            // waiting for our own.
                            exchange.waiter = Some(pending);
                            debug!(%addr, "stale response dropped");
                        }
                        None => {
                            debug!(%addr, "response with no pending request dropped");
                        }
                    }
                }
                FrameKind::Message => {
                    let mut subscribers = shared.subscribers.lock().await;
                    subscribers.retain(|tx| tx.send(frame.payload.clone()).is_ok());
                }
                other => {
                    debug!(%addr, kind = ?other, "unexpected frame from engine dropped");
                }
            },
            Err(err) => {
                debug!(%addr, error = %err, "engine link read ended");
                break;
            }
        }
    }

    shared.connected.store(false, Ordering::Relaxed);
}
