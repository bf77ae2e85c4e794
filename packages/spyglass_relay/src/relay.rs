//! Per-viewer relay pumps.
//!
//! Each viewer connection owns a `SessionRelay` with two FIFO queues:
//! inbound display messages (engine -> viewer) and outbound instructions
//! (viewer -> engine). Both directions run as cancellable pump tasks; there
//! is no ordering guarantee across directions, only within each one.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::Transport;

/// 4-byte probe a viewer sends to discover how engine payloads are encoded.
const ENCODING_PROBE: &[u8] = b"comm";

/// Wire encoding towards the viewer, fixed when the relay is built from the
/// serializer the engine declared. Binary engines get binary WebSocket
/// frames; anything else is treated as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoding {
    Binary,
    Text { serializer: String },
}

impl Encoding {
    pub fn from_serializer(name: &str) -> Self {
        if name == "binary" {
            Encoding::Binary
        } else {
            Encoding::Text {
                serializer: name.to_string(),
            }
        }
    }

    /// Serializer name reported to viewers probing with `comm`.
    pub fn serializer(&self) -> &str {
        match self {
            Encoding::Binary => "binary",
            Encoding::Text { serializer } => serializer,
        }
    }

    fn frame(&self, payload: Vec<u8>) -> ViewerFrame {
        match self {
            Encoding::Binary => ViewerFrame::Binary(payload),
            Encoding::Text { .. } => {
                ViewerFrame::Text(String::from_utf8_lossy(&payload).into_owned())
            }
        }
    }
}

/// Frame queued towards the viewer's WebSocket sender task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerFrame {
    Binary(Vec<u8>),
    Text(String),
    Close,
}

/// Write side of a viewer's WebSocket, decoupled from the socket itself so
/// the relay and the host connection can both push frames at it.
#[derive(Clone)]
pub struct ViewerConnection {
    frames: mpsc::UnboundedSender<ViewerFrame>,
}

impl ViewerConnection {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ViewerFrame>) {
        let (frames, rx) = mpsc::unbounded_channel();
        (ViewerConnection { frames }, rx)
    }

    pub fn send(&self, frame: ViewerFrame) {
        if self.frames.send(frame).is_err() {
            debug!("viewer connection gone; frame dropped");
        }
    }

    /// Asks the socket task to close the connection.
    pub fn close(&self) {
        self.send(ViewerFrame::Close);
    }
}

pub struct SessionRelay {
    transport: Arc<Transport>,
    encoding: Encoding,
    viewer: ViewerConnection,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    // Receivers live here until start() hands them to the pump tasks.
    queues: Mutex<Option<(mpsc::UnboundedReceiver<Vec<u8>>, mpsc::UnboundedReceiver<Vec<u8>>)>>,
    pumps: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
    cancel: CancellationToken,
}

impl SessionRelay {
    pub fn new(transport: Arc<Transport>, encoding: Encoding, viewer: ViewerConnection) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        SessionRelay {
            transport,
            encoding,
            viewer,
            inbound_tx,
            outbound_tx,
            queues: Mutex::new(Some((inbound_rx, outbound_rx))),
            pumps: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn encoding(&self) -> &Encoding {
        &self.encoding
    }

    /// Spawns both pumps. No-op if they are already running.
    pub async fn start(&self) {
        let Some((inbound_rx, outbound_rx)) = self.queues.lock().await.take() else {
            debug!("relay already started");
            return;
        };

        let inbound = tokio::spawn(inbound_pump(
            inbound_rx,
            self.viewer.clone(),
            self.encoding.clone(),
            self.cancel.clone(),
        ));
        let outbound = tokio::spawn(outbound_pump(
            outbound_rx,
            Arc::clone(&self.transport),
            self.viewer.clone(),
            self.encoding.clone(),
            self.cancel.clone(),
        ));
        *self.pumps.lock().await = Some((inbound, outbound));
    }

    /// Cancels and joins both pumps. After this returns the relay writes
    /// nothing further to the viewer. Idempotent.
    pub async fn stop(&self) {
        let pumps = self.pumps.lock().await.take();
        if let Some((inbound, outbound)) = pumps {
            self.cancel.cancel();
            let _ = inbound.await;
            let _ = outbound.await;
        }
    }

    /// Enqueues a display message for the viewer. Called by the host
    /// connection's dispatch; after shutdown the message is quietly dropped.
    pub fn on_message(&self, message: Vec<u8>) {
        if self.inbound_tx.send(message).is_err() {
            debug!("relay stopped; display message dropped");
        }
    }

    /// Enqueues a viewer instruction for the engine.
    pub fn queue_command(&self, command: Vec<u8>) {
        if self.outbound_tx.send(command).is_err() {
            debug!("relay stopped; instruction dropped");
        }
    }
}

async fn inbound_pump(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    viewer: ViewerConnection,
    encoding: Encoding,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(payload) => viewer.send(encoding.frame(payload)),
                None => break,
            }
        }
    }
}

async fn outbound_pump(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    transport: Arc<Transport>,
    viewer: ViewerConnection,
    encoding: Encoding,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            }
        };

        if command == ENCODING_PROBE {
            // Answered here, always as text; the probe never reaches the
            // engine.
            viewer.send(ViewerFrame::Text(encoding.serializer().to_string()));
            continue;
        }

        match transport.request(command).await {
            Ok(response) => viewer.send(encoding.frame(response)),
            Err(err) => {
                // The health check owns link teardown; the instruction is
                // simply lost.
                warn!(error = %err, "instruction forward failed; dropped");
            }
        }
    }
}
