//! One connection per engine host.
//!
//! A `HostConnection` owns the transport link, a once-per-second health
//! check (ping while connected, reconnect while not) and the routing map
//! from session id to attached clients. One mutex guards the running flag,
//! the first-ping flag and the client map; every map mutation and every
//! inbound dispatch is serialized through it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::client::{Client, ClientParams, SessionParams};
use crate::session::SessionId;
use crate::transport::Transport;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const FIRST_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Screen and keyboard parameters applied when a viewer does not supply
/// its own.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub width: u32,
    pub height: u32,
    pub keyboard: String,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        SessionDefaults {
            width: 1920,
            height: 1080,
            keyboard: "gb".to_string(),
        }
    }
}

/// Process-wide relay settings shared by every host connection.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub defaults: SessionDefaults,
    pub socket_timeout: Duration,
    pub standalone: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        RelaySettings {
            defaults: SessionDefaults::default(),
            socket_timeout: Duration::from_millis(15000),
            standalone: false,
        }
    }
}

struct HostState {
    running: bool,
    ping_received: bool,
    clients: HashMap<SessionId, Vec<Arc<Client>>>,
    cancel: CancellationToken,
    health: Option<JoinHandle<()>>,
    dispatch: Option<JoinHandle<()>>,
}

pub struct HostConnection {
    hostname: String,
    port: u16,
    settings: RelaySettings,
    transport: Arc<Transport>,
    state: Mutex<HostState>,
}

impl HostConnection {
    pub fn new(hostname: &str, port: u16, settings: RelaySettings) -> Self {
        HostConnection {
            hostname: hostname.to_string(),
            port,
            settings,
            transport: Arc::new(Transport::new()),
            state: Mutex::new(HostState {
                running: false,
                ping_received: false,
                clients: HashMap::new(),
                cancel: CancellationToken::new(),
                health: None,
                dispatch: None,
            }),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Link shared with the per-viewer relays for request/response traffic.
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Connects the engine link and spawns the health check, then waits for
    /// the first successful ping (up to 5 s, checked once a second).
    /// Returns whether the transport ended up connected. Idempotent: on an
    /// already-running connection only the ping wait happens, which returns
    /// quickly once a ping has ever succeeded.
    pub async fn start(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.lock().await;
            if !state.running && self.connect_engine(&mut state).await {
                state.running = true;
                state.cancel = CancellationToken::new();

                let loop_self = Arc::clone(self);
                let cancel = state.cancel.clone();
                state.health = Some(tokio::spawn(async move {
                    loop_self.health_loop(cancel).await;
                }));
            }
        }

        if !self.wait_for_first_ping().await {
            error!(host = %self.hostname, "timed out waiting for first ping from engine");
            return false;
        }

        self.transport.is_connected().await
    }

    /// Stops the health check and dispatch, disconnects the link. Attached
    /// clients are not detached; their sockets notice and go through the
    /// normal close path. Idempotent.
    pub async fn stop(&self) {
        let (health, dispatch) = {
            let mut state = self.state.lock().await;
            if !state.running {
                return;
            }
            state.running = false;
            self.transport.disconnect().await;
            state.cancel.cancel();
            (state.health.take(), state.dispatch.take())
        };

        if let Some(task) = health {
            let _ = task.await;
        }
        if let Some(task) = dispatch {
            let _ = task.await;
        }
        info!(host = %self.hostname, "host connection stopped");
    }

    /// Registers a viewer client. Requires a live engine link; fills in
    /// configured defaults for missing parameters, lets the client
    /// establish its session and files it under the resulting session id.
    pub async fn connect_client(&self, client: &Arc<Client>, params: ClientParams) -> bool {
        let mut state = self.state.lock().await;

        if !self.transport.is_connected().await {
            warn!(host = %self.hostname, "cannot attach viewer: engine link is down");
            return false;
        }

        let resolved = SessionParams {
            username: params.username,
            password: params.password,
            width: params.width.unwrap_or(self.settings.defaults.width),
            height: params.height.unwrap_or(self.settings.defaults.height),
            keyboard: params
                .keyboard
                .unwrap_or_else(|| self.settings.defaults.keyboard.clone()),
        };

        match client.start(&self.transport, self.settings.standalone, &resolved).await {
            Ok(session_id) => {
                state
                    .clients
                    .entry(session_id)
                    .or_default()
                    .push(Arc::clone(client));
                info!(
                    host = %self.hostname,
                    session = %session_id,
                    client = %client.id(),
                    "viewer attached"
                );
                true
            }
            Err(err) => {
                warn!(host = %self.hostname, error = %err, "viewer session start failed");
                false
            }
        }
    }

    /// Stops the client and drops it from its session's list, removing the
    /// list once empty. A client that was never registered is just stopped.
    pub async fn remove_client(&self, client: &Arc<Client>) {
        let mut state = self.state.lock().await;

        client.stop().await;

        if let Some(session_id) = client.session_id() {
            if let Some(clients) = state.clients.get_mut(&session_id) {
                clients.retain(|candidate| candidate.id() != client.id());
                if clients.is_empty() {
                    state.clients.remove(&session_id);
                }
            }
            debug!(
                host = %self.hostname,
                session = %session_id,
                client = %client.id(),
                "viewer detached"
            );
        }
    }

    /// Number of attached viewer clients across all sessions.
    pub async fn client_count(&self) -> usize {
        let state = self.state.lock().await;
        state.clients.values().map(Vec::len).sum()
    }

    async fn wait_for_first_ping(&self) -> bool {
        let started = tokio::time::Instant::now();
        loop {
            if self.state.lock().await.ping_received {
                return true;
            }
            if started.elapsed() >= FIRST_PING_TIMEOUT {
                return false;
            }
            tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;
        }
    }

    /// Connect and subscribe; spawns the dispatch task feeding attached
    /// clients. Returns whether the transport is connected afterwards.
    async fn connect_engine(self: &Arc<Self>, state: &mut HostState) -> bool {
        info!(host = %self.hostname, port = self.port, "connecting to engine");
        match self
            .transport
            .connect(
                &self.hostname,
                self.port,
                self.settings.socket_timeout,
                self.settings.standalone,
            )
            .await
        {
            Ok(()) => match self.transport.subscribe().await {
                Ok(messages) => {
                    let dispatch_self = Arc::clone(self);
                    let cancel = state.cancel.child_token();
                    state.dispatch = Some(tokio::spawn(async move {
                        dispatch_self.dispatch_loop(messages, cancel).await;
                    }));
                    info!(host = %self.hostname, "engine connected");
                }
                Err(err) => {
                    warn!(host = %self.hostname, error = %err, "subscribe failed after connect");
                }
            },
            Err(err) => {
                debug!(host = %self.hostname, error = %err, "engine connect failed");
            }
        }

        self.transport.is_connected().await
    }

    async fn health_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let mut state = self.state.lock().await;
            if !state.running {
                break;
            }

            if self.transport.is_connected().await {
                match self.transport.send_ping().await {
                    Ok(()) => {
                        trace!(host = %self.hostname, "engine pong received");
                        state.ping_received = true;
                    }
                    Err(err) => {
                        error!(host = %self.hostname, error = %err, "no response to engine ping");
                        // Unsubscribe, drop the link, and force every
                        // attached viewer's socket shut. The map keeps its
                        // entries; removal happens through the sockets'
                        // own close path.
                        if let Some(task) = state.dispatch.take() {
                            task.abort();
                        }
                        self.transport.disconnect().await;
                        self.close_viewers(&state);
                    }
                }
            } else {
                self.connect_engine(&mut state).await;
            }
        }
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        mut messages: mpsc::UnboundedReceiver<Vec<u8>>,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                received = messages.recv() => match received {
                    Some(message) => message,
                    None => break,
                }
            };
            self.dispatch_message(message).await;
        }
    }

    async fn dispatch_message(&self, message: Vec<u8>) {
        let state = self.state.lock().await;

        let session_id = match SessionId::from_message(&message) {
            Ok(id) => id,
            Err(err) => {
                warn!(host = %self.hostname, error = %err, "dropping malformed engine message");
                return;
            }
        };

        match state.clients.get(&session_id) {
            Some(clients) => {
                trace!(
                    host = %self.hostname,
                    session = %session_id,
                    bytes = message.len(),
                    "dispatching display message"
                );
                for client in clients {
                    client.handle_message(message.clone());
                }
            }
            None => {
                // The engine keeps publishing whether or not anyone is
                // attached; there is no upstream flow-control signal.
                trace!(host = %self.hostname, session = %session_id, "no viewer attached; message dropped");
            }
        }
    }

    fn close_viewers(&self, state: &HostState) {
        for clients in state.clients.values() {
            for client in clients {
                client.close_viewer();
            }
        }
        info!(host = %self.hostname, "forced all viewer connections closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{Encoding, SessionRelay, ViewerConnection, ViewerFrame};
    use crate::testing::StubEngine;
    use tokio::sync::mpsc;

    fn test_settings() -> RelaySettings {
        // Short socket timeout so ping failures surface well inside the
        // test receive timeouts.
        RelaySettings {
            socket_timeout: Duration::from_millis(500),
            ..RelaySettings::default()
        }
    }

    async fn started_host(engine: &StubEngine) -> Arc<HostConnection> {
        let host = Arc::new(HostConnection::new("127.0.0.1", engine.port(), test_settings()));
        assert!(host.start().await);
        host
    }

    /// Client reattaching under a fixed session id, so tests control the
    /// routing key without an establishment round trip.
    fn attached_client(
        host: &Arc<HostConnection>,
        session: SessionId,
    ) -> (Arc<Client>, mpsc::UnboundedReceiver<ViewerFrame>) {
        let (viewer, frames) = ViewerConnection::channel();
        let relay = SessionRelay::new(Arc::clone(host.transport()), Encoding::Binary, viewer.clone());
        (Arc::new(Client::for_existing_session(relay, viewer, session)), frames)
    }

    fn message_for(session: SessionId, body: &[u8]) -> Vec<u8> {
        let mut message = session.as_bytes().to_vec();
        message.extend_from_slice(body);
        message
    }

    async fn recv_frame(rx: &mut mpsc::UnboundedReceiver<ViewerFrame>) -> ViewerFrame {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for viewer frame")
            .expect("viewer channel closed")
    }

    async fn settle(rx: &mut mpsc::UnboundedReceiver<ViewerFrame>) -> Option<ViewerFrame> {
        // Give pumps a chance to run, then peek without blocking.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        rx.try_recv().ok()
    }

    #[tokio::test(start_paused = true)]
    async fn routes_messages_to_exactly_the_matching_session() {
        let engine = StubEngine::spawn().await;
        let host = started_host(&engine).await;

        let session_a = SessionId::parse(&"aa".repeat(16)).unwrap();
        let session_b = SessionId::parse(&"bb".repeat(16)).unwrap();
        let (client_a, mut frames_a) = attached_client(&host, session_a);
        let (client_b, mut frames_b) = attached_client(&host, session_b);
        assert!(host.connect_client(&client_a, ClientParams::default()).await);
        assert!(host.connect_client(&client_b, ClientParams::default()).await);

        engine.publish(message_for(session_a, b"frame-1")).await;

        let frame = recv_frame(&mut frames_a).await;
        assert_eq!(frame, ViewerFrame::Binary(message_for(session_a, b"frame-1")));
        assert_eq!(settle(&mut frames_b).await, None);

        host.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shared_session_fans_out_and_shrinks_with_removals() {
        let engine = StubEngine::spawn().await;
        let host = started_host(&engine).await;

        let session = SessionId::parse(&"cc".repeat(16)).unwrap();
        let (first, mut first_frames) = attached_client(&host, session);
        let (second, mut second_frames) = attached_client(&host, session);
        assert!(host.connect_client(&first, ClientParams::default()).await);
        assert!(host.connect_client(&second, ClientParams::default()).await);
        assert_eq!(host.client_count().await, 2);

        engine.publish(message_for(session, b"both")).await;
        assert_eq!(recv_frame(&mut first_frames).await, ViewerFrame::Binary(message_for(session, b"both")));
        assert_eq!(recv_frame(&mut second_frames).await, ViewerFrame::Binary(message_for(session, b"both")));

        host.remove_client(&first).await;
        assert_eq!(host.client_count().await, 1);

        engine.publish(message_for(session, b"one")).await;
        assert_eq!(recv_frame(&mut second_frames).await, ViewerFrame::Binary(message_for(session, b"one")));
        assert_eq!(settle(&mut first_frames).await, None);

        host.remove_client(&second).await;
        assert_eq!(host.client_count().await, 0);

        // Nobody attached: the message is dropped silently.
        engine.publish(message_for(session, b"nobody")).await;
        assert_eq!(settle(&mut second_frames).await, None);

        host.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_messages_are_dropped_without_killing_dispatch() {
        let engine = StubEngine::spawn().await;
        let host = started_host(&engine).await;

        let session = SessionId::parse(&"dd".repeat(16)).unwrap();
        let (client, mut frames) = attached_client(&host, session);
        assert!(host.connect_client(&client, ClientParams::default()).await);

        engine.publish(b"tiny".to_vec()).await;
        engine.publish(message_for(session, b"after")).await;

        assert_eq!(recv_frame(&mut frames).await, ViewerFrame::Binary(message_for(session, b"after")));

        host.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_against_unpinged_engine_fails_after_five_seconds() {
        let engine = StubEngine::builder().answer_pings(false).spawn().await;
        let host = Arc::new(HostConnection::new("127.0.0.1", engine.port(), test_settings()));

        let started = tokio::time::Instant::now();
        assert!(!host.start().await);
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(5), "gave up too early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(6500), "gave up too late: {elapsed:?}");

        host.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_client_fails_when_transport_is_down() {
        let host = Arc::new(HostConnection::new("127.0.0.1", 1, test_settings()));

        let session = SessionId::parse(&"ee".repeat(16)).unwrap();
        let (client, _frames) = attached_client(&host, session);
        assert!(!host.connect_client(&client, ClientParams::default()).await);
        assert_eq!(host.client_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_client_of_unregistered_client_is_a_noop() {
        let engine = StubEngine::spawn().await;
        let host = started_host(&engine).await;

        let session = SessionId::parse(&"ff".repeat(16)).unwrap();
        let (client, _frames) = attached_client(&host, session);
        host.remove_client(&client).await;
        assert_eq!(host.client_count().await, 0);

        host.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ping_failure_closes_viewers_and_reconnects() {
        let engine = StubEngine::spawn().await;
        let host = started_host(&engine).await;
        assert_eq!(engine.accept_count(), 1);

        let session = SessionId::parse(&"ab".repeat(16)).unwrap();
        let (client, mut frames) = attached_client(&host, session);
        assert!(host.connect_client(&client, ClientParams::default()).await);

        // The engine stops answering pings; the next health check tears the
        // link down and force-closes the viewer.
        engine.set_answer_pings(false);
        assert_eq!(recv_frame(&mut frames).await, ViewerFrame::Close);

        // The client stays in the map until the socket close path removes it.
        assert_eq!(host.client_count().await, 1);

        // Engine comes back; the health check reconnects within a tick.
        engine.set_answer_pings(true);
        let mut reconnected = false;
        for _ in 0..50 {
            if engine.accept_count() >= 2 && host.transport.is_connected().await {
                reconnected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert!(reconnected, "no reconnect attempt observed");

        host.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_then_restart_reconnects() {
        let engine = StubEngine::spawn().await;
        let host = started_host(&engine).await;

        host.stop().await;
        assert!(!host.transport.is_connected().await);

        assert!(host.start().await);
        assert!(host.transport.is_connected().await);

        host.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_while_running() {
        let engine = StubEngine::spawn().await;
        let host = started_host(&engine).await;

        assert!(host.start().await);
        assert_eq!(engine.accept_count(), 1);

        host.stop().await;
    }
}
