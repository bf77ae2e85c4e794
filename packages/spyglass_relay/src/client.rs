//! A connected viewer: identity, established session id, and the relay
//! pumps carrying its traffic.

use std::sync::OnceLock;

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::ClientError;
use crate::relay::{SessionRelay, ViewerConnection};
use crate::session::SessionId;
use crate::transport::Transport;

/// Connection parameters as supplied by the viewer; unset fields fall back
/// to configured defaults inside `HostConnection::connect_client`.
#[derive(Debug, Clone, Default)]
pub struct ClientParams {
    pub username: Option<String>,
    pub password: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub keyboard: Option<String>,
}

/// `ClientParams` after defaulting.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub username: Option<String>,
    pub password: Option<String>,
    pub width: u32,
    pub height: u32,
    pub keyboard: String,
}

/// Session-start instruction sent over the engine's request channel. The
/// engine answers with a message-envelope response whose first 16 bytes are
/// the session id.
#[derive(Serialize)]
struct SessionStartRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    username: Option<&'a str>,
    password: Option<&'a str>,
    width: u32,
    height: u32,
    keyboard: &'a str,
}

pub struct Client {
    id: Uuid,
    session: OnceLock<SessionId>,
    relay: SessionRelay,
    viewer: ViewerConnection,
}

impl Client {
    pub fn new(relay: SessionRelay, viewer: ViewerConnection) -> Self {
        Client {
            id: Uuid::new_v4(),
            session: OnceLock::new(),
            relay,
            viewer,
        }
    }

    /// Client reattaching to a session it already knows, skipping session
    /// establishment.
    pub fn for_existing_session(
        relay: SessionRelay,
        viewer: ViewerConnection,
        session: SessionId,
    ) -> Self {
        let client = Client::new(relay, viewer);
        let _ = client.session.set(session);
        client
    }

    /// Instance identity; distinguishes clients sharing a session id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.get().copied()
    }

    /// Establishes the engine session (unless reattaching or standalone)
    /// and starts the relay pumps. Returns the session id this client is
    /// registered under.
    pub async fn start(
        &self,
        transport: &Transport,
        standalone: bool,
        params: &SessionParams,
    ) -> Result<SessionId, ClientError> {
        let session_id = if standalone {
            // A standalone engine hosts exactly one session, addressed by
            // the zeroed id.
            SessionId::STANDALONE
        } else if let Some(existing) = self.session.get() {
            *existing
        } else {
            establish_session(transport, params).await?
        };

        let session_id = *self.session.get_or_init(|| session_id);
        self.relay.start().await;

        debug!(client = %self.id, session = %session_id, "client started");
        Ok(session_id)
    }

    /// Stops the relay pumps; no viewer writes happen after this returns.
    pub async fn stop(&self) {
        self.relay.stop().await;
    }

    /// Forces the viewer's WebSocket shut; used when the engine link dies.
    pub fn close_viewer(&self) {
        self.viewer.close();
    }

    /// Display message routed to this client by the host connection.
    pub fn handle_message(&self, message: Vec<u8>) {
        self.relay.on_message(message);
    }

    /// Raw instruction received from the viewer's WebSocket.
    pub fn queue_instruction(&self, command: Vec<u8>) {
        self.relay.queue_command(command);
    }
}

async fn establish_session(
    transport: &Transport,
    params: &SessionParams,
) -> Result<SessionId, ClientError> {
    let request = SessionStartRequest {
        kind: "connect",
        username: params.username.as_deref(),
        password: params.password.as_deref(),
        width: params.width,
        height: params.height,
        keyboard: &params.keyboard,
    };
    let response = transport.request(serde_json::to_vec(&request)?).await?;
    if response.is_empty() {
        return Err(ClientError::Rejected("empty session response".to_string()));
    }
    Ok(SessionId::from_message(&response)?)
}
