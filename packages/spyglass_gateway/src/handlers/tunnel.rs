//! The tunnel endpoint: upgrades a viewer's WebSocket and bridges it to an
//! engine session through the relay.
//!
//! A tunnel request is validated before any engine traffic flows. Refused
//! viewers get a close frame with a policy or error code; accepted viewers
//! get two pumps, one draining relay frames into the socket and one feeding
//! viewer instructions back into the relay.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use spyglass_relay::{
    Client, ClientParams, Encoding, SessionId, SessionRelay, ViewerConnection, ViewerFrame,
};

use crate::auth::TokenService;
use crate::config::StandaloneEngine;
use crate::AppState;

/// Query parameters accepted on the tunnel URL. Everything is optional at
/// the type level; `plan_tunnel` decides what a given combination means.
/// Display dimensions stay as raw text here so a garbled value falls back
/// to the configured default instead of refusing the upgrade.
#[derive(Debug, Default, Deserialize)]
pub struct TunnelParams {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub sessionid: Option<String>,
    pub token: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
    pub keyboard: Option<String>,
}

fn numeric_param(value: Option<&str>, name: &str) -> Option<u32> {
    let raw = value?;
    match raw.parse() {
        Ok(number) => Some(number),
        Err(_) => {
            warn!(param = name, value = raw, "ignoring non-numeric display parameter");
            None
        }
    }
}

/// How an accepted tunnel attaches to its engine.
#[derive(Debug)]
enum TunnelPlan {
    /// Redeem credentials and start a fresh session.
    Login {
        hostname: String,
        port: u16,
        params: ClientParams,
    },
    /// Attach to a session some other viewer already started.
    Reattach {
        hostname: String,
        port: u16,
        session: SessionId,
    },
    /// Single-session engine configured on the gateway itself.
    Standalone { hostname: String, port: u16 },
}

/// A tunnel the gateway will not open, with the close code the viewer gets.
#[derive(Debug, PartialEq, Eq)]
struct Refusal {
    code: u16,
    reason: &'static str,
}

fn policy(reason: &'static str) -> Refusal {
    Refusal {
        code: close_code::POLICY,
        reason,
    }
}

/// Decides what a tunnel request means. A configured standalone engine
/// overrides every viewer-supplied parameter; otherwise an explicit session
/// id wins over a token, and the token is only consulted for fresh logins.
async fn plan_tunnel(
    params: &TunnelParams,
    standalone: Option<&StandaloneEngine>,
    tokens: &TokenService,
) -> Result<TunnelPlan, Refusal> {
    if let Some(engine) = standalone {
        return Ok(TunnelPlan::Standalone {
            hostname: engine.hostname.clone(),
            port: engine.port,
        });
    }

    let hostname = params
        .host
        .clone()
        .ok_or(policy("missing engine host or port"))?;
    let port = params.port.ok_or(policy("missing engine host or port"))?;

    if let Some(sessionid) = &params.sessionid {
        let session =
            SessionId::parse(sessionid).map_err(|_| policy("malformed session id"))?;
        return Ok(TunnelPlan::Reattach {
            hostname,
            port,
            session,
        });
    }

    let token = params
        .token
        .as_deref()
        .ok_or(policy("missing tunnel token"))?;
    let credentials = tokens
        .redeem(token)
        .await
        .ok_or(policy("invalid tunnel token"))?;

    Ok(TunnelPlan::Login {
        hostname,
        port,
        params: ClientParams {
            username: Some(credentials.username),
            password: Some(credentials.password),
            width: numeric_param(params.width.as_deref(), "width"),
            height: numeric_param(params.height.as_deref(), "height"),
            keyboard: params.keyboard.clone(),
        },
    })
}

pub async fn tunnel_handler(
    State(state): State<AppState>,
    Query(params): Query<TunnelParams>,
    ws: WebSocketUpgrade,
) -> Response {
    debug!(
        host = ?params.host,
        port = ?params.port,
        session = ?params.sessionid,
        "tunnel upgrade requested"
    );
    ws.on_upgrade(move |socket| serve_tunnel(socket, state, params))
}

async fn serve_tunnel(mut socket: WebSocket, state: AppState, params: TunnelParams) {
    let plan = match plan_tunnel(&params, state.standalone.as_ref(), &state.tokens).await {
        Ok(plan) => plan,
        Err(refusal) => {
            warn!(reason = refusal.reason, "refusing tunnel");
            state.metrics.tunnel_refused();
            close_with(&mut socket, refusal.code, refusal.reason).await;
            return;
        }
    };

    let (hostname, port) = match &plan {
        TunnelPlan::Login { hostname, port, .. }
        | TunnelPlan::Reattach { hostname, port, .. }
        | TunnelPlan::Standalone { hostname, port } => (hostname.clone(), *port),
    };

    let host = match state.registry.acquire(&hostname, port).await {
        Ok(host) => host,
        Err(err) => {
            warn!(%err, "refusing tunnel");
            state.metrics.tunnel_refused();
            close_with(&mut socket, close_code::ERROR, "engine unreachable").await;
            return;
        }
    };

    let (viewer, mut frames) = ViewerConnection::channel();
    let encoding = host
        .transport()
        .serializer()
        .await
        .map(|name| Encoding::from_serializer(&name))
        .unwrap_or(Encoding::Binary);
    let relay = SessionRelay::new(Arc::clone(host.transport()), encoding, viewer.clone());

    let (client, client_params) = match plan {
        TunnelPlan::Login { params, .. } => (Client::new(relay, viewer), params),
        TunnelPlan::Reattach { session, .. } => (
            Client::for_existing_session(relay, viewer, session),
            ClientParams::default(),
        ),
        TunnelPlan::Standalone { .. } => (Client::new(relay, viewer), ClientParams::default()),
    };
    let client = Arc::new(client);

    if !host.connect_client(&client, client_params).await {
        state.registry.release_if_idle(&host).await;
        state.metrics.tunnel_refused();
        close_with(&mut socket, close_code::ERROR, "session start failed").await;
        return;
    }

    state.metrics.tunnel_opened();
    let session = client.session_id().map(|id| id.to_hex()).unwrap_or_default();
    info!(engine = %hostname, port, %session, "tunnel open");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Lets the viewer pump ask the engine pump (which owns the sink) to send
    // a coded close frame.
    let (close_tx, mut close_rx) = mpsc::channel::<CloseFrame>(1);

    let metrics = Arc::clone(&state.metrics);
    let mut engine_pump = tokio::spawn(async move {
        loop {
            tokio::select! {
                // Polled first so a pending close directive always wins over
                // further display traffic.
                biased;
                directive = close_rx.recv() => {
                    if let Some(frame) = directive {
                        let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    }
                    break;
                }
                frame = frames.recv() => match frame {
                    Some(ViewerFrame::Binary(data)) => {
                        metrics.message_forwarded();
                        if ws_sender.send(Message::Binary(data.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(ViewerFrame::Text(text)) => {
                        metrics.message_forwarded();
                        if ws_sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(ViewerFrame::Close) | None => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                },
            }
        }
    });

    let instruction_client = Arc::clone(&client);
    let instruction_metrics = Arc::clone(&state.metrics);
    let mut viewer_pump = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Binary(data)) => {
                    instruction_metrics.instruction_received();
                    instruction_client.queue_instruction(data.to_vec());
                }
                Ok(Message::Text(_)) => {
                    warn!("viewer sent a text frame; closing tunnel");
                    let _ = close_tx
                        .send(CloseFrame {
                            code: close_code::UNSUPPORTED,
                            reason: "text frames are not supported".into(),
                        })
                        .await;
                    break;
                }
                Ok(Message::Close(_)) => {
                    debug!("viewer closed the tunnel");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(%err, "viewer socket error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut engine_pump => {
            viewer_pump.abort();
        }
        _ = &mut viewer_pump => {
            // Once the viewer pump is gone the directive channel is closed,
            // so the engine pump exits by itself.
            let _ = engine_pump.await;
        }
    }

    host.remove_client(&client).await;
    state.registry.release_if_idle(&host).await;
    state.metrics.tunnel_closed();
    debug!(engine = %hostname, port, %session, "tunnel closed");
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
