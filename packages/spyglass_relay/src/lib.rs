//! Spyglass relay - engine-link plumbing for remote display sessions
//!
//! This crate connects render engines speaking the framed display protocol
//! to viewer-facing code, with no WebSocket or HTTP dependencies. It owns
//! the engine transport, per-host health checking, session addressing and
//! the per-viewer message pumps; serving viewers over an actual socket is
//! the gateway's job.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use spyglass_relay::{
//!     Client, ClientParams, Encoding, HostRegistry, RelaySettings, SessionRelay,
//!     ViewerConnection, ViewerFrame,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = HostRegistry::new(RelaySettings::default());
//!     let host = registry.acquire("render-host", 5555).await.unwrap();
//!
//!     let (viewer, mut frames) = ViewerConnection::channel();
//!     let encoding = host
//!         .transport()
//!         .serializer()
//!         .await
//!         .map(|name| Encoding::from_serializer(&name))
//!         .unwrap_or(Encoding::Binary);
//!     let relay = SessionRelay::new(Arc::clone(host.transport()), encoding, viewer.clone());
//!     let client = Arc::new(Client::new(relay, viewer));
//!
//!     if host.connect_client(&client, ClientParams::default()).await {
//!         while let Some(frame) = frames.recv().await {
//!             match frame {
//!                 ViewerFrame::Binary(data) => println!("display: {} bytes", data.len()),
//!                 ViewerFrame::Text(text) => println!("text: {text}"),
//!                 ViewerFrame::Close => break,
//!             }
//!         }
//!     }
//!
//!     host.remove_client(&client).await;
//!     registry.release_if_idle(&host).await;
//! }
//! ```

mod client;
mod error;
mod host;
mod registry;
mod relay;
mod session;
pub mod transport;

#[cfg(any(test, feature = "stub-engine"))]
pub mod testing;

pub use client::{Client, ClientParams, SessionParams};
pub use error::{ClientError, RegistryError, SessionError, TransportError};
pub use host::{HostConnection, RelaySettings, SessionDefaults};
pub use registry::HostRegistry;
pub use relay::{Encoding, SessionRelay, ViewerConnection, ViewerFrame};
pub use session::SessionId;
pub use transport::Transport;
