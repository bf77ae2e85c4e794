//! Single-use tunnel tokens.
//!
//! A token is a 32-character opaque id mapping to the credentials a viewer
//! will log in with. Redemption consumes the entry, so a token authorizes
//! at most one tunnel; a background sweeper purges entries that expire
//! before anyone redeems them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Login credentials held behind an issued token.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    expires_at: Instant,
}

pub struct TokenService {
    tokens: Arc<Mutex<HashMap<String, Credentials>>>,
    ttl: Duration,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl TokenService {
    pub fn new(ttl: Duration) -> Self {
        TokenService {
            tokens: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            cancel: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Spawns the expiry sweeper. Calling start twice is a no-op.
    pub async fn start(&self) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() {
            return;
        }
        let tokens = Arc::clone(&self.tokens);
        let cancel = self.cancel.clone();
        *sweeper = Some(tokio::spawn(async move {
            sweep_loop(tokens, cancel).await;
        }));
        debug!("token sweeper started");
    }

    /// Stops the sweeper and waits for it to finish. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.sweeper.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
            debug!("token sweeper stopped");
        }
    }

    /// Issues a fresh token for the given credentials. The token is a
    /// hyphen-less UUID: 32 lowercase hex characters.
    pub async fn issue(&self, username: &str, password: &str) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let credentials = Credentials {
            username: username.to_string(),
            password: password.to_string(),
            expires_at: Instant::now() + self.ttl,
        };

        self.tokens.lock().await.insert(token.clone(), credentials);
        info!(user = %username, "issued single-use tunnel token");
        token
    }

    /// Takes the credentials behind a token. The entry is removed on the
    /// way out, so a second redemption of the same token always fails.
    /// Expiry is enforced here as well as by the sweeper: a token that
    /// outlived its ttl is dead even if the sweeper never got to it.
    pub async fn redeem(&self, token: &str) -> Option<Credentials> {
        let mut tokens = self.tokens.lock().await;
        let credentials = tokens.remove(token)?;

        if Instant::now() >= credentials.expires_at {
            debug!("token expired before redemption");
            return None;
        }
        Some(credentials)
    }

    pub async fn token_count(&self) -> usize {
        self.tokens.lock().await.len()
    }
}

async fn sweep_loop(tokens: Arc<Mutex<HashMap<String, Credentials>>>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let now = Instant::now();
        let mut tokens = tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|_, credentials| now < credentials.expires_at);
        let swept = before - tokens.len();
        if swept > 0 {
            debug!(swept, "purged expired tokens");
        }
    }
}
