//! Outbound messages from the daemon to the scheduler-side party that holds a claim.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::claim::ClaimId;

/// How long a pushed ALIVE waits for its answer.
const ALIVE_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of pushing an ALIVE to the claim's client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliveOutcome {
    /// The client still knows the claim
    Acknowledged,
    /// The client answered but no longer recognises the claim
    NotRecognized,
    /// No answer (unreachable, timed out)
    Failed(String),
}

#[async_trait]
pub trait ClaimClient: Send + Sync {
    async fn send_alive(&self, addr: &str, claim: &ClaimId) -> AliveOutcome;

    /// Tell the client its claim was vacated. Best effort.
    async fn vacate(&self, addr: &str, claim: &ClaimId);
}

/// Message delivered to a registered in-process peer.
#[derive(Debug)]
pub enum PeerMessage {
    Alive {
        claim: ClaimId,
        /// `true` when the peer recognises the claim
        reply: oneshot::Sender<bool>,
    },
    Vacate {
        claim: ClaimId,
    },
}

/// Routes client messages to in-process peers by address.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, mpsc::Sender<PeerMessage>>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer under `addr` and return its inbox.
    pub async fn register(&self, addr: impl Into<String>) -> mpsc::Receiver<PeerMessage> {
        let (tx, rx) = mpsc::channel(100);
        self.peers.write().await.insert(addr.into(), tx);
        rx
    }

    pub async fn unregister(&self, addr: &str) {
        self.peers.write().await.remove(addr);
    }

    async fn route(&self, addr: &str) -> Option<mpsc::Sender<PeerMessage>> {
        self.peers.read().await.get(addr).cloned()
    }
}

#[async_trait]
impl ClaimClient for PeerRegistry {
    async fn send_alive(&self, addr: &str, claim: &ClaimId) -> AliveOutcome {
        let Some(peer) = self.route(addr).await else {
            return AliveOutcome::Failed(format!("no route to {}", addr));
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let msg = PeerMessage::Alive {
            claim: claim.clone(),
            reply: reply_tx,
        };
        if peer.send(msg).await.is_err() {
            return AliveOutcome::Failed(format!("{} went away", addr));
        }
        match tokio::time::timeout(ALIVE_REPLY_TIMEOUT, reply_rx).await {
            Ok(Ok(true)) => AliveOutcome::Acknowledged,
            Ok(Ok(false)) => AliveOutcome::NotRecognized,
            Ok(Err(_)) => AliveOutcome::Failed(format!("{} dropped the request", addr)),
            Err(_) => AliveOutcome::Failed(format!("{} timed out", addr)),
        }
    }

    async fn vacate(&self, addr: &str, claim: &ClaimId) {
        match self.route(addr).await {
            Some(peer) => {
                let _ = peer
                    .send(PeerMessage::Vacate {
                        claim: claim.clone(),
                    })
                    .await;
            }
            None => tracing::debug!(addr, claim = %claim, "No route for vacate notice"),
        }
    }
}
