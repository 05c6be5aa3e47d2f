use std::{collections::HashMap, sync::Arc, time::Duration};

use log::{trace, warn};
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
    time::{sleep, Instant},
};
use umbra_common::crypto::Ed25519Signature;

use crate::{
    config::{CONFIRMATION_POLL_INTERVAL_MS, CONFIRMATION_TIMEOUT_MS},
    gateway::RpcGateway,
};

// What a route learns about a submitted signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Confirmed,
    Failed(String),
    Timeout,
}

struct PendingSignature {
    signature: Ed25519Signature,
    registered_at: Instant,
    sender: oneshot::Sender<ConfirmOutcome>,
}

pub type SharedSignatureWatcher = Arc<SignatureWatcher>;

// Confirms in-flight signatures for every running route
//
// Routes register a signature and await the returned channel; one
// background task queries all pending signatures together through the
// batched status RPC so N routes cost one request token per tick
// instead of N.
pub struct SignatureWatcher {
    gateway: Arc<RpcGateway>,
    pending: Mutex<Vec<PendingSignature>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SignatureWatcher {
    pub fn new(gateway: Arc<RpcGateway>) -> SharedSignatureWatcher {
        Arc::new(Self {
            gateway,
            pending: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        })
    }

    // Start the polling task, idempotent
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let zelf = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            loop {
                sleep(Duration::from_millis(CONFIRMATION_POLL_INTERVAL_MS)).await;
                zelf.poll_pending().await;
            }
        }));
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }

    // Register a signature; the receiver resolves once the signature
    // is confirmed, fails, or exceeds the confirmation timeout
    pub async fn watch(&self, signature: Ed25519Signature) -> oneshot::Receiver<ConfirmOutcome> {
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().await.push(PendingSignature {
            signature,
            registered_at: Instant::now(),
            sender,
        });
        receiver
    }

    async fn poll_pending(&self) {
        let signatures: Vec<Ed25519Signature> = {
            let pending = self.pending.lock().await;
            if pending.is_empty() {
                return;
            }
            pending.iter().map(|p| p.signature).collect()
        };

        if log::log_enabled!(log::Level::Trace) {
            trace!("polling {} pending signatures", signatures.len());
        }

        let statuses = match self.gateway.signature_statuses(&signatures).await {
            Ok(statuses) => signatures
                .iter()
                .copied()
                .zip(statuses)
                .collect::<HashMap<_, _>>(),
            Err(e) => {
                // leave everything pending, the timeout below still applies
                warn!("signature status poll failed: {}", e);
                HashMap::new()
            }
        };

        let timeout = Duration::from_millis(CONFIRMATION_TIMEOUT_MS);
        let now = Instant::now();

        let mut pending = self.pending.lock().await;
        let mut index = 0;
        while index < pending.len() {
            let entry = &pending[index];

            let outcome = match statuses.get(&entry.signature) {
                Some(Some(status)) if status.is_confirmed() => Some(ConfirmOutcome::Confirmed),
                Some(Some(status)) => status.error.clone().map(ConfirmOutcome::Failed),
                _ => None,
            };

            let outcome = outcome.or_else(|| {
                (now.duration_since(entry.registered_at) >= timeout)
                    .then_some(ConfirmOutcome::Timeout)
            });

            match outcome {
                Some(outcome) => {
                    let entry = pending.swap_remove(index);
                    // the route may have been cancelled, ignore a closed channel
                    let _ = entry.sender.send(outcome);
                }
                None => index += 1,
            }
        }
    }
}

impl std::fmt::Debug for SignatureWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureWatcher").finish()
    }
}
