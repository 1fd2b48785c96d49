//! Subscription manager
//!
//! Sends subscribe/unsubscribe control frames and tracks which streams the
//! exchange has acknowledged. The confirmed set only changes when a status
//! frame says so (or when a reconnect invalidates it wholesale).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use prometheus::IntGauge;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ConnectionSupervisor;
use crate::codec::{AckStatus, CodecTable, ControlEvent, ControlRequest, SubscriptionStatus};
use crate::error::{FeedError, Result};
use crate::feed::{ConfirmationKey, SubscriptionKey, SymbolMap};

/// Acknowledgment that a control frame went out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub reqid: u64,
}

/// Outcome of waiting for a subscription to be acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Rejected(String),
    TimedOut,
    Terminated,
}

pub struct SubscriptionManager {
    codec: &'static CodecTable,
    symbols: Arc<dyn SymbolMap>,
    confirmed: RwLock<HashSet<ConfirmationKey>>,
    rejected: RwLock<HashMap<ConfirmationKey, String>>,
    /// Keys to replay after a reconnect, with their auth token
    requested: StdMutex<HashMap<SubscriptionKey, Option<String>>>,
    next_reqid: AtomicU64,
    poll: Duration,
}

impl SubscriptionManager {
    pub fn new(codec: &'static CodecTable, symbols: Arc<dyn SymbolMap>, poll: Duration) -> Self {
        Self {
            codec,
            symbols,
            confirmed: RwLock::new(HashSet::new()),
            rejected: RwLock::new(HashMap::new()),
            requested: StdMutex::new(HashMap::new()),
            next_reqid: AtomicU64::new(1),
            poll,
        }
    }

    pub fn next_reqid(&self) -> u64 {
        self.next_reqid.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a subscribe frame; confirmation arrives later as a status frame
    pub async fn subscribe(
        &self,
        supervisor: &ConnectionSupervisor,
        key: &SubscriptionKey,
        token: Option<String>,
    ) -> Result<Ack> {
        let confirmation = key.confirmation(self.symbols.as_ref());
        self.rejected.write().await.remove(&confirmation);

        let reqid = self.next_reqid();
        let frame = self.control_frame(ControlEvent::Subscribe, key, token.clone(), reqid)?;

        self.lock_requested().insert(key.clone(), token);
        if let Err(e) = supervisor.send(frame).await {
            self.lock_requested().remove(key);
            return Err(e);
        }

        info!(key = %key, reqid, "Subscription requested");
        Ok(Ack { reqid })
    }

    /// Send an unsubscribe frame and stop replaying the key after reconnects
    pub async fn unsubscribe(
        &self,
        supervisor: &ConnectionSupervisor,
        key: &SubscriptionKey,
    ) -> Result<Ack> {
        let token = self.lock_requested().remove(key).flatten();
        let reqid = self.next_reqid();
        let frame = self.control_frame(ControlEvent::Unsubscribe, key, token, reqid)?;
        supervisor.send(frame).await?;

        info!(key = %key, reqid, "Unsubscribe requested");
        Ok(Ack { reqid })
    }

    /// Whether the key is still wanted by some consumer
    pub fn is_requested(&self, key: &SubscriptionKey) -> bool {
        self.lock_requested().contains_key(key)
    }

    /// Drop a key without telling the exchange, after a rejection
    pub fn forget(&self, key: &SubscriptionKey) {
        self.lock_requested().remove(key);
    }

    pub async fn is_confirmed(&self, key: &SubscriptionKey) -> bool {
        let target = key.confirmation(self.symbols.as_ref());
        self.confirmed.read().await.contains(&target)
    }

    pub async fn confirmed_len(&self) -> usize {
        self.confirmed.read().await.len()
    }

    /// Record one acknowledgment
    pub async fn apply_status(&self, status: &SubscriptionStatus) {
        let Some(key) = status.confirmation() else {
            warn!(
                status = ?status.status,
                error = ?status.error_message,
                "Subscription status without a feed"
            );
            return;
        };

        match status.status {
            AckStatus::Subscribed => {
                debug!(feed = %key.feed, pair = ?key.pair, "Subscription confirmed");
                self.rejected.write().await.remove(&key);
                self.confirmed.write().await.insert(key);
            }
            AckStatus::Unsubscribed => {
                debug!(feed = %key.feed, pair = ?key.pair, "Subscription removed");
                self.confirmed.write().await.remove(&key);
            }
            AckStatus::Error => {
                let reason = status
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "rejected by exchange".to_string());
                warn!(feed = %key.feed, pair = ?key.pair, reason = %reason, "Subscription rejected");
                self.rejected.write().await.insert(key, reason);
            }
        }
    }

    /// Drain subscription status frames until termination
    pub async fn watch(
        &self,
        mut rx: mpsc::UnboundedReceiver<SubscriptionStatus>,
        cancel: CancellationToken,
        gauge: IntGauge,
    ) {
        loop {
            let status = tokio::select! {
                _ = cancel.cancelled() => break,
                status = rx.recv() => match status {
                    Some(status) => status,
                    None => break,
                },
            };
            self.apply_status(&status).await;
            gauge.set(self.confirmed_len().await as i64);
        }
        debug!("Subscription watcher stopped");
    }

    /// Sleep-and-check until the key is acknowledged, rejected or the wait expires
    pub async fn wait_confirmed(
        &self,
        key: &SubscriptionKey,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Confirmation {
        let target = key.confirmation(self.symbols.as_ref());
        let deadline = Instant::now() + timeout;

        loop {
            if cancel.is_cancelled() {
                return Confirmation::Terminated;
            }
            if self.confirmed.read().await.contains(&target) {
                return Confirmation::Confirmed;
            }
            if let Some(reason) = self.rejected.read().await.get(&target) {
                return Confirmation::Rejected(reason.clone());
            }
            if Instant::now() >= deadline {
                warn!(key = %key, timeout_ms = timeout.as_millis() as u64, "Subscription not confirmed in time");
                return Confirmation::TimedOut;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Confirmation::Terminated,
                _ = sleep(self.poll) => {}
            }
        }
    }

    /// Forget acknowledgments from a previous transport and replay every request
    pub async fn restore(&self, supervisor: &ConnectionSupervisor) -> usize {
        self.confirmed.write().await.clear();
        self.rejected.write().await.clear();

        let requested: Vec<_> = self
            .lock_requested()
            .iter()
            .map(|(key, token)| (key.clone(), token.clone()))
            .collect();

        let mut restored = 0;
        for (key, token) in requested {
            let reqid = self.next_reqid();
            let sent = match self.control_frame(ControlEvent::Subscribe, &key, token, reqid) {
                Ok(frame) => supervisor.send(frame).await,
                Err(e) => Err(e),
            };
            match sent {
                Ok(()) => restored += 1,
                Err(e) => warn!(key = %key, error = %e, "Failed to restore subscription"),
            }
        }

        info!(restored, "Subscriptions restored after reconnect");
        restored
    }

    fn control_frame(
        &self,
        event: ControlEvent,
        key: &SubscriptionKey,
        token: Option<String>,
        reqid: u64,
    ) -> Result<String> {
        let request = ControlRequest::Subscription {
            event,
            feed: key.feed,
            pairs: key
                .symbol
                .iter()
                .map(|s| self.symbols.to_exchange(s))
                .collect(),
            params: key.params,
            token,
            reqid,
        };
        (self.codec.encode)(&request).map_err(|e| match e {
            FeedError::Subscribe { reason, .. } => FeedError::Subscribe {
                key: key.to_string(),
                reason,
            },
            other => other,
        })
    }

    fn lock_requested(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriptionKey, Option<String>>> {
        self.requested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
