//! Application-event glue
//!
//! Maps what the application knows about ("an attendee joined", "checkout")
//! onto channel and session operations, and keeps the manager in step with
//! the connection: pushes refresh balances, and every (re)connect confirms
//! channels recovered while offline and sessions whose close went unanswered.

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use ew_core::{Address, AssetBalance, ConnectionState, EventWalletId};

use crate::channel::{Channel, ChannelManager, Session};
use crate::error::ChannelError;

/// Drives a [`ChannelManager`] from application events
#[derive(Clone)]
pub struct SessionCoordinator {
    channels: ChannelManager,
}

impl SessionCoordinator {
    pub fn new(channels: ChannelManager) -> Self {
        Self { channels }
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    /// An attendee joined an event: make sure their channel exists.
    ///
    /// A channel recorded by an earlier run is recovered first so it is
    /// confirmed rather than created twice.
    pub async fn on_attendee_joined(
        &self,
        id: &EventWalletId,
        owner: Address,
    ) -> Result<Channel, ChannelError> {
        if self.channels.channel(id).is_none() {
            if let Err(e) = self.channels.recover(id).await {
                tracing::warn!(%id, "Failed to read channel record: {}", e);
            }
        }
        self.channels.create_channel(id, owner).await
    }

    /// Open a spending session with a vendor
    pub async fn open_session(
        &self,
        id: &EventWalletId,
        counterparty: Address,
        amount: &str,
    ) -> Result<Session, ChannelError> {
        self.channels.create_session(id, counterparty, amount).await
    }

    /// Fetch balances, falling back to the last known ones on failure
    pub async fn refresh_balance(&self, id: &EventWalletId) -> Option<Vec<AssetBalance>> {
        match self.channels.get_balance(id).await {
            Ok(balances) => Some(balances),
            Err(e) => {
                tracing::warn!(%id, "Balance refresh failed, keeping last known: {}", e);
                self.channels.last_known_balance(id)
            }
        }
    }

    /// Pay `recipient` and close the session
    pub async fn checkout(
        &self,
        session_id: &str,
        recipient: Address,
        amount: &str,
        memo: Option<String>,
    ) -> Result<Session, ChannelError> {
        self.channels
            .transfer_and_close(session_id, recipient, amount, memo)
            .await
    }

    /// Follow the connection until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let client = self.channels.client().clone();
        let mut states = client.subscribe_state();
        let mut pushes = client.subscribe_pushes();

        if client.state().is_connected() {
            self.reconcile().await;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Session coordinator stopping");
                    break;
                }

                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *states.borrow_and_update();
                    if state == ConnectionState::Connected {
                        self.reconcile().await;
                    }
                }

                push = pushes.recv() => match push {
                    Ok(push) => {
                        let updated = self.channels.apply_balance_push(&push).await;
                        if !updated.is_empty() {
                            tracing::debug!("Balance update applied to {} wallet(s)", updated.len());
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Missed {} pushes", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    async fn reconcile(&self) {
        match self.channels.reconcile_pending().await {
            Ok(0) => {}
            Ok(opened) => tracing::info!("Confirmed {} recovered channel(s)", opened),
            Err(e) => tracing::warn!("Failed to reconcile pending channels: {}", e),
        }
        match self.channels.reconcile_settling().await {
            Ok(0) => {}
            Ok(resolved) => tracing::info!("Resolved {} settling session(s)", resolved),
            Err(e) => tracing::warn!("Failed to reconcile settling sessions: {}", e),
        }
    }
}
