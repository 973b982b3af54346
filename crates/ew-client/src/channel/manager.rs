//! Channel and session lifecycle on top of an authenticated client
//!
//! The manager is the only writer of channel and session records. Balances
//! are never computed locally: every amount it holds is the last one the
//! node reported.
//!
//! Channel store failures are logged and never abort a channel operation.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

use ew_core::config::ChannelDefaults;
use ew_core::time::{current_time_millis, MonotonicIds};
use ew_core::traits::{get_json, put_json};
use ew_core::{
    Address, AssetBalance, ChannelStatus, ChannelStore, EventWalletId, KeyValueStore,
    SessionStatus, StoreError,
};
use ew_protocol::message::{
    AppAllocation, AppDefinition, AppSessionResult, AppSessionsResult, BalancesPayload, ChannelInfo,
    ChannelsResult, CloseAppSessionParams, CreateAppSessionParams, CreateChannelParams,
    CreateChannelResult, GetAppSessionsParams, GetChannelsParams, GetLedgerBalancesParams,
    APP_PROTOCOL_VERSION,
};
use ew_protocol::{PushMessage, RpcMethod};

use super::types::{balance_of, channel_record_key, Channel, ChannelRecord, Session};
use crate::client::ProtocolClient;
use crate::error::{ChannelError, ClientError, StateError, TransportError};

/// Voting weight of the channel owner in a two-party session
const OWNER_WEIGHT: u64 = 100;
/// Signatures needed to update a session; the owner alone reaches it
const SESSION_QUORUM: u64 = 100;

type CreateFuture = Shared<BoxFuture<'static, Result<Channel, ChannelError>>>;

/// Creates and tracks channels and sessions
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<Inner>,
}

struct Inner {
    client: ProtocolClient,
    defaults: ChannelDefaults,
    channels: DashMap<EventWalletId, Channel>,
    sessions: DashMap<String, Session>,
    in_flight: DashMap<EventWalletId, CreateFuture>,
    balances: DashMap<EventWalletId, Vec<AssetBalance>>,
    channel_store: Option<Arc<dyn ChannelStore>>,
    records: Arc<dyn KeyValueStore>,
    nonces: MonotonicIds,
}

impl ChannelManager {
    /// `records` persists channel identities for [`recover`](Self::recover)
    pub fn new(
        client: ProtocolClient,
        defaults: ChannelDefaults,
        records: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self::build(client, defaults, records, None)
    }

    /// Like [`new`](Self::new), also reporting lifecycle changes to an
    /// application store
    pub fn with_channel_store(
        client: ProtocolClient,
        defaults: ChannelDefaults,
        records: Arc<dyn KeyValueStore>,
        channel_store: Arc<dyn ChannelStore>,
    ) -> Self {
        Self::build(client, defaults, records, Some(channel_store))
    }

    fn build(
        client: ProtocolClient,
        defaults: ChannelDefaults,
        records: Arc<dyn KeyValueStore>,
        channel_store: Option<Arc<dyn ChannelStore>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                defaults,
                channels: DashMap::new(),
                sessions: DashMap::new(),
                in_flight: DashMap::new(),
                balances: DashMap::new(),
                channel_store,
                records,
                nonces: MonotonicIds::new(),
            }),
        }
    }

    /// The underlying client
    pub fn client(&self) -> &ProtocolClient {
        &self.inner.client
    }

    /// Open a channel for `id`, or return the one already open.
    ///
    /// Waits up to the request timeout for a reconnect in progress. A
    /// recovered channel is confirmed with the node first and comes back
    /// `pending` while the node has it but has not opened it yet.
    /// Concurrent calls for the same id share one request and one outcome.
    /// A failed attempt leaves the channel `failed`; calling again retries.
    pub async fn create_channel(
        &self,
        id: &EventWalletId,
        owner: Address,
    ) -> Result<Channel, ChannelError> {
        if let Some(channel) = self.channel(id) {
            if channel.status == ChannelStatus::Open {
                return Ok(channel);
            }
        }

        let future = match self.inner.in_flight.entry(id.clone()) {
            Entry::Occupied(entry) => {
                tracing::debug!(%id, "Joining in-flight channel creation");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let inner = self.inner.clone();
                let id = id.clone();
                let future = async move {
                    let result = inner.open_channel(&id, owner).await;
                    inner.in_flight.remove(&id);
                    result
                }
                .boxed()
                .shared();
                entry.insert(future.clone());
                future
            }
        };

        future.await
    }

    /// Open a session on `id`'s channel funded with `amount` of the default asset
    pub async fn create_session(
        &self,
        id: &EventWalletId,
        counterparty: Address,
        amount: &str,
    ) -> Result<Session, ChannelError> {
        let channel = self
            .channel(id)
            .ok_or_else(|| StateError::UnknownChannel(id.clone()))?;
        if channel.status != ChannelStatus::Open {
            return Err(StateError::ChannelNotOpen {
                id: id.clone(),
                status: channel.status,
            }
            .into());
        }

        let asset = &self.inner.defaults.asset;
        let params = CreateAppSessionParams {
            definition: AppDefinition {
                protocol: APP_PROTOCOL_VERSION.to_string(),
                participants: vec![channel.owner.to_hex(), counterparty.to_hex()],
                weights: vec![OWNER_WEIGHT, 0],
                quorum: SESSION_QUORUM,
                challenge: 0,
                nonce: self.inner.nonces.next_id(),
            },
            allocations: vec![
                AppAllocation {
                    participant: channel.owner.to_hex(),
                    asset: asset.clone(),
                    amount: amount.to_string(),
                },
                AppAllocation {
                    participant: counterparty.to_hex(),
                    asset: asset.clone(),
                    amount: "0".to_string(),
                },
            ],
            session_data: None,
        };

        let result: AppSessionResult = self
            .inner
            .client
            .call(RpcMethod::CreateAppSession, &params)
            .await?;
        tracing::info!(%id, session_id = %result.app_session_id, "Opened app session");

        let now = current_time_millis();
        let mut session = Session {
            session_id: result.app_session_id.clone(),
            event_wallet_id: id.clone(),
            participant: channel.owner,
            counterparty: Some(counterparty),
            status: SessionStatus::Open,
            balance: None,
            created_at: now,
            updated_at: now,
        };
        self.inner.sessions.insert(session.session_id.clone(), session.clone());
        if let Some(mut channel) = self.inner.channels.get_mut(id) {
            channel.session_id = Some(session.session_id.clone());
        }

        match self.session_balances(&session.session_id).await {
            Ok(balances) => {
                let balance = balance_of(&balances, asset);
                if let Some(mut stored) = self.inner.sessions.get_mut(&session.session_id) {
                    stored.balance = balance.clone();
                    stored.updated_at = current_time_millis();
                }
                session.balance = balance;
            }
            Err(e) => {
                tracing::warn!(session_id = %session.session_id, "Session balance unavailable: {}", e);
            }
        }

        Ok(session)
    }

    /// Query the owner's ledger balances, exactly as the node reports them
    pub async fn get_balance(&self, id: &EventWalletId) -> Result<Vec<AssetBalance>, ChannelError> {
        let channel = self
            .channel(id)
            .ok_or_else(|| StateError::UnknownChannel(id.clone()))?;

        let params = GetLedgerBalancesParams {
            participant: channel.owner.to_hex(),
        };
        let payload: BalancesPayload = self
            .inner
            .client
            .call(RpcMethod::GetLedgerBalances, &params)
            .await?;
        let balances: Vec<AssetBalance> =
            payload.into_balances().into_iter().map(AssetBalance::from).collect();

        self.record_balances(id, balances.clone()).await;
        Ok(balances)
    }

    /// Move `amount` to `recipient` and close the session in one signed message.
    ///
    /// Only an open session can be settled. While the request is in flight the
    /// session is `settling`. A node rejection, or a failure before the frame
    /// was written, reopens it. A timeout or a connection lost after the write
    /// leaves it `settling` because the outcome is unknown;
    /// [`reconcile_session`](Self::reconcile_session) resolves it later.
    pub async fn transfer_and_close(
        &self,
        session_id: &str,
        recipient: Address,
        amount: &str,
        memo: Option<String>,
    ) -> Result<Session, ChannelError> {
        self.set_session_status(session_id, |status| {
            if status != SessionStatus::Open {
                return Err(StateError::SessionNotOpen {
                    session_id: session_id.to_string(),
                    status,
                });
            }
            Ok(SessionStatus::Settling)
        })?;

        let params = CloseAppSessionParams {
            app_session_id: session_id.to_string(),
            allocations: vec![AppAllocation {
                participant: recipient.to_hex(),
                asset: self.inner.defaults.asset.clone(),
                amount: amount.to_string(),
            }],
            session_data: memo,
        };

        let result = match serde_json::to_value(&params) {
            Ok(params) => {
                self.inner
                    .client
                    .send_request(RpcMethod::CloseAppSession, vec![params])
                    .await
            }
            Err(e) => Err(e.into()),
        };

        let status = match &result {
            Ok(response) => {
                // The node accepted the close; an odd result body does not undo that
                if let Err(e) = response.first::<AppSessionResult>() {
                    tracing::warn!(session_id, "Unexpected close_app_session result: {}", e);
                }
                SessionStatus::Closed
            }
            Err(ClientError::Protocol { code, message }) => {
                tracing::warn!(session_id, "Node rejected close ({}): {}", code, message);
                SessionStatus::Open
            }
            Err(e) if close_outcome_unknown(e) => {
                tracing::warn!(session_id, "Close outcome unknown, session stays settling: {}", e);
                SessionStatus::Settling
            }
            Err(e) => {
                tracing::warn!(session_id, "Close was not sent, session reopened: {}", e);
                SessionStatus::Open
            }
        };

        let session = self.set_session_status(session_id, |_| Ok(status))?;

        result?;
        tracing::info!(session_id, %recipient, amount, "Session settled and closed");
        Ok(session)
    }

    /// Resolve a `settling` session from the node's session list.
    ///
    /// A session the node reports closed becomes `closed`, one it reports
    /// open becomes `open` again. Sessions in any other state, or missing
    /// from the list, are returned unchanged.
    pub async fn reconcile_session(&self, session_id: &str) -> Result<Session, ChannelError> {
        let session = self
            .session(session_id)
            .ok_or_else(|| StateError::UnknownSession(session_id.to_string()))?;
        if session.status != SessionStatus::Settling {
            return Ok(session);
        }

        let params = GetAppSessionsParams {
            participant: session.participant.to_hex(),
            status: None,
        };
        let result: AppSessionsResult = self
            .inner
            .client
            .call(RpcMethod::GetAppSessions, &params)
            .await?;

        let remote = result
            .into_sessions()
            .into_iter()
            .find(|info| info.app_session_id.eq_ignore_ascii_case(session_id));
        let status = match remote.as_ref().map(|info| info.status.to_ascii_lowercase()) {
            Some(status) if status == "closed" => SessionStatus::Closed,
            Some(status) if status == "open" => SessionStatus::Open,
            other => {
                tracing::debug!(session_id, remote = ?other, "Settling session not resolved yet");
                return Ok(session);
            }
        };

        tracing::info!(session_id, %status, "Settling session reconciled");
        Ok(self.set_session_status(session_id, |current| {
            // A concurrent reconcile may already have resolved it
            if current == SessionStatus::Settling {
                Ok(status)
            } else {
                Ok(current)
            }
        })?)
    }

    /// Reconcile every `settling` session; returns how many were resolved
    pub async fn reconcile_settling(&self) -> Result<usize, ChannelError> {
        let settling: Vec<String> = self
            .inner
            .sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Settling)
            .map(|s| s.key().clone())
            .collect();

        let mut resolved = 0;
        for session_id in settling {
            if self.reconcile_session(&session_id).await?.status != SessionStatus::Settling {
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    /// Re-derive a channel from its durable record after a restart.
    ///
    /// The channel is `pending` until [`reconcile_pending`](Self::reconcile_pending)
    /// confirms its real status with the node.
    pub async fn recover(&self, id: &EventWalletId) -> Result<Option<Channel>, ChannelError> {
        if let Some(channel) = self.channel(id) {
            return Ok(Some(channel));
        }

        let record: Option<ChannelRecord> =
            get_json(self.inner.records.as_ref(), &channel_record_key(id)).await?;
        let Some(record) = record else {
            return Ok(None);
        };

        let channel = Channel {
            event_wallet_id: id.clone(),
            channel_id: record.channel_id,
            owner: record.owner,
            status: ChannelStatus::Pending,
            created_at: current_time_millis(),
            session_id: None,
        };
        tracing::info!(%id, channel_id = ?channel.channel_id, "Recovered channel, pending confirmation");
        self.inner.channels.insert(id.clone(), channel.clone());
        if let Some(store) = self.inner.channel_store() {
            log_store_failure(id, store.update_channel_status(id, ChannelStatus::Pending).await);
        }

        Ok(Some(channel))
    }

    /// Confirm every `pending` channel against the node; returns how many opened
    pub async fn reconcile_pending(&self) -> Result<usize, ChannelError> {
        let pending: Vec<Channel> = self
            .inner
            .channels
            .iter()
            .filter(|c| c.status == ChannelStatus::Pending)
            .map(|c| c.value().clone())
            .collect();

        let mut opened = 0;
        for channel in pending {
            if self.inner.confirm_pending(&channel).await? == ChannelStatus::Open {
                opened += 1;
            }
        }
        Ok(opened)
    }

    /// Channels the node knows for `owner`
    pub async fn list_remote_channels(&self, owner: Address) -> Result<Vec<ChannelInfo>, ChannelError> {
        Ok(self.inner.list_remote_channels(owner).await?)
    }

    /// Record a `bu` push; returns the wallets whose balances changed.
    ///
    /// A balance update concerns the authenticated participant, so it
    /// applies to every channel this manager tracks.
    pub async fn apply_balance_push(&self, push: &PushMessage) -> Vec<EventWalletId> {
        if push.rpc_method() != Some(RpcMethod::BalanceUpdate) {
            return Vec::new();
        }

        let body = match &push.payload {
            serde_json::Value::Array(items) => items.first().cloned(),
            other => Some(other.clone()),
        };
        let balances: Vec<AssetBalance> = match body.map(serde_json::from_value::<BalancesPayload>) {
            Some(Ok(payload)) => payload.into_balances().into_iter().map(AssetBalance::from).collect(),
            Some(Err(e)) => {
                tracing::warn!("Malformed balance update: {}", e);
                return Vec::new();
            }
            None => return Vec::new(),
        };

        let ids: Vec<EventWalletId> = self.inner.channels.iter().map(|c| c.key().clone()).collect();
        for id in &ids {
            self.record_balances(id, balances.clone()).await;
        }
        ids
    }

    /// Snapshot of one channel
    pub fn channel(&self, id: &EventWalletId) -> Option<Channel> {
        self.inner.channels.get(id).map(|c| c.value().clone())
    }

    /// Snapshot of every channel
    pub fn channels(&self) -> Vec<Channel> {
        self.inner.channels.iter().map(|c| c.value().clone()).collect()
    }

    /// Snapshot of one session
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.inner.sessions.get(session_id).map(|s| s.value().clone())
    }

    /// Last balances the node reported for `id`
    pub fn last_known_balance(&self, id: &EventWalletId) -> Option<Vec<AssetBalance>> {
        self.inner.balances.get(id).map(|b| b.value().clone())
    }

    /// Apply `next` to a session's status under its map lock
    fn set_session_status(
        &self,
        session_id: &str,
        next: impl FnOnce(SessionStatus) -> Result<SessionStatus, StateError>,
    ) -> Result<Session, StateError> {
        let mut session = self
            .inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StateError::UnknownSession(session_id.to_string()))?;
        session.status = next(session.status)?;
        session.updated_at = current_time_millis();
        Ok(session.clone())
    }

    async fn session_balances(&self, session_id: &str) -> Result<Vec<AssetBalance>, ClientError> {
        let params = GetLedgerBalancesParams {
            participant: session_id.to_string(),
        };
        let payload: BalancesPayload = self
            .inner
            .client
            .call(RpcMethod::GetLedgerBalances, &params)
            .await?;
        Ok(payload.into_balances().into_iter().map(AssetBalance::from).collect())
    }

    async fn record_balances(&self, id: &EventWalletId, balances: Vec<AssetBalance>) {
        if let Some(store) = self.inner.channel_store() {
            log_store_failure(id, store.update_offchain_balance(id, &balances).await);
        }
        self.inner.balances.insert(id.clone(), balances);
    }
}

impl Inner {
    /// Any failure leaves the channel `failed` and is returned to the caller
    async fn open_channel(&self, id: &EventWalletId, owner: Address) -> Result<Channel, ChannelError> {
        let existing = self.channels.get(id).map(|c| c.value().clone());
        if let Some(channel) = existing.as_ref().filter(|c| c.status == ChannelStatus::Open) {
            return Ok(channel.clone());
        }

        match self.try_open_channel(id, owner, existing.as_ref()).await {
            Ok(channel) => Ok(channel),
            Err(e) => {
                tracing::warn!(%id, "Channel creation failed: {}", e);
                self.mark_failed(id, owner, existing.as_ref()).await;
                Err(e)
            }
        }
    }

    async fn try_open_channel(
        &self,
        id: &EventWalletId,
        owner: Address,
        existing: Option<&Channel>,
    ) -> Result<Channel, ChannelError> {
        // Ride out a reconnect in progress instead of failing at once
        self.client
            .wait_connected(self.client.request_timeout())
            .await?;

        // A channel the node may already have is confirmed, never re-created
        if let Some(channel) =
            existing.filter(|c| c.status == ChannelStatus::Pending || c.channel_id.is_some())
        {
            match self.confirm_pending(channel).await? {
                ChannelStatus::Open => {
                    if let Some(confirmed) = self.channels.get(id) {
                        return Ok(confirmed.value().clone());
                    }
                }
                ChannelStatus::Pending => {
                    tracing::info!(
                        %id,
                        channel_id = ?channel.channel_id,
                        "Channel known to node but not open yet"
                    );
                    return Ok(self
                        .channels
                        .get(id)
                        .map(|c| c.value().clone())
                        .unwrap_or_else(|| channel.clone()));
                }
                // Unknown to the node
                ChannelStatus::Connecting | ChannelStatus::Failed => {}
            }
        }

        let channel = Channel {
            event_wallet_id: id.clone(),
            channel_id: None,
            owner,
            status: ChannelStatus::Connecting,
            created_at: existing.map(|c| c.created_at).unwrap_or_else(current_time_millis),
            session_id: None,
        };
        self.channels.insert(id.clone(), channel.clone());
        if let Some(store) = self.channel_store() {
            log_store_failure(id, store.initialize_channel(id, &owner).await);
        }

        tracing::info!(%id, %owner, "Creating channel");
        let params = CreateChannelParams {
            chain_id: self.defaults.chain_id,
            token: self.defaults.token.clone(),
            amount: "0".to_string(),
            session_key: self.client.address().to_hex(),
        };
        let result: CreateChannelResult = self.client.call(RpcMethod::CreateChannel, &params).await?;

        let channel = Channel {
            channel_id: Some(result.channel_id.clone()),
            status: ChannelStatus::Open,
            ..channel
        };
        self.channels.insert(id.clone(), channel.clone());
        if let Some(store) = self.channel_store() {
            log_store_failure(id, store.confirm_channel(id, &result.channel_id).await);
        }
        if let Err(e) =
            put_json(self.records.as_ref(), &channel_record_key(id), &ChannelRecord::from(&channel)).await
        {
            tracing::warn!(%id, "Failed to persist channel record: {}", e);
        }
        tracing::info!(%id, channel_id = %result.channel_id, "Channel open");
        Ok(channel)
    }

    /// Record a failed attempt, keeping whatever identity the channel had
    async fn mark_failed(&self, id: &EventWalletId, owner: Address, existing: Option<&Channel>) {
        let created = match self.channels.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().status = ChannelStatus::Failed;
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(Channel {
                    event_wallet_id: id.clone(),
                    channel_id: None,
                    owner,
                    status: ChannelStatus::Failed,
                    created_at: existing.map(|c| c.created_at).unwrap_or_else(current_time_millis),
                    session_id: None,
                });
                true
            }
        };

        if let Some(store) = self.channel_store() {
            if created {
                log_store_failure(id, store.initialize_channel(id, &owner).await);
            }
            log_store_failure(id, store.update_channel_status(id, ChannelStatus::Failed).await);
        }
    }

    /// Settle a pending channel's status from the node's channel list
    async fn confirm_pending(&self, channel: &Channel) -> Result<ChannelStatus, ChannelError> {
        let id = &channel.event_wallet_id;
        let remote = self.list_remote_channels(channel.owner).await?;

        let matched = remote.iter().find(|info| match &channel.channel_id {
            Some(channel_id) => info.channel_id.eq_ignore_ascii_case(channel_id),
            None => info.status.eq_ignore_ascii_case("open"),
        });

        let (status, channel_id) = match matched {
            Some(info) if info.status.eq_ignore_ascii_case("open") => {
                (ChannelStatus::Open, Some(info.channel_id.clone()))
            }
            // Known to the node but not open yet
            Some(_) => return Ok(ChannelStatus::Pending),
            None => (ChannelStatus::Failed, None),
        };

        if let Some(mut stored) = self.channels.get_mut(id) {
            stored.status = status;
            if channel_id.is_some() {
                stored.channel_id = channel_id.clone();
            }
        }

        let store = self.channel_store();
        match &channel_id {
            Some(channel_id) => {
                tracing::info!(%id, %channel_id, "Pending channel confirmed open");
                if let Some(store) = store {
                    log_store_failure(id, store.confirm_channel(id, channel_id).await);
                }
            }
            None => {
                tracing::warn!(%id, "Pending channel unknown to node, marking failed");
                if let Some(store) = store {
                    log_store_failure(id, store.update_channel_status(id, status).await);
                }
            }
        }

        Ok(status)
    }

    async fn list_remote_channels(&self, owner: Address) -> Result<Vec<ChannelInfo>, ClientError> {
        let params = GetChannelsParams {
            participant: owner.to_hex(),
            status: None,
        };
        let result: ChannelsResult = self.client.call(RpcMethod::GetChannels, &params).await?;
        Ok(result.into_channels())
    }

    fn channel_store(&self) -> Option<&dyn ChannelStore> {
        self.channel_store.as_deref()
    }
}

/// Whether a failed close may still have reached the node
fn close_outcome_unknown(error: &ClientError) -> bool {
    matches!(
        error,
        ClientError::Timeout { .. }
            | ClientError::ConnectionClosed
            | ClientError::Transport(TransportError::Closed(_))
    )
}

fn log_store_failure(id: &EventWalletId, result: Result<(), StoreError>) {
    if let Err(e) = result {
        tracing::warn!(%id, "Channel store update failed: {}", e);
    }
}
