//! Channel and session lifecycle against a scripted node

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{test_config, Harness, MockNode, STEP_TIMEOUT};
use ew_client::channel::{channel_record_key, ChannelRecord};
use ew_client::{
    ChannelError, ChannelManager, ClientConfig, ClientError, SessionCoordinator, StateError,
};
use ew_core::config::ChannelDefaults;
use ew_core::store::MemoryChannelStore;
use ew_core::traits::{get_json, put_json};
use ew_core::{
    Address, AssetBalance, ChannelStatus, ConnectionState, EventWalletId, SessionStatus,
};

struct Fixture {
    harness: Harness,
    node: MockNode,
    manager: ChannelManager,
    rows: Arc<MemoryChannelStore>,
}

async fn fixture() -> Fixture {
    fixture_with(test_config()).await
}

async fn fixture_with(config: ClientConfig) -> Fixture {
    let mut harness = Harness::new(config);
    let node = harness.connect().await;
    let rows = Arc::new(MemoryChannelStore::new());
    let manager = ChannelManager::with_channel_store(
        harness.client.clone(),
        ChannelDefaults::default(),
        harness.store.clone(),
        rows.clone(),
    );
    Fixture {
        harness,
        node,
        manager,
        rows,
    }
}

fn owner() -> Address {
    Address::from_bytes([0x11; 20])
}

fn vendor() -> Address {
    Address::from_bytes([0x22; 20])
}

/// Persist a channel record for `id` and recover it as `pending`
async fn recover_recorded(fx: &Fixture, id: &EventWalletId, channel_id: &str) {
    let record = ChannelRecord {
        event_wallet_id: id.clone(),
        owner: owner(),
        channel_id: Some(channel_id.into()),
    };
    put_json(fx.harness.store.as_ref(), &channel_record_key(id), &record)
        .await
        .unwrap();
    let channel = fx.manager.recover(id).await.unwrap().unwrap();
    assert_eq!(channel.status, ChannelStatus::Pending);
}

/// Wait until the client reports `state`
async fn wait_for_state(fx: &Fixture, state: ConnectionState) {
    let mut states = fx.harness.client.subscribe_state();
    tokio::time::timeout(STEP_TIMEOUT, states.wait_for(|s| *s == state))
        .await
        .unwrap()
        .unwrap();
}

/// Open a channel for `id`, answering the node side
async fn open_channel(fx: &mut Fixture, id: &EventWalletId, channel_id: &str) {
    let manager = fx.manager.clone();
    let wallet = id.clone();
    let task = tokio::spawn(async move { manager.create_channel(&wallet, owner()).await });

    let request = fx.node.next_request().await;
    assert_eq!(request.method, "create_channel");
    fx.node
        .respond(&request, "create_channel", json!({"channel_id": channel_id}))
        .await;

    let channel = task.await.unwrap().unwrap();
    assert_eq!(channel.status, ChannelStatus::Open);
}

/// Open a session funded with `amount`, answering the node side
async fn open_session(fx: &mut Fixture, id: &EventWalletId, session_id: &str, amount: &str) {
    let manager = fx.manager.clone();
    let wallet = id.clone();
    let funded = amount.to_string();
    let task =
        tokio::spawn(async move { manager.create_session(&wallet, vendor(), &funded).await });

    let request = fx.node.next_request().await;
    assert_eq!(request.method, "create_app_session");
    fx.node
        .respond(
            &request,
            "create_app_session",
            json!({"app_session_id": session_id, "status": "open"}),
        )
        .await;

    let balances = fx.node.next_request().await;
    assert_eq!(balances.method, "get_ledger_balances");
    assert_eq!(balances.params[0]["participant"], session_id);
    fx.node
        .respond(
            &balances,
            "get_ledger_balances",
            json!({"ledger_balances": [{"asset": "usdc", "amount": amount}]}),
        )
        .await;

    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_concurrent_creation_sends_one_request() {
    let mut fx = fixture().await;
    let id = EventWalletId::new("attendee-1");

    let first = {
        let manager = fx.manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.create_channel(&id, owner()).await })
    };
    let second = {
        let manager = fx.manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.create_channel(&id, owner()).await })
    };

    let request = fx.node.next_request().await;
    assert_eq!(request.method, "create_channel");
    assert_eq!(request.params[0]["chain_id"], 137);
    assert_eq!(request.params[0]["amount"], "0");
    assert_eq!(
        request.params[0]["session_key"],
        fx.harness.session.address().to_hex()
    );
    fx.node
        .respond(&request, "create_channel", json!({"channel_id": "0xchan"}))
        .await;

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(first.channel_id.as_deref(), Some("0xchan"));
    assert!(!fx.node.has_unread());

    // Already open: answered locally
    let again = fx.manager.create_channel(&id, owner()).await.unwrap();
    assert_eq!(again.channel_id.as_deref(), Some("0xchan"));
    assert!(!fx.node.has_unread());

    let row = fx.rows.row(&id).unwrap();
    assert_eq!(row.status, ChannelStatus::Open);
    assert_eq!(row.owner, Some(owner()));
    assert_eq!(row.channel_id.as_deref(), Some("0xchan"));

    let record: ChannelRecord = get_json(fx.harness.store.as_ref(), &channel_record_key(&id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.owner, owner());
    assert_eq!(record.channel_id.as_deref(), Some("0xchan"));
}

#[tokio::test]
async fn test_failed_creation_marks_channel_and_allows_retry() {
    let mut fx = fixture().await;
    let id = EventWalletId::new("attendee-2");

    let task = {
        let manager = fx.manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.create_channel(&id, owner()).await })
    };
    let request = fx.node.next_request().await;
    fx.node.error(&request, "channel_error", "chain unavailable").await;

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        ChannelError::Client(ClientError::Protocol { .. })
    ));
    assert_eq!(fx.manager.channel(&id).unwrap().status, ChannelStatus::Failed);
    assert_eq!(fx.rows.row(&id).unwrap().status, ChannelStatus::Failed);

    open_channel(&mut fx, &id, "0xretry").await;
    let channel = fx.manager.channel(&id).unwrap();
    assert_eq!(channel.status, ChannelStatus::Open);
    assert_eq!(channel.channel_id.as_deref(), Some("0xretry"));
}

#[tokio::test]
async fn test_session_requires_open_channel() {
    let fx = fixture().await;
    let id = EventWalletId::new("nobody");

    let err = fx.manager.create_session(&id, vendor(), "10").await.unwrap_err();
    assert!(matches!(err, ChannelError::State(StateError::UnknownChannel(_))));
    assert!(fx.manager.get_balance(&id).await.unwrap_err().is_state_error());
}

#[tokio::test]
async fn test_session_lifecycle() {
    let mut fx = fixture().await;
    let id = EventWalletId::new("attendee-3");
    open_channel(&mut fx, &id, "0xchan").await;

    let task = {
        let manager = fx.manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.create_session(&id, vendor(), "50").await })
    };

    let request = fx.node.next_request().await;
    assert_eq!(request.method, "create_app_session");
    let params = &request.params[0];
    assert_eq!(params["definition"]["protocol"], "NitroRPC/0.2");
    assert_eq!(
        params["definition"]["participants"],
        json!([owner().to_hex(), vendor().to_hex()])
    );
    assert_eq!(params["definition"]["weights"], json!([100, 0]));
    assert_eq!(params["definition"]["quorum"], 100);
    assert_eq!(params["allocations"][0]["amount"], "50");
    assert_eq!(params["allocations"][0]["asset"], "usdc");
    assert_eq!(params["allocations"][1]["amount"], "0");
    fx.node
        .respond(
            &request,
            "create_app_session",
            json!({"app_session_id": "0xsess", "status": "open"}),
        )
        .await;

    let balances = fx.node.next_request().await;
    assert_eq!(balances.params[0]["participant"], "0xsess");
    fx.node
        .respond(
            &balances,
            "get_ledger_balances",
            json!({"ledger_balances": [{"asset": "USDC", "amount": "50.0"}]}),
        )
        .await;

    let session = task.await.unwrap().unwrap();
    assert_eq!(session.session_id, "0xsess");
    assert_eq!(session.status, SessionStatus::Open);
    assert_eq!(session.balance.as_deref(), Some("50.0"));
    assert_eq!(session.counterparty, Some(vendor()));
    assert_eq!(
        fx.manager.channel(&id).unwrap().session_id.as_deref(),
        Some("0xsess")
    );

    let task = {
        let manager = fx.manager.clone();
        tokio::spawn(async move {
            manager
                .transfer_and_close("0xsess", vendor(), "12.5", Some("coffee".into()))
                .await
        })
    };

    let close = fx.node.next_request().await;
    assert_eq!(close.method, "close_app_session");
    assert_eq!(close.params[0]["app_session_id"], "0xsess");
    assert_eq!(
        close.params[0]["allocations"],
        json!([{"participant": vendor().to_hex(), "asset": "usdc", "amount": "12.5"}])
    );
    assert_eq!(close.params[0]["session_data"], "coffee");
    assert_eq!(fx.manager.session("0xsess").unwrap().status, SessionStatus::Settling);
    fx.node
        .respond(
            &close,
            "close_app_session",
            json!({"app_session_id": "0xsess", "status": "closed"}),
        )
        .await;

    let closed = task.await.unwrap().unwrap();
    assert_eq!(closed.status, SessionStatus::Closed);

    // Closed sessions are rejected locally
    let err = fx
        .manager
        .transfer_and_close("0xsess", vendor(), "1", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ChannelError::State(StateError::SessionNotOpen {
            status: SessionStatus::Closed,
            ..
        })
    ));
    assert!(!fx.node.has_unread());
}

#[tokio::test]
async fn test_rejected_close_reopens_session() {
    let mut fx = fixture().await;
    let id = EventWalletId::new("attendee-4");
    open_channel(&mut fx, &id, "0xchan").await;
    open_session(&mut fx, &id, "0xsess", "20").await;

    let task = {
        let manager = fx.manager.clone();
        tokio::spawn(async move {
            manager
                .transfer_and_close("0xsess", vendor(), "25", None)
                .await
        })
    };
    let close = fx.node.next_request().await;
    assert!(close.params[0].get("session_data").is_none());
    fx.node.error(&close, "insufficient_funds", "allocation exceeds balance").await;

    let err = task.await.unwrap().unwrap_err();
    assert!(!err.is_state_error());
    assert_eq!(fx.manager.session("0xsess").unwrap().status, SessionStatus::Open);
}

#[tokio::test]
async fn test_close_while_disconnected_reopens_session() {
    let mut fx = fixture().await;
    let id = EventWalletId::new("attendee-8");
    open_channel(&mut fx, &id, "0xchan").await;
    open_session(&mut fx, &id, "0xsess", "20").await;

    fx.node.drop_connection().await;
    wait_for_state(&fx, ConnectionState::Disconnected).await;

    // Nothing was sent, so every attempt sees an open session
    for _ in 0..2 {
        let err = fx
            .manager
            .transfer_and_close("0xsess", vendor(), "5", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Client(ClientError::NotConnected)));
        assert_eq!(fx.manager.session("0xsess").unwrap().status, SessionStatus::Open);
    }
}

#[tokio::test]
async fn test_unanswered_close_settles_through_reconcile() {
    let mut config = test_config();
    config.request_timeout = Duration::from_millis(200);
    let mut fx = fixture_with(config).await;
    let id = EventWalletId::new("attendee-9");
    open_channel(&mut fx, &id, "0xchan").await;
    open_session(&mut fx, &id, "0xsess", "20").await;

    let task = {
        let manager = fx.manager.clone();
        tokio::spawn(async move {
            manager
                .transfer_and_close("0xsess", vendor(), "5", None)
                .await
        })
    };
    let close = fx.node.next_request().await;
    assert_eq!(close.method, "close_app_session");

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, ChannelError::Client(ClientError::Timeout { .. })));
    assert_eq!(fx.manager.session("0xsess").unwrap().status, SessionStatus::Settling);

    let err = fx
        .manager
        .transfer_and_close("0xsess", vendor(), "5", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ChannelError::State(StateError::SessionNotOpen {
            status: SessionStatus::Settling,
            ..
        })
    ));

    // Not listed yet: stays settling
    let task = {
        let manager = fx.manager.clone();
        tokio::spawn(async move { manager.reconcile_session("0xsess").await })
    };
    let query = fx.node.next_request().await;
    assert_eq!(query.method, "get_app_sessions");
    assert_eq!(query.params[0]["participant"], owner().to_hex());
    fx.node
        .respond(&query, "get_app_sessions", json!({"app_sessions": []}))
        .await;
    assert_eq!(task.await.unwrap().unwrap().status, SessionStatus::Settling);

    let task = {
        let manager = fx.manager.clone();
        tokio::spawn(async move { manager.reconcile_settling().await })
    };
    let query = fx.node.next_request().await;
    fx.node
        .respond(
            &query,
            "get_app_sessions",
            json!([{"app_session_id": "0xSESS", "status": "closed"}]),
        )
        .await;
    assert_eq!(task.await.unwrap().unwrap(), 1);
    assert_eq!(fx.manager.session("0xsess").unwrap().status, SessionStatus::Closed);

    // Resolved sessions are answered locally
    let session = fx.manager.reconcile_session("0xsess").await.unwrap();
    assert_eq!(session.status, SessionStatus::Closed);
    assert!(!fx.node.has_unread());
}

#[tokio::test]
async fn test_unknown_session_is_state_error() {
    let fx = fixture().await;
    let err = fx
        .manager
        .transfer_and_close("0xmissing", vendor(), "1", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::State(StateError::UnknownSession(_))));
}

#[tokio::test]
async fn test_get_balance_reports_node_values() {
    let mut fx = fixture().await;
    let id = EventWalletId::new("attendee-5");
    open_channel(&mut fx, &id, "0xchan").await;

    let task = {
        let manager = fx.manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.get_balance(&id).await })
    };
    let request = fx.node.next_request().await;
    assert_eq!(request.method, "get_ledger_balances");
    assert_eq!(request.params[0]["participant"], owner().to_hex());
    fx.node
        .respond(
            &request,
            "get_ledger_balances",
            json!({"ledger_balances": [
                {"asset": "usdc", "amount": "10.000001"},
                {"asset": "eth", "amount": "0"}
            ]}),
        )
        .await;

    let balances = task.await.unwrap().unwrap();
    assert_eq!(
        balances,
        vec![
            AssetBalance {
                asset: "usdc".into(),
                amount: "10.000001".into()
            },
            AssetBalance {
                asset: "eth".into(),
                amount: "0".into()
            },
        ]
    );
    assert_eq!(fx.manager.last_known_balance(&id), Some(balances.clone()));
    assert_eq!(fx.rows.row(&id).unwrap().balances, balances);
}

#[tokio::test]
async fn test_recover_and_reconcile() {
    let mut fx = fixture().await;
    let open = EventWalletId::new("restored-open");
    let gone = EventWalletId::new("restored-gone");

    for (id, channel_id) in [(&open, "0xabc"), (&gone, "0xdef")] {
        let record = ChannelRecord {
            event_wallet_id: id.clone(),
            owner: owner(),
            channel_id: Some(channel_id.into()),
        };
        put_json(fx.harness.store.as_ref(), &channel_record_key(id), &record)
            .await
            .unwrap();
    }

    let recovered = fx.manager.recover(&open).await.unwrap().unwrap();
    assert_eq!(recovered.status, ChannelStatus::Pending);
    assert_eq!(recovered.channel_id.as_deref(), Some("0xabc"));
    fx.manager.recover(&gone).await.unwrap().unwrap();
    assert!(fx
        .manager
        .recover(&EventWalletId::new("never-seen"))
        .await
        .unwrap()
        .is_none());

    let task = {
        let manager = fx.manager.clone();
        tokio::spawn(async move { manager.reconcile_pending().await })
    };
    for _ in 0..2 {
        let request = fx.node.next_request().await;
        assert_eq!(request.method, "get_channels");
        assert_eq!(request.params[0]["participant"], owner().to_hex());
        fx.node
            .respond(
                &request,
                "get_channels",
                json!({"channels": [{"channel_id": "0xABC", "status": "open"}]}),
            )
            .await;
    }

    assert_eq!(task.await.unwrap().unwrap(), 1);
    assert_eq!(fx.manager.channel(&open).unwrap().status, ChannelStatus::Open);
    assert_eq!(fx.manager.channel(&gone).unwrap().status, ChannelStatus::Failed);
    assert_eq!(fx.rows.row(&open).unwrap().status, ChannelStatus::Open);
    assert_eq!(fx.rows.row(&gone).unwrap().status, ChannelStatus::Failed);
}

#[tokio::test]
async fn test_rejoining_attendee_confirms_recorded_channel() {
    let mut fx = fixture().await;
    let id = EventWalletId::new("attendee-6");
    let record = ChannelRecord {
        event_wallet_id: id.clone(),
        owner: owner(),
        channel_id: Some("0xabc".into()),
    };
    put_json(fx.harness.store.as_ref(), &channel_record_key(&id), &record)
        .await
        .unwrap();

    let coordinator = SessionCoordinator::new(fx.manager.clone());
    let task = {
        let coordinator = coordinator.clone();
        let id = id.clone();
        tokio::spawn(async move { coordinator.on_attendee_joined(&id, owner()).await })
    };

    let request = fx.node.next_request().await;
    assert_eq!(request.method, "get_channels");
    fx.node
        .respond(
            &request,
            "get_channels",
            json!([{"channel_id": "0xabc", "status": "open"}]),
        )
        .await;

    let channel = task.await.unwrap().unwrap();
    assert_eq!(channel.status, ChannelStatus::Open);
    assert_eq!(channel.channel_id.as_deref(), Some("0xabc"));
    assert!(!fx.node.has_unread());
}

#[tokio::test]
async fn test_channel_not_yet_open_is_not_recreated() {
    let mut fx = fixture().await;
    let id = EventWalletId::new("attendee-10");
    recover_recorded(&fx, &id, "0xabc").await;

    let task = {
        let manager = fx.manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.create_channel(&id, owner()).await })
    };
    let request = fx.node.next_request().await;
    assert_eq!(request.method, "get_channels");
    fx.node
        .respond(
            &request,
            "get_channels",
            json!([{"channel_id": "0xabc", "status": "joining"}]),
        )
        .await;

    let channel = task.await.unwrap().unwrap();
    assert_eq!(channel.status, ChannelStatus::Pending);
    assert_eq!(channel.channel_id.as_deref(), Some("0xabc"));
    assert!(!fx.node.has_unread());
    assert_eq!(
        fx.manager.channel(&id).unwrap().channel_id.as_deref(),
        Some("0xabc")
    );
}

#[tokio::test]
async fn test_failed_confirmation_marks_channel_failed() {
    let mut fx = fixture().await;
    let id = EventWalletId::new("attendee-11");
    recover_recorded(&fx, &id, "0xabc").await;

    let task = {
        let manager = fx.manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.create_channel(&id, owner()).await })
    };
    let request = fx.node.next_request().await;
    assert_eq!(request.method, "get_channels");
    fx.node.error(&request, "unavailable", "ledger offline").await;

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        ChannelError::Client(ClientError::Protocol { .. })
    ));
    let channel = fx.manager.channel(&id).unwrap();
    assert_eq!(channel.status, ChannelStatus::Failed);
    assert_eq!(channel.channel_id.as_deref(), Some("0xabc"));
    assert_eq!(fx.rows.row(&id).unwrap().status, ChannelStatus::Failed);
    assert!(!fx.node.has_unread());

    // The retry confirms the recorded channel instead of creating another
    let task = {
        let manager = fx.manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.create_channel(&id, owner()).await })
    };
    let request = fx.node.next_request().await;
    assert_eq!(request.method, "get_channels");
    fx.node
        .respond(
            &request,
            "get_channels",
            json!([{"channel_id": "0xabc", "status": "open"}]),
        )
        .await;

    let channel = task.await.unwrap().unwrap();
    assert_eq!(channel.status, ChannelStatus::Open);
    assert_eq!(channel.channel_id.as_deref(), Some("0xabc"));
    assert!(!fx.node.has_unread());
}

#[tokio::test]
async fn test_create_channel_waits_out_reconnect() {
    let mut config = test_config();
    config.reconnect.enabled = true;
    let mut fx = fixture_with(config).await;
    let id = EventWalletId::new("attendee-12");

    let mut states = fx.harness.client.subscribe_state();
    fx.node.drop_connection().await;
    tokio::time::timeout(STEP_TIMEOUT, states.wait_for(|s| !s.is_connected()))
        .await
        .unwrap()
        .unwrap();

    let task = {
        let manager = fx.manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.create_channel(&id, owner()).await })
    };

    // The reconnect reuses the token from the first handshake
    let mut node = fx.harness.next_node().await;
    let verify = node.next_request().await;
    assert_eq!(verify.method, "auth_verify");
    assert!(!task.is_finished());
    node.respond(&verify, "auth_verify", json!({"success": true}))
        .await;

    let request = node.next_request().await;
    assert_eq!(request.method, "create_channel");
    node.respond(&request, "create_channel", json!({"channel_id": "0xlate"}))
        .await;

    let channel = task.await.unwrap().unwrap();
    assert_eq!(channel.status, ChannelStatus::Open);
    assert_eq!(channel.channel_id.as_deref(), Some("0xlate"));
    assert_eq!(fx.rows.row(&id).unwrap().status, ChannelStatus::Open);
}

#[tokio::test]
async fn test_coordinator_applies_balance_pushes() {
    let mut fx = fixture().await;
    let id = EventWalletId::new("attendee-7");
    open_channel(&mut fx, &id, "0xchan").await;

    let coordinator = SessionCoordinator::new(fx.manager.clone());
    let cancel = CancellationToken::new();
    let runner = tokio::spawn(coordinator.clone().run(cancel.clone()));
    tokio::task::yield_now().await;

    fx.node
        .push(
            "bu",
            json!({"balance_updates": [{"asset": "usdc", "amount": "7"}]}),
        )
        .await;

    let expected = vec![AssetBalance {
        asset: "usdc".into(),
        amount: "7".into(),
    }];
    tokio::time::timeout(STEP_TIMEOUT, async {
        while fx.manager.last_known_balance(&id).as_ref() != Some(&expected) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("balance push was not applied");

    // A failed refresh falls back to the pushed balance
    let task = {
        let coordinator = coordinator.clone();
        let id = id.clone();
        tokio::spawn(async move { coordinator.refresh_balance(&id).await })
    };
    let request = fx.node.next_request().await;
    fx.node.error(&request, "unavailable", "ledger offline").await;
    assert_eq!(task.await.unwrap(), Some(expected));

    cancel.cancel();
    tokio::time::timeout(STEP_TIMEOUT, runner)
        .await
        .unwrap()
        .unwrap();
}
