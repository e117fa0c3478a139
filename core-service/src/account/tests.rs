use std::time::Duration;

use bridge_traits::{
    label_ids, BridgeError, EventAction, FixedSystemMemory, LabelEvent, RemoteEvent, Update,
};
use core_runtime::events::Receiver;
use core_sync::status::sync_state_path;
use tempfile::TempDir;

use super::*;
use crate::testing::{
    account_events, folder, metadata, system_labels, FakeCursor, FakeRegistry, Harness,
};

struct Running {
    service: AccountService,
    task: JoinHandle<Result<()>>,
    token: CancellationToken,
    registry: Arc<FakeRegistry>,
    cursor: Arc<FakeCursor>,
    events: Receiver<CoreEvent>,
    remote: mpsc::Sender<RemoteEvent>,
    server_created: mpsc::Sender<()>,
    _dir: TempDir,
}

async fn start(h: &Harness, mode: AddressMode, synced: bool) -> anyhow::Result<Running> {
    start_with(h, mode, synced, Arc::new(FakeRegistry::default())).await
}

async fn start_with(
    h: &Harness,
    mode: AddressMode,
    synced: bool,
    registry: Arc<FakeRegistry>,
) -> anyhow::Result<Running> {
    let dir = tempfile::tempdir()?;
    if synced {
        let state = FileSyncState::load(sync_state_path(dir.path(), "user-1")).await?;
        state.set_has_labels(true).await?;
        state.set_has_messages(true).await?;
    }

    let telemetry: Arc<dyn Telemetry> = h.telemetry.clone();
    let config = BridgeConfig::builder()
        .sync_config_dir(dir.path())
        .system_memory(Arc::new(FixedSystemMemory(8 << 30)))
        .telemetry(telemetry)
        .retry_cooldown(Duration::from_millis(10))
        .address_mode(mode)
        .build()?;

    let cursor = Arc::new(FakeCursor::default());
    let bus = EventBus::new(256);
    let events = bus.subscribe();
    let deps = AccountDeps {
        api: h.api.clone(),
        crypto: h.crypto.clone(),
        registry: registry.clone(),
        cursor: cursor.clone(),
        events: bus,
    };

    let (remote, remote_events) = mpsc::channel(4);
    let (server_created, server_created_rx) = mpsc::channel(1);
    let inputs = AccountInputs {
        remote_events,
        server_created: server_created_rx,
    };

    let token = CancellationToken::new();
    let (service, task) =
        AccountService::start(&config, h.identity.clone(), deps, inputs, "event-1", token.clone())
            .await?;

    Ok(Running {
        service,
        task,
        token,
        registry,
        cursor,
        events,
        remote,
        server_created,
        _dir: dir,
    })
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn labels() -> Vec<bridge_traits::RemoteLabel> {
    let mut labels = system_labels();
    labels.push(folder("f1", &["Work"]));
    labels
}

#[tokio::test]
async fn test_start_registers_primary_and_rewinds_after_sync() -> anyhow::Result<()> {
    let h = Harness::new(&["a1", "a2"], labels());
    let running = start(&h, AddressMode::Combined, true).await?;

    assert_eq!(running.registry.added(), vec!["a1"]);

    let cursor = running.cursor.clone();
    eventually(|| !cursor.rewinds().is_empty()).await;
    assert_eq!(cursor.rewinds(), vec!["event-1"]);

    let kinds = running.registry.log.kinds("a1");
    assert!(kinds.contains(&"MailboxCreated"));
    assert!(!kinds.contains(&"MessagesCreated"));

    running.token.cancel();
    running.task.await??;
    Ok(())
}

#[tokio::test]
async fn test_full_sync_imports_every_message() -> anyhow::Result<()> {
    let h = Harness::new(&["a1"], labels());
    for id in ["m1", "m2", "m3"] {
        h.api.put_message(metadata(id, "a1", &[label_ids::INBOX, "f1"]));
    }
    let running = start(&h, AddressMode::Combined, false).await?;

    let cursor = running.cursor.clone();
    eventually(|| !cursor.rewinds().is_empty()).await;

    let mut imported: Vec<String> = running
        .registry
        .log
        .for_address("a1")
        .into_iter()
        .filter_map(|update| match update {
            Update::MessagesCreated { messages, .. } => Some(messages),
            _ => None,
        })
        .flatten()
        .map(|created| created.message.id)
        .collect();
    imported.sort();
    assert_eq!(imported, vec!["m1", "m2", "m3"]);

    running.token.cancel();
    running.task.await??;
    Ok(())
}

#[tokio::test]
async fn test_control_requests() -> anyhow::Result<()> {
    let h = Harness::new(&["a1"], labels());
    let running = start(&h, AddressMode::Combined, true).await?;

    let labels = running.service.get_labels().await?;
    assert!(labels.contains_key("f1"));
    assert!(running.service.get_sync_failed_message_ids().await?.is_empty());

    running.service.show_all_mail(true).await?;
    running.service.on_logout().await?;
    assert_eq!(running.registry.removed(), vec![("a1".to_string(), false)]);

    running.service.on_bad_event_resync().await?;
    assert_eq!(running.registry.added(), vec!["a1", "a1"]);

    running.token.cancel();
    running.task.await??;
    Ok(())
}

#[tokio::test]
async fn test_switching_to_split_mode_rebuilds_connectors() -> anyhow::Result<()> {
    let h = Harness::new(&["a1", "a2"], labels());
    let mut running = start(&h, AddressMode::Combined, true).await?;

    running.service.set_address_mode(AddressMode::Combined).await?;
    assert!(running.registry.removed().is_empty());

    running.service.set_address_mode(AddressMode::Split).await?;

    assert_eq!(running.registry.removed(), vec![("a1".to_string(), true)]);
    assert_eq!(running.registry.added(), vec!["a1", "a1", "a2"]);
    assert!(account_events(&mut running.events).contains(&AccountEvent::AddressModeChanged {
        user_id: "user-1".into(),
        split: true,
    }));

    running.token.cancel();
    running.task.await??;
    Ok(())
}

#[tokio::test]
async fn test_refresh_event_starts_over() -> anyhow::Result<()> {
    let h = Harness::new(&["a1"], labels());
    let mut running = start(&h, AddressMode::Combined, true).await?;

    let refresh = RemoteEvent {
        event_id: "event-2".into(),
        refresh: true,
        ..RemoteEvent::default()
    };
    running.remote.send(refresh).await?;

    let registry = running.registry.clone();
    eventually(|| registry.added().len() == 2).await;
    assert_eq!(registry.removed(), vec![("a1".to_string(), true)]);

    let cursor = running.cursor.clone();
    eventually(|| cursor.rewinds().contains(&"event-2".to_string())).await;
    assert!(account_events(&mut running.events).contains(&AccountEvent::Refreshed {
        user_id: "user-1".into(),
    }));

    running.token.cancel();
    running.task.await??;
    Ok(())
}

#[tokio::test]
async fn test_live_label_event_after_sync() -> anyhow::Result<()> {
    let h = Harness::new(&["a1"], labels());
    let running = start(&h, AddressMode::Combined, true).await?;

    let cursor = running.cursor.clone();
    eventually(|| !cursor.rewinds().is_empty()).await;
    running.registry.log.clear();

    let event = RemoteEvent {
        event_id: "event-2".into(),
        labels: vec![LabelEvent {
            id: "f1".into(),
            action: EventAction::Delete,
            label: None,
        }],
        ..RemoteEvent::default()
    };
    running.remote.send(event).await?;

    let registry = running.registry.clone();
    eventually(|| registry.log.kinds("a1") == vec!["MailboxDeleted"]).await;
    assert!(!running.service.get_labels().await?.contains_key("f1"));

    running.token.cancel();
    running.task.await??;
    Ok(())
}

#[tokio::test]
async fn test_server_created_reregisters_connectors() -> anyhow::Result<()> {
    let h = Harness::new(&["a1"], labels());
    let running = start(&h, AddressMode::Combined, true).await?;

    running.server_created.send(()).await?;

    let registry = running.registry.clone();
    eventually(|| registry.added().len() == 2).await;

    running.token.cancel();
    running.task.await??;
    Ok(())
}

#[tokio::test]
async fn test_start_fails_when_server_refuses_connectors() -> anyhow::Result<()> {
    let h = Harness::new(&["a1"], labels());
    let registry = Arc::new(FakeRegistry::default());
    registry.reject_adds();

    let err = start_with(&h, AddressMode::Combined, true, registry.clone())
        .await
        .err()
        .expect("start should fail");
    assert!(err.to_string().contains("server refused connector a1"));
    assert!(registry.added().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_bad_event_resync_reports_registration_failure() -> anyhow::Result<()> {
    let h = Harness::new(&["a1"], labels());
    let running = start(&h, AddressMode::Combined, true).await?;
    running.service.on_logout().await?;

    running.registry.reject_adds();
    let err = running.service.on_bad_event_resync().await.unwrap_err();
    assert!(matches!(err, ServiceError::Bridge(BridgeError::OperationFailed(_))));
    assert_eq!(running.registry.added(), vec!["a1"]);

    running.registry.accept_adds();
    running.service.on_bad_event_resync().await?;
    assert_eq!(running.registry.added(), vec!["a1", "a1"]);

    running.token.cancel();
    running.task.await??;
    Ok(())
}

#[tokio::test]
async fn test_split_switch_fails_when_server_refuses_connectors() -> anyhow::Result<()> {
    let h = Harness::new(&["a1", "a2"], labels());
    let mut running = start(&h, AddressMode::Combined, true).await?;
    account_events(&mut running.events);

    running.registry.reject_adds();
    assert!(running.service.set_address_mode(AddressMode::Split).await.is_err());

    assert_eq!(running.registry.added(), vec!["a1"]);
    assert!(!account_events(&mut running.events)
        .iter()
        .any(|event| matches!(event, AccountEvent::AddressModeChanged { .. })));

    running.token.cancel();
    running.task.await??;
    Ok(())
}

#[tokio::test]
async fn test_refresh_stops_account_when_server_refuses_connectors() -> anyhow::Result<()> {
    let h = Harness::new(&["a1"], labels());
    let mut running = start(&h, AddressMode::Combined, true).await?;

    running.registry.reject_adds();
    let refresh = RemoteEvent {
        event_id: "event-2".into(),
        refresh: true,
        ..RemoteEvent::default()
    };
    running.remote.send(refresh).await?;

    assert!(running.task.await?.is_err());
    assert!(!account_events(&mut running.events).contains(&AccountEvent::Refreshed {
        user_id: "user-1".into(),
    }));
    Ok(())
}

#[tokio::test]
async fn test_handle_fails_after_stop() -> anyhow::Result<()> {
    let h = Harness::new(&["a1"], labels());
    let running = start(&h, AddressMode::Combined, true).await?;

    running.token.cancel();
    running.task.await??;

    let err = running.service.resume_sync().await.unwrap_err();
    assert!(matches!(err, ServiceError::ServiceStopped));
    Ok(())
}
