//! Hub and instance talking over an in-process stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use certfleet_challenge::{
    ChallengeMaterial, ChallengeRequest, ChallengeWorkflow, InMemoryChallengeStore,
    InMemoryRecordProvider, ManagedChallengeConfig, ManualRecordProvider, RecordProviders,
    IN_MEMORY_PROVIDER_ID, NO_MATCH_MESSAGE,
};
use certfleet_config::InstanceConfig;
use certfleet_fleet_protocol::{
    AgentCommandExecutor, AuthContext, CommandArgs, CommandDispatcher, CommandType,
    ConnectionRegistry, CorrelationTable, DispatcherConfig, FleetProtocolError, HubClient,
    HubClientConfig, HubServer, HubServerConfig, InstanceHandler, InstanceId, InstanceInfo,
    ItemHealth, LogItem, ManagedItem, SessionEnd, StoredCredential,
};
use certfleet_reference_instance::{build_client, MemoryInstance};

const INSTANCE: &str = "edge-01";

struct Fleet {
    server: HubServer,
    id: InstanceId,
    session: JoinHandle<Result<SessionEnd, FleetProtocolError>>,
    serving: JoinHandle<Result<(), FleetProtocolError>>,
}

impl Fleet {
    fn dispatcher(&self) -> &CommandDispatcher {
        self.server.dispatcher()
    }
}

fn hub() -> HubServer {
    HubServer::new(
        CommandDispatcher::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(CorrelationTable::new()),
            DispatcherConfig {
                command_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        ),
        HubServerConfig::default(),
    )
}

async fn connect(client: HubClient) -> Fleet {
    let server = hub();
    let id = InstanceId::new(INSTANCE);
    let (hub_side, instance_side) = tokio::io::duplex(64 * 1024);

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve_connection(hub_side, CancellationToken::new()).await })
    };
    let session =
        tokio::spawn(async move { client.run_session(instance_side, CancellationToken::new()).await });

    let registry = Arc::clone(server.dispatcher().registry());
    tokio::time::timeout(Duration::from_secs(5), async {
        while !registry.is_connected(&id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("instance never connected");

    Fleet {
        server,
        id,
        session,
        serving,
    }
}

async fn connect_memory(instance: Arc<MemoryInstance>) -> Fleet {
    let mut config = InstanceConfig::new(INSTANCE);
    config.title = "Edge 01".to_string();
    connect(build_client(&config, instance)).await
}

fn item(id: &str, health: ItemHealth) -> ManagedItem {
    ManagedItem {
        health,
        domains: vec![format!("{}.example.com", id)],
        certificate_path: Some(format!("/certs/{}.pfx", id)),
        ..ManagedItem::new(id, id)
    }
}

#[tokio::test]
async fn test_status_summary_round_trip() {
    let instance = Arc::new(MemoryInstance::new().with_items([
        item("a", ItemHealth::Ok),
        item("b", ItemHealth::Ok),
        item("c", ItemHealth::Error),
    ]));
    let fleet = connect_memory(instance).await;
    let auth = AuthContext::for_principal("admin");

    let summary = fleet
        .dispatcher()
        .get_status_summary(&fleet.id, &auth)
        .await
        .unwrap();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.healthy, 2);
    assert_eq!(summary.error, 1);
    assert_eq!(summary.instance_id.as_deref(), Some(INSTANCE));

    let aggregate = fleet.dispatcher().aggregate_status_summary(&auth);
    assert_eq!(aggregate.total, 3);
    assert!(fleet.dispatcher().correlations().is_empty());

    let info = fleet.dispatcher().registry().connection(&fleet.id).unwrap().info;
    assert_eq!(info.title, "Edge 01");
}

#[tokio::test]
async fn test_item_changes_update_hub_cache() {
    let instance = Arc::new(MemoryInstance::new().with_items([item("a", ItemHealth::Ok)]));
    let fleet = connect_memory(Arc::clone(&instance)).await;
    let auth = AuthContext::for_principal("admin");
    let dispatcher = fleet.dispatcher();

    let items = dispatcher.get_managed_items(&fleet.id, &auth).await.unwrap();
    assert_eq!(items.len(), 1);

    let created = dispatcher
        .update_managed_item(&fleet.id, &item("b", ItemHealth::Error), &auth)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(created.id, "b");
    assert_eq!(instance.item_count(), 2);

    let snapshot = dispatcher.registry().snapshot(&fleet.id).unwrap();
    let cached = snapshot.items.unwrap_or_default();
    assert_eq!(cached.len(), 2);
    assert_eq!(cached.iter().filter(|i| i.health == ItemHealth::Error).count(), 1);

    assert!(dispatcher.remove_managed_item(&fleet.id, "a", &auth).await.unwrap());
    assert!(!dispatcher.remove_managed_item(&fleet.id, "a", &auth).await.unwrap());
    let snapshot = dispatcher.registry().snapshot(&fleet.id).unwrap();
    assert_eq!(snapshot.items.as_ref().map(Vec::len), Some(1));

    let fetched = dispatcher.get_managed_item(&fleet.id, "b", &auth).await.unwrap();
    assert_eq!(fetched.map(|i| i.health), Some(ItemHealth::Error));
    assert!(dispatcher
        .get_managed_item(&fleet.id, "missing", &auth)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_request_without_wait_reaches_instance() {
    let instance = Arc::new(MemoryInstance::new().with_items([item("a", ItemHealth::Ok)]));
    let fleet = connect_memory(Arc::clone(&instance)).await;
    let auth = AuthContext::system();

    fleet
        .dispatcher()
        .perform_managed_item_request(&fleet.id, "a", &auth)
        .await
        .unwrap();

    let log: Vec<LogItem> = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let log = fleet
                .dispatcher()
                .get_item_log(&fleet.id, "a", 10, &auth)
                .await
                .unwrap();
            if !log.is_empty() {
                return log;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(log[0].message, "Certificate request queued");
}

#[tokio::test]
async fn test_unknown_command_type_gets_empty_result() {
    let fleet = connect_memory(Arc::new(MemoryInstance::new())).await;

    let result = fleet
        .dispatcher()
        .send(
            &fleet.id,
            CommandType::Other("RotateEverything".to_string()),
            CommandArgs::new().with("managedItemId", "a"),
            &AuthContext::system(),
        )
        .await
        .unwrap();
    assert!(result.payload.is_none());
    assert!(result.error.is_none());
    assert_eq!(result.instance_id.as_ref(), Some(&fleet.id));
}

#[tokio::test]
async fn test_handler_error_reported_to_hub() {
    let fleet = connect_memory(Arc::new(MemoryInstance::new())).await;

    let err = fleet
        .dispatcher()
        .execute_deployment_task(&fleet.id, "missing", "t1", &AuthContext::system())
        .await
        .unwrap_err();
    match err {
        FleetProtocolError::CommandFailed { message, .. } => {
            assert!(message.contains("not found"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(fleet.server.dispatcher().registry().is_connected(&fleet.id));
}

#[tokio::test]
async fn test_stored_credentials_are_redacted() {
    let instance = Arc::new(MemoryInstance::new());
    let fleet = connect_memory(Arc::clone(&instance)).await;
    let auth = AuthContext::for_principal("admin");

    let saved = fleet
        .dispatcher()
        .update_stored_credential(
            &fleet.id,
            &StoredCredential {
                storage_key: "cred-01".to_string(),
                title: "DNS API".to_string(),
                provider_type: IN_MEMORY_PROVIDER_ID.to_string(),
                date_created: None,
                secret: Some("s3cret".to_string()),
            },
            &auth,
        )
        .await
        .unwrap();
    assert!(saved.is_success);

    let listed = fleet
        .dispatcher()
        .get_stored_credentials(&fleet.id, &auth)
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].secret.is_none());

    let local = instance.get_stored_credentials().await.unwrap();
    assert_eq!(local[0].secret.as_deref(), Some("s3cret"));
}

#[tokio::test]
async fn test_managed_challenge_through_hub() {
    let records = Arc::new(InMemoryRecordProvider::new());
    let mut providers = RecordProviders::new();
    providers.register(records.clone());
    providers.register(Arc::new(ManualRecordProvider));

    let store = InMemoryChallengeStore::with_items(vec![ManagedChallengeConfig::new(
        "example",
        "*.example.com;example.com",
    )
    .with_challenge(ChallengeMaterial::for_provider(IN_MEMORY_PROVIDER_ID))]);
    let instance = MemoryInstance::with_workflow(ChallengeWorkflow::new(Arc::new(store), providers));
    let fleet = connect_memory(Arc::new(instance)).await;
    let auth = AuthContext::system();
    let dispatcher = fleet.dispatcher();

    let request = ChallengeRequest::dns(
        "www.example.com",
        "_acme-challenge.www.example.com",
        "token-1",
    );
    let created = dispatcher
        .perform_managed_challenge(&fleet.id, &request, &auth)
        .await
        .unwrap();
    assert!(created.is_success, "{}", created.message);
    assert_eq!(records.values("_acme-challenge.www.example.com"), vec!["token-1"]);

    let cleaned = dispatcher
        .cleanup_managed_challenge(&fleet.id, &request, &auth)
        .await
        .unwrap();
    assert!(cleaned.is_success, "{}", cleaned.message);
    assert!(records.values("_acme-challenge.www.example.com").is_empty());

    let unmatched = dispatcher
        .perform_managed_challenge(
            &fleet.id,
            &ChallengeRequest::dns("www.other.org", "_acme-challenge.www.other.org", "x"),
            &auth,
        )
        .await
        .unwrap();
    assert!(!unmatched.is_success);
    assert_eq!(unmatched.message, NO_MATCH_MESSAGE);

    let configs = dispatcher.get_managed_challenges(&fleet.id, &auth).await.unwrap();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].id, "example");
}

#[tokio::test]
async fn test_reconnect_command_ends_session() {
    let fleet = connect_memory(Arc::new(MemoryInstance::new())).await;

    fleet
        .dispatcher()
        .reconnect(&fleet.id, &AuthContext::system())
        .await
        .unwrap();

    let end = tokio::time::timeout(Duration::from_secs(5), fleet.session)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(end, SessionEnd::ReconnectRequested);

    tokio::time::timeout(Duration::from_secs(5), fleet.serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!fleet.server.dispatcher().registry().is_connected(&fleet.id));
}

#[tokio::test]
async fn test_unreachable_instance_fails_fast() {
    let fleet = connect_memory(Arc::new(MemoryInstance::new())).await;
    let nobody = InstanceId::new("edge-99");

    let err = fleet
        .dispatcher()
        .get_status_summary(&nobody, &AuthContext::system())
        .await
        .unwrap_err();
    assert!(matches!(err, FleetProtocolError::AgentUnreachable(id) if id == nobody));
    assert!(fleet.dispatcher().correlations().is_empty());
}

/// Holds `get_item_log` until released.
struct Stalled {
    release: tokio::sync::Notify,
}

#[async_trait]
impl InstanceHandler for Stalled {
    async fn get_item_log(&self, _id: &str, _limit: u32) -> anyhow::Result<Vec<LogItem>> {
        self.release.notified().await;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_disconnect_releases_outstanding_commands() {
    let handler = Arc::new(Stalled {
        release: tokio::sync::Notify::new(),
    });
    let id = InstanceId::new(INSTANCE);
    let client = HubClient::new(
        InstanceInfo::new(id.clone()),
        AgentCommandExecutor::new(id, handler.clone()),
        HubClientConfig {
            heartbeat_interval: Duration::from_secs(3600),
            ..Default::default()
        },
    );
    let fleet = connect(client).await;
    let dispatcher = fleet.dispatcher().clone();

    let waiters: Vec<_> = (0..3)
        .map(|n| {
            let dispatcher = dispatcher.clone();
            let id = fleet.id.clone();
            tokio::spawn(async move {
                dispatcher
                    .get_item_log(&id, &format!("item-{}", n), 10, &AuthContext::system())
                    .await
            })
        })
        .collect();

    tokio::time::timeout(Duration::from_secs(5), async {
        while dispatcher.correlations().pending_for(&fleet.id) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(dispatcher.disconnect_instance(&fleet.id), 3);
    for waiter in waiters {
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, FleetProtocolError::AgentDisconnected(_)));
    }
    assert!(dispatcher.correlations().is_empty());

    let end = tokio::time::timeout(Duration::from_secs(5), fleet.session)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(end, SessionEnd::Closed);
    handler.release.notify_waiters();
}
