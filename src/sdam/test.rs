use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::{
    bson::{doc, oid::ObjectId, Document, Timestamp},
    cluster_time::ClusterTime,
    conn::RawCommandResponse,
    error::{Error, ErrorKind},
    options::{ClusterOptions, MonitoringMode},
    sdam::{HandshakePhase, ServerType, Topology, TopologyType},
    selection_criteria::{OperationType, ReadMode, ReadPreference},
    test::{address, answer_with, member_reply, standalone_reply, wait_for, MockDeployment},
};

const HOST: &str = "a:27017";

fn single_threaded(options: ClusterOptions) -> ClusterOptions {
    ClusterOptions {
        monitoring_mode: Some(MonitoringMode::SingleThreaded),
        min_heartbeat_freq: Some(Duration::from_millis(10)),
        ..options
    }
}

fn fast_pooled(options: ClusterOptions) -> ClusterOptions {
    ClusterOptions {
        min_heartbeat_freq: Some(Duration::from_millis(10)),
        ..options
    }
}

fn process_id() -> ObjectId {
    ObjectId::from_bytes([7; 12])
}

fn standalone_with_topology_version(counter: i64) -> Document {
    let mut reply = standalone_reply();
    reply.insert(
        "topologyVersion",
        doc! { "processId": process_id(), "counter": counter },
    );
    reply
}

/// A server error reply parsed the way the cluster parses one.
fn server_error(code: i32, counter: Option<i64>) -> Error {
    let mut reply = doc! { "ok": 0, "code": code, "errmsg": "server error" };
    if let Some(counter) = counter {
        reply.insert(
            "topologyVersion",
            doc! { "processId": process_id(), "counter": counter },
        );
    }
    RawCommandResponse::new(address(HOST), reply)
        .validate()
        .unwrap_err()
}

fn completed(generation: u32) -> HandshakePhase {
    HandshakePhase::AfterCompletion {
        generation,
        service_id: None,
        max_wire_version: 17,
    }
}

fn network_error() -> Error {
    std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into()
}

fn cluster_time(time: u32) -> ClusterTime {
    crate::bson::from_document(doc! {
        "clusterTime": Timestamp { time, increment: 1 },
        "signature": {},
    })
    .unwrap()
}

#[tokio::test]
async fn pooled_single_standalone() {
    let mock = MockDeployment::new();
    mock.set_handler(HOST, answer_with(standalone_reply()));

    let topology = Topology::new(fast_pooled(mock.options(&[HOST]))).unwrap();
    let selected = topology
        .select_server_id(OperationType::Write, &ReadPreference::PRIMARY)
        .await
        .unwrap();

    let description = topology.description();
    assert_eq!(description.topology_type(), TopologyType::Single);
    let server = description.server_by_id(selected.id).unwrap();
    assert_eq!(server.address(), &address(HOST));
    assert_eq!(server.server_type(), ServerType::Standalone);
    assert!(!selected.must_use_primary);

    topology.shutdown().await;
}

#[tokio::test]
async fn single_threaded_scans_only_when_stale() {
    let mock = MockDeployment::new();
    mock.set_handler(HOST, answer_with(standalone_reply()));

    let topology = Topology::new(single_threaded(mock.options(&[HOST]))).unwrap();
    assert!(topology
        .description()
        .servers()
        .all(|server| server.server_type() == ServerType::Unknown));

    for _ in 0..3 {
        topology
            .select_server_id(OperationType::Read, &ReadPreference::PRIMARY)
            .await
            .unwrap();
    }

    assert_eq!(topology.description().topology_type(), TopologyType::Single);
    assert_eq!(mock.connect_count(HOST), 1);
    assert_eq!(mock.requests(HOST).len(), 1);
}

#[tokio::test]
async fn try_once_fails_after_one_scan() {
    let mock = MockDeployment::new();
    mock.set_handler("b:27017", answer_with(standalone_reply()));
    mock.set_down("b:27017", true);

    let options = ClusterOptions {
        server_selection_timeout: Some(Duration::from_secs(30)),
        ..single_threaded(mock.options(&["b:27017"]))
    };
    let topology = Topology::new(options).unwrap();

    let error = tokio::time::timeout(
        Duration::from_secs(5),
        topology.select_server_id(OperationType::Write, &ReadPreference::PRIMARY),
    )
    .await
    .expect("try-once selection must not wait for the timeout")
    .unwrap_err();

    assert!(error.is_server_selection_error());
    let message = error.to_string();
    assert!(message.contains("serverSelectionTryOnce"), "{message}");
    assert!(message.contains("b:27017"), "{message}");
}

#[tokio::test]
async fn cooldown_skips_recently_failed_servers() {
    let mock = MockDeployment::new();
    mock.set_handler(HOST, answer_with(standalone_reply()));
    mock.set_down(HOST, true);

    let options = ClusterOptions {
        cooldown: Some(Duration::from_millis(200)),
        ..single_threaded(mock.options(&[HOST]))
    };
    let topology = Topology::new(options).unwrap();

    let first = topology
        .select_server_id(OperationType::Write, &ReadPreference::PRIMARY)
        .await
        .unwrap_err();
    assert!(first.to_string().contains("serverSelectionTryOnce"));

    mock.set_down(HOST, false);
    let second = topology
        .select_server_id(OperationType::Write, &ReadPreference::PRIMARY)
        .await
        .unwrap_err();
    match *second.kind {
        ErrorKind::ServerSelection { ref message } => {
            assert_eq!(message, "No servers yet eligible for rescan")
        }
        ref other => panic!("expected a server selection error, got {other:?}"),
    }
    assert_eq!(mock.connect_count(HOST), 0);

    tokio::time::sleep(Duration::from_millis(250)).await;
    topology
        .select_server_id(OperationType::Write, &ReadPreference::PRIMARY)
        .await
        .unwrap();
    assert_eq!(mock.connect_count(HOST), 1);
}

#[tokio::test]
async fn cooldown_is_bypassed_without_try_once() {
    let mock = MockDeployment::new();
    mock.set_handler(HOST, answer_with(standalone_reply()));
    mock.set_down(HOST, true);

    let options = ClusterOptions {
        server_selection_try_once: Some(false),
        server_selection_timeout: Some(Duration::from_millis(100)),
        ..single_threaded(mock.options(&[HOST]))
    };
    let topology = Topology::new(options).unwrap();

    let error = topology
        .select_server_id(OperationType::Write, &ReadPreference::PRIMARY)
        .await
        .unwrap_err();
    assert!(error.is_server_selection_error());

    mock.set_down(HOST, false);
    topology
        .select_server_id(OperationType::Write, &ReadPreference::PRIMARY)
        .await
        .unwrap();
}

#[tokio::test]
async fn stale_topology_version_is_ignored() {
    let mock = MockDeployment::new();
    mock.set_handler(HOST, answer_with(standalone_with_topology_version(5)));

    let topology = Topology::new(single_threaded(mock.options(&[HOST]))).unwrap();
    let selected = topology
        .select_server_id(OperationType::Write, &ReadPreference::PRIMARY)
        .await
        .unwrap();
    let server_type = |topology: &Topology| {
        topology
            .description()
            .server_by_id(selected.id)
            .unwrap()
            .server_type()
    };
    let generation = |topology: &Topology| {
        topology
            .description()
            .server_by_id(selected.id)
            .unwrap()
            .generation(None)
    };

    // NotWritablePrimary with the same topology version is stale.
    let cleared = topology
        .handle_application_error(&address(HOST), &server_error(10107, Some(5)), completed(0))
        .await;
    assert!(!cleared);
    assert_eq!(server_type(&topology), ServerType::Standalone);

    // A newer version marks the server Unknown; a modern server keeps its pool.
    let cleared = topology
        .handle_application_error(&address(HOST), &server_error(10107, Some(6)), completed(0))
        .await;
    assert!(!cleared);
    assert_eq!(server_type(&topology), ServerType::Unknown);
    assert_eq!(generation(&topology), 0);
}

#[tokio::test]
async fn shutdown_errors_clear_the_pool() {
    let mock = MockDeployment::new();
    mock.set_handler(HOST, answer_with(standalone_with_topology_version(1)));

    let topology = Topology::new(single_threaded(mock.options(&[HOST]))).unwrap();
    let selected = topology
        .select_server_id(OperationType::Write, &ReadPreference::PRIMARY)
        .await
        .unwrap();

    // ShutdownInProgress
    let cleared = topology
        .handle_application_error(&address(HOST), &server_error(91, Some(2)), completed(0))
        .await;
    assert!(cleared);

    let description = topology.description();
    let server = description.server_by_id(selected.id).unwrap();
    assert_eq!(server.server_type(), ServerType::Unknown);
    assert_eq!(server.generation(None), 1);
}

#[tokio::test]
async fn old_servers_clear_the_pool_on_state_change() {
    let mock = MockDeployment::new();
    let mut reply = standalone_reply();
    reply.insert("maxWireVersion", 7);
    mock.set_handler(HOST, answer_with(reply));

    let topology = Topology::new(single_threaded(mock.options(&[HOST]))).unwrap();
    topology
        .select_server_id(OperationType::Write, &ReadPreference::PRIMARY)
        .await
        .unwrap();

    let phase = HandshakePhase::AfterCompletion {
        generation: 0,
        service_id: None,
        max_wire_version: 7,
    };
    // NotPrimaryNoSecondaryOk, without a topology version.
    assert!(
        topology
            .handle_application_error(&address(HOST), &server_error(13435, None), phase)
            .await
    );
}

#[tokio::test]
async fn errors_from_older_generations_are_ignored() {
    let mock = MockDeployment::new();
    mock.set_handler(HOST, answer_with(standalone_reply()));

    let topology = Topology::new(single_threaded(mock.options(&[HOST]))).unwrap();
    let selected = topology
        .select_server_id(OperationType::Write, &ReadPreference::PRIMARY)
        .await
        .unwrap();

    assert!(
        topology
            .handle_application_error(&address(HOST), &network_error(), completed(0))
            .await
    );
    let description = topology.description();
    let server = description.server_by_id(selected.id).unwrap();
    assert_eq!(server.server_type(), ServerType::Unknown);
    assert_eq!(server.generation(None), 1);

    // The same failure seen on a connection from generation 0 is stale now.
    topology
        .select_server_id(OperationType::Write, &ReadPreference::PRIMARY)
        .await
        .unwrap();
    assert!(
        !topology
            .handle_application_error(&address(HOST), &network_error(), completed(0))
            .await
    );
    let description = topology.description();
    let server = description.server_by_id(selected.id).unwrap();
    assert_eq!(server.server_type(), ServerType::Standalone);
    assert_eq!(server.generation(None), 1);
}

#[tokio::test]
async fn network_timeouts_leave_the_server_alone() {
    let mock = MockDeployment::new();
    mock.set_handler(HOST, answer_with(standalone_reply()));

    let topology = Topology::new(single_threaded(mock.options(&[HOST]))).unwrap();
    let selected = topology
        .select_server_id(OperationType::Write, &ReadPreference::PRIMARY)
        .await
        .unwrap();

    assert!(
        !topology
            .handle_application_error(&address(HOST), &Error::network_timeout(), completed(0))
            .await
    );
    let description = topology.description();
    assert_eq!(
        description.server_by_id(selected.id).unwrap().server_type(),
        ServerType::Standalone
    );
}

#[tokio::test]
async fn load_balanced_handshake_errors_are_ignored() {
    let mock = MockDeployment::new();
    let options = ClusterOptions {
        load_balanced: Some(true),
        ..mock.options(&[HOST])
    };
    let topology = Topology::new(options).unwrap();

    let description = topology.description();
    assert_eq!(description.topology_type(), TopologyType::LoadBalanced);
    let server = description.server_by_address(&address(HOST)).unwrap();
    assert_eq!(server.server_type(), ServerType::LoadBalancer);

    let phase = HandshakePhase::PreHello { generation: 0 };
    assert!(
        !topology
            .handle_application_error(&address(HOST), &network_error(), phase)
            .await
    );
    assert_eq!(
        topology
            .description()
            .server_by_address(&address(HOST))
            .unwrap()
            .server_type(),
        ServerType::LoadBalancer
    );
}

#[tokio::test]
async fn shutdown_wakes_waiting_selectors() {
    let mock = MockDeployment::new();
    mock.set_handler(HOST, answer_with(standalone_reply()));
    mock.set_down(HOST, true);

    let topology = Topology::new(fast_pooled(mock.options(&[HOST]))).unwrap();
    let selector = {
        let topology = topology.clone();
        tokio::spawn(async move {
            topology
                .select_server_id(OperationType::Write, &ReadPreference::PRIMARY)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    topology.shutdown().await;

    let error = tokio::time::timeout(Duration::from_secs(5), selector)
        .await
        .expect("selector was not woken by shutdown")
        .unwrap()
        .unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Shutdown));
    assert!(topology.is_shut_down());
}

#[tokio::test]
async fn monitors_discover_the_replica_set() {
    let hosts = ["a:27017", "b:27017", "c:27017"];
    let mock = MockDeployment::new();
    for host in hosts {
        mock.set_handler(
            host,
            answer_with(member_reply("rs", host, &hosts, Some("a:27017"))),
        );
    }

    let options = ClusterOptions {
        direct_connection: Some(false),
        ..fast_pooled(mock.options(&["a:27017"]))
    };
    let topology = Topology::new(options).unwrap();
    let description = wait_for(&topology, |description| {
        description.servers().count() == 3
            && description
                .servers()
                .all(|server| server.server_type() != ServerType::Unknown)
    })
    .await;

    assert_eq!(
        description.topology_type(),
        TopologyType::ReplicaSetWithPrimary
    );
    assert_eq!(description.set_name(), Some("rs"));
    assert_eq!(
        description.primary().map(|server| server.address().clone()),
        Some(address("a:27017"))
    );

    let selected = topology
        .select_server_id(
            OperationType::Read,
            &ReadPreference::new(ReadMode::Secondary),
        )
        .await
        .unwrap();
    let secondary = topology.description().server_by_id(selected.id).cloned().unwrap();
    assert_eq!(secondary.server_type(), ServerType::RsSecondary);

    topology.shutdown().await;
}

#[tokio::test]
async fn monitor_failure_marks_server_unknown() {
    let mock = MockDeployment::new();
    mock.set_handler(HOST, answer_with(standalone_reply()));

    let topology = Topology::new(fast_pooled(mock.options(&[HOST]))).unwrap();
    wait_for(&topology, |description| {
        description
            .server_by_address(&address(HOST))
            .is_some_and(|server| server.server_type() == ServerType::Standalone)
    })
    .await;

    mock.set_down(HOST, true);
    topology.request_scan();
    let description = wait_for(&topology, |description| {
        description
            .server_by_address(&address(HOST))
            .is_some_and(|server| server.error().is_some())
    })
    .await;

    let server = description.server_by_address(&address(HOST)).unwrap();
    assert_eq!(server.server_type(), ServerType::Unknown);
    assert_eq!(description.topology_type(), TopologyType::Single);
    // The heartbeat is retried once, and each failure clears the pool.
    assert!(server.generation(None) >= 1);

    topology.shutdown().await;
}

#[tokio::test]
async fn dropped_modifications_are_discarded() {
    let topology = Topology::new(single_threaded(ClusterOptions::default())).unwrap();
    let before = topology.description();

    let mut modification = topology.modify().await;
    modification.add_server(address("z:27017"));
    // Readers are never blocked by a pending modification.
    assert_eq!(topology.description().servers().count(), 1);
    drop(modification);

    assert!(topology
        .description()
        .server_by_address(&address("z:27017"))
        .is_none());
    assert_eq!(
        topology.description().servers().count(),
        before.servers().count()
    );

    let mut modification = topology.modify().await;
    modification.add_server(address("z:27017"));
    modification.commit();
    assert!(topology
        .description()
        .server_by_address(&address("z:27017"))
        .is_some());
}

#[tokio::test]
async fn cluster_time_never_regresses() {
    let topology = Topology::new(single_threaded(ClusterOptions::default())).unwrap();

    topology.advance_cluster_time(&cluster_time(5)).await;
    topology.advance_cluster_time(&cluster_time(3)).await;
    assert_eq!(topology.description().cluster_time(), Some(&cluster_time(5)));

    topology.advance_cluster_time(&cluster_time(9)).await;
    assert_eq!(topology.description().cluster_time(), Some(&cluster_time(9)));
}

#[tokio::test]
async fn srv_hosts_replace_the_seed_list() {
    let options = single_threaded(
        ClusterOptions::builder()
            .hosts(vec![address("a:27017"), address("b:27017")])
            .build(),
    );
    let topology = Topology::new(options).unwrap();

    topology
        .reconcile_srv_hosts(&[address("b:27017"), address("c:27017")])
        .await;

    let description = topology.description();
    let mut hosts: Vec<String> = description
        .servers()
        .map(|server| server.address().to_string())
        .collect();
    hosts.sort();
    assert_eq!(hosts, vec!["b:27017".to_string(), "c:27017".to_string()]);
}

#[tokio::test]
async fn scan_once_checks_every_server() {
    let mock = MockDeployment::new();
    mock.set_handler(HOST, answer_with(standalone_reply()));

    let topology = Topology::new(single_threaded(mock.options(&[HOST]))).unwrap();
    topology.scan_once(false).await.unwrap();
    assert_eq!(topology.description().topology_type(), TopologyType::Single);

    topology.scan_once(false).await.unwrap();
    assert_eq!(mock.requests(HOST).len(), 2);
    assert_eq!(mock.connect_count(HOST), 1);

    topology.shutdown().await;
    assert!(topology.scan_once(false).await.is_err());
}
