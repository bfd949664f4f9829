use pretty_assertions::assert_eq;

use super::{Handshaker, DRIVER_NAME};
use crate::{
    auth::{AuthMechanism, Credential},
    bson::{doc, oid::ObjectId},
    conn::Connection,
    options::ClusterOptions,
    runtime::stream::StreamFactory,
    test::{address, standalone_reply, MockDeployment, MockResponse},
};

const HOST: &str = "a:27017";

fn credential(mechanism: Option<AuthMechanism>) -> Credential {
    Credential::builder()
        .username("user".to_string())
        .password("pencil".to_string())
        .mechanism(mechanism)
        .build()
}

#[test]
fn metadata_without_an_app_name() {
    let handshaker = Handshaker::new(&ClusterOptions::default());

    let metadata = handshaker.command.body.get_document("client").unwrap();
    assert!(!metadata.contains_key("application"));

    let driver = metadata.get_document("driver").unwrap();
    assert_eq!(driver.keys().collect::<Vec<_>>(), vec!["name", "version"]);
    assert_eq!(driver.get_str("name"), Ok(DRIVER_NAME));
    assert_eq!(driver.get_str("version"), Ok(env!("CARGO_PKG_VERSION")));

    let os = metadata.get_document("os").unwrap();
    assert_eq!(os.get_str("type"), Ok(std::env::consts::OS));
    assert_eq!(os.get_str("architecture"), Ok(std::env::consts::ARCH));
}

#[test]
fn metadata_with_an_app_name() {
    let options = ClusterOptions {
        app_name: Some("inventory".to_string()),
        ..Default::default()
    };
    let handshaker = Handshaker::new(&options);

    let metadata = handshaker.command.body.get_document("client").unwrap();
    assert_eq!(
        metadata.get_document("application"),
        Ok(&doc! { "name": "inventory" })
    );
}

#[test]
fn legacy_hello_unless_load_balanced() {
    let handshaker = Handshaker::new(&ClusterOptions::default());
    assert_eq!(handshaker.command.name, "isMaster");
    assert_eq!(handshaker.command.body.get_bool("helloOk"), Ok(true));
    assert!(handshaker.command.secondary_ok);

    let options = ClusterOptions {
        load_balanced: Some(true),
        ..Default::default()
    };
    let handshaker = Handshaker::new(&options);
    assert_eq!(handshaker.command.name, "hello");
    assert_eq!(handshaker.command.body.get_bool("loadBalanced"), Ok(true));
}

#[cfg(feature = "zlib-compression")]
#[test]
fn compressors_are_offered() {
    use crate::compression::Compressor;

    let options = ClusterOptions {
        compressors: Some(vec![Compressor::Zlib { level: None }]),
        ..Default::default()
    };
    let handshaker = Handshaker::new(&options);
    assert_eq!(
        handshaker.command.body.get_array("compression").unwrap(),
        &vec!["zlib".into()]
    );

    let handshaker = Handshaker::new(&ClusterOptions::default());
    assert!(!handshaker.command.body.contains_key("compression"));
}

#[test]
fn credentials_shape_the_hello() {
    let options = ClusterOptions {
        credential: Some(credential(None)),
        ..Default::default()
    };
    let handshaker = Handshaker::new(&options);
    assert_eq!(
        handshaker.command.body.get_str("saslSupportedMechs"),
        Ok("admin.user")
    );
    assert_eq!(handshaker.command.target_db, "admin");

    let options = ClusterOptions {
        credential: Some(credential(Some(AuthMechanism::Plain))),
        ..Default::default()
    };
    let handshaker = Handshaker::new(&options);
    assert!(!handshaker.command.body.contains_key("saslSupportedMechs"));
    assert_eq!(handshaker.command.target_db, "$external");

    let monitoring = Handshaker::for_monitoring(&options);
    assert!(monitoring.credential.is_none());
    assert_eq!(monitoring.command.target_db, "admin");
}

async fn connect(mock: &MockDeployment) -> Connection {
    let stream = mock.connect(&address(HOST)).await.unwrap();
    Connection::new(address(HOST), stream, None)
}

#[tokio::test]
async fn handshake_describes_the_stream() {
    let mock = MockDeployment::new();
    mock.set_handler(HOST, |_| {
        let mut reply = standalone_reply();
        reply.insert("saslSupportedMechs", vec!["SCRAM-SHA-256"]);
        reply.insert("connectionId", 42_i64);
        MockResponse::Reply(reply)
    });

    let mut connection = connect(&mock).await;
    let handshake = Handshaker::new(&ClusterOptions::default())
        .handshake(&mut connection)
        .await
        .unwrap();
    assert!(handshake.first_round.is_none());

    let description = connection.stream_description().unwrap();
    assert_eq!(description.max_wire_version, Some(17));
    assert_eq!(description.max_message_size_bytes, 48_000_000);
    assert_eq!(description.server_connection_id, Some(42));
    assert!(description.hello_ok);
    assert_eq!(
        description.sasl_supported_mechs,
        Some(vec!["SCRAM-SHA-256".to_string()])
    );
    assert!(connection.compressor.is_none());

    let requests = mock.requests(HOST);
    assert!(!requests[0].op_msg);
    assert_eq!(requests[0].command_name, "isMaster");
}

#[tokio::test]
async fn load_balancers_are_greeted_with_op_msg() {
    let service_id = ObjectId::new();
    let mock = MockDeployment::new();
    mock.set_handler(HOST, move |_| {
        let mut reply = standalone_reply();
        reply.insert("serviceId", service_id);
        reply.insert("msg", "isdbgrid");
        MockResponse::Reply(reply)
    });

    let options = ClusterOptions {
        load_balanced: Some(true),
        ..Default::default()
    };
    let mut connection = connect(&mock).await;
    Handshaker::new(&options)
        .handshake(&mut connection)
        .await
        .unwrap();

    assert_eq!(connection.service_id(), Some(service_id));
    let requests = mock.requests(HOST);
    assert!(requests[0].op_msg);
    assert_eq!(requests[0].command_name, "hello");
}

#[tokio::test]
async fn failed_hellos_are_errors() {
    let mock = MockDeployment::new();
    mock.set_handler(HOST, |_| {
        MockResponse::Reply(doc! { "ok": 0, "code": 11, "errmsg": "user not found" })
    });

    let mut connection = connect(&mock).await;
    let error = Handshaker::new(&ClusterOptions::default())
        .handshake(&mut connection)
        .await
        .unwrap_err();
    assert_eq!(error.sdam_code(), Some(11));
    assert!(connection.stream_description.is_none());
}
