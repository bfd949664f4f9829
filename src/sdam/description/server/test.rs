use std::time::Duration;

use approx::assert_relative_eq;
use pretty_assertions::assert_eq;

use crate::{
    bson::{doc, oid::ObjectId, Document},
    error::Error,
    hello::HelloReply,
    options::ServerAddress,
    sdam::{ServerDescription, ServerId, ServerType, TopologyVersion},
};

fn address() -> ServerAddress {
    ServerAddress::parse("a:27017").unwrap()
}

fn reply(raw: Document) -> HelloReply {
    HelloReply::parse(address(), raw).unwrap()
}

#[test]
fn new_server_is_unknown_without_error() {
    let sd = ServerDescription::new(ServerId(1), address());
    assert_eq!(sd.server_type(), ServerType::Unknown);
    assert!(sd.error().is_none());
    assert!(!sd.has_hello_response());
}

#[test]
fn failed_check_records_error_and_resets_rtt() {
    let mut sd = ServerDescription::new(ServerId(1), address());
    sd.handle_hello(
        Ok(reply(doc! { "ok": 1, "maxWireVersion": 17 })),
        Some(Duration::from_millis(10)),
    );
    assert_eq!(sd.server_type(), ServerType::Standalone);
    assert_eq!(sd.round_trip_time(), Some(Duration::from_millis(10)));

    sd.handle_hello(Err(Error::network_timeout()), None);
    assert_eq!(sd.server_type(), ServerType::Unknown);
    assert!(sd.error().is_some());
    assert_eq!(sd.round_trip_time(), None);
    assert_eq!(sd.max_wire_version(), None);
}

#[test]
fn ok_zero_reply_is_unknown_with_server_message() {
    let mut sd = ServerDescription::new(ServerId(1), address());
    let parsed = HelloReply::parse(
        address(),
        doc! { "ok": 0, "code": 13, "codeName": "Unauthorized", "errmsg": "not allowed" },
    );
    sd.handle_hello(parsed, Some(Duration::from_millis(3)));

    assert_eq!(sd.server_type(), ServerType::Unknown);
    assert!(sd.error().unwrap().to_string().contains("not allowed"));
}

#[test]
fn round_trip_time_is_moving_average() {
    let mut sd = ServerDescription::new(ServerId(1), address());
    sd.handle_hello(Ok(reply(doc! { "ok": 1 })), Some(Duration::from_millis(100)));
    sd.handle_hello(Ok(reply(doc! { "ok": 1 })), Some(Duration::from_millis(200)));

    let rtt = sd.round_trip_time().unwrap().as_secs_f64() * 1000.0;
    assert_relative_eq!(rtt, 120.0, epsilon = 0.001);
}

#[test]
fn generations_survive_new_replies() {
    let mut sd = ServerDescription::new(ServerId(1), address());
    sd.generation.increment(None);
    sd.handle_hello(Ok(reply(doc! { "ok": 1 })), None);
    assert_eq!(sd.generation(None), 1);
    assert_eq!(sd.generation(Some(ObjectId::new())), 0);
}

#[test]
fn reported_hosts_are_normalized() {
    let mut sd = ServerDescription::new(ServerId(1), address());
    sd.handle_hello(
        Ok(reply(doc! {
            "ok": 1,
            "setName": "rs",
            "secondary": true,
            "hosts": ["A:27017", "B:27017"],
            "passives": ["C:27017"],
            "arbiters": ["D:27017"],
            "me": "A:27017",
            "primary": "B:27017",
        })),
        None,
    );

    let hosts: Vec<&String> = sd.known_hosts().collect();
    assert_eq!(hosts, vec!["a:27017", "b:27017", "c:27017", "d:27017"]);
    assert!(!sd.invalid_me());
    assert_eq!(sd.primary(), Some("b:27017"));
    assert_eq!(sd.set_name(), Some("rs"));
}

#[test]
fn mismatched_me_is_detected() {
    let mut sd = ServerDescription::new(ServerId(1), address());
    sd.handle_hello(
        Ok(reply(doc! { "ok": 1, "setName": "rs", "secondary": true, "me": "b:27017" })),
        None,
    );
    assert!(sd.invalid_me());
}

#[test]
fn tag_set_matching() {
    let mut sd = ServerDescription::new(ServerId(1), address());
    sd.handle_hello(
        Ok(reply(doc! {
            "ok": 1,
            "setName": "rs",
            "secondary": true,
            "tags": { "dc": "ny", "rack": "1" },
        })),
        None,
    );

    let matching = [("dc".to_string(), "ny".to_string())].into_iter().collect();
    let other = [("dc".to_string(), "sf".to_string())].into_iter().collect();
    assert!(sd.matches_tag_set(&matching));
    assert!(!sd.matches_tag_set(&other));
    assert!(sd.matches_tag_set(&Default::default()));
}

#[test]
fn wire_version_compatibility() {
    let mut too_old = ServerDescription::new(ServerId(1), address());
    too_old.handle_hello(
        Ok(reply(doc! { "ok": 1, "minWireVersion": 0, "maxWireVersion": 2 })),
        None,
    );
    let message = too_old.compatibility_error_message().unwrap();
    assert!(message.contains("reports wire version 2"), "{message}");

    let mut too_new = ServerDescription::new(ServerId(1), address());
    too_new.handle_hello(
        Ok(reply(doc! { "ok": 1, "minWireVersion": 100, "maxWireVersion": 101 })),
        None,
    );
    let message = too_new.compatibility_error_message().unwrap();
    assert!(message.contains("requires wire version 100"), "{message}");

    let mut fine = ServerDescription::new(ServerId(1), address());
    fine.handle_hello(
        Ok(reply(doc! { "ok": 1, "minWireVersion": 0, "maxWireVersion": 21 })),
        None,
    );
    assert_eq!(fine.compatibility_error_message(), None);
}

#[test]
fn topology_version_ordering() {
    let process_id = ObjectId::new();
    let older = TopologyVersion {
        process_id,
        counter: 1,
    };
    let newer = TopologyVersion {
        process_id,
        counter: 2,
    };
    let other_process = TopologyVersion {
        process_id: ObjectId::new(),
        counter: 0,
    };

    assert!(newer.is_more_recent_than(older));
    assert!(!older.is_more_recent_than(newer));
    assert!(!older.is_more_recent_than(older));
    assert!(other_process.is_more_recent_than(newer));

    assert!(older.is_older_than(newer));
    assert!(!other_process.is_older_than(newer));
}
