use std::{collections::HashMap, time::Duration};

use pretty_assertions::assert_eq;
use rand::{rngs::SmallRng, SeedableRng};

use crate::{
    bson::{doc, DateTime, Document},
    error::Error,
    hello::HelloReply,
    sdam::{
        description::topology::test::{address, id_of, options},
        ServerId,
        TopologyDescription,
    },
    selection_criteria::{OperationType, ReadMode, ReadPreference, TagSet},
};

const HOSTS: [&str; 3] = ["a:27017", "b:27017", "c:27017"];

fn hello_with_rtt(td: &mut TopologyDescription, host: &str, mut reply: Document, rtt_ms: u64) {
    let id = id_of(td, host);
    reply.insert("ok", 1);
    let parsed = HelloReply::parse(address(host), reply).unwrap();
    td.handle_hello(id, Ok(parsed), Some(Duration::from_millis(rtt_ms)));
}

fn member(primary: bool, wire: i32, tags: Document) -> Document {
    let mut reply = doc! {
        "setName": "rs",
        "hosts": HOSTS.to_vec(),
        "minWireVersion": 0,
        "maxWireVersion": wire,
        "tags": tags,
    };
    if primary {
        reply.insert("isWritablePrimary", true);
    } else {
        reply.insert("secondary", true);
    }
    reply
}

/// A replica set with primary `a` and secondaries `b` (dc: ny) and `c` (dc: sf).
fn replica_set() -> TopologyDescription {
    let mut td = TopologyDescription::new(&options(&HOSTS));
    hello_with_rtt(&mut td, "a:27017", member(true, 21, doc! {}), 5);
    hello_with_rtt(&mut td, "b:27017", member(false, 21, doc! { "dc": "ny" }), 5);
    hello_with_rtt(&mut td, "c:27017", member(false, 21, doc! { "dc": "sf" }), 5);
    td
}

fn suitable_hosts(
    td: &TopologyDescription,
    operation_type: OperationType,
    read_preference: &ReadPreference,
) -> Vec<String> {
    let mut hosts: Vec<String> = td
        .suitable_servers(operation_type, read_preference)
        .unwrap()
        .into_iter()
        .map(|server| server.address().to_string())
        .collect();
    hosts.sort();
    hosts
}

fn tags(pairs: &[(&str, &str)]) -> TagSet {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn read_preference_modes() {
    let td = replica_set();

    assert_eq!(
        suitable_hosts(&td, OperationType::Read, &ReadPreference::PRIMARY),
        vec!["a:27017"]
    );
    assert_eq!(
        suitable_hosts(
            &td,
            OperationType::Read,
            &ReadPreference::new(ReadMode::Secondary)
        ),
        vec!["b:27017", "c:27017"]
    );
    assert_eq!(
        suitable_hosts(
            &td,
            OperationType::Read,
            &ReadPreference::new(ReadMode::PrimaryPreferred)
        ),
        vec!["a:27017"]
    );
    assert_eq!(
        suitable_hosts(
            &td,
            OperationType::Read,
            &ReadPreference::new(ReadMode::Nearest)
        ),
        vec!["a:27017", "b:27017", "c:27017"]
    );
    assert_eq!(
        suitable_hosts(
            &td,
            OperationType::Write,
            &ReadPreference::new(ReadMode::Nearest)
        ),
        vec!["a:27017"]
    );
}

#[test]
fn secondary_preferred_falls_back_to_primary() {
    let mut td = replica_set();
    td.invalidate_server(id_of(&td, "b:27017"), Error::network_timeout());
    td.invalidate_server(id_of(&td, "c:27017"), Error::network_timeout());

    assert_eq!(
        suitable_hosts(
            &td,
            OperationType::Read,
            &ReadPreference::new(ReadMode::SecondaryPreferred)
        ),
        vec!["a:27017"]
    );
}

#[test]
fn tag_sets_are_tried_in_order() {
    let td = replica_set();
    let read_preference = ReadPreference::new(ReadMode::Secondary)
        .with_tags(vec![tags(&[("dc", "tokyo")]), tags(&[("dc", "sf")])])
        .unwrap();
    assert_eq!(
        suitable_hosts(&td, OperationType::Read, &read_preference),
        vec!["c:27017"]
    );

    let nothing = ReadPreference::new(ReadMode::Secondary)
        .with_tags(vec![tags(&[("dc", "tokyo")])])
        .unwrap();
    assert!(suitable_hosts(&td, OperationType::Read, &nothing).is_empty());

    let empty_matches_all = ReadPreference::new(ReadMode::Secondary)
        .with_tags(vec![HashMap::new()])
        .unwrap();
    assert_eq!(
        suitable_hosts(&td, OperationType::Read, &empty_matches_all),
        vec!["b:27017", "c:27017"]
    );
}

#[test]
fn latency_window() {
    let mut td = TopologyDescription::new(&options(&HOSTS));
    hello_with_rtt(&mut td, "a:27017", doc! { "msg": "isdbgrid" }, 10);
    hello_with_rtt(&mut td, "b:27017", doc! { "msg": "isdbgrid" }, 24);
    hello_with_rtt(&mut td, "c:27017", doc! { "msg": "isdbgrid" }, 100);

    assert_eq!(
        suitable_hosts(&td, OperationType::Write, &ReadPreference::PRIMARY),
        vec!["a:27017", "b:27017"]
    );
}

#[test]
fn invalid_max_staleness_is_rejected() {
    let td = replica_set();
    let read_preference = ReadPreference::new(ReadMode::Secondary)
        .with_max_staleness(Duration::from_secs(30))
        .unwrap();

    let err = td
        .suitable_servers(OperationType::Read, &read_preference)
        .unwrap_err();
    assert!(err.to_string().contains("max_staleness"), "{err}");
}

#[test]
fn stale_secondaries_are_filtered() {
    let now = DateTime::now().timestamp_millis();
    let last_write =
        |lag_secs: i64| doc! { "lastWriteDate": DateTime::from_millis(now - lag_secs * 1000) };

    let mut td = TopologyDescription::new(&options(&HOSTS));
    let mut primary = member(true, 21, doc! {});
    primary.insert("lastWrite", last_write(0));
    let mut fresh = member(false, 21, doc! {});
    fresh.insert("lastWrite", last_write(5));
    let mut stale = member(false, 21, doc! {});
    stale.insert("lastWrite", last_write(300));

    hello_with_rtt(&mut td, "a:27017", primary, 5);
    hello_with_rtt(&mut td, "b:27017", fresh, 5);
    hello_with_rtt(&mut td, "c:27017", stale, 5);

    let read_preference = ReadPreference::new(ReadMode::Secondary)
        .with_max_staleness(Duration::from_secs(120))
        .unwrap();
    assert_eq!(
        suitable_hosts(&td, OperationType::Read, &read_preference),
        vec!["b:27017"]
    );
}

#[test]
fn aggregate_with_write_needs_modern_servers_for_secondaries() {
    let secondary = ReadPreference::new(ReadMode::Secondary);
    let mut rng = SmallRng::seed_from_u64(1);

    let modern = replica_set();
    let selected = modern
        .select(OperationType::AggregateWithWrite, &secondary, &mut rng)
        .unwrap()
        .unwrap();
    assert!(!selected.must_use_primary);
    assert_ne!(selected.id, id_of(&modern, "a:27017"));

    let mut old = TopologyDescription::new(&options(&HOSTS));
    hello_with_rtt(&mut old, "a:27017", member(true, 12, doc! {}), 5);
    hello_with_rtt(&mut old, "b:27017", member(false, 12, doc! {}), 5);
    let selected = old
        .select(OperationType::AggregateWithWrite, &secondary, &mut rng)
        .unwrap()
        .unwrap();
    assert!(selected.must_use_primary);
    assert_eq!(selected.id, id_of(&old, "a:27017"));
}

#[test]
fn writes_need_a_primary() {
    let mut td = replica_set();
    td.invalidate_server(id_of(&td, "a:27017"), Error::network_timeout());

    let selected = td
        .select(
            OperationType::Write,
            &ReadPreference::PRIMARY,
            &mut SmallRng::seed_from_u64(0),
        )
        .unwrap();
    assert_eq!(selected, None);
    assert!(td.server_errors().contains("calling hello on 'a:27017'"));
}

#[test]
fn selection_is_uniform_among_candidates() {
    let mut td = TopologyDescription::new(&options(&HOSTS));
    for host in HOSTS {
        hello_with_rtt(&mut td, host, doc! { "msg": "isdbgrid", "maxWireVersion": 17 }, 5);
    }

    let mut rng = SmallRng::seed_from_u64(7);
    let mut counts: HashMap<ServerId, u32> = HashMap::new();
    let rounds = 3000;
    for _ in 0..rounds {
        let selected = td
            .select(OperationType::Read, &ReadPreference::PRIMARY, &mut rng)
            .unwrap()
            .unwrap();
        *counts.entry(selected.id).or_default() += 1;
    }

    assert_eq!(counts.len(), 3);
    for (id, count) in counts {
        assert!(
            (800..=1200).contains(&count),
            "server {id} chosen {count} times out of {rounds}"
        );
    }
}
