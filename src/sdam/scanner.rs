use std::{
    collections::{BTreeMap, HashSet},
    time::{Duration, Instant},
};

use super::{
    description::{server::ServerId, topology::TopologyDescription},
    topology::Topology,
};
use crate::{
    auth::FirstRound,
    conn::Connection,
    error::{Error, Result},
    hello::{hello_command, HelloReply},
    options::ServerAddress,
};

/// Checks every server inline on behalf of a single-threaded topology. The connections it opens
/// are application connections: the cluster runs commands over them as well, authenticating each
/// one on first use.
#[derive(Debug, Default)]
pub(crate) struct Scanner {
    nodes: BTreeMap<ServerId, ScannerNode>,
    last_scan: Option<Instant>,
}

#[derive(Debug)]
pub(crate) struct ScannerNode {
    pub(crate) address: ServerAddress,
    pub(crate) connection: Option<Connection>,

    /// Whether the connection has finished authenticating.
    pub(crate) authenticated: bool,

    /// The speculative authentication exchange from the connection's handshake, consumed by the
    /// first authentication.
    pub(crate) first_round: Option<FirstRound>,

    hello_ok: Option<bool>,

    /// When the last attempt to reach this server failed.
    last_failed: Option<Instant>,
}

impl ScannerNode {
    fn new(address: ServerAddress) -> Self {
        Self {
            address,
            connection: None,
            authenticated: false,
            first_round: None,
            hello_ok: None,
            last_failed: None,
        }
    }

    fn in_cooldown(&self, now: Instant, cooldown: Duration) -> bool {
        self.last_failed
            .is_some_and(|last_failed| last_failed + cooldown > now)
    }

    pub(crate) fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            tracing::debug!(
                server = %self.address,
                connection_id = connection.id,
                "scanner connection closed"
            );
        }
        self.authenticated = false;
        self.first_round = None;
        self.hello_ok = None;
    }

    /// Runs a hello over the existing connection, or opens and handshakes a new one.
    async fn check(&mut self, id: ServerId, topology: &Topology) -> Result<(HelloReply, Duration)> {
        if let Some(ref mut connection) = self.connection {
            let command = hello_command(topology.options().is_load_balanced(), self.hello_ok);
            let protocol = connection.stream_description()?.wire_protocol();

            let start = Instant::now();
            let response = connection.send_command(&command, protocol).await?;
            let round_trip_time = start.elapsed();

            let reply = HelloReply::parse(self.address.clone(), response.into_document())?;
            return Ok((reply, round_trip_time));
        }

        let generations = topology
            .server_description(id)
            .map(|server| server.generation.clone())
            .unwrap_or_default();
        let (connection, handshake) = topology
            .establisher()
            .establish_connection(self.address.clone(), &generations)
            .await
            .map_err(|error| error.cause)?;

        self.hello_ok = Some(handshake.hello_reply.command_response.hello_ok == Some(true));
        self.first_round = handshake.first_round;
        self.authenticated = false;
        self.connection = Some(connection);

        Ok((handshake.hello_reply, handshake.round_trip_time))
    }

    /// Checks the server and applies the outcome to the topology. A failure closes the
    /// connection and starts the cooldown.
    async fn check_and_apply(&mut self, id: ServerId, topology: &Topology) -> Result<()> {
        match self.check(id, topology).await {
            Ok((reply, round_trip_time)) => {
                self.last_failed = None;
                topology
                    .handle_hello(id, Ok(reply), Some(round_trip_time))
                    .await;
                Ok(())
            }
            Err(error) => {
                tracing::debug!(server = %self.address, error = %error, "scan failed");
                self.last_failed = Some(Instant::now());
                self.disconnect();
                topology.handle_monitor_error(id, error.clone()).await;
                Err(error)
            }
        }
    }
}

impl Scanner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// When the last full scan finished.
    pub(crate) fn last_scan(&self) -> Option<Instant> {
        self.last_scan
    }

    pub(crate) fn node_mut(&mut self, id: ServerId) -> Option<&mut ScannerNode> {
        self.nodes.get_mut(&id)
    }

    /// Closes every connection.
    pub(crate) fn close(&mut self) {
        for node in self.nodes.values_mut() {
            node.disconnect();
        }
        self.nodes.clear();
    }

    /// Whether every known server is cooling down after a failure.
    pub(crate) fn in_cooldown(&mut self, topology: &Topology, now: Instant) -> bool {
        self.reconcile(&topology.description());
        let cooldown = topology.options().cooldown();
        !self.nodes.is_empty()
            && self
                .nodes
                .values()
                .all(|node| node.in_cooldown(now, cooldown))
    }

    /// Adds nodes for new servers and drops the nodes of removed ones.
    fn reconcile(&mut self, description: &TopologyDescription) {
        self.nodes
            .retain(|id, _| description.server_by_id(*id).is_some());
        for server in description.servers() {
            self.nodes
                .entry(server.id())
                .or_insert_with(|| ScannerNode::new(server.address().clone()));
        }
    }

    /// Checks every server once, one at a time. Servers discovered by a reply during the scan
    /// are checked in the same scan. With `obey_cooldown`, servers that failed within the
    /// cooldown period are skipped; load balancers are never skipped.
    pub(crate) async fn scan(&mut self, topology: &Topology, obey_cooldown: bool) {
        let obey_cooldown = obey_cooldown && !topology.options().is_load_balanced();
        let cooldown = topology.options().cooldown();
        let start = Instant::now();
        let mut visited = HashSet::new();

        loop {
            self.reconcile(&topology.description());

            let Some((&id, node)) = self
                .nodes
                .iter_mut()
                .find(|(id, _)| !visited.contains(*id))
            else {
                break;
            };
            visited.insert(id);

            if obey_cooldown && node.in_cooldown(start, cooldown) {
                tracing::trace!(server = %node.address, "skipping server in cooldown");
                continue;
            }

            let _: Result<()> = node.check_and_apply(id, topology).await;
        }

        self.last_scan = Some(Instant::now());
        tracing::trace!(
            servers = visited.len(),
            elapsed = ?start.elapsed(),
            "scan finished"
        );
    }

    /// Checks one server, opening a new connection if it has none. Used by the cluster to
    /// reconnect a node on demand.
    pub(crate) async fn scan_server(&mut self, id: ServerId, topology: &Topology) -> Result<()> {
        self.reconcile(&topology.description());
        let Some(node) = self.nodes.get_mut(&id) else {
            return Err(Error::not_established(format!(
                "Could not find node for server id {id}"
            )));
        };
        node.check_and_apply(id, topology).await
    }
}
