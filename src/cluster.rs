//! Maps servers to established, authenticated connections and runs commands over them.

mod stream;

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

pub use self::stream::ServerStream;
use crate::{
    bson::{doc, Document},
    conn::{
        establish::EstablishError,
        handshake::HandshakeResult,
        Command,
        Connection,
        RawCommandResponse,
        WireProtocol,
    },
    error::{Error, ErrorKind, Result, RETRYABLE_WRITE_ERROR},
    hello::LEGACY_HELLO_COMMAND_NAME_LOWERCASE,
    options::{ClusterOptions, ServerAddress},
    sdam::{HandshakePhase, ServerDescription, ServerId, ServerType, Topology, TopologyType},
    selection_criteria::{OperationType, ReadMode, ReadPreference},
};

/// The servers of wire version 6 (MongoDB 3.6) and above accept `$clusterTime`.
const CLUSTER_TIME_MIN_WIRE_VERSION: i32 = 6;

/// Hands out [`ServerStream`]s to the servers of a [`Topology`] and runs commands on them,
/// reacting to failures on the topology's behalf.
///
/// In pooled mode the cluster owns one connection per server, opened, handshaked and
/// authenticated on first use. In single-threaded mode it runs commands over the connections
/// the topology's scanner opened, authenticating each on first use.
#[derive(Debug)]
pub struct Cluster {
    topology: Topology,
    retry_reads: bool,
    retry_writes: bool,
    nodes: BTreeMap<ServerId, ClusterNode>,
}

#[derive(Debug)]
struct ClusterNode {
    /// The connection, in pooled mode. Single-threaded clusters borrow the scanner's.
    connection: Option<Connection>,

    connection_id: u64,

    /// The server as described by the connection's own handshake.
    description: ServerDescription,

    /// Shared with every stream handed out for this connection.
    alive: Arc<AtomicBool>,
}

impl ClusterNode {
    fn new(
        connection: Option<Connection>,
        connection_id: u64,
        description: ServerDescription,
    ) -> Self {
        Self {
            connection,
            connection_id,
            description,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    fn close(self) {
        self.alive.store(false, Ordering::SeqCst);
        tracing::debug!(
            server = %self.description.address(),
            server_id = %self.description.id(),
            connection_id = self.connection_id,
            "node disconnected"
        );
    }
}

/// What is left of a command once the connection it ran on has been released.
struct Outcome {
    result: Result<RawCommandResponse>,
    phase: HandshakePhase,
    errored: bool,
}

impl Outcome {
    async fn run(connection: &mut Connection, command: Command) -> Self {
        let result = connection.run_command(command).await;
        Self {
            result,
            phase: HandshakePhase::after_completion(connection),
            errored: connection.has_errored(),
        }
    }
}

impl Cluster {
    /// Creates a cluster over `topology`. Only the retry settings are read from `options`; the
    /// rest were consumed by the topology.
    pub fn new(topology: Topology, options: &ClusterOptions) -> Self {
        Self {
            topology,
            retry_reads: options.retry_reads(),
            retry_writes: options.retry_writes(),
            nodes: BTreeMap::new(),
        }
    }

    /// The topology this cluster dispatches to.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Returns a stream to the given server.
    ///
    /// A connection opened before the server's pool was last cleared is discarded first. If no
    /// usable connection remains, a new one is established when `reconnect_ok` is set, and the
    /// call fails with a `NotEstablished` error otherwise.
    pub async fn stream_for_server(
        &mut self,
        server_id: ServerId,
        reconnect_ok: bool,
    ) -> Result<ServerStream> {
        if self.topology.is_shut_down() {
            return Err(ErrorKind::Shutdown.into());
        }

        if self.topology.scanner().is_some() {
            self.single_threaded_stream(server_id, reconnect_ok).await
        } else {
            self.pooled_stream(server_id, reconnect_ok).await
        }
    }

    /// Selects a server for a read and returns a stream to it.
    pub async fn stream_for_reads(
        &mut self,
        read_preference: &ReadPreference,
    ) -> Result<ServerStream> {
        let retry = self.retry_reads;
        self.stream_for_operation(OperationType::Read, read_preference, retry)
            .await
    }

    /// Selects a primary or mongos for a write and returns a stream to it.
    pub async fn stream_for_writes(&mut self) -> Result<ServerStream> {
        let retry = self.retry_writes;
        self.stream_for_operation(OperationType::Write, &ReadPreference::PRIMARY, retry)
            .await
    }

    /// Selects a server for an aggregation with a `$out` or `$merge` stage. The returned stream
    /// reports [`ServerStream::must_use_primary`] when the read preference could not be honored.
    pub async fn stream_for_aggregate_with_write(
        &mut self,
        read_preference: &ReadPreference,
    ) -> Result<ServerStream> {
        let retry = self.retry_writes;
        self.stream_for_operation(OperationType::AggregateWithWrite, read_preference, retry)
            .await
    }

    async fn stream_for_operation(
        &mut self,
        operation_type: OperationType,
        read_preference: &ReadPreference,
        retry: bool,
    ) -> Result<ServerStream> {
        let selected = self
            .topology
            .select_server_id(operation_type, read_preference)
            .await?;

        let stream = match self.stream_for_server(selected.id, true).await {
            Err(error) if retry && (error.is_network_error() || error.is_auth_error()) => {
                tracing::debug!(
                    server_id = %selected.id,
                    error = %error,
                    "retrying stream acquisition"
                );
                self.stream_for_server(selected.id, true).await?
            }
            result => result?,
        };

        Ok(stream.with_must_use_primary(selected.must_use_primary))
    }

    async fn pooled_stream(
        &mut self,
        server_id: ServerId,
        reconnect_ok: bool,
    ) -> Result<ServerStream> {
        let description = self.topology.description();
        let Some(server) = description.server_by_id(server_id) else {
            self.remove_node(server_id);
            return Err(Error::not_established(format!(
                "Could not find server with id {server_id}"
            )));
        };

        let stale = self.nodes.get(&server_id).is_some_and(|node| {
            node.connection.as_ref().map_or(true, |connection| {
                connection.has_errored()
                    || connection.generation < server.generation(connection.service_id())
            })
        });
        if stale {
            tracing::debug!(
                server = %server.address(),
                generation = server.generation(None),
                "discarding connection from an older pool generation"
            );
            self.remove_node(server_id);
        }

        if !self.nodes.contains_key(&server_id) {
            if !reconnect_ok {
                return Err(Error::not_established(format!(
                    "Could not find node {}",
                    server.address()
                )));
            }
            let node = self.connect_node(server).await?;
            self.nodes.insert(server_id, node);
        }

        let node = self
            .nodes
            .get(&server_id)
            .ok_or_else(|| Error::internal("node missing after connecting"))?;

        Ok(ServerStream::new(
            node.description.clone(),
            description.topology_type(),
            self.topology.description().cluster_time().cloned(),
            node.connection_id,
            node.alive.clone(),
        ))
    }

    /// Establishes and authenticates a new connection for a pooled node. The handshake reply is
    /// applied to the topology before authenticating, since the handshake may reveal that the
    /// server is not what the topology expects.
    async fn connect_node(&self, server: &ServerDescription) -> Result<ClusterNode> {
        let establisher = self.topology.establisher();
        let server_id = server.id();
        let address = server.address().clone();

        let (mut connection, handshake) = match establisher
            .establish_connection(address.clone(), &server.generation)
            .await
        {
            Ok(established) => established,
            Err(error) => return Err(self.report_establish_error(&address, error).await),
        };

        let HandshakeResult {
            hello_reply,
            first_round,
            round_trip_time,
        } = handshake;

        if !self
            .topology
            .update_from_handshake(server_id, &hello_reply, round_trip_time)
            .await
        {
            return Err(Error::not_established(format!(
                "\"{address}\" removed from topology"
            )));
        }

        if let Err(error) = establisher.authenticate(&mut connection, first_round).await {
            return Err(self.report_establish_error(&address, error).await);
        }

        let mut description = ServerDescription::new(server_id, address);
        description.handle_hello(Ok(hello_reply), Some(round_trip_time));
        description.generation = server.generation.clone();

        let connection_id = connection.id;
        Ok(ClusterNode::new(Some(connection), connection_id, description))
    }

    async fn report_establish_error(
        &self,
        address: &ServerAddress,
        error: EstablishError,
    ) -> Error {
        self.topology
            .handle_application_error(address, &error.cause, error.handshake_phase)
            .await;
        error.cause
    }

    async fn single_threaded_stream(
        &mut self,
        server_id: ServerId,
        reconnect_ok: bool,
    ) -> Result<ServerStream> {
        let topology = self.topology.clone();
        let Some(scanner) = topology.scanner() else {
            return Err(Error::internal("single-threaded topology without a scanner"));
        };
        let mut scanner = scanner.lock().await;

        let Some(server) = topology.server_description(server_id) else {
            return Err(Error::not_established(format!(
                "Could not find server with id {server_id}"
            )));
        };

        let usable = scanner
            .node_mut(server_id)
            .and_then(|node| node.connection.as_ref())
            .is_some_and(|connection| {
                !connection.has_errored()
                    && connection.generation >= server.generation(connection.service_id())
            });

        if !usable {
            if let Some(node) = scanner.node_mut(server_id) {
                node.disconnect();
            }
            if !reconnect_ok {
                return Err(Error::not_established(format!(
                    "Could not find stream for node {}",
                    server.address()
                )));
            }
            scanner.scan_server(server_id, &topology).await?;
        }

        let Some(server) = topology.server_description(server_id) else {
            return Err(Error::not_established(format!(
                "\"{}\" removed from topology",
                server.address()
            )));
        };

        let node = scanner
            .node_mut(server_id)
            .ok_or_else(|| {
                Error::not_established(format!("Could not find node {}", server.address()))
            })?;
        let Some(ref mut connection) = node.connection else {
            return Err(Error::not_established(format!(
                "Could not find stream for node {}",
                server.address()
            )));
        };
        let connection_id = connection.id;

        if !node.authenticated {
            let first_round = node.first_round.take();
            if let Err(error) = topology
                .establisher()
                .authenticate(connection, first_round)
                .await
            {
                node.disconnect();
                drop(scanner);
                return Err(self.report_establish_error(server.address(), error).await);
            }
            node.authenticated = true;
        }
        drop(scanner);

        // A scan may have replaced the connection since the last stream was handed out.
        if self
            .nodes
            .get(&server_id)
            .is_some_and(|node| node.connection_id != connection_id)
        {
            self.remove_node(server_id);
        }
        let node = self
            .nodes
            .entry(server_id)
            .or_insert_with(|| ClusterNode::new(None, connection_id, server.clone()));
        node.description = server;

        let description = topology.description();
        Ok(ServerStream::new(
            node.description.clone(),
            description.topology_type(),
            description.cluster_time().cloned(),
            connection_id,
            node.alive.clone(),
        ))
    }

    /// Runs `command` on the connection behind `stream` and returns the server's reply.
    ///
    /// The topology's cluster time is attached and the command's read preference is translated
    /// into what the server's type and wire protocol expect. A reply with `ok: 0` is returned as
    /// a command error carrying the server's error labels. Network failures disconnect the node
    /// and are reported to the topology, as are "not primary" and "node is recovering" errors.
    /// Failed retryable writes are labelled `RetryableWriteError` when a retry may succeed.
    pub async fn run_command(
        &mut self,
        stream: &ServerStream,
        mut command: Command,
    ) -> Result<Document> {
        if !stream.is_valid() {
            return Err(Error::not_established(format!(
                "stream to {} is no longer valid",
                stream.address()
            )));
        }

        let retryable_write = command.retryable_write;
        let outcome = self.dispatch(stream, &mut command).await?;

        let response = match outcome.result {
            Ok(response) => response,
            Err(error) => {
                return Err(self
                    .handle_error(stream, error, outcome.phase, outcome.errored, retryable_write)
                    .await)
            }
        };

        if let Some(cluster_time) = response.cluster_time() {
            self.topology.advance_cluster_time(cluster_time).await;
        }

        if let Err(mut error) = response.validate() {
            for label in response.error_labels() {
                error.add_label(label);
            }
            return Err(self
                .handle_error(stream, error, outcome.phase, false, retryable_write)
                .await);
        }

        Ok(response.into_document())
    }

    /// Finds the connection behind `stream`, prepares the command for it and sends it.
    async fn dispatch(
        &mut self,
        stream: &ServerStream,
        command: &mut Command,
    ) -> Result<Outcome> {
        let stale_stream = || {
            Error::not_established(format!("stream to {} is no longer valid", stream.address()))
        };

        match self.topology.scanner() {
            Some(scanner) => {
                let mut scanner = scanner.lock().await;
                let connection = scanner
                    .node_mut(stream.server_id())
                    .and_then(|node| node.connection.as_mut())
                    .filter(|connection| connection.id == stream.connection_id)
                    .ok_or_else(stale_stream)?;
                prepare_command(&self.topology, stream, connection, command)?;
                Ok(Outcome::run(connection, command.clone()).await)
            }
            None => {
                let connection = self
                    .nodes
                    .get_mut(&stream.server_id())
                    .and_then(|node| node.connection.as_mut())
                    .filter(|connection| connection.id == stream.connection_id)
                    .ok_or_else(stale_stream)?;
                prepare_command(&self.topology, stream, connection, command)?;
                Ok(Outcome::run(connection, command.clone()).await)
            }
        }
    }

    async fn handle_error(
        &mut self,
        stream: &ServerStream,
        mut error: Error,
        phase: HandshakePhase,
        errored: bool,
        retryable_write: bool,
    ) -> Error {
        let max_wire_version = phase
            .wire_version()
            .or_else(|| stream.server_description().max_wire_version());
        error.wire_version = max_wire_version;

        if retryable_write && self.retry_writes {
            if let Some(max_wire_version) = max_wire_version {
                let server_type = stream.server_description().server_type();
                if error.should_add_retryable_write_label(max_wire_version, Some(server_type)) {
                    error.add_label(RETRYABLE_WRITE_ERROR);
                }
            }
        }

        if error.is_stream_error() || errored {
            self.topology
                .handle_application_error(stream.address(), &error, phase)
                .await;
            self.disconnect_node(stream.server_id()).await;
        } else if error.is_state_change_error()
            && self
                .topology
                .handle_application_error(stream.address(), &error, phase)
                .await
        {
            self.disconnect_node(stream.server_id()).await;
        }

        error
    }

    /// Closes the connection to a server. Every stream handed out for it becomes invalid.
    pub async fn disconnect_node(&mut self, server_id: ServerId) {
        self.remove_node(server_id);
        if let Some(scanner) = self.topology.scanner() {
            if let Some(node) = scanner.lock().await.node_mut(server_id) {
                node.disconnect();
            }
        }
    }

    fn remove_node(&mut self, server_id: ServerId) {
        if let Some(node) = self.nodes.remove(&server_id) {
            node.close();
        }
    }

    /// Closes every connection the cluster owns and shuts the topology down.
    pub async fn shutdown(&mut self) {
        let ids: Vec<ServerId> = self.nodes.keys().copied().collect();
        for id in ids {
            self.remove_node(id);
        }
        self.topology.shutdown().await;
    }
}

/// Attaches the cluster time and translates the read preference for the server behind `stream`.
fn prepare_command(
    topology: &Topology,
    stream: &ServerStream,
    connection: &Connection,
    command: &mut Command,
) -> Result<()> {
    let stream_description = connection.stream_description()?;
    let protocol = stream_description.wire_protocol();

    let is_hello = command.name == "hello"
        || command.name.eq_ignore_ascii_case(LEGACY_HELLO_COMMAND_NAME_LOWERCASE);
    let gossips_cluster_time = stream_description
        .max_wire_version
        .is_some_and(|version| version >= CLUSTER_TIME_MIN_WIRE_VERSION);
    if gossips_cluster_time && !is_hello {
        let description = topology.description();
        let cluster_time = match (description.cluster_time(), stream.cluster_time()) {
            (Some(current), Some(handed_out)) => Some(current.max(handed_out)),
            (current, handed_out) => current.or(handed_out),
        };
        if let Some(cluster_time) = cluster_time {
            command.set_cluster_time(cluster_time);
        }
    }

    apply_read_preference(stream, protocol, command);
    Ok(())
}

/// Reads sent directly to a single server that is not a mongos must be accepted even if the
/// server is a secondary. Non-primary preferences are forwarded to mongos and replica set
/// members; legacy OP_QUERY expresses them with the secondary-ok flag and, for mongos, a
/// `$query` wrapper.
fn apply_read_preference(stream: &ServerStream, protocol: WireProtocol, command: &mut Command) {
    let Some(ref requested) = command.read_preference else {
        return;
    };
    let read_preference = if stream.must_use_primary() {
        ReadPreference::PRIMARY
    } else {
        requested.clone()
    };

    let is_mongos = matches!(
        stream.server_description().server_type(),
        ServerType::Mongos | ServerType::LoadBalancer
    );
    let direct = stream.topology_type() == TopologyType::Single && !is_mongos;
    let non_primary = !read_preference.is_primary();

    match protocol {
        WireProtocol::OpMsg => {
            let document = if non_primary {
                Some(read_preference.to_document())
            } else if direct {
                Some(doc! { "mode": "primaryPreferred" })
            } else {
                None
            };
            if let Some(document) = document {
                command.body.insert("$readPreference", document);
            }
        }
        WireProtocol::OpQuery => {
            command.secondary_ok = direct || non_primary;

            let plain_secondary_preferred = read_preference.mode() == ReadMode::SecondaryPreferred
                && !read_preference.has_constraints();
            if is_mongos && non_primary && !plain_secondary_preferred {
                let body = std::mem::take(&mut command.body);
                command.body = doc! {
                    "$query": body,
                    "$readPreference": read_preference.to_document(),
                };
            }
        }
    }
}
