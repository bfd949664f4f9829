pub(crate) mod server_selection;

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    time::Duration,
};

use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

use crate::{
    bson::oid::ObjectId,
    cluster_time::{self, ClusterTime},
    error::{Error, Result},
    hello::HelloReply,
    options::{ClusterOptions, ServerAddress},
    sdam::description::server::{ServerDescription, ServerId, ServerType},
};

/// The possible types for a topology.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize, Default, derive_more::Display,
)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A load balanced topology.
    LoadBalanced,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

/// A description of the most up-to-date information known about a topology.
///
/// Descriptions are values: the coordinator clones the current one, mutates the clone and
/// publishes it as a new snapshot, so a description that has been handed out never changes.
#[derive(Debug, Clone)]
pub struct TopologyDescription {
    /// Whether or not the topology was initialized with a single seed.
    pub(crate) single_seed: bool,

    /// The current type of the topology.
    pub(crate) topology_type: TopologyType,

    /// The replica set name of the topology.
    pub(crate) set_name: Option<String>,

    /// The highest replica set version the driver has seen by a member of the topology.
    pub(crate) max_set_version: Option<i32>,

    /// The highest replica set election id the driver has seen by a member of the topology.
    pub(crate) max_election_id: Option<ObjectId>,

    /// Describes the compatibility issue between the driver and server with regards to the
    /// respective supported wire versions.
    pub(crate) compatibility_error: Option<String>,

    /// The time that a session remains active after its most recent use.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The highest reported cluster time by any server in this topology.
    pub(crate) cluster_time: Option<ClusterTime>,

    pub(crate) local_threshold: Duration,

    pub(crate) heartbeat_freq: Duration,

    /// The server descriptions of each member of the topology, keyed by id.
    pub(crate) servers: BTreeMap<ServerId, ServerDescription>,

    /// The last id handed out to a server. Ids are never reused.
    pub(crate) max_server_id: u32,

    /// The maximum number of hosts taken from an SRV record. Zero means unlimited.
    pub(crate) srv_max_hosts: u32,
}

impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        // Only the fields consulted by server selection matter for waking up selectors.
        self.compatibility_error == other.compatibility_error
            && self.servers == other.servers
            && self.topology_type == other.topology_type
    }
}

impl TopologyDescription {
    /// Creates the initial description for the given options: one Unknown server per seed, and
    /// a topology type derived from the connection options.
    pub fn new(options: &ClusterOptions) -> Self {
        let topology_type = if options.is_load_balanced() {
            TopologyType::LoadBalanced
        } else {
            match options.direct_connection {
                Some(true) => TopologyType::Single,
                Some(false) | None if options.repl_set_name.is_some() => {
                    TopologyType::ReplicaSetNoPrimary
                }
                Some(false) => TopologyType::Unknown,
                None if options.hosts.len() > 1 => TopologyType::Unknown,
                None => TopologyType::Single,
            }
        };

        let mut description = Self {
            single_seed: options.hosts.len() == 1,
            topology_type,
            set_name: options.repl_set_name.clone(),
            max_set_version: None,
            max_election_id: None,
            compatibility_error: None,
            logical_session_timeout: None,
            cluster_time: None,
            local_threshold: options.local_threshold(),
            heartbeat_freq: options.heartbeat_freq(),
            servers: BTreeMap::new(),
            max_server_id: 0,
            srv_max_hosts: options.srv_max_hosts.unwrap_or(0),
        };

        for address in options.hosts.iter() {
            description.add_server(address.clone());
        }

        if topology_type == TopologyType::LoadBalanced {
            // The load balancer is never monitored, so its type is known up front.
            for server in description.servers.values_mut() {
                server.server_type = ServerType::LoadBalancer;
            }
        }

        description
    }

    /// Gets the topology type of the cluster.
    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    /// The replica set name, once configured or discovered.
    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    /// The highest cluster time reported by any server.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// The minimum logical session timeout across data-bearing servers, or `None` if sessions
    /// are not supported.
    pub fn logical_session_timeout(&self) -> Option<Duration> {
        self.logical_session_timeout
    }

    /// The message describing a wire version mismatch between this crate and some server.
    pub fn compatibility_error(&self) -> Option<&str> {
        self.compatibility_error.as_deref()
    }

    /// All server descriptions, ordered by id.
    pub fn servers(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values()
    }

    pub(crate) fn server_ids(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.servers.keys().copied()
    }

    /// Gets the description of the server with the given id.
    pub fn server_by_id(&self, id: ServerId) -> Option<&ServerDescription> {
        self.servers.get(&id)
    }

    pub(crate) fn server_by_id_mut(&mut self, id: ServerId) -> Option<&mut ServerDescription> {
        self.servers.get_mut(&id)
    }

    /// Gets the description of the server with the given address.
    pub fn server_by_address(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers
            .values()
            .find(|server| &server.address == address)
    }

    /// Whether any server is a data-bearing node.
    pub fn has_data_node(&self) -> bool {
        self.servers
            .values()
            .any(|server| server.server_type.is_data_bearing())
    }

    /// Adds a server if it is not already a member, returning its id either way.
    pub fn add_server(&mut self, address: ServerAddress) -> ServerId {
        if let Some(existing) = self.server_by_address(&address) {
            return existing.id;
        }

        self.max_server_id += 1;
        let id = ServerId(self.max_server_id);
        self.servers
            .insert(id, ServerDescription::new(id, address));
        id
    }

    /// Removes a server from the topology.
    pub fn remove_server(&mut self, id: ServerId) {
        self.servers.remove(&id);
    }

    /// Sets the topology's cluster time to the provided one if it is higher than the currently
    /// recorded one.
    pub(crate) fn advance_cluster_time(&mut self, cluster_time: &ClusterTime) {
        cluster_time::advance(&mut self.cluster_time, Some(cluster_time));
    }

    /// Bumps the connection-pool generation of one server (and backend service, when load
    /// balanced). Connections made under an older generation must not be reused.
    pub fn clear_connection_pool(&mut self, id: ServerId, service_id: Option<ObjectId>) {
        if let Some(server) = self.servers.get_mut(&id) {
            let generation = server.generation.increment(service_id);
            tracing::debug!(
                server = %server.address,
                server_id = %id,
                generation,
                "connection pool cleared"
            );
        }
    }

    /// Marks a server Unknown after an error observed outside of monitoring. Load balancers are
    /// never marked Unknown.
    pub fn invalidate_server(&mut self, id: ServerId, error: Error) {
        if self.topology_type == TopologyType::LoadBalanced {
            return;
        }
        self.handle_hello(id, Err(error), None);
    }

    /// Folds the outcome of a hello against one server into the topology.
    ///
    /// A reply carrying a topology version strictly older than the one already recorded for the
    /// server is ignored. Otherwise the server description is updated, the set name is checked
    /// for direct connections, the cluster time is advanced, and the SDAM transition for the new
    /// (server type, topology type) pair is applied.
    pub fn handle_hello(
        &mut self,
        id: ServerId,
        reply: Result<HelloReply>,
        round_trip_time: Option<Duration>,
    ) {
        if self.topology_type == TopologyType::LoadBalanced {
            return;
        }

        let Some(server) = self.servers.get_mut(&id) else {
            // Removed while the check was in flight.
            return;
        };

        if let (Ok(ref incoming), Some(existing)) = (&reply, server.topology_version()) {
            if let Some(incoming) = incoming.command_response.topology_version {
                if incoming.is_older_than(existing) {
                    tracing::trace!(server = %server.address, "ignoring stale hello reply");
                    return;
                }
            }
        }

        let has_reply = reply.is_ok();
        let cluster_time = reply
            .as_ref()
            .ok()
            .and_then(|reply| reply.cluster_time.clone());

        let previous_type = server.server_type;
        server.handle_hello(reply, round_trip_time);

        if self.topology_type == TopologyType::Single {
            if let Some(expected) = self.set_name.as_deref() {
                if server.has_hello_response() {
                    let message = match server.set_name() {
                        None => Some(format!("no reported set name, but expected '{expected}'")),
                        Some(got) if got != expected => Some(format!(
                            "reported set name '{got}' does not match '{expected}'"
                        )),
                        Some(_) => None,
                    };
                    if let Some(message) = message {
                        server.invalidate(Error::server_selection(message));
                    }
                }
            }
        }

        if previous_type != server.server_type {
            tracing::debug!(
                server = %server.address,
                server_id = %id,
                previous_type = ?previous_type,
                new_type = ?server.server_type,
                "server description changed"
            );
        }

        let server = server.clone();
        if let Some(ref cluster_time) = cluster_time {
            self.advance_cluster_time(cluster_time);
        }

        self.apply_transition(&server);
        self.update_logical_session_timeout();

        if has_reply && server.error().is_none() {
            self.check_compatibility();
        }
    }

    /// Applies a fresh SRV host list. Hosts that disappeared are removed; new hosts are added up
    /// to the configured maximum, chosen randomly with `rng` when the list exceeds it.
    ///
    /// Only Sharded and Unknown topologies are affected.
    pub fn reconcile_srv_hosts<R: Rng + ?Sized>(&mut self, hosts: &[ServerAddress], rng: &mut R) {
        if !matches!(
            self.topology_type,
            TopologyType::Sharded | TopologyType::Unknown
        ) {
            return;
        }

        let wanted: HashSet<&ServerAddress> = hosts.iter().collect();
        let missing = self
            .servers
            .values()
            .filter(|server| !wanted.contains(&server.address))
            .count();

        let max_hosts = self.srv_max_hosts as usize;
        if max_hosts == 0 || max_hosts >= hosts.len() {
            for host in hosts {
                self.add_server(host.clone());
            }
        } else {
            let mut shuffled: Vec<&ServerAddress> = hosts.iter().collect();
            shuffled.shuffle(rng);

            let limit = max_hosts + missing;
            for host in shuffled {
                if self.servers.len() >= limit {
                    break;
                }
                self.add_server(host.clone());
            }
        }

        self.servers
            .retain(|_, server| wanted.contains(&server.address));
    }

    /// Returns the changes between this description and `other`, or `None` if they are equal as
    /// far as server selection is concerned.
    pub(crate) fn diff<'a>(
        &'a self,
        other: &'a TopologyDescription,
    ) -> Option<TopologyDescriptionDiff<'a>> {
        if self == other {
            return None;
        }

        let ids: HashSet<ServerId> = self.server_ids().collect();
        let other_ids: HashSet<ServerId> = other.server_ids().collect();

        let changed_servers = self
            .servers
            .iter()
            .filter_map(|(id, description)| match other.servers.get(id) {
                Some(other_description) if description != other_description => {
                    Some((description, other_description))
                }
                _ => None,
            })
            .collect();

        Some(TopologyDescriptionDiff {
            removed: ids.difference(&other_ids).copied().collect(),
            added: other_ids.difference(&ids).copied().collect(),
            changed_servers,
        })
    }

    fn apply_transition(&mut self, server: &ServerDescription) {
        use ServerType as S;
        use TopologyType as T;

        match (server.server_type, self.topology_type) {
            (_, T::Single | T::LoadBalanced) | (S::PossiblePrimary | S::LoadBalancer, _) => {}

            (S::Unknown | S::RsGhost, T::Unknown | T::ReplicaSetNoPrimary) => {}
            (S::Unknown | S::RsGhost, T::ReplicaSetWithPrimary) => self.update_rs_type(),
            (S::Unknown | S::Mongos, T::Sharded) => {}
            (_, T::Sharded) => self.remove_server(server.id),

            (S::Standalone, T::Unknown) => self.update_unknown_with_standalone(server),
            (S::Standalone, T::ReplicaSetNoPrimary) | (S::Mongos, T::ReplicaSetNoPrimary) => {
                self.remove_server(server.id)
            }
            (S::Standalone | S::Mongos, T::ReplicaSetWithPrimary) => {
                self.remove_server(server.id);
                self.update_rs_type();
            }
            (S::Mongos, T::Unknown) => self.topology_type = TopologyType::Sharded,

            (S::RsPrimary, _) => self.update_rs_from_primary(server),

            (S::RsSecondary | S::RsArbiter | S::RsOther, T::Unknown) => {
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                self.update_rs_without_primary(server);
            }
            (S::RsSecondary | S::RsArbiter | S::RsOther, T::ReplicaSetNoPrimary) => {
                self.update_rs_without_primary(server)
            }
            (S::RsSecondary | S::RsArbiter | S::RsOther, T::ReplicaSetWithPrimary) => {
                self.update_rs_with_primary_from_member(server)
            }
        }
    }

    /// A standalone can only be the topology if it was the one and only seed.
    fn update_unknown_with_standalone(&mut self, server: &ServerDescription) {
        if !self.servers.contains_key(&server.id) {
            return;
        }

        if self.single_seed {
            self.topology_type = TopologyType::Single;
        } else {
            self.remove_server(server.id);
        }
    }

    fn update_rs_without_primary(&mut self, server: &ServerDescription) {
        if !self.servers.contains_key(&server.id) {
            return;
        }

        if let Some(server_set_name) = server.set_name() {
            match self.set_name {
                None => self.set_name = Some(server_set_name.to_string()),
                Some(ref set_name) if set_name != server_set_name => {
                    self.remove_server(server.id);
                    return;
                }
                Some(_) => {}
            }
        }

        self.add_new_servers(server);

        if let Some(primary) = server.primary() {
            self.label_unknown_member(primary, ServerType::PossiblePrimary);
        }

        if server.invalid_me() {
            self.remove_server(server.id);
        }
    }

    fn update_rs_with_primary_from_member(&mut self, server: &ServerDescription) {
        if !self.servers.contains_key(&server.id) {
            return;
        }

        if self.set_name.as_deref() != server.set_name() {
            self.remove_server(server.id);
            self.update_rs_type();
            return;
        }

        if server.invalid_me() {
            self.remove_server(server.id);
            return;
        }

        // The member may be the former primary reporting that it stepped down.
        if !self.has_primary() {
            self.topology_type = TopologyType::ReplicaSetNoPrimary;
            if let Some(primary) = server.primary() {
                self.label_unknown_member(primary, ServerType::PossiblePrimary);
            }
        }
    }

    fn update_rs_from_primary(&mut self, server: &ServerDescription) {
        if !self.servers.contains_key(&server.id) {
            return;
        }

        if let Some(server_set_name) = server.set_name() {
            match self.set_name {
                None => self.set_name = Some(server_set_name.to_string()),
                Some(ref set_name) if set_name != server_set_name => {
                    self.remove_server(server.id);
                    self.update_rs_type();
                    return;
                }
                Some(_) => {}
            }
        }

        let accepted = if server.max_wire_version().unwrap_or(0) >= 17 {
            // Election ids take precedence over set versions from 6.0 on.
            let fresh = server.election_id() > self.max_election_id
                || (server.election_id() == self.max_election_id
                    && server.set_version() >= self.max_set_version);
            if fresh {
                self.max_election_id = server.election_id();
                self.max_set_version = server.set_version();
            }
            fresh
        } else {
            let mut fresh = true;
            if let (Some(set_version), Some(election_id)) =
                (server.set_version(), server.election_id())
            {
                let later_election = self.max_set_version > Some(set_version)
                    || (self.max_set_version == Some(set_version)
                        && self.max_election_id > Some(election_id));
                if later_election {
                    fresh = false;
                } else {
                    self.max_election_id = Some(election_id);
                }
            }

            if fresh {
                if let Some(set_version) = server.set_version() {
                    if self.max_set_version.map_or(true, |max| set_version > max) {
                        self.max_set_version = Some(set_version);
                    }
                }
            }
            fresh
        };

        if !accepted {
            tracing::debug!(
                server = %server.address,
                server_id = %server.id,
                "ignoring stale primary"
            );
            if let Some(stale) = self.servers.get_mut(&server.id) {
                stale.invalidate(Error::not_established(
                    "member's setVersion or electionId is stale",
                ));
            }
            self.update_rs_type();
            return;
        }

        for other in self.servers.values_mut() {
            if other.id != server.id && other.server_type == ServerType::RsPrimary {
                other.invalidate(Error::not_established(format!(
                    "invalidated: primary replaced by {}",
                    server.address
                )));
            }
        }

        self.add_new_servers(server);

        // The primary's view of membership is authoritative.
        let unreported: Vec<ServerId> = self
            .servers
            .values()
            .filter(|member| {
                !server
                    .known_hosts()
                    .any(|host| member.address.matches_str(host))
            })
            .map(|member| member.id)
            .collect();
        for id in unreported {
            self.remove_server(id);
        }

        self.update_rs_type();
    }

    fn has_primary(&self) -> bool {
        self.servers
            .values()
            .any(|server| server.server_type == ServerType::RsPrimary)
    }

    fn update_rs_type(&mut self) {
        self.topology_type = if self.has_primary() {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    /// Adds every host, passive and arbiter reported by `server` as an Unknown member.
    fn add_new_servers(&mut self, server: &ServerDescription) {
        for host in server.known_hosts() {
            match ServerAddress::parse(host) {
                Ok(address) => {
                    self.add_server(address);
                }
                Err(error) => {
                    tracing::debug!(
                        server = %server.address,
                        host,
                        %error,
                        "ignoring reported host"
                    );
                }
            }
        }
    }

    fn label_unknown_member(&mut self, host: &str, server_type: ServerType) {
        for member in self.servers.values_mut() {
            if member.server_type == ServerType::Unknown && member.address.matches_str(host) {
                member.server_type = server_type;
            }
        }
    }

    /// Recomputes the session timeout as the minimum across data-bearing servers. A single
    /// data-bearing server without one disables sessions for the whole topology.
    fn update_logical_session_timeout(&mut self) {
        let mut timeout: Option<Duration> = None;
        for server in self.servers.values() {
            if !server.server_type.is_data_bearing() {
                continue;
            }
            match server.logical_session_timeout() {
                None => {
                    self.logical_session_timeout = None;
                    return;
                }
                Some(server_timeout) => {
                    timeout = Some(timeout.map_or(server_timeout, |t| t.min(server_timeout)));
                }
            }
        }
        self.logical_session_timeout = timeout;
    }

    /// Check the cluster for a compatibility error, and record the error message if one is found.
    fn check_compatibility(&mut self) {
        self.compatibility_error = self
            .servers
            .values()
            .filter_map(ServerDescription::compatibility_error_message)
            .last();
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::result::Result<(), fmt::Error> {
        write!(f, "{{ Type: {}", self.topology_type)?;

        if let Some(ref set_name) = self.set_name {
            write!(f, ", Set Name: {set_name}")?;
        }

        if let Some(max_set_version) = self.max_set_version {
            write!(f, ", Max Set Version: {max_set_version}")?;
        }

        if let Some(max_election_id) = self.max_election_id {
            write!(f, ", Max Election ID: {max_election_id}")?;
        }

        if let Some(ref compatibility_error) = self.compatibility_error {
            write!(f, ", Compatibility Error: {compatibility_error}")?;
        }

        if !self.servers.is_empty() {
            write!(f, ", Servers: [ ")?;
            for (i, server) in self.servers.values().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{{ Address: {}, Type: {:?}", server.address, server.server_type)?;
                if let Some(error) = server.error() {
                    write!(f, ", Error: {error}")?;
                }
                write!(f, " }}")?;
            }
            write!(f, " ]")?;
        }

        write!(f, " }}")
    }
}

/// The changes between two `TopologyDescription`s, as returned from
/// `TopologyDescription::diff`.
#[derive(Debug)]
pub(crate) struct TopologyDescriptionDiff<'a> {
    pub(crate) removed: HashSet<ServerId>,
    pub(crate) added: HashSet<ServerId>,
    pub(crate) changed_servers: Vec<(&'a ServerDescription, &'a ServerDescription)>,
}
