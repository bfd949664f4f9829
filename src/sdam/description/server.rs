#[cfg(test)]
mod test;

use std::{collections::HashMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    bson::{oid::ObjectId, DateTime},
    cluster_time::ClusterTime,
    error::{Error, Result},
    hello::HelloReply,
    options::ServerAddress,
    selection_criteria::TagSet,
};

pub(crate) const DRIVER_MIN_DB_VERSION: &str = "3.6";
pub(crate) const DRIVER_MIN_WIRE_VERSION: i32 = 6;
pub(crate) const DRIVER_MAX_WIRE_VERSION: i32 = 25;

/// Weight given to a fresh round trip time sample in the moving average.
const RTT_ALPHA: f64 = 0.2;

/// Enum representing the possible types of servers that the driver can connect to.
#[derive(Debug, Deserialize, Clone, Copy, Eq, PartialEq, Serialize, Default, Hash)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    #[serde(rename = "RSPrimary")]
    RsPrimary,

    /// A secondary node in a replica set.
    #[serde(rename = "RSSecondary")]
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    #[serde(rename = "RSArbiter")]
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    #[serde(rename = "RSOther")]
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the replica
    /// set config.
    #[serde(rename = "RSGhost")]
    RsGhost,

    /// A load-balancing proxy between the driver and the MongoDB deployment.
    LoadBalancer,

    /// A server that another member of a replica set reported as primary, but which has not been
    /// checked yet. Never selectable.
    PossiblePrimary,

    /// A server that the driver hasn't yet communicated with or can't connect to.
    #[default]
    Unknown,
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
                | ServerType::LoadBalancer
        )
    }

    pub(crate) fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown | ServerType::PossiblePrimary)
    }
}

/// A process-local identifier assigned to a server when it is added to a topology. Ids are never
/// reused within one topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub(crate) u32);

impl ServerId {
    /// The numeric value of this id.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic process identifier and counter reported by a server alongside each state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyVersion {
    pub(crate) process_id: ObjectId,
    pub(crate) counter: i64,
}

impl TopologyVersion {
    /// Whether this version supersedes `existing`. A different process id always does.
    pub(crate) fn is_more_recent_than(&self, existing: TopologyVersion) -> bool {
        self.process_id != existing.process_id || self.counter > existing.counter
    }

    /// Whether this version strictly precedes `existing` from the same process.
    pub(crate) fn is_older_than(&self, existing: TopologyVersion) -> bool {
        self.process_id == existing.process_id && self.counter < existing.counter
    }
}

/// Connection-pool epochs of one server. Load-balanced deployments track one epoch per backend
/// service; everything else uses the entry keyed by `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct GenerationMap {
    generations: HashMap<Option<ObjectId>, u32>,
}

impl GenerationMap {
    pub(crate) fn get(&self, service_id: Option<ObjectId>) -> u32 {
        self.generations.get(&service_id).copied().unwrap_or(0)
    }

    pub(crate) fn increment(&mut self, service_id: Option<ObjectId>) -> u32 {
        let generation = self.generations.entry(service_id).or_insert(0);
        *generation += 1;
        *generation
    }
}

/// The last-known state of one server.
#[derive(Debug, Clone)]
pub struct ServerDescription {
    pub(crate) id: ServerId,
    pub(crate) address: ServerAddress,
    pub(crate) server_type: ServerType,
    pub(crate) last_update_time: Option<DateTime>,
    pub(crate) average_round_trip_time: Option<Duration>,

    // Either the error from the last check, or the last hello reply. A server that was just added
    // to the topology has neither, which is represented by `Ok(None)`.
    pub(crate) reply: Result<Option<HelloReply>>,

    pub(crate) generation: GenerationMap,
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.id != other.id
            || self.address != other.address
            || self.server_type != other.server_type
            || self.generation != other.generation
        {
            return false;
        }

        match (self.reply.as_ref(), other.reply.as_ref()) {
            (Ok(self_reply), Ok(other_reply)) => {
                let self_response = self_reply.as_ref().map(|r| &r.command_response);
                let other_response = other_reply.as_ref().map(|r| &r.command_response);

                self_response == other_response
            }
            (Err(self_err), Err(other_err)) => self_err.to_string() == other_err.to_string(),
            _ => false,
        }
    }
}

impl ServerDescription {
    /// An Unknown description for a server that has not been checked yet.
    pub fn new(id: ServerId, address: ServerAddress) -> Self {
        Self {
            id,
            address,
            server_type: ServerType::Unknown,
            last_update_time: None,
            average_round_trip_time: None,
            reply: Ok(None),
            generation: GenerationMap::default(),
        }
    }

    /// Folds the outcome of a hello into this description. The id, address and pool generations
    /// survive; everything else is replaced.
    ///
    /// A failed check leaves the server Unknown with the error recorded and its round trip time
    /// reset. A successful check infers the type from the reply and folds `round_trip_time` into
    /// the moving average.
    pub fn handle_hello(
        &mut self,
        reply: Result<HelloReply>,
        round_trip_time: Option<Duration>,
    ) {
        self.last_update_time = Some(DateTime::now());

        match reply {
            Err(error) => {
                self.server_type = ServerType::Unknown;
                self.average_round_trip_time = None;
                self.reply = Err(error);
            }
            Ok(mut reply) => {
                self.server_type = reply.command_response.server_type();
                normalize_hostnames(&mut reply);

                self.average_round_trip_time = match (self.average_round_trip_time, round_trip_time)
                {
                    (average, None) => average,
                    (None, Some(sample)) => Some(sample),
                    (Some(average), Some(sample)) => Some(
                        sample.mul_f64(RTT_ALPHA) + average.mul_f64(1.0 - RTT_ALPHA),
                    ),
                };
                self.reply = Ok(Some(reply));
            }
        }
    }

    /// Marks this server Unknown because of `error`, dropping the previous reply.
    pub fn invalidate(&mut self, error: Error) {
        self.handle_hello(Err(error), None);
    }

    /// The process-local id of this server.
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// The address of this server.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The type of this server as of its last check.
    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    /// The moving average of this server's round trip times.
    pub fn round_trip_time(&self) -> Option<Duration> {
        self.average_round_trip_time
    }

    /// The error from the last check of this server, if it failed.
    pub fn error(&self) -> Option<&Error> {
        self.reply.as_ref().err()
    }

    pub(crate) fn hello_reply(&self) -> Option<&HelloReply> {
        self.reply.as_ref().ok().and_then(|reply| reply.as_ref())
    }

    /// Whether a hello reply has been received from this server.
    pub fn has_hello_response(&self) -> bool {
        self.hello_reply().is_some()
    }

    /// Whether this server has answered a hello with a type other than possible primary.
    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    pub(crate) fn compatibility_error_message(&self) -> Option<String> {
        if !self.server_type.is_available() {
            return None;
        }
        let reply = self.hello_reply()?;

        let hello_min_wire_version = reply.command_response.min_wire_version.unwrap_or(0);
        if hello_min_wire_version > DRIVER_MAX_WIRE_VERSION {
            return Some(format!(
                "Server at {} requires wire version {}, but this version of the driver only \
                 supports up to {}",
                self.address, hello_min_wire_version, DRIVER_MAX_WIRE_VERSION,
            ));
        }

        let hello_max_wire_version = reply.command_response.max_wire_version.unwrap_or(0);
        if hello_max_wire_version < DRIVER_MIN_WIRE_VERSION {
            return Some(format!(
                "Server at {} reports wire version {}, but this version of the driver requires at \
                 least {} (MongoDB {}).",
                self.address, hello_max_wire_version, DRIVER_MIN_WIRE_VERSION, DRIVER_MIN_DB_VERSION
            ));
        }

        None
    }

    pub(crate) fn set_name(&self) -> Option<&str> {
        self.hello_reply()
            .and_then(|reply| reply.command_response.set_name.as_deref())
    }

    /// Every host this server reports as a member: hosts, passives, then arbiters.
    pub(crate) fn known_hosts(&self) -> impl Iterator<Item = &String> {
        self.hello_reply().into_iter().flat_map(|reply| {
            let response = &reply.command_response;
            response
                .hosts
                .iter()
                .flatten()
                .chain(response.passives.iter().flatten())
                .chain(response.arbiters.iter().flatten())
        })
    }

    /// Whether the server reports a `me` that differs from the address it was reached at.
    pub(crate) fn invalid_me(&self) -> bool {
        match self
            .hello_reply()
            .and_then(|reply| reply.command_response.me.as_deref())
        {
            Some(me) => !self.address.matches_str(me),
            None => false,
        }
    }

    pub(crate) fn primary(&self) -> Option<&str> {
        self.hello_reply()
            .and_then(|reply| reply.command_response.primary.as_deref())
    }

    pub(crate) fn set_version(&self) -> Option<i32> {
        self.hello_reply()
            .and_then(|reply| reply.command_response.set_version)
    }

    pub(crate) fn election_id(&self) -> Option<ObjectId> {
        self.hello_reply()
            .and_then(|reply| reply.command_response.election_id)
    }

    /// The minimum wire version reported by this server.
    pub fn min_wire_version(&self) -> Option<i32> {
        self.hello_reply()
            .and_then(|reply| reply.command_response.min_wire_version)
    }

    /// The maximum wire version reported by this server.
    pub fn max_wire_version(&self) -> Option<i32> {
        self.hello_reply()
            .and_then(|reply| reply.command_response.max_wire_version)
    }

    pub(crate) fn last_write_date(&self) -> Option<DateTime> {
        self.hello_reply()
            .and_then(|reply| reply.command_response.last_write.as_ref())
            .map(|write| write.last_write_date)
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.hello_reply()
            .and_then(|reply| reply.command_response.logical_session_timeout_minutes)
            .and_then(|minutes| u64::try_from(minutes).ok())
            .map(|minutes| Duration::from_secs(minutes * 60))
    }

    pub(crate) fn cluster_time(&self) -> Option<&ClusterTime> {
        self.hello_reply()
            .and_then(|reply| reply.cluster_time.as_ref())
    }

    /// The topology version from the last reply, or from the error that invalidated this server.
    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match self.reply {
            Ok(Some(ref reply)) => reply.command_response.topology_version,
            Ok(None) => None,
            Err(ref e) => e.topology_version(),
        }
    }

    /// The backend service id reported by a load balancer.
    pub fn service_id(&self) -> Option<ObjectId> {
        self.hello_reply()
            .and_then(|reply| reply.command_response.service_id)
    }

    /// The connection-pool generation for the given backend service.
    pub fn generation(&self, service_id: Option<ObjectId>) -> u32 {
        self.generation.get(service_id)
    }

    /// The largest BSON document this server accepts.
    pub fn max_bson_object_size(&self) -> i64 {
        self.hello_reply()
            .and_then(|reply| reply.command_response.max_bson_object_size)
            .unwrap_or(crate::conn::DEFAULT_MAX_BSON_OBJECT_SIZE)
    }

    /// The largest wire protocol message this server accepts.
    pub fn max_message_size_bytes(&self) -> i32 {
        self.hello_reply()
            .and_then(|reply| reply.command_response.max_message_size_bytes)
            .unwrap_or(crate::conn::DEFAULT_MAX_MESSAGE_SIZE_BYTES)
    }

    /// The largest number of writes this server accepts in one batch.
    pub fn max_write_batch_size(&self) -> i64 {
        self.hello_reply()
            .and_then(|reply| reply.command_response.max_write_batch_size)
            .unwrap_or(crate::conn::DEFAULT_MAX_WRITE_BATCH_SIZE)
    }

    /// The replica set tags of this server.
    pub fn tags(&self) -> Option<&TagSet> {
        self.hello_reply()
            .and_then(|reply| reply.command_response.tags.as_ref())
    }

    /// Whether every tag in `tag_set` appears on this server with the same value. An empty set
    /// matches any server.
    pub fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let server_tags = match self.tags() {
            Some(tags) => tags,
            None => return tag_set.is_empty(),
        };

        tag_set
            .iter()
            .all(|(key, val)| server_tags.get(key) == Some(val))
    }
}

fn normalize_hostnames(reply: &mut HelloReply) {
    let response = &mut reply.command_response;
    for list in [
        &mut response.hosts,
        &mut response.passives,
        &mut response.arbiters,
    ]
    .into_iter()
    .flatten()
    {
        for host in list.iter_mut() {
            *host = host.to_lowercase();
        }
    }

    if let Some(ref mut me) = response.me {
        *me = me.to_lowercase();
    }
    if let Some(ref mut primary) = response.primary {
        *primary = primary.to_lowercase();
    }
}
