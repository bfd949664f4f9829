use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    cluster_time::ClusterTime,
    options::ServerAddress,
    sdam::{ServerDescription, ServerId, TopologyType},
};

/// A handle to the connection the [`Cluster`](crate::Cluster) holds for one server, valid for a
/// single operation.
///
/// The stream carries a copy of the server's description taken when it was handed out, so it
/// stays readable after the topology moves on. Once the underlying connection is dropped, for
/// example by [`Cluster::disconnect_node`](crate::Cluster::disconnect_node), the stream is no
/// longer valid and commands run on it fail.
#[derive(Clone, Debug)]
pub struct ServerStream {
    description: ServerDescription,
    topology_type: TopologyType,
    cluster_time: Option<ClusterTime>,
    must_use_primary: bool,
    pub(super) connection_id: u64,
    alive: Arc<AtomicBool>,
}

impl ServerStream {
    pub(super) fn new(
        description: ServerDescription,
        topology_type: TopologyType,
        cluster_time: Option<ClusterTime>,
        connection_id: u64,
        alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            description,
            topology_type,
            cluster_time,
            must_use_primary: false,
            connection_id,
            alive,
        }
    }

    pub(super) fn with_must_use_primary(mut self, must_use_primary: bool) -> Self {
        self.must_use_primary = must_use_primary;
        self
    }

    /// The description of the server as of when the stream was handed out.
    pub fn server_description(&self) -> &ServerDescription {
        &self.description
    }

    /// The id of the server this stream is connected to.
    pub fn server_id(&self) -> ServerId {
        self.description.id()
    }

    /// The address of the server this stream is connected to.
    pub fn address(&self) -> &ServerAddress {
        self.description.address()
    }

    /// The type of the topology as of when the stream was handed out.
    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    /// The topology's cluster time as of when the stream was handed out.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// Whether an aggregation with a write stage was redirected to the primary because some
    /// server is too old to run it on a secondary. Commands on such a stream ignore their read
    /// preference.
    pub fn must_use_primary(&self) -> bool {
        self.must_use_primary
    }

    /// Whether the connection behind this stream is still open.
    pub fn is_valid(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
