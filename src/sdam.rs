//! Server Discovery and Monitoring: what is known about each server and the deployment as a
//! whole, how servers are selected, and how that knowledge is kept current.

mod description;
mod monitor;
mod scanner;
#[cfg(test)]
mod test;
mod topology;

pub use self::{
    description::{
        server::{ServerDescription, ServerId, ServerType, TopologyVersion},
        topology::{server_selection::SelectedServer, TopologyDescription, TopologyType},
    },
    topology::{HandshakePhase, Topology, TopologyModification},
};
pub(crate) use self::description::server::GenerationMap;
