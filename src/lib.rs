//! The cluster layer of a MongoDB driver: discovering and monitoring a deployment, selecting a
//! server for an operation, and running commands on it over an established, authenticated
//! connection.
//!
//! A [`Topology`] owns the shared view of the deployment. Readers take cheap copy-on-write
//! snapshots of its [`TopologyDescription`] while monitors (one background task per server in
//! pooled mode, or a blocking scan on demand in single-threaded mode) publish new ones. A
//! [`Cluster`] sits on top of a topology and hands out [`ServerStream`]s:
//!
//! ```no_run
//! # use mongodb_cluster::{bson::doc, conn::Command, error::Result};
//! # use mongodb_cluster::{options::{ClusterOptions, ServerAddress}, Cluster, Topology};
//! # async fn run() -> Result<()> {
//! let options = ClusterOptions::builder()
//!     .hosts(vec![ServerAddress::parse("localhost:27017")?])
//!     .build();
//! let topology = Topology::new(options.clone())?;
//! let mut cluster = Cluster::new(topology, &options);
//!
//! let stream = cluster.stream_for_writes().await?;
//! let reply = cluster
//!     .run_command(&stream, Command::new("ping", "admin", doc! { "ping": 1 }))
//!     .await?;
//! assert_eq!(reply.get_f64("ok").ok(), Some(1.0));
//! # Ok(())
//! # }
//! ```
//!
//! # Feature flags
//!
//! | Feature              | Description                                        | Default |
//! |:---------------------|:---------------------------------------------------|:--------|
//! | `zlib-compression`   | Wire protocol compression with `zlib`.             | yes     |
//! | `snappy-compression` | Wire protocol compression with `snappy`.           | no      |
//! | `zstd-compression`   | Wire protocol compression with `zstd`.             | no      |

#![warn(missing_docs)]
#![allow(clippy::derive_partial_eq_without_eq)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use ::bson;

mod auth;
mod cluster;
mod cluster_time;
mod compression;
pub mod conn;
pub mod error;
pub mod event;
mod hello;
pub mod options;
pub(crate) mod runtime;
mod sdam;
mod selection_criteria;

pub use crate::{
    auth::{AuthMechanism, Credential},
    cluster::{Cluster, ServerStream},
    cluster_time::ClusterTime,
    hello::{HelloCommandResponse, HelloReply, LastWrite},
    runtime::stream::{AsyncStream, StreamFactory, StreamIo, TcpStreamFactory},
    sdam::{
        HandshakePhase,
        SelectedServer,
        ServerDescription,
        ServerId,
        ServerType,
        Topology,
        TopologyDescription,
        TopologyModification,
        TopologyType,
        TopologyVersion,
    },
    selection_criteria::{OperationType, ReadMode, ReadPreference, TagSet},
};
