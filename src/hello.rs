use serde::{Deserialize, Serialize};

use crate::{
    bson::{doc, oid::ObjectId, DateTime, Document},
    cluster_time::ClusterTime,
    conn::Command,
    error::{CommandError, Error, ErrorKind, Result},
    options::ServerAddress,
    sdam::{ServerType, TopologyVersion},
    selection_criteria::TagSet,
};

/// The legacy version of the `hello` command which was deprecated in 5.0.
/// To limit usages of the legacy name in the codebase, this constant should be used
/// wherever possible.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";
pub(crate) const LEGACY_HELLO_COMMAND_NAME_LOWERCASE: &str = "ismaster";

/// Construct a heartbeat hello or legacy hello command.
///
/// If `load_balanced` is true or the server indicated `helloOk: true`, `hello` will be used.
/// Otherwise, legacy hello will be used, and if it's unknown whether the server supports hello,
/// the command also will contain `helloOk: true`.
pub(crate) fn hello_command(load_balanced: bool, hello_ok: Option<bool>) -> Command {
    let (mut body, command_name) = if load_balanced || matches!(hello_ok, Some(true)) {
        (doc! { "hello": 1 }, "hello")
    } else {
        (doc! { LEGACY_HELLO_COMMAND_NAME: 1 }, LEGACY_HELLO_COMMAND_NAME)
    };
    if hello_ok.is_none() {
        body.insert("helloOk", true);
    }
    if load_balanced {
        body.insert("loadBalanced", true);
    }

    Command::new(command_name, "admin", body)
}

/// A parsed reply to a hello or legacy hello command.
#[derive(Debug, Clone, Serialize)]
#[non_exhaustive]
pub struct HelloReply {
    /// The address of the server that sent the reply.
    pub server_address: ServerAddress,

    /// The typed fields of the reply.
    pub command_response: HelloCommandResponse,

    /// The reply as it came off the wire.
    pub raw_command_response: Document,

    /// The `$clusterTime` the server gossiped, if any.
    pub cluster_time: Option<ClusterTime>,
}

impl HelloReply {
    /// Parses a raw hello reply. A reply with `ok: 0` becomes a command error carrying the
    /// server's message, and a reply of an unrecognizable shape becomes an invalid response
    /// error.
    pub fn parse(server_address: ServerAddress, raw: Document) -> Result<Self> {
        if !reply_ok(&raw) {
            let command_error: CommandError = crate::bson::from_document(raw.clone())
                .map_err(|_| Error::invalid_response(format!("invalid hello reply: {raw}")))?;
            return Err(ErrorKind::Command(command_error).into());
        }

        let command_response: HelloCommandResponse = crate::bson::from_document(raw.clone())
            .map_err(|e| Error::invalid_response(format!("malformed hello reply: {e}")))?;
        let cluster_time = raw
            .get_document("$clusterTime")
            .ok()
            .and_then(|d| crate::bson::from_document(d.clone()).ok());

        Ok(Self {
            server_address,
            command_response,
            raw_command_response: raw,
            cluster_time,
        })
    }
}

/// Whether a command reply reports success. Numeric `ok` fields of any width are accepted.
pub(crate) fn reply_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(crate::bson::Bson::Double(ok)) => *ok == 1.0,
        Some(crate::bson::Bson::Int32(ok)) => *ok == 1,
        Some(crate::bson::Bson::Int64(ok)) => *ok == 1,
        Some(crate::bson::Bson::Boolean(ok)) => *ok,
        _ => false,
    }
}

/// The response to a `hello` command.
///
/// See the documentation [here](https://www.mongodb.com/docs/manual/reference/command/hello/) for more details.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct HelloCommandResponse {
    /// Whether the server is writable. If true, this instance is a primary in a replica set, a
    /// mongos instance, or a standalone mongod.
    pub is_writable_primary: Option<bool>,

    #[serde(rename = "ismaster")]
    /// Legacy name for `is_writable_primary` field.
    pub is_master: Option<bool>,

    /// Whether or not the server supports using the `hello` command for monitoring instead
    /// of the legacy hello command.
    pub hello_ok: Option<bool>,

    /// The list of all hosts.
    pub hosts: Option<Vec<String>>,

    /// The list of all passives in a replica set.
    pub passives: Option<Vec<String>>,

    /// The list of all arbiters in a replica set.
    pub arbiters: Option<Vec<String>>,

    /// An optional message. This contains the value "isdbgrid" when returned from a mongos.
    pub msg: Option<String>,

    /// The address of the server that returned this `HelloCommandResponse`.
    pub me: Option<String>,

    #[serde(rename = "compression")]
    /// The list of compatible compressors that the server returned.
    pub compressors: Option<Vec<String>>,

    /// The current replica set config version.
    pub set_version: Option<i32>,

    /// The name of the current replica set.
    pub set_name: Option<String>,

    /// Whether the server is hidden.
    pub hidden: Option<bool>,

    /// Whether the server is a secondary.
    pub secondary: Option<bool>,

    /// Whether the server is an arbiter.
    pub arbiter_only: Option<bool>,

    #[serde(rename = "isreplicaset")]
    /// Whether the server is a replica set.
    pub is_replica_set: Option<bool>,

    /// The time in minutes that a session remains active after its most recent use.
    pub logical_session_timeout_minutes: Option<i64>,

    /// Optime and date information for the server's most recent write operation.
    pub last_write: Option<LastWrite>,

    /// The minimum wire version that the server supports.
    pub min_wire_version: Option<i32>,

    /// The maximum wire version that the server supports.
    pub max_wire_version: Option<i32>,

    /// User-defined tags for a replica set member.
    pub tags: Option<TagSet>,

    /// A unique identifier for each election.
    pub election_id: Option<ObjectId>,

    /// The address of current primary member of the replica set.
    pub primary: Option<String>,

    /// A list of SASL mechanisms used to create the user's credential(s).
    pub sasl_supported_mechs: Option<Vec<String>>,

    /// The reply to speculative authentication done in the authentication handshake.
    pub speculative_authenticate: Option<Document>,

    /// The maximum permitted size of a BSON object in bytes.
    pub max_bson_object_size: Option<i64>,

    /// The maximum number of write operations permitted in a write batch.
    pub max_write_batch_size: Option<i64>,

    /// If the connection is to a load balancer, the id of the selected backend.
    pub service_id: Option<ObjectId>,

    /// For internal use.
    pub topology_version: Option<TopologyVersion>,

    /// The maximum permitted size of a BSON wire protocol message.
    pub max_message_size_bytes: Option<i32>,

    /// The server-generated ID for the connection the "hello" command was run on.
    pub connection_id: Option<i64>,
}

impl HelloCommandResponse {
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }
}

/// When a replica set member last applied a write.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct LastWrite {
    /// The wall clock time of the member's most recent write.
    pub last_write_date: DateTime,
}
