use std::time::Duration;

use crate::{
    bson::oid::ObjectId,
    conn::{
        WireProtocol,
        DEFAULT_MAX_BSON_OBJECT_SIZE,
        DEFAULT_MAX_MESSAGE_SIZE_BYTES,
        DEFAULT_MAX_WRITE_BATCH_SIZE,
    },
    hello::HelloReply,
    options::ServerAddress,
    sdam::ServerType,
};

/// The smallest wire version that understands OP_MSG.
const OP_MSG_WIRE_VERSION: i32 = 6;

/// Contains information about a given server in a format digestible by a connection.
#[derive(Debug, Default, Clone)]
pub(crate) struct StreamDescription {
    /// The address of the server.
    pub(crate) server_address: ServerAddress,

    /// The type of the server when the handshake occurred.
    pub(crate) initial_server_type: ServerType,

    /// The maximum wire version that the server understands.
    pub(crate) max_wire_version: Option<i32>,

    /// The minimum wire version that the server understands.
    pub(crate) min_wire_version: Option<i32>,

    /// The supported authentication mechanisms that the server understands.
    pub(crate) sasl_supported_mechs: Option<Vec<String>>,

    /// How long sessions started on this server will stay alive without
    /// executing an operation before the server kills them.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The maximum size of writes (excluding command overhead) that should be sent to the server.
    pub(crate) max_bson_object_size: i64,

    /// The maximum number of inserts, updates, or deletes that can be included in a write batch.
    pub(crate) max_write_batch_size: i64,

    /// Whether the server associated with this connection supports the `hello` command.
    pub(crate) hello_ok: bool,

    /// The maximum permitted size of a BSON wire protocol message.
    pub(crate) max_message_size_bytes: i32,

    /// If the connection is to a load balancer, the id of the selected backend.
    pub(crate) service_id: Option<ObjectId>,

    /// The server-side id of the connection.
    pub(crate) server_connection_id: Option<i64>,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a `HelloReply`.
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        let response = &reply.command_response;
        Self {
            server_address: reply.server_address.clone(),
            initial_server_type: response.server_type(),
            max_wire_version: response.max_wire_version,
            min_wire_version: response.min_wire_version,
            sasl_supported_mechs: response.sasl_supported_mechs.clone(),
            logical_session_timeout: response
                .logical_session_timeout_minutes
                .and_then(|mins| u64::try_from(mins).ok())
                .map(|mins| Duration::from_secs(mins * 60)),
            max_bson_object_size: response
                .max_bson_object_size
                .unwrap_or(DEFAULT_MAX_BSON_OBJECT_SIZE),
            max_write_batch_size: response
                .max_write_batch_size
                .unwrap_or(DEFAULT_MAX_WRITE_BATCH_SIZE),
            hello_ok: response.hello_ok.unwrap_or(false),
            max_message_size_bytes: response
                .max_message_size_bytes
                .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES),
            service_id: response.service_id,
            server_connection_id: response.connection_id,
        }
    }

    /// The framing used for every command after the handshake.
    pub(crate) fn wire_protocol(&self) -> WireProtocol {
        if self.max_wire_version.unwrap_or(0) >= OP_MSG_WIRE_VERSION {
            WireProtocol::OpMsg
        } else {
            WireProtocol::OpQuery
        }
    }

    /// Gets a description of a stream for a connection to a server with the provided
    /// maxWireVersion.
    #[cfg(test)]
    pub(crate) fn with_wire_version(max_wire_version: i32) -> Self {
        Self {
            max_wire_version: Some(max_wire_version),
            min_wire_version: Some(0),
            max_bson_object_size: DEFAULT_MAX_BSON_OBJECT_SIZE,
            max_write_batch_size: DEFAULT_MAX_WRITE_BATCH_SIZE,
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE_BYTES,
            ..Default::default()
        }
    }
}
