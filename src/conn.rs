//! A single established connection to a server and the commands sent over it.

pub(crate) mod command;
pub(crate) mod establish;
pub(crate) mod handshake;
mod stream_description;
pub(crate) mod wire;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use derive_where::derive_where;
use tokio::io::BufStream;

pub use self::command::{Command, DocumentSequence, RawCommandResponse};
pub(crate) use self::stream_description::StreamDescription;
use self::wire::{IncomingMessage, Message, Payload, Query, QueryFlags, RequestIdGenerator};
use crate::{
    bson::{oid::ObjectId, Document},
    compression::{self, Compressor},
    error::{Error, Result},
    event::command::{
        CommandEventHandler,
        CommandFailedEvent,
        CommandStartedEvent,
        CommandSucceededEvent,
        ConnectionInfo,
    },
    options::{ServerAddress, DEFAULT_CONNECT_TIMEOUT},
    runtime::{
        self,
        stream::{AsyncStream, StreamFactory},
    },
};

pub(crate) const DEFAULT_MAX_BSON_OBJECT_SIZE: i64 = 16 * 1024 * 1024;
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48_000_000;
pub(crate) const DEFAULT_MAX_WRITE_BATCH_SIZE: i64 = 100_000;

/// The framing a connection uses for commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WireProtocol {
    /// Legacy OP_QUERY against `<db>.$cmd`, answered with OP_REPLY.
    OpQuery,

    /// OP_MSG, for servers with a max wire version of at least 6.
    OpMsg,
}

/// The time budgets applied to a connection.
#[derive(Clone, Copy, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionTimeouts {
    /// Bounds opening the stream.
    pub connect: Duration,

    /// Bounds each read and write once the stream is open. `None` or zero means no limit.
    pub socket: Option<Duration>,
}

impl ConnectionTimeouts {
    /// Constructs a set of timeouts.
    pub fn new(connect: Duration, socket: Option<Duration>) -> Self {
        Self { connect, socket }
    }
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, None)
    }
}

/// An open stream to one server together with what its handshake negotiated.
#[derive_where(Debug)]
pub struct Connection {
    /// Identifies the connection within its topology. Server streams compare it to detect that
    /// the connection they were handed has since been replaced.
    pub(crate) id: u64,

    pub(crate) address: ServerAddress,

    /// The connection pool generation of the server when this connection was established.
    pub(crate) generation: u32,

    /// The cached StreamDescription from the connection's handshake.
    pub(crate) stream_description: Option<StreamDescription>,

    /// The compressor negotiated during the handshake.
    pub(crate) compressor: Option<Compressor>,

    /// Set once an I/O or framing failure leaves the stream unusable.
    pub(crate) error: Option<Error>,

    pub(crate) time_created: Instant,

    stream: BufStream<AsyncStream>,

    socket_timeout: Option<Duration>,

    request_ids: RequestIdGenerator,

    #[derive_where(skip)]
    command_event_handler: Option<Arc<dyn CommandEventHandler>>,
}

impl Connection {
    /// Opens a stream to `address` through `factory`. The connection is not handshaked.
    pub async fn connect(
        address: ServerAddress,
        factory: &dyn StreamFactory,
        timeouts: ConnectionTimeouts,
    ) -> Result<Self> {
        let stream = runtime::maybe_timeout(Some(timeouts.connect), factory.connect(&address))
            .await??;
        Ok(Self::new(address, stream, timeouts.socket))
    }

    pub(crate) fn new(
        address: ServerAddress,
        stream: AsyncStream,
        socket_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id: 0,
            address,
            generation: 0,
            stream_description: None,
            compressor: None,
            error: None,
            time_created: Instant::now(),
            stream: BufStream::new(stream),
            socket_timeout,
            request_ids: RequestIdGenerator::default(),
            command_event_handler: None,
        }
    }

    /// Draws request ids from a generator shared with the rest of the topology.
    pub(crate) fn with_request_ids(mut self, id: u64, request_ids: RequestIdGenerator) -> Self {
        self.id = id;
        self.request_ids = request_ids;
        self
    }

    pub(crate) fn with_event_handler(
        mut self,
        handler: Option<Arc<dyn CommandEventHandler>>,
    ) -> Self {
        self.command_event_handler = handler;
        self
    }

    /// The address of the server this connection is connected to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Gets the connection's StreamDescription.
    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description
            .as_ref()
            .ok_or_else(|| Error::internal("Stream checked out but not handshaked"))
    }

    pub(crate) fn max_wire_version(&self) -> Option<i32> {
        self.stream_description
            .as_ref()
            .and_then(|description| description.max_wire_version)
    }

    pub(crate) fn service_id(&self) -> Option<ObjectId> {
        self.stream_description
            .as_ref()
            .and_then(|description| description.service_id)
    }

    pub(crate) fn has_errored(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            server_id: self
                .stream_description
                .as_ref()
                .and_then(|description| description.server_connection_id),
            address: self.address.clone(),
        }
    }

    fn max_message_size(&self) -> i32 {
        self.stream_description
            .as_ref()
            .map_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES, |description| {
                description.max_message_size_bytes
            })
    }

    fn mark_errored(&mut self, error: &Error) {
        if self.error.is_none() {
            tracing::debug!(
                server = %self.address,
                connection_id = self.id,
                error = %error,
                "connection errored"
            );
            self.error = Some(error.clone());
        }
    }

    /// Writes a message with the given request id, wrapped in OP_COMPRESSED when a compressor is
    /// given. A message over the size limit fails before anything is written and leaves the
    /// connection usable.
    pub(crate) async fn send_message(
        &mut self,
        request_id: i32,
        payload: &Payload,
        compressor: Option<&Compressor>,
    ) -> Result<()> {
        let max_message_size = self.max_message_size();
        let result = runtime::maybe_timeout(
            self.socket_timeout,
            wire::write_message(
                &mut self.stream,
                request_id,
                0,
                payload,
                compressor,
                max_message_size,
            ),
        )
        .await
        .and_then(|written| written);

        match result {
            Ok(_) => Ok(()),
            Err(error) => {
                if error.is_network_error() {
                    self.mark_errored(&error);
                }
                Err(error)
            }
        }
    }

    /// Reads the reply to `request_id`. Any failure leaves the stream in an unknown position, so
    /// the connection is marked as errored.
    pub(crate) async fn receive_message(&mut self, request_id: i32) -> Result<IncomingMessage> {
        let max_message_size = self.max_message_size();
        let result = runtime::maybe_timeout(
            self.socket_timeout,
            wire::read_message(&mut self.stream, max_message_size),
        )
        .await
        .and_then(|message| message)
        .and_then(|message| {
            if message.response_to == request_id {
                Ok(message)
            } else {
                Err(Error::invalid_response(format!(
                    "expected a reply to request {request_id}, but got a reply to {}",
                    message.response_to
                )))
            }
        });

        if let Err(ref error) = result {
            self.mark_errored(error);
        }
        result
    }

    /// Sends a command with the framing its handshake negotiated and returns the server's
    /// reply, emitting command monitoring events when a handler is configured.
    ///
    /// An `Ok(...)` result simply means the server received the command and that the reply was
    /// read; it does not imply anything about the success of the command itself.
    pub async fn run_command(&mut self, command: Command) -> Result<RawCommandResponse> {
        let protocol = self.stream_description()?.wire_protocol();
        self.execute(&command, protocol, true).await
    }

    /// Sends a command without emitting monitoring events. Used by the handshake and
    /// authentication, which choose their framing themselves.
    pub(crate) async fn send_command(
        &mut self,
        command: &Command,
        protocol: WireProtocol,
    ) -> Result<RawCommandResponse> {
        self.execute(command, protocol, false).await
    }

    async fn execute(
        &mut self,
        command: &Command,
        protocol: WireProtocol,
        emit_events: bool,
    ) -> Result<RawCommandResponse> {
        let request_id = self.request_ids.next();
        let handler = self
            .command_event_handler
            .clone()
            .filter(|_| emit_events);
        let should_redact = command.should_redact();

        if let Some(ref handler) = handler {
            handler.handle_command_started_event(CommandStartedEvent {
                command: if should_redact {
                    Document::new()
                } else {
                    command.flattened_body()
                },
                db: command.target_db.clone(),
                command_name: command.name.clone(),
                request_id,
                connection: self.info(),
                service_id: self.service_id(),
            });
        }

        let start = Instant::now();
        let result = self.round_trip(request_id, command, protocol).await;

        if let Some(handler) = handler {
            let duration = start.elapsed();
            let failure = match result {
                Ok(ref response) if response.is_success() => None,
                Ok(ref response) => Some(
                    response
                        .validate()
                        .err()
                        .unwrap_or_else(|| Error::invalid_response("command failed")),
                ),
                Err(ref error) => Some(error.clone()),
            };

            match (failure, result.as_ref()) {
                (None, Ok(response)) => {
                    handler.handle_command_succeeded_event(CommandSucceededEvent {
                        duration,
                        reply: if should_redact {
                            Document::new()
                        } else {
                            response.raw.clone()
                        },
                        command_name: command.name.clone(),
                        request_id,
                        connection: self.info(),
                        service_id: self.service_id(),
                    })
                }
                (failure, _) => {
                    let mut failure =
                        failure.unwrap_or_else(|| Error::internal("missing command outcome"));
                    if should_redact {
                        failure.redact();
                    }
                    handler.handle_command_failed_event(CommandFailedEvent {
                        duration,
                        command_name: command.name.clone(),
                        failure,
                        request_id,
                        connection: self.info(),
                        service_id: self.service_id(),
                    })
                }
            }
        }

        result
    }

    async fn round_trip(
        &mut self,
        request_id: i32,
        command: &Command,
        protocol: WireProtocol,
    ) -> Result<RawCommandResponse> {
        let payload = match protocol {
            WireProtocol::OpMsg => Payload::Message(Message::from_command(command)?),
            WireProtocol::OpQuery => {
                let flags = if command.secondary_ok {
                    QueryFlags::SECONDARY_OK
                } else {
                    QueryFlags::empty()
                };
                Payload::Query(Query::from_command(command, flags)?)
            }
        };

        let compressor = self
            .compressor
            .clone()
            .filter(|_| compression::is_compressible(&command.name));

        self.send_message(request_id, &payload, compressor.as_ref())
            .await?;
        let reply = self.receive_message(request_id).await?;

        match reply.payload.into_document() {
            Ok(document) => Ok(RawCommandResponse::new(self.address.clone(), document)),
            Err(error) => {
                let error = Error::invalid_response(format!(
                    "could not decode the reply from {}",
                    self.address
                ))
                .with_source(error);
                self.mark_errored(&error);
                Err(error)
            }
        }
    }
}
