use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use super::{
    handshake::{HandshakeResult, Handshaker},
    wire::RequestIdGenerator,
    Connection,
    ConnectionTimeouts,
};
use crate::{
    auth::{self, Credential, FirstRound},
    error::{Error, ErrorKind, Result},
    event::command::CommandEventHandler,
    options::{ClusterOptions, ServerAddress},
    runtime::stream::{StreamFactory, TcpStreamFactory},
    sdam::{GenerationMap, HandshakePhase},
};

/// Contains the logic to establish a connection, including handshaking, authenticating, and
/// assigning it a pool generation.
#[derive(Clone)]
pub(crate) struct ConnectionEstablisher {
    /// Handshakes application connections, negotiating mechanisms and speculating authentication
    /// when a credential is configured.
    handshaker: Handshaker,

    /// Handshakes monitoring connections, which never authenticate.
    monitoring_handshaker: Handshaker,

    stream_factory: Arc<dyn StreamFactory>,

    timeouts: ConnectionTimeouts,

    credential: Option<Credential>,

    load_balanced: bool,

    request_ids: RequestIdGenerator,

    next_connection_id: Arc<AtomicU64>,

    command_event_handler: Option<Arc<dyn CommandEventHandler>>,
}

impl std::fmt::Debug for ConnectionEstablisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEstablisher")
            .field("timeouts", &self.timeouts)
            .field("load_balanced", &self.load_balanced)
            .finish_non_exhaustive()
    }
}

impl ConnectionEstablisher {
    pub(crate) fn new(options: &ClusterOptions) -> Self {
        Self {
            handshaker: Handshaker::new(options),
            monitoring_handshaker: Handshaker::for_monitoring(options),
            stream_factory: options
                .stream_factory
                .clone()
                .unwrap_or_else(|| Arc::new(TcpStreamFactory)),
            timeouts: ConnectionTimeouts::new(options.connect_timeout(), options.socket_timeout),
            credential: options.credential.clone(),
            load_balanced: options.is_load_balanced(),
            request_ids: RequestIdGenerator::default(),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            command_event_handler: options.command_event_handler.clone(),
        }
    }

    pub(crate) fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    async fn make_connection(&self, address: ServerAddress) -> Result<Connection> {
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let connection = Connection::connect(address, self.stream_factory.as_ref(), self.timeouts)
            .await?
            .with_request_ids(id, self.request_ids.clone());
        Ok(connection)
    }

    /// Opens and handshakes an application connection. The connection is not yet authenticated;
    /// callers finish with [`ConnectionEstablisher::authenticate`] once the handshake reply has
    /// been applied to the topology.
    pub(crate) async fn establish_connection(
        &self,
        address: ServerAddress,
        generations: &GenerationMap,
    ) -> std::result::Result<(Connection, HandshakeResult), EstablishError> {
        let pre_hello_generation = generations.get(None);

        let mut connection = self
            .make_connection(address)
            .await
            .map_err(|e| EstablishError::pre_hello(e, pre_hello_generation))?
            .with_event_handler(self.command_event_handler.clone());

        let handshake_result = match self.handshaker.handshake(&mut connection).await {
            Ok(result) => result,
            Err(error) => {
                let error = self.negotiation_failure(error);
                return Err(EstablishError::pre_hello(error, pre_hello_generation));
            }
        };

        // A load balancer must identify the backend service so its generation can be tracked.
        let service_id = connection.service_id();
        if self.load_balanced && service_id.is_none() {
            return Err(EstablishError::post_hello(
                ErrorKind::IncompatibleServer {
                    message: "Driver attempted to initialize in load balancing mode, but the \
                              server does not support this mode."
                        .to_string(),
                }
                .into(),
                pre_hello_generation,
                None,
            ));
        }

        connection.generation = generations.get(service_id);

        tracing::debug!(
            server = %connection.address,
            connection_id = connection.id,
            generation = connection.generation,
            service_id = ?service_id,
            "established connection"
        );

        Ok((connection, handshake_result))
    }

    /// Runs the configured credential's conversation on a handshaked connection, finishing the
    /// speculative exchange when there is one. A no-op without a credential.
    pub(crate) async fn authenticate(
        &self,
        connection: &mut Connection,
        first_round: Option<FirstRound>,
    ) -> std::result::Result<(), EstablishError> {
        let Some(ref credential) = self.credential else {
            return Ok(());
        };

        auth::authenticate(connection, credential, first_round)
            .await
            .map_err(|e| {
                EstablishError::post_hello(e, connection.generation, connection.service_id())
            })
    }

    /// Opens and handshakes a connection for a monitor.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        address: ServerAddress,
    ) -> Result<(Connection, HandshakeResult)> {
        let mut connection = self.make_connection(address).await?;
        let handshake_result = self.monitoring_handshaker.handshake(&mut connection).await?;
        Ok((connection, handshake_result))
    }

    /// A hello that was asked to list the user's SASL mechanisms and answered `ok: 0` failed the
    /// authentication, not the server.
    fn negotiation_failure(&self, error: Error) -> Error {
        let negotiating = self.credential.as_ref().is_some_and(|credential| {
            credential.mechanism.is_none() && credential.username.is_some()
        });

        if negotiating && error.is_command_error() {
            let message = format!("Failed to negotiate an authentication mechanism: {error}");
            Error::from(ErrorKind::Authentication { message }).with_source(error)
        } else {
            error
        }
    }
}

/// An error that occurred while establishing a connection, along with how far the handshake
/// got. The phase decides how the topology reacts to the failure.
#[derive(Debug, Clone)]
pub(crate) struct EstablishError {
    pub(crate) cause: Error,
    pub(crate) handshake_phase: HandshakePhase,
}

impl EstablishError {
    fn pre_hello(cause: Error, generation: u32) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PreHello { generation },
        }
    }

    fn post_hello(
        cause: Error,
        generation: u32,
        service_id: Option<crate::bson::oid::ObjectId>,
    ) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PostHello {
                generation,
                service_id,
            },
        }
    }
}
