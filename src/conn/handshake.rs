#[cfg(test)]
mod test;

use std::{
    sync::LazyLock,
    time::{Duration, Instant},
};

use crate::{
    auth::{self, ClientFirst, Credential, FirstRound},
    bson::{doc, Bson, Document},
    compression::{self, Compressor},
    conn::{Command, Connection, StreamDescription, WireProtocol},
    error::Result,
    hello::{hello_command, HelloReply},
    options::ClusterOptions,
};

const DRIVER_NAME: &str = "mongodb-cluster";

#[derive(Clone, Debug)]
struct ClientMetadata {
    application: Option<AppMetadata>,
    driver: DriverMetadata,
    os: OsMetadata,
    platform: Option<String>,
}

#[derive(Clone, Debug)]
struct AppMetadata {
    name: String,
}

#[derive(Clone, Debug)]
struct DriverMetadata {
    name: String,
    version: String,
}

#[derive(Clone, Debug)]
struct OsMetadata {
    os_type: String,
    architecture: String,
}

impl From<ClientMetadata> for Bson {
    fn from(metadata: ClientMetadata) -> Self {
        let mut metadata_doc = Document::new();

        if let Some(application) = metadata.application {
            metadata_doc.insert("application", doc! { "name": application.name });
        }

        metadata_doc.insert(
            "driver",
            doc! {
                "name": metadata.driver.name,
                "version": metadata.driver.version,
            },
        );

        metadata_doc.insert(
            "os",
            doc! {
                "type": metadata.os.os_type,
                "architecture": metadata.os.architecture,
            },
        );

        if let Some(platform) = metadata.platform {
            metadata_doc.insert("platform", platform);
        }

        Bson::Document(metadata_doc)
    }
}

/// The handshake metadata that can be determined statically. Cloned into the `client` field of
/// every handshake.
static BASE_CLIENT_METADATA: LazyLock<ClientMetadata> = LazyLock::new(|| ClientMetadata {
    application: None,
    driver: DriverMetadata {
        name: DRIVER_NAME.into(),
        version: env!("CARGO_PKG_VERSION").into(),
    },
    os: OsMetadata {
        os_type: std::env::consts::OS.into(),
        architecture: std::env::consts::ARCH.into(),
    },
    platform: Some("tokio".into()),
});

/// Contains the logic needed to handshake a connection.
#[derive(Debug, Clone)]
pub(crate) struct Handshaker {
    /// The hello command to send when handshaking. This will always be identical given the same
    /// options, so it is built when the Handshaker is created.
    command: Command,

    credential: Option<Credential>,

    compressors: Vec<Compressor>,

    load_balanced: bool,
}

impl Handshaker {
    /// Creates a handshaker for application connections, which negotiate authentication.
    pub(crate) fn new(options: &ClusterOptions) -> Self {
        Self::build(options, options.credential.clone())
    }

    /// Creates a handshaker for monitoring connections, which never authenticate.
    pub(crate) fn for_monitoring(options: &ClusterOptions) -> Self {
        Self::build(options, None)
    }

    fn build(options: &ClusterOptions, credential: Option<Credential>) -> Self {
        let load_balanced = options.is_load_balanced();
        let mut metadata = BASE_CLIENT_METADATA.clone();
        if let Some(ref app_name) = options.app_name {
            metadata.application = Some(AppMetadata {
                name: app_name.clone(),
            });
        }

        let mut command = hello_command(load_balanced, None);
        command.body.insert("client", metadata);

        let compressors = options.compressors();
        if !compressors.is_empty() {
            let names: Vec<Bson> = compressors
                .iter()
                .map(|compressor| Bson::String(compressor.name().to_string()))
                .collect();
            command.body.insert("compression", names);
        }

        if let Some(ref credential) = credential {
            credential.append_needed_mechanism_negotiation(&mut command.body);
            command.target_db = credential.resolved_source().to_string();
        }

        // The reply tells us whether the server is a secondary, so the handshake must be allowed
        // to run on one.
        command.secondary_ok = true;

        Self {
            command,
            credential,
            compressors,
            load_balanced,
        }
    }

    /// Runs the handshake on a freshly opened connection. On success the connection's stream
    /// description and compressor are set.
    pub(crate) async fn handshake(&self, conn: &mut Connection) -> Result<HandshakeResult> {
        let mut command = self.command.clone();

        let client_first = match self.credential {
            Some(ref credential) => set_speculative_auth_info(&mut command.body, credential)?,
            None => None,
        };

        // Servers announce OP_MSG support in this very reply, so only a load balancer, which
        // requires a modern server, is greeted with OP_MSG.
        let protocol = if self.load_balanced {
            WireProtocol::OpMsg
        } else {
            WireProtocol::OpQuery
        };

        let start = Instant::now();
        let response = conn.send_command(&command, protocol).await?;
        let round_trip_time = start.elapsed();

        let mut hello_reply = HelloReply::parse(conn.address.clone(), response.into_document())?;

        conn.stream_description = Some(StreamDescription::from_hello_reply(&hello_reply));
        conn.compressor = compression::negotiate(
            &self.compressors,
            hello_reply.command_response.compressors.as_deref(),
        );

        tracing::trace!(
            server = %conn.address,
            connection_id = conn.id,
            max_wire_version = ?hello_reply.command_response.max_wire_version,
            compressor = ?conn.compressor.as_ref().map(Compressor::name),
            "handshake completed"
        );

        // Record the client's message and the server's response from speculative
        // authentication if the server did send a response.
        let first_round = client_first.and_then(|client_first| {
            hello_reply
                .command_response
                .speculative_authenticate
                .take()
                .map(|server_first| client_first.into_first_round(server_first))
        });

        Ok(HandshakeResult {
            hello_reply,
            first_round,
            round_trip_time,
        })
    }
}

/// The information returned from the server as part of the handshake.
///
/// Also optionally includes the first round of speculative authentication if applicable.
#[derive(Debug)]
pub(crate) struct HandshakeResult {
    /// The response from the server.
    pub(crate) hello_reply: HelloReply,

    /// The first round of speculative authentication, if applicable.
    pub(crate) first_round: Option<FirstRound>,

    /// How long the handshake round trip took.
    pub(crate) round_trip_time: Duration,
}

/// Updates the handshake command document with the speculative authentication info.
fn set_speculative_auth_info(
    command: &mut Document,
    credential: &Credential,
) -> Result<Option<ClientFirst>> {
    let Some(client_first) = auth::speculative_payload(credential)? else {
        return Ok(None);
    };

    command.insert("speculativeAuthenticate", client_first.to_document());

    Ok(Some(client_first))
}
