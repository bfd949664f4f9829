//! Contains the types needed to specify the auth configuration for a cluster, and the
//! conversations that authenticate each new application connection.

mod plain;
mod sasl;
mod scram;
#[cfg(test)]
mod test;
mod x509;

use std::{borrow::Cow, fmt::Debug, str::FromStr};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{digest::KeyInit, Mac};
use rand::Rng;
use serde::Deserialize;
use typed_builder::TypedBuilder;

use self::scram::ScramVersion;
use crate::{
    bson::Document,
    conn::{Command, Connection, StreamDescription},
    error::{Error, ErrorKind, Result},
    hello::reply_ok,
    sdam::ServerType,
};

const SCRAM_SHA_1_STR: &str = "SCRAM-SHA-1";
const SCRAM_SHA_256_STR: &str = "SCRAM-SHA-256";
const MONGODB_X509_STR: &str = "MONGODB-X509";
const PLAIN_STR: &str = "PLAIN";

/// The authentication mechanisms supported by this crate.
#[derive(Clone, Deserialize, PartialEq, Eq, Hash, Debug)]
#[non_exhaustive]
pub enum AuthMechanism {
    /// The SCRAM-SHA-1 mechanism as defined in [RFC 5802](http://tools.ietf.org/html/rfc5802).
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-scram/) for more information.
    ScramSha1,

    /// The SCRAM-SHA-256 mechanism which extends [RFC 5802](http://tools.ietf.org/html/rfc5802) and is formally defined in [RFC 7677](https://tools.ietf.org/html/rfc7677).
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-scram/) for more information.
    ScramSha256,

    /// The MONGODB-X509 mechanism based on the usage of X.509 certificates to validate a client
    /// where the distinguished subject name of the client certificate acts as the username.
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-x.509/) for more information.
    MongoDbX509,

    /// The SASL PLAIN mechanism, as defined in [RFC 4616](), is used in MongoDB to perform LDAP
    /// authentication and cannot be used for any other type of authentication.
    /// Since the credentials are stored outside of MongoDB, the "$external" database must be used
    /// for authentication.
    Plain,
}

impl AuthMechanism {
    /// Picks SCRAM-SHA-256 when the handshake advertised it for the user, and SCRAM-SHA-1
    /// otherwise.
    pub(crate) fn from_stream_description(description: &StreamDescription) -> AuthMechanism {
        let scram_sha_256_found = description
            .sasl_supported_mechs
            .as_ref()
            .map(|ms| ms.iter().any(|m| m == AuthMechanism::ScramSha256.as_str()))
            .unwrap_or(false);

        if scram_sha_256_found {
            AuthMechanism::ScramSha256
        } else {
            AuthMechanism::ScramSha1
        }
    }

    /// Determines if the provided credentials have the required information to perform
    /// authentication.
    pub fn validate_credential(&self, credential: &Credential) -> Result<()> {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 => {
                if credential.username.is_none() {
                    return Err(Error::invalid_argument(
                        "No username provided for SCRAM authentication",
                    ));
                };
                if credential.source.as_deref() == Some("$external") {
                    return Err(Error::invalid_argument(
                        "$external is not a valid auth source for SCRAM authentication",
                    ));
                }
                Ok(())
            }
            AuthMechanism::MongoDbX509 => {
                if credential.password.is_some() {
                    return Err(Error::invalid_argument(
                        "A password cannot be specified with MONGODB-X509",
                    ));
                }

                if credential.source.as_deref().unwrap_or("$external") != "$external" {
                    return Err(Error::invalid_argument(
                        "only $external may be specified as an auth source for MONGODB-X509",
                    ));
                }

                Ok(())
            }
            AuthMechanism::Plain => {
                match credential.username.as_deref() {
                    None => {
                        return Err(Error::invalid_argument(
                            "No username provided for PLAIN authentication",
                        ))
                    }
                    Some("") => {
                        return Err(Error::invalid_argument(
                            "Username for PLAIN authentication must be non-empty",
                        ))
                    }
                    Some(_) => {}
                }

                if credential.password.is_none() {
                    return Err(Error::invalid_argument(
                        "No password provided for PLAIN authentication",
                    ));
                }

                Ok(())
            }
        }
    }

    /// Returns this `AuthMechanism` as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 => SCRAM_SHA_1_STR,
            AuthMechanism::ScramSha256 => SCRAM_SHA_256_STR,
            AuthMechanism::MongoDbX509 => MONGODB_X509_STR,
            AuthMechanism::Plain => PLAIN_STR,
        }
    }

    /// The database a credential authenticates against when it names none.
    pub(crate) fn default_source(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 => "admin",
            AuthMechanism::MongoDbX509 | AuthMechanism::Plain => "$external",
        }
    }

    /// Constructs the first message to be sent to the server as part of the authentication
    /// handshake, which can be used for speculative authentication.
    pub(crate) fn build_speculative_client_first(
        &self,
        credential: &Credential,
    ) -> Result<Option<ClientFirst>> {
        match self {
            Self::ScramSha1 => Ok(Some(ClientFirst::Scram(
                ScramVersion::Sha1.client_first(credential, true)?,
            ))),
            Self::ScramSha256 => Ok(Some(ClientFirst::Scram(
                ScramVersion::Sha256.client_first(credential, true)?,
            ))),
            Self::MongoDbX509 => Ok(Some(ClientFirst::X509(Box::new(
                x509::build_speculative_client_first(credential),
            )))),
            Self::Plain => Ok(None),
        }
    }

    async fn authenticate_stream(
        &self,
        conn: &mut Connection,
        credential: &Credential,
    ) -> Result<()> {
        self.validate_credential(credential)?;

        match self {
            AuthMechanism::ScramSha1 => {
                ScramVersion::Sha1
                    .authenticate(conn, credential, None)
                    .await
            }
            AuthMechanism::ScramSha256 => {
                ScramVersion::Sha256
                    .authenticate(conn, credential, None)
                    .await
            }
            AuthMechanism::MongoDbX509 => x509::authenticate_stream(conn, credential, None).await,
            AuthMechanism::Plain => plain::authenticate(conn, credential).await,
        }
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(str: &str) -> Result<Self> {
        match str {
            SCRAM_SHA_1_STR => Ok(AuthMechanism::ScramSha1),
            SCRAM_SHA_256_STR => Ok(AuthMechanism::ScramSha256),
            MONGODB_X509_STR => Ok(AuthMechanism::MongoDbX509),
            PLAIN_STR => Ok(AuthMechanism::Plain),
            _ => Err(ErrorKind::InvalidArgument {
                message: format!("invalid mechanism string: {}", str),
            }
            .into()),
        }
    }
}

/// A struct containing authentication information.
///
/// Some fields (mechanism and source) may be omitted and will either be negotiated or assigned a
/// default value, depending on the values of other fields in the credential.
#[derive(Clone, Default, Deserialize, TypedBuilder, PartialEq)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct Credential {
    /// The username to authenticate with. This applies to all mechanisms but may be omitted when
    /// authenticating via MONGODB-X509.
    pub username: Option<String>,

    /// The database used to authenticate. This applies to all mechanisms and defaults to "admin"
    /// in SCRAM authentication mechanisms and "$external" for MONGODB-X509 and PLAIN.
    pub source: Option<String>,

    /// The password to authenticate with. This does not apply to all mechanisms.
    pub password: Option<String>,

    /// Which authentication mechanism to use. If not provided, one will be negotiated with the
    /// server.
    pub mechanism: Option<AuthMechanism>,

    /// Additional properties for the given mechanism. None of the supported mechanisms accept
    /// any.
    pub mechanism_properties: Option<Document>,
}

impl Credential {
    /// Checks that the credential carries what its mechanism needs. A credential without a
    /// mechanism will negotiate SCRAM and so needs a username.
    pub fn validate(&self) -> Result<()> {
        match self.mechanism {
            Some(ref mechanism) => mechanism.validate_credential(self),
            None => AuthMechanism::ScramSha256.validate_credential(self),
        }
    }

    pub(crate) fn resolved_source(&self) -> &str {
        match self.source {
            Some(ref source) => source.as_str(),
            None => self
                .mechanism
                .as_ref()
                .map_or("admin", |mechanism| mechanism.default_source()),
        }
    }

    /// If the mechanism is missing, append the appropriate mechanism negotiation key-value-pair to
    /// the provided hello or legacy hello command document.
    pub(crate) fn append_needed_mechanism_negotiation(&self, command: &mut Document) {
        if let (Some(username), None) = (self.username.as_ref(), self.mechanism.as_ref()) {
            command.insert(
                "saslSupportedMechs",
                format!("{}.{}", self.resolved_source(), username),
            );
        }
    }

    /// Attempts to authenticate a stream according to this credential, returning an error
    /// result on failure. A mechanism may be negotiated if one is not provided as part of the
    /// credential.
    async fn authenticate_stream(
        &self,
        conn: &mut Connection,
        first_round: Option<FirstRound>,
    ) -> Result<()> {
        let stream_description = conn.stream_description()?;

        // Arbiters hold no user data and reject authentication.
        if stream_description.initial_server_type == ServerType::RsArbiter {
            return Ok(());
        };

        // If speculative authentication returned a response, then short-circuit the authentication
        // logic and use the first round from the handshake.
        if let Some(first_round) = first_round {
            return match first_round {
                FirstRound::Scram(first_round) => {
                    first_round
                        .client_first
                        .version()
                        .authenticate(conn, self, Some(first_round))
                        .await
                }
                FirstRound::X509(server_first) => {
                    x509::authenticate_stream(conn, self, server_first).await
                }
            };
        }

        let mechanism = match self.mechanism {
            None => Cow::Owned(AuthMechanism::from_stream_description(stream_description)),
            Some(ref m) => Cow::Borrowed(m),
        };

        mechanism.authenticate_stream(conn, self).await
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Credential")
            .field(&"REDACTED".to_string())
            .finish()
    }
}

/// Contains the first client message sent as part of the authentication handshake.
#[derive(Debug)]
pub(crate) enum ClientFirst {
    Scram(scram::ClientFirst),
    X509(Box<Command>),
}

impl ClientFirst {
    pub(crate) fn to_document(&self) -> Document {
        match self {
            Self::Scram(client_first) => client_first.command().body,
            Self::X509(command) => command.body.clone(),
        }
    }

    pub(crate) fn into_first_round(self, server_first: Document) -> FirstRound {
        match self {
            Self::Scram(client_first) => FirstRound::Scram(scram::FirstRound {
                client_first,
                server_first,
            }),
            Self::X509(..) => FirstRound::X509(server_first),
        }
    }
}

/// Contains the complete first round of the authentication handshake, including the client message
/// and the server response.
#[derive(Debug)]
pub(crate) enum FirstRound {
    Scram(scram::FirstRound),
    X509(Document),
}

/// Builds the `speculativeAuthenticate` payload for a handshake. Credentials without a mechanism
/// speculate with SCRAM-SHA-256; servers too old to prefer it also ignore speculation.
pub(crate) fn speculative_payload(credential: &Credential) -> Result<Option<ClientFirst>> {
    credential
        .mechanism
        .as_ref()
        .unwrap_or(&AuthMechanism::ScramSha256)
        .build_speculative_client_first(credential)
}

/// Authenticates a freshly handshaked connection, finishing the speculative conversation when
/// the handshake reply carried the server's first message.
///
/// Every failure, including network failures mid-conversation, is reported as an
/// authentication error whose source is the underlying cause.
pub(crate) async fn authenticate(
    conn: &mut Connection,
    credential: &Credential,
    first_round: Option<FirstRound>,
) -> Result<()> {
    let mechanism = credential
        .mechanism
        .as_ref()
        .map_or("negotiated", |mechanism| mechanism.as_str());
    let speculative = first_round.is_some();

    match credential.authenticate_stream(conn, first_round).await {
        Ok(()) => {
            tracing::debug!(
                server = %conn.address,
                connection_id = conn.id,
                mechanism,
                speculative,
                "authenticated connection"
            );
            Ok(())
        }
        Err(error) => {
            tracing::debug!(
                server = %conn.address,
                connection_id = conn.id,
                mechanism,
                error = %error,
                "authentication failed"
            );
            if error.is_auth_error() {
                Err(error)
            } else {
                let message = error.to_string();
                Err(Error::from(ErrorKind::Authentication { message }).with_source(error))
            }
        }
    }
}

/// Sends one step of an authentication conversation with the connection's negotiated framing,
/// failing unless the server acknowledged it with `ok: 1`.
async fn send_auth_command(
    conn: &mut Connection,
    mechanism: &str,
    command: Command,
) -> Result<Document> {
    let protocol = conn.stream_description()?.wire_protocol();
    let reply = conn.send_command(&command, protocol).await?.into_document();
    validate_reply(mechanism, &reply)?;
    Ok(reply)
}

fn validate_reply(mechanism: &str, reply: &Document) -> Result<()> {
    if reply_ok(reply) {
        return Ok(());
    }
    match reply.get_str("errmsg") {
        Ok(message) => Err(Error::authentication_error(mechanism, message)),
        Err(_) if reply.contains_key("ok") => {
            Err(Error::authentication_error(mechanism, "Authentication failure"))
        }
        Err(_) => Err(Error::invalid_authentication_response(mechanism)),
    }
}

pub(crate) fn generate_nonce() -> String {
    BASE64.encode(rand::rng().random::<[u8; 32]>())
}

fn mac<M: Mac + KeyInit>(
    key: &[u8],
    input: &[u8],
    auth_mechanism: &str,
) -> Result<impl AsRef<[u8]>> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| Error::unknown_authentication_error(auth_mechanism))?;
    mac.update(input);
    Ok(mac.finalize().into_bytes())
}
