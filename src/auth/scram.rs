//! SCRAM-SHA-1 and SCRAM-SHA-256 ([RFC 5802], [RFC 7677]) carried over SASL.
//!
//! [RFC 5802]: https://tools.ietf.org/html/rfc5802
//! [RFC 7677]: https://tools.ietf.org/html/rfc7677

use std::{borrow::Cow, str};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{
    digest::{Digest, KeyInit},
    Hmac,
    Mac,
};
use md5::Md5;
use sha1::Sha1;
use sha2::Sha256;

use crate::{
    auth::{
        self,
        sasl::{self, ServerTurn},
        send_auth_command,
        AuthMechanism,
        Credential,
    },
    bson::Document,
    conn::{Command, Connection},
    error::{Error, Result},
};

/// Servers offering fewer PBKDF2 rounds than this are refused.
const MIN_ITERATIONS: u32 = 4096;

/// The gs2 header of a client without channel binding support.
const GS2_HEADER: &str = "n,,";

/// A SCRAM variant, named by its hash function.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub(crate) enum ScramVersion {
    Sha1,
    Sha256,
}

impl ScramVersion {
    pub(crate) fn mechanism(self) -> AuthMechanism {
        match self {
            Self::Sha1 => AuthMechanism::ScramSha1,
            Self::Sha256 => AuthMechanism::ScramSha256,
        }
    }

    fn name(self) -> &'static str {
        self.mechanism().as_str()
    }

    fn hmac(self, key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
        let name = self.name();
        Ok(match self {
            Self::Sha1 => auth::mac::<Hmac<Sha1>>(key, input, name)?.as_ref().to_vec(),
            Self::Sha256 => auth::mac::<Hmac<Sha256>>(key, input, name)?.as_ref().to_vec(),
        })
    }

    fn digest(self, input: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(input).to_vec(),
            Self::Sha256 => Sha256::digest(input).to_vec(),
        }
    }

    /// Checks `signature` against the HMAC of `input` in constant time.
    fn verify(self, key: &[u8], input: &[u8], signature: &[u8]) -> Result<()> {
        match self {
            Self::Sha1 => verify_mac::<Hmac<Sha1>>(key, input, signature, self.name()),
            Self::Sha256 => verify_mac::<Hmac<Sha256>>(key, input, signature, self.name()),
        }
    }

    /// `Hi(Normalize(password), salt, i)`. SCRAM-SHA-1 hashes the MongoDB password digest rather
    /// than the password itself.
    pub(super) fn salt_password(
        self,
        username: &str,
        password: &str,
        salt: &[u8],
        iterations: u32,
    ) -> Result<Vec<u8>> {
        let normalized: Cow<'_, str> = match self {
            Self::Sha1 => Cow::Owned(hex::encode(Md5::digest(format!(
                "{username}:mongo:{password}"
            )))),
            Self::Sha256 => stringprep::saslprep(password).map_err(|_| {
                Error::authentication_error(self.name(), "password is not valid under SASLprep")
            })?,
        };

        let mut salted = match self {
            Self::Sha1 => vec![0u8; 20],
            Self::Sha256 => vec![0u8; 32],
        };
        let derived = match self {
            Self::Sha1 => {
                pbkdf2::pbkdf2::<Hmac<Sha1>>(normalized.as_bytes(), salt, iterations, &mut salted)
            }
            Self::Sha256 => pbkdf2::pbkdf2::<Hmac<Sha256>>(
                normalized.as_bytes(),
                salt,
                iterations,
                &mut salted,
            ),
        };
        derived.map_err(|_| Error::unknown_authentication_error(self.name()))?;
        Ok(salted)
    }

    fn username_and_password<'a>(self, credential: &'a Credential) -> Result<(&'a str, &'a str)> {
        if credential.mechanism_properties.is_some() {
            return Err(Error::authentication_error(
                self.name(),
                "mechanism properties are not supported",
            ));
        }
        match (
            credential.username.as_deref(),
            credential.password.as_deref(),
        ) {
            (Some(username), Some(password)) => Ok((username, password)),
            (None, _) => Err(Error::authentication_error(self.name(), "no username supplied")),
            (_, None) => Err(Error::authentication_error(self.name(), "no password supplied")),
        }
    }

    /// The opening message for `credential`. A speculative one names its database in the body,
    /// since it travels inside a hello.
    pub(crate) fn client_first(
        self,
        credential: &Credential,
        speculative: bool,
    ) -> Result<ClientFirst> {
        let (username, _) = self.username_and_password(credential)?;
        Ok(ClientFirst::new(
            self,
            credential.source.as_deref().unwrap_or("admin"),
            username,
            auth::generate_nonce(),
            speculative,
        ))
    }

    /// Runs the conversation, starting from the server's answer to a speculative first message
    /// when the handshake carried one.
    pub(crate) async fn authenticate(
        self,
        conn: &mut Connection,
        credential: &Credential,
        first_round: Option<FirstRound>,
    ) -> Result<()> {
        let name = self.name();
        let (username, password) = self.username_and_password(credential)?;

        let FirstRound {
            client_first,
            server_first,
        } = match first_round {
            Some(first_round) => first_round,
            None => {
                let client_first = self.client_first(credential, false)?;
                let server_first = send_auth_command(conn, name, client_first.command()).await?;
                FirstRound {
                    client_first,
                    server_first,
                }
            }
        };

        let server_first = ServerFirst::parse(name, ServerTurn::parse(name, server_first)?)?;
        server_first.check(name, &client_first.nonce)?;

        let salted_password = self.salt_password(
            username,
            password,
            &server_first.salt,
            server_first.iterations,
        )?;
        let keys = Keys::derive(self, &salted_password)?;
        let client_final = ClientFinal::new(self, &keys, &client_first, &server_first)?;

        let command = server_first
            .turn
            .reply_command(&client_first.source, client_final.message.clone().into_bytes());
        let server_final = ServerTurn::parse(name, send_auth_command(conn, name, command).await?)?;
        server_first.turn.expect_continued_by(name, &server_final)?;
        self.check_server_final(&keys, &client_final, &server_final)?;

        if server_final.done {
            return Ok(());
        }

        // Servers that ignore skipEmptyExchange want one more, empty, round.
        let command = server_final.reply_command(&client_first.source, Vec::new());
        let last = ServerTurn::parse(name, send_auth_command(conn, name, command).await?)?;
        server_final.expect_continued_by(name, &last)?;
        if !last.done {
            return Err(Error::authentication_error(
                name,
                "server did not finish the conversation",
            ));
        }
        Ok(())
    }

    /// The server's final message carries either its signature or the reason it refused us.
    fn check_server_final(
        self,
        keys: &Keys,
        client_final: &ClientFinal,
        server_final: &ServerTurn,
    ) -> Result<()> {
        let name = self.name();
        let message = str::from_utf8(&server_final.payload)
            .map_err(|_| Error::invalid_authentication_response(name))?;

        match message.split_once('=') {
            Some(("v", signature)) => {
                let signature = BASE64
                    .decode(signature)
                    .map_err(|_| Error::invalid_authentication_response(name))?;
                self.verify(
                    &keys.server,
                    client_final.auth_message.as_bytes(),
                    &signature,
                )
            }
            Some(("e", reason)) => Err(Error::authentication_error(name, reason)),
            _ => Err(Error::invalid_authentication_response(name)),
        }
    }
}

fn verify_mac<M: Mac + KeyInit>(
    key: &[u8],
    input: &[u8],
    signature: &[u8],
    mechanism: &str,
) -> Result<()> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| Error::unknown_authentication_error(mechanism))?;
    mac.update(input);
    mac.verify_slice(signature)
        .map_err(|_| Error::authentication_error(mechanism, "server signature did not verify"))
}

/// `saslname` escaping of RFC 5802: `=` and `,` may not appear bare.
fn escape_username(username: &str) -> Cow<'_, str> {
    if username.contains(['=', ',']) {
        Cow::Owned(username.replace('=', "=3D").replace(',', "=2C"))
    } else {
        Cow::Borrowed(username)
    }
}

/// The keys both sides derive from the salted password.
struct Keys {
    client: Vec<u8>,
    stored: Vec<u8>,
    server: Vec<u8>,
}

impl Keys {
    fn derive(version: ScramVersion, salted_password: &[u8]) -> Result<Self> {
        let client = version.hmac(salted_password, b"Client Key")?;
        Ok(Self {
            stored: version.digest(&client),
            server: version.hmac(salted_password, b"Server Key")?,
            client,
        })
    }
}

/// The client's opening message, kept until the server answers it (possibly inside a hello
/// reply) so the conversation can be finished.
#[derive(Debug)]
pub(crate) struct ClientFirst {
    version: ScramVersion,
    source: String,
    nonce: String,
    /// `client-first-message-bare`, which the auth message repeats.
    bare: String,
    speculative: bool,
}

impl ClientFirst {
    fn new(
        version: ScramVersion,
        source: &str,
        username: &str,
        nonce: String,
        speculative: bool,
    ) -> Self {
        Self {
            version,
            source: source.to_string(),
            bare: format!("n={},r={nonce}", escape_username(username)),
            nonce,
            speculative,
        }
    }

    pub(crate) fn version(&self) -> ScramVersion {
        self.version
    }

    fn message(&self) -> String {
        format!("{GS2_HEADER}{}", self.bare)
    }

    pub(crate) fn command(&self) -> Command {
        let mut command = sasl::start_command(
            &self.source,
            &self.version.mechanism(),
            self.message().into_bytes(),
        );
        if self.speculative {
            command.body.insert("db", self.source.as_str());
        }
        command
    }
}

/// The client's first message together with the server's answer to it.
#[derive(Debug)]
pub(crate) struct FirstRound {
    pub(crate) client_first: ClientFirst,
    pub(crate) server_first: Document,
}

/// `r=<nonce>,s=<salt>,i=<iterations>`, plus the turn it arrived in.
struct ServerFirst {
    turn: ServerTurn,
    message: String,
    nonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

impl ServerFirst {
    fn parse(mechanism: &str, mut turn: ServerTurn) -> Result<Self> {
        let malformed = || Error::invalid_authentication_response(mechanism);
        let message =
            String::from_utf8(std::mem::take(&mut turn.payload)).map_err(|_| malformed())?;

        let (mut nonce, mut salt, mut iterations) = (None, None, None);
        for (key, value) in message.split(',').filter_map(|attr| attr.split_once('=')) {
            match key {
                "r" => nonce = Some(value),
                "s" => salt = Some(value),
                "i" => iterations = Some(value),
                _ => {}
            }
        }

        let nonce = nonce.ok_or_else(malformed)?.to_string();
        let salt = BASE64
            .decode(salt.ok_or_else(malformed)?)
            .map_err(|_| malformed())?;
        let iterations = iterations.ok_or_else(malformed)?.parse().map_err(|_| {
            Error::authentication_error(mechanism, "iteration count is not a number")
        })?;

        Ok(Self {
            turn,
            message,
            nonce,
            salt,
            iterations,
        })
    }

    fn check(&self, mechanism: &str, client_nonce: &str) -> Result<()> {
        if self.turn.done {
            return Err(Error::authentication_error(
                mechanism,
                "server finished the conversation before proving itself",
            ));
        }
        if self.nonce.len() <= client_nonce.len() || !self.nonce.starts_with(client_nonce) {
            return Err(Error::authentication_error(
                mechanism,
                "server nonce does not extend the client nonce",
            ));
        }
        if self.iterations < MIN_ITERATIONS {
            return Err(Error::authentication_error(
                mechanism,
                &format!(
                    "iteration count {} is below the minimum of {MIN_ITERATIONS}",
                    self.iterations
                ),
            ));
        }
        Ok(())
    }
}

/// `c=<gs2 header>,r=<nonce>,p=<proof>` and the auth message the proof signs.
struct ClientFinal {
    message: String,
    auth_message: String,
}

impl ClientFinal {
    fn new(
        version: ScramVersion,
        keys: &Keys,
        client_first: &ClientFirst,
        server_first: &ServerFirst,
    ) -> Result<Self> {
        let without_proof = format!("c={},r={}", BASE64.encode(GS2_HEADER), server_first.nonce);
        let auth_message = format!(
            "{},{},{without_proof}",
            client_first.bare, server_first.message
        );

        let signature = version.hmac(&keys.stored, auth_message.as_bytes())?;
        let proof: Vec<u8> = keys
            .client
            .iter()
            .zip(&signature)
            .map(|(key, signature)| key ^ signature)
            .collect();

        Ok(Self {
            message: format!("{without_proof},p={}", BASE64.encode(proof)),
            auth_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use pretty_assertions::assert_eq;

    use super::{ClientFinal, ClientFirst, Keys, ScramVersion, ServerFirst, ServerTurn};
    use crate::bson::Bson;

    const SHA256: &str = "SCRAM-SHA-256";

    fn turn(payload: &str, done: bool) -> ServerTurn {
        ServerTurn {
            conversation_id: Bson::Int32(1),
            done,
            payload: payload.as_bytes().to_vec(),
        }
    }

    fn server_first(payload: &str) -> ServerFirst {
        ServerFirst::parse(SHA256, turn(payload, false)).unwrap()
    }

    #[test]
    fn low_iteration_counts_are_refused() {
        let error = server_first("r=clientserver,s=c2FsdA==,i=42")
            .check(SHA256, "client")
            .unwrap_err();
        assert!(error.to_string().contains("below the minimum"), "{error}");

        server_first("r=clientserver,s=c2FsdA==,i=4096")
            .check(SHA256, "client")
            .unwrap();
    }

    #[test]
    fn server_nonce_must_extend_client_nonce() {
        for nonce in ["other-nonce", "client"] {
            let error = server_first(&format!("r={nonce},s=c2FsdA==,i=4096"))
                .check(SHA256, "client")
                .unwrap_err();
            assert!(error.to_string().contains("does not extend"), "{error}");
        }
    }

    #[test]
    fn server_first_attributes_are_found_by_key() {
        let parsed = server_first("i=8192,x=ignored,r=abcdef,s=c2FsdA==");
        assert_eq!(parsed.iterations, 8192);
        assert_eq!(parsed.nonce, "abcdef");
        assert_eq!(parsed.salt, b"salt".to_vec());

        assert!(ServerFirst::parse(SHA256, turn("r=abcdef,i=4096", false)).is_err());
        assert!(ServerFirst::parse(SHA256, turn("r=abcdef,s=c2FsdA==,i=many", false)).is_err());
    }

    #[test]
    fn usernames_are_escaped() {
        let client_first =
            ClientFirst::new(ScramVersion::Sha256, "admin", "a=b,c", "nonce".into(), false);
        assert_eq!(client_first.message(), "n,,n=a=3Db=2Cc,r=nonce");
    }

    // RFC 7677, section 3.
    #[test]
    fn sha256_conversation_matches_rfc_vector() {
        let scram = ScramVersion::Sha256;
        let client_first = ClientFirst::new(
            scram,
            "admin",
            "user",
            "rOprNGfwEbeRWgbNEkqO".to_string(),
            false,
        );
        assert_eq!(client_first.message(), "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let server_first = server_first(
            "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,\
             i=4096",
        );
        server_first.check(SHA256, "rOprNGfwEbeRWgbNEkqO").unwrap();

        let salted_password = scram
            .salt_password(
                "user",
                "pencil",
                &server_first.salt,
                server_first.iterations,
            )
            .unwrap();
        let keys = Keys::derive(scram, &salted_password).unwrap();
        let client_final = ClientFinal::new(scram, &keys, &client_first, &server_first).unwrap();
        assert_eq!(
            client_final.message,
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
             p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );

        scram
            .check_server_final(
                &keys,
                &client_final,
                &turn("v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=", true),
            )
            .unwrap();

        let forged = turn(&format!("v={}", BASE64.encode([0u8; 32])), true);
        assert!(scram
            .check_server_final(&keys, &client_final, &forged)
            .is_err());
    }

    #[test]
    fn server_final_error_is_reported() {
        let scram = ScramVersion::Sha1;
        let client_first = ClientFirst::new(scram, "admin", "user", "abc".to_string(), false);
        let server_first = server_first("r=abcdef,s=c2FsdA==,i=4096");
        let keys = Keys::derive(scram, &[0u8; 20]).unwrap();
        let client_final = ClientFinal::new(scram, &keys, &client_first, &server_first).unwrap();

        let error = scram
            .check_server_final(&keys, &client_final, &turn("e=invalid-proof", false))
            .unwrap_err();
        assert!(error.to_string().contains("invalid-proof"), "{error}");
    }
}
