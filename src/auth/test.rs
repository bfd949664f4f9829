use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use pretty_assertions::assert_eq;
use sha2::{Digest, Sha256};

use super::{speculative_payload, AuthMechanism, Credential};
use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Document},
    conn::{establish::ConnectionEstablisher, StreamDescription},
    options::ClusterOptions,
    sdam::GenerationMap,
    test::{address, error_reply, standalone_reply, MockDeployment, MockRequest, MockResponse},
};

const HOST: &str = "a:27017";
const USERNAME: &str = "user";
const PASSWORD: &str = "pencil";
const SALT: &[u8] = b"mock salt";
const ITERATIONS: u32 = 4096;

fn scram_credential(mechanism: Option<AuthMechanism>) -> Credential {
    Credential::builder()
        .username(USERNAME.to_string())
        .password(PASSWORD.to_string())
        .mechanism(mechanism)
        .build()
}

fn sasl_reply(payload: impl Into<Vec<u8>>, done: bool) -> Document {
    doc! {
        "ok": 1,
        "conversationId": 1,
        "done": done,
        "payload": Binary { subtype: BinarySubtype::Generic, bytes: payload.into() },
    }
}

fn hmac_sha256(key: &[u8], input: &[u8]) -> Vec<u8> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).unwrap();
    mac.update(input);
    mac.finalize().into_bytes().to_vec()
}

/// Server side of SCRAM-SHA-256 for a single user.
#[derive(Default)]
struct ScramServer {
    /// Answer the hello's `speculativeAuthenticate` instead of waiting for `saslStart`.
    speculate: bool,

    /// Leave the final `done` unset, as servers that predate `skipEmptyExchange` do.
    legacy_empty_exchange: bool,

    password: Option<&'static str>,

    /// The client-first-bare and server-first messages of the conversation in progress.
    conversation: Mutex<Option<(String, String)>>,
}

impl ScramServer {
    fn salted_password(&self) -> Vec<u8> {
        let password = self.password.unwrap_or(PASSWORD);
        let mut salted = vec![0u8; 32];
        pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), SALT, ITERATIONS, &mut salted)
            .unwrap();
        salted
    }

    fn server_first(&self, client_first: &[u8]) -> Document {
        let client_first = std::str::from_utf8(client_first).unwrap();
        let bare = client_first.strip_prefix("n,,").unwrap().to_string();
        let client_nonce = bare.split(",r=").nth(1).unwrap();
        let server_first = format!(
            "r={client_nonce}server,s={},i={ITERATIONS}",
            BASE64.encode(SALT)
        );
        *self.conversation.lock().unwrap() = Some((bare, server_first.clone()));
        sasl_reply(server_first, false)
    }

    fn server_final(&self, client_final: &[u8]) -> Document {
        if client_final.is_empty() {
            return sasl_reply(Vec::new(), true);
        }

        let client_final = std::str::from_utf8(client_final).unwrap();
        let (without_proof, proof) = client_final.split_once(",p=").unwrap();
        let (bare, server_first) = self.conversation.lock().unwrap().clone().unwrap();
        let auth_message = format!("{bare},{server_first},{without_proof}");

        let salted = self.salted_password();
        let client_key = hmac_sha256(&salted, b"Client Key");
        let stored_key = Sha256::digest(&client_key);
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let expected_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(key, signature)| key ^ signature)
            .collect();
        if BASE64.decode(proof).unwrap() != expected_proof {
            return error_reply(18, "AuthenticationFailed", "Authentication failed.");
        }

        let server_key = hmac_sha256(&salted, b"Server Key");
        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());
        sasl_reply(
            format!("v={}", BASE64.encode(server_signature)),
            !self.legacy_empty_exchange,
        )
    }

    fn answer(&self, request: &MockRequest) -> MockResponse {
        if request.is_hello() {
            let mut reply = standalone_reply();
            if request.body.contains_key("saslSupportedMechs") {
                reply.insert("saslSupportedMechs", vec!["SCRAM-SHA-1", "SCRAM-SHA-256"]);
            }
            if let (true, Ok(speculative)) = (
                self.speculate,
                request.body.get_document("speculativeAuthenticate"),
            ) {
                let payload = speculative.get_binary_generic("payload").unwrap();
                reply.insert("speculativeAuthenticate", self.server_first(payload));
            }
            return MockResponse::Reply(reply);
        }

        let payload = request.body.get_binary_generic("payload").unwrap();
        match request.command_name.as_str() {
            "saslStart" => MockResponse::Reply(self.server_first(payload)),
            "saslContinue" => MockResponse::Reply(self.server_final(payload)),
            other => panic!("unexpected command {other}"),
        }
    }
}

/// Handshakes and authenticates one connection to a SCRAM server, returning the outcome and the
/// authentication commands the server saw.
async fn authenticate_against(
    server: ScramServer,
    credential: Credential,
) -> (crate::error::Result<()>, Vec<MockRequest>) {
    let server = Arc::new(server);
    authenticate_with(credential, move |request| server.answer(request)).await
}

async fn authenticate_with(
    credential: Credential,
    handler: impl Fn(&MockRequest) -> MockResponse + Send + Sync + 'static,
) -> (crate::error::Result<()>, Vec<MockRequest>) {
    let mock = MockDeployment::new();
    mock.set_handler(HOST, handler);

    let options = ClusterOptions {
        credential: Some(credential),
        ..mock.options(&[HOST])
    };
    let establisher = ConnectionEstablisher::new(&options);
    let (mut connection, handshake) = establisher
        .establish_connection(address(HOST), &GenerationMap::default())
        .await
        .unwrap();

    let result = establisher
        .authenticate(&mut connection, handshake.first_round)
        .await
        .map_err(|error| error.cause);
    (result, mock.commands(HOST))
}

fn names(requests: &[MockRequest]) -> Vec<&str> {
    requests
        .iter()
        .map(|request| request.command_name.as_str())
        .collect()
}

#[tokio::test]
async fn scram_sha_256_skips_the_empty_exchange() {
    let credential = scram_credential(Some(AuthMechanism::ScramSha256));
    let (result, requests) = authenticate_against(ScramServer::default(), credential).await;

    result.unwrap();
    assert_eq!(names(&requests), vec!["saslStart", "saslContinue"]);

    let sasl_start = &requests[0].body;
    assert_eq!(sasl_start.get_str("mechanism"), Ok("SCRAM-SHA-256"));
    assert_eq!(sasl_start.get_str("$db"), Ok("admin"));
    assert_eq!(
        sasl_start.get_document("options"),
        Ok(&doc! { "skipEmptyExchange": true })
    );
}

#[tokio::test]
async fn scram_finishes_the_legacy_empty_exchange() {
    let server = ScramServer {
        legacy_empty_exchange: true,
        ..Default::default()
    };
    let credential = scram_credential(Some(AuthMechanism::ScramSha256));
    let (result, requests) = authenticate_against(server, credential).await;

    result.unwrap();
    assert_eq!(
        names(&requests),
        vec!["saslStart", "saslContinue", "saslContinue"]
    );
    assert!(requests[2]
        .body
        .get_binary_generic("payload")
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn speculative_authentication_saves_a_round_trip() {
    let server = ScramServer {
        speculate: true,
        ..Default::default()
    };
    let (result, requests) = authenticate_against(server, scram_credential(None)).await;

    result.unwrap();
    assert_eq!(names(&requests), vec!["saslContinue"]);
}

#[tokio::test]
async fn negotiated_mechanism_is_used_without_speculation() {
    let (result, requests) =
        authenticate_against(ScramServer::default(), scram_credential(None)).await;

    result.unwrap();
    assert_eq!(requests[0].body.get_str("mechanism"), Ok("SCRAM-SHA-256"));
}

#[tokio::test]
async fn wrong_passwords_are_authentication_errors() {
    let server = ScramServer {
        password: Some("not the password"),
        ..Default::default()
    };
    let credential = scram_credential(Some(AuthMechanism::ScramSha256));
    let (result, requests) = authenticate_against(server, credential).await;

    let error = result.unwrap_err();
    assert!(error.is_auth_error(), "{error:?}");
    assert_eq!(names(&requests), vec!["saslStart", "saslContinue"]);
}

#[tokio::test]
async fn speculative_x509_completes_in_the_handshake() {
    let mock = MockDeployment::new();
    mock.set_handler(HOST, |request| {
        let mut reply = standalone_reply();
        if request.body.contains_key("speculativeAuthenticate") {
            reply.insert(
                "speculativeAuthenticate",
                doc! { "dbname": "$external", "user": "CN=client" },
            );
        }
        MockResponse::Reply(reply)
    });

    let credential = Credential::builder()
        .mechanism(AuthMechanism::MongoDbX509)
        .build();
    let options = ClusterOptions {
        credential: Some(credential),
        ..mock.options(&[HOST])
    };
    let establisher = ConnectionEstablisher::new(&options);
    let (mut connection, handshake) = establisher
        .establish_connection(address(HOST), &GenerationMap::default())
        .await
        .unwrap();
    assert!(handshake.first_round.is_some());

    establisher
        .authenticate(&mut connection, handshake.first_round)
        .await
        .unwrap();
    assert!(mock.commands(HOST).is_empty());

    let hello = &mock.requests(HOST)[0].body;
    assert_eq!(
        hello.get_document("speculativeAuthenticate"),
        Ok(&doc! { "authenticate": 1, "mechanism": "MONGODB-X509", "db": "$external" })
    );
}

fn plain_credential() -> Credential {
    Credential::builder()
        .username(USERNAME.to_string())
        .password(PASSWORD.to_string())
        .mechanism(AuthMechanism::Plain)
        .build()
}

/// A PLAIN server answering `saslStart` with `reply`.
fn plain_server(reply: Document) -> impl Fn(&MockRequest) -> MockResponse + Send + Sync {
    move |request| {
        if request.is_hello() {
            MockResponse::Reply(standalone_reply())
        } else {
            MockResponse::Reply(reply.clone())
        }
    }
}

#[tokio::test]
async fn plain_authenticates_in_one_round() {
    let (result, requests) =
        authenticate_with(plain_credential(), plain_server(sasl_reply(Vec::new(), true))).await;

    result.unwrap();
    assert_eq!(names(&requests), vec!["saslStart"]);
    assert_eq!(requests[0].body.get_str("$db"), Ok("$external"));
    assert!(!requests[0].body.contains_key("options"));
}

#[tokio::test]
async fn replies_without_ok_are_not_successes() {
    let mut reply = sasl_reply(Vec::new(), true);
    reply.remove("ok");
    let (result, _) = authenticate_with(plain_credential(), plain_server(reply)).await;

    let error = result.unwrap_err();
    assert!(error.is_auth_error(), "{error:?}");
    assert!(
        error.to_string().contains("invalid server response"),
        "{error}"
    );
}

#[tokio::test]
async fn failed_replies_report_the_server_message() {
    let reply = doc! { "ok": 0, "errmsg": "LDAP bind refused", "code": 18 };
    let (result, _) = authenticate_with(plain_credential(), plain_server(reply)).await;

    let error = result.unwrap_err();
    assert!(error.is_auth_error(), "{error:?}");
    assert!(error.to_string().contains("LDAP bind refused"), "{error}");
}

#[tokio::test]
async fn scram_replies_without_ok_are_not_successes() {
    let server = Arc::new(ScramServer::default());
    let handler = move |request: &MockRequest| match server.answer(request) {
        MockResponse::Reply(mut reply) if request.command_name == "saslContinue" => {
            reply.remove("ok");
            MockResponse::Reply(reply)
        }
        other => other,
    };
    let credential = scram_credential(Some(AuthMechanism::ScramSha256));
    let (result, requests) = authenticate_with(credential, handler).await;

    assert!(result.unwrap_err().is_auth_error());
    assert_eq!(names(&requests), vec!["saslStart", "saslContinue"]);
}

#[test]
fn negotiation_prefers_scram_sha_256() {
    let description = |mechs: Option<Vec<&str>>| StreamDescription {
        sasl_supported_mechs: mechs.map(|mechs| mechs.into_iter().map(String::from).collect()),
        ..Default::default()
    };

    assert_eq!(
        AuthMechanism::from_stream_description(&description(Some(vec![
            "SCRAM-SHA-1",
            "SCRAM-SHA-256"
        ]))),
        AuthMechanism::ScramSha256
    );
    assert_eq!(
        AuthMechanism::from_stream_description(&description(Some(vec!["SCRAM-SHA-1"]))),
        AuthMechanism::ScramSha1
    );
    assert_eq!(
        AuthMechanism::from_stream_description(&description(None)),
        AuthMechanism::ScramSha1
    );
}

#[test]
fn negotiation_is_requested_only_without_a_mechanism() {
    let mut hello = doc! {};
    scram_credential(None).append_needed_mechanism_negotiation(&mut hello);
    assert_eq!(hello.get_str("saslSupportedMechs"), Ok("admin.user"));

    let mut hello = doc! {};
    scram_credential(Some(AuthMechanism::ScramSha1))
        .append_needed_mechanism_negotiation(&mut hello);
    assert!(hello.is_empty());
}

#[test]
fn sources_default_by_mechanism() {
    assert_eq!(scram_credential(None).resolved_source(), "admin");
    assert_eq!(
        scram_credential(Some(AuthMechanism::Plain)).resolved_source(),
        "$external"
    );

    let credential = Credential::builder()
        .username(USERNAME.to_string())
        .source("users".to_string())
        .build();
    assert_eq!(credential.resolved_source(), "users");
}

#[test]
fn credentials_are_validated_for_their_mechanism() {
    assert!(scram_credential(None).validate().is_ok());
    assert!(Credential::default().validate().is_err());

    let external_scram = Credential::builder()
        .username(USERNAME.to_string())
        .source("$external".to_string())
        .mechanism(AuthMechanism::ScramSha256)
        .build();
    assert!(external_scram.validate().is_err());

    let x509_with_password = Credential::builder()
        .password(PASSWORD.to_string())
        .mechanism(AuthMechanism::MongoDbX509)
        .build();
    assert!(x509_with_password.validate().is_err());

    let empty_plain_user = Credential::builder()
        .username(String::new())
        .password(PASSWORD.to_string())
        .mechanism(AuthMechanism::Plain)
        .build();
    assert!(empty_plain_user.validate().is_err());
}

#[test]
fn debug_output_hides_secrets() {
    let rendered = format!("{:?}", scram_credential(None));
    assert!(!rendered.contains(PASSWORD));
    assert!(!rendered.contains(USERNAME));
}

#[test]
fn speculative_payloads_by_mechanism() {
    let scram = speculative_payload(&scram_credential(None))
        .unwrap()
        .unwrap()
        .to_document();
    assert_eq!(scram.get_i32("saslStart"), Ok(1));
    assert_eq!(scram.get_str("mechanism"), Ok("SCRAM-SHA-256"));
    assert_eq!(scram.get_str("db"), Ok("admin"));
    let payload = scram.get_binary_generic("payload").unwrap();
    assert!(payload.starts_with(b"n,,n=user,r="));

    let plain = scram_credential(Some(AuthMechanism::Plain));
    assert!(speculative_payload(&plain).unwrap().is_none());
}

#[test]
fn plain_payload_has_an_empty_authorization_identity() {
    assert_eq!(
        super::plain::payload_bytes(USERNAME, PASSWORD),
        b"\0user\0pencil".to_vec()
    );
}

#[test]
fn mechanism_names_round_trip() {
    for mechanism in [
        AuthMechanism::ScramSha1,
        AuthMechanism::ScramSha256,
        AuthMechanism::MongoDbX509,
        AuthMechanism::Plain,
    ] {
        assert_eq!(mechanism.as_str().parse::<AuthMechanism>().unwrap(), mechanism);
    }
    assert!("GSSAPI".parse::<AuthMechanism>().is_err());
}
