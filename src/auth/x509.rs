use crate::{
    auth::{send_auth_command, Credential},
    bson::{doc, Document},
    conn::Command,
    error::{Error, Result},
};

const MECHANISM: &str = "MONGODB-X509";

/// Constructs the first client message in the X.509 handshake.
pub(super) fn build_client_first(credential: &Credential) -> Command {
    let mut auth_command_doc = doc! {
        "authenticate": 1,
        "mechanism": MECHANISM,
    };

    if let Some(ref username) = credential.username {
        auth_command_doc.insert("username", username);
    }

    Command::new("authenticate", "$external", auth_command_doc)
}

/// The speculative form carries its database in the body, since it rides inside a hello.
pub(super) fn build_speculative_client_first(credential: &Credential) -> Command {
    let mut command = build_client_first(credential);
    command.body.insert("db", "$external");
    command
}

/// Performs X.509 authentication for a given stream. A speculative reply arrives inside a
/// successful hello and so carries no `ok` of its own.
pub(super) async fn authenticate_stream(
    conn: &mut crate::conn::Connection,
    credential: &Credential,
    server_first: impl Into<Option<Document>>,
) -> Result<()> {
    let server_response = match server_first.into() {
        Some(server_first) => server_first,
        None => send_auth_command(conn, MECHANISM, build_client_first(credential)).await?,
    };

    if server_response.get_str("dbname") != Ok("$external") {
        return Err(Error::authentication_error(
            MECHANISM,
            "Authentication failed",
        ));
    }

    Ok(())
}
