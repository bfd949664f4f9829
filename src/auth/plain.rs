use crate::{
    auth::{
        sasl::{self, ServerTurn},
        send_auth_command,
        AuthMechanism,
        Credential,
    },
    conn::Connection,
    error::{Error, Result},
};

const MECHANISM: &str = "PLAIN";

/// PLAIN is a single round: the server must finish the conversation on the first message.
pub(super) async fn authenticate(conn: &mut Connection, credential: &Credential) -> Result<()> {
    let (Some(username), Some(password)) = (
        credential.username.as_deref(),
        credential.password.as_deref(),
    ) else {
        return Err(Error::authentication_error(
            MECHANISM,
            "a username and password are required",
        ));
    };
    let source = credential.source.as_deref().unwrap_or("$external");

    let command = sasl::start_command(
        source,
        &AuthMechanism::Plain,
        payload_bytes(username, password),
    );
    let reply = send_auth_command(conn, MECHANISM, command).await?;

    if ServerTurn::parse(MECHANISM, reply)?.done {
        Ok(())
    } else {
        Err(Error::authentication_error(
            MECHANISM,
            "server did not finish the conversation after the first message",
        ))
    }
}

/// `authzid NUL authcid NUL passwd`, with an empty authorization identity.
pub(super) fn payload_bytes(username: &str, password: &str) -> Vec<u8> {
    [b"".as_slice(), username.as_bytes(), password.as_bytes()].join(&0u8)
}
