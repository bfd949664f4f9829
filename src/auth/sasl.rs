//! The `saslStart`/`saslContinue` framing shared by the SCRAM and PLAIN conversations.

use crate::{
    auth::AuthMechanism,
    bson::{doc, spec::BinarySubtype, Binary, Bson, Document},
    conn::Command,
    error::{Error, Result},
};

fn binary(bytes: Vec<u8>) -> Binary {
    Binary {
        subtype: BinarySubtype::Generic,
        bytes,
    }
}

/// The command opening a conversation with the client's first message.
pub(super) fn start_command(source: &str, mechanism: &AuthMechanism, payload: Vec<u8>) -> Command {
    let mut body = doc! {
        "saslStart": 1,
        "mechanism": mechanism.as_str(),
        "payload": binary(payload),
    };
    // SCRAM servers may then finish on the client's final message instead of an empty round.
    if matches!(
        mechanism,
        AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256
    ) {
        body.insert("options", doc! { "skipEmptyExchange": true });
    }
    Command::new("saslStart", source, body)
}

/// One message from the server in a SASL conversation, taken from a `saslStart`/`saslContinue`
/// reply or from the `speculativeAuthenticate` field of a hello reply.
#[derive(Debug)]
pub(super) struct ServerTurn {
    pub(super) conversation_id: Bson,
    pub(super) done: bool,
    pub(super) payload: Vec<u8>,
}

impl ServerTurn {
    pub(super) fn parse(mechanism: &str, mut reply: Document) -> Result<Self> {
        let malformed = || Error::invalid_authentication_response(mechanism);

        let conversation_id = reply.remove("conversationId").ok_or_else(malformed)?;
        let done = reply.get_bool("done").map_err(|_| malformed())?;
        let payload = match reply.remove("payload") {
            Some(Bson::Binary(Binary { bytes, .. })) => bytes,
            _ => return Err(malformed()),
        };

        Ok(Self {
            conversation_id,
            done,
            payload,
        })
    }

    /// The `saslContinue` carrying the client's reply to this turn.
    pub(super) fn reply_command(&self, source: &str, payload: Vec<u8>) -> Command {
        let body = doc! {
            "saslContinue": 1,
            "conversationId": self.conversation_id.clone(),
            "payload": binary(payload),
        };
        Command::new("saslContinue", source, body)
    }

    /// Fails unless `next` continues the conversation this turn belongs to.
    pub(super) fn expect_continued_by(&self, mechanism: &str, next: &ServerTurn) -> Result<()> {
        if next.conversation_id != self.conversation_id {
            return Err(Error::authentication_error(
                mechanism,
                "server switched conversationId mid-conversation",
            ));
        }
        Ok(())
    }
}
