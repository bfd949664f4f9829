use serde::de::DeserializeOwned;

use crate::{
    bson::{Bson, Document},
    cluster_time::ClusterTime,
    error::{CommandError, Error, ErrorKind, Result},
    hello::{reply_ok, LEGACY_HELLO_COMMAND_NAME_LOWERCASE},
    options::ServerAddress,
    selection_criteria::ReadPreference,
};

/// Commands whose bodies and replies carry credentials and are hidden from command monitoring.
const REDACTED_COMMANDS: [&str; 9] = [
    "authenticate",
    "saslstart",
    "saslcontinue",
    "getnonce",
    "createuser",
    "updateuser",
    "copydbgetnonce",
    "copydbsaslstart",
    "copydb",
];

/// An assembled command, ready to be framed as OP_MSG or OP_QUERY.
///
/// Building the body from user intent (read and write concerns, sessions, transactions) happens
/// before the command reaches this crate.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct Command {
    /// The command name, which must also be the first key of `body`.
    pub name: String,

    /// The database the command runs against.
    pub target_db: String,

    /// The command document.
    pub body: Document,

    /// OP_MSG payload type 1 sections, such as the `documents` of an insert.
    pub document_sequences: Vec<DocumentSequence>,

    /// Whether the command is a retryable write. Failures of such commands are labelled with
    /// `RetryableWriteError` when a retry against a freshly selected server may succeed.
    pub retryable_write: bool,

    /// The read preference the command was selected with.
    pub read_preference: Option<ReadPreference>,

    /// Sets the SECONDARY_OK flag when the command is framed as OP_QUERY.
    pub(crate) secondary_ok: bool,
}

/// A named sequence of documents sent outside of the command body.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSequence {
    /// The field the documents belong to, for example `documents` or `updates`.
    pub identifier: String,

    /// The documents.
    pub documents: Vec<Document>,
}

impl Command {
    /// Constructs a new command.
    pub fn new(name: impl Into<String>, target_db: impl Into<String>, body: Document) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
            document_sequences: Vec::new(),
            retryable_write: false,
            read_preference: None,
            secondary_ok: false,
        }
    }

    /// Marks this command as a retryable write.
    pub fn retryable_write(mut self) -> Self {
        self.retryable_write = true;
        self
    }

    /// Sets the read preference this command should be routed with.
    pub fn with_read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.read_preference = Some(read_preference);
        self
    }

    /// Adds an OP_MSG document sequence. Connections speaking OP_QUERY fold the sequence back
    /// into the body as an array.
    pub fn add_document_sequence(
        &mut self,
        identifier: impl Into<String>,
        documents: Vec<Document>,
    ) {
        self.document_sequences.push(DocumentSequence {
            identifier: identifier.into(),
            documents,
        });
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        // Serializing a cluster time cannot fail.
        if let Ok(doc) = crate::bson::to_bson(cluster_time) {
            self.body.insert("$clusterTime", doc);
        }
    }

    /// The command document with every document sequence folded in as an array field.
    pub(crate) fn flattened_body(&self) -> Document {
        let mut body = self.body.clone();
        for sequence in &self.document_sequences {
            let documents: Vec<Bson> = sequence
                .documents
                .iter()
                .cloned()
                .map(Bson::Document)
                .collect();
            body.insert(sequence.identifier.clone(), documents);
        }
        body
    }

    /// Whether the command and its reply must be hidden from command monitoring.
    pub(crate) fn should_redact(&self) -> bool {
        let name = self.name.to_lowercase();
        REDACTED_COMMANDS.contains(&name.as_str())
            || ((name == "hello" || name == LEGACY_HELLO_COMMAND_NAME_LOWERCASE)
                && self.body.contains_key("speculativeAuthenticate"))
    }
}

/// A reply to a command, as read off the wire.
#[derive(Debug, Clone)]
pub struct RawCommandResponse {
    pub(crate) source: ServerAddress,
    pub(crate) raw: Document,
    cluster_time: Option<ClusterTime>,
}

impl RawCommandResponse {
    pub(crate) fn new(source: ServerAddress, raw: Document) -> Self {
        let cluster_time = raw
            .get_document("$clusterTime")
            .ok()
            .and_then(|subdoc| crate::bson::from_document(subdoc.clone()).ok());

        Self {
            source,
            raw,
            cluster_time,
        }
    }

    /// The reply document.
    pub fn document(&self) -> &Document {
        &self.raw
    }

    /// Consumes the response, returning the reply document.
    pub fn into_document(self) -> Document {
        self.raw
    }

    /// Returns whether this response indicates a success or not (i.e. if "ok: 1")
    pub(crate) fn is_success(&self) -> bool {
        reply_ok(&self.raw)
    }

    /// Converts a failed reply into a command error and a `writeConcernError` into a write
    /// concern error.
    pub(crate) fn validate(&self) -> Result<()> {
        if !self.is_success() {
            let command_error: CommandError = crate::bson::from_document(self.raw.clone())
                .map_err(|_| {
                    Error::invalid_response(format!(
                        "invalid server response from {}",
                        self.source
                    ))
                })?;
            return Err(ErrorKind::Command(command_error).into());
        }

        if let Ok(write_concern_error) = self.raw.get_document("writeConcernError") {
            let mut command_error: CommandError =
                crate::bson::from_document(write_concern_error.clone()).map_err(|_| {
                    Error::invalid_response(format!(
                        "invalid writeConcernError from {}",
                        self.source
                    ))
                })?;
            if command_error.topology_version.is_none() {
                command_error.topology_version = self
                    .raw
                    .get_document("topologyVersion")
                    .ok()
                    .and_then(|tv| crate::bson::from_document(tv.clone()).ok());
            }
            return Err(ErrorKind::WriteConcern(command_error).into());
        }

        Ok(())
    }

    /// Deserialize the body of the response.
    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        crate::bson::from_document(self.raw.clone()).map_err(|e| {
            Error::invalid_response(format!("malformed reply from {}: {e}", self.source))
        })
    }

    /// Gets the cluster time from the response, if any.
    pub(crate) fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// Labels the server attached to a failed reply.
    pub(crate) fn error_labels(&self) -> Vec<String> {
        self.raw
            .get_array("errorLabels")
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|label| label.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bson::doc;

    fn response(raw: Document) -> RawCommandResponse {
        RawCommandResponse::new(ServerAddress::default(), raw)
    }

    #[test]
    fn redaction_covers_auth_commands() {
        assert!(Command::new("saslStart", "admin", doc! { "saslStart": 1 }).should_redact());
        assert!(Command::new("copydb", "admin", doc! { "copydb": 1 }).should_redact());
        assert!(!Command::new("find", "db", doc! { "find": "c" }).should_redact());

        let plain_hello = Command::new("hello", "admin", doc! { "hello": 1 });
        assert!(!plain_hello.should_redact());
        let speculative_hello = Command::new(
            "isMaster",
            "admin",
            doc! { "isMaster": 1, "speculativeAuthenticate": {} },
        );
        assert!(speculative_hello.should_redact());
    }

    #[test]
    fn document_sequences_fold_into_body() {
        let mut command = Command::new("insert", "db", doc! { "insert": "c" });
        command.add_document_sequence("documents", vec![doc! { "x": 1 }, doc! { "x": 2 }]);
        assert_eq!(
            command.flattened_body(),
            doc! { "insert": "c", "documents": [{ "x": 1 }, { "x": 2 }] }
        );
    }

    #[test]
    fn failed_reply_becomes_command_error() {
        let error = response(doc! { "ok": 0, "code": 10107, "errmsg": "not primary" })
            .validate()
            .unwrap_err();
        assert!(error.is_notwritableprimary());
    }

    #[test]
    fn write_concern_error_is_surfaced() {
        let error = response(doc! {
            "ok": 1,
            "writeConcernError": { "code": 91, "errmsg": "shutting down" },
        })
        .validate()
        .unwrap_err();
        assert!(matches!(*error.kind, ErrorKind::WriteConcern(_)));
        assert!(error.is_shutting_down());
    }

    #[test]
    fn error_labels_are_read() {
        let reply = response(doc! { "ok": 0, "errorLabels": ["TransientTransactionError"] });
        assert_eq!(reply.error_labels(), vec!["TransientTransactionError".to_string()]);
    }
}
