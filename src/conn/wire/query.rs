use bitflags::bitflags;

use super::util::read_document;
use crate::{
    bson::{doc, Document, RawDocumentBuf},
    conn::Command,
    error::{Error, Result},
    runtime::SyncLittleEndianRead,
};

bitflags! {
    /// Represents the bitwise flags for an OP_QUERY as defined in the legacy wire protocol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct QueryFlags: i32 {
        const TAILABLE_CURSOR   = 0b_0000_0010;
        const SECONDARY_OK      = 0b_0000_0100;
        const OPLOG_REPLAY      = 0b_0000_1000;
        const NO_CURSOR_TIMEOUT = 0b_0001_0000;
        const AWAIT_DATA        = 0b_0010_0000;
        const EXHAUST           = 0b_0100_0000;
        const PARTIAL           = 0b_1000_0000;
    }
}

bitflags! {
    /// Represents the bitwise flags for an OP_REPLY.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct ResponseFlags: i32 {
        const CURSOR_NOT_FOUND  = 0b_0001;
        const QUERY_FAILURE     = 0b_0010;
        const AWAIT_CAPABLE     = 0b_1000;
    }
}

/// A legacy OP_QUERY against the `$cmd` pseudo-collection of a database.
#[derive(Debug, Clone)]
pub(crate) struct Query {
    pub(crate) flags: QueryFlags,
    pub(crate) full_collection_name: String,
    pub(crate) num_to_skip: i32,
    pub(crate) num_to_return: i32,
    pub(crate) query: RawDocumentBuf,
}

impl Query {
    /// Frames a command as an OP_QUERY on `<db>.$cmd`. Document sequences are folded into the
    /// body since the legacy protocol has no notion of them.
    pub(crate) fn from_command(command: &Command, flags: QueryFlags) -> Result<Self> {
        Self::from_document(&command.target_db, &command.flattened_body(), flags)
    }

    pub(crate) fn from_document(db: &str, query: &Document, flags: QueryFlags) -> Result<Self> {
        Ok(Self {
            flags,
            full_collection_name: format!("{db}.$cmd"),
            num_to_skip: 0,
            num_to_return: -1,
            query: RawDocumentBuf::from_document(query)?,
        })
    }

    /// The database half of the namespace.
    pub(crate) fn database(&self) -> &str {
        self.full_collection_name
            .split_once('.')
            .map_or(self.full_collection_name.as_str(), |(db, _)| db)
    }

    pub(crate) fn body_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = self.flags.bits().to_le_bytes().to_vec();
        bytes.extend_from_slice(self.full_collection_name.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&self.num_to_skip.to_le_bytes());
        bytes.extend_from_slice(&self.num_to_return.to_le_bytes());
        bytes.extend_from_slice(self.query.as_bytes());
        Ok(bytes)
    }

    pub(crate) fn parse(mut reader: &[u8]) -> Result<Self> {
        let flags = QueryFlags::from_bits_truncate(reader.read_i32_sync()?);
        let full_collection_name = reader.read_cstring_sync()?;
        let num_to_skip = reader.read_i32_sync()?;
        let num_to_return = reader.read_i32_sync()?;
        let query = read_document(&mut reader)?;
        // An optional return field selector may follow; commands never carry one.

        Ok(Self {
            flags,
            full_collection_name,
            num_to_skip,
            num_to_return,
            query,
        })
    }
}

/// A legacy OP_REPLY.
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    pub(crate) response_flags: ResponseFlags,
    pub(crate) cursor_id: i64,
    pub(crate) starting_from: i32,
    pub(crate) docs: Vec<RawDocumentBuf>,
}

impl Reply {
    pub(crate) fn from_document(document: &Document) -> Result<Self> {
        Ok(Self {
            response_flags: ResponseFlags::empty(),
            cursor_id: 0,
            starting_from: 0,
            docs: vec![RawDocumentBuf::from_document(document)?],
        })
    }

    pub(crate) fn parse(mut reader: &[u8]) -> Result<Self> {
        let response_flags = ResponseFlags::from_bits_truncate(reader.read_i32_sync()?);
        let cursor_id = reader.read_i64_sync()?;
        let starting_from = reader.read_i32_sync()?;
        let num_returned = reader.read_i32_sync()?;

        let mut docs = Vec::new();
        for _ in 0..num_returned.max(0) {
            docs.push(read_document(&mut reader)?);
        }
        if !reader.is_empty() {
            return Err(Error::invalid_response(format!(
                "OP_REPLY has {} trailing bytes",
                reader.len()
            )));
        }

        Ok(Self {
            response_flags,
            cursor_id,
            starting_from,
            docs,
        })
    }

    pub(crate) fn body_bytes(&self) -> Result<Vec<u8>> {
        let num_returned = i32::try_from(self.docs.len())
            .map_err(|_| Error::internal("too many documents in OP_REPLY"))?;

        let mut bytes = self.response_flags.bits().to_le_bytes().to_vec();
        bytes.extend_from_slice(&self.cursor_id.to_le_bytes());
        bytes.extend_from_slice(&self.starting_from.to_le_bytes());
        bytes.extend_from_slice(&num_returned.to_le_bytes());
        for doc in &self.docs {
            bytes.extend_from_slice(doc.as_bytes());
        }
        Ok(bytes)
    }

    /// The command reply carried by this OP_REPLY. A query failure becomes an `ok: 0` reply
    /// built from the `$err` document.
    pub(crate) fn into_document(self) -> Result<Document> {
        let Some(first) = self.docs.into_iter().next() else {
            return Err(Error::invalid_response("OP_REPLY contained no documents"));
        };
        let document = first.to_document()?;

        if self.response_flags.contains(ResponseFlags::QUERY_FAILURE) {
            let mut failure = doc! {
                "ok": 0,
                "errmsg": document.get_str("$err").unwrap_or("unknown query failure"),
            };
            if let Some(code) = document.get("code") {
                failure.insert("code", code.clone());
            }
            return Ok(failure);
        }

        Ok(document)
    }
}
