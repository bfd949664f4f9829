use std::io::Read;

use bitflags::bitflags;

use super::util::{read_document, SyncCountReader};
use crate::{
    bson::{Bson, Document, RawDocumentBuf},
    conn::{Command, DocumentSequence},
    error::{Error, Result},
    runtime::SyncLittleEndianRead,
};

bitflags! {
    /// The bitwise flags of an OP_MSG.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// Represents an OP_MSG wire protocol operation.
#[derive(Debug, Clone)]
pub(crate) struct Message {
    // OP_MSG payload type 0
    pub(crate) document_payload: RawDocumentBuf,
    // OP_MSG payload type 1
    pub(crate) document_sequences: Vec<RawDocumentSequence>,
    pub(crate) flags: MessageFlags,
    pub(crate) checksum: Option<u32>,
}

#[derive(Clone, Debug)]
pub(crate) struct RawDocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<RawDocumentBuf>,
}

impl Message {
    /// Frames a command as an OP_MSG. The target database travels in the body as `$db`.
    pub(crate) fn from_command(command: &Command) -> Result<Self> {
        let mut body = command.body.clone();
        body.insert("$db", command.target_db.clone());
        let document_payload = RawDocumentBuf::from_document(&body)?;

        let document_sequences = command
            .document_sequences
            .iter()
            .map(RawDocumentSequence::from_sequence)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            document_payload,
            document_sequences,
            flags: MessageFlags::empty(),
            checksum: None,
        })
    }

    /// Builds a reply carrying a single document. Used to answer OP_MSG requests.
    pub(crate) fn from_document(document: &Document) -> Result<Self> {
        Ok(Self {
            document_payload: RawDocumentBuf::from_document(document)?,
            document_sequences: Vec::new(),
            flags: MessageFlags::empty(),
            checksum: None,
        })
    }

    /// The payload document with every document sequence folded in as an array field.
    pub(crate) fn into_document(self) -> Result<Document> {
        let mut document = self.document_payload.to_document()?;
        for sequence in self.document_sequences {
            let documents = sequence
                .documents
                .iter()
                .map(|document| document.to_document().map(Bson::Document))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            document.insert(sequence.identifier, documents);
        }
        Ok(document)
    }

    /// Parses the body of an OP_MSG (everything after the header, already decompressed).
    pub(crate) fn parse(mut reader: &[u8]) -> Result<Self> {
        let total_length = reader.len();
        let flags = MessageFlags::from_bits_truncate(reader.read_u32_sync()?);
        let checksum_length = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            std::mem::size_of::<u32>()
        } else {
            0
        };

        let sections_length = total_length
            .checked_sub(std::mem::size_of::<u32>() + checksum_length)
            .ok_or_else(|| Error::invalid_response("OP_MSG body is too short"))?;

        let mut count_reader = SyncCountReader::new(&mut reader);
        let mut document_payload = None;
        let mut document_sequences = Vec::new();
        while count_reader.bytes_read() < sections_length {
            match MessageSection::read(&mut count_reader)? {
                MessageSection::Document(document) => {
                    if document_payload.replace(document).is_some() {
                        return Err(Error::invalid_response(
                            "an OP_MSG response must contain exactly one payload type 0 section",
                        ));
                    }
                }
                MessageSection::Sequence(sequence) => document_sequences.push(sequence),
            }
        }

        if count_reader.bytes_read() != sections_length {
            return Err(Error::invalid_response(format!(
                "The server indicated that the reply would be {} bytes long, but it instead was {}",
                total_length,
                count_reader.bytes_read() + std::mem::size_of::<u32>() + checksum_length,
            )));
        }

        let checksum = if checksum_length > 0 {
            Some(reader.read_u32_sync()?)
        } else {
            None
        };

        Ok(Self {
            document_payload: document_payload.ok_or_else(|| {
                Error::invalid_response(
                    "an OP_MSG response must contain exactly one payload type 0 section",
                )
            })?,
            document_sequences,
            flags,
            checksum,
        })
    }

    /// Serializes everything after the header: flags, sections and the optional checksum.
    pub(crate) fn body_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = self.flags.bits().to_le_bytes().to_vec();

        // Payload type 0
        bytes.push(0);
        bytes.extend_from_slice(self.document_payload.as_bytes());

        for sequence in &self.document_sequences {
            // Payload type 1
            bytes.push(1);

            let identifier_bytes = sequence.identifier.as_bytes();
            let documents_size: usize = sequence
                .documents
                .iter()
                .map(|document| document.as_bytes().len())
                .sum();

            // Size bytes + identifier bytes + null-terminator byte + document bytes
            let size = i32::try_from(4 + identifier_bytes.len() + 1 + documents_size)
                .map_err(|_| Error::internal("document sequence is too large to frame"))?;
            bytes.extend_from_slice(&size.to_le_bytes());
            bytes.extend_from_slice(identifier_bytes);
            bytes.push(0);

            for document in &sequence.documents {
                bytes.extend_from_slice(document.as_bytes());
            }
        }

        if let Some(checksum) = self.checksum {
            bytes.extend_from_slice(&checksum.to_le_bytes());
        }

        Ok(bytes)
    }
}

impl RawDocumentSequence {
    fn from_sequence(sequence: &DocumentSequence) -> Result<Self> {
        Ok(Self {
            identifier: sequence.identifier.clone(),
            documents: sequence
                .documents
                .iter()
                .map(RawDocumentBuf::from_document)
                .collect::<std::result::Result<Vec<_>, _>>()?,
        })
    }
}

/// A section of an OP_MSG body.
#[derive(Debug)]
enum MessageSection {
    Document(RawDocumentBuf),
    Sequence(RawDocumentSequence),
}

impl MessageSection {
    /// Reads bytes from `reader` and deserializes them into a MessageSection.
    fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let payload_type = reader.read_u8_sync()?;

        match payload_type {
            0 => Ok(MessageSection::Document(read_document(reader)?)),
            1 => {
                let size = reader.read_i32_sync()?;
                let length_remaining = usize::try_from(size)
                    .ok()
                    .and_then(|size| size.checked_sub(std::mem::size_of::<i32>()))
                    .ok_or_else(|| {
                        Error::invalid_response(format!("invalid document sequence size {size}"))
                    })?;

                let mut count_reader = SyncCountReader::new(reader);
                let identifier = count_reader.read_cstring_sync()?;

                let mut documents = Vec::new();
                while count_reader.bytes_read() < length_remaining {
                    documents.push(read_document(&mut count_reader)?);
                }

                if count_reader.bytes_read() != length_remaining {
                    return Err(Error::invalid_response(format!(
                        "The server indicated that the document sequence would be {} bytes \
                         long, but it instead was {}",
                        size,
                        count_reader.bytes_read() + std::mem::size_of::<i32>(),
                    )));
                }

                Ok(MessageSection::Sequence(RawDocumentSequence {
                    identifier,
                    documents,
                }))
            }
            other => Err(Error::invalid_response(format!(
                "invalid OP_MSG payload type {other}"
            ))),
        }
    }
}
