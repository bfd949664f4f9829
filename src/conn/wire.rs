//! Framing of wire protocol messages: the 16-byte header, OP_MSG, legacy OP_QUERY/OP_REPLY, and
//! OP_COMPRESSED wrapping of either.

mod header;
mod message;
mod query;
mod util;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) use self::{
    header::{Header, OpCode},
    message::Message,
    query::{Query, QueryFlags, Reply, ResponseFlags},
    util::RequestIdGenerator,
};
use crate::{
    bson::Document,
    compression::{self, Compressor},
    error::{Error, ErrorKind, Result},
    runtime::SyncLittleEndianRead,
};

/// The body of a wire message, by op code.
#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Message(Message),
    Query(Query),
    Reply(Reply),
}

impl Payload {
    fn op_code(&self) -> OpCode {
        match self {
            Self::Message(_) => OpCode::Message,
            Self::Query(_) => OpCode::Query,
            Self::Reply(_) => OpCode::Reply,
        }
    }

    fn body_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Self::Message(message) => message.body_bytes(),
            Self::Query(query) => query.body_bytes(),
            Self::Reply(reply) => reply.body_bytes(),
        }
    }

    /// The single reply or command document this payload carries.
    pub(crate) fn into_document(self) -> Result<Document> {
        match self {
            Self::Message(message) => message.into_document(),
            Self::Query(query) => Ok(query.query.to_document()?),
            Self::Reply(reply) => reply.into_document(),
        }
    }
}

/// A message read off a stream.
#[derive(Debug, Clone)]
pub(crate) struct IncomingMessage {
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,

    /// The compressor the sender used, if the message arrived as OP_COMPRESSED.
    pub(crate) compressor_id: Option<u8>,

    pub(crate) payload: Payload,
}

/// Serializes `payload` behind a header and writes it, wrapped in OP_COMPRESSED when a
/// compressor is given. Returns the number of bytes written.
pub(crate) async fn write_message<W: AsyncWrite + Unpin + Send>(
    writer: &mut W,
    request_id: i32,
    response_to: i32,
    payload: &Payload,
    compressor: Option<&Compressor>,
    max_message_size: i32,
) -> Result<usize> {
    let body = payload.body_bytes()?;

    let (op_code, frame) = match compressor {
        None => (payload.op_code(), body),
        Some(compressor) => {
            let uncompressed_size = i32::try_from(body.len())
                .map_err(|_| Error::internal("message body is too large to compress"))?;
            let compressed = compression::compress(compressor, &body)?;

            let mut frame = Vec::with_capacity(compressed.len() + 9);
            // Original op code, uncompressed size, compressor id, compressed body.
            frame.extend_from_slice(&(payload.op_code() as i32).to_le_bytes());
            frame.extend_from_slice(&uncompressed_size.to_le_bytes());
            frame.push(compressor.id());
            frame.extend_from_slice(&compressed);
            (OpCode::Compressed, frame)
        }
    };

    let length = Header::LENGTH + frame.len();
    let length = i32::try_from(length)
        .ok()
        .filter(|length| *length <= max_message_size)
        .ok_or_else(|| ErrorKind::MessageTooLarge {
            message: format!(
                "message of {length} bytes exceeds the maximum message size of \
                 {max_message_size} bytes"
            ),
        })?;

    let header = Header {
        length,
        request_id,
        response_to,
        op_code,
    };
    header.write_to(writer).await?;
    writer.write_all(&frame).await?;
    writer.flush().await?;

    Ok(header.length as usize)
}

/// Reads one message. The declared length must lie between the header length and
/// `max_message_size`; nothing beyond the header is read otherwise.
pub(crate) async fn read_message<R: AsyncRead + Unpin + Send>(
    reader: &mut R,
    max_message_size: i32,
) -> Result<IncomingMessage> {
    let header = Header::read_from(reader).await?;

    let min_length = Header::LENGTH as i32;
    if header.length < min_length || header.length > max_message_size {
        return Err(Error::invalid_response(format!(
            "message length {} is not within valid range of {}-{} bytes",
            header.length, min_length, max_message_size
        )));
    }

    let mut body = vec![0u8; header.length as usize - Header::LENGTH];
    reader.read_exact(&mut body).await?;

    let (op_code, compressor_id, body) = if header.op_code == OpCode::Compressed {
        let mut reader = body.as_slice();
        let original_op_code = OpCode::from_i32(reader.read_i32_sync()?)?;
        let uncompressed_size = reader.read_i32_sync()?;
        let compressor_id = reader.read_u8_sync()?;

        let max_body_size = max_message_size as usize - Header::LENGTH;
        let uncompressed_size = usize::try_from(uncompressed_size)
            .ok()
            .filter(|size| *size <= max_body_size)
            .ok_or_else(|| {
                Error::invalid_response(format!(
                    "compressed message declares {uncompressed_size} uncompressed bytes, more \
                     than the maximum message size of {max_message_size} bytes allows"
                ))
            })?;

        let decompressed = compression::decompress(compressor_id, reader, uncompressed_size)?;
        (original_op_code, Some(compressor_id), decompressed)
    } else {
        (header.op_code, None, body)
    };

    let payload = match op_code {
        OpCode::Message => Payload::Message(Message::parse(&body)?),
        OpCode::Query => Payload::Query(Query::parse(&body)?),
        OpCode::Reply => Payload::Reply(Reply::parse(&body)?),
        OpCode::Compressed => {
            return Err(Error::invalid_response(
                "an OP_COMPRESSED message cannot wrap another OP_COMPRESSED message",
            ))
        }
    };

    Ok(IncomingMessage {
        request_id: header.request_id,
        response_to: header.response_to,
        compressor_id,
        payload,
    })
}
