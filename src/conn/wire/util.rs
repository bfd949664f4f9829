use std::{
    io::Read,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
};

use crate::{
    bson::RawDocumentBuf,
    error::{Error, Result},
    runtime::SyncLittleEndianRead,
};

/// Hands out request ids. Every topology owns one generator, shared by all of its connections,
/// so ids are unique per topology rather than per process.
#[derive(Clone, Debug)]
pub(crate) struct RequestIdGenerator(Arc<AtomicI32>);

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self(Arc::new(AtomicI32::new(1)))
    }
}

impl RequestIdGenerator {
    pub(crate) fn next(&self) -> i32 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

pub(super) struct SyncCountReader<R> {
    reader: R,
    bytes_read: usize,
}

impl<R: Read> SyncCountReader<R> {
    /// Constructs a new CountReader that wraps `reader`.
    pub(super) fn new(reader: R) -> Self {
        SyncCountReader {
            reader,
            bytes_read: 0,
        }
    }

    /// Gets the number of bytes read so far.
    pub(super) fn bytes_read(&self) -> usize {
        self.bytes_read
    }
}

impl<R: Read> Read for SyncCountReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes = self.reader.read(buf)?;
        self.bytes_read += bytes;
        Ok(bytes)
    }
}

/// Reads one length-prefixed BSON document. Memory grows only with the bytes actually present,
/// so a prefix claiming more than the message holds fails without a large allocation.
pub(super) fn read_document<R: Read>(reader: &mut R) -> Result<RawDocumentBuf> {
    let length = reader.read_i32_sync()?;
    let declared = usize::try_from(length)
        .ok()
        .filter(|length| *length >= 5)
        .ok_or_else(|| Error::invalid_response(format!("invalid BSON length {length}")))?;

    let mut bytes = length.to_le_bytes().to_vec();
    reader
        .by_ref()
        .take(declared as u64 - 4)
        .read_to_end(&mut bytes)?;
    if bytes.len() != declared {
        return Err(Error::invalid_response(format!(
            "BSON document declares {declared} bytes but only {} are present",
            bytes.len()
        )));
    }

    Ok(RawDocumentBuf::from_bytes(bytes)?)
}
