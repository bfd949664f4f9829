use std::io::Read;

use super::{Compressor, NOOP_COMPRESSOR_ID};
use crate::error::{Error, Result};

/// Compresses a message body (everything after the header) for an OP_COMPRESSED frame.
pub(crate) fn compress(compressor: &Compressor, body: &[u8]) -> Result<Vec<u8>> {
    let compressed: std::io::Result<Vec<u8>> = match *compressor {
        #[cfg(feature = "zstd-compression")]
        Compressor::Zstd { level } => {
            zstd::stream::encode_all(body, level.unwrap_or(zstd::DEFAULT_COMPRESSION_LEVEL))
        }
        #[cfg(feature = "zlib-compression")]
        Compressor::Zlib { level } => {
            use std::io::Write;

            let level = level.map_or_else(flate2::Compression::default, flate2::Compression::new);
            let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), level);
            encoder.write_all(body).and_then(|_| encoder.finish())
        }
        #[cfg(feature = "snappy-compression")]
        Compressor::Snappy => snap::raw::Encoder::new()
            .compress_vec(body)
            .map_err(std::io::Error::from),
    };

    compressed.map_err(|error| Error::internal(format!("{compressor} compression failed: {error}")))
}

/// Decompresses the payload of an OP_COMPRESSED frame whose header declared `uncompressed_size`
/// bytes. Decoding stops one byte past the declared size, so a payload that inflates further is
/// rejected without being expanded in full.
pub(crate) fn decompress(
    compressor_id: u8,
    payload: &[u8],
    uncompressed_size: usize,
) -> Result<Vec<u8>> {
    let decoded = match compressor_id {
        NOOP_COMPRESSOR_ID => Ok(payload.to_vec()),
        #[cfg(feature = "zstd-compression")]
        super::ZSTD_COMPRESSOR_ID => zstd::stream::read::Decoder::new(payload)
            .and_then(|decoder| read_at_most(decoder, uncompressed_size)),
        #[cfg(feature = "zlib-compression")]
        super::ZLIB_COMPRESSOR_ID => {
            read_at_most(flate2::read::ZlibDecoder::new(payload), uncompressed_size)
        }
        #[cfg(feature = "snappy-compression")]
        super::SNAPPY_COMPRESSOR_ID => snappy_block(payload, uncompressed_size),
        other => {
            return Err(Error::invalid_response(format!(
                "server reply uses unsupported compressor id {other}"
            )))
        }
    };

    let decoded = decoded.map_err(|error| {
        Error::invalid_response(format!(
            "could not decompress server reply with compressor id {compressor_id}"
        ))
        .with_source(Error::from(error))
    })?;

    if decoded.len() != uncompressed_size {
        return Err(Error::invalid_response(format!(
            "server reply declared {uncompressed_size} uncompressed bytes but did not decompress \
             to that length"
        )));
    }
    Ok(decoded)
}

#[cfg_attr(
    not(any(feature = "zlib-compression", feature = "zstd-compression")),
    allow(dead_code)
)]
fn read_at_most(decoder: impl Read, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut decoded = Vec::with_capacity(limit);
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut decoded)?;
    Ok(decoded)
}

// Snappy blocks carry their length up front, so it is checked before anything is allocated.
#[cfg(feature = "snappy-compression")]
fn snappy_block(payload: &[u8], uncompressed_size: usize) -> std::io::Result<Vec<u8>> {
    let declared = snap::raw::decompress_len(payload)?;
    if declared != uncompressed_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("snappy block holds {declared} bytes"),
        ));
    }
    Ok(snap::raw::Decoder::new().decompress_vec(payload)?)
}
