mod codec;
#[cfg(test)]
mod test;

use std::{fmt, str::FromStr};

pub(crate) use self::codec::{compress, decompress};
use crate::error::{Error, Result};

pub(crate) const NOOP_COMPRESSOR_ID: u8 = 0;
#[cfg(feature = "snappy-compression")]
pub(crate) const SNAPPY_COMPRESSOR_ID: u8 = 1;
#[cfg(feature = "zlib-compression")]
pub(crate) const ZLIB_COMPRESSOR_ID: u8 = 2;
#[cfg(feature = "zstd-compression")]
pub(crate) const ZSTD_COMPRESSOR_ID: u8 = 3;

/// A wire protocol compressor offered to servers in the handshake. Each variant is only
/// available with its `*-compression` feature enabled.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Compressor {
    /// Zstandard, at `level` or the codec's default level.
    #[cfg(feature = "zstd-compression")]
    Zstd {
        #[allow(missing_docs)]
        level: Option<i32>,
    },

    /// zlib, at `level` (0 to 9) or the codec's default level.
    #[cfg(feature = "zlib-compression")]
    Zlib {
        #[allow(missing_docs)]
        level: Option<u32>,
    },

    /// Raw (unframed) snappy blocks.
    #[cfg(feature = "snappy-compression")]
    Snappy,
}

impl Compressor {
    /// The name servers use for this compressor in the `compression` handshake field.
    pub(crate) fn name(&self) -> &'static str {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Self::Zstd { .. } => "zstd",
            #[cfg(feature = "zlib-compression")]
            Self::Zlib { .. } => "zlib",
            #[cfg(feature = "snappy-compression")]
            Self::Snappy => "snappy",
        }
    }

    /// The id carried in OP_COMPRESSED headers.
    pub(crate) fn id(&self) -> u8 {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Self::Zstd { .. } => ZSTD_COMPRESSOR_ID,
            #[cfg(feature = "zlib-compression")]
            Self::Zlib { .. } => ZLIB_COMPRESSOR_ID,
            #[cfg(feature = "snappy-compression")]
            Self::Snappy => SNAPPY_COMPRESSOR_ID,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Self::Zstd { level: Some(level) }
                if !zstd::compression_level_range().contains(&level) =>
            {
                Err(Error::invalid_argument(format!(
                    "zstd level {level} is outside {:?}",
                    zstd::compression_level_range()
                )))
            }
            #[cfg(feature = "zlib-compression")]
            Self::Zlib { level: Some(level) } if level > 9 => Err(Error::invalid_argument(
                format!("zlib level {level} is outside 0..=9"),
            )),
            _ => Ok(()),
        }
    }

    /// Gives a zlib compressor without a level of its own the connection-wide level. -1 keeps the
    /// codec default.
    #[cfg_attr(not(feature = "zlib-compression"), allow(unused_variables))]
    pub(crate) fn with_zlib_level(self, connection_level: i32) -> Self {
        match self {
            #[cfg(feature = "zlib-compression")]
            Self::Zlib { level: None } => Self::Zlib {
                level: u32::try_from(connection_level).ok(),
            },
            other => other,
        }
    }
}

impl fmt::Display for Compressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Compressor {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            #[cfg(feature = "zstd-compression")]
            "zstd" => Ok(Self::Zstd { level: None }),
            #[cfg(feature = "zlib-compression")]
            "zlib" => Ok(Self::Zlib { level: None }),
            #[cfg(feature = "snappy-compression")]
            "snappy" => Ok(Self::Snappy),
            known if ["zstd", "zlib", "snappy"].contains(&known) => Err(Error::invalid_argument(
                format!("{known} compression requires the {known}-compression feature"),
            )),
            other => Err(Error::invalid_argument(format!(
                "unsupported compressor '{other}'"
            ))),
        }
    }
}

/// Commands sent uncompressed: they run before compression is negotiated or carry credentials.
const UNCOMPRESSIBLE_COMMANDS: [&str; 11] = [
    "hello",
    "ismaster",
    "authenticate",
    "getnonce",
    "saslstart",
    "saslcontinue",
    "createuser",
    "updateuser",
    "copydbgetnonce",
    "copydbsaslstart",
    "copydb",
];

pub(crate) fn is_compressible(command_name: &str) -> bool {
    !UNCOMPRESSIBLE_COMMANDS
        .iter()
        .any(|name| name.eq_ignore_ascii_case(command_name))
}

/// The first of the client's compressors, in its order of preference, that the server listed.
pub(crate) fn negotiate(
    client_compressors: &[Compressor],
    server_compressors: Option<&[String]>,
) -> Option<Compressor> {
    let server_compressors = server_compressors?;
    client_compressors
        .iter()
        .find(|compressor| {
            server_compressors
                .iter()
                .any(|name| name.eq_ignore_ascii_case(compressor.name()))
        })
        .cloned()
}
