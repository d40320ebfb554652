//! Contains the wire-protocol compressors supported by the driver.

use std::{
    io::{Read, Write},
    str::FromStr,
};

use flate2::{
    read::ZlibDecoder,
    write::ZlibEncoder,
    Compression,
};
use serde::Serialize;

use crate::error::{Error, ErrorKind, Result};

pub(crate) const NOOP_COMPRESSOR_ID: u8 = 0;
pub(crate) const SNAPPY_COMPRESSOR_ID: u8 = 1;
pub(crate) const ZLIB_COMPRESSOR_ID: u8 = 2;
pub(crate) const ZSTD_COMPRESSOR_ID: u8 = 3;

/// A wire-message compressor the client can offer the server. The first one in the client's
/// list that the server also supports gets used for the connection.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[non_exhaustive]
pub enum Compressor {
    /// [zstd](http://facebook.github.io/zstd/zstd_manual.html).
    Zstd {
        /// Trade speed for ratio; must fall within [zstd::compression_level_range], and
        /// defaults to [zstd::DEFAULT_COMPRESSION_LEVEL].
        level: Option<i32>,
    },

    /// [zlib](https://zlib.net/).
    Zlib {
        /// Trade speed for ratio, 0-9; defaults to [flate2::Compression::default].
        level: Option<u32>,
    },

    /// [snappy](http://google.github.io/snappy/), which has no tuning knobs.
    Snappy,
}

impl Compressor {
    pub(crate) fn name(&self) -> &'static str {
        match *self {
            Compressor::Zstd { .. } => "zstd",
            Compressor::Zlib { .. } => "zlib",
            Compressor::Snappy => "snappy",
        }
    }

    pub(crate) fn id(&self) -> u8 {
        match self {
            Self::Zstd { .. } => ZSTD_COMPRESSOR_ID,
            Self::Zlib { .. } => ZLIB_COMPRESSOR_ID,
            Self::Snappy => SNAPPY_COMPRESSOR_ID,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Self::Zstd { level: Some(level) } = self {
            let valid_levels = zstd::compression_level_range();
            if !valid_levels.contains(level) {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "Invalid zstd compression level {}: compression level must be within the \
                         range {:?}",
                        level, valid_levels
                    ),
                }
                .into());
            }
        }

        if let Self::Zlib { level: Some(level) } = self {
            if *level > 9 {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "Invalid zlib compression level {}: compression level must be between 0 \
                         and 9 (inclusive)",
                        level
                    ),
                }
                .into());
            }
        }

        Ok(())
    }

    pub(crate) fn write_zlib_level(&mut self, uri_level: i32) -> Result<()> {
        if let Compressor::Zlib { ref mut level } = *self {
            if uri_level == -1 {
                *level = None;
            } else {
                let zlib_compression_level =
                    u32::try_from(uri_level).map_err(|_| ErrorKind::InvalidArgument {
                        message: format!(
                            "Invalid zlib compression level specified: {}; zlib compression level \
                             must be a nonnegative integer or -1 to use the default compression \
                             level",
                            uri_level
                        ),
                    })?;
                *level = Some(zlib_compression_level);
            }
        }
        Ok(())
    }

    /// Compress `bytes` with this compressor.
    pub(crate) fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compressor::Zstd { level } => {
                let level = level.unwrap_or(zstd::DEFAULT_COMPRESSION_LEVEL);
                zstd::encode_all(bytes, level).map_err(|e| {
                    Error::from(ErrorKind::Internal {
                        message: format!("an error occurred during zstd compression: {}", e),
                    })
                })
            }
            Compressor::Zlib { level } => {
                let level = match level {
                    Some(level) => Compression::new(*level),
                    None => Compression::default(),
                };
                let mut encoder = ZlibEncoder::new(Vec::new(), level);
                encoder.write_all(bytes).and_then(|_| encoder.finish()).map_err(|e| {
                    Error::from(ErrorKind::Internal {
                        message: format!("an error occurred during zlib compression: {}", e),
                    })
                })
            }
            Compressor::Snappy => snap::raw::Encoder::new().compress_vec(bytes).map_err(|e| {
                Error::from(ErrorKind::Internal {
                    message: format!("an error occurred during snappy compression: {}", e),
                })
            }),
        }
    }
}

impl FromStr for Compressor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "zstd" => Ok(Self::Zstd { level: None }),
            "zlib" => Ok(Self::Zlib { level: None }),
            "snappy" => Ok(Self::Snappy),
            other => Err(ErrorKind::InvalidArgument {
                message: format!("Unsupported compressor: {}", other),
            }
            .into()),
        }
    }
}

/// Decompress `bytes` that the server compressed with the compressor identified by
/// `compressor_id`.
pub(crate) fn decompress(compressor_id: u8, bytes: &[u8]) -> Result<Vec<u8>> {
    match compressor_id {
        NOOP_COMPRESSOR_ID => Ok(bytes.to_vec()),
        SNAPPY_COMPRESSOR_ID => snap::raw::Decoder::new().decompress_vec(bytes).map_err(|e| {
            Error::invalid_response(format!("an error occurred during snappy decompression: {}", e))
        }),
        ZLIB_COMPRESSOR_ID => {
            let mut decoder = ZlibDecoder::new(bytes);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(|e| {
                Error::invalid_response(format!(
                    "an error occurred during zlib decompression: {}",
                    e
                ))
            })?;
            Ok(out)
        }
        ZSTD_COMPRESSOR_ID => zstd::decode_all(bytes).map_err(|e| {
            Error::invalid_response(format!("an error occurred during zstd decompression: {}", e))
        }),
        other => Err(Error::invalid_response(format!(
            "unsupported compressor id in server reply: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let payload = b"a man a plan a canal panama".repeat(20);
        for compressor in [
            Compressor::Snappy,
            Compressor::Zlib { level: None },
            Compressor::Zlib { level: Some(6) },
            Compressor::Zstd { level: None },
        ] {
            let compressed = compressor.compress(&payload).unwrap();
            let decompressed = decompress(compressor.id(), &compressed).unwrap();
            assert_eq!(decompressed, payload, "round trip for {}", compressor.name());
        }
    }

    #[test]
    fn noop_passthrough() {
        let payload = b"uncompressed".to_vec();
        assert_eq!(decompress(NOOP_COMPRESSOR_ID, &payload).unwrap(), payload);
    }

    #[test]
    fn unknown_id_rejected() {
        assert!(decompress(42, b"whatever").is_err());
    }

    #[test]
    fn parse_and_validate() {
        assert_eq!(Compressor::from_str("snappy").unwrap(), Compressor::Snappy);
        assert!(Compressor::from_str("lz4").is_err());

        let mut zlib = Compressor::from_str("zlib").unwrap();
        zlib.write_zlib_level(4).unwrap();
        assert_eq!(zlib, Compressor::Zlib { level: Some(4) });
        zlib.write_zlib_level(-1).unwrap();
        assert_eq!(zlib, Compressor::Zlib { level: None });

        assert!(Compressor::Zlib { level: Some(10) }.validate().is_err());
    }
}
