use std::borrow::Cow;
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

#[cfg(feature = "fastlzo")]
use comde::zstd::{ZstdCompressor, ZstdDecompressor};
#[cfg(feature = "lzo")]
use comde::snappy::{SnappyCompressor, SnappyDecompressor};
#[cfg(feature = "zlib")]
use comde::deflate::{DeflateCompressor, DeflateDecompressor};
#[cfg(feature = "bzip2")]
use comde::xz::{XzCompressor, XzDecompressor};
#[allow(unused_imports)]
use comde::{Compressor, Decompressor};

use crate::error::{Error, Result};

pub mod constants {
    pub const COMP_LZO: u32 = 0;
    pub const COMP_BZIP2: u32 = 1;
    pub const COMP_ZLIB: u32 = 2;
    pub const COMP_FASTLZO: u32 = 3;

    /// Percent of the original size a compressed cluster must stay below.
    pub const DEFAULT_COMP_THRESHOLD: u32 = 50;
}

use self::constants::*;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub enum CompressionType {
    #[default]
    Lzo,
    Bzip2,
    Zlib,
    FastLzo,
    Unknown(u32),
}

impl CompressionType {
    pub const fn available_variants() -> &'static [&'static str] {
        &["lzo", "bzip2", "zlib", "fastlzo"]
    }

    pub const fn id(self) -> u32 {
        use CompressionType::*;

        match self {
            Lzo => COMP_LZO,
            Bzip2 => COMP_BZIP2,
            Zlib => COMP_ZLIB,
            FastLzo => COMP_FASTLZO,
            Unknown(id) => id,
        }
    }

    pub const fn from_id(id: u32) -> CompressionType {
        use CompressionType::*;

        match id {
            COMP_LZO => Lzo,
            COMP_BZIP2 => Bzip2,
            COMP_ZLIB => Zlib,
            COMP_FASTLZO => FastLzo,
            id => Unknown(id),
        }
    }

    pub const fn name(self) -> &'static str {
        use CompressionType::*;

        match self {
            Lzo => "lzo",
            Bzip2 => "bzip2",
            Zlib => "zlib",
            FastLzo => "fastlzo",
            Unknown(_) => "unknown",
        }
    }

    fn failure(self, source: std::io::Error) -> Error {
        Error::CodecFailure {
            compression: self,
            source,
        }
    }

    fn compress_raw(self, raw: &[u8], out: &mut Vec<u8>) -> std::io::Result<()> {
        use CompressionType::*;

        let mut reader = Cursor::new(raw);
        let mut writer = Cursor::new(out);

        match self {
            #[cfg(feature = "lzo")]
            Lzo => SnappyCompressor.compress(&mut writer, &mut reader),
            #[cfg(feature = "bzip2")]
            Bzip2 => XzCompressor.compress(&mut writer, &mut reader),
            #[cfg(feature = "zlib")]
            Zlib => DeflateCompressor.compress(&mut writer, &mut reader),
            #[cfg(feature = "fastlzo")]
            FastLzo => ZstdCompressor.compress(&mut writer, &mut reader),
            Unknown(id) => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Cannot handle compression with id {}", id),
            )),
            #[allow(unreachable_patterns)]
            missing => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Compiled without support for {:?}", missing),
            )),
        }?;

        Ok(())
    }

    fn decompress_raw(self, payload: &[u8], out: &mut Vec<u8>) -> std::io::Result<()> {
        use CompressionType::*;

        let reader = Cursor::new(payload);

        match self {
            #[cfg(feature = "lzo")]
            Lzo => SnappyDecompressor.copy(reader, out),
            #[cfg(feature = "bzip2")]
            Bzip2 => XzDecompressor.copy(reader, out),
            #[cfg(feature = "zlib")]
            Zlib => DeflateDecompressor.copy(reader, out),
            #[cfg(feature = "fastlzo")]
            FastLzo => ZstdDecompressor.copy(reader, out),
            Unknown(id) => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Cannot handle decompression with id {}", id),
            )),
            #[allow(unreachable_patterns)]
            missing => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Compiled without support for {:?}", missing),
            )),
        }?;

        Ok(())
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionType::Unknown(id) => write!(f, "Unknown(id: {:x})", id),
            known => f.write_str(known.name()),
        }
    }
}

impl fmt::Debug for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug)]
pub struct ParseCompressionError(pub String);

impl std::error::Error for ParseCompressionError {}

impl fmt::Display for ParseCompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown compression method: {}", self.0)
    }
}

impl FromStr for CompressionType {
    type Err = ParseCompressionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let compression = match s {
            "lzo" => CompressionType::Lzo,
            "bzip2" => CompressionType::Bzip2,
            "zlib" => CompressionType::Zlib,
            "fastlzo" => CompressionType::FastLzo,
            _ => return Err(ParseCompressionError(s.to_string())),
        };

        Ok(compression)
    }
}

/// A codec handle shared by every file of a mount.
///
/// Handles hold no scratch state; every call allocates what it needs, so one
/// handle may serve any number of threads at once.
#[derive(Debug)]
pub struct Codec {
    compression: CompressionType,
}

impl Codec {
    fn new(compression: CompressionType) -> Codec {
        tracing::debug!(%compression, "created codec handle");
        Codec { compression }
    }

    #[inline(always)]
    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    /// Compresses `raw` into `out`, returning whether the compressed form is kept.
    ///
    /// When the output reaches `threshold` percent of the input, `out` is
    /// cleared and `false` is returned; the caller stores `raw` verbatim.
    pub fn compress_into(&self, raw: &[u8], out: &mut Vec<u8>, threshold: u32) -> Result<bool> {
        out.clear();
        self.compression
            .compress_raw(raw, out)
            .map_err(|e| self.compression.failure(e))?;

        let limit = raw.len() as u64 * threshold as u64 / 100;
        if out.len() as u64 >= limit {
            tracing::trace!(
                raw = raw.len(),
                compressed = out.len(),
                threshold,
                "compression not worthwhile, storing raw"
            );
            out.clear();
            return Ok(false);
        }

        Ok(true)
    }

    pub fn compress<'a>(&self, raw: &'a [u8], threshold: u32) -> Result<Compressed<'a>> {
        let mut out = Vec::new();
        if self.compress_into(raw, &mut out, threshold)? {
            Ok(Compressed {
                payload: Cow::Owned(out),
                is_compressed: true,
            })
        } else {
            Ok(Compressed {
                payload: Cow::Borrowed(raw),
                is_compressed: false,
            })
        }
    }

    /// Decompresses `payload` into `out`, which must come out exactly `expected_len` long.
    pub fn decompress_into(
        &self,
        payload: &[u8],
        expected_len: usize,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        out.clear();
        self.compression
            .decompress_raw(payload, out)
            .map_err(|e| self.compression.failure(e))?;

        if out.len() != expected_len {
            return Err(self.compression.failure(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "decompressed {} bytes, expected {}",
                    out.len(),
                    expected_len
                ),
            )));
        }

        Ok(())
    }

    pub fn decompress(&self, payload: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(expected_len);
        self.decompress_into(payload, expected_len, &mut out)?;
        Ok(out)
    }
}

/// Output of [`Codec::compress`].
#[derive(Debug)]
pub struct Compressed<'a> {
    pub payload: Cow<'a, [u8]>,
    pub is_compressed: bool,
}

/// Lazily created codec handles, one per known codec, alive for the whole mount.
#[derive(Debug, Default)]
pub struct Codecs {
    handles: [OnceLock<Arc<Codec>>; 4],
}

impl Codecs {
    pub fn new() -> Codecs {
        Codecs::default()
    }

    pub fn get(&self, compression: CompressionType) -> Result<Arc<Codec>> {
        let slot = match compression {
            CompressionType::Unknown(id) => {
                return Err(compression.failure(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Cannot handle compression with id {}", id),
                )))
            }
            known => &self.handles[known.id() as usize],
        };

        Ok(Arc::clone(slot.get_or_init(|| Arc::new(Codec::new(compression)))))
    }
}
