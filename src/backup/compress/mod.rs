pub mod pgzip;

use crate::backup::compress::pgzip::ParallelGzEncoder;
use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::{Finish, LayerWriter, StackWriter, Transform};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithDebugObjectAndFnName;
use derive_more::{Display, From};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use io_enum::Write;
use serde::{Deserialize, Serialize};
use std::io;
use std::io::Write;
use std::sync::{Arc, OnceLock};
use validator::Validate;

#[derive(Write, From)]
pub enum Compressor<W: Write> {
    None(W),
    Gzip(GzEncoder<W>),
    ParallelGzip(ParallelGzEncoder<W>),
    Zlib(ZlibEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

#[derive(Clone, Copy, Default, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    #[default]
    #[display("none")]
    None,
    #[display("gzip")]
    Gzip,
    #[serde(rename = "pgzip")]
    #[display("pgzip")]
    ParallelGzip,
    #[display("zlib")]
    Zlib,
    #[display("zstd")]
    Zstd,
}

#[derive(Clone, Copy, Default, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    #[display("best_speed")]
    BestSpeed,
    #[display("fast")]
    Fast,
    #[default]
    #[display("default")]
    Default,
    #[display("better")]
    Better,
    #[display("best")]
    Best,
}

impl CompressionLevel {
    pub const ALL: [CompressionLevel; 5] = [
        CompressionLevel::BestSpeed,
        CompressionLevel::Fast,
        CompressionLevel::Default,
        CompressionLevel::Better,
        CompressionLevel::Best,
    ];

    /// Maps the abstract level onto the algorithm's own scale.
    pub fn native(self, algorithm: CompressionAlgorithm) -> i32 {
        match algorithm {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Gzip
            | CompressionAlgorithm::ParallelGzip
            | CompressionAlgorithm::Zlib => match self {
                CompressionLevel::BestSpeed => 1,
                CompressionLevel::Fast => 3,
                CompressionLevel::Default => 6,
                CompressionLevel::Better => 7,
                CompressionLevel::Best => 9,
            },
            CompressionAlgorithm::Zstd => match self {
                CompressionLevel::BestSpeed => 1,
                CompressionLevel::Fast => 2,
                CompressionLevel::Default => 3,
                CompressionLevel::Better => 7,
                CompressionLevel::Best => 19,
            },
        }
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CompressorConfig {
    #[serde(default)]
    pub algorithm: CompressionAlgorithm,
    #[serde(default)]
    pub level: CompressionLevel,
}

impl CompressorConfig {
    pub fn new(algorithm: CompressionAlgorithm, level: CompressionLevel) -> Self {
        Self { algorithm, level }
    }

    pub fn is_enabled(&self) -> bool {
        self.algorithm != CompressionAlgorithm::None
    }
}

pub trait CompressorBuilder<W: Write> {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>>;
}

impl<W: Write> Finish<W> for Compressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Compressor::None(w) => Ok(w),
            Compressor::Gzip(w) => w.finish(),
            Compressor::ParallelGzip(w) => w.finish(),
            Compressor::Zlib(w) => w.finish(),
            Compressor::Zstd(w) => w.finish(),
        }
    }
}

impl<W: Write> CompressorBuilder<W> for CompressorConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        let level = self.level.native(self.algorithm);
        tracing::debug!(
            "Creating {} compressor with level={} ({})",
            self.algorithm,
            self.level,
            level
        );
        let compressor = match self.algorithm {
            CompressionAlgorithm::None => Compressor::None(writer),
            CompressionAlgorithm::Gzip => {
                GzEncoder::new(writer, Compression::new(level.unsigned_abs())).into()
            }
            CompressionAlgorithm::ParallelGzip => {
                ParallelGzEncoder::new(writer, Compression::new(level.unsigned_abs())).into()
            }
            CompressionAlgorithm::Zlib => {
                ZlibEncoder::new(writer, Compression::new(level.unsigned_abs())).into()
            }
            CompressionAlgorithm::Zstd => zstd::stream::write::Encoder::new(writer, level)
                .map(Compressor::from)
                .map_err(Error::from)
                .with_debug_object_and_fn_name(*self, "build_compressor")?,
        };
        Ok(compressor)
    }
}

impl StackWriter for Compressor<LayerWriter> {
    fn finish_layer(self: Box<Self>) -> io::Result<Option<LayerWriter>> {
        (*self).finish().map(Some)
    }
}

impl Transform for CompressorConfig {
    fn wrap(&self, inner: LayerWriter) -> Result<LayerWriter> {
        Ok(Box::new(self.build_compressor(inner)?))
    }
}

static GZ_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();
static ZLIB_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();
static ZSTD_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();

impl FileExtProvider for CompressorConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        match self.algorithm {
            CompressionAlgorithm::None => None,
            CompressionAlgorithm::Gzip | CompressionAlgorithm::ParallelGzip => {
                Some(GZ_FILE_EXT.get_or_init(|| "gz".into()).clone())
            }
            CompressionAlgorithm::Zlib => Some(ZLIB_FILE_EXT.get_or_init(|| "zz".into()).clone()),
            CompressionAlgorithm::Zstd => Some(ZSTD_FILE_EXT.get_or_init(|| "zst".into()).clone()),
        }
    }
}
