pub mod age;

use crate::backup::encrypt::age::{AgeEncryptorConfig, AGE_MAGIC};
use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::{Finish, LayerWriter, StackWriter, Transform};
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithDebugObjectAndFnName;
use ::age::stream::StreamWriter;
use derive_more::From;
use io_enum::Write;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Error, Read, Write};
use std::path::Path;
use std::result;
use std::sync::{Arc, OnceLock};

use validator::{Validate, ValidationErrors};

#[derive(Write, From)]
pub enum Encryptor<W: Write> {
    None(W),
    AgeEncryptor(StreamWriter<W>),
}

#[derive(Clone, Default, From, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "encryptor_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum EncryptorConfig {
    #[default]
    None,
    Age(AgeEncryptorConfig),
}

impl EncryptorConfig {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, EncryptorConfig::None)
    }

    /// Confirms the key can be obtained before any backup unit starts.
    pub fn check_key(&self) -> Result<()> {
        match self {
            EncryptorConfig::None => Ok(()),
            EncryptorConfig::Age(age) => age.resolve_passphrase().map(|_| ()),
        }
    }
}

impl Validate for EncryptorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            EncryptorConfig::None => Ok(()),
            EncryptorConfig::Age(inner) => inner.validate(),
        }
    }
}

pub trait EncryptorBuilder<W: Write> {
    fn build_encryptor(&self, writer: W) -> Result<Encryptor<W>>;
}

impl<W: Write> Finish<W> for Encryptor<W> {
    fn finish(self) -> result::Result<W, Error> {
        match self {
            Encryptor::None(w) => Ok(w),
            Encryptor::AgeEncryptor(w) => w.finish(),
        }
    }
}

impl<W: Write> EncryptorBuilder<W> for EncryptorConfig {
    fn build_encryptor(&self, writer: W) -> Result<Encryptor<W>> {
        match self {
            EncryptorConfig::None => {
                tracing::info!("Using no encryption");
                Ok(writer.into())
            }
            EncryptorConfig::Age(age) => age.build_encryptor(writer),
        }
        .with_debug_object_and_fn_name(self.clone(), "build_encryptor")
    }
}

impl StackWriter for Encryptor<LayerWriter> {
    fn finish_layer(self: Box<Self>) -> result::Result<Option<LayerWriter>, Error> {
        (*self).finish().map(Some)
    }
}

impl Transform for EncryptorConfig {
    fn wrap(&self, inner: LayerWriter) -> Result<LayerWriter> {
        Ok(Box::new(self.build_encryptor(inner)?))
    }
}

static AGE_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();

impl FileExtProvider for EncryptorConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        match self {
            EncryptorConfig::None => None,
            EncryptorConfig::Age(_) => Some(AGE_FILE_EXT.get_or_init(|| "age".into()).clone()),
        }
    }
}

/// True when the stream starts with the encrypted-artifact marker.
/// Inputs shorter than the marker are never encrypted.
pub fn is_encrypted_reader<R: Read>(reader: R) -> std::io::Result<bool> {
    let mut header = Vec::with_capacity(AGE_MAGIC.len());
    reader
        .take(AGE_MAGIC.len() as u64)
        .read_to_end(&mut header)?;
    Ok(header.as_slice() == AGE_MAGIC)
}

pub fn is_encrypted<P: AsRef<Path>>(path: P) -> std::io::Result<bool> {
    is_encrypted_reader(File::open(path)?)
}
