use crate::backup::encrypt::{Encryptor, EncryptorBuilder};
use crate::backup::redacted::{validate_passphrase, RedactedString};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use age::secrecy::SecretString;
use age::stream::StreamReader;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::result;
use validator::{Validate, ValidationError, ValidationErrors};

/// First eight bytes of every age file (`age-encryption.org/v1`).
pub const AGE_MAGIC: &[u8; 8] = b"age-encr";

/// Where the artifact passphrase comes from.
///
/// The passphrase feeds age's scrypt recipient: scrypt derives the file key
/// wrap, and the payload is sealed in authenticated 64 KiB ChaCha20-Poly1305
/// chunks, so encryption streams without holding the plaintext in memory.
#[derive(Clone, Deserialize, Serialize, Debug, PartialEq, Eq)]
#[serde(tag = "secret_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum AgeEncryptorConfig {
    /// Passphrase stored in the config itself
    Passphrase { passphrase: RedactedString },
    /// Passphrase read from an environment variable at run time
    PassphraseEnv { variable: String },
    /// Passphrase read from the first line of a file at run time
    PassphraseFile { path: PathBuf },
}

impl AgeEncryptorConfig {
    pub fn passphrase<S: Into<String>>(passphrase: S) -> Self {
        Self::Passphrase {
            passphrase: RedactedString::new(passphrase),
        }
    }

    /// Looks up the passphrase; failing here means the key is unavailable.
    pub fn resolve_passphrase(&self) -> Result<RedactedString> {
        let resolved = match self {
            AgeEncryptorConfig::Passphrase { passphrase } => passphrase.clone(),
            AgeEncryptorConfig::PassphraseEnv { variable } => std::env::var(variable)
                .map(RedactedString::new)
                .map_err(|e| Error::KeyResolution(format!("environment variable {variable:?}: {e}")))?,
            AgeEncryptorConfig::PassphraseFile { path } => std::fs::read_to_string(path)
                .map(|content| {
                    RedactedString::new(content.lines().next().unwrap_or_default().trim_end())
                })
                .map_err(|e| Error::KeyResolution(format!("passphrase file {path:?}: {e}")))?,
        };

        validate_passphrase(&resolved).map_err(|e| Error::KeyResolution(e.to_string()))?;
        Ok(resolved)
    }

    /// Opens an artifact produced with this configuration for reading.
    pub fn decrypt_reader<R: Read>(&self, reader: R) -> Result<StreamReader<R>> {
        decrypt_reader(reader, &self.resolve_passphrase()?)
    }
}

pub fn decrypt_reader<R: Read>(reader: R, passphrase: &RedactedString) -> Result<StreamReader<R>> {
    let secret: SecretString = passphrase.inner().as_str().into();
    let identity = age::scrypt::Identity::new(secret);
    let decryptor = age::Decryptor::new(reader)?;
    Ok(decryptor.decrypt(std::iter::once(&identity as &dyn age::Identity))?)
}

impl<W: Write> EncryptorBuilder<W> for AgeEncryptorConfig {
    fn build_encryptor(&self, writer: W) -> Result<Encryptor<W>> {
        let passphrase = self.resolve_passphrase()?;
        tracing::debug!("Initializing Age encryption with passphrase");
        let secret: SecretString = passphrase.inner().as_str().into();
        Ok(age::Encryptor::with_user_passphrase(secret)
            .wrap_output(writer)?
            .into())
    }
}

fn validate_env_variable(variable: &str) -> result::Result<(), ValidationError> {
    if variable.trim().is_empty() {
        Err(ValidationError::new("InvalidEnvVariable")
            .with_message("passphrase environment variable name is empty".into()))
    } else {
        Ok(())
    }
}

impl Validate for AgeEncryptorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        let res = match self {
            AgeEncryptorConfig::Passphrase { passphrase } => validate_passphrase(passphrase),
            AgeEncryptorConfig::PassphraseEnv { variable } => validate_env_variable(variable),
            AgeEncryptorConfig::PassphraseFile { .. } => Ok(()),
        };
        res.map_err(|e| {
            let mut errors = ValidationErrors::new();
            errors.add("secret", e);
            errors
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::redacted::REDACTED_SECRET;
    use crate::backup::finish::Finish;
    use std::io::Cursor;

    fn encrypt(config: &AgeEncryptorConfig, data: &[u8]) -> Vec<u8> {
        let mut encryptor = config.build_encryptor(Cursor::new(Vec::new())).unwrap();
        encryptor.write_all(data).unwrap();
        encryptor.finish().unwrap().into_inner()
    }

    #[test]
    fn test_round_trip_restores_bytes() {
        let config = AgeEncryptorConfig::passphrase("correct horse battery");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 251) as u8).collect();

        let encrypted = encrypt(&config, &data);
        assert_eq!(&encrypted[..8], AGE_MAGIC);
        assert_ne!(encrypted, data);

        let mut decrypted = Vec::new();
        config
            .decrypt_reader(encrypted.as_slice())
            .unwrap()
            .read_to_end(&mut decrypted)
            .unwrap();
        assert_eq!(decrypted, data);
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let encrypted = encrypt(&AgeEncryptorConfig::passphrase("first passphrase"), b"");
        let other = AgeEncryptorConfig::passphrase("second passphrase");
        assert!(other.decrypt_reader(encrypted.as_slice()).is_err());
    }

    #[test]
    fn test_resolve_from_file_uses_first_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("key");
        std::fs::write(&path, "from-a-file-123\nignored\n").unwrap();
        let config = AgeEncryptorConfig::PassphraseFile { path };
        assert_eq!(config.resolve_passphrase().unwrap().inner(), "from-a-file-123");
    }

    #[test]
    fn test_resolve_missing_sources_fail() {
        let env = AgeEncryptorConfig::PassphraseEnv {
            variable: "DB_BACKUP_TEST_SURELY_UNSET_VARIABLE".into(),
        };
        assert!(matches!(env.resolve_passphrase(), Err(Error::KeyResolution(_))));

        let file = AgeEncryptorConfig::PassphraseFile {
            path: PathBuf::from("/nonexistent/db-backup/key"),
        };
        assert!(matches!(file.resolve_passphrase(), Err(Error::KeyResolution(_))));

        let short = AgeEncryptorConfig::passphrase("short");
        assert!(matches!(short.resolve_passphrase(), Err(Error::KeyResolution(_))));
    }

    #[test]
    fn test_validation() {
        assert!(AgeEncryptorConfig::passphrase("long enough phrase").validate().is_ok());
        assert!(AgeEncryptorConfig::passphrase("short").validate().is_err());
        assert!(AgeEncryptorConfig::PassphraseEnv { variable: " ".into() }
            .validate()
            .is_err());
    }

    #[test]
    fn test_serialization_redacts_passphrase() {
        let serialized =
            serde_json::to_string(&AgeEncryptorConfig::passphrase("secret_password")).unwrap();
        assert_eq!(
            serialized,
            format!(
                "{{\"secret_type\":\"passphrase\",\"passphrase\":\"{}\"}}",
                REDACTED_SECRET
            )
        );
    }

    #[test]
    fn test_deserialization_env_variant() {
        let json = r#"{"secret_type":"passphrase_env","variable":"BACKUP_KEY"}"#;
        let config: AgeEncryptorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config,
            AgeEncryptorConfig::PassphraseEnv {
                variable: "BACKUP_KEY".into()
            }
        );
    }
}
