use crate::backup::admission::{CapacityConfig, CompressionRatioTable, DEFAULT_SAFETY_MARGIN_PERCENT};
use crate::backup::compress::CompressorConfig;
use crate::backup::encrypt::EncryptorConfig;
use crate::backup::file_ext::FileExtProvider;
use crate::backup::filter::FilterConfig;
use crate::backup::finish::Transform;
use crate::backup::metadata::{DEFAULT_JOB_TIMEOUT, DEFAULT_QUERY_TIMEOUT};
use crate::backup::orchestrator::ArtifactMode;
use crate::backup::redacted::RedactedString;
use crate::backup::validate::{validate_valid_artifact_name, validate_writable_dir};
use bon::Builder;
use chrono::{DateTime, TimeZone};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use validator::Validate;

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate, Builder)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    #[validate(custom(function = validate_writable_dir))]
    pub out_dir: PathBuf,
    #[validate(nested)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    pub filter: FilterConfig,
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    pub compressor: CompressorConfig,
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    pub encryptor: EncryptorConfig,
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    pub collector: CollectorConfig,
    #[serde(default)]
    #[builder(default)]
    pub mysqldump: MysqldumpConfig,
    #[serde(default)]
    #[builder(default)]
    pub artifact_mode: ArtifactMode,
    #[serde(default = "default_safety_margin_percent")]
    #[builder(default = DEFAULT_SAFETY_MARGIN_PERCENT)]
    #[validate(range(min = 0.0, max = 1000.0))]
    pub safety_margin_percent: f64,
    /// Keep the partial output of failed units for inspection
    #[serde(default)]
    #[builder(default)]
    pub keep_failed_artifacts: bool,
    #[serde(default = "default_combined_artifact_name")]
    #[builder(default = default_combined_artifact_name())]
    #[validate(custom(function = validate_valid_artifact_name))]
    pub combined_artifact_name: String,
}

fn default_safety_margin_percent() -> f64 {
    DEFAULT_SAFETY_MARGIN_PERCENT
}

fn default_combined_artifact_name() -> String {
    "all-databases".to_string()
}

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate, Builder)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    #[builder(default = default_host())]
    #[validate(length(min = 1))]
    pub host: String,
    #[serde(default = "default_port")]
    #[builder(default = default_port())]
    #[validate(range(min = 1))]
    pub port: u16,
    #[validate(length(min = 1))]
    pub user: String,
    pub password: Option<RedactedString>,
    /// Unix socket path, used instead of TCP when set
    pub socket: Option<PathBuf>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    3306
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate, Builder)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    /// Concurrent metadata jobs, defaults to the available parallelism
    #[validate(range(min = 1))]
    pub workers: Option<usize>,
    #[serde(with = "humantime_serde", default = "default_query_timeout")]
    #[builder(default = DEFAULT_QUERY_TIMEOUT)]
    pub query_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_job_timeout")]
    #[builder(default = DEFAULT_JOB_TIMEOUT)]
    pub job_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    #[builder(default = default_connect_timeout())]
    pub connect_timeout: Duration,
    #[serde(default = "default_max_connections")]
    #[builder(default = default_max_connections())]
    #[validate(range(min = 1))]
    pub max_connections: u32,
}

fn default_query_timeout() -> Duration {
    DEFAULT_QUERY_TIMEOUT
}

fn default_job_timeout() -> Duration {
    DEFAULT_JOB_TIMEOUT
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_connections() -> u32 {
    16
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(deny_unknown_fields)]
pub struct MysqldumpConfig {
    #[serde(default = "default_program")]
    #[builder(default = default_program())]
    pub program: String,
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub single_transaction: bool,
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub routines: bool,
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub triggers: bool,
    #[serde(default)]
    #[builder(default)]
    pub events: bool,
    /// Pass `--column-statistics=0`; dropped automatically for clients that reject it
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub disable_column_statistics: bool,
    #[serde(default)]
    #[builder(default)]
    pub extra_args: Vec<String>,
}

fn default_program() -> String {
    "mysqldump".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for MysqldumpConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

static TIME_FORMAT: &str = "%Y-%m-%dT%Hh%Mm%Ss%z";
static SQL_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();

impl FileExtProvider for BackupConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        Some(
            std::iter::once(SQL_FILE_EXT.get_or_init(|| "sql".into()).clone())
                .chain(self.compressor.file_ext())
                .chain(self.encryptor.file_ext())
                .join(".")
                .into(),
        )
    }
}

pub fn format_timestamp<O: Display, T: TimeZone<Offset = O>>(dt: &DateTime<T>) -> String {
    dt.format(TIME_FORMAT).to_string().replace('+', "_")
}

impl BackupConfig {
    /// `<out_dir>/<sanitized unit name>.<timestamp>.<ext>`
    pub fn artifact_path<O: Display, T: TimeZone<Offset = O>>(
        &self,
        unit_name: &str,
        started: &DateTime<T>,
    ) -> PathBuf {
        self.out_dir.join(format!(
            "{}.{}.{}",
            sanitize_filename::sanitize(unit_name),
            format_timestamp(started),
            self.file_ext().unwrap_or_else(|| "".into())
        ))
    }

    /// Enabled transforms, innermost first: encryption sits next to the file
    /// so compression always sees plaintext.
    pub fn transforms(&self) -> Vec<&dyn Transform> {
        let mut transforms: Vec<&dyn Transform> = Vec::with_capacity(2);
        if self.encryptor.is_enabled() {
            transforms.push(&self.encryptor);
        }
        if self.compressor.is_enabled() {
            transforms.push(&self.compressor);
        }
        transforms
    }

    pub fn capacity_config(&self, ratios: CompressionRatioTable) -> CapacityConfig {
        CapacityConfig::builder()
            .compression(self.compressor)
            .encryption_on(self.encryptor.is_enabled())
            .combined(self.artifact_mode == ArtifactMode::Combined)
            .safety_margin_percent(self.safety_margin_percent)
            .ratios(ratios)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::compress::{CompressionAlgorithm, CompressionLevel};
    use crate::backup::encrypt::age::AgeEncryptorConfig;
    use chrono::{TimeZone, Utc};

    const YAML: &str = r#"
out_dir: OUT_DIR
connection:
  host: db.internal
  user: backup
  password: not-a-real-password
filter:
  blacklist: [legacy]
compressor:
  algorithm: zstd
  level: better
encryptor:
  encryptor_type: age
  secret_type: passphrase_env
  variable: BACKUP_PASSPHRASE
collector:
  workers: 4
  query_timeout: 5s
  job_timeout: 1m
artifact_mode: combined
safety_margin_percent: 25
"#;

    fn parse(out_dir: &std::path::Path) -> BackupConfig {
        serde_yml::from_str(&YAML.replace("OUT_DIR", &out_dir.display().to_string())).unwrap()
    }

    #[test]
    fn test_yaml_config() {
        let tmp = tempfile::tempdir().unwrap();
        let config = parse(tmp.path());

        assert!(config.validate().is_ok());
        assert_eq!(config.connection.port, 3306);
        assert_eq!(config.connection.password.as_ref().unwrap().inner(), "not-a-real-password");
        assert!(config.filter.exclude_system);
        assert_eq!(config.compressor.algorithm, CompressionAlgorithm::Zstd);
        assert_eq!(config.collector.query_timeout, Duration::from_secs(5));
        assert_eq!(config.collector.job_timeout, Duration::from_secs(60));
        assert_eq!(config.artifact_mode, ArtifactMode::Combined);
        assert_eq!(config.combined_artifact_name, "all-databases");
        assert_eq!(config.mysqldump.program, "mysqldump");
        assert!(!config.keep_failed_artifacts);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = parse(tmp.path());
        config.safety_margin_percent = -1.0;
        assert!(config.validate().is_err());

        let mut config = parse(tmp.path());
        config.combined_artifact_name = "a/b".into();
        assert!(config.validate().is_err());

        let mut config = parse(tmp.path());
        config.collector.workers = Some(0);
        assert!(config.validate().is_err());

        let mut config = parse(tmp.path());
        config.encryptor = EncryptorConfig::Age(AgeEncryptorConfig::passphrase("short"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_artifact_path_and_transform_order() {
        let tmp = tempfile::tempdir().unwrap();
        let config = BackupConfig::builder()
            .out_dir(tmp.path().to_path_buf())
            .connection(ConnectionConfig::builder().user("root".to_string()).build())
            .compressor(CompressorConfig::new(CompressionAlgorithm::Gzip, CompressionLevel::Best))
            .encryptor(EncryptorConfig::Age(AgeEncryptorConfig::passphrase("passphrase-123")))
            .build();

        let started = Utc.with_ymd_and_hms(2024, 5, 1, 3, 4, 5).unwrap();
        let path = config.artifact_path("shop/eu", &started);
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "shopeu.2024-05-01T03h04m05s_0000.sql.gz.age"
        );
        assert_eq!(config.transforms().len(), 2);

        let plain = BackupConfig {
            compressor: CompressorConfig::default(),
            encryptor: EncryptorConfig::None,
            ..config
        };
        assert!(plain.transforms().is_empty());
        assert!(plain
            .artifact_path("shop", &started)
            .to_str()
            .unwrap()
            .ends_with(".sql"));
    }

    #[test]
    fn test_capacity_config() {
        let tmp = tempfile::tempdir().unwrap();
        let capacity = parse(tmp.path()).capacity_config(CompressionRatioTable::default());
        assert!(capacity.combined);
        assert!(capacity.encryption_on);
        assert_eq!(capacity.safety_margin_percent, 25.0);
    }
}
