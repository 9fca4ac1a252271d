//! # db-backup
//!
//! A MySQL backup engine producing one compressed and optionally encrypted
//! `mysqldump` artifact per database, or one combined artifact per run.
//!
//! ## Features
//!
//! - **Filtering**: whitelist, blacklist and system-schema exclusion
//! - **Metadata**: per-database sizes and object counts, collected in parallel
//! - **Admission Control**: refuses to start when the output disk is too small
//! - **Compression**: gzip, parallel gzip, zlib and zstd
//! - **Encryption**: Age encryption with passphrase support
//! - **Run Summary**: a JSON audit record of every run
//!
//! ## Quick Start
//!
//! ```no_run
//! use db_backup::backup::backup_config::BackupConfig;
//! use db_backup::backup::cancel::CancelToken;
//! use db_backup::backup::dump_command::MysqldumpCommand;
//! use db_backup::backup::metadata::mysql::MysqlMetadataSource;
//! use db_backup::backup::orchestrator::BackupEngine;
//! use std::sync::Arc;
//!
//! let config: BackupConfig = serde_yml::from_reader(std::fs::File::open("config.yml")?)?;
//! let source = MysqlMetadataSource::connect(
//!     &config.connection,
//!     config.collector.max_connections,
//!     config.collector.connect_timeout,
//! )?;
//! let engine = BackupEngine::builder()
//!     .dump_command(Arc::new(MysqldumpCommand::new(
//!         config.connection.clone(),
//!         config.mysqldump.clone(),
//!     )))
//!     .source(Arc::new(source))
//!     .config(config)
//!     .build();
//! let summary = engine.run(&CancelToken::new());
//! summary.log();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
