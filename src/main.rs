use chrono::Utc;
use clap::Parser;
use db_backup::backup::backup_config::BackupConfig;
use db_backup::backup::cancel::CancelToken;
use db_backup::backup::dump_command::MysqldumpCommand;
use db_backup::backup::metadata::mysql::MysqlMetadataSource;
use db_backup::backup::orchestrator::{AbortReason, BackupEngine, RunSummary};
use db_backup::backup::result_error::error::Error;
use db_backup::backup::result_error::result::Result;
use db_backup::backup::result_error::WithMsg;
use std::fs::File;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info};
use validator::Validate;

/// Back up the databases of a MySQL server with mysqldump
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,
}

fn run(args: &Args) -> Result<RunSummary> {
    let config = File::open(&args.config)
        .map_err(Error::from)
        .and_then(|f| {
            serde_yml::from_reader::<_, BackupConfig>(f)
                .map_err(Error::from)
                .with_msg(format!("Parse YAML config failed: {:?}", &args.config))
        })
        .and_then(|bc| {
            bc.validate()
                .map_err(Error::from)
                .map(|_| bc)
                .with_msg(format!("Config validation failed: {:?}", &args.config))
        })?;

    let out_dir = config.out_dir.clone();
    let started_at = Utc::now();
    let summary = match MysqlMetadataSource::connect(
        &config.connection,
        config.collector.max_connections,
        config.collector.connect_timeout,
    ) {
        Ok(source) => {
            let dump_command =
                MysqldumpCommand::new(config.connection.clone(), config.mysqldump.clone());
            BackupEngine::builder()
                .source(Arc::new(source))
                .dump_command(Arc::new(dump_command))
                .config(config)
                .build()
                .run(&CancelToken::new())
        }
        Err(e) => RunSummary::aborted(started_at, AbortReason::ListingFailed, &e),
    };

    let path = summary.persist(&out_dir)?;
    info!("Run summary written to {:?}", path);
    Ok(summary)
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    match run(&args) {
        Ok(summary) => {
            summary.log();
            if !summary.is_success() {
                exit(1);
            }
        }
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    }
}
