use crate::backup::backup_config::ConnectionConfig;
use crate::backup::metadata::{MetadataSource, Metric};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use std::time::Duration;
use tokio::runtime::Runtime;

const LIST_DATABASES: &str = "SELECT schema_name FROM information_schema.schemata ORDER BY schema_name";

/// Statistics read from `information_schema`.
///
/// The collector is thread based, so the pool lives on a private runtime and
/// every query is driven to completion with `block_on` from the calling thread.
pub struct MysqlMetadataSource {
    runtime: Runtime,
    pool: MySqlPool,
}

impl MysqlMetadataSource {
    pub fn connect(connection: &ConnectionConfig, max_connections: u32, connect_timeout: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("db-backup-sqlx")
            .build()?;
        let pool = runtime
            .block_on(
                MySqlPoolOptions::new()
                    .max_connections(max_connections.max(1))
                    .acquire_timeout(connect_timeout)
                    .connect_with(connect_options(connection)),
            )
            .map_err(Error::from)
            .with_msg(format!(
                "Connect to MySQL server {}:{} failed",
                connection.host, connection.port
            ))?;
        tracing::info!(
            "Connected to MySQL server {}:{} as {}",
            connection.host,
            connection.port,
            connection.user
        );
        Ok(Self { runtime, pool })
    }
}

fn connect_options(connection: &ConnectionConfig) -> MySqlConnectOptions {
    let options = MySqlConnectOptions::new()
        .host(&connection.host)
        .port(connection.port)
        .username(&connection.user);
    let options = match &connection.password {
        Some(password) if !password.is_empty() => options.password(password.inner()),
        _ => options,
    };
    match &connection.socket {
        Some(socket) => options.socket(socket),
        None => options,
    }
}

fn metric_query(metric: Metric) -> &'static str {
    match metric {
        Metric::Size => {
            "SELECT CAST(COALESCE(SUM(data_length + index_length), 0) AS SIGNED) \
             FROM information_schema.tables WHERE table_schema = ?"
        }
        Metric::Tables => {
            "SELECT CAST(COUNT(*) AS SIGNED) FROM information_schema.tables \
             WHERE table_schema = ? AND table_type = 'BASE TABLE'"
        }
        Metric::Procedures => {
            "SELECT CAST(COUNT(*) AS SIGNED) FROM information_schema.routines \
             WHERE routine_schema = ? AND routine_type = 'PROCEDURE'"
        }
        Metric::Functions => {
            "SELECT CAST(COUNT(*) AS SIGNED) FROM information_schema.routines \
             WHERE routine_schema = ? AND routine_type = 'FUNCTION'"
        }
        Metric::Views => {
            "SELECT CAST(COUNT(*) AS SIGNED) FROM information_schema.views WHERE table_schema = ?"
        }
        Metric::Grants => {
            "SELECT CAST(COUNT(DISTINCT grantee) AS SIGNED) \
             FROM information_schema.schema_privileges WHERE table_schema = ?"
        }
    }
}

impl MetadataSource for MysqlMetadataSource {
    fn list_databases(&self) -> Result<Vec<String>> {
        let names = self
            .runtime
            .block_on(sqlx::query_scalar::<_, String>(LIST_DATABASES).fetch_all(&self.pool))
            .map_err(Error::from)
            .with_msg("List databases failed")?;
        tracing::info!("Server reports {} databases", names.len());
        Ok(names)
    }

    fn query_metric(&self, database: &str, metric: Metric, timeout: Duration) -> Result<u64> {
        let query = sqlx::query_scalar::<_, i64>(metric_query(metric))
            .bind(database)
            .fetch_one(&self.pool);
        let value = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, query).await })
            .map_err(|_| Error::Timeout(timeout))??;
        Ok(u64::try_from(value).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_metric_binds_one_schema() {
        for metric in Metric::ALL {
            let query = metric_query(metric);
            assert_eq!(query.matches('?').count(), 1, "{metric}");
            assert!(query.contains("CAST("), "{metric} must decode as a signed integer");
        }
    }
}
