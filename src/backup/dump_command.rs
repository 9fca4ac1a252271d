use crate::backup::backup_config::{ConnectionConfig, MysqldumpConfig};
use crate::backup::pipeline::DumpInvocation;

/// Error text of clients that do not know `--column-statistics`.
const COLUMN_STATISTICS_UNSUPPORTED: &str = "unknown variable 'column-statistics";
const DISABLE_COLUMN_STATISTICS: &str = "--column-statistics=0";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DumpTarget {
    Database(String),
    Databases(Vec<String>),
    AllDatabases,
}

pub trait DumpCommandFactory: Send + Sync {
    fn invocation(&self, target: &DumpTarget) -> DumpInvocation;

    /// A reduced invocation to retry with once, when `stderr` shows that an
    /// optional feature is not supported.
    fn degraded(&self, _invocation: &DumpInvocation, _stderr: &str) -> Option<DumpInvocation> {
        None
    }
}

#[derive(Clone, Debug)]
pub struct MysqldumpCommand {
    connection: ConnectionConfig,
    options: MysqldumpConfig,
}

impl MysqldumpCommand {
    pub fn new(connection: ConnectionConfig, options: MysqldumpConfig) -> Self {
        Self {
            connection,
            options,
        }
    }
}

impl DumpCommandFactory for MysqldumpCommand {
    fn invocation(&self, target: &DumpTarget) -> DumpInvocation {
        let connection = &self.connection;
        let options = &self.options;

        let mut args = vec![
            format!("--host={}", connection.host),
            format!("--port={}", connection.port),
            format!("--user={}", connection.user),
        ];
        if let Some(socket) = &connection.socket {
            args.push(format!("--socket={}", socket.display()));
        }
        let flags = [
            (options.single_transaction, "--single-transaction"),
            (options.routines, "--routines"),
            (options.triggers, "--triggers"),
            (options.events, "--events"),
            (options.disable_column_statistics, DISABLE_COLUMN_STATISTICS),
        ];
        args.extend(
            flags
                .into_iter()
                .filter(|(enabled, _)| *enabled)
                .map(|(_, flag)| flag.to_string()),
        );
        args.extend(options.extra_args.iter().cloned());

        match target {
            DumpTarget::Database(name) => {
                args.push("--databases".into());
                args.push(name.clone());
            }
            DumpTarget::Databases(names) => {
                args.push("--databases".into());
                args.extend(names.iter().cloned());
            }
            DumpTarget::AllDatabases => args.push("--all-databases".into()),
        }

        let invocation = DumpInvocation::new(&options.program, args);
        // Passing the password in argv would expose it in the process list.
        match &connection.password {
            Some(password) if !password.is_empty() => {
                invocation.with_env("MYSQL_PWD", password.clone())
            }
            _ => invocation,
        }
    }

    fn degraded(&self, invocation: &DumpInvocation, stderr: &str) -> Option<DumpInvocation> {
        if !stderr.contains(COLUMN_STATISTICS_UNSUPPORTED)
            || !invocation.args.iter().any(|a| a == DISABLE_COLUMN_STATISTICS)
        {
            return None;
        }
        let mut reduced = invocation.clone();
        reduced.args.retain(|a| a != DISABLE_COLUMN_STATISTICS);
        Some(reduced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::redacted::RedactedString;

    fn command(options: MysqldumpConfig) -> MysqldumpCommand {
        let connection = ConnectionConfig::builder()
            .host("db.internal".to_string())
            .port(3307)
            .user("backup".to_string())
            .password(RedactedString::new("hunter2hunter2"))
            .build();
        MysqldumpCommand::new(connection, options)
    }

    #[test]
    fn test_single_database_invocation() {
        let invocation = command(MysqldumpConfig::default())
            .invocation(&DumpTarget::Database("shop".into()));

        assert_eq!(invocation.program, "mysqldump");
        assert_eq!(
            invocation.args,
            vec![
                "--host=db.internal",
                "--port=3307",
                "--user=backup",
                "--single-transaction",
                "--routines",
                "--triggers",
                "--column-statistics=0",
                "--databases",
                "shop",
            ]
        );
        assert!(invocation.args.iter().all(|a| !a.contains("hunter2")));
        assert_eq!(invocation.envs.len(), 1);
        assert_eq!(invocation.envs[0].0, "MYSQL_PWD");
        assert_eq!(invocation.envs[0].1.inner(), "hunter2hunter2");
    }

    #[test]
    fn test_target_selection() {
        let options = MysqldumpConfig::builder()
            .events(true)
            .disable_column_statistics(false)
            .extra_args(vec!["--hex-blob".to_string()])
            .build();
        let cmd = command(options);

        let many = cmd.invocation(&DumpTarget::Databases(vec!["a".into(), "b".into()]));
        assert!(many.args.ends_with(&["--databases".into(), "a".into(), "b".into()]));
        assert!(many.args.contains(&"--events".to_string()));
        assert!(many.args.contains(&"--hex-blob".to_string()));
        assert!(!many.args.contains(&"--column-statistics=0".to_string()));

        let all = cmd.invocation(&DumpTarget::AllDatabases);
        assert_eq!(all.args.last().map(String::as_str), Some("--all-databases"));
        assert!(!all.args.contains(&"--databases".to_string()));
    }

    #[test]
    fn test_degraded_drops_column_statistics_once() {
        let cmd = command(MysqldumpConfig::default());
        let invocation = cmd.invocation(&DumpTarget::Database("shop".into()));

        let stderr = "mysqldump: unknown variable 'column-statistics=0'";
        let reduced = cmd.degraded(&invocation, stderr).unwrap();
        assert!(!reduced.args.contains(&"--column-statistics=0".to_string()));
        assert_eq!(reduced.args.len(), invocation.args.len() - 1);

        assert!(cmd.degraded(&reduced, stderr).is_none());
        assert!(cmd.degraded(&invocation, "Access denied").is_none());
    }
}
