use crate::backup::filter::FilterStats;
use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use itertools::Itertools;
use std::fmt::Debug;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    AgeEncrypt(#[from] age::EncryptError),
    #[error(transparent)]
    AgeDecrypt(#[from] age::DecryptError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("cannot resolve encryption key: {0}")]
    KeyResolution(String),
    #[error("no eligible databases ({} found)", .0.total_found)]
    NoEligibleDatabases(FilterStats),
    #[error("insufficient disk space: {required} bytes required, {available} bytes available, {} bytes short", shortage(.required, .available))]
    InsufficientSpace { required: u64, available: u64 },
    #[error("failed to launch dump process {program:?}: {source}")]
    DumpLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("dump process failed ({status}):\n{}", indent::indent_all_with("  ", .stderr))]
    DumpFatal { status: ExitStatus, stderr: String },
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("operation cancelled")]
    Cancelled,
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send + Sync>,
        fn_name: String,
    },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

fn shortage(required: &u64, available: &u64) -> u64 {
    required.saturating_sub(*available)
}

impl<S: Into<String>, O: Debug + Send + Sync + 'static> WithDebugObjectAndFnName<S, O> for Error {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl Error {
    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }

    /// Looks through message and debug wrappers for the error that caused this one.
    /// For an aggregate, the first error is the cause.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithMsg { error, .. } => error.root(),
            Error::WithDebugObjAndFnName { error, .. } => error.root(),
            Error::LotsOfError(errors) => errors.first().map_or(self, Error::root),
            e => e,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled)
    }
}
