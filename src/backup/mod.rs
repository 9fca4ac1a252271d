pub mod admission;
pub mod backup_config;
pub mod cancel;
pub mod compress;
pub mod dump_command;
pub mod encrypt;
pub mod file_ext;
pub mod filter;
pub mod finish;
pub mod metadata;
pub mod orchestrator;
pub mod pipeline;
pub mod redacted;
pub mod result_error;
pub mod validate;
