//! CLI subcommand implementations.

pub mod aggregate;
pub mod channels;
pub mod heartbeat;
pub mod init;
pub mod listen;
pub mod ranks;
pub mod reconcile;
pub mod retention;
pub mod status;
