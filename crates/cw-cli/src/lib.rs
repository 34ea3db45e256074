//! Watch-time analytics CLI library.
//!
//! This crate provides the `cw` command-line interface.

mod cli;
pub mod commands;
mod config;
pub mod identity;

pub use cli::{ChannelsAction, Cli, Commands};
pub use config::Config;
