//! inpack - build installer archives and deploy them transactionally
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! # Commands
//!
//! ```text
//! inpack build    <catalog> <archive> <descriptor>   resolve + pack
//! inpack deploy   <archive> <descriptor> <root>      unpack + commit (or roll back)
//! inpack verify   <archive> <descriptor>             check every checksum, write nothing
//! inpack uninstall <root>                            remove what the receipt lists
//! ```
//!
//! Failures exit with the code of their error class; see [`exit`].

pub mod cmd;
pub mod exit;
pub mod ui;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use inpack_core::MissingSourcePolicy;
use inpack_core::config::{
    ENV_COMMIT_TIMEOUT_SECS, ENV_DEFAULT_CODEC, ENV_WORKERS, ENV_ZSTD_LEVEL,
};

#[derive(Debug, Parser)]
#[command(name = "inpack")]
#[command(author, version, about = "inpack - installer archives with transactional deploy")]
pub struct Cli {
    /// Only print warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Resolve a catalog and write an archive plus its pack descriptor
    Build {
        /// Catalog file (TOML)
        catalog: PathBuf,
        /// Output archive
        archive: PathBuf,
        /// Output pack descriptor (JSON)
        descriptor: PathBuf,
        /// Component to include with its dependencies (repeatable; default: all)
        #[arg(short, long = "component", value_name = "ID")]
        components: Vec<String>,
        /// Codec for artifacts that do not name one
        #[arg(long, env = ENV_DEFAULT_CODEC)]
        codec: Option<String>,
        /// zstd compression level (1-22)
        #[arg(long, env = ENV_ZSTD_LEVEL)]
        zstd_level: Option<i32>,
    },
    /// Deploy an archive into a target directory
    Deploy {
        /// Archive file
        archive: PathBuf,
        /// Pack descriptor of the same build
        descriptor: PathBuf,
        /// Installation root
        target_root: PathBuf,
        /// Parallel unpack workers
        #[arg(short, long, env = ENV_WORKERS)]
        workers: Option<usize>,
        /// Seconds to wait for a locked file during commit
        #[arg(long, env = ENV_COMMIT_TIMEOUT_SECS, value_name = "SECS")]
        commit_timeout: Option<u64>,
        /// Target template variable (repeatable)
        #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,
        /// Source tree for loose entries (default: the archive's directory)
        #[arg(long)]
        loose_source: Option<PathBuf>,
        /// What to do when a loose source file is missing: skip or abort
        #[arg(long, default_value = "abort")]
        on_missing: MissingSourcePolicy,
        /// Abort instead of retrying unavailable targets at commit
        #[arg(long)]
        no_retry: bool,
        /// The process already has elevated privileges
        #[arg(long)]
        elevated: bool,
    },
    /// Check every entry's checksum without writing anything
    Verify {
        /// Archive file
        archive: PathBuf,
        /// Pack descriptor of the same build
        descriptor: PathBuf,
        /// Source tree for loose entries (default: the archive's directory)
        #[arg(long)]
        loose_source: Option<PathBuf>,
        /// What to do when a loose source file is missing: skip or abort
        #[arg(long, default_value = "abort")]
        on_missing: MissingSourcePolicy,
    },
    /// Remove everything a previous deploy installed
    Uninstall {
        /// Installation root
        target_root: PathBuf,
        /// The process already has elevated privileges
        #[arg(long)]
        elevated: bool,
    },
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{s}'")),
    }
}
