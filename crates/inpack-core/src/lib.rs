//! inpack core: resolve, build, deploy, commit or roll back.
//!
//! # Pipeline
//!
//! ```text
//! Catalog --resolve()--> ResolvedSet --ArchiveBuilder--> archive + PackDescriptor
//!
//! archive + PackDescriptor --Deployer--> Unpacker --Transaction--> committed files
//! ```
//!
//! Build-time stages are single-threaded and deterministic. Deploy stages
//! unpack through a bounded worker pool but submit every filesystem
//! mutation to one [`Transaction`](transaction::Transaction) in descriptor
//! order, so a failure anywhere rolls the target back to its pre-deploy
//! state.

pub mod archive;
pub mod builder;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod deploy;
pub mod io;
pub mod reporter;
pub mod resolver;
pub mod template;
pub mod transaction;
pub mod uninstall;
pub mod unpack;
pub mod verify;

pub use archive::{ArchiveError, ArchiveReader};
pub use builder::{ArchiveBuilder, BuildError, BuildOutput};
pub use catalog::{Artifact, ArtifactSource, Catalog, CatalogError, Component};
pub use codec::{Codec, CodecError, CodecRegistry};
pub use config::{BuildConfig, DeployConfig};
pub use deploy::{DeployError, DeployReport, DeployRequest, Deployer, SkippedEntry};
pub use reporter::{EntryOutcome, NullSink, ProgressSink};
pub use resolver::{ResolutionError, ResolvedArtifact, ResolvedSet, resolve};
pub use transaction::{
    LocalEnvironment, TargetEnvironment, Transaction, TransactionError, TransactionState,
};
pub use uninstall::{UninstallReport, uninstall};
pub use unpack::{MissingSourcePolicy, MissingSourcePrompt, UnpackError, Unpacker, Warning};
pub use verify::{VerifyReport, verify};

pub use inpack_schema::{
    Blake3Hash, BuildId, CodecId, ComponentId, ContainerPath, EntryFlags, FileEntry,
    PackDescriptor,
};
