//! Deploy command

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use inpack_core::unpack::FixedPolicy;
use inpack_core::{
    DeployConfig, DeployRequest, Deployer, LocalEnvironment, MissingSourcePolicy, ProgressSink,
};

use crate::ui::ConsoleSink;

/// Flags that override [`DeployConfig`].
#[derive(Debug)]
pub struct DeployArgs {
    pub workers: Option<usize>,
    pub commit_timeout: Option<u64>,
    pub vars: Vec<(String, String)>,
    pub loose_source: Option<PathBuf>,
    pub on_missing: MissingSourcePolicy,
    pub no_retry: bool,
    pub elevated: bool,
}

pub async fn deploy(
    request: DeployRequest,
    args: DeployArgs,
    sink: ConsoleSink,
    cancel: CancellationToken,
) -> Result<()> {
    let mut config = DeployConfig::from_env();
    if let Some(workers) = args.workers {
        config.workers = workers.max(1);
    }
    if let Some(secs) = args.commit_timeout {
        config.commit_timeout = Duration::from_secs(secs);
    }
    config.variables.extend(args.vars);
    config.loose_source = args.loose_source;
    config.missing_loose_policy = args.on_missing;
    config.retry_unavailable = !args.no_retry;

    let target = request.target_root.clone();
    let deployer = Deployer::new(config)
        .with_environment(Arc::new(LocalEnvironment {
            elevated: args.elevated,
        }))
        .with_prompt(Arc::new(FixedPolicy(args.on_missing)))
        .with_sink(Arc::new(sink))
        .with_cancellation(cancel);

    let report = deployer.deploy(request).await?;

    for warning in &report.warnings {
        sink.warning(&warning.message);
    }
    sink.line(format_args!(
        "deployed build {} to {}: {} written, {} deferred, {} skipped, {} removed",
        report.build_id,
        target.display(),
        report.written.len(),
        report.deferred.len(),
        report.skipped.len(),
        report.removed.len()
    ));
    Ok(())
}
