//! inpack - installer archives with transactional deploy

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use inpack_cli::cmd;
use inpack_cli::cmd::build::BuildArgs;
use inpack_cli::cmd::deploy::DeployArgs;
use inpack_cli::exit;
use inpack_cli::ui::ConsoleSink;
use inpack_cli::{Cli, Commands};
use inpack_core::DeployRequest;

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so stdout stays clean for progress output
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let sink = ConsoleSink::new(cli.quiet);

    // Ctrl-C cancels at the next entry boundary; the deploy then rolls back.
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let result = match cli.command {
        Commands::Build {
            catalog,
            archive,
            descriptor,
            components,
            codec,
            zstd_level,
        } => {
            let args = BuildArgs {
                components: &components,
                codec: codec.as_deref(),
                zstd_level,
            };
            cmd::build::build(&catalog, &archive, &descriptor, &args, &sink)
        }
        Commands::Deploy {
            archive,
            descriptor,
            target_root,
            workers,
            commit_timeout,
            vars,
            loose_source,
            on_missing,
            no_retry,
            elevated,
        } => {
            let request = DeployRequest {
                archive,
                descriptor,
                target_root,
            };
            let args = DeployArgs {
                workers,
                commit_timeout,
                vars,
                loose_source,
                on_missing,
                no_retry,
                elevated,
            };
            cmd::deploy::deploy(request, args, sink, cancel).await
        }
        Commands::Verify {
            archive,
            descriptor,
            loose_source,
            on_missing,
        } => cmd::verify::verify(&archive, &descriptor, loose_source, on_missing, &sink),
        Commands::Uninstall {
            target_root,
            elevated,
        } => cmd::uninstall::uninstall(&target_root, elevated, &sink),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if exit::is_fatal(&err) {
                eprintln!(
                    "error: the target was left in an unknown state; inspect it before retrying"
                );
            }
            ExitCode::from(exit::code(&err))
        }
    }
}
