//! Build command

use std::path::Path;

use anyhow::{Context, Result};

use inpack_core::{
    ArchiveBuilder, BuildConfig, Catalog, CodecId, ComponentId, ProgressSink, resolve,
};

use crate::ui::ConsoleSink;

/// Flags that override [`BuildConfig`].
#[derive(Debug, Default)]
pub struct BuildArgs<'a> {
    pub components: &'a [String],
    pub codec: Option<&'a str>,
    pub zstd_level: Option<i32>,
}

/// Resolve `catalog_path` and write the archive and descriptor.
pub fn build(
    catalog_path: &Path,
    archive: &Path,
    descriptor: &Path,
    args: &BuildArgs<'_>,
    sink: &ConsoleSink,
) -> Result<()> {
    let mut config = BuildConfig::from_env();
    if let Some(level) = args.zstd_level {
        config.zstd_level = level;
    }

    let catalog = Catalog::load(catalog_path)
        .with_context(|| format!("loading catalog {}", catalog_path.display()))?;

    // Flag beats catalog beats environment default.
    let default_codec = args
        .codec
        .map(CodecId::new)
        .or_else(|| catalog.default_codec().cloned())
        .unwrap_or_else(|| config.default_codec.clone());

    let request: Vec<ComponentId> = if args.components.is_empty() {
        catalog.ids()
    } else {
        args.components.iter().map(ComponentId::new).collect()
    };

    sink.section("Resolving");
    let resolved = resolve(&catalog, &request)?;
    for shadow in &resolved.shadowed {
        let how = if shadow.overridden {
            "overridden by"
        } else {
            "already claimed by"
        };
        sink.info(&format!(
            "  {} from '{}' {how} '{}'",
            shadow.container_path, shadow.dropped, shadow.kept
        ));
    }
    sink.line(format_args!(
        "{} artifact(s) from {} component(s)",
        resolved.len(),
        resolved.components.len()
    ));

    let output = ArchiveBuilder::new(config.registry(), default_codec).build(
        &resolved,
        archive,
        descriptor,
        sink,
    )?;
    sink.line(format_args!(
        "build {} -> {} ({} bytes), {}",
        output.descriptor.build_id,
        output.archive_path.display(),
        output.archive_len,
        output.descriptor_path.display()
    ));
    Ok(())
}
