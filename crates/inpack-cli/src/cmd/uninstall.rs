//! Uninstall command

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use inpack_core::{LocalEnvironment, uninstall as remove_installation};

use crate::ui::ConsoleSink;

pub fn uninstall(target_root: &Path, elevated: bool, sink: &ConsoleSink) -> Result<()> {
    let report = remove_installation(target_root, Arc::new(LocalEnvironment { elevated }), sink)?;
    sink.line(format_args!(
        "removed build {} from {}",
        report.build_id,
        target_root.display()
    ));
    Ok(())
}
