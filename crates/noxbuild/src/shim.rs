use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const SHIM_FILE_NAME: &str = "noxbuild_shim.js";

/// Render the self-path-override shim: nested tooling that re-invokes
/// `process.execPath` must resolve to the execution handle, not to a disk
/// path that does not exist.
pub fn render_shim(exec_path: &Path, framework_entry: &Path) -> String {
    format!(
        "Object.defineProperty(process, 'execPath', {{\n  get: function() {{ return '{}'; }},\n  configurable: true\n}});\nrequire('{}');\n",
        js_single_quoted(&exec_path.display().to_string()),
        js_single_quoted(&framework_entry.display().to_string()),
    )
}

fn js_single_quoted(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

pub fn write_shim(scratch: &Path, exec_path: &Path, framework_entry: &Path) -> Result<PathBuf> {
    let path = scratch.join(SHIM_FILE_NAME);
    std::fs::write(&path, render_shim(exec_path, framework_entry))
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}
