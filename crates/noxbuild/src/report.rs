use std::io::Write as _;

use anyhow::{Context, Result};
use serde::Serialize;

pub const BUILD_REPORT_SCHEMA_VERSION: &str = "noxbuild.build.report@0.1.0";

#[derive(Debug)]
pub struct Reporter {
    pub json: bool,
    pub quiet: bool,
}

impl Reporter {
    pub fn progress(&self, msg: &str) {
        if self.json || self.quiet {
            return;
        }
        eprintln!("{msg}");
    }
}

#[derive(Debug, Serialize)]
pub struct BuildReport {
    pub schema_version: &'static str,
    pub ok: bool,
    pub exit_status: i32,
    pub runtime_version: String,
    pub runtime_root: String,
    pub installed_dependencies: bool,
    pub output_dir: String,
}

pub fn write_json_stdout<T: Serialize>(v: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec(v)?;
    bytes.push(b'\n');
    std::io::stdout()
        .write_all(&bytes)
        .context("write stdout")?;
    Ok(())
}
