use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use noxbuild_loader::ExecImage;

use noxbuild::fetch::{self, RuntimeSpec};
use noxbuild::report::{write_json_stdout, BuildReport, Reporter, BUILD_REPORT_SCHEMA_VERSION};
use noxbuild::run;
use noxbuild::shim;

const FRAMEWORK_ENTRY: &str = "node_modules/next/dist/bin/next";
const BUILD_SUBCOMMAND: &str = "build";
const OUTPUT_DIR: &str = "out";

#[derive(Debug, Parser)]
#[command(name = "noxbuild")]
#[command(about = "Framework build orchestrator for noexec scratch filesystems.", long_about = None)]
struct Cli {
    /// Framework project to build (default: current directory).
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Holds the runtime archive, the unpacked runtime, and the shim
    /// (default: the system temp directory).
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    #[arg(long, default_value = fetch::DEFAULT_RUNTIME_VERSION)]
    runtime_version: String,

    #[arg(long, default_value = fetch::DEFAULT_RUNTIME_BASE_URL)]
    runtime_url: String,

    #[arg(long, default_value = fetch::DEFAULT_RUNTIME_FORMAT)]
    runtime_format: String,

    /// Verify the downloaded archive against this digest.
    #[arg(long)]
    runtime_sha256: Option<String>,

    /// Skip dependency installation even if node_modules is absent.
    #[arg(long)]
    skip_install: bool,

    #[arg(long)]
    json: bool,

    #[arg(long)]
    quiet: bool,
}

fn main() -> std::process::ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();
    let reporter = Reporter {
        json: cli.json,
        quiet: cli.quiet,
    };

    let project_dir = match cli.project_dir {
        Some(p) => p,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let scratch_dir = cli.scratch_dir.unwrap_or_else(std::env::temp_dir);

    let spec = RuntimeSpec::pinned(
        &cli.runtime_version,
        &cli.runtime_url,
        &cli.runtime_format,
        cli.runtime_sha256,
    )?;
    let layout = fetch::ensure_runtime(&scratch_dir, &spec, &reporter)?;

    let image_bytes = std::fs::read(&layout.node_bin)
        .with_context(|| format!("read runtime image: {}", layout.node_bin.display()))?;
    // `image` must outlive every spawn that uses its exec path.
    let image = ExecImage::load(&image_bytes, "node")?;
    drop(image_bytes);
    let exec_path = image.exec_path();

    let runtime_version = run::runtime_version(&exec_path)?;
    reporter.progress(&format!("runtime: {runtime_version}"));

    let mut installed = false;
    if !cli.skip_install && !project_dir.join("node_modules").is_dir() {
        reporter.progress("install dependencies");
        run::install_dependencies(&exec_path, &layout.npm_cli, &project_dir, &scratch_dir)?;
        installed = true;
    }

    let framework_entry = project_dir.join(FRAMEWORK_ENTRY);
    let shim_path = shim::write_shim(&scratch_dir, &exec_path, &framework_entry)?;

    let exit_status = {
        let mut stdout = std::io::stdout().lock();
        run::run_build(
            &exec_path,
            &shim_path,
            BUILD_SUBCOMMAND,
            &project_dir,
            &scratch_dir,
            &mut stdout,
        )?
    };

    let output_dir = project_dir.join(OUTPUT_DIR);
    let ok = exit_status == 0;
    if ok {
        reporter.progress(&format!("build succeeded; output in {}", output_dir.display()));
    } else {
        reporter.progress(&format!("build failed with code {exit_status}"));
    }

    if cli.json {
        write_json_stdout(&BuildReport {
            schema_version: BUILD_REPORT_SCHEMA_VERSION,
            ok,
            exit_status,
            runtime_version,
            runtime_root: layout.root.display().to_string(),
            installed_dependencies: installed,
            output_dir: output_dir.display().to_string(),
        })?;
    }

    Ok(std::process::ExitCode::from(
        u8::try_from(exit_status).unwrap_or(1),
    ))
}
