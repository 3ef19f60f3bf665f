use std::io::{BufRead as _, BufReader, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{bail, Context, Result};

// Pid of the currently relayed child, for the signal forwarders. Zero when
// no build spawn is in flight.
static ACTIVE_CHILD_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_signal(sig: libc::c_int) {
    let pid = ACTIVE_CHILD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        unsafe {
            libc::kill(pid, sig);
        }
    }
}

fn install_forwarders() {
    let handler: extern "C" fn(libc::c_int) = forward_signal;
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn reset_forwarders() {
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
        libc::signal(libc::SIGTERM, libc::SIG_DFL);
    }
}

pub fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    let mut code = status.code().unwrap_or(1);
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(sig) = status.signal() {
            code = 128 + sig;
        }
    }
    code
}

pub fn runtime_version(exec_path: &Path) -> Result<String> {
    let out = Command::new(exec_path)
        .arg("-v")
        .output()
        .with_context(|| format!("spawn runtime: {}", exec_path.display()))?;
    if !out.status.success() {
        bail!(
            "runtime version check failed (status {})\nstderr:\n{}",
            out.status,
            String::from_utf8_lossy(&out.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

pub fn install_dependencies(
    exec_path: &Path,
    npm_cli: &Path,
    project_dir: &Path,
    scratch: &Path,
) -> Result<()> {
    let mut cmd = Command::new(exec_path);
    cmd.arg(npm_cli).arg("install");
    cmd.current_dir(project_dir);
    cmd.env("HOME", scratch);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());
    let status = cmd
        .status()
        .with_context(|| format!("spawn dependency install: {}", npm_cli.display()))?;
    if !status.success() {
        bail!("dependency install failed (status {status})");
    }
    Ok(())
}

/// Spawn `cmd` with stdout and stderr merged onto one anonymous pipe and
/// relay that stream to `sink` line by line, in the order the kernel saw the
/// writes. SIGINT/SIGTERM received while the child runs are forwarded to it.
/// Returns the child's exit code; death by signal maps to 128 + signo.
pub fn relay_command<W: Write>(mut cmd: Command, sink: &mut W) -> Result<i32> {
    let (reader, writer) = std::io::pipe().context("create relay pipe")?;
    let writer_clone = writer.try_clone().context("clone relay pipe")?;
    cmd.stdin(Stdio::null());
    cmd.stdout(writer_clone);
    cmd.stderr(writer);

    let mut child = cmd.spawn().context("spawn delegated command")?;
    // The parent's copies of the write end live inside `cmd`; they must be
    // closed or the relay never sees EOF.
    drop(cmd);

    ACTIVE_CHILD_PID.store(child.id() as i32, Ordering::SeqCst);
    install_forwarders();

    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .context("read delegated output")?;
        if n == 0 {
            break;
        }
        sink.write_all(&line).context("relay delegated output")?;
        sink.flush().ok();
    }

    let status = child.wait().context("wait for delegated command")?;
    reset_forwarders();
    ACTIVE_CHILD_PID.store(0, Ordering::SeqCst);
    Ok(exit_code_of(status))
}

pub fn run_build<W: Write>(
    exec_path: &Path,
    shim: &Path,
    subcommand: &str,
    project_dir: &Path,
    scratch: &Path,
    sink: &mut W,
) -> Result<i32> {
    let mut cmd = Command::new(exec_path);
    cmd.arg(shim).arg(subcommand);
    cmd.current_dir(project_dir);
    cmd.env("HOME", scratch);
    cmd.env("NEXT_TELEMETRY_DISABLED", "1");
    relay_command(cmd, sink)
}
