use std::fs::File;
use std::io::{Read as _, Write as _};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use sha2::{Digest as _, Sha256};
use xz2::read::XzDecoder;

use crate::report::Reporter;

pub const DEFAULT_RUNTIME_VERSION: &str = "v20.11.0";
pub const DEFAULT_RUNTIME_BASE_URL: &str = "https://nodejs.org/dist";
pub const DEFAULT_RUNTIME_FORMAT: &str = "tar.gz";

#[derive(Debug, Clone)]
pub struct RuntimeSpec {
    pub version: String,
    pub target: String,
    pub base_url: String,
    pub format: String,
    pub sha256: Option<String>,
}

impl RuntimeSpec {
    pub fn pinned(
        version: &str,
        base_url: &str,
        format: &str,
        sha256: Option<String>,
    ) -> Result<Self> {
        let version = version.trim();
        if version.is_empty() {
            bail!("runtime version must be non-empty");
        }
        if version.contains('/') || version.contains("..") {
            bail!("invalid runtime version: {version:?}");
        }
        match format {
            "tar.gz" | "tar.xz" => {}
            other => bail!("unsupported archive format: {other} (expected tar.gz or tar.xz)"),
        }
        Ok(Self {
            version: version.to_string(),
            target: detect_target()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            format: format.to_string(),
            sha256,
        })
    }

    pub fn dir_name(&self) -> String {
        format!("node-{}-{}", self.version, self.target)
    }

    pub fn archive_name(&self) -> String {
        format!("{}.{}", self.dir_name(), self.format)
    }

    pub fn archive_url(&self) -> String {
        format!("{}/{}/{}", self.base_url, self.version, self.archive_name())
    }
}

pub fn detect_target() -> Result<String> {
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;
    let key = match (os, arch) {
        ("linux", "x86_64") => "linux-x64",
        ("linux", "aarch64") => "linux-arm64",
        _ => bail!("unsupported host for noxbuild: os={os} arch={arch}"),
    };
    Ok(key.to_string())
}

#[derive(Debug, Clone)]
pub struct RuntimeLayout {
    pub root: PathBuf,
    pub node_bin: PathBuf,
    pub npm_cli: PathBuf,
}

impl RuntimeLayout {
    pub fn under(scratch: &Path, spec: &RuntimeSpec) -> Self {
        let root = scratch.join(spec.dir_name());
        Self {
            node_bin: root.join("bin/node"),
            npm_cli: root.join("lib/node_modules/npm/bin/npm-cli.js"),
            root,
        }
    }
}

trait MkdirAll {
    fn mkdir_all(&self) -> Result<()>;
}

impl MkdirAll for Path {
    fn mkdir_all(&self) -> Result<()> {
        std::fs::create_dir_all(self).with_context(|| format!("create_dir_all {}", self.display()))
    }
}

/// Idempotent: if the unpacked runtime is already at its expected place the
/// network and the archive are never touched.
pub fn ensure_runtime(
    scratch: &Path,
    spec: &RuntimeSpec,
    reporter: &Reporter,
) -> Result<RuntimeLayout> {
    let layout = RuntimeLayout::under(scratch, spec);
    if layout.node_bin.is_file() {
        reporter.progress("runtime already present");
        return Ok(layout);
    }

    scratch.mkdir_all()?;
    let url = spec.archive_url();
    let archive_path = scratch.join(spec.archive_name());
    reporter.progress(&format!("download runtime: {url}"));
    download(&url, &archive_path, spec.sha256.as_deref())?;

    let staging = scratch.join(format!(".tmp_{}_{}", spec.dir_name(), std::process::id()));
    if staging.exists() {
        std::fs::remove_dir_all(&staging).ok();
    }
    staging.mkdir_all()?;
    reporter.progress("extract runtime");
    extract_archive(&archive_path, &spec.format, &staging)?;

    // Runtime archives unpack to a single node-<version>-<target>/ top level.
    let unpacked = staging.join(spec.dir_name());
    let src = if unpacked.is_dir() {
        unpacked
    } else {
        staging.clone()
    };
    reporter.progress("finalize runtime install");
    std::fs::rename(&src, &layout.root)
        .with_context(|| format!("rename {} -> {}", src.display(), layout.root.display()))?;
    if staging.exists() {
        std::fs::remove_dir_all(&staging).ok();
    }

    if !layout.node_bin.is_file() {
        bail!(
            "runtime archive did not contain {}",
            layout.node_bin.display()
        );
    }
    Ok(layout)
}

pub fn download(url: &str, dest: &Path, expected_sha256: Option<&str>) -> Result<()> {
    let resp = ureq::get(url).call().with_context(|| format!("GET {url}"))?;
    let mut reader = resp.into_body().into_reader();

    let tmp = dest.with_extension("download.tmp");
    if let Some(parent) = tmp.parent() {
        parent.mkdir_all()?;
    }
    let mut f = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).context("read download stream")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        f.write_all(&buf[..n]).context("write download")?;
    }
    f.flush().ok();
    drop(f);

    if let Some(expected) = expected_sha256 {
        let actual = hex_lower(&hasher.finalize());
        if !actual.trim().eq_ignore_ascii_case(expected.trim()) {
            let _ = std::fs::remove_file(&tmp);
            bail!("sha256 mismatch for {url}: expected {expected}, got {actual}");
        }
    }

    std::fs::rename(&tmp, dest)
        .with_context(|| format!("rename {} -> {}", tmp.display(), dest.display()))?;
    Ok(())
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

pub fn extract_archive(path: &Path, format: &str, out_dir: &Path) -> Result<()> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    match format {
        "tar.gz" => extract_tar(GzDecoder::new(f), out_dir),
        "tar.xz" => extract_tar(XzDecoder::new(f), out_dir),
        other => bail!("unsupported archive format: {other}"),
    }
}

fn extract_tar<R: std::io::Read>(reader: R, out_dir: &Path) -> Result<()> {
    let mut ar = tar::Archive::new(reader);
    for entry in ar.entries().context("read tar entries")? {
        let mut entry = entry?;
        let entry_path = entry.path()?.to_path_buf();
        let rel = sanitize_rel_path(&entry_path)?;
        let out_path = out_dir.join(rel);
        if let Some(parent) = out_path.parent() {
            parent.mkdir_all()?;
        }
        entry
            .unpack(&out_path)
            .with_context(|| format!("unpack {}", out_path.display()))?;
    }
    Ok(())
}

fn sanitize_rel_path(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Prefix(_) | Component::RootDir => {
                bail!("invalid archive path (absolute): {}", path.display())
            }
            Component::ParentDir => bail!("invalid archive path (..): {}", path.display()),
            Component::CurDir => {}
            Component::Normal(p) => out.push(p),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_for(version: &str, base_url: &str) -> RuntimeSpec {
        RuntimeSpec::pinned(version, base_url, "tar.gz", None).expect("spec")
    }

    #[test]
    fn archive_naming_follows_the_pin() {
        let spec = spec_for("v20.11.0", "https://nodejs.org/dist/");
        let target = detect_target().expect("target");
        assert_eq!(spec.dir_name(), format!("node-v20.11.0-{target}"));
        assert_eq!(
            spec.archive_url(),
            format!("https://nodejs.org/dist/v20.11.0/node-v20.11.0-{target}.tar.gz")
        );
    }

    #[test]
    fn rejects_bad_versions_and_formats() {
        assert!(RuntimeSpec::pinned("", "https://example.com", "tar.gz", None).is_err());
        assert!(RuntimeSpec::pinned("v1/../..", "https://example.com", "tar.gz", None).is_err());
        assert!(RuntimeSpec::pinned("v1.0.0", "https://example.com", "zip", None).is_err());
    }

    #[test]
    fn sanitize_rejects_escaping_paths() {
        assert!(sanitize_rel_path(Path::new("/etc/passwd")).is_err());
        assert!(sanitize_rel_path(Path::new("a/../../b")).is_err());
        assert_eq!(
            sanitize_rel_path(Path::new("./a/b")).expect("rel"),
            PathBuf::from("a/b")
        );
    }

    #[test]
    fn present_runtime_skips_the_network() {
        let scratch = std::env::temp_dir().join(format!("noxbuild_present_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&scratch);
        // Unroutable base URL: any network attempt would fail the test.
        let spec = spec_for("v99.0.1", "http://127.0.0.1:9");
        let layout = RuntimeLayout::under(&scratch, &spec);
        std::fs::create_dir_all(layout.node_bin.parent().unwrap()).expect("mkdir");
        std::fs::write(&layout.node_bin, b"fake").expect("seed node");

        let reporter = Reporter {
            json: false,
            quiet: true,
        };
        let found = ensure_runtime(&scratch, &spec, &reporter).expect("ensure");
        assert_eq!(found.node_bin, layout.node_bin);

        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[test]
    fn hex_digest_is_lowercase_pairs() {
        assert_eq!(hex_lower(&[0x00, 0xff, 0x0a]), "00ff0a");
    }
}
