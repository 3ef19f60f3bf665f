//! Anonymous-executable loader: place an executable image into a
//! memory-backed descriptor so it can be spawned on a `noexec` filesystem.

use std::ffi::CString;
use std::fs::File;
use std::io::{Seek as _, SeekFrom, Write as _};
use std::os::fd::{AsRawFd as _, FromRawFd as _};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

#[cfg(not(target_os = "linux"))]
compile_error!("noxbuild-loader requires memfd_create, which is Linux-only");

/// An executable image held in an anonymous, memory-backed region. The
/// region lives in this process's descriptor table only and vanishes once
/// the descriptor is closed and no child holds it open. Keep the `ExecImage`
/// alive across any spawn that uses [`ExecImage::exec_path`].
#[derive(Debug)]
pub struct ExecImage {
    file: File,
    len: usize,
}

impl ExecImage {
    pub fn load(bytes: &[u8], label: &str) -> Result<Self> {
        let name = CString::new(label).context("image label contains NUL")?;
        // No MFD_CLOEXEC: the spawned child must inherit the descriptor
        // across fork for the execution handle to resolve.
        let raw = unsafe { libc::memfd_create(name.as_ptr(), 0) };
        if raw < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOSYS) {
                bail!("memfd_create unavailable on this kernel; no other execution strategy exists: {err}");
            }
            return Err(err).context("memfd_create");
        }
        let mut file = unsafe { File::from_raw_fd(raw) };
        file.write_all(bytes)
            .context("write image into anonymous region")?;
        file.seek(SeekFrom::Start(0))
            .context("rewind anonymous region")?;
        Ok(Self {
            file,
            len: bytes.len(),
        })
    }

    /// Path that resolves to the region through this process's descriptor
    /// table; usable as an executable path by spawn, as often as needed,
    /// until `self` is dropped.
    pub fn exec_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "/proc/{}/fd/{}",
            std::process::id(),
            self.file.as_raw_fd()
        ))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
