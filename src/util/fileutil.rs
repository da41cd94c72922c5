//! Low-level file primitives: advisory locks, preallocation, durability
//! barriers, and the broken-directory quarantine.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::options::{PRIVATE_DIR_MODE, PRIVATE_FILE_MODE};
use crate::{Error, Result};

/// Zero-fill chunk used when the preallocation syscall is unavailable.
const FALLBACK_FILL_CHUNK: usize = 4 * 1024;

/// A file held under an advisory `flock`.
///
/// The lock lives as long as the handle; dropping the `LockedFile` releases
/// it. Each locked segment has exactly one owner.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
}

impl LockedFile {
    /// File name component of the locked path.
    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Full path of the locked file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Borrow the underlying file.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Mutably borrow the underlying file.
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Duplicate the handle (shared offset and open file description).
    ///
    /// The duplicate does not carry lock ownership; the lock is released when
    /// the original is dropped.
    pub fn try_clone_file(&self) -> io::Result<File> {
        self.file.try_clone()
    }

    /// Downgrade the exclusive lock to a shared one.
    pub fn downgrade_to_shared(&self) -> io::Result<()> {
        flock(&self.file, libc::LOCK_SH)
    }
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn open_private(path: &Path, write: bool, create: bool) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(write)
        .create(create)
        .mode(PRIVATE_FILE_MODE)
        .open(path)
}

/// Open (creating if needed) and exclusively lock `path`, blocking until the
/// lock is available.
pub fn lock_file(path: &Path) -> Result<LockedFile> {
    let file = open_private(path, true, true)?;
    flock(&file, libc::LOCK_EX)?;
    Ok(LockedFile {
        file,
        path: path.to_path_buf(),
    })
}

/// Open (creating if needed) and exclusively lock `path` without blocking.
///
/// Returns [`Error::Locked`] immediately when the lock is contended.
pub fn try_lock_file(path: &Path) -> Result<LockedFile> {
    let file = open_private(path, true, true)?;
    match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
        Ok(()) => Ok(LockedFile {
            file,
            path: path.to_path_buf(),
        }),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Err(Error::Locked),
        Err(err) => Err(err.into()),
    }
}

/// Open an existing file read-only under a shared lock.
pub fn lock_file_shared(path: &Path) -> Result<LockedFile> {
    let file = open_private(path, false, false)?;
    flock(&file, libc::LOCK_SH)?;
    Ok(LockedFile {
        file,
        path: path.to_path_buf(),
    })
}

/// Ensure `file` has `size` bytes of allocated disk space.
///
/// Uses `fallocate` where the filesystem supports it; otherwise extends the
/// file with zero-filled chunks. `extend` controls whether the visible file
/// length grows to `size` or only the allocation does. `ENOSPC` is returned
/// verbatim.
pub fn preallocate(file: &File, size: u64, extend: bool) -> io::Result<()> {
    if size == 0 {
        return Ok(());
    }
    let mode = if extend { 0 } else { libc::FALLOC_FL_KEEP_SIZE };
    let rc = unsafe { libc::fallocate(file.as_raw_fd(), mode, 0, size as libc::off_t) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        // Filesystem without fallocate support.
        Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS) if extend => preallocate_fill(file, size),
        Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS) => Ok(()),
        _ => Err(err),
    }
}

fn preallocate_fill(file: &File, size: u64) -> io::Result<()> {
    let zeros = [0u8; FALLBACK_FILL_CHUNK];
    let mut off = file.metadata()?.len();
    while off < size {
        let n = (size - off).min(FALLBACK_FILL_CHUNK as u64) as usize;
        file.write_at(&zeros[..n], off)?;
        off += n as u64;
    }
    file.sync_all()
}

/// Durability barrier for file contents and metadata.
pub fn fsync(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Durability barrier for file contents only.
pub fn fdatasync(file: &File) -> io::Result<()> {
    file.sync_data()
}

/// Open a directory handle for fsyncing rename/create/unlink operations.
pub fn open_dir(path: &Path) -> io::Result<File> {
    File::open(path)
}

/// Fsync a directory by path.
pub fn fsync_dir(path: &Path) -> io::Result<()> {
    open_dir(path)?.sync_all()
}

/// Create `dir` and any missing parents with private permissions.
pub fn create_dir_all(dir: &Path) -> io::Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(PRIVATE_DIR_MODE)
        .create(dir)
}

/// List the entry names of `dir` in ascending name order.
pub fn read_dir(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Whether `dir` exists and contains at least one entry.
pub fn exist(dir: &Path) -> bool {
    matches!(read_dir(dir), Ok(names) if !names.is_empty())
}

/// The quarantine name for `dir`: `<dir>.broken.<YYYYMMDD>.<HHMMSS>.<pid>`.
pub fn broken_dir_name(dir: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d.%H%M%S");
    let mut name = dir.as_os_str().to_os_string();
    name.push(format!(".broken.{}.{}", stamp, std::process::id()));
    PathBuf::from(name)
}

/// Atomically rename `dir` aside to its quarantine name and fsync the parent.
pub fn move_aside_broken(dir: &Path) -> io::Result<PathBuf> {
    let broken = broken_dir_name(dir);
    fs::rename(dir, &broken)?;
    match broken.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fsync_dir(parent)?,
        _ => fsync_dir(Path::new("."))?,
    }
    info!(dir = %dir.display(), quarantine = %broken.display(), "moved wal directory aside");
    Ok(broken)
}
