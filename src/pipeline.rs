//! Background segment preallocation.
//!
//! A single producer thread keeps one fully preallocated, locked temp file
//! ready at all times so a rotation costs only a rename. The handoff channel
//! is a rendezvous: the producer never runs ahead by more than the one file
//! it is offering.

use std::fs;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam::select;
use tracing::error;

use crate::util::fileutil::{self, LockedFile};
use crate::{Error, Result};

/// Hands out preallocated, exclusively locked segment files.
pub struct FilePipeline {
    file_rx: Receiver<LockedFile>,
    err_rx: Receiver<Error>,
    done_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

struct Producer {
    dir: PathBuf,
    size: u64,
    count: u64,
    file_tx: Sender<LockedFile>,
    err_tx: Sender<Error>,
    done_rx: Receiver<()>,
}

impl FilePipeline {
    /// Start the producer for `dir`, preallocating `size` bytes per file.
    pub fn new(dir: PathBuf, size: u64) -> Self {
        let (file_tx, file_rx) = bounded(0);
        let (err_tx, err_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(0);

        let producer = Producer {
            dir,
            size,
            count: 0,
            file_tx,
            err_tx,
            done_rx,
        };
        let handle = thread::Builder::new()
            .name("rustwal-pipeline".to_string())
            .spawn(move || producer.run())
            .expect("failed to spawn pipeline thread");

        Self {
            file_rx,
            err_rx,
            done_tx: Some(done_tx),
            handle: Some(handle),
        }
    }

    /// Take the next preallocated file.
    ///
    /// Rename the file before calling again or the names will collide.
    pub fn open(&mut self) -> Result<LockedFile> {
        select! {
            recv(self.file_rx) -> file => match file {
                Ok(file) => Ok(file),
                // producer exited; its reason is in the error mailbox
                Err(_) => Err(self.take_err()),
            },
            recv(self.err_rx) -> err => match err {
                Ok(err) => Err(err),
                Err(_) => Err(Error::FileNotFound),
            },
        }
    }

    fn take_err(&self) -> Error {
        self.err_rx.try_recv().unwrap_or(Error::FileNotFound)
    }

    /// Shut the producer down and surface any error it died with.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.done_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        match self.err_rx.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }
}

impl Drop for FilePipeline {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl Producer {
    fn run(mut self) {
        loop {
            let file = match self.alloc() {
                Ok(file) => file,
                Err(err) => {
                    error!(%err, size = self.size, "failed to preallocate next wal segment");
                    let _ = self.err_tx.send(err);
                    return;
                }
            };
            let path = file.path().to_path_buf();
            select! {
                send(self.file_tx, file) -> res => {
                    if res.is_err() {
                        // consumer went away without taking the file
                        let _ = fs::remove_file(&path);
                        return;
                    }
                }
                recv(self.done_rx) -> _ => {
                    // the unsent file (and its lock) is dropped by the select
                    let _ = fs::remove_file(&path);
                    return;
                }
            }
        }
    }

    fn alloc(&mut self) -> Result<LockedFile> {
        // alternate slots so the file just handed out is never reused in place
        let path = self.dir.join(format!("{}.tmp", self.count % 2));
        let file = fileutil::try_lock_file(&path)?;
        file.file().set_len(0)?;
        fileutil::preallocate(file.file(), self.size, true)?;
        self.count += 1;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pipeline_hands_out_alternating_slots() {
        let dir = tempdir().unwrap();
        let mut fp = FilePipeline::new(dir.path().to_path_buf(), 4096);

        let first = fp.open().unwrap();
        assert_eq!(first.name(), "0.tmp");
        assert_eq!(first.file().metadata().unwrap().len(), 4096);
        // rename it away, as a cut would
        fs::rename(first.path(), dir.path().join("renamed")).unwrap();
        drop(first);

        let second = fp.open().unwrap();
        assert_eq!(second.name(), "1.tmp");
        drop(second);

        fp.close().unwrap();
    }

    #[test]
    fn test_close_removes_pending_file() {
        let dir = tempdir().unwrap();
        let fp = FilePipeline::new(dir.path().to_path_buf(), 4096);
        fp.close().unwrap();

        let leftover = fileutil::read_dir(dir.path()).unwrap();
        assert!(leftover.is_empty(), "leftover files: {:?}", leftover);
    }

    #[test]
    fn test_alloc_failure_surfaces_on_open() {
        let dir = tempdir().unwrap();
        // a preallocation far past any quota fails fast
        let mut fp = FilePipeline::new(dir.path().to_path_buf(), u64::MAX >> 1);
        let err = fp.open().unwrap_err();
        assert!(err.io_kind().is_some(), "got {:?}", err);
        // the one-shot error was already drained by open
        assert!(fp.close().is_ok());
    }
}
