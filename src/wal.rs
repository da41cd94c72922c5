//! The WAL engine.
//!
//! A WAL is either in read mode or append mode but not both. A newly created
//! WAL is in append mode and ready for appending records. A just-opened WAL
//! is in read mode, and becomes appendable once `read_all` has drained the
//! previous records.

use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::codec::{Decoder, Encoder};
use crate::options::{Options, WARN_SYNC_DURATION};
use crate::pipeline::FilePipeline;
use crate::record::{self, Entry, HardState, Record, RecordType, Snapshot};
use crate::util::fileutil::{self, LockedFile};
use crate::util::filename::{is_valid_seq, parse_wal_name, search_index, wal_name, wal_names};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Append,
}

struct WalInner {
    dir: PathBuf,
    /// Directory handle for fsyncing renames; absent for read-only openers.
    dir_file: Option<File>,
    opts: Options,

    /// Metadata recorded at the head of segment 0.
    metadata: Bytes,
    /// Snapshot the WAL was opened against; the replay anchor.
    start: Snapshot,
    /// Authoritative hard state, per the last STATE record seen or saved.
    state: HardState,
    /// Most recent snapshot pointer written or replayed.
    last_snap: Snapshot,
    /// Whether a snapshot has been saved; a cut after one re-publishes it.
    snap_saved: bool,
    /// Index of the last entry saved to the WAL.
    enti: u64,

    mode: Mode,
    enc: Option<Encoder>,
    dec: Option<Decoder>,
    /// Locked segment files, oldest first; the newest is the tail.
    locks: Vec<LockedFile>,
    pipeline: Option<FilePipeline>,

    closed: bool,
    pipeline_err: Option<Error>,
}

/// A durable, append-only log of entries, snapshots, and hard state.
pub struct Wal {
    inner: Mutex<WalInner>,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal").finish_non_exhaustive()
    }
}

impl Wal {
    /// Create a WAL at `dir` with default options.
    ///
    /// Fails with [`Error::Exist`] if `dir` already contains anything.
    pub fn create(dir: impl AsRef<Path>, metadata: impl Into<Bytes>) -> Result<Wal> {
        Self::create_with(dir, metadata, Options::default())
    }

    /// Create a WAL at `dir`.
    ///
    /// The directory is built in a temporary sibling and renamed into place
    /// so a crash mid-creation never leaves a partial WAL under `dir`; a
    /// failed creation quarantines whatever was half-built.
    pub fn create_with(
        dir: impl AsRef<Path>,
        metadata: impl Into<Bytes>,
        opts: Options,
    ) -> Result<Wal> {
        opts.validate()?;
        let dir = dir.as_ref();
        if fileutil::exist(dir) {
            return Err(Error::Exist);
        }

        let tmpdir = sibling_with_suffix(dir, ".tmp");
        if tmpdir.exists() {
            fs::remove_dir_all(&tmpdir)?;
        }
        fileutil::create_dir_all(&tmpdir)?;

        match Self::init_dir(&tmpdir, dir, metadata.into(), opts) {
            Ok(wal) => Ok(wal),
            Err(err) => {
                if tmpdir.exists() {
                    let broken = fileutil::broken_dir_name(dir);
                    if let Err(rename_err) = fs::rename(&tmpdir, &broken) {
                        warn!(%rename_err, "failed to quarantine half-built wal directory");
                    } else {
                        info!(quarantine = %broken.display(), "wal creation failed");
                    }
                }
                Err(err)
            }
        }
    }

    fn init_dir(tmpdir: &Path, dir: &Path, metadata: Bytes, opts: Options) -> Result<Wal> {
        let tail = fileutil::try_lock_file(&tmpdir.join(wal_name(0, 0)))?;
        fileutil::preallocate(tail.file(), opts.segment_size, true)?;

        let enc = Encoder::new(tail.try_clone_file()?, 0);
        let mut inner = WalInner {
            dir: dir.to_path_buf(),
            dir_file: None,
            opts,
            metadata: metadata.clone(),
            start: Snapshot::default(),
            state: HardState::default(),
            last_snap: Snapshot::default(),
            snap_saved: false,
            enti: 0,
            mode: Mode::Append,
            enc: Some(enc),
            dec: None,
            locks: vec![tail],
            pipeline: None,
            closed: false,
            pipeline_err: None,
        };

        inner.save_crc(0)?;
        let mut md_rec = Record::new(RecordType::Metadata, metadata);
        inner.encoder()?.encode(&mut md_rec)?;
        inner.write_snapshot(Snapshot::default())?;

        fs::rename(tmpdir, dir)?;
        inner.dir_file = Some(fileutil::open_dir(dir)?);
        fileutil::fsync_dir(nonempty_parent(dir))?;

        inner.pipeline = Some(FilePipeline::new(
            inner.dir.clone(),
            inner.opts.segment_size,
        ));
        Ok(Wal {
            inner: Mutex::new(inner),
        })
    }

    /// Open the WAL at `dir` for appending, positioned to replay from `snap`.
    ///
    /// Blocks until the tail lock is available. The WAL starts in read mode;
    /// call [`Wal::read_all`] to drain the log and enable appending.
    pub fn open(dir: impl AsRef<Path>, snap: Snapshot) -> Result<Wal> {
        Self::open_with(dir, snap, Options::default())
    }

    /// Open for appending with explicit options.
    pub fn open_with(dir: impl AsRef<Path>, snap: Snapshot, opts: Options) -> Result<Wal> {
        Self::open_at(dir.as_ref(), snap, true, opts)
    }

    /// Open the WAL read-only; may coexist with a live writer.
    pub fn open_for_read(dir: impl AsRef<Path>, snap: Snapshot) -> Result<Wal> {
        Self::open_at(dir.as_ref(), snap, false, Options::default())
    }

    fn open_at(dir: &Path, snap: Snapshot, write: bool, opts: Options) -> Result<Wal> {
        opts.validate()?;
        let names = wal_names(dir)?;
        let name_index = search_index(&names, snap.index)?.ok_or(Error::FileNotFound)?;
        let names = &names[name_index..];
        if !is_valid_seq(names)? {
            return Err(Error::FileNotFound);
        }

        let mut locks = Vec::new();
        let mut read_files = Vec::new();
        if write {
            // exclusive claim on the tail, read claims on everything older
            for (i, name) in names.iter().enumerate() {
                let path = dir.join(name);
                let lf = if i + 1 == names.len() {
                    fileutil::lock_file(&path)?
                } else {
                    fileutil::lock_file_shared(&path)?
                };
                read_files.push(lf.try_clone_file()?);
                locks.push(lf);
            }
            if let Some(tail) = locks.last() {
                parse_wal_name(tail.name())?;
            }
        } else {
            for name in names {
                read_files.push(File::open(dir.join(name))?);
            }
        }

        let dec = Decoder::new(read_files)?;
        let dir_file = if write {
            Some(fileutil::open_dir(dir)?)
        } else {
            None
        };

        Ok(Wal {
            inner: Mutex::new(WalInner {
                dir: dir.to_path_buf(),
                dir_file,
                opts,
                metadata: Bytes::new(),
                start: snap,
                state: HardState::default(),
                last_snap: snap,
                snap_saved: false,
                enti: 0,
                mode: Mode::Read,
                enc: None,
                dec: Some(dec),
                locks,
                pipeline: None,
                closed: false,
                pipeline_err: None,
            }),
        })
    }

    /// Replay every record from the anchor onward.
    ///
    /// Returns the WAL metadata, the index of the last entry seen, and the
    /// entries past the anchor. In append-mode opens a torn tail is truncated
    /// back to its last good frame and the WAL flips to append mode.
    pub fn read_all(&self) -> Result<(Bytes, u64, Vec<Entry>)> {
        self.inner.lock().read_all()
    }

    /// Append a batch of entries.
    ///
    /// Either the whole batch is durable after a successful return, or (after
    /// a crash) a proper prefix of it is; there are never gaps.
    pub fn save(&self, ents: &[Entry]) -> Result<()> {
        self.inner.lock().save(ents)
    }

    /// Append a snapshot pointer record.
    pub fn save_snapshot(&self, snap: Snapshot) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_append()?;
        inner.write_snapshot(snap)?;
        inner.snap_saved = true;
        Ok(())
    }

    /// Append a hard-state record. Empty states are skipped.
    pub fn save_state(&self, st: &HardState) -> Result<()> {
        self.inner.lock().save_state(st)
    }

    /// Rotate to a freshly preallocated segment.
    pub fn cut(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_append()?;
        inner.cut()
    }

    /// Release the claims on every segment whose entries are all at or below
    /// `index`. The tail is never released.
    pub fn release_lock_to(&self, index: u64) -> Result<()> {
        self.inner.lock().release_lock_to(index)
    }

    /// Flush, fsync, stop the pipeline, and release every lock.
    ///
    /// A second call returns the pipeline's cached shutdown error, if any.
    pub fn close(&self) -> Result<()> {
        self.inner.lock().close()
    }

    /// Fatal-path quarantine: close the WAL and rename its directory to
    /// `<dir>.broken.<YYYYMMDD>.<HHMMSS>.<pid>`.
    pub fn cleanup(&self) -> Result<PathBuf> {
        let mut inner = self.inner.lock();
        inner.close()?;
        Ok(fileutil::move_aside_broken(&inner.dir)?)
    }

    /// Name of the current tail segment, if any segment is locked.
    pub fn tail_name(&self) -> Option<String> {
        let inner = self.inner.lock();
        inner.tail().map(|t| t.name().to_string())
    }

    /// Sequence number of the tail segment.
    pub fn seq(&self) -> u64 {
        let inner = self.inner.lock();
        inner.seq().unwrap_or(0)
    }

    /// Index of the last entry saved or replayed.
    pub fn last_index(&self) -> u64 {
        self.inner.lock().enti
    }

    /// The authoritative hard state after `read_all` or `save_state`.
    pub fn hard_state(&self) -> HardState {
        self.inner.lock().state
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        let _ = self.inner.get_mut().close();
    }
}

/// Open `dir` read-only, replay it fully, and report the first structural
/// error found.
pub fn verify(dir: impl AsRef<Path>, snap: Snapshot) -> Result<()> {
    let wal = Wal::open_for_read(dir, snap)?;
    wal.read_all()?;
    Ok(())
}

impl WalInner {
    fn tail(&self) -> Option<&LockedFile> {
        self.locks.last()
    }

    fn seq(&self) -> Result<u64> {
        match self.tail() {
            Some(tail) => Ok(parse_wal_name(tail.name())?.0),
            None => Ok(0),
        }
    }

    fn ensure_append(&self) -> Result<()> {
        if self.mode != Mode::Append || self.closed {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn encoder(&mut self) -> Result<&mut Encoder> {
        self.enc.as_mut().ok_or(Error::ReadOnly)
    }

    fn tail_file_dup(&self) -> Result<File> {
        let tail = self.tail().ok_or(Error::ReadOnly)?;
        Ok(tail.try_clone_file()?)
    }

    fn tail_offset(&mut self) -> Result<u64> {
        let tail = self.locks.last_mut().ok_or(Error::ReadOnly)?;
        Ok(tail.file_mut().seek(SeekFrom::Current(0))?)
    }

    fn save_crc(&mut self, prev_crc: u32) -> Result<()> {
        let mut rec = Record::new(RecordType::Crc, Bytes::new());
        rec.crc = prev_crc;
        self.encoder()?.encode(&mut rec)
    }

    fn save_entry(&mut self, ent: &Entry) -> Result<()> {
        let data = record::marshal(ent)?;
        let mut rec = Record::new(RecordType::Entry, data);
        self.encoder()?.encode(&mut rec)?;
        self.enti = ent.index;
        Ok(())
    }

    fn write_snapshot(&mut self, snap: Snapshot) -> Result<()> {
        let data = record::marshal(&snap)?;
        let mut rec = Record::new(RecordType::Snapshot, data);
        self.encoder()?.encode(&mut rec)?;
        if self.enti < snap.index {
            self.enti = snap.index;
        }
        self.last_snap = snap;
        self.sync()
    }

    fn encode_state(&mut self, st: &HardState) -> Result<()> {
        let data = record::marshal(st)?;
        let mut rec = Record::new(RecordType::State, data);
        self.encoder()?.encode(&mut rec)?;
        self.state = *st;
        Ok(())
    }

    fn save(&mut self, ents: &[Entry]) -> Result<()> {
        self.ensure_append()?;
        if ents.is_empty() {
            return Ok(());
        }
        for ent in ents {
            self.save_entry(ent)?;
        }

        self.encoder()?.flush()?;
        let cur_off = self.tail_offset()?;
        if cur_off < self.opts.segment_size {
            return self.sync();
        }
        self.cut()
    }

    fn save_state(&mut self, st: &HardState) -> Result<()> {
        self.ensure_append()?;
        if st.is_empty() {
            return Ok(());
        }
        let sync_needed = record::must_sync(st, &self.state, 0);
        self.encode_state(st)?;
        if sync_needed {
            return self.sync();
        }
        self.encoder()?.flush()
    }

    /// Flush the encoder and fsync the tail, warning when the fsync is slow.
    fn sync(&mut self) -> Result<()> {
        if let Some(enc) = self.enc.as_mut() {
            enc.flush()?;
        }
        if self.opts.unsafe_no_sync {
            return Ok(());
        }
        if let Some(tail) = self.tail() {
            let begin = Instant::now();
            fileutil::fdatasync(tail.file())?;
            let took = begin.elapsed();
            if took > WARN_SYNC_DURATION {
                warn!(?took, "slow wal fsync");
            }
        }
        Ok(())
    }

    fn read_all(&mut self) -> Result<(Bytes, u64, Vec<Entry>)> {
        let mut dec = self.dec.take().ok_or(Error::DecoderNotFound)?;

        let mut metadata: Option<Bytes> = None;
        let mut ents: Vec<Entry> = Vec::new();
        let mut state = HardState::default();
        let mut found_snap = false;

        let term_err = loop {
            let rec = match dec.decode() {
                Ok(Some(rec)) => rec,
                Ok(None) => break None,
                Err(err) => break Some(err),
            };
            match rec.record_type() {
                Some(RecordType::Entry) => {
                    let entry: Entry = record::unmarshal(&rec.data)?;
                    if entry.index > self.start.index {
                        let expected = self.start.index + 1 + ents.len() as u64;
                        if entry.index != expected {
                            return Err(Error::SliceOutOfRange);
                        }
                        self.enti = entry.index;
                        ents.push(entry);
                    } else {
                        self.enti = entry.index.max(self.enti);
                    }
                }
                Some(RecordType::State) => {
                    state = record::unmarshal(&rec.data)?;
                }
                Some(RecordType::Metadata) => {
                    if let Some(prev) = &metadata {
                        if *prev != rec.data {
                            return Err(Error::MetadataConflict);
                        }
                    }
                    metadata = Some(rec.data);
                }
                Some(RecordType::Crc) => {
                    // chain validation happens inside the decoder
                }
                Some(RecordType::Snapshot) => {
                    let snap: Snapshot = record::unmarshal(&rec.data)?;
                    if snap.index == self.start.index {
                        if snap.term != self.start.term {
                            return Err(Error::SnapshotMismatch);
                        }
                        found_snap = true;
                    } else if snap.index < self.start.index && snap.term > self.start.term {
                        // a later-term snapshot below the anchor contradicts it
                        return Err(Error::SnapshotMismatch);
                    }
                    if snap.index >= self.last_snap.index {
                        self.last_snap = snap;
                        self.snap_saved = snap != Snapshot::default();
                    }
                }
                // a zero or unknown tag in a checksummed record is corruption
                Some(RecordType::Zero) | None => return Err(Error::SliceOutOfRange),
            }
        };

        match self.tail() {
            Some(_) => {
                // Opened for appending: the log must be drained completely,
                // repairing a torn final frame in place.
                match term_err {
                    None => {}
                    Some(Error::UnexpectedEof) if dec.in_last_segment() => {
                        let off = dec.last_valid_off();
                        if let Some(tail) = self.tail() {
                            tail.file().set_len(off)?;
                            if !self.opts.unsafe_no_sync {
                                fileutil::fdatasync(tail.file())?;
                            }
                        }
                        if let Some(dir_file) = &self.dir_file {
                            fileutil::fsync(dir_file)?;
                        }
                        info!(offset = off, "repaired torn wal tail");
                    }
                    Some(Error::UnexpectedEof) => return Err(Error::SliceOutOfRange),
                    Some(err) => return Err(err),
                }
            }
            None => {
                // Read-only: a partial final frame just means the writer was
                // mid-append; the intact prefix is the answer. A short frame
                // anywhere earlier is corruption.
                match term_err {
                    None => {}
                    Some(Error::UnexpectedEof) if dec.in_last_segment() => {}
                    Some(Error::UnexpectedEof) => return Err(Error::SliceOutOfRange),
                    Some(err) => return Err(err),
                }
            }
        }

        if !found_snap {
            return Err(Error::SnapshotNotFound);
        }

        let metadata = metadata.unwrap_or_default();
        self.metadata = metadata.clone();
        self.start = Snapshot::default();
        self.state = state;

        if self.tail().is_some() {
            // chain the encoder off the decoder and enable appending
            let off = dec.last_valid_off();
            let prev_crc = dec.last_crc();
            drop(dec);

            let tail = self.locks.last_mut().ok_or(Error::ReadOnly)?;
            tail.file_mut().seek(SeekFrom::Start(off))?;
            self.enc = Some(Encoder::new(self.tail_file_dup()?, prev_crc));
            self.pipeline = Some(FilePipeline::new(self.dir.clone(), self.opts.segment_size));
            self.mode = Mode::Append;
        }

        Ok((metadata, self.enti, ents))
    }

    /// Rotation: finalize the tail, seed the next preallocated file, rename
    /// it into place, and swap it in as the new tail.
    fn cut(&mut self) -> Result<()> {
        self.encoder()?.flush()?;
        let off = self.tail_offset()?;
        self.sync()?;

        // drop the preallocated remainder so readers see no stray zeros
        {
            let tail = self.tail().ok_or(Error::ReadOnly)?;
            tail.file().set_len(off)?;
            if !self.opts.unsafe_no_sync {
                fileutil::fdatasync(tail.file())?;
            }
        }

        let fpath = self.dir.join(wal_name(self.seq()? + 1, self.enti + 1));
        let tmp = self.pipeline.as_mut().ok_or(Error::ReadOnly)?.open()?;

        // seed the new segment, carrying the running crc over
        let prev_crc = self.encoder()?.crc();
        self.locks.push(tmp);
        self.enc = Some(Encoder::new(self.tail_file_dup()?, prev_crc));
        self.save_crc(prev_crc)?;
        if self.snap_saved {
            let snap = self.last_snap;
            let mut rec = Record::new(RecordType::Snapshot, record::marshal(&snap)?);
            self.encoder()?.encode(&mut rec)?;
        }
        if !self.state.is_empty() {
            let st = self.state;
            self.encode_state(&st)?;
        }
        self.sync()?;
        let seeded_off = self.tail_offset()?;

        // atomically move the temp file to its segment name
        let tmp_path = self.tail().ok_or(Error::ReadOnly)?.path().to_path_buf();
        fs::rename(&tmp_path, &fpath)?;
        if let Some(dir_file) = &self.dir_file {
            fileutil::fsync(dir_file)?;
        }

        // reopen under the final name so lock paths match the wal format;
        // the chain value now includes the seed records
        let chained_crc = self.encoder()?.crc();
        self.locks.pop();
        let mut new_tail = fileutil::lock_file(&fpath)?;
        new_tail.file_mut().seek(SeekFrom::Start(seeded_off))?;

        // the old tail keeps only a read claim from here on
        if let Some(old_tail) = self.locks.last() {
            old_tail.downgrade_to_shared()?;
        }
        self.locks.push(new_tail);
        self.enc = Some(Encoder::new(self.tail_file_dup()?, chained_crc));

        info!(segment = %fpath.display(), "cut wal segment");
        Ok(())
    }

    fn release_lock_to(&mut self, index: u64) -> Result<()> {
        if self.locks.is_empty() {
            return Ok(());
        }

        let mut smaller = self.locks.len() - 1;
        let mut found = false;
        for (i, lock) in self.locks.iter().enumerate() {
            let (_, lock_index) = parse_wal_name(lock.name())?;
            if lock_index >= index {
                smaller = i.saturating_sub(1);
                found = true;
                break;
            }
        }
        // nothing starts past the release point: keep only the tail
        if !found {
            smaller = self.locks.len() - 1;
        }
        if smaller == 0 {
            return Ok(());
        }

        self.locks.drain(..smaller);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return match self.pipeline_err.clone() {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }
        self.closed = true;

        if let Some(pipeline) = self.pipeline.take() {
            if let Err(err) = pipeline.close() {
                self.pipeline_err = Some(err);
            }
        }
        if self.tail().is_some() && self.mode == Mode::Append {
            self.sync()?;
        }
        self.enc = None;
        self.dec = None;
        self.locks.clear();
        self.dir_file = None;
        Ok(())
    }
}

fn sibling_with_suffix(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn nonempty_parent(dir: &Path) -> &Path {
    match dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
