//! File-mapped piece store.
//!
//! Maps the torrent's logical byte stream onto its file list and persists
//! verified pieces with positional I/O. One read-write lock guards the
//! handle table: readers run concurrently, writers exclude. Every write is
//! flushed per touched file before the piece may be marked Downloaded.

use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt},
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use sha1::{Digest, Sha1};
use tokio::task;
use tracing::{debug, info};

use crate::{
    bitfield::Bitfield,
    error::Error,
    metainfo::MetaInfo,
    piece_table::{PieceState, PieceTable},
};

/// Lifecycle of the on-disk side of a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    PreparingFiles,
    CheckingHashes,
    Downloading,
    Ready,
}

/// What the UI reads: where the store is in its lifecycle and which pieces
/// it holds.
#[derive(Debug, Clone)]
pub struct Status {
    pub state: StoreState,
    pub progress: Bitfield,
}

#[derive(Debug)]
struct StoreFile {
    path: PathBuf,
    length: u64,
    handle: Option<File>,
}

impl StoreFile {
    fn handle(&self) -> Result<&File, Error> {
        self.handle.as_ref().ok_or_else(|| Error::FileIo {
            path: self.path.clone(),
            source: io::Error::new(
                io::ErrorKind::NotConnected,
                "file is not open",
            ),
        })
    }
}

/// The files of one torrent, seen as a single `total_length`-byte space.
#[derive(Debug)]
pub struct PieceStore {
    files: RwLock<Vec<StoreFile>>,
    status: RwLock<Status>,
    piece_length: u64,
    total_length: u64,
    piece_hashes: Vec<[u8; 20]>,
}

impl PieceStore {
    /// Lay out the target paths without touching the filesystem yet. For a
    /// single-file torrent the output is `<download_dir>/<name>`, for a
    /// multi-file torrent `<download_dir>/<name>/<path segments>`.
    pub fn new(meta: &MetaInfo, download_dir: &Path) -> Self {
        let base = download_dir.join(&meta.info.name);

        let files = meta
            .info
            .output_files()
            .into_iter()
            .map(|file| {
                let mut path = base.clone();
                for segment in &file.path {
                    path.push(segment);
                }
                StoreFile { path, length: file.length, handle: None }
            })
            .collect();

        Self {
            files: RwLock::new(files),
            status: RwLock::new(Status {
                state: StoreState::PreparingFiles,
                progress: Bitfield::new(meta.info.piece_count()),
            }),
            piece_length: meta.info.piece_length,
            total_length: meta.info.total_length(),
            piece_hashes: meta.info.piece_hashes(),
        }
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size in bytes of the given piece.
    pub fn piece_size(&self, piece: usize) -> u64 {
        self.piece_length
            .min(self.total_length - piece as u64 * self.piece_length)
    }

    pub fn status(&self) -> Status {
        self.status.read().unwrap().clone()
    }

    /// Open or create every file and, if anything was already on disk,
    /// scan every piece and mark the valid ones Downloaded in `table`.
    /// Blocking work runs on the blocking pool.
    pub async fn prepare(
        self: Arc<Self>,
        table: Arc<PieceTable>,
    ) -> Result<(), Error> {
        task::spawn_blocking(move || self.prepare_blocking(&table))
            .await
            .map_err(|e| Error::TaskFailed(e.to_string()))?
    }

    fn prepare_blocking(&self, table: &PieceTable) -> Result<(), Error> {
        let mut any_opened = false;

        {
            let mut files = self.files.write().unwrap();
            for file in files.iter_mut() {
                let (handle, existed) = create_or_open(&file.path, file.length)?;
                file.handle = Some(handle);
                any_opened |= existed;
            }
        }

        if any_opened {
            self.set_state(StoreState::CheckingHashes);
            self.scan_pieces(table)?;
            info!(
                "hash scan recovered {} of {} pieces",
                table.bitfield().count(),
                self.piece_count(),
            );
        }

        let mut status = self.status.write().unwrap();
        status.progress = table.bitfield();
        status.state = if status.progress.is_full() {
            StoreState::Ready
        } else {
            StoreState::Downloading
        };

        Ok(())
    }

    /// Read every piece back, hash it, and flip the matching ones
    /// NotDownloaded -> Downloaded. Scan progress is visible through the
    /// status bitfield while this runs.
    fn scan_pieces(&self, table: &PieceTable) -> Result<(), Error> {
        for piece in 0..self.piece_count() {
            let data = self.read_piece_blocking(piece)?;
            let digest: [u8; 20] = Sha1::digest(&data).into();

            if digest == self.piece_hashes[piece] {
                table.cas(
                    piece,
                    PieceState::NotDownloaded,
                    PieceState::Downloaded,
                );
            }

            self.status.write().unwrap().progress.add(piece).ok();
        }

        Ok(())
    }

    pub async fn read_piece(
        self: Arc<Self>,
        piece: usize,
    ) -> Result<Vec<u8>, Error> {
        task::spawn_blocking(move || self.read_piece_blocking(piece))
            .await
            .map_err(|e| Error::TaskFailed(e.to_string()))?
    }

    pub fn read_piece_blocking(&self, piece: usize) -> Result<Vec<u8>, Error> {
        if piece >= self.piece_count() {
            return Err(Error::PieceOutOfRange {
                piece,
                count: self.piece_count(),
            });
        }

        let offset = piece as u64 * self.piece_length;
        let mut data = vec![0u8; self.piece_size(piece) as usize];

        let files = self.files.read().unwrap();
        let mut cursor = offset;
        let mut filled = 0;
        let mut file_start = 0u64;

        for file in files.iter() {
            let file_end = file_start + file.length;
            if cursor < file_end && filled < data.len() {
                let chunk =
                    ((file_end - cursor) as usize).min(data.len() - filled);
                file.handle()?
                    .read_exact_at(
                        &mut data[filled..filled + chunk],
                        cursor - file_start,
                    )
                    .map_err(|source| Error::FileIo {
                        path: file.path.clone(),
                        source,
                    })?;
                filled += chunk;
                cursor += chunk as u64;
            }

            file_start = file_end;
            if filled == data.len() {
                break;
            }
        }

        debug_assert_eq!(filled, data.len());
        Ok(data)
    }

    pub async fn write_piece(
        self: Arc<Self>,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        task::spawn_blocking(move || self.write_piece_blocking(offset, &data))
            .await
            .map_err(|e| Error::TaskFailed(e.to_string()))?
    }

    /// Write a whole verified piece at its global offset, splitting across
    /// file boundaries and flushing every touched file before returning.
    pub fn write_piece_blocking(
        &self,
        offset: u64,
        data: &[u8],
    ) -> Result<(), Error> {
        {
            let files = self.files.write().unwrap();
            let mut cursor = offset;
            let mut written = 0;
            let mut file_start = 0u64;

            for file in files.iter() {
                let file_end = file_start + file.length;
                if cursor < file_end && written < data.len() {
                    let chunk = ((file_end - cursor) as usize)
                        .min(data.len() - written);
                    let handle = file.handle()?;

                    handle
                        .write_all_at(
                            &data[written..written + chunk],
                            cursor - file_start,
                        )
                        .and_then(|_| handle.sync_all())
                        .map_err(|source| Error::FileIo {
                            path: file.path.clone(),
                            source,
                        })?;

                    written += chunk;
                    cursor += chunk as u64;
                }

                file_start = file_end;
                if written == data.len() {
                    break;
                }
            }
        }

        let piece = (offset / self.piece_length) as usize;
        debug!("persisted piece {piece}");

        let mut status = self.status.write().unwrap();
        status.progress.add(piece).ok();
        if status.progress.is_full() {
            status.state = StoreState::Ready;
        }

        Ok(())
    }

    /// Close every file handle. Safe to call more than once.
    pub fn finalize(&self) {
        for file in self.files.write().unwrap().iter_mut() {
            file.handle.take();
        }
    }

    fn set_state(&self, state: StoreState) {
        self.status.write().unwrap().state = state;
    }
}

/// Open `path` read-write when it already has the expected length,
/// otherwise (re)create it zero-extended to exactly `length` bytes.
/// Returns whether a pre-existing file was opened.
fn create_or_open(path: &Path, length: u64) -> Result<(File, bool), Error> {
    let file_io = |source| Error::FileIo { path: path.to_owned(), source };

    if let Ok(meta) = fs::metadata(path) {
        if meta.is_file() && meta.len() == length {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(file_io)?;
            return Ok((file, true));
        }
    }

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o770)
                .create(dir)
                .map_err(file_io)?;
        }
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)
        .map_err(file_io)?;
    file.set_len(length).map_err(file_io)?;

    Ok((file, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{File as MetaFile, Info};

    fn hashes_for(content: &[u8], piece_length: usize) -> Vec<u8> {
        content
            .chunks(piece_length)
            .flat_map(|chunk| Sha1::digest(chunk).to_vec())
            .collect()
    }

    fn multi_file_meta(content: &[u8]) -> MetaInfo {
        MetaInfo {
            announce: "udp://t:1".into(),
            announce_list: None,
            info: Info {
                name: "multi".into(),
                piece_length: 4,
                pieces: hashes_for(content, 4),
                file_length: None,
                files: Some(vec![
                    MetaFile { length: 3, path: vec!["a.bin".into()] },
                    MetaFile { length: 5, path: vec!["b.bin".into()] },
                ]),
                info_hash: Default::default(),
            },
        }
    }

    fn single_file_meta(content: &[u8]) -> MetaInfo {
        MetaInfo {
            announce: "udp://t:1".into(),
            announce_list: None,
            info: Info {
                name: "single.bin".into(),
                piece_length: 4,
                pieces: hashes_for(content, 4),
                file_length: Some(content.len() as u64),
                files: None,
                info_hash: Default::default(),
            },
        }
    }

    #[test]
    fn prepare_creates_files_of_exact_length() {
        let dir = tempfile::tempdir().unwrap();
        let meta = multi_file_meta(b"ABCABCDE");
        let store = PieceStore::new(&meta, dir.path());
        let table = PieceTable::new(meta.info.piece_count());

        store.prepare_blocking(&table).unwrap();

        let a = dir.path().join("multi/a.bin");
        let b = dir.path().join("multi/b.bin");
        assert_eq!(fs::metadata(&a).unwrap().len(), 3);
        assert_eq!(fs::metadata(&b).unwrap().len(), 5);

        let status = store.status();
        assert_eq!(status.state, StoreState::Downloading);
        assert!(status.progress.is_empty());
        assert!(table.bitfield().is_empty());
    }

    #[test]
    fn write_and_read_across_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"ABCABCDE";
        let meta = multi_file_meta(content);
        let store = PieceStore::new(&meta, dir.path());
        let table = PieceTable::new(meta.info.piece_count());

        store.prepare_blocking(&table).unwrap();
        store.write_piece_blocking(0, b"ABCA").unwrap();
        store.write_piece_blocking(4, b"BCDE").unwrap();

        assert_eq!(store.read_piece_blocking(0).unwrap(), b"ABCA");
        assert_eq!(store.read_piece_blocking(1).unwrap(), b"BCDE");

        let status = store.status();
        assert_eq!(status.state, StoreState::Ready);
        assert!(status.progress.is_full());

        store.finalize();
        assert_eq!(fs::read(dir.path().join("multi/a.bin")).unwrap(), b"ABC");
        assert_eq!(fs::read(dir.path().join("multi/b.bin")).unwrap(), b"ABCDE");
    }

    #[test]
    fn read_of_an_out_of_range_piece_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let meta = single_file_meta(b"ABCDEFGHIJ");
        let store = PieceStore::new(&meta, dir.path());
        let table = PieceTable::new(meta.info.piece_count());

        store.prepare_blocking(&table).unwrap();

        assert!(matches!(
            store.read_piece_blocking(3),
            Err(Error::PieceOutOfRange { piece: 3, count: 3 })
        ));
    }

    #[test]
    fn startup_scan_recovers_complete_files() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"ABCDEFGHIJ";
        let meta = single_file_meta(content);

        fs::write(dir.path().join("single.bin"), content).unwrap();

        let store = PieceStore::new(&meta, dir.path());
        let table = PieceTable::new(meta.info.piece_count());
        store.prepare_blocking(&table).unwrap();

        assert_eq!(store.status().state, StoreState::Ready);
        assert!(table.bitfield().is_full());
    }

    #[test]
    fn startup_scan_keeps_only_valid_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let meta = single_file_meta(b"ABCDEFGHIJ");

        // piece 0 is intact, pieces 1 and 2 are not
        fs::write(dir.path().join("single.bin"), b"ABCDxxxxxx").unwrap();

        let store = PieceStore::new(&meta, dir.path());
        let table = PieceTable::new(meta.info.piece_count());
        store.prepare_blocking(&table).unwrap();

        let status = store.status();
        assert_eq!(status.state, StoreState::Downloading);
        assert_eq!(status.progress.count(), 1);
        assert!(status.progress.contains(0));
        assert_eq!(table.get(0), PieceState::Downloaded);
        assert_eq!(table.get(1), PieceState::NotDownloaded);
    }

    #[test]
    fn wrong_length_file_is_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let meta = single_file_meta(b"ABCDEFGHIJ");

        fs::write(dir.path().join("single.bin"), b"way too long content").unwrap();

        let store = PieceStore::new(&meta, dir.path());
        let table = PieceTable::new(meta.info.piece_count());
        store.prepare_blocking(&table).unwrap();

        // the truncated file holds no valid piece, so no scan result
        assert_eq!(
            fs::metadata(dir.path().join("single.bin")).unwrap().len(),
            10
        );
        assert_eq!(store.status().state, StoreState::Downloading);
        assert!(table.bitfield().is_empty());
    }
}
