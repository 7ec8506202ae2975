//! The file mapper: maps (piece index, offset, length) triples to byte
//! ranges across one or more files and performs the actual disk IO.
//!
//! Blocking file IO is always run via [`tokio::task::spawn_blocking`] so it
//! never stalls the reactor driving peer sockets. Each file gets its own
//! [`Mutex`], so writes to two different files (i.e. disjoint pieces, bar
//! the piece that straddles their boundary) proceed in parallel, while
//! writes that land in the same file are serialized through its mutex.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use sha1::{Digest, Sha1};
use tokio::task;

use crate::error::{Error, Result};
use crate::storage_info::StorageInfo;
use crate::{PieceIndex, Sha1Hash};

/// Owns the open file handles for a torrent's content and performs all
/// reads and writes against them.
pub(crate) struct Disk {
    info: StorageInfo,
    files: Vec<Mutex<File>>,
    /// The concatenation of all expected piece hashes, 20 bytes each.
    piece_hashes: Vec<u8>,
    /// Caches whole pieces in memory on first read so that a seeding peer
    /// requesting several blocks of the same piece doesn't reissue disk
    /// reads per block.
    read_cache: Mutex<HashMap<PieceIndex, Arc<Vec<u8>>>>,
}

impl Disk {
    /// Creates the torrent's file system structure (directories and files,
    /// extended to their declared lengths) and opens handles to every
    /// file, ready for reads and writes.
    pub async fn allocate(
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> Result<Arc<Self>> {
        task::spawn_blocking(move || Self::allocate_sync(info, piece_hashes))
            .await
            .expect("disk allocation task panicked")
            .map(Arc::new)
    }

    fn allocate_sync(info: StorageInfo, piece_hashes: Vec<u8>) -> Result<Self> {
        log::info!("Allocating torrent storage in {:?}", info.download_dir);
        fs::create_dir_all(&info.download_dir)?;

        let mut files = Vec::new();
        for file_info in info.files() {
            let path = info.download_dir.join(&file_info.path);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            // extend but never truncate: truncating could destroy bytes of
            // an already (partially) downloaded file
            if file.metadata()?.len() < file_info.len {
                log::debug!(
                    "Extending {:?} to {} bytes",
                    path,
                    file_info.len
                );
                file.set_len(file_info.len)?;
            }
            files.push(Mutex::new(file));
        }

        Ok(Self {
            info,
            files,
            piece_hashes,
            read_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn storage_info(&self) -> &StorageInfo {
        &self.info
    }

    /// The expected SHA-1 hash of piece `index`.
    pub(crate) fn expected_piece_hash(&self, index: PieceIndex) -> Sha1Hash {
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.piece_hashes[index * 20..index * 20 + 20]);
        hash
    }

    /// Writes a complete, verified piece to the files it overlaps with,
    /// flushing every touched file before returning.
    pub async fn write_piece(
        self: Arc<Self>,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<()> {
        task::spawn_blocking(move || self.write_piece_sync(index, &data))
            .await
            .expect("disk write task panicked")
    }

    fn write_piece_sync(&self, index: PieceIndex, data: &[u8]) -> Result<()> {
        let expected_len = self.info.piece_len(index)? as usize;
        if data.len() != expected_len {
            return Err(Error::ShortRead {
                expected: expected_len,
                got: data.len(),
            });
        }

        let torrent_offset = self.info.torrent_piece_offset(index);
        let file_range = self.info.files_intersecting_piece(index)?;
        let files_info = self.info.files();

        let mut pos = 0usize;
        let mut write_offset = torrent_offset;
        for file_index in file_range {
            let file_info = files_info[file_index];
            let slice =
                file_info.get_slice(write_offset, (data.len() - pos) as u64);
            let chunk = &data[pos..pos + slice.len as usize];

            let mut file = self.files[file_index]
                .lock()
                .expect("file mutex poisoned");
            file.seek(SeekFrom::Start(slice.offset))?;
            file.write_all(chunk)?;
            file.flush()?;

            pos += slice.len as usize;
            write_offset += slice.len;
        }
        debug_assert_eq!(pos, data.len());

        // a write changes the piece's content on disk, so any cached copy
        // (there shouldn't be one, but a retried piece could have left one
        // behind from a failed verification attempt) is now stale
        self.read_cache.lock().expect("cache mutex poisoned").remove(&index);

        log::debug!("Wrote piece {} ({} bytes) to disk", index, data.len());
        Ok(())
    }

    /// Reads `length` bytes starting at `offset` within piece `index`,
    /// possibly spanning multiple files. Fails with [`Error::ShortRead`] if
    /// fewer bytes are available than requested.
    pub async fn read_range(
        self: Arc<Self>,
        index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>> {
        task::spawn_blocking(move || self.read_range_sync(index, offset, length))
            .await
            .expect("disk read task panicked")
    }

    fn read_range_sync(
        &self,
        index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>> {
        let piece_len = self.info.piece_len(index)? as u64;
        if offset as u64 + length as u64 > piece_len {
            return Err(Error::ShortRead {
                expected: length as usize,
                got: 0,
            });
        }

        let torrent_offset =
            self.info.torrent_piece_offset(index) + offset as u64;
        let byte_range = torrent_offset..torrent_offset + length as u64;
        let file_range = self.info.files_intersecting_bytes(byte_range);
        let files_info = self.info.files();

        let mut buf = vec![0u8; length as usize];
        let mut pos = 0usize;
        let mut read_offset = torrent_offset;
        for file_index in file_range {
            let file_info = files_info[file_index];
            let slice = file_info
                .get_slice(read_offset, (length as usize - pos) as u64);

            let mut file = self.files[file_index]
                .lock()
                .expect("file mutex poisoned");
            file.seek(SeekFrom::Start(slice.offset))?;
            let chunk = &mut buf[pos..pos + slice.len as usize];
            file.read_exact(chunk).map_err(|_| Error::ShortRead {
                expected: length as usize,
                got: pos,
            })?;

            pos += slice.len as usize;
            read_offset += slice.len;
        }

        if pos != length as usize {
            return Err(Error::ShortRead {
                expected: length as usize,
                got: pos,
            });
        }
        Ok(buf)
    }

    /// Reads the whole of piece `index`, going through the read-through
    /// cache: the first read pulls the piece in from disk and caches it,
    /// subsequent reads of the same piece (e.g. by further seeding
    /// requests) are served from memory.
    pub async fn read_piece(
        self: Arc<Self>,
        index: PieceIndex,
    ) -> Result<Arc<Vec<u8>>> {
        if let Some(cached) =
            self.read_cache.lock().expect("cache mutex poisoned").get(&index)
        {
            return Ok(Arc::clone(cached));
        }

        let piece_len = self.info.piece_len(index)?;
        let bytes = Arc::clone(&self)
            .read_range(index, 0, piece_len)
            .await
            .map(Arc::new)?;
        self.read_cache
            .lock()
            .expect("cache mutex poisoned")
            .insert(index, Arc::clone(&bytes));
        Ok(bytes)
    }

    /// Reads a single block out of piece `index`, going through the same
    /// read-through cache as [`Disk::read_piece`]: seeding peers typically
    /// request several blocks of the same piece in quick succession, so the
    /// whole piece is cached on the first request and the rest are served
    /// from memory.
    pub async fn read_block(
        self: Arc<Self>,
        index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Result<Vec<u8>> {
        let piece = self.read_piece(index).await?;
        let start = offset as usize;
        let end = start + len as usize;
        if end > piece.len() {
            return Err(Error::ShortRead {
                expected: len as usize,
                got: piece.len().saturating_sub(start),
            });
        }
        Ok(piece[start..end].to_vec())
    }

    /// Reads piece `index` from disk and checks it against its expected
    /// hash. Used both by the piece manager's startup verification and to
    /// validate a freshly downloaded piece before it is marked present.
    ///
    /// Any IO error (most commonly: the file doesn't exist yet, or is
    /// shorter than the piece) is treated as "piece not present" rather
    /// than propagated, since that's the expected case during startup
    /// verification of a partially downloaded torrent.
    pub async fn verify_piece(self: Arc<Self>, index: PieceIndex) -> bool {
        let expected = self.expected_piece_hash(index);
        match self.read_piece(index).await {
            Ok(bytes) => {
                let digest = Sha1::digest(&bytes[..]);
                &digest[..] == &expected[..]
            }
            Err(e) => {
                log::debug!(
                    "Piece {} could not be read for verification: {}",
                    index,
                    e
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{File as MetaFile, Info, Metainfo};
    use std::path::PathBuf;

    fn scratch_dir(suffix: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("torrentwire-disk-test-{}", suffix));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn single_file_metainfo(length: u64, piece_length: u64) -> Metainfo {
        let piece_count = ((length + piece_length - 1) / piece_length) as usize;
        Metainfo {
            info: Info {
                name: "a.bin".into(),
                pieces: vec![0u8; piece_count * 20],
                piece_length,
                length: Some(length),
                files: None,
                private: None,
            },
            announce: Some("http://tracker/".into()),
            announce_list: None,
        }
    }

    #[tokio::test]
    async fn writes_and_reads_single_file_piece() {
        let dir = scratch_dir("single-file");
        let metainfo = single_file_metainfo(40000, 16384);
        let info = StorageInfo::new(&metainfo, dir.clone());
        let disk = Disk::allocate(info, metainfo.info.pieces.clone())
            .await
            .unwrap();

        let piece0 = vec![7u8; 16384];
        Arc::clone(&disk)
            .write_piece(0, piece0.clone())
            .await
            .unwrap();

        let read_back = Arc::clone(&disk).read_piece(0).await.unwrap();
        assert_eq!(*read_back, piece0);

        let partial = Arc::clone(&disk).read_range(0, 100, 50).await.unwrap();
        assert_eq!(partial, piece0[100..150]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn writes_piece_spanning_two_files() {
        // S2 from the spec: piece_length=16384, files=[{len 10000, "x"},
        // {len 20000, ["sub", "y"]}]. Piece 0 writes 10000 bytes to x and
        // 6384 bytes at offset 0 of sub/y.
        let dir = scratch_dir("multi-file");
        let metainfo = Metainfo {
            info: Info {
                name: "root".into(),
                pieces: vec![0u8; 2 * 20],
                piece_length: 16384,
                length: None,
                files: Some(vec![
                    MetaFile {
                        path: vec!["x".into()],
                        length: 10000,
                    },
                    MetaFile {
                        path: vec!["sub".into(), "y".into()],
                        length: 20000,
                    },
                ]),
                private: None,
            },
            announce: Some("http://tracker/".into()),
            announce_list: None,
        };
        let info = StorageInfo::new(&metainfo, dir.clone());
        let disk = Disk::allocate(info, metainfo.info.pieces.clone())
            .await
            .unwrap();

        let piece0: Vec<u8> = (0..16384u32).map(|i| (i % 251) as u8).collect();
        Arc::clone(&disk).write_piece(0, piece0.clone()).await.unwrap();

        let x_bytes = fs::read(dir.join("x")).unwrap();
        assert_eq!(x_bytes, piece0[..10000]);
        let y_bytes = fs::read(dir.join("sub").join("y")).unwrap();
        assert_eq!(y_bytes[..6384], piece0[10000..]);

        let piece1: Vec<u8> =
            (0..13616u32).map(|i| ((i + 7) % 251) as u8).collect();
        Arc::clone(&disk).write_piece(1, piece1.clone()).await.unwrap();
        let y_bytes = fs::read(dir.join("sub").join("y")).unwrap();
        assert_eq!(y_bytes[6384..], piece1[..]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn verify_piece_detects_hash_mismatch_and_match() {
        let dir = scratch_dir("verify");
        let mut metainfo = single_file_metainfo(16384, 16384);
        let data = vec![42u8; 16384];
        let hash = Sha1::digest(&data);
        metainfo.info.pieces = hash.to_vec();
        let info = StorageInfo::new(&metainfo, dir.clone());
        let disk =
            Disk::allocate(info, metainfo.info.pieces.clone()).await.unwrap();

        // file exists (allocated) but is all zeroes, so verification fails
        assert!(!Arc::clone(&disk).verify_piece(0).await);

        Arc::clone(&disk).write_piece(0, data).await.unwrap();
        assert!(Arc::clone(&disk).verify_piece(0).await);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn read_block_serves_from_cached_piece() {
        let dir = scratch_dir("read-block");
        let metainfo = single_file_metainfo(16384, 16384);
        let info = StorageInfo::new(&metainfo, dir.clone());
        let disk =
            Disk::allocate(info, metainfo.info.pieces.clone()).await.unwrap();

        let data: Vec<u8> = (0..16384u32).map(|i| (i % 251) as u8).collect();
        Arc::clone(&disk).write_piece(0, data.clone()).await.unwrap();

        let block = Arc::clone(&disk).read_block(0, 100, 50).await.unwrap();
        assert_eq!(block, data[100..150]);

        let _ = fs::remove_dir_all(&dir);
    }
}
