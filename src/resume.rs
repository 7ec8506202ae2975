//! Durable resume state: a little-endian packed bitmap of present pieces,
//! persisted to a sidecar file next to the torrent's content.
//!
//! This bitmap is intentionally a different bit order from the wire
//! [`crate::Bitfield`] (which is MSB-first per byte, as BEP 3 requires):
//! resume state is purely local bookkeeping and is packed LSB-first for
//! simplicity, since nothing outside this module ever inspects its bytes
//! directly.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Returns the sidecar resume file path for a torrent named `name` inside
/// `download_dir`.
pub fn resume_file_path(download_dir: &Path, name: &str) -> PathBuf {
    download_dir.join(format!("{}.state", name))
}

/// A packed little-endian bitmap of which pieces are present on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumeBitmap {
    bits: Vec<u8>,
    piece_count: usize,
}

impl ResumeBitmap {
    /// Creates a bitmap with no pieces marked present.
    pub fn new(piece_count: usize) -> Self {
        let byte_len = (piece_count + 7) / 8;
        Self {
            bits: vec![0; byte_len],
            piece_count,
        }
    }

    /// Loads a bitmap from its serialized form. Fails softly (returns
    /// `Ok(None)`) if the file doesn't exist; any other IO error, or a
    /// stored bitmap whose size doesn't match `piece_count`, is surfaced.
    pub fn load(path: &Path, piece_count: usize) -> Result<Option<Self>> {
        match fs::read(path) {
            Ok(bits) => {
                let expected_len = (piece_count + 7) / 8;
                if bits.len() != expected_len {
                    // A mismatched resume file is treated as absent rather
                    // than fatal: everything gets re-verified from disk.
                    return Ok(None);
                }
                Ok(Some(Self { bits, piece_count }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persists the bitmap to `path`, overwriting any previous content.
    pub fn flush(&self, path: &Path) -> Result<()> {
        fs::write(path, &self.bits)?;
        Ok(())
    }

    /// Removes the sidecar file, e.g. once the torrent is fully complete.
    pub fn remove(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_set(&self, index: usize) -> bool {
        debug_assert!(index < self.piece_count);
        let byte = self.bits[index / 8];
        byte & (1 << (index % 8)) != 0
    }

    /// Sets bit `index`. Monotonic: never unsets an already-set bit, so the
    /// on-disk bitmap can only lag reality, never lead it.
    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.piece_count);
        self.bits[index / 8] |= 1 << (index % 8);
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(move |&i| self.is_set(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(suffix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("torrentwire-resume-test-{}", suffix))
    }

    #[test]
    fn round_trips_through_disk() {
        let path = scratch_path("round-trip");
        let _ = fs::remove_file(&path);

        let mut bitmap = ResumeBitmap::new(20);
        bitmap.set(0);
        bitmap.set(2);
        bitmap.set(19);
        bitmap.flush(&path).unwrap();

        let loaded = ResumeBitmap::load(&path, 20).unwrap().unwrap();
        assert_eq!(loaded, bitmap);
        assert!(loaded.is_set(0));
        assert!(loaded.is_set(2));
        assert!(loaded.is_set(19));
        assert!(!loaded.is_set(1));

        ResumeBitmap::remove(&path).unwrap();
        assert!(ResumeBitmap::load(&path, 20).unwrap().is_none());
    }

    #[test]
    fn missing_file_loads_as_none() {
        let path = scratch_path("missing");
        let _ = fs::remove_file(&path);
        assert!(ResumeBitmap::load(&path, 10).unwrap().is_none());
    }

    #[test]
    fn mismatched_piece_count_is_treated_as_absent() {
        let path = scratch_path("mismatched");
        let bitmap = ResumeBitmap::new(8);
        bitmap.flush(&path).unwrap();
        assert!(ResumeBitmap::load(&path, 100).unwrap().is_none());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn iter_set_yields_only_set_bits() {
        let mut bitmap = ResumeBitmap::new(10);
        bitmap.set(1);
        bitmap.set(5);
        let set: Vec<usize> = bitmap.iter_set().collect();
        assert_eq!(set, vec![1, 5]);
    }
}
