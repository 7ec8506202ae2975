//! Bencoded metainfo decoding.
//!
//! The info hash must be stable under any re-encoding round-trip. Rather
//! than trust `serde_bencode` to reproduce the original `info` dictionary
//! byte-for-byte on re-encode, we locate and retain the exact byte range
//! of the `info` sub-dictionary in the source buffer and hash that slice
//! directly.

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::Sha1Hash;

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
    #[serde(default)]
    pub announce: Option<String>,
    #[serde(rename = "announce-list")]
    #[serde(default)]
    pub announce_list: Option<Vec<Vec<String>>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

impl Metainfo {
    /// Parses a metainfo buffer, validating its structure per the engine's
    /// requirements (not merely what `serde_bencode` itself enforces).
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Metainfo = serde_bencode::from_bytes(buf)
            .map_err(|e| Error::MalformedMetainfo(e.to_string()))?;
        metainfo.validate()?;
        Ok(metainfo)
    }

    fn validate(&self) -> Result<()> {
        if self.info.name.is_empty() {
            return Err(Error::MalformedMetainfo("empty name".into()));
        }
        if self.info.piece_length == 0 {
            return Err(Error::MalformedMetainfo(
                "piece length must be positive".into(),
            ));
        }
        if self.info.pieces.is_empty() || self.info.pieces.len() % 20 != 0 {
            return Err(Error::MalformedMetainfo(
                "pieces must be a non-empty multiple of 20 bytes".into(),
            ));
        }

        match (&self.info.length, &self.info.files) {
            (Some(len), None) => {
                if *len == 0 {
                    return Err(Error::MalformedMetainfo(
                        "single-file length must be positive".into(),
                    ));
                }
            }
            (None, Some(files)) => {
                if files.is_empty() {
                    return Err(Error::MalformedMetainfo(
                        "files list must not be empty".into(),
                    ));
                }
                for file in files {
                    if file.length <= 0 {
                        return Err(Error::MalformedMetainfo(
                            "file length must be positive".into(),
                        ));
                    }
                    if file.path.is_empty() {
                        return Err(Error::MalformedMetainfo(
                            "file path must not be empty".into(),
                        ));
                    }
                    for component in &file.path {
                        validate_path_component(component)?;
                    }
                }
            }
            (Some(_), Some(_)) | (None, None) => {
                return Err(Error::MalformedMetainfo(
                    "metainfo must declare exactly one of length or files".into(),
                ));
            }
        }

        if self.announce_urls().is_empty() {
            return Err(Error::EmptyAnnounceList);
        }

        Ok(())
    }

    /// Returns the announce URLs in tier order, flattening `announce-list`
    /// and falling back to the single `announce` key if the list is absent.
    pub fn announce_urls(&self) -> Vec<String> {
        if let Some(tiers) = &self.announce_list {
            let urls: Vec<String> = tiers
                .iter()
                .flatten()
                .filter(|url| !url.is_empty())
                .cloned()
                .collect();
            if !urls.is_empty() {
                return urls;
            }
        }
        self.announce
            .iter()
            .filter(|url| !url.is_empty())
            .cloned()
            .collect()
    }

    /// Computes the 20-byte SHA-1 info hash from the original buffer,
    /// locating and hashing the exact byte range of the `info` sub-dict
    /// rather than re-encoding the parsed `Info` struct.
    pub fn create_info_hash(buf: &[u8]) -> Result<Sha1Hash> {
        let info_bytes = locate_info_dict_bytes(buf)?;
        let digest = Sha1::digest(info_bytes);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// The number of pieces in this torrent.
    pub fn piece_count(&self) -> usize {
        let total_len = self.total_len();
        let piece_len = self.info.piece_length;
        ((total_len + piece_len - 1) / piece_len) as usize
    }

    /// The total content length across all files.
    pub fn total_len(&self) -> u64 {
        match (&self.info.length, &self.info.files) {
            (Some(len), _) => *len,
            (_, Some(files)) => files.iter().map(|f| f.length as u64).sum(),
            _ => 0,
        }
    }

    /// The length of piece `index`, accounting for a possibly shorter last
    /// piece.
    pub fn piece_len(&self, index: usize) -> u32 {
        let piece_count = self.piece_count();
        if index == piece_count - 1 {
            let rem = self.total_len() - (piece_count - 1) as u64 * self.info.piece_length;
            rem as u32
        } else {
            self.info.piece_length as u32
        }
    }

    /// The expected SHA-1 hash of piece `index`.
    pub fn piece_hash(&self, index: usize) -> Sha1Hash {
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.info.pieces[index * 20..index * 20 + 20]);
        hash
    }
}

fn validate_path_component(component: &str) -> Result<()> {
    if component.is_empty()
        || component == ".."
        || component.starts_with('/')
        || component.contains('\0')
    {
        return Err(Error::MalformedMetainfo(format!(
            "invalid path component: {:?}",
            component
        )));
    }
    Ok(())
}

/// Scans a bencoded byte buffer for the top-level `info` key and returns
/// the exact byte range of its dictionary value.
fn locate_info_dict_bytes(buf: &[u8]) -> Result<&[u8]> {
    if buf.first() != Some(&b'd') {
        return Err(Error::MalformedMetainfo(
            "metainfo is not a bencoded dictionary".into(),
        ));
    }
    let mut pos = 1;
    loop {
        if pos >= buf.len() {
            return Err(Error::MalformedMetainfo(
                "unexpected end of metainfo buffer".into(),
            ));
        }
        if buf[pos] == b'e' {
            return Err(Error::MalformedMetainfo("no info dictionary found".into()));
        }
        let (key, next) = read_bencoded_string(buf, pos)?;
        let value_start = next;
        let value_end = skip_bencoded_value(buf, next)?;
        if key == b"info" {
            return Ok(&buf[value_start..value_end]);
        }
        pos = value_end;
    }
}

/// Reads a bencoded byte-string starting at `pos` (`<len>:<bytes>`),
/// returning the string's bytes and the offset just past it.
fn read_bencoded_string(buf: &[u8], pos: usize) -> Result<(&[u8], usize)> {
    let colon = buf[pos..]
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| Error::MalformedMetainfo("malformed bencoded string length".into()))?
        + pos;
    let len: usize = std::str::from_utf8(&buf[pos..colon])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::MalformedMetainfo("malformed bencoded string length".into()))?;
    let start = colon + 1;
    let end = start
        .checked_add(len)
        .ok_or_else(|| Error::MalformedMetainfo("bencoded string length overflow".into()))?;
    if end > buf.len() {
        return Err(Error::MalformedMetainfo(
            "bencoded string runs past end of buffer".into(),
        ));
    }
    Ok((&buf[start..end], end))
}

/// Returns the offset just past the bencoded value starting at `pos`,
/// without interpreting it beyond what's needed to find its extent.
fn skip_bencoded_value(buf: &[u8], pos: usize) -> Result<usize> {
    if pos >= buf.len() {
        return Err(Error::MalformedMetainfo(
            "unexpected end of metainfo buffer".into(),
        ));
    }
    match buf[pos] {
        b'i' => {
            let e = buf[pos..]
                .iter()
                .position(|&b| b == b'e')
                .ok_or_else(|| Error::MalformedMetainfo("unterminated integer".into()))?
                + pos;
            Ok(e + 1)
        }
        b'0'..=b'9' => {
            let (_, next) = read_bencoded_string(buf, pos)?;
            Ok(next)
        }
        b'l' => {
            let mut p = pos + 1;
            while buf.get(p) != Some(&b'e') {
                p = skip_bencoded_value(buf, p)?;
            }
            Ok(p + 1)
        }
        b'd' => {
            let mut p = pos + 1;
            while buf.get(p) != Some(&b'e') {
                let (_, next) = read_bencoded_string(buf, p)?;
                p = skip_bencoded_value(buf, next)?;
            }
            Ok(p + 1)
        }
        _ => Err(Error::MalformedMetainfo("invalid bencode tag".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_metainfo() -> Vec<u8> {
        // name="a.bin", piece length=16384, pieces=two fake 20-byte hashes,
        // length=40000, announce set.
        let pieces = vec![0u8; 40];
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce17:http://tracker/4:infod6:lengthi40000e4:name5:a.bin12:piece lengthi16384e6:pieces");
        buf.extend_from_slice(format!("{}:", pieces.len()).as_bytes());
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn parses_single_file_torrent() {
        let buf = single_file_metainfo();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.info.name, "a.bin");
        assert_eq!(metainfo.total_len(), 40000);
        assert_eq!(metainfo.piece_count(), 3);
        assert_eq!(metainfo.piece_len(0), 16384);
        assert_eq!(metainfo.piece_len(1), 16384);
        assert_eq!(metainfo.piece_len(2), 7232);
        assert_eq!(metainfo.announce_urls(), vec!["http://tracker/".to_string()]);
    }

    #[test]
    fn info_hash_is_stable_across_whole_buffer_changes() {
        let buf = single_file_metainfo();
        let hash_a = Metainfo::create_info_hash(&buf).unwrap();

        // Prepend an extra top-level key so the info dict moves within the
        // buffer; the hash of the info sub-dict bytes must be unaffected.
        let mut buf2 = Vec::new();
        buf2.extend_from_slice(b"d7:comment4:test");
        buf2.extend_from_slice(&buf[1..]);
        let hash_b = Metainfo::create_info_hash(&buf2).unwrap();

        assert_eq!(hash_a, hash_b);
    }

    #[test]
    fn rejects_missing_announce() {
        let buf = b"d4:infod6:lengthi1e4:name1:a12:piece lengthi1e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        match Metainfo::from_bytes(buf) {
            Err(Error::EmptyAnnounceList) => {}
            other => panic!("expected EmptyAnnounceList, got {:?}", other),
        }
    }

    #[test]
    fn rejects_path_traversal() {
        let info = Info {
            name: "root".into(),
            pieces: vec![0; 20],
            piece_length: 16384,
            length: None,
            files: Some(vec![File {
                path: vec!["..".into(), "etc".into()],
                length: 10,
            }]),
            private: None,
        };
        let metainfo = Metainfo {
            info,
            announce: Some("http://tracker/".into()),
            announce_list: None,
        };
        match metainfo.validate() {
            Err(Error::MalformedMetainfo(_)) => {}
            other => panic!("expected MalformedMetainfo, got {:?}", other),
        }
    }

    #[test]
    fn rejects_pieces_not_multiple_of_20() {
        let info = Info {
            name: "a".into(),
            pieces: vec![0; 19],
            piece_length: 16384,
            length: Some(10),
            files: None,
            private: None,
        };
        let metainfo = Metainfo {
            info,
            announce: Some("http://tracker/".into()),
            announce_list: None,
        };
        match metainfo.validate() {
            Err(Error::MalformedMetainfo(_)) => {}
            other => panic!("expected MalformedMetainfo, got {:?}", other),
        }
    }
}
