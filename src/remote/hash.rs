//! Content hashing shared by the cache and remotes

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha1::{Digest, Sha1};

/// Read buffer size for hashing files
const HASH_BUF_SIZE: usize = 64 * 1024;

/// Supported content hash algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashType {
    Md5,
    Sha1,
}

/// Hashes the local cache storage can compute, in preference order
pub const LOCAL_HASHES: &[HashType] = &[HashType::Md5, HashType::Sha1];

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashType::Md5 => f.write_str("md5"),
            HashType::Sha1 => f.write_str("sha1"),
        }
    }
}

/// Pick the hash both sides support
///
/// Returns the first entry of `local` that `remote` also lists, or `None`
/// when there is no overlap.
pub fn common_hash(local: &[HashType], remote: &[HashType]) -> Option<HashType> {
    local.iter().copied().find(|ty| remote.contains(ty))
}

/// Hash a file on local disk
pub fn hash_file(path: &Path, ty: HashType) -> io::Result<String> {
    let mut file = File::open(path)?;
    hash_reader(&mut file, ty)
}

/// Hash everything readable from `reader`
pub fn hash_reader<R: Read>(reader: &mut R, ty: HashType) -> io::Result<String> {
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    match ty {
        HashType::Md5 => {
            let mut ctx = md5::Context::new();
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                ctx.consume(&buf[..n]);
            }
            Ok(format!("{:x}", ctx.compute()))
        }
        HashType::Sha1 => {
            let mut hasher = Sha1::new();
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_hash_prefers_local_order() {
        assert_eq!(
            common_hash(LOCAL_HASHES, &[HashType::Sha1, HashType::Md5]),
            Some(HashType::Md5)
        );
        assert_eq!(
            common_hash(LOCAL_HASHES, &[HashType::Sha1]),
            Some(HashType::Sha1)
        );
    }

    #[test]
    fn test_common_hash_none() {
        assert_eq!(common_hash(LOCAL_HASHES, &[]), None);
        assert_eq!(common_hash(&[], &[HashType::Md5]), None);
    }

    #[test]
    fn test_hash_reader_known_values() {
        let md5 = hash_reader(&mut &b"hello"[..], HashType::Md5).unwrap();
        assert_eq!(md5, "5d41402abc4b2a76b9719d911017c592");

        let sha1 = hash_reader(&mut &b"hello"[..], HashType::Sha1).unwrap();
        assert_eq!(sha1, "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
    }

    #[test]
    fn test_hash_file_matches_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"hello").unwrap();

        assert_eq!(
            hash_file(&path, HashType::Sha1).unwrap(),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
    }
}
