//! Object Fingerprints
//!
//! Derives a short identity string for a remote object from its size,
//! modification time and content hash. The cache compares the fingerprint
//! recorded when a file was cached with a freshly computed one to detect
//! that the remote object has changed.

use std::fmt;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::trace;

use crate::remote::{HashType, Remote, RemoteObject};

/// Observed state of a remote object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSnapshot {
    /// Size in bytes
    pub size: u64,
    /// Modification time, if the remote supports modtimes
    pub mod_time: Option<SystemTime>,
    /// Content hash, if a common hash exists and the lookup succeeded
    pub hash: Option<String>,
}

impl ObjectSnapshot {
    /// Fingerprint string: size, then UTC modtime, then hash
    pub fn fingerprint(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ObjectSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.size)?;
        if let Some(mod_time) = self.mod_time {
            let utc: DateTime<Utc> = mod_time.into();
            write!(f, ",{}", utc.to_rfc3339_opts(SecondsFormat::Nanos, true))?;
        }
        if let Some(hash) = &self.hash {
            write!(f, ",{}", hash)?;
        }
        Ok(())
    }
}

/// Computes snapshots for objects of one remote
#[derive(Debug, Clone, Copy)]
pub struct Fingerprinter {
    /// Whether the remote reports meaningful modtimes
    modtimes: bool,
    /// Hash shared by the cache and the remote
    hash_type: Option<HashType>,
}

impl Fingerprinter {
    /// Create a fingerprinter for `remote` using the negotiated hash
    pub fn new(remote: &dyn Remote, hash_type: Option<HashType>) -> Self {
        Self {
            modtimes: remote.precision().is_some(),
            hash_type,
        }
    }

    /// The negotiated hash type
    pub fn hash_type(&self) -> Option<HashType> {
        self.hash_type
    }

    /// Query the remote for the fields that make up the fingerprint
    ///
    /// Hash failures are not errors: the hash is left out and the
    /// fingerprint falls back to size and modtime.
    pub async fn snapshot(&self, obj: &dyn RemoteObject) -> ObjectSnapshot {
        let mod_time = if self.modtimes {
            Some(obj.mod_time().await)
        } else {
            None
        };

        let hash = match self.hash_type {
            Some(ty) => match obj.hash(ty).await {
                Ok(hash) => Some(hash),
                Err(e) => {
                    trace!(remote = obj.remote(), hash = %ty, error = %e, "Hash unavailable for fingerprint");
                    None
                }
            },
            None => None,
        };

        ObjectSnapshot {
            size: obj.size(),
            mod_time,
            hash,
        }
    }

    /// Fingerprint string for `obj`
    pub async fn fingerprint(&self, obj: &dyn RemoteObject) -> String {
        self.snapshot(obj).await.fingerprint()
    }
}
