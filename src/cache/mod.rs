//! Local disk cache
//!
//! Materializes remote files and their metadata on local disk, indexes
//! them in memory and keeps the cache within its age and size limits.

mod cleaner;
pub mod errors;
pub mod eviction;
pub mod fingerprint;
pub mod item;
pub mod options;
pub mod paths;
pub mod registry;

pub use errors::CacheError;
pub use eviction::SweepReport;
pub use fingerprint::{Fingerprinter, ObjectSnapshot};
pub use item::{Item, ItemInfo, ItemState};
pub use options::CacheOptions;
pub use paths::{clean, CacheLayout};
pub use registry::Cache;
