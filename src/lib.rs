//! A disk-resident multimap and the bidirectional threat-intel crawl engine built on top of it.
//!
//! [`multimap::DiskMultiMap`] is a persistent hash multimap over a single file: insert, search,
//! and erase, with free-space reuse and no rehashing. [`intel_web::IntelWeb`] composes two such
//! maps (`forward` and `reverse`) to ingest "X created Y" telemetry and crawl outward from known
//! threat indicators.

#[macro_use]
extern crate slog;

pub mod binary_file;
pub mod intel_web;
pub mod multimap;
pub mod record;

pub use intel_web::{Error as IntelWebError, InteractionTuple, IntelWeb};
pub use multimap::{DiskMultiMap, Error as MultiMapError, Triple};
