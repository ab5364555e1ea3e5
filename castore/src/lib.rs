#[cfg(test)]
use rstest_reuse;

mod digests;
mod errors;
mod nodes;
mod path;

pub mod blobservice;
pub mod directoryservice;
pub mod fingerprint;
pub mod fixtures;
pub mod import;
pub mod materialize;
pub mod merge;
pub mod proto;
pub mod store;

pub use digests::{B3Digest, Digest, DirectoryDigest, B3_LEN};
pub use errors::{DirectoryError, Error};
pub use fingerprint::{Fingerprint, FingerprintHasher};
pub use nodes::{Directory, Node, SymlinkTarget};
pub use path::PathComponent;
pub use store::{ContentStore, GcStats};
