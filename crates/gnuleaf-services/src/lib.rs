//! gnuleaf-services — the shared mutable state behind the protocol engine:
//! the shared-file library, the scored peer directory with its settings
//! file, the descriptor dedup cache, the servent identity, and the
//! GWebCache collaborator contract.

pub mod dedup;
pub mod directory;
pub mod identity;
pub mod library;
pub mod settings;
pub mod webcache;

pub use dedup::DedupCache;
pub use directory::{DirectoryEntry, PeerDirectory};
pub use library::{SharedFile, SharedLibrary};
pub use settings::{PeerSettings, PeerSource};
