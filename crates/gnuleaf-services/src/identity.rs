//! Servent identity — the stable 16-byte id this node signs its hits with.
//!
//! Persisted next to the peer settings so PUSH routing keeps working across
//! restarts.

use std::path::Path;

use gnuleaf_core::guid::Guid;

/// Load the servent id from `path`, or create and persist a fresh one.
///
/// A corrupt or unreadable file falls back to a fresh id; persistence is
/// best-effort.
pub fn load_or_create(path: &Path) -> Guid {
    if let Ok(text) = std::fs::read_to_string(path) {
        if let Ok(guid) = text.trim().parse::<Guid>() {
            return guid;
        }
        tracing::warn!(path = %path.display(), "unparseable servent id file, regenerating");
    }

    let guid = Guid::random();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(path, guid.to_string()) {
        tracing::warn!(error = %e, path = %path.display(), "failed to persist servent id");
    } else {
        tracing::info!(servent_id = %guid, "generated new servent id");
    }
    guid
}
