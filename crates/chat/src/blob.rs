use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use super::collaborators::PlaceholderUrls;
use super::message::PendingFile;

const BLOB_URL_PREFIX: &str = "blob:deeplist/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub name: String,
    pub content_type: String,
    pub size: u64,
}

/// In-process registry of live placeholder URLs.
#[derive(Debug, Default)]
pub struct BlobRegistry {
    entries: Mutex<HashMap<String, BlobEntry>>,
}

impl BlobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_count(&self) -> usize {
        self.entries().len()
    }

    pub fn resolve(&self, url: &str) -> Option<BlobEntry> {
        self.entries().get(url).cloned()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, BlobEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PlaceholderUrls for BlobRegistry {
    fn create(&self, file: &PendingFile) -> String {
        let url = format!("{BLOB_URL_PREFIX}{}", Uuid::new_v4());
        self.entries().insert(
            url.clone(),
            BlobEntry {
                name: file.name.clone(),
                content_type: file.content_type.clone(),
                size: file.size(),
            },
        );
        url
    }

    fn revoke(&self, url: &str) {
        if self.entries().remove(url).is_none() {
            tracing::trace!(url, "placeholder already revoked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revoke_releases_and_tolerates_repeats() {
        let registry = BlobRegistry::new();
        let url = registry.create(&PendingFile::new("a.txt", "text/plain", vec![1_u8, 2]));

        assert!(url.starts_with(BLOB_URL_PREFIX));
        assert_eq!(registry.resolve(&url).map(|entry| entry.size), Some(2));

        registry.revoke(&url);
        registry.revoke(&url);
        assert_eq!(registry.live_count(), 0);
    }
}
