use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use super::MediaType;
use super::reader::TsbReader;
use super::store::TsbStore;
use crate::time::MediaTime;

/// Per-playback-session registry of TSB stores, one per active media type.
///
/// The fetch loop asks it for the store to write into and checks the
/// fragment budget before each write; the injector asks it for readers.
/// Eviction of the live window runs across all tracks so audio and
/// subtitles trail video by at most one fragment duration.
pub struct TsbSession {
    session_id: String,
    stores: DashMap<MediaType, Arc<TsbStore>>,
    max_fragments: usize,
}

impl TsbSession {
    pub fn new(session_id: impl Into<String>, max_fragments: usize) -> Self {
        let session_id = session_id.into();
        info!(
            "Creating TSB session {} with budget of {} fragments",
            session_id, max_fragments
        );
        Self {
            session_id,
            stores: DashMap::new(),
            max_fragments,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The store for a media type, created on first use.
    pub fn store(&self, media: MediaType) -> Arc<TsbStore> {
        self.stores
            .entry(media)
            .or_insert_with(|| Arc::new(TsbStore::new(media)))
            .clone()
    }

    /// A fresh reader over this session's store for the media type.
    pub fn create_reader(&self, media: MediaType) -> TsbReader {
        TsbReader::new(self.store(media), self.session_id.clone())
    }

    /// Cached fragments across all tracks.
    pub fn total_fragments(&self) -> usize {
        self.stores.iter().map(|entry| entry.value().len()).sum()
    }

    /// Back-pressure check for the fetch loop: false means yield without
    /// writing.
    pub fn has_free_fragment_budget(&self) -> bool {
        self.total_fragments() < self.max_fragments
    }

    /// Live-window eviction: drop every fragment below `position` on every
    /// track. Returns the number of fragments removed.
    pub fn evict_until(&self, position: MediaTime) -> usize {
        let mut removed = 0;
        for entry in self.stores.iter() {
            removed += entry.value().remove_fragments(position).len();
        }
        removed
    }

    pub fn flush_all(&self) {
        info!("Flushing TSB session {}", self.session_id);
        for entry in self.stores.iter() {
            entry.value().flush();
        }
    }
}
