use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::DateTime;
use parking_lot::Mutex;
use tracing::{info, trace, warn};

use super::{MediaType, StreamInfo, TsbFragmentData, TsbInitData, TsbWriteData};
use crate::metrics;
use crate::time::MediaTime;

/// Scan direction for [`TsbStore::next_discontinuity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchDirection {
    Forward,
    Backward,
}

/// Result of popping the oldest fragment from the index.
#[derive(Debug)]
pub struct RemovedFragment {
    pub fragment: Arc<TsbFragmentData>,
    /// True when the fragment's init header was dropped as well because its
    /// last user went away.
    pub init_removed: bool,
}

struct StoreInner {
    fragments: BTreeMap<MediaTime, Arc<TsbFragmentData>>,
    init_headers: Vec<Arc<TsbInitData>>,
    current_init: Option<Arc<TsbInitData>>,
    /// Newest fragment, for O(1) linking of appends
    tail: Option<Arc<TsbFragmentData>>,
}

/// Authoritative index of the cached fragments of one media type.
///
/// Keyed by absolute position. All operations serialize on one internal
/// lock; critical sections are map and link manipulation only, with no
/// suspension points. Nothing here fails across the API boundary: queries
/// on an empty index return `None`, and the only rejected write is a media
/// fragment arriving before any init header.
pub struct TsbStore {
    media_type: MediaType,
    inner: Mutex<StoreInner>,
}

impl TsbStore {
    pub fn new(media_type: MediaType) -> Self {
        Self {
            media_type,
            inner: Mutex::new(StoreInner {
                fragments: BTreeMap::new(),
                init_headers: Vec::new(),
                current_init: None,
                tail: None,
            }),
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// Register an init header. Subsequent media fragments reference it
    /// until the next init header is written.
    pub fn add_init_fragment(
        &self,
        url: String,
        stream_info: StreamInfo,
        period_id: String,
        absolute_position: MediaTime,
        profile_index: u32,
    ) {
        let mut inner = self.inner.lock();
        info!(
            "[{}] Adding init header: position {:.2}s bandwidth {} period {} {}x{}@{:.2} url '{}'",
            self.media_type,
            absolute_position.as_secs_f64(),
            stream_info.bandwidth_bps,
            period_id,
            stream_info.width,
            stream_info.height,
            stream_info.framerate,
            url
        );
        let init = Arc::new(TsbInitData::new(
            url,
            self.media_type.init_variant(),
            absolute_position,
            period_id,
            stream_info,
            profile_index,
        ));
        inner.init_headers.push(Arc::clone(&init));
        inner.current_init = Some(init);
        metrics::record_init_added(self.media_type.name());
    }

    /// Append a media fragment referencing the current init header.
    ///
    /// Returns false when no init header has been written yet; the caller
    /// logs and retries after the next init write.
    pub fn add_fragment(&self, write: TsbWriteData, discontinuous: bool) -> bool {
        let mut inner = self.inner.lock();
        let Some(init) = inner.current_init.clone() else {
            warn!(
                "[{}] Inserting fragment at {:.2}s but init header information is missing",
                self.media_type,
                write.absolute_position.as_secs_f64()
            );
            return false;
        };
        info!(
            "[{}] Adding fragment: position {:.2}s duration {:.2}s pts {:.2}s discontinuous {} period {} url '{}'",
            self.media_type,
            write.absolute_position.as_secs_f64(),
            write.duration.as_secs_f64(),
            write.pts.as_secs_f64(),
            discontinuous,
            write.period_id,
            write.url
        );
        init.increment_users();
        let fragment = Arc::new(TsbFragmentData::new(
            write.url,
            self.media_type,
            write.absolute_position,
            write.duration,
            write.pts,
            discontinuous,
            write.period_id,
            init,
            write.timescale,
            write.pts_offset,
        ));
        if let Some(tail) = inner.tail.take() {
            fragment.set_prev(&tail);
            tail.set_next(&fragment);
        }
        inner.tail = Some(Arc::clone(&fragment));
        if let Some(replaced) = inner
            .fragments
            .insert(write.absolute_position, fragment)
        {
            warn!(
                "[{}] Replaced existing fragment at {:.2}s",
                self.media_type,
                replaced.absolute_position().as_secs_f64()
            );
        }
        metrics::record_fragment_added(self.media_type.name());
        metrics::set_cached_fragments(self.media_type.name(), inner.fragments.len());
        true
    }

    /// Fragment at the exact position, plus whether it is the last one in
    /// the index (EOS from the cache's point of view).
    pub fn fragment_at(&self, position: MediaTime) -> Option<(Arc<TsbFragmentData>, bool)> {
        let inner = self.inner.lock();
        let fragment = inner.fragments.get(&position)?;
        let eos = inner
            .fragments
            .last_key_value()
            .is_some_and(|(last, _)| *last == position);
        Some((Arc::clone(fragment), eos))
    }

    /// Fragment closest to the position; exact midpoint ties go to the
    /// later neighbour. `None` on an empty index.
    pub fn nearest_fragment(&self, position: MediaTime) -> Option<Arc<TsbFragmentData>> {
        let inner = self.inner.lock();
        let later = inner.fragments.range(position..).next();
        let earlier = inner.fragments.range(..position).next_back();
        let chosen = match (earlier, later) {
            (None, Some((_, f))) => f,
            (Some((_, f)), None) => f,
            (Some((ek, ef)), Some((lk, lf))) => {
                if *lk - position <= position - *ek {
                    lf
                } else {
                    ef
                }
            }
            (None, None) => return None,
        };
        trace!(
            "[{}] Nearest fragment to {:.2}s is {:.2}s",
            self.media_type,
            position.as_secs_f64(),
            chosen.absolute_position().as_secs_f64()
        );
        Some(Arc::clone(chosen))
    }

    /// True iff the position lies in the closed interval spanned by the
    /// first and last cached fragment.
    pub fn is_fragment_present(&self, position: MediaTime) -> bool {
        let inner = self.inner.lock();
        match (
            inner.fragments.first_key_value(),
            inner.fragments.last_key_value(),
        ) {
            (Some((first, _)), Some((last, _))) => *first <= position && position <= *last,
            _ => false,
        }
    }

    pub fn first_fragment(&self) -> Option<Arc<TsbFragmentData>> {
        let inner = self.inner.lock();
        inner.fragments.first_key_value().map(|(_, f)| Arc::clone(f))
    }

    pub fn last_fragment(&self) -> Option<Arc<TsbFragmentData>> {
        let inner = self.inner.lock();
        inner.fragments.last_key_value().map(|(_, f)| Arc::clone(f))
    }

    pub fn first_fragment_position(&self) -> Option<MediaTime> {
        let inner = self.inner.lock();
        inner.fragments.first_key_value().map(|(k, _)| *k)
    }

    pub fn last_fragment_position(&self) -> Option<MediaTime> {
        let inner = self.inner.lock();
        inner.fragments.last_key_value().map(|(k, _)| *k)
    }

    /// Pop the oldest fragment. Its init header goes with it when the
    /// refcount reaches zero.
    pub fn remove_fragment(&self) -> Option<RemovedFragment> {
        let mut inner = self.inner.lock();
        let (position, fragment) = inner.fragments.pop_first()?;
        let init_removed = Self::release_init(&mut inner, &fragment);
        if let Some(next) = fragment.next() {
            next.clear_prev();
        }
        if inner.fragments.is_empty() {
            inner.tail = None;
        }
        info!(
            "[{}] Removed fragment at {:.2}s",
            self.media_type,
            position.as_secs_f64()
        );
        metrics::record_fragments_evicted(self.media_type.name(), 1);
        metrics::set_cached_fragments(self.media_type.name(), inner.fragments.len());
        Some(RemovedFragment {
            fragment,
            init_removed,
        })
    }

    /// Evict every fragment with position strictly below `position`, in
    /// age order. Init headers are dropped the moment their refcount hits
    /// zero.
    pub fn remove_fragments(&self, position: MediaTime) -> Vec<Arc<TsbFragmentData>> {
        let mut inner = self.inner.lock();
        let mut removed = Vec::new();
        while let Some(entry) = inner.fragments.first_entry() {
            if *entry.key() >= position {
                break;
            }
            let fragment = entry.remove();
            Self::release_init(&mut inner, &fragment);
            removed.push(fragment);
        }
        if !removed.is_empty() {
            if let Some((_, first)) = inner.fragments.first_key_value() {
                first.clear_prev();
            } else {
                inner.tail = None;
            }
            info!(
                "[{}] Removed {} fragments below {:.2}s",
                self.media_type,
                removed.len(),
                position.as_secs_f64()
            );
            metrics::record_fragments_evicted(self.media_type.name(), removed.len() as u64);
            metrics::set_cached_fragments(self.media_type.name(), inner.fragments.len());
        }
        removed
    }

    /// First discontinuous fragment at a position `>= position` (forward)
    /// or `<= position` (backward). `None` when no such fragment exists.
    pub fn next_discontinuity(
        &self,
        position: MediaTime,
        direction: SearchDirection,
    ) -> Option<Arc<TsbFragmentData>> {
        let inner = self.inner.lock();
        let found = match direction {
            SearchDirection::Forward => inner
                .fragments
                .range(position..)
                .map(|(_, f)| f)
                .find(|f| f.is_discontinuous()),
            SearchDirection::Backward => inner
                .fragments
                .range(..=position)
                .rev()
                .map(|(_, f)| f)
                .find(|f| f.is_discontinuous()),
        };
        found.map(Arc::clone)
    }

    /// Drop the whole index: fragments, init headers and the current-init
    /// pointer.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        info!("[{}] Flushing TSB index", self.media_type);
        inner.fragments.clear();
        inner.init_headers.clear();
        inner.current_init = None;
        inner.tail = None;
        metrics::set_cached_fragments(self.media_type.name(), 0);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().fragments.is_empty()
    }

    /// Number of live init headers.
    pub fn init_count(&self) -> usize {
        self.inner.lock().init_headers.len()
    }

    /// Log the indexed fragments with their init headers.
    pub fn dump(&self) {
        let inner = self.inner.lock();
        for fragment in inner.fragments.values() {
            let init = fragment.init_data();
            let wallclock = DateTime::from_timestamp(fragment.absolute_position().seconds(), 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            info!(
                "[{}] Fragment {{ position {:.2}s ({}) duration {:.2}s pts {:.2}s bandwidth {} discontinuous {} url '{}' init '{}' users {} }}",
                self.media_type,
                fragment.absolute_position().as_secs_f64(),
                wallclock,
                fragment.duration().as_secs_f64(),
                fragment.pts().as_secs_f64(),
                init.bandwidth(),
                fragment.is_discontinuous(),
                fragment.url(),
                init.url(),
                init.users()
            );
        }
    }

    /// Decrement the fragment's init refcount and drop the header from the
    /// init list when it reaches zero. Returns true when dropped.
    fn release_init(inner: &mut StoreInner, fragment: &Arc<TsbFragmentData>) -> bool {
        let init = fragment.init_data();
        if init.decrement_users() == 0 {
            info!(
                "Removing init header of bandwidth {} since no more cached fragments use it",
                init.bandwidth()
            );
            inner
                .init_headers
                .retain(|candidate| !Arc::ptr_eq(candidate, &init));
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_fragments(positions: &[f64]) -> TsbStore {
        let store = TsbStore::new(MediaType::Video);
        store.add_init_fragment(
            "http://example.com/init.mp4".to_string(),
            StreamInfo {
                bandwidth_bps: 800_000,
                width: 1280,
                height: 720,
                framerate: 25.0,
            },
            "p1".to_string(),
            MediaTime::from_secs_f64(positions.first().copied().unwrap_or(0.0)),
            0,
        );
        for pos in positions {
            assert!(store.add_fragment(write_at(*pos, 5.0, "p1"), false));
        }
        store
    }

    fn write_at(position: f64, duration: f64, period: &str) -> TsbWriteData {
        TsbWriteData {
            url: format!("http://example.com/{position}.mp4"),
            absolute_position: MediaTime::from_secs_f64(position),
            duration: MediaTime::from_secs_f64(duration),
            pts: MediaTime::from_secs_f64(position - 1000.0),
            period_id: period.to_string(),
            timescale: 90_000,
            pts_offset: MediaTime::ZERO,
        }
    }

    #[test]
    fn test_add_fragment_missing_init_header() {
        let store = TsbStore::new(MediaType::Video);
        assert!(!store.add_fragment(write_at(1005.0, 5.0, "p1"), false));
        assert!(store.is_empty());
    }

    #[test]
    fn test_add_fragment_with_discontinuity() {
        let store = TsbStore::new(MediaType::Video);
        store.add_init_fragment(
            "http://example.com/init.mp4".to_string(),
            StreamInfo::default(),
            "p1".to_string(),
            MediaTime::from_secs_f64(1005.0),
            3,
        );
        assert!(store.add_fragment(write_at(1005.0, 5.0, "p1"), true));

        let last = store.last_fragment().unwrap();
        assert_eq!(last.url(), "http://example.com/1005.mp4");
        assert_eq!(last.media_type(), MediaType::Video);
        assert_eq!(last.absolute_position(), 1005.0);
        assert_eq!(last.duration(), 5.0);
        assert_eq!(last.pts(), 5.0);
        assert!(last.is_discontinuous());
        assert_eq!(last.period_id(), "p1");
        assert_eq!(last.timescale(), 90_000);
        assert_eq!(last.pts_offset(), 0.0);
        assert_eq!(last.init_data().profile_index(), 3);
        assert_eq!(last.init_data().users(), 1);
    }

    #[test]
    fn test_nearest_fragment_single() {
        let store = store_with_fragments(&[1005.0]);
        for probe in [1000.0, 1005.0, 1010.0] {
            let f = store
                .nearest_fragment(MediaTime::from_secs_f64(probe))
                .unwrap();
            assert_eq!(f.absolute_position(), 1005.0);
        }
    }

    #[test]
    fn test_nearest_fragment_multiple() {
        let store = store_with_fragments(&[1005.0, 1010.0, 1015.0]);
        let at = |p: f64| {
            store
                .nearest_fragment(MediaTime::from_secs_f64(p))
                .unwrap()
                .absolute_position()
        };
        assert_eq!(at(1000.0), 1005.0);
        assert_eq!(at(1005.0), 1005.0);
        assert_eq!(at(1006.0), 1005.0);
        assert_eq!(at(1009.0), 1010.0);
        assert_eq!(at(1020.0), 1015.0);
    }

    #[test]
    fn test_nearest_fragment_midpoint_tie_goes_later() {
        let store = store_with_fragments(&[1005.0, 1010.0]);
        let f = store
            .nearest_fragment(MediaTime::from_secs_f64(1007.5))
            .unwrap();
        assert_eq!(f.absolute_position(), 1010.0);
    }

    #[test]
    fn test_nearest_fragment_empty() {
        let store = TsbStore::new(MediaType::Video);
        assert!(store.nearest_fragment(MediaTime::from_secs_f64(1.0)).is_none());
    }

    #[test]
    fn test_fragment_at_exact_position() {
        let store = store_with_fragments(&[1005.0, 1010.0, 1015.0]);
        let (f, eos) = store.fragment_at(MediaTime::from_secs_f64(1005.0)).unwrap();
        assert_eq!(f.absolute_position(), 1005.0);
        assert!(!eos);

        let (last, eos) = store.fragment_at(MediaTime::from_secs_f64(1015.0)).unwrap();
        assert_eq!(last.absolute_position(), 1015.0);
        assert!(eos);

        assert!(store.fragment_at(MediaTime::from_secs_f64(1007.0)).is_none());
        assert!(store.fragment_at(MediaTime::from_secs_f64(2000.0)).is_none());
    }

    #[test]
    fn test_first_last_positions() {
        let store = TsbStore::new(MediaType::Video);
        assert!(store.first_fragment_position().is_none());
        assert!(store.last_fragment_position().is_none());
        assert!(store.first_fragment().is_none());
        assert!(store.last_fragment().is_none());

        let store = store_with_fragments(&[1005.0, 1010.0, 1015.0]);
        assert_eq!(store.first_fragment_position().unwrap(), 1005.0);
        assert_eq!(store.last_fragment_position().unwrap(), 1015.0);
    }

    #[test]
    fn test_link_order_matches_map_order() {
        let store = store_with_fragments(&[1005.0, 1010.0, 1015.0]);
        let first = store.first_fragment().unwrap();
        let second = first.next().unwrap();
        let third = second.next().unwrap();
        assert_eq!(second.absolute_position(), 1010.0);
        assert_eq!(third.absolute_position(), 1015.0);
        assert!(third.next().is_none());
        assert_eq!(third.prev().unwrap().absolute_position(), 1010.0);
        assert!(first.prev().is_none());
    }

    #[test]
    fn test_init_refcount_matches_fragments() {
        let store = store_with_fragments(&[1005.0, 1010.0, 1015.0]);
        let init = store.first_fragment().unwrap().init_data();
        assert_eq!(init.users(), 3);
        assert_eq!(store.init_count(), 1);
    }

    #[test]
    fn test_remove_fragment_empty() {
        let store = TsbStore::new(MediaType::Video);
        assert!(store.remove_fragment().is_none());
    }

    #[test]
    fn test_remove_fragment_single_drops_init() {
        let store = store_with_fragments(&[1005.0]);
        let removed = store.remove_fragment().unwrap();
        assert!(removed.init_removed);
        assert_eq!(removed.fragment.absolute_position(), 1005.0);
        assert_eq!(store.init_count(), 0);
        assert!(store.first_fragment_position().is_none());
    }

    #[test]
    fn test_remove_fragment_multiple_keeps_init() {
        let store = store_with_fragments(&[1005.0, 1010.0, 1015.0]);

        let removed = store.remove_fragment().unwrap();
        assert!(!removed.init_removed);
        assert_eq!(removed.fragment.absolute_position(), 1005.0);
        assert_eq!(store.first_fragment_position().unwrap(), 1010.0);
        // The new head has no predecessor
        assert!(store.first_fragment().unwrap().prev().is_none());

        let removed = store.remove_fragment().unwrap();
        assert!(!removed.init_removed);
        assert_eq!(removed.fragment.absolute_position(), 1010.0);
        assert_eq!(store.first_fragment_position().unwrap(), 1015.0);
    }

    #[test]
    fn test_remove_fragments_before_position() {
        let store = store_with_fragments(&[1005.0, 1010.0, 1015.0]);
        let removed = store.remove_fragments(MediaTime::from_secs_f64(1010.0));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].absolute_position(), 1005.0);
        assert_eq!(store.first_fragment_position().unwrap(), 1010.0);
        // Removal frontier: everything left is >= 1010.0
        assert!(!store.is_fragment_present(MediaTime::from_secs_f64(1005.0)));
    }

    #[test]
    fn test_remove_fragments_all() {
        let store = store_with_fragments(&[1005.0, 1010.0, 1015.0]);
        let removed = store.remove_fragments(MediaTime::from_secs_f64(2000.0));
        assert_eq!(removed.len(), 3);
        assert!(!store.is_fragment_present(MediaTime::from_secs_f64(1005.0)));
        assert_eq!(store.init_count(), 0);
    }

    #[test]
    fn test_remove_fragments_none() {
        let store = store_with_fragments(&[1005.0, 1010.0, 1015.0]);
        let removed = store.remove_fragments(MediaTime::from_secs_f64(1000.0));
        assert!(removed.is_empty());
        assert_eq!(store.first_fragment_position().unwrap(), 1005.0);
    }

    #[test]
    fn test_append_after_drain_starts_fresh_chain() {
        let store = store_with_fragments(&[1005.0, 1010.0]);
        store.remove_fragments(MediaTime::from_secs_f64(2000.0));
        store.add_init_fragment(
            "http://example.com/init2.mp4".to_string(),
            StreamInfo::default(),
            "p2".to_string(),
            MediaTime::from_secs_f64(1015.0),
            0,
        );
        assert!(store.add_fragment(write_at(1015.0, 5.0, "p2"), false));
        let first = store.first_fragment().unwrap();
        assert!(first.prev().is_none());
        assert!(first.next().is_none());
    }

    #[test]
    fn test_discontinuity_scan_forward() {
        let store = TsbStore::new(MediaType::Video);
        store.add_init_fragment(
            "http://example.com/init.mp4".to_string(),
            StreamInfo::default(),
            "p1".to_string(),
            MediaTime::from_secs_f64(1005.0),
            0,
        );
        store.add_fragment(write_at(1005.0, 5.0, "p1"), false);
        store.add_fragment(write_at(1010.0, 5.0, "p2"), true);
        store.add_fragment(write_at(1015.0, 5.0, "p2"), false);

        let f = store
            .next_discontinuity(MediaTime::from_secs_f64(1005.0), SearchDirection::Forward)
            .unwrap();
        assert_eq!(f.absolute_position(), 1010.0);
        let f = store
            .next_discontinuity(MediaTime::from_secs_f64(1010.0), SearchDirection::Forward)
            .unwrap();
        assert_eq!(f.absolute_position(), 1010.0);
        assert!(store
            .next_discontinuity(MediaTime::from_secs_f64(1011.0), SearchDirection::Forward)
            .is_none());
    }

    #[test]
    fn test_discontinuity_scan_backward() {
        let store = TsbStore::new(MediaType::Video);
        store.add_init_fragment(
            "http://example.com/init.mp4".to_string(),
            StreamInfo::default(),
            "p1".to_string(),
            MediaTime::from_secs_f64(1005.0),
            0,
        );
        store.add_fragment(write_at(1005.0, 5.0, "p1"), false);
        store.add_fragment(write_at(1010.0, 5.0, "p2"), true);
        store.add_fragment(write_at(1015.0, 5.0, "p2"), false);

        let f = store
            .next_discontinuity(MediaTime::from_secs_f64(1015.0), SearchDirection::Backward)
            .unwrap();
        assert_eq!(f.absolute_position(), 1010.0);
        let f = store
            .next_discontinuity(MediaTime::from_secs_f64(1010.0), SearchDirection::Backward)
            .unwrap();
        assert_eq!(f.absolute_position(), 1010.0);
        assert!(store
            .next_discontinuity(MediaTime::from_secs_f64(1009.0), SearchDirection::Backward)
            .is_none());
    }

    #[test]
    fn test_no_discontinuity_returns_none() {
        let store = store_with_fragments(&[1005.0, 1010.0, 1015.0]);
        assert!(store
            .next_discontinuity(MediaTime::from_secs_f64(1005.0), SearchDirection::Forward)
            .is_none());
    }

    #[test]
    fn test_is_fragment_present_bounds() {
        let store = store_with_fragments(&[1005.0, 1010.0, 1015.0]);
        assert!(store.is_fragment_present(MediaTime::from_secs_f64(1005.0)));
        assert!(store.is_fragment_present(MediaTime::from_secs_f64(1010.0)));
        assert!(store.is_fragment_present(MediaTime::from_secs_f64(1012.5)));
        assert!(store.is_fragment_present(MediaTime::from_secs_f64(1015.0)));
        assert!(!store.is_fragment_present(MediaTime::from_secs_f64(0.0)));
        assert!(!store.is_fragment_present(MediaTime::from_secs_f64(1020.0)));
    }

    #[test]
    fn test_flush_clears_everything() {
        let store = store_with_fragments(&[1005.0, 1010.0]);
        store.flush();
        assert!(store.is_empty());
        assert_eq!(store.init_count(), 0);
        assert!(store.first_fragment().is_none());
        // A fragment after flush needs a fresh init header first
        assert!(!store.add_fragment(write_at(1015.0, 5.0, "p1"), false));
    }

    #[test]
    fn test_overwrite_existing_position_replaces() {
        let store = store_with_fragments(&[1005.0]);
        assert!(store.add_fragment(write_at(1005.0, 5.0, "p1"), false));
        assert_eq!(store.len(), 1);
    }
}
