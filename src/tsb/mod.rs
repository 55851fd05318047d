//! Time-shift buffer: on-disk cache index of fetched media fragments.
//!
//! The cached bytes themselves live in an external blob store addressed by
//! URL; this module owns the authoritative index over them. [`store::TsbStore`]
//! is the per-media-type index, [`reader::TsbReader`] walks one index on
//! behalf of the injector, and [`session::TsbSession`] groups the stores of
//! one playback session.

pub mod reader;
pub mod session;
pub mod store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

use crate::time::MediaTime;

/// Media track kind of a cached segment, including the init-header variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MediaType {
    Video,
    Audio,
    Subtitle,
    AuxAudio,
    InitVideo,
    InitAudio,
    InitSubtitle,
    InitAuxAudio,
}

impl MediaType {
    pub fn is_init(&self) -> bool {
        matches!(
            self,
            MediaType::InitVideo
                | MediaType::InitAudio
                | MediaType::InitSubtitle
                | MediaType::InitAuxAudio
        )
    }

    /// The init-header tag corresponding to this track.
    pub fn init_variant(&self) -> MediaType {
        match self {
            MediaType::Video | MediaType::InitVideo => MediaType::InitVideo,
            MediaType::Audio | MediaType::InitAudio => MediaType::InitAudio,
            MediaType::Subtitle | MediaType::InitSubtitle => MediaType::InitSubtitle,
            MediaType::AuxAudio | MediaType::InitAuxAudio => MediaType::InitAuxAudio,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Subtitle => "subtitle",
            MediaType::AuxAudio => "aux-audio",
            MediaType::InitVideo => "init-video",
            MediaType::InitAudio => "init-audio",
            MediaType::InitSubtitle => "init-subtitle",
            MediaType::InitAuxAudio => "init-aux-audio",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Stream properties of the representation an init header belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamInfo {
    /// Bandwidth in bits per second
    pub bandwidth_bps: u64,
    /// Resolution width in pixels
    pub width: u32,
    /// Resolution height in pixels
    pub height: u32,
    /// Frames per second
    pub framerate: f64,
}

/// Init header (codec configuration) shared by the media fragments of one
/// representation.
///
/// Holds a refcount of the media fragments currently referencing it; the
/// store drops the header from its init list the moment that count returns
/// to zero. The count is only a tally, never a back pointer, so the
/// fragment↔init graph stays acyclic.
#[derive(Debug)]
pub struct TsbInitData {
    url: String,
    media_type: MediaType,
    absolute_position: MediaTime,
    period_id: String,
    stream_info: StreamInfo,
    profile_index: u32,
    users: AtomicU64,
}

impl TsbInitData {
    pub(crate) fn new(
        url: String,
        media_type: MediaType,
        absolute_position: MediaTime,
        period_id: String,
        stream_info: StreamInfo,
        profile_index: u32,
    ) -> Self {
        Self {
            url,
            media_type,
            absolute_position,
            period_id,
            stream_info,
            profile_index,
            users: AtomicU64::new(0),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn absolute_position(&self) -> MediaTime {
        self.absolute_position
    }

    pub fn period_id(&self) -> &str {
        &self.period_id
    }

    pub fn stream_info(&self) -> &StreamInfo {
        &self.stream_info
    }

    pub fn bandwidth(&self) -> u64 {
        self.stream_info.bandwidth_bps
    }

    pub fn profile_index(&self) -> u32 {
        self.profile_index
    }

    /// Number of media fragments currently referencing this header.
    pub fn users(&self) -> u64 {
        self.users.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_users(&self) {
        self.users.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the count remaining after the decrement.
    pub(crate) fn decrement_users(&self) -> u64 {
        self.users.fetch_sub(1, Ordering::Relaxed) - 1
    }
}

#[derive(Default)]
struct FragmentLinks {
    next: Weak<TsbFragmentData>,
    prev: Weak<TsbFragmentData>,
}

/// One cached media fragment.
///
/// Immutable after insertion apart from the neighbour links, which the
/// store maintains in position-ascending insertion order. Links are weak in
/// both directions; the index map holds the strong references.
pub struct TsbFragmentData {
    url: String,
    media_type: MediaType,
    absolute_position: MediaTime,
    period_id: String,
    duration: MediaTime,
    /// PTS in seconds before the PTS offset is applied
    pts: MediaTime,
    discontinuous: bool,
    timescale: u32,
    pts_offset: MediaTime,
    init_data: Arc<TsbInitData>,
    links: Mutex<FragmentLinks>,
}

impl TsbFragmentData {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        url: String,
        media_type: MediaType,
        absolute_position: MediaTime,
        duration: MediaTime,
        pts: MediaTime,
        discontinuous: bool,
        period_id: String,
        init_data: Arc<TsbInitData>,
        timescale: u32,
        pts_offset: MediaTime,
    ) -> Self {
        Self {
            url,
            media_type,
            absolute_position,
            period_id,
            duration,
            pts,
            discontinuous,
            timescale,
            pts_offset,
            init_data,
            links: Mutex::new(FragmentLinks::default()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn absolute_position(&self) -> MediaTime {
        self.absolute_position
    }

    pub fn period_id(&self) -> &str {
        &self.period_id
    }

    pub fn duration(&self) -> MediaTime {
        self.duration
    }

    pub fn pts(&self) -> MediaTime {
        self.pts
    }

    pub fn is_discontinuous(&self) -> bool {
        self.discontinuous
    }

    pub fn timescale(&self) -> u32 {
        self.timescale
    }

    pub fn pts_offset(&self) -> MediaTime {
        self.pts_offset
    }

    pub fn init_data(&self) -> Arc<TsbInitData> {
        Arc::clone(&self.init_data)
    }

    /// Next fragment in position order, if it is still cached.
    pub fn next(&self) -> Option<Arc<TsbFragmentData>> {
        self.links.lock().next.upgrade()
    }

    /// Previous fragment in position order, if it is still cached.
    pub fn prev(&self) -> Option<Arc<TsbFragmentData>> {
        self.links.lock().prev.upgrade()
    }

    pub(crate) fn set_next(&self, next: &Arc<TsbFragmentData>) {
        self.links.lock().next = Arc::downgrade(next);
    }

    pub(crate) fn set_prev(&self, prev: &Arc<TsbFragmentData>) {
        self.links.lock().prev = Arc::downgrade(prev);
    }

    pub(crate) fn clear_prev(&self) {
        self.links.lock().prev = Weak::new();
    }
}

impl std::fmt::Debug for TsbFragmentData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsbFragmentData")
            .field("url", &self.url)
            .field("media_type", &self.media_type)
            .field("absolute_position", &self.absolute_position.as_secs_f64())
            .field("duration", &self.duration.as_secs_f64())
            .field("pts", &self.pts.as_secs_f64())
            .field("discontinuous", &self.discontinuous)
            .field("period_id", &self.period_id)
            .finish_non_exhaustive()
    }
}

/// Payload of one media-fragment write from the fetch loop.
#[derive(Debug, Clone)]
pub struct TsbWriteData {
    pub url: String,
    /// Absolute position in seconds since the Unix epoch
    pub absolute_position: MediaTime,
    pub duration: MediaTime,
    /// PTS in seconds before the PTS offset is applied
    pub pts: MediaTime,
    pub period_id: String,
    pub timescale: u32,
    pub pts_offset: MediaTime,
}
