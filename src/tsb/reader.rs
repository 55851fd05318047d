use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, trace, warn};

use super::store::TsbStore;
use super::{MediaType, TsbFragmentData, TsbInitData};
use crate::error::{DvrError, Result};
use crate::time::MediaTime;

/// Playback rate of plain real-time playback. Anything else is trick play.
pub const NORMAL_PLAY_RATE: f32 = 1.0;

/// How the playback session that created this reader was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TuneType {
    #[default]
    New,
    Seek,
    SeekToLive,
}

struct ReaderState {
    initialized: bool,
    rate: f32,
    tune_type: TuneType,
    start_position: MediaTime,
    /// Anchor of the next fetch
    upcoming_position: MediaTime,
    /// Latched once the fragment chosen at init time has been consumed.
    /// Position equality cannot stand in for this: reverse playback at the
    /// cache head leaves the upcoming anchor equal to the start position.
    first_download_done: bool,
    current_fragment: Option<Arc<TsbFragmentData>>,
    last_init_data: Option<Arc<TsbInitData>>,
    first_pts: MediaTime,
    first_pts_offset: MediaTime,
    period_boundary: bool,
    next_fragment_discontinuous: bool,
    eos: bool,
    track_enabled: bool,
    /// Position beyond which trick play (rate > 1) reports EOS; maintained
    /// by the owning player.
    trick_mode_position_eos: MediaTime,
}

impl Default for ReaderState {
    fn default() -> Self {
        Self {
            initialized: false,
            rate: NORMAL_PLAY_RATE,
            tune_type: TuneType::default(),
            start_position: MediaTime::ZERO,
            upcoming_position: MediaTime::ZERO,
            first_download_done: false,
            current_fragment: None,
            last_init_data: None,
            first_pts: MediaTime::ZERO,
            first_pts_offset: MediaTime::ZERO,
            period_boundary: false,
            next_fragment_discontinuous: false,
            eos: false,
            track_enabled: false,
            trick_mode_position_eos: MediaTime::ZERO,
        }
    }
}

/// Position-, rate- and period-aware cursor over one media type's TSB
/// index, advanced by the injector.
///
/// `init` picks the starting fragment for a requested position;
/// `find_next`/`read_next` then walk the index in rate direction, tracking
/// EOS, period boundaries and PTS discontinuities as they pass. Apart from
/// `init`, nothing here is fallible from the caller's point of view: a
/// missing fragment is `None`, exhaustion is EOS, and a track that cannot
/// play is disabled.
pub struct TsbReader {
    store: Arc<TsbStore>,
    session_id: String,
    state: Mutex<ReaderState>,
    end_injected: Mutex<bool>,
    end_injected_cv: Condvar,
}

impl TsbReader {
    pub fn new(store: Arc<TsbStore>, session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        info!(
            "[{}] Creating TSB reader for session {}",
            store.media_type(),
            session_id
        );
        Self {
            store,
            session_id,
            state: Mutex::new(ReaderState::default()),
            end_injected: Mutex::new(false),
            end_injected_cv: Condvar::new(),
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.store.media_type()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Position the reader.
    ///
    /// `start_pos_sec` carries the requested absolute position in and the
    /// selected fragment's position out. Positions beyond the cached range
    /// are clamped to the newest fragment. For non-video readers, `other`
    /// (the video reader) triggers the backward alignment walk so that
    /// audio/subtitle never start later in PTS than video. An empty index
    /// succeeds with the track disabled and the position untouched. The
    /// rate is recorded even on failure paths, because callers read it back
    /// during error handling.
    pub fn init(
        &self,
        start_pos_sec: &mut f64,
        rate: f32,
        tune_type: TuneType,
        other: Option<&TsbReader>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.initialized {
            return Ok(());
        }
        state.rate = rate;
        state.tune_type = tune_type;
        info!(
            "[{}] Init with rate {} start {:.2}s",
            self.media_type(),
            rate,
            start_pos_sec
        );

        if *start_pos_sec < 0.0 {
            error!(
                "[{}] Negative position requested {:.2}s",
                self.media_type(),
                start_pos_sec
            );
            return Err(DvrError::SeekRange(*start_pos_sec));
        }

        let (Some(first), Some(last)) = (self.store.first_fragment(), self.store.last_fragment())
        else {
            warn!(
                "[{}] TSB is empty, disabling track (rate stays {})",
                self.media_type(),
                rate
            );
            state.track_enabled = false;
            return Ok(());
        };

        let mut requested = *start_pos_sec;
        if last.absolute_position() < requested {
            warn!(
                "[{}] Seeking to the TSB end {:.2}s (requested {:.2}s), range ({:.2}s-{:.2}s)",
                self.media_type(),
                last.absolute_position().as_secs_f64(),
                requested,
                first.absolute_position().as_secs_f64(),
                last.absolute_position().as_secs_f64()
            );
            requested = last.absolute_position().as_secs_f64();
        }

        let Some(mut chosen) = self
            .store
            .nearest_fragment(MediaTime::from_secs_f64(requested))
        else {
            // Raced with a flush; behave like the empty-index case
            warn!("[{}] Index drained during init", self.media_type());
            state.track_enabled = false;
            return Ok(());
        };

        if self.media_type() != MediaType::Video {
            if let Some(video) = other.filter(|o| o.media_type() == MediaType::Video) {
                // Walk back until this track's PTS no longer exceeds the
                // video start, stopping at the period boundary or the head.
                let video_pts = video.first_pts_time();
                while chosen.pts() > video_pts {
                    let Some(prev) = chosen.prev() else { break };
                    if prev.period_id() != chosen.period_id() {
                        break;
                    }
                    chosen = prev;
                }
            }
        }

        state.start_position = chosen.absolute_position();
        state.upcoming_position = state.start_position;
        state.first_pts = chosen.pts();
        state.first_pts_offset = chosen.pts_offset();
        state.current_fragment = Some(Arc::clone(&chosen));
        // Trick play runs on the video track alone
        state.track_enabled = !(rate != NORMAL_PLAY_RATE && self.media_type() != MediaType::Video);
        state.initialized = true;
        *start_pos_sec = chosen.absolute_position().as_secs_f64();
        info!(
            "[{}] start {:.2}s rate {} pts {:.2}s ptsOffset {:.2}s range ({:.2}s-{:.2}s)",
            self.media_type(),
            state.start_position.as_secs_f64(),
            rate,
            state.first_pts.as_secs_f64(),
            state.first_pts_offset.as_secs_f64(),
            first.absolute_position().as_secs_f64(),
            last.absolute_position().as_secs_f64()
        );
        Ok(())
    }

    /// Next fragment in the playback direction, without consuming it.
    ///
    /// Until the first `read_next`, returns the fragment chosen at init
    /// time. A `None` at reverse or slow rates latches EOS; at forward
    /// rates it merely means the cache has no more data yet.
    pub fn find_next(&self) -> Option<Arc<TsbFragmentData>> {
        let mut state = self.state.lock();
        if !state.initialized {
            error!("[{}] Reader not initialized", self.media_type());
            return None;
        }
        let found = if !state.first_download_done {
            state.current_fragment.clone()
        } else if let Some(current) = &state.current_fragment {
            if state.rate < 0.0 {
                current.prev()
            } else {
                current.next()
            }
        } else {
            None
        };
        match &found {
            Some(fragment) => trace!(
                "[{}] Next fragment: position {:.2}s pts {:.2}s period {}",
                self.media_type(),
                fragment.absolute_position().as_secs_f64(),
                fragment.pts().as_secs_f64(),
                fragment.period_id()
            ),
            None => {
                info!(
                    "[{}] No next fragment available at rate {}",
                    self.media_type(),
                    state.rate
                );
                if state.rate < NORMAL_PLAY_RATE {
                    state.eos = true;
                }
            }
        }
        found
    }

    /// Consume a fragment previously returned by `find_next`, updating the
    /// cursor, EOS, discontinuity and period-boundary state. `None` marks
    /// end of stream.
    pub fn read_next(&self, fragment: Option<Arc<TsbFragmentData>>) {
        let mut state = self.state.lock();
        let Some(fragment) = fragment else {
            info!("[{}] Null fragment read, setting EOS", self.media_type());
            state.eos = true;
            return;
        };

        let first_download = !state.first_download_done;
        state.first_download_done = true;
        state.current_fragment = Some(Arc::clone(&fragment));

        if state.rate > NORMAL_PLAY_RATE {
            state.eos = fragment.absolute_position() >= state.trick_mode_position_eos;
        } else if state.rate < 0.0 {
            state.eos = fragment.prev().is_none();
        } else {
            state.eos = fragment.next().is_none();
        }

        // Forward iteration reports the marker of the consumed fragment.
        // Reverse iteration reports the successor's marker, since walking
        // backward the boundary belongs to the next fragment in timeline
        // direction.
        if state.rate >= 0.0 {
            state.next_fragment_discontinuous = fragment.is_discontinuous();
        } else {
            state.next_fragment_discontinuous =
                fragment.next().is_some_and(|n| n.is_discontinuous());
        }

        if !first_download {
            Self::check_period_boundary(&mut state, &fragment);
        }
        state.last_init_data = Some(fragment.init_data());

        state.upcoming_position = if state.rate >= 0.0 {
            match fragment.next() {
                Some(next) => next.absolute_position(),
                None => fragment.absolute_position() + fragment.duration(),
            }
        } else {
            // Once prev runs out we are at the very first cached fragment;
            // fragments are never added at the front, so the position pins
            // there.
            match fragment.prev() {
                Some(prev) => prev.absolute_position(),
                None => fragment.absolute_position(),
            }
        };

        trace!(
            "[{}] Consumed {:.2}s upcoming {:.2}s eos {} disc {} boundary {} rate {}",
            self.media_type(),
            fragment.absolute_position().as_secs_f64(),
            state.upcoming_position.as_secs_f64(),
            state.eos,
            state.next_fragment_discontinuous,
            state.period_boundary,
            state.rate
        );
    }

    /// Detect a period change against the last consumed fragment and, at
    /// normal rate, rebase the first-PTS reference when the timelines do
    /// not join up.
    fn check_period_boundary(state: &mut ReaderState, fragment: &Arc<TsbFragmentData>) {
        state.period_boundary = false;
        let Some(last_init) = &state.last_init_data else {
            return;
        };
        let init = fragment.init_data();
        if last_init.period_id() != init.period_id() {
            state.period_boundary = true;
        }
        // Trick-play boundaries keep the old PTS reference
        if state.period_boundary && state.rate == NORMAL_PLAY_RATE {
            if let Some(adjacent) = fragment.prev() {
                let expected = adjacent.pts() + adjacent.duration();
                if expected != fragment.pts() {
                    state.first_pts = fragment.pts();
                    state.first_pts_offset = fragment.pts_offset();
                    info!(
                        "PTS discontinuity at period boundary, rebasing to pts {:.2}s offset {:.2}s",
                        state.first_pts.as_secs_f64(),
                        state.first_pts_offset.as_secs_f64()
                    );
                }
            }
        }
    }

    /// Reset the reader to its defaults.
    pub fn term(&self) {
        *self.state.lock() = ReaderState::default();
        *self.end_injected.lock() = false;
        info!("[{}] Reader terminated", self.media_type());
    }

    pub fn is_eos(&self) -> bool {
        self.state.lock().eos
    }

    pub fn reset_eos(&self) {
        self.state.lock().eos = false;
    }

    /// True until the fragment chosen at init time has been consumed.
    pub fn is_first_download(&self) -> bool {
        !self.state.lock().first_download_done
    }

    pub fn track_enabled(&self) -> bool {
        let state = self.state.lock();
        !state.eos && state.track_enabled
    }

    pub fn playback_rate(&self) -> f32 {
        self.state.lock().rate
    }

    pub fn tune_type(&self) -> TuneType {
        self.state.lock().tune_type
    }

    /// First PTS of the current reader timeline, in seconds.
    pub fn first_pts(&self) -> f64 {
        self.state.lock().first_pts.as_secs_f64()
    }

    pub(crate) fn first_pts_time(&self) -> MediaTime {
        self.state.lock().first_pts
    }

    pub fn first_pts_offset(&self) -> MediaTime {
        self.state.lock().first_pts_offset
    }

    pub fn start_position(&self) -> MediaTime {
        self.state.lock().start_position
    }

    /// Discontinuity of the fragment consumed last (timeline direction)
    pub fn is_discontinuous(&self) -> bool {
        self.state.lock().next_fragment_discontinuous
    }

    pub fn is_period_boundary(&self) -> bool {
        self.state.lock().period_boundary
    }

    /// Position at which trick play (rate > 1) reports EOS.
    pub fn set_trick_mode_position_eos(&self, position_sec: f64) {
        self.state.lock().trick_mode_position_eos = MediaTime::from_secs_f64(position_sec);
    }

    /// Block until the injector reports the end fragment injected.
    pub fn check_for_wait_if_reader_done(&self) {
        let mut injected = self.end_injected.lock();
        if !*injected {
            info!(
                "[{}] Waiting for last fragment injection",
                self.media_type()
            );
            while !*injected {
                self.end_injected_cv.wait(&mut injected);
            }
        }
        info!("[{}] Reader done", self.media_type());
    }

    /// Force the end-of-injection handshake through.
    pub fn abort_check_for_wait_if_reader_done(&self) {
        let mut injected = self.end_injected.lock();
        if !*injected {
            *injected = true;
            self.end_injected_cv.notify_all();
        }
    }

    pub fn is_end_fragment_injected(&self) -> bool {
        *self.end_injected.lock()
    }

    pub fn set_end_fragment_injected(&self) {
        let mut injected = self.end_injected.lock();
        *injected = true;
        self.end_injected_cv.notify_all();
    }
}
