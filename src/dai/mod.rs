//! Client-side dynamic ad insertion (CDAI) for DASH.
//!
//! [`manager::AdManager`] owns the adbreak catalog and the period-to-ad
//! placement map, resolves ad manifests on a worker task, and runs the
//! five-state machine that drives transitions between source and ad
//! content as playback events arrive.

pub mod events;
pub mod fulfill;
pub mod manager;

use std::collections::BTreeMap;
use std::sync::Arc;

use dash_mpd::MPD;
use serde::Serialize;

use crate::time::MediaTime;

/// Slack allowed when comparing cumulative ad duration to cumulative
/// period duration; declared durations in source manifests drift slightly.
pub const OFFSET_ALIGN_FACTOR_MS: u64 = 2000;

/// States of the CDAI state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdState {
    OutsideAdbreak,
    OutsideAdbreakWait4Ads,
    InAdbreakAdPlaying,
    InAdbreakAdNotPlaying,
    InAdbreakWait2Catchup,
}

impl AdState {
    pub fn name(&self) -> &'static str {
        match self {
            AdState::OutsideAdbreak => "outside_adbreak",
            AdState::OutsideAdbreakWait4Ads => "outside_adbreak_wait4ads",
            AdState::InAdbreakAdPlaying => "in_adbreak_ad_playing",
            AdState::InAdbreakAdNotPlaying => "in_adbreak_ad_not_playing",
            AdState::InAdbreakWait2Catchup => "in_adbreak_wait2catchup",
        }
    }

    pub fn is_in_adbreak(&self) -> bool {
        matches!(
            self,
            AdState::InAdbreakAdPlaying
                | AdState::InAdbreakAdNotPlaying
                | AdState::InAdbreakWait2Catchup
        )
    }
}

impl std::fmt::Display for AdState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Playback events driving the ad state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdEvent {
    /// Playback initialization
    Init,
    /// Base period's offset changed
    BaseOffsetChange,
    /// Ad playback finished
    AdFinished,
    /// Ad playback failed
    AdFailed,
    /// Period changed
    PeriodChange,
}

impl AdEvent {
    pub const DEFAULT: AdEvent = AdEvent::PeriodChange;
}

/// One individual ad within an adbreak.
#[derive(Clone)]
pub struct AdNode {
    /// Resolution or playback failed; skipped at placement boundaries
    pub invalid: bool,
    /// Fully laid over the underlying period(s)
    pub placed: bool,
    /// Fulfillment finished (successfully or not)
    pub resolved: bool,
    pub ad_id: String,
    /// Source manifest URL of the ad
    pub url: String,
    /// Duration in milliseconds, taken from the resolved manifest
    pub duration_ms: u64,
    /// Period the ad starts on
    pub base_period_id: String,
    /// Offset into the base period where the ad starts, in milliseconds
    pub base_period_offset_ms: u64,
    /// Parsed ad manifest, opaque to the core
    pub mpd: Option<Arc<MPD>>,
}

impl AdNode {
    pub fn new(
        ad_id: impl Into<String>,
        url: impl Into<String>,
        base_period_id: impl Into<String>,
    ) -> Self {
        Self {
            invalid: false,
            placed: false,
            resolved: false,
            ad_id: ad_id.into(),
            url: url.into(),
            duration_ms: 0,
            base_period_id: base_period_id.into(),
            base_period_offset_ms: 0,
            mpd: None,
        }
    }
}

impl std::fmt::Debug for AdNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdNode")
            .field("ad_id", &self.ad_id)
            .field("url", &self.url)
            .field("duration_ms", &self.duration_ms)
            .field("invalid", &self.invalid)
            .field("placed", &self.placed)
            .field("resolved", &self.resolved)
            .field("base_period_id", &self.base_period_id)
            .field("base_period_offset_ms", &self.base_period_offset_ms)
            .field("has_mpd", &self.mpd.is_some())
            .finish()
    }
}

/// A contiguous ad opportunity pinned to a source period.
///
/// Created when a new SCTE-style opportunity is discovered; lives until
/// session teardown.
#[derive(Debug, Clone)]
pub struct AdBreak {
    /// Declared total duration in milliseconds
    pub break_duration_ms: u64,
    /// Ads in play order
    pub ads: Vec<AdNode>,
    /// Period where playback resumes after the break
    pub end_period_id: String,
    /// Offset into the resume period, in milliseconds
    pub end_period_offset_ms: u64,
    /// Observed placed ad duration in milliseconds
    pub ads_duration_ms: u64,
    /// The break is completely laid out over source periods
    pub placed: bool,
    /// An ad in this break failed during playback
    pub ad_failed: bool,
    /// The break's ads span more than one source period
    pub split_period: bool,
    /// No usable ads; playback falls through to source content
    pub invalid: bool,
    /// Absolute start time of the break
    pub absolute_start: MediaTime,
}

impl AdBreak {
    pub fn new(break_duration_ms: u64, absolute_start: MediaTime) -> Self {
        Self {
            break_duration_ms,
            ads: Vec::new(),
            end_period_id: String::new(),
            end_period_offset_ms: 0,
            ads_duration_ms: 0,
            placed: false,
            ad_failed: false,
            split_period: false,
            invalid: false,
            absolute_start,
        }
    }

    pub fn has_resolved_ad(&self) -> bool {
        self.ads.iter().any(|ad| ad.resolved && !ad.invalid)
    }

    pub fn all_ads_invalid(&self) -> bool {
        !self.ads.is_empty() && self.ads.iter().all(|ad| ad.invalid)
    }
}

/// Which ad occupies a given offset of a source period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdOnPeriod {
    /// Index into the adbreak's ad list
    pub ad_idx: usize,
    /// How far into that ad playback is at this period offset, in
    /// milliseconds
    pub ad_start_offset_ms: u64,
}

/// Placement metadata of one known source period.
#[derive(Debug, Clone, Default)]
pub struct Period2AdData {
    /// Every millisecond of this period is accounted for by an ad
    pub filled: bool,
    /// Adbreak this period belongs to, empty if none
    pub ad_break_id: String,
    /// Period duration in milliseconds
    pub duration_ms: u64,
    /// Period offset in milliseconds to the ad occupying it
    pub offset_to_ad: BTreeMap<u64, AdOnPeriod>,
}

/// Work item for the fulfillment queue: fetch and resolve one ad manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdFulfillRequest {
    pub period_id: String,
    pub ad_id: String,
    pub url: String,
}

/// Progress of laying one adbreak over the source periods.
#[derive(Debug, Clone)]
pub struct PlacementCursor {
    /// The one adbreak pending placement
    pub pending_break_id: String,
    /// Source period currently being consumed
    pub open_period_id: String,
    /// Ad currently being placed
    pub cur_ad_idx: usize,
    /// Milliseconds of the current ad already attributed
    pub ad_next_offset_ms: u64,
    /// Position inside the open period
    pub period_offset_ms: u64,
    /// Placement ran out of source periods and resumes on the next
    /// manifest
    pub wait_for_next_period: bool,
}

/// A source-manifest period in play order, as seen at re-index time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePeriod {
    pub id: String,
    pub duration_ms: u64,
}

impl SourcePeriod {
    pub fn new(id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            id: id.into(),
            duration_ms,
        }
    }
}
