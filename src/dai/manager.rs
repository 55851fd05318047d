use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::events::{
    AdEventSink, AdPlacementEvent, AdPlacementEventKind, AdReservationEvent,
    AdReservationEventKind,
};
use super::fulfill::{AdManifestFetcher, parse_ad_manifest};
use super::{
    AdBreak, AdEvent, AdFulfillRequest, AdNode, AdOnPeriod, AdState, OFFSET_ALIGN_FACTOR_MS,
    Period2AdData, PlacementCursor, SourcePeriod,
};
use crate::config::Config;
use crate::metrics;
use crate::time::MediaTime;
use crate::tsb::reader::NORMAL_PLAY_RATE;

/// Where playback lands when the current source-period position falls
/// inside a placed ad.
#[derive(Debug, Clone, PartialEq)]
pub struct AdStart {
    pub break_id: String,
    pub ad_idx: usize,
    /// Offset into the ad's own timeline, in seconds
    pub ad_offset_sec: f64,
}

enum FulfillCmd {
    Fulfill(AdFulfillRequest),
    Exit,
}

enum SinkEvent {
    Reservation(AdReservationEvent),
    Placement(AdPlacementEvent),
}

enum PlacementOutcome {
    /// The adbreak is fully laid out
    Completed,
    /// Ran out of source periods; resume on the next manifest
    WaitingForPeriods,
    /// The current ad is not resolved yet
    WaitingForResolve,
}

struct DaiState {
    ad_breaks: HashMap<String, AdBreak>,
    period_map: HashMap<String, Period2AdData>,
    state: AdState,
    rate: f32,
    base_period_id: String,
    base_period_offset_ms: u64,
    cur_playing_break_id: String,
    cur_ad_idx: Option<usize>,
    placement: Option<PlacementCursor>,
    pending_placements: Vec<PlacementCursor>,
    /// Where to seek in source content when leaving an adbreak
    content_seek_offset_sec: f64,
}

impl Default for DaiState {
    fn default() -> Self {
        Self {
            ad_breaks: HashMap::new(),
            period_map: HashMap::new(),
            state: AdState::OutsideAdbreak,
            rate: NORMAL_PLAY_RATE,
            base_period_id: String::new(),
            base_period_offset_ms: 0,
            cur_playing_break_id: String::new(),
            cur_ad_idx: None,
            placement: None,
            pending_placements: Vec::new(),
            content_seek_offset_sec: 0.0,
        }
    }
}

/// Client-side DAI manager: adbreak catalog, period-to-ad placement map,
/// fulfillment worker and the five-state playback machine.
///
/// One instance per player; inject it where needed rather than sharing
/// process-wide state. All table and state mutations serialize on one
/// internal lock; events reach the sink after the lock is released, in
/// emission order.
pub struct AdManager {
    inner: Mutex<DaiState>,
    sink: Arc<dyn AdEventSink>,
    fetcher: Arc<dyn AdManifestFetcher>,
    fulfill_tx: UnboundedSender<FulfillCmd>,
    fulfill_rx: Mutex<Option<mpsc::UnboundedReceiver<FulfillCmd>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    exit_fulfill_loop: AtomicBool,
    /// Signalled on every resolution outcome and placement progression
    resolved_notify: Notify,
    wait_aborted: AtomicBool,
    default_resolve_timeout_ms: u64,
}

impl AdManager {
    pub fn new(sink: Arc<dyn AdEventSink>, fetcher: Arc<dyn AdManifestFetcher>) -> Self {
        Self::with_config(sink, fetcher, &Config::default())
    }

    pub fn with_config(
        sink: Arc<dyn AdEventSink>,
        fetcher: Arc<dyn AdManifestFetcher>,
        config: &Config,
    ) -> Self {
        let (fulfill_tx, fulfill_rx) = mpsc::unbounded_channel();
        Self {
            inner: Mutex::new(DaiState::default()),
            sink,
            fetcher,
            fulfill_tx,
            fulfill_rx: Mutex::new(Some(fulfill_rx)),
            worker: Mutex::new(None),
            exit_fulfill_loop: AtomicBool::new(false),
            resolved_notify: Notify::new(),
            wait_aborted: AtomicBool::new(false),
            default_resolve_timeout_ms: config.ad_resolve_timeout_ms,
        }
    }

    // ── Catalog upkeep ──────────────────────────────────────────────────

    /// Open or update the adbreak at `period_id` and queue fulfillment for
    /// the ad. Repeated calls with the same ad id are idempotent. An empty
    /// ad id announces the opportunity without registering an ad.
    pub fn set_alternate_contents(
        &self,
        period_id: &str,
        ad_id: &str,
        url: &str,
        start_ms: u64,
        break_duration_ms: u64,
    ) {
        let mut st = self.inner.lock();
        let brk = st
            .ad_breaks
            .entry(period_id.to_string())
            .or_insert_with(|| {
                info!(
                    "Opening adbreak at period {} with duration {}ms",
                    period_id, break_duration_ms
                );
                AdBreak::new(
                    break_duration_ms,
                    MediaTime::from_secs_f64(start_ms as f64 / 1000.0),
                )
            });
        if break_duration_ms > 0 {
            brk.break_duration_ms = break_duration_ms;
        }
        if ad_id.is_empty() || url.is_empty() {
            return;
        }
        if brk.ads.iter().any(|ad| ad.ad_id == ad_id) {
            debug!("Ad {} already registered on adbreak {}", ad_id, period_id);
            return;
        }
        info!("Registering ad {} on adbreak {}", ad_id, period_id);
        brk.ads.push(AdNode::new(ad_id, url, period_id));
        st.period_map
            .entry(period_id.to_string())
            .or_default()
            .ad_break_id = period_id.to_string();
        drop(st);

        let request = AdFulfillRequest {
            period_id: period_id.to_string(),
            ad_id: ad_id.to_string(),
            url: url.to_string(),
        };
        if self.fulfill_tx.send(FulfillCmd::Fulfill(request)).is_err() {
            warn!("Fulfillment queue closed; ad {} will stay unresolved", ad_id);
        }
    }

    /// Record a source period seen at manifest re-index time.
    pub fn insert_period(&self, period: &SourcePeriod) {
        let mut st = self.inner.lock();
        let entry = st.period_map.entry(period.id.clone()).or_default();
        entry.duration_ms = period.duration_ms;
    }

    /// Drop period entries no longer named by the manifest, keeping those
    /// belonging to a known adbreak.
    pub fn prune_period_maps(&self, new_period_ids: &[String]) {
        let mut st = self.inner.lock();
        let DaiState {
            ad_breaks,
            period_map,
            ..
        } = &mut *st;
        period_map.retain(|id, data| {
            new_period_ids.iter().any(|p| p == id)
                || (!data.ad_break_id.is_empty() && ad_breaks.contains_key(&data.ad_break_id))
        });
    }

    pub fn is_period_exist(&self, period_id: &str) -> bool {
        self.inner.lock().period_map.contains_key(period_id)
    }

    pub fn is_ad_break_exist(&self, break_id: &str) -> bool {
        self.inner.lock().ad_breaks.contains_key(break_id)
    }

    pub fn is_period_in_adbreak(&self, period_id: &str) -> bool {
        self.inner
            .lock()
            .period_map
            .get(period_id)
            .is_some_and(|data| !data.ad_break_id.is_empty())
    }

    /// True when the period anchors an adbreak with at least one ad.
    pub fn has_dai_ad(&self, period_id: &str) -> bool {
        self.inner
            .lock()
            .ad_breaks
            .get(period_id)
            .is_some_and(|brk| !brk.ads.is_empty())
    }

    /// Milliseconds of ad content left in the break from the given ad and
    /// start offset, skipping invalid ads.
    pub fn remaining_ad_duration_ms(
        &self,
        break_id: &str,
        ad_idx: usize,
        start_offset_ms: u64,
    ) -> u64 {
        let st = self.inner.lock();
        let Some(brk) = st.ad_breaks.get(break_id) else {
            return 0;
        };
        let mut remaining = 0;
        for (idx, ad) in brk.ads.iter().enumerate().skip(ad_idx) {
            if ad.invalid {
                continue;
            }
            remaining += ad.duration_ms;
            if idx == ad_idx {
                remaining = remaining.saturating_sub(start_offset_ms);
            }
        }
        remaining
    }

    // ── Playback position ───────────────────────────────────────────────

    /// Update the current source-period position the state machine judges
    /// against.
    pub fn set_base_period(&self, period_id: &str, offset_ms: u64) {
        let mut st = self.inner.lock();
        trace!("Base period {} offset {}ms", period_id, offset_ms);
        st.base_period_id = period_id.to_string();
        st.base_period_offset_ms = offset_ms;
    }

    pub fn set_playback_rate(&self, rate: f32) {
        self.inner.lock().rate = rate;
    }

    pub fn ad_state(&self) -> AdState {
        self.inner.lock().state
    }

    /// Offset to seek to in source content when exiting an adbreak.
    pub fn content_seek_offset_sec(&self) -> f64 {
        self.inner.lock().content_seek_offset_sec
    }

    pub fn current_break_id(&self) -> Option<String> {
        let st = self.inner.lock();
        (!st.cur_playing_break_id.is_empty()).then(|| st.cur_playing_break_id.clone())
    }

    pub fn current_ad_index(&self) -> Option<usize> {
        self.inner.lock().cur_ad_idx
    }

    /// Snapshot of one adbreak's catalog entry.
    pub fn ad_break(&self, break_id: &str) -> Option<AdBreak> {
        self.inner.lock().ad_breaks.get(break_id).cloned()
    }

    /// Snapshot of one period's placement map.
    pub fn period_ad_data(&self, period_id: &str) -> Option<Period2AdData> {
        self.inner.lock().period_map.get(period_id).cloned()
    }

    // ── Ad selection ────────────────────────────────────────────────────

    /// Whether the given source-period position falls inside a placed ad.
    /// Trick-play transitions are suppressed unless `init` marks an
    /// initial tune.
    pub fn check_for_ad_start(
        &self,
        rate: f32,
        init: bool,
        period_id: &str,
        offset_sec: f64,
    ) -> Option<AdStart> {
        let st = self.inner.lock();
        Self::ad_start_at(&st, rate, init, period_id, offset_sec)
    }

    fn ad_start_at(
        st: &DaiState,
        rate: f32,
        init: bool,
        period_id: &str,
        offset_sec: f64,
    ) -> Option<AdStart> {
        if rate != NORMAL_PLAY_RATE && !init {
            return None;
        }
        if offset_sec < 0.0 {
            return None;
        }
        let data = st.period_map.get(period_id)?;
        if data.ad_break_id.is_empty() {
            return None;
        }
        let brk = st.ad_breaks.get(&data.ad_break_id)?;
        let offset_ms = (offset_sec * 1000.0) as u64;
        let (entry_offset, on_period) = data.offset_to_ad.range(..=offset_ms).next_back()?;
        let ad = brk.ads.get(on_period.ad_idx)?;
        let into_entry = offset_ms - entry_offset;
        let covered = ad.duration_ms.saturating_sub(on_period.ad_start_offset_ms);
        // Position past the extent this entry covers means the break ended
        // earlier in the period
        if into_entry >= covered && ad.duration_ms > 0 {
            return None;
        }
        Some(AdStart {
            break_id: data.ad_break_id.clone(),
            ad_idx: on_period.ad_idx,
            ad_offset_sec: (on_period.ad_start_offset_ms + into_entry) as f64 / 1000.0,
        })
    }

    /// True when the currently playing ad's own timeline has reached or
    /// passed its duration.
    pub fn check_for_ad_terminate(&self, offset_sec: f64) -> bool {
        let st = self.inner.lock();
        if st.state != AdState::InAdbreakAdPlaying {
            return false;
        }
        let Some(idx) = st.cur_ad_idx else {
            return false;
        };
        let Some(ad) = st
            .ad_breaks
            .get(&st.cur_playing_break_id)
            .and_then(|brk| brk.ads.get(idx))
        else {
            return false;
        };
        ad.duration_ms > 0 && (offset_sec * 1000.0) as u64 >= ad.duration_ms
    }

    // ── State machine ───────────────────────────────────────────────────

    /// Feed a playback event to the state machine. Returns true when the
    /// state changed.
    pub fn on_ad_event(&self, event: AdEvent) -> bool {
        let mut st = self.inner.lock();
        let old_state = st.state;
        let mut events: Vec<SinkEvent> = Vec::new();

        match (st.state, event) {
            (
                AdState::OutsideAdbreak,
                AdEvent::Init | AdEvent::BaseOffsetChange | AdEvent::PeriodChange,
            ) => {
                Self::try_enter_adbreak(&mut st, event == AdEvent::Init, &mut events);
            }
            (AdState::OutsideAdbreakWait4Ads, AdEvent::PeriodChange) => {
                st.state = AdState::OutsideAdbreak;
            }
            (AdState::InAdbreakAdPlaying, AdEvent::AdFinished) => {
                if let Some(evt) =
                    Self::current_placement_event(&st, AdPlacementEventKind::End, None)
                {
                    events.push(SinkEvent::Placement(evt));
                }
                st.state = AdState::InAdbreakWait2Catchup;
            }
            (AdState::InAdbreakAdPlaying, AdEvent::AdFailed) => {
                if let Some(evt) =
                    Self::current_placement_event(&st, AdPlacementEventKind::Error, Some(-1))
                {
                    events.push(SinkEvent::Placement(evt));
                }
                if let Some(evt) =
                    Self::current_placement_event(&st, AdPlacementEventKind::End, None)
                {
                    events.push(SinkEvent::Placement(evt));
                }
                let break_id = st.cur_playing_break_id.clone();
                let idx = st.cur_ad_idx;
                if let Some(brk) = st.ad_breaks.get_mut(&break_id) {
                    brk.ad_failed = true;
                    if let Some(ad) = idx.and_then(|i| brk.ads.get_mut(i)) {
                        warn!("Ad {} failed during playback", ad.ad_id);
                        ad.invalid = true;
                    }
                }
                st.state = AdState::InAdbreakAdNotPlaying;
            }
            (AdState::InAdbreakWait2Catchup, AdEvent::PeriodChange) => {
                Self::catch_up(&mut st, &mut events);
            }
            (AdState::InAdbreakAdNotPlaying, AdEvent::BaseOffsetChange) => {
                let period_id = st.base_period_id.clone();
                let offset_sec = st.base_period_offset_ms as f64 / 1000.0;
                let startable = Self::ad_start_at(&st, st.rate, false, &period_id, offset_sec)
                    .filter(|start| {
                        st.ad_breaks
                            .get(&start.break_id)
                            .and_then(|brk| brk.ads.get(start.ad_idx))
                            .is_some_and(|ad| ad.resolved && !ad.invalid)
                    });
                if let Some(start) = startable {
                    st.cur_playing_break_id = start.break_id.clone();
                    st.cur_ad_idx = Some(start.ad_idx);
                    if let Some(evt) =
                        Self::current_placement_event(&st, AdPlacementEventKind::Start, None)
                    {
                        events.push(SinkEvent::Placement(evt));
                    }
                    st.state = AdState::InAdbreakAdPlaying;
                }
            }
            (AdState::InAdbreakAdNotPlaying, AdEvent::PeriodChange) => {
                let outside = st
                    .period_map
                    .get(&st.base_period_id)
                    .is_none_or(|data| data.ad_break_id.is_empty())
                    && !st.ad_breaks.contains_key(&st.base_period_id);
                if outside {
                    st.cur_playing_break_id.clear();
                    st.cur_ad_idx = None;
                    st.state = AdState::OutsideAdbreak;
                }
            }
            _ => {}
        }

        let new_state = st.state;
        let changed = new_state != old_state;
        drop(st);

        if changed {
            info!("Ad state {} -> {} on {:?}", old_state, new_state, event);
            metrics::record_ad_state_transition(old_state.name(), new_state.name());
        }
        self.emit(events);
        changed
    }

    /// OUTSIDE_ADBREAK entry guards: pick playing/not-playing/wait4ads
    /// depending on what the adbreak at the base period holds.
    fn try_enter_adbreak(st: &mut DaiState, init: bool, events: &mut Vec<SinkEvent>) {
        let period_id = st.base_period_id.clone();
        let break_id = match st.period_map.get(&period_id) {
            Some(data) if !data.ad_break_id.is_empty() => data.ad_break_id.clone(),
            _ if st.ad_breaks.contains_key(&period_id) => period_id.clone(),
            _ => return,
        };
        let Some(brk) = st.ad_breaks.get_mut(&break_id) else {
            return;
        };
        if brk.ads.is_empty() {
            // Opportunity announced but nothing registered; fall through to
            // source content until the next period
            warn!("Adbreak {} has no ads, marking invalid", break_id);
            brk.invalid = true;
            st.state = AdState::OutsideAdbreakWait4Ads;
            return;
        }

        let position_ms = st.base_period_offset_ms;
        let offset_sec = position_ms as f64 / 1000.0;
        let startable = Self::ad_start_at(st, st.rate, init, &period_id, offset_sec).filter(
            |start| {
                st.ad_breaks
                    .get(&start.break_id)
                    .and_then(|brk| brk.ads.get(start.ad_idx))
                    .is_some_and(|ad| ad.resolved && !ad.invalid)
            },
        );

        events.push(SinkEvent::Reservation(AdReservationEvent {
            kind: AdReservationEventKind::Start,
            break_id: break_id.clone(),
            position_ms,
        }));
        st.cur_playing_break_id = break_id.clone();
        match startable {
            Some(start) => {
                info!(
                    "Entering adbreak {} playing ad index {}",
                    break_id, start.ad_idx
                );
                st.cur_ad_idx = Some(start.ad_idx);
                if let Some(evt) =
                    Self::current_placement_event(st, AdPlacementEventKind::Start, None)
                {
                    events.push(SinkEvent::Placement(evt));
                }
                st.state = AdState::InAdbreakAdPlaying;
            }
            None => {
                // Ads registered but none playable here yet (unresolved or
                // invalid); reservation only
                info!("Entering adbreak {} without a playable ad", break_id);
                st.cur_ad_idx = None;
                st.state = AdState::InAdbreakAdNotPlaying;
            }
        }
    }

    /// WAIT2CATCHUP progression: next ad, or leave the break once it is
    /// fully placed.
    fn catch_up(st: &mut DaiState, events: &mut Vec<SinkEvent>) {
        let break_id = st.cur_playing_break_id.clone();
        let Some(brk) = st.ad_breaks.get(&break_id) else {
            st.cur_ad_idx = None;
            st.state = AdState::OutsideAdbreak;
            return;
        };
        let next_idx = st.cur_ad_idx.map_or(0, |idx| idx + 1);
        let next = brk
            .ads
            .iter()
            .enumerate()
            .skip(next_idx)
            .find(|(_, ad)| !ad.invalid);
        match next {
            Some((idx, ad)) if ad.resolved => {
                info!("Catching up: next ad {} in break {}", ad.ad_id, break_id);
                st.cur_ad_idx = Some(idx);
                if let Some(evt) =
                    Self::current_placement_event(st, AdPlacementEventKind::Start, None)
                {
                    events.push(SinkEvent::Placement(evt));
                }
                st.state = AdState::InAdbreakAdPlaying;
            }
            Some(_) => {
                // Next ad known but not resolved yet; keep waiting
            }
            None => {
                if brk.placed {
                    let end_offset_ms = brk.end_period_offset_ms;
                    events.push(SinkEvent::Reservation(AdReservationEvent {
                        kind: AdReservationEventKind::End,
                        break_id: break_id.clone(),
                        position_ms: end_offset_ms,
                    }));
                    st.content_seek_offset_sec = end_offset_ms as f64 / 1000.0;
                    info!(
                        "Adbreak {} done, resuming content at offset {}ms",
                        break_id, end_offset_ms
                    );
                    st.cur_playing_break_id.clear();
                    st.cur_ad_idx = None;
                    st.state = AdState::OutsideAdbreak;
                }
                // Placement incomplete: stay and wait for a future manifest
            }
        }
    }

    fn current_placement_event(
        st: &DaiState,
        kind: AdPlacementEventKind,
        error_code: Option<i32>,
    ) -> Option<AdPlacementEvent> {
        let brk = st.ad_breaks.get(&st.cur_playing_break_id)?;
        let ad = brk.ads.get(st.cur_ad_idx?)?;
        Some(AdPlacementEvent {
            kind,
            ad_id: ad.ad_id.clone(),
            position_ms: st.base_period_offset_ms,
            absolute_ms: brk.absolute_start.milliseconds().max(0) as u64 + ad.base_period_offset_ms,
            offset_ms: ad.base_period_offset_ms,
            duration_ms: ad.duration_ms,
            error_code,
        })
    }

    fn emit(&self, events: Vec<SinkEvent>) {
        for event in events {
            match event {
                SinkEvent::Reservation(e) => self.sink.send_reservation_event(e),
                SinkEvent::Placement(e) => self.sink.send_placement_event(e),
            }
        }
    }

    // ── Placement ───────────────────────────────────────────────────────

    /// Progress ad placement against the current source periods, called on
    /// every manifest re-index. Consumes ad duration from successive
    /// periods until the open adbreak is laid out or the periods run dry.
    pub fn place_ads(&self, periods: &[SourcePeriod]) {
        let started = std::time::Instant::now();
        let mut st = self.inner.lock();
        for period in periods {
            let entry = st.period_map.entry(period.id.clone()).or_default();
            entry.duration_ms = period.duration_ms;
        }
        let mut progressed = false;
        loop {
            if st.placement.is_none() {
                st.placement = if st.pending_placements.is_empty() {
                    Self::next_break_to_place(&st, periods)
                } else {
                    Some(st.pending_placements.remove(0))
                };
            }
            let Some(mut cursor) = st.placement.take() else {
                break;
            };
            cursor.wait_for_next_period = false;
            match Self::run_placement(&mut st, &mut cursor, periods) {
                PlacementOutcome::Completed => {
                    progressed = true;
                    // Loop again: another break may be ready
                }
                PlacementOutcome::WaitingForPeriods => {
                    cursor.wait_for_next_period = true;
                    st.pending_placements.push(cursor);
                    break;
                }
                PlacementOutcome::WaitingForResolve => {
                    st.placement = Some(cursor);
                    break;
                }
            }
        }
        drop(st);
        trace!(
            "place_ads over {} periods took {}ms",
            periods.len(),
            started.elapsed().as_millis()
        );
        if progressed {
            self.resolved_notify.notify_waiters();
        }
    }

    /// First unplaced adbreak (in source-period order) holding a resolved
    /// ad.
    fn next_break_to_place(st: &DaiState, periods: &[SourcePeriod]) -> Option<PlacementCursor> {
        for period in periods {
            if let Some(brk) = st.ad_breaks.get(&period.id) {
                if brk.placed || brk.invalid || !brk.has_resolved_ad() {
                    continue;
                }
                debug!("Arming placement for adbreak {}", period.id);
                return Some(PlacementCursor {
                    pending_break_id: period.id.clone(),
                    open_period_id: period.id.clone(),
                    cur_ad_idx: 0,
                    ad_next_offset_ms: 0,
                    period_offset_ms: 0,
                    wait_for_next_period: false,
                });
            }
        }
        None
    }

    fn run_placement(
        st: &mut DaiState,
        cursor: &mut PlacementCursor,
        periods: &[SourcePeriod],
    ) -> PlacementOutcome {
        let DaiState {
            ad_breaks,
            period_map,
            ..
        } = st;
        let Some(brk) = ad_breaks.get_mut(&cursor.pending_break_id) else {
            warn!("Adbreak {} vanished mid-placement", cursor.pending_break_id);
            return PlacementOutcome::Completed;
        };
        let Some(mut pidx) = periods.iter().position(|p| p.id == cursor.open_period_id) else {
            return PlacementOutcome::WaitingForPeriods;
        };

        loop {
            let period = &periods[pidx];

            // Open period consumed end to end: move on
            if cursor.period_offset_ms >= period.duration_ms {
                let entry = period_map.entry(period.id.clone()).or_default();
                entry.filled = true;
                pidx += 1;
                cursor.period_offset_ms = 0;
                if pidx >= periods.len() {
                    debug!(
                        "Placement of {} waiting for the next period",
                        cursor.pending_break_id
                    );
                    return PlacementOutcome::WaitingForPeriods;
                }
                cursor.open_period_id = periods[pidx].id.clone();
                brk.split_period = true;
                continue;
            }

            // Skip ads that can never place
            while cursor.cur_ad_idx < brk.ads.len()
                && (brk.ads[cursor.cur_ad_idx].invalid
                    || (brk.ads[cursor.cur_ad_idx].resolved
                        && brk.ads[cursor.cur_ad_idx].duration_ms == 0))
            {
                debug!(
                    "Skipping unusable ad {} in break {}",
                    brk.ads[cursor.cur_ad_idx].ad_id, cursor.pending_break_id
                );
                cursor.cur_ad_idx += 1;
                cursor.ad_next_offset_ms = 0;
            }

            if cursor.cur_ad_idx >= brk.ads.len() {
                // Break exhausted: fix where source playback resumes
                let remainder = period.duration_ms - cursor.period_offset_ms;
                if remainder <= OFFSET_ALIGN_FACTOR_MS && pidx + 1 < periods.len() {
                    // Declared durations drift; snap to the period boundary
                    period_map.entry(period.id.clone()).or_default().filled = true;
                    brk.end_period_id = periods[pidx + 1].id.clone();
                    brk.end_period_offset_ms = 0;
                } else {
                    brk.end_period_id = period.id.clone();
                    brk.end_period_offset_ms = cursor.period_offset_ms;
                }
                brk.placed = true;
                metrics::record_ad_break_placed();
                info!(
                    "Adbreak {} placed: resume at {} offset {}ms, ads duration {}ms",
                    cursor.pending_break_id,
                    brk.end_period_id,
                    brk.end_period_offset_ms,
                    brk.ads_duration_ms
                );
                return PlacementOutcome::Completed;
            }

            if !brk.ads[cursor.cur_ad_idx].resolved {
                return PlacementOutcome::WaitingForResolve;
            }

            // Attribute this period's milliseconds to the current ad
            let entry = period_map.entry(period.id.clone()).or_default();
            entry.ad_break_id = cursor.pending_break_id.clone();
            entry.duration_ms = period.duration_ms;
            entry
                .offset_to_ad
                .entry(cursor.period_offset_ms)
                .or_insert(AdOnPeriod {
                    ad_idx: cursor.cur_ad_idx,
                    ad_start_offset_ms: cursor.ad_next_offset_ms,
                });

            let ad = &mut brk.ads[cursor.cur_ad_idx];
            if cursor.ad_next_offset_ms == 0 {
                ad.base_period_id = period.id.clone();
                ad.base_period_offset_ms = cursor.period_offset_ms;
            }
            let available = period.duration_ms - cursor.period_offset_ms;
            let ad_remaining = ad.duration_ms - cursor.ad_next_offset_ms;
            let consumed = available.min(ad_remaining);
            cursor.ad_next_offset_ms += consumed;
            cursor.period_offset_ms += consumed;
            brk.ads_duration_ms += consumed;
            trace!(
                "Placed {}ms of ad {} over period {} (ad offset {}ms, period offset {}ms)",
                consumed,
                ad.ad_id,
                period.id,
                cursor.ad_next_offset_ms,
                cursor.period_offset_ms
            );
            if cursor.ad_next_offset_ms >= ad.duration_ms {
                ad.placed = true;
                info!("Ad {} fully placed", ad.ad_id);
                cursor.cur_ad_idx += 1;
                cursor.ad_next_offset_ms = 0;
            }
        }
    }

    // ── Fulfillment worker ──────────────────────────────────────────────

    /// Spawn the worker that downloads and resolves queued ad manifests.
    pub fn start_fulfill_loop(self: &Arc<Self>) {
        let Some(mut rx) = self.fulfill_rx.lock().take() else {
            warn!("Fulfillment loop already started");
            return;
        };
        self.exit_fulfill_loop.store(false, Ordering::Release);
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!("Ad fulfillment loop started");
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    FulfillCmd::Fulfill(request) => {
                        if manager.exit_fulfill_loop.load(Ordering::Acquire) {
                            break;
                        }
                        manager.fulfill_ad(request).await;
                    }
                    FulfillCmd::Exit => break,
                }
            }
            // Drain anything still queued so producers never observe a
            // half-dead loop
            while rx.try_recv().is_ok() {}
            manager.resolved_notify.notify_waiters();
            info!("Ad fulfillment loop exited");
        });
        *self.worker.lock() = Some(handle);
    }

    /// Stop the worker, draining the queue and unblocking waiters.
    pub async fn stop_fulfill_loop(&self) {
        self.exit_fulfill_loop.store(true, Ordering::Release);
        let _ = self.fulfill_tx.send(FulfillCmd::Exit);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.await.is_err() {
                error!("Ad fulfillment worker terminated abnormally");
            }
        }
    }

    /// Download and parse one ad manifest, recording the outcome on the
    /// AdNode. Failures mark the ad invalid; they never escalate.
    async fn fulfill_ad(&self, request: AdFulfillRequest) {
        info!("Fulfilling ad {} from {}", request.ad_id, request.url);
        let outcome = match self.fetcher.fetch(&request.url).await {
            Ok((body, _status)) => match parse_ad_manifest(&body) {
                Ok((mpd, duration_ms)) => Some((Arc::new(mpd), duration_ms)),
                Err(e) => {
                    error!("Parsing ad manifest for {} failed: {}", request.ad_id, e);
                    None
                }
            },
            Err(e) => {
                error!("Fetching ad manifest for {} failed: {}", request.ad_id, e);
                None
            }
        };
        {
            let mut st = self.inner.lock();
            let node = st
                .ad_breaks
                .get_mut(&request.period_id)
                .and_then(|brk| brk.ads.iter_mut().find(|ad| ad.ad_id == request.ad_id));
            match node {
                Some(ad) => match outcome {
                    Some((mpd, duration_ms)) => {
                        ad.resolved = true;
                        ad.duration_ms = duration_ms;
                        ad.mpd = Some(mpd);
                        metrics::record_ad_fulfillment("resolved");
                        info!("Ad {} resolved, duration {}ms", request.ad_id, duration_ms);
                    }
                    None => {
                        ad.resolved = true;
                        ad.invalid = true;
                        ad.mpd = None;
                        metrics::record_ad_fulfillment("invalid");
                        warn!("Ad {} marked invalid", request.ad_id);
                    }
                },
                None => warn!("Fulfilled ad {} is no longer in the catalog", request.ad_id),
            }
        }
        // Wake pipelines waiting on resolution regardless of the outcome
        self.resolved_notify.notify_waiters();
    }

    // ── Waits ───────────────────────────────────────────────────────────

    /// [`Self::wait_for_next_ad_resolved`] with the configured default
    /// timeout.
    pub async fn wait_for_next_ad_resolved_default(&self) -> bool {
        self.wait_for_next_ad_resolved(self.default_resolve_timeout_ms)
            .await
    }

    /// Wait up to the timeout for the next resolution/placement signal.
    /// False on timeout or abort; the caller falls through to source
    /// content.
    pub async fn wait_for_next_ad_resolved(&self, timeout_ms: u64) -> bool {
        if self.wait_aborted.load(Ordering::Acquire) {
            return false;
        }
        let notified = self.resolved_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        match tokio::time::timeout(Duration::from_millis(timeout_ms), notified).await {
            Ok(()) => !self.wait_aborted.load(Ordering::Acquire),
            Err(_) => {
                debug!("Timed out waiting for ad resolution after {}ms", timeout_ms);
                false
            }
        }
    }

    /// Wait until the adbreak at `period_id` holds a resolved valid ad.
    /// Returns immediately when the period has no adbreak; false when all
    /// its ads resolved invalid, on timeout, or on abort.
    pub async fn wait_for_ad_resolved_in_period(&self, timeout_ms: u64, period_id: &str) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if self.wait_aborted.load(Ordering::Acquire) {
                return false;
            }
            let notified = self.resolved_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = self.inner.lock();
                match st.ad_breaks.get(period_id) {
                    None => return true,
                    Some(brk) => {
                        if brk.has_resolved_ad() {
                            return true;
                        }
                        if brk.all_ads_invalid() {
                            return false;
                        }
                    }
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(
                    "Timed out waiting for an ad on period {} after {}ms",
                    period_id, timeout_ms
                );
                return false;
            }
        }
    }

    /// Release every resolve waiter with a false result.
    pub fn abort_wait_for_next_ad_resolved(&self) {
        self.wait_aborted.store(true, Ordering::Release);
        self.resolved_notify.notify_waiters();
    }

    // ── Reset / teardown ────────────────────────────────────────────────

    /// Reset the state machine and playback cursors; the catalog survives.
    pub fn reset_state(&self) {
        let mut st = self.inner.lock();
        info!("Resetting ad state machine");
        st.state = AdState::OutsideAdbreak;
        st.cur_playing_break_id.clear();
        st.cur_ad_idx = None;
        st.base_period_id.clear();
        st.base_period_offset_ms = 0;
        st.content_seek_offset_sec = 0.0;
        st.rate = NORMAL_PLAY_RATE;
        self.wait_aborted.store(false, Ordering::Release);
    }

    /// Session teardown: drop the adbreak catalog and placement maps.
    pub fn clear_maps(&self) {
        let mut st = self.inner.lock();
        info!("Clearing ad catalog");
        st.ad_breaks.clear();
        st.period_map.clear();
        st.placement = None;
        st.pending_placements.clear();
    }

    /// JSON summary of the manager for diagnostics.
    pub fn status(&self) -> serde_json::Value {
        let st = self.inner.lock();
        let breaks: Vec<serde_json::Value> = st
            .ad_breaks
            .iter()
            .map(|(id, brk)| {
                serde_json::json!({
                    "id": id,
                    "duration_ms": brk.break_duration_ms,
                    "ads": brk.ads.len(),
                    "resolved_ads": brk.ads.iter().filter(|a| a.resolved).count(),
                    "invalid_ads": brk.ads.iter().filter(|a| a.invalid).count(),
                    "placed": brk.placed,
                    "end_period_id": brk.end_period_id,
                    "end_period_offset_ms": brk.end_period_offset_ms,
                })
            })
            .collect();
        serde_json::json!({
            "state": st.state.name(),
            "base_period": st.base_period_id,
            "base_period_offset_ms": st.base_period_offset_ms,
            "current_break": st.cur_playing_break_id,
            "current_ad_index": st.cur_ad_idx,
            "content_seek_offset_sec": st.content_seek_offset_sec,
            "pending_placements": st.pending_placements.len(),
            "breaks": breaks,
        })
    }
}
