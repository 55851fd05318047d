use metrics::{counter, gauge};

// ── Metric names ────────────────────────────────────────────────────────

/// Media fragments written into the TSB, by media type
pub const TSB_FRAGMENTS_ADDED: &str = "dvrcore_tsb_fragments_added_total";
/// Init headers written into the TSB, by media type
pub const TSB_INIT_ADDED: &str = "dvrcore_tsb_init_headers_added_total";
/// Media fragments evicted from the TSB, by media type
pub const TSB_FRAGMENTS_EVICTED: &str = "dvrcore_tsb_fragments_evicted_total";
/// Currently cached fragments, by media type
pub const TSB_CACHED_FRAGMENTS: &str = "dvrcore_tsb_cached_fragments";
/// Ad fulfillments by result (resolved, invalid)
pub const AD_FULFILLMENTS: &str = "dvrcore_ad_fulfillments_total";
/// Ad state machine transitions
pub const AD_STATE_TRANSITIONS: &str = "dvrcore_ad_state_transitions_total";
/// Adbreaks fully placed over source periods
pub const AD_BREAKS_PLACED: &str = "dvrcore_ad_breaks_placed_total";

// ── Recording helpers ───────────────────────────────────────────────────

/// Record a media-fragment write
pub fn record_fragment_added(media: &str) {
    counter!(TSB_FRAGMENTS_ADDED, "media" => media.to_string()).increment(1);
}

/// Record an init-header write
pub fn record_init_added(media: &str) {
    counter!(TSB_INIT_ADDED, "media" => media.to_string()).increment(1);
}

/// Record fragment evictions
pub fn record_fragments_evicted(media: &str, count: u64) {
    counter!(TSB_FRAGMENTS_EVICTED, "media" => media.to_string()).increment(count);
}

/// Update the cached-fragment gauge for a media type
pub fn set_cached_fragments(media: &str, count: usize) {
    gauge!(TSB_CACHED_FRAGMENTS, "media" => media.to_string()).set(count as f64);
}

/// Record an ad fulfillment result
pub fn record_ad_fulfillment(result: &str) {
    counter!(AD_FULFILLMENTS, "result" => result.to_string()).increment(1);
}

/// Record an ad state machine transition
pub fn record_ad_state_transition(from: &str, to: &str) {
    counter!(AD_STATE_TRANSITIONS, "from" => from.to_string(), "to" => to.to_string())
        .increment(1);
}

/// Record a fully placed adbreak
pub fn record_ad_break_placed() {
    counter!(AD_BREAKS_PLACED).increment(1);
}
