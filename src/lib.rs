//! dvrcore — Time-shift buffer and client-side ad insertion core for DASH
//! players.
//!
//! Three cooperating components: an integer-backed media time scalar
//! ([`time::MediaTime`]), an on-disk-cache index with a position-aware
//! reader ([`tsb`]), and a client-side dynamic ad insertion manager
//! ([`dai`]). The player's fetch loop writes fragments through the TSB
//! store, the injector advances a reader per media type, and the ad
//! manager splices ad periods into the content timeline as playback
//! events arrive.

pub mod config;
pub mod dai;
pub mod error;
pub mod metrics;
pub mod time;
pub mod tsb;
