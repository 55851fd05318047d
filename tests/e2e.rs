//! End-to-end tests for the TSB and ad-insertion core.
//!
//! Exercises the full pipeline the way a player would: the fetch loop
//! writes fragments through the store, a reader feeds the injector, and
//! the ad manager resolves ads over real HTTP (wiremock) before placing
//! and splicing them.

use std::sync::Arc;
use std::time::Duration;

use dvrcore::config::Config;
use dvrcore::dai::events::{
    AdPlacementEventKind, AdReservationEventKind, RecordedAdEvent, RecordingAdEventSink,
};
use dvrcore::dai::fulfill::HttpAdFetcher;
use dvrcore::dai::manager::AdManager;
use dvrcore::dai::{AdEvent, AdOnPeriod, AdState, SourcePeriod};
use dvrcore::time::MediaTime;
use dvrcore::tsb::reader::{TsbReader, TuneType};
use dvrcore::tsb::store::TsbStore;
use dvrcore::tsb::{MediaType, StreamInfo, TsbWriteData};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const AD_MANIFEST_30S: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" profiles="urn:mpeg:dash:profile:isoff-on-demand:2011" minBufferTime="PT1.5S" mediaPresentationDuration="PT0M30S">
<Period id="ad1" start="PT0H0M0.000S">
  <AdaptationSet contentType="video" mimeType="video/mp4" segmentAlignment="true" startWithSAP="1">
    <SegmentTemplate timescale="90000" initialization="video_init.mp4" media="video$Number$.mp4" duration="900000"/>
    <Representation id="1" bandwidth="3000000" codecs="avc1.4d401f" width="1280" height="720" frameRate="30"/>
  </AdaptationSet>
</Period>
</MPD>"#;

/// Route core logs through the test harness; repeated calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn write_data(position: f64, duration: f64, pts: f64, period: &str) -> TsbWriteData {
    TsbWriteData {
        url: format!("http://origin.example.com/{period}/{position}.mp4"),
        absolute_position: MediaTime::from_secs_f64(position),
        duration: MediaTime::from_secs_f64(duration),
        pts: MediaTime::from_secs_f64(pts),
        period_id: period.to_string(),
        timescale: 90_000,
        pts_offset: MediaTime::ZERO,
    }
}

fn add_init(store: &TsbStore, url: &str, period: &str, position: f64, bandwidth: u64) {
    store.add_init_fragment(
        url.to_string(),
        StreamInfo {
            bandwidth_bps: bandwidth,
            width: 1280,
            height: 720,
            framerate: 25.0,
        },
        period.to_string(),
        MediaTime::from_secs_f64(position),
        0,
    );
}

/// Append, read forward, evict.
#[test]
fn append_read_forward_evict() {
    init_tracing();
    let store = Arc::new(TsbStore::new(MediaType::Video));
    add_init(&store, "i1", "p1", 1005.0, 800_000);
    assert!(store.add_fragment(write_data(1005.0, 5.0, 0.0, "p1"), false));
    assert!(store.add_fragment(write_data(1010.0, 5.0, 5.0, "p1"), false));

    let reader = TsbReader::new(Arc::clone(&store), "e2e");
    let mut start = 1005.0;
    reader
        .init(&mut start, 1.0, TuneType::New, None)
        .expect("init failed");
    assert_eq!(start, 1005.0);

    let f1 = reader.find_next().expect("f1 missing");
    assert_eq!(f1.absolute_position(), 1005.0);
    reader.read_next(Some(f1));
    let f2 = reader.find_next().expect("f2 missing");
    assert_eq!(f2.absolute_position(), 1010.0);
    reader.read_next(Some(f2));
    assert!(reader.is_eos());

    let removed = store.remove_fragments(MediaTime::from_secs_f64(1010.0));
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].absolute_position(), 1005.0);
    assert_eq!(store.first_fragment_position().unwrap(), 1010.0);
}

/// Discontinuous period boundary with PTS rebasement.
#[test]
fn discontinuous_period_boundary_rebases_pts() {
    init_tracing();
    let store = Arc::new(TsbStore::new(MediaType::Video));
    add_init(&store, "i1", "p1", 1000.0, 800_000);
    assert!(store.add_fragment(write_data(1000.0, 5.0, 250.0, "p1"), false));
    add_init(&store, "i2", "p2", 1005.0, 800_000);
    assert!(store.add_fragment(write_data(1005.0, 5.0, 500.0, "p2"), true));

    let reader = TsbReader::new(store, "e2e");
    let mut start = 1000.0;
    reader
        .init(&mut start, 1.0, TuneType::New, None)
        .expect("init failed");

    let f1 = reader.find_next().expect("f1 missing");
    reader.read_next(Some(f1));
    assert!(!reader.is_discontinuous());

    let f2 = reader.find_next().expect("f2 missing");
    reader.read_next(Some(f2));
    assert!(reader.is_period_boundary());
    assert!(reader.is_discontinuous());
    assert_eq!(reader.first_pts(), 500.0);
}

/// Reverse at head.
#[test]
fn reverse_at_head() {
    init_tracing();
    let store = Arc::new(TsbStore::new(MediaType::Video));
    add_init(&store, "i1", "p1", 2000.0, 800_000);
    assert!(store.add_fragment(write_data(2000.0, 5.0, 0.0, "p1"), false));

    let reader = TsbReader::new(store, "e2e");
    let mut start = 2000.0;
    reader
        .init(&mut start, -1.0, TuneType::Seek, None)
        .expect("init failed");

    let f = reader.find_next().expect("fragment missing");
    assert_eq!(f.absolute_position(), 2000.0);
    reader.read_next(Some(f));
    reader.reset_eos();
    assert!(reader.find_next().is_none());
    assert!(reader.is_eos());
}

/// Writer and injector on separate threads over the same store.
#[test]
fn concurrent_writer_and_reader() {
    init_tracing();
    let store = Arc::new(TsbStore::new(MediaType::Video));
    add_init(&store, "i1", "p1", 1000.0, 800_000);
    assert!(store.add_fragment(write_data(1000.0, 1.0, 0.0, "p1"), false));

    let writer_store = Arc::clone(&store);
    let writer = std::thread::spawn(move || {
        for i in 1..100 {
            let pos = 1000.0 + i as f64;
            assert!(writer_store.add_fragment(write_data(pos, 1.0, i as f64, "p1"), false));
        }
    });

    let reader = TsbReader::new(Arc::clone(&store), "e2e");
    let mut start = 1000.0;
    reader
        .init(&mut start, 1.0, TuneType::New, None)
        .expect("init failed");

    let mut consumed = 0;
    let mut last_pos = f64::MIN;
    while consumed < 100 {
        match reader.find_next() {
            Some(fragment) => {
                let pos = fragment.absolute_position().as_secs_f64();
                assert!(pos > last_pos, "positions must strictly increase");
                last_pos = pos;
                reader.read_next(Some(fragment));
                consumed += 1;
            }
            None => std::thread::yield_now(),
        }
    }
    writer.join().expect("writer panicked");
    assert_eq!(store.len(), 100);
}

/// Ad placement across two source periods, resolved over real HTTP.
#[tokio::test]
async fn ad_placement_across_two_periods() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ad.mpd"))
        .respond_with(ResponseTemplate::new(200).set_body_string(AD_MANIFEST_30S))
        .mount(&server)
        .await;

    let sink = Arc::new(RecordingAdEventSink::new());
    let manager = Arc::new(AdManager::new(
        sink,
        Arc::new(HttpAdFetcher::from_config(&Config::default())),
    ));
    manager.start_fulfill_loop();
    manager.set_alternate_contents("p1", "adId1", &format!("{}/ad.mpd", server.uri()), 0, 30_000);
    assert!(manager.wait_for_ad_resolved_in_period(5_000, "p1").await);

    manager.place_ads(&[
        SourcePeriod::new("p1", 20_000),
        SourcePeriod::new("p2", 15_000),
    ]);

    let p1 = manager.period_ad_data("p1").expect("p1 missing");
    assert_eq!(
        p1.offset_to_ad[&0],
        AdOnPeriod {
            ad_idx: 0,
            ad_start_offset_ms: 0
        }
    );
    let p2 = manager.period_ad_data("p2").expect("p2 missing");
    assert_eq!(
        p2.offset_to_ad[&0],
        AdOnPeriod {
            ad_idx: 0,
            ad_start_offset_ms: 20_000
        }
    );
    let brk = manager.ad_break("p1").expect("break missing");
    assert!(brk.placed);
    assert_eq!(brk.end_period_id, "p2");
    assert_eq!(brk.end_period_offset_ms, 10_000);

    manager.stop_fulfill_loop().await;
}

/// Ad state walk: enter break, finish the ad, catch up, exit to content.
#[tokio::test]
async fn ad_state_finish_then_catch_up() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ad.mpd"))
        .respond_with(ResponseTemplate::new(200).set_body_string(AD_MANIFEST_30S))
        .mount(&server)
        .await;

    let sink = Arc::new(RecordingAdEventSink::new());
    let manager = Arc::new(AdManager::new(
        sink.clone(),
        Arc::new(HttpAdFetcher::from_config(&Config::default())),
    ));
    manager.start_fulfill_loop();
    manager.set_alternate_contents("p1", "adId1", &format!("{}/ad.mpd", server.uri()), 0, 30_000);
    assert!(manager.wait_for_ad_resolved_in_period(5_000, "p1").await);
    manager.place_ads(&[
        SourcePeriod::new("p1", 20_000),
        SourcePeriod::new("p2", 15_000),
    ]);

    manager.set_base_period("p1", 0);
    assert!(manager.on_ad_event(AdEvent::DEFAULT));
    assert_eq!(manager.ad_state(), AdState::InAdbreakAdPlaying);
    let events = sink.take();
    assert!(matches!(
        &events[0],
        RecordedAdEvent::Reservation(e) if e.kind == AdReservationEventKind::Start
    ));
    assert!(matches!(
        &events[1],
        RecordedAdEvent::Placement(e)
            if e.kind == AdPlacementEventKind::Start && e.ad_id == "adId1"
    ));

    assert!(manager.on_ad_event(AdEvent::AdFinished));
    assert_eq!(manager.ad_state(), AdState::InAdbreakWait2Catchup);
    let events = sink.take();
    assert!(matches!(
        &events[0],
        RecordedAdEvent::Placement(e) if e.kind == AdPlacementEventKind::End
    ));

    assert!(manager.on_ad_event(AdEvent::DEFAULT));
    assert_eq!(manager.ad_state(), AdState::OutsideAdbreak);
    assert_eq!(manager.content_seek_offset_sec(), 10.0);
    let events = sink.take();
    assert!(matches!(
        &events[0],
        RecordedAdEvent::Reservation(e) if e.kind == AdReservationEventKind::End
    ));

    manager.stop_fulfill_loop().await;
}

/// Fulfillment timeout falls through to source content.
#[tokio::test]
async fn fulfillment_timeout_fall_through() {
    init_tracing();
    let server = MockServer::start().await;
    // The ad endpoint stalls well past the fetcher's timeout
    Mock::given(method("GET"))
        .and(path("/slow.mpd"))
        .respond_with(
            ResponseTemplate::new(500).set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let sink = Arc::new(RecordingAdEventSink::new());
    let config = Config {
        ad_fetch_timeout_ms: 2_000,
        ad_fetch_retries: 0,
        ..Config::default()
    };
    let manager = Arc::new(AdManager::with_config(
        sink.clone(),
        Arc::new(HttpAdFetcher::from_config(&config)),
        &config,
    ));
    manager.start_fulfill_loop();
    manager.set_alternate_contents(
        "p1",
        "adId1",
        &format!("{}/slow.mpd", server.uri()),
        0,
        30_000,
    );

    // The player gives up after 500ms and falls through to content
    let started = std::time::Instant::now();
    assert!(!manager.wait_for_next_ad_resolved(500).await);
    assert!(started.elapsed() >= Duration::from_millis(500));

    // The fetch eventually times out and the ad resolves invalid
    assert!(!manager.wait_for_ad_resolved_in_period(10_000, "p1").await);
    let brk = manager.ad_break("p1").expect("break missing");
    assert!(brk.ads[0].resolved);
    assert!(brk.ads[0].invalid);

    manager.set_base_period("p1", 0);
    assert!(manager.on_ad_event(AdEvent::DEFAULT));
    assert_eq!(manager.ad_state(), AdState::InAdbreakAdNotPlaying);
    let events = sink.take();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        RecordedAdEvent::Reservation(e) if e.kind == AdReservationEventKind::Start
    ));

    manager.stop_fulfill_loop().await;
}

/// Live window: evict while a reader is mid-stream, then keep reading.
#[test]
fn eviction_during_playback() {
    init_tracing();
    let store = Arc::new(TsbStore::new(MediaType::Video));
    add_init(&store, "i1", "p1", 1000.0, 800_000);
    for i in 0..10 {
        let pos = 1000.0 + (i * 5) as f64;
        assert!(store.add_fragment(write_data(pos, 5.0, (i * 5) as f64, "p1"), false));
    }

    let reader = TsbReader::new(Arc::clone(&store), "e2e");
    let mut start = 1020.0;
    reader
        .init(&mut start, 1.0, TuneType::Seek, None)
        .expect("init failed");

    // The live window slides past the first four fragments
    let removed = store.remove_fragments(MediaTime::from_secs_f64(1020.0));
    assert_eq!(removed.len(), 4);

    let mut positions = Vec::new();
    while let Some(fragment) = reader.find_next() {
        positions.push(fragment.absolute_position().as_secs_f64());
        reader.read_next(Some(fragment));
    }
    assert_eq!(positions, vec![1020.0, 1025.0, 1030.0, 1035.0, 1040.0, 1045.0]);
    assert!(reader.is_eos());
}
