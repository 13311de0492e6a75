//! Proxy-driven decode flows over an in-process session host.

mod common;

use std::sync::Arc;
use std::thread;

use common::{frame, payload, Hold, Rig, Seen};
use wavry_codec_proxy::CodecProxy;
use wavry_common::{Codec, Error, MediaFormat, PoolConfig, SampleInfo, SessionConfig};
use wavry_media::LoopbackConfig;

#[test]
fn test_frames_round_trip_through_proxy() {
    let rig = Rig::new();
    let (proxy, recorder) = rig.proxy(SessionConfig::default());
    rig.settle();

    let frames: Vec<Vec<u8>> = (0..3).map(|i| payload(i, 100 + i as usize)).collect();
    for (i, data) in frames.iter().enumerate() {
        let token = proxy.input(data, frame(i as i64 * 1000), None).unwrap();
        assert_eq!(token.session, proxy.session_id());
        assert_eq!(token.generation, 0);
        assert!(proxy.is_current(token));
    }
    rig.settle();

    assert_eq!(
        recorder.input_statuses(),
        vec![(0, true), (1000, true), (2000, true)]
    );
    let seen = recorder.seen();
    let format_at = seen
        .iter()
        .position(|seen| matches!(seen, Seen::FormatChanged(_)))
        .unwrap();
    let first_output = seen
        .iter()
        .position(|seen| matches!(seen, Seen::Output { .. }))
        .unwrap();
    assert!(format_at < first_output);

    let outputs = recorder.outputs();
    assert_eq!(outputs.len(), 3);
    for (i, (sample, bytes)) in outputs.iter().enumerate() {
        assert_eq!(sample.session, proxy.session_id());
        assert_eq!(sample.generation, 0);
        assert_eq!(sample.info.timestamp_us, i as i64 * 1000);
        assert_eq!(bytes.as_deref(), Some(frames[i].as_slice()));
    }

    for (sample, _) in &outputs {
        proxy.release_output(sample, true).unwrap();
    }
    let stats = rig
        .latest()
        .host()
        .session_stats(proxy.session_id())
        .unwrap();
    assert_eq!(stats.sent_outputs, 0);
    assert_eq!(stats.input_pool.in_use_count, 0);
    assert_eq!(rig.factory.drivers()[0].stats().rendered_outputs, 3);
}

#[test]
fn test_release_follows_delivery_order() {
    let rig = Rig::new();
    let (proxy, recorder) = rig.proxy(SessionConfig::default());
    rig.settle();

    for i in 0..3 {
        proxy.input(&payload(i, 16), frame(i as i64), None).unwrap();
    }
    rig.settle();
    let samples = recorder.samples();
    assert_eq!(samples.len(), 3);

    let err = proxy.release_output(&samples[1], true).unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    for sample in &samples {
        proxy.release_output(sample, true).unwrap();
    }
    // Extra releases are no-ops.
    proxy.release_output(&samples[2], true).unwrap();
    proxy.release_output(&samples[0], false).unwrap();

    let driver = rig.factory.drivers().remove(0);
    assert_eq!(driver.stats().rendered_outputs, 3);
    assert_eq!(driver.stats().dropped_outputs, 0);
    let stats = rig
        .latest()
        .host()
        .session_stats(proxy.session_id())
        .unwrap();
    assert_eq!(stats.sent_outputs, 0);
}

#[test]
fn test_release_from_inside_output_callback() {
    let rig = Rig::with_loopback(LoopbackConfig {
        output_slots: 2,
        ..LoopbackConfig::default()
    });
    let (proxy, recorder) = rig.proxy(SessionConfig::default());
    let proxy = Arc::new(proxy);
    recorder.release_outputs_through(&proxy);
    rig.settle();

    for i in 0..6 {
        proxy.input(&payload(i, 32), frame(i as i64), None).unwrap();
        rig.settle();
    }

    let samples = recorder.samples();
    assert_eq!(samples.len(), 6);
    assert!(samples.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert_eq!(rig.factory.drivers()[0].stats().rendered_outputs, 6);
}

#[test]
fn test_flush_discards_generation() {
    let rig = Rig::new();
    let (proxy, recorder) = rig.proxy(SessionConfig::default());
    rig.settle();

    // Nothing submitted yet.
    proxy.flush().unwrap();
    assert_eq!(proxy.generation(), 0);
    assert_eq!(rig.factory.drivers()[0].stats().flushes, 0);

    let stale = proxy.input(&payload(1, 64), frame(0), None).unwrap();
    rig.settle();
    let old = recorder.samples();
    assert_eq!(old.len(), 1);

    proxy.flush().unwrap();
    assert_eq!(proxy.generation(), 1);
    assert!(!proxy.is_current(stale));
    assert_eq!(rig.factory.drivers()[0].stats().flushes, 1);

    let stats = rig
        .latest()
        .host()
        .session_stats(proxy.session_id())
        .unwrap();
    assert_eq!(stats.generation, 1);
    assert_eq!(stats.sent_outputs, 0);
    assert_eq!(stats.input_pool.in_use_count, 0);

    // Releasing an output from before the flush does nothing.
    proxy.release_output(&old[0], true).unwrap();

    rig.settle();
    recorder.clear();
    let data = payload(9, 48);
    let token = proxy.input(&data, frame(5000), None).unwrap();
    assert_eq!(token.generation, 1);
    assert!(proxy.is_current(token));
    rig.settle();

    let outputs = recorder.outputs();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].0.generation, 1);
    assert_eq!(outputs[0].1.as_deref(), Some(data.as_slice()));
    proxy.release_output(&outputs[0].0, true).unwrap();
    assert_eq!(rig.factory.drivers()[0].stats().rendered_outputs, 1);

    // Flushing twice in a row only reaches the host once.
    proxy.flush().unwrap();
    proxy.flush().unwrap();
    assert_eq!(proxy.generation(), 2);
    assert_eq!(rig.factory.drivers()[0].stats().flushes, 2);
}

/// Flush while the delivery thread is inside the first output mapping.
fn flush_during_output_mapping(hold: Hold) {
    let (rig, gate) = Rig::with_output_gate(hold);
    let (proxy, recorder) = rig.proxy(SessionConfig::default());
    rig.settle();

    proxy.input(&payload(1, 64), frame(0), None).unwrap();
    rig.factory.pump_all();
    gate.wait_entered();
    proxy.flush().unwrap();
    gate.open();
    rig.connector.sync();

    assert!(recorder.errors().is_empty());
    assert!(recorder.samples().is_empty());
    assert!(!proxy.is_released());

    rig.settle();
    let data = payload(9, 48);
    proxy.input(&data, frame(5000), None).unwrap();
    rig.settle();

    let outputs = recorder.outputs();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].0.generation, 1);
    assert_eq!(outputs[0].1.as_deref(), Some(data.as_slice()));
    proxy.release_output(&outputs[0].0, true).unwrap();
    assert!(recorder.errors().is_empty());
}

#[test]
fn test_flush_before_output_is_mapped_is_silent() {
    flush_during_output_mapping(Hold::BeforeMap);
}

#[test]
fn test_output_mapped_before_flush_is_dropped() {
    flush_during_output_mapping(Hold::AfterMap);
}

#[test]
fn test_surface_release_is_idempotent() {
    let rig = Rig::new();
    let (proxy, recorder) = rig.proxy(SessionConfig::default().with_surface(7));
    rig.settle();

    proxy.input(&payload(0, 20), frame(0), None).unwrap();
    proxy.input(&payload(1, 20), frame(1), None).unwrap();
    rig.settle();

    let outputs = recorder.outputs();
    assert_eq!(outputs.len(), 2);
    assert!(outputs.iter().all(|(_, bytes)| bytes.is_none()));
    let (first, second) = (outputs[0].0, outputs[1].0);

    let err = proxy.release_output(&second, true).unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    proxy.release_output(&first, true).unwrap();
    proxy.release_output(&first, true).unwrap();
    proxy.release_output(&second, true).unwrap();

    assert_eq!(rig.factory.drivers()[0].stats().rendered_outputs, 2);
    let stats = rig
        .latest()
        .host()
        .session_stats(proxy.session_id())
        .unwrap();
    assert_eq!(stats.sent_outputs, 0);
    assert_eq!(stats.output_pool.total_bytes, 0);
}

#[test]
fn test_release_twice_is_inert() {
    let rig = Rig::new();
    let (proxy, recorder) = rig.proxy(SessionConfig::default());
    rig.settle();
    proxy.input(&payload(3, 10), frame(0), None).unwrap();
    rig.settle();
    let sample = recorder.samples()[0];

    // Leave work queued in the codec when releasing.
    proxy.input(&payload(4, 10), frame(1), None).unwrap();
    rig.connector.sync();
    let before = recorder.seen();

    assert!(proxy.release());
    assert!(!proxy.release());
    assert!(proxy.is_released());
    rig.settle();

    assert_eq!(recorder.seen(), before);
    assert!(recorder.errors().is_empty());
    assert!(matches!(
        proxy.input(&payload(5, 10), frame(2), None),
        Err(Error::SessionEnded)
    ));
    proxy.release_output(&sample, true).unwrap();
    assert!(matches!(proxy.flush(), Err(Error::SessionEnded)));

    assert!(!rig.manager.is_connected());
    assert_eq!(rig.manager.active_sessions(), 0);
    assert!(!rig.latest().is_alive());
    drop(proxy);
    assert!(recorder.errors().is_empty());
}

#[test]
fn test_connection_shared_and_refcounted() {
    let rig = Rig::new();
    let (first, _) = rig.proxy(SessionConfig::default());
    let (second, _) = rig.proxy(SessionConfig::decoder(MediaFormat::audio(Codec::Opus)));

    assert_eq!(rig.connector.connections().len(), 1);
    assert_eq!(rig.manager.active_sessions(), 2);
    assert_eq!(rig.latest().host().len(), 2);

    drop(first);
    assert!(rig.manager.is_connected());
    assert_eq!(rig.latest().host().len(), 1);

    drop(second);
    assert!(!rig.manager.is_connected());
    assert!(!rig.latest().is_alive());

    let (_third, _) = rig.proxy(SessionConfig::default());
    assert_eq!(rig.connector.connections().len(), 2);
    assert!(rig.latest().is_alive());
}

#[test]
fn test_capabilities_reported() {
    let rig = Rig::new();
    let (video, _) = rig.proxy(SessionConfig::default());
    assert!(video.is_adaptive_playback_supported());
    assert!(!video.is_tunneled_playback_supported());

    let (audio, _) = rig.proxy(SessionConfig::decoder(MediaFormat::audio(Codec::Aac)));
    assert!(!audio.is_adaptive_playback_supported());
}

#[test]
fn test_unsupported_codec_rejected() {
    let rig = Rig::new();
    rig.factory.set_supported(Codec::Vp9, false);

    let recorder = Arc::new(common::Recorder::default());
    let config = SessionConfig::decoder(MediaFormat::video(Codec::Vp9, 1280, 720));
    let err = CodecProxy::create(&rig.manager, config, recorder).unwrap_err();
    assert!(matches!(err, Error::CodecRejected(_)));

    assert_eq!(rig.manager.active_sessions(), 0);
    assert!(!rig.manager.is_connected());
}

#[test]
fn test_invalid_config_rejected_before_connecting() {
    let rig = Rig::new();
    let recorder = Arc::new(common::Recorder::default());
    let config = SessionConfig::decoder(MediaFormat::video(Codec::H264, 0, 720));
    let err = CodecProxy::create(&rig.manager, config, recorder).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(rig.connector.connections().is_empty());
}

#[test]
fn test_end_of_stream_needs_no_payload() {
    let rig = Rig::new();
    let (proxy, recorder) = rig.proxy(SessionConfig::default());
    rig.settle();

    proxy.input(&payload(0, 8), frame(0), None).unwrap();
    proxy
        .input(&[], SampleInfo::end_of_stream(1000), None)
        .unwrap();
    rig.settle();

    let samples = recorder.samples();
    assert_eq!(samples.len(), 2);
    assert!(!samples[0].info.is_end_of_stream());
    assert!(samples[1].info.is_end_of_stream());
    assert_eq!(samples[1].info.timestamp_us, 1000);
}

#[test]
fn test_allocation_failure_is_local() {
    let rig = Rig::new();
    let config = SessionConfig {
        input_pool: PoolConfig {
            max_total_bytes: 128 * 1024,
            ..PoolConfig::default()
        },
        ..SessionConfig::default()
    };
    let (proxy, recorder) = rig.proxy(config);
    rig.settle();

    let err = proxy
        .input(&payload(0, 200 * 1024), frame(0), None)
        .unwrap_err();
    assert!(matches!(err, Error::Allocation(_)));
    assert!(recorder.errors().is_empty());

    proxy.input(&payload(1, 100), frame(1), None).unwrap();
    rig.settle();
    assert_eq!(recorder.samples().len(), 1);
}

#[test]
fn test_concurrent_inputs_keep_per_thread_order() {
    let rig = Rig::new();
    let (proxy, recorder) = rig.proxy(SessionConfig::default());
    let proxy = Arc::new(proxy);
    rig.settle();

    let feeders: Vec<_> = (0..2i64)
        .map(|feeder| {
            let proxy = proxy.clone();
            thread::spawn(move || {
                for i in 0..8i64 {
                    let timestamp = feeder * 1_000_000 + i;
                    proxy
                        .input(&payload(i as u8, 24), frame(timestamp), None)
                        .unwrap();
                }
            })
        })
        .collect();

    let mut released = 0;
    for _ in 0..10_000 {
        rig.settle();
        let samples = recorder.samples();
        for sample in &samples[released..] {
            proxy.release_output(sample, true).unwrap();
        }
        released = samples.len();
        if released == 16 && feeders.iter().all(|feeder| feeder.is_finished()) {
            break;
        }
        thread::yield_now();
    }
    for feeder in feeders {
        feeder.join().unwrap();
    }
    rig.settle();

    let samples = recorder.samples();
    assert_eq!(samples.len(), 16);
    for feeder in 0..2i64 {
        let timestamps: Vec<i64> = samples
            .iter()
            .map(|sample| sample.info.timestamp_us)
            .filter(|ts| ts / 1_000_000 == feeder)
            .collect();
        assert_eq!(timestamps.len(), 8);
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
    }
    assert!(recorder.errors().is_empty());
}
