// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! End-to-end pipeline scenarios over the emulated driver: whole-stream
//! batching, cross-stream interleave, overflow policies under a slow
//! consumer, mid-stream resolution changes, and mid-drain shutdown.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use framebatch::core::batch::FrameBatchCallback;
use framebatch::core::driver::emulated::{clip_bytes, EmulatedDriver};
use framebatch::{
    BatchConfig, Coordinator, DecoderConfig, PipelineStages, QueueStrategy, StageConfig,
    StageWork, StreamId,
};

#[derive(Debug, Clone, Copy)]
struct Seen {
    stream: StreamId,
    frame_no: u64,
    timestamp: u64,
    width: u32,
    last: bool,
}

type Batches = Arc<Mutex<Vec<Vec<Seen>>>>;

/// Collector callback, optionally holding each batch for `hold` to model a
/// slow downstream consumer.
fn collector(hold: Duration) -> (Batches, FrameBatchCallback) {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    let callback: FrameBatchCallback = Box::new(move |batch| {
        let seen = batch
            .drain(..)
            .map(|f| Seen {
                stream: f.stream,
                frame_no: f.frame_no,
                timestamp: f.timestamp,
                width: f.width,
                last: f.last,
            })
            .collect();
        sink.lock().unwrap().push(seen);
        if !hold.is_zero() {
            std::thread::sleep(hold);
        }
    });
    (batches, callback)
}

fn clip_file(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".h264")
        .tempfile()
        .expect("temp file");
    file.write_all(bytes).expect("write clip");
    file.flush().expect("flush");
    file
}

fn total_seen(batches: &Batches) -> usize {
    batches.lock().unwrap().iter().map(Vec::len).sum()
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn single_stream_emits_full_batches_and_a_timer_partial() {
    let (batches, callback) = collector(Duration::ZERO);
    let driver = Arc::new(EmulatedDriver::new());
    let config = BatchConfig {
        batch_size: 8,
        timeout_ms: 50,
        ..BatchConfig::default()
    };
    let coordinator = Coordinator::new(driver, config, callback).expect("coordinator");
    let clip = clip_file(&clip_bytes(320, 240, 300));
    coordinator.add_video(clip.path()).expect("add video");

    assert!(
        wait_until(Duration::from_secs(10), || total_seen(&batches) == 300),
        "saw {} of 300 frames",
        total_seen(&batches)
    );
    coordinator.shutdown();

    let got = batches.lock().unwrap();
    let full: Vec<_> = got.iter().filter(|b| b.len() == 8).collect();
    assert_eq!(full.len(), 37, "37 full batches of 8");
    let partials: Vec<_> = got.iter().filter(|b| b.len() < 8).collect();
    assert_eq!(partials.len(), 1, "one timer-flushed partial");
    assert_eq!(partials[0].len(), 4);

    let flat: Vec<&Seen> = got.iter().flatten().collect();
    assert_eq!(flat.len(), 300);
    assert!(flat.last().unwrap().last, "final frame carries last=true");
    assert_eq!(flat.iter().filter(|s| s.last).count(), 1);
    let frame_nos: Vec<u64> = flat.iter().map(|s| s.frame_no).collect();
    assert_eq!(frame_nos, (0..300).collect::<Vec<_>>());
}

#[test]
fn two_streams_interleave_into_shared_batches() {
    let (batches, callback) = collector(Duration::ZERO);
    let driver = Arc::new(EmulatedDriver::new());
    let config = BatchConfig {
        batch_size: 4,
        timeout_ms: 50,
        ..BatchConfig::default()
    };
    let coordinator = Coordinator::new(driver, config, callback).expect("coordinator");
    let clip_a = clip_file(&clip_bytes(320, 240, 100));
    let clip_b = clip_file(&clip_bytes(320, 240, 100));
    let id_a = coordinator.add_video(clip_a.path()).expect("stream a");
    let id_b = coordinator.add_video(clip_b.path()).expect("stream b");

    assert!(
        wait_until(Duration::from_secs(10), || total_seen(&batches) == 200),
        "saw {} of 200 frames",
        total_seen(&batches)
    );
    coordinator.shutdown();

    let got = batches.lock().unwrap();
    assert_eq!(got.len(), 50, "200 frames in batches of 4");
    assert!(got.iter().all(|b| b.len() == 4));

    // Exactly 100 frames per stream reached the callback, in order.
    for id in [id_a, id_b] {
        let frames: Vec<u64> = got
            .iter()
            .flatten()
            .filter(|s| s.stream == id)
            .map(|s| s.frame_no)
            .collect();
        assert_eq!(frames, (0..100).collect::<Vec<_>>(), "{id}");
    }
}

fn overflow_run(strategy: QueueStrategy) -> Vec<Seen> {
    let (batches, callback) = collector(Duration::from_millis(100));
    let driver = Arc::new(EmulatedDriver::new());
    let config = BatchConfig {
        batch_size: 4,
        timeout_ms: 50,
        decoder: DecoderConfig {
            queue_len: 4,
            strategy,
            ..DecoderConfig::default()
        },
        ..BatchConfig::default()
    };
    let coordinator = Coordinator::new(driver, config, callback).expect("coordinator");
    let clip = clip_file(&clip_bytes(320, 240, 60));
    coordinator.add_video(clip.path()).expect("add video");

    assert!(
        wait_until(Duration::from_secs(10), || coordinator.streams_finished()),
        "stream never finished"
    );
    // Let the tail flush through the timer before stopping.
    wait_until(Duration::from_secs(2), || {
        batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .any(|s| s.last)
    });
    coordinator.shutdown();
    let got = batches.lock().unwrap();
    got.iter().flatten().copied().collect()
}

#[test]
fn drop_oldest_under_slow_consumer_skips_but_stays_ordered() {
    let seen = overflow_run(QueueStrategy::DropOldest);
    assert!(!seen.is_empty());
    assert!(seen.len() < 60, "a slow consumer must cost frames");
    // Strictly increasing synthesized timestamps, no duplicates.
    assert!(seen.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    // At least one gap where dropped frames went missing (normal spacing
    // is ~400_000 ticks at the emulated 25 fps).
    let max_delta = seen
        .windows(2)
        .map(|w| w[1].timestamp - w[0].timestamp)
        .max()
        .unwrap_or(0);
    assert!(max_delta > 600_000, "expected a drop gap, max delta {max_delta}");
}

#[test]
fn drop_newest_under_slow_consumer_keeps_the_early_frames() {
    let seen = overflow_run(QueueStrategy::DropNewest);
    assert!(!seen.is_empty());
    assert!(seen.len() < 60, "a slow consumer must cost frames");
    assert!(seen.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    // The first queued frames survive under drop-newest.
    assert_eq!(seen[0].timestamp, seen.iter().map(|s| s.timestamp).min().unwrap());
}

#[test]
fn mid_stream_resolution_change_recreates_and_reuses() {
    let (batches, callback) = collector(Duration::ZERO);
    let driver = Arc::new(EmulatedDriver::new());
    let memory = driver.emulated_memory();
    let config = BatchConfig {
        batch_size: 8,
        timeout_ms: 50,
        ..BatchConfig::default()
    };
    let coordinator = Coordinator::new(driver, config, callback).expect("coordinator");
    let mut clip = clip_bytes(1280, 720, 150);
    clip.extend_from_slice(&clip_bytes(1920, 1080, 150));
    let clip = clip_file(&clip);
    coordinator.add_video(clip.path()).expect("add video");

    assert!(
        wait_until(Duration::from_secs(20), || total_seen(&batches) == 300),
        "saw {} of 300 frames",
        total_seen(&batches)
    );
    coordinator.shutdown();

    let got = batches.lock().unwrap();
    let widths: Vec<u32> = got.iter().flatten().map(|s| s.width).collect();
    assert_eq!(widths.len(), 300);
    assert!(widths[..150].iter().all(|&w| w == 1280));
    assert!(widths[150..].iter().all(|&w| w == 1920));
    // One transition only: the decoder was recreated exactly once.
    let transitions = widths.windows(2).filter(|w| w[0] != w[1]).count();
    assert_eq!(transitions, 1);
    // The device pool absorbed the growth and went back to steady-state
    // reuse: far fewer allocations than frames.
    assert!(
        memory.total_allocs() < 80,
        "expected pooled reuse across the change, saw {} allocations",
        memory.total_allocs()
    );
}

#[test]
fn shutdown_mid_drain_releases_everything_quickly() {
    let slow = Arc::new(AtomicBool::new(true));
    let work: StageWork = {
        let slow = slow.clone();
        Arc::new(move |stage, _frame| {
            if stage == 1 && slow.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(5));
            }
        })
    };
    let stages = Arc::new(
        PipelineStages::new(
            &StageConfig {
                stages: 2,
                workers: 2,
                queue_depth: 16,
            },
            work,
        )
        .expect("pipeline"),
    );

    let driver = Arc::new(EmulatedDriver::new());
    let memory = driver.emulated_memory();
    let config = BatchConfig {
        batch_size: 8,
        timeout_ms: 50,
        ..BatchConfig::default()
    };
    let coordinator =
        Coordinator::new(driver, config, stages.batch_callback()).expect("coordinator");
    let pipe = coordinator.pipe();
    let clip = clip_file(&clip_bytes(320, 240, 300));
    coordinator.add_video(clip.path()).expect("add video");

    // Let roughly the first 50 frames through, then cancel mid-drain.
    std::thread::sleep(Duration::from_millis(100));
    slow.store(false, Ordering::Relaxed);
    let t0 = Instant::now();
    coordinator.shutdown();
    let shutdown_took = t0.elapsed();
    assert!(
        shutdown_took < Duration::from_millis(1500),
        "shutdown took {shutdown_took:?}"
    );

    // Stage workers drain and release every pinned handle.
    drop(stages);
    assert!(
        wait_until(Duration::from_secs(2), || pipe.frames_busy() == 0),
        "{} frame handles still pinned",
        pipe.frames_busy()
    );
    assert_eq!(pipe.ring_pending(), 0);
    let device_pool = pipe.device_pool();
    assert_eq!(device_pool.busy_len(), 0, "no device buffer leaked");

    drop(device_pool);
    drop(pipe);
    drop(coordinator);
    assert_eq!(memory.outstanding(), 0, "pool teardown reclaimed all VRAM");
}
