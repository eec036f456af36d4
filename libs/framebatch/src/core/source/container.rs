// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Container source: demuxes the first video stream of an MP4/MKV/... input
//! and forwards its packets, already framed, to the bound decoder.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use ffmpeg_next as ffmpeg;
use tracing::{debug, info, warn};

use crate::core::decode::VideoDecode;
use crate::core::driver::Codec;
use crate::core::source::MediaSource;
use crate::core::{PipelineError, Result};

fn map_codec(id: ffmpeg::codec::Id) -> Result<Codec> {
    match id {
        ffmpeg::codec::Id::H264 => Ok(Codec::H264),
        ffmpeg::codec::Id::HEVC => Ok(Codec::Hevc),
        other => Err(PipelineError::Unsupported(format!(
            "container video codec {other:?}"
        ))),
    }
}

/// Open `path` and report the codec of its first video stream, so the
/// caller can construct a matching decoder before the source starts.
pub fn probe_codec(path: impl AsRef<Path>) -> Result<Codec> {
    let path = path.as_ref();
    ffmpeg::init().map_err(|err| PipelineError::SourceOpen(format!("ffmpeg init: {err}")))?;
    let ictx = ffmpeg::format::input(&path)
        .map_err(|err| PipelineError::SourceOpen(format!("{}: {err}", path.display())))?;
    let stream = ictx
        .streams()
        .best(ffmpeg::media::Type::Video)
        .ok_or_else(|| {
            PipelineError::SourceOpen(format!("{}: no video stream", path.display()))
        })?;
    map_codec(stream.parameters().id())
}

/// Demuxing implementation of [`MediaSource`].
pub struct ContainerSource {
    stop: Arc<AtomicBool>,
    eof: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl ContainerSource {
    pub fn new(path: impl AsRef<Path>, decoder: Arc<dyn VideoDecode>) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_owned();
        // Validate up front so open failures surface synchronously.
        probe_codec(&path)?;

        let stop = Arc::new(AtomicBool::new(false));
        let eof = Arc::new(AtomicBool::new(false));
        let reader = {
            let stop = stop.clone();
            let eof = eof.clone();
            std::thread::Builder::new()
                .name("demux-reader".into())
                .spawn(move || {
                    if let Err(err) = demux_loop(&path, decoder.as_ref(), &stop) {
                        warn!(path = %path.display(), %err, "demuxer terminated stream");
                    }
                    eof.store(true, Ordering::Release);
                })
                .map_err(|err| PipelineError::SourceOpen(format!("spawn demuxer: {err}")))?
        };
        Ok(Self {
            stop,
            eof,
            reader: Some(reader),
        })
    }
}

fn demux_loop(path: &Path, decoder: &dyn VideoDecode, stop: &AtomicBool) -> Result<()> {
    let mut ictx = ffmpeg::format::input(&path)
        .map_err(|err| PipelineError::SourceOpen(format!("{}: {err}", path.display())))?;
    let video_index = ictx
        .streams()
        .best(ffmpeg::media::Type::Video)
        .map(|s| s.index())
        .ok_or_else(|| {
            PipelineError::SourceOpen(format!("{}: no video stream", path.display()))
        })?;

    let mut result = Ok(());
    for (stream, packet) in ictx.packets() {
        if stop.load(Ordering::Acquire) {
            debug!(path = %path.display(), "demuxer stopping on request");
            break;
        }
        if stream.index() != video_index {
            continue;
        }
        let Some(data) = packet.data() else {
            continue;
        };
        if data.is_empty() {
            // An empty payload would read as the EOS marker downstream.
            continue;
        }
        match decoder.input_stream(data, packet.pts().unwrap_or(0)) {
            Ok(()) => {}
            Err(PipelineError::ShuttingDown) => break,
            Err(err) => {
                result = Err(PipelineError::SourceRead(err.to_string()));
                break;
            }
        }
    }
    info!(path = %path.display(), "end of container stream");
    if let Err(err) = decoder.input_stream(&[], 0) {
        debug!(path = %path.display(), %err, "EOS marker not accepted");
    }
    result
}

impl MediaSource for ContainerSource {
    fn eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl Drop for ContainerSource {
    fn drop(&mut self) {
        self.stop();
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("demux reader thread panicked");
            }
        }
    }
}
