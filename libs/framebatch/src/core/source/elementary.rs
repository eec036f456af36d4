// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Raw elementary-stream source.
//!
//! Reads fixed-size chunks with no framing; the parser recovers unit
//! boundaries on its own. Optionally restarts from the beginning on EOF
//! (loop playback) until stopped.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::core::decode::VideoDecode;
use crate::core::source::MediaSource;
use crate::core::{PipelineError, Result};

/// Read granularity for raw streams.
const CHUNK_LEN: usize = 1024;

/// Elementary-stream implementation of [`MediaSource`].
#[derive(Debug)]
pub struct ElementaryStreamSource {
    stop: Arc<AtomicBool>,
    eof: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl ElementaryStreamSource {
    /// Open `path` and start forwarding it to `decoder`.
    ///
    /// Fails with [`PipelineError::SourceOpen`] when the file cannot be
    /// opened; read failures after that terminate the stream through the
    /// EOS marker instead.
    pub fn new(
        path: impl AsRef<Path>,
        decoder: Arc<dyn VideoDecode>,
        loop_playback: bool,
    ) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_owned();
        let file = File::open(&path)
            .map_err(|err| PipelineError::SourceOpen(format!("{}: {err}", path.display())))?;

        let stop = Arc::new(AtomicBool::new(false));
        let eof = Arc::new(AtomicBool::new(false));
        let reader = {
            let stop = stop.clone();
            let eof = eof.clone();
            std::thread::Builder::new()
                .name("media-reader".into())
                .spawn(move || {
                    reader_loop(path, file, decoder.as_ref(), &stop, loop_playback);
                    eof.store(true, Ordering::Release);
                })
                .map_err(|err| PipelineError::SourceOpen(format!("spawn reader: {err}")))?
        };
        Ok(Self {
            stop,
            eof,
            reader: Some(reader),
        })
    }
}

fn reader_loop(
    path: PathBuf,
    mut file: File,
    decoder: &dyn VideoDecode,
    stop: &AtomicBool,
    loop_playback: bool,
) {
    let mut chunk = [0u8; CHUNK_LEN];
    loop {
        if stop.load(Ordering::Acquire) {
            debug!(path = %path.display(), "reader stopping on request");
            break;
        }
        let read = match file.read(&mut chunk) {
            Ok(read) => read,
            Err(err) => {
                // Terminate the stream; the EOS marker below lets the
                // decoder drain what it already has.
                warn!(path = %path.display(), %err, "read failed, ending stream");
                break;
            }
        };
        if read == 0 {
            if loop_playback && !stop.load(Ordering::Acquire) {
                if let Err(err) = file.seek(SeekFrom::Start(0)) {
                    warn!(path = %path.display(), %err, "rewind failed, ending stream");
                    break;
                }
                continue;
            }
            info!(path = %path.display(), "end of source file");
            break;
        }
        match decoder.input_stream(&chunk[..read], 0) {
            Ok(()) => {}
            Err(PipelineError::ShuttingDown) => break,
            Err(err) => {
                // Parser rejections recover at the next keyframe; keep
                // feeding.
                warn!(path = %path.display(), %err, "parser rejected chunk");
            }
        }
    }
    if let Err(err) = decoder.input_stream(&[], 0) {
        debug!(path = %path.display(), %err, "EOS marker not accepted");
    }
}

impl MediaSource for ElementaryStreamSource {
    fn eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl Drop for ElementaryStreamSource {
    fn drop(&mut self) {
        self.stop();
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("media reader thread panicked");
            }
        }
    }
}
