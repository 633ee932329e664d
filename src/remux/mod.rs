//! Encoder fan-out and container assembly.
//!
//! [`RemuxEngine`] owns one audio encoder and two video encoders that code alternate GOPs. A pump
//! task, driven by the composition's [`TickScheduler`], drains encoder events, restores
//! presentation order through [`GopMerger`] and appends samples to the shared [`Mp4Muxer`].

pub mod gop;
pub(crate) mod track_sync;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, error::TryRecvError};
use tokio::task::JoinHandle;

use crate::codec::{
    AudioEncoder, AudioEncoderConfig, CodecFactory, EncodeOptions, EncoderEvent, VideoEncoder,
    VideoEncoderConfig,
};
use crate::foundation::error::{MontageError, MontageResult};
use crate::foundation::signal::OnceSignal;
use crate::media::chunk::{EncodedChunk, TrackConfig};
use crate::media::frame::{AudioData, VideoFrame};
use crate::mp4::{MuxerOptions, Mp4Muxer, Sample, TrackSet};
use crate::stream::{Subscription, Supervisor, TickScheduler};

pub use gop::GopMerger;
use track_sync::TrackSync;

#[derive(Clone, Debug)]
pub struct RemuxOptions {
    pub video: Option<VideoEncoderConfig>,
    pub audio: Option<AudioEncoderConfig>,
    /// Fragment length when there is no video track to cut at keyframes.
    pub fragment_duration: i64,
    pub tags: Vec<(String, String)>,
    pub duration_hint: Option<i64>,
    pub scheduler_interval: Duration,
}

struct VideoLane {
    encoders: [Box<dyn VideoEncoder>; 2],
    gop: u64,
    frames: u64,
}

pub struct RemuxEngine {
    video: Option<VideoLane>,
    audio: Option<Box<dyn AudioEncoder>>,
    muxer: Arc<Mutex<Mp4Muxer>>,
    tracks_ready: OnceSignal,
    mux_finished: OnceSignal,
    supervisor: Supervisor,
    pump: Option<JoinHandle<()>>,
}

impl RemuxEngine {
    /// Creates and configures the encoders, then starts the pump task.
    pub fn new(
        opts: RemuxOptions,
        codecs: &dyn CodecFactory,
        scheduler: &TickScheduler,
        supervisor: Supervisor,
    ) -> MontageResult<Self> {
        if opts.video.is_none() && opts.audio.is_none() {
            return Err(MontageError::config(
                "remux engine needs a video or an audio track",
            ));
        }
        let muxer = Mp4Muxer::new(MuxerOptions {
            tracks: TrackSet {
                video: opts.video.is_some(),
                audio: opts.audio.is_some(),
            },
            fragment_duration: opts.fragment_duration,
            tags: opts.tags.clone(),
            duration_hint: opts.duration_hint,
        })?;
        let muxer = Arc::new(Mutex::new(muxer));

        let mut video_rx = Vec::new();
        let mut frame_interval = 1;
        let video = match &opts.video {
            Some(cfg) => {
                frame_interval = cfg.framerate.frame_interval();
                let mut make = || -> MontageResult<Box<dyn VideoEncoder>> {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let mut enc = codecs.video_encoder(&cfg.codec, tx)?;
                    enc.configure(cfg)?;
                    video_rx.push(rx);
                    Ok(enc)
                };
                let encoders = [make()?, make()?];
                Some(VideoLane {
                    encoders,
                    gop: 0,
                    frames: 0,
                })
            }
            None => None,
        };
        let (audio, audio_rx) = match &opts.audio {
            Some(cfg) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let mut enc = codecs.audio_encoder(&cfg.codec, tx)?;
                enc.configure(cfg)?;
                (Some(enc), Some(rx))
            }
            None => (None, None),
        };

        let tracks_ready = OnceSignal::new();
        let mux_finished = OnceSignal::new();
        let pump = Pump {
            video_rx,
            audio_rx,
            video_flushed: [false; 2],
            audio_flushed: false,
            merger: GopMerger::new(frame_interval),
            sync: TrackSync::new(opts.video.is_some(), tracks_ready.clone()),
            muxer: Arc::clone(&muxer),
            mux_finished: mux_finished.clone(),
        };
        let subscription = scheduler.subscribe(opts.scheduler_interval);
        let task_supervisor = supervisor.clone();
        let handle = tokio::spawn(async move {
            match pump.run(subscription, &task_supervisor).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => tracing::debug!("remux pump cancelled"),
                Err(e) => task_supervisor.fail(e),
            }
        });

        tracing::debug!(
            video = opts.video.is_some(),
            audio = opts.audio.is_some(),
            "remux engine started"
        );
        Ok(Self {
            video,
            audio,
            muxer,
            tracks_ready,
            mux_finished,
            supervisor,
            pump: Some(handle),
        })
    }

    /// Queues one composited frame. The first frame is always a keyframe; every later keyframe
    /// request starts a new GOP on the other encoder.
    pub fn encode_video(&mut self, frame: VideoFrame, key_frame: bool) -> MontageResult<()> {
        if self.supervisor.is_cancelled() {
            return Err(MontageError::Cancelled);
        }
        let lane = self
            .video
            .as_mut()
            .ok_or_else(|| MontageError::config("composition has no video track"))?;
        let key = lane.frames == 0 || key_frame;
        if key && lane.frames > 0 {
            lane.gop += 1;
        }
        let idx = (lane.gop % 2) as usize;
        lane.encoders[idx].encode(frame, EncodeOptions { key_frame: key })?;
        lane.frames += 1;
        Ok(())
    }

    pub fn encode_audio(&mut self, data: AudioData) -> MontageResult<()> {
        if self.supervisor.is_cancelled() {
            return Err(MontageError::Cancelled);
        }
        let enc = self
            .audio
            .as_mut()
            .ok_or_else(|| MontageError::config("composition has no audio track"))?;
        enc.encode(data)
    }

    /// Combined queue depth of every encoder.
    pub fn queue_size(&self) -> usize {
        let video: usize = self
            .video
            .iter()
            .flat_map(|l| l.encoders.iter())
            .map(|e| e.queue_size())
            .sum();
        video + self.audio.as_ref().map_or(0, |a| a.queue_size())
    }

    pub fn muxer(&self) -> Arc<Mutex<Mp4Muxer>> {
        Arc::clone(&self.muxer)
    }

    /// Fires once every expected track exists and the init segment is written.
    pub fn tracks_ready(&self) -> OnceSignal {
        self.tracks_ready.clone()
    }

    /// Fires after the last fragment has been handed to the muxer.
    pub fn mux_finished(&self) -> OnceSignal {
        self.mux_finished.clone()
    }

    /// Flushes every encoder and waits until their output is in the muxer.
    pub async fn finish(&mut self) -> MontageResult<()> {
        if let Some(lane) = self.video.as_mut() {
            for enc in lane.encoders.iter_mut() {
                enc.flush()?;
            }
        }
        if let Some(enc) = self.audio.as_mut() {
            enc.flush()?;
        }
        if let Some(handle) = self.pump.take() {
            handle
                .await
                .map_err(|e| MontageError::Other(anyhow::anyhow!("remux pump panicked: {e}")))?;
        }
        self.close();
        if self.mux_finished.is_fired() {
            Ok(())
        } else {
            Err(MontageError::Cancelled)
        }
    }

    /// Releases the encoders. Queued work is discarded.
    pub fn close(&mut self) {
        if let Some(lane) = self.video.as_mut() {
            for enc in lane.encoders.iter_mut() {
                enc.close();
            }
        }
        if let Some(enc) = self.audio.as_mut() {
            enc.close();
        }
    }
}

impl Drop for RemuxEngine {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.pump.take() {
            handle.abort();
        }
    }
}

struct Pump {
    video_rx: Vec<UnboundedReceiver<EncoderEvent>>,
    audio_rx: Option<UnboundedReceiver<EncoderEvent>>,
    video_flushed: [bool; 2],
    audio_flushed: bool,
    merger: GopMerger,
    sync: TrackSync,
    muxer: Arc<Mutex<Mp4Muxer>>,
    mux_finished: OnceSignal,
}

enum Drained {
    Open,
    Flushed,
}

impl Pump {
    async fn run(
        mut self,
        subscription: Subscription,
        supervisor: &Supervisor,
    ) -> MontageResult<()> {
        loop {
            tokio::select! {
                biased;
                _ = supervisor.cancelled() => return Err(MontageError::Cancelled),
                alive = subscription.tick() => {
                    if !alive {
                        return Err(MontageError::Cancelled);
                    }
                }
            }
            if self.step()? {
                tracing::debug!("remux pump finished");
                self.mux_finished.fire();
                return Ok(());
            }
        }
    }

    fn all_flushed(&self) -> bool {
        let video = self.video_rx.is_empty() || self.video_flushed.iter().all(|f| *f);
        let audio = self.audio_rx.is_none() || self.audio_flushed;
        video && audio
    }

    /// One scheduler tick. Returns `true` once every encoder flushed and the muxer is finished.
    fn step(&mut self) -> MontageResult<bool> {
        let muxer = Arc::clone(&self.muxer);
        let mut mux = muxer
            .lock()
            .map_err(|_| MontageError::sequence("muxer lock poisoned"))?;

        for idx in 0..self.video_rx.len() {
            if self.video_flushed[idx] {
                continue;
            }
            let (events, state) = drain(&mut self.video_rx[idx])?;
            for (chunk, config) in events {
                if let Some(config) = config {
                    self.sync.on_config(&mut mux, &config)?;
                }
                self.merger.push(idx, Sample::from_chunk(&chunk));
            }
            if matches!(state, Drained::Flushed) {
                self.video_flushed[idx] = true;
            }
        }
        for s in self.merger.pop_ready()? {
            self.sync.on_video(&mut mux, s)?;
        }

        if let Some(rx) = self.audio_rx.as_mut()
            && !self.audio_flushed
        {
            let (events, state) = drain(rx)?;
            for (chunk, config) in events {
                if let Some(config) = config {
                    self.sync.on_config(&mut mux, &config)?;
                }
                self.sync.on_audio(&mut mux, Sample::from_chunk(&chunk))?;
            }
            if matches!(state, Drained::Flushed) {
                self.audio_flushed = true;
            }
        }

        if !self.all_flushed() {
            return Ok(false);
        }
        for s in self.merger.drain_all()? {
            self.sync.on_video(&mut mux, s)?;
        }
        self.sync.release_audio(&mut mux)?;
        mux.finish()?;
        Ok(true)
    }
}

type ChunkEvent = (EncodedChunk, Option<TrackConfig>);

/// Takes every event currently queued, stopping after `Flushed`.
fn drain(rx: &mut UnboundedReceiver<EncoderEvent>) -> MontageResult<(Vec<ChunkEvent>, Drained)> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(EncoderEvent::Chunk { chunk, config }) => out.push((chunk, config)),
            Ok(EncoderEvent::Flushed) => return Ok((out, Drained::Flushed)),
            Ok(EncoderEvent::Error(e)) => return Err(e),
            Err(TryRecvError::Empty) => return Ok((out, Drained::Open)),
            Err(TryRecvError::Disconnected) => {
                return Err(MontageError::sequence(
                    "encoder output closed before it was flushed",
                ));
            }
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/remux/mod.rs"]
mod tests;
