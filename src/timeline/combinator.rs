use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kurbo::Rect;
use tokio::sync::mpsc;

use crate::clip::{Clip, ClipMeta, ClipState};
use crate::codec::CodecFactory;
use crate::foundation::core::{Fps, UNBOUNDED};
use crate::foundation::error::{MontageError, MontageResult};
use crate::remux::{RemuxEngine, RemuxOptions};
use crate::stream::byte_stream::{OUTPUT_CHANNEL_CAPACITY, spawn_flusher};
use crate::stream::{ByteStream, Supervisor, TickScheduler};
use crate::timeline::composite::Canvas;
use crate::timeline::mix::AudioMixer;
use crate::timeline::{CombinatorOpts, Placement};

const BACKPRESSURE_POLL: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Waiting,
    Playing,
    Ended,
}

struct Entry {
    clip: Box<dyn Clip>,
    meta: ClipMeta,
    offset: i64,
    duration: i64,
    rect: Rect,
    volume: f32,
    mix_slot: Option<usize>,
    phase: Phase,
}

impl Entry {
    fn end(&self) -> i64 {
        self.offset.saturating_add(self.duration)
    }

    fn retire(&mut self) {
        if self.phase != Phase::Ended {
            self.clip.destroy();
            self.phase = Phase::Ended;
        }
    }
}

/// Places clips on a timeline and renders them into one fragmented MP4 stream.
pub struct Combinator {
    opts: CombinatorOpts,
    codecs: Arc<dyn CodecFactory>,
    entries: Vec<Entry>,
}

impl Combinator {
    pub fn new(opts: CombinatorOpts, codecs: Arc<dyn CodecFactory>) -> MontageResult<Self> {
        opts.validate()?;
        Ok(Self {
            opts,
            codecs,
            entries: Vec::new(),
        })
    }

    pub fn options(&self) -> &CombinatorOpts {
        &self.opts
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Timeline length: the latest entry end, or 0 when empty.
    pub fn duration(&self) -> i64 {
        self.entries.iter().map(Entry::end).max().unwrap_or(0)
    }

    /// Waits for the clip to become ready and registers it.
    #[tracing::instrument(skip_all, fields(offset = placement.offset))]
    pub async fn add(
        &mut self,
        mut clip: Box<dyn Clip>,
        placement: Placement,
    ) -> MontageResult<()> {
        let resolved = match clip.ready().await {
            Ok(meta) => self.resolve(&meta, &placement).map(|(d, r)| (meta, d, r)),
            Err(e) => Err(e),
        };
        let (meta, duration, rect) = match resolved {
            Ok(v) => v,
            Err(e) => {
                clip.destroy();
                return Err(e);
            }
        };
        tracing::debug!(
            duration,
            video = meta.has_video(),
            audio = meta.audio.is_some(),
            "clip added"
        );
        self.entries.push(Entry {
            clip,
            meta,
            offset: placement.offset,
            duration,
            rect,
            volume: placement.volume,
            mix_slot: None,
            phase: Phase::Waiting,
        });
        Ok(())
    }

    /// Effective duration and canvas rect of a placement.
    fn resolve(&self, meta: &ClipMeta, placement: &Placement) -> MontageResult<(i64, Rect)> {
        if placement.offset < 0 {
            return Err(MontageError::config("placement offset must not be negative"));
        }
        if !(placement.volume.is_finite() && placement.volume >= 0.0) {
            return Err(MontageError::config(
                "placement volume must be a non-negative number",
            ));
        }
        let duration = placement.duration.unwrap_or(meta.duration);
        if duration == UNBOUNDED {
            return Err(MontageError::config(
                "clip has no natural end; the placement needs a duration",
            ));
        }
        if duration <= 0 {
            return Err(MontageError::config("placement duration must be positive"));
        }
        let rect = match (placement.rect, &self.opts.video) {
            (Some(rect), _) => rect,
            (None, Some(v)) => Rect::new(0.0, 0.0, f64::from(v.width), f64::from(v.height)),
            (None, None) => Rect::ZERO,
        };
        Ok((duration, rect))
    }

    /// Starts the composition and returns its output. Must be called within a tokio runtime.
    ///
    /// Fails immediately for an empty timeline or when the encoders cannot be created.
    #[tracing::instrument(skip_all, fields(entries = self.entries.len()))]
    pub fn output(self) -> MontageResult<ByteStream> {
        let Self {
            opts,
            codecs,
            mut entries,
        } = self;
        if entries.is_empty() {
            return Err(MontageError::sequence(
                "empty timeline: add at least one clip before calling output()",
            ));
        }

        let fps = opts.fps;
        let end = entries.iter().map(Entry::end).max().unwrap_or(0);
        let ticks = fps.ticks_until(end);
        let total = fps.tick_time(ticks);

        let supervisor = Supervisor::new();
        let scheduler = TickScheduler::start(opts.scheduler_interval());
        let engine = RemuxEngine::new(
            RemuxOptions {
                video: opts.video.as_ref().map(|v| v.encoder_config(fps)),
                audio: opts.audio.as_ref().map(|a| a.encoder_config()),
                fragment_duration: opts.fragment_duration,
                tags: opts.tags.clone(),
                duration_hint: Some(total),
                scheduler_interval: opts.scheduler_interval(),
            },
            codecs.as_ref(),
            &scheduler,
            supervisor.clone(),
        );
        let engine = match engine {
            Ok(engine) => engine,
            Err(e) => {
                scheduler.shutdown();
                for entry in &mut entries {
                    entry.retire();
                }
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let flusher = spawn_flusher(
            engine.muxer(),
            scheduler.subscribe(opts.flush_interval()),
            tx,
            supervisor.clone(),
            engine.mux_finished(),
        );

        let mut mixer = opts
            .audio
            .as_ref()
            .map(|a| AudioMixer::new(a.sample_rate, a.channels));
        if let Some(mixer) = mixer.as_mut() {
            for entry in entries.iter_mut().filter(|e| e.meta.audio.is_some()) {
                entry.mix_slot = Some(mixer.add_entry(entry.offset, entry.volume));
            }
        }
        let canvas = opts
            .video
            .as_ref()
            .map(|v| Canvas::new(v.width, v.height, v.background()));

        tracing::info!(ticks, duration = total, "composition started");
        let mut job = Composition {
            entries,
            engine,
            canvas,
            mixer,
            fps,
            ticks,
            gop_size: opts.video.as_ref().map_or(1, |v| u64::from(v.gop_size)),
            max_encode_queue: opts.max_encode_queue,
            supervisor: supervisor.clone(),
        };
        let task_supervisor = supervisor.clone();
        tokio::spawn(async move {
            let result = job.run().await;
            job.retire_all();
            match result {
                Ok(()) => tracing::info!("composition finished"),
                Err(e) if e.is_cancelled() => {
                    job.engine.close();
                    tracing::debug!("composition cancelled");
                }
                Err(e) => {
                    job.engine.close();
                    task_supervisor.fail(e);
                }
            }
            if let Err(e) = flusher.await {
                tracing::warn!(error = %e, "flush task ended abnormally");
            }
            scheduler.shutdown();
        });

        Ok(ByteStream::new(rx, supervisor))
    }
}

/// State of a running composition, owned by its task.
struct Composition {
    entries: Vec<Entry>,
    engine: RemuxEngine,
    canvas: Option<Canvas>,
    mixer: Option<AudioMixer>,
    fps: Fps,
    ticks: u64,
    gop_size: u64,
    max_encode_queue: usize,
    supervisor: Supervisor,
}

impl Composition {
    async fn run(&mut self) -> MontageResult<()> {
        for i in 0..=self.ticks {
            if self.supervisor.is_cancelled() {
                return Err(MontageError::Cancelled);
            }
            if self.supervisor.stop_requested() {
                tracing::debug!(tick = i, "stop requested");
                if i > 0 {
                    self.mix(i)?;
                }
                break;
            }
            self.wait_for_encoders().await?;
            self.tick(i).await?;
        }
        self.retire_all();
        cancellable(&self.supervisor, self.engine.finish()).await
    }

    fn retire_all(&mut self) {
        for entry in &mut self.entries {
            entry.retire();
        }
    }

    async fn wait_for_encoders(&mut self) -> MontageResult<()> {
        while self.engine.queue_size() > self.max_encode_queue {
            if self.supervisor.is_cancelled() {
                return Err(MontageError::Cancelled);
            }
            tokio::time::sleep(BACKPRESSURE_POLL).await;
        }
        Ok(())
    }

    /// Tick `i` renders video frame `i` at `t_i` and mixes the audio span `[t_{i-1}, t_i)`.
    /// The extra tick at `i == ticks` only closes entries and audio.
    async fn tick(&mut self, i: u64) -> MontageResult<()> {
        let t = self.fps.tick_time(i);
        let last = i == self.ticks;
        let Self {
            entries,
            canvas,
            mixer,
            supervisor,
            ..
        } = self;

        for entry in entries.iter_mut() {
            if entry.phase == Phase::Ended || t < entry.offset {
                continue;
            }
            let ending = t >= entry.end();
            let local = if ending {
                entry.duration
            } else {
                t - entry.offset
            };
            entry.phase = Phase::Playing;
            let out = cancellable(supervisor, entry.clip.tick(local)).await?;

            if let (Some(mixer), Some(slot)) = (mixer.as_mut(), entry.mix_slot) {
                for data in &out.audio {
                    mixer.push(slot, data)?;
                }
            }
            if !ending
                && let (Some(canvas), Some(frame)) = (canvas.as_mut(), out.video.as_ref())
            {
                canvas.draw(frame, entry.rect);
            }
            if ending || out.state == ClipState::Done {
                entry.retire();
            }
        }

        if !last && let Some(canvas) = self.canvas.as_mut() {
            let next = self.fps.tick_time(i + 1);
            let frame = canvas.snapshot(t, next - t)?;
            canvas.clear();
            self.engine.encode_video(frame, i % self.gop_size == 0)?;
        }
        if i > 0 {
            self.mix(i)?;
        }
        Ok(())
    }

    fn mix(&mut self, i: u64) -> MontageResult<()> {
        let Some(mixer) = self.mixer.as_mut() else {
            return Ok(());
        };
        let block = mixer.mix(self.fps.tick_time(i - 1), self.fps.tick_time(i))?;
        self.engine.encode_audio(block)
    }
}

async fn cancellable<T>(
    supervisor: &Supervisor,
    fut: impl Future<Output = MontageResult<T>>,
) -> MontageResult<T> {
    tokio::select! {
        biased;
        _ = supervisor.cancelled() => Err(MontageError::Cancelled),
        res = fut => res,
    }
}

#[cfg(test)]
#[path = "../../tests/unit/timeline/combinator.rs"]
mod tests;
