use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{AudioDecoder, CodecFactory, DecoderEvent, VideoDecoder};
use crate::demux::{DemuxEvent, Demuxer};
use crate::foundation::error::{MontageError, MontageResult};
use crate::media::chunk::{ChunkKind, EncodedChunk, MediaKind, TrackConfig};
use crate::mp4::Sample;
use crate::mp4::reader::{MovieInfo, TrackInfo};

const THROTTLE_SLEEP: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug)]
pub struct SourceOptions {
    pub decode_audio: bool,
    /// The reader pauses while this many decoded or in-flight video frames are ahead of the
    /// consumer.
    pub max_buffered_frames: usize,
    pub read_chunk: usize,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            decode_audio: true,
            max_buffered_frames: 30,
            read_chunk: 64 * 1024,
        }
    }
}

/// What the source found in the movie header.
#[derive(Clone, Debug)]
pub struct SourceReady {
    pub movie: MovieInfo,
    pub video: Option<TrackInfo>,
    pub audio: Option<TrackInfo>,
}

impl SourceReady {
    /// Number of `Flushed` events that mark the end of decoded output.
    pub fn decoder_count(&self) -> usize {
        usize::from(self.video.is_some()) + usize::from(self.audio.is_some())
    }
}

/// Background demux + decode pipeline over an async byte source.
///
/// Decoded frames arrive on `events`. Each decoded video frame the consumer takes must be
/// acknowledged with [`FrameSource::frame_consumed`] so the reader can make progress.
pub struct FrameSource {
    pub events: UnboundedReceiver<DecoderEvent>,
    ready: Option<oneshot::Receiver<MontageResult<SourceReady>>>,
    buffered: Arc<AtomicUsize>,
    unthrottled: Arc<AtomicBool>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FrameSource {
    pub fn spawn<R>(reader: R, codecs: Arc<dyn CodecFactory>, opts: SourceOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (events_tx, events) = unbounded_channel();
        let (ready_tx, ready) = oneshot::channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let unthrottled = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();

        let pipeline = Pipeline {
            codecs,
            opts,
            events: events_tx,
            ready: Some(ready_tx),
            buffered: Arc::clone(&buffered),
            unthrottled: Arc::clone(&unthrottled),
            token: token.clone(),
            video: None,
            audio: None,
        };
        let task = tokio::spawn(pipeline.run(reader));

        Self {
            events,
            ready: Some(ready),
            buffered,
            unthrottled,
            token,
            task: Some(task),
        }
    }

    /// Resolves once the movie header was parsed and decoders were configured.
    pub async fn ready(&mut self) -> MontageResult<SourceReady> {
        let Some(rx) = self.ready.take() else {
            return Err(MontageError::sequence("frame source readiness already consumed"));
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(MontageError::Cancelled),
        }
    }

    pub fn frame_consumed(&self) {
        let _ = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn buffered_frames(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// While set, the reader keeps going past `max_buffered_frames`. A consumer waiting for
    /// audio that sits behind buffered video in the file sets it until the audio arrives.
    pub fn set_unthrottled(&self, on: bool) {
        self.unthrottled.store(on, Ordering::Release);
    }

    /// Stops reading and closes the decoders.
    pub fn cancel(&mut self) {
        self.token.cancel();
        self.events.close();
        self.task.take();
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Pipeline {
    codecs: Arc<dyn CodecFactory>,
    opts: SourceOptions,
    events: UnboundedSender<DecoderEvent>,
    ready: Option<oneshot::Sender<MontageResult<SourceReady>>>,
    buffered: Arc<AtomicUsize>,
    unthrottled: Arc<AtomicBool>,
    token: CancellationToken,
    video: Option<(u32, Box<dyn VideoDecoder>)>,
    audio: Option<(u32, Box<dyn AudioDecoder>)>,
}

impl Pipeline {
    async fn run<R: AsyncRead + Unpin>(mut self, reader: R) {
        match self.pump(reader).await {
            Ok(()) => {
                // Decoders must outlive their queued work; keep them until the consumer is done.
                self.token.cancelled().await;
            }
            Err(MontageError::Cancelled) => {}
            Err(e) => {
                tracing::debug!(error = %e, "frame source failed");
                match self.ready.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(e));
                    }
                    None => {
                        let _ = self.events.send(DecoderEvent::Error(e));
                    }
                }
            }
        }
        if let Some((_, mut d)) = self.video.take() {
            d.close();
        }
        if let Some((_, mut d)) = self.audio.take() {
            d.close();
        }
    }

    async fn pump<R: AsyncRead + Unpin>(&mut self, mut reader: R) -> MontageResult<()> {
        let kinds: &[MediaKind] = if self.opts.decode_audio {
            &[MediaKind::Video, MediaKind::Audio]
        } else {
            &[MediaKind::Video]
        };
        let mut demuxer = Demuxer::new().only(kinds);
        let mut buf = BytesMut::with_capacity(self.opts.read_chunk);

        loop {
            buf.clear();
            let n = tokio::select! {
                _ = self.token.cancelled() => return Err(MontageError::Cancelled),
                n = reader.read_buf(&mut buf) => {
                    n.map_err(|e| {
                        MontageError::Other(anyhow::Error::new(e).context("read mp4 source"))
                    })?
                }
            };
            if n == 0 {
                break;
            }
            for event in demuxer.push(&buf)? {
                self.on_event(event).await?;
            }
        }

        for event in demuxer.finish()? {
            self.on_event(event).await?;
        }
        tracing::debug!(bytes = demuxer.position(), "frame source reached end of stream");
        if let Some((_, d)) = &mut self.video {
            d.flush()?;
        }
        if let Some((_, d)) = &mut self.audio {
            d.flush()?;
        }
        Ok(())
    }

    async fn on_event(&mut self, event: DemuxEvent) -> MontageResult<()> {
        match event {
            DemuxEvent::Ready(movie) => self.on_ready(movie),
            DemuxEvent::Samples { track_id, samples } => {
                for sample in samples {
                    self.submit(track_id, sample).await?;
                }
                Ok(())
            }
        }
    }

    fn on_ready(&mut self, movie: MovieInfo) -> MontageResult<()> {
        let video = movie.first_of(MediaKind::Video).cloned();
        let audio = if self.opts.decode_audio {
            movie.first_of(MediaKind::Audio).cloned()
        } else {
            None
        };
        if video.is_none() && audio.is_none() {
            return Err(MontageError::config("mp4 source has no decodable track"));
        }

        if let Some(track) = &video
            && let TrackConfig::Video(config) = &track.config
        {
            let mut decoder = self
                .codecs
                .video_decoder(&config.codec, self.events.clone())?;
            decoder.configure(config)?;
            self.video = Some((track.track_id, decoder));
        }
        if let Some(track) = &audio
            && let TrackConfig::Audio(config) = &track.config
        {
            let mut decoder = self
                .codecs
                .audio_decoder(&config.codec, self.events.clone())?;
            decoder.configure(config)?;
            self.audio = Some((track.track_id, decoder));
        }

        if let Some(tx) = self.ready.take() {
            let _ = tx.send(Ok(SourceReady {
                movie,
                video,
                audio,
            }));
        }
        Ok(())
    }

    async fn submit(&mut self, track_id: u32, sample: Sample) -> MontageResult<()> {
        let chunk = EncodedChunk {
            kind: if sample.is_sync {
                ChunkKind::Key
            } else {
                ChunkKind::Delta
            },
            timestamp: sample.cts,
            duration: sample.duration,
            data: sample.data,
        };

        if self.video.as_ref().is_some_and(|(id, _)| *id == track_id) {
            while self.buffered.load(Ordering::Acquire) >= self.opts.max_buffered_frames
                && !self.unthrottled.load(Ordering::Acquire)
            {
                tokio::select! {
                    _ = self.token.cancelled() => return Err(MontageError::Cancelled),
                    _ = tokio::time::sleep(THROTTLE_SLEEP) => {}
                }
            }
            self.buffered.fetch_add(1, Ordering::AcqRel);
            if let Some((_, d)) = &mut self.video {
                d.decode(chunk)?;
            }
        } else if let Some((id, d)) = &mut self.audio
            && *id == track_id
        {
            d.decode(chunk)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "../../tests/unit/demux/source.rs"]
mod tests;
