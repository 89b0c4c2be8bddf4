//! Progress streaming: payload chunking and the single-close frame channel.

use std::time::Duration;

use async_trait::async_trait;
use harvest_core::ProgressEvent;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const DEFAULT_CHUNK_THRESHOLD: usize = 5;
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(50);

/// Progress band reserved for delivering chunked payloads.
const CHUNK_BAND_START: usize = 80;
const CHUNK_BAND_WIDTH: usize = 20;

/// Splits an event whose payload exceeds `threshold` records into ordered
/// chunk frames. Anything smaller passes through as a single frame.
pub fn chunk(mut event: ProgressEvent, threshold: usize) -> Vec<ProgressEvent> {
    let threshold = threshold.max(1);
    let payload = match event.payload.take() {
        Some(payload) if payload.len() > threshold => payload,
        other => {
            event.payload = other;
            return vec![event];
        }
    };

    let total = payload.len().div_ceil(threshold);
    payload
        .chunks(threshold)
        .enumerate()
        .map(|(index, group)| {
            let interpolated = CHUNK_BAND_START + (index + 1) * CHUNK_BAND_WIDTH / total;
            ProgressEvent {
                progress: (interpolated as u8).min(event.progress),
                payload: Some(group.to_vec()),
                is_chunk: true,
                chunk_index: Some(index),
                total_chunks: Some(total),
                ..event.clone()
            }
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum StreamWriteError {
    #[error("client disconnected")]
    Disconnected,
    #[error("serializing frame: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("writing frame: {0}")]
    Io(#[from] std::io::Error),
}

/// One-way push transport for progress frames.
#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, frame: &ProgressEvent) -> Result<(), StreamWriteError>;

    async fn close(&mut self);

    /// Resolves when the reader has gone away. Transports that cannot tell
    /// never resolve.
    async fn disconnected(&mut self) {
        std::future::pending::<()>().await
    }
}

/// Writes `data: <json>\n\n` frames to any async byte sink.
#[derive(Debug)]
pub struct SseLineWriter<W> {
    inner: W,
}

impl<W> SseLineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWriter for SseLineWriter<W> {
    async fn write_frame(&mut self, frame: &ProgressEvent) -> Result<(), StreamWriteError> {
        let line = frame.to_sse_frame()?;
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(err) = self.inner.shutdown().await {
            debug!(error = %err, "closing frame sink failed");
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub threshold: usize,
    pub chunk_delay: Duration,
    /// Never let a non-error frame report less progress than one already sent.
    pub monotonic: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CHUNK_THRESHOLD,
            chunk_delay: DEFAULT_CHUNK_DELAY,
            monotonic: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub frames_written: usize,
    pub dropped: usize,
    pub terminal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// A completion or error frame was delivered.
    Terminal,
    /// The reader went away before a terminal frame.
    Disconnected,
    /// Writing a frame failed.
    WriteFailed,
    /// The event source closed without a terminal frame.
    SourceClosed,
}

pub struct ProgressChannel<W: FrameWriter> {
    writer: W,
    config: ChannelConfig,
    closed: bool,
    write_failed: bool,
    high_water: u8,
    frames_written: u64,
}

impl<W: FrameWriter> ProgressChannel<W> {
    pub fn new(writer: W, config: ChannelConfig) -> Self {
        Self {
            writer,
            config,
            closed: false,
            write_failed: false,
            high_water: 0,
            frames_written: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn into_writer(self) -> W {
        self.writer
    }

    /// Chunks and writes one event. Never fails: write errors close the
    /// stream and anything sent after close is dropped.
    pub async fn send(&mut self, event: ProgressEvent) -> Delivery {
        let mut delivery = Delivery::default();
        if self.closed {
            delivery.dropped = 1;
            debug!(progress = event.progress, "stream closed; dropping progress event");
            return delivery;
        }

        let frames = chunk(event, self.config.threshold);
        let total = frames.len();
        for (index, mut frame) in frames.into_iter().enumerate() {
            if self.closed {
                delivery.dropped += total - index;
                debug!(dropped = total - index, "stream closed mid-sequence; dropping frames");
                break;
            }
            if index > 0 && !self.config.chunk_delay.is_zero() {
                tokio::time::sleep(self.config.chunk_delay).await;
            }
            if self.config.monotonic && frame.error.is_none() {
                frame.progress = frame.progress.max(self.high_water);
            }
            let terminal = frame.is_terminal() && index + 1 == total;

            match self.writer.write_frame(&frame).await {
                Ok(()) => {
                    delivery.frames_written += 1;
                    self.frames_written += 1;
                    self.high_water = self.high_water.max(frame.progress);
                }
                Err(err) => {
                    warn!(error = %err, "progress frame write failed; closing stream");
                    self.write_failed = true;
                    delivery.dropped += total - index;
                    self.finish().await;
                    break;
                }
            }

            if terminal {
                delivery.terminal = true;
                self.finish().await;
            }
        }
        delivery
    }

    /// Reader went away: latch closed, then close the transport.
    pub async fn abort(&mut self) {
        if !self.closed {
            debug!(frames = self.frames_written, "client disconnected; closing stream");
        }
        self.finish().await;
    }

    /// Forwards events until a terminal frame, a disconnect, a write failure
    /// or the end of the source.
    pub async fn pipe(&mut self, events: &mut mpsc::Receiver<ProgressEvent>) -> StreamEnd {
        loop {
            tokio::select! {
                biased;
                _ = self.writer.disconnected() => {
                    self.abort().await;
                    return StreamEnd::Disconnected;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        let delivery = self.send(event).await;
                        if delivery.terminal {
                            return StreamEnd::Terminal;
                        }
                        if self.write_failed {
                            return StreamEnd::WriteFailed;
                        }
                    }
                    None => {
                        self.finish().await;
                        return StreamEnd::SourceClosed;
                    }
                },
            }
        }
    }

    async fn finish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.writer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use harvest_core::HarvestRecord;
    use serde_json::Map;

    fn records(count: usize) -> Vec<HarvestRecord> {
        (0..count)
            .map(|i| HarvestRecord {
                id: format!("r{i}"),
                url: None,
                title: None,
                body: None,
                captured_at: Utc::now(),
                attributes: Map::new(),
            })
            .collect()
    }

    #[derive(Default)]
    struct RecordingWriter {
        frames: Vec<ProgressEvent>,
        closes: usize,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl FrameWriter for RecordingWriter {
        async fn write_frame(&mut self, frame: &ProgressEvent) -> Result<(), StreamWriteError> {
            if self.fail_after == Some(self.frames.len()) {
                return Err(StreamWriteError::Disconnected);
            }
            self.frames.push(frame.clone());
            Ok(())
        }

        async fn close(&mut self) {
            self.closes += 1;
        }
    }

    #[test]
    fn small_payload_passes_through_unchanged() {
        let event = ProgressEvent::at(60).with_payload(records(5));
        let frames = chunk(event.clone(), 5);
        assert_eq!(frames, vec![event]);

        let bare = ProgressEvent::at(10).with_phase("login");
        assert_eq!(chunk(bare.clone(), 5), vec![bare]);
    }

    #[test]
    fn twelve_records_split_into_three_ordered_chunks() {
        let event = ProgressEvent::complete(records(12));
        let frames = chunk(event, 5);

        assert_eq!(frames.len(), 3);
        let indices: Vec<_> = frames.iter().map(|f| f.chunk_index).collect();
        assert_eq!(indices, vec![Some(0), Some(1), Some(2)]);
        assert!(frames.iter().all(|f| f.is_chunk && f.total_chunks == Some(3)));
        let sizes: Vec<_> = frames.iter().map(|f| f.payload_len()).collect();
        assert_eq!(sizes, vec![5, 5, 2]);
        let progress: Vec<_> = frames.iter().map(|f| f.progress).collect();
        assert_eq!(progress, vec![86, 93, 100]);
        assert_eq!(frames[2].payload.as_ref().unwrap()[1].id, "r11");
    }

    #[test]
    fn chunk_progress_never_exceeds_event_progress() {
        let event = ProgressEvent::at(50).with_payload(records(11));
        let frames = chunk(event, 5);
        assert!(frames.iter().all(|f| f.progress == 50));
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_are_spaced_and_completion_closes_once() {
        let mut channel =
            ProgressChannel::new(RecordingWriter::default(), ChannelConfig::default());
        let started = tokio::time::Instant::now();

        let delivery = channel.send(ProgressEvent::complete(records(12))).await;
        assert_eq!(delivery, Delivery { frames_written: 3, dropped: 0, terminal: true });
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(channel.is_closed());

        let late = channel.send(ProgressEvent::at(10)).await;
        assert_eq!(late.dropped, 1);
        channel.abort().await;

        let writer = channel.into_writer();
        assert_eq!(writer.frames.len(), 3);
        assert_eq!(writer.closes, 1);
    }

    #[tokio::test]
    async fn error_frame_ends_stream() {
        let mut channel =
            ProgressChannel::new(RecordingWriter::default(), ChannelConfig::default());
        channel.send(ProgressEvent::at(20)).await;
        let delivery = channel.send(ProgressEvent::failed("login wall")).await;
        assert!(delivery.terminal);
        channel.send(ProgressEvent::at(30)).await;

        let writer = channel.into_writer();
        assert_eq!(writer.frames.len(), 2);
        assert_eq!(writer.frames[1].error.as_deref(), Some("login wall"));
        assert_eq!(writer.closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_latches_closed_without_raising() {
        let writer = RecordingWriter {
            fail_after: Some(1),
            ..Default::default()
        };
        let mut channel = ProgressChannel::new(writer, ChannelConfig::default());

        let delivery = channel.send(ProgressEvent::complete(records(12))).await;
        assert_eq!(delivery.frames_written, 1);
        assert_eq!(delivery.dropped, 2);
        assert!(!delivery.terminal);
        assert!(channel.is_closed());
        assert_eq!(channel.into_writer().closes, 1);
    }

    #[tokio::test]
    async fn monotonic_guard_holds_high_water_mark() {
        let config = ChannelConfig {
            monotonic: true,
            ..Default::default()
        };
        let mut channel = ProgressChannel::new(RecordingWriter::default(), config);
        channel.send(ProgressEvent::at(60)).await;
        channel.send(ProgressEvent::at(40)).await;
        channel.send(ProgressEvent::failed("boom")).await;

        let progress: Vec<_> = channel.into_writer().frames.iter().map(|f| f.progress).collect();
        assert_eq!(progress, vec![60, 60, 0]);
    }

    #[tokio::test]
    async fn pipe_stops_at_terminal_frame() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(ProgressEvent::at(10)).await.unwrap();
        tx.send(ProgressEvent::complete(records(2))).await.unwrap();
        tx.send(ProgressEvent::at(20)).await.unwrap();

        let mut channel =
            ProgressChannel::new(RecordingWriter::default(), ChannelConfig::default());
        assert_eq!(channel.pipe(&mut rx).await, StreamEnd::Terminal);
        let writer = channel.into_writer();
        assert_eq!(writer.frames.len(), 2);
        assert_eq!(writer.closes, 1);
    }

    #[tokio::test]
    async fn pipe_reports_source_closed() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(ProgressEvent::at(10)).await.unwrap();
        drop(tx);

        let mut channel =
            ProgressChannel::new(RecordingWriter::default(), ChannelConfig::default());
        assert_eq!(channel.pipe(&mut rx).await, StreamEnd::SourceClosed);
        assert_eq!(channel.into_writer().closes, 1);
    }

    #[tokio::test]
    async fn sse_line_writer_emits_wire_frames() {
        let mut channel =
            ProgressChannel::new(SseLineWriter::new(Vec::new()), ChannelConfig::default());
        channel.send(ProgressEvent::at(15).with_phase("login")).await;
        let bytes = channel.into_writer().into_inner();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "data: {\"progress\":15,\"phase\":\"login\"}\n\n"
        );
    }
}
