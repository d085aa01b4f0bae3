//! File-backed audio output: every spoken item becomes an `.mp3` file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use assistants_stream::playback::{
    AudioByteStream, DecodedClip, PlaybackCompletion, RenderedAudio, SpeechChunkStream,
    StreamingPlayer,
};
use assistants_stream::{AssistantsClient, PlaybackError, SpeechSynthesizer};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt as _;
use tokio::io::AsyncWriteExt as _;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Bitrate used to estimate clip length from its size.
const ESTIMATED_BITRATE_BPS: f64 = 160_000.0;

/// Output directory handing out sequential file names.
#[derive(Debug)]
pub struct SpeechDir {
    dir: PathBuf,
    next: AtomicUsize,
}

impl SpeechDir {
    pub fn create(dir: impl Into<PathBuf>) -> std::io::Result<Arc<Self>> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Arc::new(Self {
            dir,
            next: AtomicUsize::new(1),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn next_file(&self, kind: &str) -> PathBuf {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        self.dir.join(format!("{n:03}-{kind}.mp3"))
    }
}

type TaskSlot = Mutex<Option<JoinHandle<()>>>;

fn replace_task(slot: &TaskSlot, task: JoinHandle<()>) {
    let previous = slot
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(task);
    if let Some(previous) = previous {
        previous.abort();
    }
}

fn abort_task(slot: &TaskSlot) {
    if let Some(task) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
        task.abort();
    }
}

/// Streaming player that writes each live stream to its own file.
pub struct FileStreamingPlayer {
    dir: Arc<SpeechDir>,
    task: TaskSlot,
}

impl FileStreamingPlayer {
    pub fn new(dir: Arc<SpeechDir>) -> Self {
        Self {
            dir,
            task: Mutex::new(None),
        }
    }
}

impl StreamingPlayer for FileStreamingPlayer {
    fn start(&self, audio: AudioByteStream, done: PlaybackCompletion) -> Result<(), PlaybackError> {
        let path = self.dir.next_file("stream");
        replace_task(&self.task, tokio::spawn(write_stream(path, audio, done)));
        Ok(())
    }

    fn stop(&self) {
        abort_task(&self.task);
    }
}

async fn write_stream(path: PathBuf, mut audio: AudioByteStream, done: PlaybackCompletion) {
    let mut file = match tokio::fs::File::create(&path).await {
        Ok(file) => file,
        Err(err) => {
            done.failed(format!("cannot create {}: {err}", path.display()));
            return;
        }
    };
    let mut written = 0_usize;
    while let Some(chunk) = audio.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = file.flush().await;
                done.failed(err.to_string());
                return;
            }
        };
        if let Err(err) = file.write_all(&bytes).await {
            done.failed(format!("write to {} failed: {err}", path.display()));
            return;
        }
        written += bytes.len();
    }
    match file.flush().await {
        Ok(()) => {
            info!(path = %path.display(), bytes = written, "speech stream saved");
            done.finished();
        }
        Err(err) => done.failed(err.to_string()),
    }
}

/// Complete speech buffer that is "played" by saving it.
pub struct FileClip {
    path: PathBuf,
    audio: Bytes,
    task: TaskSlot,
}

impl FileClip {
    pub fn new(path: PathBuf, audio: Bytes) -> Self {
        Self {
            path,
            audio,
            task: Mutex::new(None),
        }
    }
}

impl DecodedClip for FileClip {
    fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.audio.len() as f64 * 8.0 / ESTIMATED_BITRATE_BPS)
    }

    fn play(&self, done: PlaybackCompletion) -> Result<(), PlaybackError> {
        let path = self.path.clone();
        let audio = self.audio.clone();
        let task = tokio::spawn(async move {
            match tokio::fs::write(&path, &audio).await {
                Ok(()) => {
                    debug!(path = %path.display(), "speech clip saved");
                    done.finished();
                }
                Err(err) => done.failed(format!("write to {} failed: {err}", path.display())),
            }
        });
        replace_task(&self.task, task);
        Ok(())
    }

    fn stop(&self) {
        abort_task(&self.task);
    }
}

/// Speech synthesis through the Assistants client.
pub struct ClientSynthesizer {
    client: AssistantsClient,
    dir: Arc<SpeechDir>,
}

impl ClientSynthesizer {
    pub fn new(client: AssistantsClient, dir: Arc<SpeechDir>) -> Self {
        Self { client, dir }
    }
}

#[async_trait]
impl SpeechSynthesizer for ClientSynthesizer {
    async fn render(&self, text: &str) -> Result<RenderedAudio, PlaybackError> {
        let audio = self.client.create_speech(text).await?;
        let clip = FileClip::new(self.dir.next_file("clip"), audio);
        Ok(RenderedAudio::new(text, Arc::new(clip)))
    }

    fn stream(&self, text: &str) -> SpeechChunkStream {
        self.client.create_speech_stream(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assistants_stream::{PlaybackEvent, PlaybackOutcome, PlaybackQueue};
    use futures::stream;

    async fn finished_outcome(
        events: &mut tokio::sync::broadcast::Receiver<PlaybackEvent>,
    ) -> PlaybackOutcome {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            if let PlaybackEvent::Finished { outcome, .. } = event {
                return outcome;
            }
        }
    }

    #[tokio::test]
    async fn streamed_speech_is_written_to_numbered_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = SpeechDir::create(tmp.path().join("speech")).expect("dir");
        let queue = PlaybackQueue::new(Arc::new(FileStreamingPlayer::new(dir.clone())));
        let mut events = queue.subscribe();

        let chunks = stream::iter(vec![
            Ok::<_, PlaybackError>(Bytes::from_static(b"ID3")),
            Ok(Bytes::from_static(b"frames")),
        ]);
        queue.enqueue_chunked("hello", chunks.boxed());
        assert_eq!(finished_outcome(&mut events).await, PlaybackOutcome::Finished);

        let written = std::fs::read(dir.path().join("001-stream.mp3")).expect("file");
        assert_eq!(written, b"ID3frames");
    }

    #[tokio::test]
    async fn stream_errors_fail_the_item() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = SpeechDir::create(tmp.path()).expect("dir");
        let queue = PlaybackQueue::new(Arc::new(FileStreamingPlayer::new(dir)));
        let mut events = queue.subscribe();

        let chunks = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(PlaybackError::Stream("connection reset".into())),
        ]);
        queue.enqueue_chunked("broken", chunks.boxed());
        assert!(matches!(
            finished_outcome(&mut events).await,
            PlaybackOutcome::Failed(reason) if reason.contains("connection reset")
        ));
    }

    #[tokio::test]
    async fn rendered_clip_is_saved_with_estimated_duration() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = SpeechDir::create(tmp.path()).expect("dir");
        let path = dir.next_file("clip");
        let clip = FileClip::new(path.clone(), Bytes::from(vec![0_u8; 20_000]));
        assert_eq!(clip.duration(), Duration::from_secs(1));

        let queue = PlaybackQueue::new(Arc::new(FileStreamingPlayer::new(dir)));
        let mut events = queue.subscribe();
        queue.enqueue_rendered(RenderedAudio::new("clip", Arc::new(clip)));
        assert_eq!(finished_outcome(&mut events).await, PlaybackOutcome::Finished);
        assert_eq!(std::fs::metadata(&path).expect("saved").len(), 20_000);
    }
}
