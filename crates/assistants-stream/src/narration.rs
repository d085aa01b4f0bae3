//! Speaks message text through the shared playback queue, once per text.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use crate::errors::PlaybackError;
use crate::playback::{PlaybackQueue, RenderedAudio, SpeechChunkStream};

/// Text-to-speech backend.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesizes the whole text into a decoded clip.
    async fn render(&self, text: &str) -> Result<RenderedAudio, PlaybackError>;

    /// Starts live synthesis; chunks arrive as the service produces them.
    fn stream(&self, text: &str) -> SpeechChunkStream;
}

/// Whether speech is played as it streams or only once fully rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NarrationMode {
    #[default]
    Streaming,
    Rendered,
}

/// Narration state for one conversation.
///
/// Rendered speech is synthesized by a single worker task so clips reach
/// the queue in the order their texts were spoken.
pub struct Narrator {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    queue: PlaybackQueue,
    mode: NarrationMode,
    spoken: HashSet<String>,
    renders: Option<mpsc::UnboundedSender<String>>,
    rendering: Arc<RenderCount>,
}

/// Renders still in flight, with a wakeup for every completed one.
#[derive(Default)]
struct RenderCount {
    pending: AtomicUsize,
    done: Notify,
}

impl Narrator {
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, queue: PlaybackQueue) -> Self {
        Self {
            synthesizer,
            queue,
            mode: NarrationMode::default(),
            spoken: HashSet::new(),
            renders: None,
            rendering: Arc::new(RenderCount::default()),
        }
    }

    pub fn with_mode(mut self, mode: NarrationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> NarrationMode {
        self.mode
    }

    pub fn queue(&self) -> &PlaybackQueue {
        &self.queue
    }

    pub fn has_spoken(&self, text: &str) -> bool {
        self.spoken.contains(text)
    }

    pub fn spoken_count(&self) -> usize {
        self.spoken.len()
    }

    /// Schedules `text` for playback unless it is empty or was spoken
    /// before. Returns whether anything was scheduled.
    pub fn speak_if_needed(&mut self, text: Option<&str>) -> bool {
        let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
            return false;
        };
        if !self.spoken.insert(text.to_string()) {
            debug!(text, "already spoken");
            return false;
        }
        match self.mode {
            NarrationMode::Streaming => {
                let chunks = self.synthesizer.stream(text);
                self.queue.enqueue_chunked(text, chunks);
            }
            NarrationMode::Rendered => {
                let renders = self.renders.get_or_insert_with(|| {
                    spawn_render_worker(
                        self.synthesizer.clone(),
                        self.queue.clone(),
                        self.rendering.clone(),
                    )
                });
                self.rendering.pending.fetch_add(1, Ordering::SeqCst);
                if renders.send(text.to_string()).is_err() {
                    self.rendering.pending.fetch_sub(1, Ordering::SeqCst);
                    warn!(text, "render worker is gone");
                }
            }
        }
        true
    }

    /// Stops playback and drops everything queued.
    pub fn silence(&self) {
        self.queue.clear();
    }

    /// Waits until no render is pending and the queue has drained.
    pub async fn wait_idle(&self) {
        let mut status = self.queue.status();
        loop {
            // Registered before the checks so no wakeup in between is lost.
            let rendered = self.rendering.done.notified();
            if self.rendering.pending.load(Ordering::SeqCst) == 0 {
                let snapshot = self.queue.snapshot().await;
                if snapshot.playing.is_none() && snapshot.queued.is_empty() {
                    return;
                }
            }
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = rendered => {}
            }
        }
    }
}

fn spawn_render_worker(
    synthesizer: Arc<dyn SpeechSynthesizer>,
    queue: PlaybackQueue,
    rendering: Arc<RenderCount>,
) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            match synthesizer.render(&text).await {
                Ok(audio) => queue.enqueue_rendered(audio),
                Err(err) => warn!(text = %text, error = %err, "speech rendering failed"),
            }
            rendering.pending.fetch_sub(1, Ordering::SeqCst);
            rendering.done.notify_waiters();
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;
    use futures::StreamExt as _;
    use futures::stream;

    use crate::playback::{
        AudioByteStream, DecodedClip, PlaybackCompletion, PlaybackEvent, StreamingPlayer,
    };

    struct InstantClip;

    impl DecodedClip for InstantClip {
        fn duration(&self) -> Duration {
            Duration::from_millis(250)
        }

        fn play(&self, done: PlaybackCompletion) -> Result<(), PlaybackError> {
            done.finished();
            Ok(())
        }

        fn stop(&self) {}
    }

    struct NullPlayer;

    impl StreamingPlayer for NullPlayer {
        fn start(&self, mut audio: AudioByteStream, done: PlaybackCompletion) -> Result<(), PlaybackError> {
            tokio::spawn(async move {
                while audio.next().await.is_some() {}
                done.finished();
            });
            Ok(())
        }

        fn stop(&self) {}
    }

    /// Keeps each stream playing until the test releases it.
    #[derive(Default)]
    struct HoldingPlayer {
        held: Mutex<Vec<PlaybackCompletion>>,
    }

    impl StreamingPlayer for HoldingPlayer {
        fn start(&self, _audio: AudioByteStream, done: PlaybackCompletion) -> Result<(), PlaybackError> {
            self.held.lock().expect("lock").push(done);
            Ok(())
        }

        fn stop(&self) {}
    }

    #[derive(Default)]
    struct RecordingSynthesizer {
        streamed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SpeechSynthesizer for RecordingSynthesizer {
        async fn render(&self, text: &str) -> Result<RenderedAudio, PlaybackError> {
            if text.contains("fail") {
                return Err(PlaybackError::Synthesis("quota".into()));
            }
            Ok(RenderedAudio::new(text, Arc::new(InstantClip)))
        }

        fn stream(&self, text: &str) -> SpeechChunkStream {
            self.streamed.lock().expect("lock").push(text.to_string());
            stream::iter(vec![Ok(Bytes::from_static(b"mp3"))]).boxed()
        }
    }

    async fn started_prompt(rx: &mut tokio::sync::broadcast::Receiver<PlaybackEvent>) -> String {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            if let PlaybackEvent::Started { prompt, .. } = event {
                return prompt;
            }
        }
    }

    #[tokio::test]
    async fn each_text_is_spoken_once() {
        let synthesizer = Arc::new(RecordingSynthesizer::default());
        let queue = PlaybackQueue::new(Arc::new(NullPlayer));
        let mut narrator = Narrator::new(synthesizer.clone(), queue);

        assert!(narrator.speak_if_needed(Some("hello")));
        assert!(!narrator.speak_if_needed(Some("hello")));
        assert!(!narrator.speak_if_needed(None));
        assert!(!narrator.speak_if_needed(Some("   ")));
        assert!(narrator.speak_if_needed(Some("bye")));

        assert_eq!(narrator.spoken_count(), 2);
        assert!(narrator.has_spoken("bye"));
        assert_eq!(
            *synthesizer.streamed.lock().expect("lock"),
            vec!["hello".to_string(), "bye".to_string()]
        );
    }

    #[tokio::test]
    async fn rendered_mode_keeps_order_and_skips_failures() {
        let synthesizer = Arc::new(RecordingSynthesizer::default());
        let queue = PlaybackQueue::new(Arc::new(NullPlayer));
        let mut events = queue.subscribe();
        let mut narrator = Narrator::new(synthesizer.clone(), queue).with_mode(NarrationMode::Rendered);

        narrator.speak_if_needed(Some("one"));
        narrator.speak_if_needed(Some("please fail"));
        narrator.speak_if_needed(Some("two"));

        assert_eq!(started_prompt(&mut events).await, "one");
        assert_eq!(started_prompt(&mut events).await, "two");
        assert!(synthesizer.streamed.lock().expect("lock").is_empty());
        assert!(narrator.has_spoken("please fail"));

        tokio::time::timeout(Duration::from_secs(2), narrator.wait_idle())
            .await
            .expect("narrator drains");
    }

    #[tokio::test]
    async fn wait_idle_blocks_until_playback_finishes() {
        let player = Arc::new(HoldingPlayer::default());
        let queue = PlaybackQueue::new(player.clone());
        let mut narrator = Narrator::new(Arc::new(RecordingSynthesizer::default()), queue);
        narrator.speak_if_needed(Some("still talking"));

        let waiter = narrator.wait_idle();
        tokio::pin!(waiter);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), &mut waiter)
                .await
                .is_err()
        );

        let done = player.held.lock().expect("lock").pop().expect("stream started");
        done.finished();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("idle after playback ends");
    }
}
