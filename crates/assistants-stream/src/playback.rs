//! Serialized playback of synthesized speech.
//!
//! `PlaybackQueue` is a cheap handle onto an actor task that owns the queue.
//! Items play strictly one at a time in enqueue order. Rendered clips are
//! started directly; chunked speech is bridged into a byte stream consumed
//! by the shared `StreamingPlayer`.
//!
//! `clear()` is synchronous: it stops the item playing when it was called
//! before returning, and invalidates every item enqueued before the call,
//! even ones still in flight to the actor.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt as _;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::PlaybackError;

/// Live sequence of encoded audio chunks produced by speech synthesis.
pub type SpeechChunkStream = BoxStream<'static, Result<Bytes, PlaybackError>>;

/// Continuous byte stream handed to a `StreamingPlayer`.
pub type AudioByteStream = BoxStream<'static, Result<Bytes, PlaybackError>>;

const BRIDGE_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;

/// How a playback item ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Finished,
    Failed(String),
}

/// One-shot completion signal handed to players.
///
/// Dropping it without signalling counts as a failure, so a player that
/// loses track of an item never stalls the queue.
#[derive(Debug)]
pub struct PlaybackCompletion {
    tx: oneshot::Sender<PlaybackOutcome>,
}

impl PlaybackCompletion {
    fn channel() -> (Self, oneshot::Receiver<PlaybackOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn finished(self) {
        let _ = self.tx.send(PlaybackOutcome::Finished);
    }

    pub fn failed(self, reason: impl Into<String>) {
        let _ = self.tx.send(PlaybackOutcome::Failed(reason.into()));
    }
}

/// A fully decoded audio resource with a known duration.
pub trait DecodedClip: Send + Sync {
    fn duration(&self) -> Duration;

    /// Begins playback; `done` must be signalled when the clip ends.
    fn play(&self, done: PlaybackCompletion) -> Result<(), PlaybackError>;

    /// Stops playback immediately. Must be safe to call at any time.
    fn stop(&self);
}

/// Player fed with a live byte stream of encoded audio.
///
/// The player signals `done` once the stream has ended (or yielded an error)
/// and all received audio has been played.
pub trait StreamingPlayer: Send + Sync {
    fn start(&self, audio: AudioByteStream, done: PlaybackCompletion) -> Result<(), PlaybackError>;

    fn stop(&self);
}

/// Whole-buffer speech ready to play.
#[derive(Clone)]
pub struct RenderedAudio {
    clip: Arc<dyn DecodedClip>,
    prompt: String,
    duration: Duration,
}

impl RenderedAudio {
    pub fn new(prompt: impl Into<String>, clip: Arc<dyn DecodedClip>) -> Self {
        let duration = clip.duration();
        Self {
            clip,
            prompt: prompt.into(),
            duration,
        }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

impl fmt::Debug for RenderedAudio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderedAudio")
            .field("prompt", &self.prompt)
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}

/// Queue entry. The scheduler branches on the variant once, at dequeue time.
pub enum PlaybackItem {
    Rendered(RenderedAudio),
    Chunked {
        prompt: String,
        chunks: SpeechChunkStream,
    },
}

impl PlaybackItem {
    pub fn prompt(&self) -> &str {
        match self {
            PlaybackItem::Rendered(audio) => audio.prompt(),
            PlaybackItem::Chunked { prompt, .. } => prompt,
        }
    }

    fn is_chunked(&self) -> bool {
        matches!(self, PlaybackItem::Chunked { .. })
    }
}

impl fmt::Debug for PlaybackItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackItem::Rendered(audio) => f.debug_tuple("Rendered").field(audio).finish(),
            PlaybackItem::Chunked { prompt, .. } => f
                .debug_struct("Chunked")
                .field("prompt", prompt)
                .finish_non_exhaustive(),
        }
    }
}

/// Observer notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// An item became active. Duration is zero when unknown (chunked speech).
    Started { prompt: String, duration: Duration },
    Finished {
        prompt: String,
        outcome: PlaybackOutcome,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlaybackStatus {
    #[default]
    Idle,
    Playing,
}

/// Point-in-time view of the queue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub playing: Option<String>,
    pub queued: Vec<String>,
}

enum Command {
    Enqueue { generation: u64, item: PlaybackItem },
    Clear { generation: u64 },
    Snapshot(oneshot::Sender<QueueSnapshot>),
}

enum ActiveResource {
    Clip(Arc<dyn DecodedClip>),
    Stream {
        player: Arc<dyn StreamingPlayer>,
        bridge: JoinHandle<()>,
    },
}

impl ActiveResource {
    fn stop(self) {
        match self {
            ActiveResource::Clip(clip) => clip.stop(),
            ActiveResource::Stream { player, bridge } => {
                bridge.abort();
                player.stop();
            }
        }
    }

    fn release(self) {
        if let ActiveResource::Stream { bridge, .. } = self {
            bridge.abort();
        }
    }
}

/// Resource of the playing item, tagged with the generation it started in.
struct SlotEntry {
    generation: u64,
    resource: ActiveResource,
}

/// State touched by both `clear()` and the actor.
struct Shared {
    generation: AtomicU64,
    active: Mutex<Option<SlotEntry>>,
    status: watch::Sender<PlaybackStatus>,
    events: broadcast::Sender<PlaybackEvent>,
}

impl Shared {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn slot(&self) -> MutexGuard<'_, Option<SlotEntry>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PlaybackEvent) {
        let _ = self.events.send(event);
    }
}

/// Handle to the shared playback scheduler.
///
/// Clones refer to the same queue. The actor stops once every handle has
/// been dropped. Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct PlaybackQueue {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl PlaybackQueue {
    pub fn new(player: Arc<dyn StreamingPlayer>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(PlaybackStatus::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            generation: AtomicU64::new(0),
            active: Mutex::new(None),
            status,
            events,
        });
        let scheduler = Scheduler {
            player,
            shared: shared.clone(),
            pending: VecDeque::new(),
            active: None,
        };
        tokio::spawn(run_scheduler(rx, scheduler));
        Self { commands, shared }
    }

    pub fn enqueue_rendered(&self, audio: RenderedAudio) {
        self.enqueue(PlaybackItem::Rendered(audio));
    }

    /// Queues live speech unless chunked speech for the same prompt is
    /// already queued or playing.
    pub fn enqueue_chunked(&self, prompt: impl Into<String>, chunks: SpeechChunkStream) {
        self.enqueue(PlaybackItem::Chunked {
            prompt: prompt.into(),
            chunks,
        });
    }

    pub fn enqueue(&self, item: PlaybackItem) {
        let generation = self.shared.generation();
        if self.commands.send(Command::Enqueue { generation, item }).is_err() {
            warn!("playback scheduler is gone; dropping item");
        }
    }

    /// Stops the active item and empties the queue.
    ///
    /// On return nothing enqueued before the call is playing, and none of
    /// it will ever start. Items enqueued concurrently with the call are
    /// kept.
    pub fn clear(&self) {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let stale = {
            let mut slot = self.shared.slot();
            let older = slot
                .as_ref()
                .is_some_and(|entry| entry.generation < generation);
            let stale = if older { slot.take() } else { None };
            if slot.is_none() {
                self.shared.status.send_replace(PlaybackStatus::Idle);
            }
            stale
        };
        if let Some(entry) = stale {
            entry.resource.stop();
        }
        debug!(generation, "playback cleared");
        let _ = self.commands.send(Command::Clear { generation });
    }

    pub fn is_playing(&self) -> bool {
        *self.shared.status.borrow() == PlaybackStatus::Playing
    }

    pub fn status(&self) -> watch::Receiver<PlaybackStatus> {
        self.shared.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.shared.events.subscribe()
    }

    /// Returns the active prompt and the queued prompts in order.
    pub async fn snapshot(&self) -> QueueSnapshot {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Snapshot(tx)).is_err() {
            return QueueSnapshot::default();
        }
        rx.await.unwrap_or_default()
    }
}

struct QueuedItem {
    generation: u64,
    item: PlaybackItem,
}

struct ActiveItem {
    generation: u64,
    prompt: String,
    chunked: bool,
    done: oneshot::Receiver<PlaybackOutcome>,
}

struct Scheduler {
    player: Arc<dyn StreamingPlayer>,
    shared: Arc<Shared>,
    pending: VecDeque<QueuedItem>,
    active: Option<ActiveItem>,
}

async fn run_scheduler(mut commands: mpsc::UnboundedReceiver<Command>, mut scheduler: Scheduler) {
    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(command) => scheduler.handle(command),
                    None => break,
                }
            }
            outcome = wait_active(&mut scheduler.active) => {
                scheduler.finish_active(outcome);
            }
        }
    }
    let remaining = scheduler.shared.slot().take();
    if let Some(entry) = remaining {
        entry.resource.stop();
    }
    debug!("playback scheduler stopped");
}

async fn wait_active(active: &mut Option<ActiveItem>) -> PlaybackOutcome {
    match active {
        Some(item) => match (&mut item.done).await {
            Ok(outcome) => outcome,
            Err(_) => PlaybackOutcome::Failed("player dropped the completion signal".into()),
        },
        None => std::future::pending().await,
    }
}

impl Scheduler {
    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { generation, item } => self.enqueue(generation, item),
            Command::Clear { generation } => {
                self.pending.retain(|q| q.generation >= generation);
                if self.active.as_ref().is_some_and(|a| a.generation < generation) {
                    self.active = None;
                }
                self.start_next();
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            playing: self.active.as_ref().map(|a| a.prompt.clone()),
            queued: self
                .pending
                .iter()
                .map(|q| q.item.prompt().to_string())
                .collect(),
        }
    }

    fn enqueue(&mut self, generation: u64, item: PlaybackItem) {
        if generation != self.shared.generation() {
            debug!(prompt = item.prompt(), "dropping item enqueued before clear");
            return;
        }
        if item.is_chunked() && self.has_chunked(item.prompt()) {
            debug!(prompt = item.prompt(), "chunked speech already queued");
            return;
        }
        self.pending.push_back(QueuedItem { generation, item });
        self.start_next();
    }

    fn has_chunked(&self, prompt: &str) -> bool {
        let active = self
            .active
            .as_ref()
            .is_some_and(|a| a.chunked && a.prompt == prompt);
        active
            || self
                .pending
                .iter()
                .any(|q| q.item.is_chunked() && q.item.prompt() == prompt)
    }

    fn start_next(&mut self) {
        while self.active.is_none() {
            let Some(queued) = self.pending.pop_front() else {
                self.shared.status.send_replace(PlaybackStatus::Idle);
                return;
            };
            let prompt = queued.item.prompt().to_string();
            let chunked = queued.item.is_chunked();

            let mut slot = self.shared.slot();
            if queued.generation != self.shared.generation() {
                debug!(prompt = %prompt, "dropping item from a cleared queue");
                continue;
            }
            match self.launch(queued.item) {
                Ok((resource, duration, done)) => {
                    *slot = Some(SlotEntry {
                        generation: queued.generation,
                        resource,
                    });
                    self.shared.status.send_replace(PlaybackStatus::Playing);
                    self.shared.emit(PlaybackEvent::Started {
                        prompt: prompt.clone(),
                        duration,
                    });
                    info!(prompt = %prompt, chunked, "playback started");
                    self.active = Some(ActiveItem {
                        generation: queued.generation,
                        prompt,
                        chunked,
                        done,
                    });
                }
                Err(err) => {
                    drop(slot);
                    warn!(prompt = %prompt, error = %err, "playback failed to start");
                    self.shared.emit(PlaybackEvent::Finished {
                        prompt,
                        outcome: PlaybackOutcome::Failed(err.to_string()),
                    });
                }
            }
        }
    }

    fn launch(
        &self,
        item: PlaybackItem,
    ) -> Result<(ActiveResource, Duration, oneshot::Receiver<PlaybackOutcome>), PlaybackError> {
        let (completion, done) = PlaybackCompletion::channel();
        match item {
            PlaybackItem::Rendered(audio) => {
                audio.clip.play(completion)?;
                Ok((ActiveResource::Clip(audio.clip), audio.duration, done))
            }
            PlaybackItem::Chunked { prompt, chunks } => {
                let (tx, rx) = mpsc::channel(BRIDGE_CAPACITY);
                self.player.start(receiver_stream(rx), completion)?;
                let bridge = tokio::spawn(bridge_chunks(prompt, chunks, tx));
                let resource = ActiveResource::Stream {
                    player: self.player.clone(),
                    bridge,
                };
                Ok((resource, Duration::ZERO, done))
            }
        }
    }

    fn finish_active(&mut self, outcome: PlaybackOutcome) {
        let Some(active) = self.active.take() else {
            return;
        };
        let current = {
            let mut slot = self.shared.slot();
            let current = slot
                .as_ref()
                .is_some_and(|entry| entry.generation == active.generation);
            if current && let Some(entry) = slot.take() {
                entry.resource.release();
            }
            current
        };
        if current {
            match &outcome {
                PlaybackOutcome::Finished => info!(prompt = %active.prompt, "playback finished"),
                PlaybackOutcome::Failed(reason) => {
                    warn!(prompt = %active.prompt, reason = %reason, "playback failed")
                }
            }
            self.shared.emit(PlaybackEvent::Finished {
                prompt: active.prompt,
                outcome,
            });
        }
        self.start_next();
    }
}

fn receiver_stream(rx: mpsc::Receiver<Result<Bytes, PlaybackError>>) -> AudioByteStream {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// Forwards chunks to the player in order. An error is forwarded once and
/// ends the bridge.
async fn bridge_chunks(
    prompt: String,
    mut chunks: SpeechChunkStream,
    tx: mpsc::Sender<Result<Bytes, PlaybackError>>,
) {
    let mut forwarded = 0_usize;
    while let Some(chunk) = chunks.next().await {
        let failed = chunk.is_err();
        if let Err(err) = &chunk {
            warn!(prompt = %prompt, error = %err, "speech chunk stream failed");
        }
        if tx.send(chunk).await.is_err() {
            debug!(prompt = %prompt, "player released the audio stream");
            return;
        }
        if failed {
            return;
        }
        forwarded += 1;
    }
    debug!(prompt = %prompt, forwarded, "speech chunk stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use futures::StreamExt as _;

    async fn next_event(rx: &mut broadcast::Receiver<PlaybackEvent>) -> PlaybackEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("event channel open")
    }

    fn started(prompt: &str, duration: Duration) -> PlaybackEvent {
        PlaybackEvent::Started {
            prompt: prompt.into(),
            duration,
        }
    }

    fn finished(prompt: &str) -> PlaybackEvent {
        PlaybackEvent::Finished {
            prompt: prompt.into(),
            outcome: PlaybackOutcome::Finished,
        }
    }

    /// Clip that finishes as soon as it starts, or refuses to start.
    struct InstantClip {
        fail: bool,
    }

    impl DecodedClip for InstantClip {
        fn duration(&self) -> Duration {
            Duration::from_secs(1)
        }

        fn play(&self, done: PlaybackCompletion) -> Result<(), PlaybackError> {
            if self.fail {
                return Err(PlaybackError::Start("no device".into()));
            }
            done.finished();
            Ok(())
        }

        fn stop(&self) {}
    }

    /// Clip that plays until the test lets it go or it is stopped.
    #[derive(Default)]
    struct HeldClip {
        done: Mutex<Option<PlaybackCompletion>>,
        stops: AtomicUsize,
    }

    impl DecodedClip for HeldClip {
        fn duration(&self) -> Duration {
            Duration::from_millis(1500)
        }

        fn play(&self, done: PlaybackCompletion) -> Result<(), PlaybackError> {
            *self.done.lock().expect("lock") = Some(done);
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Drains the audio stream on a task, then reports completion.
    #[derive(Default)]
    struct DrainingPlayer {
        received: Arc<Mutex<Vec<u8>>>,
    }

    impl StreamingPlayer for DrainingPlayer {
        fn start(&self, mut audio: AudioByteStream, done: PlaybackCompletion) -> Result<(), PlaybackError> {
            let received = self.received.clone();
            tokio::spawn(async move {
                while let Some(chunk) = audio.next().await {
                    match chunk {
                        Ok(bytes) => received.lock().expect("lock").extend_from_slice(&bytes),
                        Err(err) => {
                            done.failed(err.to_string());
                            return;
                        }
                    }
                }
                done.finished();
            });
            Ok(())
        }

        fn stop(&self) {}
    }

    /// Never finishes on its own; keeps every completion handle alive.
    #[derive(Default)]
    struct StuckPlayer {
        held: Mutex<Vec<(AudioByteStream, PlaybackCompletion)>>,
        stops: AtomicUsize,
    }

    impl StreamingPlayer for StuckPlayer {
        fn start(&self, audio: AudioByteStream, done: PlaybackCompletion) -> Result<(), PlaybackError> {
            self.held.lock().expect("lock").push((audio, done));
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn chunks(parts: Vec<Result<&'static str, PlaybackError>>) -> SpeechChunkStream {
        stream::iter(parts.into_iter().map(|p| p.map(Bytes::from))).boxed()
    }

    fn endless() -> SpeechChunkStream {
        stream::pending().boxed()
    }

    #[tokio::test]
    async fn rendered_items_play_in_fifo_order() {
        let queue = PlaybackQueue::new(Arc::new(DrainingPlayer::default()));
        let mut events = queue.subscribe();
        for prompt in ["a", "b", "c"] {
            queue.enqueue_rendered(RenderedAudio::new(prompt, Arc::new(InstantClip { fail: false })));
        }
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(next_event(&mut events).await);
        }
        let second = Duration::from_secs(1);
        assert_eq!(
            seen,
            vec![
                started("a", second),
                finished("a"),
                started("b", second),
                finished("b"),
                started("c", second),
                finished("c"),
            ]
        );
        assert_eq!(queue.snapshot().await, QueueSnapshot::default());
        assert!(!queue.is_playing());
    }

    #[tokio::test]
    async fn chunked_audio_is_bridged_in_order_with_unknown_duration() {
        let player = Arc::new(DrainingPlayer::default());
        let queue = PlaybackQueue::new(player.clone());
        let mut events = queue.subscribe();
        queue.enqueue_chunked("hello", chunks(vec![Ok("ab"), Ok("cd"), Ok("ef")]));
        assert_eq!(next_event(&mut events).await, started("hello", Duration::ZERO));
        assert_eq!(next_event(&mut events).await, finished("hello"));
        assert_eq!(player.received.lock().expect("lock").as_slice(), b"abcdef");
    }

    #[tokio::test]
    async fn chunk_failure_advances_the_queue() {
        let queue = PlaybackQueue::new(Arc::new(DrainingPlayer::default()));
        let mut events = queue.subscribe();
        queue.enqueue_chunked(
            "broken",
            chunks(vec![Ok("x"), Err(PlaybackError::Stream("reset".into())), Ok("never")]),
        );
        queue.enqueue_chunked("next", chunks(vec![Ok("y")]));

        assert_eq!(next_event(&mut events).await, started("broken", Duration::ZERO));
        match next_event(&mut events).await {
            PlaybackEvent::Finished {
                prompt,
                outcome: PlaybackOutcome::Failed(reason),
            } => {
                assert_eq!(prompt, "broken");
                assert!(reason.contains("reset"), "{reason}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(next_event(&mut events).await, started("next", Duration::ZERO));
        assert_eq!(next_event(&mut events).await, finished("next"));
    }

    #[tokio::test]
    async fn failed_start_is_reported_and_skipped() {
        let queue = PlaybackQueue::new(Arc::new(DrainingPlayer::default()));
        let mut events = queue.subscribe();
        queue.enqueue_rendered(RenderedAudio::new("bad", Arc::new(InstantClip { fail: true })));
        queue.enqueue_rendered(RenderedAudio::new("good", Arc::new(InstantClip { fail: false })));

        assert!(matches!(
            next_event(&mut events).await,
            PlaybackEvent::Finished { outcome: PlaybackOutcome::Failed(_), .. }
        ));
        assert_eq!(next_event(&mut events).await, started("good", Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn dropped_completion_counts_as_failure() {
        struct ForgetfulClip;
        impl DecodedClip for ForgetfulClip {
            fn duration(&self) -> Duration {
                Duration::ZERO
            }
            fn play(&self, done: PlaybackCompletion) -> Result<(), PlaybackError> {
                drop(done);
                Ok(())
            }
            fn stop(&self) {}
        }

        let queue = PlaybackQueue::new(Arc::new(DrainingPlayer::default()));
        let mut events = queue.subscribe();
        queue.enqueue_rendered(RenderedAudio::new("lost", Arc::new(ForgetfulClip)));
        assert_eq!(next_event(&mut events).await, started("lost", Duration::ZERO));
        assert!(matches!(
            next_event(&mut events).await,
            PlaybackEvent::Finished { outcome: PlaybackOutcome::Failed(_), .. }
        ));
    }

    #[tokio::test]
    async fn duplicate_chunked_prompts_are_queued_once() {
        let player = Arc::new(StuckPlayer::default());
        let queue = PlaybackQueue::new(player.clone());
        queue.enqueue_chunked("one", endless());
        queue.enqueue_chunked("one", endless());
        queue.enqueue_chunked("two", endless());
        queue.enqueue_chunked("two", endless());
        queue.enqueue_rendered(RenderedAudio::new("two", Arc::new(InstantClip { fail: false })));

        let snapshot = queue.snapshot().await;
        assert_eq!(snapshot.playing.as_deref(), Some("one"));
        assert_eq!(snapshot.queued, vec!["two".to_string(), "two".to_string()]);
        assert_eq!(player.held.lock().expect("lock").len(), 1);
        assert!(queue.is_playing());
    }

    #[tokio::test]
    async fn clear_stops_playback_and_suppresses_further_starts() {
        let player = Arc::new(StuckPlayer::default());
        let queue = PlaybackQueue::new(player.clone());
        let mut events = queue.subscribe();
        queue.enqueue_chunked("first", endless());
        queue.enqueue_chunked("second", endless());
        assert_eq!(next_event(&mut events).await, started("first", Duration::ZERO));

        queue.clear();
        assert_eq!(player.stops.load(Ordering::SeqCst), 1);
        assert!(!queue.is_playing());
        assert_eq!(queue.snapshot().await, QueueSnapshot::default());

        // Completing the stale item must not advance anything.
        let (_, done) = player.held.lock().expect("lock").remove(0);
        done.finished();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty)));

        queue.enqueue_chunked("third", endless());
        assert_eq!(next_event(&mut events).await, started("third", Duration::ZERO));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clear_racing_an_enqueue_keeps_one_item_playing() {
        for _ in 0..20 {
            let player = Arc::new(StuckPlayer::default());
            let queue = PlaybackQueue::new(player.clone());

            // Block the stop path so the enqueue lands between the
            // generation bump and the slot update.
            let guard = queue.shared.slot();
            let clearing = {
                let queue = queue.clone();
                std::thread::spawn(move || queue.clear())
            };
            while queue.shared.generation() == 0 {
                std::thread::yield_now();
            }
            queue.enqueue_chunked("new", endless());
            drop(guard);
            clearing.join().expect("clear thread");
            queue.enqueue_chunked("after", endless());

            let snapshot = queue.snapshot().await;
            assert_eq!(snapshot.playing.as_deref(), Some("new"));
            assert_eq!(snapshot.queued, vec!["after".to_string()]);
            assert_eq!(player.held.lock().expect("lock").len(), 1);
            assert_eq!(player.stops.load(Ordering::SeqCst), 0);
            assert!(queue.is_playing());
        }
    }

    #[tokio::test]
    async fn clear_stops_a_rendered_clip_synchronously() {
        let clip = Arc::new(HeldClip::default());
        let queue = PlaybackQueue::new(Arc::new(StuckPlayer::default()));
        let mut events = queue.subscribe();
        queue.enqueue_rendered(RenderedAudio::new("long", clip.clone()));
        assert_eq!(
            next_event(&mut events).await,
            started("long", Duration::from_millis(1500))
        );
        queue.enqueue_rendered(RenderedAudio::new("after", Arc::new(InstantClip { fail: false })));
        queue.clear();
        assert_eq!(clip.stops.load(Ordering::SeqCst), 1);
        assert_eq!(queue.snapshot().await, QueueSnapshot::default());
        assert!(events.try_recv().is_err());
    }
}
