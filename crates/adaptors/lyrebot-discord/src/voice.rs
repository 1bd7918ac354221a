//! Voice playback coordination
//!
//! One [`VoiceSession`] per guild owns an unbounded FIFO queue of pending
//! utterances and a driving task that plays them one at a time. Producers only
//! enqueue; the driver is the sole consumer and the sole writer of the
//! `current` slot, which guarantees at most one utterance plays per guild at
//! any instant.
//!
//! Playback completion is signalled by songbird track events (`End`/`Error`)
//! rather than polling, and the scratch audio file backing an utterance is
//! deleted exactly once, after that signal fires.
//!
//! Reconnection policy: `songbird.join` moves an existing call when the bot is
//! already connected elsewhere in the guild, and songbird handles dropped
//! voice connections itself; the coordinator never rebuilds connection state
//! by hand.

use async_trait::async_trait;
use lyrebot_core::{LyrebirdClient, LyrebotError, Result, TokenStore};
use serenity::http::Http;
use serenity::model::id::{ChannelId, GuildId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use songbird::{
    input::File as SongbirdFile, input::Input, Event, EventContext,
    EventHandler as SongbirdEventHandler, Songbird, TrackEvent,
};

/// One synthesized audio clip queued for playback
#[derive(Debug, Clone)]
pub struct Utterance {
    /// User who requested the speech
    pub requester_id: u64,
    /// Text channel to report playback errors to
    pub channel_id: u64,
    /// Scratch WAV file holding the synthesized audio
    pub audio_path: PathBuf,
    /// Playback volume as a 0.0-1.0 fraction
    pub volume: f32,
}

/// Playback seam over the voice transport.
///
/// `play` resolves when playback has finished, successfully or not.
#[async_trait]
pub trait Player: Send + Sync + 'static {
    /// Play one utterance in the guild's voice connection to completion
    async fn play(&self, guild_id: u64, utterance: &Utterance) -> Result<()>;
}

/// Seam for sending text replies back to the chat platform
#[async_trait]
pub trait Replies: Send + Sync + 'static {
    /// Send a message to a text channel, logging (not propagating) failures
    async fn send(&self, channel_id: u64, message: &str);
}

/// Playback state for one guild's voice channel
pub struct VoiceSession {
    /// Voice channel the bot is connected to
    pub channel_id: u64,
    queue: mpsc::UnboundedSender<Utterance>,
    current: Arc<RwLock<Option<Utterance>>>,
    driver: JoinHandle<()>,
}

/// Coordinates per-guild playback sessions and the speak pipeline
pub struct VoiceManager {
    songbird: Arc<Songbird>,
    player: Arc<dyn Player>,
    replies: Arc<dyn Replies>,
    tokens: Arc<TokenStore>,
    lyrebird: Arc<LyrebirdClient>,
    sessions: RwLock<HashMap<u64, VoiceSession>>,
    /// Process-wide playback volume fraction (intentionally not per-session)
    volume: RwLock<f32>,
    scratch_dir: PathBuf,
    /// Per-utterance scratch file suffix; repeated speaks from one user must
    /// not share a file while the earlier one is still queued or playing
    scratch_seq: AtomicU64,
}

impl VoiceManager {
    /// Create a manager over the given transport and collaborator seams
    pub fn new(
        songbird: Arc<Songbird>,
        player: Arc<dyn Player>,
        replies: Arc<dyn Replies>,
        tokens: Arc<TokenStore>,
        lyrebird: Arc<LyrebirdClient>,
    ) -> Self {
        Self {
            songbird,
            player,
            replies,
            tokens,
            lyrebird,
            sessions: RwLock::new(HashMap::new()),
            volume: RwLock::new(1.0),
            scratch_dir: std::env::temp_dir(),
            scratch_seq: AtomicU64::new(0),
        }
    }

    /// Override the scratch directory for synthesized audio files
    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.scratch_dir = dir;
        self
    }

    /// Connect to (or move to) the requester's voice channel.
    ///
    /// Idempotent: joining the channel the bot is already in is a no-op at the
    /// transport level. The session and its driving task are created lazily on
    /// the first connect for a guild and live until shutdown.
    pub async fn ensure_connected(&self, guild_id: u64, voice_channel_id: u64) -> Result<()> {
        self.songbird
            .join(GuildId::new(guild_id), ChannelId::new(voice_channel_id))
            .await
            .map_err(|e| LyrebotError::voice(format!("failed to join voice channel: {}", e)))?;
        self.register_session(guild_id, voice_channel_id).await;
        Ok(())
    }

    /// Record the connected channel for a guild, spawning the driving task on
    /// the first registration
    async fn register_session(&self, guild_id: u64, voice_channel_id: u64) {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&guild_id) {
            Some(session) => {
                if session.channel_id != voice_channel_id {
                    info!(
                        guild_id = %guild_id,
                        channel_id = %voice_channel_id,
                        "Moved voice connection"
                    );
                    session.channel_id = voice_channel_id;
                }
            }
            None => {
                info!(guild_id = %guild_id, channel_id = %voice_channel_id, "Joined voice channel");
                let (tx, rx) = mpsc::unbounded_channel();
                let current = Arc::new(RwLock::new(None));
                let driver = tokio::spawn(drive_queue(
                    guild_id,
                    rx,
                    self.player.clone(),
                    current.clone(),
                    self.replies.clone(),
                ));
                sessions.insert(
                    guild_id,
                    VoiceSession {
                        channel_id: voice_channel_id,
                        queue: tx,
                        current,
                        driver,
                    },
                );
            }
        }
    }

    /// Synthesize `text` with the requester's token and queue it for playback.
    ///
    /// Fails with `NoToken` before any network call when the requester has no
    /// stored token. The scratch file is removed again if enqueueing fails, so
    /// nothing is left behind on error.
    pub async fn synthesize_and_enqueue(
        &self,
        guild_id: u64,
        requester_id: u64,
        text_channel_id: u64,
        text: &str,
    ) -> Result<()> {
        let token = self
            .tokens
            .get(requester_id)
            .await
            .ok_or(LyrebotError::NoToken(requester_id))?;

        let audio = self.lyrebird.synthesize(text, &token).await?;
        let seq = self.scratch_seq.fetch_add(1, Ordering::Relaxed);
        let audio_path = self.scratch_dir.join(format!("{requester_id}-{seq}.wav"));
        tokio::fs::write(&audio_path, &audio).await?;

        let utterance = Utterance {
            requester_id,
            channel_id: text_channel_id,
            audio_path: audio_path.clone(),
            volume: *self.volume.read().await,
        };

        let sessions = self.sessions.read().await;
        let enqueued = sessions
            .get(&guild_id)
            .map(|session| session.queue.send(utterance).is_ok())
            .unwrap_or(false);
        if !enqueued {
            let _ = tokio::fs::remove_file(&audio_path).await;
            return Err(LyrebotError::playback(
                "no active voice session for this guild",
            ));
        }
        debug!(guild_id = %guild_id, requester_id = %requester_id, "Queued utterance");
        Ok(())
    }

    /// Set the process-wide volume from an integer percentage
    pub async fn set_volume(&self, percent: u32) -> f32 {
        let fraction = (percent as f32 / 100.0).clamp(0.0, 1.0);
        *self.volume.write().await = fraction;
        fraction
    }

    /// Current process-wide volume fraction
    pub async fn volume(&self) -> f32 {
        *self.volume.read().await
    }

    /// The utterance currently playing in a guild, if any
    pub async fn current_utterance(&self, guild_id: u64) -> Option<Utterance> {
        let sessions = self.sessions.read().await;
        match sessions.get(&guild_id) {
            Some(session) => session.current.read().await.clone(),
            None => None,
        }
    }

    /// Cancel every driving task and disconnect every voice connection.
    ///
    /// In-flight synthesis requests are abandoned, not awaited.
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.write().await;
        for (guild_id, session) in sessions.drain() {
            session.driver.abort();
            if let Err(e) = self.songbird.remove(GuildId::new(guild_id)).await {
                warn!(guild_id = %guild_id, error = %e, "Error disconnecting voice on shutdown");
            }
        }
        info!("Voice sessions shut down");
    }
}

/// Driving loop: one iteration is one utterance lifecycle.
///
/// Blocks on the queue without polling, plays to completion through the
/// `Player` seam, reports failures to the originating text channel, and
/// deletes the scratch file exactly once afterwards.
async fn drive_queue(
    guild_id: u64,
    mut rx: mpsc::UnboundedReceiver<Utterance>,
    player: Arc<dyn Player>,
    current: Arc<RwLock<Option<Utterance>>>,
    replies: Arc<dyn Replies>,
) {
    while let Some(utterance) = rx.recv().await {
        debug!(
            guild_id = %guild_id,
            requester_id = %utterance.requester_id,
            "Got new speech from the queue"
        );
        *current.write().await = Some(utterance.clone());

        if let Err(e) = player.play(guild_id, &utterance).await {
            warn!(guild_id = %guild_id, error = %e, "Playback failed");
            replies.send(utterance.channel_id, &e.user_message()).await;
        }

        if let Err(e) = tokio::fs::remove_file(&utterance.audio_path).await {
            warn!(
                path = %utterance.audio_path.display(),
                error = %e,
                "Failed to delete scratch audio file"
            );
        }
        *current.write().await = None;
    }
    debug!(guild_id = %guild_id, "Driving loop stopped");
}

/// Songbird-backed [`Player`]: plays a scratch file into the guild's call and
/// waits for the track-end signal
pub struct SongbirdPlayer {
    songbird: Arc<Songbird>,
}

impl SongbirdPlayer {
    /// Wrap a songbird instance shared with the serenity client
    pub fn new(songbird: Arc<Songbird>) -> Self {
        Self { songbird }
    }
}

#[async_trait]
impl Player for SongbirdPlayer {
    async fn play(&self, guild_id: u64, utterance: &Utterance) -> Result<()> {
        let call_lock = self
            .songbird
            .get(GuildId::new(guild_id))
            .ok_or_else(|| LyrebotError::playback("no voice connection for this guild"))?;

        let input: Input = SongbirdFile::new(utterance.audio_path.clone()).into();
        let handle = {
            let mut call = call_lock.lock().await;
            call.play_input(input)
        };
        handle
            .set_volume(utterance.volume)
            .map_err(|e| LyrebotError::playback(format!("set volume: {}", e)))?;

        let done = Arc::new(Notify::new());
        let errored = Arc::new(AtomicBool::new(false));
        for (event, is_error) in [(TrackEvent::End, false), (TrackEvent::Error, true)] {
            handle
                .add_event(
                    Event::Track(event),
                    PlaybackGate {
                        done: done.clone(),
                        errored: errored.clone(),
                        is_error,
                    },
                )
                .map_err(|e| LyrebotError::playback(format!("register track event: {}", e)))?;
        }

        done.notified().await;
        if errored.load(Ordering::SeqCst) {
            return Err(LyrebotError::playback(
                "track reported a playback error (malformed audio?)",
            ));
        }
        debug!(guild_id = %guild_id, "Audio finished");
        Ok(())
    }
}

/// Track-event handler that wakes the waiting `play` call
struct PlaybackGate {
    done: Arc<Notify>,
    errored: Arc<AtomicBool>,
    is_error: bool,
}

#[async_trait]
impl SongbirdEventHandler for PlaybackGate {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        if self.is_error {
            self.errored.store(true, Ordering::SeqCst);
        }
        self.done.notify_one();
        None
    }
}

/// [`Replies`] over the serenity HTTP API
pub struct HttpReplies {
    http: Arc<Http>,
}

impl HttpReplies {
    /// Wrap a serenity HTTP handle
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Replies for HttpReplies {
    async fn send(&self, channel_id: u64, message: &str) {
        if let Err(e) = ChannelId::new(channel_id).say(&self.http, message).await {
            warn!(channel_id = %channel_id, error = %format!("{:?}", e), "Failed to send reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct PlayedEntry {
        requester_id: u64,
        audio_path: PathBuf,
        file_present: bool,
    }

    struct FakePlayer {
        log: Arc<StdMutex<Vec<PlayedEntry>>>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        fail: bool,
    }

    impl FakePlayer {
        fn new(fail: bool) -> Self {
            Self {
                log: Arc::new(StdMutex::new(Vec::new())),
                active: Arc::new(AtomicUsize::new(0)),
                max_active: Arc::new(AtomicUsize::new(0)),
                fail,
            }
        }
    }

    #[async_trait]
    impl Player for FakePlayer {
        async fn play(&self, _guild_id: u64, utterance: &Utterance) -> Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.log.lock().unwrap().push(PlayedEntry {
                requester_id: utterance.requester_id,
                audio_path: utterance.audio_path.clone(),
                file_present: utterance.audio_path.exists(),
            });
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(LyrebotError::playback("decoder exploded"));
            }
            Ok(())
        }
    }

    struct FakeReplies {
        sent: Arc<StdMutex<Vec<(u64, String)>>>,
    }

    impl FakeReplies {
        fn new() -> Self {
            Self {
                sent: Arc::new(StdMutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Replies for FakeReplies {
        async fn send(&self, channel_id: u64, message: &str) {
            self.sent
                .lock()
                .unwrap()
                .push((channel_id, message.to_string()));
        }
    }

    fn utterance_with_file(dir: &std::path::Path, requester_id: u64) -> Utterance {
        let audio_path = dir.join(format!("{requester_id}.wav"));
        std::fs::write(&audio_path, b"RIFFfake").unwrap();
        Utterance {
            requester_id,
            channel_id: 500,
            audio_path,
            volume: 1.0,
        }
    }

    #[tokio::test]
    async fn test_driving_loop_plays_fifo_one_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let player = Arc::new(FakePlayer::new(false));
        let replies = Arc::new(FakeReplies::new());
        let current = Arc::new(RwLock::new(None));
        let (tx, rx) = mpsc::unbounded_channel();

        let driver = tokio::spawn(drive_queue(
            1,
            rx,
            player.clone(),
            current.clone(),
            replies.clone(),
        ));

        let utterances: Vec<_> = (1..=3).map(|i| utterance_with_file(dir.path(), i)).collect();
        let paths: Vec<_> = utterances.iter().map(|u| u.audio_path.clone()).collect();
        for u in utterances {
            tx.send(u).unwrap();
        }
        drop(tx);
        driver.await.unwrap();

        let played: Vec<u64> = player
            .log
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.requester_id)
            .collect();
        assert_eq!(played, vec![1, 2, 3]);
        assert_eq!(player.max_active.load(Ordering::SeqCst), 1);
        assert!(current.read().await.is_none());
        for path in paths {
            assert!(!path.exists(), "scratch file should be deleted");
        }
        assert!(replies.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scratch_file_deleted_and_error_reported_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let player = Arc::new(FakePlayer::new(true));
        let replies = Arc::new(FakeReplies::new());
        let current = Arc::new(RwLock::new(None));
        let (tx, rx) = mpsc::unbounded_channel();

        let driver = tokio::spawn(drive_queue(
            1,
            rx,
            player,
            current,
            replies.clone(),
        ));

        let utterance = utterance_with_file(dir.path(), 7);
        let path = utterance.audio_path.clone();
        tx.send(utterance).unwrap();
        drop(tx);
        driver.await.unwrap();

        assert!(!path.exists(), "scratch file must not be left behind");
        let sent = replies.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 500);
        assert!(sent[0].1.contains("An error occurred"));
    }

    #[tokio::test]
    async fn test_speak_without_token_enqueues_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = VoiceManager::new(
            Songbird::serenity(),
            Arc::new(FakePlayer::new(false)),
            Arc::new(FakeReplies::new()),
            Arc::new(TokenStore::default()),
            Arc::new(LyrebirdClient::new()),
        )
        .with_scratch_dir(dir.path().to_path_buf());

        let err = manager
            .synthesize_and_enqueue(1, 99, 500, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, LyrebotError::NoToken(99)));
        assert!(
            std::fs::read_dir(dir.path()).unwrap().next().is_none(),
            "no scratch file written"
        );
        assert!(manager.current_utterance(1).await.is_none());
    }

    #[tokio::test]
    async fn test_repeated_speaks_get_their_own_scratch_files() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"RIFFwav".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let player = Arc::new(FakePlayer::new(false));
        let tokens = Arc::new(TokenStore::default());
        tokens.insert(7, "tok-7".to_string()).await;
        let manager = VoiceManager::new(
            Songbird::serenity(),
            player.clone(),
            Arc::new(FakeReplies::new()),
            tokens,
            Arc::new(LyrebirdClient::with_endpoint(format!(
                "{}/generate",
                server.uri()
            ))),
        )
        .with_scratch_dir(dir.path().to_path_buf());

        manager.register_session(1, 42).await;
        manager
            .synthesize_and_enqueue(1, 7, 500, "hello world")
            .await
            .unwrap();
        manager
            .synthesize_and_enqueue(1, 7, 500, "hello again")
            .await
            .unwrap();

        // The driver clears the current slot only after deleting the file, so
        // both lifecycles are fully finished once the slot is empty again.
        for _ in 0..200 {
            if player.log.lock().unwrap().len() == 2 && manager.current_utterance(1).await.is_none()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let log = player.log.lock().unwrap();
        assert_eq!(log.len(), 2, "both utterances played");
        assert_ne!(
            log[0].audio_path, log[1].audio_path,
            "a second speak from the same user must not reuse the first file"
        );
        for entry in log.iter() {
            assert_eq!(entry.requester_id, 7);
            assert!(
                entry.file_present,
                "audio file must still exist when its playback starts"
            );
            assert!(!entry.audio_path.exists(), "deleted after playback");
        }
        drop(log);
        assert!(manager.current_utterance(1).await.is_none());
    }

    #[tokio::test]
    async fn test_volume_is_clamped_fraction() {
        let manager = VoiceManager::new(
            Songbird::serenity(),
            Arc::new(FakePlayer::new(false)),
            Arc::new(FakeReplies::new()),
            Arc::new(TokenStore::default()),
            Arc::new(LyrebirdClient::new()),
        );
        assert_eq!(manager.set_volume(60).await, 0.6);
        assert_eq!(manager.volume().await, 0.6);
        assert_eq!(manager.set_volume(250).await, 1.0);
    }
}
