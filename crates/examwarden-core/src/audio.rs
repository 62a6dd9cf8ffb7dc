//! Audio playback guard.
//!
//! Listening material may be heard once. The guard keeps a per-group playback
//! state, auto-starts playback shortly after a listening group becomes
//! current, and allows a manual start only until the first successful one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::error::AudioError;
use crate::model::{QuestionGroup, QuestionId, SectionKind};
use crate::sync::lock;

/// Presentation-side audio output.
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Begin playing `url`. Resolves once playback has started.
    async fn play(&self, url: &str) -> anyhow::Result<()>;
}

/// Player for headless runs: logs instead of producing sound.
pub struct SilentPlayer;

#[async_trait]
impl AudioPlayer for SilentPlayer {
    async fn play(&self, url: &str) -> anyhow::Result<()> {
        tracing::info!(url, "audio playback started");
        Ok(())
    }
}

/// Playback state of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    NotStarted,
    Starting,
    /// The last start attempt failed; a retry is allowed.
    Failed,
    /// Playback started once. Terminal for the session.
    Played,
}

#[derive(Default)]
struct Registry {
    /// Bumped on every reset so late completions from a previous section are dropped.
    generation: u64,
    groups: HashMap<QuestionId, PlaybackState>,
}

struct Shared {
    player: Arc<dyn AudioPlayer>,
    registry: Mutex<Registry>,
}

impl Shared {
    async fn start(&self, group_id: QuestionId, url: &str) -> Result<(), AudioError> {
        let generation = {
            let mut registry = lock(&self.registry);
            match registry.groups.get(&group_id) {
                Some(PlaybackState::Played) => return Err(AudioError::AlreadyPlayed(group_id)),
                Some(PlaybackState::Starting) => return Err(AudioError::Starting(group_id)),
                _ => {}
            }
            registry.groups.insert(group_id, PlaybackState::Starting);
            registry.generation
        };

        let result = self.player.play(url).await;

        let mut registry = lock(&self.registry);
        if registry.generation != generation {
            return result.map_err(|e| AudioError::Playback(e.to_string()));
        }
        match result {
            Ok(()) => {
                registry.groups.insert(group_id, PlaybackState::Played);
                tracing::debug!(group_id, "group audio played");
                Ok(())
            }
            Err(e) => {
                registry.groups.insert(group_id, PlaybackState::Failed);
                Err(AudioError::Playback(e.to_string()))
            }
        }
    }
}

/// Enforces single playback per group.
pub struct AudioPlaybackGuard {
    shared: Arc<Shared>,
    autoplay_delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl AudioPlaybackGuard {
    pub fn new(player: Arc<dyn AudioPlayer>, autoplay_delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                player,
                registry: Mutex::new(Registry::default()),
            }),
            autoplay_delay,
            pending: Mutex::new(None),
        }
    }

    pub fn state(&self, group_id: QuestionId) -> PlaybackState {
        lock(&self.shared.registry)
            .groups
            .get(&group_id)
            .copied()
            .unwrap_or(PlaybackState::NotStarted)
    }

    pub fn has_played(&self, group_id: QuestionId) -> bool {
        self.state(group_id) == PlaybackState::Played
    }

    /// Whether the manual start control should be offered.
    pub fn can_retry(&self, group_id: QuestionId) -> bool {
        matches!(
            self.state(group_id),
            PlaybackState::NotStarted | PlaybackState::Failed
        )
    }

    /// Called when `group` becomes the current unit. Schedules autoplay for
    /// listening groups with audio that have not been heard yet.
    ///
    /// Returns `true` if playback was scheduled.
    pub fn on_group_current(&self, section: SectionKind, group: &QuestionGroup) -> bool {
        self.cancel_pending();
        if !section.is_listening() {
            return false;
        }
        let Some(url) = group.audio_url().map(str::to_string) else {
            return false;
        };
        if !self.can_retry(group.id) {
            return false;
        }

        let shared = Arc::clone(&self.shared);
        let delay = self.autoplay_delay;
        let group_id = group.id;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = shared.start(group_id, &url).await {
                tracing::warn!(group_id, "autoplay did not start: {e}");
            }
        });
        *lock(&self.pending) = Some(task);
        true
    }

    /// Manual (retry) start of a group's audio.
    pub async fn start(&self, group: &QuestionGroup) -> Result<(), AudioError> {
        let url = group
            .audio_url()
            .ok_or(AudioError::NoAudio(group.id))?
            .to_string();
        self.shared.start(group.id, &url).await
    }

    /// Forget all playback state; used on section transition.
    pub fn reset(&self) {
        self.cancel_pending();
        let mut registry = lock(&self.shared.registry);
        registry.generation += 1;
        registry.groups.clear();
    }

    fn cancel_pending(&self) {
        if let Some(task) = lock(&self.pending).take() {
            task.abort();
        }
    }
}

impl Drop for AudioPlaybackGuard {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::model::{Attachment, AttachmentKind, GroupKind, Question};

    struct CountingPlayer {
        plays: AtomicUsize,
        failures_left: AtomicUsize,
        start_delay: Duration,
    }

    impl CountingPlayer {
        fn new(failures: usize, start_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                plays: AtomicUsize::new(0),
                failures_left: AtomicUsize::new(failures),
                start_delay,
            })
        }
    }

    #[async_trait]
    impl AudioPlayer for CountingPlayer {
        async fn play(&self, _url: &str) -> anyhow::Result<()> {
            tokio::time::sleep(self.start_delay).await;
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("autoplay blocked");
            }
            self.plays.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn listening_group(id: QuestionId) -> QuestionGroup {
        QuestionGroup {
            id,
            kind: GroupKind::Group,
            prompt: Some("Listen".into()),
            attachment: Some(Attachment {
                kind: AttachmentKind::Audio,
                url: format!("audio-{id}.mp3"),
            }),
            questions: vec![Question {
                id: id + 1,
                order_number: 1,
                prompt: String::new(),
                option_a: Some("a".into()),
                option_b: None,
                option_c: None,
                option_d: None,
                audio_url: None,
                image_url: None,
                group_id: Some(id),
            }],
            start_order: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn autoplay_plays_once_and_locks_controls() {
        let player = CountingPlayer::new(0, Duration::ZERO);
        let guard = AudioPlaybackGuard::new(player.clone(), Duration::from_millis(500));
        let group = listening_group(10);

        assert!(guard.on_group_current(SectionKind::Listening, &group));
        assert!(guard.can_retry(10));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(guard.has_played(10));
        assert!(!guard.can_retry(10));
        assert_eq!(guard.start(&group).await, Err(AudioError::AlreadyPlayed(10)));
        assert!(!guard.on_group_current(SectionKind::Listening, &group));
        assert_eq!(player.plays.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_autoplay_allows_manual_retry() {
        let player = CountingPlayer::new(1, Duration::ZERO);
        let guard = AudioPlaybackGuard::new(player.clone(), Duration::from_millis(100));
        let group = listening_group(20);

        guard.on_group_current(SectionKind::Listening, &group);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(guard.state(20), PlaybackState::Failed);
        assert!(guard.can_retry(20));

        guard.start(&group).await.unwrap();
        assert!(guard.has_played(20));
        assert!(!guard.can_retry(20));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_starts_play_once() {
        let player = CountingPlayer::new(0, Duration::from_millis(200));
        let guard = AudioPlaybackGuard::new(player.clone(), Duration::ZERO);
        let group = listening_group(30);

        let (first, second) = tokio::join!(guard.start(&group), guard.start(&group));
        assert!(first.is_ok());
        assert_eq!(second, Err(AudioError::Starting(30)));
        assert_eq!(player.plays.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_listening_sections_never_autoplay() {
        let player = CountingPlayer::new(0, Duration::ZERO);
        let guard = AudioPlaybackGuard::new(player.clone(), Duration::ZERO);
        assert!(!guard.on_group_current(SectionKind::Reading, &listening_group(40)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(player.plays.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cancels_pending_autoplay() {
        let player = CountingPlayer::new(0, Duration::ZERO);
        let guard = AudioPlaybackGuard::new(player.clone(), Duration::from_secs(2));
        guard.on_group_current(SectionKind::Listening, &listening_group(50));
        guard.reset();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(player.plays.load(Ordering::SeqCst), 0);
        assert_eq!(guard.state(50), PlaybackState::NotStarted);
    }
}
