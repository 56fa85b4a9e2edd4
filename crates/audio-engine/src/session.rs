//! Playback sessions: identity tokens for play attempts.
//!
//! Every track start, seek and loop start gets a new [`PlaybackSession`]. Buffer completions
//! carry the session they were scheduled for; once the caller's [`SessionRegistry`] has moved on,
//! those completions are ignored.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A-B loop region in seconds. `end_time == None` is an open loop (start marked, end pending).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlaybackLoop {
    pub start_time: f64,
    pub end_time: Option<f64>,
}

impl PlaybackLoop {
    /// Returns `None` unless `end_time > start_time` (when present) and `start_time >= 0`.
    pub fn new(start_time: f64, end_time: Option<f64>) -> Option<Self> {
        if !start_time.is_finite() || start_time < 0.0 {
            return None;
        }
        if let Some(end) = end_time {
            if !end.is_finite() || end <= start_time {
                return None;
            }
        }
        Some(Self {
            start_time,
            end_time,
        })
    }

    pub fn open(start_time: f64) -> Option<Self> {
        Self::new(start_time, None)
    }

    pub fn bounded(start_time: f64, end_time: f64) -> Option<Self> {
        Self::new(start_time, Some(end_time))
    }

    /// Both ends are set, so the loop can be scheduled.
    pub fn is_complete(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start_time && self.end_time.is_none_or(|end| time < end)
    }
}

struct SessionInner {
    id: u64,
    track: Arc<str>,
    playback_loop: Option<PlaybackLoop>,
}

/// Opaque identity of one play attempt. Cloning shares the identity; equality is by id.
#[derive(Clone)]
pub struct PlaybackSession(Arc<SessionInner>);

impl PlaybackSession {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Label of the track this session plays (path or title).
    pub fn track(&self) -> &str {
        &self.0.track
    }

    pub fn playback_loop(&self) -> Option<PlaybackLoop> {
        self.0.playback_loop
    }

    pub fn has_loop(&self) -> bool {
        self.0.playback_loop.is_some()
    }

    pub fn has_complete_loop(&self) -> bool {
        self.0.playback_loop.is_some_and(|l| l.is_complete())
    }
}

impl PartialEq for PlaybackSession {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for PlaybackSession {}

impl Hash for PlaybackSession {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl std::fmt::Debug for PlaybackSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackSession")
            .field("id", &self.0.id)
            .field("track", &self.0.track)
            .field("loop", &self.0.playback_loop)
            .finish()
    }
}

/// Answers "is this still the session the caller considers active?".
///
/// The engine never decides this itself; it is injected by the track-sequencing layer.
pub trait SessionQuery: Send + Sync {
    fn is_current(&self, session: &PlaybackSession) -> bool;
}

impl<F> SessionQuery for F
where
    F: Fn(&PlaybackSession) -> bool + Send + Sync,
{
    fn is_current(&self, session: &PlaybackSession) -> bool {
        self(session)
    }
}

/// Mints sessions and tracks the current one.
#[derive(Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    current: Mutex<Option<PlaybackSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn mint(&self, track: Arc<str>, playback_loop: Option<PlaybackLoop>) -> PlaybackSession {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = PlaybackSession(Arc::new(SessionInner {
            id,
            track,
            playback_loop,
        }));
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        session
    }

    /// Start a new session for `track`, superseding the current one.
    pub fn start(&self, track: impl Into<Arc<str>>) -> PlaybackSession {
        self.mint(track.into(), None)
    }

    pub fn start_with_loop(
        &self,
        track: impl Into<Arc<str>>,
        playback_loop: PlaybackLoop,
    ) -> PlaybackSession {
        self.mint(track.into(), Some(playback_loop))
    }

    /// Continue the same track in a new session carrying `playback_loop`.
    pub fn with_loop(&self, session: &PlaybackSession, playback_loop: PlaybackLoop) -> PlaybackSession {
        self.mint(session.0.track.clone(), Some(playback_loop))
    }

    /// Continue the same track in a new session without a loop.
    pub fn remove_loop(&self, session: &PlaybackSession) -> PlaybackSession {
        self.mint(session.0.track.clone(), None)
    }

    /// No session is current any more (playback stopped).
    pub fn end_current(&self) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn current(&self) -> Option<PlaybackSession> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SessionQuery for SessionRegistry {
    fn is_current(&self, session: &PlaybackSession) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|current| current == session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_requires_end_after_start() {
        assert!(PlaybackLoop::bounded(2.0, 4.0).is_some());
        assert!(PlaybackLoop::bounded(4.0, 4.0).is_none());
        assert!(PlaybackLoop::bounded(-1.0, 4.0).is_none());
        let open = PlaybackLoop::open(3.0).unwrap();
        assert!(!open.is_complete());
        assert!(open.contains(100.0));
        assert!(!PlaybackLoop::bounded(2.0, 4.0).unwrap().contains(4.0));
    }

    #[test]
    fn newer_session_supersedes_older() {
        let registry = SessionRegistry::new();
        let first = registry.start("a.flac");
        assert!(registry.is_current(&first));

        let looped = registry.with_loop(&first, PlaybackLoop::bounded(1.0, 2.0).unwrap());
        assert!(!registry.is_current(&first));
        assert!(registry.is_current(&looped));
        assert_eq!(looped.track(), "a.flac");
        assert!(looped.has_complete_loop());

        let plain = registry.remove_loop(&looped);
        assert!(!plain.has_loop());
        assert_ne!(plain, looped);

        registry.end_current();
        assert!(!registry.is_current(&plain));
        assert!(registry.current().is_none());
    }

    #[test]
    fn closures_work_as_session_queries() {
        let registry = SessionRegistry::new();
        let s = registry.start("x");
        let always = |_: &PlaybackSession| true;
        assert!(always.is_current(&s));
        assert_eq!(s.clone(), s);
    }
}
