//! Single-flight pull sessions.
//!
//! A session is one deduplicated background pull.  The table maps image
//! references to live sessions: a caller either creates a session or
//! attaches to the one already in flight, and every waiter observes the
//! same terminal outcome.  Sessions are admitted to a shared worker pool
//! through a bounded channel; when the channel is full, callers fail fast
//! with an unavailability error rather than blocking.
//!
//! The session's lifetime is its own: caller cancellation merely detaches
//! the waiter, while the session runs to completion or to its hard timeout.
//! Results linger for a short grace period so late waiters still observe
//! the terminal state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, instrument, warn};

use super::{PullError, Puller};
use crate::cred::AuthCandidate;
use crate::image::ImageRef;

/// Minimum `--async-image-pull-timeout` for the async path to be enabled.
pub const MIN_ASYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a finished session stays visible to late waiters.
const RESULT_GRACE: Duration = Duration::from_secs(60);

/// Admission-queue capacity and worker-pool sizing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound of the admission channel; a full channel fails fast.
    pub capacity: usize,
    /// Number of background pull workers.
    pub workers: usize,
    /// Hard per-session deadline; `None` disables the async path.
    pub async_timeout: Option<Duration>,
    /// Post-completion result retention.
    pub result_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            workers: 4,
            async_timeout: None,
            result_grace: RESULT_GRACE,
        }
    }
}

impl SessionConfig {
    /// Apply the operator-supplied async timeout, enforcing the minimum.
    /// Too-small values disable the async path entirely.
    pub fn with_async_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.async_timeout = match timeout {
            Some(t) if t >= MIN_ASYNC_TIMEOUT => Some(t),
            Some(t) => {
                warn!(
                    timeout = ?t,
                    minimum = ?MIN_ASYNC_TIMEOUT,
                    "async image pull timeout below minimum, async path disabled",
                );
                None
            }
            None => None,
        };
        self
    }
}

#[derive(Debug, Clone)]
enum SessionState {
    Pending,
    Done(Result<(), PullError>),
}

struct PullSession {
    image: ImageRef,
    candidates: Vec<AuthCandidate>,
    pull_always: bool,
    state: watch::Sender<SessionState>,
}

impl PullSession {
    fn subscribe(&self) -> SessionHandle {
        SessionHandle {
            rx: self.state.subscribe(),
        }
    }
}

/// A waiter's view of a pull session.
#[derive(Debug)]
pub struct SessionHandle {
    rx: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Wait for the session's terminal outcome, optionally bounded.
    ///
    /// Dropping the future detaches this waiter without affecting the
    /// session.  A `limit` of `None` waits until the session finishes on
    /// its own (or hits its hard timeout).
    pub async fn wait(mut self, limit: Option<Duration>) -> Result<(), PullError> {
        let outcome = async {
            loop {
                if let SessionState::Done(result) = self.rx.borrow_and_update().clone() {
                    return result;
                }
                if self.rx.changed().await.is_err() {
                    // Worker side vanished; the final state may still have
                    // been published before the sender dropped.
                    if let SessionState::Done(result) = self.rx.borrow().clone() {
                        return result;
                    }
                    return Err(PullError::Transport("pull session dropped".into()));
                }
            }
        };

        match limit {
            Some(duration) => tokio::time::timeout(duration, outcome)
                .await
                .unwrap_or_else(|_| {
                    Err(PullError::Timeout(format!(
                        "waited {} for pull session",
                        humantime::format_duration(duration),
                    )))
                }),
            None => outcome.await,
        }
    }
}

type SessionMap = Arc<Mutex<HashMap<ImageRef, Arc<PullSession>>>>;

/// The image acquirer (C2): single-flight sessions over a [`Puller`].
pub struct ImageAcquirer {
    sessions: SessionMap,
    admit: mpsc::Sender<Arc<PullSession>>,
    async_timeout: Option<Duration>,
}

impl ImageAcquirer {
    /// Build the acquirer and spawn its worker pool.
    pub fn new(puller: Arc<Puller>, config: SessionConfig) -> Self {
        let (admit, receiver) = mpsc::channel::<Arc<PullSession>>(config.capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));

        for _ in 0..config.workers.max(1) {
            tokio::spawn(worker(
                Arc::clone(&receiver),
                Arc::clone(&sessions),
                Arc::clone(&puller),
                config.async_timeout,
                config.result_grace,
            ));
        }

        Self {
            sessions,
            admit,
            async_timeout: config.async_timeout,
        }
    }

    /// The session deadline, when the async path is enabled.
    pub fn async_timeout(&self) -> Option<Duration> {
        self.async_timeout
    }

    /// Attach to the in-flight session for `image`, creating one if none
    /// exists.  Fails fast with [`PullError::RuntimeUnavailable`] when the
    /// admission queue is full.
    #[instrument(skip(self, candidates), fields(image = %image))]
    pub fn acquire(
        &self,
        image: &ImageRef,
        candidates: Vec<AuthCandidate>,
        pull_always: bool,
    ) -> Result<SessionHandle, PullError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = sessions.get(image) {
            debug!(%image, "attached to in-flight pull session");
            return Ok(existing.subscribe());
        }

        let (state, _) = watch::channel(SessionState::Pending);
        let session = Arc::new(PullSession {
            image: image.clone(),
            candidates,
            pull_always,
            state,
        });
        let handle = session.subscribe();

        match self.admit.try_send(Arc::clone(&session)) {
            Ok(()) => {
                sessions.insert(image.clone(), session);
                Ok(handle)
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(PullError::RuntimeUnavailable(
                "pull admission queue is full".into(),
            )),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(PullError::Transport("pull worker pool is gone".into()))
            }
        }
    }

    /// Block until `image` is present: attach or create, then wait without
    /// a waiter-side limit.
    pub async fn ensure_present(
        &self,
        image: &ImageRef,
        candidates: Vec<AuthCandidate>,
        pull_always: bool,
    ) -> Result<(), PullError> {
        self.acquire(image, candidates, pull_always)?.wait(None).await
    }
}

/// Worker loop: drain the admission queue, run pulls under the session
/// deadline, publish results, and expire finished sessions after the grace
/// period.
async fn worker(
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<PullSession>>>>,
    sessions: SessionMap,
    puller: Arc<Puller>,
    session_timeout: Option<Duration>,
    grace: Duration,
) {
    loop {
        let session = {
            let mut receiver = receiver.lock().await;
            match receiver.recv().await {
                Some(session) => session,
                None => return,
            }
        };

        let pull = puller.ensure_present(&session.image, &session.candidates, session.pull_always);
        let result = match session_timeout {
            Some(limit) => tokio::time::timeout(limit, pull).await.unwrap_or_else(|_| {
                Err(PullError::Timeout(format!(
                    "pull of {} exceeded {}",
                    session.image,
                    humantime::format_duration(limit),
                )))
            }),
            None => pull.await,
        };

        let succeeded = result.is_ok();
        session.state.send_replace(SessionState::Done(result));

        // A successful result stays visible for late waiters through the
        // grace period.  A failed session is dropped right away so the next
        // attempt starts a fresh pull instead of observing the stale error.
        let retain = if succeeded { grace } else { Duration::ZERO };
        let sessions = Arc::clone(&sessions);
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            if !retain.is_zero() {
                tokio::time::sleep(retain).await;
            }
            let mut sessions = sessions.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(current) = sessions.get(&session.image) {
                if Arc::ptr_eq(current, &session) {
                    sessions.remove(&session.image);
                }
            }
        });
    }
}
