//! Image acquisition.
//!
//! [`Puller`] drives a single pull through the runtime: probe the store,
//! walk the credential candidates in order, fall back to an anonymous
//! attempt, and report timing and size metrics.  [`session`] layers the
//! process-wide single-flight deduplication and the async session machinery
//! on top.

pub mod session;

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cred::AuthCandidate;
use crate::image::ImageRef;
use crate::metrics::Metrics;
use crate::runtime::{ImageService, RuntimeError};

pub use session::{ImageAcquirer, SessionConfig, SessionHandle};

/// Failure taxonomy of an image acquisition, as surfaced to the mount
/// orchestrator.
#[derive(Debug, Error, Clone)]
pub enum PullError {
    /// Every authenticated attempt failed.  Carries the aggregate of all
    /// attempt errors.
    #[error("credentials exhausted pulling {image}: {attempts}")]
    CredentialsExhausted { image: String, attempts: String },

    /// The pull ran past its deadline.
    #[error("pull timed out: {0}")]
    Timeout(String),

    /// The runtime endpoint is unreachable.
    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// The registry does not know the image.
    #[error("image not found: {0}")]
    NotFound(String),

    /// The wiring between waiter and pull worker broke down.
    #[error("transport error: {0}")]
    Transport(String),

    /// Anything else, with the underlying message preserved.
    #[error("{0}")]
    Unknown(String),
}

impl From<RuntimeError> for PullError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Unavailable(m) => PullError::RuntimeUnavailable(m),
            RuntimeError::NotFound(m) => PullError::NotFound(m),
            RuntimeError::DeadlineExceeded(m) => PullError::Timeout(m),
            RuntimeError::Transport(m) => PullError::Transport(m),
            RuntimeError::Call(m) => PullError::Unknown(m),
        }
    }
}

/// Pulls one image at a time through the runtime's image service.
pub struct Puller {
    images: Arc<dyn ImageService>,
    metrics: Arc<Metrics>,
}

impl Puller {
    pub fn new(images: Arc<dyn ImageService>, metrics: Arc<Metrics>) -> Self {
        Self { images, metrics }
    }

    /// Block until `image` exists in the runtime store.
    ///
    /// With `pull_always` unset, an image the runtime already reports is
    /// accepted without contacting the registry.  Otherwise candidates are
    /// tried in order, finishing with one anonymous attempt; the terminal
    /// error aggregates every attempt.
    #[instrument(skip(self, candidates), fields(image = %image, candidates = candidates.len()))]
    pub async fn ensure_present(
        &self,
        image: &ImageRef,
        candidates: &[AuthCandidate],
        pull_always: bool,
    ) -> Result<(), PullError> {
        if !pull_always {
            match self.images.image_status(image).await {
                Ok(Some(_)) => {
                    debug!(%image, "image already present, skipping pull");
                    return Ok(());
                }
                Ok(None) => {}
                // A failed probe is not fatal; the pull below will surface
                // any real runtime problem.
                Err(e) => debug!(%image, error = %e, "image status probe failed"),
            }
        }

        let started = Instant::now();
        let result = self.walk_candidates(image, candidates).await;
        let elapsed = started.elapsed();
        self.metrics
            .observe_pull(image.as_str(), elapsed.as_secs_f64(), result.is_err());

        match &result {
            Ok(()) => {
                info!(%image, elapsed_ms = elapsed.as_millis() as u64, "image pulled");
                self.probe_size(image).await;
            }
            Err(e) => {
                self.metrics.count_error("pull-error");
                warn!(%image, error = %e, "pull failed");
            }
        }
        result
    }

    /// Try each candidate in order, then one anonymous attempt.
    async fn walk_candidates(
        &self,
        image: &ImageRef,
        candidates: &[AuthCandidate],
    ) -> Result<(), PullError> {
        let mut attempts: Vec<RuntimeError> = Vec::new();

        for (i, candidate) in candidates.iter().enumerate() {
            debug!(%image, attempt = i + 1, total = candidates.len(), "authenticated pull attempt");
            match self.images.pull_image(image, Some(candidate)).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    debug!(%image, attempt = i + 1, error = %e, "pull attempt failed");
                    attempts.push(e);
                }
            }
        }

        debug!(%image, "anonymous pull attempt");
        match self.images.pull_image(image, None).await {
            Ok(_) => Ok(()),
            Err(e) => {
                attempts.push(e);
                Err(aggregate(image, !candidates.is_empty(), attempts))
            }
        }
    }

    /// Report the size of a pulled image; failures are logged, never fatal.
    async fn probe_size(&self, image: &ImageRef) {
        match self.images.image_status(image).await {
            Ok(Some(info)) => {
                debug!(%image, size = info.size, "image size probed");
                self.metrics.observe_pull_size(image.as_str(), info.size);
            }
            Ok(None) => {
                self.metrics.count_error("size-error");
                warn!(%image, "pulled image missing from status probe");
            }
            Err(e) => {
                self.metrics.count_error("size-error");
                warn!(%image, error = %e, "image size probe failed");
            }
        }
    }
}

/// Collapse the attempt errors into a single taxonomy kind, keeping every
/// message.
///
/// The last attempt (always the anonymous one) decides the kind when its
/// cause is recognizable; a plain runtime denial falls back to
/// credentials-exhausted when authenticated attempts were made.
fn aggregate(image: &ImageRef, had_candidates: bool, attempts: Vec<RuntimeError>) -> PullError {
    let joined = attempts
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");

    match attempts.last() {
        Some(RuntimeError::DeadlineExceeded(_)) => PullError::Timeout(joined),
        Some(RuntimeError::Unavailable(_)) => PullError::RuntimeUnavailable(joined),
        Some(RuntimeError::NotFound(_)) => PullError::NotFound(joined),
        Some(RuntimeError::Transport(_)) => PullError::Transport(joined),
        Some(RuntimeError::Call(_)) if had_candidates => PullError::CredentialsExhausted {
            image: image.to_string(),
            attempts: joined,
        },
        Some(RuntimeError::Call(_)) => PullError::Unknown(joined),
        None => PullError::Unknown(format!("pull of {image} failed with no attempts")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ImageInfo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted image service: answers status from a flag and fails pulls
    /// until a configured attempt number.
    struct ScriptedImages {
        present: Mutex<bool>,
        pulls: AtomicUsize,
        succeed_on_attempt: usize,
        auths_seen: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedImages {
        fn new(present: bool, succeed_on_attempt: usize) -> Self {
            Self {
                present: Mutex::new(present),
                pulls: AtomicUsize::new(0),
                succeed_on_attempt,
                auths_seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ImageService for ScriptedImages {
        async fn pull_image(
            &self,
            image: &ImageRef,
            auth: Option<&AuthCandidate>,
        ) -> Result<String, RuntimeError> {
            let attempt = self.pulls.fetch_add(1, Ordering::SeqCst) + 1;
            self.auths_seen
                .lock()
                .unwrap()
                .push(auth.map(|a| a.username.clone()));
            if attempt >= self.succeed_on_attempt {
                *self.present.lock().unwrap() = true;
                Ok(image.to_string())
            } else {
                Err(RuntimeError::Call(format!("attempt {attempt} denied")))
            }
        }

        async fn image_status(&self, _image: &ImageRef) -> Result<Option<ImageInfo>, RuntimeError> {
            if *self.present.lock().unwrap() {
                Ok(Some(ImageInfo {
                    size: 42,
                    ..Default::default()
                }))
            } else {
                Ok(None)
            }
        }

        async fn list_images(&self) -> Result<Vec<ImageInfo>, RuntimeError> {
            Ok(Vec::new())
        }
    }

    fn image() -> ImageRef {
        ImageRef::parse("registry.example.com/app:1").unwrap()
    }

    fn candidate(user: &str) -> AuthCandidate {
        AuthCandidate {
            username: user.into(),
            password: "p".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn present_image_skips_pull() {
        let images = Arc::new(ScriptedImages::new(true, 1));
        let puller = Puller::new(images.clone(), Arc::new(Metrics::new()));
        puller.ensure_present(&image(), &[], false).await.unwrap();
        assert_eq!(images.pulls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pull_always_pulls_despite_presence() {
        let images = Arc::new(ScriptedImages::new(true, 1));
        let puller = Puller::new(images.clone(), Arc::new(Metrics::new()));
        puller.ensure_present(&image(), &[], true).await.unwrap();
        assert_eq!(images.pulls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_candidates_pull_anonymously_once() {
        let images = Arc::new(ScriptedImages::new(false, 1));
        let puller = Puller::new(images.clone(), Arc::new(Metrics::new()));
        puller.ensure_present(&image(), &[], false).await.unwrap();
        assert_eq!(images.pulls.load(Ordering::SeqCst), 1);
        assert_eq!(*images.auths_seen.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn candidates_walked_in_order() {
        let images = Arc::new(ScriptedImages::new(false, 2));
        let puller = Puller::new(images.clone(), Arc::new(Metrics::new()));
        puller
            .ensure_present(&image(), &[candidate("first"), candidate("second")], false)
            .await
            .unwrap();
        let seen = images.auths_seen.lock().unwrap();
        assert_eq!(*seen, vec![Some("first".to_owned()), Some("second".to_owned())]);
    }

    #[tokio::test]
    async fn exhausted_candidates_aggregate() {
        // Two candidates plus the anonymous attempt, all denied.
        let images = Arc::new(ScriptedImages::new(false, 99));
        let puller = Puller::new(images.clone(), Arc::new(Metrics::new()));
        let err = puller
            .ensure_present(&image(), &[candidate("a"), candidate("b")], false)
            .await
            .unwrap_err();
        assert_eq!(images.pulls.load(Ordering::SeqCst), 3);
        match err {
            PullError::CredentialsExhausted { attempts, .. } => {
                assert!(attempts.contains("attempt 1"));
                assert!(attempts.contains("attempt 3"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn anonymous_failure_without_candidates_is_unknown() {
        let images = Arc::new(ScriptedImages::new(false, 99));
        let puller = Puller::new(images, Arc::new(Metrics::new()));
        let err = puller.ensure_present(&image(), &[], false).await.unwrap_err();
        assert!(matches!(err, PullError::Unknown(_)));
    }

    #[test]
    fn aggregate_maps_by_last_cause() {
        let img = image();

        // A mixed attempt set takes its kind from the final attempt.
        let err = aggregate(
            &img,
            true,
            vec![
                RuntimeError::NotFound("no manifest".into()),
                RuntimeError::Unavailable("runtime down".into()),
            ],
        );
        assert!(matches!(err, PullError::RuntimeUnavailable(_)));

        let err = aggregate(
            &img,
            true,
            vec![
                RuntimeError::Unavailable("runtime down".into()),
                RuntimeError::DeadlineExceeded("too slow".into()),
            ],
        );
        assert!(matches!(err, PullError::Timeout(_)));

        let err = aggregate(&img, false, vec![RuntimeError::Transport("h2 reset".into())]);
        assert!(matches!(err, PullError::Transport(_)));

        let err = aggregate(
            &img,
            true,
            vec![RuntimeError::NotFound("gone".into()), RuntimeError::NotFound("gone".into())],
        );
        assert!(matches!(err, PullError::NotFound(_)));
    }

    #[test]
    fn aggregate_plain_denials_exhaust_credentials() {
        let img = image();
        let denied = || RuntimeError::Call("denied".into());

        let err = aggregate(&img, true, vec![denied(), denied()]);
        match err {
            PullError::CredentialsExhausted { attempts, .. } => {
                assert!(attempts.contains("denied"))
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = aggregate(&img, false, vec![denied()]);
        assert!(matches!(err, PullError::Unknown(_)));
    }
}
