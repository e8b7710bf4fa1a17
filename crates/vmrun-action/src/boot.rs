//! Boot readiness detection for VirtualBox guests.
//!
//! VirtualBox gives no signal when the guest OS has finished booting, so
//! the console is polled: every interval a probe runs, and the first
//! positive answer ends the wait. The budget is a fixed number of
//! iterations with a fixed sleep before each; there is no backoff.
//!
//! The default probe screenshots the console and OCRs it. OCR is
//! timing-dependent and can misread the screen, so [`SshProbe`] is offered
//! as a sturdier alternative for images that bring sshd up on boot.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use vmrun_core::{CommandRunner, CommandSpec, FailurePolicy, Result, VmError};

use crate::remote::RemoteExecutor;

/// A single readiness check.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// `Ok(true)` once the guest is ready. Errors count as "not yet".
    async fn is_ready(&self) -> Result<bool>;
}

/// OCR match rule: with a tag, the screen must contain it (case-sensitive);
/// without one, the screen must be blank.
pub fn screen_matches(text: &str, tag: Option<&str>) -> bool {
    match tag {
        Some(tag) => text.contains(tag),
        None => text.trim().is_empty(),
    }
}

/// Screenshot the VirtualBox console and OCR it with `tesseract`.
pub struct OcrProbe {
    runner: Arc<dyn CommandRunner>,
    vm_name: String,
    screenshot: PathBuf,
    tag: Option<String>,
}

impl OcrProbe {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        vm_name: impl Into<String>,
        screenshot: impl Into<PathBuf>,
        tag: Option<String>,
    ) -> Self {
        Self {
            runner,
            vm_name: vm_name.into(),
            screenshot: screenshot.into(),
            tag,
        }
    }

    async fn read_screen(&self) -> Result<String> {
        let shot = self.screenshot.to_string_lossy().into_owned();
        let capture = CommandSpec::new("vboxmanage")
            .args(["controlvm", self.vm_name.as_str(), "screenshotpng", shot.as_str()])
            .captured();
        self.runner.run_with(&capture, FailurePolicy::Fatal).await?;

        let ocr = CommandSpec::new("tesseract")
            .args([shot.as_str(), "stdout"])
            .captured();
        let out = self.runner.run_with(&ocr, FailurePolicy::Fatal).await?;
        Ok(out.stdout)
    }
}

#[async_trait]
impl ReadinessProbe for OcrProbe {
    async fn is_ready(&self) -> Result<bool> {
        let text = self.read_screen().await?;
        debug!(screen = %text.trim(), "ocr");
        Ok(screen_matches(&text, self.tag.as_deref()))
    }
}

/// Ready once `ssh <target> true` succeeds.
pub struct SshProbe {
    remote: RemoteExecutor,
}

impl SshProbe {
    pub fn new(remote: RemoteExecutor) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl ReadinessProbe for SshProbe {
    async fn is_ready(&self) -> Result<bool> {
        Ok(self.remote.probe("true").await)
    }
}

/// Fixed-interval, fixed-budget poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootDetector {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for BootDetector {
    fn default() -> Self {
        Self {
            interval: Self::DEFAULT_INTERVAL,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl BootDetector {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 300;

    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Poll `probe` until it reports ready. Returns the iteration that
    /// succeeded, after one extra settle interval.
    ///
    /// Fails with [`VmError::BootTimeout`] after exactly `max_attempts`
    /// negative iterations.
    pub async fn wait(&self, probe: &dyn ReadinessProbe) -> Result<u32> {
        info!(max_attempts = self.max_attempts, "waiting for the guest to boot");
        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(self.interval).await;
            match probe.is_ready().await {
                Ok(true) => {
                    info!(attempt, "guest is ready");
                    tokio::time::sleep(self.interval).await;
                    return Ok(attempt);
                }
                Ok(false) => info!(attempt, "still waiting for boot"),
                Err(e) => warn!(attempt, error = %e, "boot probe failed, still waiting"),
            }
        }
        Err(VmError::BootTimeout {
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;
    use vmrun_core::fakes::{FakeResponse, FakeRunner};

    struct NeverReady {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ReadinessProbe for NeverReady {
        async fn is_ready(&self) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
    }

    #[test]
    fn test_match_rule() {
        assert!(screen_matches("FreeBSD/amd64\nlogin: ", Some("login:")));
        assert!(!screen_matches("Login: ", Some("login:")));
        assert!(screen_matches("  \n\t", None));
        assert!(!screen_matches("booting...", None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ocr_tag_found_on_fifth_iteration() {
        let runner = Arc::new(
            FakeRunner::new()
                .on(FakeResponse::stdout("tesseract", "Booting kernel").times(4))
                .on(FakeResponse::stdout("tesseract", "...\nsolaris console login: ...")),
        );
        let probe = OcrProbe::new(runner.clone(), "solaris", "/tmp/shot.png", Some("login:".to_string()));
        let detector = BootDetector::default();

        let start = Instant::now();
        let attempts = detector.wait(&probe).await.unwrap();

        assert_eq!(attempts, 5);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
        assert_eq!(runner.count_matching("screenshotpng"), 5);
        assert_eq!(runner.count_matching("tesseract"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_screen_without_tag() {
        let runner = Arc::new(
            FakeRunner::new()
                .on(FakeResponse::stdout("tesseract", "Loading...").times(2))
                .on(FakeResponse::stdout("tesseract", "\n")),
        );
        let probe = OcrProbe::new(runner, "vm", "/tmp/shot.png", None);
        let attempts = BootDetector::default().wait(&probe).await.unwrap();
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_exact_budget() {
        let probe = NeverReady {
            calls: AtomicU32::new(0),
        };
        let detector = BootDetector::new(Duration::from_secs(1), 7);

        let start = Instant::now();
        let err = detector.wait(&probe).await.unwrap_err();

        assert!(matches!(err, VmError::BootTimeout { attempts: 7 }));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 7);
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_failures_count_as_not_ready() {
        let runner = Arc::new(
            FakeRunner::new()
                .on(FakeResponse::exit("screenshotpng", 1).times(2))
                .on(FakeResponse::stdout("tesseract", "login:")),
        );
        let probe = OcrProbe::new(runner.clone(), "vm", "/tmp/shot.png", Some("login:".to_string()));
        let attempts = BootDetector::new(Duration::from_secs(1), 3).wait(&probe).await.unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(runner.count_matching("tesseract"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ssh_probe_waits_for_sshd() {
        let runner = Arc::new(FakeRunner::new().on(FakeResponse::exit("ssh", 255).times(3)));
        let remote = RemoteExecutor::new(runner.clone(), "root@127.0.0.1").port(2222);
        let attempts = BootDetector::default()
            .wait(&SshProbe::new(remote))
            .await
            .unwrap();
        assert_eq!(attempts, 4);
        assert_eq!(runner.calls().len(), 4);
    }
}
