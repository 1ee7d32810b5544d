use std::time::Duration;

use async_trait::async_trait;

use crate::gpu::UtilizationSource;

/// Powers the host off.
#[async_trait]
pub trait Shutdown: Send + Sync {
    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// Runs a shell command, `sudo shutdown -h now` by default.
pub struct CommandShutdown {
    pub command: String,
}

#[async_trait]
impl Shutdown for CommandShutdown {
    async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::warn!(command = %self.command, "shutting down host");
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("shutdown command exited with {:?}", status.code());
        }
        Ok(())
    }
}

/// Continuous-idle counter.
///
/// Every all-idle sample adds one sampling interval, any busy sample resets
/// to zero. A host without visible GPUs is idle.
#[derive(Debug, Clone)]
pub struct IdleTracker {
    duration: Duration,
    interval: Duration,
    idle_for: Duration,
}

impl IdleTracker {
    pub fn new(duration: Duration, interval: Duration) -> Self {
        Self {
            duration,
            interval,
            idle_for: Duration::ZERO,
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.idle_for
    }

    /// Feed one sample; true once the host has been idle for `duration`.
    pub fn observe(&mut self, utilization: &[u32]) -> bool {
        if utilization.iter().all(|u| *u == 0) {
            self.idle_for += self.interval;
        } else {
            self.idle_for = Duration::ZERO;
        }
        self.idle_for >= self.duration
    }
}

pub async fn run_timed(shutdown: &dyn Shutdown, delay: Duration, duration: Duration) -> anyhow::Result<()> {
    tokio::time::sleep(delay).await;
    tracing::info!(duration_s = duration.as_secs_f64(), "timed watcher armed");
    tokio::time::sleep(duration).await;
    shutdown.shutdown().await
}

/// Watch GPU utilisation until the host is idle for `duration`, then shut down.
/// A failed shutdown re-arms the watcher instead of ending it.
pub async fn run_gpu_idle(
    source: &dyn UtilizationSource,
    shutdown: &dyn Shutdown,
    delay: Duration,
    duration: Duration,
    interval: Duration,
) -> anyhow::Result<()> {
    tokio::time::sleep(delay).await;
    tracing::info!(
        duration_s = duration.as_secs_f64(),
        interval_s = interval.as_secs_f64(),
        "gpu-idle watcher armed"
    );
    let mut tracker = IdleTracker::new(duration, interval);
    loop {
        let sample = match source.sample().await {
            Ok(sample) => sample,
            Err(e) => {
                // Unknown utilisation is not idleness.
                tracing::warn!(error = %e, "gpu sample failed");
                vec![u32::MAX]
            }
        };
        let was_idle = tracker.idle_for();
        if tracker.observe(&sample) {
            tracing::info!(idle_s = tracker.idle_for().as_secs_f64(), "all GPUs idle");
            match shutdown.shutdown().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    // Start counting idleness again and retry once the window fills.
                    tracing::error!(error = %e, "shutdown failed, still watching");
                    tracker = IdleTracker::new(duration, interval);
                }
            }
        }
        if was_idle > Duration::ZERO && tracker.idle_for() == Duration::ZERO {
            tracing::debug!(?sample, "GPU busy, idle counter reset");
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        samples: Mutex<VecDeque<Vec<u32>>>,
        taken: AtomicUsize,
    }

    impl Scripted {
        fn new(samples: Vec<Vec<u32>>) -> Self {
            Self {
                samples: Mutex::new(samples.into()),
                taken: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl UtilizationSource for Scripted {
        async fn sample(&self) -> anyhow::Result<Vec<u32>> {
            self.taken.fetch_add(1, Ordering::SeqCst);
            let next = self.samples.lock().unwrap().pop_front();
            next.ok_or_else(|| anyhow::anyhow!("script exhausted"))
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Shutdown for Recorder {
        async fn shutdown(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn fires_after_continuous_idle() {
        let mut t = IdleTracker::new(Duration::from_secs(3), Duration::from_secs(1));
        let fired: Vec<bool> = [vec![50, 0], vec![0, 3], vec![0, 0], vec![0, 0], vec![0, 0]]
            .iter()
            .map(|s| t.observe(s))
            .collect();
        assert_eq!(fired, vec![false, false, false, false, true]);
    }

    #[test]
    fn busy_sample_resets() {
        let mut t = IdleTracker::new(Duration::from_secs(3), Duration::from_secs(1));
        assert!(!t.observe(&[0]));
        assert!(!t.observe(&[0]));
        assert!(!t.observe(&[1]));
        assert_eq!(t.idle_for(), Duration::ZERO);
        assert!(!t.observe(&[0]));
    }

    #[test]
    fn no_gpu_is_idle() {
        let mut t = IdleTracker::new(Duration::from_secs(2), Duration::from_secs(1));
        assert!(!t.observe(&[]));
        assert!(t.observe(&[]));
    }

    #[tokio::test]
    async fn gpu_idle_shuts_down_once() {
        let source = Scripted::new(vec![vec![90], vec![0], vec![0], vec![0]]);
        let recorder = Recorder::default();
        run_gpu_idle(
            &source,
            &recorder,
            Duration::ZERO,
            Duration::from_millis(3),
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.taken.load(Ordering::SeqCst), 4);
    }

    /// Fails the first `failures` shutdowns.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Shutdown for Flaky {
        async fn shutdown(&self) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                anyhow::bail!("shutdown command exited with Some(1)");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_shutdown_keeps_watching() {
        let source = Scripted::new(vec![vec![0]; 4]);
        let flaky = Flaky {
            failures: 1,
            calls: AtomicUsize::new(0),
        };
        run_gpu_idle(
            &source,
            &flaky,
            Duration::ZERO,
            Duration::from_millis(2),
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
        // The idle window starts over after the failed attempt.
        assert_eq!(source.taken.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn failed_sample_counts_as_busy() {
        let source = Scripted::new(vec![vec![0], vec![0]]);
        let mut tracker = IdleTracker::new(Duration::from_millis(3), Duration::from_millis(1));
        for _ in 0..3 {
            let sample = source.sample().await.unwrap_or_else(|_| vec![u32::MAX]);
            assert!(!tracker.observe(&sample));
        }
        assert_eq!(tracker.idle_for(), Duration::ZERO);
    }

    #[tokio::test]
    async fn timed_waits_then_shuts_down() {
        let recorder = Recorder::default();
        let started = std::time::Instant::now();
        run_timed(&recorder, Duration::from_millis(5), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(15));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    }
}
