//! Scaling decisions.
//!
//! Usage is the average channel load per worker, expressed as a
//! percentage of the per-worker channel capacity. Scaling one step at a
//! time is deliberate: each step changes the average, and the next tick
//! re-evaluates with fresh numbers.
//!
//! The up and down rules each check both the current usage and the
//! usage the fleet would have after growing by one. That second check
//! is the hysteresis band: a fleet that would land below `scale_down`
//! right after growing never grows, and one that would land above
//! `scale_up` right after growing never shrinks, so the worker count
//! cannot oscillate between two adjacent sizes on a steady load.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use chatgrid_core::ClusterConfig;
use chatgrid_core::config::{ProcessBounds, ScaleThresholds};

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    ScaleTo(usize),
    NoChange,
}

/// Average usage percentage: channels carried per worker relative to
/// the per-worker capacity. Zero workers reads as zero usage.
pub fn usage(channel_count: usize, server_count: usize, capacity: usize) -> f64 {
    if server_count == 0 || capacity == 0 {
        return 0.0;
    }
    channel_count as f64 / (server_count * capacity) as f64 * 100.0
}

/// Decide the next worker count for the observed load.
pub fn decide(
    bounds: &ProcessBounds,
    thresholds: &ScaleThresholds,
    server_count: usize,
    channel_count: usize,
) -> ScaleDecision {
    // Out-of-bounds fleets are corrected before load is even considered.
    if server_count < bounds.min {
        return ScaleDecision::ScaleTo(bounds.min);
    }
    if server_count > bounds.max {
        return ScaleDecision::ScaleTo(bounds.max);
    }

    let current = usage(channel_count, server_count, thresholds.channels);
    let if_grown = usage(channel_count, server_count + 1, thresholds.channels);

    if current > thresholds.scale_up && if_grown > thresholds.scale_down {
        let target = (server_count + 1).min(bounds.max);
        if target != server_count {
            return ScaleDecision::ScaleTo(target);
        }
    } else if current < thresholds.scale_down && if_grown < thresholds.scale_up {
        let target = server_count.saturating_sub(1).max(bounds.min);
        if target != server_count {
            return ScaleDecision::ScaleTo(target);
        }
    }
    ScaleDecision::NoChange
}

pub type ScaleFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Callback that applies a new worker count (the pool's `scale`).
pub type ScaleCallback = Box<dyn Fn(usize) -> ScaleFuture + Send + Sync>;

/// Periodic evaluator: decides and applies, one step per tick.
pub struct AutoScaler {
    config: Arc<ClusterConfig>,
    scale: ScaleCallback,
    scaling: AtomicBool,
}

impl AutoScaler {
    pub fn new(config: Arc<ClusterConfig>, scale: ScaleCallback) -> Self {
        Self {
            config,
            scale,
            scaling: AtomicBool::new(false),
        }
    }

    /// Evaluate the observed load and apply any change. Calls made while
    /// a previous scale operation is still running are ignored.
    pub async fn tick(&self, server_count: usize, channel_count: usize) -> anyhow::Result<()> {
        let decision = decide(
            &self.config.autoscale.processes,
            &self.config.autoscale.thresholds,
            server_count,
            channel_count,
        );
        let ScaleDecision::ScaleTo(target) = decision else {
            return Ok(());
        };

        if self
            .scaling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("scale operation still in flight, skipping evaluation");
            return Ok(());
        }

        info!(
            server_count,
            channel_count,
            target,
            usage = usage(channel_count, server_count, self.config.autoscale.thresholds.channels),
            "scaling worker fleet"
        );
        let result = (self.scale)(target).await;
        self.scaling.store(false, Ordering::SeqCst);
        if let Err(error) = &result {
            warn!(%error, target, "scale operation failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn bounds(min: usize, max: usize) -> ProcessBounds {
        ProcessBounds { min, max }
    }

    fn thresholds(channels: usize, up: f64, down: f64) -> ScaleThresholds {
        ScaleThresholds {
            channels,
            scale_up: up,
            scale_down: down,
        }
    }

    #[test]
    fn usage_is_average_load_percentage() {
        assert_eq!(usage(50, 2, 30), 50.0 / 60.0 * 100.0);
        assert_eq!(usage(0, 2, 30), 0.0);
        assert_eq!(usage(100, 0, 30), 0.0);
    }

    #[test]
    fn grows_under_heavy_load() {
        // 50 channels on 2 workers at 30/worker: 83% current, 56% after
        // growing. Both above their thresholds, so grow.
        let decision = decide(&bounds(1, 10), &thresholds(30, 75.0, 50.0), 2, 50);
        assert_eq!(decision, ScaleDecision::ScaleTo(3));
    }

    #[test]
    fn shrinks_under_light_load() {
        // 20 channels on 2 workers: 33% current, 22% after growing.
        let decision = decide(&bounds(1, 10), &thresholds(30, 75.0, 50.0), 2, 20);
        assert_eq!(decision, ScaleDecision::ScaleTo(1));
    }

    #[test]
    fn holds_inside_the_band() {
        // 35 channels on 2 workers: 58%, between the thresholds.
        let decision = decide(&bounds(1, 10), &thresholds(30, 75.0, 50.0), 2, 35);
        assert_eq!(decision, ScaleDecision::NoChange);
    }

    #[test]
    fn hysteresis_blocks_growth_that_would_undershoot() {
        // 3 workers at 10/worker carrying 24 channels: 80% current is
        // above scale_up, but a grown fleet would sit at 60%, below
        // scale_down (65). Growing would immediately argue for shrinking.
        let decision = decide(&bounds(1, 10), &thresholds(10, 75.0, 65.0), 3, 24);
        assert_eq!(decision, ScaleDecision::NoChange);
    }

    #[test]
    fn hysteresis_blocks_shrink_that_would_overshoot() {
        // Current usage 47% is below scale_down (50), but the grown-fleet
        // usage 35% is still above scale_up (30): load is high enough
        // that shrinking would immediately argue for growing.
        let decision = decide(&bounds(1, 10), &thresholds(10, 30.0, 50.0), 3, 14);
        assert_eq!(decision, ScaleDecision::NoChange);
    }

    #[test]
    fn respects_bounds() {
        // Heavy load at max stays at max.
        let decision = decide(&bounds(1, 3), &thresholds(10, 75.0, 50.0), 3, 1000);
        assert_eq!(decision, ScaleDecision::NoChange);
        // Idle fleet at min stays at min.
        let decision = decide(&bounds(2, 10), &thresholds(10, 75.0, 50.0), 2, 0);
        assert_eq!(decision, ScaleDecision::NoChange);
    }

    #[test]
    fn corrects_out_of_bounds_fleet() {
        let decision = decide(&bounds(2, 10), &thresholds(10, 75.0, 50.0), 0, 0);
        assert_eq!(decision, ScaleDecision::ScaleTo(2));
        let decision = decide(&bounds(2, 10), &thresholds(10, 75.0, 50.0), 15, 0);
        assert_eq!(decision, ScaleDecision::ScaleTo(10));
    }

    #[test]
    fn one_step_at_a_time() {
        // Grossly overloaded, still only one step up per evaluation.
        let decision = decide(&bounds(1, 20), &thresholds(10, 75.0, 50.0), 2, 10_000);
        assert_eq!(decision, ScaleDecision::ScaleTo(3));
    }

    fn test_config(channels: usize) -> Arc<ClusterConfig> {
        let mut config = ClusterConfig::default();
        config.autoscale.processes = bounds(1, 10);
        config.autoscale.thresholds = thresholds(channels, 75.0, 50.0);
        Arc::new(config)
    }

    #[tokio::test]
    async fn tick_applies_decision_through_callback() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let applied_in_cb = applied.clone();
        let callback: ScaleCallback = Box::new(move |target| {
            let applied = applied_in_cb.clone();
            Box::pin(async move {
                applied.lock().unwrap().push(target);
                Ok(())
            })
        });
        let scaler = AutoScaler::new(test_config(30), callback);

        scaler.tick(2, 50).await.unwrap();
        scaler.tick(2, 35).await.unwrap();
        assert_eq!(*applied.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn tick_reports_callback_failure() {
        let callback: ScaleCallback =
            Box::new(|_| Box::pin(async { anyhow::bail!("no capacity") }));
        let scaler = AutoScaler::new(test_config(30), callback);

        assert!(scaler.tick(2, 50).await.is_err());
        // The guard is released after a failure; the next tick retries.
        assert!(scaler.tick(2, 50).await.is_err());
    }

    #[tokio::test]
    async fn slow_scale_suppresses_overlap() {
        let calls = Arc::new(Mutex::new(0usize));
        let calls_in_cb = calls.clone();
        let callback: ScaleCallback = Box::new(move |_| {
            let calls = calls_in_cb.clone();
            Box::pin(async move {
                *calls.lock().unwrap() += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            })
        });
        let scaler = Arc::new(AutoScaler::new(test_config(30), callback));

        let slow = tokio::spawn({
            let scaler = scaler.clone();
            async move { scaler.tick(2, 50).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        // A second evaluation while the first is applying is a no-op.
        scaler.tick(2, 50).await.unwrap();
        slow.await.unwrap().unwrap();

        assert_eq!(*calls.lock().unwrap(), 1);
    }
}
