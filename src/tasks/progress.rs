// =============================================================================
// Progress tracking — adaptive throttling + staged composition
// =============================================================================
//
// ProgressTracker bounds notification volume two ways at once:
//   - a minimum wall-clock interval between notifications (default 0.5 s),
//   - an item threshold derived from max_updates (default 100), so a run
//     over N items notifies at most ~max_updates times.
// Completion always delivers the final 100, exactly once.
//
// StagedProgressTracker composes sub-trackers onto disjoint global ranges,
// e.g. data_load 0-20, init 20-25, execute 25-95, finalize 95-100. Global
// progress is monotonic by construction.
// =============================================================================

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Notification callback. Receives global progress in [0, 100].
pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_MAX_UPDATES: usize = 100;

struct TrackerState {
    processed: usize,
    last_update: Instant,
    last_progress: u8,
    completion_fired: bool,
}

/// Item-driven progress over a known total, with adaptive throttling.
pub struct ProgressTracker {
    total_items: usize,
    min_interval: Duration,
    update_threshold: usize,
    callback: Option<ProgressCallback>,
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    pub fn new(total_items: usize, callback: Option<ProgressCallback>) -> Self {
        Self::with_limits(total_items, DEFAULT_MIN_INTERVAL, DEFAULT_MAX_UPDATES, callback)
    }

    pub fn with_limits(
        total_items: usize,
        min_interval: Duration,
        max_updates: usize,
        callback: Option<ProgressCallback>,
    ) -> Self {
        let total_items = total_items.max(1);
        Self {
            total_items,
            min_interval,
            update_threshold: (total_items / max_updates.max(1)).max(1),
            callback,
            state: Mutex::new(TrackerState {
                processed: 0,
                last_update: Instant::now(),
                last_progress: 0,
                completion_fired: false,
            }),
        }
    }

    /// Record `items` processed. Returns the progress when a notification
    /// fired, `None` when throttled.
    pub fn update(&self, items: usize) -> Option<u8> {
        let fired = {
            let mut st = self.state.lock();
            st.processed += items;
            let progress = ((st.processed * 100 / self.total_items).min(100)) as u8;

            let time_passed = st.last_update.elapsed() >= self.min_interval;
            let threshold_reached = st.processed % self.update_threshold == 0;
            let progress_changed = progress > st.last_progress;
            let is_complete = st.processed >= self.total_items && !st.completion_fired;

            let should = (time_passed && (threshold_reached || progress_changed)) || is_complete;
            if !should {
                return None;
            }

            st.last_update = Instant::now();
            st.last_progress = st.last_progress.max(progress);
            if st.processed >= self.total_items {
                st.completion_fired = true;
            }
            progress
        };

        if let Some(callback) = &self.callback {
            callback(fired);
        }
        Some(fired)
    }

    /// Jump directly to a progress value (stage-style updates). Only ever
    /// moves forward.
    pub fn set_progress(&self, progress: u8) {
        let progress = progress.min(100);
        {
            let mut st = self.state.lock();
            if progress <= st.last_progress {
                return;
            }
            st.last_progress = progress;
            st.last_update = Instant::now();
        }
        if let Some(callback) = &self.callback {
            callback(progress);
        }
    }

    pub fn progress(&self) -> u8 {
        self.state.lock().last_progress
    }

    pub fn is_complete(&self) -> bool {
        let st = self.state.lock();
        st.processed >= self.total_items
    }
}

// ---------------------------------------------------------------------------
// Staged tracker
// ---------------------------------------------------------------------------

struct StageMeta {
    name: String,
    start: u8,
    end: u8,
}

struct StagedState {
    stages: Vec<StageMeta>,
    total_progress: u8,
}

/// Composes sub-trackers mapped onto disjoint global progress ranges.
pub struct StagedProgressTracker {
    callback: Option<ProgressCallback>,
    state: Mutex<StagedState>,
}

impl StagedProgressTracker {
    pub fn new(callback: Option<ProgressCallback>) -> Arc<Self> {
        Arc::new(Self {
            callback,
            state: Mutex::new(StagedState {
                stages: Vec::new(),
                total_progress: 0,
            }),
        })
    }

    /// Add a stage covering [start, end] of global progress. With
    /// `total_items` the returned sub-tracker drives the stage; without,
    /// use [`set_stage_progress`](Self::set_stage_progress).
    pub fn add_stage(
        self: &Arc<Self>,
        name: &str,
        start: u8,
        end: u8,
        total_items: Option<usize>,
    ) -> Option<Arc<ProgressTracker>> {
        self.state.lock().stages.push(StageMeta {
            name: name.to_string(),
            start,
            end,
        });

        let total_items = total_items?;
        let weak: Weak<Self> = Arc::downgrade(self);
        let range = end.saturating_sub(start);
        let tracker = ProgressTracker::new(
            total_items,
            Some(Arc::new(move |stage_progress: u8| {
                if let Some(staged) = weak.upgrade() {
                    let global = start + (range as usize * stage_progress as usize / 100) as u8;
                    staged.report(global);
                }
            })),
        );
        Some(Arc::new(tracker))
    }

    /// Set the in-stage progress for a stage without a sub-tracker.
    pub fn set_stage_progress(&self, name: &str, stage_progress: u8) {
        let global = {
            let st = self.state.lock();
            let Some(stage) = st.stages.iter().find(|s| s.name == name) else {
                debug!(stage = name, "unknown progress stage");
                return;
            };
            let range = stage.end.saturating_sub(stage.start);
            stage.start + (range as usize * stage_progress.min(100) as usize / 100) as u8
        };
        self.report(global);
    }

    pub fn progress(&self) -> u8 {
        self.state.lock().total_progress
    }

    fn report(&self, global: u8) {
        {
            let mut st = self.state.lock();
            if global <= st.total_progress {
                return;
            }
            st.total_progress = global;
        }
        if let Some(callback) = &self.callback {
            callback(global);
        }
    }
}

/// The standard back-test stage layout.
pub fn backtest_stages(
    total_klines: usize,
    callback: Option<ProgressCallback>,
) -> (Arc<StagedProgressTracker>, Arc<ProgressTracker>) {
    let staged = StagedProgressTracker::new(callback);
    staged.add_stage("data_load", 0, 20, None);
    staged.add_stage("init", 20, 25, None);
    let execute = staged
        .add_stage("execute", 25, 95, Some(total_klines))
        .expect("execute stage carries items");
    staged.add_stage("finalize", 95, 100, None);
    (staged, execute)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback() -> (ProgressCallback, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        (
            Arc::new(move |p| seen2.lock().push(p)),
            seen,
        )
    }

    #[test]
    fn tight_loop_is_throttled_but_completes() {
        let (callback, seen) = counting_callback();
        let tracker =
            ProgressTracker::with_limits(100, Duration::from_millis(500), 100, Some(callback));

        for _ in 0..100 {
            tracker.update(1);
        }

        let seen = seen.lock();
        // Well under the max_updates+1 budget: the time gate swallows the
        // intermediate ticks of a tight loop.
        assert!(seen.len() <= 101, "saw {} notifications", seen.len());
        assert_eq!(*seen.last().unwrap(), 100, "final 100 always delivered");
        // Monotone non-decreasing.
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn completion_fires_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let tracker = ProgressTracker::with_limits(
            10,
            Duration::from_secs(3_600), // time gate never opens
            100,
            Some(Arc::new(move |p| {
                if p == 100 {
                    fired2.fetch_add(1, Ordering::Relaxed);
                }
            })),
        );

        for _ in 0..15 {
            tracker.update(1);
        }
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn set_progress_is_monotonic() {
        let (callback, seen) = counting_callback();
        let tracker = ProgressTracker::new(100, Some(callback));

        tracker.set_progress(30);
        tracker.set_progress(20); // ignored
        tracker.set_progress(60);
        assert_eq!(*seen.lock(), vec![30, 60]);
        assert_eq!(tracker.progress(), 60);
    }

    #[test]
    fn staged_maps_to_global_ranges() {
        let (callback, seen) = counting_callback();
        let staged = StagedProgressTracker::new(Some(callback));
        staged.add_stage("data_load", 0, 20, None);
        staged.add_stage("execute", 20, 95, None);

        staged.set_stage_progress("data_load", 50); // -> 10
        staged.set_stage_progress("data_load", 100); // -> 20
        staged.set_stage_progress("execute", 40); // -> 50

        assert_eq!(*seen.lock(), vec![10, 20, 50]);
        assert_eq!(staged.progress(), 50);
    }

    #[test]
    fn staged_never_regresses() {
        let (callback, seen) = counting_callback();
        let staged = StagedProgressTracker::new(Some(callback));
        staged.add_stage("a", 0, 50, None);
        staged.add_stage("b", 50, 100, None);

        staged.set_stage_progress("b", 20); // -> 60
        staged.set_stage_progress("a", 100); // -> 50: behind, dropped
        assert_eq!(*seen.lock(), vec![60]);
    }

    #[test]
    fn backtest_stage_layout_reaches_95_on_execute_completion() {
        let (callback, seen) = counting_callback();
        let (staged, execute) = backtest_stages(10, Some(callback));

        staged.set_stage_progress("data_load", 100);
        staged.set_stage_progress("init", 100);
        for _ in 0..10 {
            execute.update(1);
        }
        staged.set_stage_progress("finalize", 100);

        assert_eq!(staged.progress(), 100);
        let seen = seen.lock();
        assert_eq!(*seen.last().unwrap(), 100);
        assert!(seen.contains(&95), "execute completion maps to 95");
    }
}
