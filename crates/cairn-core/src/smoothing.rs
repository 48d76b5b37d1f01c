//! Sliding-window hysteresis over raw zone samples.
//!
//! Raw per-advertisement zones flicker: a single noisy RSSI reading can jump
//! a device between Near and Far. [`ZoneSmoother`] keeps a short window of
//! timestamped samples and only moves its committed zone when the whole
//! window has moved past it, adopting the most conservative extreme of the
//! window on each side. The committed zone is what callers see; `None` means
//! the beacon is not currently visible.
//!
//! The smoother is pure and synchronous: timestamps come in with the samples
//! and the visibility timeout is armed by the owning watcher task, which
//! calls [`ZoneSmoother::mark_lost`] when it fires.

use std::collections::VecDeque;

use tokio::time::{Duration, Instant};

use crate::beacon::Zone;

/// A committed-zone transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneChange {
    /// Zone before the transition (`None` on the initial commit and after a
    /// visibility loss).
    pub from: Option<Zone>,
    /// Zone after the transition (`None` when visibility was lost).
    pub to: Option<Zone>,
}

/// Per-beacon hysteresis filter turning raw zone samples into a stable
/// committed zone.
#[derive(Debug)]
pub struct ZoneSmoother {
    window: VecDeque<(Zone, Instant)>,
    committed: Option<Zone>,
    window_span: Duration,
}

impl ZoneSmoother {
    /// Create a smoother whose window keeps samples for `window_span`
    /// relative to the newest sample.
    #[must_use]
    pub const fn new(window_span: Duration) -> Self {
        Self {
            window: VecDeque::new(),
            committed: None,
            window_span,
        }
    }

    /// The current committed zone, if any.
    #[must_use]
    pub const fn committed(&self) -> Option<Zone> {
        self.committed
    }

    /// Feed one sample and evaluate the window.
    ///
    /// Entries older than the window span relative to `at` are pruned from
    /// the front first. The commitment rule, with `nearest`/`farthest` the
    /// window extremes under `Immediate < Near < Far`:
    ///
    /// - no commitment yet: commit `farthest`;
    /// - committed strictly farther than both extremes: commit `farthest`;
    /// - committed strictly nearer than both extremes: commit `nearest`;
    /// - window straddles the commitment: hold (the hysteresis band).
    ///
    /// Returns the transition if the committed zone changed.
    pub fn observe(&mut self, zone: Zone, at: Instant) -> Option<ZoneChange> {
        self.window.push_back((zone, at));
        if let Some(cutoff) = at.checked_sub(self.window_span) {
            while let Some(&(_, ts)) = self.window.front() {
                if ts < cutoff {
                    self.window.pop_front();
                } else {
                    break;
                }
            }
        }

        let mut nearest = zone;
        let mut farthest = zone;
        for &(z, _) in &self.window {
            if z < nearest {
                nearest = z;
            }
            if z > farthest {
                farthest = z;
            }
        }

        let target = match self.committed {
            None => Some(farthest),
            Some(committed) if committed > farthest && committed > nearest => Some(farthest),
            Some(committed) if committed < farthest && committed < nearest => Some(nearest),
            Some(_) => None,
        };
        target.map(|to| self.commit(to))
    }

    /// Drop the commitment after a visibility timeout.
    ///
    /// Returns the transition to `None` if a zone was committed. The window
    /// is left intact; stale entries fall off on the next observe.
    pub fn mark_lost(&mut self) -> Option<ZoneChange> {
        self.committed.take().map(|from| ZoneChange {
            from: Some(from),
            to: None,
        })
    }

    fn commit(&mut self, to: Zone) -> ZoneChange {
        let from = self.committed.replace(to);
        ZoneChange {
            from,
            to: Some(to),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPAN: Duration = Duration::from_millis(2000);

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn test_all_near_window_commits_near_from_unknown() {
        let base = Instant::now();
        let mut smoother = ZoneSmoother::new(SPAN);

        let first = smoother.observe(Zone::Near, at(base, 0));
        assert_eq!(
            first,
            Some(ZoneChange {
                from: None,
                to: Some(Zone::Near)
            })
        );
        assert_eq!(smoother.observe(Zone::Near, at(base, 500)), None);
        assert_eq!(smoother.observe(Zone::Near, at(base, 1000)), None);
        assert_eq!(smoother.committed(), Some(Zone::Near));
    }

    #[test]
    fn test_initial_commit_adopts_farthest_of_mixed_window() {
        let base = Instant::now();
        let mut smoother = ZoneSmoother::new(SPAN);

        // Both samples land before anything is committed; the second one
        // widens the window to [Immediate, Far] and Far wins.
        smoother.observe(Zone::Immediate, at(base, 0));
        let change = smoother.observe(Zone::Far, at(base, 100)).unwrap();
        assert_eq!(change.to, Some(Zone::Far));
    }

    #[test]
    fn test_single_immediate_sample_does_not_flip_near() {
        let base = Instant::now();
        let mut smoother = ZoneSmoother::new(SPAN);

        smoother.observe(Zone::Near, at(base, 0));
        assert_eq!(smoother.committed(), Some(Zone::Near));

        // Near samples are still fresh, so the window straddles Near.
        assert_eq!(smoother.observe(Zone::Immediate, at(base, 300)), None);
        assert_eq!(smoother.committed(), Some(Zone::Near));
    }

    #[test]
    fn test_clean_window_promotes_far_to_immediate_once() {
        let base = Instant::now();
        let mut smoother = ZoneSmoother::new(SPAN);

        smoother.observe(Zone::Far, at(base, 0));
        assert_eq!(smoother.committed(), Some(Zone::Far));

        // By +2500 ms the Far sample has aged out; the window is all
        // Immediate and the commitment moves exactly once.
        let change = smoother.observe(Zone::Immediate, at(base, 2500)).unwrap();
        assert_eq!(change.from, Some(Zone::Far));
        assert_eq!(change.to, Some(Zone::Immediate));
        assert_eq!(smoother.observe(Zone::Immediate, at(base, 2600)), None);
    }

    #[test]
    fn test_regression_adopts_nearest_of_window() {
        let base = Instant::now();
        let mut smoother = ZoneSmoother::new(SPAN);

        smoother.observe(Zone::Immediate, at(base, 0));
        assert_eq!(smoother.committed(), Some(Zone::Immediate));

        // Everything in the window is farther than Immediate; the rule
        // adopts the nearest extreme, not the farthest.
        smoother.observe(Zone::Near, at(base, 2500));
        let change = smoother.observe(Zone::Far, at(base, 2600));
        assert_eq!(smoother.committed(), Some(Zone::Near));
        assert_eq!(
            change,
            Some(ZoneChange {
                from: Some(Zone::Immediate),
                to: Some(Zone::Near)
            })
        );
    }

    #[test]
    fn test_approach_adopts_farthest_of_window() {
        let base = Instant::now();
        let mut smoother = ZoneSmoother::new(SPAN);

        smoother.observe(Zone::Far, at(base, 0));

        // Window [Immediate, Near] is entirely nearer than Far; the rule
        // adopts the farthest extreme (Near), the conservative improvement.
        smoother.observe(Zone::Immediate, at(base, 2500));
        let change = smoother.observe(Zone::Near, at(base, 2600));
        assert_eq!(smoother.committed(), Some(Zone::Near));
        assert_eq!(
            change,
            Some(ZoneChange {
                from: Some(Zone::Far),
                to: Some(Zone::Near)
            })
        );
    }

    #[test]
    fn test_sample_exactly_at_window_edge_is_kept() {
        let base = Instant::now();
        let mut smoother = ZoneSmoother::new(SPAN);

        smoother.observe(Zone::Near, at(base, 0));
        // The Near entry sits exactly at the cutoff and must still count,
        // so the window straddles Near and nothing changes.
        assert_eq!(smoother.observe(Zone::Immediate, at(base, 2000)), None);
        assert_eq!(smoother.committed(), Some(Zone::Near));
    }

    #[test]
    fn test_mark_lost_fires_once() {
        let base = Instant::now();
        let mut smoother = ZoneSmoother::new(SPAN);

        smoother.observe(Zone::Near, at(base, 0));
        assert_eq!(
            smoother.mark_lost(),
            Some(ZoneChange {
                from: Some(Zone::Near),
                to: None
            })
        );
        assert_eq!(smoother.mark_lost(), None);
        assert_eq!(smoother.committed(), None);
    }

    #[test]
    fn test_reappearance_after_loss_is_an_initial_commit() {
        let base = Instant::now();
        let mut smoother = ZoneSmoother::new(SPAN);

        smoother.observe(Zone::Near, at(base, 0));
        smoother.mark_lost();

        // The stale Near entry ages out with the new sample; the commit
        // starts from scratch rather than resuming the old baseline.
        let change = smoother.observe(Zone::Far, at(base, 30_000)).unwrap();
        assert_eq!(change.from, None);
        assert_eq!(change.to, Some(Zone::Far));
    }
}
