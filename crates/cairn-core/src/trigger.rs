//! Directional trigger policies and the per-beacon watcher task.
//!
//! A [`TriggerPolicy`] is a stateless predicate over committed-zone
//! transitions. Each registered beacon gets one [`BeaconWatcher`] task that
//! owns the beacon's [`ZoneSmoother`], arms the visibility timeout, and
//! pushes a [`TagEvent::TriggerFired`] onto the monitor's event channel
//! whenever its policy matches a transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info};

use crate::beacon::{BeaconId, Detection, Zone};
use crate::monitor::TagEvent;
use crate::smoothing::{ZoneChange, ZoneSmoother};

/// Which committed-zone transitions produce a caller-visible trigger event.
///
/// Policies are pure predicates over a `(from, to)` transition pair, where
/// `None` stands for "not visible".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerPolicy {
    /// Fires when the beacon moves into `Immediate` or `Near` from `Far` or
    /// from out of sight.
    #[default]
    Enter,
    /// Fires when the beacon moves to `Far` or out of sight from `Immediate`
    /// or `Near`.
    Exit,
    /// Fires on either the [`Enter`](Self::Enter) or [`Exit`](Self::Exit)
    /// condition.
    EnterOrExit,
    /// Fires when the beacon tightens to `Immediate` from anywhere else.
    Approach,
    /// Fires when the beacon leaves `Near` or `Immediate` for `Far` or out
    /// of sight.
    Leave,
    /// Fires on either the [`Approach`](Self::Approach) or
    /// [`Leave`](Self::Leave) condition.
    ApproachOrLeave,
}

impl TriggerPolicy {
    /// Evaluate the policy against one committed-zone transition.
    #[must_use]
    pub const fn fires(self, from: Option<Zone>, to: Option<Zone>) -> bool {
        match self {
            Self::Enter => Self::enters(from, to),
            Self::Exit => Self::exits(from, to),
            Self::EnterOrExit => Self::enters(from, to) || Self::exits(from, to),
            Self::Approach => Self::approaches(from, to),
            Self::Leave => Self::leaves(from, to),
            Self::ApproachOrLeave => Self::approaches(from, to) || Self::leaves(from, to),
        }
    }

    const fn enters(from: Option<Zone>, to: Option<Zone>) -> bool {
        matches!(to, Some(Zone::Immediate | Zone::Near)) && matches!(from, None | Some(Zone::Far))
    }

    const fn exits(from: Option<Zone>, to: Option<Zone>) -> bool {
        matches!(to, None | Some(Zone::Far)) && matches!(from, Some(Zone::Immediate | Zone::Near))
    }

    const fn approaches(from: Option<Zone>, to: Option<Zone>) -> bool {
        matches!(to, Some(Zone::Immediate)) && !matches!(from, Some(Zone::Immediate))
    }

    const fn leaves(from: Option<Zone>, to: Option<Zone>) -> bool {
        matches!(to, None | Some(Zone::Far)) && matches!(from, Some(Zone::Near | Zone::Immediate))
    }
}

/// Sending half of a watcher: forwards detections and severs event delivery.
///
/// Dropping the handle closes the sample channel, which ends the watcher
/// task.
#[derive(Debug)]
pub(crate) struct WatcherHandle {
    samples: mpsc::UnboundedSender<Detection>,
    active: Arc<AtomicBool>,
}

impl WatcherHandle {
    /// Forward one detection to the watcher. Dropped silently if the task
    /// has already ended.
    pub(crate) fn observe(&self, detection: Detection) {
        let _ = self.samples.send(detection);
    }

    /// Stop event delivery without touching the smoothing state. Safe to
    /// call any number of times, from any task.
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Task that smooths one beacon's samples and applies its trigger policy.
#[derive(Debug)]
pub(crate) struct BeaconWatcher {
    beacon: BeaconId,
    smoother: ZoneSmoother,
    policy: TriggerPolicy,
    visibility_timeout: Duration,
    active: Arc<AtomicBool>,
    samples: mpsc::UnboundedReceiver<Detection>,
    events: mpsc::UnboundedSender<TagEvent>,
}

impl BeaconWatcher {
    pub(crate) fn new(
        beacon: BeaconId,
        policy: TriggerPolicy,
        window_span: Duration,
        visibility_timeout: Duration,
        events: mpsc::UnboundedSender<TagEvent>,
    ) -> (Self, WatcherHandle) {
        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        let watcher = Self {
            beacon,
            smoother: ZoneSmoother::new(window_span),
            policy,
            visibility_timeout,
            active: Arc::clone(&active),
            samples: samples_rx,
            events,
        };
        let handle = WatcherHandle {
            samples: samples_tx,
            active,
        };
        (watcher, handle)
    }

    /// Consume samples until the handle is dropped, marking the beacon lost
    /// whenever the visibility timeout elapses between samples.
    pub(crate) async fn run(mut self) {
        let mut visible_until: Option<Instant> = None;
        loop {
            let lost_at = visible_until.unwrap_or_else(Instant::now);
            tokio::select! {
                sample = self.samples.recv() => {
                    let Some(detection) = sample else { break };
                    visible_until = Some(detection.at + self.visibility_timeout);
                    if let Some(change) = self.smoother.observe(detection.zone(), detection.at) {
                        self.emit(change);
                    }
                }
                () = time::sleep_until(lost_at), if visible_until.is_some() => {
                    visible_until = None;
                    if let Some(change) = self.smoother.mark_lost() {
                        self.emit(change);
                    }
                }
            }
        }
    }

    fn emit(&self, change: ZoneChange) {
        debug!(
            beacon = %self.beacon,
            from = ?change.from,
            to = ?change.to,
            "committed zone changed"
        );
        if !self.policy.fires(change.from, change.to) {
            return;
        }
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        info!(beacon = %self.beacon, policy = ?self.policy, "trigger fired");
        let _ = self.events.send(TagEvent::TriggerFired {
            beacon: self.beacon,
            at: Utc::now(),
        });
    }
}
