//! Hysteretic selection between depth-only, image-only and fused scanning.
//!
//! [`StrategyController`] turns per-pass source confidences into a scanning
//! strategy. A better candidate only wins when it beats the current strategy
//! by the configured relative margin, does not continue an A/B ping-pong
//! pattern, and the recent transition rate is below the limit. When no
//! strategy clears its validity threshold the controller enters
//! [`ScanningStrategy::NeedsRecalibration`] immediately.
//!
//! Accepted transitions are kept in a bounded ring (used only by the guards)
//! and pushed to subscribers in acceptance order.
//!
//! # Example
//!
//! ```
//! use scan_fusion::strategy::{QualityUpdate, ScanningStrategy, StrategyConfig, StrategyController};
//!
//! let controller = StrategyController::new(StrategyConfig::default());
//! let events = controller.subscribe();
//!
//! let decision = controller.update(QualityUpdate::new(0.4, 0.9, 0.0));
//! assert_eq!(decision.strategy(), ScanningStrategy::ImageOnly);
//! assert_eq!(events.try_recv().unwrap().to, ScanningStrategy::ImageOnly);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FusionError, FusionResult};

/// How the next pass should use the two sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanningStrategy {
    DepthOnly,
    ImageOnly,
    Fused,
    NeedsRecalibration,
}

impl ScanningStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DepthOnly => "depth_only",
            Self::ImageOnly => "image_only",
            Self::Fused => "fused",
            Self::NeedsRecalibration => "needs_recalibration",
        }
    }

    /// Strategies that produce data.
    pub const OPERATIONAL: [ScanningStrategy; 3] = [Self::DepthOnly, Self::ImageOnly, Self::Fused];
}

impl std::fmt::Display for ScanningStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Achievable quality of each operational strategy, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyScores {
    pub depth_only: f64,
    pub image_only: f64,
    pub fused: f64,
}

impl StrategyScores {
    pub fn get(&self, strategy: ScanningStrategy) -> f64 {
        match strategy {
            ScanningStrategy::DepthOnly => self.depth_only,
            ScanningStrategy::ImageOnly => self.image_only,
            ScanningStrategy::Fused => self.fused,
            ScanningStrategy::NeedsRecalibration => 0.0,
        }
    }

    /// Highest score across operational strategies.
    pub fn best(&self) -> f64 {
        self.depth_only.max(self.image_only).max(self.fused)
    }
}

/// Per-pass source confidences fed to the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityUpdate {
    /// Scalar confidence of the depth source.
    pub depth: f64,
    /// Scalar confidence of the image-derived source.
    pub image: f64,
    /// Confidence in the image-to-depth registration.
    pub alignment: f64,
}

impl QualityUpdate {
    pub fn new(depth: f64, image: f64, alignment: f64) -> Self {
        let clamp = |v: f64| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
        Self {
            depth: clamp(depth),
            image: clamp(image),
            alignment: clamp(alignment),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Relative improvement a candidate needs over the current strategy.
    pub improvement_margin: f64,
    /// Number of recorded transitions inspected for A/B alternation.
    pub oscillation_window: usize,
    pub rate_limit_window_secs: f64,
    /// Transitions allowed inside the rate-limit window.
    pub rate_limit_max_transitions: usize,
    pub history_capacity: usize,
    pub trend_capacity: usize,
    pub min_depth_quality: f64,
    pub min_image_quality: f64,
    pub min_fused_quality: f64,
    /// Weight of the weaker source in the fused score.
    pub fused_secondary_weight: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            improvement_margin: 0.2,
            oscillation_window: 4,
            rate_limit_window_secs: 5.0,
            rate_limit_max_transitions: 3,
            history_capacity: 10,
            trend_capacity: 32,
            min_depth_quality: 0.3,
            min_image_quality: 0.3,
            min_fused_quality: 0.35,
            fused_secondary_weight: 0.5,
        }
    }
}

impl StrategyConfig {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs_f64(self.rate_limit_window_secs.max(0.0))
    }

    pub fn min_quality(&self, strategy: ScanningStrategy) -> f64 {
        match strategy {
            ScanningStrategy::DepthOnly => self.min_depth_quality,
            ScanningStrategy::ImageOnly => self.min_image_quality,
            ScanningStrategy::Fused => self.min_fused_quality,
            ScanningStrategy::NeedsRecalibration => 0.0,
        }
    }

    /// Score each strategy from one update.
    pub fn scores(&self, update: &QualityUpdate) -> StrategyScores {
        let strong = update.depth.max(update.image);
        let weak = update.depth.min(update.image);
        StrategyScores {
            depth_only: update.depth,
            image_only: update.image,
            fused: (update.alignment * (strong + self.fused_secondary_weight * weak))
                .clamp(0.0, 1.0),
        }
    }

    pub fn validate(&self) -> FusionResult<()> {
        if !(self.improvement_margin >= 0.0) {
            return Err(FusionError::invalid_config(
                "strategy.improvement_margin",
                "must be non-negative",
            ));
        }
        if self.oscillation_window < 2 {
            return Err(FusionError::invalid_config(
                "strategy.oscillation_window",
                "must be at least 2",
            ));
        }
        if self.history_capacity < self.oscillation_window {
            return Err(FusionError::invalid_config(
                "strategy.history_capacity",
                format!(
                    "{} cannot hold an oscillation window of {}",
                    self.history_capacity, self.oscillation_window
                ),
            ));
        }
        if self.history_capacity < self.rate_limit_max_transitions {
            return Err(FusionError::invalid_config(
                "strategy.history_capacity",
                "must hold at least rate_limit_max_transitions events",
            ));
        }
        if !(self.rate_limit_window_secs > 0.0) || self.rate_limit_max_transitions == 0 {
            return Err(FusionError::invalid_config(
                "strategy.rate_limit_window_secs",
                "rate limit window and count must be positive",
            ));
        }
        for (field, v) in [
            ("strategy.min_depth_quality", self.min_depth_quality),
            ("strategy.min_image_quality", self.min_image_quality),
            ("strategy.min_fused_quality", self.min_fused_quality),
            ("strategy.fused_secondary_weight", self.fused_secondary_weight),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(FusionError::invalid_config(field, "must lie in [0, 1]"));
            }
        }
        Ok(())
    }
}

/// An accepted strategy change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionEvent {
    pub from: ScanningStrategy,
    pub to: ScanningStrategy,
    #[serde(skip)]
    pub at: Instant,
    /// Milliseconds since the controller started (or was last reset).
    pub session_ms: f64,
    pub scores: StrategyScores,
    pub update: QualityUpdate,
}

/// Why a better-scoring candidate was not adopted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    InsufficientMargin { current: f64, candidate: f64 },
    Oscillation,
    RateLimited { recent: usize },
}

/// Outcome of one controller update.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum StrategyDecision {
    /// The current strategy is still the best valid one.
    Hold { strategy: ScanningStrategy },
    Switched { event: TransitionEvent },
    /// A better candidate exists but a guard held the current strategy.
    Rejected {
        strategy: ScanningStrategy,
        candidate: ScanningStrategy,
        reason: RejectReason,
    },
    /// No strategy is valid. `event` is set when this update entered the state.
    NeedsRecalibration {
        scores: StrategyScores,
        event: Option<TransitionEvent>,
    },
}

impl StrategyDecision {
    /// Strategy in effect after the update.
    pub fn strategy(&self) -> ScanningStrategy {
        match self {
            Self::Hold { strategy } | Self::Rejected { strategy, .. } => *strategy,
            Self::Switched { event } => event.to,
            Self::NeedsRecalibration { .. } => ScanningStrategy::NeedsRecalibration,
        }
    }

    pub fn transition(&self) -> Option<&TransitionEvent> {
        match self {
            Self::Switched { event } => Some(event),
            Self::NeedsRecalibration { event, .. } => event.as_ref(),
            _ => None,
        }
    }

    /// `Err(RecalibrationRequired)` when no strategy is usable.
    pub fn into_result(self) -> FusionResult<ScanningStrategy> {
        match self {
            Self::NeedsRecalibration { scores, .. } => {
                Err(FusionError::RecalibrationRequired { scores })
            }
            other => Ok(other.strategy()),
        }
    }
}

/// Observer invoked for each accepted transition.
///
/// Runs while the controller lock is held: it must not call back into the
/// controller.
pub type TransitionCallback = Box<dyn Fn(&TransitionEvent) + Send + Sync>;

struct ControllerState {
    current: ScanningStrategy,
    started: Instant,
    history: VecDeque<TransitionEvent>,
    trend: VecDeque<f64>,
    last_scores: Option<StrategyScores>,
    subscribers: Vec<Sender<TransitionEvent>>,
    callbacks: Vec<Arc<TransitionCallback>>,
}

impl ControllerState {
    fn new(config: &StrategyConfig) -> Self {
        Self {
            current: ScanningStrategy::DepthOnly,
            started: Instant::now(),
            history: VecDeque::with_capacity(config.history_capacity),
            trend: VecDeque::with_capacity(config.trend_capacity),
            last_scores: None,
            subscribers: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    fn record(&mut self, event: TransitionEvent, capacity: usize) {
        while self.history.len() >= capacity.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(event.clone());
        self.current = event.to;
        for callback in &self.callbacks {
            callback(&event);
        }
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// True when `from -> to` would extend an alternation filling the window.
    fn is_oscillation(&self, from: ScanningStrategy, to: ScanningStrategy, window: usize) -> bool {
        if self.history.len() < window {
            return false;
        }
        let recent: Vec<&TransitionEvent> = self.history.iter().rev().take(window).collect();
        let last = recent[0];
        if last.to != from || last.from != to {
            return false;
        }
        recent
            .windows(2)
            .all(|w| w[0].from == w[1].to && w[0].to == w[1].from)
    }

    fn recent_transitions(&self, now: Instant, window: Duration) -> usize {
        self.history
            .iter()
            .filter(|e| now.saturating_duration_since(e.at) < window)
            .count()
    }
}

/// Strategy state machine shared by a scanning session.
///
/// All updates are serialized through an internal mutex, so a controller
/// behind an `Arc` can be fed from several threads.
pub struct StrategyController {
    config: StrategyConfig,
    state: Mutex<ControllerState>,
}

impl StrategyController {
    pub fn new(config: StrategyConfig) -> Self {
        let state = Mutex::new(ControllerState::new(&config));
        Self { config, state }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn current(&self) -> ScanningStrategy {
        self.state.lock().current
    }

    /// Recorded transitions, oldest first.
    pub fn history(&self) -> Vec<TransitionEvent> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Scores computed by the latest update.
    pub fn last_scores(&self) -> Option<StrategyScores> {
        self.state.lock().last_scores
    }

    /// Least-squares slope of the best score per update, `None` with fewer than two updates.
    pub fn score_trend(&self) -> Option<f64> {
        let state = self.state.lock();
        let n = state.trend.len();
        if n < 2 {
            return None;
        }
        let mean_x = (n - 1) as f64 / 2.0;
        let mean_y = state.trend.iter().sum::<f64>() / n as f64;
        let (mut num, mut den) = (0.0, 0.0);
        for (i, y) in state.trend.iter().enumerate() {
            let dx = i as f64 - mean_x;
            num += dx * (y - mean_y);
            den += dx * dx;
        }
        Some(num / den)
    }

    /// Receive every accepted transition from now on.
    pub fn subscribe(&self) -> Receiver<TransitionEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.state.lock().subscribers.push(tx);
        rx
    }

    /// Register an observer called synchronously for each accepted transition.
    pub fn on_transition(&self, callback: TransitionCallback) {
        self.state.lock().callbacks.push(Arc::new(callback));
    }

    /// Return to `DepthOnly` and forget history and trend. Observers stay registered.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.current = ScanningStrategy::DepthOnly;
        state.started = Instant::now();
        state.history.clear();
        state.trend.clear();
        state.last_scores = None;
        debug!("Strategy controller reset");
    }

    pub fn update(&self, update: QualityUpdate) -> StrategyDecision {
        self.update_at(update, Instant::now())
    }

    /// Feed one update observed at `now`.
    pub fn update_at(&self, update: QualityUpdate, now: Instant) -> StrategyDecision {
        let cfg = &self.config;
        let scores = cfg.scores(&update);
        let mut state = self.state.lock();

        state.last_scores = Some(scores);
        while state.trend.len() >= cfg.trend_capacity.max(1) {
            state.trend.pop_front();
        }
        state.trend.push_back(scores.best());

        let current = state.current;
        let make_event = |state: &ControllerState, to: ScanningStrategy| TransitionEvent {
            from: current,
            to,
            at: now,
            session_ms: now.saturating_duration_since(state.started).as_secs_f64() * 1000.0,
            scores,
            update,
        };

        // Best valid candidate; earlier strategies win ties.
        let candidate = ScanningStrategy::OPERATIONAL
            .into_iter()
            .filter(|&s| scores.get(s) >= cfg.min_quality(s))
            .fold(None, |best: Option<ScanningStrategy>, s| match best {
                Some(b) if scores.get(b) >= scores.get(s) => Some(b),
                _ => Some(s),
            });

        let Some(candidate) = candidate else {
            let event = if current == ScanningStrategy::NeedsRecalibration {
                None
            } else {
                let event = make_event(&*state, ScanningStrategy::NeedsRecalibration);
                warn!(
                    from = %current,
                    depth = scores.depth_only,
                    image = scores.image_only,
                    fused = scores.fused,
                    "No scanning strategy is valid, recalibration required"
                );
                state.record(event.clone(), cfg.history_capacity);
                Some(event)
            };
            return StrategyDecision::NeedsRecalibration { scores, event };
        };

        if candidate == current {
            return StrategyDecision::Hold { strategy: current };
        }

        if current != ScanningStrategy::NeedsRecalibration {
            // A valid current strategy that is at least as good as the candidate holds.
            let current_score = scores.get(current);
            let current_valid = current_score >= cfg.min_quality(current);
            let candidate_score = scores.get(candidate);
            if current_valid && candidate_score <= current_score {
                return StrategyDecision::Hold { strategy: current };
            }
            if candidate_score < current_score * (1.0 + cfg.improvement_margin) {
                debug!(%current, %candidate, current_score, candidate_score, "Margin not met");
                return StrategyDecision::Rejected {
                    strategy: current,
                    candidate,
                    reason: RejectReason::InsufficientMargin {
                        current: current_score,
                        candidate: candidate_score,
                    },
                };
            }
            if state.is_oscillation(current, candidate, cfg.oscillation_window) {
                debug!(%current, %candidate, "Oscillation detected");
                return StrategyDecision::Rejected {
                    strategy: current,
                    candidate,
                    reason: RejectReason::Oscillation,
                };
            }
            let recent = state.recent_transitions(now, cfg.rate_limit_window());
            if recent >= cfg.rate_limit_max_transitions {
                debug!(%current, %candidate, recent, "Transition rate limited");
                return StrategyDecision::Rejected {
                    strategy: current,
                    candidate,
                    reason: RejectReason::RateLimited { recent },
                };
            }
        }

        let event = make_event(&*state, candidate);
        info!(from = %current, to = %candidate, score = scores.get(candidate), "Strategy transition");
        state.record(event.clone(), cfg.history_capacity);
        StrategyDecision::Switched { event }
    }
}

impl std::fmt::Debug for StrategyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StrategyController")
            .field("current", &state.current)
            .field("history", &state.history.len())
            .field("subscribers", &state.subscribers.len())
            .finish_non_exhaustive()
    }
}
