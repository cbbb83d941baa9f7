//! Rolling response statistics and the delay controller.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

use crate::config::ThrottleConfig;

#[derive(Debug, Clone, Copy)]
struct Sample {
    overloaded: bool,
    response: Duration,
}

/// Fixed-size window of recent upstream outcomes.
#[derive(Debug)]
pub struct RollingStats {
    window: VecDeque<Sample>,
    capacity: usize,
}

impl RollingStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Record one completed upstream call.
    pub fn record(&mut self, overloaded: bool, response: Duration) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(Sample {
            overloaded,
            response,
        });
    }

    /// Mean response time across the window.
    pub fn mean_response(&self) -> Option<Duration> {
        if self.window.is_empty() {
            return None;
        }
        let total: Duration = self.window.iter().map(|s| s.response).sum();
        Some(total / self.window.len() as u32)
    }

    /// Overload failures currently in the window.
    pub fn failures(&self) -> usize {
        self.window.iter().filter(|s| s.overloaded).count()
    }

    /// Share of non-overload outcomes in the window.
    pub fn success_rate(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let ok = self.window.len() - self.failures();
        Some(ok as f64 / self.window.len() as f64)
    }
}

/// Inputs to one delay adjustment.
#[derive(Debug, Clone, Copy)]
pub struct AdaptSignal {
    /// The call that just completed failed with an overload error
    pub overload_failure: bool,
    /// Mean response time over the rolling window
    pub mean_response: Option<Duration>,
    /// Overload failures in the rolling window
    pub window_failures: usize,
    /// Arrivals outpaced dispatches since the last adjustment
    pub queue_pressure: bool,
}

/// Compute the next inter-dispatch delay.
///
/// Overload grows the delay multiplicatively. A comfortably fast window with
/// no failures shrinks it. Queue pressure nudges it up. The result is always
/// clamped to `[min_delay, max_delay]`.
pub fn adapt_delay(current: Duration, signal: AdaptSignal, config: &ThrottleConfig) -> Duration {
    let mut next = current.as_secs_f64();

    if signal.overload_failure {
        next = (next * config.increase_factor).max(config.base_delay.as_secs_f64());
    } else if signal.window_failures == 0 {
        let comfortable = config.target_response_time.as_secs_f64() * config.comfort_ratio;
        if signal
            .mean_response
            .is_some_and(|mean| mean.as_secs_f64() < comfortable)
        {
            next *= config.decrease_factor;
        }
    }

    if signal.queue_pressure {
        next *= config.queue_pressure_factor;
    }

    let next = if next.is_finite() { next.max(0.0) } else { 0.0 };
    Duration::from_secs_f64(next.min(config.max_delay.as_secs_f64()))
        .clamp(config.min_delay, config.max_delay)
}

/// Point-in-time view of the throttler.
#[derive(Debug, Clone, Serialize)]
pub struct ThrottleStats {
    pub current_delay_ms: u64,
    pub queue_len: usize,
    pub in_flight: usize,
    pub total_submitted: u64,
    pub total_dispatched: u64,
    pub total_merged: u64,
    pub total_rejected: u64,
    pub total_timeouts: u64,
    pub consecutive_failures: u32,
    pub cooling_down: bool,
    pub cooldown_remaining_ms: Option<u64>,
    pub avg_response_ms: Option<u64>,
    pub success_rate: Option<f64>,
}
