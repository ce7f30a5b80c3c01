//! Constant-velocity smoothing of court positions.
//!
//! State is `[x, y, vx, vy]` with a diagonal covariance: each axis keeps a
//! position and a velocity variance and the two axes never interact. One
//! predict/correct cycle runs per delivered measurement.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{CourtPoint, FilterConfig, FloatType};

/// Bounds on the step between measurements, in seconds.
pub const MIN_DT: FloatType = 0.01;
pub const MAX_DT: FloatType = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterState {
    pub x: FloatType,
    pub y: FloatType,
    pub vx: FloatType,
    pub vy: FloatType,
    /// Variance of `x`.
    pub p00: FloatType,
    /// Variance of `y`.
    pub p11: FloatType,
    /// Variance of `vx`.
    pub p22: FloatType,
    /// Variance of `vy`.
    pub p33: FloatType,
    /// Timestamp of the last measurement, seconds.
    pub last_update_time: FloatType,
}

impl FilterState {
    fn initial(measured: CourtPoint, timestamp: FloatType, p0: FloatType) -> Self {
        Self {
            x: measured.x,
            y: measured.y,
            vx: 0.0,
            vy: 0.0,
            p00: p0,
            p11: p0,
            p22: p0,
            p33: p0,
            last_update_time: timestamp,
        }
    }

    pub fn position(&self) -> CourtPoint {
        CourtPoint::new(self.x, self.y)
    }
}

struct Axis<'a> {
    pos: &'a mut FloatType,
    vel: &'a mut FloatType,
    pos_var: &'a mut FloatType,
    vel_var: &'a mut FloatType,
}

impl Axis<'_> {
    fn predict(&mut self, dt: FloatType, q: FloatType) {
        *self.pos += *self.vel * dt;
        *self.pos_var += dt * dt * *self.vel_var + q * dt;
        *self.vel_var += q * dt;
    }

    /// Both gains share the innovation variance `pos_var + r`. The velocity
    /// gain uses the position/velocity covariance the prediction just built,
    /// `dt * vel_var`, which is then dropped again.
    fn correct(&mut self, measured: FloatType, dt: FloatType, r: FloatType) {
        let innovation = measured - *self.pos;
        let s = *self.pos_var + r;
        let k = *self.pos_var / s;
        let kv = dt * *self.vel_var / s;
        *self.pos += k * innovation;
        *self.vel += kv * innovation;
        *self.pos_var *= 1.0 - k;
        *self.vel_var *= 1.0 - kv * dt;
    }
}

pub struct PositionFilter {
    config: FilterConfig,
    state: Option<FilterState>,
}

impl PositionFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            state: None,
        }
    }

    pub fn state(&self) -> Option<&FilterState> {
        self.state.as_ref()
    }

    /// Latest smoothed position, if any measurement has arrived.
    pub fn position(&self) -> Option<CourtPoint> {
        self.state.as_ref().map(FilterState::position)
    }

    pub fn reset(&mut self) {
        self.state = None;
    }

    /// Fold in one measurement and return the smoothed position.
    ///
    /// Non-finite input is refused and leaves the state untouched. A
    /// timestamp before the previous one restarts the filter from this
    /// measurement.
    pub fn update(&mut self, measured: CourtPoint, timestamp: FloatType) -> Option<CourtPoint> {
        if !(measured.x.is_finite() && measured.y.is_finite() && timestamp.is_finite()) {
            warn!("refusing non-finite measurement {measured:?} at {timestamp}");
            return None;
        }
        let p0 = self.config.initial_uncertainty;
        let (q, r) = (self.config.process_noise, self.config.measurement_noise);
        let Some(s) = self.state.as_mut() else {
            self.state = Some(FilterState::initial(measured, timestamp, p0));
            return Some(measured);
        };
        if timestamp < s.last_update_time {
            info!(
                "measurement time went back from {} s to {timestamp} s, restarting filter",
                s.last_update_time
            );
            *s = FilterState::initial(measured, timestamp, p0);
            return Some(measured);
        }

        let dt = (timestamp - s.last_update_time).clamp(MIN_DT, MAX_DT);
        for (mut axis, z) in [
            (
                Axis {
                    pos: &mut s.x,
                    vel: &mut s.vx,
                    pos_var: &mut s.p00,
                    vel_var: &mut s.p22,
                },
                measured.x,
            ),
            (
                Axis {
                    pos: &mut s.y,
                    vel: &mut s.vy,
                    pos_var: &mut s.p11,
                    vel_var: &mut s.p33,
                },
                measured.y,
            ),
        ] {
            axis.predict(dt, q);
            axis.correct(z, dt, r);
        }
        s.last_update_time = timestamp;
        Some(s.position())
    }
}
