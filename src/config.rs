//! Run configuration, read from a JSON file.
//!
//! ```json
//! {
//!   "ip": "192.168.1.100",
//!   "home_position": [0, -90, 90, -90, -90, 0],
//!   "speed": 0.1,
//!   "acceleration": 0.3,
//!   "canvas_tf": [[1,0,0,0.4],[0,1,0,0.0],[0,0,1,0.1],[0,0,0,1]]
//! }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::contact::ContactGains;
use crate::frame::CanvasFrame;
use crate::{LinearMotion, PainterError, Result, ServoParams};

/// Which backend drives the arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RobotBackend {
    Franka,
    #[default]
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PainterConfig {
    /// Robot network address.
    pub ip: String,
    /// Home joint configuration in degrees.
    pub home_position: Vec<f64>,
    /// Linear move speed, m/s.
    pub speed: f64,
    /// Linear move acceleration, m/s^2.
    pub acceleration: f64,
    /// World-from-canvas transform, row-major.
    pub canvas_tf: [[f64; 4]; 4],
    #[serde(default)]
    pub verbose: bool,
    /// Height of the staging pose above the canvas origin, m.
    #[serde(default)]
    pub height_padding: f64,
    /// Tool-frame Z force held while painting, N.
    #[serde(default = "default_contact_force")]
    pub contact_force: f64,
    /// Tool-local Z used to lift off after a stroke, m.
    #[serde(default = "default_retract_offset")]
    pub retract_offset: f64,
    #[serde(default)]
    pub contact: ContactGains,
    #[serde(default)]
    pub servo: ServoParams,
    #[serde(default)]
    pub robot: RobotBackend,
}

fn default_contact_force() -> f64 {
    -4.0
}

fn default_retract_offset() -> f64 {
    -0.02
}

impl PainterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("speed", self.speed),
            ("acceleration", self.acceleration),
            ("contact.max_speed", self.contact.max_speed),
            ("contact.deadband", self.contact.deadband),
            ("contact.rate_hz", self.contact.rate_hz),
            ("contact.timeout_secs", self.contact.timeout_secs),
            ("contact.acceleration", self.contact.acceleration),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(PainterError::invalid_config(format!(
                    "`{name}` must be positive, got {value}"
                )));
            }
        }
        if !(self.retract_offset.is_finite() && self.retract_offset <= 0.0) {
            return Err(PainterError::invalid_config(format!(
                "`retract_offset` must be zero or negative, got {}",
                self.retract_offset
            )));
        }
        if !self.contact_force.is_finite() || !self.height_padding.is_finite() {
            return Err(PainterError::invalid_config(
                "`contact_force` and `height_padding` must be finite",
            ));
        }
        if self.home_position.is_empty() || self.home_position.iter().any(|q| !q.is_finite()) {
            return Err(PainterError::invalid_config(
                "`home_position` must list finite joint angles",
            ));
        }
        self.canvas_frame().map(|_| ())
    }

    /// Home configuration in radians.
    pub fn home_joints(&self) -> Vec<f64> {
        self.home_position.iter().map(|deg| deg.to_radians()).collect()
    }

    pub fn canvas_frame(&self) -> Result<CanvasFrame> {
        let canvas = CanvasFrame::from_rows(self.canvas_tf)?;
        if let Some(correction) = canvas.correction() {
            warn!(
                determinant = correction.determinant,
                orthonormality_error = correction.orthonormality_error,
                "canvas rotation re-orthonormalized"
            );
        }
        Ok(canvas)
    }

    pub fn linear_motion(&self) -> LinearMotion {
        LinearMotion::blocking(self.speed, self.acceleration)
    }
}
