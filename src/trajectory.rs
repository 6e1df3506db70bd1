//! Strokes to paint, grouped by color.
//!
//! Stored as JSON:
//!
//! ```json
//! { "trajectories": [ { "color": 1, "points": [[0.01, 0.02], [0.011, 0.021]] } ] }
//! ```
//!
//! Points are canvas-local meters. Everything is validated on load so that
//! bad data is rejected before the robot moves.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use nalgebra::Point2;
use serde::Deserialize;

use crate::{PainterError, Result};

/// One continuous stroke in a single color.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    color: i64,
    points: Vec<Point2<f64>>,
}

impl Trajectory {
    pub fn new(color: i64, points: Vec<Point2<f64>>) -> Result<Self> {
        if points.is_empty() {
            return Err(PainterError::malformed(None, "trajectory has no points"));
        }
        if let Some(i) = points
            .iter()
            .position(|p| !(p.x.is_finite() && p.y.is_finite()))
        {
            return Err(PainterError::malformed(
                None,
                format!("point {i} is not finite"),
            ));
        }
        Ok(Self { color, points })
    }

    pub fn color(&self) -> i64 {
        self.color
    }

    pub fn points(&self) -> &[Point2<f64>] {
        &self.points
    }

    /// Colors `<= 0` are only drawn when all colors are forced.
    pub fn is_sentinel(&self) -> bool {
        self.color <= 0
    }
}

/// Ordered strokes, drawn top to bottom.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrajectorySet {
    trajectories: Vec<Trajectory>,
}

#[derive(Deserialize)]
struct RawSet {
    trajectories: Option<Vec<RawTrajectory>>,
}

#[derive(Deserialize)]
struct RawTrajectory {
    color: Option<i64>,
    points: Option<Vec<[f64; 2]>>,
}

impl TrajectorySet {
    pub fn new(trajectories: Vec<Trajectory>) -> Self {
        Self { trajectories }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: RawSet = serde_json::from_str(json)
            .map_err(|e| PainterError::malformed(None, e.to_string()))?;
        Self::from_raw(raw)
    }

    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let raw: RawSet = serde_json::from_reader(reader)
            .map_err(|e| PainterError::malformed(None, e.to_string()))?;
        Self::from_raw(raw)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let set = Self::from_reader(BufReader::new(file))?;
        tracing::info!(
            path = %path.as_ref().display(),
            trajectories = set.len(),
            "loaded trajectories"
        );
        Ok(set)
    }

    fn from_raw(raw: RawSet) -> Result<Self> {
        let raw = raw
            .trajectories
            .ok_or_else(|| PainterError::malformed(None, "missing field `trajectories`"))?;

        let trajectories = raw
            .into_iter()
            .enumerate()
            .map(|(index, raw)| {
                let color = raw
                    .color
                    .ok_or_else(|| PainterError::malformed(Some(index), "missing field `color`"))?;
                let points = raw
                    .points
                    .ok_or_else(|| PainterError::malformed(Some(index), "missing field `points`"))?
                    .into_iter()
                    .map(|[x, y]| Point2::new(x, y))
                    .collect();
                Trajectory::new(color, points).map_err(|e| match e {
                    PainterError::MalformedTrajectory { reason, .. } => {
                        PainterError::malformed(Some(index), reason)
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { trajectories })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Trajectory> {
        self.trajectories.iter()
    }

    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    pub fn first(&self) -> Option<&Trajectory> {
        self.trajectories.first()
    }
}

impl<'a> IntoIterator for &'a TrajectorySet {
    type Item = &'a Trajectory;
    type IntoIter = std::slice::Iter<'a, Trajectory>;

    fn into_iter(self) -> Self::IntoIter {
        self.trajectories.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_keeps_order() {
        let set = TrajectorySet::from_json_str(
            r#"{"trajectories": [
                {"color": 2, "points": [[0.0, 0.0], [0.01, 0.0]]},
                {"color": -1, "points": [[0.02, 0.02]]},
                {"color": 1, "points": [[0.1, 0.2]]}
            ]}"#,
        )
        .unwrap();

        let colors: Vec<i64> = set.iter().map(Trajectory::color).collect();
        assert_eq!(colors, vec![2, -1, 1]);
        assert_eq!(set.first().unwrap().points()[1], Point2::new(0.01, 0.0));
        assert!(set.iter().nth(1).unwrap().is_sentinel());
    }

    #[test]
    fn test_missing_color_is_rejected() {
        let err = TrajectorySet::from_json_str(
            r#"{"trajectories": [
                {"color": 1, "points": [[0.0, 0.0]]},
                {"points": [[0.0, 0.0]]}
            ]}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PainterError::MalformedTrajectory { index: Some(1), .. }
        ));
    }

    #[test]
    fn test_empty_points_are_rejected() {
        let err =
            TrajectorySet::from_json_str(r#"{"trajectories": [{"color": 3, "points": []}]}"#)
                .unwrap_err();
        assert!(matches!(
            err,
            PainterError::MalformedTrajectory { index: Some(0), .. }
        ));
    }

    #[test]
    fn test_missing_trajectories_field() {
        assert!(TrajectorySet::from_json_str("{}").is_err());
        assert!(TrajectorySet::from_json_str("not json").is_err());
    }

    #[test]
    fn test_non_finite_point() {
        assert!(Trajectory::new(1, vec![Point2::new(f64::NAN, 0.0)]).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"trajectories": [{{"color": 1, "points": [[0.05, 0.02]]}}]}}"#
        )
        .unwrap();
        let set = TrajectorySet::load(file.path()).unwrap();
        assert_eq!(set.len(), 1);
        assert!(!set.is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            TrajectorySet::load("/nonexistent/strokes.json"),
            Err(PainterError::Io(_))
        ));
    }
}
