//! Frame transforms between world, tool and canvas.
//!
//! Everything here is pure. The world→tool direction is always computed
//! with a pseudo-inverse so that a rotation block that has drifted away from
//! orthonormal (telemetry noise, kinematic model error) still yields a usable
//! best-effort inverse. Such drift is reported as a [`Degeneracy`] for the
//! caller to log.

use std::f64::consts::PI;

use nalgebra::{Matrix3, Matrix4, Point2, Point3, Rotation3, UnitQuaternion, Vector3};

use crate::{PainterError, Result};

/// Largest tolerated deviation of `RᵀR` from identity (Frobenius norm) and of `det R` from 1.
pub const ORTHONORMALITY_TOLERANCE: f64 = 1e-6;

const PSEUDO_INVERSE_EPS: f64 = 1e-12;

/// Position plus rotation vector, both in the world frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// Meters.
    pub position: Vector3<f64>,
    /// Axis-angle; the norm is the angle in radians.
    pub rotation: Vector3<f64>,
}

impl Pose {
    pub fn new(position: Vector3<f64>, rotation: Vector3<f64>) -> Self {
        Self { position, rotation }
    }

    /// Build from a rotation matrix, going through a quaternion so that
    /// half-turns keep their axis.
    pub fn from_rotation(position: Vector3<f64>, rotation: &Rotation3<f64>) -> Self {
        let rotation = UnitQuaternion::from_rotation_matrix(rotation).scaled_axis();
        Self { position, rotation }
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        Rotation3::new(self.rotation).into_inner()
    }
}

/// How far a rotation block is from a proper rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Degeneracy {
    pub determinant: f64,
    /// `‖RᵀR − I‖` (Frobenius).
    pub orthonormality_error: f64,
}

/// `None` when `rotation` is orthonormal with unit determinant within tolerance.
pub fn check_rotation(rotation: &Matrix3<f64>) -> Option<Degeneracy> {
    let determinant = rotation.determinant();
    let orthonormality_error = (rotation.transpose() * rotation - Matrix3::identity()).norm();
    if orthonormality_error > ORTHONORMALITY_TOLERANCE
        || (determinant - 1.0).abs() > ORTHONORMALITY_TOLERANCE
    {
        Some(Degeneracy {
            determinant,
            orthonormality_error,
        })
    } else {
        None
    }
}

/// Moore–Penrose inverse of a homogeneous transform.
///
/// Falls back to the rigid inverse `[Rᵀ | −Rᵀt]` if the SVD is rejected,
/// which only happens for a negative epsilon.
pub fn pseudo_inverse(transform: &Matrix4<f64>) -> Matrix4<f64> {
    match transform.pseudo_inverse(PSEUDO_INVERSE_EPS) {
        Ok(inverse) => inverse,
        Err(_) => rigid_inverse(transform),
    }
}

fn rigid_inverse(transform: &Matrix4<f64>) -> Matrix4<f64> {
    let rotation_t = transform.fixed_view::<3, 3>(0, 0).transpose();
    let translation = -(rotation_t * transform.fixed_view::<3, 1>(0, 3));
    let mut inverse = Matrix4::identity();
    inverse.fixed_view_mut::<3, 3>(0, 0).copy_from(&rotation_t);
    inverse.fixed_view_mut::<3, 1>(0, 3).copy_from(&translation);
    inverse
}

/// Express a world-frame vector (force, velocity) in the tool frame.
pub fn world_to_tool_vector(rotation: &Matrix3<f64>, world: &Vector3<f64>) -> Vector3<f64> {
    let inverse = rotation
        .pseudo_inverse(PSEUDO_INVERSE_EPS)
        .unwrap_or_else(|_| rotation.transpose());
    inverse * world
}

/// Express a tool-frame vector in the world frame.
pub fn tool_to_world_vector(rotation: &Matrix3<f64>, tool: &Vector3<f64>) -> Vector3<f64> {
    rotation * tool
}

fn apply(transform: &Matrix4<f64>, point: &Point3<f64>) -> Point3<f64> {
    let v = transform * point.to_homogeneous();
    Point3::new(v.x, v.y, v.z)
}

/// Placement of the canvas in the world. Fixed for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct CanvasFrame {
    world_from_canvas: Matrix4<f64>,
    corrected: Option<Degeneracy>,
}

impl CanvasFrame {
    /// Validate a canvas transform.
    ///
    /// A slightly non-orthonormal rotation block is replaced by the closest
    /// rotation; the measured deviation is kept in [`Self::correction`].
    pub fn new(transform: Matrix4<f64>) -> Result<Self> {
        if transform.iter().any(|v| !v.is_finite()) {
            return Err(PainterError::InvalidFrame {
                reason: "canvas transform has non-finite entries".into(),
            });
        }
        let bottom = transform.fixed_view::<1, 4>(3, 0);
        let expected = [0.0, 0.0, 0.0, 1.0];
        if bottom
            .iter()
            .zip(expected.iter())
            .any(|(v, e)| (v - e).abs() > 1e-9)
        {
            return Err(PainterError::InvalidFrame {
                reason: format!("canvas transform bottom row is {bottom}, expected [0 0 0 1]"),
            });
        }

        let rotation: Matrix3<f64> = transform.fixed_view::<3, 3>(0, 0).into_owned();
        let corrected = check_rotation(&rotation);
        let mut world_from_canvas = transform;
        if let Some(degeneracy) = corrected {
            if degeneracy.determinant <= 0.0 {
                return Err(PainterError::InvalidFrame {
                    reason: format!(
                        "canvas rotation has determinant {:.6}",
                        degeneracy.determinant
                    ),
                });
            }
            let nearest = Rotation3::from_matrix(&rotation);
            world_from_canvas
                .fixed_view_mut::<3, 3>(0, 0)
                .copy_from(nearest.matrix());
        }

        Ok(Self {
            world_from_canvas,
            corrected,
        })
    }

    pub fn from_rows(rows: [[f64; 4]; 4]) -> Result<Self> {
        Self::new(Matrix4::from_fn(|r, c| rows[r][c]))
    }

    pub fn identity() -> Self {
        Self {
            world_from_canvas: Matrix4::identity(),
            corrected: None,
        }
    }

    /// Deviation of the supplied rotation block, if it had to be re-orthonormalized.
    pub fn correction(&self) -> Option<Degeneracy> {
        self.corrected
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.world_from_canvas
    }

    pub fn rotation(&self) -> Matrix3<f64> {
        self.world_from_canvas.fixed_view::<3, 3>(0, 0).into_owned()
    }

    pub fn origin(&self) -> Vector3<f64> {
        self.world_from_canvas.fixed_view::<3, 1>(0, 3).into_owned()
    }

    /// Canvas-local `(x, y, 0)` in world coordinates.
    pub fn to_world(&self, point: &Point2<f64>) -> Point3<f64> {
        apply(&self.world_from_canvas, &Point3::new(point.x, point.y, 0.0))
    }
}

/// Pose with the tool pointing into the canvas, `height_padding` above its origin along world Z.
pub fn pose_above_surface(canvas: &CanvasFrame, height_padding: f64) -> Pose {
    let flip = Rotation3::from_axis_angle(&Vector3::y_axis(), PI);
    let rotation = Rotation3::from_matrix_unchecked(canvas.rotation() * flip.matrix());
    let mut position = canvas.origin();
    position.z += height_padding;
    Pose::from_rotation(position, &rotation)
}

/// Tool placement at the moment telemetry was read.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolTransform {
    world_from_tool: Matrix4<f64>,
    tool_from_world: Matrix4<f64>,
    orientation: Vector3<f64>,
    degeneracy: Option<Degeneracy>,
}

impl ToolTransform {
    /// Tool→world from the current pose and the kinematic rotation; the
    /// world→tool side is the pseudo-inverse.
    pub fn new(current: &Pose, rotation: &Matrix3<f64>) -> Self {
        let mut world_from_tool = Matrix4::identity();
        world_from_tool
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(rotation);
        world_from_tool
            .fixed_view_mut::<3, 1>(0, 3)
            .copy_from(&current.position);

        Self {
            tool_from_world: pseudo_inverse(&world_from_tool),
            world_from_tool,
            orientation: current.rotation,
            degeneracy: check_rotation(rotation),
        }
    }

    pub fn degeneracy(&self) -> Option<Degeneracy> {
        self.degeneracy
    }

    pub fn to_tool(&self, world: &Point3<f64>) -> Point3<f64> {
        apply(&self.tool_from_world, world)
    }

    pub fn to_world(&self, tool: &Point3<f64>) -> Point3<f64> {
        apply(&self.world_from_tool, tool)
    }
}

/// Map a canvas point onto the surface as sensed by the tool.
///
/// The point goes canvas → world → tool, its tool-local Z is overwritten
/// with `tool_z`, and it is mapped back to the world. The planned world Z is
/// never used; only the offset from the current tool height is. The
/// returned pose keeps the tool's current orientation.
pub fn project_canvas_point(
    canvas: &CanvasFrame,
    tool: &ToolTransform,
    point: &Point2<f64>,
    tool_z: f64,
) -> Pose {
    let world = canvas.to_world(point);
    let mut local = tool.to_tool(&world);
    local.z = tool_z;
    let target = tool.to_world(&local);
    Pose::new(target.coords, tool.orientation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tool_down_at(position: Vector3<f64>) -> (Pose, Matrix3<f64>) {
        let rotation = Rotation3::from_axis_angle(&Vector3::y_axis(), PI);
        (
            Pose::from_rotation(position, &rotation),
            rotation.into_inner(),
        )
    }

    fn sample_rotations() -> Vec<Rotation3<f64>> {
        vec![
            Rotation3::identity(),
            Rotation3::from_axis_angle(&Vector3::y_axis(), PI),
            Rotation3::from_euler_angles(0.3, -1.1, 2.4),
            Rotation3::from_euler_angles(-2.9, 0.05, -0.7),
            Rotation3::from_scaled_axis(Vector3::new(0.2, 0.4, -1.3)),
        ]
    }

    #[test]
    fn test_pose_from_half_turn_keeps_axis() {
        let rotation = Rotation3::from_axis_angle(&Vector3::y_axis(), PI);
        let pose = Pose::from_rotation(Vector3::zeros(), &rotation);
        assert_relative_eq!(pose.rotation.norm(), PI, epsilon = 1e-9);
        assert_relative_eq!(pose.rotation_matrix(), rotation.into_inner(), epsilon = 1e-9);
    }

    #[test]
    fn test_pose_above_identity_canvas_points_down() {
        let pose = pose_above_surface(&CanvasFrame::identity(), 0.05);
        assert_relative_eq!(pose.position, Vector3::new(0.0, 0.0, 0.05));
        let tool_z = pose.rotation_matrix() * Vector3::z();
        assert_relative_eq!(tool_z, -Vector3::z(), epsilon = 1e-9);
    }

    #[test]
    fn test_pose_above_tilted_canvas() {
        let mut transform = Matrix4::identity();
        let tilt = Rotation3::from_axis_angle(&Vector3::x_axis(), 0.2);
        transform.fixed_view_mut::<3, 3>(0, 0).copy_from(tilt.matrix());
        transform[(0, 3)] = 0.4;
        transform[(2, 3)] = 0.1;
        let canvas = CanvasFrame::new(transform).unwrap();

        let pose = pose_above_surface(&canvas, 0.02);
        assert_relative_eq!(pose.position, Vector3::new(0.4, 0.0, 0.12), epsilon = 1e-12);
        let normal = tilt * Vector3::z();
        let tool_z = pose.rotation_matrix() * Vector3::z();
        assert_relative_eq!(tool_z, -normal, epsilon = 1e-9);
    }

    #[test]
    fn test_round_trip_world_tool_world() {
        let points = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.3, -0.2, 0.5),
            Point3::new(-1.2, 0.7, -0.01),
        ];
        for rotation in sample_rotations() {
            let pose = Pose::from_rotation(Vector3::new(0.4, 0.1, 0.25), &rotation);
            let tool = ToolTransform::new(&pose, rotation.matrix());
            assert!(tool.degeneracy().is_none());
            for p in &points {
                let back = tool.to_world(&tool.to_tool(p));
                assert_relative_eq!(back, *p, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_projection_clamps_tool_z() {
        let mut transform = Matrix4::identity();
        transform
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(Rotation3::from_euler_angles(0.1, -0.05, 0.8).matrix());
        transform[(0, 3)] = 0.5;
        transform[(1, 3)] = -0.2;
        let canvas = CanvasFrame::new(transform).unwrap();

        for rotation in sample_rotations() {
            let pose = Pose::from_rotation(Vector3::new(0.45, -0.15, 0.03), &rotation);
            let tool = ToolTransform::new(&pose, rotation.matrix());
            for (x, y) in [(0.0, 0.0), (0.05, 0.02), (-0.3, 0.12), (1.5, -2.0)] {
                for clamp in [0.0, -0.02] {
                    let projected = project_canvas_point(&canvas, &tool, &Point2::new(x, y), clamp);
                    let local = tool.to_tool(&Point3::from(projected.position));
                    assert_relative_eq!(local.z, clamp, epsilon = 1e-12);
                    assert_eq!(projected.rotation, pose.rotation);
                }
            }
        }
    }

    #[test]
    fn test_projection_on_identity_canvas() {
        let (pose, rotation) = tool_down_at(Vector3::new(0.1, -0.03, 0.0));
        let tool = ToolTransform::new(&pose, &rotation);
        let projected = project_canvas_point(
            &CanvasFrame::identity(),
            &tool,
            &Point2::new(0.05, 0.02),
            0.0,
        );
        assert_relative_eq!(projected.position, Vector3::new(0.05, 0.02, 0.0), epsilon = 1e-12);
        assert_eq!(projected.rotation, pose.rotation);
    }

    #[test]
    fn test_projection_follows_sensed_height() {
        let (pose, rotation) = tool_down_at(Vector3::new(0.0, 0.0, 0.004));
        let tool = ToolTransform::new(&pose, &rotation);
        let canvas = CanvasFrame::identity();

        let on_surface = project_canvas_point(&canvas, &tool, &Point2::new(0.01, 0.0), 0.0);
        assert_relative_eq!(on_surface.position.z, 0.004, epsilon = 1e-12);

        // Tool Z points down, so a negative tool-local offset lifts the tool.
        let retracted = project_canvas_point(&canvas, &tool, &Point2::new(0.01, 0.0), -0.02);
        assert_relative_eq!(retracted.position.z, 0.024, epsilon = 1e-12);
        assert_relative_eq!(retracted.position.x, 0.01, epsilon = 1e-12);
    }

    #[test]
    fn test_degenerate_rotation_still_inverts() {
        let rotation = Rotation3::from_euler_angles(0.4, 0.2, -0.3).into_inner() * 1.001;
        let pose = Pose::new(Vector3::new(0.1, 0.2, 0.3), Vector3::zeros());
        let tool = ToolTransform::new(&pose, &rotation);

        let degeneracy = tool.degeneracy().unwrap();
        assert!(degeneracy.orthonormality_error > ORTHONORMALITY_TOLERANCE);

        let p = Point3::new(0.3, -0.1, 0.2);
        assert_relative_eq!(tool.to_world(&tool.to_tool(&p)), p, epsilon = 1e-9);
    }

    #[test]
    fn test_force_rotation_matches_transpose_for_rotations() {
        let rotation = Rotation3::from_euler_angles(1.0, -0.4, 0.25).into_inner();
        let force = Vector3::new(1.5, -2.0, 7.0);
        let tool = world_to_tool_vector(&rotation, &force);
        assert_relative_eq!(tool, rotation.transpose() * force, epsilon = 1e-12);
        assert_relative_eq!(tool_to_world_vector(&rotation, &tool), force, epsilon = 1e-12);
    }

    #[test]
    fn test_canvas_rejects_bad_bottom_row() {
        let mut transform = Matrix4::identity();
        transform[(3, 0)] = 0.5;
        assert!(matches!(
            CanvasFrame::new(transform),
            Err(PainterError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn test_canvas_rejects_reflection() {
        let mut transform = Matrix4::identity();
        transform[(2, 2)] = -1.0;
        assert!(CanvasFrame::new(transform).is_err());
    }

    #[test]
    fn test_canvas_reorthonormalizes_drift() {
        let mut transform = Matrix4::identity();
        transform[(0, 1)] = 1e-3;
        let canvas = CanvasFrame::new(transform).unwrap();
        assert!(canvas.correction().is_some());
        assert!(check_rotation(&canvas.rotation()).is_none());
    }

    #[test]
    fn test_canvas_to_world() {
        let canvas = CanvasFrame::from_rows([
            [0.0, -1.0, 0.0, 0.5],
            [1.0, 0.0, 0.0, 0.1],
            [0.0, 0.0, 1.0, 0.02],
            [0.0, 0.0, 0.0, 1.0],
        ])
        .unwrap();
        let world = canvas.to_world(&Point2::new(0.1, 0.2));
        assert_relative_eq!(world, Point3::new(0.3, 0.2, 0.02), epsilon = 1e-12);
    }
}
