//! Denavit–Hartenberg forward kinematics.
//!
//! Only forward kinematics is needed: the controllers use the tool
//! orientation to rotate forces and velocities between world and tool.

use std::f64::consts::FRAC_PI_2;
use std::f64::consts::FRAC_PI_4;

use nalgebra::{Isometry3, Matrix3, Vector3};

use crate::Kinematics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhConvention {
    /// `Rz(θ) Tz(d) Tx(a) Rx(α)`
    Standard,
    /// Craig's convention, `Rx(α) Tx(a) Rz(θ) Tz(d)`
    Modified,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DhLink {
    pub a: f64,
    pub d: f64,
    pub alpha: f64,
    pub theta_offset: f64,
}

impl DhLink {
    pub const fn new(a: f64, d: f64, alpha: f64) -> Self {
        Self {
            a,
            d,
            alpha,
            theta_offset: 0.0,
        }
    }

    fn transform(&self, convention: DhConvention, q: f64) -> Isometry3<f64> {
        let theta = q + self.theta_offset;
        let rz = Isometry3::rotation(Vector3::z() * theta);
        let tz = Isometry3::translation(0.0, 0.0, self.d);
        let tx = Isometry3::translation(self.a, 0.0, 0.0);
        let rx = Isometry3::rotation(Vector3::x() * self.alpha);
        match convention {
            DhConvention::Standard => rz * tz * tx * rx,
            DhConvention::Modified => rx * tx * rz * tz,
        }
    }
}

/// Serial chain from the robot base to the tool.
#[derive(Debug, Clone, PartialEq)]
pub struct DhChain {
    convention: DhConvention,
    links: Vec<DhLink>,
    /// Fixed transform from the last link to the tool.
    tool: Isometry3<f64>,
}

impl DhChain {
    pub fn new(convention: DhConvention, links: Vec<DhLink>, tool: Isometry3<f64>) -> Self {
        Self {
            convention,
            links,
            tool,
        }
    }

    /// Universal Robots UR5e, flange as tool.
    pub fn ur5e() -> Self {
        Self::new(
            DhConvention::Standard,
            vec![
                DhLink::new(0.0, 0.1625, FRAC_PI_2),
                DhLink::new(-0.425, 0.0, 0.0),
                DhLink::new(-0.3922, 0.0, 0.0),
                DhLink::new(0.0, 0.1333, FRAC_PI_2),
                DhLink::new(0.0, 0.0997, -FRAC_PI_2),
                DhLink::new(0.0, 0.0996, 0.0),
            ],
            Isometry3::identity(),
        )
    }

    /// Franka Emika Panda, flange rotated into the hand frame.
    pub fn panda() -> Self {
        let flange = Isometry3::translation(0.0, 0.0, 0.107);
        let hand = Isometry3::rotation(Vector3::z() * -FRAC_PI_4);
        Self::new(
            DhConvention::Modified,
            vec![
                DhLink::new(0.0, 0.333, 0.0),
                DhLink::new(0.0, 0.0, -FRAC_PI_2),
                DhLink::new(0.0, 0.316, FRAC_PI_2),
                DhLink::new(0.0825, 0.0, FRAC_PI_2),
                DhLink::new(-0.0825, 0.384, -FRAC_PI_2),
                DhLink::new(0.0, 0.0, FRAC_PI_2),
                DhLink::new(0.088, 0.0, FRAC_PI_2),
            ],
            flange * hand,
        )
    }

    pub fn dof(&self) -> usize {
        self.links.len()
    }

    /// Tool pose in the base frame. Missing joint values count as zero,
    /// extra ones are ignored.
    pub fn forward(&self, joints: &[f64]) -> Isometry3<f64> {
        let flange = self
            .links
            .iter()
            .enumerate()
            .fold(Isometry3::identity(), |acc, (i, link)| {
                let q = joints.get(i).copied().unwrap_or(0.0);
                acc * link.transform(self.convention, q)
            });
        flange * self.tool
    }
}

impl Kinematics for DhChain {
    fn rotation(&self, joints: &[f64]) -> Matrix3<f64> {
        self.forward(joints).rotation.to_rotation_matrix().into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Rotation3, Translation3};
    use std::f64::consts::PI;

    #[test]
    fn test_ur5e_zero_configuration() {
        let chain = DhChain::ur5e();
        let pose = chain.forward(&[0.0; 6]);
        assert_relative_eq!(
            pose.translation,
            Translation3::new(-0.8172, -0.2329, 0.0628),
            epsilon = 1e-9
        );
        assert_relative_eq!(
            chain.rotation(&[0.0; 6]),
            Rotation3::from_axis_angle(&Vector3::x_axis(), FRAC_PI_2).into_inner(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_panda_zero_configuration() {
        let chain = DhChain::panda();
        let pose = chain.forward(&[0.0; 7]);
        assert_relative_eq!(
            pose.translation,
            Translation3::new(0.088, 0.0, 0.926),
            epsilon = 1e-9
        );
        let expected = Rotation3::from_axis_angle(&Vector3::x_axis(), PI)
            * Rotation3::from_axis_angle(&Vector3::z_axis(), -FRAC_PI_4);
        assert_relative_eq!(
            chain.rotation(&[0.0; 7]),
            expected.into_inner(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_base_joint_rotates_about_world_z() {
        let chain = DhChain::ur5e();
        let zero = chain.forward(&[0.0; 6]);
        let turned = chain.forward(&[FRAC_PI_2, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let expected = Rotation3::from_axis_angle(&Vector3::z_axis(), FRAC_PI_2)
            * zero.translation.vector;
        assert_relative_eq!(turned.translation.vector, expected, epsilon = 1e-9);
    }

    #[test]
    fn test_rotation_is_orthonormal() {
        let chain = DhChain::ur5e();
        let r = chain.rotation(&[0.3, -1.2, 1.9, -2.2, -1.57, 0.4]);
        assert_relative_eq!(r.transpose() * r, Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_short_joint_vector_uses_zeros() {
        let chain = DhChain::ur5e();
        assert_eq!(chain.forward(&[0.0; 3]), chain.forward(&[0.0; 6]));
        assert_eq!(chain.dof(), 6);
    }
}
