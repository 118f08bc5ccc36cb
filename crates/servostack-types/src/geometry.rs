//! Rigid-body primitives shared by every servostack crate.
//!
//! [`Vec3`] and [`Quaternion`] are deliberately small value types; the
//! frame graph in `servostack-perception` composes them into transforms and
//! the orchestrator offsets [`Pose`]s with them.

use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Vec3
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D vector (metres for positions, unitless for directions).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    /// Create a new vector.
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// The zero vector.
    pub const fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    pub fn scale(self, factor: f32) -> Self {
        Self::new(self.x * factor, self.y * factor, self.z * factor)
    }

    pub fn neg(self) -> Self {
        self.scale(-1.0)
    }

    /// Euclidean length.
    pub fn norm(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Unit vector in the same direction, or `None` for a (near) zero vector.
    pub fn normalized(self) -> Option<Self> {
        let norm = self.norm();
        if norm <= f32::EPSILON {
            return None;
        }
        Some(self.scale(1.0 / norm))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Quaternion
// ────────────────────────────────────────────────────────────────────────────

/// A unit quaternion representing a 3-D rotation (w, x, y, z storage).
///
/// Wire formats list quaternions as `(qx, qy, qz, qw)`; use
/// [`Quaternion::from_xyzw`] when reading those.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Quaternion {
    /// Create a quaternion.  The caller is responsible for providing a unit
    /// quaternion (|q| = 1).
    pub const fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Self { w, x, y, z }
    }

    /// Create a quaternion from wire order `(qx, qy, qz, qw)`.
    pub const fn from_xyzw(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self::new(w, x, y, z)
    }

    /// The identity rotation (no rotation).
    pub const fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    /// Hamilton product: compose two rotations.
    pub fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        )
    }

    /// Conjugate (== inverse for a unit quaternion).
    pub fn conjugate(self) -> Self {
        Self::new(self.w, -self.x, -self.y, -self.z)
    }

    /// Rotate a vector by this quaternion: p' = q * p * q*.
    pub fn rotate(self, v: Vec3) -> Vec3 {
        let p = Self::new(0.0, v.x, v.y, v.z);
        let rotated = self.mul(p).mul(self.conjugate());
        Vec3::new(rotated.x, rotated.y, rotated.z)
    }
}

/// Canonical gripper orientation for top-down grasps: the gripper's
/// approach axis points along world -Z.
pub const GRIPPER_DOWN: Quaternion =
    Quaternion::from_xyzw(0.650_916_05, 0.758_886_8, -0.018_099_26, -0.008_457_353);

// ────────────────────────────────────────────────────────────────────────────
// Pose
// ────────────────────────────────────────────────────────────────────────────

/// End-effector or object pose expressed in the robot base frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub orientation: Quaternion,
}

impl Pose {
    pub const fn new(position: Vec3, orientation: Quaternion) -> Self {
        Self {
            position,
            orientation,
        }
    }

    /// Same pose, raised (or lowered, for negative `dz`) along base Z.
    pub fn with_z_offset(self, dz: f32) -> Self {
        Self::new(self.position.add(Vec3::new(0.0, 0.0, dz)), self.orientation)
    }

    /// Same position, different orientation.
    pub fn with_orientation(self, orientation: Quaternion) -> Self {
        Self::new(self.position, orientation)
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::new(Vec3::zero(), Quaternion::identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_1_SQRT_2;

    #[test]
    fn normalized_zero_vector_is_none() {
        assert!(Vec3::zero().normalized().is_none());
    }

    #[test]
    fn normalized_has_unit_length() {
        let v = Vec3::new(3.0, 4.0, 0.0).normalized().unwrap();
        assert!((v.norm() - 1.0).abs() < 1e-6);
        assert!((v.x - 0.6).abs() < 1e-6);
    }

    #[test]
    fn quaternion_90deg_yaw_rotates_x_to_y() {
        let q = Quaternion::new(FRAC_1_SQRT_2, 0.0, 0.0, FRAC_1_SQRT_2);
        let r = q.rotate(Vec3::new(1.0, 0.0, 0.0));
        assert!(r.x.abs() < 1e-5, "x should be ~0, got {}", r.x);
        assert!((r.y - 1.0).abs() < 1e-5, "y should be ~1, got {}", r.y);
    }

    #[test]
    fn from_xyzw_reorders_components() {
        let q = Quaternion::from_xyzw(0.1, 0.2, 0.3, 0.9);
        assert_eq!(q, Quaternion::new(0.9, 0.1, 0.2, 0.3));
    }

    #[test]
    fn gripper_down_is_unit() {
        let q = GRIPPER_DOWN;
        let norm = (q.w * q.w + q.x * q.x + q.y * q.y + q.z * q.z).sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn z_offset_keeps_orientation() {
        let pose = Pose::new(Vec3::new(0.5, -0.2, 0.1), GRIPPER_DOWN);
        let raised = pose.with_z_offset(0.25);
        assert!((raised.position.z - 0.35).abs() < 1e-6);
        assert_eq!(raised.position.x, 0.5);
        assert_eq!(raised.orientation, GRIPPER_DOWN);
    }
}
