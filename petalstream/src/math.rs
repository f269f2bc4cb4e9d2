//! Math types for PetalStream

pub use glam::{Quat, Vec3};

/// Position and orientation of the listener.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Pose {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn identity() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation * (-Vec3::Z)
    }

    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    /// Direction to `target` expressed in the listener's right/up/forward frame.
    ///
    /// Returns `Vec3::ZERO` when the target sits on the listener.
    pub fn local_direction_to(&self, target: Vec3) -> Vec3 {
        let world = (target - self.position).normalize_or_zero();
        Vec3::new(
            world.dot(self.right()),
            world.dot(self.up()),
            world.dot(self.forward()),
        )
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_axes() {
        let pose = Pose::identity();
        assert_eq!(pose.forward(), -Vec3::Z);
        assert_eq!(pose.up(), Vec3::Y);
        assert_eq!(pose.right(), Vec3::X);
    }

    #[test]
    fn test_local_direction() {
        let pose = Pose::from_position(Vec3::new(1.0, 0.0, 0.0));
        let dir = pose.local_direction_to(Vec3::new(1.0, 0.0, -5.0));
        assert!((dir.z - 1.0).abs() < 1e-6);
        assert_eq!(pose.local_direction_to(pose.position), Vec3::ZERO);
    }
}
