//! Axis-aligned bounding box used as a node's bounding volume

use crate::core::types::Vec3;

/// Axis-aligned bounding box defined by min and max corners
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Create AABB from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create a cube centred on `center` with edge length `2 * half`
    pub fn cube(center: Vec3, half: f32) -> Self {
        Self::from_center_half_extent(center, Vec3::splat(half))
    }

    /// Create AABB from center and half-extents
    pub fn from_center_half_extent(center: Vec3, half_extent: Vec3) -> Self {
        Self {
            min: center - half_extent,
            max: center + half_extent,
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn half_extent(&self) -> Vec3 {
        self.size() * 0.5
    }

    /// Radius of the bounding sphere around the box
    pub fn radius(&self) -> f32 {
        self.half_extent().length()
    }

    /// Check if point is inside AABB (inclusive)
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    /// Child octant AABB for octree subdivision.
    /// `index` bit 0 selects +x, bit 1 selects +y, bit 2 selects +z.
    pub fn child_octant(&self, index: u8) -> Aabb {
        let center = self.center();
        let half = self.half_extent() * 0.5;

        let offset = Vec3::new(
            if index & 1 != 0 { half.x } else { -half.x },
            if index & 2 != 0 { half.y } else { -half.y },
            if index & 4 != 0 { half.z } else { -half.z },
        );

        Aabb::from_center_half_extent(center + offset, half)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radius() {
        let aabb = Aabb::cube(Vec3::ZERO, 1.0);
        assert!((aabb.radius() - 3.0_f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_contains_point() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert!(aabb.contains_point(Vec3::splat(0.5)));
        assert!(aabb.contains_point(Vec3::ONE));
        assert!(!aabb.contains_point(Vec3::new(0.5, 1.5, 0.5)));
    }

    #[test]
    fn test_child_octant_halves_radius() {
        let parent = Aabb::new(Vec3::ZERO, Vec3::splat(2.0));
        for octant in 0..8 {
            let child = parent.child_octant(octant);
            assert!((child.radius() * 2.0 - parent.radius()).abs() < 1e-5);
            assert!(parent.contains_point(child.center()));
        }
        let far = parent.child_octant(7);
        assert_eq!(far.min, Vec3::ONE);
        assert_eq!(far.max, Vec3::splat(2.0));
    }
}
