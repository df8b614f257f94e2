//! The splat sample type and its stable 64-bit id encoding.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Number of low bits of a [`SplatId`] holding the within-file index.
///
/// The upper bits hold the input file index, so a single file may contain at
/// most 2^40 splats and a run may reference at most 2^24 files.
pub const SPLAT_ID_SHIFT: u32 = 40;

/// Mask selecting the within-file index of a [`SplatId`].
pub const SPLAT_ID_MASK: u64 = (1u64 << SPLAT_ID_SHIFT) - 1;

/// Stable identifier of a splat: `(file_index << SPLAT_ID_SHIFT) | offset`.
pub type SplatId = u64;

/// Pack a file index and within-file offset into a [`SplatId`].
#[inline]
pub fn make_splat_id(file: usize, offset: u64) -> SplatId {
    debug_assert!(offset <= SPLAT_ID_MASK);
    ((file as u64) << SPLAT_ID_SHIFT) | offset
}

/// Split a [`SplatId`] into `(file_index, offset)`.
#[inline]
pub fn split_splat_id(id: SplatId) -> (usize, u64) {
    ((id >> SPLAT_ID_SHIFT) as usize, id & SPLAT_ID_MASK)
}

/// An oriented disk sample of a surface.
///
/// The layout matches the on-disk vertex record of the input PLY files
/// (seven consecutive little-endian `f32`s), so raw reads can be cast
/// directly with bytemuck.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Splat {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub radius: f32,
}

impl Splat {
    pub fn new(position: Vec3, normal: Vec3, radius: f32) -> Self {
        Splat {
            position: position.to_array(),
            normal: normal.to_array(),
            radius,
        }
    }

    #[inline]
    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    #[inline]
    pub fn normal(&self) -> Vec3 {
        Vec3::from_array(self.normal)
    }

    /// A splat participates in reconstruction only if all seven fields are
    /// finite and the radius is positive. Everything else skips invalid
    /// splats based on this predicate.
    #[inline]
    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
            && self.normal.iter().all(|v| v.is_finite())
            && self.radius.is_finite()
            && self.radius > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trip() {
        let id = make_splat_id(17, 123_456_789);
        assert_eq!(split_splat_id(id), (17, 123_456_789));
        // File 0 ids are plain offsets.
        assert_eq!(make_splat_id(0, 42), 42);
    }

    #[test]
    fn finiteness() {
        let good = Splat::new(Vec3::ONE, Vec3::Z, 0.5);
        assert!(good.is_finite());

        let mut bad = good;
        bad.position[1] = f32::NAN;
        assert!(!bad.is_finite());

        let mut bad = good;
        bad.normal[0] = f32::INFINITY;
        assert!(!bad.is_finite());

        let mut bad = good;
        bad.radius = 0.0;
        assert!(!bad.is_finite());

        let mut bad = good;
        bad.radius = -1.0;
        assert!(!bad.is_finite());
    }
}
