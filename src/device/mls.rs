//! Implicit field evaluation over slab images.
//!
//! The field program is a plug-in: the marching stage only needs a signed
//! scalar per grid corner, with NaN marking corners that have no splat
//! support. The reference program fits an algebraic sphere to the splats
//! around each corner (weighted by a compact quartic kernel over each
//! splat's support) and evaluates it there; where the neighborhood is
//! planar the fit degenerates to a weighted plane distance.

use glam::Vec3;
use rayon::prelude::*;

use crate::grid::Grid;
use crate::splat::Splat;

use super::SplatOctree;

/// Fills one z-plane of field values.
pub trait FieldProgram: Send + Sync {
    /// Evaluate the field at every corner `(x, y, z)` of the bin grid for
    /// the given local z-plane, writing row-major into `out`
    /// (`width * height` corners). A corner with no support is NaN.
    fn eval_slab(
        &self,
        splats: &[Splat],
        octree: &SplatOctree,
        grid: &Grid,
        z: u64,
        out: &mut [f32],
    );
}

/// Relative variance below which the sphere fit falls back to a plane.
const PLANAR_EPS: f32 = 1e-6;

/// Moving-least-squares field: an algebraic sphere fitted to the
/// neighborhood, negative inside and positive outside along the splat
/// normals. The support of every splat is its radius; radius scaling
/// happens once at input time so bucketing, the octree and this kernel
/// agree on footprints.
#[derive(Debug, Clone, Copy, Default)]
pub struct MlsProgram;

impl MlsProgram {
    /// Fit and evaluate at `p`. Splat positions are taken relative to `p`,
    /// which keeps the normal equations conditioned for distant grids and
    /// makes the field value the fitted function's constant term.
    #[inline]
    fn eval_point(&self, splats: &[Splat], octree: &SplatOctree, corner: [u64; 3], p: Vec3) -> f32 {
        let mut sw = 0.0f32;
        let mut swq = Vec3::ZERO;
        let mut swn = Vec3::ZERO;
        let mut swqn = 0.0f32;
        let mut swqq = 0.0f32;
        octree.visit(corner, |r| {
            let splat = &splats[r as usize];
            let support = splat.radius;
            let q = splat.position() - p;
            let d2 = q.length_squared();
            if d2 < support * support {
                let u = 1.0 - d2 / (support * support);
                let w = u * u * u * u;
                let n = splat.normal();
                sw += w;
                swq += w * q;
                swn += w * n;
                swqn += w * q.dot(n);
                swqq += w * d2;
            }
        });
        if sw <= 0.0 {
            return f32::NAN;
        }

        // Weighted normal equations of the algebraic sphere
        // f(x) = u0 + u123.x + u4 |x|^2 in the corner-local frame.
        let denom = swqq - swq.length_squared() / sw;
        let num = swqn - swq.dot(swn) / sw;
        let u4 = if denom > PLANAR_EPS * swqq {
            0.5 * num / denom
        } else {
            0.0
        };
        let u123 = (swn - 2.0 * u4 * swq) / sw;
        let u0 = -(u123.dot(swq) + u4 * swqq) / sw;
        u0
    }
}

impl FieldProgram for MlsProgram {
    fn eval_slab(
        &self,
        splats: &[Splat],
        octree: &SplatOctree,
        grid: &Grid,
        z: u64,
        out: &mut [f32],
    ) {
        let width = grid.num_vertices(0) as usize;
        let height = grid.num_vertices(1) as usize;
        debug_assert_eq!(out.len(), width * height);
        let lo = [grid.extent(0).0, grid.extent(1).0, grid.extent(2).0];

        out.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
            debug_assert!(y < height);
            for (x, value) in row.iter_mut().enumerate() {
                let corner = [lo[0] + x as i64, lo[1] + y as i64, lo[2] + z as i64];
                let p = grid.vertex_world(corner);
                *value = self.eval_point(splats, octree, [x as u64, y as u64, z], p);
            }
        });
    }
}
