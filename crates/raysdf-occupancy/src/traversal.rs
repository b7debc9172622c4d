//! Voxel-grid geometry and ray traversal kernels.
//!
//! The traversal is a 3D DDA (Amanatides-Woo): from the voxel containing the
//! current position, step through voxel boundaries in order of increasing
//! parametric distance until an occupied voxel is entered or the ray leaves
//! the grid bounds.

/// Nudge applied, in units of voxel size, when deciding which voxel a
/// parametric position belongs to. Keeps boundary samples on the entered side.
const BOUNDARY_NUDGE: f32 = 1e-4;

/// Affine mapping between world space and the cubic voxel lattice.
#[derive(Clone, Copy)]
pub struct GridGeometry {
    pub res: i64,
    pub voxel_size: f32,
    pub min: [f32; 3],
}

impl GridGeometry {
    pub fn new(res: i64, extent: f32, center: [f32; 3]) -> Self {
        let half = extent / 2.0;
        GridGeometry {
            res,
            voxel_size: extent / res as f32,
            min: [center[0] - half, center[1] - half, center[2] - half],
        }
    }

    pub fn nr_voxels(&self) -> usize {
        (self.res * self.res * self.res) as usize
    }

    /// Flat index of the voxel holding `p`, or `None` when out of bounds.
    pub fn voxel_of_point(&self, p: &[f32; 3]) -> Option<usize> {
        let mut coords = [0i64; 3];
        for axis in 0..3 {
            let local = (p[axis] - self.min[axis]) / self.voxel_size;
            if local < 0.0 || local >= self.res as f32 {
                return None;
            }
            coords[axis] = local as i64;
        }
        Some(self.linear_idx(coords[0], coords[1], coords[2]))
    }

    pub fn linear_idx(&self, ix: i64, iy: i64, iz: i64) -> usize {
        ((ix * self.res + iy) * self.res + iz) as usize
    }

    /// Center of the voxel with the given flat index.
    pub fn voxel_center(&self, idx: usize) -> [f32; 3] {
        let idx = idx as i64;
        let iz = idx % self.res;
        let iy = (idx / self.res) % self.res;
        let ix = idx / (self.res * self.res);
        [
            self.min[0] + (ix as f32 + 0.5) * self.voxel_size,
            self.min[1] + (iy as f32 + 0.5) * self.voxel_size,
            self.min[2] + (iz as f32 + 0.5) * self.voxel_size,
        ]
    }

    /// Slab test against the grid bounds. Returns the parametric interval
    /// `(t_near, t_far)` of the overlap, or `None` when the ray misses.
    /// `t_near` is clamped to zero for origins inside the box.
    pub fn ray_box_intersection(&self, o: &[f32; 3], d: &[f32; 3]) -> Option<(f32, f32)> {
        let mut t_near = 0.0f32;
        let mut t_far = f32::INFINITY;
        for axis in 0..3 {
            let lo = self.min[axis];
            let hi = self.min[axis] + self.res as f32 * self.voxel_size;
            if d[axis].abs() < 1e-9 {
                if o[axis] < lo || o[axis] > hi {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / d[axis];
            let mut t0 = (lo - o[axis]) * inv;
            let mut t1 = (hi - o[axis]) * inv;
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
            }
            t_near = t_near.max(t0);
            t_far = t_far.min(t1);
            if t_near > t_far {
                return None;
            }
        }
        Some((t_near, t_far))
    }
}

/// Host-side snapshot of a grid's occupancy, taken once per batched operation
/// so the per-ray kernels run over plain slices.
pub struct GridTraversal {
    geometry: GridGeometry,
    occupancy: Vec<bool>,
}

impl GridTraversal {
    pub fn new(geometry: GridGeometry, occupancy: Vec<bool>) -> Self {
        assert_eq!(occupancy.len(), geometry.nr_voxels(), "occupancy snapshot has the wrong size");
        GridTraversal { geometry, occupancy }
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    /// Whether the position at parametric distance `t` (nudged slightly
    /// forward) lies in an occupied voxel. Out of bounds counts as free.
    pub fn occupied_along(&self, o: &[f32; 3], d: &[f32; 3], t: f32) -> bool {
        let t = t + BOUNDARY_NUDGE * self.geometry.voxel_size;
        let p = [o[0] + t * d[0], o[1] + t * d[1], o[2] + t * d[2]];
        match self.geometry.voxel_of_point(&p) {
            Some(idx) => self.occupancy[idx],
            None => false,
        }
    }

    /// Advances `t` to the entry of the next occupied voxel along the ray.
    ///
    /// Returns `(t_new, true)` when an occupied voxel was entered and
    /// `(t_exit, false)` when the ray left the grid (or missed it entirely).
    /// With `include_current` the voxel containing `t` itself is also
    /// accepted; a ray still outside the grid always has its entry voxel
    /// checked. The walk is bounded by `3 * res + 2` boundary crossings so
    /// degenerate directions cannot loop forever.
    pub fn next_occupied_t(&self, o: &[f32; 3], d: &[f32; 3], t: f32, include_current: bool) -> (f32, bool) {
        let geo = &self.geometry;
        let (t_near, t_far) = match geo.ray_box_intersection(o, d) {
            Some(range) => range,
            None => return (t, false),
        };

        let mut t = t;
        let mut check_entry = include_current;
        if t < t_near {
            // Jump to the grid boundary; the entry voxel counts as "next".
            t = t_near;
            check_entry = true;
        }
        if t > t_far {
            return (t, false);
        }
        if check_entry && self.occupied_along(o, d, t) {
            return (t, true);
        }

        // DDA setup from the nudged current position.
        let t_probe = t + BOUNDARY_NUDGE * geo.voxel_size;
        let p = [o[0] + t_probe * d[0], o[1] + t_probe * d[1], o[2] + t_probe * d[2]];
        let mut coords = [0i64; 3];
        for axis in 0..3 {
            let local = ((p[axis] - geo.min[axis]) / geo.voxel_size).floor();
            coords[axis] = (local as i64).clamp(0, geo.res - 1);
        }

        let mut step = [0i64; 3];
        let mut t_max = [f32::INFINITY; 3];
        let mut t_delta = [f32::INFINITY; 3];
        for axis in 0..3 {
            if d[axis].abs() < 1e-9 {
                continue;
            }
            step[axis] = if d[axis] > 0.0 { 1 } else { -1 };
            let next_boundary =
                geo.min[axis] + (coords[axis] + i64::from(d[axis] > 0.0)) as f32 * geo.voxel_size;
            t_max[axis] = (next_boundary - o[axis]) / d[axis];
            t_delta[axis] = geo.voxel_size / d[axis].abs();
        }

        let max_steps = 3 * geo.res + 2;
        for _ in 0..max_steps {
            let axis = if t_max[0] <= t_max[1] && t_max[0] <= t_max[2] {
                0
            } else if t_max[1] <= t_max[2] {
                1
            } else {
                2
            };
            t = t_max[axis];
            coords[axis] += step[axis];
            t_max[axis] += t_delta[axis];
            if coords[axis] < 0 || coords[axis] >= geo.res || t > t_far {
                return (t.min(t_far), false);
            }
            if self.occupancy[geo.linear_idx(coords[0], coords[1], coords[2])] {
                return (t, true);
            }
        }
        (t_far, false)
    }
}
