use log::debug;
use rand::Rng;
use raysdf_packed::RaySamplesPacked;
use raysdf_utils::tensor::{
    from_vec_bool, from_vec_f32, from_vec_i64, to_vec_bool, to_vec_f32, to_vec_i64,
    validate_tensor, validate_tensor_type,
};
use tch::{Device, Kind, Tensor};

use crate::traversal::{GridGeometry, GridTraversal};

/// Blend factor of the exponential moving average applied on every update.
const VALUE_DECAY: f32 = 0.9;
/// A voxel is occupied when its averaged density exceeds this.
const DENSITY_OCCUPANCY_THRESHOLD: f32 = 1e-3;
/// Threshold for the SDF-derived occupancy proxy, which peaks at 1 on the
/// zero crossing.
const SDF_OCCUPANCY_THRESHOLD: f32 = 1e-2;

/// Dense cubic voxel grid marking which regions of the scene contain visible
/// geometry. Sampling reads the `occupied` flags to skip empty space; the
/// flags are refreshed periodically from an externally evaluated density or
/// SDF field.
pub struct OccupancyGrid {
    nr_voxels_per_dim: i64,
    grid_extent: f64,
    grid_center: Tensor,
    grid_values: Tensor,
    grid_occupancy: Tensor,
}

impl OccupancyGrid {
    pub fn new(nr_voxels_per_dim: i64, grid_extent: f64, grid_center: &Tensor) -> Self {
        assert!(nr_voxels_per_dim > 0, "nr_voxels_per_dim must be positive");
        assert!(grid_extent > 0.0, "grid_extent must be positive");
        validate_tensor(grid_center, &[3], "grid_center");
        validate_tensor_type(grid_center, Kind::Float, "grid_center");

        let device = grid_center.device();
        OccupancyGrid {
            nr_voxels_per_dim,
            grid_extent,
            grid_center: grid_center.contiguous(),
            grid_values: Self::make_grid_values(nr_voxels_per_dim, device),
            grid_occupancy: Self::make_grid_occupancy(nr_voxels_per_dim, device),
        }
    }

    pub fn make_grid_values(nr_voxels_per_dim: i64, device: Device) -> Tensor {
        let nr_voxels = nr_voxels_per_dim * nr_voxels_per_dim * nr_voxels_per_dim;
        Tensor::zeros(&[nr_voxels], (Kind::Float, device))
    }

    pub fn make_grid_occupancy(nr_voxels_per_dim: i64, device: Device) -> Tensor {
        let nr_voxels = nr_voxels_per_dim * nr_voxels_per_dim * nr_voxels_per_dim;
        Tensor::zeros(&[nr_voxels], (Kind::Bool, device))
    }

    pub fn get_nr_voxels(&self) -> i64 {
        self.nr_voxels_per_dim * self.nr_voxels_per_dim * self.nr_voxels_per_dim
    }

    pub fn get_nr_voxels_per_dim(&self) -> i64 {
        self.nr_voxels_per_dim
    }

    pub fn get_grid_extent(&self) -> f64 {
        self.grid_extent
    }

    pub fn get_grid_center(&self) -> Tensor {
        self.grid_center.shallow_clone()
    }

    pub fn get_grid_values(&self) -> Tensor {
        self.grid_values.shallow_clone()
    }

    pub fn get_grid_occupancy(&self) -> Tensor {
        self.grid_occupancy.shallow_clone()
    }

    pub fn set_grid_values(&mut self, values: &Tensor) {
        assert_eq!(
            values.numel() as i64,
            self.get_nr_voxels(),
            "grid values must cover every voxel ({} vs {})",
            values.numel(),
            self.get_nr_voxels()
        );
        validate_tensor_type(values, Kind::Float, "grid_values");
        self.grid_values = values.contiguous().view(-1).to_device(self.grid_center.device());
    }

    pub fn set_grid_occupancy(&mut self, occupancy: &Tensor) {
        assert_eq!(
            occupancy.numel() as i64,
            self.get_nr_voxels(),
            "grid occupancy must cover every voxel ({} vs {})",
            occupancy.numel(),
            self.get_nr_voxels()
        );
        validate_tensor_type(occupancy, Kind::Bool, "grid_occupancy");
        self.grid_occupancy = occupancy.contiguous().view(-1).to_device(self.grid_center.device());
    }

    pub fn geometry(&self) -> GridGeometry {
        let center = to_vec_f32(&self.grid_center);
        GridGeometry::new(
            self.nr_voxels_per_dim,
            self.grid_extent as f32,
            [center[0], center[1], center[2]],
        )
    }

    /// Snapshot of the occupancy flags for the ray-traversal kernels.
    pub fn traversal(&self) -> GridTraversal {
        GridTraversal::new(self.geometry(), to_vec_bool(&self.grid_occupancy))
    }

    /// World-space centers of all voxels, `[nr_voxels, 3]`, in flat-index order.
    pub fn compute_grid_points(&self) -> Tensor {
        let geometry = self.geometry();
        let nr_voxels = geometry.nr_voxels();
        let mut points = Vec::with_capacity(nr_voxels * 3);
        for idx in 0..nr_voxels {
            points.extend_from_slice(&geometry.voxel_center(idx));
        }
        from_vec_f32(&points, &[nr_voxels as i64, 3], self.grid_center.device())
    }

    /// Draws `nr_points` voxels uniformly (with replacement) from the seeded
    /// generator and returns their centers together with their flat indices.
    /// With `jitter` each point is placed uniformly inside its voxel instead,
    /// so repeated updates probe different locations.
    pub fn compute_random_sample_of_grid_points<R: Rng>(
        &self,
        nr_points: i64,
        jitter: bool,
        rng: &mut R,
    ) -> (Tensor, Tensor) {
        assert!(nr_points > 0, "nr_points must be positive");
        let geometry = self.geometry();
        let nr_voxels = geometry.nr_voxels();

        let mut points = Vec::with_capacity(nr_points as usize * 3);
        let mut indices = Vec::with_capacity(nr_points as usize);
        for _ in 0..nr_points {
            let idx = rng.gen_range(0..nr_voxels);
            let mut p = geometry.voxel_center(idx);
            if jitter {
                for coord in &mut p {
                    *coord += (rng.gen::<f32>() - 0.5) * geometry.voxel_size;
                }
            }
            points.extend_from_slice(&p);
            indices.push(idx as i64);
        }

        let device = self.grid_center.device();
        (
            from_vec_f32(&points, &[nr_points, 3], device),
            from_vec_i64(&indices, &[nr_points], device),
        )
    }

    /// Occupancy flag of the voxel enclosing each point; out-of-bounds points
    /// report unoccupied.
    pub fn check_occupancy(&self, points: &Tensor) -> Tensor {
        let nr_points = points.size()[0];
        validate_tensor(points, &[nr_points, 3], "points");
        validate_tensor_type(points, Kind::Float, "points");

        let geometry = self.geometry();
        let occupancy = to_vec_bool(&self.grid_occupancy);
        let points_v = to_vec_f32(points);
        let mut out = Vec::with_capacity(nr_points as usize);
        for p in points_v.chunks(3) {
            let occupied = geometry
                .voxel_of_point(&[p[0], p[1], p[2]])
                .map(|idx| occupancy[idx])
                .unwrap_or(false);
            out.push(occupied);
        }
        from_vec_bool(&out, &[nr_points, 1], points.device())
    }

    fn apply_update(&mut self, updates: &[(usize, f32)], threshold: f32) {
        let mut values = to_vec_f32(&self.grid_values);
        let mut occupancy = to_vec_bool(&self.grid_occupancy);
        for &(idx, signal) in updates {
            values[idx] = VALUE_DECAY * values[idx] + (1.0 - VALUE_DECAY) * signal;
            occupancy[idx] = values[idx] > threshold;
        }
        let nr_occupied = occupancy.iter().filter(|&&o| o).count();
        debug!(
            "occupancy update touched {} voxels, {} of {} now occupied",
            updates.len(),
            nr_occupied,
            occupancy.len()
        );

        let device = self.grid_center.device();
        let nr_voxels = self.get_nr_voxels();
        self.grid_values = from_vec_f32(&values, &[nr_voxels], device);
        self.grid_occupancy = from_vec_bool(&occupancy, &[nr_voxels], device);
    }

    /// Folds a freshly evaluated density at every voxel center into the grid
    /// and rethresholds the occupancy flags.
    pub fn update_with_density(&mut self, density: &Tensor) {
        assert_eq!(
            density.numel() as i64,
            self.get_nr_voxels(),
            "density must cover every voxel ({} vs {})",
            density.numel(),
            self.get_nr_voxels()
        );
        validate_tensor_type(density, Kind::Float, "density");

        let density = to_vec_f32(density);
        let updates: Vec<(usize, f32)> = density.iter().copied().enumerate().collect();
        self.apply_update(&updates, DENSITY_OCCUPANCY_THRESHOLD);
    }

    /// Density update restricted to the voxels named by `indices`, typically
    /// the output of `compute_random_sample_of_grid_points`.
    pub fn update_with_density_random_sample(&mut self, density: &Tensor, indices: &Tensor) {
        let nr_points = density.numel() as i64;
        assert_eq!(
            indices.numel() as i64,
            nr_points,
            "density and indices must pair up ({} vs {})",
            nr_points,
            indices.numel()
        );
        validate_tensor_type(density, Kind::Float, "density");
        validate_tensor_type(indices, Kind::Int64, "indices");

        let density = to_vec_f32(density);
        let indices = to_vec_i64(indices);
        let nr_voxels = self.get_nr_voxels();
        let updates: Vec<(usize, f32)> = indices
            .iter()
            .zip(density.iter())
            .map(|(&idx, &d)| {
                assert!(idx >= 0 && idx < nr_voxels, "voxel index {} out of range", idx);
                (idx as usize, d)
            })
            .collect();
        self.apply_update(&updates, DENSITY_OCCUPANCY_THRESHOLD);
    }

    /// SDF update at every voxel center. The SDF is mapped to an occupancy
    /// proxy in `(0, 1]` that peaks on the zero crossing and falls off with
    /// the (possibly learned) sharpness `inv_scale`.
    pub fn update_with_sdf(&mut self, sdf: &Tensor, inv_scale: f64) {
        assert_eq!(
            sdf.numel() as i64,
            self.get_nr_voxels(),
            "sdf must cover every voxel ({} vs {})",
            sdf.numel(),
            self.get_nr_voxels()
        );
        validate_tensor_type(sdf, Kind::Float, "sdf");

        let sdf = to_vec_f32(sdf);
        let updates: Vec<(usize, f32)> = sdf
            .iter()
            .enumerate()
            .map(|(idx, &d)| (idx, sdf_occupancy_proxy(d, inv_scale as f32)))
            .collect();
        self.apply_update(&updates, SDF_OCCUPANCY_THRESHOLD);
    }

    /// SDF update restricted to a voxel subsample.
    pub fn update_with_sdf_random_sample(&mut self, sdf: &Tensor, indices: &Tensor, inv_scale: f64) {
        let nr_points = sdf.numel() as i64;
        assert_eq!(
            indices.numel() as i64,
            nr_points,
            "sdf and indices must pair up ({} vs {})",
            nr_points,
            indices.numel()
        );
        validate_tensor_type(sdf, Kind::Float, "sdf");
        validate_tensor_type(indices, Kind::Int64, "indices");

        let sdf = to_vec_f32(sdf);
        let indices = to_vec_i64(indices);
        let nr_voxels = self.get_nr_voxels();
        let updates: Vec<(usize, f32)> = indices
            .iter()
            .zip(sdf.iter())
            .map(|(&idx, &d)| {
                assert!(idx >= 0 && idx < nr_voxels, "voxel index {} out of range", idx);
                (idx as usize, sdf_occupancy_proxy(d, inv_scale as f32))
            })
            .collect();
        self.apply_update(&updates, SDF_OCCUPANCY_THRESHOLD);
    }

    /// SDF update at externally chosen positions; each point lands in its
    /// enclosing voxel, points outside the grid are ignored.
    pub fn update_with_sdf_positions(&mut self, positions: &Tensor, sdf: &Tensor, inv_scale: f64) {
        let nr_points = positions.size()[0];
        validate_tensor(positions, &[nr_points, 3], "positions");
        validate_tensor_type(positions, Kind::Float, "positions");
        assert_eq!(
            sdf.numel() as i64,
            nr_points,
            "one sdf value per position required ({} vs {})",
            sdf.numel(),
            nr_points
        );
        validate_tensor_type(sdf, Kind::Float, "sdf");

        let geometry = self.geometry();
        let positions = to_vec_f32(positions);
        let sdf = to_vec_f32(sdf);
        let updates: Vec<(usize, f32)> = positions
            .chunks(3)
            .zip(sdf.iter())
            .filter_map(|(p, &d)| {
                geometry
                    .voxel_of_point(&[p[0], p[1], p[2]])
                    .map(|idx| (idx, sdf_occupancy_proxy(d, inv_scale as f32)))
            })
            .collect();
        self.apply_update(&updates, SDF_OCCUPANCY_THRESHOLD);
    }

    /// Keeps only the samples that fall in occupied voxels, returning a
    /// compact structure with recomputed per-ray ranges.
    pub fn compute_samples_in_occupied_regions(&self, samples: &RaySamplesPacked) -> RaySamplesPacked {
        let geometry = self.geometry();
        let occupancy = to_vec_bool(&self.grid_occupancy);

        let ranges = samples.ray_ranges();
        let pos = to_vec_f32(&samples.samples_pos);
        let pos_4d = to_vec_f32(&samples.samples_pos_4d);
        let dirs = to_vec_f32(&samples.samples_dirs);
        let z = to_vec_f32(&samples.samples_z);
        let dt = to_vec_f32(&samples.samples_dt);
        let sdf = samples.samples_sdf.as_ref().map(to_vec_f32);

        let mut out_pos = Vec::new();
        let mut out_pos_4d = Vec::new();
        let mut out_dirs = Vec::new();
        let mut out_z = Vec::new();
        let mut out_dt = Vec::new();
        let mut out_sdf = Vec::new();
        let mut out_ranges = Vec::with_capacity(ranges.len() * 2);

        let mut write_idx = 0i64;
        // The sdf buffer holds one value per live input sample, indexed by
        // live ordinal rather than flat slot.
        let mut live_idx = 0usize;
        for &(s, e) in &ranges {
            out_ranges.push(write_idx);
            for i in s..e {
                let sdf_idx = live_idx;
                live_idx += 1;
                let p = [pos[i * 3], pos[i * 3 + 1], pos[i * 3 + 2]];
                let keep = geometry
                    .voxel_of_point(&p)
                    .map(|idx| occupancy[idx])
                    .unwrap_or(false);
                if !keep {
                    continue;
                }
                out_pos.extend_from_slice(&pos[i * 3..i * 3 + 3]);
                out_pos_4d.extend_from_slice(&pos_4d[i * 4..i * 4 + 4]);
                out_dirs.extend_from_slice(&dirs[i * 3..i * 3 + 3]);
                out_z.push(z[i]);
                out_dt.push(dt[i]);
                if let Some(sdf) = &sdf {
                    out_sdf.push(sdf[sdf_idx]);
                }
                write_idx += 1;
            }
            out_ranges.push(write_idx);
        }

        let device = samples.device();
        let total = write_idx;
        RaySamplesPacked {
            samples_pos: from_vec_f32(&out_pos, &[total, 3], device),
            samples_pos_4d: from_vec_f32(&out_pos_4d, &[total, 4], device),
            samples_dirs: from_vec_f32(&out_dirs, &[total, 3], device),
            samples_z: from_vec_f32(&out_z, &[total, 1], device),
            samples_dt: from_vec_f32(&out_dt, &[total, 1], device),
            samples_sdf: sdf.map(|_| from_vec_f32(&out_sdf, &[total, 1], device)),
            ray_start_end_idx: from_vec_i64(&out_ranges, &[ranges.len() as i64, 2], device),
            ray_fixed_dt: samples.ray_fixed_dt.shallow_clone(),
            max_nr_samples: total,
            cur_nr_samples: total,
            rays_have_equal_nr_of_samples: false,
            fixed_nr_of_samples_per_ray: 0,
        }
    }

    /// Entry distance of each ray into the first occupied voxel along it.
    /// Returns `(t, hit)`; `t` is left at zero for rays that never reach an
    /// occupied voxel.
    pub fn compute_first_sample_start_of_occupied_regions(
        &self,
        rays_o: &Tensor,
        rays_d: &Tensor,
    ) -> (Tensor, Tensor) {
        let nr_rays = rays_o.size()[0];
        validate_tensor(rays_o, &[nr_rays, 3], "rays_o");
        validate_tensor(rays_d, &[nr_rays, 3], "rays_d");
        validate_tensor_type(rays_o, Kind::Float, "rays_o");
        validate_tensor_type(rays_d, Kind::Float, "rays_d");

        let traversal = self.traversal();
        let o_v = to_vec_f32(rays_o);
        let d_v = to_vec_f32(rays_d);
        let mut t_out = vec![0f32; nr_rays as usize];
        let mut hit_out = vec![false; nr_rays as usize];
        for r in 0..nr_rays as usize {
            let o = [o_v[r * 3], o_v[r * 3 + 1], o_v[r * 3 + 2]];
            let d = [d_v[r * 3], d_v[r * 3 + 1], d_v[r * 3 + 2]];
            let (t, within) = traversal.next_occupied_t(&o, &d, 0.0, true);
            if within {
                t_out[r] = t;
                hit_out[r] = true;
            }
        }

        let device = rays_o.device();
        (
            from_vec_f32(&t_out, &[nr_rays, 1], device),
            from_vec_bool(&hit_out, &[nr_rays, 1], device),
        )
    }

    /// Steps each ray from its current `t` through voxel boundaries until the
    /// next occupied voxel or the grid boundary. Returns the advanced `t` and
    /// a flag that is false once the ray has exited.
    pub fn advance_sample_to_next_occupied_voxel(
        &self,
        rays_o: &Tensor,
        rays_d: &Tensor,
        t: &Tensor,
    ) -> (Tensor, Tensor) {
        let nr_rays = rays_o.size()[0];
        validate_tensor(rays_o, &[nr_rays, 3], "rays_o");
        validate_tensor(rays_d, &[nr_rays, 3], "rays_d");
        validate_tensor(t, &[nr_rays, 1], "t");
        validate_tensor_type(rays_o, Kind::Float, "rays_o");
        validate_tensor_type(rays_d, Kind::Float, "rays_d");
        validate_tensor_type(t, Kind::Float, "t");

        let traversal = self.traversal();
        let o_v = to_vec_f32(rays_o);
        let d_v = to_vec_f32(rays_d);
        let t_v = to_vec_f32(t);
        let mut t_out = vec![0f32; nr_rays as usize];
        let mut within_out = vec![false; nr_rays as usize];
        for r in 0..nr_rays as usize {
            let o = [o_v[r * 3], o_v[r * 3 + 1], o_v[r * 3 + 2]];
            let d = [d_v[r * 3], d_v[r * 3 + 1], d_v[r * 3 + 2]];
            let (t_new, within) = traversal.next_occupied_t(&o, &d, t_v[r], false);
            t_out[r] = t_new;
            within_out[r] = within;
        }

        let device = rays_o.device();
        (
            from_vec_f32(&t_out, &[nr_rays, 1], device),
            from_vec_bool(&within_out, &[nr_rays, 1], device),
        )
    }
}

/// Normalized logistic-density transform `sech^2(inv_scale * sdf / 2)`:
/// 1 exactly on the surface, falling towards 0 away from it. Written with
/// `cosh` so large arguments saturate to 0 instead of overflowing.
fn sdf_occupancy_proxy(sdf: f32, inv_scale: f32) -> f32 {
    let c = (0.5 * inv_scale * sdf).cosh();
    1.0 / (c * c)
}
