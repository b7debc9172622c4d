//! Ray samplers for the foreground (occupancy-guided) and background
//! (unbounded, inverse-distance parametrized) regions.

use log::debug;
use raysdf_occupancy::OccupancyGrid;
use raysdf_packed::RaySamplesPacked;
use raysdf_utils::tensor::{from_vec_f32, from_vec_i64, to_vec_bool, to_vec_f32, validate_tensor, validate_tensor_type};
use tch::{Kind, Tensor};

use crate::sphere::Sphere;

/// Walks each ray through the occupancy grid and emits a sample every
/// `step_size` while inside occupied voxels, skipping unoccupied stretches
/// with the grid's DDA traversal. Stops on grid exit, on the per-ray budget,
/// or when the shared capacity `nr_rays * max_samples_per_ray` runs out (the
/// affected ray is truncated, not the batch). Deterministic for a fixed grid
/// state and ray batch; the result is already compact.
pub fn compute_samples_fg(
    grid: &OccupancyGrid,
    rays_o: &Tensor,
    rays_d: &Tensor,
    step_size: f64,
    max_samples_per_ray: i64,
) -> RaySamplesPacked {
    let nr_rays = rays_o.size()[0];
    validate_tensor(rays_o, &[nr_rays, 3], "rays_o");
    validate_tensor(rays_d, &[nr_rays, 3], "rays_d");
    validate_tensor_type(rays_o, Kind::Float, "rays_o");
    validate_tensor_type(rays_d, Kind::Float, "rays_d");
    assert!(step_size > 0.0, "step_size must be positive");
    assert!(max_samples_per_ray > 0, "max_samples_per_ray must be positive");

    let traversal = grid.traversal();
    let step = step_size as f32;
    let max_nr_samples = nr_rays * max_samples_per_ray;

    let o_v = to_vec_f32(rays_o);
    let d_v = to_vec_f32(rays_d);

    let mut out_pos: Vec<f32> = Vec::new();
    let mut out_dirs: Vec<f32> = Vec::new();
    let mut out_z: Vec<f32> = Vec::new();
    let mut out_ranges: Vec<i64> = Vec::with_capacity(nr_rays as usize * 2);
    let mut total = 0i64;

    for r in 0..nr_rays as usize {
        let o = [o_v[r * 3], o_v[r * 3 + 1], o_v[r * 3 + 2]];
        let d = [d_v[r * 3], d_v[r * 3 + 1], d_v[r * 3 + 2]];

        out_ranges.push(total);
        let (mut t, mut within) = traversal.next_occupied_t(&o, &d, 0.0, true);
        let mut emitted = 0i64;
        // Each pass either emits a sample or skips ahead, so two iterations
        // per budgeted sample bound the walk.
        let mut guard = 2 * max_samples_per_ray + 4;
        while within && emitted < max_samples_per_ray && total < max_nr_samples && guard > 0 {
            guard -= 1;
            if traversal.occupied_along(&o, &d, t) {
                out_pos.push(o[0] + t * d[0]);
                out_pos.push(o[1] + t * d[1]);
                out_pos.push(o[2] + t * d[2]);
                out_dirs.extend_from_slice(&d);
                out_z.push(t);
                emitted += 1;
                total += 1;
                t += step;
            } else {
                let (t_next, still_within) = traversal.next_occupied_t(&o, &d, t, true);
                t = t_next;
                within = still_within;
            }
        }
        out_ranges.push(total);
    }
    debug!("fg sampling emitted {} samples over {} rays", total, nr_rays);

    let device = rays_o.device();
    let out_dt = vec![step; total as usize];
    RaySamplesPacked {
        samples_pos: from_vec_f32(&out_pos, &[total, 3], device),
        samples_pos_4d: from_vec_f32(&vec![0f32; total as usize * 4], &[total, 4], device),
        samples_dirs: from_vec_f32(&out_dirs, &[total, 3], device),
        samples_z: from_vec_f32(&out_z, &[total, 1], device),
        samples_dt: from_vec_f32(&out_dt, &[total, 1], device),
        samples_sdf: None,
        ray_start_end_idx: from_vec_i64(&out_ranges, &[nr_rays, 2], device),
        ray_fixed_dt: from_vec_f32(&vec![step; nr_rays as usize], &[nr_rays, 1], device),
        max_nr_samples: total,
        cur_nr_samples: total,
        rays_have_equal_nr_of_samples: false,
        fixed_nr_of_samples_per_ray: 0,
    }
}

/// Samples the unbounded region beyond the bounding sphere with depths linear
/// in inverse distance, so a finite per-ray budget still covers geometry out
/// to infinity. The contracted `samples_pos_4d` carries the unit direction
/// from the sphere center plus the inverse radius `t_exit / r`, which tends
/// to 0 with distance. Every ray gets exactly `nr_samples_per_ray` samples;
/// rays missing the sphere fall back to an exit at one radius.
pub fn compute_samples_bg(
    rays_o: &Tensor,
    rays_d: &Tensor,
    sphere: &Sphere,
    nr_samples_per_ray: i64,
) -> RaySamplesPacked {
    let nr_rays = rays_o.size()[0];
    validate_tensor(rays_o, &[nr_rays, 3], "rays_o");
    validate_tensor(rays_d, &[nr_rays, 3], "rays_d");
    validate_tensor_type(rays_o, Kind::Float, "rays_o");
    validate_tensor_type(rays_d, Kind::Float, "rays_d");
    assert!(nr_samples_per_ray > 0, "nr_samples_per_ray must be positive");

    let (_, t_far, hit) = sphere.ray_intersection(rays_o, rays_d);
    let t_far_v = to_vec_f32(&t_far);
    let hit_v = to_vec_bool(&hit);
    let o_v = to_vec_f32(rays_o);
    let d_v = to_vec_f32(rays_d);
    let center = to_vec_f32(&sphere.center);

    let n = nr_samples_per_ray as usize;
    let total = nr_rays * nr_samples_per_ray;
    let mut out_pos = Vec::with_capacity(total as usize * 3);
    let mut out_pos_4d = Vec::with_capacity(total as usize * 4);
    let mut out_dirs = Vec::with_capacity(total as usize * 3);
    let mut out_z = Vec::with_capacity(total as usize);
    let mut out_dt = Vec::with_capacity(total as usize);
    let mut out_ranges = Vec::with_capacity(nr_rays as usize * 2);

    for r in 0..nr_rays as usize {
        let o = [o_v[r * 3], o_v[r * 3 + 1], o_v[r * 3 + 2]];
        let d = [d_v[r * 3], d_v[r * 3 + 1], d_v[r * 3 + 2]];
        let t_exit = if hit_v[r] && t_far_v[r] > 0.0 {
            t_far_v[r]
        } else {
            sphere.radius as f32
        };

        out_ranges.push((r * n) as i64);
        out_ranges.push((r * n + n) as i64);

        let mut z_vals = Vec::with_capacity(n);
        for j in 0..n {
            let u = (j as f32 + 0.5) / n as f32;
            // Linear in inverse depth: u = 0 at the sphere exit, u -> 1 at infinity.
            z_vals.push(t_exit / (1.0 - u));
        }
        for j in 0..n {
            let t = z_vals[j];
            let p = [o[0] + t * d[0], o[1] + t * d[1], o[2] + t * d[2]];
            let rel = [p[0] - center[0], p[1] - center[1], p[2] - center[2]];
            let radius = (rel[0] * rel[0] + rel[1] * rel[1] + rel[2] * rel[2]).sqrt().max(1e-6);
            out_pos.extend_from_slice(&p);
            out_pos_4d.push(rel[0] / radius);
            out_pos_4d.push(rel[1] / radius);
            out_pos_4d.push(rel[2] / radius);
            out_pos_4d.push(t_exit / radius);
            out_dirs.extend_from_slice(&d);
            out_z.push(t);
            let dt = if j + 1 < n {
                z_vals[j + 1] - z_vals[j]
            } else if n > 1 {
                z_vals[n - 1] - z_vals[n - 2]
            } else {
                t_exit
            };
            out_dt.push(dt);
        }
    }
    debug!("bg sampling emitted {} samples over {} rays", total, nr_rays);

    let device = rays_o.device();
    RaySamplesPacked {
        samples_pos: from_vec_f32(&out_pos, &[total, 3], device),
        samples_pos_4d: from_vec_f32(&out_pos_4d, &[total, 4], device),
        samples_dirs: from_vec_f32(&out_dirs, &[total, 3], device),
        samples_z: from_vec_f32(&out_z, &[total, 1], device),
        samples_dt: from_vec_f32(&out_dt, &[total, 1], device),
        samples_sdf: None,
        ray_start_end_idx: from_vec_i64(&out_ranges, &[nr_rays, 2], device),
        ray_fixed_dt: from_vec_f32(&vec![0f32; nr_rays as usize], &[nr_rays, 1], device),
        max_nr_samples: total,
        cur_nr_samples: total,
        rays_have_equal_nr_of_samples: true,
        fixed_nr_of_samples_per_ray: nr_samples_per_ray,
    }
}
