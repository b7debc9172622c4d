use log::debug;
use raysdf_utils::tensor::{
    from_vec_f32, from_vec_i64, to_vec_f32, to_vec_i64, validate_tensor, validate_tensor_type,
};
use tch::{Device, Kind, Tensor};

/// Ragged per-ray sample storage for a batch of rays.
///
/// All per-sample attributes live in flat, preallocated arrays of capacity
/// `max_nr_samples`; `ray_start_end_idx` holds one `(start, end)` pair per ray
/// pointing into them. Within a ray the depths `samples_z` are sorted
/// ascending, and ranges of distinct rays never overlap.
pub struct RaySamplesPacked {
    /// World-space sample positions, `[max_nr_samples, 3]`.
    pub samples_pos: Tensor,
    /// Contracted 4D positions for background samples, `[max_nr_samples, 4]`.
    /// Zero for foreground samples.
    pub samples_pos_4d: Tensor,
    /// Per-sample ray direction, `[max_nr_samples, 3]`.
    pub samples_dirs: Tensor,
    /// Depth along the ray, `[max_nr_samples, 1]`.
    pub samples_z: Tensor,
    /// Integration step assigned at creation time, `[max_nr_samples, 1]`.
    pub samples_dt: Tensor,
    /// Externally evaluated SDF, one scalar per live sample. Attached with
    /// `set_sdf` after the model pass, dropped with `remove_sdf`.
    pub samples_sdf: Option<Tensor>,
    /// Per-ray `(start, end)` index pairs, `[nr_rays, 2]`, int64.
    pub ray_start_end_idx: Tensor,
    /// Per-ray fallback step for the last sample, `[nr_rays, 1]`. Zero when unset.
    pub ray_fixed_dt: Tensor,
    pub max_nr_samples: i64,
    /// Allocation watermark into the flat arrays, including any padding that
    /// `compact_to_valid_samples` removes.
    pub cur_nr_samples: i64,
    pub rays_have_equal_nr_of_samples: bool,
    pub fixed_nr_of_samples_per_ray: i64,
}

impl RaySamplesPacked {
    pub fn new(nr_rays: i64, max_nr_samples: i64, device: Device) -> Self {
        assert!(nr_rays >= 0, "nr_rays must be non-negative");
        assert!(max_nr_samples >= 0, "max_nr_samples must be non-negative");

        RaySamplesPacked {
            samples_pos: Tensor::zeros(&[max_nr_samples, 3], (Kind::Float, device)),
            samples_pos_4d: Tensor::zeros(&[max_nr_samples, 4], (Kind::Float, device)),
            samples_dirs: Tensor::zeros(&[max_nr_samples, 3], (Kind::Float, device)),
            samples_z: Tensor::zeros(&[max_nr_samples, 1], (Kind::Float, device)),
            samples_dt: Tensor::zeros(&[max_nr_samples, 1], (Kind::Float, device)),
            samples_sdf: None,
            ray_start_end_idx: Tensor::zeros(&[nr_rays, 2], (Kind::Int64, device)),
            ray_fixed_dt: Tensor::zeros(&[nr_rays, 1], (Kind::Float, device)),
            max_nr_samples,
            cur_nr_samples: 0,
            rays_have_equal_nr_of_samples: false,
            fixed_nr_of_samples_per_ray: 0,
        }
    }

    pub fn nr_rays(&self) -> i64 {
        self.ray_start_end_idx.size()[0]
    }

    pub fn device(&self) -> Device {
        self.samples_pos.device()
    }

    /// Per-ray `(start, end)` ranges as host values, in ray order.
    pub fn ray_ranges(&self) -> Vec<(usize, usize)> {
        let idx = to_vec_i64(&self.ray_start_end_idx);
        idx.chunks(2).map(|pair| (pair[0] as usize, pair[1] as usize)).collect()
    }

    /// Number of live samples, i.e. the sum of `end - start` over all rays.
    /// Can be smaller than `cur_nr_samples` after filtering.
    pub fn compute_exact_nr_samples(&self) -> i64 {
        self.ray_ranges().iter().map(|&(s, e)| (e - s) as i64).sum()
    }

    /// Seeds exactly one sample per ray at depth `z`, with a fixed step `dt`.
    /// Fast path used by the simple and background sampling schemes.
    pub fn initialize_with_one_sample_per_ray(&mut self, rays_o: &Tensor, rays_d: &Tensor, z: &Tensor, dt: f64) {
        let nr_rays = self.nr_rays();
        validate_tensor(rays_o, &[nr_rays, 3], "rays_o");
        validate_tensor(rays_d, &[nr_rays, 3], "rays_d");
        validate_tensor(z, &[nr_rays, 1], "z");
        validate_tensor_type(rays_o, Kind::Float, "rays_o");
        validate_tensor_type(rays_d, Kind::Float, "rays_d");
        validate_tensor_type(z, Kind::Float, "z");
        assert!(
            nr_rays <= self.max_nr_samples,
            "capacity {} cannot hold one sample for each of {} rays",
            self.max_nr_samples,
            nr_rays
        );

        let pos = rays_o + rays_d * z;
        self.samples_pos.narrow(0, 0, nr_rays).copy_(&pos);
        self.samples_dirs.narrow(0, 0, nr_rays).copy_(rays_d);
        self.samples_z.narrow(0, 0, nr_rays).copy_(z);
        let _ = self.samples_dt.narrow(0, 0, nr_rays).fill_(dt);
        let _ = self.ray_fixed_dt.fill_(dt);

        let mut start_end = Vec::with_capacity(nr_rays as usize * 2);
        for i in 0..nr_rays {
            start_end.push(i);
            start_end.push(i + 1);
        }
        self.ray_start_end_idx
            .copy_(&from_vec_i64(&start_end, &[nr_rays, 2], self.device()));

        self.cur_nr_samples = nr_rays;
        self.rays_have_equal_nr_of_samples = true;
        self.fixed_nr_of_samples_per_ray = 1;
        self.samples_sdf = None;
    }

    /// Attaches one externally evaluated SDF value per live sample, in ray
    /// order. The buffer is indexed by live ordinal, not by flat slot, so it
    /// works on padded structures too.
    pub fn set_sdf(&mut self, values: &Tensor) {
        let nr_samples = self.compute_exact_nr_samples();
        assert_eq!(
            values.numel() as i64,
            nr_samples,
            "sdf values must match the number of live samples ({} vs {})",
            values.numel(),
            nr_samples
        );
        validate_tensor_type(values, Kind::Float, "sdf");
        self.samples_sdf = Some(values.contiguous().view((-1, 1)).to_device(self.device()));
    }

    /// Drops the attached SDF so the buffers can be refilled on the next
    /// evaluation pass.
    pub fn remove_sdf(&mut self) {
        self.samples_sdf = None;
    }

    /// Rewrites the flat arrays so that the live samples of ray `i` directly
    /// follow those of ray `i-1`, with no padding or unused capacity left.
    /// Applying it to an already-compact structure reproduces it exactly.
    pub fn compact_to_valid_samples(&self) -> RaySamplesPacked {
        let ranges = self.ray_ranges();
        let nr_rays = self.nr_rays();
        let total: usize = ranges.iter().map(|&(s, e)| e - s).sum();

        let pos = to_vec_f32(&self.samples_pos);
        let pos_4d = to_vec_f32(&self.samples_pos_4d);
        let dirs = to_vec_f32(&self.samples_dirs);
        let z = to_vec_f32(&self.samples_z);
        let dt = to_vec_f32(&self.samples_dt);
        let sdf = self.samples_sdf.as_ref().map(to_vec_f32);

        let mut out_pos = Vec::with_capacity(total * 3);
        let mut out_pos_4d = Vec::with_capacity(total * 4);
        let mut out_dirs = Vec::with_capacity(total * 3);
        let mut out_z = Vec::with_capacity(total);
        let mut out_dt = Vec::with_capacity(total);
        let mut out_sdf = Vec::with_capacity(if sdf.is_some() { total } else { 0 });
        let mut out_ranges = Vec::with_capacity(nr_rays as usize * 2);

        let mut write_idx = 0usize;
        for &(s, e) in &ranges {
            out_ranges.push(write_idx as i64);
            for i in s..e {
                out_pos.extend_from_slice(&pos[i * 3..i * 3 + 3]);
                out_pos_4d.extend_from_slice(&pos_4d[i * 4..i * 4 + 4]);
                out_dirs.extend_from_slice(&dirs[i * 3..i * 3 + 3]);
                out_z.push(z[i]);
                out_dt.push(dt[i]);
                if let Some(sdf) = &sdf {
                    // The sdf buffer holds one value per live sample, so its
                    // index is the live ordinal, not the flat slot.
                    out_sdf.push(sdf[write_idx]);
                }
                write_idx += 1;
            }
            out_ranges.push(write_idx as i64);
        }
        debug!("compacted ray samples: {} live of {} allocated", total, self.cur_nr_samples);

        let device = self.device();
        let total = total as i64;
        RaySamplesPacked {
            samples_pos: from_vec_f32(&out_pos, &[total, 3], device),
            samples_pos_4d: from_vec_f32(&out_pos_4d, &[total, 4], device),
            samples_dirs: from_vec_f32(&out_dirs, &[total, 3], device),
            samples_z: from_vec_f32(&out_z, &[total, 1], device),
            samples_dt: from_vec_f32(&out_dt, &[total, 1], device),
            samples_sdf: sdf.map(|_| from_vec_f32(&out_sdf, &[total, 1], device)),
            ray_start_end_idx: from_vec_i64(&out_ranges, &[nr_rays, 2], device),
            ray_fixed_dt: self.ray_fixed_dt.shallow_clone(),
            max_nr_samples: total,
            cur_nr_samples: total,
            rays_have_equal_nr_of_samples: self.rays_have_equal_nr_of_samples,
            fixed_nr_of_samples_per_ray: self.fixed_nr_of_samples_per_ray,
        }
    }
}
