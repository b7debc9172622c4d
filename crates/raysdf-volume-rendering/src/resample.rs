//! Hierarchical resampling: per-ray CDF construction, inverse-CDF importance
//! sampling, and merging of uniform and importance sample sets.

use log::debug;
use rand::Rng;
use raysdf_packed::RaySamplesPacked;
use raysdf_utils::tensor::{from_vec_f32, from_vec_i64, to_vec_f32};
use tch::Tensor;

use crate::forward::{dt_kernel, validate_per_sample};

/// Per-ray piecewise-constant CDF over the integration weights, normalized to
/// end at 1. Rays with (near) zero total mass fall back to a uniform CDF so
/// inversion stays well defined.
pub fn compute_cdf(samples: &RaySamplesPacked, weights: &Tensor) -> Tensor {
    validate_per_sample(samples, weights, 1, "weights");

    let weights_v = to_vec_f32(weights);
    let ranges = samples.ray_ranges();
    let mut cdf = vec![0f32; weights_v.len()];
    for &(s, e) in &ranges {
        let count = e - s;
        if count == 0 {
            continue;
        }
        let total: f32 = weights_v[s..e].iter().map(|w| w.max(0.0)).sum();
        if total < 1e-8 {
            for i in s..e {
                cdf[i] = (i - s + 1) as f32 / count as f32;
            }
        } else {
            let mut acc = 0f32;
            for i in s..e {
                acc += weights_v[i].max(0.0);
                cdf[i] = (acc / total).clamp(0.0, 1.0);
            }
        }
        // Guarantee the inversion always finds a bin.
        cdf[e - 1] = 1.0;
    }
    from_vec_f32(&cdf, &[weights_v.len() as i64, 1], samples.device())
}

/// Draws `nr_imp_samples` new depths per ray by inverting the per-ray CDF at
/// stratified jittered positions, and rebuilds sample positions along the
/// original rays. Depths come out sorted, so the result respects the packed
/// ordering invariant. Rays without any source samples stay empty.
pub fn importance_sample<R: Rng>(
    samples: &RaySamplesPacked,
    cdf: &Tensor,
    nr_imp_samples: i64,
    rng: &mut R,
) -> RaySamplesPacked {
    validate_per_sample(samples, cdf, 1, "cdf");
    assert!(nr_imp_samples > 0, "nr_imp_samples must be positive");

    let cdf_v = to_vec_f32(cdf);
    let z = to_vec_f32(&samples.samples_z);
    let dirs = to_vec_f32(&samples.samples_dirs);
    let pos = to_vec_f32(&samples.samples_pos);
    let ranges = samples.ray_ranges();
    let n = nr_imp_samples as usize;

    let mut out_pos = Vec::new();
    let mut out_dirs = Vec::new();
    let mut out_z = Vec::new();
    let mut out_ranges = Vec::with_capacity(ranges.len() * 2);
    let mut total = 0i64;

    for &(s, e) in &ranges {
        out_ranges.push(total);
        if s == e {
            out_ranges.push(total);
            continue;
        }

        // The ray through the first sample; new positions are re-derived
        // from it rather than stored interpolants.
        let dir = [dirs[s * 3], dirs[s * 3 + 1], dirs[s * 3 + 2]];
        let origin = [
            pos[s * 3] - z[s] * dir[0],
            pos[s * 3 + 1] - z[s] * dir[1],
            pos[s * 3 + 2] - z[s] * dir[2],
        ];

        for j in 0..n {
            let u = (j as f32 + rng.gen::<f32>()) / n as f32;
            // First bin whose cdf reaches u.
            let mut i = s;
            while i < e - 1 && cdf_v[i] < u {
                i += 1;
            }
            let (z_lo, cdf_lo) = if i == s { (z[s], 0.0) } else { (z[i - 1], cdf_v[i - 1]) };
            let span = (cdf_v[i] - cdf_lo).max(1e-8);
            let frac = ((u - cdf_lo) / span).clamp(0.0, 1.0);
            let z_new = z_lo + frac * (z[i] - z_lo);

            out_pos.push(origin[0] + z_new * dir[0]);
            out_pos.push(origin[1] + z_new * dir[1]);
            out_pos.push(origin[2] + z_new * dir[2]);
            out_dirs.extend_from_slice(&dir);
            out_z.push(z_new);
            total += 1;
        }
        // Stratified jittered draws are monotone in u, so the depths of this
        // ray are already sorted.
        out_ranges.push(total);
    }
    debug!("importance sampling drew {} samples over {} rays", total, ranges.len());

    let device = samples.device();
    let fixed = to_vec_f32(&samples.ray_fixed_dt);
    let new_ranges: Vec<(usize, usize)> = out_ranges
        .chunks(2)
        .map(|pair| (pair[0] as usize, pair[1] as usize))
        .collect();
    let out_dt = dt_kernel(&out_z, &new_ranges, &fixed);

    RaySamplesPacked {
        samples_pos: from_vec_f32(&out_pos, &[total, 3], device),
        samples_pos_4d: from_vec_f32(&vec![0f32; total as usize * 4], &[total, 4], device),
        samples_dirs: from_vec_f32(&out_dirs, &[total, 3], device),
        samples_z: from_vec_f32(&out_z, &[total, 1], device),
        samples_dt: from_vec_f32(&out_dt, &[total, 1], device),
        samples_sdf: None,
        ray_start_end_idx: from_vec_i64(&out_ranges, &[ranges.len() as i64, 2], device),
        ray_fixed_dt: samples.ray_fixed_dt.shallow_clone(),
        max_nr_samples: total,
        cur_nr_samples: total,
        rays_have_equal_nr_of_samples: false,
        fixed_nr_of_samples_per_ray: 0,
    }
}

/// Stable per-ray merge of two depth-sorted sample sets into one packed
/// structure. Per ray the combined count is the sum of the two counts and the
/// merged depths stay sorted; `dt` is recomputed from the merged depths. The
/// attached SDF (if any) is dropped, since the model re-evaluates the merged
/// set anyway.
pub fn combine_uniform_samples_with_imp(
    uniform: &RaySamplesPacked,
    importance: &RaySamplesPacked,
) -> RaySamplesPacked {
    let nr_rays = uniform.nr_rays();
    assert_eq!(
        nr_rays,
        importance.nr_rays(),
        "uniform and importance samples must cover the same rays ({} vs {})",
        nr_rays,
        importance.nr_rays()
    );

    let u_ranges = uniform.ray_ranges();
    let i_ranges = importance.ray_ranges();
    let u_pos = to_vec_f32(&uniform.samples_pos);
    let u_pos_4d = to_vec_f32(&uniform.samples_pos_4d);
    let u_dirs = to_vec_f32(&uniform.samples_dirs);
    let u_z = to_vec_f32(&uniform.samples_z);
    let i_pos = to_vec_f32(&importance.samples_pos);
    let i_pos_4d = to_vec_f32(&importance.samples_pos_4d);
    let i_dirs = to_vec_f32(&importance.samples_dirs);
    let i_z = to_vec_f32(&importance.samples_z);

    let mut out_pos = Vec::new();
    let mut out_pos_4d = Vec::new();
    let mut out_dirs = Vec::new();
    let mut out_z = Vec::new();
    let mut out_ranges = Vec::with_capacity(nr_rays as usize * 2);
    let mut total = 0i64;

    for r in 0..nr_rays as usize {
        out_ranges.push(total);
        let (us, ue) = u_ranges[r];
        let (is, ie) = i_ranges[r];
        let mut a = us;
        let mut b = is;
        while a < ue || b < ie {
            // Uniform samples win ties to keep the merge stable.
            let take_uniform = b >= ie || (a < ue && u_z[a] <= i_z[b]);
            let (pos, pos_4d, dirs, z, idx) = if take_uniform {
                let idx = a;
                a += 1;
                (&u_pos, &u_pos_4d, &u_dirs, &u_z, idx)
            } else {
                let idx = b;
                b += 1;
                (&i_pos, &i_pos_4d, &i_dirs, &i_z, idx)
            };
            out_pos.extend_from_slice(&pos[idx * 3..idx * 3 + 3]);
            out_pos_4d.extend_from_slice(&pos_4d[idx * 4..idx * 4 + 4]);
            out_dirs.extend_from_slice(&dirs[idx * 3..idx * 3 + 3]);
            out_z.push(z[idx]);
            total += 1;
        }
        out_ranges.push(total);
    }

    let device = uniform.device();
    let fixed = to_vec_f32(&uniform.ray_fixed_dt);
    let new_ranges: Vec<(usize, usize)> = out_ranges
        .chunks(2)
        .map(|pair| (pair[0] as usize, pair[1] as usize))
        .collect();
    let out_dt = dt_kernel(&out_z, &new_ranges, &fixed);

    RaySamplesPacked {
        samples_pos: from_vec_f32(&out_pos, &[total, 3], device),
        samples_pos_4d: from_vec_f32(&out_pos_4d, &[total, 4], device),
        samples_dirs: from_vec_f32(&out_dirs, &[total, 3], device),
        samples_z: from_vec_f32(&out_z, &[total, 1], device),
        samples_dt: from_vec_f32(&out_dt, &[total, 1], device),
        samples_sdf: None,
        ray_start_end_idx: from_vec_i64(&out_ranges, &[nr_rays, 2], device),
        ray_fixed_dt: uniform.ray_fixed_dt.shallow_clone(),
        max_nr_samples: total,
        cur_nr_samples: total,
        rays_have_equal_nr_of_samples: false,
        fixed_nr_of_samples_per_ray: 0,
    }
}
