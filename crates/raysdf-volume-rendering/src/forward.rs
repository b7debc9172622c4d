use raysdf_packed::RaySamplesPacked;
use raysdf_utils::tensor::{from_vec_f32, to_vec_f32, validate_tensor, validate_tensor_type};
use tch::{Kind, Tensor};

/// Denominator floor keeping `1 - alpha` divisions finite when a sample is
/// fully opaque.
pub(crate) const ONE_MINUS_ALPHA_EPS: f32 = 1e-6;

/// Checks that a per-sample attribute tensor lines up with the packed flat
/// arrays: `[nr_flat_samples, channels]`, float, contiguous.
pub(crate) fn validate_per_sample(samples: &RaySamplesPacked, tensor: &Tensor, channels: i64, name: &str) {
    let nr_flat = samples.samples_z.size()[0];
    validate_tensor(tensor, &[nr_flat, channels], name);
    validate_tensor_type(tensor, Kind::Float, name);
}

/// Converts a signed distance to an opacity with a logistic transition,
/// `alpha = sigmoid(-scale * sdf)` clamped to `[0, 1]`. Larger `scale`
/// sharpens the surface.
pub fn sdf2alpha(sdf: &Tensor, scale: f64) -> Tensor {
    validate_tensor_type(sdf, Kind::Float, "sdf");
    assert!(scale > 0.0, "scale must be positive");
    (sdf * (-scale)).sigmoid().clamp(0.0, 1.0)
}

/// Integration step per sample from consecutive depths within each ray. The
/// last sample of a ray uses the ray's fixed dt when set, otherwise it
/// repeats the previous difference. Steps are clamped to be non-negative.
pub(crate) fn dt_kernel(z: &[f32], ranges: &[(usize, usize)], ray_fixed_dt: &[f32]) -> Vec<f32> {
    let mut dt = vec![0f32; z.len()];
    for (r, &(s, e)) in ranges.iter().enumerate() {
        if s == e {
            continue;
        }
        for i in s..e - 1 {
            dt[i] = (z[i + 1] - z[i]).max(0.0);
        }
        let fixed = ray_fixed_dt[r];
        dt[e - 1] = if fixed > 0.0 {
            fixed
        } else if e - 1 > s {
            dt[e - 2]
        } else {
            0.0
        };
    }
    dt
}

pub fn compute_dt(samples: &RaySamplesPacked) -> Tensor {
    let z = to_vec_f32(&samples.samples_z);
    let ranges = samples.ray_ranges();
    let fixed = to_vec_f32(&samples.ray_fixed_dt);
    let dt = dt_kernel(&z, &ranges, &fixed);
    from_vec_f32(&dt, &[z.len() as i64, 1], samples.device())
}

/// Per-ray exclusive cumulative product of `1 - alpha`: the fraction of light
/// reaching each sample. The first sample of every ray gets transmittance 1.
/// Also returns the full per-ray product, i.e. the light left for the
/// background.
pub fn cumprod_alpha2transmittance(samples: &RaySamplesPacked, alpha: &Tensor) -> (Tensor, Tensor) {
    validate_per_sample(samples, alpha, 1, "alpha");

    let alpha_v = to_vec_f32(alpha);
    let ranges = samples.ray_ranges();
    let mut transmittance = vec![0f32; alpha_v.len()];
    let mut bg_transmittance = vec![1f32; ranges.len()];
    for (r, &(s, e)) in ranges.iter().enumerate() {
        let mut product = 1f32;
        for i in s..e {
            transmittance[i] = product;
            product *= (1.0 - alpha_v[i].clamp(0.0, 1.0)).max(0.0);
        }
        bg_transmittance[r] = product;
    }

    let device = samples.device();
    (
        from_vec_f32(&transmittance, &[alpha_v.len() as i64, 1], device),
        from_vec_f32(&bg_transmittance, &[ranges.len() as i64, 1], device),
    )
}

/// Per-ray weighted sum `sum_i alpha_i T_i values_i`, the segmented reduction
/// at the heart of the rendering equation.
pub fn integrate_with_weights(
    samples: &RaySamplesPacked,
    alpha: &Tensor,
    transmittance: &Tensor,
    values: &Tensor,
) -> Tensor {
    let channels = values.size()[1];
    validate_per_sample(samples, alpha, 1, "alpha");
    validate_per_sample(samples, transmittance, 1, "transmittance");
    validate_per_sample(samples, values, channels, "values");

    let alpha_v = to_vec_f32(alpha);
    let t_v = to_vec_f32(transmittance);
    let values_v = to_vec_f32(values);
    let ranges = samples.ray_ranges();
    let c = channels as usize;

    let mut out = vec![0f32; ranges.len() * c];
    for (r, &(s, e)) in ranges.iter().enumerate() {
        for i in s..e {
            let w = alpha_v[i] * t_v[i];
            for k in 0..c {
                out[r * c + k] += w * values_v[i * c + k];
            }
        }
    }
    from_vec_f32(&out, &[ranges.len() as i64, channels], samples.device())
}

/// Segmented sum of a per-sample attribute over each ray.
pub fn sum_over_each_ray(samples: &RaySamplesPacked, values: &Tensor) -> Tensor {
    let channels = values.size()[1];
    validate_per_sample(samples, values, channels, "values");

    let values_v = to_vec_f32(values);
    let ranges = samples.ray_ranges();
    let c = channels as usize;
    let mut out = vec![0f32; ranges.len() * c];
    for (r, &(s, e)) in ranges.iter().enumerate() {
        for i in s..e {
            for k in 0..c {
                out[r * c + k] += values_v[i * c + k];
            }
        }
    }
    from_vec_f32(&out, &[ranges.len() as i64, channels], samples.device())
}

/// Segmented inclusive prefix sum over each ray.
pub fn cumsum_over_each_ray(samples: &RaySamplesPacked, values: &Tensor) -> Tensor {
    let channels = values.size()[1];
    validate_per_sample(samples, values, channels, "values");

    let values_v = to_vec_f32(values);
    let ranges = samples.ray_ranges();
    let c = channels as usize;
    let mut out = vec![0f32; values_v.len()];
    for &(s, e) in &ranges {
        let mut acc = vec![0f32; c];
        for i in s..e {
            for k in 0..c {
                acc[k] += values_v[i * c + k];
                out[i * c + k] = acc[k];
            }
        }
    }
    from_vec_f32(&out, &[values_v.len() as i64 / c as i64, channels], samples.device())
}

/// Fused NeRF-style forward pass: converts per-sample densities to opacities
/// with `alpha = 1 - exp(-sigma * dt)`, composites front to back, and
/// produces per-ray RGB, expected depth, accumulated opacity, and leftover
/// background transmittance without materializing the intermediates.
pub fn volume_render_nerf(
    samples: &RaySamplesPacked,
    rgb_samples: &Tensor,
    density_samples: &Tensor,
) -> (Tensor, Tensor, Tensor, Tensor) {
    validate_per_sample(samples, rgb_samples, 3, "rgb_samples");
    validate_per_sample(samples, density_samples, 1, "density_samples");

    let rgb_v = to_vec_f32(rgb_samples);
    let sigma_v = to_vec_f32(density_samples);
    let z = to_vec_f32(&samples.samples_z);
    let ranges = samples.ray_ranges();
    let fixed = to_vec_f32(&samples.ray_fixed_dt);
    let dt = dt_kernel(&z, &ranges, &fixed);

    let nr_rays = ranges.len();
    let mut out_rgb = vec![0f32; nr_rays * 3];
    let mut out_depth = vec![0f32; nr_rays];
    let mut out_opacity = vec![0f32; nr_rays];
    let mut out_bg = vec![1f32; nr_rays];
    for (r, &(s, e)) in ranges.iter().enumerate() {
        let mut transmittance = 1f32;
        for i in s..e {
            let sigma = sigma_v[i].max(0.0);
            let alpha = 1.0 - (-sigma * dt[i]).exp();
            let weight = alpha * transmittance;
            for k in 0..3 {
                out_rgb[r * 3 + k] += weight * rgb_v[i * 3 + k];
            }
            out_depth[r] += weight * z[i];
            out_opacity[r] += weight;
            transmittance *= 1.0 - alpha;
        }
        out_bg[r] = transmittance;
    }

    let device = samples.device();
    let nr_rays = nr_rays as i64;
    (
        from_vec_f32(&out_rgb, &[nr_rays, 3], device),
        from_vec_f32(&out_depth, &[nr_rays, 1], device),
        from_vec_f32(&out_opacity, &[nr_rays, 1], device),
        from_vec_f32(&out_bg, &[nr_rays, 1], device),
    )
}
