//! Hand-derived reverse-mode rules for the segmented forward kernels.
//!
//! Each backward takes the upstream gradient plus the forward tensors it
//! needs, and applies the closed-form rule for that segmented scan/reduction.
//! Within a ray the rules reduce to suffix sums, so every kernel stays a
//! single reverse sweep per ray.

use raysdf_packed::RaySamplesPacked;
use raysdf_utils::tensor::{from_vec_f32, to_vec_f32, validate_tensor, validate_tensor_type};
use tch::{Kind, Tensor};

use crate::forward::{dt_kernel, validate_per_sample, ONE_MINUS_ALPHA_EPS};

/// Gradient of `sum_over_each_ray`: the per-ray gradient broadcast back to
/// every sample of that ray.
pub fn sum_over_each_ray_backward(grad_sums: &Tensor, samples: &RaySamplesPacked) -> Tensor {
    let nr_rays = samples.nr_rays();
    let channels = grad_sums.size()[1];
    validate_tensor(grad_sums, &[nr_rays, channels], "grad_sums");
    validate_tensor_type(grad_sums, Kind::Float, "grad_sums");

    let grad_v = to_vec_f32(grad_sums);
    let ranges = samples.ray_ranges();
    let nr_flat = samples.samples_z.size()[0] as usize;
    let c = channels as usize;
    let mut out = vec![0f32; nr_flat * c];
    for (r, &(s, e)) in ranges.iter().enumerate() {
        for i in s..e {
            for k in 0..c {
                out[i * c + k] = grad_v[r * c + k];
            }
        }
    }
    from_vec_f32(&out, &[nr_flat as i64, channels], samples.device())
}

/// Gradients of `integrate_with_weights` with respect to all three
/// differentiable inputs. With `w_i = alpha_i T_i` and output
/// `o_r = sum_i w_i v_i`:
/// `d o_r / d alpha_i = T_i v_i`, `d o_r / d T_i = alpha_i v_i`,
/// `d o_r / d v_i = w_i`.
pub fn integrate_with_weights_backward(
    grad_result: &Tensor,
    samples: &RaySamplesPacked,
    alpha: &Tensor,
    transmittance: &Tensor,
    values: &Tensor,
) -> (Tensor, Tensor, Tensor) {
    let nr_rays = samples.nr_rays();
    let channels = values.size()[1];
    validate_tensor(grad_result, &[nr_rays, channels], "grad_result");
    validate_tensor_type(grad_result, Kind::Float, "grad_result");
    validate_per_sample(samples, alpha, 1, "alpha");
    validate_per_sample(samples, transmittance, 1, "transmittance");
    validate_per_sample(samples, values, channels, "values");

    let grad_v = to_vec_f32(grad_result);
    let alpha_v = to_vec_f32(alpha);
    let t_v = to_vec_f32(transmittance);
    let values_v = to_vec_f32(values);
    let ranges = samples.ray_ranges();
    let nr_flat = alpha_v.len();
    let c = channels as usize;

    let mut grad_alpha = vec![0f32; nr_flat];
    let mut grad_transmittance = vec![0f32; nr_flat];
    let mut grad_values = vec![0f32; nr_flat * c];
    for (r, &(s, e)) in ranges.iter().enumerate() {
        for i in s..e {
            let mut dot = 0f32;
            for k in 0..c {
                let g = grad_v[r * c + k];
                dot += g * values_v[i * c + k];
                grad_values[i * c + k] = alpha_v[i] * t_v[i] * g;
            }
            grad_alpha[i] = t_v[i] * dot;
            grad_transmittance[i] = alpha_v[i] * dot;
        }
    }

    let device = samples.device();
    let nr_flat = nr_flat as i64;
    (
        from_vec_f32(&grad_alpha, &[nr_flat, 1], device),
        from_vec_f32(&grad_transmittance, &[nr_flat, 1], device),
        from_vec_f32(&grad_values, &[nr_flat, channels], device),
    )
}

/// Gradient of the segmented exclusive cumulative product. `T_i` contains the
/// factor `(1 - alpha_k)` for every `k < i`, so
/// `d T_i / d alpha_k = -T_i / (1 - alpha_k)` and the per-sample gradient is
/// a suffix sum over the downstream transmittances (plus the background
/// term), divided by the sample's own `1 - alpha` with a floored denominator.
pub fn cumprod_alpha2transmittance_backward(
    grad_transmittance: &Tensor,
    grad_bg_transmittance: &Tensor,
    samples: &RaySamplesPacked,
    alpha: &Tensor,
    transmittance: &Tensor,
    bg_transmittance: &Tensor,
) -> Tensor {
    let nr_rays = samples.nr_rays();
    validate_per_sample(samples, grad_transmittance, 1, "grad_transmittance");
    validate_per_sample(samples, alpha, 1, "alpha");
    validate_per_sample(samples, transmittance, 1, "transmittance");
    validate_tensor(grad_bg_transmittance, &[nr_rays, 1], "grad_bg_transmittance");
    validate_tensor_type(grad_bg_transmittance, Kind::Float, "grad_bg_transmittance");
    validate_tensor(bg_transmittance, &[nr_rays, 1], "bg_transmittance");
    validate_tensor_type(bg_transmittance, Kind::Float, "bg_transmittance");

    let grad_t_v = to_vec_f32(grad_transmittance);
    let grad_bg_v = to_vec_f32(grad_bg_transmittance);
    let alpha_v = to_vec_f32(alpha);
    let t_v = to_vec_f32(transmittance);
    let bg_v = to_vec_f32(bg_transmittance);
    let ranges = samples.ray_ranges();

    let mut grad_alpha = vec![0f32; alpha_v.len()];
    for (r, &(s, e)) in ranges.iter().enumerate() {
        // Accumulates grad_T_i * T_i over all samples after the current one,
        // seeded with the background term.
        let mut suffix = grad_bg_v[r] * bg_v[r];
        for i in (s..e).rev() {
            let a = alpha_v[i].clamp(0.0, 1.0);
            grad_alpha[i] = -suffix / (1.0 - a).max(ONE_MINUS_ALPHA_EPS);
            if alpha_v[i] < 0.0 || alpha_v[i] > 1.0 {
                // The forward clamp is flat strictly outside [0, 1]; the
                // boundary values stay differentiable.
                grad_alpha[i] = 0.0;
            }
            suffix += grad_t_v[i] * t_v[i];
        }
    }
    from_vec_f32(&grad_alpha, &[alpha_v.len() as i64, 1], samples.device())
}

/// Backward of the fused NeRF forward. Recomputes `dt`, `alpha`, and the
/// running transmittance from the saved forward inputs, then walks each ray
/// in reverse with the suffix sum of the downstream weighted gradients:
/// `d w_j / d alpha_i = -w_j / (1 - alpha_i)` for `j > i` and
/// `d w_i / d alpha_i = T_i`, followed by the chain rule through
/// `alpha = 1 - exp(-sigma * dt)`.
pub fn volume_render_nerf_backward(
    grad_rgb: &Tensor,
    grad_depth: &Tensor,
    grad_opacity: &Tensor,
    samples: &RaySamplesPacked,
    rgb_samples: &Tensor,
    density_samples: &Tensor,
) -> (Tensor, Tensor) {
    let nr_rays = samples.nr_rays();
    validate_tensor(grad_rgb, &[nr_rays, 3], "grad_rgb");
    validate_tensor(grad_depth, &[nr_rays, 1], "grad_depth");
    validate_tensor(grad_opacity, &[nr_rays, 1], "grad_opacity");
    validate_tensor_type(grad_rgb, Kind::Float, "grad_rgb");
    validate_tensor_type(grad_depth, Kind::Float, "grad_depth");
    validate_tensor_type(grad_opacity, Kind::Float, "grad_opacity");
    validate_per_sample(samples, rgb_samples, 3, "rgb_samples");
    validate_per_sample(samples, density_samples, 1, "density_samples");

    let grad_rgb_v = to_vec_f32(grad_rgb);
    let grad_depth_v = to_vec_f32(grad_depth);
    let grad_opacity_v = to_vec_f32(grad_opacity);
    let rgb_v = to_vec_f32(rgb_samples);
    let sigma_v = to_vec_f32(density_samples);
    let z = to_vec_f32(&samples.samples_z);
    let ranges = samples.ray_ranges();
    let fixed = to_vec_f32(&samples.ray_fixed_dt);
    let dt = dt_kernel(&z, &ranges, &fixed);

    let nr_flat = sigma_v.len();
    let mut alpha = vec![0f32; nr_flat];
    let mut transmittance = vec![0f32; nr_flat];
    for &(s, e) in &ranges {
        let mut product = 1f32;
        for i in s..e {
            let sigma = sigma_v[i].max(0.0);
            alpha[i] = 1.0 - (-sigma * dt[i]).exp();
            transmittance[i] = product;
            product *= 1.0 - alpha[i];
        }
    }

    let mut grad_rgb_samples = vec![0f32; nr_flat * 3];
    let mut grad_density = vec![0f32; nr_flat];
    for (r, &(s, e)) in ranges.iter().enumerate() {
        // d loss / d w_i for this ray's output triple.
        let per_sample_grad = |i: usize| {
            let mut g = grad_depth_v[r] * z[i] + grad_opacity_v[r];
            for k in 0..3 {
                g += grad_rgb_v[r * 3 + k] * rgb_v[i * 3 + k];
            }
            g
        };

        let mut suffix = 0f32;
        for i in (s..e).rev() {
            let g_i = per_sample_grad(i);
            let weight = alpha[i] * transmittance[i];
            for k in 0..3 {
                grad_rgb_samples[i * 3 + k] = weight * grad_rgb_v[r * 3 + k];
            }
            let grad_alpha =
                transmittance[i] * g_i - suffix / (1.0 - alpha[i]).max(ONE_MINUS_ALPHA_EPS);
            // alpha'(sigma) = dt * exp(-sigma dt) = dt * (1 - alpha); flat
            // where the forward clamped sigma below zero.
            grad_density[i] = if sigma_v[i] >= 0.0 {
                grad_alpha * dt[i] * (1.0 - alpha[i])
            } else {
                0.0
            };
            suffix += weight * g_i;
        }
    }

    let device = samples.device();
    let nr_flat = nr_flat as i64;
    (
        from_vec_f32(&grad_rgb_samples, &[nr_flat, 3], device),
        from_vec_f32(&grad_density, &[nr_flat, 1], device),
    )
}
