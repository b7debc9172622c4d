//! Stateless volume-rendering kernels over packed ray samples.
//!
//! Every forward operation that participates in optimization has a matching
//! `*_backward` with the closed-form reverse-mode rule for its segmented
//! reduction, so no differentiation tape is involved on this hot path.

pub mod backward;
pub mod forward;
pub mod resample;

pub use backward::{
    cumprod_alpha2transmittance_backward, integrate_with_weights_backward,
    sum_over_each_ray_backward, volume_render_nerf_backward,
};
pub use forward::{
    compute_dt, cumprod_alpha2transmittance, cumsum_over_each_ray, integrate_with_weights,
    sdf2alpha, sum_over_each_ray, volume_render_nerf,
};
pub use resample::{combine_uniform_samples_with_imp, compute_cdf, importance_sample};
