use rand::rngs::StdRng;
use rand::SeedableRng;
use raysdf_packed::RaySamplesPacked;
use raysdf_utils::tensor::{to_vec_f32, to_vec_i64};
use raysdf_volume_rendering::{combine_uniform_samples_with_imp, compute_cdf, importance_sample};
use tch::{Device, Kind, Tensor};

fn make_packed(z_per_ray: &[&[f32]], fixed_dt: f32) -> RaySamplesPacked {
    let device = Device::Cpu;
    let nr_rays = z_per_ray.len() as i64;
    let mut z = Vec::new();
    let mut ranges = Vec::new();
    let mut total = 0i64;
    for ray in z_per_ray {
        ranges.push(total);
        z.extend_from_slice(ray);
        total += ray.len() as i64;
        ranges.push(total);
    }
    let mut pos = Vec::new();
    let mut dirs = Vec::new();
    for &depth in &z {
        pos.extend_from_slice(&[depth, 0.0, 0.0]);
        dirs.extend_from_slice(&[1.0, 0.0, 0.0]);
    }
    RaySamplesPacked {
        samples_pos: Tensor::from_slice(&pos).view((total, 3)),
        samples_pos_4d: Tensor::zeros(&[total, 4], (Kind::Float, device)),
        samples_dirs: Tensor::from_slice(&dirs).view((total, 3)),
        samples_z: Tensor::from_slice(&z).view((total, 1)),
        samples_dt: Tensor::full(&[total, 1], fixed_dt as f64, (Kind::Float, device)),
        samples_sdf: None,
        ray_start_end_idx: Tensor::from_slice(&ranges).view((nr_rays, 2)),
        ray_fixed_dt: Tensor::full(&[nr_rays, 1], fixed_dt as f64, (Kind::Float, device)),
        max_nr_samples: total,
        cur_nr_samples: total,
        rays_have_equal_nr_of_samples: false,
        fixed_nr_of_samples_per_ray: 0,
    }
}

fn assert_sorted(z: &[f32]) {
    for pair in z.windows(2) {
        assert!(pair[0] <= pair[1], "depths not sorted: {} > {}", pair[0], pair[1]);
    }
}

#[test]
fn test_compute_cdf_known_weights() {
    let samples = make_packed(&[&[1.0, 1.1, 1.2]], 0.1);
    let weights = Tensor::from_slice(&[1f32, 1.0, 2.0]).view((3, 1));

    let cdf = to_vec_f32(&compute_cdf(&samples, &weights));
    assert!((cdf[0] - 0.25).abs() < 1e-6);
    assert!((cdf[1] - 0.5).abs() < 1e-6);
    assert!((cdf[2] - 1.0).abs() < 1e-6);
}

#[test]
fn test_compute_cdf_zero_mass_falls_back_to_uniform() {
    let samples = make_packed(&[&[1.0, 1.1, 1.2]], 0.1);
    let weights = Tensor::zeros(&[3, 1], (Kind::Float, Device::Cpu));

    let cdf = to_vec_f32(&compute_cdf(&samples, &weights));
    assert!((cdf[0] - 1.0 / 3.0).abs() < 1e-6);
    assert!((cdf[1] - 2.0 / 3.0).abs() < 1e-6);
    assert!((cdf[2] - 1.0).abs() < 1e-6);
}

#[test]
fn test_importance_sample_stays_in_depth_range() {
    let samples = make_packed(&[&[1.0, 1.5, 2.0]], 0.5);
    let weights = Tensor::from_slice(&[1f32, 1.0, 1.0]).view((3, 1));
    let cdf = compute_cdf(&samples, &weights);

    let mut rng = StdRng::seed_from_u64(3);
    let resampled = importance_sample(&samples, &cdf, 8, &mut rng);

    assert_eq!(resampled.compute_exact_nr_samples(), 8);
    assert_eq!(to_vec_i64(&resampled.ray_start_end_idx), vec![0, 8]);

    let z = to_vec_f32(&resampled.samples_z);
    assert_sorted(&z);
    assert!(z.iter().all(|&depth| (1.0..=2.0).contains(&depth)));

    // Positions are re-derived along the original ray (x axis here).
    let pos = to_vec_f32(&resampled.samples_pos);
    for (i, &depth) in z.iter().enumerate() {
        assert!((pos[i * 3] - depth).abs() < 1e-5);
    }
}

#[test]
fn test_importance_sample_is_reproducible() {
    let samples = make_packed(&[&[1.0, 1.5, 2.0], &[0.5, 0.6, 0.9]], 0.1);
    let weights = Tensor::from_slice(&[0.1f32, 1.0, 0.4, 1.0, 0.2, 0.1]).view((6, 1));
    let cdf = compute_cdf(&samples, &weights);

    let mut rng_a = StdRng::seed_from_u64(11);
    let mut rng_b = StdRng::seed_from_u64(11);
    let a = importance_sample(&samples, &cdf, 4, &mut rng_a);
    let b = importance_sample(&samples, &cdf, 4, &mut rng_b);
    assert_eq!(to_vec_f32(&a.samples_z), to_vec_f32(&b.samples_z));
}

#[test]
fn test_combine_counts_add_and_stay_sorted() {
    let uniform = make_packed(&[&[1.0, 3.0, 5.0], &[2.0, 4.0]], 0.2);
    let importance = make_packed(&[&[2.0, 4.0], &[1.0, 3.0, 5.0]], 0.2);

    let combined = combine_uniform_samples_with_imp(&uniform, &importance);
    assert_eq!(combined.compute_exact_nr_samples(), 10);

    let ranges = combined.ray_ranges();
    assert_eq!(ranges[0], (0, 5));
    assert_eq!(ranges[1], (5, 10));

    let z = to_vec_f32(&combined.samples_z);
    assert_eq!(&z[0..5], &[1.0, 2.0, 3.0, 4.0, 5.0]);
    assert_eq!(&z[5..10], &[1.0, 2.0, 3.0, 4.0, 5.0]);

    // Positions travel with their samples through the merge.
    let pos = to_vec_f32(&combined.samples_pos);
    for (i, &depth) in z.iter().enumerate() {
        assert!((pos[i * 3] - depth).abs() < 1e-6);
    }
}

#[test]
fn test_combine_with_empty_importance_ray() {
    let uniform = make_packed(&[&[1.0, 2.0]], 0.2);
    let importance = make_packed(&[&[]], 0.2);

    let combined = combine_uniform_samples_with_imp(&uniform, &importance);
    assert_eq!(combined.compute_exact_nr_samples(), 2);
    assert_eq!(to_vec_f32(&combined.samples_z), vec![1.0, 2.0]);
}

#[test]
#[should_panic(expected = "must cover the same rays")]
fn test_combine_ray_count_mismatch() {
    let uniform = make_packed(&[&[1.0, 2.0]], 0.2);
    let importance = make_packed(&[&[1.0], &[2.0]], 0.2);
    let _ = combine_uniform_samples_with_imp(&uniform, &importance);
}
