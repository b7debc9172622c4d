use rand::rngs::StdRng;
use rand::SeedableRng;
use raysdf_occupancy::OccupancyGrid;
use raysdf_packed::RaySamplesPacked;
use raysdf_utils::tensor::{to_vec_bool, to_vec_f32, to_vec_i64};
use tch::{Device, Kind, Tensor};

fn make_grid(nr_voxels_per_dim: i64) -> OccupancyGrid {
    let center = Tensor::from_slice(&[0f32, 0.0, 0.0]);
    OccupancyGrid::new(nr_voxels_per_dim, 2.0, &center)
}

fn fully_occupied_grid(nr_voxels_per_dim: i64) -> OccupancyGrid {
    let mut grid = make_grid(nr_voxels_per_dim);
    let occupancy = Tensor::ones(&[grid.get_nr_voxels()], (Kind::Bool, Device::Cpu));
    grid.set_grid_occupancy(&occupancy);
    grid
}

#[test]
fn test_grid_points_order_and_bounds() {
    let grid = make_grid(4);
    let points = to_vec_f32(&grid.compute_grid_points());
    assert_eq!(points.len(), 64 * 3);

    // Flat index order: z varies fastest, then y, then x.
    assert_eq!(&points[0..3], &[-0.75, -0.75, -0.75]);
    assert_eq!(&points[3..6], &[-0.75, -0.75, -0.25]);
    assert_eq!(&points[189..192], &[0.75, 0.75, 0.75]);
}

#[test]
fn test_update_with_density_uniform_above_threshold() {
    let mut grid = make_grid(8);
    let density = Tensor::full(&[grid.get_nr_voxels()], 0.5, (Kind::Float, Device::Cpu));
    grid.update_with_density(&density);

    let occupancy = to_vec_bool(&grid.get_grid_occupancy());
    assert!(occupancy.iter().all(|&occupied| occupied));
}

#[test]
fn test_update_with_density_uniform_below_threshold() {
    let mut grid = make_grid(8);
    let density = Tensor::full(&[grid.get_nr_voxels()], 1e-5, (Kind::Float, Device::Cpu));
    grid.update_with_density(&density);

    let occupancy = to_vec_bool(&grid.get_grid_occupancy());
    assert!(occupancy.iter().all(|&occupied| !occupied));
}

#[test]
fn test_update_with_density_random_sample_touches_only_indices() {
    let mut grid = make_grid(4);
    let density = Tensor::from_slice(&[1f32, 1.0]);
    let indices = Tensor::from_slice(&[0i64, 5]);
    grid.update_with_density_random_sample(&density, &indices);

    let occupancy = to_vec_bool(&grid.get_grid_occupancy());
    assert!(occupancy[0]);
    assert!(occupancy[5]);
    assert_eq!(occupancy.iter().filter(|&&o| o).count(), 2);
}

#[test]
fn test_update_with_sdf_surface_vs_far() {
    let mut grid = make_grid(8);
    let on_surface = Tensor::zeros(&[grid.get_nr_voxels()], (Kind::Float, Device::Cpu));
    grid.update_with_sdf(&on_surface, 50.0);
    assert!(to_vec_bool(&grid.get_grid_occupancy()).iter().all(|&o| o));

    let mut grid = make_grid(8);
    let far_away = Tensor::ones(&[grid.get_nr_voxels()], (Kind::Float, Device::Cpu));
    grid.update_with_sdf(&far_away, 50.0);
    assert!(to_vec_bool(&grid.get_grid_occupancy()).iter().all(|&o| !o));
}

#[test]
fn test_update_with_sdf_positions_maps_to_voxel() {
    let mut grid = make_grid(8);
    // One point on the surface inside the grid, one far outside (ignored).
    let positions = Tensor::from_slice(&[0.1f32, 0.1, 0.1, 9.0, 9.0, 9.0]).view((2, 3));
    let sdf = Tensor::from_slice(&[0f32, 0.0]);
    grid.update_with_sdf_positions(&positions, &sdf, 50.0);

    let probe = Tensor::from_slice(&[0.1f32, 0.1, 0.1]).view((1, 3));
    assert!(to_vec_bool(&grid.check_occupancy(&probe))[0]);
    assert_eq!(to_vec_bool(&grid.get_grid_occupancy()).iter().filter(|&&o| o).count(), 1);
}

#[test]
fn test_check_occupancy_out_of_bounds_is_free() {
    let grid = fully_occupied_grid(8);
    let points = Tensor::from_slice(&[0f32, 0.0, 0.0, 5.0, 0.0, 0.0]).view((2, 3));
    let occupied = to_vec_bool(&grid.check_occupancy(&points));
    assert!(occupied[0]);
    assert!(!occupied[1]);
}

#[test]
fn test_random_sample_of_grid_points_is_reproducible() {
    let grid = make_grid(8);
    let mut rng_a = StdRng::seed_from_u64(42);
    let mut rng_b = StdRng::seed_from_u64(42);

    let (points_a, indices_a) = grid.compute_random_sample_of_grid_points(32, true, &mut rng_a);
    let (points_b, indices_b) = grid.compute_random_sample_of_grid_points(32, true, &mut rng_b);
    assert_eq!(to_vec_f32(&points_a), to_vec_f32(&points_b));
    assert_eq!(to_vec_i64(&indices_a), to_vec_i64(&indices_b));

    let nr_voxels = grid.get_nr_voxels();
    assert!(to_vec_i64(&indices_a).iter().all(|&idx| idx >= 0 && idx < nr_voxels));
    for point in to_vec_f32(&points_a).chunks(3) {
        assert!(point.iter().all(|coord| coord.abs() <= 1.0 + 1e-6));
    }
}

#[test]
fn test_advance_from_outside_returns_box_entry() {
    let grid = fully_occupied_grid(8);
    let rays_o = Tensor::from_slice(&[-2f32, 0.1, 0.1]).view((1, 3));
    let rays_d = Tensor::from_slice(&[1f32, 0.0, 0.0]).view((1, 3));
    let t = Tensor::zeros(&[1, 1], (Kind::Float, Device::Cpu));

    let (t_new, within) = grid.advance_sample_to_next_occupied_voxel(&rays_o, &rays_d, &t);
    // Analytic ray/box entry: the grid spans [-1, 1], so t = 1 along +x.
    assert!((to_vec_f32(&t_new)[0] - 1.0).abs() < 1e-5);
    assert!(to_vec_bool(&within)[0]);
}

#[test]
fn test_first_sample_start_skips_empty_space() {
    let mut grid = make_grid(8);
    // Occupy only the last slab along x, i.e. x in [0.75, 1.0].
    let mut occupancy = vec![false; 512];
    for iy in 0..8usize {
        for iz in 0..8usize {
            occupancy[(7 * 8 + iy) * 8 + iz] = true;
        }
    }
    grid.set_grid_occupancy(&Tensor::from_slice(&occupancy));

    let rays_o = Tensor::from_slice(&[-2f32, 0.1, 0.1, -2.0, 0.1, 0.1]).view((2, 3));
    let rays_d = Tensor::from_slice(&[1f32, 0.0, 0.0, -1.0, 0.0, 0.0]).view((2, 3));
    let (t, hit) = grid.compute_first_sample_start_of_occupied_regions(&rays_o, &rays_d);

    let t = to_vec_f32(&t);
    let hit = to_vec_bool(&hit);
    assert!(hit[0]);
    assert!((t[0] - 2.75).abs() < 1e-4);
    // The second ray points away from the grid.
    assert!(!hit[1]);
}

#[test]
fn test_samples_in_occupied_regions_filters() {
    let mut grid = make_grid(8);
    // Occupy the x > 0 half.
    let mut occupancy = vec![false; 512];
    for ix in 4..8usize {
        for iy in 0..8usize {
            for iz in 0..8usize {
                occupancy[(ix * 8 + iy) * 8 + iz] = true;
            }
        }
    }
    grid.set_grid_occupancy(&Tensor::from_slice(&occupancy));

    let device = Device::Cpu;
    let samples = RaySamplesPacked {
        samples_pos: Tensor::from_slice(&[-0.5f32, 0.1, 0.1, 0.5, 0.1, 0.1]).view((2, 3)),
        samples_pos_4d: Tensor::zeros(&[2, 4], (Kind::Float, device)),
        samples_dirs: Tensor::zeros(&[2, 3], (Kind::Float, device)),
        samples_z: Tensor::from_slice(&[1f32, 2.0]).view((2, 1)),
        samples_dt: Tensor::full(&[2, 1], 0.1, (Kind::Float, device)),
        samples_sdf: None,
        ray_start_end_idx: Tensor::from_slice(&[0i64, 2]).view((1, 2)),
        ray_fixed_dt: Tensor::zeros(&[1, 1], (Kind::Float, device)),
        max_nr_samples: 2,
        cur_nr_samples: 2,
        rays_have_equal_nr_of_samples: false,
        fixed_nr_of_samples_per_ray: 0,
    };

    let filtered = grid.compute_samples_in_occupied_regions(&samples);
    assert_eq!(filtered.compute_exact_nr_samples(), 1);
    assert_eq!(to_vec_f32(&filtered.samples_z), vec![2.0]);
    assert_eq!(to_vec_i64(&filtered.ray_start_end_idx), vec![0, 1]);
}

#[test]
fn test_samples_in_occupied_regions_carries_sdf_through_padding() {
    let mut grid = make_grid(8);
    // Occupy the x > 0 half.
    let mut occupancy = vec![false; 512];
    for ix in 4..8usize {
        for iy in 0..8usize {
            for iz in 0..8usize {
                occupancy[(ix * 8 + iy) * 8 + iz] = true;
            }
        }
    }
    grid.set_grid_occupancy(&Tensor::from_slice(&occupancy));

    // Two live samples split around a padding slot at flat index 1.
    let device = Device::Cpu;
    let mut samples = RaySamplesPacked {
        samples_pos: Tensor::from_slice(&[-0.5f32, 0.1, 0.1, 0.0, 0.0, 0.0, 0.5, 0.1, 0.1])
            .view((3, 3)),
        samples_pos_4d: Tensor::zeros(&[3, 4], (Kind::Float, device)),
        samples_dirs: Tensor::zeros(&[3, 3], (Kind::Float, device)),
        samples_z: Tensor::from_slice(&[1f32, 0.0, 2.0]).view((3, 1)),
        samples_dt: Tensor::full(&[3, 1], 0.1, (Kind::Float, device)),
        samples_sdf: None,
        ray_start_end_idx: Tensor::from_slice(&[0i64, 1, 2, 3]).view((2, 2)),
        ray_fixed_dt: Tensor::zeros(&[2, 1], (Kind::Float, device)),
        max_nr_samples: 3,
        cur_nr_samples: 3,
        rays_have_equal_nr_of_samples: false,
        fixed_nr_of_samples_per_ray: 0,
    };
    samples.set_sdf(&Tensor::from_slice(&[0.4f32, -0.1]));

    let filtered = grid.compute_samples_in_occupied_regions(&samples);
    assert_eq!(filtered.compute_exact_nr_samples(), 1);
    assert_eq!(to_vec_f32(&filtered.samples_z), vec![2.0]);
    // The kept sample is the second live one; its sdf value travels with it.
    assert_eq!(to_vec_f32(filtered.samples_sdf.as_ref().unwrap()), vec![-0.1]);
}

#[test]
#[should_panic(expected = "grid occupancy must cover every voxel")]
fn test_set_grid_occupancy_wrong_size() {
    let mut grid = make_grid(8);
    let occupancy = Tensor::zeros(&[10], (Kind::Bool, Device::Cpu));
    grid.set_grid_occupancy(&occupancy);
}
