use rand::Rng;
use raysdf_utils::tensor::{from_vec_bool, from_vec_f32, to_vec_f32, validate_tensor, validate_tensor_type};
use tch::{Kind, Tensor};

/// Bounding sphere separating the foreground scene from the background
/// parametrization. A plain value type; only intersection and containment
/// tests are needed.
pub struct Sphere {
    pub radius: f64,
    pub center: Tensor,
}

impl Sphere {
    pub fn new(radius: f64, center: &Tensor) -> Self {
        assert!(radius > 0.0, "radius must be positive");
        validate_tensor(center, &[3], "center");
        validate_tensor_type(center, Kind::Float, "center");
        Sphere {
            radius,
            center: center.contiguous(),
        }
    }

    fn center_array(&self) -> [f32; 3] {
        let c = to_vec_f32(&self.center);
        [c[0], c[1], c[2]]
    }

    /// Ray/sphere intersection for a batch of rays. Returns
    /// `(t_near [nr,1], t_far [nr,1], hit [nr,1])`; `t_near` is clamped to 0
    /// for origins inside the sphere, and both are 0 for misses.
    pub fn ray_intersection(&self, rays_o: &Tensor, rays_d: &Tensor) -> (Tensor, Tensor, Tensor) {
        let nr_rays = rays_o.size()[0];
        validate_tensor(rays_o, &[nr_rays, 3], "rays_o");
        validate_tensor(rays_d, &[nr_rays, 3], "rays_d");
        validate_tensor_type(rays_o, Kind::Float, "rays_o");
        validate_tensor_type(rays_d, Kind::Float, "rays_d");

        let center = self.center_array();
        let radius = self.radius as f32;
        let o_v = to_vec_f32(rays_o);
        let d_v = to_vec_f32(rays_d);

        let mut t_near = vec![0f32; nr_rays as usize];
        let mut t_far = vec![0f32; nr_rays as usize];
        let mut hit = vec![false; nr_rays as usize];
        for r in 0..nr_rays as usize {
            let oc = [
                o_v[r * 3] - center[0],
                o_v[r * 3 + 1] - center[1],
                o_v[r * 3 + 2] - center[2],
            ];
            let d = [d_v[r * 3], d_v[r * 3 + 1], d_v[r * 3 + 2]];
            let a = d[0] * d[0] + d[1] * d[1] + d[2] * d[2];
            if a < 1e-12 {
                continue;
            }
            let b = oc[0] * d[0] + oc[1] * d[1] + oc[2] * d[2];
            let c = oc[0] * oc[0] + oc[1] * oc[1] + oc[2] * oc[2] - radius * radius;
            let discriminant = b * b - a * c;
            if discriminant < 0.0 {
                continue;
            }
            let sqrt_disc = discriminant.sqrt();
            let t0 = (-b - sqrt_disc) / a;
            let t1 = (-b + sqrt_disc) / a;
            if t1 < 0.0 {
                // Sphere entirely behind the ray.
                continue;
            }
            t_near[r] = t0.max(0.0);
            t_far[r] = t1;
            hit[r] = true;
        }

        let device = rays_o.device();
        (
            from_vec_f32(&t_near, &[nr_rays, 1], device),
            from_vec_f32(&t_far, &[nr_rays, 1], device),
            from_vec_bool(&hit, &[nr_rays, 1], device),
        )
    }

    /// Uniformly distributed points inside the sphere, drawn from the seeded
    /// generator by rejection from the enclosing cube.
    pub fn rand_points_inside<R: Rng>(&self, nr_points: i64, rng: &mut R) -> Tensor {
        assert!(nr_points > 0, "nr_points must be positive");
        let center = self.center_array();
        let radius = self.radius as f32;

        let mut points = Vec::with_capacity(nr_points as usize * 3);
        let mut generated = 0i64;
        while generated < nr_points {
            let x = (rng.gen::<f32>() * 2.0 - 1.0) * radius;
            let y = (rng.gen::<f32>() * 2.0 - 1.0) * radius;
            let z = (rng.gen::<f32>() * 2.0 - 1.0) * radius;
            if x * x + y * y + z * z > radius * radius {
                continue;
            }
            points.push(center[0] + x);
            points.push(center[1] + y);
            points.push(center[2] + z);
            generated += 1;
        }
        from_vec_f32(&points, &[nr_points, 3], self.center.device())
    }

    /// Whether each point lies strictly inside the sphere, `[nr_points, 1]`.
    pub fn check_points_inside(&self, points: &Tensor) -> Tensor {
        let nr_points = points.size()[0];
        validate_tensor(points, &[nr_points, 3], "points");
        validate_tensor_type(points, Kind::Float, "points");

        let center = self.center_array();
        let radius_sq = (self.radius * self.radius) as f32;
        let points_v = to_vec_f32(points);
        let mut out = Vec::with_capacity(nr_points as usize);
        for p in points_v.chunks(3) {
            let dx = p[0] - center[0];
            let dy = p[1] - center[1];
            let dz = p[2] - center[2];
            out.push(dx * dx + dy * dy + dz * dz < radius_sq);
        }
        from_vec_bool(&out, &[nr_points, 1], points.device())
    }
}
