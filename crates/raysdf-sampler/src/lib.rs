pub mod sampler;
pub mod sphere;

pub use sphere::Sphere;
