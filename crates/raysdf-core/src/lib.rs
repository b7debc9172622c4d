//! Single entry point over the acceleration-and-integration pipeline:
//! occupancy-guided ray sampling, packed ragged sample storage, and the
//! matched forward/backward volume-rendering kernels.

pub use raysdf_occupancy::{GridTraversal, OccupancyGrid};
pub use raysdf_packed::RaySamplesPacked;
pub use raysdf_sampler::{sampler, Sphere};
pub use raysdf_volume_rendering as volume_rendering;
