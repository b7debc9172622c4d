pub mod packed;

pub use packed::RaySamplesPacked;
