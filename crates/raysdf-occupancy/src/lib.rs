pub mod grid;
pub mod traversal;

pub use grid::OccupancyGrid;
pub use traversal::GridTraversal;
