//! Physical environment: the discrete space grid and the narrowband
//! propagation model (path loss, correlated shadowing, small-scale fading).

pub mod geometry;
pub mod propagation;

pub use geometry::{DSpace, Point};
pub use propagation::{NarrowbandChannelModel, FADING_STREAM, SHADOWING_STREAM};
