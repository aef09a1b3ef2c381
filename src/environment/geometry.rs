//! Geometry primitives for the simulated deployment area.
//!
//! Contains:
//! - `Point`: immutable Cartesian coordinates in meters
//! - `DSpace`: a square grid centered at the origin, the sampling lattice
//!   for the correlated shadowing map

use serde::Deserialize;

/// A position in the plane, in meters.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Point { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Point) -> f64 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Discrete square space: `npt` points per axis with spacing `step`,
/// centered at the origin. Axis coordinates are
/// `step * (-npt/2 .. npt/2 - 1)`, so the grid spans slightly asymmetric
/// bounds, matching the usual FFT-friendly layout.
#[derive(Debug, Clone)]
pub struct DSpace {
    step: f64,
    npt: usize,
    x_1d: Vec<f64>,
    y_1d: Vec<f64>,
}

impl DSpace {
    /// Build the grid. `npt` must be even (the spectral shadowing synthesis
    /// relies on a symmetric half-grid).
    pub fn new(step: f64, npt: usize) -> Self {
        assert!(npt > 0 && npt % 2 == 0, "dspace_npt must be even, got {npt}");
        assert!(step > 0.0, "dspace_step must be positive, got {step}");
        let half = (npt / 2) as isize;
        let axis: Vec<f64> = (-half..(npt as isize - half))
            .map(|i| step * i as f64)
            .collect();
        DSpace {
            step,
            npt,
            x_1d: axis.clone(),
            y_1d: axis,
        }
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn npt(&self) -> usize {
        self.npt
    }

    /// Total side length covered by the grid.
    pub fn size(&self) -> f64 {
        self.step * self.npt as f64
    }

    /// 1-D axis coordinates (identical for x and y).
    pub fn axes(&self) -> (&[f64], &[f64]) {
        (&self.x_1d, &self.y_1d)
    }

    /// Whether `p` lies within the grid bounds.
    pub fn contains(&self, p: &Point) -> bool {
        let min = self.x_1d[0];
        let max = self.x_1d[self.npt - 1];
        (min..=max).contains(&p.x) && (min..=max).contains(&p.y)
    }

    /// Euclidean distance between two points.
    pub fn distance(&self, a: &Point, b: &Point) -> f64 {
        a.distance(b)
    }
}
