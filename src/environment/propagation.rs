//! Narrowband propagation model: log-distance path loss, spatially
//! correlated shadowing, and Nakagami-m small-scale fading.
//!
//! The shadowing field is synthesized once at bootstrap by coloring an
//! i.i.d. Gaussian field: the field's 2-D DFT is multiplied by a filter
//! whose power spectral density is the DFT of the Gudmundson correlation
//! kernel `sigma^2 * exp(-d / d_coh)`, normalized so the colored process
//! keeps the energy of the white one (Parseval). Path loss and shadowing
//! depend only on positions and are frozen for the whole run; fading is a
//! fresh draw per link-budget query.
//!
//! Units: dBm for powers at the API surface, milliwatts inside the fading
//! computation, meters and seconds elsewhere.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use crate::config::ChannelParams;
use crate::engine::random::RandomStream;

use super::geometry::{DSpace, Point};

/// Substream consumed once at bootstrap to draw the shadowing field.
pub const SHADOWING_STREAM: &str = "nbmodel/shadowing";
/// Substream consumed by every link-budget query for the fading draw.
pub const FADING_STREAM: &str = "nbmodel/fading";

const SPEED_OF_LIGHT: f64 = 299_792_458.0;
const BOLTZMANN: f64 = 1.380_649e-23;
const NOISE_TEMPERATURE_K: f64 = 290.0;

/// Convert a power in dBm to Watts.
pub fn dbm_to_watts(p_dbm: f64) -> f64 {
    10f64.powf((p_dbm - 30.0) / 10.0)
}

/// Convert a power in Watts to dBm.
pub fn watts_to_dbm(p_w: f64) -> f64 {
    10.0 * (p_w * 1000.0).log10()
}

/// The channel attenuation model shared by every link in the simulation.
pub struct NarrowbandChannelModel {
    params: ChannelParams,
    dspace: DSpace,
    /// Row-major `npt x npt` field, indexed `[iy * npt + ix]`.
    shadowing_map: Vec<f64>,
}

impl NarrowbandChannelModel {
    /// Build the model and generate the shadowing map from `shadowing_rng`.
    /// The generator is consumed once here; the map is read-only afterward.
    pub fn new(dspace: DSpace, params: ChannelParams, shadowing_rng: &mut RandomStream) -> Self {
        let mut model = NarrowbandChannelModel {
            params,
            dspace,
            shadowing_map: Vec::new(),
        };
        model.generate_shadowing_map(shadowing_rng);
        model
    }

    pub fn dspace(&self) -> &DSpace {
        &self.dspace
    }

    pub fn params(&self) -> &ChannelParams {
        &self.params
    }

    /// Gudmundson spatial correlation at lag `delta` meters.
    fn gudmundson_correlation(&self, delta: f64) -> f64 {
        self.params.shadow_dev.powi(2) * (-delta / self.params.coh_dist).exp()
    }

    /// Frequency response of the coloring filter: the square root of the
    /// correlation kernel's PSD, scaled to conserve process energy.
    fn coloring_filter(&self) -> Vec<Complex<f64>> {
        let n = self.dspace.npt();
        let half = (n / 2) as isize;
        let step = self.dspace.step();

        // radial correlation kernel on the centered grid
        let mut kernel = vec![Complex::new(0.0, 0.0); n * n];
        for iy in 0..n {
            let ky = step * (iy as isize - half) as f64;
            for ix in 0..n {
                let kx = step * (ix as isize - half) as f64;
                let d = (kx * kx + ky * ky).sqrt();
                kernel[iy * n + ix] = Complex::new(self.gudmundson_correlation(d), 0.0);
            }
        }

        let mut shifted = ifftshift(&kernel, n);
        fft2(&mut shifted, n, false);

        // sqrt of the PSD gives the filter's frequency response
        let mut filter: Vec<Complex<f64>> = shifted.iter().map(|c| c.sqrt()).collect();

        // Parseval normalization in the frequency domain
        let energy: f64 = filter.iter().map(|c| c.norm_sqr()).sum();
        let gain = n as f64 / energy.sqrt();
        for c in &mut filter {
            *c *= gain;
        }
        filter
    }

    fn generate_shadowing_map(&mut self, rng: &mut RandomStream) {
        let n = self.dspace.npt();
        if self.params.shadow_dev == 0.0 {
            self.shadowing_map = vec![0.0; n * n];
            return;
        }

        let mut field: Vec<Complex<f64>> = (0..n * n)
            .map(|_| Complex::new(rng.normal(0.0, self.params.shadow_dev), 0.0))
            .collect();
        fft2(&mut field, n, false);

        let filter = self.coloring_filter();
        for (f, h) in field.iter_mut().zip(filter.iter()) {
            *f *= h;
        }
        fft2(&mut field, n, true);

        let map: Vec<f64> = field.iter().map(|c| c.re).collect();

        let mean = map.iter().sum::<f64>() / map.len() as f64;
        let var = map.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / map.len() as f64;
        let std = var.sqrt();
        if (std - self.params.shadow_dev).abs() > 0.2 * self.params.shadow_dev {
            log::warn!(
                "shadowing map std {:.3} dB deviates more than 20% from configured {:.3} dB",
                std,
                self.params.shadow_dev
            );
        }

        self.shadowing_map = map;
    }

    /// Shadowing value at an arbitrary point, by bilinear interpolation of
    /// the sampled field (clamped at the grid edges).
    fn shadowing_at(&self, p: &Point) -> f64 {
        let n = self.dspace.npt();
        let step = self.dspace.step();
        let half = (n / 2) as f64;
        let max_idx = (n - 1) as f64;

        let fx = (p.x / step + half).clamp(0.0, max_idx);
        let fy = (p.y / step + half).clamp(0.0, max_idx);
        let ix = (fx.floor() as usize).min(n - 2);
        let iy = (fy.floor() as usize).min(n - 2);
        let tx = fx - ix as f64;
        let ty = fy - iy as f64;

        let v00 = self.shadowing_map[iy * n + ix];
        let v01 = self.shadowing_map[iy * n + ix + 1];
        let v10 = self.shadowing_map[(iy + 1) * n + ix];
        let v11 = self.shadowing_map[(iy + 1) * n + ix + 1];

        let top = v00 * (1.0 - tx) + v01 * tx;
        let bottom = v10 * (1.0 - tx) + v11 * tx;
        top * (1.0 - ty) + bottom * ty
    }

    /// Log-distance path loss in dB, anchored at the free-space loss at the
    /// reference distance `d0` (Goldsmith, Wireless Communications, 2.6).
    fn path_loss_db(&self, a: &Point, b: &Point) -> f64 {
        let mut d = self.dspace.distance(a, b);
        if d < self.params.d0 {
            d = self.params.d0;
        }
        let lambda = SPEED_OF_LIGHT / self.params.freq;
        let fspl_d0 = 20.0 * (4.0 * std::f64::consts::PI * self.params.d0 / lambda).log10();
        fspl_d0 + 10.0 * self.params.pl_exponent * (d / self.params.d0).log10()
    }

    /// Shadowing loss along the link, combining the endpoint samples with
    /// the Lu/May/Haines closed form (IEEE WCNC 2014).
    fn link_shadowing_loss_db(&self, a: &Point, b: &Point) -> f64 {
        let sh_sum = self.shadowing_at(a) + self.shadowing_at(b);
        let d = self.dspace.distance(a, b);
        let e = (-d / self.params.coh_dist).exp();
        ((1.0 - e) / (2.0 * (1.0 + e)).sqrt()) * sh_sum
    }

    /// Total average loss in dB: path loss plus link shadowing. Depends
    /// only on the endpoints, so it is symmetric and stable across a run.
    pub fn total_loss_db(&self, a: &Point, b: &Point) -> f64 {
        self.path_loss_db(a, b) + self.link_shadowing_loss_db(a, b)
    }

    /// Instantaneous received power in dBm for a transmit power `pt_dbm`,
    /// with a fresh Nakagami fading draw from `fading_rng`.
    pub fn link_budget_dbm(
        &self,
        a: &Point,
        b: &Point,
        pt_dbm: f64,
        fading_rng: &mut RandomStream,
    ) -> f64 {
        let pr_avg_dbm = pt_dbm - self.total_loss_db(a, b);
        let pr_avg_mw = 10f64.powf(pr_avg_dbm / 10.0);
        let amplitude = fading_rng.nakagami(self.params.fading_shape, pr_avg_mw.sqrt());
        let pr_instant_mw = amplitude * amplitude;
        10.0 * pr_instant_mw.log10()
    }

    /// Thermal noise floor over the receiver filter bandwidth, in dBm.
    pub fn noise_floor_dbm(&self) -> f64 {
        let noise_w = BOLTZMANN * NOISE_TEMPERATURE_K * self.params.filter_bw;
        10.0 * (noise_w * 1000.0).log10()
    }

    /// Propagation delay between two points at the speed of light.
    pub fn propagation_delay(&self, a: &Point, b: &Point) -> f64 {
        self.dspace.distance(a, b) / SPEED_OF_LIGHT
    }
}

/// In-place 2-D FFT over a row-major square buffer. The inverse transform
/// applies the 1/n^2 normalization, matching the usual DFT convention.
fn fft2(buf: &mut [Complex<f64>], n: usize, inverse: bool) {
    let mut planner = FftPlanner::new();
    let fft = if inverse {
        planner.plan_fft_inverse(n)
    } else {
        planner.plan_fft_forward(n)
    };

    for row in buf.chunks_exact_mut(n) {
        fft.process(row);
    }
    transpose(buf, n);
    for row in buf.chunks_exact_mut(n) {
        fft.process(row);
    }
    transpose(buf, n);

    if inverse {
        let scale = 1.0 / (n * n) as f64;
        for v in buf.iter_mut() {
            *v *= scale;
        }
    }
}

fn transpose(buf: &mut [Complex<f64>], n: usize) {
    for i in 0..n {
        for j in (i + 1)..n {
            buf.swap(i * n + j, j * n + i);
        }
    }
}

/// Move the zero-lag sample of a centered kernel to index (0, 0). For even
/// `n` this is a plain half-grid rotation on both axes.
fn ifftshift(buf: &[Complex<f64>], n: usize) -> Vec<Complex<f64>> {
    let half = n / 2;
    let mut out = vec![Complex::new(0.0, 0.0); n * n];
    for iy in 0..n {
        for ix in 0..n {
            let sy = (iy + half) % n;
            let sx = (ix + half) % n;
            out[iy * n + ix] = buf[sy * n + sx];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelParams;
    use crate::engine::random::RandomManager;

    fn test_params(shadow_dev: f64) -> ChannelParams {
        ChannelParams {
            pl_exponent: 2.5,
            d0: 1.0,
            shadow_dev,
            coh_dist: 30.0,
            fading_shape: 3.0,
            filter_bw: 2e6,
            freq: 2.4e9,
        }
    }

    fn build_model(shadow_dev: f64) -> (NarrowbandChannelModel, RandomManager) {
        let mut mgr = RandomManager::new(2024, 0, false);
        mgr.create_stream(SHADOWING_STREAM).unwrap();
        mgr.create_stream(FADING_STREAM).unwrap();
        let model = NarrowbandChannelModel::new(
            DSpace::new(1.0, 128),
            test_params(shadow_dev),
            mgr.stream(SHADOWING_STREAM).unwrap(),
        );
        (model, mgr)
    }

    #[test]
    fn shadowing_map_std_is_calibrated() {
        // grid much larger than the coherence distance, so the empirical
        // std has enough independent patches to concentrate
        let mut mgr = RandomManager::new(2024, 0, false);
        mgr.create_stream(SHADOWING_STREAM).unwrap();
        let params = ChannelParams {
            coh_dist: 5.0,
            ..test_params(4.0)
        };
        let model = NarrowbandChannelModel::new(
            DSpace::new(1.0, 256),
            params,
            mgr.stream(SHADOWING_STREAM).unwrap(),
        );
        let map = &model.shadowing_map;
        let mean = map.iter().sum::<f64>() / map.len() as f64;
        let std =
            (map.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / map.len() as f64).sqrt();
        assert!(
            (std - 4.0).abs() <= 0.2 * 4.0,
            "map std {std} outside 20% of 4.0"
        );
    }

    #[test]
    fn total_loss_is_symmetric_and_position_only() {
        let (model, _mgr) = build_model(4.0);
        let a = Point::new(-10.0, 5.0);
        let b = Point::new(20.0, -15.0);
        let ab = model.total_loss_db(&a, &b);
        let ba = model.total_loss_db(&b, &a);
        assert!((ab - ba).abs() < 1e-9);
        // repeated queries must not drift
        assert_eq!(ab, model.total_loss_db(&a, &b));
    }

    #[test]
    fn link_budget_directions_agree_in_the_mean() {
        let (model, mut mgr) = build_model(2.0);
        let a = Point::new(0.0, 0.0);
        let b = Point::new(25.0, 10.0);
        let n = 4000;
        let mut fwd = 0.0;
        let mut rev = 0.0;
        for _ in 0..n {
            fwd += model.link_budget_dbm(&a, &b, 0.0, mgr.stream(FADING_STREAM).unwrap());
            rev += model.link_budget_dbm(&b, &a, 0.0, mgr.stream(FADING_STREAM).unwrap());
        }
        let diff = (fwd / n as f64 - rev / n as f64).abs();
        assert!(diff < 0.5, "directional mean difference {diff} dB");
    }

    #[test]
    fn propagation_delay_is_distance_over_c() {
        let (model, _mgr) = build_model(0.0);
        let a = Point::new(0.0, 0.0);
        let b = Point::new(300.0, 0.0);
        let delay = model.propagation_delay(&a, &b);
        assert!((delay - 300.0 / 299_792_458.0).abs() < 1e-18);
    }

    #[test]
    fn noise_floor_matches_thermal_model() {
        let (model, _mgr) = build_model(0.0);
        // kTB at 290 K over 2 MHz is about -111 dBm
        let nf = model.noise_floor_dbm();
        assert!((nf + 111.0).abs() < 0.5, "noise floor {nf}");
    }

    #[test]
    fn path_loss_clamps_below_reference_distance() {
        let (model, _mgr) = build_model(0.0);
        let a = Point::new(0.0, 0.0);
        let near = model.total_loss_db(&a, &Point::new(0.2, 0.0));
        let at_d0 = model.total_loss_db(&a, &Point::new(1.0, 0.0));
        assert!((near - at_d0).abs() < 1e-9);
    }

    #[test]
    fn zero_shadow_dev_yields_flat_map() {
        let (model, _mgr) = build_model(0.0);
        assert!(model.shadowing_map.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn dbm_watt_conversions_roundtrip() {
        for p in [-110.0, -60.0, 0.0, 20.0] {
            let w = dbm_to_watts(p);
            assert!((watts_to_dbm(w) - p).abs() < 1e-9);
        }
    }
}
