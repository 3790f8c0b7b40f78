//! Per-facet convolution kernels.
//!
//! Each facet gets a family of oversampled uv kernels, one per w-plane. A
//! kernel is the Fourier transform of the prolate spheroidal taper times the
//! residual w-phase screen of the facet, so only the non-linear part of the
//! w-term is left after the facet phase shift and uv tilt. `sphe` is the
//! image-plane response of the w = 0 kernel sampled at integer offsets and is
//! what gridded images are divided by.

use std::f64::consts::PI;
use std::fs;
use std::path::Path;

use log::{debug, warn};
use ndarray::{Array2, Array3, Ix2, Ix3};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::config::KernelConfig;
use crate::error::{ConfigError, ContractError, PipelineError};
use crate::geom::n_of;
use crate::jones::C32;
use crate::store::Namespace;
use crate::tessellation::FacetGeometry;
use crate::utils::{gaussian_smooth_2d, FftHelper};

/// Width of the Gaussian that softens facet masks into stitching weights.
pub const SW_SIGMA_PX: f64 = 10.0;

/// Schwab's rational approximation of the prolate spheroidal wave function
/// (m = 6, α = 1). Zero outside `|nu| <= 1`.
pub fn grdsf(nu: f64) -> f64 {
    const P: [[f64; 5]; 2] = [
        [8.203343e-2, -3.644705e-1, 6.278660e-1, -5.335581e-1, 2.312756e-1],
        [4.028559e-3, -3.697768e-2, 1.021332e-1, -1.201436e-1, 6.412774e-2],
    ];
    const Q: [[f64; 3]; 2] = [[1.0, 8.212018e-1, 2.078043e-1], [1.0, 9.599102e-1, 2.918724e-1]];
    let nu = nu.abs();
    let (part, nuend) = if nu < 0.75 {
        (0, 0.75)
    } else if nu <= 1.0 {
        (1, 1.0)
    } else {
        return 0.0;
    };
    let d = nu * nu - nuend * nuend;
    let top = P[part].iter().rev().fold(0.0, |acc, &p| acc * d + p);
    let bot = Q[part].iter().rev().fold(0.0, |acc, &q| acc * d + q);
    if bot == 0.0 {
        0.0
    } else {
        top / bot
    }
}

/// W-plane centres, quadratically spaced so that small |w| is sampled finely.
pub fn w_planes(n_wplanes: usize, wmax: f64) -> Vec<f64> {
    if n_wplanes <= 1 {
        return vec![0.0];
    }
    let last = (n_wplanes - 1) as f64;
    (0..n_wplanes)
        .map(|k| wmax * (k as f64 / last).powi(2))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KernelParams {
    pub support: usize,
    pub oversampling: usize,
    pub n_wplanes: usize,
    pub wmax: f64,
    pub cell_rad: f64,
    pub npix_padded: usize,
    pub l0: f64,
    pub m0: f64,
}

impl KernelParams {
    pub fn new(facet: &FacetGeometry, cfg: &KernelConfig, cell_rad: f64) -> Self {
        KernelParams {
            support: cfg.support,
            oversampling: cfg.oversampling,
            n_wplanes: cfg.n_wplanes,
            wmax: cfg.wmax,
            cell_rad,
            npix_padded: facet.npix_padded,
            l0: facet.l0,
            m0: facet.m0,
        }
    }

    /// Samples per table axis.
    pub fn table_len(&self) -> usize {
        (self.support + 1) * self.oversampling + 1
    }

    /// Table index of zero offset.
    pub fn centre(&self) -> usize {
        (self.support + 1) * self.oversampling / 2
    }

    /// Cells touched on either side of the nearest cell.
    pub fn half_support(&self) -> usize {
        (self.support - 1) / 2
    }

    /// uv cell size in wavelengths.
    pub fn du(&self) -> f64 {
        1.0 / (self.npix_padded as f64 * self.cell_rad)
    }

    /// Image-plane samples per axis used to build a kernel.
    fn sampling(&self) -> usize {
        4 * (self.support + 1)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KernelSet {
    pub params: KernelParams,
    pub w_values: Vec<f64>,
    /// `(n_wplanes, L, L)`, indexed `[plane][dy][dx]`.
    pub planes: Array3<C32>,
    pub sphe: Array2<f32>,
    pub sw: Array2<f32>,
}

impl KernelSet {
    /// Builds the w-kernels, the taper response and the stitching weight of
    /// one facet. `mask` is the facet mask on its padded grid.
    pub fn compute(
        facet: &FacetGeometry,
        cfg: &KernelConfig,
        cell_rad: f64,
        mask: &Array2<f32>,
    ) -> Result<Self, PipelineError> {
        let params = KernelParams::new(facet, cfg, cell_rad);
        let w_values = w_planes(params.n_wplanes, params.wmax);
        let planes = w_kernels(&params, &w_values)?;
        let sphe = taper_response(&params, &planes)?;
        let sw = spatial_weight(mask)?;
        let set = KernelSet {
            params,
            w_values,
            planes,
            sphe,
            sw,
        };
        set.check()?;
        debug!(
            "facet {}: {} w-planes of {}x{} taps",
            facet.index,
            set.w_values.len(),
            set.params.table_len(),
            set.params.table_len()
        );
        Ok(set)
    }

    /// Reads `path` when the cache says it is valid and its parameters
    /// match, otherwise recomputes and rewrites it.
    pub fn load_or_compute(
        path: &Path,
        valid: bool,
        facet: &FacetGeometry,
        cfg: &KernelConfig,
        cell_rad: f64,
        mask: &Array2<f32>,
    ) -> Result<Self, PipelineError> {
        let expected = KernelParams::new(facet, cfg, cell_rad);
        if valid {
            match read_cached(path, &expected) {
                Ok(set) => return Ok(set),
                Err(reason) => warn!(
                    "kernel cache {} unusable ({reason}), recomputing",
                    path.display()
                ),
            }
        }
        let set = KernelSet::compute(facet, cfg, cell_rad, mask)?;
        let cache_err = |source| PipelineError::Cache {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(cache_err)?;
        }
        let bytes = bincode::serialize(&set).map_err(|e| {
            cache_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(cache_err)?;
        fs::rename(&tmp, path).map_err(cache_err)?;
        Ok(set)
    }

    /// Nearest w-plane for `|w|`, and whether `|w|` exceeded `wmax`.
    pub fn plane_index(&self, w_abs: f64) -> (usize, bool) {
        let nw = self.w_values.len();
        let clamped = w_abs > self.params.wmax;
        if nw <= 1 {
            return (0, clamped);
        }
        let k = ((w_abs / self.params.wmax).sqrt() * (nw - 1) as f64).round() as usize;
        (k.min(nw - 1), clamped)
    }

    pub fn check(&self) -> Result<(), ContractError> {
        let l = self.params.table_len();
        let nw = self.w_values.len();
        if nw == 0 {
            return Err(ContractError::MissingKernel("w-planes"));
        }
        if self.planes.dim() != (nw, l, l) {
            return Err(ContractError::Shape {
                name: "w-planes",
                expected: vec![nw, l, l],
                found: self.planes.shape().to_vec(),
            });
        }
        let np = self.params.npix_padded;
        for (name, arr) in [("sphe", &self.sphe), ("sw", &self.sw)] {
            if arr.dim() != (np, np) {
                return Err(ContractError::Shape {
                    name,
                    expected: vec![np, np],
                    found: arr.shape().to_vec(),
                });
            }
        }
        Ok(())
    }

    pub fn publish(&self, ns: &mut Namespace) -> Result<(), PipelineError> {
        ns.put_record("params", &self.params)?;
        ns.put_record("w_values", &self.w_values)?;
        ns.put_ndarray("wplanes", &self.planes)?;
        ns.put_ndarray("sphe", &self.sphe)?;
        ns.put_ndarray("sw", &self.sw)?;
        Ok(())
    }

    pub fn from_namespace(ns: &Namespace) -> Result<Self, PipelineError> {
        for key in ["wplanes", "sphe", "sw"] {
            if !ns.contains(key) {
                return Err(ContractError::MissingKernel(key).into());
            }
        }
        let params: KernelParams = ns.get_record("params")?;
        let w_values: Vec<f64> = ns.get_record("w_values")?;
        let planes = ns.array::<C32>("wplanes")?;
        let sphe = ns.array::<f32>("sphe")?;
        let sw = ns.array::<f32>("sw")?;
        let set = KernelSet {
            params,
            w_values,
            planes: to_fixed::<C32, Ix3>(planes.view()?, "wplanes")?,
            sphe: to_fixed::<f32, Ix2>(sphe.view()?, "sphe")?,
            sw: to_fixed::<f32, Ix2>(sw.view()?, "sw")?,
        };
        set.check()?;
        Ok(set)
    }
}

fn to_fixed<T: Clone, D: ndarray::Dimension>(
    view: ndarray::ArrayViewD<'_, T>,
    name: &'static str,
) -> Result<ndarray::Array<T, D>, ContractError> {
    let found = view.shape().to_vec();
    view.to_owned()
        .into_dimensionality::<D>()
        .map_err(|_| ContractError::Shape {
            name,
            expected: Vec::new(),
            found,
        })
}

fn read_cached(path: &Path, expected: &KernelParams) -> Result<KernelSet, String> {
    let bytes = fs::read(path).map_err(|e| e.to_string())?;
    let set: KernelSet = bincode::deserialize(&bytes).map_err(|e| e.to_string())?;
    if &set.params != expected {
        return Err("parameters differ".into());
    }
    set.check().map_err(|e| e.to_string())?;
    Ok(set)
}

/// Oversampled uv kernels, normalised so that the w = 0 kernel sums to one
/// over integer offsets.
fn w_kernels(p: &KernelParams, w_values: &[f64]) -> Result<Array3<C32>, PipelineError> {
    let m = p.sampling();
    let o = p.oversampling;
    let mo = m * o;
    let l = p.table_len();
    let c = p.centre();
    let field = p.npix_padded as f64 * p.cell_rad;
    let dx = field / m as f64;
    let n0 = n_of(p.l0, p.m0);
    let taper: Vec<f64> = (0..m)
        .map(|j| {
            let nu = 2.0 * (j as f64 - (m / 2) as f64) / m as f64;
            if nu.abs() >= 1.0 {
                0.0
            } else {
                grdsf(nu)
            }
        })
        .collect();
    // q(δl, δm) only depends on the offsets, so tabulate it once
    let q = Array2::from_shape_fn((m, m), |(jy, jx)| {
        let dl = (jx as f64 - (m / 2) as f64) * dx;
        let dm = (jy as f64 - (m / 2) as f64) * dx;
        n_of(p.l0 + dl, p.m0 + dm) - n0 + (p.l0 * dl + p.m0 * dm) / n0
    });

    let helper = FftHelper::<f64>::new(mo);
    let offset = mo / 2 - m / 2;
    let mut buf = vec![Complex::new(0.0f64, 0.0); mo * mo];
    let mut planes = Array3::<C32>::zeros((w_values.len(), l, l));
    for (iw, &w) in w_values.iter().enumerate() {
        buf.fill(Complex::new(0.0, 0.0));
        for jy in 0..m {
            for jx in 0..m {
                let t = taper[jy] * taper[jx];
                buf[(jy + offset) * mo + jx + offset] =
                    Complex::from_polar(t, 2.0 * PI * w * q[[jy, jx]]);
            }
        }
        helper.forward_centred(&mut buf).map_err(PipelineError::Fft)?;
        let base = mo / 2 - c;
        for ty in 0..l {
            let row = (base + ty) * mo + base;
            for tx in 0..l {
                let v = buf[row + tx];
                planes[[iw, ty, tx]] = C32::new(v.re as f32, v.im as f32);
            }
        }
    }

    let h = p.half_support() as i64;
    let mut norm = 0.0f64;
    for ky in -h..=h {
        for kx in -h..=h {
            let iy = (c as i64 + ky * o as i64) as usize;
            let ix = (c as i64 + kx * o as i64) as usize;
            norm += planes[[0, iy, ix]].re as f64;
        }
    }
    if !(norm > 0.0) {
        return Err(ConfigError::Kernel(format!(
            "w = 0 kernel has no gain (support {}, oversampling {o})",
            p.support
        ))
        .into());
    }
    let scale = (1.0 / norm) as f32;
    planes.mapv_inplace(|v| v * scale);
    Ok(planes)
}

/// Image-plane response of the w = 0 kernel at integer cell offsets on the
/// padded facet grid. Equals 1 at the facet centre.
fn taper_response(p: &KernelParams, planes: &Array3<C32>) -> Result<Array2<f32>, PipelineError> {
    let np = p.npix_padded;
    let o = p.oversampling as i64;
    let c = p.centre() as i64;
    let h = p.half_support() as i64;
    let mut grid = vec![C32::new(0.0, 0.0); np * np];
    let half = (np / 2) as i64;
    for ky in -h..=h {
        for kx in -h..=h {
            let v = planes[[0, (c + ky * o) as usize, (c + kx * o) as usize]];
            grid[((half + ky) as usize) * np + (half + kx) as usize] = v;
        }
    }
    FftHelper::<f32>::new(np)
        .inverse_centred(&mut grid)
        .map_err(PipelineError::Fft)?;
    Ok(Array2::from_shape_fn((np, np), |(y, x)| grid[y * np + x].re))
}

/// Facet mask softened by a Gaussian and scaled to a peak of one.
pub fn spatial_weight(mask: &Array2<f32>) -> Result<Array2<f32>, PipelineError> {
    let smooth = gaussian_smooth_2d(&mask.mapv(f64::from), SW_SIGMA_PX)
        .map_err(|e| PipelineError::Fft(e.to_string()))?;
    let max = smooth.fold(0.0f64, |a, &b| a.max(b));
    if max <= 0.0 {
        return Ok(Array2::zeros(mask.raw_dim()));
    }
    Ok(smooth.mapv(|v| (v / max).max(0.0) as f32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ImageConfig, PolMode};
    use crate::tessellation::Tessellation;
    use approx::assert_abs_diff_eq;

    fn small() -> (Tessellation, KernelConfig) {
        let tess = Tessellation::new(&ImageConfig {
            npix: 96,
            cell_arcsec: 20.0,
            nfacets: 2,
            padding: 1.2,
            pol_mode: PolMode::I,
            n_freq_bands: 1,
            ra0: 0.5,
            dec0: 0.9,
        });
        let cfg = KernelConfig {
            support: 7,
            oversampling: 5,
            n_wplanes: 3,
            wmax: 2000.0,
        };
        (tess, cfg)
    }

    #[test]
    fn grdsf_is_one_at_origin_and_zero_outside() {
        assert_abs_diff_eq!(grdsf(0.0), 1.0, epsilon = 1e-5);
        assert_eq!(grdsf(1.01), 0.0);
        assert!(grdsf(0.5) > grdsf(0.8));
    }

    #[test]
    fn w_planes_are_quadratic() {
        let w = w_planes(5, 1600.0);
        assert_eq!(w, vec![0.0, 100.0, 400.0, 900.0, 1600.0]);
        assert_eq!(w_planes(1, 10.0), vec![0.0]);
    }

    #[test]
    fn kernel_set_is_normalised_and_consistent() {
        let (tess, cfg) = small();
        let facet = &tess.facets[0];
        let set = KernelSet::compute(facet, &cfg, tess.cell_rad, &tess.facet_mask(facet)).unwrap();
        let np = facet.npix_padded;
        assert_abs_diff_eq!(set.sphe[[np / 2, np / 2]], 1.0, epsilon = 1e-4);
        assert!(set.sphe[[np / 2, np / 2 + np / 4]] < 1.0);
        // w = 0 kernel is real and symmetric
        let c = set.params.centre();
        let k = set.planes[[0, c, c + 3]];
        assert_abs_diff_eq!(k.im, 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(k.re, set.planes[[0, c, c - 3]].re, epsilon = 1e-6);
        let sw_max = set.sw.fold(0.0f32, |a, &b| a.max(b));
        assert_abs_diff_eq!(sw_max, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn plane_lookup_clamps() {
        let (tess, cfg) = small();
        let facet = &tess.facets[0];
        let set = KernelSet::compute(facet, &cfg, tess.cell_rad, &tess.facet_mask(facet)).unwrap();
        assert_eq!(set.plane_index(0.0), (0, false));
        assert_eq!(set.plane_index(500.0), (1, false));
        assert_eq!(set.plane_index(5000.0), (2, true));
    }

    #[test]
    fn cache_round_trip_and_publish() {
        let dir = tempfile::tempdir().unwrap();
        let (tess, cfg) = small();
        let facet = &tess.facets[1];
        let mask = tess.facet_mask(facet);
        let path = dir.path().join("CF").join("F1.bin");
        let a = KernelSet::load_or_compute(&path, false, facet, &cfg, tess.cell_rad, &mask).unwrap();
        assert!(path.exists());
        let b = KernelSet::load_or_compute(&path, true, facet, &cfg, tess.cell_rad, &mask).unwrap();
        assert_eq!(a.planes, b.planes);

        fs::write(&path, b"garbage").unwrap();
        let c = KernelSet::load_or_compute(&path, true, facet, &cfg, tess.cell_rad, &mask).unwrap();
        assert_eq!(a.sphe, c.sphe);

        let mut ns = Namespace::create(dir.path().join("store")).unwrap();
        a.publish(&mut ns).unwrap();
        let back = KernelSet::from_namespace(&Namespace::attach(ns.path(), true).unwrap()).unwrap();
        assert_eq!(back.planes, a.planes);
        assert_eq!(back.params, a.params);
    }

    #[test]
    fn empty_namespace_is_a_missing_kernel() {
        let dir = tempfile::tempdir().unwrap();
        let ns = Namespace::create(dir.path()).unwrap();
        let err = KernelSet::from_namespace(&ns).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Contract(ContractError::MissingKernel(_))
        ));
    }
}
