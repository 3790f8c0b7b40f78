//! Per-facet gridding and degridding.
//!
//! A [`GridEngine`] is bound to one facet and its [`KernelSet`]. Gridding
//! re-phases each visibility to the facet centre, tilts its uv coordinates,
//! applies the direction-dependent Jones correction and convolves the Stokes
//! products onto the padded uv grid. Degridding is the adjoint: it samples a
//! model grid with the conjugate kernels, re-applies the Jones matrices and
//! rotates the prediction back to the phase centre.

use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayView4, ArrayViewMut4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{DecorrLocation, DirectionWeighting, ImagingConfig, PolMode, RimeConfig};
use crate::error::{ConfigError, ContractError, PipelineError};
use crate::geom::{n_of, C};
use crate::jones::{ApplyMode, Jones, JonesMode, C32};
use crate::kernel::KernelSet;
use crate::solutions::{Direction, SolutionSet};
use crate::store::StripedArray;
use crate::tessellation::FacetGeometry;
use crate::utils::sinc;

impl DirectionWeighting {
    /// Contribution of each calibration direction to a facet centred on
    /// `(l0, m0)`. Weights sum to one.
    pub fn weights(&self, l0: f64, m0: f64, dirs: &[Direction]) -> Vec<(usize, f32)> {
        if dirs.is_empty() {
            return Vec::new();
        }
        let dist: Vec<f64> = dirs
            .iter()
            .map(|d| ((d.l - l0).powi(2) + (d.m - m0).powi(2)).sqrt())
            .collect();
        let nearest = dist
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        match *self {
            DirectionWeighting::Nearest => vec![(nearest, 1.0)],
            DirectionWeighting::Blend {
                scale_deg,
                gamma,
                rel_threshold,
                max_dirs,
            } => {
                let d0 = scale_deg.to_radians();
                let mut w: Vec<(usize, f64)> = dirs
                    .iter()
                    .zip(&dist)
                    .enumerate()
                    .map(|(i, (dir, &d))| (i, dir.flux.abs() / (1.0 + d / d0).powf(gamma)))
                    .collect();
                let max = w.iter().map(|x| x.1).fold(0.0, f64::max);
                if !(max > 0.0) {
                    return vec![(nearest, 1.0)];
                }
                w.retain(|x| x.1 >= rel_threshold * max);
                w.sort_by(|a, b| b.1.total_cmp(&a.1));
                w.truncate(max_dirs.max(1));
                let sum: f64 = w.iter().map(|x| x.1).sum();
                w.into_iter().map(|(i, x)| (i, (x / sum) as f32)).collect()
            }
        }
    }
}

/// Fixed pool of mutexes serialising writes to rows of a shared buffer.
#[derive(Debug)]
pub struct RowLocks {
    locks: Vec<Mutex<()>>,
}

impl RowLocks {
    pub fn new(n: usize) -> Self {
        RowLocks {
            locks: (0..n.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn slot(&self, row: usize) -> usize {
        row % self.locks.len()
    }

    pub fn lock(&self, row: usize) -> MutexGuard<'_, ()> {
        // a poisoned slot only means another writer panicked; the guarded
        // data lives in the mapped buffer, not in the mutex
        match self.locks[self.slot(row)].lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Borrowed visibility chunk as seen by the engines.
#[derive(Clone, Copy)]
pub struct VisChunkView<'a> {
    /// `(nrow, 3)` metres.
    pub uvw: ArrayView2<'a, f64>,
    /// `(nrow, 3)` metres per second.
    pub uvw_rate: ArrayView2<'a, f64>,
    /// `(nrow, nchan, ncorr)`.
    pub data: ArrayView3<'a, C32>,
    pub flags: ArrayView3<'a, u8>,
    /// `(nrow, nchan)`.
    pub weights: ArrayView2<'a, f32>,
    pub times: ArrayView1<'a, f64>,
    pub a0: ArrayView1<'a, i32>,
    pub a1: ArrayView1<'a, i32>,
    pub freqs: ArrayView1<'a, f64>,
    /// Output band of every channel.
    pub chan_mapping: &'a [usize],
    pub dt: f64,
    pub dnu: f64,
}

impl VisChunkView<'_> {
    pub fn nrow(&self) -> usize {
        self.data.dim().0
    }

    pub fn nchan(&self) -> usize {
        self.data.dim().1
    }

    pub fn ncorr(&self) -> usize {
        self.data.dim().2
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Sparsification {
    pub factor: f64,
    pub seed: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GridStats {
    /// `(nband, npol)`.
    pub sum_weights: Array2<f64>,
    /// `(2, nband)`: weighted Jones power and plain weight.
    pub sum_jones: Array2<f64>,
    /// `(2, nchan)`, same per visibility channel.
    pub sum_jones_chan: Array2<f64>,
    pub n_gridded: usize,
    pub n_outside: usize,
    pub n_w_clamped: usize,
}

impl GridStats {
    pub fn zeros(n_bands: usize, npol: usize, nchan: usize) -> Self {
        GridStats {
            sum_weights: Array2::zeros((n_bands, npol)),
            sum_jones: Array2::zeros((2, n_bands)),
            sum_jones_chan: Array2::zeros((2, nchan)),
            ..Default::default()
        }
    }

    /// Adds `other` into `self`. Per-channel sums are only added when the
    /// channel axes agree.
    pub fn accumulate(&mut self, other: &GridStats) {
        if self.sum_weights.dim() == other.sum_weights.dim() {
            self.sum_weights += &other.sum_weights;
        }
        if self.sum_jones.dim() == other.sum_jones.dim() {
            self.sum_jones += &other.sum_jones;
        }
        if self.sum_jones_chan.dim() == other.sum_jones_chan.dim() {
            self.sum_jones_chan += &other.sum_jones_chan;
        } else if self.sum_jones_chan.is_empty() {
            self.sum_jones_chan = other.sum_jones_chan.clone();
        }
        self.n_gridded += other.n_gridded;
        self.n_outside += other.n_outside;
        self.n_w_clamped += other.n_w_clamped;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DegridStats {
    pub n_predicted: usize,
    pub n_outside: usize,
    pub n_w_clamped: usize,
}

/// Kernel taps touched by one sample.
struct Footprint {
    plane: usize,
    ix0: usize,
    iy0: usize,
    tx: Vec<usize>,
    ty: Vec<usize>,
    flipped: bool,
}

pub struct GridEngine<'k> {
    facet: FacetGeometry,
    kernels: &'k KernelSet,
    pol: PolMode,
    n_bands: usize,
    rime: RimeConfig,
    jones_mode: JonesMode,
    grid_apply: ApplyMode,
    degrid_apply: ApplyMode,
    weighting: DirectionWeighting,
    row_locks: Option<Arc<RowLocks>>,
    cu: f64,
    cv: f64,
    n0: f64,
    decorr_lmn: (f64, f64, f64),
}

impl<'k> GridEngine<'k> {
    pub fn new(
        facet: &FacetGeometry,
        kernels: &'k KernelSet,
        cfg: &ImagingConfig,
        pol: PolMode,
        row_locks: Option<Arc<RowLocks>>,
    ) -> Result<Self, ContractError> {
        kernels.check()?;
        if kernels.params.npix_padded != facet.npix_padded {
            return Err(ContractError::Shape {
                name: "kernel grid",
                expected: vec![facet.npix_padded],
                found: vec![kernels.params.npix_padded],
            });
        }
        let n0 = facet.n0();
        let (dl, dm) = match cfg.rime.decorr_location {
            DecorrLocation::Center => (facet.l0, facet.m0),
            DecorrLocation::Edge => facet.lm_min,
        };
        Ok(GridEngine {
            facet: facet.clone(),
            kernels,
            pol,
            n_bands: cfg.image.n_freq_bands,
            rime: cfg.rime.clone(),
            jones_mode: cfg.dde.jones_mode,
            grid_apply: cfg.dde.grid_apply,
            degrid_apply: cfg.dde.degrid_apply,
            weighting: cfg.dde.weighting,
            row_locks,
            cu: -facet.l0 / n0,
            cv: -facet.m0 / n0,
            n0,
            decorr_lmn: (dl, dm, n_of(dl, dm)),
        })
    }

    pub fn facet(&self) -> &FacetGeometry {
        &self.facet
    }

    pub fn grid_shape(&self) -> [usize; 4] {
        let np = self.facet.npix_padded;
        [self.n_bands, self.pol.npol(), np, np]
    }

    /// Validates array shapes, layouts and the channel mapping of a chunk.
    pub fn check_contract(&self, view: &VisChunkView) -> Result<(), PipelineError> {
        let (nrow, nchan, ncorr) = view.data.dim();
        if !matches!(ncorr, 1 | 2 | 4) {
            return Err(ContractError::Correlations(ncorr).into());
        }
        if self.pol == PolMode::IQUV && ncorr != 4 {
            return Err(ConfigError::Polarisation(format!(
                "IQUV imaging needs 4 correlations, data has {ncorr}"
            ))
            .into());
        }
        let shape_err = |name: &'static str, expected: Vec<usize>, found: &[usize]| {
            ContractError::Shape {
                name,
                expected,
                found: found.to_vec(),
            }
        };
        if view.flags.dim() != (nrow, nchan, ncorr) {
            return Err(shape_err("flags", vec![nrow, nchan, ncorr], view.flags.shape()).into());
        }
        if view.weights.dim() != (nrow, nchan) {
            return Err(shape_err("weights", vec![nrow, nchan], view.weights.shape()).into());
        }
        if view.uvw.dim() != (nrow, 3) {
            return Err(shape_err("uvw", vec![nrow, 3], view.uvw.shape()).into());
        }
        if view.uvw_rate.dim() != (nrow, 3) {
            return Err(shape_err("uvw_rate", vec![nrow, 3], view.uvw_rate.shape()).into());
        }
        if view.times.len() != nrow {
            return Err(shape_err("times", vec![nrow], view.times.shape()).into());
        }
        if view.freqs.len() != nchan {
            return Err(shape_err("freqs", vec![nchan], view.freqs.shape()).into());
        }
        if view.a0.len() != nrow || view.a1.len() != nrow {
            return Err(ContractError::AntennaRows {
                antennas: view.a0.len().min(view.a1.len()),
                rows: nrow,
            }
            .into());
        }
        if view.chan_mapping.len() != nchan {
            return Err(shape_err("chan_mapping", vec![nchan], &[view.chan_mapping.len()]).into());
        }
        if let Some((chan, &band)) = view
            .chan_mapping
            .iter()
            .enumerate()
            .find(|(_, &b)| b >= self.n_bands)
        {
            return Err(ContractError::ChannelMapping {
                chan,
                band,
                nbands: self.n_bands,
            }
            .into());
        }
        for (name, ok) in [
            ("data", view.data.is_standard_layout()),
            ("flags", view.flags.is_standard_layout()),
            ("weights", view.weights.is_standard_layout()),
            ("uvw", view.uvw.is_standard_layout()),
        ] {
            if !ok {
                return Err(ContractError::NotContiguous(name).into());
            }
        }
        Ok(())
    }

    fn check_grid(&self, shape: &[usize]) -> Result<(), ContractError> {
        let want = self.grid_shape();
        if shape != &want[..] {
            return Err(ContractError::Shape {
                name: "grid",
                expected: want.to_vec(),
                found: shape.to_vec(),
            });
        }
        Ok(())
    }

    fn solution_map<'s>(
        &self,
        view: &VisChunkView,
        sols: Option<&'s SolutionSet>,
        time_map: Option<&[usize]>,
    ) -> Result<Option<(&'s SolutionSet, Vec<usize>, Vec<(usize, f32)>)>, PipelineError> {
        let Some(sols) = sols else {
            return Ok(None);
        };
        let map = match time_map {
            Some(m) => m.to_vec(),
            None => sols.mapping_for(&view.times.to_vec()),
        };
        if map.len() != view.nrow() {
            return Err(ContractError::Shape {
                name: "time map",
                expected: vec![view.nrow()],
                found: vec![map.len()],
            }
            .into());
        }
        if sols.vis_to_sol_chan.len() != view.nchan() {
            return Err(ContractError::Shape {
                name: "solution channel map",
                expected: vec![view.nchan()],
                found: vec![sols.vis_to_sol_chan.len()],
            }
            .into());
        }
        let n_ant = sols.n_ants();
        if let Some(&bad) = view
            .a0
            .iter()
            .chain(view.a1.iter())
            .find(|&&a| a < 0 || a as usize >= n_ant)
        {
            return Err(ContractError::AntennaRows {
                antennas: n_ant,
                rows: bad.max(0) as usize,
            }
            .into());
        }
        let dirs = self
            .weighting
            .weights(self.facet.l0, self.facet.m0, &sols.directions);
        Ok(Some((sols, map, dirs)))
    }

    fn effective_jones(
        &self,
        sols: &SolutionSet,
        dirs: &[(usize, f32)],
        t: usize,
        ant: usize,
        chan: usize,
        apply: ApplyMode,
    ) -> Jones {
        let mut j = Jones::zero();
        for &(d, w) in dirs {
            j += sols.jones[[t, d, ant, chan]].scale(w);
        }
        j.restrict(self.jones_mode).strip(apply)
    }

    /// Phase rotating the visibility from the phase centre to the facet
    /// centre, in radians, for uvw in wavelengths.
    fn facet_phase(&self, u: f64, v: f64, w: f64) -> f64 {
        2.0 * PI * (u * self.facet.l0 + v * self.facet.m0 + w * (self.n0 - 1.0))
    }

    fn decorrelation(&self, view: &VisChunkView, row: usize, uvw: [f64; 3], freq: f64) -> f64 {
        let mode = self.rime.decorr_mode;
        let (l, m, n) = self.decorr_lmn;
        let mut factor = 1.0;
        if mode.freq() {
            let phi = 2.0 * PI * (uvw[0] * l + uvw[1] * m + uvw[2] * (n - 1.0)) * freq / C;
            factor *= sinc(phi * view.dnu / (2.0 * freq));
        }
        if mode.time() {
            let r = view.uvw_rate.row(row);
            let rate = r[0] * l + r[1] * m + r[2] * (n - 1.0);
            factor *= sinc(PI * rate * freq / C * view.dt);
        }
        factor
    }

    fn footprint(&self, u: f64, v: f64, w: f64) -> Option<(Footprint, bool)> {
        let p = &self.kernels.params;
        let np = p.npix_padded as f64;
        let du = p.du();
        let h = p.half_support() as i64;
        let o = p.oversampling as f64;
        let c = p.centre() as i64;
        let flipped = w < 0.0;
        let (u, v) = if flipped { (-u, -v) } else { (u, v) };
        let (plane, clamped) = self.kernels.plane_index(w.abs());
        let px = u / du + np / 2.0;
        let py = v / du + np / 2.0;
        let ix = px.round() as i64;
        let iy = py.round() as i64;
        if ix - h < 0 || iy - h < 0 || ix + h >= np as i64 || iy + h >= np as i64 {
            return None;
        }
        let taps = |i0: i64, pos: f64| -> Vec<usize> {
            (-h..=h)
                .map(|k| (c + (((i0 + k) as f64 - pos) * o).round() as i64) as usize)
                .collect()
        };
        Some((
            Footprint {
                plane,
                ix0: (ix - h) as usize,
                iy0: (iy - h) as usize,
                tx: taps(ix, px),
                ty: taps(iy, py),
                flipped,
            },
            clamped,
        ))
    }

    /// Grids a chunk into `grid` (`(nband, npol, Np, Np)`), returning the
    /// weight and Jones sums of this call.
    pub fn grid(
        &self,
        view: &VisChunkView,
        grid: &mut ArrayViewMut4<C32>,
        sols: Option<&SolutionSet>,
        time_map: Option<&[usize]>,
        do_psf: bool,
        sparsification: Option<Sparsification>,
    ) -> Result<GridStats, PipelineError> {
        self.check_contract(view)?;
        self.check_grid(grid.shape())?;
        let sol = self.solution_map(view, sols, time_map)?;
        let (nrow, nchan, ncorr) = view.data.dim();
        let npol = self.pol.npol();
        let mut stats = GridStats::zeros(self.n_bands, npol, nchan);
        let mut rng = sparsification.map(|s| (StdRng::seed_from_u64(s.seed), (1.0 / s.factor).clamp(0.0, 1.0)));
        let planes = &self.kernels.planes;

        for row in 0..nrow {
            if let Some((rng, p)) = rng.as_mut() {
                if !rng.gen_bool(*p) {
                    continue;
                }
            }
            let (a0, a1) = (view.a0[row], view.a1[row]);
            if a0 == a1 {
                continue;
            }
            let uvw_m = [view.uvw[[row, 0]], view.uvw[[row, 1]], view.uvw[[row, 2]]];
            for chan in 0..nchan {
                let wt = view.weights[[row, chan]];
                if !(wt > 0.0) || (0..ncorr).any(|k| view.flags[[row, chan, k]] != 0) {
                    continue;
                }
                let freq = view.freqs[chan];
                let band = view.chan_mapping[chan];
                let s = freq / C;
                let (u, v, w) = (uvw_m[0] * s, uvw_m[1] * s, uvw_m[2] * s);

                let mut vis = if do_psf {
                    Jones::identity()
                } else {
                    let mut corr = [C32::new(0.0, 0.0); 4];
                    for (k, c) in corr.iter_mut().enumerate().take(ncorr) {
                        *c = view.data[[row, chan, k]];
                    }
                    corr_to_matrix(&corr[..ncorr], ncorr)
                };
                let jones_pow = match &sol {
                    Some((sols, map, dirs)) => {
                        let sc = sols.vis_to_sol_chan[chan];
                        let ja = self.effective_jones(sols, dirs, map[row], a0 as usize, sc, self.grid_apply);
                        let jb = self.effective_jones(sols, dirs, map[row], a1 as usize, sc, self.grid_apply);
                        vis = ja.h() * vis * jb;
                        ja.diag_mean_norm_sqr() as f64 * jb.diag_mean_norm_sqr() as f64
                    }
                    None => 1.0,
                };
                // the PSF is a unit source at the facet centre
                let rot = if do_psf {
                    C32::new(1.0, 0.0)
                } else {
                    unit_phasor(self.facet_phase(u, v, w))
                };
                let decorr = self.decorrelation(view, row, uvw_m, freq) as f32;
                let stokes = matrix_to_stokes(&vis, self.pol);

                let Some((fp, clamped)) = self.footprint(u + w * self.cu, v + w * self.cv, w) else {
                    stats.n_outside += 1;
                    continue;
                };
                if clamped {
                    stats.n_w_clamped += 1;
                }
                for (ipol, &sv) in stokes.iter().enumerate().take(npol) {
                    let mut val = sv * rot * (wt * decorr);
                    if fp.flipped {
                        val = val.conj();
                    }
                    for (dy, &ty) in fp.ty.iter().enumerate() {
                        let iy = fp.iy0 + dy;
                        for (dx, &tx) in fp.tx.iter().enumerate() {
                            grid[[band, ipol, iy, fp.ix0 + dx]] += val * planes[[fp.plane, ty, tx]];
                        }
                    }
                    stats.sum_weights[[band, ipol]] += wt as f64;
                }
                let wt = wt as f64;
                stats.sum_jones[[0, band]] += wt * jones_pow;
                stats.sum_jones[[1, band]] += wt;
                stats.sum_jones_chan[[0, chan]] += wt * jones_pow;
                stats.sum_jones_chan[[1, chan]] += wt;
                stats.n_gridded += 1;
            }
        }
        debug!(
            "facet {}: gridded {} samples ({} outside grid, {} beyond wmax)",
            self.facet.index, stats.n_gridded, stats.n_outside, stats.n_w_clamped
        );
        Ok(stats)
    }

    /// Predicts visibilities `(nrow, nchan, ncorr)` from a Fourier-domain
    /// model grid.
    pub fn predict(
        &self,
        model: &ArrayView4<C32>,
        view: &VisChunkView,
        sols: Option<&SolutionSet>,
        time_map: Option<&[usize]>,
    ) -> Result<(Array3<C32>, DegridStats), PipelineError> {
        self.check_contract(view)?;
        self.check_grid(model.shape())?;
        let sol = self.solution_map(view, sols, time_map)?;
        let (nrow, nchan, ncorr) = view.data.dim();
        let npol = self.pol.npol();
        let planes = &self.kernels.planes;
        let mut out = Array3::<C32>::zeros((nrow, nchan, ncorr));
        let mut stats = DegridStats::default();

        for row in 0..nrow {
            let (a0, a1) = (view.a0[row], view.a1[row]);
            if a0 == a1 {
                continue;
            }
            let uvw_m = [view.uvw[[row, 0]], view.uvw[[row, 1]], view.uvw[[row, 2]]];
            for chan in 0..nchan {
                let freq = view.freqs[chan];
                let band = view.chan_mapping[chan];
                let s = freq / C;
                let (u, v, w) = (uvw_m[0] * s, uvw_m[1] * s, uvw_m[2] * s);
                let Some((fp, clamped)) = self.footprint(u + w * self.cu, v + w * self.cv, w) else {
                    stats.n_outside += 1;
                    continue;
                };
                if clamped {
                    stats.n_w_clamped += 1;
                }
                let mut stokes = [C32::new(0.0, 0.0); 4];
                for (ipol, sv) in stokes.iter_mut().enumerate().take(npol) {
                    let mut acc = C32::new(0.0, 0.0);
                    for (dy, &ty) in fp.ty.iter().enumerate() {
                        let iy = fp.iy0 + dy;
                        for (dx, &tx) in fp.tx.iter().enumerate() {
                            acc += model[[band, ipol, iy, fp.ix0 + dx]] * planes[[fp.plane, ty, tx]].conj();
                        }
                    }
                    *sv = if fp.flipped { acc.conj() } else { acc };
                }
                let mut vis = stokes_to_matrix(&stokes, self.pol);
                if let Some((sols, map, dirs)) = &sol {
                    let sc = sols.vis_to_sol_chan[chan];
                    let ja = self.effective_jones(sols, dirs, map[row], a0 as usize, sc, self.degrid_apply);
                    let jb = self.effective_jones(sols, dirs, map[row], a1 as usize, sc, self.degrid_apply);
                    vis = ja * vis * jb.h();
                }
                let decorr = self.decorrelation(view, row, uvw_m, freq) as f32;
                let rot = unit_phasor(-self.facet_phase(u, v, w)) * decorr;
                let corr = matrix_to_corr(&vis, ncorr);
                for (k, c) in corr.iter().enumerate().take(ncorr) {
                    out[[row, chan, k]] = *c * rot;
                }
                stats.n_predicted += 1;
            }
        }
        Ok((out, stats))
    }

    /// Subtracts the prediction from a shared residual buffer
    /// `(nrow, nchan, ncorr)`, holding the row lock of every row written.
    pub fn degrid(
        &self,
        model: &ArrayView4<C32>,
        view: &VisChunkView,
        residual: &mut StripedArray<C32>,
        sols: Option<&SolutionSet>,
        time_map: Option<&[usize]>,
    ) -> Result<DegridStats, PipelineError> {
        let locks = self
            .row_locks
            .as_ref()
            .ok_or_else(|| PipelineError::InvalidState {
                expected: "engine with row locks",
                found: "engine without row locks".into(),
            })?;
        let (pred, stats) = self.predict(model, view, sols, time_map)?;
        let expected = [view.nrow(), view.nchan(), view.ncorr()];
        if residual.shape() != &expected[..] {
            return Err(ContractError::Shape {
                name: "residual",
                expected: expected.to_vec(),
                found: residual.shape().to_vec(),
            }
            .into());
        }
        for (row, p) in pred.outer_iter().enumerate() {
            let _guard = locks.lock(row);
            let dst = residual.row_mut(row);
            for (d, s) in dst.iter_mut().zip(p.iter()) {
                *d -= *s;
            }
        }
        debug!(
            "facet {}: predicted {} samples ({} outside grid)",
            self.facet.index, stats.n_predicted, stats.n_outside
        );
        Ok(stats)
    }
}

fn unit_phasor(phase: f64) -> C32 {
    C32::new(phase.cos() as f32, phase.sin() as f32)
}

/// Correlations `[XX, XY, YX, YY]`, `[XX, YY]` or `[I]` as a 2×2 matrix.
pub fn corr_to_matrix(corr: &[C32], ncorr: usize) -> Jones {
    let zero = C32::new(0.0, 0.0);
    match (ncorr, corr) {
        (4, &[xx, xy, yx, yy]) => Jones([xx, xy, yx, yy]),
        (2, &[xx, yy]) => Jones::diag(xx, yy),
        (1, &[i]) => Jones::scalar(i),
        _ => Jones([zero; 4]),
    }
}

pub fn matrix_to_corr(m: &Jones, ncorr: usize) -> [C32; 4] {
    let zero = C32::new(0.0, 0.0);
    match ncorr {
        4 => m.0,
        2 => [m.0[0], m.0[3], zero, zero],
        _ => [(m.0[0] + m.0[3]) * 0.5, zero, zero, zero],
    }
}

/// Stokes products of a linear-feed coherency matrix.
pub fn matrix_to_stokes(m: &Jones, pol: PolMode) -> [C32; 4] {
    let [xx, xy, yx, yy] = m.0;
    let i = (xx + yy) * 0.5;
    match pol {
        PolMode::I => [i, C32::new(0.0, 0.0), C32::new(0.0, 0.0), C32::new(0.0, 0.0)],
        PolMode::IQUV => [
            i,
            (xx - yy) * 0.5,
            (xy + yx) * 0.5,
            (xy - yx) * C32::new(0.0, -0.5),
        ],
    }
}

pub fn stokes_to_matrix(s: &[C32; 4], pol: PolMode) -> Jones {
    match pol {
        PolMode::I => Jones::scalar(s[0]),
        PolMode::IQUV => {
            let j = C32::new(0.0, 1.0);
            Jones([s[0] + s[1], s[2] + j * s[3], s[2] - j * s[3], s[0] - s[1]])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Args;
    use crate::config::DecorrMode;
    use crate::solutions::SolutionKind;
    use crate::tessellation::Tessellation;
    use crate::utils::FftHelper;
    use approx::assert_abs_diff_eq;
    use clap::Parser;
    use ndarray::{Array1, Array4};

    fn config(extra: &[&str]) -> ImagingConfig {
        let mut argv = vec![
            "facet_imager",
            "--workers",
            "1",
            "--npix",
            "64",
            "--nfacets",
            "1",
            "--cell",
            "60",
        ];
        argv.extend_from_slice(extra);
        ImagingConfig::from_args(&Args::try_parse_from(argv).unwrap(), None, |_| false).unwrap()
    }

    fn kernels(cfg: &ImagingConfig) -> (Tessellation, KernelSet) {
        let tess = Tessellation::new(&cfg.image);
        let facet = &tess.facets[0];
        let mask = tess.facet_mask(facet);
        let set = KernelSet::compute(facet, &cfg.kernel, tess.cell_rad, &mask).unwrap();
        (tess, set)
    }

    struct Chunk {
        uvw: Array2<f64>,
        rate: Array2<f64>,
        data: Array3<C32>,
        flags: Array3<u8>,
        weights: Array2<f32>,
        times: Array1<f64>,
        a0: Array1<i32>,
        a1: Array1<i32>,
        freqs: Array1<f64>,
        chan_mapping: Vec<usize>,
    }

    impl Chunk {
        /// Random coplanar uv coverage within `uv_max` wavelengths at 150 MHz,
        /// holding a unit source at `(l, m)`.
        fn point_source(nrow: usize, uv_max: f64, l: f64, m: f64) -> Self {
            let mut rng = StdRng::seed_from_u64(7);
            let freq = 1.5e8;
            let lam = C / freq;
            let uvw = Array2::from_shape_fn((nrow, 3), |(_, k)| {
                if k == 2 {
                    0.0
                } else {
                    rng.gen_range(-uv_max..uv_max) * lam
                }
            });
            let data = Array3::from_shape_fn((nrow, 1, 2), |(r, _, _)| {
                let (u, v) = (uvw[[r, 0]] / lam, uvw[[r, 1]] / lam);
                C32::from_polar(1.0, (-2.0 * PI * (u * l + v * m)) as f32)
            });
            Chunk {
                uvw,
                rate: Array2::zeros((nrow, 3)),
                data,
                flags: Array3::zeros((nrow, 1, 2)),
                weights: Array2::ones((nrow, 1)),
                times: Array1::from_shape_fn(nrow, |r| r as f64),
                a0: Array1::zeros(nrow),
                a1: Array1::ones(nrow),
                freqs: Array1::from_elem(1, freq),
                chan_mapping: vec![0],
            }
        }

        fn view(&self) -> VisChunkView<'_> {
            VisChunkView {
                uvw: self.uvw.view(),
                uvw_rate: self.rate.view(),
                data: self.data.view(),
                flags: self.flags.view(),
                weights: self.weights.view(),
                times: self.times.view(),
                a0: self.a0.view(),
                a1: self.a1.view(),
                freqs: self.freqs.view(),
                chan_mapping: &self.chan_mapping,
                dt: 10.0,
                dnu: 1.0e5,
            }
        }
    }

    fn dirty(grid: &Array4<C32>, set: &KernelSet, sum_w: f64) -> Array2<f64> {
        let np = set.params.npix_padded;
        let mut buf: Vec<C32> = grid.iter().take(np * np).copied().collect();
        FftHelper::<f32>::new(np).inverse_centred(&mut buf).unwrap();
        Array2::from_shape_fn((np, np), |(y, x)| {
            buf[y * np + x].re as f64 / set.sphe[[y, x]] as f64 / sum_w
        })
    }

    /// 3x3 facets of 32 px with the given smearing compensation.
    fn smearing_setup(mode: DecorrMode, location: DecorrLocation) -> (ImagingConfig, Tessellation) {
        let mut cfg = config(&[]);
        cfg.image.npix = 96;
        cfg.image.nfacets = 3;
        cfg.rime.decorr_mode = mode;
        cfg.rime.decorr_location = location;
        let tess = Tessellation::new(&cfg.image);
        (cfg, tess)
    }

    /// Factor for one sample with long baselines and a fast uvw drift.
    fn smearing_factor(cfg: &ImagingConfig, tess: &Tessellation, facet: usize) -> f64 {
        let geom = &tess.facets[facet];
        let mask = tess.facet_mask(geom);
        let set = KernelSet::compute(geom, &cfg.kernel, tess.cell_rad, &mask).unwrap();
        let engine = GridEngine::new(geom, &set, cfg, PolMode::I, None).unwrap();
        let mut chunk = Chunk::point_source(1, 10.0, 0.0, 0.0);
        chunk.rate = Array2::from_shape_vec((1, 3), vec![5.0, -3.0, 0.4]).unwrap();
        engine.decorrelation(&chunk.view(), 0, SMEARING_UVW, SMEARING_FREQ)
    }

    const SMEARING_UVW: [f64; 3] = [6.0e4, -4.0e4, 1.5e3];
    const SMEARING_FREQ: f64 = 1.5e8;

    /// Bandwidth and time factors at `(l, m)` for the sample above, with the
    /// `dnu` and `dt` of `Chunk::view`.
    fn expected_factors(l: f64, m: f64) -> (f64, f64) {
        let n = n_of(l, m);
        let [u, v, w] = SMEARING_UVW;
        let nu = SMEARING_FREQ;
        let phi = 2.0 * PI * (u * l + v * m + w * (n - 1.0)) * nu / C;
        let rate = 5.0 * l - 3.0 * m + 0.4 * (n - 1.0);
        (sinc(phi * 1.0e5 / (2.0 * nu)), sinc(PI * rate * nu / C * 10.0))
    }

    #[test]
    fn bandwidth_smearing_factor() {
        let (cfg, tess) = smearing_setup(DecorrMode::F, DecorrLocation::Center);
        let f = &tess.facets[0];
        let (freq, _) = expected_factors(f.l0, f.m0);
        let got = smearing_factor(&cfg, &tess, 0);
        assert_abs_diff_eq!(got, freq, epsilon = 1e-12);
        assert!(got < 0.999, "factor {got}");
    }

    #[test]
    fn time_smearing_factor_uses_uvw_rate() {
        let (cfg, tess) = smearing_setup(DecorrMode::T, DecorrLocation::Center);
        let f = &tess.facets[0];
        let (_, time) = expected_factors(f.l0, f.m0);
        let got = smearing_factor(&cfg, &tess, 0);
        assert_abs_diff_eq!(got, time, epsilon = 1e-12);
        assert!(got < 0.999, "factor {got}");
    }

    #[test]
    fn combined_smearing_is_the_product() {
        let (cfg, tess) = smearing_setup(DecorrMode::FT, DecorrLocation::Center);
        let f = &tess.facets[0];
        let (freq, time) = expected_factors(f.l0, f.m0);
        assert_abs_diff_eq!(smearing_factor(&cfg, &tess, 0), freq * time, epsilon = 1e-12);

        let (cfg, tess) = smearing_setup(DecorrMode::None, DecorrLocation::Center);
        assert_eq!(smearing_factor(&cfg, &tess, 0), 1.0);
    }

    #[test]
    fn edge_smearing_uses_the_point_closest_to_the_phase_centre() {
        let (cfg, tess) = smearing_setup(DecorrMode::FT, DecorrLocation::Edge);
        assert_eq!(tess.central_facet(), 4);
        assert_eq!(smearing_factor(&cfg, &tess, 4), 1.0);

        let corner = &tess.facets[0];
        let (l, m) = corner.lm_min;
        assert!(l != 0.0 && m != 0.0);
        let (freq, time) = expected_factors(l, m);
        let edge = smearing_factor(&cfg, &tess, 0);
        assert_abs_diff_eq!(edge, freq * time, epsilon = 1e-12);

        let (cfg, tess) = smearing_setup(DecorrMode::FT, DecorrLocation::Center);
        assert!(smearing_factor(&cfg, &tess, 0) < edge);
    }

    #[test]
    fn row_locks_wrap_around() {
        let locks = RowLocks::new(3);
        assert_eq!(locks.slot(7), 1);
        let _a = locks.lock(0);
        let _b = locks.lock(1);
        assert_eq!(locks.len(), 3);
    }

    #[test]
    fn blend_weights_are_truncated_and_normalised() {
        let dir = |l: f64, flux: f64| Direction {
            ra: 0.0,
            dec: 0.0,
            l,
            m: 0.0,
            flux,
            cluster: 0,
        };
        let dirs = vec![dir(0.0, 1.0), dir(0.01, 1.0), dir(0.02, 1.0), dir(0.5, 1.0)];
        let policy = DirectionWeighting::Blend {
            scale_deg: 1.0,
            gamma: 4.0,
            rel_threshold: 0.2,
            max_dirs: 2,
        };
        let w = policy.weights(0.004, 0.0, &dirs);
        assert_eq!(w.len(), 2);
        assert_eq!(w[0].0, 0);
        assert_eq!(w[1].0, 1);
        assert_abs_diff_eq!(w.iter().map(|x| x.1).sum::<f32>(), 1.0, epsilon = 1e-6);
        assert_eq!(DirectionWeighting::Nearest.weights(0.018, 0.0, &dirs), vec![(2, 1.0)]);
    }

    #[test]
    fn stokes_round_trip_through_correlations() {
        let s = [
            C32::new(2.0, 0.0),
            C32::new(0.5, 0.0),
            C32::new(-0.25, 0.0),
            C32::new(0.1, 0.0),
        ];
        let m = stokes_to_matrix(&s, PolMode::IQUV);
        let back = matrix_to_stokes(&m, PolMode::IQUV);
        for (a, b) in s.iter().zip(&back) {
            assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-6);
            assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-6);
        }
    }

    #[test]
    fn point_source_images_at_its_pixel() {
        let cfg = config(&[]);
        let (tess, set) = kernels(&cfg);
        let facet = &tess.facets[0];
        let engine = GridEngine::new(facet, &set, &cfg, PolMode::I, None).unwrap();
        let np = facet.npix_padded;
        let (dx, dy) = (5i64, -3i64);
        let chunk = Chunk::point_source(
            3000,
            0.45 / tess.cell_rad,
            dx as f64 * tess.cell_rad,
            dy as f64 * tess.cell_rad,
        );
        let mut grid = Array4::<C32>::zeros(engine.grid_shape());
        let stats = engine
            .grid(&chunk.view(), &mut grid.view_mut(), None, None, false, None)
            .unwrap();
        assert_eq!(stats.n_outside, 0);
        assert_eq!(stats.n_gridded, 3000);
        let img = dirty(&grid, &set, stats.sum_weights[[0, 0]]);
        let (cy, cx) = ((np as i64 / 2 + dy) as usize, (np as i64 / 2 + dx) as usize);
        assert_abs_diff_eq!(img[[cy, cx]], 1.0, epsilon = 0.01);
        // brightest pixel where the taper is well conditioned
        let peak = img
            .indexed_iter()
            .filter(|((y, x), _)| set.sphe[[*y, *x]] > 0.1)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(idx, _)| idx)
            .unwrap();
        assert_eq!(peak, (cy, cx));
    }

    #[test]
    fn prediction_matches_direct_transform() {
        let cfg = config(&[]);
        let (tess, set) = kernels(&cfg);
        let facet = &tess.facets[0];
        let engine = GridEngine::new(facet, &set, &cfg, PolMode::I, None).unwrap();
        let np = facet.npix_padded;
        let (dx, dy) = (4i64, 2i64);
        let chunk = Chunk::point_source(200, 0.3 / tess.cell_rad, dx as f64 * tess.cell_rad, dy as f64 * tess.cell_rad);

        let mut model = vec![C32::new(0.0, 0.0); np * np];
        let (cy, cx) = ((np as i64 / 2 + dy) as usize, (np as i64 / 2 + dx) as usize);
        model[cy * np + cx] = C32::new(1.0 / set.sphe[[cy, cx]], 0.0);
        FftHelper::<f32>::new(np).forward_centred(&mut model).unwrap();
        let model = Array4::from_shape_vec((1, 1, np, np), model).unwrap();

        let (pred, stats) = engine.predict(&model.view(), &chunk.view(), None, None).unwrap();
        assert_eq!(stats.n_predicted, 200);
        for r in 0..200 {
            for k in 0..2 {
                let want = chunk.data[[r, 0, k]];
                assert_abs_diff_eq!(pred[[r, 0, k]].re, want.re, epsilon = 0.03);
                assert_abs_diff_eq!(pred[[r, 0, k]].im, want.im, epsilon = 0.03);
            }
        }
    }

    #[test]
    fn negative_w_predicts_the_conjugate() {
        let cfg = config(&["--wplanes", "5", "--wmax", "200"]);
        let (tess, set) = kernels(&cfg);
        let engine = GridEngine::new(&tess.facets[0], &set, &cfg, PolMode::I, None).unwrap();
        let np = set.params.npix_padded;
        let mut model = vec![C32::new(0.0, 0.0); np * np];
        model[(np / 2 + 3) * np + np / 2 - 2] = C32::new(1.0, 0.0);
        FftHelper::<f32>::new(np).forward_centred(&mut model).unwrap();
        let model = Array4::from_shape_vec((1, 1, np, np), model).unwrap();

        let mut chunk = Chunk::point_source(2, 0.2 / tess.cell_rad, 0.0, 0.0);
        let lam = C / 1.5e8;
        for k in 0..3 {
            chunk.uvw[[0, k]] = [3.0, -2.0, 40.0][k] * lam;
            chunk.uvw[[1, k]] = -chunk.uvw[[0, k]];
        }
        let (pred, _) = engine.predict(&model.view(), &chunk.view(), None, None).unwrap();
        assert_abs_diff_eq!(pred[[0, 0, 0]].re, pred[[1, 0, 0]].re, epsilon = 1e-5);
        assert_abs_diff_eq!(pred[[0, 0, 0]].im, -pred[[1, 0, 0]].im, epsilon = 1e-5);
    }

    #[test]
    fn jones_power_is_accumulated() {
        let cfg = config(&[]);
        let (tess, set) = kernels(&cfg);
        let facet = &tess.facets[0];
        let engine = GridEngine::new(facet, &set, &cfg, PolMode::I, None).unwrap();
        let chunk = Chunk::point_source(50, 0.2 / tess.cell_rad, 0.0, 0.0);
        let jones = Array4::from_elem((1, 1, 2, 1), Jones::scalar(C32::from_polar(2.0, 0.3)));
        let dir = Direction {
            ra: 0.0,
            dec: 0.0,
            l: 0.0,
            m: 0.0,
            flux: 1.0,
            cluster: 0,
        };
        let sols = SolutionSet::new(SolutionKind::Calibration, vec![-1.0], vec![1.0e6], jones, vec![dir], vec![0]).unwrap();
        let mut grid = Array4::<C32>::zeros(engine.grid_shape());
        let stats = engine
            .grid(&chunk.view(), &mut grid.view_mut(), Some(&sols), None, false, None)
            .unwrap();
        assert_abs_diff_eq!(stats.sum_jones[[0, 0]] / stats.sum_jones[[1, 0]], 16.0, epsilon = 1e-3);
        assert_eq!(stats.sum_jones_chan, stats.sum_jones);
    }

    #[test]
    fn flagged_and_autocorrelation_rows_are_skipped() {
        let cfg = config(&[]);
        let (tess, set) = kernels(&cfg);
        let engine = GridEngine::new(&tess.facets[0], &set, &cfg, PolMode::I, None).unwrap();
        let mut chunk = Chunk::point_source(10, 0.2 / tess.cell_rad, 0.0, 0.0);
        chunk.flags[[0, 0, 1]] = 1;
        chunk.a1[1] = 0;
        chunk.weights[[2, 0]] = 0.0;
        let mut grid = Array4::<C32>::zeros(engine.grid_shape());
        let stats = engine
            .grid(&chunk.view(), &mut grid.view_mut(), None, None, false, None)
            .unwrap();
        assert_eq!(stats.n_gridded, 7);
        assert_abs_diff_eq!(stats.sum_weights[[0, 0]], 7.0, epsilon = 1e-9);
    }

    #[test]
    fn sparsification_is_seeded() {
        let cfg = config(&[]);
        let (tess, set) = kernels(&cfg);
        let engine = GridEngine::new(&tess.facets[0], &set, &cfg, PolMode::I, None).unwrap();
        let chunk = Chunk::point_source(400, 0.2 / tess.cell_rad, 0.0, 0.0);
        let run = |seed| {
            let mut grid = Array4::<C32>::zeros(engine.grid_shape());
            let sp = Sparsification { factor: 4.0, seed };
            engine
                .grid(&chunk.view(), &mut grid.view_mut(), None, None, false, Some(sp))
                .unwrap()
                .n_gridded
        };
        let n = run(11);
        assert_eq!(n, run(11));
        assert!(n > 50 && n < 150, "{n}");
    }

    #[test]
    fn shape_mismatches_are_contract_errors() {
        let cfg = config(&[]);
        let (tess, set) = kernels(&cfg);
        let engine = GridEngine::new(&tess.facets[0], &set, &cfg, PolMode::I, None).unwrap();
        let mut chunk = Chunk::point_source(10, 0.2 / tess.cell_rad, 0.0, 0.0);
        chunk.flags = Array3::zeros((9, 1, 2));
        let mut grid = Array4::<C32>::zeros(engine.grid_shape());
        let err = engine
            .grid(&chunk.view(), &mut grid.view_mut(), None, None, false, None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Contract(ContractError::Shape { name: "flags", .. })));

        let chunk = Chunk::point_source(10, 0.2 / tess.cell_rad, 0.0, 0.0);
        let mut small = Array4::<C32>::zeros((1, 1, 8, 8));
        assert!(engine
            .grid(&chunk.view(), &mut small.view_mut(), None, None, false, None)
            .is_err());

        let iquv = GridEngine::new(&tess.facets[0], &set, &cfg, PolMode::IQUV, None).unwrap();
        let err = iquv.check_contract(&chunk.view()).unwrap_err();
        assert!(matches!(err, PipelineError::Config(ConfigError::Polarisation(_))));
    }

    #[test]
    fn degrid_without_row_locks_is_refused() {
        let cfg = config(&[]);
        let (tess, set) = kernels(&cfg);
        let engine = GridEngine::new(&tess.facets[0], &set, &cfg, PolMode::I, None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut ns = crate::store::Namespace::create(dir.path().join("ns")).unwrap();
        let chunk = Chunk::point_source(4, 0.2 / tess.cell_rad, 0.0, 0.0);
        ns.put_ndarray("residual", &chunk.data).unwrap();
        let mut residual = ns.array_striped::<C32>("residual").unwrap();
        let model = Array4::<C32>::zeros(engine.grid_shape());
        assert!(engine
            .degrid(&model.view(), &chunk.view(), &mut residual, None, None)
            .is_err());

        let locked = GridEngine::new(&tess.facets[0], &set, &cfg, PolMode::I, Some(Arc::new(RowLocks::new(2)))).unwrap();
        locked
            .degrid(&model.view(), &chunk.view(), &mut residual, None, None)
            .unwrap();
        // a zero model leaves the residual untouched
        assert_eq!(residual.row(1), chunk.data.slice(ndarray::s![1, .., ..]).as_slice().unwrap());
    }
}
