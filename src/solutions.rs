//! Direction-dependent calibration and beam solutions.
//!
//! A [`SolutionSet`] is a list of time intervals, each holding one Jones
//! matrix per direction, antenna and solution channel. Calibration sets are
//! read from JSON solution files, beam sets are evaluated from the analytic
//! [`BeamModel`], and the two are merged into one product set when both
//! exist. All three are cached on disk keyed by the configuration that
//! produced them.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use log::{debug, info, warn};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::cache::CacheManager;
use crate::config::{BeamConfig, BeamModel, DdeConfig, GlobalNorm, ImagingConfig};
use crate::error::{PipelineError, SolutionError};
use crate::geom::radec_to_lm;
use crate::jones::{ApplyMode, Jones, C32};
use crate::store::Namespace;
use crate::tessellation::Tessellation;

pub const CALIBRATION_CACHE: &str = "JonesNorm_killMS.bin";
pub const BEAM_CACHE: &str = "JonesNorm_Beam.bin";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Direction {
    pub ra: f64,
    pub dec: f64,
    pub l: f64,
    pub m: f64,
    /// Apparent flux used to weight neighbouring directions.
    pub flux: f64,
    pub cluster: usize,
}

impl Direction {
    pub fn new(ra: f64, dec: f64, flux: f64, cluster: usize, ra0: f64, dec0: f64) -> Self {
        let (l, m) = radec_to_lm(ra, dec, ra0, dec0);
        Direction {
            ra,
            dec,
            l,
            m,
            flux,
            cluster,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolutionKind {
    Calibration,
    Beam,
    Merged,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolutionSet {
    pub kind: SolutionKind,
    pub t0: Vec<f64>,
    pub t1: Vec<f64>,
    pub tm: Vec<f64>,
    /// `(nt, nd, na, nf)`.
    pub jones: Array4<Jones>,
    pub directions: Vec<Direction>,
    pub vis_to_sol_chan: Vec<usize>,
    /// Beam sampling times carried by calibration files, if any.
    #[serde(default)]
    pub beam_times: Vec<f64>,
}

/// Everything but the matrices, stored as one record.
#[derive(Serialize, Deserialize)]
struct SolutionMeta {
    kind: SolutionKind,
    t0: Vec<f64>,
    t1: Vec<f64>,
    directions: Vec<Direction>,
    vis_to_sol_chan: Vec<usize>,
    beam_times: Vec<f64>,
}

impl SolutionSet {
    pub fn new(
        kind: SolutionKind,
        t0: Vec<f64>,
        t1: Vec<f64>,
        jones: Array4<Jones>,
        directions: Vec<Direction>,
        vis_to_sol_chan: Vec<usize>,
    ) -> Result<Self, SolutionError> {
        let (nt, nd, _, nf) = jones.dim();
        if nt == 0 {
            return Err(SolutionError::Empty);
        }
        if t0.len() != nt || t1.len() != nt {
            return Err(SolutionError::Shape(format!(
                "{} t0 and {} t1 values for {nt} solution intervals",
                t0.len(),
                t1.len()
            )));
        }
        if directions.len() != nd {
            return Err(SolutionError::Shape(format!(
                "{} catalogue directions for {nd} solution directions",
                directions.len()
            )));
        }
        if let Some(&bad) = vis_to_sol_chan.iter().find(|&&c| c >= nf) {
            return Err(SolutionError::Shape(format!(
                "channel mapping refers to solution channel {bad} of {nf}"
            )));
        }
        for i in 0..nt {
            if !(t0[i] < t1[i]) || (i > 0 && t0[i] < t1[i - 1]) {
                return Err(SolutionError::Shape(format!(
                    "interval {i} [{}, {}) is empty or out of order",
                    t0[i], t1[i]
                )));
            }
        }
        let tm = t0.iter().zip(&t1).map(|(a, b)| 0.5 * (a + b)).collect();
        Ok(SolutionSet {
            kind,
            t0,
            t1,
            tm,
            jones,
            directions,
            vis_to_sol_chan,
            beam_times: Vec::new(),
        })
    }

    pub fn n_times(&self) -> usize {
        self.jones.dim().0
    }

    pub fn n_dirs(&self) -> usize {
        self.jones.dim().1
    }

    pub fn n_ants(&self) -> usize {
        self.jones.dim().2
    }

    pub fn n_chan(&self) -> usize {
        self.jones.dim().3
    }

    /// Interval containing `t`, if any.
    pub fn interval_index(&self, t: f64) -> Option<usize> {
        let i = self.t0.partition_point(|&x| x <= t);
        if i > 0 && t < self.t1[i - 1] {
            Some(i - 1)
        } else {
            None
        }
    }

    pub fn nearest_time(&self, t: f64) -> usize {
        let mut best = 0;
        let mut best_d = f64::INFINITY;
        for (i, &tm) in self.tm.iter().enumerate() {
            let d = (tm - t).abs();
            if d < best_d {
                best = i;
                best_d = d;
            }
        }
        best
    }

    /// Interval index per time. Times outside every interval fall back to
    /// the nearest interval and are reported once as a warning.
    pub fn time_mapping(&self, times: &[f64]) -> Vec<usize> {
        let mut uncovered = 0usize;
        let map = times
            .iter()
            .map(|&t| {
                self.interval_index(t).unwrap_or_else(|| {
                    uncovered += 1;
                    self.nearest_time(t)
                })
            })
            .collect();
        if uncovered > 0 {
            warn!(
                "{uncovered} of {} visibility times are not covered by the solutions; using nearest interval",
                times.len()
            );
        }
        map
    }

    pub fn nearest_time_mapping(&self, times: &[f64]) -> Vec<usize> {
        times.iter().map(|&t| self.nearest_time(t)).collect()
    }

    /// Mapping appropriate for the kind of set: nearest sample for beams,
    /// interval membership otherwise.
    pub fn mapping_for(&self, times: &[f64]) -> Vec<usize> {
        match self.kind {
            SolutionKind::Beam => self.nearest_time_mapping(times),
            SolutionKind::Calibration | SolutionKind::Merged => self.time_mapping(times),
        }
    }

    pub fn normalise(&mut self, global: GlobalNorm, jones_norm: ApplyMode) {
        let (nt, nd, na, nf) = self.jones.dim();
        match global {
            GlobalNorm::None => {}
            GlobalNorm::MeanAbsAnt => {
                info!("  normalising by the mean amplitude per direction and antenna");
                for d in 0..nd {
                    for a in 0..na {
                        let mut sum = 0.0f64;
                        for t in 0..nt {
                            for f in 0..nf {
                                sum += self.jones[[t, d, a, f]].0[0].norm() as f64;
                            }
                        }
                        self.scale_diagonal(d, Some(a), sum / (nt * nf) as f64);
                    }
                }
            }
            GlobalNorm::MeanAbs => {
                info!("  normalising by the mean amplitude per direction");
                for d in 0..nd {
                    let sum: f64 = self
                        .jones
                        .slice(ndarray::s![.., d, .., ..])
                        .iter()
                        .map(|j| j.0[0].norm() as f64)
                        .sum();
                    self.scale_diagonal(d, None, sum / (nt * na * nf) as f64);
                }
            }
        }
        if !jones_norm.amplitude {
            info!("  normalising by the amplitude");
        }
        if !jones_norm.phase {
            info!("  zeroing the phases");
        }
        if jones_norm != ApplyMode::AP {
            self.jones.mapv_inplace(|j| j.strip(jones_norm));
        }
    }

    fn scale_diagonal(&mut self, d: usize, ant: Option<usize>, mean: f64) {
        if !(mean > 0.0) {
            return;
        }
        let inv = (1.0 / mean) as f32;
        let mut view = match ant {
            Some(a) => self.jones.slice_mut(ndarray::s![.., d, a..a + 1, ..]),
            None => self.jones.slice_mut(ndarray::s![.., d, .., ..]),
        };
        for j in view.iter_mut() {
            j.0[0] *= inv;
            j.0[3] *= inv;
        }
    }

    /// Product set `a · b` on the union of both time coverages.
    pub fn merge(a: &SolutionSet, b: &SolutionSet) -> Result<SolutionSet, SolutionError> {
        if a.n_dirs() != b.n_dirs() || a.n_ants() != b.n_ants() {
            return Err(SolutionError::Merge(format!(
                "directions/antennas differ: {}x{} vs {}x{}",
                a.n_dirs(),
                a.n_ants(),
                b.n_dirs(),
                b.n_ants()
            )));
        }
        if a.vis_to_sol_chan.len() != b.vis_to_sol_chan.len() {
            return Err(SolutionError::Merge(format!(
                "channel mappings cover {} and {} visibility channels",
                a.vis_to_sol_chan.len(),
                b.vis_to_sol_chan.len()
            )));
        }

        let mut bounds: Vec<f64> = a
            .t0
            .iter()
            .chain(&a.t1)
            .chain(&b.t0)
            .chain(&b.t1)
            .copied()
            .collect();
        bounds.sort_by(|x, y| x.total_cmp(y));
        bounds.dedup();
        let mut t0 = Vec::new();
        let mut t1 = Vec::new();
        for w in bounds.windows(2) {
            let mid = 0.5 * (w[0] + w[1]);
            if a.interval_index(mid).is_some() || b.interval_index(mid).is_some() {
                t0.push(w[0]);
                t1.push(w[1]);
            }
        }
        if t0.is_empty() {
            return Err(SolutionError::Empty);
        }

        // one merged channel per distinct (a, b) channel pair in use
        let mut pairs: Vec<(usize, usize)> = Vec::new();
        let mut vis_to_sol_chan = Vec::with_capacity(a.vis_to_sol_chan.len());
        for (&ca, &cb) in a.vis_to_sol_chan.iter().zip(&b.vis_to_sol_chan) {
            let idx = match pairs.iter().position(|&p| p == (ca, cb)) {
                Some(i) => i,
                None => {
                    pairs.push((ca, cb));
                    pairs.len() - 1
                }
            };
            vis_to_sol_chan.push(idx);
        }
        if pairs.is_empty() {
            pairs.push((0, 0));
        }

        let (nd, na) = (a.n_dirs(), a.n_ants());
        let mut jones = Array4::from_elem((t0.len(), nd, na, pairs.len()), Jones::identity());
        for (it, (s, e)) in t0.iter().zip(&t1).enumerate() {
            let mid = 0.5 * (s + e);
            let ia = a.nearest_time(mid);
            let ib = b.nearest_time(mid);
            for d in 0..nd {
                for ant in 0..na {
                    for (k, &(ca, cb)) in pairs.iter().enumerate() {
                        jones[[it, d, ant, k]] = a.jones[[ia, d, ant, ca]] * b.jones[[ib, d, ant, cb]];
                    }
                }
            }
        }
        debug!(
            "merged {} and {} intervals into {}",
            a.n_times(),
            b.n_times(),
            t0.len()
        );
        let mut out = SolutionSet::new(
            SolutionKind::Merged,
            t0,
            t1,
            jones,
            a.directions.clone(),
            vis_to_sol_chan,
        )?;
        out.beam_times = a.beam_times.clone();
        Ok(out)
    }

    pub fn publish(&self, ns: &mut Namespace) -> Result<(), PipelineError> {
        let meta = SolutionMeta {
            kind: self.kind,
            t0: self.t0.clone(),
            t1: self.t1.clone(),
            directions: self.directions.clone(),
            vis_to_sol_chan: self.vis_to_sol_chan.clone(),
            beam_times: self.beam_times.clone(),
        };
        ns.put_record("meta", &meta)?;
        ns.put_ndarray("jones", &self.jones)?;
        Ok(())
    }

    pub fn from_namespace(ns: &Namespace) -> Result<Self, PipelineError> {
        let meta: SolutionMeta = ns.get_record("meta")?;
        let arr = ns.array::<Jones>("jones")?;
        let jones = arr
            .view()?
            .to_owned()
            .into_dimensionality::<ndarray::Ix4>()
            .map_err(|e| SolutionError::Shape(e.to_string()))?;
        let mut set = SolutionSet::new(
            meta.kind,
            meta.t0,
            meta.t1,
            jones,
            meta.directions,
            meta.vis_to_sol_chan,
        )?;
        set.beam_times = meta.beam_times;
        Ok(set)
    }

    fn read_cache(path: &Path) -> Result<SolutionSet, String> {
        let bytes = fs::read(path).map_err(|e| e.to_string())?;
        bincode::deserialize(&bytes).map_err(|e| e.to_string())
    }

    fn write_cache(&self, path: &Path) -> Result<(), PipelineError> {
        let cache_err = |source| PipelineError::Cache {
            path: path.to_path_buf(),
            source,
        };
        let bytes = bincode::serialize(self)
            .map_err(|e| cache_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        fs::write(path, bytes).map_err(cache_err)
    }
}

/// Solution channel closest to each visibility channel. Without frequency
/// domains every channel maps to solution channel 0.
pub fn vis_to_jones_chan_mapping(chan_freqs: &[f64], freq_domains: &[[f64; 2]]) -> Vec<usize> {
    if freq_domains.is_empty() {
        return vec![0; chan_freqs.len()];
    }
    chan_freqs
        .iter()
        .map(|&f| {
            freq_domains
                .iter()
                .enumerate()
                .map(|(i, d)| (i, (0.5 * (d[0] + d[1]) - f).abs()))
                .min_by(|x, y| x.1.total_cmp(&y.1))
                .map(|(i, _)| i)
                .unwrap_or(0)
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub ra: f64,
    pub dec: f64,
    pub flux: f64,
    pub cluster: usize,
}

/// On-disk calibration solutions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolutionFile {
    pub directions: Vec<CatalogEntry>,
    #[serde(default)]
    pub freq_domains: Vec<[f64; 2]>,
    #[serde(default)]
    pub beam_times: Vec<f64>,
    pub t0: Vec<f64>,
    pub t1: Vec<f64>,
    /// `gains[t][d][a][f]`.
    pub gains: Vec<Vec<Vec<Vec<Jones>>>>,
}

impl SolutionFile {
    pub fn load(path: &Path) -> Result<Self, SolutionError> {
        let file_err = |reason: String| SolutionError::File {
            path: path.to_path_buf(),
            reason,
        };
        let text = fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| file_err(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), SolutionError> {
        let file_err = |reason: String| SolutionError::File {
            path: path.to_path_buf(),
            reason,
        };
        let text = serde_json::to_string(self).map_err(|e| file_err(e.to_string()))?;
        fs::write(path, text).map_err(|e| file_err(e.to_string()))
    }

    pub fn to_set(&self, chan_freqs: &[f64], ra0: f64, dec0: f64) -> Result<SolutionSet, SolutionError> {
        let nt = self.gains.len();
        let nd = self.directions.len();
        let na = self
            .gains
            .first()
            .and_then(|g| g.first())
            .map(|g| g.len())
            .unwrap_or(0);
        let nf = self
            .gains
            .first()
            .and_then(|g| g.first())
            .and_then(|g| g.first())
            .map(|g| g.len())
            .unwrap_or(0);
        if !self.freq_domains.is_empty() && self.freq_domains.len() != nf {
            return Err(SolutionError::Shape(format!(
                "{} frequency domains for {nf} solution channels",
                self.freq_domains.len()
            )));
        }
        let mut jones = Array4::from_elem((nt, nd, na, nf), Jones::identity());
        for (t, per_t) in self.gains.iter().enumerate() {
            if per_t.len() != nd {
                return Err(SolutionError::Shape(format!(
                    "interval {t} has {} directions, catalogue has {nd}",
                    per_t.len()
                )));
            }
            for (d, per_d) in per_t.iter().enumerate() {
                if per_d.len() != na {
                    return Err(SolutionError::Shape(format!(
                        "interval {t} direction {d} has {} antennas, expected {na}",
                        per_d.len()
                    )));
                }
                for (a, per_a) in per_d.iter().enumerate() {
                    if per_a.len() != nf {
                        return Err(SolutionError::Shape(format!(
                            "interval {t} direction {d} antenna {a} has {} channels, expected {nf}",
                            per_a.len()
                        )));
                    }
                    for (f, j) in per_a.iter().enumerate() {
                        jones[[t, d, a, f]] = *j;
                    }
                }
            }
        }
        let directions = self
            .directions
            .iter()
            .map(|c| Direction::new(c.ra, c.dec, c.flux, c.cluster, ra0, dec0))
            .collect();
        let mapping = vis_to_jones_chan_mapping(chan_freqs, &self.freq_domains);
        let mut set = SolutionSet::new(
            SolutionKind::Calibration,
            self.t0.clone(),
            self.t1.clone(),
            jones,
            directions,
            mapping,
        )?;
        set.beam_times = self.beam_times.clone();
        Ok(set)
    }
}

impl BeamModel {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, BeamModel::None)
    }

    /// Voltage gain at direction cosines `(l, m)` from the pointing centre.
    pub fn gain(&self, l: f64, m: f64, freq_hz: f64) -> f32 {
        match *self {
            BeamModel::None => 1.0,
            BeamModel::Gaussian {
                fwhm_deg,
                ref_freq_hz,
            } => {
                let fwhm = fwhm_deg.to_radians() * ref_freq_hz / freq_hz;
                let r2 = l * l + m * m;
                let power = (-4.0 * std::f64::consts::LN_2 * r2 / (fwhm * fwhm)).exp();
                power.sqrt() as f32
            }
        }
    }

    pub fn jones(&self, l: f64, m: f64, freq_hz: f64) -> Jones {
        Jones::scalar(C32::new(self.gain(l, m, freq_hz), 0.0))
    }
}

/// Beam sample times every `dt_min` minutes over `[t_min, t_max]`, at
/// least two of them.
pub fn beam_sample_times(times: &[f64], dt_min: f64) -> Vec<f64> {
    let (t_min, t_max) = times
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(a, b), &t| (a.min(t), b.max(t)));
    if !t_min.is_finite() {
        return Vec::new();
    }
    let dt = dt_min * 60.0;
    let steps = (((t_max - t_min) / dt).ceil() as usize).max(1);
    (0..=steps).map(|k| t_min + k as f64 * dt).collect()
}

/// `n_band` equal frequency domains spanning the channels.
pub fn beam_freq_domains(chan_freqs: &[f64], n_band: usize) -> Vec<[f64; 2]> {
    let lo = chan_freqs.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = chan_freqs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !lo.is_finite() || n_band == 0 {
        return Vec::new();
    }
    let width = (hi - lo) / n_band as f64;
    (0..n_band)
        .map(|i| [lo + i as f64 * width, lo + (i + 1) as f64 * width])
        .collect()
}

/// Evaluates the beam at every sample interval, direction and sub-band.
pub fn evaluate_beam(
    model: &BeamModel,
    sample_times: &[f64],
    directions: &[Direction],
    n_ant: usize,
    chan_freqs: &[f64],
    cfg: &BeamConfig,
) -> Result<SolutionSet, SolutionError> {
    if sample_times.len() < 2 {
        return Err(SolutionError::Empty);
    }
    let domains = beam_freq_domains(chan_freqs, cfg.n_band);
    let nt = sample_times.len() - 1;
    let nf = domains.len().max(1);
    let mut jones = Array4::from_elem((nt, directions.len(), n_ant, nf), Jones::identity());
    for t in 0..nt {
        for (f, dom) in domains.iter().enumerate() {
            let freq = 0.5 * (dom[0] + dom[1]);
            let norm = if cfg.center_norm {
                model.jones(0.0, 0.0, freq).inv().unwrap_or_else(Jones::identity)
            } else {
                Jones::identity()
            };
            for (d, dir) in directions.iter().enumerate() {
                let b = norm * model.jones(dir.l, dir.m, freq);
                for a in 0..n_ant {
                    jones[[t, d, a, f]] = b;
                }
            }
        }
    }
    SolutionSet::new(
        SolutionKind::Beam,
        sample_times[..nt].to_vec(),
        sample_times[1..].to_vec(),
        jones,
        directions.to_vec(),
        vis_to_jones_chan_mapping(chan_freqs, &domains),
    )
}

/// Fields that change the calibration product.
#[derive(Serialize)]
pub struct SolutionCacheKey<'a> {
    pub files: Vec<(PathBuf, u64)>,
    pub jones_norm: &'a [ApplyMode],
    pub global_norm: GlobalNorm,
    pub ra0: f64,
    pub dec0: f64,
    pub chan_freqs: &'a [f64],
}

/// Fields that change the beam product.
#[derive(Serialize)]
pub struct BeamCacheKey<'a> {
    pub model: BeamModel,
    pub dt_beam_min: f64,
    pub n_band: usize,
    pub center_norm: bool,
    pub ra0: f64,
    pub dec0: f64,
    pub chan_freqs: &'a [f64],
    pub sample_times: &'a [f64],
    pub directions: Vec<(f64, f64)>,
    pub n_ant: usize,
}

fn mtime_secs(path: &Path) -> Result<u64, SolutionError> {
    let meta = fs::metadata(path).map_err(|e| SolutionError::File {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0))
}

/// Loads, normalises, merges and caches the solutions used by the facets.
pub struct SolutionManager {
    dde: DdeConfig,
    beam_cfg: BeamConfig,
    ra0: f64,
    dec0: f64,
    facet_dirs: Vec<Direction>,
    cache: Arc<CacheManager>,
    calibration: Option<SolutionSet>,
    beam: Option<SolutionSet>,
    merged: Option<SolutionSet>,
}

impl SolutionManager {
    pub fn new(cfg: &ImagingConfig, tess: &Tessellation, cache: Arc<CacheManager>) -> Self {
        let facet_dirs = tess
            .facets
            .iter()
            .map(|f| Direction {
                ra: f.ra,
                dec: f.dec,
                l: f.l0,
                m: f.m0,
                flux: 1.0,
                cluster: f.index,
            })
            .collect();
        SolutionManager {
            dde: cfg.dde.clone(),
            beam_cfg: cfg.beam.clone(),
            ra0: cfg.image.ra0,
            dec0: cfg.image.dec0,
            facet_dirs,
            cache,
            calibration: None,
            beam: None,
            merged: None,
        }
    }

    pub fn has_solutions(&self) -> bool {
        !self.dde.sol_files.is_empty() || self.beam_cfg.model.is_enabled()
    }

    pub fn calibration(&self) -> Option<&SolutionSet> {
        self.calibration.as_ref()
    }

    pub fn beam(&self) -> Option<&SolutionSet> {
        self.beam.as_ref()
    }

    /// The set the grid engines should apply: the merge of calibration and
    /// beam when both exist, otherwise whichever exists.
    pub fn effective(&self) -> Option<&SolutionSet> {
        self.merged
            .as_ref()
            .or(self.calibration.as_ref())
            .or(self.beam.as_ref())
    }

    /// Builds (or reads from cache) the solutions for a chunk with the given
    /// times, channel frequencies and antenna count.
    pub fn load(
        &mut self,
        chunk_times: &[f64],
        chan_freqs: &[f64],
        n_ant: usize,
    ) -> Result<Option<&SolutionSet>, PipelineError> {
        if self.calibration.is_none() && !self.dde.sol_files.is_empty() {
            self.calibration = Some(self.load_calibration(chan_freqs)?);
        }
        if self.beam_cfg.model.is_enabled() {
            self.beam = Some(self.load_beam(chunk_times, chan_freqs, n_ant)?);
        }
        self.merged = match (&self.calibration, &self.beam) {
            (Some(cal), Some(beam)) => {
                info!("merging calibration and beam solutions");
                Some(SolutionSet::merge(cal, beam)?)
            }
            _ => None,
        };
        Ok(self.effective())
    }

    fn load_calibration(&self, chan_freqs: &[f64]) -> Result<SolutionSet, PipelineError> {
        let cache = &self.cache;
        let files = self
            .dde
            .sol_files
            .iter()
            .map(|p| Ok((p.clone(), mtime_secs(p)?)))
            .collect::<Result<Vec<_>, SolutionError>>()?;
        let key = SolutionCacheKey {
            files,
            jones_norm: &self.dde.jones_norm,
            global_norm: self.dde.global_norm,
            ra0: self.ra0,
            dec0: self.dec0,
            chan_freqs,
        };
        let (path, valid) = cache.check(CALIBRATION_CACHE, &key)?;
        if valid {
            match SolutionSet::read_cache(&path) {
                Ok(set) => {
                    info!("using cached calibration solutions {}", path.display());
                    return Ok(set);
                }
                Err(reason) => warn!("solution cache {} unusable ({reason}), rebuilding", path.display()),
            }
        }

        let mut merged: Option<SolutionSet> = None;
        for (file, norm) in self.dde.sol_files.iter().zip(&self.dde.jones_norm) {
            info!("  loading solution file {}", file.display());
            let mut set = SolutionFile::load(file)?.to_set(chan_freqs, self.ra0, self.dec0)?;
            set.normalise(self.dde.global_norm, *norm);
            debug!("  vis-to-solution channel mapping: {:?}", set.vis_to_sol_chan);
            merged = Some(match merged {
                None => set,
                Some(prev) => {
                    let mut m = SolutionSet::merge(&set, &prev)?;
                    m.kind = SolutionKind::Calibration;
                    m
                }
            });
        }
        let set = merged.ok_or(SolutionError::Empty)?;
        set.write_cache(&path)?;
        cache.mark_valid(CALIBRATION_CACHE)?;
        Ok(set)
    }

    fn load_beam(
        &self,
        chunk_times: &[f64],
        chan_freqs: &[f64],
        n_ant: usize,
    ) -> Result<SolutionSet, PipelineError> {
        let cache = &self.cache;
        let sample_times = match &self.calibration {
            Some(cal) if !cal.beam_times.is_empty() => {
                info!("  taking beam times from the calibration solutions");
                cal.beam_times.clone()
            }
            _ => beam_sample_times(chunk_times, self.beam_cfg.dt_beam_min),
        };
        let directions = match &self.calibration {
            Some(cal) => {
                debug!("  beam directions from calibration solutions");
                cal.directions.clone()
            }
            None => {
                debug!("  beam directions from facet centres");
                self.facet_dirs.clone()
            }
        };
        let key = BeamCacheKey {
            model: self.beam_cfg.model,
            dt_beam_min: self.beam_cfg.dt_beam_min,
            n_band: self.beam_cfg.n_band,
            center_norm: self.beam_cfg.center_norm,
            ra0: self.ra0,
            dec0: self.dec0,
            chan_freqs,
            sample_times: &sample_times,
            directions: directions.iter().map(|d| (d.ra, d.dec)).collect(),
            n_ant,
        };
        let (path, valid) = cache.check(BEAM_CACHE, &key)?;
        if valid {
            match SolutionSet::read_cache(&path) {
                Ok(set) => return Ok(set),
                Err(reason) => warn!("beam cache {} unusable ({reason}), rebuilding", path.display()),
            }
        }
        let set = evaluate_beam(
            &self.beam_cfg.model,
            &sample_times,
            &directions,
            n_ant,
            chan_freqs,
            &self.beam_cfg,
        )?;
        set.write_cache(&path)?;
        cache.mark_valid(BEAM_CACHE)?;
        Ok(set)
    }
}
