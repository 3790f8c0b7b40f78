//! Facet orchestrator.
//!
//! Drives kernel initialisation, gridding, FFT, stitching and degridding
//! of every facet through the worker pool. Jobs carry a facet index and a
//! chunk handle only; workers map kernels, grids and visibilities from the
//! shared store themselves. Each facet's grid buffer has at most one job in
//! flight at a time, which is what makes the per-facet writes race-free.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use ndarray::{s, Array2, Array4, Array5, ArrayView2, ArrayView4, Axis, Ix2, Ix4};

use crate::cache::CacheManager;
use crate::config::ImagingConfig;
use crate::dispatch::{JobCounter, JobDispatch, JobHandler, JobOutput, JobRequest};
use crate::error::{ConfigError, ContractError, PipelineError};
use crate::gridder::{DegridStats, GridEngine, GridStats, RowLocks, Sparsification};
use crate::jones::C32;
use crate::kernel::KernelSet;
use crate::store::Namespace;
use crate::tessellation::{Edges, FacetGeometry, Tessellation};
use crate::utils::FftHelper;
use crate::vis::{fixed, ChunkHandle, ChunkView};

const CF_NS: &str = "CF";
const GRID_NS: &str = "Grid";
const MODEL_NS: &str = "Model";
const TILES_NS: &str = "tiles";
const CF_CACHE: &str = "CF";

/// Taper floor below which facet pixels are left out of the mosaic and of
/// the model tiles.
pub const SPHE_CUT: f32 = 1e-3;
/// Same floor for the PSF cubes.
pub const SPHE_CUT_PSF: f32 = 1e-2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    KernelsReady,
    DirtyBuffersReady,
    /// Label of the last chunk dispatched for gridding.
    Gridding(String),
    FourierTransformed,
    Stitched,
    ModelLoaded,
    Degridding(String),
    Collected,
}

/// Running sums of one facet since the last [`FacetMachine::reinit_dirty`].
#[derive(Clone, Debug, PartialEq)]
pub struct FacetAccumulators {
    pub stats: GridStats,
    pub n_chunks: usize,
}

impl FacetAccumulators {
    fn new(n_bands: usize, npol: usize) -> Self {
        FacetAccumulators {
            stats: GridStats::zeros(n_bands, npol, 0),
            n_chunks: 0,
        }
    }

    /// `SumJones[0] / SumJones[1]` per band, 1 where nothing was gridded.
    pub fn sum_jones_norm(&self) -> Vec<f64> {
        self.stats
            .sum_jones
            .axis_iter(Axis(1))
            .map(|col| {
                let ratio = col[0] / col[1];
                if ratio.is_finite() && ratio != 0.0 {
                    ratio
                } else {
                    1.0
                }
            })
            .collect()
    }
}

/// Stitched dirty-mode products.
#[derive(Clone, Debug)]
pub struct StitchedImages {
    /// `(nband, npol, N, N)`.
    pub image: Array4<f32>,
    /// Band average `(1, npol, N, N)`.
    pub mean_image: Array4<f32>,
    pub norm_image: Array2<f32>,
    /// Jones amplitude mosaic, present when requested.
    pub norm_data: Option<Array4<f32>>,
    pub sum_weights: Array2<f64>,
    pub weight_chans_images: Array2<f64>,
    pub sum_jones_norm: Vec<Vec<f64>>,
}

/// PSF-mode products.
#[derive(Clone, Debug)]
pub struct PsfProducts {
    pub npix_min: usize,
    pub central_facet: usize,
    /// `(nfacets, nband, npol, n, n)`.
    pub cube_variable_psf: Array5<f32>,
    /// `(nfacets, 1, npol, n, n)`.
    pub cube_mean_variable_psf: Array5<f32>,
    pub peak_normed_cube_variable_psf: Array5<f32>,
    pub peak_normed_cube_mean_variable_psf: Array5<f32>,
    /// `(1, npol, n, n)`.
    pub mean_facet_psf: Array4<f32>,
    pub mean_jones_band: Vec<Vec<f64>>,
    pub weight_chans_images: Array2<f64>,
    /// Stitched PSF mosaic and its band average.
    pub image: Array4<f32>,
    pub mean_image: Array4<f32>,
    pub norm_image: Array2<f32>,
}

#[derive(Clone, Debug)]
pub enum FacetImages {
    Dirty(StitchedImages),
    Psf(PsfProducts),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mosaic {
    Image,
    JonesAmplitude,
}

/// Odd PSF cube size that fits inside the smallest padded facet.
pub fn psf_footprint(np_min: usize, padding: f64, circumcision: Option<usize>) -> usize {
    let mut n = circumcision.unwrap_or((np_min as f64 / padding) as usize);
    if n % 2 == 0 {
        n += 1;
    }
    if n >= np_min {
        n = if np_min % 2 == 0 {
            np_min.saturating_sub(1)
        } else {
            np_min
        };
    }
    n.max(1)
}

/// Per-chunk sparsification seed, identical for every facet.
fn chunk_seed(label: &str) -> u64 {
    label
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3))
}

fn overlap_pixels(main: &Edges, fe: &Edges) -> impl Iterator<Item = (usize, usize, usize, usize)> {
    let (mx0, my0, fx0, fy0) = (main.x0, main.y0, fe.x0, fe.y0);
    let (w, h) = (main.width(), main.height());
    (0..h).flat_map(move |dy| (0..w).map(move |dx| (my0 + dy, mx0 + dx, fy0 + dy, fx0 + dx)))
}

/// Fourier-domain model of one facet: the main-image model weighted by the
/// facet's share of the mosaic, divided by the taper and transformed.
pub fn model_tile(
    model: &ArrayView4<f32>,
    norm_image: &ArrayView2<f32>,
    kernels: &KernelSet,
    main: &Edges,
    fe: &Edges,
) -> Result<Array4<C32>, PipelineError> {
    let (nb, npol, _, _) = model.dim();
    let np = kernels.params.npix_padded;
    let mut tile = Array4::<C32>::zeros((nb, npol, np, np));
    for (y, x, fy, fx) in overlap_pixels(main, fe) {
        let sphe = kernels.sphe[[fy, fx]];
        let norm = norm_image[[y, x]];
        if sphe < SPHE_CUT || !(norm > 0.0) {
            continue;
        }
        let factor = kernels.sw[[fy, fx]] / norm / sphe;
        for b in 0..nb {
            for p in 0..npol {
                tile[[b, p, fy, fx]] = C32::new(model[[b, p, y, x]] * factor, 0.0);
            }
        }
    }
    let fft = FftHelper::<f32>::new(np);
    let data = tile
        .as_slice_mut()
        .ok_or(ContractError::NotContiguous("model tile"))?;
    for plane in data.chunks_exact_mut(np * np) {
        fft.forward_centred(plane).map_err(PipelineError::Fft)?;
    }
    Ok(tile)
}

/// Worker side of the orchestrator.
struct FacetJobHandler {
    cfg: ImagingConfig,
    tess: Arc<Tessellation>,
    cf_path: PathBuf,
    grid_path: PathBuf,
    model_path: PathBuf,
    row_locks: Arc<RowLocks>,
    tiles_built: JobCounter,
    do_psf: bool,
}

impl FacetJobHandler {
    fn facet(&self, facet: usize) -> Result<&FacetGeometry, PipelineError> {
        self.tess
            .facets
            .get(facet)
            .ok_or_else(|| PipelineError::InvalidState {
                expected: "facet index within the tessellation",
                found: facet.to_string(),
            })
    }

    fn kernels(&self, facet: usize) -> Result<KernelSet, PipelineError> {
        let cf = Namespace::attach(&self.cf_path, true)?;
        if !cf.contains(facet) {
            return Err(ContractError::MissingKernel("facet kernel set").into());
        }
        KernelSet::from_namespace(&cf.sub_namespace(facet)?)
    }

    fn init_kernel(&self, facet: usize, cache_path: &Path, cache_valid: bool) -> Result<JobOutput, PipelineError> {
        let geom = self.facet(facet)?;
        let mask = self.tess.facet_mask(geom);
        let set = KernelSet::load_or_compute(
            cache_path,
            cache_valid,
            geom,
            &self.cfg.kernel,
            self.tess.cell_rad,
            &mask,
        )?;
        let mut cf = Namespace::attach(&self.cf_path, false)?;
        let mut sub = cf.add_sub_namespace(facet)?;
        set.publish(&mut sub)?;
        Ok(JobOutput::KernelReady { facet })
    }

    fn grid(&self, facet: usize, handle: &ChunkHandle) -> Result<JobOutput, PipelineError> {
        let geom = self.facet(facet)?;
        let kernels = self.kernels(facet)?;
        let engine = GridEngine::new(geom, &kernels, &self.cfg, self.cfg.image.pol_mode, None)?;
        let chunk = ChunkView::open(handle)?;
        let view = chunk.view()?;
        let sols = chunk.solutions()?;
        let grids = Namespace::attach(&self.grid_path, false)?;
        let mut buffer = grids.array_mut::<C32>(facet)?;
        let found = buffer.shape().to_vec();
        let mut grid = buffer
            .view_mut()?
            .into_dimensionality::<Ix4>()
            .map_err(|_| ContractError::Shape {
                name: "facet grid",
                expected: engine.grid_shape().to_vec(),
                found,
            })?;
        let sparsification = self.cfg.rime.sparsification.map(|factor| Sparsification {
            factor,
            seed: chunk_seed(&handle.label),
        });
        let stats = engine.grid(
            &view,
            &mut grid,
            sols.as_ref().map(|(s, _)| s),
            sols.as_ref().map(|(_, m)| m.as_slice()),
            self.do_psf,
            sparsification,
        )?;
        buffer.flush()?;
        Ok(JobOutput::Gridded { facet, stats })
    }

    fn fft(&self, facet: usize) -> Result<JobOutput, PipelineError> {
        let np = self.facet(facet)?.npix_padded;
        let grids = Namespace::attach(&self.grid_path, false)?;
        let mut buffer = grids.array_mut::<C32>(facet)?;
        let fft = FftHelper::<f32>::new(np);
        for plane in buffer.as_mut_slice().chunks_exact_mut(np * np) {
            fft.inverse_centred(plane).map_err(PipelineError::Fft)?;
        }
        buffer.flush()?;
        debug!("facet {facet}: grid transformed to the image plane");
        Ok(JobOutput::Transformed { facet })
    }

    /// Fills the facet's slot in the model tile namespace.
    fn model_tile(&self, facet: usize) -> Result<JobOutput, PipelineError> {
        let kernels = self.kernels(facet)?;
        let model_ns = Namespace::attach(&self.model_path, false)?;
        let model_arr = model_ns.array::<f32>("image")?;
        let norm_arr = model_ns.array::<f32>("norm")?;
        let model = fixed::<f32, Ix4>(&model_arr, "model image")?;
        let norm = fixed::<f32, Ix2>(&norm_arr, "normalisation image")?;
        let (main, fe) = self.tess.padded_edges(facet);
        let tile = model_tile(&model, &norm, &kernels, &main, &fe)?;

        let tiles = model_ns.sub_namespace(TILES_NS)?;
        let mut buffer = tiles.array_mut::<C32>(facet)?;
        if buffer.shape() != tile.shape() {
            return Err(ContractError::Shape {
                name: "model tile",
                expected: tile.shape().to_vec(),
                found: buffer.shape().to_vec(),
            }
            .into());
        }
        let src = tile.as_slice().ok_or(ContractError::NotContiguous("model tile"))?;
        buffer.as_mut_slice().copy_from_slice(src);
        buffer.flush()?;
        self.tiles_built.increment();
        debug!("facet {facet}: model tile ready");
        Ok(JobOutput::ModelTileReady { facet })
    }

    fn degrid(&self, facet: usize, handle: &ChunkHandle) -> Result<JobOutput, PipelineError> {
        let geom = self.facet(facet)?;
        let kernels = self.kernels(facet)?;
        let tiles = Namespace::attach(&self.model_path, true)?.sub_namespace(TILES_NS)?;
        let tile_arr = tiles.array::<C32>(facet)?;
        let tile = fixed::<C32, Ix4>(&tile_arr, "model tile")?;

        let engine = GridEngine::new(
            geom,
            &kernels,
            &self.cfg,
            self.cfg.image.pol_mode,
            Some(self.row_locks.clone()),
        )?;
        let chunk = ChunkView::open(handle)?;
        let view = chunk.view()?;
        let sols = chunk.solutions()?;
        let mut residual = chunk.residual()?;
        let stats = engine.degrid(
            &tile,
            &view,
            &mut residual,
            sols.as_ref().map(|(s, _)| s),
            sols.as_ref().map(|(_, m)| m.as_slice()),
        )?;
        residual.flush()?;
        Ok(JobOutput::Degridded { facet, stats })
    }
}

impl JobHandler for FacetJobHandler {
    fn handle(&self, job: JobRequest) -> Result<JobOutput, String> {
        let out = match job {
            JobRequest::InitKernel {
                facet,
                cache_path,
                cache_valid,
            } => self.init_kernel(facet, &cache_path, cache_valid),
            JobRequest::Grid { facet, chunk } => self.grid(facet, &chunk),
            JobRequest::Fft { facet } => self.fft(facet),
            JobRequest::ModelTile { facet } => self.model_tile(facet),
            JobRequest::Degrid { facet, chunk } => self.degrid(facet, &chunk),
        };
        out.map_err(|e| e.to_string())
    }
}

pub struct FacetMachine<D: JobDispatch> {
    cfg: ImagingConfig,
    tess: Arc<Tessellation>,
    pool: D,
    app_id: &'static str,
    do_psf: bool,
    root: Namespace,
    state: PipelineState,
    accum: Vec<FacetAccumulators>,
    cache: Option<Arc<CacheManager>>,
    init_pending: Option<String>,
    grid_pending: Option<String>,
    fft_pending: Option<String>,
    degrid_pending: Option<String>,
    dirty_ready: bool,
    transformed: bool,
    has_model: bool,
    norm_image: Option<Array2<f32>>,
    chunk_counter: JobCounter,
    tile_counter: JobCounter,
}

impl<D: JobDispatch> FacetMachine<D> {
    pub fn new(
        cfg: ImagingConfig,
        tess: Arc<Tessellation>,
        mut pool: D,
        store_root: &Path,
        do_psf: bool,
    ) -> Result<Self, PipelineError> {
        cfg.validate()?;
        if tess.is_empty() {
            return Err(ConfigError::Image("tessellation has no facets".into()).into());
        }
        let app_id = if do_psf { "FMPSF" } else { "FM" };
        let mut root = Namespace::create(store_root.join(app_id))?;
        let cf = root.add_sub_namespace(CF_NS)?;
        let grids = root.add_sub_namespace(GRID_NS)?;
        let model = root.add_sub_namespace(MODEL_NS)?;
        let tile_counter = pool.create_counter(&format!("{app_id}.model_tiles"));
        let handler = FacetJobHandler {
            cfg: cfg.clone(),
            tess: tess.clone(),
            cf_path: cf.path().to_path_buf(),
            grid_path: grids.path().to_path_buf(),
            model_path: model.path().to_path_buf(),
            row_locks: Arc::new(RowLocks::new(cfg.parallel.n_row_locks)),
            tiles_built: tile_counter.clone(),
            do_psf,
        };
        pool.register_handlers(app_id, Arc::new(handler));
        let chunk_counter = pool.create_counter(&format!("{app_id}.chunks"));
        info!(
            "{app_id}: {} facets of {} px (padded {}) on a {} px image",
            tess.len(),
            tess.npix_facet,
            tess.npix_padded,
            tess.npix
        );
        let (nb, npol) = (cfg.image.n_freq_bands, cfg.image.pol_mode.npol());
        Ok(FacetMachine {
            accum: vec![FacetAccumulators::new(nb, npol); tess.len()],
            cfg,
            tess,
            pool,
            app_id,
            do_psf,
            root,
            state: PipelineState::Uninitialized,
            cache: None,
            init_pending: None,
            grid_pending: None,
            fft_pending: None,
            degrid_pending: None,
            dirty_ready: false,
            transformed: false,
            has_model: false,
            norm_image: None,
            chunk_counter,
            tile_counter,
        })
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn tessellation(&self) -> &Tessellation {
        &self.tess
    }

    pub fn is_psf(&self) -> bool {
        self.do_psf
    }

    pub fn facet_states(&self) -> &[FacetAccumulators] {
        &self.accum
    }

    /// Chunks dispatched for gridding since construction.
    pub fn n_chunks_gridded(&self) -> usize {
        self.chunk_counter.get()
    }

    /// Facet model tiles transformed since construction.
    pub fn n_model_tiles_built(&self) -> usize {
        self.tile_counter.get()
    }

    fn invalid(&self, expected: &'static str) -> PipelineError {
        PipelineError::InvalidState {
            expected,
            found: format!("{:?}", self.state),
        }
    }

    fn refuse_psf(&self, what: &'static str) -> Result<(), PipelineError> {
        if self.do_psf {
            return Err(PipelineError::InvalidState {
                expected: what,
                found: "PSF orchestrator".into(),
            });
        }
        Ok(())
    }

    fn dispatch(&mut self, stage: &str, make: impl Fn(usize) -> JobRequest) -> Result<String, PipelineError> {
        let prefix = format!("{}.{stage}:", self.app_id);
        let pattern = format!("{prefix}*");
        for facet in 0..self.tess.len() {
            let label = format!("{prefix}F{facet}");
            if let Err(e) = self.pool.run_job(&label, self.app_id, make(facet)) {
                // do not leave half a stage in flight
                for (label, result) in self.pool.await_job_results(&pattern) {
                    if let Err(job_err) = result {
                        warn!("{label}: {job_err} (stage aborted)");
                    }
                }
                return Err(e.into());
            }
        }
        Ok(pattern)
    }

    /// Waits for every job matching `pattern`; the first failure is
    /// returned after all of them have been drained.
    fn barrier(&mut self, pattern: &str) -> Result<Vec<JobOutput>, PipelineError> {
        let mut outputs = Vec::new();
        let mut first_err = None;
        for (label, result) in self.pool.await_job_results(pattern) {
            match result {
                Ok(out) => outputs.push(out),
                Err(e) => {
                    warn!("{label}: {e}");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(outputs),
        }
    }

    /// Dispatches one kernel job per facet. Workers load the cached kernels
    /// when the cache key matches and recompute them otherwise.
    pub fn init_kernels_in_background(&mut self, cache: Arc<CacheManager>) -> Result<(), PipelineError> {
        if self.state != PipelineState::Uninitialized || self.init_pending.is_some() {
            return Err(self.invalid("Uninitialized"));
        }
        let (dir, valid) = cache.check(CF_CACHE, &self.cfg.kernel_cache_key())?;
        info!(
            "dispatching {} kernel jobs ({})",
            self.tess.len(),
            if valid { "cached" } else { "recomputing" }
        );
        let pattern = self.dispatch("InitCF", |facet| JobRequest::InitKernel {
            facet,
            cache_path: dir.join(format!("{facet}.bin")),
            cache_valid: valid,
        })?;
        self.cache = Some(cache);
        self.init_pending = Some(pattern);
        Ok(())
    }

    pub fn await_init_completion(&mut self) -> Result<(), PipelineError> {
        let Some(pattern) = self.init_pending.take() else {
            return if self.state == PipelineState::Uninitialized {
                Err(self.invalid("kernel initialisation dispatched"))
            } else {
                Ok(())
            };
        };
        self.barrier(&pattern)?;
        if let Some(cache) = &self.cache {
            cache.mark_valid(CF_CACHE)?;
        }
        self.state = PipelineState::KernelsReady;
        info!("kernels ready for {} facets", self.tess.len());
        Ok(())
    }

    /// Allocates zeroed grids for every facet and resets the accumulators.
    pub fn reinit_dirty(&mut self) -> Result<(), PipelineError> {
        self.await_init_completion()?;
        self.collect_gridding_results()?;
        if self.fft_pending.is_some() {
            self.collect_fourier_transform_results()?;
        }
        let (nb, npol) = (self.cfg.image.n_freq_bands, self.cfg.image.pol_mode.npol());
        let mut grids = self.root.sub_namespace(GRID_NS)?;
        for facet in &self.tess.facets {
            let np = facet.npix_padded;
            grids.add_shared_array::<C32>(facet.index, &[nb, npol, np, np])?;
        }
        self.accum = vec![FacetAccumulators::new(nb, npol); self.tess.len()];
        self.dirty_ready = true;
        self.transformed = false;
        self.state = PipelineState::DirtyBuffersReady;
        debug!("{}: dirty buffers reset", self.app_id);
        Ok(())
    }

    /// Dispatches one grid job per facet for `chunk`. Kernel initialisation
    /// and the previous chunk's jobs are awaited first.
    pub fn put_chunk_in_background(&mut self, chunk: &ChunkHandle) -> Result<(), PipelineError> {
        self.await_init_completion()?;
        if self.transformed || self.fft_pending.is_some() {
            return Err(self.invalid("DirtyBuffersReady or Gridding"));
        }
        if !self.dirty_ready {
            self.reinit_dirty()?;
        }
        self.collect_gridding_results()?;
        if self.degrid_pending.is_some() {
            self.collect_degridding_results()?;
        }
        info!("dispatching {} grid jobs for chunk {}", self.tess.len(), chunk.label);
        let pattern = self.dispatch(&format!("Grid.{}", chunk.label), |facet| JobRequest::Grid {
            facet,
            chunk: chunk.clone(),
        })?;
        self.chunk_counter.increment();
        self.grid_pending = Some(pattern);
        self.state = PipelineState::Gridding(chunk.label.clone());
        Ok(())
    }

    pub fn grid_chunk_in_background(&mut self, chunk: &ChunkHandle) -> Result<(), PipelineError> {
        self.put_chunk_in_background(chunk)
    }

    /// Folds the statistics of the outstanding grid jobs into the
    /// accumulators.
    pub fn collect_gridding_results(&mut self) -> Result<(), PipelineError> {
        let Some(pattern) = self.grid_pending.take() else {
            return Ok(());
        };
        for out in self.barrier(&pattern)? {
            match out {
                JobOutput::Gridded { facet, stats } => {
                    let acc = &mut self.accum[facet];
                    acc.stats.accumulate(&stats);
                    acc.n_chunks += 1;
                    if stats.n_outside > 0 {
                        warn!("facet {facet}: {} samples fell outside the grid", stats.n_outside);
                    }
                    if stats.n_w_clamped > 0 {
                        warn!("facet {facet}: {} samples beyond wmax", stats.n_w_clamped);
                    }
                }
                other => {
                    return Err(PipelineError::InvalidState {
                        expected: "grid job output",
                        found: format!("{other:?}"),
                    })
                }
            }
        }
        Ok(())
    }

    pub fn fourier_transform_in_background(&mut self) -> Result<(), PipelineError> {
        self.collect_gridding_results()?;
        if self.transformed || self.fft_pending.is_some() {
            return Ok(());
        }
        if !self.dirty_ready {
            return Err(self.invalid("DirtyBuffersReady or Gridding"));
        }
        info!("dispatching {} FFT jobs", self.tess.len());
        let pattern = self.dispatch("FFT", |facet| JobRequest::Fft { facet })?;
        self.fft_pending = Some(pattern);
        Ok(())
    }

    pub fn collect_fourier_transform_results(&mut self) -> Result<(), PipelineError> {
        let Some(pattern) = self.fft_pending.take() else {
            return if self.transformed {
                Ok(())
            } else {
                Err(self.invalid("FFT dispatched"))
            };
        };
        self.barrier(&pattern)?;
        self.transformed = true;
        self.state = PipelineState::FourierTransformed;
        Ok(())
    }

    fn compute_norm_image(&self) -> Result<Array2<f32>, PipelineError> {
        let n = self.tess.npix;
        let mut norm = Array2::<f32>::zeros((n, n));
        let cf = self.root.sub_namespace(CF_NS)?;
        for facet in 0..self.tess.len() {
            let (main, fe) = self.tess.padded_edges(facet);
            if main.is_empty() {
                continue;
            }
            let kn = cf.sub_namespace(facet)?;
            let sw_arr = kn.array::<f32>("sw")?;
            let sw = fixed::<f32, Ix2>(&sw_arr, "sw")?;
            let mut dst = norm.slice_mut(s![main.y0..main.y1, main.x0..main.x1]);
            dst += &sw.slice(s![fe.y0..fe.y1, fe.x0..fe.x1]);
        }
        Ok(norm)
    }

    /// Sum of the facet spatial weights over the main image.
    pub fn build_facet_norm_image(&mut self) -> Result<&Array2<f32>, PipelineError> {
        self.await_init_completion()?;
        let norm = match self.norm_image.take() {
            Some(norm) => norm,
            None => {
                info!("building facet normalisation image");
                self.compute_norm_image()?
            }
        };
        let norm: &Array2<f32> = self.norm_image.insert(norm);
        Ok(norm)
    }

    fn stitch(
        &self,
        norm_image: &Array2<f32>,
        sum_jones_norm: &[Vec<f64>],
        mosaic: Mosaic,
    ) -> Result<Array4<f32>, PipelineError> {
        let (nb, npol, n) = (
            self.cfg.image.n_freq_bands,
            self.cfg.image.pol_mode.npol(),
            self.tess.npix,
        );
        let mut out = Array4::<f32>::zeros((nb, npol, n, n));
        let cf = self.root.sub_namespace(CF_NS)?;
        let grids = self.root.sub_namespace(GRID_NS)?;
        for facet in 0..self.tess.len() {
            let (main, fe) = self.tess.padded_edges(facet);
            if main.is_empty() {
                continue;
            }
            let kn = cf.sub_namespace(facet)?;
            let sphe_arr = kn.array::<f32>("sphe")?;
            let sw_arr = kn.array::<f32>("sw")?;
            let grid_arr = grids.array::<C32>(facet)?;
            let sphe = fixed::<f32, Ix2>(&sphe_arr, "sphe")?;
            let sw = fixed::<f32, Ix2>(&sw_arr, "sw")?;
            let grid = fixed::<C32, Ix4>(&grid_arr, "facet grid")?;
            let acc = &self.accum[facet];
            for b in 0..nb {
                let jn = sum_jones_norm[facet][b];
                for p in 0..npol {
                    let scale = match mosaic {
                        Mosaic::Image => {
                            let w = acc.stats.sum_weights[[b, p]];
                            if !(w > 0.0) {
                                continue;
                            }
                            (1.0 / (w * jn.sqrt())) as f32
                        }
                        Mosaic::JonesAmplitude => jn.sqrt() as f32,
                    };
                    for (y, x, fy, fx) in overlap_pixels(&main, &fe) {
                        let v = match mosaic {
                            Mosaic::Image => {
                                let sp = sphe[[fy, fx]];
                                if sp < SPHE_CUT {
                                    continue;
                                }
                                grid[[b, p, fy, fx]].re / sp
                            }
                            Mosaic::JonesAmplitude => 1.0,
                        };
                        out[[b, p, y, x]] += v * scale * sw[[fy, fx]];
                    }
                }
            }
        }
        for mut band in out.outer_iter_mut() {
            for mut plane in band.outer_iter_mut() {
                plane.zip_mut_with(norm_image, |v, &norm| {
                    *v = if norm > 0.0 { *v / norm } else { 0.0 };
                });
            }
        }
        Ok(out)
    }

    /// Stitches the transformed facets into the main image. Outstanding grid
    /// and FFT work is completed first.
    pub fn facets_to_image(&mut self, norm_jones: bool) -> Result<FacetImages, PipelineError> {
        self.collect_gridding_results()?;
        if !self.transformed {
            if self.fft_pending.is_none() {
                self.fourier_transform_in_background()?;
            }
            self.collect_fourier_transform_results()?;
        }
        let norm_image = self.build_facet_norm_image()?.clone();

        let sum_weights = self.accum[0].stats.sum_weights.clone();
        let total = sum_weights.sum();
        let weight_chans_images = if total > 0.0 {
            &sum_weights / total
        } else {
            Array2::zeros(sum_weights.dim())
        };
        let sum_jones_norm: Vec<Vec<f64>> = self.accum.iter().map(FacetAccumulators::sum_jones_norm).collect();

        info!("stitching {} facets", self.tess.len());
        let image = self.stitch(&norm_image, &sum_jones_norm, Mosaic::Image)?;
        let mean_image = band_mean(&image, &sum_weights);
        let out = if self.do_psf {
            FacetImages::Psf(self.psf_products(
                image,
                mean_image,
                norm_image,
                weight_chans_images,
                sum_jones_norm,
            )?)
        } else {
            let norm_data = if norm_jones {
                Some(self.stitch(&norm_image, &sum_jones_norm, Mosaic::JonesAmplitude)?)
            } else {
                None
            };
            FacetImages::Dirty(StitchedImages {
                image,
                mean_image,
                norm_image,
                norm_data,
                sum_weights,
                weight_chans_images,
                sum_jones_norm,
            })
        };
        self.state = PipelineState::Stitched;
        Ok(out)
    }

    fn psf_products(
        &self,
        image: Array4<f32>,
        mean_image: Array4<f32>,
        norm_image: Array2<f32>,
        weight_chans_images: Array2<f64>,
        sum_jones_norm: Vec<Vec<f64>>,
    ) -> Result<PsfProducts, PipelineError> {
        let nf = self.tess.len();
        let (nb, npol) = (self.cfg.image.n_freq_bands, self.cfg.image.pol_mode.npol());
        let np_min = self.tess.facets.iter().map(|f| f.npix_padded).min().unwrap_or(0);
        let n = psf_footprint(np_min, self.tess.padding, self.cfg.rime.circumcision);
        if let Some(c) = self.cfg.rime.circumcision {
            if c != n {
                warn!("PSF circumcision {c} clamped to {n}");
            }
        }
        let mut cube = Array5::<f32>::zeros((nf, nb, npol, n, n));
        let mut mean_cube = Array5::<f32>::zeros((nf, 1, npol, n, n));
        let cf = self.root.sub_namespace(CF_NS)?;
        let grids = self.root.sub_namespace(GRID_NS)?;
        for (facet, geom) in self.tess.facets.iter().enumerate() {
            let lo = geom.npix_padded / 2 - n / 2;
            let kn = cf.sub_namespace(facet)?;
            let sphe_arr = kn.array::<f32>("sphe")?;
            let grid_arr = grids.array::<C32>(facet)?;
            let sphe = fixed::<f32, Ix2>(&sphe_arr, "sphe")?;
            let grid = fixed::<C32, Ix4>(&grid_arr, "facet grid")?;
            let acc = &self.accum[facet];
            for b in 0..nb {
                let jn = sum_jones_norm[facet][b];
                for p in 0..npol {
                    let w = acc.stats.sum_weights[[b, p]];
                    if !(w > 0.0) {
                        continue;
                    }
                    let scale = (1.0 / (w * jn.sqrt())) as f32;
                    let wc = weight_chans_images[[b, p]] as f32;
                    for iy in 0..n {
                        for ix in 0..n {
                            let sp = sphe[[lo + iy, lo + ix]];
                            if sp < SPHE_CUT_PSF {
                                continue;
                            }
                            let v = grid[[b, p, lo + iy, lo + ix]].re / sp * scale;
                            cube[[facet, b, p, iy, ix]] = v;
                            mean_cube[[facet, 0, p, iy, ix]] += v * wc;
                        }
                    }
                }
            }
        }
        let peak_cube = peak_normalise(&cube);
        let peak_mean_cube = peak_normalise(&mean_cube);
        let mean_facet_psf = peak_mean_cube
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array4::zeros((1, npol, n, n)));
        info!("PSF cubes of {n}x{n} px for {nf} facets");
        Ok(PsfProducts {
            npix_min: n,
            central_facet: self.tess.central_facet(),
            cube_variable_psf: cube,
            cube_mean_variable_psf: mean_cube,
            peak_normed_cube_variable_psf: peak_cube,
            peak_normed_cube_mean_variable_psf: peak_mean_cube,
            mean_facet_psf,
            mean_jones_band: sum_jones_norm,
            weight_chans_images,
            image,
            mean_image,
            norm_image,
        })
    }

    /// Publishes the model image and transforms it once per facet into the
    /// tiles every later degrid job reads.
    pub fn set_model_image(&mut self, model: Array4<f32>) -> Result<(), PipelineError> {
        self.refuse_psf("dirty-mode orchestrator")?;
        if self.degrid_pending.is_some() {
            return Err(self.invalid("degrid jobs collected"));
        }
        let expected = [
            self.cfg.image.n_freq_bands,
            self.cfg.image.pol_mode.npol(),
            self.tess.npix,
            self.tess.npix,
        ];
        if model.shape() != &expected[..] {
            return Err(ContractError::Shape {
                name: "model image",
                expected: expected.to_vec(),
                found: model.shape().to_vec(),
            }
            .into());
        }
        let norm = self.build_facet_norm_image()?.clone();
        let mut ns = self.root.add_sub_namespace(MODEL_NS)?;
        ns.put_ndarray("image", &model)?;
        ns.put_ndarray("norm", &norm)?;
        let mut tiles = ns.add_sub_namespace(TILES_NS)?;
        let (nb, npol) = (expected[0], expected[1]);
        for facet in &self.tess.facets {
            let np = facet.npix_padded;
            tiles.add_shared_array::<C32>(facet.index, &[nb, npol, np, np])?;
        }

        info!("transforming the model into {} facet tiles", self.tess.len());
        let pattern = self.dispatch("ModelFFT", |facet| JobRequest::ModelTile { facet })?;
        for out in self.barrier(&pattern)? {
            if !matches!(out, JobOutput::ModelTileReady { .. }) {
                return Err(PipelineError::InvalidState {
                    expected: "model tile job output",
                    found: format!("{out:?}"),
                });
            }
        }
        self.has_model = true;
        self.state = PipelineState::ModelLoaded;
        Ok(())
    }

    pub fn release_model_image(&mut self) -> Result<(), PipelineError> {
        if !self.has_model {
            return Ok(());
        }
        if self.degrid_pending.is_some() {
            return Err(self.invalid("degrid jobs collected"));
        }
        // recreating the namespace drops the image and its tiles
        self.root.add_sub_namespace(MODEL_NS)?;
        self.has_model = false;
        Ok(())
    }

    /// Dispatches one degrid job per facet; each subtracts its facet's
    /// prediction from the chunk's residual buffer.
    pub fn degrid_chunk_in_background(&mut self, chunk: &ChunkHandle) -> Result<(), PipelineError> {
        self.refuse_psf("dirty-mode orchestrator")?;
        if !self.has_model {
            return Err(self.invalid("ModelLoaded"));
        }
        self.await_init_completion()?;
        self.collect_gridding_results()?;
        self.collect_degridding_results()?;
        info!("dispatching {} degrid jobs for chunk {}", self.tess.len(), chunk.label);
        let pattern = self.dispatch(&format!("Degrid.{}", chunk.label), |facet| JobRequest::Degrid {
            facet,
            chunk: chunk.clone(),
        })?;
        self.degrid_pending = Some(pattern);
        self.state = PipelineState::Degridding(chunk.label.clone());
        Ok(())
    }

    pub fn get_chunk_in_background(&mut self, chunk: &ChunkHandle) -> Result<(), PipelineError> {
        self.degrid_chunk_in_background(chunk)
    }

    pub fn collect_degridding_results(&mut self) -> Result<DegridStats, PipelineError> {
        let mut total = DegridStats::default();
        let Some(pattern) = self.degrid_pending.take() else {
            return Ok(total);
        };
        for out in self.barrier(&pattern)? {
            match out {
                JobOutput::Degridded { stats, .. } => {
                    total.n_predicted += stats.n_predicted;
                    total.n_outside += stats.n_outside;
                    total.n_w_clamped += stats.n_w_clamped;
                }
                other => {
                    return Err(PipelineError::InvalidState {
                        expected: "degrid job output",
                        found: format!("{other:?}"),
                    })
                }
            }
        }
        self.state = PipelineState::Collected;
        Ok(total)
    }

    /// Drains outstanding jobs and removes the orchestrator's store.
    pub fn teardown(mut self) -> Result<(), PipelineError> {
        let pattern = format!("{}.*", self.app_id);
        for (label, result) in self.pool.await_job_results(&pattern) {
            if let Err(e) = result {
                warn!("{label} finished with an error during teardown: {e}");
            }
        }
        info!("{}: tearing down store {}", self.app_id, self.root.path().display());
        self.root.delete()?;
        Ok(())
    }
}

/// Band average weighted by each band's share of the weights, per Stokes
/// plane.
fn band_mean(image: &Array4<f32>, sum_weights: &Array2<f64>) -> Array4<f32> {
    let (nb, npol, ny, nx) = image.dim();
    let mut mean = Array4::<f32>::zeros((1, npol, ny, nx));
    for p in 0..npol {
        let total: f64 = (0..nb).map(|b| sum_weights[[b, p]]).sum();
        for b in 0..nb {
            let w = if total > 0.0 {
                sum_weights[[b, p]] / total
            } else {
                1.0 / nb as f64
            };
            let src = image.slice(s![b, p, .., ..]);
            let mut dst = mean.slice_mut(s![0, p, .., ..]);
            dst.scaled_add(w as f32, &src);
        }
    }
    mean
}

/// Divides each facet's sub-cube by its maximum.
fn peak_normalise(cube: &Array5<f32>) -> Array5<f32> {
    let mut out = cube.clone();
    for mut facet in out.outer_iter_mut() {
        let peak = facet.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if peak > 0.0 {
            facet.mapv_inplace(|v| v / peak);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Args;
    use crate::dispatch::{label_matches, JobResult, WorkerPool};
    use crate::error::JobError;
    use crate::simulate::{simulate, Observation, SimulationConfig};
    use crate::store::Namespace;
    use crate::vis::residual_rms;
    use approx::assert_abs_diff_eq;
    use clap::Parser;

    fn setup(extra: &[&str]) -> (ImagingConfig, Observation, Arc<Tessellation>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut argv = vec![
            "facet_imager",
            "--npix",
            "64",
            "--cell",
            "30",
            "--nfacets",
            "2",
            "--padding",
            "1.2",
            "--workers",
            "1",
            "--antennas",
            "8",
            "--array-radius",
            "600",
            "--ha-span",
            "1",
            "--dt",
            "300",
            "--channels",
            "2",
            "--chunk-times",
            "6",
        ];
        argv.extend_from_slice(extra);
        let args = Args::try_parse_from(argv).unwrap();
        let cfg = ImagingConfig::from_args(&args, None, |_| false).unwrap();
        let tess = Arc::new(Tessellation::new(&cfg.image));
        let obs = simulate(&SimulationConfig::from_args(&args, &cfg).unwrap());
        (cfg, obs, tess)
    }

    /// Source string placing a unit source on the centre of facet 0.
    fn facet0_source(tess: &Tessellation, flux: f64) -> String {
        let f = &tess.facets[0];
        format!("{}:{}:{flux}", f.l0.to_degrees(), f.m0.to_degrees())
    }

    fn machine(
        cfg: &ImagingConfig,
        tess: &Arc<Tessellation>,
        dir: &Path,
        psf: bool,
    ) -> FacetMachine<WorkerPool> {
        let mut fm = FacetMachine::new(cfg.clone(), tess.clone(), WorkerPool::new(2), dir, psf).unwrap();
        let cache = Arc::new(CacheManager::new(dir.join("cache"), false).unwrap());
        fm.init_kernels_in_background(cache).unwrap();
        fm
    }

    /// Accepts the first job of a stage, then reports the pool closed.
    #[derive(Default)]
    struct ClosingPool {
        submitted: Vec<String>,
        drained: Vec<String>,
    }

    impl JobDispatch for ClosingPool {
        fn register_handlers(&mut self, _name: &str, _handler: Arc<dyn JobHandler>) {}

        fn run_job(&mut self, label: &str, _handler: &str, _request: JobRequest) -> Result<(), JobError> {
            if !self.submitted.is_empty() {
                return Err(JobError::PoolClosed);
            }
            self.submitted.push(label.to_string());
            Ok(())
        }

        fn await_job_results(&mut self, pattern: &str) -> Vec<JobResult> {
            self.drained.push(pattern.to_string());
            self.submitted
                .drain(..)
                .filter(|label| label_matches(pattern, label))
                .map(|label| {
                    let message = "no kernel cache".to_string();
                    (label.clone(), Err(JobError::Failed { label, message }))
                })
                .collect()
        }

        fn create_counter(&mut self, _name: &str) -> JobCounter {
            JobCounter::default()
        }
    }

    #[test]
    fn failed_dispatch_drains_the_partial_stage() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, _, tess) = setup(&[]);
        let mut pool = ClosingPool::default();
        let mut fm = FacetMachine::new(cfg, tess, &mut pool, dir.path(), false).unwrap();
        let cache = Arc::new(CacheManager::new(dir.path().join("cache"), false).unwrap());
        let err = fm.init_kernels_in_background(cache).unwrap_err();
        assert!(matches!(err, PipelineError::Job(JobError::PoolClosed)), "{err}");
        assert_eq!(fm.state(), &PipelineState::Uninitialized);
        drop(fm);
        assert_eq!(pool.drained, vec!["FM.InitCF:*".to_string()]);
        assert!(pool.submitted.is_empty());
    }

    #[test]
    fn footprint_is_odd_and_fits() {
        assert_eq!(psf_footprint(40, 1.2, None), 33);
        assert_eq!(psf_footprint(630, 1.2, None), 525);
        assert_eq!(psf_footprint(40, 1.0, None), 39);
        assert_eq!(psf_footprint(40, 1.2, Some(11)), 11);
        assert_eq!(psf_footprint(40, 1.2, Some(41)), 39);
    }

    #[test]
    fn chunk_seed_is_stable_per_label() {
        assert_eq!(chunk_seed("c0"), chunk_seed("c0"));
        assert_ne!(chunk_seed("c0"), chunk_seed("c1"));
    }

    #[test]
    fn sum_jones_norm_replaces_empty_bands() {
        let mut acc = FacetAccumulators::new(2, 1);
        acc.stats.sum_jones[[0, 0]] = 3.0;
        acc.stats.sum_jones[[1, 0]] = 2.0;
        assert_eq!(acc.sum_jones_norm(), vec![1.5, 1.0]);
    }

    #[test]
    fn out_of_order_calls_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, obs, tess) = setup(&[]);
        let mut fm = FacetMachine::new(cfg, tess, WorkerPool::new(1), dir.path(), false).unwrap();
        let mut vis = Namespace::create(dir.path().join("vis")).unwrap();
        let handle = obs.chunks[0].publish(&mut vis).unwrap();
        assert!(matches!(
            fm.put_chunk_in_background(&handle),
            Err(PipelineError::InvalidState { .. })
        ));
        assert!(matches!(
            fm.degrid_chunk_in_background(&handle),
            Err(PipelineError::InvalidState { .. })
        ));
        assert_eq!(fm.state(), &PipelineState::Uninitialized);
    }

    #[test]
    fn psf_orchestrator_refuses_models() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, obs, tess) = setup(&[]);
        let mut fm = machine(&cfg, &tess, dir.path(), true);
        let n = tess.npix;
        let err = fm.set_model_image(Array4::zeros((1, 1, n, n))).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState { .. }));
        let mut vis = Namespace::create(dir.path().join("vis")).unwrap();
        let handle = obs.chunks[0].publish(&mut vis).unwrap();
        assert!(fm.degrid_chunk_in_background(&handle).is_err());
        fm.teardown().unwrap();
    }

    #[test]
    fn model_shape_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, _, tess) = setup(&[]);
        let mut fm = machine(&cfg, &tess, dir.path(), false);
        let err = fm.set_model_image(Array4::zeros((1, 1, 8, 8))).unwrap_err();
        assert!(matches!(err, PipelineError::Contract(ContractError::Shape { .. })));
        fm.teardown().unwrap();
    }

    #[test]
    fn norm_image_covers_the_mosaic() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, _, tess) = setup(&[]);
        let mut fm = machine(&cfg, &tess, dir.path(), false);
        let norm = fm.build_facet_norm_image().unwrap().clone();
        assert_eq!(fm.state(), &PipelineState::KernelsReady);
        assert_eq!(norm.dim(), (tess.npix, tess.npix));
        let c = tess.facets[0].pix_central;
        assert!(norm[[c.1, c.0]] > 0.9);
        assert!(norm.iter().all(|&v| v >= 0.0));
        fm.teardown().unwrap();
    }

    #[test]
    fn point_source_at_a_facet_centre_images_at_its_flux() {
        let dir = tempfile::tempdir().unwrap();
        let (_, _, tess) = setup(&[]);
        let src = facet0_source(&tess, 2.0);
        let (cfg, obs, tess) = setup(&["--sources", &src]);
        let mut fm = machine(&cfg, &tess, dir.path(), false);
        let mut vis = Namespace::create(dir.path().join("vis")).unwrap();
        for chunk in &obs.chunks {
            let handle = chunk.publish(&mut vis).unwrap();
            fm.put_chunk_in_background(&handle).unwrap();
        }
        assert_eq!(fm.n_chunks_gridded(), obs.chunks.len());
        let FacetImages::Dirty(out) = fm.facets_to_image(true).unwrap() else {
            panic!("dirty orchestrator returned PSF products");
        };
        assert_eq!(fm.state(), &PipelineState::Stitched);
        assert!(fm.facet_states().iter().all(|a| a.n_chunks == obs.chunks.len()));

        let (x, y) = tess.facets[0].pix_central;
        assert_abs_diff_eq!(out.image[[0, 0, y, x]], 2.0, epsilon = 0.04);
        assert_abs_diff_eq!(out.mean_image[[0, 0, y, x]], out.image[[0, 0, y, x]], epsilon = 1e-6);
        assert_abs_diff_eq!(out.weight_chans_images.sum(), 1.0, epsilon = 1e-9);
        let norm_data = out.norm_data.unwrap();
        assert_abs_diff_eq!(norm_data[[0, 0, y, x]], 1.0, epsilon = 1e-4);
        fm.teardown().unwrap();
    }

    #[test]
    fn degridding_the_true_model_empties_the_residual() {
        let dir = tempfile::tempdir().unwrap();
        let (_, _, tess) = setup(&[]);
        let src = facet0_source(&tess, 1.0);
        let (cfg, obs, tess) = setup(&["--sources", &src]);
        let mut fm = machine(&cfg, &tess, dir.path(), false);
        let n = tess.npix;
        let (x, y) = tess.facets[0].pix_central;
        let mut model = Array4::<f32>::zeros((1, 1, n, n));
        model[[0, 0, y, x]] = 1.0;
        fm.set_model_image(model).unwrap();

        let mut vis = Namespace::create(dir.path().join("vis")).unwrap();
        let chunk = &obs.chunks[0];
        let handle = chunk.publish(&mut vis).unwrap();
        fm.get_chunk_in_background(&handle).unwrap();
        let stats = fm.collect_degridding_results().unwrap();
        assert!(stats.n_predicted > 0);
        assert_eq!(fm.state(), &PipelineState::Collected);

        let view = ChunkView::open(&handle).unwrap();
        let residual = view.residual_snapshot().unwrap();
        let before = residual_rms(&chunk.data.view(), &chunk.flags.view());
        let after = residual_rms(&residual.view(), &chunk.flags.view());
        assert!(after < 0.02 * before, "residual rms {after} vs data rms {before}");
        fm.release_model_image().unwrap();
        fm.teardown().unwrap();
    }

    #[test]
    fn model_tiles_are_built_once_per_model() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, obs, tess) = setup(&[]);
        assert!(obs.chunks.len() >= 2);
        let mut fm = machine(&cfg, &tess, dir.path(), false);
        let n = tess.npix;
        let (x, y) = tess.facets[0].pix_central;
        let mut model = Array4::<f32>::zeros((1, 1, n, n));
        model[[0, 0, y, x]] = 1.0;
        fm.set_model_image(model.clone()).unwrap();
        assert_eq!(fm.n_model_tiles_built(), tess.len());

        let mut vis = Namespace::create(dir.path().join("vis")).unwrap();
        for chunk in obs.chunks.iter().take(2) {
            let handle = chunk.publish(&mut vis).unwrap();
            fm.degrid_chunk_in_background(&handle).unwrap();
            assert!(fm.collect_degridding_results().unwrap().n_predicted > 0);
        }
        assert_eq!(fm.n_model_tiles_built(), tess.len());

        let model_ns = fm.root.sub_namespace(MODEL_NS).unwrap();
        let stored = model_ns.sub_namespace(TILES_NS).unwrap().array::<C32>(0usize).unwrap();
        let kernels = KernelSet::from_namespace(&fm.root.sub_namespace(CF_NS).unwrap().sub_namespace(0usize).unwrap()).unwrap();
        let norm = fm.norm_image.clone().unwrap();
        let (main, fe) = tess.padded_edges(0);
        let direct = model_tile(&model.view(), &norm.view(), &kernels, &main, &fe).unwrap();
        assert_eq!(stored.shape(), direct.shape());
        for (a, b) in stored.as_slice().iter().zip(direct.iter()) {
            assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-6);
            assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-6);
        }

        fm.release_model_image().unwrap();
        assert!(!fm.root.sub_namespace(MODEL_NS).unwrap().contains(TILES_NS));
        fm.set_model_image(model).unwrap();
        assert_eq!(fm.n_model_tiles_built(), 2 * tess.len());
        fm.teardown().unwrap();
    }

    #[test]
    fn psf_cubes_peak_at_unity() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, obs, tess) = setup(&[]);
        let mut fm = machine(&cfg, &tess, dir.path(), true);
        let mut vis = Namespace::create(dir.path().join("vis")).unwrap();
        for chunk in &obs.chunks {
            let handle = chunk.publish(&mut vis).unwrap();
            fm.grid_chunk_in_background(&handle).unwrap();
        }
        fm.fourier_transform_in_background().unwrap();
        fm.collect_fourier_transform_results().unwrap();
        let FacetImages::Psf(psf) = fm.facets_to_image(false).unwrap() else {
            panic!("PSF orchestrator returned dirty products");
        };
        let n = psf.npix_min;
        assert_eq!(n % 2, 1);
        assert_eq!(psf.cube_variable_psf.dim(), (tess.len(), 1, 1, n, n));
        assert_eq!(psf.cube_mean_variable_psf.dim(), (tess.len(), 1, 1, n, n));
        for f in 0..tess.len() {
            assert_abs_diff_eq!(psf.cube_variable_psf[[f, 0, 0, n / 2, n / 2]], 1.0, epsilon = 0.02);
            assert_abs_diff_eq!(psf.peak_normed_cube_variable_psf[[f, 0, 0, n / 2, n / 2]], 1.0, epsilon = 0.02);
        }
        assert_abs_diff_eq!(psf.mean_facet_psf[[0, 0, n / 2, n / 2]], 1.0, epsilon = 0.02);
        assert_eq!(psf.mean_jones_band.len(), tess.len());
        fm.teardown().unwrap();
    }
}
