//! Validated imaging configuration.
//!
//! Everything a pipeline run needs is resolved here once, from the command
//! line and optionally a JSON file, and checked before any job is dispatched.

use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::args::Args;
use crate::error::ConfigError;
use crate::geom::{parse_dec, parse_ra};
use crate::jones::{ApplyMode, JonesMode};
use crate::store::default_root;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum PolMode {
    /// Stokes I only.
    I,
    /// Full Stokes from four linear correlations.
    #[value(name = "iquv")]
    IQUV,
}

impl PolMode {
    pub fn npol(self) -> usize {
        match self {
            PolMode::I => 1,
            PolMode::IQUV => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum DecorrMode {
    None,
    /// Bandwidth smearing.
    F,
    /// Time-average smearing.
    T,
    FT,
}

impl DecorrMode {
    pub fn freq(self) -> bool {
        matches!(self, DecorrMode::F | DecorrMode::FT)
    }

    pub fn time(self) -> bool {
        matches!(self, DecorrMode::T | DecorrMode::FT)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum DecorrLocation {
    /// Facet centre.
    Center,
    /// Facet point closest to the phase centre.
    Edge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum GlobalNorm {
    None,
    /// Mean amplitude per direction.
    MeanAbs,
    /// Mean amplitude per direction and antenna.
    MeanAbsAnt,
}

/// How the solutions of several calibration directions are combined for one
/// facet.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DirectionWeighting {
    Nearest,
    Blend {
        scale_deg: f64,
        gamma: f64,
        rel_threshold: f64,
        max_dirs: usize,
    },
}

impl DirectionWeighting {
    /// Same policy with a different cap on contributing directions.
    pub fn with_max_dirs(self, n: usize) -> Self {
        match self {
            DirectionWeighting::Nearest => DirectionWeighting::Nearest,
            DirectionWeighting::Blend {
                scale_deg,
                gamma,
                rel_threshold,
                ..
            } => DirectionWeighting::Blend {
                scale_deg,
                gamma,
                rel_threshold,
                max_dirs: n,
            },
        }
    }
}

/// Analytic primary beam. Fixed for the lifetime of a solution manager.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum BeamModel {
    None,
    Gaussian { fwhm_deg: f64, ref_freq_hz: f64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub npix: usize,
    pub cell_arcsec: f64,
    pub nfacets: usize,
    pub padding: f64,
    pub pol_mode: PolMode,
    pub n_freq_bands: usize,
    /// Phase centre in radians.
    pub ra0: f64,
    pub dec0: f64,
}

impl ImageConfig {
    pub fn cell_rad(&self) -> f64 {
        (self.cell_arcsec / 3600.0).to_radians()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    pub support: usize,
    pub oversampling: usize,
    pub n_wplanes: usize,
    pub wmax: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RimeConfig {
    pub decorr_mode: DecorrMode,
    pub decorr_location: DecorrLocation,
    pub circumcision: Option<usize>,
    pub sparsification: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DdeConfig {
    pub sol_files: Vec<PathBuf>,
    /// One entry per solution file.
    pub jones_norm: Vec<ApplyMode>,
    pub global_norm: GlobalNorm,
    pub jones_mode: JonesMode,
    pub grid_apply: ApplyMode,
    pub degrid_apply: ApplyMode,
    pub weighting: DirectionWeighting,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BeamConfig {
    pub model: BeamModel,
    pub dt_beam_min: f64,
    pub n_band: usize,
    pub center_norm: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub workers: usize,
    pub n_row_locks: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub reset: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImagingConfig {
    pub image: ImageConfig,
    pub kernel: KernelConfig,
    pub rime: RimeConfig,
    pub dde: DdeConfig,
    pub beam: BeamConfig,
    pub parallel: ParallelConfig,
    pub cache: CacheConfig,
    pub store_root: PathBuf,
}

/// Fields that change the per-facet kernels.
#[derive(Serialize)]
pub struct KernelCacheKey<'a> {
    pub npix: usize,
    pub cell_arcsec: f64,
    pub nfacets: usize,
    pub padding: f64,
    pub ra0: f64,
    pub dec0: f64,
    pub kernel: &'a KernelConfig,
}

impl ImagingConfig {
    /// Builds the configuration from the command line. With a `base` loaded
    /// from JSON, only options for which `explicit(id)` holds override it.
    pub fn from_args(
        args: &Args,
        base: Option<ImagingConfig>,
        explicit: impl Fn(&str) -> bool,
    ) -> Result<Self, ConfigError> {
        let cli = Self::from_cli(args)?;
        let Some(mut cfg) = base else {
            cli.validate()?;
            return Ok(cli);
        };

        macro_rules! take {
            ($id:literal => $($field:ident).+) => {
                if explicit($id) {
                    cfg.$($field).+ = cli.$($field).+.clone();
                }
            };
        }
        take!("npix" => image.npix);
        take!("cell_arcsec" => image.cell_arcsec);
        take!("nfacets" => image.nfacets);
        take!("padding" => image.padding);
        take!("pol_mode" => image.pol_mode);
        take!("n_freq_bands" => image.n_freq_bands);
        take!("ra" => image.ra0);
        take!("dec" => image.dec0);
        take!("support" => kernel.support);
        take!("oversampling" => kernel.oversampling);
        take!("n_wplanes" => kernel.n_wplanes);
        take!("wmax" => kernel.wmax);
        take!("decorr_mode" => rime.decorr_mode);
        take!("decorr_location" => rime.decorr_location);
        take!("circumcision" => rime.circumcision);
        take!("sparsification" => rime.sparsification);
        take!("sol_files" => dde.sol_files);
        take!("jones_norm" => dde.jones_norm);
        take!("global_norm" => dde.global_norm);
        take!("jones_mode" => dde.jones_mode);
        take!("dd_mode_grid" => dde.grid_apply);
        take!("dd_mode_degrid" => dde.degrid_apply);
        take!("weighting" => dde.weighting);
        take!("beam_fwhm_deg" => beam.model);
        take!("dt_beam_min" => beam.dt_beam_min);
        take!("beam_n_band" => beam.n_band);
        take!("beam_center_norm" => beam.center_norm);
        take!("workers" => parallel.workers);
        take!("n_row_locks" => parallel.n_row_locks);
        take!("store_root" => store_root);
        take!("cache_dir" => cache.dir);
        take!("cache_reset" => cache.reset);
        if cfg.dde.jones_norm.len() != cfg.dde.sol_files.len() {
            cfg.dde.jones_norm.resize(cfg.dde.sol_files.len(), ApplyMode::AP);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_cli(args: &Args) -> Result<Self, ConfigError> {
        let ra0 = parse_ra(&args.ra).map_err(|e| ConfigError::Image(format!("RA: {e}")))?;
        let dec0 = parse_dec(&args.dec).map_err(|e| ConfigError::Image(format!("Dec: {e}")))?;

        let parse_apply = |text: &str| {
            ApplyMode::parse(text)
                .ok_or_else(|| ConfigError::Solutions(format!("apply mode '{text}' is not AP, A or P")))
        };
        if args.jones_norm.len() > args.sol_files.len() {
            return Err(ConfigError::Solutions(format!(
                "{} jones-norm values for {} solution files",
                args.jones_norm.len(),
                args.sol_files.len()
            )));
        }
        let mut jones_norm = args
            .jones_norm
            .iter()
            .map(|s| parse_apply(s))
            .collect::<Result<Vec<_>, _>>()?;
        jones_norm.resize(args.sol_files.len(), ApplyMode::AP);

        let weighting = match args.weighting.as_str() {
            "nearest" => DirectionWeighting::Nearest,
            "blend" => DirectionWeighting::Blend {
                scale_deg: args.blend_scale_deg,
                gamma: args.blend_gamma,
                rel_threshold: args.blend_threshold,
                max_dirs: args.blend_max_dirs,
            },
            other => {
                return Err(ConfigError::Solutions(format!(
                    "unknown direction weighting '{other}'"
                )))
            }
        };

        let model = if args.beam_fwhm_deg > 0.0 {
            BeamModel::Gaussian {
                fwhm_deg: args.beam_fwhm_deg,
                ref_freq_hz: args.beam_ref_freq_mhz * 1e6,
            }
        } else {
            BeamModel::None
        };

        Ok(ImagingConfig {
            image: ImageConfig {
                npix: args.npix,
                cell_arcsec: args.cell_arcsec,
                nfacets: args.nfacets,
                padding: args.padding,
                pol_mode: args.pol_mode,
                n_freq_bands: args.n_freq_bands,
                ra0,
                dec0,
            },
            kernel: KernelConfig {
                support: args.support,
                oversampling: args.oversampling,
                n_wplanes: args.n_wplanes,
                wmax: args.wmax,
            },
            rime: RimeConfig {
                decorr_mode: args.decorr_mode,
                decorr_location: args.decorr_location,
                circumcision: args.circumcision,
                sparsification: args.sparsification,
            },
            dde: DdeConfig {
                sol_files: args.sol_files.clone(),
                jones_norm,
                global_norm: args.global_norm,
                jones_mode: args.jones_mode,
                grid_apply: parse_apply(&args.dd_mode_grid)?,
                degrid_apply: parse_apply(&args.dd_mode_degrid)?,
                weighting,
            },
            beam: BeamConfig {
                model,
                dt_beam_min: args.dt_beam_min,
                n_band: args.beam_n_band,
                center_norm: args.beam_center_norm,
            },
            parallel: ParallelConfig {
                workers: args.workers,
                n_row_locks: args.n_row_locks,
            },
            cache: CacheConfig {
                dir: args.cache_dir.clone(),
                reset: args.cache_reset,
            },
            store_root: args
                .store_root
                .clone()
                .unwrap_or_else(|| default_root("facet_imager")),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let im = &self.image;
        if im.npix < 16 {
            return Err(ConfigError::Image(format!("npix {} is below 16", im.npix)));
        }
        if im.nfacets == 0 {
            return Err(ConfigError::Image("nfacets must be at least 1".into()));
        }
        if im.npix / im.nfacets < 8 {
            return Err(ConfigError::Image(format!(
                "{} facets per axis leave fewer than 8 pixels per facet",
                im.nfacets
            )));
        }
        if !(1.0..=3.0).contains(&im.padding) {
            return Err(ConfigError::Image(format!(
                "padding {} outside [1, 3]",
                im.padding
            )));
        }
        if !(im.cell_arcsec > 0.0) {
            return Err(ConfigError::Image("cell size must be positive".into()));
        }
        if im.n_freq_bands == 0 {
            return Err(ConfigError::Image("at least one frequency band is required".into()));
        }

        let k = &self.kernel;
        if k.support < 3 || k.support % 2 == 0 {
            return Err(ConfigError::Kernel(format!(
                "support {} must be odd and at least 3",
                k.support
            )));
        }
        if k.oversampling == 0 {
            return Err(ConfigError::Kernel("oversampling must be at least 1".into()));
        }
        if k.n_wplanes == 0 {
            return Err(ConfigError::Kernel("at least one w-plane is required".into()));
        }
        if !(k.wmax > 0.0) {
            return Err(ConfigError::Kernel("wmax must be positive".into()));
        }

        if let Some(c) = self.rime.circumcision {
            if c == 0 || c % 2 == 0 {
                return Err(ConfigError::Image(format!(
                    "circumcision {c} must be a positive odd size"
                )));
            }
        }
        if let Some(f) = self.rime.sparsification {
            if !(f >= 1.0) {
                return Err(ConfigError::Image(format!(
                    "sparsification factor {f} must be at least 1"
                )));
            }
        }

        if let DirectionWeighting::Blend {
            scale_deg,
            gamma,
            rel_threshold,
            max_dirs,
        } = self.dde.weighting
        {
            if !(scale_deg > 0.0) || !gamma.is_finite() {
                return Err(ConfigError::Solutions(
                    "blend weighting needs a positive scale and finite gamma".into(),
                ));
            }
            if !(0.0..1.0).contains(&rel_threshold) {
                return Err(ConfigError::Solutions(format!(
                    "blend threshold {rel_threshold} outside [0, 1)"
                )));
            }
            if max_dirs == 0 {
                return Err(ConfigError::Solutions("blend needs max_dirs >= 1".into()));
            }
        }
        if self.dde.jones_norm.len() != self.dde.sol_files.len() {
            return Err(ConfigError::Solutions(format!(
                "{} jones-norm modes for {} solution files",
                self.dde.jones_norm.len(),
                self.dde.sol_files.len()
            )));
        }
        if let BeamModel::Gaussian {
            fwhm_deg,
            ref_freq_hz,
        } = self.beam.model
        {
            if !(fwhm_deg > 0.0) || !(ref_freq_hz > 0.0) {
                return Err(ConfigError::Solutions(
                    "Gaussian beam needs positive FWHM and reference frequency".into(),
                ));
            }
            if !(self.beam.dt_beam_min > 0.0) || self.beam.n_band == 0 {
                return Err(ConfigError::Solutions(
                    "beam sampling needs dt_beam_min > 0 and at least one band".into(),
                ));
            }
        }

        let p = &self.parallel;
        if p.n_row_locks == 0 {
            return Err(ConfigError::Parallel("row-lock pool must hold at least one lock".into()));
        }
        if p.workers == 0 {
            return Err(ConfigError::Parallel("workers must be at least 1".into()));
        }
        let available_cores = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if available_cores > 0 && p.workers > available_cores as usize {
            return Err(ConfigError::Parallel(format!(
                "workers ({}) exceeds the number of available cores ({})",
                p.workers, available_cores
            )));
        }
        Ok(())
    }

    pub fn kernel_cache_key(&self) -> KernelCacheKey<'_> {
        KernelCacheKey {
            npix: self.image.npix,
            cell_arcsec: self.image.cell_arcsec,
            nfacets: self.image.nfacets,
            padding: self.image.padding,
            ra0: self.image.ra0,
            dec0: self.image.dec0,
            kernel: &self.kernel,
        }
    }

    pub fn load_json(path: &Path) -> Result<Self, ConfigError> {
        let file_err = |reason: String| ConfigError::File {
            path: path.to_path_buf(),
            reason,
        };
        let text = fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| file_err(e.to_string()))
    }

    pub fn save_json(&self, path: &Path) -> Result<(), ConfigError> {
        let file_err = |reason: String| ConfigError::File {
            path: path.to_path_buf(),
            reason,
        };
        let text = serde_json::to_string_pretty(self).map_err(|e| file_err(e.to_string()))?;
        fs::write(path, text).map_err(|e| file_err(e.to_string()))
    }
}
