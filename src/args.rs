use std::path::PathBuf;

use clap::Parser;

use crate::config::{DecorrLocation, DecorrMode, GlobalNorm, PolMode};
use crate::jones::JonesMode;

pub const DEFAULT_NPIX: usize = 1024;
pub const DEFAULT_CELL_ARCSEC: f64 = 4.0;
pub const DEFAULT_ROW_LOCKS: usize = 3373;

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Facet-based synthesis imager with direction-dependent corrections",
    long_about = None,
    after_help = "Examples:\n  facet_imager --npix 1024 --nfacets 2 --padding 1.2 --plot\n  facet_imager --npix 2048 --cell 2.0 --nfacets 3 --wplanes 17 --wmax 4000 --decorr ft\n  facet_imager --sols cal.json --jones-mode diag --weighting blend --blend-scale 1.0 --degrid\n  facet_imager --config run.json --workers 8 --psf\n"
)]
pub struct Args {
    /// Output image size in pixels (per axis)
    #[arg(long, default_value_t = DEFAULT_NPIX)]
    pub npix: usize,

    /// Pixel size in arcseconds
    #[arg(long = "cell", default_value_t = DEFAULT_CELL_ARCSEC)]
    pub cell_arcsec: f64,

    /// Number of facets along each image axis
    #[arg(long, default_value_t = 2)]
    pub nfacets: usize,

    /// Facet padding ratio applied before gridding
    #[arg(long, default_value_t = 1.2)]
    pub padding: f64,

    /// Polarisation products to image
    #[arg(long = "pol", value_enum, default_value_t = PolMode::I)]
    pub pol_mode: PolMode,

    /// Number of output frequency bands
    #[arg(long = "bands", default_value_t = 1)]
    pub n_freq_bands: usize,

    /// Phase centre RA (hhmmss/hms or degrees)
    #[arg(long, default_value = "12h00m00s")]
    pub ra: String,

    /// Phase centre Dec (ddmmss/dms or degrees)
    #[arg(long, allow_hyphen_values = true, default_value = "+45d00m00s")]
    pub dec: String,

    /// Convolution kernel support in grid cells (odd)
    #[arg(long, default_value_t = 7)]
    pub support: usize,

    /// Kernel oversampling factor
    #[arg(long, default_value_t = 11)]
    pub oversampling: usize,

    /// Number of w-planes
    #[arg(long = "wplanes", default_value_t = 1)]
    pub n_wplanes: usize,

    /// Largest |w| covered by the w-planes, in wavelengths
    #[arg(long, default_value_t = 1000.0)]
    pub wmax: f64,

    /// Smearing compensation applied per sample
    #[arg(long = "decorr", value_enum, default_value_t = DecorrMode::None)]
    pub decorr_mode: DecorrMode,

    /// Where in the facet the smearing factor is evaluated
    #[arg(long = "decorr-location", value_enum, default_value_t = DecorrLocation::Center)]
    pub decorr_location: DecorrLocation,

    /// Force the PSF cube footprint in pixels (odd)
    #[arg(long)]
    pub circumcision: Option<usize>,

    /// Grid one row in every N on average
    #[arg(long)]
    pub sparsification: Option<f64>,

    /// Calibration solution files (JSON), merged in order
    #[arg(long = "sols", value_delimiter = ',')]
    pub sol_files: Vec<PathBuf>,

    /// Per-file amplitude/phase normalisation (AP, A or P)
    #[arg(long = "jones-norm", value_delimiter = ',')]
    pub jones_norm: Vec<String>,

    /// Global amplitude normalisation of calibration solutions
    #[arg(long = "global-norm", value_enum, default_value_t = GlobalNorm::None)]
    pub global_norm: GlobalNorm,

    /// Jones matrix structure honoured when applying solutions
    #[arg(long = "jones-mode", value_enum, default_value_t = JonesMode::Full)]
    pub jones_mode: JonesMode,

    /// Amplitude/phase parts of the solutions applied when gridding
    #[arg(long = "dd-grid", default_value = "AP")]
    pub dd_mode_grid: String,

    /// Amplitude/phase parts of the solutions applied when degridding
    #[arg(long = "dd-degrid", default_value = "AP")]
    pub dd_mode_degrid: String,

    /// Direction weighting policy (nearest or blend)
    #[arg(
        long,
        default_value = "nearest",
        value_parser = clap::builder::PossibleValuesParser::new(["nearest", "blend"])
    )]
    pub weighting: String,

    /// Blend distance scale in degrees
    #[arg(long = "blend-scale", default_value_t = 1.0)]
    pub blend_scale_deg: f64,

    /// Blend distance exponent
    #[arg(long = "blend-gamma", default_value_t = 4.0)]
    pub blend_gamma: f64,

    /// Blend weights below this fraction of the largest are dropped
    #[arg(long = "blend-threshold", default_value_t = 0.2)]
    pub blend_threshold: f64,

    /// Maximum number of blended directions
    #[arg(long = "blend-max-dirs", default_value_t = 3)]
    pub blend_max_dirs: usize,

    /// Gaussian primary beam FWHM in degrees at --beam-ref-freq (0 disables the beam)
    #[arg(long = "beam-fwhm", default_value_t = 0.0)]
    pub beam_fwhm_deg: f64,

    /// Reference frequency of the beam FWHM in MHz
    #[arg(long = "beam-ref-freq", default_value_t = 150.0)]
    pub beam_ref_freq_mhz: f64,

    /// Beam sampling interval in minutes
    #[arg(long = "dt-beam", default_value_t = 5.0)]
    pub dt_beam_min: f64,

    /// Number of beam frequency sub-bands
    #[arg(long = "beam-bands", default_value_t = 1)]
    pub beam_n_band: usize,

    /// Normalise the beam by its value at the phase centre
    #[arg(long = "beam-center-norm")]
    pub beam_center_norm: bool,

    /// Number of worker threads
    #[arg(long, default_value_t = 2)]
    pub workers: usize,

    /// Size of the residual row-lock pool
    #[arg(long = "row-locks", default_value_t = DEFAULT_ROW_LOCKS)]
    pub n_row_locks: usize,

    /// Shared store root (defaults to /dev/shm/facet_imager or the temp dir)
    #[arg(long = "store")]
    pub store_root: Option<PathBuf>,

    /// Cache directory
    #[arg(long = "cache", default_value = "facet_cache")]
    pub cache_dir: PathBuf,

    /// Ignore and rebuild every cached product
    #[arg(long = "cache-reset")]
    pub cache_reset: bool,

    /// Load the imaging configuration from JSON
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write the resolved imaging configuration to JSON
    #[arg(long = "save-config")]
    pub save_config: Option<PathBuf>,

    /// Number of simulated antennas
    #[arg(long = "antennas", default_value_t = 16)]
    pub n_antennas: usize,

    /// Outer radius of the simulated antenna spiral in metres
    #[arg(long = "array-radius", default_value_t = 1500.0)]
    pub array_radius_m: f64,

    /// Simulated hour-angle span in hours, centred on transit
    #[arg(long = "ha-span", default_value_t = 2.0)]
    pub ha_span_h: f64,

    /// Integration time in seconds
    #[arg(long = "dt", default_value_t = 60.0)]
    pub dt_sec: f64,

    /// Number of simulated channels
    #[arg(long = "channels", default_value_t = 4)]
    pub n_channels: usize,

    /// Lowest channel frequency in MHz
    #[arg(long = "freq", default_value_t = 150.0)]
    pub freq_mhz: f64,

    /// Channel width in MHz
    #[arg(long = "chan-width", default_value_t = 0.2)]
    pub chan_width_mhz: f64,

    /// Number of time samples per visibility chunk
    #[arg(long = "chunk-times", default_value_t = 60)]
    pub chunk_times: usize,

    /// Simulated point sources as l_deg:m_deg:flux, comma separated
    #[arg(long, allow_hyphen_values = true, default_value = "0:0:1")]
    pub sources: String,

    /// Per-antenna gain scatter (fractional amplitude and radians of phase)
    #[arg(long = "gain-scatter", default_value_t = 0.0)]
    pub gain_scatter: f64,

    /// Seed for the simulated layout and gains
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Observation epoch (year, MJD or ISO datetime)
    #[arg(long, default_value = "2025-03-20T12:00:00Z")]
    pub epoch: String,

    /// Output directory
    #[arg(long = "out", default_value = "facet_out")]
    pub out_dir: PathBuf,

    /// Write PNG previews
    #[arg(long)]
    pub plot: bool,

    /// Write a DS9 region file of the facet boundaries
    #[arg(long)]
    pub reg: bool,

    /// Image the PSF instead of the data
    #[arg(long)]
    pub psf: bool,

    /// Predict the dirty image back into the visibilities and report residuals
    #[arg(long)]
    pub degrid: bool,

    /// Debug-level logging
    #[arg(long, short)]
    pub verbose: bool,
}

/// One simulated point source in direction cosines offset from the phase centre.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceSpec {
    pub l_deg: f64,
    pub m_deg: f64,
    pub flux: f64,
}

pub fn parse_sources(list: &str) -> Result<Vec<SourceSpec>, String> {
    let mut out = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let fields = item
            .split(':')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("source '{item}': {e}"))?;
        if fields.len() != 3 {
            return Err(format!("source '{item}' must be l_deg:m_deg:flux"));
        }
        out.push(SourceSpec {
            l_deg: fields[0],
            m_deg: fields[1],
            flux: fields[2],
        });
    }
    if out.is_empty() {
        return Err("at least one source is required".into());
    }
    Ok(out)
}
