//! Synthetic interferometer observation used as the pipeline's input.
//!
//! Antennas sit on a seeded spiral, baselines rotate with the earth over an
//! hour-angle span centred on transit, and every sample is the exact sum of
//! the point sources, optionally corrupted by per-antenna direction gains.

use std::f64::consts::PI;

use log::{debug, info};
use ndarray::{Array1, Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::args::{parse_sources, Args, SourceSpec};
use crate::config::ImagingConfig;
use crate::geom::{
    baseline_uvw, baseline_uvw_rate, enu_to_xyz, hour_angle, lm_to_radec, n_of,
    parse_epoch_to_mjd, C, EARTH_ROTATION_RAD_S,
};
use crate::gridder::matrix_to_corr;
use crate::jones::{Jones, C32};
use crate::solutions::{CatalogEntry, Direction, SolutionFile};
use crate::utils::DynError;
use crate::vis::{band_mapping, VisChunk};

pub const SITE_LAT_DEG: f64 = 52.91;
pub const SITE_LON_DEG: f64 = 6.87;
/// Integrations per simulated solution interval.
const SOLUTION_INTEGRATIONS: usize = 10;
const N_CORR: usize = 4;

#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub n_antennas: usize,
    pub array_radius_m: f64,
    pub ha_span_h: f64,
    pub dt_sec: f64,
    pub freqs: Vec<f64>,
    pub chan_width_hz: f64,
    pub chunk_times: usize,
    pub sources: Vec<SourceSpec>,
    pub gain_scatter: f64,
    pub seed: u64,
    pub mjd: f64,
    pub n_bands: usize,
    pub ra0: f64,
    pub dec0: f64,
}

impl SimulationConfig {
    pub fn from_args(args: &Args, cfg: &ImagingConfig) -> Result<Self, DynError> {
        if args.n_antennas < 2 {
            return Err(format!("--antennas must be at least 2 (got {})", args.n_antennas).into());
        }
        if args.n_channels == 0 || args.chunk_times == 0 {
            return Err("--channels and --chunk-times must be positive".into());
        }
        if args.dt_sec <= 0.0 || args.ha_span_h <= 0.0 || args.array_radius_m <= 0.0 {
            return Err("--dt, --ha-span and --array-radius must be positive".into());
        }
        let chan_width_hz = args.chan_width_mhz * 1e6;
        let freqs = (0..args.n_channels)
            .map(|k| args.freq_mhz * 1e6 + k as f64 * chan_width_hz)
            .collect();
        Ok(SimulationConfig {
            n_antennas: args.n_antennas,
            array_radius_m: args.array_radius_m,
            ha_span_h: args.ha_span_h,
            dt_sec: args.dt_sec,
            freqs,
            chan_width_hz,
            chunk_times: args.chunk_times,
            sources: parse_sources(&args.sources)?,
            gain_scatter: args.gain_scatter,
            seed: args.seed,
            mjd: parse_epoch_to_mjd(&args.epoch)?,
            n_bands: cfg.image.n_freq_bands,
            ra0: cfg.image.ra0,
            dec0: cfg.image.dec0,
        })
    }
}

/// Simulated data set: visibility chunks plus, with gain scatter, the
/// solutions that undo the corruption.
#[derive(Clone, Debug)]
pub struct Observation {
    pub antennas: Vec<[f64; 3]>,
    pub sources: Vec<Direction>,
    pub chunks: Vec<VisChunk>,
    pub solutions: Option<SolutionFile>,
    pub max_w_lambda: f64,
}

/// ENU positions (metres) on a golden-angle spiral, radially jittered.
pub fn spiral_layout(n: usize, radius_m: f64, seed: u64) -> Vec<[f64; 3]> {
    let mut rng = StdRng::seed_from_u64(seed);
    let golden = PI * (3.0 - 5f64.sqrt());
    (0..n)
        .map(|k| {
            let frac = (k as f64 + 0.5) / n as f64;
            let r = (radius_m * frac.sqrt() * (1.0 + 0.05 * rng.gen_range(-1.0f64..1.0))).min(radius_m);
            let theta = k as f64 * golden + 0.1 * rng.gen_range(-1.0f64..1.0);
            [r * theta.cos(), r * theta.sin(), 0.0]
        })
        .collect()
}

/// MJD at which the phase centre sits at hour angle `-span/2`.
fn start_mjd(mjd: f64, lon: f64, ra0: f64, ha_span_h: f64) -> f64 {
    let target = -0.5 * ha_span_h * PI / 12.0;
    let delta = (target - hour_angle(mjd, lon, ra0) + PI).rem_euclid(2.0 * PI) - PI;
    mjd + delta / EARTH_ROTATION_RAD_S / 86400.0
}

fn random_gain(rng: &mut StdRng, scatter: f64) -> C32 {
    let amp = 1.0 + 0.5 * scatter * rng.gen_range(-1.0f64..1.0);
    let phase = scatter * rng.gen_range(-PI..PI);
    C32::from_polar(amp as f32, phase as f32)
}

fn source_directions(cfg: &SimulationConfig) -> Vec<Direction> {
    cfg.sources
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let (ra, dec) = lm_to_radec(s.l_deg.to_radians(), s.m_deg.to_radians(), cfg.ra0, cfg.dec0);
            Direction::new(ra, dec, s.flux, i, cfg.ra0, cfg.dec0)
        })
        .collect()
}

pub fn simulate(cfg: &SimulationConfig) -> Observation {
    let lat = SITE_LAT_DEG.to_radians();
    let lon = SITE_LON_DEG.to_radians();
    let antennas = spiral_layout(cfg.n_antennas, cfg.array_radius_m, cfg.seed);
    let xyz: Vec<[f64; 3]> = antennas.iter().map(|&p| enu_to_xyz(p, lat)).collect();
    let baselines: Vec<(usize, usize)> = (0..cfg.n_antennas)
        .flat_map(|a| (a + 1..cfg.n_antennas).map(move |b| (a, b)))
        .collect();
    let sources = source_directions(cfg);

    let n_times = ((cfg.ha_span_h * 3600.0 / cfg.dt_sec).round() as usize).max(1);
    let mjd0 = start_mjd(cfg.mjd, lon, cfg.ra0, cfg.ha_span_h);
    let t_start = mjd0 * 86400.0;
    let mjds: Vec<f64> = (0..n_times)
        .map(|k| mjd0 + (k as f64 + 0.5) * cfg.dt_sec / 86400.0)
        .collect();

    let mut rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(1));
    let solutions = (cfg.gain_scatter > 0.0).then(|| {
        let n_sol = n_times.div_ceil(SOLUTION_INTEGRATIONS);
        let sol_dt = SOLUTION_INTEGRATIONS as f64 * cfg.dt_sec;
        let gains: Vec<Vec<Vec<Vec<Jones>>>> = (0..n_sol)
            .map(|_| {
                (0..sources.len())
                    .map(|_| {
                        (0..cfg.n_antennas)
                            .map(|_| {
                                let gx = random_gain(&mut rng, cfg.gain_scatter);
                                let gy = random_gain(&mut rng, cfg.gain_scatter);
                                vec![Jones::diag(gx, gy)]
                            })
                            .collect::<Vec<_>>()
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        SolutionFile {
            directions: sources
                .iter()
                .map(|d| CatalogEntry {
                    ra: d.ra,
                    dec: d.dec,
                    flux: d.flux,
                    cluster: d.cluster,
                })
                .collect(),
            freq_domains: Vec::new(),
            beam_times: Vec::new(),
            t0: (0..n_sol).map(|k| t_start + k as f64 * sol_dt).collect(),
            t1: (0..n_sol).map(|k| t_start + (k + 1) as f64 * sol_dt).collect(),
            gains,
        }
    });

    let nchan = cfg.freqs.len();
    let chan_mapping = band_mapping(&cfg.freqs, cfg.n_bands);
    let mut max_w_lambda = 0.0f64;
    let mut chunks = Vec::new();
    for (ci, t_range) in (0..n_times)
        .collect::<Vec<_>>()
        .chunks(cfg.chunk_times)
        .enumerate()
    {
        let nrow = t_range.len() * baselines.len();
        let mut uvw = Array2::<f64>::zeros((nrow, 3));
        let mut uvw_rate = Array2::<f64>::zeros((nrow, 3));
        let mut data = Array3::<C32>::zeros((nrow, nchan, N_CORR));
        let mut times = Array1::<f64>::zeros(nrow);
        let mut a0 = Array1::<i32>::zeros(nrow);
        let mut a1 = Array1::<i32>::zeros(nrow);

        let mut row = 0;
        for &it in t_range {
            let ha = hour_angle(mjds[it], lon, cfg.ra0);
            let sol = it / SOLUTION_INTEGRATIONS;
            for &(a, b) in &baselines {
                let bl = [xyz[b][0] - xyz[a][0], xyz[b][1] - xyz[a][1], xyz[b][2] - xyz[a][2]];
                let [u, v, w] = baseline_uvw(bl, ha, cfg.dec0);
                let rate = baseline_uvw_rate(bl, ha, cfg.dec0);
                for k in 0..3 {
                    uvw[[row, k]] = [u, v, w][k];
                    uvw_rate[[row, k]] = rate[k];
                }
                times[row] = mjds[it] * 86400.0;
                a0[row] = a as i32;
                a1[row] = b as i32;
                for (ch, &freq) in cfg.freqs.iter().enumerate() {
                    let scale = freq / C;
                    max_w_lambda = max_w_lambda.max(w.abs() * scale);
                    let mut acc = Jones::zero();
                    for (d, src) in sources.iter().enumerate() {
                        let phase =
                            -2.0 * PI * (u * src.l + v * src.m + w * (n_of(src.l, src.m) - 1.0)) * scale;
                        let k = C32::new(
                            (src.flux * phase.cos()) as f32,
                            (src.flux * phase.sin()) as f32,
                        );
                        let brightness = Jones::scalar(k);
                        acc += match &solutions {
                            Some(s) => s.gains[sol][d][a][0] * brightness * s.gains[sol][d][b][0].h(),
                            None => brightness,
                        };
                    }
                    let corr = matrix_to_corr(&acc, N_CORR);
                    for (p, c) in corr.iter().enumerate() {
                        data[[row, ch, p]] = *c;
                    }
                }
                row += 1;
            }
        }
        debug!("simulated chunk c{ci}: {nrow} rows x {nchan} channels");
        chunks.push(VisChunk {
            label: format!("c{ci}"),
            uvw,
            uvw_rate,
            data,
            flags: Array3::zeros((nrow, nchan, N_CORR)),
            weights: Array2::ones((nrow, nchan)),
            times,
            a0,
            a1,
            freqs: Array1::from_vec(cfg.freqs.clone()),
            chan_mapping: chan_mapping.clone(),
            dt: cfg.dt_sec,
            dnu: cfg.chan_width_hz,
        });
    }
    info!(
        "simulated {} antennas, {} baselines, {} integrations in {} chunks, max |w| = {:.1} wavelengths",
        cfg.n_antennas,
        baselines.len(),
        n_times,
        chunks.len(),
        max_w_lambda
    );

    Observation {
        antennas,
        sources,
        chunks,
        solutions,
        max_w_lambda,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use clap::Parser;

    fn config(extra: &[&str]) -> SimulationConfig {
        let mut argv = vec!["facet_imager", "--workers", "1", "--npix", "64", "--nfacets", "1"];
        argv.extend_from_slice(extra);
        let args = Args::try_parse_from(argv).unwrap();
        let cfg = ImagingConfig::from_args(&args, None, |_| true).unwrap();
        SimulationConfig::from_args(&args, &cfg).unwrap()
    }

    #[test]
    fn spiral_is_seeded_and_bounded() {
        let a = spiral_layout(12, 500.0, 3);
        let b = spiral_layout(12, 500.0, 3);
        assert_eq!(a, b);
        assert_ne!(a, spiral_layout(12, 500.0, 4));
        for p in &a {
            assert!((p[0] * p[0] + p[1] * p[1]).sqrt() <= 500.0 + 1e-9);
        }
    }

    #[test]
    fn observation_starts_at_the_requested_hour_angle() {
        let cfg = config(&["--ha-span", "2"]);
        let mjd0 = start_mjd(cfg.mjd, SITE_LON_DEG.to_radians(), cfg.ra0, cfg.ha_span_h);
        let ha = hour_angle(mjd0, SITE_LON_DEG.to_radians(), cfg.ra0);
        assert_abs_diff_eq!(ha, -PI / 12.0, epsilon = 1e-6);
    }

    #[test]
    fn centred_source_gives_constant_visibilities() {
        let cfg = config(&["--antennas", "4", "--chunk-times", "5", "--ha-span", "0.25", "--dt", "60"]);
        let obs = simulate(&cfg);
        assert_eq!(obs.chunks.len(), 3);
        assert!(obs.solutions.is_none());
        let c = &obs.chunks[0];
        assert_eq!(c.nrow(), 5 * 6);
        assert_eq!(c.ncorr(), 4);
        for row in 0..c.nrow() {
            assert_abs_diff_eq!(c.data[[row, 0, 0]].re, 1.0, epsilon = 1e-5);
            assert_abs_diff_eq!(c.data[[row, 0, 1]].norm(), 0.0, epsilon = 1e-6);
            assert_abs_diff_eq!(c.data[[row, 0, 3]].re, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn offset_source_phase_follows_the_measurement_equation() {
        let cfg = config(&["--antennas", "3", "--sources", "0.1:-0.05:2", "--ha-span", "0.1"]);
        let obs = simulate(&cfg);
        let c = &obs.chunks[0];
        let src = &obs.sources[0];
        for row in 0..c.nrow() {
            let scale = c.freqs[1] / C;
            let (u, v, w) = (c.uvw[[row, 0]], c.uvw[[row, 1]], c.uvw[[row, 2]]);
            let phase = -2.0 * PI * (u * src.l + v * src.m + w * (n_of(src.l, src.m) - 1.0)) * scale;
            let got = c.data[[row, 1, 3]];
            assert_abs_diff_eq!(got.re as f64, 2.0 * phase.cos(), epsilon = 1e-4);
            assert_abs_diff_eq!(got.im as f64, 2.0 * phase.sin(), epsilon = 1e-4);
        }
    }

    #[test]
    fn gains_come_with_matching_solutions() {
        let cfg = config(&["--antennas", "4", "--gain-scatter", "0.2", "--ha-span", "0.5"]);
        let obs = simulate(&cfg);
        let sols = obs.solutions.as_ref().unwrap();
        assert_eq!(sols.directions.len(), 1);
        assert_eq!(sols.gains[0][0].len(), 4);
        let c = &obs.chunks[0];
        let last_t = c.times[c.nrow() - 1];
        assert!(sols.t0[0] <= c.times[0]);
        assert!(*sols.t1.last().unwrap() >= last_t);
        // corrupted data of the centred source is g_a g_b^*
        let (a, b) = (c.a0[0] as usize, c.a1[0] as usize);
        let expect = sols.gains[0][0][a][0].0[0] * sols.gains[0][0][b][0].0[0].conj();
        assert_abs_diff_eq!(c.data[[0, 0, 0]].re, expect.re, epsilon = 1e-5);
        assert_abs_diff_eq!(c.data[[0, 0, 0]].im, expect.im, epsilon = 1e-5);
    }
}
