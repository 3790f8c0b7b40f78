use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use clap::parser::ValueSource;
use clap::{CommandFactory, FromArgMatches};
use log::{debug, info, warn};
use ndarray::{s, Array4, ArrayView2};
use serde::Serialize;

use facet_imager::args::Args;
use facet_imager::cache::CacheManager;
use facet_imager::config::ImagingConfig;
use facet_imager::dispatch::WorkerPool;
use facet_imager::facets::{FacetImages, FacetMachine};
use facet_imager::geom::{format_dec, format_ra, lm_to_radec};
use facet_imager::jones::ApplyMode;
use facet_imager::plot::{plot_facet_solutions, plot_image_map};
use facet_imager::simulate::{simulate, Observation, SimulationConfig};
use facet_imager::solutions::SolutionManager;
use facet_imager::store::Namespace;
use facet_imager::tessellation::Tessellation;
use facet_imager::utils::DynError;
use facet_imager::vis::{attach_solutions, residual_rms, ChunkHandle, ChunkView};

#[derive(Serialize)]
struct ResidualSummary {
    data_rms: f64,
    residual_rms: f64,
    n_predicted: usize,
}

#[derive(Serialize)]
struct RunSummary {
    mode: &'static str,
    npix: usize,
    n_facets: usize,
    n_chunks: usize,
    peak_pixel: [usize; 2],
    peak_value: f32,
    facet_weight_sums: Vec<f64>,
    sum_jones_norm: Vec<Vec<f64>>,
    residual: Option<ResidualSummary>,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}",
                record.level().as_str().to_ascii_lowercase(),
                record.args()
            )
        })
        .init();
}

/// Largest pixel of an image indexed `[y, x]`, as `(x, y, value)`.
fn find_peak(image: &ArrayView2<f32>) -> (usize, usize, f32) {
    let mut best = (0, 0, f32::NEG_INFINITY);
    for ((y, x), &v) in image.indexed_iter() {
        if v.is_finite() && v > best.2 {
            best = (x, y, v);
        }
    }
    best
}

/// Model cube with each simulated source on its nearest pixel, Stokes I,
/// every band.
fn point_source_model(tess: &Tessellation, obs: &Observation, n_bands: usize, npol: usize) -> Array4<f32> {
    let n = tess.npix;
    let mut model = Array4::<f32>::zeros((n_bands, npol, n, n));
    let half = (n / 2) as f64;
    for src in &obs.sources {
        let x = (src.l / tess.cell_rad + half).round();
        let y = (src.m / tess.cell_rad + half).round();
        if x < 0.0 || y < 0.0 || x >= n as f64 || y >= n as f64 {
            warn!(
                "source at {} {} lies outside the image, left out of the model",
                format_ra(src.ra),
                format_dec(src.dec)
            );
            continue;
        }
        let (x, y) = (x as usize, y as usize);
        for b in 0..n_bands {
            model[[b, 0, y, x]] += src.flux as f32;
        }
        debug!("model component {:.3} Jy at pixel ({x}, {y})", src.flux);
    }
    model
}

/// Subtracts the model prediction from every chunk and returns the data
/// and residual RMS over all chunks.
fn degrid_residuals(
    fm: &mut FacetMachine<&mut WorkerPool>,
    model: Array4<f32>,
    obs: &Observation,
    handles: &[ChunkHandle],
) -> Result<ResidualSummary, DynError> {
    fm.set_model_image(model)?;
    let (mut sum_before, mut sum_after, mut n_total) = (0.0f64, 0.0f64, 0usize);
    let mut n_predicted = 0usize;
    for (chunk, handle) in obs.chunks.iter().zip(handles) {
        fm.degrid_chunk_in_background(handle)?;
        let stats = fm.collect_degridding_results()?;
        n_predicted += stats.n_predicted;
        if stats.n_outside > 0 {
            warn!("chunk {}: {} samples fell outside the facet grids", handle.label, stats.n_outside);
        }

        let residual = ChunkView::open(handle)?.residual_snapshot()?;
        let before = residual_rms(&chunk.data.view(), &chunk.flags.view());
        let after = residual_rms(&residual.view(), &chunk.flags.view());
        debug!("chunk {}: rms {:.4e} -> {:.4e}", handle.label, before, after);
        let n = chunk.data.len();
        sum_before += before * before * n as f64;
        sum_after += after * after * n as f64;
        n_total += n;
    }
    fm.release_model_image()?;
    let norm = n_total.max(1) as f64;
    Ok(ResidualSummary {
        data_rms: (sum_before / norm).sqrt(),
        residual_rms: (sum_after / norm).sqrt(),
        n_predicted,
    })
}

fn write_summary(path: &Path, summary: &RunSummary) -> Result<(), DynError> {
    let text = serde_json::to_string_pretty(summary)?;
    std::fs::write(path, text)?;
    info!("summary written to {}", path.display());
    Ok(())
}

fn main() -> Result<(), DynError> {
    if std::env::args_os().len() == 1 {
        Args::command().print_help()?;
        println!();
        return Ok(());
    }

    let arg_matches = Args::command().get_matches();
    let args = Args::from_arg_matches(&arg_matches)?;
    init_logging(args.verbose);

    let base = match &args.config {
        Some(path) => {
            info!("loading configuration from {}", path.display());
            Some(ImagingConfig::load_json(path)?)
        }
        None => None,
    };
    let explicit = |id: &str| arg_matches.value_source(id) == Some(ValueSource::CommandLine);
    let mut cfg = ImagingConfig::from_args(&args, base, explicit)?;
    if let Some(path) = &args.save_config {
        cfg.save_json(path)?;
        info!("configuration written to {}", path.display());
    }

    std::fs::create_dir_all(&args.out_dir)?;
    info!(
        "phase centre {} {}",
        format_ra(cfg.image.ra0),
        format_dec(cfg.image.dec0)
    );

    let sim = SimulationConfig::from_args(&args, &cfg)?;
    let obs = simulate(&sim);
    info!(
        "simulated {} antennas, {} sources, {} chunks (max |w| {:.1} lambda)",
        obs.antennas.len(),
        obs.sources.len(),
        obs.chunks.len(),
        obs.max_w_lambda
    );
    if obs.max_w_lambda > cfg.kernel.wmax {
        warn!(
            "max |w| {:.1} exceeds --wmax {:.1}; outer samples use the last w-plane",
            obs.max_w_lambda, cfg.kernel.wmax
        );
    }
    if let Some(sols) = &obs.solutions {
        if cfg.dde.sol_files.is_empty() {
            let path = args.out_dir.join("simulated_sols.json");
            sols.save(&path)?;
            info!("simulated gains written to {}, applying them", path.display());
            cfg.dde.sol_files.push(path);
            cfg.dde.jones_norm.push(ApplyMode::AP);
        }
    }

    let tess = Arc::new(Tessellation::new(&cfg.image));
    if args.reg {
        let path = args.out_dir.join("facets.reg");
        tess.write_region_file(&path)?;
        info!("region file written to {}", path.display());
    }

    let cache = Arc::new(CacheManager::new(&cfg.cache.dir, cfg.cache.reset)?);
    let mut sol_mgr = SolutionManager::new(&cfg, &tess, cache.clone());
    if !sol_mgr.has_solutions() {
        info!("no calibration or beam solutions, imaging without direction-dependent corrections");
    }
    let mut pool = WorkerPool::new(cfg.parallel.workers);
    let mut fm = FacetMachine::new(cfg.clone(), tess.clone(), &mut pool, &cfg.store_root, args.psf)?;
    fm.init_kernels_in_background(cache)?;

    let mut vis_ns = Namespace::create(cfg.store_root.join("vis"))?;
    let mut handles = Vec::with_capacity(obs.chunks.len());
    for chunk in &obs.chunks {
        let handle = chunk.publish(&mut vis_ns)?;
        let times = chunk.times.to_vec();
        let freqs = chunk.freqs.to_vec();
        if let Some(set) = sol_mgr.load(&times, &freqs, chunk.n_antennas())? {
            let time_map = set.mapping_for(&times);
            attach_solutions(&handle, set, &time_map)?;
        }
        handles.push(handle);
    }

    for handle in &handles {
        fm.put_chunk_in_background(handle)?;
    }
    fm.collect_gridding_results()?;
    let images = fm.facets_to_image(true)?;

    let (mode, mean_image, norm_image, sum_jones_norm) = match images {
        FacetImages::Dirty(out) => ("dirty", out.mean_image, out.norm_image, out.sum_jones_norm),
        FacetImages::Psf(psf) => {
            info!(
                "PSF cube: {} facets of {} px around facet {}",
                psf.cube_variable_psf.dim().0,
                psf.npix_min,
                psf.central_facet
            );
            ("psf", psf.mean_image, psf.norm_image, psf.mean_jones_band)
        }
    };
    let stokes_i = mean_image.slice(s![0, 0, .., ..]);
    let (px, py, peak) = find_peak(&stokes_i);
    let (ra, dec) = {
        let l = (px as f64 - (tess.npix / 2) as f64) * tess.cell_rad;
        let m = (py as f64 - (tess.npix / 2) as f64) * tess.cell_rad;
        lm_to_radec(l, m, cfg.image.ra0, cfg.image.dec0)
    };
    info!(
        "{mode} image peak {:.4} at pixel ({px}, {py}) = {} {}",
        peak,
        format_ra(ra),
        format_dec(dec)
    );
    let facet_weight_sums: Vec<f64> = fm
        .facet_states()
        .iter()
        .map(|acc| acc.stats.sum_weights.sum())
        .collect();

    if args.plot {
        let cell_arcsec = cfg.image.cell_arcsec;
        plot_image_map(
            &args.out_dir.join(format!("{mode}_image.png")),
            &stokes_i,
            cell_arcsec,
            &format!("{mode} image (Stokes I)"),
        )?;
        plot_image_map(
            &args.out_dir.join("norm_image.png"),
            &norm_image.view(),
            cell_arcsec,
            "facet normalisation",
        )?;
        if let Some(set) = sol_mgr.effective() {
            plot_facet_solutions(
                &args.out_dir.join("facet_solutions.png"),
                &tess,
                &set.directions,
                cfg.dde.weighting.with_max_dirs(4),
            )?;
        }
        info!("plots written to {}", args.out_dir.display());
    }

    let residual = if args.degrid && fm.is_psf() {
        warn!("--degrid is ignored when imaging the PSF");
        None
    } else if args.degrid {
        let model = point_source_model(
            &tess,
            &obs,
            cfg.image.n_freq_bands,
            cfg.image.pol_mode.npol(),
        );
        let res = degrid_residuals(&mut fm, model, &obs, &handles)?;
        info!(
            "residual rms {:.4e} (data rms {:.4e}, {} samples predicted)",
            res.residual_rms, res.data_rms, res.n_predicted
        );
        Some(res)
    } else {
        None
    };

    let summary = RunSummary {
        mode,
        npix: tess.npix,
        n_facets: tess.len(),
        n_chunks: handles.len(),
        peak_pixel: [px, py],
        peak_value: peak,
        facet_weight_sums,
        sum_jones_norm,
        residual,
    };
    write_summary(&args.out_dir.join("summary.json"), &summary)?;

    fm.teardown()?;
    vis_ns.delete()?;
    pool.shutdown();
    Ok(())
}
