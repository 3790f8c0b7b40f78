use std::path::Path;

use ndarray::{Array2, ArrayView2};
use plotters::prelude::*;

use crate::config::DirectionWeighting;
use crate::solutions::Direction;
use crate::tessellation::Tessellation;
use crate::utils::DynError;

const PLOT_FONT_SCALE: f64 = 1.2;
/// Heat maps are block-averaged down to at most this many cells per axis.
const MAX_PLOT_CELLS: usize = 256;

const DIRECTION_COLORS: [RGBColor; 8] = [
    RGBColor(31, 119, 180),
    RGBColor(255, 127, 14),
    RGBColor(44, 160, 44),
    RGBColor(214, 39, 40),
    RGBColor(148, 103, 189),
    RGBColor(140, 86, 75),
    RGBColor(227, 119, 194),
    RGBColor(127, 127, 127),
];

fn scaled_font_size(base: i32) -> i32 {
    ((base as f64) * PLOT_FONT_SCALE).round() as i32
}

fn scaled_area_size(base: i32) -> i32 {
    ((base as f64) * PLOT_FONT_SCALE).round() as i32
}

pub fn jet_colormap(t: f64) -> RGBColor {
    let t = t.clamp(0.0, 1.0);
    let four_t = 4.0 * t;
    let r = (four_t - 1.5).clamp(0.0, 1.0);
    let g = (1.5 - (four_t - 2.0).abs()).clamp(0.0, 1.0);
    let b = (1.5 - (four_t - 3.5)).clamp(0.0, 1.0);
    RGBColor((r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8)
}

/// Block mean of `image` with square blocks of `factor` pixels. Partial
/// blocks at the far edges are averaged over the pixels they hold.
pub fn downsample(image: &ArrayView2<f32>, factor: usize) -> Array2<f64> {
    let factor = factor.max(1);
    let (ny, nx) = image.dim();
    let (my, mx) = (ny.div_ceil(factor), nx.div_ceil(factor));
    Array2::from_shape_fn((my, mx), |(by, bx)| {
        let ys = by * factor..((by + 1) * factor).min(ny);
        let xs = bx * factor..((bx + 1) * factor).min(nx);
        let mut sum = 0.0f64;
        let mut n = 0usize;
        for y in ys {
            for x in xs.clone() {
                let v = image[[y, x]];
                if v.is_finite() {
                    sum += v as f64;
                    n += 1;
                }
            }
        }
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    })
}

/// Heat map of an image indexed `[y, x]`, l and m axes in arcminutes,
/// with a colour bar.
pub fn plot_image_map(
    path: &Path,
    image: &ArrayView2<f32>,
    cell_arcsec: f64,
    title: &str,
) -> Result<(), DynError> {
    let (ny, nx) = image.dim();
    if ny == 0 || nx == 0 {
        return Err("No pixels to plot".into());
    }
    let factor = ny.max(nx).div_ceil(MAX_PLOT_CELLS);
    let binned = downsample(image, factor);
    let (my, mx) = binned.dim();
    let cell = cell_arcsec * factor as f64 / 60.0;

    let (mut min_val, mut max_val) = (f64::INFINITY, f64::NEG_INFINITY);
    for &v in binned.iter() {
        min_val = min_val.min(v);
        max_val = max_val.max(v);
    }
    let span = (max_val - min_val).max(1.0e-12);
    let max_val = min_val + span;

    let file_path = path
        .to_str()
        .ok_or_else(|| "Failed to convert path to string".to_string())?;
    let root = BitMapBackend::new(file_path, (1100, 900)).into_drawing_area();
    root.fill(&WHITE)?;
    let (plot_area, colorbar_area) = root.split_horizontally(920);

    let half_x = cell * mx as f64 / 2.0;
    let half_y = cell * my as f64 / 2.0;
    let mut chart = ChartBuilder::on(&plot_area)
        .caption(title, ("sans-serif", scaled_font_size(24)).into_font())
        .margin(10)
        .x_label_area_size(scaled_area_size(50))
        .y_label_area_size(scaled_area_size(60))
        .build_cartesian_2d(-half_x..half_x, -half_y..half_y)?;

    chart
        .configure_mesh()
        .x_desc("l [arcmin]")
        .y_desc("m [arcmin]")
        .label_style(("sans-serif", scaled_font_size(16)).into_font())
        .axis_desc_style(("sans-serif", scaled_font_size(20)).into_font())
        .light_line_style(WHITE.mix(0.0))
        .draw()?;

    chart.draw_series(binned.indexed_iter().map(|((by, bx), &v)| {
        let x0 = bx as f64 * cell - half_x;
        let y0 = by as f64 * cell - half_y;
        let color = jet_colormap((v - min_val) / span);
        Rectangle::new([(x0, y0), (x0 + cell, y0 + cell)], color.filled())
    }))?;

    let cb_area = colorbar_area.margin(40, 60, 10, 10);
    let mut cb_chart = ChartBuilder::on(&cb_area)
        .set_label_area_size(LabelAreaPosition::Left, scaled_area_size(60))
        .build_cartesian_2d(0.0..1.0, min_val..max_val)?;
    cb_chart
        .configure_mesh()
        .disable_x_axis()
        .label_style(("sans-serif", scaled_font_size(14)).into_font())
        .y_label_formatter(&|v| format!("{:.3}", v))
        .draw()?;
    let steps = 200;
    let delta = span / steps as f64;
    cb_chart.draw_series((0..steps).map(|k| {
        let v0 = min_val + delta * k as f64;
        let color = jet_colormap((k as f64 + 0.5) / steps as f64);
        Rectangle::new([(0.0, v0), (1.0, v0 + delta)], color.filled())
    }))?;

    root.present()?;
    Ok(())
}

/// Facet centres coloured by their dominant calibration direction. Blend
/// partners are joined to the facet centre by thin lines.
pub fn plot_facet_solutions(
    path: &Path,
    tess: &Tessellation,
    dirs: &[Direction],
    weighting: DirectionWeighting,
) -> Result<(), DynError> {
    if dirs.is_empty() {
        return Err("No calibration directions to plot".into());
    }
    let to_deg = |v: f64| v.to_degrees();
    let half = to_deg(tess.npix as f64 * tess.cell_rad / 2.0);
    let extent = dirs
        .iter()
        .map(|d| to_deg(d.l.abs()).max(to_deg(d.m.abs())))
        .fold(half, f64::max)
        * 1.05;

    let file_path = path
        .to_str()
        .ok_or_else(|| "Failed to convert path to string".to_string())?;
    let root = BitMapBackend::new(file_path, (900, 900)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Facet solution directions", ("sans-serif", scaled_font_size(24)).into_font())
        .margin(10)
        .x_label_area_size(scaled_area_size(40))
        .y_label_area_size(scaled_area_size(60))
        .build_cartesian_2d(-extent..extent, -extent..extent)?;
    chart
        .configure_mesh()
        .x_desc("l [deg]")
        .y_desc("m [deg]")
        .label_style(("sans-serif", scaled_font_size(16)).into_font())
        .axis_desc_style(("sans-serif", scaled_font_size(20)).into_font())
        .light_line_style(WHITE.mix(0.0))
        .draw()?;

    for facet in &tess.facets {
        let poly: Vec<(f64, f64)> = facet
            .polygon
            .iter()
            .chain(facet.polygon.first())
            .map(|&(l, m)| (to_deg(l), to_deg(m)))
            .collect();
        chart.draw_series(std::iter::once(PathElement::new(poly, BLACK.mix(0.4))))?;

        let weights = weighting.weights(facet.l0, facet.m0, dirs);
        let centre = (to_deg(facet.l0), to_deg(facet.m0));
        for &(d, _) in weights.iter().skip(1) {
            let target = (to_deg(dirs[d].l), to_deg(dirs[d].m));
            chart.draw_series(std::iter::once(PathElement::new(
                vec![centre, target],
                DIRECTION_COLORS[d % DIRECTION_COLORS.len()].mix(0.5),
            )))?;
        }
        if let Some(&(d, _)) = weights.first() {
            let color = DIRECTION_COLORS[d % DIRECTION_COLORS.len()];
            chart.draw_series(std::iter::once(Circle::new(centre, 6, color.filled())))?;
        }
    }

    chart
        .draw_series(dirs.iter().enumerate().map(|(i, d)| {
            let color = DIRECTION_COLORS[i % DIRECTION_COLORS.len()];
            Cross::new((to_deg(d.l), to_deg(d.m)), 9, color.stroke_width(3))
        }))?
        .label("calibration direction")
        .legend(|(x, y)| Cross::new((x, y), 6, BLACK.stroke_width(2)));

    chart
        .configure_series_labels()
        .border_style(BLACK)
        .background_style(WHITE.mix(0.8))
        .label_font(("sans-serif", scaled_font_size(16)).into_font())
        .draw()?;

    root.present()?;
    Ok(())
}
