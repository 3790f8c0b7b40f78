//! Facet layout of the output image.
//!
//! The image is cut into `nfacets × nfacets` square facets of an FFT-friendly
//! size. Facet centres sit on the pixel grid of the main image, so every facet
//! pixel maps onto exactly one main-image pixel.

use std::fs;
use std::path::Path;

use log::{debug, info};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::config::ImageConfig;
use crate::geom::{lm_to_radec, radec_to_lm};

/// Whether `n` only has prime factors 2, 3, 5 and 7.
pub fn is_fast_size(mut n: usize) -> bool {
    if n == 0 {
        return false;
    }
    for p in [2, 3, 5, 7] {
        while n % p == 0 {
            n /= p;
        }
    }
    n == 1
}

fn next_fast_even(n: usize) -> usize {
    let mut m = n.max(2);
    if m % 2 != 0 {
        m += 1;
    }
    while !is_fast_size(m) {
        m += 2;
    }
    m
}

/// Snaps a requested facet size to an even FFT-friendly size and returns it
/// together with its padded counterpart.
pub fn estimate_npix(npix: f64, padding: f64) -> (usize, usize) {
    let opt = next_fast_even(npix.round().max(2.0) as usize);
    let padded = next_fast_even((opt as f64 * padding).round() as usize);
    (opt, padded)
}

/// Half-open pixel ranges `[x0, x1) × [y0, y1)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edges {
    pub x0: usize,
    pub x1: usize,
    pub y0: usize,
    pub y1: usize,
}

impl Edges {
    pub fn is_empty(&self) -> bool {
        self.x1 <= self.x0 || self.y1 <= self.y0
    }

    pub fn width(&self) -> usize {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> usize {
        self.y1.saturating_sub(self.y0)
    }
}

fn axis_edges(centre: usize, n_main: usize, n_facet: usize) -> (usize, usize, usize, usize) {
    let start = centre as i64 - (n_facet / 2) as i64;
    let main0 = start.max(0);
    let main1 = (start + n_facet as i64).min(n_main as i64);
    if main1 <= main0 {
        return (0, 0, 0, 0);
    }
    (
        main0 as usize,
        main1 as usize,
        (main0 - start) as usize,
        (main1 - start) as usize,
    )
}

/// Intersection of an `n_facet` square centred on main-image pixel `centre`
/// with the `n_main` square image. Facet pixel `i` lands on main pixel
/// `centre - n_facet/2 + i`.
pub fn give_edges(centre: (usize, usize), n_main: usize, n_facet: usize) -> (Edges, Edges) {
    let (mx0, mx1, fx0, fx1) = axis_edges(centre.0, n_main, n_facet);
    let (my0, my1, fy0, fy1) = axis_edges(centre.1, n_main, n_facet);
    (
        Edges {
            x0: mx0,
            x1: mx1,
            y0: my0,
            y1: my1,
        },
        Edges {
            x0: fx0,
            x1: fx1,
            y0: fy0,
            y1: fy1,
        },
    )
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FacetGeometry {
    pub index: usize,
    /// Facet centre in direction cosines relative to the phase centre.
    pub l0: f64,
    pub m0: f64,
    pub ra: f64,
    pub dec: f64,
    /// Centre pixel (x, y) in the main image.
    pub pix_central: (usize, usize),
    pub npix_facet: usize,
    pub npix_padded: usize,
    pub padding: f64,
    /// `[l_min, l_max, m_min, m_max]` of the unpadded facet.
    pub lm_extent: [f64; 4],
    /// Facet boundary clipped to the image, counter-clockwise in (l, m).
    pub polygon: Vec<(f64, f64)>,
    /// Facet point closest to the phase centre.
    pub lm_min: (f64, f64),
}

impl FacetGeometry {
    pub fn n0(&self) -> f64 {
        crate::geom::n_of(self.l0, self.m0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tessellation {
    pub npix: usize,
    pub cell_rad: f64,
    pub nfacets: usize,
    pub npix_facet: usize,
    pub npix_padded: usize,
    pub padding: f64,
    pub ra0: f64,
    pub dec0: f64,
    pub facets: Vec<FacetGeometry>,
}

impl Tessellation {
    pub fn new(cfg: &ImageConfig) -> Self {
        let nf = cfg.nfacets;
        let cell = cfg.cell_rad();
        let (npix_facet, _) = estimate_npix(cfg.npix as f64 / nf as f64, 1.0);
        let npix = npix_facet * nf;
        if npix != cfg.npix {
            info!(
                "image size {} adjusted to {} ({} facets of {} px)",
                cfg.npix, npix, nf, npix_facet
            );
        }
        let (_, npix_padded) = estimate_npix(npix_facet as f64, cfg.padding);
        info!(
            "tessellation: {}x{} facets, {} px each, padded to {} px",
            nf, nf, npix_facet, npix_padded
        );

        // pixel edges of the image in units of cells from the centre pixel
        let half = npix as f64 / 2.0;
        let image_box = rect(-half - 0.5, half - 0.5, -half - 0.5, half - 0.5, cell);

        let mut facets = Vec::with_capacity(nf * nf);
        for iy in 0..nf {
            for ix in 0..nf {
                let xc = ix * npix_facet + npix_facet / 2;
                let yc = iy * npix_facet + npix_facet / 2;
                let l0 = (xc as f64 - half) * cell;
                let m0 = (yc as f64 - half) * cell;
                let hf = npix_facet as f64 / 2.0;
                let lo_x = xc as f64 - half - hf - 0.5;
                let lo_y = yc as f64 - half - hf - 0.5;
                let square = rect(lo_x, lo_x + npix_facet as f64, lo_y, lo_y + npix_facet as f64, cell);
                let polygon = clip_polygon(&square, &image_box);
                let (lmin, lmax, mmin, mmax) = bounds(&polygon);
                let lm_min = (0.0f64.clamp(lmin, lmax), 0.0f64.clamp(mmin, mmax));
                let (ra, dec) = lm_to_radec(l0, m0, cfg.ra0, cfg.dec0);
                let index = iy * nf + ix;
                debug!(
                    "facet {index}: centre pixel ({xc}, {yc}), l0={:.3e} m0={:.3e}",
                    l0, m0
                );
                facets.push(FacetGeometry {
                    index,
                    l0,
                    m0,
                    ra,
                    dec,
                    pix_central: (xc, yc),
                    npix_facet,
                    npix_padded,
                    padding: cfg.padding,
                    lm_extent: [lmin, lmax, mmin, mmax],
                    polygon,
                    lm_min,
                });
            }
        }

        Tessellation {
            npix,
            cell_rad: cell,
            nfacets: nf,
            npix_facet,
            npix_padded,
            padding: cfg.padding,
            ra0: cfg.ra0,
            dec0: cfg.dec0,
            facets,
        }
    }

    pub fn len(&self) -> usize {
        self.facets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facets.is_empty()
    }

    /// Index of the facet whose centre is closest to the phase centre.
    pub fn central_facet(&self) -> usize {
        self.facets
            .iter()
            .min_by(|a, b| {
                let da = a.l0 * a.l0 + a.m0 * a.m0;
                let db = b.l0 * b.l0 + b.m0 * b.m0;
                da.total_cmp(&db)
            })
            .map(|f| f.index)
            .unwrap_or(0)
    }

    /// Main-image and padded-facet edges of facet `index`.
    pub fn padded_edges(&self, index: usize) -> (Edges, Edges) {
        let f = &self.facets[index];
        give_edges(f.pix_central, self.npix, f.npix_padded)
    }

    /// 0/1 mask of the facet polygon sampled on the padded facet grid,
    /// indexed `[y][x]`.
    pub fn facet_mask(&self, facet: &FacetGeometry) -> Array2<f32> {
        let np = facet.npix_padded;
        let cell = self.cell_rad;
        Array2::from_shape_fn((np, np), |(iy, ix)| {
            let l = facet.l0 + (ix as f64 - (np / 2) as f64) * cell;
            let m = facet.m0 + (iy as f64 - (np / 2) as f64) * cell;
            if point_in_polygon(l, m, &facet.polygon) {
                1.0
            } else {
                0.0
            }
        })
    }

    /// DS9 region file with one line segment per polygon edge, in degrees.
    pub fn region_file(&self) -> String {
        let mut out = String::new();
        out.push_str("# Region file format: DS9 version 4.1\n");
        out.push_str(
            "global color=green dashlist=8 3 width=1 font=\"helvetica 10 normal roman\" select=1 highlite=1 dash=0 fixed=0 edit=1 move=1 delete=1 include=1 source=1\n",
        );
        out.push_str("fk5\n");
        for facet in &self.facets {
            let poly = &facet.polygon;
            for (i, &(l_a, m_a)) in poly.iter().enumerate() {
                let (l_b, m_b) = poly[(i + 1) % poly.len()];
                let (ra_a, dec_a) = lm_to_radec(l_a, m_a, self.ra0, self.dec0);
                let (ra_b, dec_b) = lm_to_radec(l_b, m_b, self.ra0, self.dec0);
                out.push_str(&format!(
                    "line({:.6},{:.6},{:.6},{:.6}) # line=0 0\n",
                    ra_a.to_degrees(),
                    dec_a.to_degrees(),
                    ra_b.to_degrees(),
                    dec_b.to_degrees()
                ));
            }
        }
        out
    }

    pub fn write_region_file(&self, path: &Path) -> std::io::Result<()> {
        fs::write(path, self.region_file())
    }

    /// Direction cosines of a sky position relative to the phase centre.
    pub fn lm_of(&self, ra: f64, dec: f64) -> (f64, f64) {
        radec_to_lm(ra, dec, self.ra0, self.dec0)
    }
}

fn rect(x0: f64, x1: f64, y0: f64, y1: f64, cell: f64) -> Vec<(f64, f64)> {
    vec![
        (x0 * cell, y0 * cell),
        (x1 * cell, y0 * cell),
        (x1 * cell, y1 * cell),
        (x0 * cell, y1 * cell),
    ]
}

fn bounds(poly: &[(f64, f64)]) -> (f64, f64, f64, f64) {
    poly.iter().fold(
        (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY),
        |(a, b, c, d), &(x, y)| (a.min(x), b.max(x), c.min(y), d.max(y)),
    )
}

fn cross(a: (f64, f64), b: (f64, f64), p: (f64, f64)) -> f64 {
    (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0)
}

/// Sutherland-Hodgman clip of `subject` by the convex counter-clockwise
/// polygon `clip`.
pub fn clip_polygon(subject: &[(f64, f64)], clip: &[(f64, f64)]) -> Vec<(f64, f64)> {
    let mut output = subject.to_vec();
    for i in 0..clip.len() {
        if output.is_empty() {
            break;
        }
        let a = clip[i];
        let b = clip[(i + 1) % clip.len()];
        let input = std::mem::take(&mut output);
        for j in 0..input.len() {
            let p = input[j];
            let q = input[(j + 1) % input.len()];
            let p_in = cross(a, b, p) >= 0.0;
            let q_in = cross(a, b, q) >= 0.0;
            if p_in {
                output.push(p);
            }
            if p_in != q_in {
                let cp = cross(a, b, p);
                let cq = cross(a, b, q);
                let t = cp / (cp - cq);
                output.push((p.0 + t * (q.0 - p.0), p.1 + t * (q.1 - p.1)));
            }
        }
    }
    output
}

/// Even-odd ray casting.
pub fn point_in_polygon(x: f64, y: f64, poly: &[(f64, f64)]) -> bool {
    let mut inside = false;
    let n = poly.len();
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let (xi, yi) = poly[i];
        let (xj, yj) = poly[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolMode;
    use approx::assert_abs_diff_eq;

    fn image(npix: usize, nfacets: usize, padding: f64) -> ImageConfig {
        ImageConfig {
            npix,
            cell_arcsec: 4.0,
            nfacets,
            padding,
            pol_mode: PolMode::I,
            n_freq_bands: 1,
            ra0: 1.0,
            dec0: 0.7,
        }
    }

    #[test]
    fn fast_sizes() {
        assert!(is_fast_size(640));
        assert!(is_fast_size(2 * 3 * 5 * 7));
        assert!(!is_fast_size(22));
        assert_eq!(estimate_npix(512.0, 1.2), (512, 640));
        assert_eq!(estimate_npix(101.0, 1.0).0, 102);
    }

    #[test]
    fn two_by_two_of_1024() {
        let t = Tessellation::new(&image(1024, 2, 1.2));
        assert_eq!(t.npix, 1024);
        assert_eq!(t.npix_facet, 512);
        assert_eq!(t.npix_padded, 640);
        assert_eq!(t.facets[0].pix_central, (256, 256));
        assert_eq!(t.facets[3].pix_central, (768, 768));
        assert_abs_diff_eq!(t.facets[1].l0, 256.0 * t.cell_rad, epsilon = 1e-15);
        assert_abs_diff_eq!(t.facets[1].m0, -256.0 * t.cell_rad, epsilon = 1e-15);
    }

    #[test]
    fn give_edges_clips_at_image_border() {
        let (main, facet) = give_edges((256, 256), 1024, 640);
        assert_eq!((main.x0, main.x1), (0, 576));
        assert_eq!((facet.x0, facet.x1), (64, 640));
        let (main, facet) = give_edges((768, 256), 1024, 640);
        assert_eq!((main.x0, main.x1), (448, 1024));
        assert_eq!((facet.x0, facet.x1), (0, 576));
        assert_eq!(main.width(), facet.width());
    }

    #[test]
    fn masks_tile_the_image_exactly_once() {
        for (npix, nf, pad) in [(64, 1, 1.5), (96, 2, 1.2), (120, 3, 1.4)] {
            let t = Tessellation::new(&image(npix, nf, pad));
            let mut count = Array2::<f32>::zeros((t.npix, t.npix));
            for f in &t.facets {
                let mask = t.facet_mask(f);
                let (main, sub) = t.padded_edges(f.index);
                let mut dst = count.slice_mut(ndarray::s![main.y0..main.y1, main.x0..main.x1]);
                dst += &mask.slice(ndarray::s![sub.y0..sub.y1, sub.x0..sub.x1]);
            }
            assert!(count.iter().all(|&c| c == 1.0), "npix={npix} nf={nf}");
        }
    }

    #[test]
    fn central_facet_and_closest_point() {
        let t = Tessellation::new(&image(120, 3, 1.2));
        assert_eq!(t.central_facet(), 4);
        assert_eq!(t.facets[4].lm_min, (0.0, 0.0));
        let corner = &t.facets[0];
        assert_abs_diff_eq!(corner.lm_min.0, corner.lm_extent[1], epsilon = 1e-15);
        let (l, m) = t.lm_of(corner.ra, corner.dec);
        assert_abs_diff_eq!(l, corner.l0, epsilon = 1e-12);
        assert_abs_diff_eq!(m, corner.m0, epsilon = 1e-12);
    }

    #[test]
    fn clipping_a_square_by_a_smaller_one() {
        let a = vec![(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0)];
        let b = vec![(2.0, 2.0), (6.0, 2.0), (6.0, 6.0), (2.0, 6.0)];
        let c = clip_polygon(&a, &b);
        let (x0, x1, y0, y1) = bounds(&c);
        assert_eq!((x0, x1, y0, y1), (2.0, 4.0, 2.0, 4.0));
        assert!(point_in_polygon(3.0, 3.0, &c));
        assert!(!point_in_polygon(1.0, 3.0, &c));
    }

    #[test]
    fn region_file_has_four_edges_per_facet() {
        let t = Tessellation::new(&image(64, 2, 1.2));
        let reg = t.region_file();
        assert!(reg.starts_with("# Region file format: DS9 version 4.1\n"));
        assert_eq!(reg.lines().filter(|l| l.starts_with("line(")).count(), 16);
        assert_eq!(reg.lines().count(), 3 + 16);
        assert!(reg.ends_with("# line=0 0\n"));

        let first = reg.lines().nth(3).unwrap();
        let coords: Vec<f64> = first
            .trim_start_matches("line(")
            .split(')')
            .next()
            .unwrap()
            .split(',')
            .map(|v| v.parse().unwrap())
            .collect();
        let (l, m) = t.facets[0].polygon[0];
        let (ra, dec) = lm_to_radec(l, m, t.ra0, t.dec0);
        assert_abs_diff_eq!(coords[0], ra.to_degrees(), epsilon = 1e-6);
        assert_abs_diff_eq!(coords[1], dec.to_degrees(), epsilon = 1e-6);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facets.reg");
        t.write_region_file(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), reg);
    }
}
