//! Visibility chunks and their layout in the shared store.
//!
//! A chunk is published as one sub-namespace holding its arrays plus a
//! `meta` record. Workers only receive a [`ChunkHandle`] and map the arrays
//! themselves. The `residual` array starts as a copy of `data` and is the
//! one buffer several degrid jobs write concurrently.

use std::path::PathBuf;

use ndarray::{Array1, Array2, Array3, ArrayView, ArrayView3, Dimension};
use serde::{Deserialize, Serialize};

use crate::error::{ContractError, PipelineError, StoreError};
use crate::gridder::VisChunkView;
use crate::jones::C32;
use crate::solutions::SolutionSet;
use crate::store::{Element, Namespace, SharedArray, StripedArray};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkHandle {
    pub path: PathBuf,
    pub label: String,
    pub nrow: usize,
    pub nchan: usize,
    pub ncorr: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ChunkMeta {
    label: String,
    chan_mapping: Vec<usize>,
    dt: f64,
    dnu: f64,
}

#[derive(Clone, Debug)]
pub struct VisChunk {
    pub label: String,
    pub uvw: Array2<f64>,
    pub uvw_rate: Array2<f64>,
    pub data: Array3<C32>,
    pub flags: Array3<u8>,
    pub weights: Array2<f32>,
    pub times: Array1<f64>,
    pub a0: Array1<i32>,
    pub a1: Array1<i32>,
    pub freqs: Array1<f64>,
    pub chan_mapping: Vec<usize>,
    pub dt: f64,
    pub dnu: f64,
}

impl VisChunk {
    pub fn nrow(&self) -> usize {
        self.data.dim().0
    }

    pub fn nchan(&self) -> usize {
        self.data.dim().1
    }

    pub fn ncorr(&self) -> usize {
        self.data.dim().2
    }

    pub fn n_antennas(&self) -> usize {
        self.a0
            .iter()
            .chain(self.a1.iter())
            .map(|&a| a.max(0) as usize + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn view(&self) -> VisChunkView<'_> {
        VisChunkView {
            uvw: self.uvw.view(),
            uvw_rate: self.uvw_rate.view(),
            data: self.data.view(),
            flags: self.flags.view(),
            weights: self.weights.view(),
            times: self.times.view(),
            a0: self.a0.view(),
            a1: self.a1.view(),
            freqs: self.freqs.view(),
            chan_mapping: &self.chan_mapping,
            dt: self.dt,
            dnu: self.dnu,
        }
    }

    /// Writes the chunk under `parent/<label>` and returns the handle
    /// workers attach with.
    pub fn publish(&self, parent: &mut Namespace) -> Result<ChunkHandle, StoreError> {
        let mut ns = parent.add_sub_namespace(self.label.as_str())?;
        ns.put_record(
            "meta",
            &ChunkMeta {
                label: self.label.clone(),
                chan_mapping: self.chan_mapping.clone(),
                dt: self.dt,
                dnu: self.dnu,
            },
        )?;
        ns.put_ndarray("uvw", &self.uvw)?;
        ns.put_ndarray("uvw_rate", &self.uvw_rate)?;
        ns.put_ndarray("data", &self.data)?;
        ns.put_ndarray("residual", &self.data)?;
        ns.put_ndarray("flags", &self.flags)?;
        ns.put_ndarray("weights", &self.weights)?;
        ns.put_ndarray("times", &self.times)?;
        ns.put_ndarray("a0", &self.a0)?;
        ns.put_ndarray("a1", &self.a1)?;
        ns.put_ndarray("freqs", &self.freqs)?;
        Ok(ChunkHandle {
            path: ns.path().to_path_buf(),
            label: self.label.clone(),
            nrow: self.nrow(),
            nchan: self.nchan(),
            ncorr: self.ncorr(),
        })
    }
}

/// Attaches the solutions in force for a published chunk, together with
/// the row to solution-interval mapping.
pub fn attach_solutions(handle: &ChunkHandle, sols: &SolutionSet, time_map: &[usize]) -> Result<(), PipelineError> {
    if time_map.len() != handle.nrow {
        return Err(ContractError::Shape {
            name: "time map",
            expected: vec![handle.nrow],
            found: vec![time_map.len()],
        }
        .into());
    }
    let mut ns = Namespace::attach(&handle.path, false)?;
    let mut sub = ns.add_sub_namespace("sols")?;
    sols.publish(&mut sub)?;
    let map: Vec<i64> = time_map.iter().map(|&t| t as i64).collect();
    sub.put_array("time_map", &[map.len()], &map)?;
    Ok(())
}

/// Output band of each channel: the observed band split into `n_bands`
/// equal frequency ranges.
pub fn band_mapping(freqs: &[f64], n_bands: usize) -> Vec<usize> {
    let lo = freqs.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = freqs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if n_bands <= 1 || !(hi > lo) {
        return vec![0; freqs.len()];
    }
    let width = (hi - lo) / n_bands as f64;
    freqs
        .iter()
        .map(|&f| (((f - lo) / width) as usize).min(n_bands - 1))
        .collect()
}

/// Worker-side mapping of a published chunk.
pub struct ChunkView {
    ns: Namespace,
    meta: ChunkMeta,
    uvw: SharedArray<f64>,
    uvw_rate: SharedArray<f64>,
    data: SharedArray<C32>,
    flags: SharedArray<u8>,
    weights: SharedArray<f32>,
    times: SharedArray<f64>,
    a0: SharedArray<i32>,
    a1: SharedArray<i32>,
    freqs: SharedArray<f64>,
}

pub(crate) fn fixed<'a, T: Element, D: Dimension>(
    arr: &'a SharedArray<T>,
    name: &'static str,
) -> Result<ArrayView<'a, T, D>, PipelineError> {
    let found = arr.shape().to_vec();
    arr.view()?
        .into_dimensionality::<D>()
        .map_err(|_| {
            ContractError::Shape {
                name,
                expected: Vec::new(),
                found,
            }
            .into()
        })
}

impl ChunkView {
    pub fn attach(ns: Namespace) -> Result<Self, PipelineError> {
        let meta: ChunkMeta = ns.get_record("meta")?;
        Ok(ChunkView {
            uvw: ns.array("uvw")?,
            uvw_rate: ns.array("uvw_rate")?,
            data: ns.array("data")?,
            flags: ns.array("flags")?,
            weights: ns.array("weights")?,
            times: ns.array("times")?,
            a0: ns.array("a0")?,
            a1: ns.array("a1")?,
            freqs: ns.array("freqs")?,
            meta,
            ns,
        })
    }

    pub fn open(handle: &ChunkHandle) -> Result<Self, PipelineError> {
        ChunkView::attach(Namespace::attach(&handle.path, false)?)
    }

    pub fn label(&self) -> &str {
        &self.meta.label
    }

    pub fn times(&self) -> &[f64] {
        self.times.as_slice()
    }

    pub fn view(&self) -> Result<VisChunkView<'_>, PipelineError> {
        Ok(VisChunkView {
            uvw: fixed(&self.uvw, "uvw")?,
            uvw_rate: fixed(&self.uvw_rate, "uvw_rate")?,
            data: fixed(&self.data, "data")?,
            flags: fixed(&self.flags, "flags")?,
            weights: fixed(&self.weights, "weights")?,
            times: fixed(&self.times, "times")?,
            a0: fixed(&self.a0, "a0")?,
            a1: fixed(&self.a1, "a1")?,
            freqs: fixed(&self.freqs, "freqs")?,
            chan_mapping: &self.meta.chan_mapping,
            dt: self.meta.dt,
            dnu: self.meta.dnu,
        })
    }

    /// Solutions attached to this chunk and their per-row interval index.
    pub fn solutions(&self) -> Result<Option<(SolutionSet, Vec<usize>)>, PipelineError> {
        if !self.ns.contains("sols") {
            return Ok(None);
        }
        let sub = self.ns.sub_namespace("sols")?;
        let set = SolutionSet::from_namespace(&sub)?;
        let map = sub.array::<i64>("time_map")?;
        Ok(Some((set, map.as_slice().iter().map(|&t| t.max(0) as usize).collect())))
    }

    /// Shared writable mapping of the residual visibilities.
    pub fn residual(&self) -> Result<StripedArray<C32>, StoreError> {
        self.ns.array_striped("residual")
    }

    pub fn residual_snapshot(&self) -> Result<Array3<C32>, PipelineError> {
        let arr = self.ns.array::<C32>("residual")?;
        Ok(fixed::<C32, ndarray::Ix3>(&arr, "residual")?.to_owned())
    }
}

/// RMS modulus of the unflagged residual samples.
pub fn residual_rms(residual: &ArrayView3<C32>, flags: &ArrayView3<u8>) -> f64 {
    let mut sum = 0.0f64;
    let mut n = 0usize;
    for (r, &f) in residual.iter().zip(flags.iter()) {
        if f == 0 {
            sum += r.norm_sqr() as f64;
            n += 1;
        }
    }
    if n == 0 {
        0.0
    } else {
        (sum / n as f64).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn chunk() -> VisChunk {
        let nrow = 6;
        VisChunk {
            label: "c0".into(),
            uvw: Array2::from_shape_fn((nrow, 3), |(r, k)| (r * 3 + k) as f64),
            uvw_rate: Array2::zeros((nrow, 3)),
            data: Array3::from_shape_fn((nrow, 2, 2), |(r, c, k)| C32::new(r as f32, (c + k) as f32)),
            flags: Array3::zeros((nrow, 2, 2)),
            weights: Array2::ones((nrow, 2)),
            times: Array1::from_shape_fn(nrow, |r| (r / 2) as f64),
            a0: Array1::from_vec(vec![0, 0, 1, 0, 0, 1]),
            a1: Array1::from_vec(vec![1, 2, 2, 1, 2, 2]),
            freqs: Array1::from_vec(vec![1.0e8, 1.1e8]),
            chan_mapping: vec![0, 1],
            dt: 30.0,
            dnu: 1.0e7,
        }
    }

    #[test]
    fn band_mapping_splits_the_band() {
        assert_eq!(band_mapping(&[1.0, 2.0, 3.0, 4.0], 2), vec![0, 0, 1, 1]);
        assert_eq!(band_mapping(&[1.0, 2.0], 1), vec![0, 0]);
        assert_eq!(band_mapping(&[5.0, 5.0], 3), vec![0, 0]);
    }

    #[test]
    fn published_chunk_attaches_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut root = Namespace::create(dir.path().join("vis")).unwrap();
        let c = chunk();
        assert_eq!(c.n_antennas(), 3);
        let handle = c.publish(&mut root).unwrap();
        assert_eq!((handle.nrow, handle.nchan, handle.ncorr), (6, 2, 2));

        let view = ChunkView::open(&handle).unwrap();
        assert_eq!(view.label(), "c0");
        let v = view.view().unwrap();
        assert_eq!(v.data, c.data.view());
        assert_eq!(v.a1, c.a1.view());
        assert_eq!(v.chan_mapping, &[0, 1]);
        assert_eq!(v.dt, 30.0);
    }

    #[test]
    fn residual_is_a_writable_copy_of_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut root = Namespace::create(dir.path().join("vis")).unwrap();
        let c = chunk();
        let handle = c.publish(&mut root).unwrap();
        let view = ChunkView::open(&handle).unwrap();
        {
            let mut res = view.residual().unwrap();
            for x in res.row_mut(2) {
                *x = C32::new(0.0, 0.0);
            }
            res.flush().unwrap();
        }
        let snap = view.residual_snapshot().unwrap();
        assert_eq!(snap[[2, 1, 1]], C32::new(0.0, 0.0));
        assert_eq!(snap[[3, 1, 1]], c.data[[3, 1, 1]]);
        // data itself is untouched
        assert_eq!(view.view().unwrap().data[[2, 1, 1]], c.data[[2, 1, 1]]);
    }

    #[test]
    fn rms_skips_flagged_samples() {
        let res = Array3::from_elem((2, 1, 2), C32::new(3.0, 4.0));
        let mut flags = Array3::<u8>::zeros((2, 1, 2));
        assert_abs_diff_eq!(residual_rms(&res.view(), &flags.view()), 5.0, epsilon = 1e-9);
        flags.fill(1);
        assert_eq!(residual_rms(&res.view(), &flags.view()), 0.0);
    }
}
