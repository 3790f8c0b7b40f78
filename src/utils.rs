use std::error::Error;
use std::sync::Arc;

use ndarray::Array2;
use num_complex::Complex;
use rayon::prelude::*;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftNum, FftPlanner};

pub type DynError = Box<dyn Error + Send + Sync>;

/// Square 2D complex transforms on row-major `n × n` buffers whose origin
/// sits at pixel `(n/2, n/2)`, both in the grid and in the image.
pub struct FftHelper<T: FftNum> {
    n: usize,
    forward: Arc<dyn Fft<T>>,
    inverse: Arc<dyn Fft<T>>,
}

impl<T: FftNum> FftHelper<T> {
    pub fn new(n: usize) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(n);
        let inverse = planner.plan_fft_inverse(n);
        Self {
            n,
            forward,
            inverse,
        }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    fn check(&self, data: &[Complex<T>]) -> Result<(), String> {
        if data.len() != self.n * self.n {
            return Err(format!(
                "buffer holds {} samples, expected {}x{}",
                data.len(),
                self.n,
                self.n
            ));
        }
        if self.n % 2 != 0 {
            return Err(format!("centred transforms need an even size, got {}", self.n));
        }
        Ok(())
    }

    /// Unnormalised `exp(+2πi …)` transform, centred on both sides.
    pub fn inverse_centred(&self, data: &mut [Complex<T>]) -> Result<(), String> {
        self.check(data)?;
        fft_shift_2d(data, self.n);
        transform_2d(data, self.n, self.inverse.as_ref());
        fft_shift_2d(data, self.n);
        Ok(())
    }

    /// Unnormalised `exp(-2πi …)` transform, centred on both sides.
    pub fn forward_centred(&self, data: &mut [Complex<T>]) -> Result<(), String> {
        self.check(data)?;
        fft_shift_2d(data, self.n);
        transform_2d(data, self.n, self.forward.as_ref());
        fft_shift_2d(data, self.n);
        Ok(())
    }
}

fn transform_2d<T: FftNum>(data: &mut [Complex<T>], n: usize, plan: &dyn Fft<T>) {
    let scratch_len = plan.get_inplace_scratch_len();
    let zero = Complex::new(T::zero(), T::zero());
    for _ in 0..2 {
        data.par_chunks_mut(n).for_each_init(
            || vec![zero; scratch_len],
            |scratch, row| plan.process_with_scratch(row, scratch),
        );
        transpose_square(data, n);
    }
}

fn transpose_square<T: Copy>(data: &mut [T], n: usize) {
    for i in 0..n {
        for j in (i + 1)..n {
            data.swap(i * n + j, j * n + i);
        }
    }
}

/// Swaps quadrants of an even-sized square buffer (its own inverse).
pub fn fft_shift_2d<T: Copy>(data: &mut [T], n: usize) {
    let half = n / 2;
    for i in 0..half {
        for j in 0..n {
            let jj = (j + half) % n;
            data.swap(i * n + j, (i + half) * n + jj);
        }
    }
}

/// 1D real transforms of a fixed length, used for separable smoothing.
pub struct RealFftHelper {
    len: usize,
    pub forward_r2c: Arc<dyn RealToComplex<f64>>,
    pub inverse_c2r: Arc<dyn ComplexToReal<f64>>,
}

impl RealFftHelper {
    pub fn new(len: usize) -> Self {
        let mut planner = RealFftPlanner::new();
        let forward_r2c = planner.plan_fft_forward(len);
        let inverse_c2r = planner.plan_fft_inverse(len);
        Self {
            len,
            forward_r2c,
            inverse_c2r,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn forward_r2c_process(
        &self,
        input: &mut [f64],
        output: &mut [Complex<f64>],
    ) -> Result<(), DynError> {
        if input.len() != self.len {
            return Err("Input length for R2C does not match FFT configuration".into());
        }
        if output.len() != self.len / 2 + 1 {
            return Err(
                "Output length for R2C does not match expected half-spectrum length".into(),
            );
        }
        self.forward_r2c.process(input, output)?;
        Ok(())
    }

    pub fn inverse_c2r_process(
        &self,
        spectrum: &mut [Complex<f64>],
        output: &mut [f64],
    ) -> Result<(), DynError> {
        if spectrum.len() != self.len / 2 + 1 {
            return Err(
                "Input spectrum length for C2R does not match expected half-spectrum length".into(),
            );
        }
        if output.len() != self.len {
            return Err(
                "Output buffer length for C2R does not match expected time-domain length".into(),
            );
        }
        // c2r requires real DC and Nyquist bins.
        spectrum[0].im = 0.0;
        if self.len % 2 == 0 {
            spectrum[self.len / 2].im = 0.0;
        }
        self.inverse_c2r.process(spectrum, output)?;
        let scale = 1.0 / self.len as f64;
        for value in output.iter_mut() {
            *value *= scale;
        }
        Ok(())
    }
}

/// Linear (zero-padded) convolution of every row and then every column of
/// `image` with a unit-sum Gaussian of width `sigma_px`.
pub fn gaussian_smooth_2d(image: &Array2<f64>, sigma_px: f64) -> Result<Array2<f64>, DynError> {
    let reach = (4.0 * sigma_px).ceil() as usize;
    let mut out = image.clone();
    // x pass, transpose, y pass, transpose back
    for _ in 0..2 {
        smooth_rows(&mut out, sigma_px, reach)?;
        out = out.t().as_standard_layout().into_owned();
    }
    Ok(out)
}

fn smooth_rows(data: &mut Array2<f64>, sigma_px: f64, reach: usize) -> Result<(), DynError> {
    let padded = (data.ncols() + 2 * reach + 1).next_power_of_two();
    let helper = RealFftHelper::new(padded);
    let kernel = gaussian_spectrum(&helper, sigma_px, reach)?;
    let mut buf = vec![0.0f64; padded];
    let mut spec = vec![Complex::new(0.0, 0.0); padded / 2 + 1];
    for mut row in data.rows_mut() {
        buf.fill(0.0);
        for (dst, src) in buf.iter_mut().zip(row.iter()) {
            *dst = *src;
        }
        helper.forward_r2c_process(&mut buf, &mut spec)?;
        for (s, k) in spec.iter_mut().zip(kernel.iter()) {
            *s *= *k;
        }
        helper.inverse_c2r_process(&mut spec, &mut buf)?;
        for (dst, src) in row.iter_mut().zip(buf.iter()) {
            *dst = *src;
        }
    }
    Ok(())
}

fn gaussian_spectrum(
    helper: &RealFftHelper,
    sigma_px: f64,
    reach: usize,
) -> Result<Vec<Complex<f64>>, DynError> {
    let n = helper.len();
    let mut taps = vec![0.0f64; n];
    let mut sum = 0.0;
    for offset in 0..=reach {
        let w = (-0.5 * (offset as f64 / sigma_px).powi(2)).exp();
        taps[offset] = w;
        sum += w;
        if offset > 0 {
            taps[n - offset] = w;
            sum += w;
        }
    }
    for t in taps.iter_mut() {
        *t /= sum;
    }
    let mut spec = vec![Complex::new(0.0, 0.0); n / 2 + 1];
    helper.forward_r2c_process(&mut taps, &mut spec)?;
    Ok(spec)
}

/// `sin(x)/x` with the removable singularity filled in.
pub fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-8 {
        1.0
    } else {
        x.sin() / x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn centred_inverse_of_centre_delta_is_flat() {
        let n = 8;
        let helper = FftHelper::<f32>::new(n);
        let mut data = vec![Complex::new(0.0f32, 0.0); n * n];
        data[(n / 2) * n + n / 2] = Complex::new(1.0, 0.0);
        helper.inverse_centred(&mut data).unwrap();
        for v in &data {
            assert_abs_diff_eq!(v.re, 1.0, epsilon = 1e-6);
            assert_abs_diff_eq!(v.im, 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn centred_transform_of_offset_delta_has_expected_phase() {
        let n = 16;
        let helper = FftHelper::<f64>::new(n);
        let mut data = vec![Complex::new(0.0, 0.0); n * n];
        // one cell right of the origin along x
        data[(n / 2) * n + n / 2 + 1] = Complex::new(1.0, 0.0);
        helper.inverse_centred(&mut data).unwrap();
        let x = 3i64;
        let y = -2i64;
        let idx = ((y + n as i64 / 2) as usize) * n + (x + n as i64 / 2) as usize;
        let phase = 2.0 * std::f64::consts::PI * x as f64 / n as f64;
        assert_abs_diff_eq!(data[idx].re, phase.cos(), epsilon = 1e-9);
        assert_abs_diff_eq!(data[idx].im, phase.sin(), epsilon = 1e-9);
    }

    #[test]
    fn forward_then_inverse_scales_by_n_squared() {
        let n = 6;
        let helper = FftHelper::<f64>::new(n);
        let orig: Vec<Complex<f64>> = (0..n * n)
            .map(|i| Complex::new(i as f64 * 0.1, -(i as f64) * 0.05))
            .collect();
        let mut data = orig.clone();
        helper.forward_centred(&mut data).unwrap();
        helper.inverse_centred(&mut data).unwrap();
        for (a, b) in data.iter().zip(orig.iter()) {
            assert_abs_diff_eq!(a.re / (n * n) as f64, b.re, epsilon = 1e-9);
            assert_abs_diff_eq!(a.im / (n * n) as f64, b.im, epsilon = 1e-9);
        }
    }

    #[test]
    fn odd_size_is_rejected() {
        let helper = FftHelper::<f32>::new(5);
        let mut data = vec![Complex::new(0.0f32, 0.0); 25];
        assert!(helper.inverse_centred(&mut data).is_err());
    }

    #[test]
    fn gaussian_smoothing_preserves_interior_sum_and_spreads() {
        let mut img = Array2::<f64>::zeros((64, 48));
        img[[32, 24]] = 1.0;
        let out = gaussian_smooth_2d(&img, 3.0).unwrap();
        assert_eq!(out.dim(), (64, 48));
        assert_abs_diff_eq!(out.sum(), 1.0, epsilon = 1e-6);
        assert!(out[[32, 24]] < 0.05);
        assert_abs_diff_eq!(out[[35, 24]], out[[29, 24]], epsilon = 1e-9);
        assert_abs_diff_eq!(out[[32, 27]], out[[32, 21]], epsilon = 1e-9);
    }

    #[test]
    fn sinc_is_one_at_zero() {
        assert_eq!(sinc(0.0), 1.0);
        assert_abs_diff_eq!(sinc(std::f64::consts::PI), 0.0, epsilon = 1e-12);
    }
}
