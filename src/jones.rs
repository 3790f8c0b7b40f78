//! 2×2 complex Jones matrices, stored row-major as `[xx, xy, yx, yy]`.

use std::ops::{Add, AddAssign, Mul};

use bytemuck::{Pod, Zeroable};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

pub type C32 = Complex<f32>;

/// Which parts of a solution matrix are honoured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum JonesMode {
    /// Only the xx term, applied to both feeds.
    Scalar,
    /// Diagonal terms only.
    Diag,
    Full,
}

/// Amplitude / phase selection used when applying solutions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyMode {
    pub amplitude: bool,
    pub phase: bool,
}

impl ApplyMode {
    pub const AP: ApplyMode = ApplyMode {
        amplitude: true,
        phase: true,
    };

    /// Parses "AP", "A", "P" (case-insensitive).
    pub fn parse(text: &str) -> Option<Self> {
        let upper = text.trim().to_ascii_uppercase();
        if upper.is_empty() || !upper.chars().all(|c| c == 'A' || c == 'P') {
            return None;
        }
        Some(ApplyMode {
            amplitude: upper.contains('A'),
            phase: upper.contains('P'),
        })
    }
}

impl Default for ApplyMode {
    fn default() -> Self {
        ApplyMode::AP
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct Jones(pub [C32; 4]);

impl Default for Jones {
    fn default() -> Self {
        Jones::identity()
    }
}

impl Jones {
    pub fn identity() -> Self {
        let one = C32::new(1.0, 0.0);
        let zero = C32::new(0.0, 0.0);
        Jones([one, zero, zero, one])
    }

    pub fn zero() -> Self {
        Jones::zeroed()
    }

    pub fn diag(xx: C32, yy: C32) -> Self {
        let zero = C32::new(0.0, 0.0);
        Jones([xx, zero, zero, yy])
    }

    pub fn scalar(g: C32) -> Self {
        Jones::diag(g, g)
    }

    /// Conjugate transpose.
    pub fn h(&self) -> Self {
        let [a, b, c, d] = self.0;
        Jones([a.conj(), c.conj(), b.conj(), d.conj()])
    }

    pub fn det(&self) -> C32 {
        let [a, b, c, d] = self.0;
        a * d - b * c
    }

    /// Inverse, or `None` when the matrix is singular.
    pub fn inv(&self) -> Option<Self> {
        let det = self.det();
        if det.norm_sqr() == 0.0 || !det.is_finite() {
            return None;
        }
        let [a, b, c, d] = self.0;
        let inv_det = C32::new(1.0, 0.0) / det;
        Some(Jones([d * inv_det, -b * inv_det, -c * inv_det, a * inv_det]))
    }

    pub fn scale(&self, factor: f32) -> Self {
        let [a, b, c, d] = self.0;
        Jones([a * factor, b * factor, c * factor, d * factor])
    }

    pub fn restrict(&self, mode: JonesMode) -> Self {
        match mode {
            JonesMode::Full => *self,
            JonesMode::Diag => Jones::diag(self.0[0], self.0[3]),
            JonesMode::Scalar => Jones::scalar(self.0[0]),
        }
    }

    /// Drops the amplitude (unit modulus) or the phase (modulus only) of
    /// every non-zero element.
    pub fn strip(&self, mode: ApplyMode) -> Self {
        let mut out = *self;
        for z in out.0.iter_mut() {
            let amp = z.norm();
            if amp == 0.0 {
                continue;
            }
            *z = match (mode.amplitude, mode.phase) {
                (true, true) => *z,
                (false, true) => *z / amp,
                (true, false) => C32::new(amp, 0.0),
                (false, false) => C32::new(1.0, 0.0),
            };
        }
        out
    }

    /// Mean squared modulus of the two diagonal terms.
    pub fn diag_mean_norm_sqr(&self) -> f32 {
        0.5 * (self.0[0].norm_sqr() + self.0[3].norm_sqr())
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|z| z.is_finite())
    }
}

impl Mul for Jones {
    type Output = Jones;

    fn mul(self, rhs: Jones) -> Jones {
        let [a, b, c, d] = self.0;
        let [e, f, g, h] = rhs.0;
        Jones([a * e + b * g, a * f + b * h, c * e + d * g, c * f + d * h])
    }
}

impl Add for Jones {
    type Output = Jones;

    fn add(self, rhs: Jones) -> Jones {
        let mut out = self;
        out += rhs;
        out
    }
}

impl AddAssign for Jones {
    fn add_assign(&mut self, rhs: Jones) {
        for (a, b) in self.0.iter_mut().zip(rhs.0.iter()) {
            *a += *b;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sample() -> Jones {
        Jones([
            C32::new(1.0, 0.5),
            C32::new(0.2, -0.1),
            C32::new(-0.3, 0.4),
            C32::new(0.8, 0.0),
        ])
    }

    #[test]
    fn inverse_times_matrix_is_identity() {
        let j = sample();
        let prod = j.inv().unwrap() * j;
        for (got, want) in prod.0.iter().zip(Jones::identity().0.iter()) {
            assert_abs_diff_eq!(got.re, want.re, epsilon = 1e-5);
            assert_abs_diff_eq!(got.im, want.im, epsilon = 1e-5);
        }
    }

    #[test]
    fn singular_matrix_has_no_inverse() {
        assert!(Jones::zero().inv().is_none());
    }

    #[test]
    fn hermitian_of_product_reverses_order() {
        let a = sample();
        let b = Jones::diag(C32::new(0.0, 1.0), C32::new(2.0, 0.0));
        let lhs = (a * b).h();
        let rhs = b.h() * a.h();
        for (x, y) in lhs.0.iter().zip(rhs.0.iter()) {
            assert_abs_diff_eq!(x.re, y.re, epsilon = 1e-6);
            assert_abs_diff_eq!(x.im, y.im, epsilon = 1e-6);
        }
    }

    #[test]
    fn strip_keeps_only_requested_part() {
        let j = Jones::scalar(C32::from_polar(2.0, 0.7));
        let phase_only = j.strip(ApplyMode::parse("P").unwrap());
        assert_abs_diff_eq!(phase_only.0[0].norm(), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(phase_only.0[0].arg(), 0.7, epsilon = 1e-6);
        let amp_only = j.strip(ApplyMode::parse("a").unwrap());
        assert_abs_diff_eq!(amp_only.0[0].re, 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(amp_only.0[0].im, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn apply_mode_rejects_other_letters() {
        assert!(ApplyMode::parse("APX").is_none());
        assert!(ApplyMode::parse("").is_none());
    }

    #[test]
    fn restrict_scalar_copies_xx() {
        let r = sample().restrict(JonesMode::Scalar);
        assert_eq!(r.0[3], sample().0[0]);
        assert_eq!(r.0[1], C32::new(0.0, 0.0));
    }
}
