pub use nalgebra;

#[allow(non_camel_case_types)]
pub type float = f64;
pub use std::f64::consts::PI;

pub const INFINITY: float = f64::INFINITY;
pub const NEG_INFINITY: float = f64::NEG_INFINITY;

pub use nalgebra::{DMatrix, DVector, Matrix3, SMatrix, SVector, Vector3, Vector4, Vector6};

pub fn min<T: Copy + PartialOrd>(a: T, b: T) -> T {
    if b < a {
        b
    } else {
        a
    }
}

pub fn max<T: Copy + PartialOrd>(a: T, b: T) -> T {
    if b > a {
        b
    } else {
        a
    }
}

pub fn clamp(v: float, lo: float, hi: float) -> float {
    max(lo, min(hi, v))
}

/// Shifts `b` by multiples of 2pi until it lies within pi of `a`.
pub fn phase_unwrap(a: float, mut b: float) -> float {
    if a.is_infinite() || b.is_infinite() {
        return b;
    }
    while b > a + PI {
        b -= 2.0 * PI;
    }
    while b < a - PI {
        b += 2.0 * PI;
    }
    b
}

pub fn rk4<const N: usize, F>(
    dt: float,
    num_steps: u32,
    y_0: &SVector<float, N>,
    mut f: F,
) -> SVector<float, N>
where
    F: FnMut(&SVector<float, N>) -> SVector<float, N>,
{
    let h = dt / float::from(num_steps);
    let mut y = *y_0;
    for _ in 0..num_steps {
        let k1 = f(&y) * h;
        let k2 = f(&(y + 0.5 * k1)) * h;
        let k3 = f(&(y + 0.5 * k2)) * h;
        let k4 = f(&(y + k3)) * h;
        y += (k1 + 2.0 * (k2 + k3) + k4) / 6.0;
    }
    y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_unwrap_brings_angles_close() {
        assert!((phase_unwrap(0.1, 2.0 * PI + 0.2) - 0.2).abs() < 1e-12);
        assert!((phase_unwrap(-3.0, 3.2) - (3.2 - 2.0 * PI)).abs() < 1e-12);
        assert_eq!(phase_unwrap(0.0, 0.5), 0.5);
    }

    #[test]
    fn rk4_integrates_exponential_decay() {
        let y = rk4(1.0, 20, &SVector::<float, 1>::new(1.0), |y| -y);
        assert!((y[0] - (-1.0f64).exp()).abs() < 1e-6);
    }
}
