//! Constant-power pan law.

use std::f64::consts::FRAC_PI_4;

/// Left/right gains for a pan position in -1 (hard left) ..= +1 (hard right).
///
/// `angle = (p + 1)·π/4`, `left = cos(angle)`, `right = sin(angle)`, so
/// `left² + right² = 1` everywhere and both sides sit at -3 dB in the centre.
/// Out-of-range positions are clamped.
#[inline]
pub fn constant_power_gains(pan: f32) -> (f32, f32) {
    let p = if pan.is_nan() { 0.0 } else { pan.clamp(-1.0, 1.0) };
    let angle = (p as f64 + 1.0) * FRAC_PI_4;
    (angle.cos() as f32, angle.sin() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn test_centre_is_minus_three_db() {
        let (l, r) = constant_power_gains(0.0);
        assert_abs_diff_eq!(l, std::f32::consts::FRAC_1_SQRT_2, epsilon = 1e-6);
        assert_abs_diff_eq!(r, std::f32::consts::FRAC_1_SQRT_2, epsilon = 1e-6);
    }

    #[test]
    fn test_hard_left_and_right() {
        let (l, r) = constant_power_gains(-1.0);
        assert_abs_diff_eq!(l, 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(r, 0.0, epsilon = 1e-6);

        let (l, r) = constant_power_gains(1.0);
        assert_abs_diff_eq!(l, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(r, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_out_of_range_and_nan_are_clamped() {
        assert_eq!(constant_power_gains(5.0), constant_power_gains(1.0));
        assert_eq!(constant_power_gains(-7.0), constant_power_gains(-1.0));
        assert_eq!(constant_power_gains(f32::NAN), constant_power_gains(0.0));
    }

    proptest! {
        #[test]
        fn prop_constant_power(p in -1.0f32..=1.0) {
            let (l, r) = constant_power_gains(p);
            let power = (l as f64).powi(2) + (r as f64).powi(2);
            prop_assert!((power - 1.0).abs() <= 1e-6, "power {} at pan {}", power, p);
        }

        #[test]
        fn prop_moving_right_never_raises_left(a in -1.0f32..=1.0, b in -1.0f32..=1.0) {
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            prop_assert!(constant_power_gains(hi).0 <= constant_power_gains(lo).0 + 1e-7);
        }
    }
}
