use std::f64::consts::{PI, TAU};

/// Wrap an angle into (-π, π]. In-range and non-finite input is returned
/// unchanged.
pub fn normalize_angle(angle: f64) -> f64 {
    if !angle.is_finite() || (angle > -PI && angle <= PI) {
        return angle;
    }
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI {
        wrapped + TAU
    } else {
        wrapped
    }
}

/// Signed shortest rotation taking `from` onto `to`.
pub fn shortest_angle(from: f64, to: f64) -> f64 {
    normalize_angle(to - from)
}

/// Interpolate along the shorter arc between two headings.
pub fn lerp_angle(from: f64, to: f64, t: f64) -> f64 {
    normalize_angle(from + t * shortest_angle(from, to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_normalize_range() {
        for k in -20..20 {
            let a = normalize_angle(k as f64 * 0.7);
            assert!(a > -PI && a <= PI, "{a} out of range");
        }
        assert_abs_diff_eq!(normalize_angle(-PI), PI, epsilon = 1e-12);
        assert_abs_diff_eq!(normalize_angle(1.5 * PI), -0.5 * PI, epsilon = 1e-12);
    }

    #[test]
    fn test_shortest_crosses_seam() {
        let d = shortest_angle(PI - 0.1, -PI + 0.1);
        assert_abs_diff_eq!(d, 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(lerp_angle(PI - 0.1, -PI + 0.1, 0.25), PI - 0.05, epsilon = 1e-12);
    }

    #[test]
    fn test_nan_passthrough() {
        assert!(normalize_angle(f64::NAN).is_nan());
    }
}
