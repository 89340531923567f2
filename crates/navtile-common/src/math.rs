//! Scalar and `[f32; 3]` vector helpers

/// Squares a value
#[inline]
pub fn sqr<T: std::ops::Mul<Output = T> + Copy>(x: T) -> T {
    x * x
}

/// Returns the next power of two greater than or equal to `x`
pub fn next_pow2(x: u32) -> u32 {
    if x == 0 {
        return 1;
    }
    let mut v = x - 1;
    v |= v >> 1;
    v |= v >> 2;
    v |= v >> 4;
    v |= v >> 8;
    v |= v >> 16;
    v.wrapping_add(1)
}

/// Reads the point at index `i` from a packed xyz array
#[inline]
pub fn vert_at(verts: &[f32], i: usize) -> [f32; 3] {
    [verts[i * 3], verts[i * 3 + 1], verts[i * 3 + 2]]
}

#[inline]
pub fn vadd(a: &[f32], b: &[f32]) -> [f32; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline]
pub fn vsub(a: &[f32], b: &[f32]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vscale(v: &[f32], s: f32) -> [f32; 3] {
    [v[0] * s, v[1] * s, v[2] * s]
}

/// Returns `a + b * s`
#[inline]
pub fn vmad(a: &[f32], b: &[f32], s: f32) -> [f32; 3] {
    [a[0] + b[0] * s, a[1] + b[1] * s, a[2] + b[2] * s]
}

#[inline]
pub fn vlerp(a: &[f32], b: &[f32], t: f32) -> [f32; 3] {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
    ]
}

#[inline]
pub fn vmin(a: &[f32], b: &[f32]) -> [f32; 3] {
    [a[0].min(b[0]), a[1].min(b[1]), a[2].min(b[2])]
}

#[inline]
pub fn vmax(a: &[f32], b: &[f32]) -> [f32; 3] {
    [a[0].max(b[0]), a[1].max(b[1]), a[2].max(b[2])]
}

#[inline]
pub fn vdot(a: &[f32], b: &[f32]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Dot product on the xz-plane
#[inline]
pub fn vdot_2d(a: &[f32], b: &[f32]) -> f32 {
    a[0] * b[0] + a[2] * b[2]
}

/// Perp dot product on the xz-plane
#[inline]
pub fn vperp_2d(u: &[f32], v: &[f32]) -> f32 {
    u[2] * v[0] - u[0] * v[2]
}

#[inline]
pub fn vlen(v: &[f32]) -> f32 {
    vdot(v, v).sqrt()
}

#[inline]
pub fn vdist(a: &[f32], b: &[f32]) -> f32 {
    vdist_sqr(a, b).sqrt()
}

#[inline]
pub fn vdist_sqr(a: &[f32], b: &[f32]) -> f32 {
    sqr(b[0] - a[0]) + sqr(b[1] - a[1]) + sqr(b[2] - a[2])
}

/// Distance on the xz-plane
#[inline]
pub fn vdist_2d(a: &[f32], b: &[f32]) -> f32 {
    vdist_sqr_2d(a, b).sqrt()
}

#[inline]
pub fn vdist_sqr_2d(a: &[f32], b: &[f32]) -> f32 {
    sqr(b[0] - a[0]) + sqr(b[2] - a[2])
}

/// Normalizes a vector, leaving zero vectors untouched
pub fn vnormalize(v: &[f32]) -> [f32; 3] {
    let len = vlen(v);
    if len > 0.0 {
        vscale(v, 1.0 / len)
    } else {
        [v[0], v[1], v[2]]
    }
}

/// Treats two points closer than 1/16384 as equal
#[inline]
pub fn vequal(a: &[f32], b: &[f32]) -> bool {
    vdist_sqr(a, b) < sqr(1.0 / 16384.0)
}

#[inline]
pub fn visfinite(v: &[f32]) -> bool {
    v[0].is_finite() && v[1].is_finite() && v[2].is_finite()
}

/// Checks the x and z components only
#[inline]
pub fn visfinite_2d(v: &[f32]) -> bool {
    v[0].is_finite() && v[2].is_finite()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_pow2() {
        assert_eq!(next_pow2(0), 1);
        assert_eq!(next_pow2(1), 1);
        assert_eq!(next_pow2(5), 8);
        assert_eq!(next_pow2(64), 64);
    }

    #[test]
    fn test_vector_ops() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 6.0, 3.0];
        assert_eq!(vdist(&a, &b), 5.0);
        assert_eq!(vdist_2d(&a, &b), 3.0);
        assert_eq!(vlerp(&a, &b, 0.5), [2.5, 4.0, 3.0]);
        assert_eq!(vnormalize(&[0.0, 0.0, 2.0]), [0.0, 0.0, 1.0]);
        assert!(vequal(&a, &[1.0, 2.0, 3.00001]));
        assert!(!vequal(&a, &[1.0, 2.0, 3.01]));
        assert!(!visfinite(&[f32::NAN, 0.0, 0.0]));
        assert!(visfinite_2d(&[0.0, f32::INFINITY, 0.0]));
    }
}
