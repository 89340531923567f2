//! 2D and 3D geometry operations for navigation meshes
//!
//! Most operations work on the XZ plane (Y-up coordinate system). Points are
//! passed as `&[f32]` slices whose first three components are x, y and z, so
//! they can be taken directly out of packed vertex arrays.

use crate::math::{sqr, vdot_2d, vperp_2d};

/// Calculate twice the signed area of a 2D triangle on the XZ plane.
///
/// Positive when `c` lies to the right of `a -> b` when looking down the Y
/// axis, negative when it lies to the left and zero for collinear points.
#[inline]
pub fn tri_area_2d(a: &[f32], b: &[f32], c: &[f32]) -> f32 {
    let abx = b[0] - a[0];
    let abz = b[2] - a[2];
    let acx = c[0] - a[0];
    let acz = c[2] - a[2];
    acx * abz - abx * acz
}

/// Squared distance from a point to a segment on the XZ plane.
///
/// Returns the squared distance and the clamped parameter along `p -> q`.
pub fn dist_pt_seg_sqr_2d(pt: &[f32], p: &[f32], q: &[f32]) -> (f32, f32) {
    let pqx = q[0] - p[0];
    let pqz = q[2] - p[2];
    let dx = pt[0] - p[0];
    let dz = pt[2] - p[2];
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    let dx = p[0] + t * pqx - pt[0];
    let dz = p[2] + t * pqz - pt[2];
    (dx * dx + dz * dz, t)
}

/// Crossing-number point in polygon test on the XZ plane.
///
/// `verts` is a packed xyz array holding `nverts` vertices.
pub fn point_in_polygon(pt: &[f32], verts: &[f32], nverts: usize) -> bool {
    let mut inside = false;
    let mut j = nverts.wrapping_sub(1);
    for i in 0..nverts {
        let vi = &verts[i * 3..i * 3 + 3];
        let vj = &verts[j * 3..j * 3 + 3];
        if ((vi[2] > pt[2]) != (vj[2] > pt[2]))
            && (pt[0] < (vj[0] - vi[0]) * (pt[2] - vi[2]) / (vj[2] - vi[2]) + vi[0])
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Point in polygon test that also reports the squared distance and segment
/// parameter to every edge.
///
/// Edge `j` runs from vertex `j` to vertex `j + 1`; results are written to
/// `ed[j]` and `et[j]`.
pub fn dist_pt_poly_edges_sqr(
    pt: &[f32],
    verts: &[f32],
    nverts: usize,
    ed: &mut [f32],
    et: &mut [f32],
) -> bool {
    let mut inside = false;
    let mut j = nverts.wrapping_sub(1);
    for i in 0..nverts {
        let vi = &verts[i * 3..i * 3 + 3];
        let vj = &verts[j * 3..j * 3 + 3];
        if ((vi[2] > pt[2]) != (vj[2] > pt[2]))
            && (pt[0] < (vj[0] - vi[0]) * (pt[2] - vi[2]) / (vj[2] - vi[2]) + vi[0])
        {
            inside = !inside;
        }
        let (d, t) = dist_pt_seg_sqr_2d(pt, vj, vi);
        ed[j] = d;
        et[j] = t;
        j = i;
    }
    inside
}

/// Height of the triangle `abc` at the xz location of `p`.
///
/// Returns `None` when `p` is outside the triangle or the triangle is
/// degenerate on the XZ plane. Points on the edges count as inside.
pub fn closest_height_point_triangle(p: &[f32], a: &[f32], b: &[f32], c: &[f32]) -> Option<f32> {
    const EPS: f32 = 1e-6;

    let v0 = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
    let v1 = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let v2 = [p[0] - a[0], p[1] - a[1], p[2] - a[2]];

    let mut denom = v0[0] * v1[2] - v0[2] * v1[0];
    if denom.abs() < EPS {
        return None;
    }

    let mut u = v1[2] * v2[0] - v1[0] * v2[2];
    let mut v = v0[0] * v2[2] - v0[2] * v2[0];
    if denom < 0.0 {
        denom = -denom;
        u = -u;
        v = -v;
    }

    if u >= 0.0 && v >= 0.0 && (u + v) <= denom {
        Some(a[1] + (v0[1] * u + v1[1] * v) / denom)
    } else {
        None
    }
}

/// Intersects segment `ap -> aq` with segment `bp -> bq` on the XZ plane.
///
/// Returns the parameters `(s, t)` along each segment of the intersection of
/// the supporting lines, or `None` when they are parallel.
pub fn intersect_seg_seg_2d(
    ap: &[f32],
    aq: &[f32],
    bp: &[f32],
    bq: &[f32],
) -> Option<(f32, f32)> {
    let u = [aq[0] - ap[0], 0.0, aq[2] - ap[2]];
    let v = [bq[0] - bp[0], 0.0, bq[2] - bp[2]];
    let w = [ap[0] - bp[0], 0.0, ap[2] - bp[2]];
    let d = perp_xz(&u, &v);
    if d.abs() < 1e-6 {
        return None;
    }
    Some((perp_xz(&v, &w) / d, perp_xz(&u, &w) / d))
}

#[inline]
fn perp_xz(a: &[f32], b: &[f32]) -> f32 {
    a[0] * b[2] - a[2] * b[0]
}

/// Result of clipping a segment against a convex polygon
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentPolyIntersection {
    /// Parameter where the segment enters the polygon
    pub tmin: f32,
    /// Parameter where the segment leaves the polygon
    pub tmax: f32,
    /// Edge the segment enters through, -1 if it starts inside
    pub seg_min: i32,
    /// Edge the segment leaves through, -1 if it ends inside
    pub seg_max: i32,
}

/// Clips the segment `p0 -> p1` against a convex polygon on the XZ plane.
///
/// Edge `j` runs from vertex `j` to vertex `j + 1`. Returns `None` when the
/// segment misses the polygon.
pub fn intersect_segment_poly_2d(
    p0: &[f32],
    p1: &[f32],
    verts: &[f32],
    nverts: usize,
) -> Option<SegmentPolyIntersection> {
    const EPS: f32 = 0.000_000_01;

    let mut hit = SegmentPolyIntersection {
        tmin: 0.0,
        tmax: 1.0,
        seg_min: -1,
        seg_max: -1,
    };

    let dir = [p1[0] - p0[0], p1[1] - p0[1], p1[2] - p0[2]];

    let mut j = nverts.wrapping_sub(1);
    for i in 0..nverts {
        let edge = [
            verts[i * 3] - verts[j * 3],
            verts[i * 3 + 1] - verts[j * 3 + 1],
            verts[i * 3 + 2] - verts[j * 3 + 2],
        ];
        let diff = [
            p0[0] - verts[j * 3],
            p0[1] - verts[j * 3 + 1],
            p0[2] - verts[j * 3 + 2],
        ];
        let n = vperp_2d(&edge, &diff);
        let d = vperp_2d(&dir, &edge);
        if d.abs() < EPS {
            // Parallel to this edge, either fully outside or irrelevant.
            if n < 0.0 {
                return None;
            }
            j = i;
            continue;
        }
        let t = n / d;
        if d < 0.0 {
            // Entering across this edge.
            if t > hit.tmin {
                hit.tmin = t;
                hit.seg_min = j as i32;
                if hit.tmin > hit.tmax {
                    return None;
                }
            }
        } else if t < hit.tmax {
            // Leaving across this edge.
            hit.tmax = t;
            hit.seg_max = j as i32;
            if hit.tmax < hit.tmin {
                return None;
            }
        }
        j = i;
    }

    Some(hit)
}

/// Overlap test for quantized bounds
#[inline]
pub fn overlap_quant_bounds(amin: &[u16; 3], amax: &[u16; 3], bmin: &[u16; 3], bmax: &[u16; 3]) -> bool {
    !(amin[0] > bmax[0]
        || amax[0] < bmin[0]
        || amin[1] > bmax[1]
        || amax[1] < bmin[1]
        || amin[2] > bmax[2]
        || amax[2] < bmin[2])
}

/// Overlap test for floating point bounds
#[inline]
pub fn overlap_bounds(amin: &[f32], amax: &[f32], bmin: &[f32], bmax: &[f32]) -> bool {
    !(amin[0] > bmax[0]
        || amax[0] < bmin[0]
        || amin[1] > bmax[1]
        || amax[1] < bmin[1]
        || amin[2] > bmax[2]
        || amax[2] < bmin[2])
}

/// Checks whether two edge slabs overlap.
///
/// Slabs are given as `(u, y)` endpoint pairs along a shared tile border.
/// The horizontal ranges are shrunk by `px`; the vertical check allows a
/// height difference of `py` at both ends of the overlapping range.
pub fn overlap_slabs(
    amin: [f32; 2],
    amax: [f32; 2],
    bmin: [f32; 2],
    bmax: [f32; 2],
    px: f32,
    py: f32,
) -> bool {
    let minx = (amin[0] + px).max(bmin[0] + px);
    let maxx = (amax[0] - px).min(bmax[0] - px);
    if minx > maxx {
        return false;
    }

    let ad = (amax[1] - amin[1]) / (amax[0] - amin[0]);
    let ak = amin[1] - ad * amin[0];
    let bd = (bmax[1] - bmin[1]) / (bmax[0] - bmin[0]);
    let bk = bmin[1] - bd * bmin[0];
    let aminy = ad * minx + ak;
    let amaxy = ad * maxx + ak;
    let bminy = bd * minx + bk;
    let bmaxy = bd * maxx + bk;
    let dmin = bminy - aminy;
    let dmax = bmaxy - amaxy;

    // Crossing segments always overlap.
    if dmin * dmax < 0.0 {
        return true;
    }

    let thr = sqr(py * 2.0);
    dmin * dmin <= thr || dmax * dmax <= thr
}

fn project_poly(axis: &[f32], poly: &[f32], npoly: usize) -> (f32, f32) {
    let mut rmin = vdot_2d(axis, &poly[0..3]);
    let mut rmax = rmin;
    for i in 1..npoly {
        let d = vdot_2d(axis, &poly[i * 3..i * 3 + 3]);
        rmin = rmin.min(d);
        rmax = rmax.max(d);
    }
    (rmin, rmax)
}

#[inline]
fn overlap_range(amin: f32, amax: f32, bmin: f32, bmax: f32, eps: f32) -> bool {
    !((amin + eps) > bmax || (amax - eps) < bmin)
}

/// Separating axis overlap test for two convex polygons on the XZ plane
pub fn overlap_poly_poly_2d(polya: &[f32], npolya: usize, polyb: &[f32], npolyb: usize) -> bool {
    const EPS: f32 = 1e-4;

    for (poly, npoly) in [(polya, npolya), (polyb, npolyb)] {
        let mut j = npoly - 1;
        for i in 0..npoly {
            let va = &poly[j * 3..j * 3 + 3];
            let vb = &poly[i * 3..i * 3 + 3];
            let n = [vb[2] - va[2], 0.0, -(vb[0] - va[0])];
            let (amin, amax) = project_poly(&n, polya, npolya);
            let (bmin, bmax) = project_poly(&n, polyb, npolyb);
            if !overlap_range(amin, amax, bmin, bmax, EPS) {
                return false;
            }
            j = i;
        }
    }
    true
}

/// Picks a point inside a convex polygon from two uniform samples in `[0, 1)`.
///
/// The polygon is fanned from its first vertex, a triangle is chosen with
/// probability proportional to its area using `s`, and `t` places the point
/// within that triangle.
pub fn random_point_in_convex_poly(pts: &[f32], npts: usize, s: f32, t: f32) -> [f32; 3] {
    let mut areas = vec![0.0f32; npts];
    let mut areasum = 0.0;
    for i in 2..npts {
        areas[i] = tri_area_2d(&pts[0..3], &pts[(i - 1) * 3..i * 3], &pts[i * 3..i * 3 + 3]);
        areasum += areas[i].max(0.001);
    }

    let thr = s * areasum;
    let mut acc = 0.0;
    let mut u = 1.0;
    let mut tri = npts - 1;
    for i in 2..npts {
        let dacc = areas[i];
        if thr >= acc && thr < acc + dacc {
            u = (thr - acc) / dacc;
            tri = i;
            break;
        }
        acc += dacc;
    }

    let v = t.sqrt();
    let a = 1.0 - v;
    let b = (1.0 - u) * v;
    let c = u * v;
    let pa = &pts[0..3];
    let pb = &pts[(tri - 1) * 3..tri * 3];
    let pc = &pts[tri * 3..tri * 3 + 3];

    [
        a * pa[0] + b * pb[0] + c * pc[0],
        a * pa[1] + b * pb[1] + c * pc[1],
        a * pa[2] + b * pb[2] + c * pc[2],
    ]
}

/// Returns the compass side opposite to `side` (0..7)
#[inline]
pub fn opposite_tile(side: i32) -> i32 {
    (side + 4) & 0x7
}
