//! Linear two-view triangulation for stereo landmark creation.

use nalgebra::{Matrix4, RowVector4, Vector3};

use crate::geometry::SE3;

/// Triangulate a body-frame point from two normalized observations.
///
/// `pose_left` / `pose_right` map body-frame points into the respective
/// sensor frames; `p_left` / `p_right` are unit-depth rays
/// (`Camera::pixel_to_sensor`). Returns `None` when the homogeneous solve is
/// degenerate or the point lands at infinity.
pub fn triangulate(
    pose_left: &SE3,
    pose_right: &SE3,
    p_left: &Vector3<f64>,
    p_right: &Vector3<f64>,
) -> Option<Vector3<f64>> {
    let mut a = Matrix4::zeros();
    for (row, (pose, ray)) in [(pose_left, p_left), (pose_right, p_right)]
        .iter()
        .enumerate()
    {
        let r = pose.rotation_matrix();
        let t = pose.translation;
        // Projection rows of [R | t].
        let p0 = RowVector4::new(r[(0, 0)], r[(0, 1)], r[(0, 2)], t.x);
        let p1 = RowVector4::new(r[(1, 0)], r[(1, 1)], r[(1, 2)], t.y);
        let p2 = RowVector4::new(r[(2, 0)], r[(2, 1)], r[(2, 2)], t.z);
        a.set_row(2 * row, &(ray.x * p2 - p0));
        a.set_row(2 * row + 1, &(ray.y * p2 - p1));
    }

    let svd = a.svd(true, true);
    let v_t = svd.v_t?;
    let h = v_t.row(3);
    if h[3].abs() < 1e-12 {
        return None;
    }
    let p = Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]);
    if !p.iter().all(|v| v.is_finite()) {
        return None;
    }
    Some(p)
}
