//! PnP pose estimation via OpenCV's EPnP RANSAC.

use anyhow::Result;
use nalgebra::{Matrix3, Vector3};
use opencv::calib3d;
use opencv::core::{Mat, Point2f, Point3d};
use opencv::prelude::*;

use crate::camera::Camera;
use crate::geometry::SE3;

/// Solve PnP with EPnP inside RANSAC (100 iterations, 8 px threshold,
/// 0.98 confidence) and return the body pose T_wc.
///
/// OpenCV estimates the sensor pose T_sensor_world; the camera extrinsic is
/// peeled off to recover the body pose.
pub fn solve_pnp_ransac(
    points3d: &[Vector3<f64>],
    points2d: &[Point2f],
    camera: &Camera,
) -> Result<Option<SE3>> {
    if points3d.len() < 4 {
        return Ok(None);
    }

    let pts3d: Vec<Point3d> = points3d
        .iter()
        .map(|p| Point3d::new(p.x, p.y, p.z))
        .collect();
    let obj_points = Mat::from_slice(&pts3d)?.try_clone()?;
    let img_points = Mat::from_slice(points2d)?.try_clone()?;

    let camera_matrix = Mat::from_slice_2d(&[
        [camera.fx, 0.0, camera.cx],
        [0.0, camera.fy, camera.cy],
        [0.0, 0.0, 1.0],
    ])?
    .try_clone()?;
    let dist_coeffs = Mat::zeros(1, 5, opencv::core::CV_64F)?.to_mat()?;

    let mut rvec = Mat::default();
    let mut tvec = Mat::default();
    let mut inliers = Mat::default();
    let ok = calib3d::solve_pnp_ransac(
        &obj_points,
        &img_points,
        &camera_matrix,
        &dist_coeffs,
        &mut rvec,
        &mut tvec,
        false,
        100,
        8.0,
        0.98,
        &mut inliers,
        calib3d::SOLVEPNP_EPNP,
    )?;
    if !ok {
        return Ok(None);
    }

    let mut rot_mat = Mat::default();
    calib3d::rodrigues(&rvec, &mut rot_mat, &mut opencv::core::no_array())?;
    let rotation = mat3_to_matrix3(&rot_mat)?;
    let translation = Vector3::new(
        *tvec.at::<f64>(0)?,
        *tvec.at::<f64>(1)?,
        *tvec.at::<f64>(2)?,
    );

    // T_sensor_world from OpenCV; T_wc = (extrinsic ∘ T_cw)⁻¹.
    let t_sensor_world = SE3::from_rt(rotation, translation);
    let t_cw = camera.extrinsic.inverse().compose(&t_sensor_world);
    Ok(Some(t_cw.inverse()))
}

fn mat3_to_matrix3(mat: &Mat) -> Result<Matrix3<f64>> {
    let mut arr = [0.0f64; 9];
    for (i, v) in arr.iter_mut().enumerate() {
        *v = *mat.at::<f64>(i as i32)?;
    }
    Ok(Matrix3::from_row_slice(&arr))
}
