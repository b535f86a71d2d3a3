//! Projection, triangulation and cross-view consistency.
//!
//! Calibrated cameras use a pinhole model `x = K [R | t] X`. Uncalibrated
//! pairs fall back to a parallel rectified-stereo approximation.

use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector3, Vector4};

use crate::config::{CalibrationSettings, CameraCalibration};
use crate::Position3D;

const MIN_HOMOGENEOUS_W: f64 = 1e-10;

/// One image-plane observation of a point, with the camera that made it.
#[derive(Clone, Copy, Debug)]
pub struct View<'a> {
    pub calibration: &'a CameraCalibration,
    pub pixel: (f64, f64),
}

fn intrinsics(cal: &CameraCalibration) -> Matrix3<f64> {
    Matrix3::new(cal.fx, 0.0, cal.cx, 0.0, cal.fy, cal.cy, 0.0, 0.0, 1.0)
}

fn rotation(cal: &CameraCalibration) -> Matrix3<f64> {
    let r = &cal.rotation;
    Matrix3::new(
        r[0][0], r[0][1], r[0][2], r[1][0], r[1][1], r[1][2], r[2][0], r[2][1], r[2][2],
    )
}

/// 3x4 projection matrix `K [R | t]`.
pub fn projection_matrix(cal: &CameraCalibration) -> Matrix3x4<f64> {
    let mut extrinsic = Matrix3x4::zeros();
    extrinsic
        .fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&rotation(cal));
    extrinsic
        .fixed_view_mut::<3, 1>(0, 3)
        .copy_from(&Vector3::from(cal.translation));
    intrinsics(cal) * extrinsic
}

/// Depth of a world point along the camera's optical axis.
fn depth(cal: &CameraCalibration, point: &Position3D) -> f64 {
    let camera = rotation(cal) * Vector3::new(point.x, point.y, point.z)
        + Vector3::from(cal.translation);
    camera.z
}

/// Project a world point into pixels; `None` when it lies behind the camera.
pub fn project(cal: &CameraCalibration, point: &Position3D) -> Option<(f64, f64)> {
    let homogeneous = projection_matrix(cal) * Vector4::new(point.x, point.y, point.z, 1.0);
    if homogeneous.z <= 0.0 {
        return None;
    }
    Some((homogeneous.x / homogeneous.z, homogeneous.y / homogeneous.z))
}

/// Linear (DLT) triangulation from two or more calibrated views.
///
/// Returns `None` with fewer than two views, for a point at infinity, or when
/// the solution lies behind any contributing camera.
pub fn triangulate(views: &[View<'_>]) -> Option<Position3D> {
    if views.len() < 2 {
        return None;
    }

    let mut normal = Matrix4::<f64>::zeros();
    for view in views {
        let p = projection_matrix(view.calibration);
        let (u, v) = view.pixel;
        let row_u = (p.row(2) * u - p.row(0)).transpose();
        let row_v = (p.row(2) * v - p.row(1)).transpose();
        normal += row_u * row_u.transpose();
        normal += row_v * row_v.transpose();
    }

    let eigen = normal.symmetric_eigen();
    let smallest = eigen.eigenvalues.iamin();
    let solution = eigen.eigenvectors.column(smallest);
    let w = solution[3];
    if w.abs() < MIN_HOMOGENEOUS_W {
        return None;
    }

    let point = Position3D::new(solution[0] / w, solution[1] / w, solution[2] / w);
    if !point.is_finite() || views.iter().any(|view| depth(view.calibration, &point) <= 0.0) {
        return None;
    }
    Some(point)
}

/// Mean pixel distance between each view's observation and the reprojected point.
pub fn reprojection_error(views: &[View<'_>], point: &Position3D) -> f64 {
    if views.is_empty() {
        return f64::INFINITY;
    }
    let mut total = 0.0;
    for view in views {
        let Some((u, v)) = project(view.calibration, point) else {
            return f64::INFINITY;
        };
        total += ((u - view.pixel.0).powi(2) + (v - view.pixel.1).powi(2)).sqrt();
    }
    total / views.len() as f64
}

/// Geometric consistency of two observations from calibrated cameras: the
/// reprojection error of their two-view triangulation, or infinity.
pub fn pair_consistency(a: View<'_>, b: View<'_>) -> f64 {
    let views = [a, b];
    match triangulate(&views) {
        Some(point) => reprojection_error(&views, &point),
        None => f64::INFINITY,
    }
}

/// Epipolar distance for rectified parallel cameras: the row offset of the
/// two box centers.
pub fn rectified_epipolar_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.1 - b.1).abs()
}

/// Parallel-stereo depth from disparity in normalized image coordinates.
///
/// Centers are normalized to [-1, 1] around the configured frame center and the
/// disparity is clamped to `min_disparity` so coincident centers still yield a
/// (far) position.
pub fn stereo_position(
    left: (f64, f64),
    right: (f64, f64),
    settings: &CalibrationSettings,
) -> Option<Position3D> {
    let half_w = f64::from(settings.frame_width) / 2.0;
    let half_h = f64::from(settings.frame_height) / 2.0;
    if half_w <= 0.0 || half_h <= 0.0 {
        return None;
    }
    let normalize = |(x, y): (f64, f64)| ((x - half_w) / half_w, (y - half_h) / half_h);
    let (x1, y1) = normalize(left);
    let (x2, y2) = normalize(right);

    let disparity = (x1 - x2).abs().max(settings.min_disparity);
    let z = settings.baseline_m / disparity;
    let point = Position3D::new((x1 + x2) * z / 2.0, (y1 + y2) * z / 2.0, z);
    point.is_finite().then_some(point)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_rig() -> (CameraCalibration, CameraCalibration) {
        (
            CameraCalibration::horizontal(500.0, 500.0, 320.0, 240.0, 0.0),
            CameraCalibration::horizontal(500.0, 500.0, 320.0, 240.0, 0.5),
        )
    }

    #[test]
    fn projection_matches_pinhole_model() {
        let (left, right) = stereo_rig();
        let point = Position3D::new(0.25, 0.1, 2.0);
        let (u, v) = project(&left, &point).unwrap();
        assert!((u - (320.0 + 500.0 * 0.25 / 2.0)).abs() < 1e-9);
        assert!((v - (240.0 + 500.0 * 0.1 / 2.0)).abs() < 1e-9);
        let (u_right, _) = project(&right, &point).unwrap();
        assert!((u_right - (320.0 + 500.0 * -0.25 / 2.0)).abs() < 1e-9);
    }

    #[test]
    fn triangulation_recovers_point() {
        let (left, right) = stereo_rig();
        let truth = Position3D::new(0.3, -0.2, 3.0);
        let views = [
            View { calibration: &left, pixel: project(&left, &truth).unwrap() },
            View { calibration: &right, pixel: project(&right, &truth).unwrap() },
        ];
        let point = triangulate(&views).unwrap();
        assert!((point.x - truth.x).abs() < 1e-4);
        assert!((point.y - truth.y).abs() < 1e-4);
        assert!((point.z - truth.z).abs() < 1e-4);
        assert!(reprojection_error(&views, &point) < 1e-3);
    }

    #[test]
    fn single_view_does_not_triangulate() {
        let (left, _) = stereo_rig();
        assert!(triangulate(&[View { calibration: &left, pixel: (320.0, 240.0) }]).is_none());
    }

    #[test]
    fn inconsistent_rows_are_penalized() {
        let (left, right) = stereo_rig();
        let good = pair_consistency(
            View { calibration: &left, pixel: (400.0, 240.0) },
            View { calibration: &right, pixel: (300.0, 240.0) },
        );
        let bad = pair_consistency(
            View { calibration: &left, pixel: (400.0, 100.0) },
            View { calibration: &right, pixel: (300.0, 400.0) },
        );
        assert!(good < 1e-3);
        assert!(bad > good);
    }

    #[test]
    fn stereo_fallback_clamps_disparity() {
        let settings = CalibrationSettings::default();
        let point = stereo_position((30.0, 30.0), (30.5, 31.0), &settings).unwrap();
        assert!(point.is_finite());
        assert!((point.z - settings.baseline_m / settings.min_disparity).abs() < 1e-9);
    }

    #[test]
    fn stereo_fallback_depth_from_disparity() {
        let settings = CalibrationSettings::default();
        // 64 px on a 640 px frame is a normalized disparity of 0.2.
        let point = stereo_position((352.0, 240.0), (288.0, 240.0), &settings).unwrap();
        assert!((point.z - 0.5 / 0.2).abs() < 1e-9);
        assert!(point.x.abs() < 1e-9);
    }
}
