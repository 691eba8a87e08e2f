//! Pinhole camera model for re-projecting scan points into image space.
//!
//! Points are expected in the camera frame: x right, y down, z forward.

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::error::{FusionError, FusionResult};

/// Pinhole intrinsics in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
        }
    }

    /// Intrinsics with the principal point at the image center and a
    /// horizontal field of view in radians.
    pub fn from_fov(width: u32, height: u32, horizontal_fov: f64) -> Self {
        let f = width as f64 * 0.5 / (horizontal_fov * 0.5).tan();
        Self::new(f, f, width as f64 * 0.5, height as f64 * 0.5, width, height)
    }

    pub fn validate(&self) -> FusionResult<()> {
        if !(self.fx > 0.0 && self.fy > 0.0) {
            return Err(FusionError::invalid_config(
                "camera.fx",
                "focal lengths must be positive",
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(FusionError::invalid_config(
                "camera.width",
                "image size must be non-zero",
            ));
        }
        Ok(())
    }

    /// Pixel coordinates of a camera-frame point, `None` when it is behind
    /// the camera or outside the image.
    pub fn project(&self, p: &Point3<f64>) -> Option<(f64, f64)> {
        if !(p.z > 0.0) {
            return None;
        }
        let u = self.fx * p.x / p.z + self.cx;
        let v = self.fy * p.y / p.z + self.cy;
        let inside = u >= 0.0 && v >= 0.0 && u < self.width as f64 && v < self.height as f64;
        inside.then_some((u, v))
    }

    /// Camera-frame point at `depth` along the ray through pixel `(u, v)`.
    pub fn unproject(&self, u: f64, v: f64, depth: f64) -> Point3<f64> {
        Point3::new(
            (u - self.cx) / self.fx * depth,
            (v - self.cy) / self.fy * depth,
            depth,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_project_unproject() {
        let cam = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        let p = Point3::new(0.05, -0.02, 0.4);
        let (u, v) = cam.project(&p).unwrap();
        assert_relative_eq!(cam.unproject(u, v, 0.4), p, epsilon = 1e-12);
    }

    #[test]
    fn test_project_rejects_outside() {
        let cam = CameraIntrinsics::from_fov(640, 480, 1.0);
        assert!(cam.project(&Point3::new(0.0, 0.0, -1.0)).is_none());
        assert!(cam.project(&Point3::new(10.0, 0.0, 1.0)).is_none());
        assert!(cam.project(&Point3::new(0.0, 0.0, 1.0)).is_some());
        assert!(cam.validate().is_ok());
        assert!(CameraIntrinsics::new(0.0, 1.0, 0.0, 0.0, 1, 1).validate().is_err());
    }
}
