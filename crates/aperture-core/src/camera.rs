use nalgebra::Vector2;

/// Error types for camera model handling.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// The camera model name is not known.
    #[error("camera model does not exist: {0}")]
    UnknownModel(String),

    /// The number of parameters does not match the camera model.
    #[error("invalid number of camera parameters: expected {expected}, got {actual}")]
    InvalidNumParams {
        /// Parameter count required by the model.
        expected: usize,
        /// Parameter count that was provided.
        actual: usize,
    },

    /// A parameter value is outside its valid range.
    #[error("invalid camera parameters: {0}")]
    InvalidParams(String),

    /// A comma-separated parameter list failed to parse.
    #[error("failed to parse camera parameter {0:?}")]
    ParseParam(String),
}

/// Identifiers of the supported camera models.
///
/// The numeric values and names match the on-disk sparse model format, so
/// reconstructions written by this crate interoperate with external tools
/// that use the same convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CameraModelId {
    /// f, cx, cy
    SimplePinhole = 0,
    /// fx, fy, cx, cy
    Pinhole = 1,
    /// f, cx, cy, k
    SimpleRadial = 2,
    /// f, cx, cy, k1, k2
    Radial = 3,
    /// fx, fy, cx, cy, k1, k2, p1, p2
    OpenCv = 4,
    /// fx, fy, cx, cy, k1, k2, k3, k4
    OpenCvFisheye = 5,
}

impl CameraModelId {
    /// Looks up a model by its format name.
    pub fn from_name(name: &str) -> Result<Self, CameraError> {
        match name {
            "SIMPLE_PINHOLE" => Ok(Self::SimplePinhole),
            "PINHOLE" => Ok(Self::Pinhole),
            "SIMPLE_RADIAL" => Ok(Self::SimpleRadial),
            "RADIAL" => Ok(Self::Radial),
            "OPENCV" => Ok(Self::OpenCv),
            "OPENCV_FISHEYE" => Ok(Self::OpenCvFisheye),
            _ => Err(CameraError::UnknownModel(name.to_string())),
        }
    }

    /// Looks up a model by its numeric id.
    pub fn from_id(id: i32) -> Result<Self, CameraError> {
        match id {
            0 => Ok(Self::SimplePinhole),
            1 => Ok(Self::Pinhole),
            2 => Ok(Self::SimpleRadial),
            3 => Ok(Self::Radial),
            4 => Ok(Self::OpenCv),
            5 => Ok(Self::OpenCvFisheye),
            _ => Err(CameraError::UnknownModel(format!("model id {}", id))),
        }
    }

    /// Returns the format name of the model.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SimplePinhole => "SIMPLE_PINHOLE",
            Self::Pinhole => "PINHOLE",
            Self::SimpleRadial => "SIMPLE_RADIAL",
            Self::Radial => "RADIAL",
            Self::OpenCv => "OPENCV",
            Self::OpenCvFisheye => "OPENCV_FISHEYE",
        }
    }

    /// Returns the number of parameters the model expects.
    pub fn num_params(&self) -> usize {
        match self {
            Self::SimplePinhole => 3,
            Self::Pinhole => 4,
            Self::SimpleRadial => 4,
            Self::Radial => 5,
            Self::OpenCv => 8,
            Self::OpenCvFisheye => 8,
        }
    }

    /// True if `name` refers to a known camera model.
    pub fn exists(name: &str) -> bool {
        Self::from_name(name).is_ok()
    }
}

/// A camera with a model, image dimensions and intrinsic parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    /// Unique camera id within a reconstruction or database.
    pub camera_id: u32,
    /// Camera model.
    pub model_id: CameraModelId,
    /// Sensor width in pixels.
    pub width: usize,
    /// Sensor height in pixels.
    pub height: usize,
    /// Intrinsic parameters, ordered as documented on [`CameraModelId`].
    pub params: Vec<f64>,
}

impl Camera {
    /// Creates a camera with default intrinsics derived from the image size.
    ///
    /// The focal length is initialized to `focal_factor * max(width, height)`
    /// and the principal point to the image center. Distortion parameters
    /// start at zero.
    pub fn with_default_params(
        camera_id: u32,
        model_id: CameraModelId,
        width: usize,
        height: usize,
        focal_factor: f64,
    ) -> Self {
        let f = focal_factor * width.max(height) as f64;
        let (cx, cy) = (width as f64 / 2.0, height as f64 / 2.0);
        let params = match model_id {
            CameraModelId::SimplePinhole => vec![f, cx, cy],
            CameraModelId::Pinhole => vec![f, f, cx, cy],
            CameraModelId::SimpleRadial => vec![f, cx, cy, 0.0],
            CameraModelId::Radial => vec![f, cx, cy, 0.0, 0.0],
            CameraModelId::OpenCv | CameraModelId::OpenCvFisheye => {
                vec![f, f, cx, cy, 0.0, 0.0, 0.0, 0.0]
            }
        };
        Self {
            camera_id,
            model_id,
            width,
            height,
            params,
        }
    }

    /// Checks that the parameter vector matches the model and that the focal
    /// lengths are positive.
    pub fn verify_params(&self) -> Result<(), CameraError> {
        if self.params.len() != self.model_id.num_params() {
            return Err(CameraError::InvalidNumParams {
                expected: self.model_id.num_params(),
                actual: self.params.len(),
            });
        }
        for &i in self.focal_idxs() {
            if self.params[i] <= 0.0 {
                return Err(CameraError::InvalidParams(format!(
                    "focal length must be positive, got {}",
                    self.params[i]
                )));
            }
        }
        Ok(())
    }

    fn focal_idxs(&self) -> &'static [usize] {
        match self.model_id {
            CameraModelId::SimplePinhole | CameraModelId::SimpleRadial | CameraModelId::Radial => {
                &[0]
            }
            CameraModelId::Pinhole | CameraModelId::OpenCv | CameraModelId::OpenCvFisheye => &[0, 1],
        }
    }

    /// Focal lengths (fx, fy). Single-focal models return the same value twice.
    pub fn focal(&self) -> (f64, f64) {
        match self.model_id {
            CameraModelId::SimplePinhole | CameraModelId::SimpleRadial | CameraModelId::Radial => {
                (self.params[0], self.params[0])
            }
            CameraModelId::Pinhole | CameraModelId::OpenCv | CameraModelId::OpenCvFisheye => {
                (self.params[0], self.params[1])
            }
        }
    }

    /// Mean of fx and fy.
    pub fn mean_focal_length(&self) -> f64 {
        let (fx, fy) = self.focal();
        0.5 * (fx + fy)
    }

    /// Principal point (cx, cy).
    pub fn principal_point(&self) -> (f64, f64) {
        match self.model_id {
            CameraModelId::SimplePinhole | CameraModelId::SimpleRadial | CameraModelId::Radial => {
                (self.params[1], self.params[2])
            }
            CameraModelId::Pinhole | CameraModelId::OpenCv | CameraModelId::OpenCvFisheye => {
                (self.params[2], self.params[3])
            }
        }
    }

    /// Applies the model distortion to normalized camera coordinates.
    pub fn distort(&self, u: f64, v: f64) -> (f64, f64) {
        match self.model_id {
            CameraModelId::SimplePinhole | CameraModelId::Pinhole => (u, v),
            CameraModelId::SimpleRadial => {
                let k = self.params[3];
                let r2 = u * u + v * v;
                let radial = 1.0 + k * r2;
                (u * radial, v * radial)
            }
            CameraModelId::Radial => {
                let (k1, k2) = (self.params[3], self.params[4]);
                let r2 = u * u + v * v;
                let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
                (u * radial, v * radial)
            }
            CameraModelId::OpenCv => {
                let (k1, k2, p1, p2) = (
                    self.params[4],
                    self.params[5],
                    self.params[6],
                    self.params[7],
                );
                let r2 = u * u + v * v;
                let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
                let du = u * radial + 2.0 * p1 * u * v + p2 * (r2 + 2.0 * u * u);
                let dv = v * radial + p1 * (r2 + 2.0 * v * v) + 2.0 * p2 * u * v;
                (du, dv)
            }
            CameraModelId::OpenCvFisheye => {
                let (k1, k2, k3, k4) = (
                    self.params[4],
                    self.params[5],
                    self.params[6],
                    self.params[7],
                );
                let r = (u * u + v * v).sqrt();
                if r < 1e-12 {
                    return (u, v);
                }
                let theta = r.atan();
                let theta2 = theta * theta;
                let theta_d =
                    theta * (1.0 + theta2 * (k1 + theta2 * (k2 + theta2 * (k3 + theta2 * k4))));
                let scale = theta_d / r;
                (u * scale, v * scale)
            }
        }
    }

    /// Inverts the model distortion with a damped Newton iteration on a
    /// numerical 2x2 Jacobian. Returns the undistorted normalized coordinates.
    pub fn undistort(&self, du: f64, dv: f64) -> (f64, f64) {
        match self.model_id {
            CameraModelId::SimplePinhole | CameraModelId::Pinhole => (du, dv),
            _ => {
                const MAX_ITERS: usize = 100;
                const EPS: f64 = 1e-10;
                // Numerical differentiation step.
                const STEP: f64 = 1e-6;

                let target = Vector2::new(du, dv);
                let mut x = target;
                for _ in 0..MAX_ITERS {
                    let (fx, fy) = self.distort(x.x, x.y);
                    let residual = Vector2::new(fx, fy) - target;
                    if residual.norm_squared() < EPS * EPS {
                        break;
                    }
                    let (fxp, fyp) = self.distort(x.x + STEP, x.y);
                    let (fxq, fyq) = self.distort(x.x, x.y + STEP);
                    // J = d distort / d x, columns from forward differences.
                    let j00 = (fxp - fx) / STEP;
                    let j10 = (fyp - fy) / STEP;
                    let j01 = (fxq - fx) / STEP;
                    let j11 = (fyq - fy) / STEP;
                    let det = j00 * j11 - j01 * j10;
                    if det.abs() < 1e-14 {
                        break;
                    }
                    let dx = (j11 * residual.x - j01 * residual.y) / det;
                    let dy = (-j10 * residual.x + j00 * residual.y) / det;
                    x.x -= dx;
                    x.y -= dy;
                }
                (x.x, x.y)
            }
        }
    }

    /// Projects normalized camera coordinates to a pixel position.
    pub fn img_from_cam(&self, u: f64, v: f64) -> (f64, f64) {
        let (du, dv) = self.distort(u, v);
        let (fx, fy) = self.focal();
        let (cx, cy) = self.principal_point();
        (fx * du + cx, fy * dv + cy)
    }

    /// Lifts a pixel position to normalized camera coordinates (z = 1 plane).
    pub fn cam_from_img(&self, x: f64, y: f64) -> (f64, f64) {
        let (fx, fy) = self.focal();
        let (cx, cy) = self.principal_point();
        self.undistort((x - cx) / fx, (y - cy) / fy)
    }

    /// Projects a point in camera coordinates to a pixel position.
    ///
    /// Returns `None` for points at or behind the camera plane.
    pub fn project(&self, point: &[f64; 3]) -> Option<(f64, f64)> {
        if point[2] <= f64::EPSILON {
            return None;
        }
        Some(self.img_from_cam(point[0] / point[2], point[1] / point[2]))
    }
}

/// Parses a comma-separated list of floating point camera parameters.
///
/// Whitespace around entries is ignored; an empty string yields an empty list.
pub fn params_from_csv(csv: &str) -> Result<Vec<f64>, CameraError> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>()
                .map_err(|_| CameraError::ParseParam(s.to_string()))
        })
        .collect()
}

/// Verifies a camera model name together with a CSV parameter string.
///
/// An empty parameter string passes (defaults are derived later from the
/// image size); a non-empty string must parse and match the model's
/// parameter count.
pub fn verify_camera_params(model_name: &str, params_csv: &str) -> Result<(), CameraError> {
    let model_id = CameraModelId::from_name(model_name)?;
    let params = params_from_csv(params_csv)?;
    if !params.is_empty() && params.len() != model_id.num_params() {
        return Err(CameraError::InvalidNumParams {
            expected: model_id.num_params(),
            actual: params.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn roundtrip(camera: &Camera, x: f64, y: f64) {
        let (u, v) = camera.cam_from_img(x, y);
        let (xr, yr) = camera.img_from_cam(u, v);
        assert_relative_eq!(x, xr, epsilon = 1e-6);
        assert_relative_eq!(y, yr, epsilon = 1e-6);
    }

    #[test]
    fn test_model_name_lookup() {
        assert_eq!(
            CameraModelId::from_name("SIMPLE_RADIAL").unwrap(),
            CameraModelId::SimpleRadial
        );
        assert!(CameraModelId::from_name("FISHEYE_42").is_err());
        assert!(CameraModelId::exists("OPENCV"));
        assert_eq!(CameraModelId::OpenCvFisheye.name(), "OPENCV_FISHEYE");
    }

    #[test]
    fn test_model_id_roundtrip() {
        for id in 0..6 {
            let model = CameraModelId::from_id(id).unwrap();
            assert_eq!(model as i32, id);
        }
        assert!(CameraModelId::from_id(42).is_err());
    }

    #[test]
    fn test_default_params() {
        let camera = Camera::with_default_params(1, CameraModelId::SimpleRadial, 640, 480, 1.2);
        assert_eq!(camera.params.len(), 4);
        assert_relative_eq!(camera.params[0], 1.2 * 640.0);
        assert_relative_eq!(camera.params[1], 320.0);
        assert_relative_eq!(camera.params[2], 240.0);
        camera.verify_params().unwrap();
    }

    #[test]
    fn test_verify_params_rejects_wrong_count() {
        let camera = Camera {
            camera_id: 1,
            model_id: CameraModelId::Pinhole,
            width: 640,
            height: 480,
            params: vec![500.0, 320.0, 240.0],
        };
        assert!(matches!(
            camera.verify_params(),
            Err(CameraError::InvalidNumParams {
                expected: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_verify_params_rejects_negative_focal() {
        let camera = Camera {
            camera_id: 1,
            model_id: CameraModelId::SimplePinhole,
            width: 640,
            height: 480,
            params: vec![-500.0, 320.0, 240.0],
        };
        assert!(camera.verify_params().is_err());
    }

    #[test]
    fn test_pinhole_projection_roundtrip() {
        let camera = Camera {
            camera_id: 1,
            model_id: CameraModelId::Pinhole,
            width: 640,
            height: 480,
            params: vec![500.0, 510.0, 320.0, 240.0],
        };
        roundtrip(&camera, 100.5, 200.25);
        roundtrip(&camera, 0.0, 0.0);
    }

    #[test]
    fn test_simple_radial_roundtrip() {
        let camera = Camera {
            camera_id: 1,
            model_id: CameraModelId::SimpleRadial,
            width: 640,
            height: 480,
            params: vec![500.0, 320.0, 240.0, 0.08],
        };
        roundtrip(&camera, 50.0, 400.0);
    }

    #[test]
    fn test_radial_roundtrip() {
        let camera = Camera {
            camera_id: 1,
            model_id: CameraModelId::Radial,
            width: 640,
            height: 480,
            params: vec![500.0, 320.0, 240.0, 0.05, -0.01],
        };
        roundtrip(&camera, 610.0, 20.0);
    }

    #[test]
    fn test_opencv_roundtrip() {
        let camera = Camera {
            camera_id: 1,
            model_id: CameraModelId::OpenCv,
            width: 640,
            height: 480,
            params: vec![480.0, 490.0, 320.0, 240.0, 0.05, -0.02, 0.001, -0.002],
        };
        roundtrip(&camera, 123.0, 321.0);
    }

    #[test]
    fn test_fisheye_roundtrip() {
        let camera = Camera {
            camera_id: 1,
            model_id: CameraModelId::OpenCvFisheye,
            width: 640,
            height: 480,
            params: vec![300.0, 300.0, 320.0, 240.0, 0.02, -0.005, 0.001, 0.0],
        };
        roundtrip(&camera, 500.0, 100.0);
    }

    #[test]
    fn test_zero_distortion_is_identity() {
        let camera = Camera {
            camera_id: 1,
            model_id: CameraModelId::SimpleRadial,
            width: 640,
            height: 480,
            params: vec![500.0, 320.0, 240.0, 0.0],
        };
        let (u, v) = camera.undistort(0.25, -0.125);
        assert_relative_eq!(u, 0.25, epsilon = 1e-12);
        assert_relative_eq!(v, -0.125, epsilon = 1e-12);
    }

    #[test]
    fn test_project_behind_camera() {
        let camera = Camera::with_default_params(1, CameraModelId::Pinhole, 640, 480, 1.0);
        assert!(camera.project(&[0.0, 0.0, -1.0]).is_none());
        assert!(camera.project(&[0.1, 0.2, 2.0]).is_some());
    }

    #[test]
    fn test_params_from_csv() {
        assert_eq!(
            params_from_csv("500, 320,240 , 0.1").unwrap(),
            vec![500.0, 320.0, 240.0, 0.1]
        );
        assert!(params_from_csv("").unwrap().is_empty());
        assert!(params_from_csv("500,abc").is_err());
    }

    #[test]
    fn test_verify_camera_params() {
        verify_camera_params("SIMPLE_RADIAL", "500,320,240,0.1").unwrap();
        verify_camera_params("SIMPLE_RADIAL", "").unwrap();
        assert!(verify_camera_params("SIMPLE_RADIAL", "500,320").is_err());
        assert!(verify_camera_params("NO_SUCH_MODEL", "").is_err());
    }
}
