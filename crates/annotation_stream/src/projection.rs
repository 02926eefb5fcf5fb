//! Back-projection from pixel coordinates to world-space rays.

use nalgebra as na;

/// Pixel dimensions of the capture camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraResolution {
    pub width: u32,
    pub height: u32,
}

/// A world-space ray with a unit direction, so that
/// [`point_at`](WorldRay::point_at) walks whole distance units.
#[derive(Debug, Clone, Copy)]
pub struct WorldRay {
    pub origin: na::Point3<f32>,
    pub direction: na::Vector3<f32>,
}

impl WorldRay {
    pub fn new(origin: na::Point3<f32>, direction: na::Vector3<f32>) -> Self {
        Self {
            origin,
            direction: direction.normalize(),
        }
    }

    /// The point `distance` units along the ray.
    pub fn point_at(&self, distance: f32) -> na::Point3<f32> {
        self.origin + self.direction * distance
    }

    /// True when the direction collapsed to zero or went non-finite, which
    /// happens when [`unproject`] was fed a degenerate projection matrix.
    pub fn is_degenerate(&self) -> bool {
        let norm = self.direction.norm();
        !norm.is_finite() || norm == 0.0
    }
}

/// Analytic inverse of a perspective projection for one normalized device
/// coordinate. Solves camera-space z from row 2, then y from row 1, then x
/// from row 0, relying on the diagonal-dominant shape of a standard
/// perspective matrix rather than a general 4x4 inverse.
///
/// A matrix without that shape (zero diagonal entries) silently yields
/// non-finite components; check the resulting ray with
/// [`WorldRay::is_degenerate`].
pub fn unproject(projection: &na::Matrix4<f32>, ndc: &na::Point3<f32>) -> na::Point3<f32> {
    let z = ndc.z / projection[(2, 2)];
    let y = (ndc.y - z * projection[(1, 2)]) / projection[(1, 1)];
    let x = (ndc.x - z * projection[(0, 2)]) / projection[(0, 0)];
    na::Point3::new(x, y, z)
}

/// Maps a pixel coordinate to the world-space ray leaving the camera through
/// it. The single reusable primitive of the placement geometry: box centers
/// and corners all go through here.
pub fn pixel_to_world_ray(
    x: i32,
    y: i32,
    resolution: CameraResolution,
    projection: &na::Matrix4<f32>,
    camera_to_world: &na::Matrix4<f32>,
) -> WorldRay {
    // Pixel to [-1, 1] normalized device coordinates.
    let zero_to_one = na::Vector2::new(
        x as f32 / resolution.width as f32,
        y as f32 / resolution.height as f32,
    );
    let ndc = zero_to_one * 2.0 - na::Vector2::new(1.0, 1.0);

    // Camera-space point on the z = 1 slice of the frustum.
    let camera_point = unproject(projection, &na::Point3::new(ndc.x, ndc.y, 1.0));

    // Camera origin and that point, both in world space.
    let world_origin = camera_to_world.transform_point(&na::Point3::origin());
    let world_point = camera_to_world.transform_point(&camera_point);

    WorldRay::new(world_origin, world_point - world_origin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra as na;

    const RESOLUTION: CameraResolution = CameraResolution {
        width: 1280,
        height: 720,
    };

    fn sample_projection() -> na::Matrix4<f32> {
        na::Matrix4::new(
            2.0, 0.0, 0.0, 0.0, //
            0.0, 3.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 1.0, 0.0,
        )
    }

    #[test]
    fn unproject_solves_diagonal_mapping() {
        let point = unproject(&sample_projection(), &na::Point3::new(0.5, -0.6, 1.0));
        assert!((point.x - 0.25).abs() < 1e-6);
        assert!((point.y - -0.2).abs() < 1e-6);
        assert!((point.z - 1.0).abs() < 1e-6);
    }

    #[test]
    fn unproject_honors_off_diagonal_z_terms() {
        let mut projection = sample_projection();
        projection[(0, 2)] = 0.1;
        projection[(1, 2)] = -0.2;
        let point = unproject(&projection, &na::Point3::new(0.5, -0.6, 1.0));
        assert!((point.z - 1.0).abs() < 1e-6);
        assert!((point.y - (-0.6 + 0.2) / 3.0).abs() < 1e-6);
        assert!((point.x - (0.5 - 0.1) / 2.0).abs() < 1e-6);
    }

    #[test]
    fn degenerate_projection_yields_degenerate_ray() {
        let ray = pixel_to_world_ray(
            640,
            360,
            RESOLUTION,
            &na::Matrix4::zeros(),
            &na::Matrix4::identity(),
        );
        assert!(ray.is_degenerate());
    }

    #[test]
    fn center_pixel_looks_along_camera_axis() {
        let ray = pixel_to_world_ray(
            640,
            360,
            RESOLUTION,
            &sample_projection(),
            &na::Matrix4::identity(),
        );
        assert!(!ray.is_degenerate());
        assert!((ray.origin.coords.norm()).abs() < 1e-6);
        assert!((ray.direction - na::Vector3::z()).norm() < 1e-6);
    }

    #[test]
    fn ray_is_deterministic() {
        let camera_to_world = na::Matrix4::new_translation(&na::Vector3::new(1.0, 1.6, -2.0));
        let first = pixel_to_world_ray(100, 50, RESOLUTION, &sample_projection(), &camera_to_world);
        let second =
            pixel_to_world_ray(100, 50, RESOLUTION, &sample_projection(), &camera_to_world);
        assert_eq!(first.origin, second.origin);
        assert_eq!(first.direction, second.direction);
    }

    #[test]
    fn camera_translation_moves_ray_origin() {
        let camera_to_world = na::Matrix4::new_translation(&na::Vector3::new(1.0, 1.6, -2.0));
        let ray = pixel_to_world_ray(640, 360, RESOLUTION, &sample_projection(), &camera_to_world);
        assert!((ray.origin - na::Point3::new(1.0, 1.6, -2.0)).norm() < 1e-6);
    }

    #[test]
    fn point_at_walks_unit_distances() {
        let ray = WorldRay::new(na::Point3::origin(), na::Vector3::new(0.0, 0.0, 10.0));
        let point = ray.point_at(2.0);
        assert!((point - na::Point3::new(0.0, 0.0, 2.0)).norm() < 1e-6);
    }
}
