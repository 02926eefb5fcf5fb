//! Demo stand-ins for the device-side collaborators: the camera, the
//! scanned-room geometry, and the scene-graph annotation display.

use crate::rate_meter::RateMeter;
use annotation_stream::{
    capture::{CapturedFrame, FrameSource},
    error::Result,
    placement::{AnnotationSink, PlacementCommand, RayHit, SceneRaycaster},
    projection::WorldRay,
    protocol::Pose,
};
use log::info;
use nalgebra as na;
use std::{future::Future, sync::Arc};

/// Stand-in for the device camera: a fixed test image captured from a
/// standing-height pose tilted toward the floor.
pub struct SyntheticCamera {
    pose: Pose,
    image: Vec<u8>,
    meter: Arc<RateMeter>,
}

impl SyntheticCamera {
    pub fn new(resolution: (u32, u32), meter: Arc<RateMeter>) -> Self {
        let (width, height) = resolution;
        let aspect = width as f32 / height as f32;
        let projection =
            na::Perspective3::new(aspect, std::f32::consts::FRAC_PI_3, 0.25, 20.0).to_homogeneous();

        // Eye height, pitched down so rays through the lower image half
        // reach the ground plane.
        let camera_to_world = na::Isometry3::new(
            na::Vector3::new(0.0, 1.6, 0.0),
            na::Vector3::x() * -0.5,
        )
        .to_homogeneous();

        // Gradient bytes standing in for the camera's JPEG output.
        let image = (0..width * height / 64).map(|i| (i % 251) as u8).collect();

        Self {
            pose: Pose {
                camera_to_world,
                projection,
            },
            image,
            meter,
        }
    }
}

impl FrameSource for SyntheticCamera {
    fn capture(&mut self) -> impl Future<Output = Result<CapturedFrame>> + Send {
        self.meter.bump_frame();
        let frame = CapturedFrame {
            image: self.image.clone(),
            pose: self.pose,
        };
        async move { Ok(frame) }
    }
}

/// Horizontal plane at y = 0 standing in for the scanned room mesh.
pub struct GroundPlane {
    pub max_range: f32,
}

impl SceneRaycaster for GroundPlane {
    fn cast(&self, ray: &WorldRay) -> Option<RayHit> {
        if ray.is_degenerate() {
            return None;
        }
        let dy = ray.direction.y;
        if dy.abs() < 1e-6 {
            return None;
        }
        let distance = -ray.origin.y / dy;
        if distance <= 0.0 || distance > self.max_range {
            return None;
        }
        Some(RayHit {
            point: ray.point_at(distance),
            distance,
        })
    }
}

/// Stand-in for the scene graph: logs every placement instead of
/// instantiating one.
#[derive(Default)]
pub struct LoggingSink {
    placed: usize,
}

impl AnnotationSink for LoggingSink {
    fn clear(&mut self) {
        if self.placed > 0 {
            info!("cleared {} annotations", self.placed);
            self.placed = 0;
        }
    }

    fn place(&mut self, command: PlacementCommand) {
        self.placed += 1;
        info!(
            "'{}' at ({:.2}, {:.2}, {:.2}), scale {:.2} x {:.2}",
            command.label,
            command.position.x,
            command.position.y,
            command.position.z,
            command.scale.x,
            command.scale.y,
        );
    }
}
