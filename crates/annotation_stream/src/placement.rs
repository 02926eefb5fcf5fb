//! Projects decoded detections into world-space placements.
//!
//! Runs on a dedicated blocking thread that exclusively owns the annotation
//! sink: every batch replaces the previous placements, and no other context
//! mutates them. The receive loop reaches this thread only through a bounded
//! channel.

use crate::{
    message::DetectionBatch,
    projection::{pixel_to_world_ray, CameraResolution, WorldRay},
    protocol::{DetectionRecord, Pose},
};
use async_std::task::{spawn_blocking, JoinHandle};
use log::{debug, info};
use nalgebra as na;

/// Divisor applied to the box extent so the marker sits inside the
/// detected outline.
const VISUAL_MARGIN: f32 = 1.8;
/// Divisor deriving the label text scale from the box extent.
const TEXT_SCALE_DIVISOR: f32 = 14.0;
/// Smallest usable text scale per axis.
const MIN_TEXT_SCALE: f32 = 0.05;
/// Marker thickness along the viewing axis.
const ANNOTATION_DEPTH: f32 = 0.1;

/// Nearest surface hit by a scene ray.
#[derive(Debug, Clone, Copy)]
pub struct RayHit {
    pub point: na::Point3<f32>,
    pub distance: f32,
}

/// Ray-vs-scene-geometry hit testing, supplied by the rendering side.
pub trait SceneRaycaster {
    /// The nearest surface point along `ray`, or `None` when the ray
    /// escapes the scene.
    fn cast(&self, ray: &WorldRay) -> Option<RayHit>;
}

/// Consumer of placement commands, supplied by the rendering side. The
/// sink owns the placed annotation collection; the engine only tells it
/// when to replace and when to drop everything.
pub trait AnnotationSink {
    fn clear(&mut self);
    fn place(&mut self, command: PlacementCommand);
}

/// A fully resolved world placement for one detection.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementCommand {
    pub position: na::Point3<f32>,
    pub rotation: na::UnitQuaternion<f32>,
    pub scale: na::Vector3<f32>,
    pub text_scale: na::Vector3<f32>,
    pub color: na::Point3<f32>,
    pub label: String,
}

/// Back-projects detection batches into placements.
pub struct PlacementEngine<R, S> {
    resolution: CameraResolution,
    raycaster: R,
    sink: S,
}

impl<R, S> PlacementEngine<R, S>
where
    R: SceneRaycaster,
    S: AnnotationSink,
{
    pub fn new(resolution: CameraResolution, raycaster: R, sink: S) -> Self {
        Self {
            resolution,
            raycaster,
            sink,
        }
    }

    /// Replaces the previous batch's placements with this batch's.
    pub fn process_batch(&mut self, batch: &DetectionBatch) {
        self.sink.clear();

        let mut placed = 0;
        for record in &batch.records {
            if let Some(command) = self.place_record(&batch.pose, record) {
                self.sink.place(command);
                placed += 1;
            }
        }
        info!("placed {}/{} detections", placed, batch.records.len());
    }

    /// Drops every placement, e.g. on session teardown.
    pub fn clear(&mut self) {
        self.sink.clear();
    }

    fn place_record(&self, pose: &Pose, record: &DetectionRecord) -> Option<PlacementCommand> {
        let height = self.resolution.height as i32;

        // Wire coordinates are y-down; flip against the camera resolution
        // height into the y-up space the rays live in.
        let top = height - record.top;
        let bottom = height - record.bottom;

        let center_ray = self.pixel_ray(
            (record.left + record.right) / 2,
            (top + bottom) / 2,
            pose,
        );
        let hit = match self.raycaster.cast(&center_ray) {
            Some(hit) => hit,
            None => {
                debug!("center ray for '{}' missed the scene; discarded", record.label);
                return None;
            }
        };

        // Corner rays are evaluated at the center hit's distance instead of
        // being intersected independently, so corners that graze or miss
        // geometry the center ray hit still contribute a consistent extent.
        let top_left = self.pixel_ray(record.left, top, pose);
        let top_right = self.pixel_ray(record.right, top, pose);
        let bottom_left = self.pixel_ray(record.left, bottom, pose);

        let width = na::distance(
            &top_left.point_at(hit.distance),
            &top_right.point_at(hit.distance),
        );
        let box_height = na::distance(
            &top_left.point_at(hit.distance),
            &bottom_left.point_at(hit.distance),
        );

        Some(PlacementCommand {
            position: hit.point,
            rotation: facing_rotation(&pose.camera_to_world),
            scale: na::Vector3::new(
                width / VISUAL_MARGIN,
                box_height / VISUAL_MARGIN,
                ANNOTATION_DEPTH,
            ),
            text_scale: na::Vector3::new(
                (width / TEXT_SCALE_DIVISOR).max(MIN_TEXT_SCALE),
                (box_height / TEXT_SCALE_DIVISOR).max(MIN_TEXT_SCALE),
                ANNOTATION_DEPTH,
            ),
            color: na::Point3::new(
                record.red as f32 / 255.0,
                record.green as f32 / 255.0,
                record.blue as f32 / 255.0,
            ),
            label: record.label.clone(),
        })
    }

    fn pixel_ray(&self, x: i32, y: i32, pose: &Pose) -> WorldRay {
        pixel_to_world_ray(
            x,
            y,
            self.resolution,
            &pose.projection,
            &pose.camera_to_world,
        )
    }
}

/// Rotation facing the viewer: looks along the capture pose's forward axis
/// with world up. The camera looks down -Z in camera space, so the forward
/// axis is the negated third column of the camera-to-world matrix.
fn facing_rotation(camera_to_world: &na::Matrix4<f32>) -> na::UnitQuaternion<f32> {
    let column = camera_to_world.column(2);
    let forward = -na::Vector3::new(column[0], column[1], column[2]);
    na::UnitQuaternion::face_towards(&forward, &na::Vector3::y())
}

/// Spawns the single-threaded consumption context: a blocking worker that
/// drains `batch_rx` into the engine until the sending side goes away, then
/// clears the sink.
pub fn start<R, S>(
    batch_rx: flume::Receiver<DetectionBatch>,
    resolution: CameraResolution,
    raycaster: R,
    sink: S,
) -> JoinHandle<()>
where
    R: SceneRaycaster + Send + 'static,
    S: AnnotationSink + Send + 'static,
{
    spawn_blocking(move || {
        let mut engine = PlacementEngine::new(resolution, raycaster, sink);
        while let Ok(batch) = batch_rx.recv() {
            engine.process_batch(&batch);
        }
        // Channel closed: the session tore down. Leave nothing on screen.
        engine.clear();
    })
}
