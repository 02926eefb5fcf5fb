//! Drives the photo capture cycle, independent of receive timing.

use crate::{
    error::{Error, Result},
    protocol::{FrameMessage, Pose},
    session::SessionHandle,
};
use async_std::task;
use log::{info, warn};
use std::{future::Future, time::Duration};

/// One captured photo with the pose it was taken at.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub image: Vec<u8>,
    pub pose: Pose,
}

/// The device camera collaborator.
pub trait FrameSource {
    /// Captures one photo together with its pose, or fails with
    /// [`Error::CaptureUnavailable`] when the pose cannot be obtained.
    fn capture(&mut self) -> impl Future<Output = Result<CapturedFrame>> + Send;
}

/// Runs the capture cycle until the session stops streaming: capture,
/// encode, hand off to the session's outbound path, capture again. The
/// cycle never waits for the previous frame's send to complete; the
/// session's in-flight guard drops frames the network cannot keep up with,
/// and `min_interval` is the only rate control.
pub async fn run<S>(mut source: S, handle: SessionHandle, min_interval: Duration)
where
    S: FrameSource,
{
    info!("capture loop started");

    while handle.is_streaming() {
        let frame = match capture_with_retry(&mut source, &handle).await {
            Some(frame) => frame,
            None => break,
        };

        handle.send_frame(FrameMessage {
            image: frame.image,
            pose: frame.pose,
        });

        task::sleep(min_interval).await;
    }

    info!("capture loop stopped");
}

/// A photo without a valid paired pose is never sent: on
/// `CaptureUnavailable` the same photo request is retried instead of
/// being skipped. Other capture failures tear the session down.
async fn capture_with_retry<S>(source: &mut S, handle: &SessionHandle) -> Option<CapturedFrame>
where
    S: FrameSource,
{
    loop {
        if !handle.is_streaming() {
            return None;
        }
        match source.capture().await {
            Ok(frame) => return Some(frame),
            Err(Error::CaptureUnavailable(reason)) => {
                warn!("capture unavailable ({}); retrying", reason);
            }
            Err(err) => {
                handle.fail(err);
                return None;
            }
        }
    }
}
