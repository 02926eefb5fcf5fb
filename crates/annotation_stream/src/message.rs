use crate::{error::Error, protocol::DetectionRecord, protocol::Pose};

/// One decoded detection batch, sent from the receive loop to the
/// placement worker. The pose is the one embedded in the batch's header,
/// i.e. the pose of the frame the backend ran detection on.
#[derive(Debug)]
pub struct DetectionBatch {
    pub pose: Pose,
    pub records: Vec<DetectionRecord>,
}

/// Session notifications for the outer UI layer.
#[derive(Debug)]
pub enum SessionEvent {
    /// The session reached its terminal `Failed` state and tore down.
    /// Reconnection requires a fresh explicit connect; the UI is expected
    /// to re-prompt for a server address.
    ConnectionFailed(Error),
}
