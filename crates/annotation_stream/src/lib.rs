//! Client core for live object annotation: streams captured camera frames
//! to a remote inference backend over one persistent socket, decodes the
//! returned bounding-box batches, and back-projects each box into a world
//! placement for the rendering side to display.
//!
//! The capture cycle, the outbound send path and the inbound
//! header/body cycle all run independently; they meet only at the
//! connection session, which owns the socket and the failure handling.

pub mod capture;
pub mod error;
pub mod message;
pub mod placement;
pub mod projection;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};
