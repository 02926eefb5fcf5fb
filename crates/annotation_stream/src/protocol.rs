//! Wire format shared with the inference backend.
//!
//! The channel carries exactly one message shape in each direction, so no
//! type tags and no checksums are exchanged. Outbound: a length-prefixed
//! image followed by the capture pose. Inbound: a fixed-size detection
//! header followed by a body whose length the header announces, which lets
//! the receiver issue one exact-length read per stage.
//!
//! All multi-byte fields are big-endian. Matrices are 16 f32 values in
//! row-major order.

use crate::error::{Error, Result};
use nalgebra as na;

/// Encoded size of a [`DetectionHeader`]: 32 f32 + i32 + u32.
pub const HEADER_LEN: usize = 136;

/// Camera-to-world and projection matrices captured together at
/// photo-capture time. Immutable once captured; the backend echoes the pair
/// back in the header of the matching detection batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub camera_to_world: na::Matrix4<f32>,
    pub projection: na::Matrix4<f32>,
}

/// One outbound message: encoded image bytes plus the pose they were
/// captured at.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMessage {
    pub image: Vec<u8>,
    pub pose: Pose,
}

/// Fixed-size header preceding every detection body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionHeader {
    pub pose: Pose,
    pub count: i32,
    pub total_body_size: u32,
}

/// One detected object. Pixel coordinates are y-down image space; the
/// placement engine flips them against the camera resolution height.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRecord {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub red: i32,
    pub green: i32,
    pub blue: i32,
    pub label: String,
}

impl DetectionRecord {
    /// Encoded size of this record: 7 i32 fields, the label length prefix,
    /// and the label bytes.
    pub fn encoded_len(&self) -> usize {
        7 * 4 + 4 + self.label.len()
    }
}

/// Serializes an outbound frame message.
pub fn encode_frame(frame: &FrameMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + frame.image.len() + 128);
    buf.extend_from_slice(&(frame.image.len() as i32).to_be_bytes());
    buf.extend_from_slice(&frame.image);
    put_matrix(&mut buf, &frame.pose.camera_to_world);
    put_matrix(&mut buf, &frame.pose.projection);
    buf
}

/// Deserializes a frame message. This is the receiving half the backend
/// runs; the client keeps it for the mock server and round-trip tests.
pub fn decode_frame(buf: &[u8]) -> Result<FrameMessage> {
    let mut reader = ByteReader::new(buf);
    let len = reader.get_i32()?;
    let len = usize::try_from(len)
        .map_err(|_| Error::InvalidEncoding(format!("negative frame length {}", len)))?;
    let image = reader.take(len)?.to_vec();
    let camera_to_world = get_matrix(&mut reader)?;
    let projection = get_matrix(&mut reader)?;
    Ok(FrameMessage {
        image,
        pose: Pose {
            camera_to_world,
            projection,
        },
    })
}

/// Serializes a detection header into its fixed 136-byte form.
pub fn encode_header(header: &DetectionHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    put_matrix(&mut buf, &header.pose.camera_to_world);
    put_matrix(&mut buf, &header.pose.projection);
    buf.extend_from_slice(&header.count.to_be_bytes());
    buf.extend_from_slice(&header.total_body_size.to_be_bytes());
    buf
}

/// Deserializes the fixed 136-byte detection header.
pub fn decode_header(buf: &[u8]) -> Result<DetectionHeader> {
    if buf.len() < HEADER_LEN {
        return Err(Error::TruncatedRead {
            expected: HEADER_LEN,
            available: buf.len(),
        });
    }
    let mut reader = ByteReader::new(buf);
    let camera_to_world = get_matrix(&mut reader)?;
    let projection = get_matrix(&mut reader)?;
    let count = reader.get_i32()?;
    let total_body_size = reader.get_u32()?;
    Ok(DetectionHeader {
        pose: Pose {
            camera_to_world,
            projection,
        },
        count,
        total_body_size,
    })
}

/// Serializes one detection record.
pub fn encode_record(record: &DetectionRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(record.encoded_len());
    for field in [
        record.left,
        record.top,
        record.right,
        record.bottom,
        record.red,
        record.green,
        record.blue,
    ] {
        buf.extend_from_slice(&field.to_be_bytes());
    }
    buf.extend_from_slice(&(record.label.len() as u32).to_be_bytes());
    buf.extend_from_slice(record.label.as_bytes());
    buf
}

/// Deserializes a detection body: `count` back-to-back records filling the
/// buffer exactly. Leftover bytes mean the header's size and count disagree,
/// which invalidates the whole body.
pub fn decode_body(buf: &[u8], count: usize) -> Result<Vec<DetectionRecord>> {
    let mut reader = ByteReader::new(buf);
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        records.push(decode_record(&mut reader)?);
    }
    if reader.remaining() != 0 {
        return Err(Error::InvalidEncoding(format!(
            "{} trailing bytes after {} records",
            reader.remaining(),
            count
        )));
    }
    Ok(records)
}

fn decode_record(reader: &mut ByteReader) -> Result<DetectionRecord> {
    let left = reader.get_i32()?;
    let top = reader.get_i32()?;
    let right = reader.get_i32()?;
    let bottom = reader.get_i32()?;
    let red = reader.get_i32()?;
    let green = reader.get_i32()?;
    let blue = reader.get_i32()?;
    let label_len = reader.get_u32()? as usize;
    let label = String::from_utf8(reader.take(label_len)?.to_vec())?;
    Ok(DetectionRecord {
        left,
        top,
        right,
        bottom,
        red,
        green,
        blue,
        label,
    })
}

fn put_matrix(buf: &mut Vec<u8>, matrix: &na::Matrix4<f32>) {
    for i in 0..4 {
        for j in 0..4 {
            buf.extend_from_slice(&matrix[(i, j)].to_be_bytes());
        }
    }
}

fn get_matrix(reader: &mut ByteReader) -> Result<na::Matrix4<f32>> {
    let mut matrix = na::Matrix4::zeros();
    for i in 0..4 {
        for j in 0..4 {
            matrix[(i, j)] = reader.get_f32()?;
        }
    }
    Ok(matrix)
}

/// Cursor over a received byte buffer. Every read is length-checked so a
/// short buffer surfaces as `TruncatedRead` instead of a panic.
struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::TruncatedRead {
                expected: len,
                available: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn get_f32(&mut self) -> Result<f32> {
        Ok(f32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }
}
