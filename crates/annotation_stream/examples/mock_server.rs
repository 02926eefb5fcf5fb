//! Wire-compatible stand-in for the inference backend: accepts a client,
//! decodes its frame messages, and answers each frame with one canned
//! detection carrying the frame's own pose.

use annotation_stream::protocol::{self, DetectionHeader, DetectionRecord, FrameMessage};
use anyhow::Result;
use async_std::net::{TcpListener, TcpStream};
use clap::Parser;
use futures::prelude::*;
use std::net::SocketAddr;

pub const DEFAULT_ADDR: &str = "0.0.0.0:11000";

#[derive(Debug, Parser)]
struct Opts {
    #[clap(long, help = "Server bind address.")]
    pub addr: Option<SocketAddr>,
}

#[async_std::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    let addr = opts.addr.unwrap_or_else(|| DEFAULT_ADDR.parse().unwrap());
    let listener = TcpListener::bind(addr).await?;
    eprintln!("listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        eprintln!("client connected from {}", peer);
        if let Err(err) = serve(stream).await {
            eprintln!("client gone: {:#}", err);
        }
    }
}

async fn serve(mut stream: TcpStream) -> Result<()> {
    let mut frame_count = 0usize;

    loop {
        let frame = read_frame(&mut stream).await?;
        frame_count += 1;
        eprintln!("frame {}: {} bytes", frame_count, frame.image.len());

        // One detection in the lower middle of a 1280x720 frame.
        let record = DetectionRecord {
            left: 560,
            top: 400,
            right: 720,
            bottom: 560,
            red: 255,
            green: 0,
            blue: 0,
            label: "cat".to_string(),
        };
        let body = protocol::encode_record(&record);
        let header = DetectionHeader {
            pose: frame.pose,
            count: 1,
            total_body_size: body.len() as u32,
        };
        stream.write_all(&protocol::encode_header(&header)).await?;
        stream.write_all(&body).await?;
    }
}

async fn read_frame(stream: &mut TcpStream) -> Result<FrameMessage> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let image_len = usize::try_from(i32::from_be_bytes(len_buf))?;

    // The image is followed by the two 16-float pose matrices.
    let mut rest = vec![0u8; image_len + 128];
    stream.read_exact(&mut rest).await?;

    let mut message = len_buf.to_vec();
    message.extend_from_slice(&rest);
    Ok(protocol::decode_frame(&message)?)
}
