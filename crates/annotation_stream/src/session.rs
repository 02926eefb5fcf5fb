//! The connection to the inference backend.
//!
//! One persistent stream socket carries a continuous stream of frames out
//! and a continuous stream of detection batches in. The two directions are
//! fully decoupled: sends never wait for a matching reply, and batches are
//! correlated to frames only by the pose echoed in each header.

use crate::{
    error::{Error, Result},
    message::{DetectionBatch, SessionEvent},
    protocol::{self, FrameMessage},
};
use async_std::{
    net::{TcpStream, ToSocketAddrs},
    task,
};
use futures::prelude::*;
use log::{debug, error, info};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::{
    net::{Shutdown, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering::SeqCst},
        Arc,
    },
};

/// Port the backend listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 11000;

/// Connection lifecycle. `Failed` is terminal and reachable from every
/// non-`Disconnected` state; leaving it requires a fresh
/// [`Session::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting,
    Ready,
    Streaming,
    Failed,
}

/// A connected, not yet streaming session.
#[derive(Debug)]
pub struct Session {
    stream: TcpStream,
}

impl Session {
    /// Resolves `host` and opens the connection. Resolution failures and
    /// dial failures (refused, unreachable, timed out) are distinct errors
    /// so the caller can report them separately.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        info!("connecting to {}:{}", host, port);

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .await
            .map_err(|_| Error::AddressResolution(host.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(Error::AddressResolution(host.to_string()));
        }

        let stream = TcpStream::connect(addrs.as_slice())
            .await
            .map_err(Error::Connection)?;
        info!("connected to {}", stream.peer_addr()?);

        Ok(Self { stream })
    }

    /// A connected session sits in `Ready` until [`start`](Self::start)
    /// moves it to `Streaming`.
    pub fn state(&self) -> SessionState {
        SessionState::Ready
    }

    /// Starts streaming: spawns the receive loop, which immediately issues
    /// the first header read. Returns the handle the capture loop sends
    /// frames through, the bounded channel of decoded detection batches,
    /// and the event channel the outer UI layer watches.
    pub fn start(
        self,
    ) -> (
        SessionHandle,
        flume::Receiver<DetectionBatch>,
        flume::Receiver<SessionEvent>,
    ) {
        let (batch_tx, batch_rx) = flume::bounded(2);
        let (event_tx, event_rx) = flume::bounded(2);

        let shared = Arc::new(Shared {
            stream: self.stream,
            state: AtomicU8::new(SessionState::Streaming as u8),
            sending: AtomicBool::new(false),
            event_tx,
        });
        info!("session streaming");

        task::spawn({
            let shared = shared.clone();
            async move {
                if let Err(err) = receive_loop(&shared, &batch_tx).await {
                    shared.fail(err);
                }
                // batch_tx drops here, which empties the placement side.
            }
        });

        (SessionHandle { shared }, batch_rx, event_rx)
    }
}

/// Cloneable handle to a streaming session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.is_streaming()
    }

    /// Hands one frame to the outbound path. At most one transmission is
    /// in flight at a time; a frame arriving while one is outstanding is
    /// dropped and logged, never queued. Returns whether the frame was
    /// accepted for transmission.
    pub fn send_frame(&self, frame: FrameMessage) -> bool {
        if !self.is_streaming() {
            debug!("frame dropped: session is not streaming");
            return false;
        }
        if self
            .shared
            .sending
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_err()
        {
            debug!("frame dropped: a send is already in flight");
            return false;
        }

        let bytes = protocol::encode_frame(&frame);
        let shared = self.shared.clone();
        task::spawn(async move {
            let mut stream = &shared.stream;
            let result = stream.write_all(&bytes).await;
            shared.sending.store(false, SeqCst);
            match result {
                Ok(()) => debug!("frame sent ({} bytes)", bytes.len()),
                Err(err) => shared.fail(Error::Transport(err)),
            }
        });
        true
    }

    /// Closes the connection. Idempotent: disconnecting an already-closed
    /// session is a no-op, not an error.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    pub(crate) fn fail(&self, err: Error) {
        self.shared.fail(err);
    }
}

#[derive(Debug)]
struct Shared {
    stream: TcpStream,
    state: AtomicU8,
    sending: AtomicBool,
    event_tx: flume::Sender<SessionEvent>,
}

impl Shared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(SeqCst)).unwrap()
    }

    fn is_streaming(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    /// The single funnel for every failure. The first signal wins and runs
    /// the one teardown; later signals, including completions of
    /// operations the teardown itself cancelled, are no-ops.
    fn fail(&self, err: Error) {
        let mut current = self.state.load(SeqCst);
        loop {
            match SessionState::from_u8(current).unwrap() {
                SessionState::Failed | SessionState::Disconnected => return,
                _ => {}
            }
            match self
                .state
                .compare_exchange(current, SessionState::Failed as u8, SeqCst, SeqCst)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        error!("session failed: {}", err);
        let _ = self.stream.shutdown(Shutdown::Both);
        let _ = self.event_tx.try_send(SessionEvent::ConnectionFailed(err));
    }

    fn disconnect(&self) {
        let prev = self.state.swap(SessionState::Disconnected as u8, SeqCst);
        if SessionState::from_u8(prev).unwrap() == SessionState::Disconnected {
            return;
        }
        info!("session disconnected");
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Inbound cycle: header, then body, then the next header. The body read
/// is sized exactly by the header, and the next header is never requested
/// until the current pair has been fully consumed.
async fn receive_loop(shared: &Shared, batch_tx: &flume::Sender<DetectionBatch>) -> Result<()> {
    let mut stream = &shared.stream;
    let mut header_buf = [0u8; protocol::HEADER_LEN];

    loop {
        if let Err(err) = stream.read_exact(&mut header_buf).await {
            if !shared.is_streaming() {
                return Ok(()); // the teardown cancelled this read
            }
            return Err(read_error(err, protocol::HEADER_LEN));
        }
        let header = protocol::decode_header(&header_buf)?;
        debug!(
            "header received: count {}, body size {}",
            header.count, header.total_body_size
        );

        if header.count <= 0 || header.total_body_size == 0 {
            // Nothing follows; request the next header right away.
            continue;
        }

        let mut body = vec![0u8; header.total_body_size as usize];
        if let Err(err) = stream.read_exact(&mut body).await {
            if !shared.is_streaming() {
                return Ok(());
            }
            return Err(read_error(err, body.len()));
        }
        let records = protocol::decode_body(&body, header.count as usize)?;

        let batch = DetectionBatch {
            pose: header.pose,
            records,
        };
        if batch_tx.send_async(batch).await.is_err() {
            return Ok(()); // the consumer went away
        }
    }
}

fn read_error(err: std::io::Error, expected: usize) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::TruncatedRead {
            expected,
            available: 0,
        }
    } else {
        Error::Transport(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capture::{self, CapturedFrame, FrameSource},
        protocol::{DetectionHeader, DetectionRecord, Pose},
    };
    use async_std::net::TcpListener;
    use nalgebra as na;
    use std::{future::Future, time::Duration};

    async fn listen() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn recv_timeout<T>(fut: impl Future<Output = T>) -> T {
        async_std::future::timeout(Duration::from_secs(10), fut)
            .await
            .expect("timed out")
    }

    fn sample_pose() -> Pose {
        Pose {
            camera_to_world: na::Matrix4::identity(),
            projection: na::Matrix4::new(
                1.52, 0.0, 0.0, 0.0, //
                0.0, 2.7, 0.0, 0.0, //
                0.0, 0.0, 1.0041, -0.2, //
                0.0, 0.0, 1.0, 0.0,
            ),
        }
    }

    fn record(label: &str) -> DetectionRecord {
        DetectionRecord {
            left: 100,
            top: 50,
            right: 200,
            bottom: 150,
            red: 255,
            green: 0,
            blue: 0,
            label: label.to_string(),
        }
    }

    async fn write_batch(stream: &mut TcpStream, records: &[DetectionRecord]) {
        let body: Vec<u8> = records
            .iter()
            .flat_map(|rec| protocol::encode_record(rec))
            .collect();
        let header = DetectionHeader {
            pose: sample_pose(),
            count: records.len() as i32,
            total_body_size: body.len() as u32,
        };
        stream
            .write_all(&protocol::encode_header(&header))
            .await
            .unwrap();
        stream.write_all(&body).await.unwrap();
    }

    async fn read_frame(stream: &mut TcpStream) -> FrameMessage {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let image_len = i32::from_be_bytes(len_buf) as usize;
        let mut rest = vec![0u8; image_len + 128];
        stream.read_exact(&mut rest).await.unwrap();
        let mut message = len_buf.to_vec();
        message.extend_from_slice(&rest);
        protocol::decode_frame(&message).unwrap()
    }

    #[async_std::test]
    async fn connect_to_closed_port_is_a_connection_error() {
        let (listener, port) = listen().await;
        drop(listener);

        let err = Session::connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[async_std::test]
    async fn batches_arrive_in_order_and_empty_headers_are_skipped() {
        let (listener, port) = listen().await;
        let server = task::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            // An empty header first: the client must move straight on to
            // the next header without producing a batch.
            let empty = DetectionHeader {
                pose: sample_pose(),
                count: 0,
                total_body_size: 0,
            };
            stream
                .write_all(&protocol::encode_header(&empty))
                .await
                .unwrap();

            write_batch(&mut stream, &[record("cat")]).await;
            write_batch(&mut stream, &[record("dog"), record("chair")]).await;
            stream
        });

        let session = Session::connect("127.0.0.1", port).await.unwrap();
        let (handle, batch_rx, _event_rx) = session.start();
        assert_eq!(handle.state(), SessionState::Streaming);

        let first = recv_timeout(batch_rx.recv_async()).await.unwrap();
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.records[0].label, "cat");
        assert_eq!(first.pose, sample_pose());

        let second = recv_timeout(batch_rx.recv_async()).await.unwrap();
        assert_eq!(second.records.len(), 2);
        assert_eq!(second.records[0].label, "dog");

        let _stream = server.await;
        handle.disconnect();
        handle.disconnect();
        assert_eq!(handle.state(), SessionState::Disconnected);
    }

    #[async_std::test]
    async fn outbound_frames_reach_the_backend_intact() {
        let (listener, port) = listen().await;
        let server = task::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_frame(&mut stream).await
        });

        let frame = FrameMessage {
            image: vec![0xff, 0xd8, 0x01, 0x02, 0x03, 0xff, 0xd9],
            pose: sample_pose(),
        };

        let session = Session::connect("127.0.0.1", port).await.unwrap();
        let (handle, _batch_rx, _event_rx) = session.start();
        assert!(handle.send_frame(frame.clone()));

        let received = recv_timeout(server).await;
        assert_eq!(received, frame);

        handle.disconnect();
    }

    #[async_std::test]
    async fn send_after_disconnect_is_dropped() {
        let (listener, port) = listen().await;
        let _guard = task::spawn(async move { listener.accept().await });

        let session = Session::connect("127.0.0.1", port).await.unwrap();
        let (handle, _batch_rx, _event_rx) = session.start();
        handle.disconnect();

        let accepted = handle.send_frame(FrameMessage {
            image: vec![1, 2, 3],
            pose: sample_pose(),
        });
        assert!(!accepted);
    }

    #[async_std::test]
    async fn truncated_body_fails_the_session_exactly_once() {
        let (listener, port) = listen().await;
        task::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Promise a body, deliver half of it, then drop the socket.
            let header = DetectionHeader {
                pose: sample_pose(),
                count: 2,
                total_body_size: 64,
            };
            stream
                .write_all(&protocol::encode_header(&header))
                .await
                .unwrap();
            stream.write_all(&[0u8; 10]).await.unwrap();
        });

        let session = Session::connect("127.0.0.1", port).await.unwrap();
        let (handle, batch_rx, event_rx) = session.start();

        let event = recv_timeout(event_rx.recv_async()).await.unwrap();
        assert!(matches!(
            event,
            SessionEvent::ConnectionFailed(Error::TruncatedRead { .. })
        ));
        assert_eq!(handle.state(), SessionState::Failed);

        // The teardown ran once: the batch channel is closed and no second
        // event follows.
        assert!(recv_timeout(batch_rx.recv_async()).await.is_err());
        assert!(matches!(
            event_rx.try_recv(),
            Err(flume::TryRecvError::Empty)
        ));

        // Explicit disconnect after failure stays a no-op.
        handle.disconnect();
    }

    #[async_std::test]
    async fn malformed_record_fails_the_session() {
        let (listener, port) = listen().await;
        task::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut body = protocol::encode_record(&record("ab"));
            let label_offset = body.len() - 2;
            body[label_offset] = 0xc3;
            body[label_offset + 1] = 0x28;
            let header = DetectionHeader {
                pose: sample_pose(),
                count: 1,
                total_body_size: body.len() as u32,
            };
            stream
                .write_all(&protocol::encode_header(&header))
                .await
                .unwrap();
            stream.write_all(&body).await.unwrap();
            stream
        });

        let session = Session::connect("127.0.0.1", port).await.unwrap();
        let (handle, _batch_rx, event_rx) = session.start();

        let event = recv_timeout(event_rx.recv_async()).await.unwrap();
        assert!(matches!(
            event,
            SessionEvent::ConnectionFailed(Error::InvalidEncoding(_))
        ));
        assert_eq!(handle.state(), SessionState::Failed);
    }

    /// Fails on the first attempt, then yields the same frame forever.
    struct FlakySource {
        attempts: usize,
        frame: CapturedFrame,
    }

    impl FrameSource for FlakySource {
        fn capture(&mut self) -> impl Future<Output = Result<CapturedFrame>> + Send {
            self.attempts += 1;
            let result = if self.attempts == 1 {
                Err(Error::CaptureUnavailable("pose not ready".to_string()))
            } else {
                Ok(self.frame.clone())
            };
            async move { result }
        }
    }

    #[async_std::test]
    async fn capture_loop_retries_until_the_pose_is_available() {
        let (listener, port) = listen().await;
        let server = task::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_frame(&mut stream).await
        });

        let frame = CapturedFrame {
            image: vec![9, 9, 9],
            pose: sample_pose(),
        };

        let session = Session::connect("127.0.0.1", port).await.unwrap();
        let (handle, _batch_rx, _event_rx) = session.start();
        let capture_task = task::spawn(capture::run(
            FlakySource {
                attempts: 0,
                frame: frame.clone(),
            },
            handle.clone(),
            Duration::from_millis(1),
        ));

        // The frame that arrives is the complete retried one; nothing was
        // sent without its pose.
        let received = recv_timeout(server).await;
        assert_eq!(received.image, frame.image);
        assert_eq!(received.pose, frame.pose);

        handle.disconnect();
        recv_timeout(capture_task).await;
    }
}
