//! Session: orchestration of the receive and send paths
//!
//! A [`Session`] owns one upgraded transport. Reads and writes live in
//! disjoint state and may run as two cooperating tasks after
//! [`Session::split`]; the only point of contact is the frame write lock, a
//! FIFO mutex held for the duration of a single frame's transport write.
//! Control frames produced by the receive path (pong replies, close echoes)
//! queue on that lock behind whatever frame is currently going out, so frame
//! bytes never interleave on the wire.
//!
//! A write cancelled after its first transport byte leaves the peer unable
//! to recover the framing; the sink remembers the torn frame and the next
//! lock acquisition fails the session.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::Options;
use crate::close::{self, CloseEngine};
#[cfg(feature = "permessage-deflate")]
use crate::deflate::{Deflater, Inflater, PmdConfig};
use crate::error::{CloseReason, Error, Result};
use crate::frame::{self, OpCode};
use crate::mask::MaskGen;
use crate::recv::{ControlFrame, FrameInfo, ReceivePath, Step};
use crate::send::SendPath;

/// Which side of the upgrade this endpoint is.
///
/// Clients mask every outgoing frame; servers never do. Immutable once the
/// session opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connection initiator (masks frames)
    Client,
    /// Connection acceptor (must not mask)
    Server,
}

/// Pong observer invoked with each pong payload.
pub type PongCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Write half of the transport plus torn-frame tracking.
pub(crate) struct FrameSink<S> {
    io: WriteHalf<S>,
    mid_frame: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FrameSink<S> {
    pub fn begin_frame(&mut self) {
        self.mid_frame = true;
    }

    pub async fn write_part(&mut self, bytes: &[u8]) -> Result<()> {
        self.io.write_all(bytes).await?;
        Ok(())
    }

    pub async fn finish_frame(&mut self) -> Result<()> {
        self.io.flush().await?;
        self.mid_frame = false;
        Ok(())
    }

    /// Write one complete frame.
    pub async fn send(&mut self, wire: &[u8]) -> Result<()> {
        self.begin_frame();
        self.io.write_all(wire).await?;
        self.finish_frame().await
    }

    /// Write one frame as header + borrowed payload, no copy.
    pub async fn send_split(&mut self, head: &[u8], payload: &[u8]) -> Result<()> {
        self.begin_frame();
        self.io.write_all(head).await?;
        self.io.write_all(payload).await?;
        self.finish_frame().await
    }

    pub async fn teardown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}

/// State reachable from both halves of a split session.
pub(crate) struct Shared<S> {
    pub sink: Mutex<FrameSink<S>>,
    pub close: CloseEngine,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Shared<S> {
    /// Acquire the frame write lock.
    ///
    /// Acquisition order is FIFO. Finding a torn frame here means an earlier
    /// write was cancelled mid-transport; the session is unrecoverable.
    pub async fn lock_sink(&self) -> Result<MutexGuard<'_, FrameSink<S>>> {
        let guard = self.sink.lock().await;
        if guard.mid_frame {
            self.close.mark_failed();
            return Err(Error::Failed);
        }
        Ok(guard)
    }

    /// Acquire the frame write lock for a data frame.
    ///
    /// A close frame may be queued ahead on the lock (a peer-close echo from
    /// the receive path, or a locally initiated close); once it has gone out
    /// no data frame may follow it, so the close state is checked again
    /// after acquisition.
    pub async fn lock_data_sink(&self) -> Result<MutexGuard<'_, FrameSink<S>>> {
        let guard = self.lock_sink().await?;
        self.close.check_writable()?;
        Ok(guard)
    }

    /// Send a single control frame.
    pub async fn send_control(
        &self,
        opcode: OpCode,
        payload: &[u8],
        mask: Option<[u8; 4]>,
    ) -> Result<()> {
        if payload.len() > 125 {
            return Err(Error::Capacity("control frame payload exceeds 125 bytes"));
        }
        let mut wire = BytesMut::with_capacity(6 + payload.len());
        frame::encode_frame(&mut wire, opcode, payload, true, mask);
        let mut sink = self.lock_sink().await?;
        sink.send(&wire).await
    }

    /// Fail the connection: best-effort close frame, transport teardown,
    /// terminal state.
    pub async fn fail(&self, code: Option<u16>, mask: Option<[u8; 4]>) {
        debug!(?code, "failing connection");
        let mut sink = self.sink.lock().await;
        if !sink.mid_frame {
            if let Some(code) = code {
                if self.close.try_claim_send() {
                    let mut payload = BytesMut::with_capacity(2);
                    payload.put_u16(code);
                    let mut wire = BytesMut::with_capacity(8);
                    frame::encode_frame(&mut wire, OpCode::Close, &payload, true, mask);
                    let _ = sink.send(&wire).await;
                }
            }
        }
        let _ = sink.teardown().await;
        self.close.mark_failed();
    }
}

/// The receiving half of a session.
pub struct Reader<S> {
    io: ReadHalf<S>,
    path: ReceivePath,
    shared: Arc<Shared<S>>,
    role: Role,
    mask: MaskGen,
    on_pong: Option<PongCallback>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Reader<S> {
    /// Receive the next data frame, appending its payload to `out`.
    ///
    /// Returns once per data frame with the message opcode and whether the
    /// message is complete. Control frames are handled on the way: pings are
    /// answered ahead of any pending non-control write, pongs go to the
    /// callback, and a peer close finishes the handshake and surfaces as
    /// [`Error::Closed`].
    pub async fn read(&mut self, out: &mut BytesMut) -> Result<FrameInfo> {
        self.shared.close.check_readable()?;
        loop {
            match self.path.advance(out) {
                Ok(Step::Data(info)) => {
                    trace!(opcode = ?info.opcode, fin = info.fin, "data frame");
                    return Ok(info);
                }
                Ok(Step::NeedInput) => {
                    let n = match self.io.read_buf(self.path.transport_buf()).await {
                        Ok(n) => n,
                        Err(e) => {
                            self.shared.close.mark_failed();
                            return Err(Error::Io(e));
                        }
                    };
                    if n == 0 {
                        self.shared.close.mark_failed();
                        return Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "transport closed mid-session",
                        )));
                    }
                }
                Ok(Step::Control(ctl)) => self.handle_control(ctl).await?,
                Err(e) => return self.fail_with(e).await,
            }
        }
    }

    /// Install the pong observer.
    pub fn set_pong_callback(&mut self, callback: PongCallback) {
        self.on_pong = Some(callback);
    }

    fn control_mask(&mut self) -> Option<[u8; 4]> {
        match self.role {
            Role::Client => Some(self.mask.next_key()),
            Role::Server => None,
        }
    }

    async fn handle_control(&mut self, ctl: ControlFrame) -> Result<()> {
        match ctl.opcode {
            OpCode::Ping => {
                trace!(len = ctl.payload.len(), "ping");
                if self.shared.close.close_sent() {
                    return Ok(());
                }
                let mask = self.control_mask();
                let result = self
                    .shared
                    .send_control(OpCode::Pong, &ctl.payload, mask)
                    .await;
                if let Err(Error::Io(_)) = &result {
                    self.shared.close.mark_failed();
                }
                result
            }
            OpCode::Pong => {
                if let Some(callback) = self.on_pong.as_mut() {
                    callback(&ctl.payload);
                }
                Ok(())
            }
            OpCode::Close => self.handle_peer_close(&ctl.payload).await,
            _ => Ok(()),
        }
    }

    /// Complete the close handshake from the receiving side.
    async fn handle_peer_close(&mut self, payload: &[u8]) -> Result<()> {
        let reason = match close::parse_close_payload(payload) {
            Ok(reason) => reason,
            Err(e) => return self.fail_with(e).await.map(|_| ()),
        };
        self.shared.close.mark_received(reason.clone());

        if self.shared.close.try_claim_send() {
            // Echo: the peer's code with an empty reason, or 1000 if none.
            let code = reason
                .as_ref()
                .map(|r| r.code)
                .unwrap_or(CloseReason::NORMAL);
            let mut body = BytesMut::with_capacity(2);
            body.put_u16(code);
            let mut wire = BytesMut::with_capacity(8);
            frame::encode_frame(&mut wire, OpCode::Close, &body, true, self.control_mask());
            if let Ok(mut sink) = self.shared.lock_sink().await {
                let _ = sink.send(&wire).await;
                let _ = sink.teardown().await;
            }
        } else {
            // We initiated; the peer's reply completes the handshake.
            let mut sink = self.shared.sink.lock().await;
            let _ = sink.teardown().await;
        }
        debug!("close handshake complete");
        Err(Error::Closed(reason))
    }

    async fn fail_with(&mut self, e: Error) -> Result<FrameInfo> {
        let mask = self.control_mask();
        self.shared.fail(e.close_code(), mask).await;
        Err(e)
    }
}

/// The sending half of a session.
pub struct Writer<S> {
    path: SendPath,
    shared: Arc<Shared<S>>,
    role: Role,
    mask: MaskGen,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Writer<S> {
    /// Send a complete message using the configured default opcode.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.path.in_continuation() {
            return Err(Error::SendState("message still in progress"));
        }
        self.write_some(true, data).await
    }

    /// Send part of a message; `fin` ends it.
    ///
    /// The first call of a message decides opcode and compression; each
    /// later call continues the same message until one passes `fin`.
    pub async fn write_some(&mut self, fin: bool, data: &[u8]) -> Result<()> {
        let result = self.path.write_some(&self.shared, fin, data).await;
        self.fail_on_transport_error(result)
    }

    /// Send a complete text message regardless of the default opcode.
    pub async fn write_text(&mut self, text: &str) -> Result<()> {
        self.write_message(OpCode::Text, text.as_bytes()).await
    }

    /// Send a complete binary message regardless of the default opcode.
    pub async fn write_binary(&mut self, data: &[u8]) -> Result<()> {
        self.write_message(OpCode::Binary, data).await
    }

    async fn write_message(&mut self, opcode: OpCode, data: &[u8]) -> Result<()> {
        if self.path.in_continuation() {
            return Err(Error::SendState("message still in progress"));
        }
        let saved = self.path_opcode_swap(opcode);
        let result = self.write_some(true, data).await;
        self.path_opcode_swap(saved);
        result
    }

    fn path_opcode_swap(&mut self, opcode: OpCode) -> OpCode {
        let saved = self.path.msg_opcode();
        self.path.set_msg_opcode(opcode);
        saved
    }

    /// Send a ping.
    pub async fn ping(&mut self, payload: &[u8]) -> Result<()> {
        self.shared.close.check_writable()?;
        let mask = self.control_mask();
        let result = self.shared.send_control(OpCode::Ping, payload, mask).await;
        self.fail_on_transport_error(result)
    }

    /// Send an unsolicited pong.
    pub async fn pong(&mut self, payload: &[u8]) -> Result<()> {
        self.shared.close.check_writable()?;
        let mask = self.control_mask();
        let result = self.shared.send_control(OpCode::Pong, payload, mask).await;
        self.fail_on_transport_error(result)
    }

    /// Initiate the close handshake.
    ///
    /// Emits a close frame unless one already went out. The session stays
    /// readable until the peer's close arrives.
    pub async fn close(&mut self, reason: Option<CloseReason>) -> Result<()> {
        if self.shared.close.is_failed() {
            return Err(Error::Failed);
        }
        if !self.shared.close.try_claim_send() {
            return Ok(());
        }
        debug!(code = ?reason.as_ref().map(|r| r.code), "closing");
        let mut body = BytesMut::new();
        close::encode_close_payload(reason.as_ref(), &mut body);
        let mask = self.control_mask();
        let mut wire = BytesMut::with_capacity(8 + body.len());
        frame::encode_frame(&mut wire, OpCode::Close, &body, true, mask);
        let result = match self.shared.lock_sink().await {
            Ok(mut sink) => sink.send(&wire).await,
            Err(e) => Err(e),
        };
        self.fail_on_transport_error(result)
    }

    fn control_mask(&mut self) -> Option<[u8; 4]> {
        match self.role {
            Role::Client => Some(self.mask.next_key()),
            Role::Server => None,
        }
    }

    fn fail_on_transport_error(&self, result: Result<()>) -> Result<()> {
        if let Err(Error::Io(_)) = &result {
            self.shared.close.mark_failed();
        }
        result
    }
}

/// A WebSocket session over an upgraded transport.
///
/// Create one with [`Session::new`] (or [`Session::with_deflate`] when
/// permessage-deflate was negotiated), after the handshake layer has settled
/// the role and extension parameters.
pub struct Session<S> {
    reader: Reader<S>,
    writer: Writer<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    /// Create a session without negotiated extensions.
    pub fn new(io: S, role: Role, options: Options) -> Self {
        Self::build(io, role, options)
    }

    /// Create a session with a negotiated permessage-deflate configuration.
    #[cfg(feature = "permessage-deflate")]
    pub fn with_deflate(io: S, role: Role, options: Options, pmd: PmdConfig) -> Self {
        let mut session = Self::build(io, role, options);
        session.reader.path.set_inflater(Inflater::new(
            pmd.inflate_window_bits(role),
            pmd.inflate_resets(role),
        ));
        session.writer.path.set_deflater(Deflater::new(
            pmd.deflate_window_bits(role),
            pmd.deflate_resets(role),
        ));
        session
    }

    fn build(io: S, role: Role, options: Options) -> Self {
        let (rd, wr) = tokio::io::split(io);
        let shared = Arc::new(Shared {
            sink: Mutex::new(FrameSink {
                io: wr,
                mid_frame: false,
            }),
            close: CloseEngine::new(),
        });

        let reader = Reader {
            io: rd,
            path: ReceivePath::new(role, options.msg_max, options.rd_buf_size.max(64)),
            shared: Arc::clone(&shared),
            role,
            mask: MaskGen::new(),
            on_pong: None,
        };
        let writer = Writer {
            path: SendPath::new(
                role,
                options.default_write_opcode,
                options.auto_fragment,
                options.wr_buf_size.max(64),
                options.pmd_enabled && options.compress_outgoing,
            ),
            shared,
            role,
            mask: MaskGen::new(),
        };
        Session { reader, writer }
    }

    /// Receive the next data frame; see [`Reader::read`].
    pub async fn read(&mut self, out: &mut BytesMut) -> Result<FrameInfo> {
        self.reader.read(out).await
    }

    /// Send a complete message; see [`Writer::write`].
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write(data).await
    }

    /// Send part of a message; see [`Writer::write_some`].
    pub async fn write_some(&mut self, fin: bool, data: &[u8]) -> Result<()> {
        self.writer.write_some(fin, data).await
    }

    /// Send a complete text message.
    pub async fn write_text(&mut self, text: &str) -> Result<()> {
        self.writer.write_text(text).await
    }

    /// Send a complete binary message.
    pub async fn write_binary(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_binary(data).await
    }

    /// Send a ping.
    pub async fn ping(&mut self, payload: &[u8]) -> Result<()> {
        self.writer.ping(payload).await
    }

    /// Send an unsolicited pong.
    pub async fn pong(&mut self, payload: &[u8]) -> Result<()> {
        self.writer.pong(payload).await
    }

    /// Initiate the close handshake.
    pub async fn close(&mut self, reason: Option<CloseReason>) -> Result<()> {
        self.writer.close(reason).await
    }

    /// Install the pong observer.
    pub fn set_pong_callback(&mut self, callback: PongCallback) {
        self.reader.set_pong_callback(callback);
    }

    /// This endpoint's role.
    pub fn role(&self) -> Role {
        self.reader.role
    }

    /// Whether the session was failed.
    pub fn is_failed(&self) -> bool {
        self.reader.shared.close.is_failed()
    }

    /// Split into independently owned read and write halves.
    ///
    /// The halves share the close state and the frame write lock; each may
    /// move to its own task.
    pub fn split(self) -> (Reader<S>, Writer<S>) {
        (self.reader, self.writer)
    }
}
