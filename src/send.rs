//! Send path: application bytes to transport frames
//!
//! A message goes out under the first matching policy:
//!
//! 1. compression on for this message: deflate into the write buffer, emit a
//!    frame when it fills or the message ends, strip the flush trailer from
//!    the final frame;
//! 2. auto-fragmentation: one frame per write-buffer-sized chunk;
//! 3. client without auto-fragmentation: a single frame of known total
//!    length, masked chunk-by-chunk through the key schedule under one lock
//!    hold;
//! 4. server without auto-fragmentation: a single frame, header and payload
//!    written straight from the caller's buffer.
//!
//! The first frame of a message carries the message opcode (and RSV1 when
//! compressed); every later frame is a continuation. Clients draw a fresh
//! mask key per frame.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};

#[cfg(feature = "permessage-deflate")]
use crate::deflate::Deflater;
use crate::error::{Error, Result};
use crate::frame::{self, FrameHeader, OpCode};
use crate::mask::{KeySchedule, MaskGen};
use crate::session::{Role, Shared};

pub(crate) struct SendPath {
    role: Role,
    /// Opcode opening the next message.
    msg_opcode: OpCode,
    auto_fragment: bool,
    wr_buf_size: usize,
    compress_outgoing: bool,
    /// The next data frame continues the current message.
    in_continuation: bool,
    /// Whether the in-progress message went through the deflater.
    compress_message: bool,
    buf: BytesMut,
    mask: MaskGen,
    #[cfg(feature = "permessage-deflate")]
    deflater: Option<Deflater>,
}

impl SendPath {
    pub fn new(
        role: Role,
        msg_opcode: OpCode,
        auto_fragment: bool,
        wr_buf_size: usize,
        compress_outgoing: bool,
    ) -> Self {
        Self {
            role,
            msg_opcode,
            auto_fragment,
            wr_buf_size,
            compress_outgoing,
            in_continuation: false,
            compress_message: false,
            buf: BytesMut::with_capacity(wr_buf_size),
            mask: MaskGen::new(),
            #[cfg(feature = "permessage-deflate")]
            deflater: None,
        }
    }

    #[cfg(feature = "permessage-deflate")]
    pub fn set_deflater(&mut self, deflater: Deflater) {
        self.deflater = Some(deflater);
    }

    pub fn in_continuation(&self) -> bool {
        self.in_continuation
    }

    /// Opcode that will open the next message.
    pub fn msg_opcode(&self) -> OpCode {
        self.msg_opcode
    }

    /// Set the opcode used for subsequent messages.
    pub fn set_msg_opcode(&mut self, opcode: OpCode) {
        self.msg_opcode = opcode;
    }

    fn next_mask(&mut self) -> Option<[u8; 4]> {
        match self.role {
            Role::Client => Some(self.mask.next_key()),
            Role::Server => None,
        }
    }

    fn frame_opcode(&self) -> OpCode {
        if self.in_continuation {
            OpCode::Continuation
        } else {
            self.msg_opcode
        }
    }

    /// Send part of a message; `fin` marks the end of the message.
    pub async fn write_some<S>(&mut self, shared: &Shared<S>, fin: bool, data: &[u8]) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        shared.close.check_writable()?;

        if !self.in_continuation {
            self.compress_message = self.compression_available() && self.compress_outgoing;
        }

        if self.compress_message {
            self.write_compressed(shared, fin, data).await
        } else if self.auto_fragment {
            self.write_fragmented(shared, fin, data).await
        } else if self.role == Role::Client {
            self.write_masked_single(shared, fin, data).await
        } else {
            self.write_direct(shared, fin, data).await
        }
    }

    #[cfg(feature = "permessage-deflate")]
    fn compression_available(&self) -> bool {
        self.deflater.is_some()
    }

    #[cfg(not(feature = "permessage-deflate"))]
    fn compression_available(&self) -> bool {
        false
    }

    #[cfg(feature = "permessage-deflate")]
    async fn write_compressed<S>(&mut self, shared: &Shared<S>, fin: bool, data: &[u8]) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.deflater.is_none() {
            return Err(Error::SendState("compression not negotiated"));
        }

        for piece in data.chunks(self.wr_buf_size.max(1)) {
            if let Some(deflater) = self.deflater.as_mut() {
                deflater.write(piece, &mut self.buf)?;
            }
            if self.buf.len() >= self.wr_buf_size {
                self.emit_buffered(shared, false).await?;
            }
        }
        if fin {
            if let Some(deflater) = self.deflater.as_mut() {
                deflater.finish_message(&mut self.buf)?;
            }
            self.emit_buffered(shared, true).await?;
        }
        Ok(())
    }

    #[cfg(not(feature = "permessage-deflate"))]
    async fn write_compressed<S>(&mut self, _: &Shared<S>, _: bool, _: &[u8]) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        Err(Error::SendState("compression not negotiated"))
    }

    /// Emit everything buffered as one frame of the current message.
    ///
    /// The close state is re-checked per frame: a close claimed while a
    /// multi-frame message is in flight cuts the message off rather than
    /// letting data frames trail the close echo onto the wire.
    async fn emit_buffered<S>(&mut self, shared: &Shared<S>, fin: bool) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let opcode = self.frame_opcode();
        let rsv1 = !self.in_continuation && self.compress_message;
        let mask = self.next_mask();

        let mut wire = BytesMut::with_capacity(14 + self.buf.len());
        frame::encode_frame_rsv(&mut wire, opcode, &self.buf, fin, mask, rsv1);
        self.buf.clear();

        let mut sink = shared.lock_data_sink().await?;
        sink.send(&wire).await?;
        drop(sink);

        self.in_continuation = !fin;
        Ok(())
    }

    async fn write_fragmented<S>(&mut self, shared: &Shared<S>, fin: bool, data: &[u8]) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if data.is_empty() {
            if fin {
                self.emit_buffered(shared, true).await?;
            }
            return Ok(());
        }

        let chunk_count = data.len().div_ceil(self.wr_buf_size);
        for (i, chunk) in data.chunks(self.wr_buf_size).enumerate() {
            let frame_fin = fin && i + 1 == chunk_count;
            let opcode = self.frame_opcode();
            let mask = self.next_mask();

            let mut wire = BytesMut::with_capacity(14 + chunk.len());
            frame::encode_frame(&mut wire, opcode, chunk, frame_fin, mask);

            // A close claimed between chunks ends the message here; no data
            // frame may follow the close echo.
            let mut sink = shared.lock_data_sink().await?;
            sink.send(&wire).await?;
            drop(sink);

            self.in_continuation = !frame_fin;
        }
        Ok(())
    }

    /// One frame of known total length, masked and written in buffer-sized
    /// slices. The key schedule carries the rotation across slices; the lock
    /// is held for the whole frame so no control frame can interleave.
    async fn write_masked_single<S>(
        &mut self,
        shared: &Shared<S>,
        fin: bool,
        data: &[u8],
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let key = self.mask.next_key();
        let header = FrameHeader {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: self.frame_opcode(),
            masked: true,
            payload_len: data.len() as u64,
            mask: Some(key),
        };
        let mut head = BytesMut::with_capacity(header.header_size());
        header.encode(&mut head);

        let mut sink = shared.lock_data_sink().await?;
        sink.begin_frame();
        sink.write_part(&head).await?;
        let mut schedule = KeySchedule::new(key);
        for chunk in data.chunks(self.wr_buf_size.max(1)) {
            self.buf.clear();
            self.buf.extend_from_slice(chunk);
            schedule.apply(&mut self.buf);
            sink.write_part(&self.buf).await?;
        }
        sink.finish_frame().await?;
        drop(sink);
        self.buf.clear();

        self.in_continuation = !fin;
        Ok(())
    }

    /// One frame written straight from the caller's buffer, no copy.
    async fn write_direct<S>(&mut self, shared: &Shared<S>, fin: bool, data: &[u8]) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let header = FrameHeader {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: self.frame_opcode(),
            masked: false,
            payload_len: data.len() as u64,
            mask: None,
        };
        let mut head = BytesMut::with_capacity(header.header_size());
        header.encode(&mut head);

        let mut sink = shared.lock_data_sink().await?;
        sink.send_split(&head, data).await?;
        drop(sink);

        self.in_continuation = !fin;
        Ok(())
    }
}
