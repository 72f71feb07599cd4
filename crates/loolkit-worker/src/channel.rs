//! Framed control transport to the supervisor.
//!
//! One Unix stream socket carries both directions. Each frame is a 4-byte
//! big-endian payload length, one kind byte (`0` text, `1` binary), then
//! the payload. The length is validated against [`MAX_FRAME_SIZE`] before
//! any allocation on the read side. Text payloads larger than
//! [`SMALL_MESSAGE_SIZE`](loolkit_core::protocol::SMALL_MESSAGE_SIZE) are
//! preceded by a `nextmessage: size=<n>` hint frame so the peer can size
//! its buffers; binary tile replies get the same hint.

use std::io::{ErrorKind, Read as _, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use loolkit_core::protocol;

/// Upper bound on a single frame payload (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors on the control transport.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// An I/O error occurred.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// What the channel was doing.
        context: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A frame length exceeded the protocol bound.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Announced or attempted frame size.
        size: usize,
        /// Protocol maximum.
        max: usize,
    },

    /// An unknown frame kind byte arrived.
    #[error("unknown frame kind byte {value:#04x}")]
    BadFrameKind {
        /// The offending byte.
        value: u8,
    },
}

impl ChannelError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Frame payload discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// UTF-8 control text.
    Text,
    /// Opaque bytes (tile replies).
    Binary,
}

impl FrameKind {
    const fn to_byte(self) -> u8 {
        match self {
            Self::Text => 0,
            Self::Binary => 1,
        }
    }

    fn from_byte(value: u8) -> Result<Self, ChannelError> {
        match value {
            0 => Ok(Self::Text),
            1 => Ok(Self::Binary),
            _ => Err(ChannelError::BadFrameKind { value }),
        }
    }
}

/// One decoded frame.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame {
    /// Payload discriminator.
    pub kind: FrameKind,
    /// Frame payload.
    pub payload: Vec<u8>,
}

/// Outcome of a single read attempt.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete frame arrived.
    Frame(Frame),
    /// The idle timeout elapsed before a frame started.
    TimedOut,
    /// The peer closed the connection.
    Closed,
}

/// Receiving half of the control connection.
pub struct ChannelReader {
    stream: UnixStream,
}

impl ChannelReader {
    /// Sets the timeout after which an idle [`ReadOutcome::TimedOut`] is
    /// reported. A timeout mid-frame does not lose framing; only the wait
    /// for the first header byte honors it.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket option cannot be applied.
    pub fn set_idle_timeout(&self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        self.stream
            .set_read_timeout(timeout)
            .map_err(|err| ChannelError::io("set read timeout", err))
    }

    /// Reads the next frame.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure, announced oversize
    /// frames (detected before allocation), or unknown frame kinds.
    pub fn read_frame(&mut self) -> Result<ReadOutcome, ChannelError> {
        let mut header = [0u8; 4];
        let mut got = 0;
        while got < header.len() {
            match self.stream.read(&mut header[got..]) {
                Ok(0) => {
                    if got == 0 {
                        return Ok(ReadOutcome::Closed);
                    }
                    return Err(ChannelError::io(
                        "read frame header",
                        ErrorKind::UnexpectedEof.into(),
                    ));
                }
                Ok(n) => got += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err)
                    if got == 0
                        && matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    return Ok(ReadOutcome::TimedOut);
                }
                Err(err)
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(err) => return Err(ChannelError::io("read frame header", err)),
            }
        }

        let size = u32::from_be_bytes(header) as usize;
        if size > MAX_FRAME_SIZE {
            return Err(ChannelError::FrameTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut kind = [0u8; 1];
        self.read_fully(&mut kind)?;
        let kind = FrameKind::from_byte(kind[0])?;

        let mut payload = vec![0u8; size];
        self.read_fully(&mut payload)?;

        Ok(ReadOutcome::Frame(Frame { kind, payload }))
    }

    fn read_fully(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        let mut got = 0;
        while got < buf.len() {
            match self.stream.read(&mut buf[got..]) {
                Ok(0) => {
                    return Err(ChannelError::io(
                        "read frame body",
                        ErrorKind::UnexpectedEof.into(),
                    ));
                }
                Ok(n) => got += n,
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
                    ) => {}
                Err(err) => return Err(ChannelError::io("read frame body", err)),
            }
        }
        Ok(())
    }
}

/// Sending half of the control connection; shared by every thread that
/// emits frames, serialized by an internal lock so a hint frame and its
/// payload frame are never interleaved with another sender.
pub struct ChannelWriter {
    inner: Mutex<Box<dyn Write + Send>>,
}

impl ChannelWriter {
    /// Wraps an arbitrary writer; used by tests and by [`connect`].
    #[must_use]
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    /// Sends a text frame, preceded by a size hint when oversize.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure or oversize payload.
    pub fn send_text_frame(&self, text: &str) -> Result<(), ChannelError> {
        self.send(FrameKind::Text, text.as_bytes())
    }

    /// Sends a binary frame, preceded by a size hint when oversize.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure or oversize payload.
    pub fn send_binary_frame(&self, payload: &[u8]) -> Result<(), ChannelError> {
        self.send(FrameKind::Binary, payload)
    }

    fn send(&self, kind: FrameKind, payload: &[u8]) -> Result<(), ChannelError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(ChannelError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        let mut writer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if payload.len() > protocol::SMALL_MESSAGE_SIZE {
            let hint = protocol::next_message_hint(payload.len());
            Self::write_frame(&mut **writer, FrameKind::Text, hint.as_bytes())?;
        }
        Self::write_frame(&mut **writer, kind, payload)?;
        writer
            .flush()
            .map_err(|err| ChannelError::io("flush frame", err))
    }

    fn write_frame(
        writer: &mut dyn Write,
        kind: FrameKind,
        payload: &[u8],
    ) -> Result<(), ChannelError> {
        let header = (payload.len() as u32).to_be_bytes();
        writer
            .write_all(&header)
            .and_then(|()| writer.write_all(&[kind.to_byte()]))
            .and_then(|()| writer.write_all(payload))
            .map_err(|err| ChannelError::io("write frame", err))
    }
}

/// Connects to the supervisor socket, returning the two halves.
///
/// # Errors
///
/// Returns [`ChannelError`] if the socket cannot be opened or duplicated.
pub fn connect(path: &Path) -> Result<(ChannelReader, ChannelWriter), ChannelError> {
    let stream = UnixStream::connect(path)
        .map_err(|err| ChannelError::io(format!("connect to {}", path.display()), err))?;
    let writer = stream
        .try_clone()
        .map_err(|err| ChannelError::io("duplicate control socket", err))?;
    Ok((
        ChannelReader { stream },
        ChannelWriter::from_writer(Box::new(writer)),
    ))
}
