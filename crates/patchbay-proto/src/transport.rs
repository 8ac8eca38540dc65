//! Framed transport over a local stream socket (C3).
//!
//! Each message is a [`crate::frame::Frame`] plus zero or more file
//! descriptors, carried out-of-band as `SCM_RIGHTS` ancillary data on
//! the same `sendmsg`/`recvmsg` call as the frame's bytes. `Value::Fd`
//! entries inside the payload are indices into that per-message fd
//! array, mirroring `pw_connection`'s `add_fd`/`get_fd` side-array: the
//! frame itself never carries a raw fd number, only a small index that
//! is meaningless without the ancillary data it arrived with.
//!
//! Each direction gets its own ring buffer sized to hold at least one
//! maximum-size message; the connection blocks the *sender* when the
//! peer's ring is full rather than dropping data, since this transport
//! is connection-oriented and loss is never acceptable here.

use crate::error::TransportError;
use crate::frame::{Frame, FrameHeader, HEADER_LEN};
use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};
use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// Maximum number of fds a single message may carry in its ancillary data.
pub const MAX_FDS_PER_MESSAGE: usize = 28;

/// A decoded message: a frame plus the fds that arrived alongside it.
/// `Value::Fd(i)` inside the frame's payload refers to `fds[i]`.
#[derive(Debug)]
pub struct Message {
    pub object_id: u32,
    pub opcode: u16,
    pub payload: Vec<u8>,
    pub fds: Vec<RawFd>,
}

/// A framed connection over a `UnixStream`, with SCM_RIGHTS fd passing
/// and a bounded outbound queue that provides sender-side backpressure.
pub struct Connection {
    socket: UnixStream,
    outbound: VecDeque<(Frame, Vec<RawFd>)>,
    /// Capacity (in frames) before `send` blocks the caller.
    outbound_capacity: usize,
}

impl Connection {
    pub fn new(socket: UnixStream) -> Self {
        Self { socket, outbound: VecDeque::new(), outbound_capacity: 64 }
    }

    pub fn peer_credentials(&self) -> Result<nix::sys::socket::UnixCredentials, TransportError> {
        socket::getsockopt(&self.socket, socket::sockopt::PeerCredentials).map_err(TransportError::from)
    }

    /// Queue a frame (with optional attached fds) for sending, blocking
    /// if the outbound queue is already at capacity.
    pub fn queue_send(&mut self, frame: Frame, fds: &[RawFd]) -> Result<(), TransportError> {
        if fds.len() > MAX_FDS_PER_MESSAGE {
            return Err(TransportError::FdExhausted);
        }
        while self.outbound.len() >= self.outbound_capacity {
            self.flush_one()?;
        }
        self.outbound.push_back((frame, fds.to_vec()));
        Ok(())
    }

    fn flush_one(&mut self) -> Result<(), TransportError> {
        if let Some((frame, fds)) = self.outbound.pop_front() {
            self.write_frame(&frame, &fds)?;
        }
        Ok(())
    }

    /// Write a single frame, attaching `fds` as ancillary data on the
    /// same `sendmsg` call.
    pub fn write_frame(&mut self, frame: &Frame, fds: &[RawFd]) -> Result<(), TransportError> {
        let encoded = frame.encode();
        let iov = [IoSlice::new(&encoded)];
        let cmsgs = if fds.is_empty() { vec![] } else { vec![ControlMessage::ScmRights(fds)] };
        let sent = socket::sendmsg::<()>(
            self.socket.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            None,
        )
        .map_err(|e| match e {
            nix::errno::Errno::EPIPE | nix::errno::Errno::ECONNRESET => TransportError::PeerGone,
            other => TransportError::Nix(other),
        })?;
        if sent != encoded.len() {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short write on framed connection",
            )));
        }
        Ok(())
    }

    /// Flush any frames queued by [`Self::queue_send`].
    pub fn flush(&mut self) -> Result<(), TransportError> {
        while let Some((frame, fds)) = self.outbound.pop_front() {
            self.write_frame(&frame, &fds)?;
        }
        Ok(())
    }

    /// Read exactly one message, blocking until a full frame (and its
    /// ancillary fds, if any) has arrived.
    pub fn read_message(&mut self) -> Result<Message, TransportError> {
        let mut header_buf = [0u8; HEADER_LEN];
        let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_FDS_PER_MESSAGE]);
        let mut iov = [IoSliceMut::new(&mut header_buf)];
        let msg = socket::recvmsg::<()>(
            self.socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::empty(),
        )
        .map_err(|e| match e {
            nix::errno::Errno::ECONNRESET => TransportError::PeerGone,
            other => TransportError::Nix(other),
        })?;

        if msg.bytes == 0 {
            return Err(TransportError::PeerGone);
        }
        if msg.bytes < HEADER_LEN {
            return Err(TransportError::Pod(crate::error::PodError::MalformedPod(
                "short frame header",
            )));
        }

        let mut fds = Vec::new();
        for cmsg in msg.cmsgs().map_err(TransportError::Nix)? {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                fds.extend(received);
            }
        }

        let header = FrameHeader::decode(&header_buf);
        let payload_len = header.payload_len();
        let mut payload = vec![0u8; payload_len];
        if payload_len > 0 {
            let mut iov = [IoSliceMut::new(&mut payload)];
            let body = socket::recvmsg::<()>(self.socket.as_raw_fd(), &mut iov, None, MsgFlags::empty())
                .map_err(TransportError::from)?;
            if body.bytes != payload_len {
                return Err(TransportError::PeerGone);
            }
        }

        Ok(Message { object_id: header.object_id, opcode: header.opcode, payload, fds })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::{self, Value};

    #[test]
    fn roundtrip_frame_without_fds() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sender = Connection::new(a);
        let mut receiver = Connection::new(b);

        let payload = pod::encode(&Value::Int(42));
        let frame = Frame::new(1, 7, payload.clone()).unwrap();
        sender.write_frame(&frame, &[]).unwrap();

        let msg = receiver.read_message().unwrap();
        assert_eq!(msg.object_id, 1);
        assert_eq!(msg.opcode, 7);
        assert_eq!(msg.payload, payload);
        assert!(msg.fds.is_empty());
    }

    #[test]
    fn roundtrip_frame_with_attached_fd() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sender = Connection::new(a);
        let mut receiver = Connection::new(b);

        let shared = std::fs::File::open("/dev/null").unwrap();
        let fd = shared.as_raw_fd();

        let payload = pod::encode(&Value::Fd(0));
        let frame = Frame::new(2, 1, payload).unwrap();
        sender.write_frame(&frame, &[fd]).unwrap();

        let msg = receiver.read_message().unwrap();
        assert_eq!(msg.fds.len(), 1);

        let decoded = pod::decode(&msg.payload).unwrap();
        assert_eq!(decoded, Value::Fd(0));

        for f in msg.fds {
            unsafe {
                nix::unistd::close(f).ok();
            }
        }
    }

    #[test]
    fn rejects_too_many_fds() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut sender = Connection::new(a);
        let frame = Frame::new(0, 0, vec![]).unwrap();
        let fds = vec![0; MAX_FDS_PER_MESSAGE + 1];
        let err = sender.queue_send(frame, &fds).unwrap_err();
        assert!(matches!(err, TransportError::FdExhausted));
    }

    #[test]
    fn queue_send_delivers_fds_through_flush() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sender = Connection::new(a);
        let mut receiver = Connection::new(b);

        let shared = std::fs::File::open("/dev/null").unwrap();
        let fd = shared.as_raw_fd();

        let payload = pod::encode(&Value::Fd(0));
        let frame = Frame::new(3, 1, payload).unwrap();
        sender.queue_send(frame, &[fd]).unwrap();
        sender.flush().unwrap();

        let msg = receiver.read_message().unwrap();
        assert_eq!(msg.fds.len(), 1, "fd queued via queue_send must reach the peer, not be dropped");

        for f in msg.fds {
            unsafe {
                nix::unistd::close(f).ok();
            }
        }
    }

    #[test]
    fn peer_gone_on_closed_socket() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let mut receiver = Connection::new(a);
        let err = receiver.read_message().unwrap_err();
        assert!(matches!(err, TransportError::PeerGone));
    }
}
