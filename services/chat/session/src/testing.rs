//! In-memory streams for exercising partial I/O schedules.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::session::{SessionEvent, SessionState};

/// One scripted outcome of a `poll_read`.
pub(crate) enum ReadStep {
    Data(Vec<u8>),
    Eof,
    Fail(io::ErrorKind),
}

/// One scripted outcome of a `poll_write`.
pub(crate) enum WriteStep {
    Accept(usize),
    Zero,
    Fail(io::ErrorKind),
}

/// In-memory stream replaying scripted partial reads and writes.
#[derive(Default)]
pub(crate) struct ScriptedStream {
    pub(crate) reads: VecDeque<ReadStep>,
    pub(crate) writes: VecDeque<WriteStep>,
    pub(crate) written: Vec<u8>,
    pub(crate) read_calls: usize,
}

impl AsyncRead for ScriptedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.read_calls += 1;
        match this.reads.pop_front() {
            Some(ReadStep::Data(mut bytes)) => {
                let take = bytes.len().min(buf.remaining());
                buf.put_slice(&bytes[..take]);
                if take < bytes.len() {
                    let rest = bytes.split_off(take);
                    this.reads.push_front(ReadStep::Data(rest));
                }
                Poll::Ready(Ok(()))
            }
            Some(ReadStep::Fail(kind)) => Poll::Ready(Err(io::Error::new(kind, "scripted"))),
            Some(ReadStep::Eof) | None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for ScriptedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.writes.pop_front() {
            Some(WriteStep::Accept(n)) => {
                let n = n.min(buf.len());
                this.written.extend_from_slice(&buf[..n]);
                Poll::Ready(Ok(n))
            }
            Some(WriteStep::Zero) => Poll::Ready(Ok(0)),
            Some(WriteStep::Fail(kind)) => Poll::Ready(Err(io::Error::new(kind, "scripted"))),
            None => {
                this.written.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// States entered, in order, among the events already queued on `rx`.
pub(crate) fn entered_states(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionState> {
    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SessionEvent::StateChanged { to, .. } = event {
            states.push(to);
        }
    }
    states
}
