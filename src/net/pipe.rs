//! One direction of a mock connection.
//!
//! A [`Pipe`] is the readable buffer of one half-socket and the transmit
//! target of the other. Buffering is unbounded; chunks may be coalesced on
//! read but never reordered.

use std::collections::VecDeque;
use std::io;
use std::task::{Context, Poll, Waker};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::io::ReadBuf;

use crate::net::NetError;

/// What a successful poll produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// Bytes were copied (or the caller's buffer had no room).
    Data,
    /// The writer finished and every buffered byte has been read.
    Eof,
}

#[derive(Debug, Default)]
pub(crate) struct Pipe {
    inner: Mutex<PipeInner>,
}

#[derive(Debug, Default)]
struct PipeInner {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    finished: bool,
    failure: Option<NetError>,
    reader: Option<Waker>,
}

impl PipeInner {
    fn take_waker(&mut self) -> Option<Waker> {
        self.reader.take()
    }
}

impl Pipe {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Chunks pushed after [`finish`](Self::finish) are dropped.
    pub(crate) fn push(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        let waker = {
            let mut inner = self.inner.lock();
            if inner.finished {
                return;
            }
            inner.buffered += chunk.len();
            inner.chunks.push_back(chunk);
            inner.take_waker()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Mark end-of-stream. Returns `false` if it was already marked.
    pub(crate) fn finish(&self) -> bool {
        let waker = {
            let mut inner = self.inner.lock();
            if inner.finished {
                return false;
            }
            inner.finished = true;
            inner.take_waker()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// Make every read past the buffered data fail with `err`.
    pub(crate) fn fail(&self, err: NetError) {
        let waker = {
            let mut inner = self.inner.lock();
            inner.failure.get_or_insert(err);
            inner.take_waker()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Bytes waiting to be read.
    pub(crate) fn buffered(&self) -> usize {
        self.inner.lock().buffered
    }

    pub(crate) fn poll_read(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<ReadOutcome>> {
        let mut inner = self.inner.lock();

        let mut copied = 0;
        while buf.remaining() > 0 {
            let Some(front) = inner.chunks.front_mut() else {
                break;
            };
            let n = front.len().min(buf.remaining());
            buf.put_slice(&front[..n]);
            front.advance(n);
            if front.is_empty() {
                inner.chunks.pop_front();
            }
            copied += n;
        }
        inner.buffered -= copied;

        if copied > 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(ReadOutcome::Data));
        }
        if let Some(err) = &inner.failure {
            return Poll::Ready(Err(err.clone().into()));
        }
        if inner.finished {
            return Poll::Ready(Ok(ReadOutcome::Eof));
        }

        let stale = inner
            .reader
            .as_ref()
            .map_or(true, |waker| !waker.will_wake(cx.waker()));
        if stale {
            inner.reader = Some(cx.waker().clone());
        }
        Poll::Pending
    }
}
