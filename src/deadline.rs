//! Inactivity deadlines for stream reads and writes.
//!
//! [`DeadlineRead`] and [`DeadlineWrite`] decorate one direction of a
//! stream with an idle timeout. Arming is amortized: the deadline moves
//! forward only after I/O progress, and only once more than half the idle
//! window has elapsed since it was last set. True inactivity is therefore
//! detected within 1.5x the nominal window in the worst case, without a
//! timer update on every read or write.

use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{Instant, Sleep, sleep_until},
};

/// Arming state for one direction.
#[derive(Debug)]
struct IdleTimer {
    idle: Duration,
    armed_at: Option<Instant>,
    timer: Option<Pin<Box<Sleep>>>,
}

impl IdleTimer {
    fn new(idle: Duration) -> Self {
        Self {
            idle,
            armed_at: None,
            timer: None,
        }
    }

    /// Switches the idle window; the next poll arms a fresh deadline.
    fn set_idle(&mut self, idle: Duration) {
        self.idle = idle;
        self.armed_at = None;
    }

    /// Checked before the inner I/O poll. Arms on first use; a fired timer
    /// means the window elapsed without progress.
    fn check(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if self.idle.is_zero() {
            return Ok(());
        }
        if self.armed_at.is_none() {
            self.arm(Instant::now());
        }
        let timer = self.timer.as_mut().expect("timer armed");
        if timer.as_mut().poll(cx).is_ready() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout"));
        }
        Ok(())
    }

    /// Called after a poll that made progress. Re-arms only once more than
    /// half the window has elapsed since the last arm; re-arming on a
    /// timer-driven wakeup instead would push the deadline forever.
    fn progress(&mut self) {
        if self.idle.is_zero() {
            return;
        }
        let now = Instant::now();
        match self.armed_at {
            Some(at) if now.duration_since(at) <= self.idle / 2 => {}
            _ => self.arm(now),
        }
    }

    fn arm(&mut self, now: Instant) {
        let deadline = now + self.idle;
        match self.timer.as_mut() {
            Some(timer) => timer.as_mut().reset(deadline),
            None => self.timer = Some(Box::pin(sleep_until(deadline))),
        }
        self.armed_at = Some(now);
    }
}

/// Read half decorated with an inactivity deadline.
pub(crate) struct DeadlineRead<R> {
    inner: R,
    timer: IdleTimer,
}

impl<R> DeadlineRead<R> {
    pub(crate) fn new(inner: R, idle: Duration) -> Self {
        Self {
            inner,
            timer: IdleTimer::new(idle),
        }
    }

    pub(crate) fn set_idle(&mut self, idle: Duration) {
        self.timer.set_idle(idle);
    }

    pub(crate) fn clear_idle(&mut self) {
        self.timer.set_idle(Duration::ZERO);
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DeadlineRead<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.timer.check(cx)?;
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(res, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.timer.progress();
        }
        res
    }
}

/// Write half decorated with an inactivity deadline.
pub(crate) struct DeadlineWrite<W> {
    inner: W,
    timer: IdleTimer,
}

impl<W> DeadlineWrite<W> {
    pub(crate) fn new(inner: W, idle: Duration) -> Self {
        Self {
            inner,
            timer: IdleTimer::new(idle),
        }
    }

    pub(crate) fn set_idle(&mut self, idle: Duration) {
        self.timer.set_idle(idle);
    }

    pub(crate) fn clear_idle(&mut self) {
        self.timer.set_idle(Duration::ZERO);
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for DeadlineWrite<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        this.timer.check(cx)?;
        let res = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(res, Poll::Ready(Ok(n)) if n > 0) {
            this.timer.progress();
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.timer.check(cx)?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
