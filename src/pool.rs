//! Free lists for the per-exchange buffers.
//!
//! Purely a throughput optimization: removing the pools changes no
//! observable behavior, only allocation pressure under concurrent load.
//! Guards clear their buffer on release so nothing from a finished
//! exchange survives into the next borrower.

use std::{
    ops::{Deref, DerefMut},
    sync::Mutex,
};

use bytes::BytesMut;

use crate::config::COPY_BUF_SIZE;

/// Fixed-size byte buffers for tunnel and body copies.
#[derive(Debug, Default)]
pub(crate) struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub(crate) fn acquire(&self) -> CopyBuf<'_> {
        let buf = self
            .free
            .lock()
            .expect("buffer pool lock")
            .pop()
            .unwrap_or_else(|| vec![0u8; COPY_BUF_SIZE]);
        CopyBuf { pool: self, buf }
    }

    fn release(&self, buf: Vec<u8>) {
        self.free.lock().expect("buffer pool lock").push(buf);
    }
}

pub(crate) struct CopyBuf<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
}

impl Deref for CopyBuf<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for CopyBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for CopyBuf<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

/// Staging buffers for serializing request and response heads.
#[derive(Debug, Default)]
pub(crate) struct ScratchPool {
    free: Mutex<Vec<BytesMut>>,
}

impl ScratchPool {
    pub(crate) fn acquire(&self) -> Scratch<'_> {
        let buf = self
            .free
            .lock()
            .expect("scratch pool lock")
            .pop()
            .unwrap_or_default();
        Scratch { pool: self, buf }
    }

    fn release(&self, mut buf: BytesMut) {
        buf.clear();
        self.free.lock().expect("scratch pool lock").push(buf);
    }
}

pub(crate) struct Scratch<'a> {
    pool: &'a ScratchPool,
    buf: BytesMut,
}

impl Deref for Scratch<'_> {
    type Target = BytesMut;
    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for Scratch<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for Scratch<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}
