//! Bounded pool of reusable datagram buffers
//!
//! Reliable object-update packets stay in memory until acknowledged, so they
//! borrow their retransmission copy from this pool. A [`PooledBuffer`] goes back
//! to the pool when it is dropped.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct BufferPool {
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
    buffer_size: usize,
    wait: Duration,
}

impl BufferPool {
    /// Preallocate `capacity` buffers of `buffer_size` bytes each
    pub fn new(capacity: usize, buffer_size: usize, wait: Duration) -> Self {
        let (free_tx, free_rx) = bounded(capacity);
        for _ in 0..capacity {
            let _ = free_tx.try_send(Vec::with_capacity(buffer_size));
        }
        Self {
            free_tx,
            free_rx,
            buffer_size,
            wait,
        }
    }

    /// Take a buffer, waiting briefly when the pool is empty.
    ///
    /// Falls back to a fresh allocation when nothing comes back in time; that
    /// buffer joins the pool on release if there is room.
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = match self.free_rx.recv_timeout(self.wait) {
            Ok(buffer) => buffer,
            Err(_) => {
                trace!("Buffer pool exhausted, allocating");
                Vec::with_capacity(self.buffer_size)
            }
        };
        PooledBuffer {
            buffer,
            home: self.free_tx.clone(),
        }
    }

    /// Buffers currently sitting in the pool
    pub fn available(&self) -> usize {
        self.free_rx.len()
    }
}

/// A pool buffer that returns itself on drop
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Vec<u8>,
    home: Sender<Vec<u8>>,
}

impl PooledBuffer {
    pub fn fill(&mut self, data: &[u8]) {
        self.buffer.clear();
        self.buffer.extend_from_slice(data);
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.clear();
        // A full pool just lets the extra buffer go
        let _ = self.home.try_send(buffer);
    }
}
