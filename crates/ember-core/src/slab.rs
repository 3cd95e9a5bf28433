// src/slab.rs
use crate::error::{EmberError, EmberResult};
use crate::http::conn::Conn;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, PoisonError};

const NIL: usize = usize::MAX;

/// Fixed table of connection slots. A slot's index doubles as its epoll token
/// and its timer id. Slots are shared with workers through `Arc<Mutex<Conn>>`;
/// the free list itself is only touched by the reactor thread.
pub struct ConnectionSlab {
    entries: Box<[Arc<Mutex<Conn>>]>,
    // next free index per slot, NIL-terminated
    next_free: Box<[usize]>,
    in_use: Box<[bool]>,
    head_free: usize,
    active_count: usize,
}

impl ConnectionSlab {
    /// Allocates every slot and its buffers once, up front.
    pub fn new(capacity: usize, read_capacity: usize, write_capacity: usize) -> Self {
        let entries: Vec<_> = (0..capacity)
            .map(|_| Arc::new(Mutex::new(Conn::new(read_capacity, write_capacity))))
            .collect();
        let next_free: Vec<usize> = (0..capacity)
            .map(|i| if i + 1 == capacity { NIL } else { i + 1 })
            .collect();

        Self {
            entries: entries.into_boxed_slice(),
            next_free: next_free.into_boxed_slice(),
            in_use: vec![false; capacity].into_boxed_slice(),
            head_free: if capacity == 0 { NIL } else { 0 },
            active_count: 0,
        }
    }

    /// O(1) allocation. The socket is closed if the table is full.
    pub fn allocate(&mut self, socket: OwnedFd, peer: Option<SocketAddr>) -> EmberResult<usize> {
        if self.head_free == NIL {
            return Err(EmberError::SlabFull);
        }

        let idx = self.head_free;
        self.head_free = self.next_free[idx];
        self.next_free[idx] = NIL;
        self.in_use[idx] = true;
        self.active_count += 1;

        self.entries[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open(socket, peer);
        Ok(idx)
    }

    /// O(1) release. The caller has already closed the connection.
    pub fn free(&mut self, index: usize) {
        if !self.in_use.get(index).copied().unwrap_or(false) {
            return; // Double free prevention
        }

        self.in_use[index] = false;
        self.next_free[index] = self.head_free;
        self.head_free = index;
        self.active_count -= 1;
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&Arc<Mutex<Conn>>> {
        self.entries.get(index)
    }

    #[inline]
    pub fn is_allocated(&self, index: usize) -> bool {
        self.in_use.get(index).copied().unwrap_or(false)
    }

    /// Indices of every allocated slot.
    pub fn allocated(&self) -> impl Iterator<Item = usize> + '_ {
        self.in_use
            .iter()
            .enumerate()
            .filter_map(|(i, used)| used.then_some(i))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.active_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}
