//! Descriptor pool.
//!
//! Descriptors are handed out by value and come back by value, so a descriptor
//! can not be released twice.

use parking_lot::Mutex;

use super::iocb::IocbQ;

#[derive(Debug)]
struct PoolState {
    free: Vec<IocbQ>,
    outstanding: usize,
}

#[derive(Debug)]
pub struct IocbPool {
    capacity: usize,
    state: Mutex<PoolState>,
}

impl IocbPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                outstanding: 0,
            }),
        }
    }

    /// Takes a cleared descriptor, or `None` when `capacity` descriptors are
    /// already out.
    pub fn get(&self) -> Option<IocbQ> {
        let mut state = self.state.lock();
        if state.outstanding >= self.capacity {
            return None;
        }
        state.outstanding += 1;
        let mut iocbq = state.free.pop().unwrap_or_else(IocbQ::empty);
        iocbq.pooled = true;
        Some(iocbq)
    }

    /// Returns a descriptor. Descriptors the pool never handed out are
    /// dropped.
    pub fn release(&self, mut iocbq: IocbQ) {
        if !iocbq.pooled {
            return;
        }
        iocbq.reset();
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.free.len() < self.capacity {
            state.free.push(iocbq);
        }
    }

    /// Descriptors currently handed out.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
