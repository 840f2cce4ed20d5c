//! Local debugger port allocation
//!
//! Each debuggable client gets a local port from a fixed base upward. Ports
//! are handed out lowest-first and become reusable once released.

use std::collections::BTreeSet;
use std::sync::Mutex;

use adbridge_core::prelude::*;

#[derive(Debug)]
pub struct DebugPortAllocator {
    base: u16,
    in_use: Mutex<BTreeSet<u16>>,
}

impl DebugPortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            base,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Lowest free port at or above the base, or `None` when exhausted.
    pub fn allocate(&self) -> Option<u16> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        let port = (self.base..=u16::MAX).find(|port| !in_use.contains(port))?;
        in_use.insert(port);
        trace!("Allocated debugger port {}", port);
        Some(port)
    }

    pub fn release(&self, port: u16) {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        if !in_use.remove(&port) {
            debug!("Released debugger port {} that was not allocated", port);
        }
    }

    pub fn in_use(&self) -> Vec<u16> {
        self.in_use
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }
}
