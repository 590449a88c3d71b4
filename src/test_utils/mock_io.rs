//! In-memory datagram sources and frame sinks for pipeline tests

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use crate::reassembly::AssembledFrame;
use crate::receiver::{DatagramSource, Receive};
use crate::sink::{FrameSink, SinkError};

/// Source that yields a fixed list of datagrams, then reports exhaustion
#[derive(Debug, Default)]
pub struct MemorySource {
    datagrams: VecDeque<Vec<u8>>,
    /// Emit `TimedOut` instead of `Exhausted` once drained
    hold_open: bool,
}

impl MemorySource {
    /// Source yielding `datagrams` in order
    pub fn new(datagrams: Vec<Vec<u8>>) -> Self {
        Self {
            datagrams: datagrams.into(),
            hold_open: false,
        }
    }

    /// Keep reporting timeouts after the last datagram, like an idle socket
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

impl DatagramSource for MemorySource {
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<Receive> {
        match self.datagrams.pop_front() {
            Some(datagram) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok(Receive::Datagram(len))
            }
            None if self.hold_open => {
                std::thread::sleep(std::time::Duration::from_millis(1));
                Ok(Receive::TimedOut)
            }
            None => Ok(Receive::Exhausted),
        }
    }
}

/// Sink that stores frames in a shared list the test keeps a handle to
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    frames: Arc<Mutex<Vec<AssembledFrame>>>,
    finished: Arc<Mutex<bool>>,
    /// Reject every n-th frame (1-based); 0 accepts everything
    reject_every: usize,
    seen: usize,
}

impl CollectingSink {
    /// Sink that accepts every frame
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that fails on every `n`-th frame
    pub fn rejecting_every(n: usize) -> Self {
        Self {
            reject_every: n,
            ..Self::default()
        }
    }

    /// Frames accepted so far
    pub fn frames(&self) -> Vec<AssembledFrame> {
        self.frames.lock().map(|f| f.clone()).unwrap_or_default()
    }

    /// Whether `finish` has been called
    pub fn is_finished(&self) -> bool {
        self.finished.lock().map(|f| *f).unwrap_or(false)
    }
}

impl FrameSink for CollectingSink {
    fn accept(&mut self, frame: AssembledFrame) -> Result<(), SinkError> {
        self.seen += 1;
        if self.reject_every != 0 && self.seen % self.reject_every == 0 {
            return Err(SinkError::Rejected(format!("frame {}", self.seen)));
        }
        if let Ok(mut frames) = self.frames.lock() {
            frames.push(frame);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        if let Ok(mut finished) = self.finished.lock() {
            *finished = true;
        }
        Ok(())
    }
}
