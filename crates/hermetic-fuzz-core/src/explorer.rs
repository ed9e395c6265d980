//! Exploration engines feeding candidate inputs to a fuzzing loop.
//!
//! The adapter only needs [`Explorer::next_candidate`] and
//! [`Explorer::invoke`]; how candidates are generated is up to the engine.
//! Two engines ship with the crate: a seeded mutation engine and a channel
//! fed from another thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::corpus::ReplayInput;
use crate::finding::Finding;
use crate::isolation::ExecutionContextHandle;
use crate::target::FuzzTarget;

/// Cooperative stop signal checked between invocations.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Source of candidate inputs for one fuzz target.
pub trait Explorer {
    /// Provenance of the input exploration starts from, if any.
    fn initial_input(&self, target: &FuzzTarget) -> Option<String>;

    /// Next candidate, waiting at most `wait`. `None` means nothing arrived
    /// in time.
    fn next_candidate(&mut self, handle: &ExecutionContextHandle, wait: Duration)
        -> Option<Vec<u8>>;

    /// Apply one candidate to the target.
    fn invoke(&mut self, handle: &ExecutionContextHandle, input: &[u8]) -> Finding {
        handle.invoke(input)
    }
}

const BOUNDARY_BYTES: [u8; 6] = [0x00, 0x01, 0x7F, 0x80, 0xFE, 0xFF];

/// Seeded byte-level mutation engine.
///
/// Replays its seeds verbatim first (the empty input when it has none), then
/// mutates randomly picked seeds. Stops after `budget` candidates.
pub struct MutationExplorer {
    rng: StdRng,
    seeds: Vec<ReplayInput>,
    max_len: usize,
    budget: usize,
    produced: usize,
}

impl MutationExplorer {
    pub const DEFAULT_BUDGET: usize = 10_000;
    pub const DEFAULT_MAX_LEN: usize = 4096;

    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            seeds: Vec::new(),
            max_len: Self::DEFAULT_MAX_LEN,
            budget: Self::DEFAULT_BUDGET,
            produced: 0,
        }
    }

    pub fn with_seeds(mut self, seeds: Vec<ReplayInput>) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len.max(1);
        self
    }

    pub fn produced(&self) -> usize {
        self.produced
    }

    fn mutate(&mut self, buf: &mut Vec<u8>) {
        let rounds = self.rng.gen_range(1..=4);
        for _ in 0..rounds {
            match self.rng.gen_range(0..4) {
                0 => self.bitflip(buf),
                1 => self.insert_byte(buf),
                2 => self.delete_byte(buf),
                _ => self.overwrite_byte(buf),
            }
        }
    }

    /// ~40% boundary values, the rest uniform.
    fn gen_byte(&mut self) -> u8 {
        if self.rng.gen_bool(0.4) {
            BOUNDARY_BYTES[self.rng.gen_range(0..BOUNDARY_BYTES.len())]
        } else {
            self.rng.gen()
        }
    }

    fn bitflip(&mut self, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }
        let idx = self.rng.gen_range(0..buf.len());
        let bit: u8 = 1 << self.rng.gen_range(0..8u32);
        buf[idx] ^= bit;
    }

    fn insert_byte(&mut self, buf: &mut Vec<u8>) {
        if buf.len() >= self.max_len {
            return;
        }
        let idx = self.rng.gen_range(0..=buf.len());
        let val = self.gen_byte();
        buf.insert(idx, val);
    }

    fn delete_byte(&mut self, buf: &mut Vec<u8>) {
        if buf.is_empty() {
            return;
        }
        let idx = self.rng.gen_range(0..buf.len());
        buf.remove(idx);
    }

    fn overwrite_byte(&mut self, buf: &mut Vec<u8>) {
        let val = self.gen_byte();
        if buf.is_empty() {
            buf.push(val);
            return;
        }
        let idx = self.rng.gen_range(0..buf.len());
        buf[idx] = val;
    }
}

impl Explorer for MutationExplorer {
    fn initial_input(&self, _target: &FuzzTarget) -> Option<String> {
        self.seeds.first().map(|s| s.label.clone())
    }

    fn next_candidate(
        &mut self,
        _handle: &ExecutionContextHandle,
        _wait: Duration,
    ) -> Option<Vec<u8>> {
        if self.produced >= self.budget {
            return None;
        }
        let verbatim = self.seeds.len().max(1);
        let candidate = if self.produced < verbatim {
            self.seeds
                .get(self.produced)
                .map(|s| s.data.clone())
                .unwrap_or_default()
        } else {
            let mut buf = if self.seeds.is_empty() {
                Vec::new()
            } else {
                let idx = self.rng.gen_range(0..self.seeds.len());
                self.seeds[idx].data.clone()
            };
            self.mutate(&mut buf);
            buf.truncate(self.max_len);
            buf
        };
        self.produced += 1;
        Some(candidate)
    }
}

/// Candidates pushed from elsewhere through a channel.
pub struct ChannelExplorer {
    rx: Receiver<Vec<u8>>,
    initial_input: Option<String>,
}

impl ChannelExplorer {
    pub fn new() -> (Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel();
        (
            tx,
            Self {
                rx,
                initial_input: None,
            },
        )
    }

    pub fn with_initial_input(mut self, provenance: impl Into<String>) -> Self {
        self.initial_input = Some(provenance.into());
        self
    }
}

impl Explorer for ChannelExplorer {
    fn initial_input(&self, _target: &FuzzTarget) -> Option<String> {
        self.initial_input.clone()
    }

    fn next_candidate(
        &mut self,
        _handle: &ExecutionContextHandle,
        wait: Duration,
    ) -> Option<Vec<u8>> {
        match self.rx.recv_timeout(wait) {
            Ok(candidate) => Some(candidate),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("candidate channel disconnected");
                None
            }
        }
    }
}
