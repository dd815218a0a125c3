//! Workload storms against the allocator with machine-readable reports.
//!
//! Each storm drives one fresh context through a deterministic operation
//! pattern, aggregates which engine tiers served the traffic from the
//! lifecycle trace, and emits a JSON or markdown summary.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use tagmalloc_core::{MallocConfig, MallocContext};

/// Deterministic generator shared by every storm.
#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        low + (self.next_u64() as usize) % (high_inclusive - low + 1)
    }
}

/// Operation pattern of a storm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StormType {
    /// Fill every slot, then drain them all, repeatedly.
    Sawtooth,
    /// Uniform random allocate/release/resize.
    RandomChurn,
    /// Alternate between two size classes to stress the caches.
    SizeClassThrash,
    /// Bias toward requests past the mapping threshold.
    MappedHeavy,
}

impl StormType {
    pub fn as_str(self) -> &'static str {
        match self {
            StormType::Sawtooth => "sawtooth",
            StormType::RandomChurn => "random_churn",
            StormType::SizeClassThrash => "size_class_thrash",
            StormType::MappedHeavy => "mapped_heavy",
        }
    }

    pub fn all() -> [StormType; 4] {
        [
            StormType::Sawtooth,
            StormType::RandomChurn,
            StormType::SizeClassThrash,
            StormType::MappedHeavy,
        ]
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sawtooth" => Some(StormType::Sawtooth),
            "random_churn" | "churn" => Some(StormType::RandomChurn),
            "size_class_thrash" | "thrash" => Some(StormType::SizeClassThrash),
            "mapped_heavy" | "mapped" => Some(StormType::MappedHeavy),
            _ => None,
        }
    }
}

/// Storm parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StormConfig {
    pub storm: StormType,
    pub seed: u64,
    pub ops: usize,
    pub slots: usize,
}

impl Default for StormConfig {
    fn default() -> Self {
        Self {
            storm: StormType::RandomChurn,
            seed: 0xDEAD_BEEF,
            ops: 100_000,
            slots: 512,
        }
    }
}

/// Aggregated result of one storm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StormReport {
    pub storm: String,
    pub seed: u64,
    pub ops: usize,
    pub duration_ms: u128,
    pub peak_live_bytes: usize,
    pub end_system_bytes: usize,
    pub end_held_bytes: usize,
    pub peak_mapped_count: usize,
    pub arenas: usize,
    /// Operations per engine tier, keyed `symbol/path`.
    pub path_counts: BTreeMap<String, u64>,
    pub trimmed: bool,
}

impl StormReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("## storm `{}`\n\n", self.storm));
        out.push_str(&format!("- seed: {:#x}\n", self.seed));
        out.push_str(&format!("- ops: {}\n", self.ops));
        out.push_str(&format!("- duration: {} ms\n", self.duration_ms));
        out.push_str(&format!("- peak live bytes: {}\n", self.peak_live_bytes));
        out.push_str(&format!("- end system bytes: {}\n", self.end_system_bytes));
        out.push_str(&format!("- peak mapped chunks: {}\n", self.peak_mapped_count));
        out.push_str(&format!("- arenas: {}\n", self.arenas));
        out.push_str(&format!("- trimmed: {}\n\n", self.trimmed));
        out.push_str("| path | count |\n|------|-------|\n");
        for (path, count) in &self.path_counts {
            out.push_str(&format!("| {path} | {count} |\n"));
        }
        out
    }
}

struct SlotState {
    ptr: usize,
    len: usize,
}

/// Runs one storm on a fresh context and reports the outcome.
pub fn run_storm(config: StormConfig) -> StormReport {
    let ctx = MallocContext::with_config(MallocConfig {
        trace: true,
        read_env: false,
        ..MallocConfig::default()
    });
    let t = ctx.thread();
    let mut rng = XorShift64::new(config.seed);
    let mut slots: Vec<Option<SlotState>> = (0..config.slots.max(1)).map(|_| None).collect();

    let mut live_bytes = 0usize;
    let mut peak_live_bytes = 0usize;
    let mut peak_mapped_count = 0usize;
    let mut path_counts: BTreeMap<String, u64> = BTreeMap::new();

    let absorb_trace = |ctx: &MallocContext, counts: &mut BTreeMap<String, u64>| {
        for event in ctx.trace_events() {
            *counts
                .entry(format!("{}/{}", event.symbol, event.path))
                .or_insert(0) += 1;
        }
    };

    let started = Instant::now();
    for op in 0..config.ops {
        let idx = rng.gen_range(0, slots.len() - 1);
        let len = match config.storm {
            StormType::Sawtooth => rng.gen_range(16, 4096),
            StormType::RandomChurn => rng.gen_range(1, 8192),
            StormType::SizeClassThrash => {
                if op % 2 == 0 {
                    24
                } else {
                    192
                }
            }
            StormType::MappedHeavy => {
                if rng.next_u64() % 4 == 0 {
                    rng.gen_range(150_000, 400_000)
                } else {
                    rng.gen_range(64, 512)
                }
            }
        };

        let fill = matches!(config.storm, StormType::Sawtooth) && (op / slots.len()) % 2 == 0;
        match slots[idx].take() {
            Some(slot) => {
                if fill || rng.next_u64() % 8 == 0 {
                    if let Ok(ptr) = t.realloc(slot.ptr, len) {
                        live_bytes = live_bytes - slot.len + len;
                        slots[idx] = Some(SlotState { ptr, len });
                    } else {
                        live_bytes -= slot.len;
                    }
                } else {
                    t.free(slot.ptr);
                    live_bytes -= slot.len;
                }
            }
            None => {
                if let Ok(ptr) = t.malloc(len) {
                    live_bytes += len;
                    slots[idx] = Some(SlotState { ptr, len });
                }
            }
        }
        peak_live_bytes = peak_live_bytes.max(live_bytes);
        peak_mapped_count = peak_mapped_count.max(ctx.stats().mapped_count);
        if op % 2048 == 0 {
            absorb_trace(&ctx, &mut path_counts);
        }
    }

    for slot in slots.iter_mut() {
        if let Some(s) = slot.take() {
            t.free(s.ptr);
        }
    }
    absorb_trace(&ctx, &mut path_counts);
    let trimmed = ctx.trim(0);
    let duration_ms = started.elapsed().as_millis();

    let stats = ctx.stats();
    StormReport {
        storm: config.storm.as_str().to_string(),
        seed: config.seed,
        ops: config.ops,
        duration_ms,
        peak_live_bytes,
        end_system_bytes: stats.system_bytes,
        end_held_bytes: stats.held_bytes,
        peak_mapped_count,
        arenas: stats.arenas,
        path_counts,
        trimmed,
    }
}
