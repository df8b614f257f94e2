//! Process-wide statistics registry.
//!
//! Statistics are an instrumentation sideband: named counters and sampled
//! variables that any thread may bump, snapshotted at shutdown, merged
//! across ranks and optionally written to a JSON file.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use byteorder::{LittleEndian, ReadBytesExt};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Error, Result};

/// Monotonically increasing event count.
#[derive(Default)]
pub struct Counter {
    total: AtomicU64,
}

impl Counter {
    #[inline]
    pub fn add(&self, incr: u64) {
        self.total.fetch_add(incr, Ordering::Relaxed);
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

#[derive(Default, Clone, Copy)]
struct VariableState {
    sum: f64,
    sum2: f64,
    n: u64,
}

/// A sampled quantity tracking sum, sum of squares and sample count.
#[derive(Default)]
pub struct Variable {
    state: Mutex<VariableState>,
}

impl Variable {
    pub fn add(&self, value: f64) {
        let mut s = self.state.lock();
        s.sum += value;
        s.sum2 += value * value;
        s.n += 1;
    }

    pub fn num_samples(&self) -> u64 {
        self.state.lock().n
    }

    pub fn sum(&self) -> f64 {
        self.state.lock().sum
    }

    pub fn mean(&self) -> Option<f64> {
        let s = self.state.lock();
        (s.n > 0).then(|| s.sum / s.n as f64)
    }

    pub fn stddev(&self) -> Option<f64> {
        let s = self.state.lock();
        if s.n < 2 {
            return None;
        }
        // Rounding can push the numerator slightly negative.
        let var = ((s.sum2 - s.sum * s.sum / s.n as f64) / (s.n - 1) as f64).max(0.0);
        Some(var.sqrt())
    }
}

enum Stat {
    Counter(Arc<Counter>),
    Variable(Arc<Variable>),
}

/// Registry of named statistics. One process-wide instance lives behind
/// [`registry`]; tests may build their own.
#[derive(Default)]
pub struct Registry {
    stats: Mutex<BTreeMap<String, Stat>>,
}

impl Registry {
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        let mut stats = self.stats.lock();
        match stats
            .entry(name.to_owned())
            .or_insert_with(|| Stat::Counter(Arc::new(Counter::default())))
        {
            Stat::Counter(c) => Arc::clone(c),
            Stat::Variable(_) => panic!("statistic {} is a variable, not a counter", name),
        }
    }

    pub fn variable(&self, name: &str) -> Arc<Variable> {
        let mut stats = self.stats.lock();
        match stats
            .entry(name.to_owned())
            .or_insert_with(|| Stat::Variable(Arc::new(Variable::default())))
        {
            Stat::Variable(v) => Arc::clone(v),
            Stat::Counter(_) => panic!("statistic {} is a counter, not a variable", name),
        }
    }

    /// Immutable copy of the current values, usable for reporting and for
    /// the cross-rank merge.
    pub fn snapshot(&self) -> Snapshot {
        let stats = self.stats.lock();
        let mut entries = BTreeMap::new();
        for (name, stat) in stats.iter() {
            let entry = match stat {
                Stat::Counter(c) => SnapshotStat::Counter { total: c.total() },
                Stat::Variable(v) => {
                    let s = *v.state.lock();
                    SnapshotStat::Variable {
                        sum: s.sum,
                        sum2: s.sum2,
                        n: s.n,
                    }
                }
            };
            entries.insert(name.clone(), entry);
        }
        Snapshot { entries }
    }

    /// Fold another rank's snapshot into this registry.
    pub fn merge(&self, other: &Snapshot) {
        for (name, stat) in &other.entries {
            match *stat {
                SnapshotStat::Counter { total } => self.counter(name).add(total),
                SnapshotStat::Variable { sum, sum2, n } => {
                    let var = self.variable(name);
                    let mut s = var.state.lock();
                    s.sum += sum;
                    s.sum2 += sum2;
                    s.n += n;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotStat {
    Counter { total: u64 },
    Variable { sum: f64, sum2: f64, n: u64 },
}

/// Serializable copy of a registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub entries: BTreeMap<String, SnapshotStat>,
}

impl Snapshot {
    /// Fixed little-endian encoding used for the shutdown stats collection.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (name, stat) in &self.entries {
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            match *stat {
                SnapshotStat::Counter { total } => {
                    out.push(0);
                    out.extend_from_slice(&total.to_le_bytes());
                }
                SnapshotStat::Variable { sum, sum2, n } => {
                    out.push(1);
                    out.extend_from_slice(&sum.to_le_bytes());
                    out.extend_from_slice(&sum2.to_le_bytes());
                    out.extend_from_slice(&n.to_le_bytes());
                }
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Snapshot> {
        let bad = |msg: &str| Error::Internal(format!("stats blob: {}", msg));
        let mut cur = Cursor::new(bytes);
        let count = cur
            .read_u32::<LittleEndian>()
            .map_err(|_| bad("truncated count"))?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let name_len = cur
                .read_u16::<LittleEndian>()
                .map_err(|_| bad("truncated name length"))? as usize;
            let mut name = vec![0u8; name_len];
            cur.read_exact(&mut name)
                .map_err(|_| bad("truncated name"))?;
            let name =
                String::from_utf8(name).map_err(|_| bad("statistic name is not UTF-8"))?;
            let kind = cur.read_u8().map_err(|_| bad("truncated kind"))?;
            let stat = match kind {
                0 => SnapshotStat::Counter {
                    total: cur
                        .read_u64::<LittleEndian>()
                        .map_err(|_| bad("truncated counter"))?,
                },
                1 => SnapshotStat::Variable {
                    sum: cur
                        .read_f64::<LittleEndian>()
                        .map_err(|_| bad("truncated variable"))?,
                    sum2: cur
                        .read_f64::<LittleEndian>()
                        .map_err(|_| bad("truncated variable"))?,
                    n: cur
                        .read_u64::<LittleEndian>()
                        .map_err(|_| bad("truncated variable"))?,
                },
                k => return Err(bad(&format!("unknown statistic kind {}", k))),
            };
            entries.insert(name, stat);
        }
        Ok(Snapshot { entries })
    }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// The process-wide registry.
pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::default)
}

/// Shorthand for a counter in the process-wide registry.
pub fn counter(name: &str) -> Arc<Counter> {
    registry().counter(name)
}

/// Shorthand for a variable in the process-wide registry.
pub fn variable(name: &str) -> Arc<Variable> {
    registry().variable(name)
}

/// RAII timer that records elapsed seconds into a registry variable and
/// logs the phase at debug level on drop.
pub struct Timed {
    name: &'static str,
    stat: Arc<Variable>,
    start: Instant,
}

impl Timed {
    pub fn new(name: &'static str) -> Self {
        log::trace!("{}...", name);
        Timed {
            name,
            stat: variable(name),
            start: Instant::now(),
        }
    }
}

impl Drop for Timed {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        self.stat.add(elapsed.as_secs_f64());
        log::debug!("{}: {:.3?}", self.name, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_and_variable() {
        let reg = Registry::default();
        reg.counter("c").add(3);
        reg.counter("c").add(4);
        assert_eq!(reg.counter("c").total(), 7);

        let v = reg.variable("v");
        v.add(1.0);
        v.add(3.0);
        assert_eq!(v.num_samples(), 2);
        assert_eq!(v.mean(), Some(2.0));
        assert!((v.stddev().unwrap() - std::f64::consts::SQRT_2).abs() < 1e-12);
    }

    #[test]
    fn snapshot_round_trip_and_merge() {
        let reg = Registry::default();
        reg.counter("splats.nonfinite").add(17);
        reg.variable("pass1.time").add(0.25);

        let snap = reg.snapshot();
        let decoded = Snapshot::decode(&snap.encode()).unwrap();
        assert_eq!(decoded, snap);

        let root = Registry::default();
        root.counter("splats.nonfinite").add(1);
        root.merge(&decoded);
        assert_eq!(root.counter("splats.nonfinite").total(), 18);
        assert_eq!(root.variable("pass1.time").num_samples(), 1);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Snapshot::decode(&[1, 2]).is_err());
        let mut bytes = Snapshot::default().encode();
        bytes[0] = 5; // claims five entries, provides none
        assert!(Snapshot::decode(&bytes).is_err());
    }
}
