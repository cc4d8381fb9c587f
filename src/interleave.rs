//! Seeded weighted interleaving of several record streams.
//!
//! Each pull draws one source according to the weights of the sources that
//! still have records. A source that runs dry is dropped from later draws;
//! the merged stream ends only once every source is exhausted.

use rand::Rng;
use tracing::warn;

use crate::constants::pipeline::WEIGHT_SUM_TOLERANCE;
use crate::data::RecordSet;
use crate::errors::CorpusError;

#[derive(Debug, Clone)]
/// Small deterministic RNG used for reproducible shuffles and draws.
pub(crate) struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    pub(crate) fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64_internal(&mut self) -> u64 {
        let mut z = self.state.wrapping_add(0x9E3779B97F4A7C15);
        self.state = z;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }
}

impl rand::RngCore for DeterministicRng {
    fn next_u32(&mut self) -> u32 {
        self.next_u64_internal() as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.next_u64_internal()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let mut offset = 0;
        while offset < dest.len() {
            let bytes = self.next_u64_internal().to_le_bytes();
            let copy_len = (dest.len() - offset).min(bytes.len());
            dest[offset..offset + copy_len].copy_from_slice(&bytes[..copy_len]);
            offset += copy_len;
        }
    }
}

/// Validate explicit weights or derive uniform ones for `source_count` sources.
///
/// Uniform weights put the floating-point remainder on the last source so the
/// total is exactly one.
pub fn resolve_weights(
    explicit: Option<&[f64]>,
    source_count: usize,
) -> Result<Vec<f64>, CorpusError> {
    if source_count == 0 {
        return Err(CorpusError::Configuration(
            "at least one source is required for interleaving".to_string(),
        ));
    }
    match explicit {
        Some(weights) => {
            if weights.len() != source_count {
                return Err(CorpusError::Configuration(format!(
                    "got {} interleaving weights for {} sources",
                    weights.len(),
                    source_count
                )));
            }
            if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(CorpusError::Configuration(
                    "interleaving weights must be finite and non-negative".to_string(),
                ));
            }
            let sum: f64 = weights.iter().sum();
            if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
                return Err(CorpusError::Configuration(format!(
                    "interleaving weights must sum to 1, but sum to {sum}"
                )));
            }
            Ok(weights.to_vec())
        }
        None => {
            if source_count > 1 {
                warn!(
                    "[asr_corpus:interleave] no source weights given; sampling uniformly, which over-represents smaller sources"
                );
            }
            let mut weights = vec![1.0 / source_count as f64; source_count];
            let head: f64 = weights[..source_count - 1].iter().sum();
            weights[source_count - 1] = 1.0 - head;
            Ok(weights)
        }
    }
}

/// Iterator adapter performing the weighted all-exhausted merge.
pub struct Interleave<I: Iterator> {
    sources: Vec<I>,
    weights: Vec<f64>,
    active: Vec<bool>,
    remaining: usize,
    rng: DeterministicRng,
}

impl<I: Iterator> Interleave<I> {
    /// Build a merge over `sources` with pre-validated `weights`.
    pub fn new(sources: Vec<I>, weights: Vec<f64>, seed: u64) -> Result<Self, CorpusError> {
        if sources.len() != weights.len() {
            return Err(CorpusError::Configuration(format!(
                "got {} interleaving weights for {} sources",
                weights.len(),
                sources.len()
            )));
        }
        let count = sources.len();
        Ok(Self {
            sources,
            weights,
            active: vec![true; count],
            remaining: count,
            rng: DeterministicRng::new(seed),
        })
    }

    fn draw(&mut self) -> usize {
        let total: f64 = self
            .weights
            .iter()
            .zip(&self.active)
            .filter(|(_, active)| **active)
            .map(|(weight, _)| *weight)
            .sum();
        let first_active = self.active.iter().position(|active| *active).unwrap_or(0);
        if total <= 0.0 {
            return first_active;
        }
        let target = self.rng.random::<f64>() * total;
        let mut cumulative = 0.0;
        let mut last_active = first_active;
        for (idx, weight) in self.weights.iter().enumerate() {
            if !self.active[idx] {
                continue;
            }
            cumulative += weight;
            last_active = idx;
            if target < cumulative {
                return idx;
            }
        }
        last_active
    }
}

impl<I: Iterator> Iterator for Interleave<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            let idx = self.draw();
            match self.sources[idx].next() {
                Some(item) => return Some(item),
                None => {
                    self.active[idx] = false;
                    self.remaining -= 1;
                }
            }
        }
        None
    }
}

/// Merge several record sets into one seeded, weighted stream.
pub fn interleave(
    sources: Vec<RecordSet>,
    weights: Option<&[f64]>,
    seed: u64,
) -> Result<RecordSet, CorpusError> {
    let weights = resolve_weights(weights, sources.len())?;
    let streams = sources.into_iter().map(RecordSet::into_stream).collect();
    Ok(RecordSet::stream(Interleave::new(streams, weights, seed)?))
}
