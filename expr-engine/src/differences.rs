//! Exhaustive search for inputs on which backends disagree.
//!
//! Every representable double between the bounds is visited by stepping its
//! bit pattern, which is why both bounds must have the same sign.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, info};

use crate::backend::{Backend, BackendKind};
use crate::expression::Expression;

/// Samples evaluated to calibrate [`DifferenceSearch::estimate`], divided by
/// the combined weight of the backends.
pub const CALIBRATION_BUDGET: u64 = 250_000;

/// Relative cost of one sample on a remote backend.
const REMOTE_WEIGHT: u64 = 3000;
const LOCAL_WEIGHT: u64 = 1;

/// Correction for the thread pool never scaling linearly.
const MULTITHREAD_PENALTY: u32 = 4;

const CHUNK_LEN: u64 = 1 << 14;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SearchError {
    #[error("at least two backends are needed, got {0}")]
    NotEnoughBackends(usize),

    #[error("invalid range [{start}, {end}]: bounds must be finite, non-zero, ordered and of the same sign")]
    InvalidRange { start: f64, end: f64 },

    #[error("search was cancelled")]
    Cancelled,
}

/// An input on which the backends produced different results.
#[derive(Debug, Clone, PartialEq)]
pub struct Difference {
    pub x: f64,
    /// One result per backend, in the order the backends were given.
    pub results: SmallVec<[f64; 4]>,
}

impl Difference {
    pub fn min(&self) -> f64 {
        self.results.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.results.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Distance between the extreme results, NaN if any result is NaN.
    pub fn spread(&self) -> f64 {
        if self.results.iter().any(|y| y.is_nan()) {
            return f64::NAN;
        }
        self.max() - self.min()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub samples: u64,
    /// `None` when the estimate does not fit in a `Duration`.
    pub duration: Option<Duration>,
}

pub struct DifferenceSearch {
    expressions: Vec<Expression>,
    lo: u64,
    hi: u64,
    cancel: Arc<AtomicBool>,
}

impl DifferenceSearch {
    /// Prepare a search of `expression` bound to each of `backends`, over every
    /// double in `[start, end]`.
    pub fn new(
        expression: &Expression,
        backends: &[Arc<Backend>],
        start: f64,
        end: f64,
    ) -> Result<DifferenceSearch, SearchError> {
        if backends.len() < 2 {
            return Err(SearchError::NotEnoughBackends(backends.len()));
        }

        let valid = start.is_finite()
            && end.is_finite()
            && start < end
            && start != 0.0
            && end != 0.0
            && start.is_sign_negative() == end.is_sign_negative();
        if !valid {
            return Err(SearchError::InvalidRange { start, end });
        }

        // Negative doubles grow in magnitude with their bit pattern.
        let (a, b) = (start.to_bits(), end.to_bits());
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };

        let expressions = backends
            .iter()
            .map(|backend| expression.with_backend(backend.clone()))
            .collect();

        Ok(DifferenceSearch {
            expressions,
            lo,
            hi,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Number of doubles in the range, bounds included.
    pub fn sample_count(&self) -> u64 {
        self.hi - self.lo + 1
    }

    /// Flag that stops a running search when set.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Compare the backends at a single input.
    pub fn compare(&self, x: f64) -> Option<Difference> {
        let results: SmallVec<[f64; 4]> = self.expressions.iter().map(|e| e.evaluate(x)).collect();
        let first = results[0];
        let agree = results[1..]
            .iter()
            .all(|&y| y == first || (y.is_nan() && first.is_nan()));
        if agree {
            None
        } else {
            Some(Difference { x, results })
        }
    }

    fn weight(&self) -> u64 {
        self.expressions
            .iter()
            .map(|e| match e.backend().kind() {
                BackendKind::Remote => REMOTE_WEIGHT,
                _ => LOCAL_WEIGHT,
            })
            .sum()
    }

    /// Time a prefix of the range on this thread and extrapolate to the whole
    /// range on the thread pool.
    pub fn estimate(&self) -> Estimate {
        let samples = self.sample_count();
        let calibration = (CALIBRATION_BUDGET / self.weight()).max(1);
        if samples <= calibration {
            return Estimate {
                samples,
                duration: Some(Duration::ZERO),
            };
        }

        let started = Instant::now();
        for bits in self.lo..self.lo + calibration {
            std::hint::black_box(self.compare(f64::from_bits(bits)));
        }
        let elapsed = started.elapsed();

        let threads = rayon::current_num_threads().max(1) as f64;
        let seconds =
            elapsed.as_secs_f64() * samples as f64 / calibration as f64 / threads * MULTITHREAD_PENALTY as f64;
        debug!(samples, calibration, ?elapsed, seconds, "estimated search");

        Estimate {
            samples,
            duration: Duration::try_from_secs_f64(seconds).ok(),
        }
    }

    /// Visit every sample on the thread pool and return the differences in
    /// ascending bit-pattern order.
    ///
    /// `progress` is called with `(done, total)` after every finished chunk,
    /// from worker threads.
    pub fn run<P>(&self, progress: P) -> Result<Vec<Difference>, SearchError>
    where
        P: Fn(u64, u64) + Send + Sync,
    {
        let total = self.sample_count();
        let chunks = total.div_ceil(CHUNK_LEN);
        let done = AtomicU64::new(0);
        let started = Instant::now();

        let found: Vec<Vec<Difference>> = (0..chunks)
            .into_par_iter()
            .map(|chunk| {
                if self.cancel.load(Ordering::Relaxed) {
                    return Err(SearchError::Cancelled);
                }

                let first = self.lo + chunk * CHUNK_LEN;
                let last = (first + CHUNK_LEN - 1).min(self.hi);
                let differences: Vec<Difference> = (first..=last)
                    .filter_map(|bits| self.compare(f64::from_bits(bits)))
                    .collect();

                let finished = done.fetch_add(last - first + 1, Ordering::Relaxed) + last - first + 1;
                progress(finished, total);
                Ok(differences)
            })
            .collect::<Result<_, _>>()?;

        let differences: Vec<Difference> = found.into_iter().flatten().collect();
        info!(
            samples = total,
            differences = differences.len(),
            elapsed = ?started.elapsed(),
            "search finished"
        );
        Ok(differences)
    }
}
