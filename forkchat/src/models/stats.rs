//! Generation statistics reported by the model server at the end of a stream.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Throughput figures for one completed turn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    /// Generated tokens per second of evaluation time.
    pub tokens_per_second: f64,
    /// Number of generated tokens.
    pub eval_count: u64,
    /// Wall time of the whole request, in nanoseconds.
    pub total_duration_ns: u64,
}

impl GenerationStats {
    /// Build stats from the server's raw counters.
    ///
    /// Returns `None` when the evaluation duration is zero, since no rate can
    /// be computed from it.
    #[allow(clippy::cast_precision_loss)]
    pub fn from_counts(eval_count: u64, eval_duration_ns: u64, total_duration_ns: u64) -> Option<Self> {
        if eval_duration_ns == 0 {
            return None;
        }
        let seconds = eval_duration_ns as f64 / 1e9;
        Some(Self {
            tokens_per_second: eval_count as f64 / seconds,
            eval_count,
            total_duration_ns,
        })
    }

    pub const fn total_duration(&self) -> Duration {
        Duration::from_nanos(self.total_duration_ns)
    }
}

impl std::fmt::Display for GenerationStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.1} tok/s, {} tokens, {:.1}s",
            self.tokens_per_second,
            self.eval_count,
            self.total_duration().as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_tokens_per_second() {
        let stats = GenerationStats::from_counts(10, 2_000_000_000, 3_000_000_000).unwrap();
        assert!((stats.tokens_per_second - 5.0).abs() < f64::EPSILON);
        assert_eq!(stats.total_duration(), Duration::from_secs(3));
    }

    #[test]
    fn zero_duration_yields_nothing() {
        assert!(GenerationStats::from_counts(10, 0, 0).is_none());
    }

    #[test]
    fn display_is_compact() {
        let stats = GenerationStats::from_counts(10, 2_000_000_000, 2_500_000_000).unwrap();
        assert_eq!(stats.to_string(), "5.0 tok/s, 10 tokens, 2.5s");
    }
}
