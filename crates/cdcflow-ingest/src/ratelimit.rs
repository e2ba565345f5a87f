//! Job rate limiting
//!
//! A job carries at most one algorithm. The importer consults it before every sink
//! write; inventory dumpers consult it before every query. Each algorithm only
//! throttles the operation kinds it is responsible for and lets the others through.

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;

use cdcflow_common::{PipelineError, Result};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Kind of operation a permit is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOperationType {
    Insert,
    Update,
    Delete,
    Select,
}

impl PipelineOperationType {
    pub fn is_write(&self) -> bool {
        !matches!(self, PipelineOperationType::Select)
    }
}

/// Blocking, pluggable rate limit algorithm
pub trait JobRateLimitAlgorithm: Send + Sync + fmt::Debug {
    /// Block until `permits` operations of kind `operation` are allowed.
    fn intercept(&self, operation: PipelineOperationType, permits: u32);

    /// Algorithm name, used in logs
    fn kind(&self) -> RateLimitKind;
}

/// Governor limiter that blocks the calling thread instead of failing.
struct BlockingLimiter {
    limiter: DefaultDirectRateLimiter,
    clock: DefaultClock,
    permits_per_second: NonZeroU32,
}

impl BlockingLimiter {
    fn new(permits_per_second: u32) -> Result<Self> {
        let permits_per_second = NonZeroU32::new(permits_per_second).ok_or_else(|| {
            PipelineError::Config("rate limit permits per second must be greater than 0".to_string())
        })?;

        Ok(Self {
            limiter: RateLimiter::direct(Quota::per_second(permits_per_second)),
            clock: DefaultClock::default(),
            permits_per_second,
        })
    }

    fn acquire(&self, permits: u32) {
        for _ in 0..permits {
            while let Err(not_until) = self.limiter.check() {
                let wait = not_until.wait_time_from(self.clock.now());
                trace!(wait_ms = wait.as_millis() as u64, "Rate limited, waiting");
                thread::sleep(wait);
            }
        }
    }
}

impl fmt::Debug for BlockingLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingLimiter")
            .field("permits_per_second", &self.permits_per_second)
            .finish_non_exhaustive()
    }
}

/// Queries-per-second limit, applied to inventory selects only
#[derive(Debug)]
pub struct QpsJobRateLimitAlgorithm {
    limiter: BlockingLimiter,
}

impl QpsJobRateLimitAlgorithm {
    pub fn new(queries_per_second: u32) -> Result<Self> {
        Ok(Self {
            limiter: BlockingLimiter::new(queries_per_second)?,
        })
    }
}

impl JobRateLimitAlgorithm for QpsJobRateLimitAlgorithm {
    fn intercept(&self, operation: PipelineOperationType, permits: u32) {
        if operation == PipelineOperationType::Select {
            self.limiter.acquire(permits);
        }
    }

    fn kind(&self) -> RateLimitKind {
        RateLimitKind::Qps
    }
}

/// Transactions-per-second limit, applied to writes (insert, update, delete)
#[derive(Debug)]
pub struct TpsJobRateLimitAlgorithm {
    limiter: BlockingLimiter,
}

impl TpsJobRateLimitAlgorithm {
    pub fn new(transactions_per_second: u32) -> Result<Self> {
        Ok(Self {
            limiter: BlockingLimiter::new(transactions_per_second)?,
        })
    }
}

impl JobRateLimitAlgorithm for TpsJobRateLimitAlgorithm {
    fn intercept(&self, operation: PipelineOperationType, permits: u32) {
        if operation.is_write() {
            self.limiter.acquire(permits);
        }
    }

    fn kind(&self) -> RateLimitKind {
        RateLimitKind::Tps
    }
}

/// Which algorithm a [`RateLimitConfig`] builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitKind {
    Qps,
    Tps,
}

impl FromStr for RateLimitKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "qps" => Ok(RateLimitKind::Qps),
            "tps" => Ok(RateLimitKind::Tps),
            _ => Err(format!("Invalid rate limit kind: {}", s)),
        }
    }
}

impl fmt::Display for RateLimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitKind::Qps => write!(f, "qps"),
            RateLimitKind::Tps => write!(f, "tps"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub kind: RateLimitKind,
    pub permits_per_second: u32,
}

impl RateLimitConfig {
    pub fn new(kind: RateLimitKind, permits_per_second: u32) -> Self {
        Self {
            kind,
            permits_per_second,
        }
    }

    pub fn build(&self) -> Result<Arc<dyn JobRateLimitAlgorithm>> {
        let algorithm: Arc<dyn JobRateLimitAlgorithm> = match self.kind {
            RateLimitKind::Qps => Arc::new(QpsJobRateLimitAlgorithm::new(self.permits_per_second)?),
            RateLimitKind::Tps => Arc::new(TpsJobRateLimitAlgorithm::new(self.permits_per_second)?),
        };
        Ok(algorithm)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_zero_permits_is_rejected() {
        let err = RateLimitConfig::new(RateLimitKind::Tps, 0).build().unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_tps_blocks_writes_once_burst_is_spent() {
        let algorithm = RateLimitConfig::new(RateLimitKind::Tps, 10).build().unwrap();
        assert_eq!(algorithm.kind(), RateLimitKind::Tps);

        // The quota allows a burst of 10; the 11th and 12th permits need ~100ms each.
        let started = Instant::now();
        algorithm.intercept(PipelineOperationType::Insert, 10);
        algorithm.intercept(PipelineOperationType::Update, 2);
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_tps_ignores_selects() {
        let algorithm = TpsJobRateLimitAlgorithm::new(1).unwrap();
        let started = Instant::now();
        algorithm.intercept(PipelineOperationType::Select, 50);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_qps_ignores_writes() {
        let algorithm = QpsJobRateLimitAlgorithm::new(1).unwrap();
        let started = Instant::now();
        algorithm.intercept(PipelineOperationType::Insert, 50);
        algorithm.intercept(PipelineOperationType::Delete, 50);
        assert!(started.elapsed() < Duration::from_millis(100));

        algorithm.intercept(PipelineOperationType::Select, 1);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("QPS".parse::<RateLimitKind>().unwrap(), RateLimitKind::Qps);
        assert_eq!("tps".parse::<RateLimitKind>().unwrap(), RateLimitKind::Tps);
        assert!("rps".parse::<RateLimitKind>().is_err());
        assert_eq!(RateLimitKind::Qps.to_string(), "qps");
    }
}
