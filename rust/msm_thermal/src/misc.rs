// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use sscanf::sscanf;

/// Read a file and parse its content into the specified type.
///
/// Trims null and whitespace before parsing.
pub fn read_from_file<T>(path: &Path) -> Result<T>
where
    T: std::str::FromStr,
{
    let val = match std::fs::read_to_string(path) {
        Ok(val) => val,
        Err(e) => {
            bail!("Failed to open or read file {:?} ({})", path, e);
        }
    };
    let val = val.trim_end_matches('\0');

    match val.trim().parse::<T>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => {
            bail!("Failed to parse content '{}' from {:?}", val.trim(), path);
        }
    }
}

/// Write `val` to a sysfs attribute.
pub fn write_to_file(path: &Path, val: impl std::fmt::Display) -> Result<()> {
    std::fs::write(path, val.to_string())
        .map_err(|e| anyhow!("Failed to write {:?} ({})", path, e))
}

/// Parse a kernel cpu list such as "0-3,6,8-9".
pub fn parse_cpu_list(list: &str) -> Result<Vec<usize>> {
    let list = list.trim_end_matches('\0').trim();
    let mut cpus = vec![];
    if list.is_empty() {
        return Ok(cpus);
    }

    for group in list.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpu list {}", list);
                }
            },
        };
        if min > max {
            bail!("Invalid cpu range {} in {}", group.trim(), list);
        }
        cpus.extend(min..=max);
    }

    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Burst-per-interval limiter for log lines on paths that can fire every
/// tick. Same defaults as the kernel's printk rate limit.
#[derive(Debug)]
pub struct RateLimit {
    interval: Duration,
    burst: u32,
    inner: Mutex<RateLimitState>,
}

#[derive(Debug)]
struct RateLimitState {
    begin: Option<Instant>,
    printed: u32,
    missed: u32,
}

impl RateLimit {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_BURST: u32 = 10;

    pub fn new(interval: Duration, burst: u32) -> Self {
        Self {
            interval,
            burst,
            inner: Mutex::new(RateLimitState {
                begin: None,
                printed: 0,
                missed: 0,
            }),
        }
    }

    /// Returns `Some(missed)` when the caller may log, where `missed` is the
    /// number of suppressed calls since the last window closed.
    pub fn check_at(&self, now: Instant) -> Option<u32> {
        let mut st = match self.inner.lock() {
            Ok(st) => st,
            Err(poisoned) => poisoned.into_inner(),
        };

        let expired = match st.begin {
            Some(begin) => now.saturating_duration_since(begin) >= self.interval,
            None => true,
        };
        let mut missed = 0;
        if expired {
            st.begin = Some(now);
            st.printed = 0;
            missed = std::mem::take(&mut st.missed);
        }

        if st.printed < self.burst {
            st.printed += 1;
            Some(missed)
        } else {
            st.missed += 1;
            None
        }
    }

    pub fn check(&self) -> Option<u32> {
        self.check_at(Instant::now())
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL, Self::DEFAULT_BURST)
    }
}

/// `log::info!` through a [`RateLimit`].
#[macro_export]
macro_rules! info_ratelimited {
    ($rl:expr, $($arg:tt)+) => {
        if let Some(missed) = $rl.check() {
            if missed > 0 {
                log::info!("{} messages suppressed", missed);
            }
            log::info!($($arg)+);
        }
    };
}

/// `log::warn!` through a [`RateLimit`].
#[macro_export]
macro_rules! warn_ratelimited {
    ($rl:expr, $($arg:tt)+) => {
        if let Some(missed) = $rl.check() {
            if missed > 0 {
                log::warn!("{} messages suppressed", missed);
            }
            log::warn!($($arg)+);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3\n").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("0,2-3,7").unwrap(), vec![0, 2, 3, 7]);
        assert_eq!(parse_cpu_list("0").unwrap(), vec![0]);
        assert!(parse_cpu_list("\n").unwrap().is_empty());
        assert!(parse_cpu_list("3-1").is_err());
        assert!(parse_cpu_list("a-b").is_err());
    }

    #[test]
    fn test_read_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("temp");
        std::fs::write(&path, "41500\n").unwrap();
        assert_eq!(read_from_file::<i64>(&path).unwrap(), 41500);

        std::fs::write(&path, "garbage").unwrap();
        assert!(read_from_file::<i64>(&path).is_err());
        assert!(read_from_file::<i64>(&tmp.path().join("missing")).is_err());
    }

    #[test]
    fn test_rate_limit_burst_and_window() {
        let rl = RateLimit::new(Duration::from_secs(5), 2);
        let t0 = Instant::now();

        assert_eq!(rl.check_at(t0), Some(0));
        assert_eq!(rl.check_at(t0), Some(0));
        assert_eq!(rl.check_at(t0 + Duration::from_secs(1)), None);
        assert_eq!(rl.check_at(t0 + Duration::from_secs(2)), None);

        // New window reports what was dropped.
        assert_eq!(rl.check_at(t0 + Duration::from_secs(5)), Some(2));
        assert_eq!(rl.check_at(t0 + Duration::from_secs(6)), Some(0));
        assert_eq!(rl.check_at(t0 + Duration::from_secs(6)), None);
    }
}
