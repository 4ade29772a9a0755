/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::time::Duration;

use allocative::Allocative;
use serde::Deserialize;
use serde::Serialize;
use tcf_util::config::TcfConfig;
use tcf_util::retry::RetryPolicy;

#[derive(Allocative, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocatorConfig {
    pub keepalive_period_ms: u64,
    pub request_timeout_ms: u64,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_window_ms: u64,
    /// Bound on removals at shutdown, per server.
    pub teardown_timeout_ms: u64,
    /// Creation requests in flight at once, across runs.
    pub max_concurrent_servers: usize,
    pub priority: Option<u32>,
    pub preempt: Option<bool>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            keepalive_period_ms: 5_000,
            request_timeout_ms: 60_000,
            retry_initial_delay_ms: 250,
            retry_max_delay_ms: 4_000,
            retry_window_ms: 30_000,
            teardown_timeout_ms: 10_000,
            max_concurrent_servers: 16,
            priority: None,
            preempt: None,
        }
    }
}

impl AllocatorConfig {
    pub fn from_config(config: &TcfConfig) -> anyhow::Result<Self> {
        let default = Self::default();
        let section = "allocation";
        let keepalive_period_ms = config
            .parse(section, "keepalive_period_ms")?
            .unwrap_or(default.keepalive_period_ms);
        if keepalive_period_ms == 0 {
            anyhow::bail!("allocation.keepalive_period_ms must be positive");
        }
        Ok(Self {
            keepalive_period_ms,
            request_timeout_ms: config
                .parse(section, "request_timeout_ms")?
                .unwrap_or(default.request_timeout_ms),
            retry_initial_delay_ms: config
                .parse(section, "retry_initial_delay_ms")?
                .unwrap_or(default.retry_initial_delay_ms),
            retry_max_delay_ms: config
                .parse(section, "retry_max_delay_ms")?
                .unwrap_or(default.retry_max_delay_ms),
            retry_window_ms: config
                .parse(section, "retry_window_ms")?
                .unwrap_or(default.retry_window_ms),
            teardown_timeout_ms: config
                .parse(section, "teardown_timeout_ms")?
                .unwrap_or(default.teardown_timeout_ms),
            max_concurrent_servers: config
                .parse::<usize>(section, "max_concurrent_servers")?
                .unwrap_or(default.max_concurrent_servers)
                .max(1),
            priority: config.parse(section, "priority")?,
            preempt: config.parse(section, "preempt")?,
        })
    }

    pub fn keepalive_period(&self) -> Duration {
        Duration::from_millis(self.keepalive_period_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            window: Duration::from_millis(self.retry_window_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() -> anyhow::Result<()> {
        assert_eq!(
            AllocatorConfig::default(),
            AllocatorConfig::from_config(&TcfConfig::empty())?
        );
        let config = TcfConfig::parse_str(
            "[allocation]\nkeepalive_period_ms = 1000\npriority = 300\npreempt = true\nretry_window_ms = 500\n",
            "test",
        )?;
        let alloc = AllocatorConfig::from_config(&config)?;
        assert_eq!(Duration::from_secs(1), alloc.keepalive_period());
        assert_eq!(Some(300), alloc.priority);
        assert_eq!(Some(true), alloc.preempt);
        assert_eq!(Duration::from_millis(500), alloc.retry_policy().window);

        let zero = TcfConfig::parse_str("[allocation]\nkeepalive_period_ms = 0\n", "test")?;
        assert!(AllocatorConfig::from_config(&zero).is_err());
        Ok(())
    }
}
