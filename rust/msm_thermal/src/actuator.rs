// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Applies a frequency ceiling.
//!
//! An actuation publishes the new ceiling, adjusts the set of online CPUs
//! according to the hot-plug tiers and asks the policy subsystem to
//! re-evaluate every online CPU so the notifier can clamp it. The whole body
//! runs under one mutex which also owns the core lifecycle backend, so two
//! actuations never interleave and nothing else touches hot-plug.
//!
//! Hot-plug and policy failures are logged and counted but never undo the
//! ceiling: the frequency cap is the part that keeps the device safe.

use std::sync::Arc;
use std::sync::Mutex;

use log::debug;
use log::warn;
use metrics::counter;
use metrics::gauge;
use metrics::Counter;
use metrics::Gauge;

use crate::hotplug::cpu_offline_wrapper;
use crate::hotplug::cpu_online_wrapper;
use crate::hotplug::CoreLifecycle;
use crate::hotplug::HotplugTiers;
use crate::ladder::FREQ_UNLIMITED;
use crate::misc::RateLimit;
use crate::policy::FreqPolicy;
use crate::state::ThermalContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actuation {
    /// The requested ceiling was already in effect.
    Unchanged,
    Applied {
        ceiling: u32,
        onlined: Vec<usize>,
        offlined: Vec<usize>,
    },
}

struct Metrics {
    actuations: Counter,
    online_failures: Counter,
    offline_failures: Counter,
    policy_errors: Counter,
    ceiling_khz: Gauge,
}

impl Metrics {
    fn new() -> Self {
        Self {
            actuations: counter!("thermal_actuations_total"),
            online_failures: counter!("thermal_hotplug_failures_total", "op" => "online"),
            offline_failures: counter!("thermal_hotplug_failures_total", "op" => "offline"),
            policy_errors: counter!("thermal_policy_errors_total"),
            ceiling_khz: gauge!("thermal_ceiling_khz"),
        }
    }
}

pub struct Actuator {
    ctx: Arc<ThermalContext>,
    policy: Arc<dyn FreqPolicy>,
    tiers: HotplugTiers,
    cores: Mutex<Box<dyn CoreLifecycle>>,
    log_limit: RateLimit,
    metrics: Metrics,
}

impl Actuator {
    pub fn new(
        ctx: Arc<ThermalContext>,
        policy: Arc<dyn FreqPolicy>,
        cores: Box<dyn CoreLifecycle>,
        tiers: HotplugTiers,
    ) -> Self {
        Self {
            ctx,
            policy,
            tiers,
            cores: Mutex::new(cores),
            log_limit: RateLimit::default(),
            metrics: Metrics::new(),
        }
    }

    pub fn context(&self) -> &Arc<ThermalContext> {
        &self.ctx
    }

    pub fn tiers(&self) -> &HotplugTiers {
        &self.tiers
    }

    pub fn online_cpus(&self) -> Vec<usize> {
        self.lock_cores().online_cpus()
    }

    fn lock_cores(&self) -> std::sync::MutexGuard<'_, Box<dyn CoreLifecycle>> {
        // A panic inside a backend must not wedge throttling forever.
        match self.cores.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make `max_freq` the enforced ceiling. A no-op when it already is.
    pub fn limit_cpu_freqs(&self, max_freq: u32) -> Actuation {
        let mut cores = self.lock_cores();
        let state = &self.ctx.state;

        if state.max_allowed_freq() == max_freq {
            return Actuation::Unchanged;
        }

        state.begin_change(max_freq);
        self.metrics.actuations.increment(1);
        // 0 reads as "no limit" on dashboards.
        self.metrics.ceiling_khz.set(if max_freq == FREQ_UNLIMITED {
            0.0
        } else {
            max_freq as f64
        });
        crate::info_ratelimited!(
            self.log_limit,
            "msm_thermal: Setting cpu max frequency to {}",
            fmt_freq(max_freq)
        );

        let mut onlined = vec![];
        if cores.online_count() < cores.max_cores() {
            for cpu in self.tiers.to_online(max_freq) {
                match cpu_online_wrapper(cores.as_mut(), cpu) {
                    Ok(true) => onlined.push(cpu),
                    Ok(false) => {}
                    Err(e) => {
                        warn!("{:#}", e);
                        self.metrics.online_failures.increment(1);
                    }
                }
            }
        }

        for cpu in cores.online_cpus() {
            if let Err(e) = self.policy.request_policy_reevaluation(cpu) {
                warn!("Failed to update cpu{} policy: {:#}", cpu, e);
                self.metrics.policy_errors.increment(1);
            }
        }

        let mut offlined = vec![];
        if let Some(cpu) = self.tiers.to_offline(max_freq) {
            match cpu_offline_wrapper(cores.as_mut(), cpu) {
                Ok(true) => offlined.push(cpu),
                Ok(false) => {}
                Err(e) => {
                    warn!("{:#}", e);
                    self.metrics.offline_failures.increment(1);
                }
            }
        }

        state.end_change();

        debug!(
            "ceiling={} onlined={:?} offlined={:?}",
            fmt_freq(max_freq),
            onlined,
            offlined
        );

        Actuation::Applied {
            ceiling: max_freq,
            onlined,
            offlined,
        }
    }
}

pub fn fmt_freq(freq: u32) -> String {
    if freq == FREQ_UNLIMITED {
        "unlimited".to_string()
    } else {
        freq.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ladder::FREQ_BBQ;
    use crate::ladder::FREQ_ZIPPY;
    use crate::policy::NotifierId;
    use crate::policy::PolicyNotifier;
    use anyhow::bail;
    use anyhow::Result;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    #[derive(Default)]
    struct CountingPolicy {
        updates: AtomicUsize,
    }

    impl FreqPolicy for CountingPolicy {
        fn register_notifier(&self, _: Arc<dyn PolicyNotifier>) -> Result<NotifierId> {
            Ok(NotifierId(0))
        }

        fn unregister_notifier(&self, _: NotifierId) -> Result<()> {
            Ok(())
        }

        fn request_policy_reevaluation(&self, _: usize) -> Result<()> {
            self.updates.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct Cores {
        online: Vec<bool>,
        broken: bool,
    }

    impl CoreLifecycle for Cores {
        fn bring_online(&mut self, cpu: usize) -> Result<()> {
            if self.broken {
                bail!("EBUSY");
            }
            self.online[cpu] = true;
            Ok(())
        }

        fn take_offline(&mut self, cpu: usize) -> Result<()> {
            if self.broken {
                bail!("EBUSY");
            }
            self.online[cpu] = false;
            Ok(())
        }

        fn is_online(&self, cpu: usize) -> bool {
            self.online.get(cpu).copied().unwrap_or(false)
        }

        fn online_count(&self) -> usize {
            self.online.iter().filter(|on| **on).count()
        }

        fn max_cores(&self) -> usize {
            self.online.len()
        }
    }

    fn actuator(online: Vec<bool>, broken: bool) -> (Actuator, Arc<CountingPolicy>) {
        let policy = Arc::new(CountingPolicy::default());
        let act = Actuator::new(
            Arc::new(ThermalContext::default()),
            policy.clone(),
            Box::new(Cores { online, broken }),
            HotplugTiers::reference(),
        );
        (act, policy)
    }

    #[test]
    fn test_same_ceiling_is_noop() {
        let (act, policy) = actuator(vec![true; 4], false);
        assert_eq!(act.limit_cpu_freqs(FREQ_UNLIMITED), Actuation::Unchanged);
        assert_eq!(policy.updates.load(Ordering::Relaxed), 0);

        assert!(matches!(act.limit_cpu_freqs(FREQ_ZIPPY), Actuation::Applied { .. }));
        assert_eq!(act.limit_cpu_freqs(FREQ_ZIPPY), Actuation::Unchanged);
        assert_eq!(policy.updates.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_pending_change_cleared() {
        let (act, _) = actuator(vec![true; 4], false);
        act.limit_cpu_freqs(FREQ_BBQ);
        let state = &act.context().state;
        assert_eq!(state.max_allowed_freq(), FREQ_BBQ);
        assert!(!state.pending_change());
    }

    #[test]
    fn test_hotplug_failure_keeps_ceiling() {
        let (act, policy) = actuator(vec![true; 4], true);
        let res = act.limit_cpu_freqs(FREQ_BBQ);
        assert_eq!(
            res,
            Actuation::Applied {
                ceiling: FREQ_BBQ,
                onlined: vec![],
                offlined: vec![],
            }
        );
        assert_eq!(act.context().state.max_allowed_freq(), FREQ_BBQ);
        assert_eq!(policy.updates.load(Ordering::Relaxed), 4);
        assert_eq!(act.online_cpus(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_fmt_freq() {
        assert_eq!(fmt_freq(FREQ_UNLIMITED), "unlimited");
        assert_eq!(fmt_freq(FREQ_BBQ), "1036800");
    }
}
