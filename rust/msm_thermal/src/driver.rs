// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Driver lifecycle: everything between reading the configuration and the
//! first tick, and the teardown in reverse order.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use log::info;
use log::warn;

use crate::actuator::Actuator;
use crate::config::Config;
use crate::config::SensorConfig;
use crate::controller::Controller;
use crate::hotplug::CoreLifecycle;
use crate::hotplug::HotplugTiers;
use crate::policy::FreqPolicy;
use crate::policy::NotifierId;
use crate::policy::ThermalNotifier;
use crate::sensor::TemperatureSource;
use crate::state::ThermalContext;
use crate::state::Tunables;
use crate::sysfs::AdcChannel;
use crate::sysfs::SysfsCpufreq;
use crate::sysfs::SysfsHotplug;
use crate::sysfs::ThermalZone;
use crate::worker::ThermalWorker;

/// The external collaborators a driver instance binds to.
pub struct Backends {
    pub sensor: Box<dyn TemperatureSource>,
    pub policy: Arc<dyn FreqPolicy>,
    pub cores: Box<dyn CoreLifecycle>,
}

impl Backends {
    /// Sysfs backends under `config.sysfs_root`.
    pub fn sysfs(config: &Config) -> Result<Self> {
        let root = config.sysfs_root.as_path();
        Ok(Self {
            sensor: open_sensor(root, config)?,
            policy: Arc::new(SysfsCpufreq::new(root).context("Failed to open cpufreq")?),
            cores: Box::new(SysfsHotplug::new(root).context("Failed to open cpu hot-plug")?),
        })
    }
}

pub fn open_sensor(root: &Path, config: &Config) -> Result<Box<dyn TemperatureSource>> {
    let sensor: Box<dyn TemperatureSource> = match &config.sensor {
        Some(SensorConfig::ThermalZone { zone: Some(zone) }) => {
            Box::new(ThermalZone::new(root, *zone)?)
        }
        Some(SensorConfig::Adc {
            device,
            channel: Some(channel),
        }) => Box::new(AdcChannel::new(root, *device, *channel)?),
        _ => anyhow::bail!("No usable temperature sensor configured"),
    };
    Ok(sensor)
}

pub struct ThermalDriver {
    ctx: Arc<ThermalContext>,
    actuator: Arc<Actuator>,
    policy: Arc<dyn FreqPolicy>,
    notifier_id: Option<NotifierId>,
    worker: Option<ThermalWorker>,
}

impl ThermalDriver {
    pub fn probe(config: &Config, backends: Backends) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let ladder = config.build_ladder()?;
        let tiers = config.build_tiers(&ladder)?;
        let tiers = Self::fit_tiers(tiers, backends.cores.max_cores());

        let ctx = Arc::new(ThermalContext::new(Tunables::new(
            config.temp_threshold,
            config.safe_diff,
        )));

        let Backends {
            sensor,
            policy,
            cores,
        } = backends;
        let sensor_name = sensor.describe();

        let notifier_id = policy
            .register_notifier(Arc::new(ThermalNotifier::new(ctx.clone())))
            .context("Failed to register cpufreq notifier")?;

        let actuator = Arc::new(Actuator::new(ctx.clone(), policy.clone(), cores, tiers));
        let controller = Controller::new(ladder, actuator.clone(), sensor);

        let worker =
            match ThermalWorker::spawn(controller, config.initial_delay(), config.poll_interval()) {
                Ok(worker) => worker,
                Err(e) => {
                    if let Err(ue) = policy.unregister_notifier(notifier_id) {
                        warn!("Failed to unregister cpufreq notifier: {:#}", ue);
                    }
                    return Err(e);
                }
            };

        info!(
            "msm_thermal: sensor={} threshold={} safe_diff={} interval={}ms",
            sensor_name, config.temp_threshold, config.safe_diff, config.poll_ms
        );

        Ok(Self {
            ctx,
            actuator,
            policy,
            notifier_id: Some(notifier_id),
            worker: Some(worker),
        })
    }

    /// Drop tiers for CPUs this machine does not have.
    fn fit_tiers(tiers: HotplugTiers, max_cores: usize) -> HotplugTiers {
        let (kept, dropped): (Vec<_>, Vec<_>) = tiers
            .tiers()
            .iter()
            .copied()
            .partition(|tier| tier.cpu < max_cores);
        if dropped.is_empty() {
            return tiers;
        }
        for tier in dropped.iter() {
            warn!("Ignoring hot-plug tier for cpu{}, only {} cpus", tier.cpu, max_cores);
        }
        HotplugTiers::from_sorted(kept)
    }

    pub fn context(&self) -> &Arc<ThermalContext> {
        &self.ctx
    }

    pub fn actuator(&self) -> &Arc<Actuator> {
        &self.actuator
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map(|w| w.is_running()).unwrap_or(false)
    }

    /// Stop ticking, then detach from the policy subsystem.
    pub fn remove(mut self) -> Result<()> {
        self.teardown()
    }

    /// Both steps always run; the first failure is returned.
    fn teardown(&mut self) -> Result<()> {
        let stopped = match self.worker.take() {
            Some(mut worker) => worker.stop(),
            None => Ok(()),
        };
        let unregistered = match self.notifier_id.take() {
            Some(id) => self
                .policy
                .unregister_notifier(id)
                .context("Failed to unregister cpufreq notifier"),
            None => Ok(()),
        };
        stopped.and(unregistered)
    }
}

impl Drop for ThermalDriver {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("msm_thermal teardown: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyNotifier;
    use anyhow::bail;
    use std::sync::Mutex;
    use std::time::Duration;
    use std::time::Instant;

    struct Exploding;

    impl TemperatureSource for Exploding {
        fn read_temperature(&mut self) -> Result<i64> {
            panic!("sensor driver crashed");
        }
    }

    #[derive(Default)]
    struct Chain {
        notifiers: Mutex<Vec<NotifierId>>,
    }

    impl FreqPolicy for Chain {
        fn register_notifier(&self, _: Arc<dyn PolicyNotifier>) -> Result<NotifierId> {
            let mut notifiers = self.notifiers.lock().unwrap();
            let id = NotifierId(notifiers.len() as u64);
            notifiers.push(id);
            Ok(id)
        }

        fn unregister_notifier(&self, id: NotifierId) -> Result<()> {
            let mut notifiers = self.notifiers.lock().unwrap();
            let before = notifiers.len();
            notifiers.retain(|n| *n != id);
            if notifiers.len() == before {
                bail!("unknown notifier");
            }
            Ok(())
        }

        fn request_policy_reevaluation(&self, _: usize) -> Result<()> {
            Ok(())
        }
    }

    struct SingleCore;

    impl CoreLifecycle for SingleCore {
        fn bring_online(&mut self, _: usize) -> Result<()> {
            Ok(())
        }

        fn take_offline(&mut self, _: usize) -> Result<()> {
            bail!("cpu0 cannot go offline")
        }

        fn is_online(&self, cpu: usize) -> bool {
            cpu == 0
        }

        fn online_count(&self) -> usize {
            1
        }

        fn max_cores(&self) -> usize {
            1
        }
    }

    #[test]
    fn test_teardown_unregisters_after_worker_failure() {
        let policy = Arc::new(Chain::default());
        let config = Config {
            poll_ms: 5,
            initial_delay_ms: 0,
            ..Config::default()
        };
        let mut driver = ThermalDriver::probe(
            &config,
            Backends {
                sensor: Box::new(Exploding),
                policy: policy.clone(),
                cores: Box::new(SingleCore),
            },
        )
        .unwrap();
        assert!(driver.actuator().tiers().is_empty());

        let deadline = Instant::now() + Duration::from_secs(5);
        while driver.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!driver.is_running());

        let err = driver.teardown().unwrap_err();
        assert!(err.to_string().contains("panicked"));
        assert!(policy.notifiers.lock().unwrap().is_empty());

        // Nothing left for the drop pass.
        driver.teardown().unwrap();
    }
}
