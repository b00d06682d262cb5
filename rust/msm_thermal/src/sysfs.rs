// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Sysfs backends
//!
//! Linux implementations of the three collaborators the controller talks to.
//! Every backend takes the sysfs mount point as a parameter so it can be
//! pointed at a fake tree:
//!
//!```no_run
//!     use std::path::Path;
//!     use msm_thermal::sysfs::SysfsHotplug;
//!     let cores = SysfsHotplug::new(Path::new("/sys")).unwrap();
//!```
//!
//! - [`ThermalZone`] reads `class/thermal/thermal_zone<N>/temp`.
//! - [`AdcChannel`] reads an IIO temperature channel,
//!   `bus/iio/devices/iio:device<D>/in_temp<C>_input`.
//! - [`SysfsHotplug`] toggles `devices/system/cpu/cpu<N>/online`.
//! - [`SysfsCpufreq`] keeps the notifier chain in userspace and writes the
//!   resulting window to `cpu<N>/cpufreq/scaling_max_freq`.
//!
//! Temperatures in sysfs are milli-degrees Celsius; they are truncated to
//! whole degrees.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::RwLock;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use log::debug;
use log::info;
use log::warn;
use sscanf::sscanf;

use crate::hotplug::CoreLifecycle;
use crate::misc::parse_cpu_list;
use crate::misc::read_from_file;
use crate::misc::write_to_file;
use crate::policy::CpuPolicy;
use crate::policy::FreqPolicy;
use crate::policy::NotifierId;
use crate::policy::PolicyEvent;
use crate::policy::PolicyNotifier;
use crate::sensor::TemperatureSource;

pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

fn millis_to_degrees(millis: i64) -> i64 {
    millis / 1000
}

#[derive(Debug)]
pub struct ThermalZone {
    zone: u32,
    path: PathBuf,
}

impl ThermalZone {
    pub fn new(root: &Path, zone: u32) -> Result<Self> {
        let path = root
            .join("class/thermal")
            .join(format!("thermal_zone{zone}"))
            .join("temp");
        if !path.exists() {
            bail!("Thermal zone {} not found at {:?}", zone, path);
        }
        Ok(Self { zone, path })
    }
}

impl TemperatureSource for ThermalZone {
    fn read_temperature(&mut self) -> Result<i64> {
        read_from_file::<i64>(&self.path).map(millis_to_degrees)
    }

    fn describe(&self) -> String {
        format!("thermal_zone{}", self.zone)
    }
}

#[derive(Debug)]
pub struct AdcChannel {
    device: u32,
    channel: u32,
    path: PathBuf,
}

impl AdcChannel {
    pub fn new(root: &Path, device: u32, channel: u32) -> Result<Self> {
        let path = root
            .join("bus/iio/devices")
            .join(format!("iio:device{device}"))
            .join(format!("in_temp{channel}_input"));
        if !path.exists() {
            bail!(
                "ADC channel {} of iio:device{} not found at {:?}",
                channel,
                device,
                path
            );
        }
        Ok(Self {
            device,
            channel,
            path,
        })
    }
}

impl TemperatureSource for AdcChannel {
    fn read_temperature(&mut self) -> Result<i64> {
        read_from_file::<i64>(&self.path).map(millis_to_degrees)
    }

    fn describe(&self) -> String {
        format!("iio:device{} channel {}", self.device, self.channel)
    }
}

/// CPU hot-plug through `devices/system/cpu`.
///
/// State is always read back from sysfs, since other agents may hot-plug
/// CPUs behind our back. A CPU without an `online` attribute cannot be
/// hot-plugged and is reported online.
#[derive(Debug)]
pub struct SysfsHotplug {
    cpu_dir: PathBuf,
    possible: Vec<usize>,
}

impl SysfsHotplug {
    pub fn new(root: &Path) -> Result<Self> {
        let cpu_dir = root.join("devices/system/cpu");
        let possible = match std::fs::read_to_string(cpu_dir.join("possible")) {
            Ok(list) => parse_cpu_list(&list)?,
            Err(_) => Self::scan_cpu_dirs(&cpu_dir)?,
        };
        if possible.is_empty() {
            bail!("No CPUs found under {:?}", cpu_dir);
        }
        debug!("possible cpus: {:?}", possible);
        Ok(Self { cpu_dir, possible })
    }

    fn scan_cpu_dirs(cpu_dir: &Path) -> Result<Vec<usize>> {
        let pattern = cpu_dir.join("cpu[0-9]*");
        let mut cpus = vec![];
        for path in glob(pattern.to_string_lossy().as_ref())?.filter_map(Result::ok) {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            match sscanf!(name.as_str(), "cpu{usize}") {
                Ok(cpu) => cpus.push(cpu),
                Err(_) => bail!("Failed to parse cpu ID {}", name),
            }
        }
        cpus.sort_unstable();
        Ok(cpus)
    }

    fn online_path(&self, cpu: usize) -> PathBuf {
        self.cpu_dir.join(format!("cpu{cpu}")).join("online")
    }

    fn set_online(&mut self, cpu: usize, online: bool) -> Result<()> {
        if !self.possible.contains(&cpu) {
            bail!("cpu{} is not a possible CPU", cpu);
        }
        let path = self.online_path(cpu);
        if !path.exists() {
            bail!("cpu{} does not support hot-plug", cpu);
        }
        write_to_file(&path, if online { 1 } else { 0 })?;
        info!("cpu{} {}", cpu, if online { "online" } else { "offline" });
        Ok(())
    }
}

impl CoreLifecycle for SysfsHotplug {
    fn bring_online(&mut self, cpu: usize) -> Result<()> {
        self.set_online(cpu, true)
    }

    fn take_offline(&mut self, cpu: usize) -> Result<()> {
        self.set_online(cpu, false)
    }

    fn is_online(&self, cpu: usize) -> bool {
        if !self.possible.contains(&cpu) {
            return false;
        }
        let path = self.online_path(cpu);
        if !path.exists() {
            return true;
        }
        matches!(read_from_file::<u8>(&path), Ok(val) if val != 0)
    }

    fn online_count(&self) -> usize {
        match std::fs::read_to_string(self.cpu_dir.join("online"))
            .map_err(anyhow::Error::from)
            .and_then(|list| parse_cpu_list(&list))
        {
            Ok(cpus) => cpus.len(),
            Err(_) => self.possible.iter().filter(|&&cpu| self.is_online(cpu)).count(),
        }
    }

    fn max_cores(&self) -> usize {
        self.possible.len()
    }

    fn online_cpus(&self) -> Vec<usize> {
        self.possible
            .iter()
            .copied()
            .filter(|&cpu| self.is_online(cpu))
            .collect()
    }
}

/// The operator's own `[scaling_min_freq, scaling_max_freq]` for one CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserWindow {
    pub min: u32,
    pub max: u32,
}

/// Userspace notifier chain in front of the cpufreq sysfs interface.
///
/// The first time a CPU is re-evaluated its current scaling window is
/// recorded as the user policy. Every re-evaluation proposes that window,
/// runs every notifier over it and writes the result, so notifiers can only
/// narrow what the operator configured. Once the last notifier is
/// unregistered the recorded windows are written back. On a system where
/// CPUs share a policy the writes land on the shared policy directory,
/// which is harmless.
pub struct SysfsCpufreq {
    cpu_dir: PathBuf,
    notifiers: RwLock<BTreeMap<NotifierId, Arc<dyn PolicyNotifier>>>,
    next_id: AtomicU64,
    user: Mutex<BTreeMap<usize, UserWindow>>,
}

impl SysfsCpufreq {
    pub fn new(root: &Path) -> Result<Self> {
        let cpu_dir = root.join("devices/system/cpu");
        if !cpu_dir.exists() {
            bail!("{:?} does not exist", cpu_dir);
        }
        Ok(Self {
            cpu_dir,
            notifiers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            user: Mutex::new(BTreeMap::new()),
        })
    }

    fn attr(&self, cpu: usize, name: &str) -> PathBuf {
        self.cpu_dir
            .join(format!("cpu{cpu}"))
            .join("cpufreq")
            .join(name)
    }

    fn lock_user(&self) -> MutexGuard<'_, BTreeMap<usize, UserWindow>> {
        match self.user.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Recorded user window of `cpu`, if it was ever re-evaluated.
    pub fn user_window(&self, cpu: usize) -> Option<UserWindow> {
        self.lock_user().get(&cpu).copied()
    }

    fn record_user_window(&self, cpu: usize, cpuinfo_min: u32, cpuinfo_max: u32) -> UserWindow {
        *self.lock_user().entry(cpu).or_insert_with(|| {
            let window = UserWindow {
                min: read_from_file::<u32>(&self.attr(cpu, "scaling_min_freq"))
                    .unwrap_or(cpuinfo_min),
                max: read_from_file::<u32>(&self.attr(cpu, "scaling_max_freq"))
                    .unwrap_or(cpuinfo_max),
            };
            debug!("cpu{} user policy [{}, {}]", cpu, window.min, window.max);
            window
        })
    }

    /// The proposal a re-evaluation starts from: the user window inside the
    /// hardware range.
    pub fn read_policy(&self, cpu: usize) -> Result<CpuPolicy> {
        let cpuinfo_min = read_from_file::<u32>(&self.attr(cpu, "cpuinfo_min_freq"))?;
        let cpuinfo_max = read_from_file::<u32>(&self.attr(cpu, "cpuinfo_max_freq"))?;
        if cpuinfo_min > cpuinfo_max {
            bail!(
                "cpu{} reports cpuinfo_min_freq {} above cpuinfo_max_freq {}",
                cpu,
                cpuinfo_min,
                cpuinfo_max
            );
        }
        let user = self.record_user_window(cpu, cpuinfo_min, cpuinfo_max);

        let mut policy = CpuPolicy::new(cpu, cpuinfo_min, cpuinfo_max);
        policy.max = user.max.clamp(cpuinfo_min, cpuinfo_max);
        policy.min = user.min.clamp(cpuinfo_min, policy.max);
        Ok(policy)
    }

    pub fn nr_notifiers(&self) -> usize {
        self.notifiers.read().map(|n| n.len()).unwrap_or(0)
    }

    fn run_chain(&self, event: PolicyEvent, policy: &mut CpuPolicy) -> Result<()> {
        let notifiers = self
            .notifiers
            .read()
            .map_err(|_| anyhow!("cpufreq notifier chain poisoned"))?;
        for notifier in notifiers.values() {
            notifier.notify(event, policy);
        }
        Ok(())
    }

    /// Write `[min, max]` in the order that never leaves min above max.
    fn write_window(&self, cpu: usize, min: u32, max: u32) -> Result<()> {
        let min_path = self.attr(cpu, "scaling_min_freq");
        let max_path = self.attr(cpu, "scaling_max_freq");
        let cur_min = read_from_file::<u32>(&min_path).unwrap_or(0);
        if max >= cur_min {
            write_to_file(&max_path, max)?;
            write_to_file(&min_path, min)
        } else {
            write_to_file(&min_path, min)?;
            write_to_file(&max_path, max)
        }
    }

    /// Write every recorded user window back and forget them. CPUs whose
    /// cpufreq directory is gone are skipped; the first write failure is
    /// returned after all CPUs were tried.
    pub fn restore_user_policies(&self) -> Result<()> {
        let windows = std::mem::take(&mut *self.lock_user());
        let mut first_err = None;
        for (cpu, window) in windows {
            if !self.cpu_dir.join(format!("cpu{cpu}/cpufreq")).exists() {
                debug!("cpu{} has no cpufreq policy, not restoring", cpu);
                continue;
            }
            match self.write_window(cpu, window.min, window.max) {
                Ok(()) => debug!("cpu{} restored [{}, {}]", cpu, window.min, window.max),
                Err(e) => {
                    warn!("Failed to restore cpu{} policy: {:#}", cpu, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl FreqPolicy for SysfsCpufreq {
    fn register_notifier(&self, notifier: Arc<dyn PolicyNotifier>) -> Result<NotifierId> {
        let id = NotifierId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.notifiers
            .write()
            .map_err(|_| anyhow!("cpufreq notifier chain poisoned"))?
            .insert(id, notifier);
        Ok(id)
    }

    fn unregister_notifier(&self, id: NotifierId) -> Result<()> {
        let remaining = {
            let mut notifiers = self
                .notifiers
                .write()
                .map_err(|_| anyhow!("cpufreq notifier chain poisoned"))?;
            if notifiers.remove(&id).is_none() {
                bail!("Notifier {:?} is not registered", id);
            }
            notifiers.len()
        };
        if remaining == 0 {
            self.restore_user_policies()
                .context("Failed to restore user cpufreq policies")?;
        }
        Ok(())
    }

    fn request_policy_reevaluation(&self, cpu: usize) -> Result<()> {
        let mut policy = self
            .read_policy(cpu)
            .with_context(|| format!("Failed to read cpu{cpu} cpufreq policy"))?;

        self.run_chain(PolicyEvent::Adjust, &mut policy)?;
        if policy.min > policy.max {
            self.run_chain(PolicyEvent::Incompatible, &mut policy)?;
        }
        // Keep the window well formed before handing it to the kernel.
        policy.max = policy.max.clamp(policy.cpuinfo_min, policy.cpuinfo_max);
        policy.min = policy.min.clamp(policy.cpuinfo_min, policy.max);

        self.write_window(cpu, policy.min, policy.max)?;
        self.run_chain(PolicyEvent::Notify, &mut policy)?;
        debug!("cpu{} policy [{}, {}]", cpu, policy.min, policy.max);
        Ok(())
    }
}
