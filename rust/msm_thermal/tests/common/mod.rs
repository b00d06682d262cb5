// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::bail;
use anyhow::Result;

use msm_thermal::Actuator;
use msm_thermal::Controller;
use msm_thermal::CoreLifecycle;
use msm_thermal::CpuPolicy;
use msm_thermal::FreqPolicy;
use msm_thermal::FrequencyLadder;
use msm_thermal::HotplugTiers;
use msm_thermal::NotifierId;
use msm_thermal::PolicyEvent;
use msm_thermal::PolicyNotifier;
use msm_thermal::TemperatureSource;
use msm_thermal::ThermalContext;
use msm_thermal::ThermalNotifier;
use msm_thermal::Tunables;
use msm_thermal::FREQ_HW_MAX;

pub const HW_MIN: u32 = 300000;

/// Initialize logging from `RUST_LOG`-less defaults; repeated calls are fine.
pub fn setup_test() {
    let _ = simplelog::TestLogger::init(simplelog::LevelFilter::Debug, simplelog::Config::default());
}

/// Scripted readings. `None` is a failed read; an exhausted script keeps
/// returning the last value.
#[derive(Clone, Default)]
pub struct FakeSensor {
    script: Arc<Mutex<VecDeque<Option<i64>>>>,
    last: Arc<Mutex<Option<i64>>>,
}

impl FakeSensor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, temp: i64) {
        self.script.lock().unwrap().push_back(Some(temp));
    }

    pub fn push_fault(&self) {
        self.script.lock().unwrap().push_back(None);
    }
}

impl TemperatureSource for FakeSensor {
    fn read_temperature(&mut self) -> Result<i64> {
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        match next {
            Some(Some(temp)) => {
                *last = Some(temp);
                Ok(temp)
            }
            Some(None) => bail!("ADC read timed out"),
            None => match *last {
                Some(temp) => Ok(temp),
                None => bail!("no readings scripted"),
            },
        }
    }

    fn describe(&self) -> String {
        "fake sensor".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreOp {
    Online(usize),
    Offline(usize),
}

#[derive(Debug)]
pub struct CoreState {
    pub online: Vec<bool>,
    pub ops: Vec<CoreOp>,
    pub fail: bool,
}

/// In-memory CPU set. Cloning shares the state so a test can watch it after
/// handing a box to the actuator.
#[derive(Clone)]
pub struct FakeCores {
    pub state: Arc<Mutex<CoreState>>,
}

impl FakeCores {
    pub fn new(online: &[bool]) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoreState {
                online: online.to_vec(),
                ops: vec![],
                fail: false,
            })),
        }
    }

    pub fn all_online(nr: usize) -> Self {
        Self::new(&vec![true; nr])
    }

    pub fn online(&self) -> Vec<bool> {
        self.state.lock().unwrap().online.clone()
    }

    pub fn ops(&self) -> Vec<CoreOp> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().unwrap().ops.clear();
    }

    pub fn set_fail(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }
}

impl CoreLifecycle for FakeCores {
    fn bring_online(&mut self, cpu: usize) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.fail || cpu >= st.online.len() {
            bail!("cpu_up({cpu}) failed");
        }
        st.online[cpu] = true;
        st.ops.push(CoreOp::Online(cpu));
        Ok(())
    }

    fn take_offline(&mut self, cpu: usize) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.fail || cpu == 0 || cpu >= st.online.len() {
            bail!("cpu_down({cpu}) failed");
        }
        st.online[cpu] = false;
        st.ops.push(CoreOp::Offline(cpu));
        Ok(())
    }

    fn is_online(&self, cpu: usize) -> bool {
        self.state
            .lock()
            .unwrap()
            .online
            .get(cpu)
            .copied()
            .unwrap_or(false)
    }

    fn online_count(&self) -> usize {
        self.state.lock().unwrap().online.iter().filter(|on| **on).count()
    }

    fn max_cores(&self) -> usize {
        self.state.lock().unwrap().online.len()
    }
}

/// Minimal policy subsystem: runs the notifier chain over a hardware-max
/// proposal and remembers what each CPU ended up with.
#[derive(Default)]
pub struct FakePolicy {
    notifiers: Mutex<BTreeMap<NotifierId, Arc<dyn PolicyNotifier>>>,
    next_id: AtomicU64,
    pub applied: Mutex<BTreeMap<usize, u32>>,
    pub reevaluations: Mutex<Vec<usize>>,
    pub fail_register: AtomicBool,
}

impl FakePolicy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn nr_notifiers(&self) -> usize {
        self.notifiers.lock().unwrap().len()
    }

    pub fn applied_max(&self, cpu: usize) -> Option<u32> {
        self.applied.lock().unwrap().get(&cpu).copied()
    }

    pub fn reevaluations(&self) -> Vec<usize> {
        self.reevaluations.lock().unwrap().clone()
    }

    /// Run the chain the way the governor would on its own schedule.
    pub fn propose(&self, event: PolicyEvent, cpu: usize) -> CpuPolicy {
        let mut policy = CpuPolicy::new(cpu, HW_MIN, FREQ_HW_MAX);
        let notifiers: Vec<_> = self.notifiers.lock().unwrap().values().cloned().collect();
        for notifier in notifiers {
            notifier.notify(event, &mut policy);
        }
        policy
    }
}

impl FreqPolicy for FakePolicy {
    fn register_notifier(&self, notifier: Arc<dyn PolicyNotifier>) -> Result<NotifierId> {
        if self.fail_register.load(Ordering::Relaxed) {
            bail!("cpufreq_register_notifier: -EINVAL");
        }
        let id = NotifierId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.notifiers.lock().unwrap().insert(id, notifier);
        Ok(id)
    }

    fn unregister_notifier(&self, id: NotifierId) -> Result<()> {
        match self.notifiers.lock().unwrap().remove(&id) {
            Some(_) => Ok(()),
            None => bail!("unknown notifier"),
        }
    }

    fn request_policy_reevaluation(&self, cpu: usize) -> Result<()> {
        let policy = self.propose(PolicyEvent::Adjust, cpu);
        self.applied.lock().unwrap().insert(cpu, policy.max);
        self.reevaluations.lock().unwrap().push(cpu);
        Ok(())
    }
}

pub struct Rig {
    pub ctx: Arc<ThermalContext>,
    pub sensor: FakeSensor,
    pub cores: FakeCores,
    pub policy: Arc<FakePolicy>,
    pub actuator: Arc<Actuator>,
    pub controller: Controller,
}

impl Rig {
    /// Reference ladder and tiers, threshold 38, safe_diff 5.
    pub fn new(cores: FakeCores) -> Self {
        Self::with_tunables(cores, Tunables::default())
    }

    pub fn with_tunables(cores: FakeCores, tunables: Tunables) -> Self {
        setup_test();
        let ctx = Arc::new(ThermalContext::new(tunables));
        let policy = FakePolicy::new();
        policy
            .register_notifier(Arc::new(ThermalNotifier::new(ctx.clone())))
            .unwrap();
        let sensor = FakeSensor::new();
        let actuator = Arc::new(Actuator::new(
            ctx.clone(),
            policy.clone(),
            Box::new(cores.clone()),
            HotplugTiers::reference(),
        ));
        let controller = Controller::new(
            FrequencyLadder::reference(),
            actuator.clone(),
            Box::new(sensor.clone()),
        );
        Self {
            ctx,
            sensor,
            cores,
            policy,
            actuator,
            controller,
        }
    }

    pub fn tick(&mut self, temp: i64) -> msm_thermal::TickOutcome {
        self.sensor.push(temp);
        self.controller.check_temp()
    }

    pub fn ceiling(&self) -> u32 {
        self.ctx.state.max_allowed_freq()
    }
}
