// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Frequency-policy boundary.
//!
//! The policy subsystem owns the per-CPU `[min, max]` window. Before it
//! applies a window it hands the proposal to every registered
//! [`PolicyNotifier`], which may only narrow it. [`ThermalNotifier`] is the
//! throttle controller's listener: it caps `max` at the current ceiling.

use std::sync::Arc;

use anyhow::Result;

use crate::state::ThermalContext;

/// Phase of a policy update a notifier is invoked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyEvent {
    /// Listeners may adjust the proposal.
    Adjust,
    /// Second chance to fix up a proposal that became inconsistent.
    Incompatible,
    /// Final policy, informational.
    Notify,
}

/// Proposed frequency window for one CPU, in kHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuPolicy {
    pub cpu: usize,
    pub min: u32,
    pub max: u32,
    /// Hardware floor.
    pub cpuinfo_min: u32,
    /// Hardware ceiling.
    pub cpuinfo_max: u32,
}

impl CpuPolicy {
    pub fn new(cpu: usize, cpuinfo_min: u32, cpuinfo_max: u32) -> Self {
        Self {
            cpu,
            min: cpuinfo_min,
            max: cpuinfo_max,
            cpuinfo_min,
            cpuinfo_max,
        }
    }
}

pub trait PolicyNotifier: Send + Sync {
    fn notify(&self, event: PolicyEvent, policy: &mut CpuPolicy);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotifierId(pub u64);

/// The external frequency-policy subsystem.
pub trait FreqPolicy: Send + Sync {
    fn register_notifier(&self, notifier: Arc<dyn PolicyNotifier>) -> Result<NotifierId>;

    fn unregister_notifier(&self, id: NotifierId) -> Result<()>;

    /// Re-run the notifier chain for `cpu` and apply the result.
    fn request_policy_reevaluation(&self, cpu: usize) -> Result<()>;
}

/// Never raises `proposed_max`, and leaves it alone when `ceiling` is
/// unrestricted.
pub fn clamp_ceiling(proposed_max: u32, ceiling: u32) -> u32 {
    proposed_max.min(ceiling)
}

pub struct ThermalNotifier {
    ctx: Arc<ThermalContext>,
}

impl ThermalNotifier {
    pub fn new(ctx: Arc<ThermalContext>) -> Self {
        Self { ctx }
    }
}

impl PolicyNotifier for ThermalNotifier {
    fn notify(&self, event: PolicyEvent, policy: &mut CpuPolicy) {
        let state = &self.ctx.state;
        if event != PolicyEvent::Adjust && !state.pending_change() {
            return;
        }

        // A ceiling below the hardware floor would leave an empty window.
        let ceiling = state.max_allowed_freq().max(policy.cpuinfo_min);
        policy.max = clamp_ceiling(policy.max, ceiling);
    }
}
