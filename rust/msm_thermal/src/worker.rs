// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Periodic worker driving the controller.
//!
//! Fixed delay, not fixed rate: the next tick is scheduled only once the
//! previous one, actuation included, has returned. Waiting on the stop
//! channel is the only suspension point, so stopping never interrupts a tick
//! in flight.

use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use crossbeam::channel::bounded;
use crossbeam::channel::RecvTimeoutError;
use crossbeam::channel::Sender;
use log::debug;
use log::info;

use crate::controller::TickOutcome;

/// Anything the worker can tick.
pub trait Tick: Send + 'static {
    fn tick(&mut self) -> TickOutcome;
}

impl Tick for crate::controller::Controller {
    fn tick(&mut self) -> TickOutcome {
        self.check_temp()
    }
}

pub struct ThermalWorker {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ThermalWorker {
    pub const THREAD_NAME: &'static str = "thermal_wq";

    pub fn spawn<T: Tick>(mut ticker: T, initial_delay: Duration, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = std::thread::Builder::new()
            .name(Self::THREAD_NAME.to_string())
            .spawn(move || {
                let mut delay = initial_delay;
                loop {
                    match stop_rx.recv_timeout(delay) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let outcome = ticker.tick();
                    debug!("tick: {:?}", outcome);
                    delay = interval;
                }
                info!("Thermal worker stopped");
            })
            .context("Failed to spawn thermal worker")?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Cancel the pending tick and wait for the thread to exit.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(tx) = self.stop_tx.take() {
            // The receiver may already be gone if the thread panicked.
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("Thermal worker panicked"))?;
        }
        Ok(())
    }
}

impl Drop for ThermalWorker {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
