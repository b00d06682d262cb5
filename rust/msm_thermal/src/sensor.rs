// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::Result;

/// Something that can be sampled for a temperature in whole degrees Celsius,
/// the unit `temp_threshold` is expressed in.
///
/// Called once per tick from the worker, so a read should not take longer
/// than the poll interval.
pub trait TemperatureSource: Send {
    fn read_temperature(&mut self) -> Result<i64>;

    /// Human readable origin of the readings, for logs.
    fn describe(&self) -> String {
        "temperature source".to_string()
    }
}
