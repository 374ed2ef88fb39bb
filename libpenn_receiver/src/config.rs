use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::constants::*;
use super::error::ConfigError;

/// Structure representing the receiver configuration. Contains the network endpoint, the
/// millislice geometry and the buffer pool sizing.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// TCP port to listen on. 0 lets the OS pick one
    pub receive_port: u16,
    pub millislice_width_ticks: u32,
    pub millislice_overlap_ticks: u32,
    /// Granularity of every deadline in the reactor and of stop() polling
    pub tick_period_usecs: u32,
    pub buffer_pool_capacity: usize,
    pub raw_buffer_size: usize,
    pub buffer_acquire_retries: u32,
    pub buffer_acquire_timeout_ms: u64,
    pub stop_timeout_usecs: u32,
    pub max_microslice_size: usize,
    pub debug_level: u8,
    /// Log a summary every this many millislices in the receive loop. 0 disables it
    pub reporting_interval_millislices: u64,
}

impl Default for ReceiverConfig {
    /// Generate a new ReceiverConfig with a usable 5 ms millislice at the 64 MHz clock
    fn default() -> Self {
        Self {
            receive_port: DEFAULT_RECEIVE_PORT,
            millislice_width_ticks: 320_000,
            millislice_overlap_ticks: 0,
            tick_period_usecs: DEFAULT_TICK_PERIOD_USECS,
            buffer_pool_capacity: 100,
            raw_buffer_size: 1_000_000,
            buffer_acquire_retries: DEFAULT_BUFFER_ACQUIRE_RETRIES,
            buffer_acquire_timeout_ms: DEFAULT_BUFFER_ACQUIRE_TIMEOUT_MS,
            stop_timeout_usecs: DEFAULT_STOP_TIMEOUT_USECS,
            max_microslice_size: MAX_MICROSLICE_SIZE,
            debug_level: 0,
            reporting_interval_millislices: 200,
        }
    }
}

impl ReceiverConfig {
    /// Read the configuration in a YAML file
    /// Returns a ReceiverConfig if successful. The result is not yet validated
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// Check every constraint the receiver relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.millislice_width_ticks == 0 || self.millislice_width_ticks > TICK_HALF_RANGE {
            return Err(ConfigError::BadWidth(self.millislice_width_ticks));
        }
        if self.millislice_overlap_ticks >= self.millislice_width_ticks {
            return Err(ConfigError::BadOverlap(
                self.millislice_overlap_ticks,
                self.millislice_width_ticks,
            ));
        }
        if self.tick_period_usecs == 0 {
            return Err(ConfigError::BadTickPeriod);
        }
        if self.buffer_pool_capacity == 0 {
            return Err(ConfigError::BadPoolCapacity);
        }
        if self.max_microslice_size < MICROSLICE_HEADER_SIZE
            || self.max_microslice_size > MAX_MICROSLICE_SIZE
        {
            return Err(ConfigError::BadMicrosliceSize(self.max_microslice_size));
        }
        if self.raw_buffer_size < self.max_microslice_size {
            return Err(ConfigError::BadBufferSize(
                self.raw_buffer_size,
                self.max_microslice_size,
            ));
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_micros(self.tick_period_usecs as u64)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_micros(self.stop_timeout_usecs as u64)
    }

    pub fn buffer_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.buffer_acquire_timeout_ms)
    }

    /// Millislice width in seconds of board clock
    pub fn millislice_duration(&self) -> f64 {
        self.millislice_width_ticks as f64 / TICKS_PER_SECOND as f64
    }

    pub fn log_level(&self) -> log::LevelFilter {
        match self.debug_level {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}
