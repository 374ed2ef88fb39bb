use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::buffer_pool::{BufferPool, RawBuffer};
use super::config::ReceiverConfig;
use super::error::ReceiverError;
use super::reactor::{NetworkReactor, ReactorControl};
use super::stats::{ReceiverStats, StatsSnapshot};

/// MillisliceReceiver is the host facing side of the receiver.
///
/// Construction validates the configuration, binds the listening socket, allocates the
/// buffer pool and spawns the reactor thread. Readout is suspended until [`start`] is
/// called. Filled millislices are taken with [`retrieve_filled_buffer`] and must be given
/// back with [`commit_empty_buffer`] once consumed.
///
/// [`start`]: MillisliceReceiver::start
/// [`retrieve_filled_buffer`]: MillisliceReceiver::retrieve_filled_buffer
/// [`commit_empty_buffer`]: MillisliceReceiver::commit_empty_buffer
#[derive(Debug)]
pub struct MillisliceReceiver {
    config: ReceiverConfig,
    pool: BufferPool,
    control: Arc<ReactorControl>,
    stats: Arc<ReceiverStats>,
    local_addr: SocketAddr,
    handle: Option<JoinHandle<()>>,
    run_started: Option<Instant>,
}

impl MillisliceReceiver {
    pub fn new(config: ReceiverConfig) -> Result<Self, ReceiverError> {
        config.validate()?;

        let listener = TcpListener::bind(("0.0.0.0", config.receive_port))?;
        let local_addr = listener.local_addr()?;
        let pool = BufferPool::new(
            config.buffer_pool_capacity,
            config.raw_buffer_size,
            config.buffer_acquire_retries,
            config.buffer_acquire_timeout(),
        );
        let control = Arc::new(ReactorControl::new());
        let stats = Arc::new(ReceiverStats::new());

        let reactor = NetworkReactor::new(&config, pool.clone(), control.clone(), stats.clone());
        let thread_control = control.clone();
        let handle = std::thread::Builder::new()
            .name(String::from("penn_reactor"))
            .spawn(move || {
                if let Err(e) = reactor.run(listener) {
                    log::error!("Receiver reactor exited with an error: {e}");
                    thread_control.failed.store(true, Ordering::SeqCst);
                }
            })
            .map_err(ReceiverError::ThreadSpawn)?;

        log::info!(
            "Receiver listening on {} with {} buffers of {}, millislice width {} ticks overlap {} ticks",
            local_addr,
            config.buffer_pool_capacity,
            human_bytes::human_bytes(config.raw_buffer_size as f64),
            config.millislice_width_ticks,
            config.millislice_overlap_ticks
        );

        Ok(Self {
            config,
            pool,
            control,
            stats,
            local_addr,
            handle: Some(handle),
            run_started: None,
        })
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Address the data socket is bound to. Useful when configured with port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Begin a run. Rolling window, sequence and checksum state all start fresh and the
    /// pool is topped back up to its full capacity.
    pub fn start(&mut self) -> Result<(), ReceiverError> {
        if !self.control.suspend_readout.load(Ordering::SeqCst) {
            return Err(ReceiverError::NotStopped);
        }
        self.stats.reset();
        let added = self.pool.replenish();
        if added > 0 {
            log::debug!("Allocated {added} buffers to refill the pool");
        }
        self.control.failed.store(false, Ordering::SeqCst);
        self.control.suspend_readout.store(false, Ordering::SeqCst);
        self.run_started = Some(Instant::now());
        log::info!("Receiver started");
        Ok(())
    }

    /// Suspend readout and wait for the reactor to acknowledge. Any partially filled
    /// millislice is discarded, never emitted.
    pub fn stop(&mut self) -> Result<(), ReceiverError> {
        self.control.suspend_readout.store(true, Ordering::SeqCst);
        let timeout = self.config.stop_timeout();
        let begin = Instant::now();
        while !self.control.readout_suspended.load(Ordering::SeqCst) {
            if begin.elapsed() >= timeout {
                log::error!(
                    "Timed out after {:?} waiting for the receiver to suspend readout",
                    timeout
                );
                return Err(ReceiverError::StopTimeout(self.config.stop_timeout_usecs));
            }
            std::thread::sleep(self.config.tick_period());
        }
        if let Some(started) = self.run_started.take() {
            self.stats.snapshot().log_summary(started.elapsed());
            log::info!("Receiver stopped");
        }
        Ok(())
    }

    /// Return a consumed buffer to the pool
    pub fn commit_empty_buffer(&self, buffer: RawBuffer) -> Result<(), ReceiverError> {
        Ok(self.pool.commit_empty(buffer)?)
    }

    /// Take the oldest filled millislice. A zero timeout blocks until one arrives
    pub fn retrieve_filled_buffer(&self, timeout: Duration) -> Option<RawBuffer> {
        self.stats.record_empty_level(self.pool.empty_available());
        self.pool.retrieve_filled(timeout)
    }

    pub fn empty_buffers_available(&self) -> usize {
        self.pool.empty_available()
    }

    pub fn filled_buffers_available(&self) -> usize {
        self.pool.filled_available()
    }

    /// Drop every buffer in the empty queue. Returns how many were dropped
    pub fn release_empty_buffers(&self) -> usize {
        self.pool.release_empty()
    }

    /// Drop every buffer in the filled queue so stale millislices never reach the next run
    pub fn release_filled_buffers(&self) -> usize {
        self.pool.release_filled()
    }

    /// True once readout halted on a fatal error. Cleared by the next start()
    pub fn has_failed(&self) -> bool {
        self.control.failed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for MillisliceReceiver {
    fn drop(&mut self) {
        self.control.run_receiver.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Receiver reactor thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ReceiverConfig {
        ReceiverConfig {
            receive_port: 0,
            tick_period_usecs: 1000,
            buffer_pool_capacity: 4,
            raw_buffer_size: 1 << 16,
            stop_timeout_usecs: 1_000_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_start_stop_cycle() {
        let mut receiver = MillisliceReceiver::new(test_config()).unwrap();
        assert_ne!(receiver.local_addr().port(), 0);
        assert_eq!(receiver.empty_buffers_available(), 4);
        receiver.stop().unwrap();
        receiver.start().unwrap();
        assert!(matches!(receiver.start(), Err(ReceiverError::NotStopped)));
        receiver.stop().unwrap();
        receiver.stop().unwrap();
        receiver.start().unwrap();
        receiver.stop().unwrap();
        assert!(!receiver.has_failed());
    }

    #[test]
    fn test_release_then_start_replenishes() {
        let mut receiver = MillisliceReceiver::new(test_config()).unwrap();
        receiver.stop().unwrap();
        assert_eq!(receiver.release_empty_buffers(), 4);
        assert_eq!(receiver.empty_buffers_available(), 0);
        assert_eq!(receiver.release_filled_buffers(), 0);
        receiver.start().unwrap();
        assert_eq!(receiver.empty_buffers_available(), 4);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ReceiverConfig {
            millislice_width_ticks: 0,
            ..test_config()
        };
        assert!(matches!(
            MillisliceReceiver::new(config),
            Err(ReceiverError::ConfigError(_))
        ));
    }
}
