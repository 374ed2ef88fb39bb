use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, Sleep};

use super::assembler::MillisliceAssembler;
use super::buffer_pool::BufferPool;
use super::config::ReceiverConfig;
use super::constants::MICROSLICE_HEADER_SIZE;
use super::error::{AssemblerError, ReactorError};
use super::parser::MicrosliceParser;
use super::stats::ReceiverStats;

/// Flags shared between the host facing receiver and the reactor thread
#[derive(Debug)]
pub(crate) struct ReactorControl {
    pub run_receiver: AtomicBool,
    pub suspend_readout: AtomicBool,
    pub readout_suspended: AtomicBool,
    pub failed: AtomicBool,
}

impl ReactorControl {
    /// The reactor starts out suspended; readout begins at the first start()
    pub fn new() -> Self {
        Self {
            run_receiver: AtomicBool::new(true),
            suspend_readout: AtomicBool::new(true),
            readout_suspended: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    fn running(&self) -> bool {
        self.run_receiver.load(Ordering::SeqCst)
    }

    fn suspend_requested(&self) -> bool {
        self.suspend_readout.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineTarget {
    None,
    Acceptor,
    DataSocket,
}

/// A single retargetable timer shared by the accept and read operations.
///
/// Only the operation it is armed for can be cancelled by it; expiry disarms the timer.
#[derive(Debug)]
struct Deadline {
    sleep: Pin<Box<Sleep>>,
    target: DeadlineTarget,
}

impl Deadline {
    /// Must be created inside the runtime
    fn new() -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep(Duration::ZERO)),
            target: DeadlineTarget::None,
        }
    }

    /// Arm the timer for `target`. A zero timeout disarms it
    fn set(&mut self, target: DeadlineTarget, timeout: Duration) {
        if timeout.is_zero() || target == DeadlineTarget::None {
            self.target = DeadlineTarget::None;
            return;
        }
        self.sleep.as_mut().reset(Instant::now() + timeout);
        self.target = target;
    }

    fn disarm(&mut self) {
        self.target = DeadlineTarget::None;
    }

    /// Resolves when the timer expires while armed for `target`, otherwise never
    async fn expired(&mut self, target: DeadlineTarget) {
        if self.target != target {
            std::future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.target = DeadlineTarget::None;
    }
}

/// NetworkReactor owns everything on the receiving side of the socket: the listener, the
/// connection, the parser and the assembler. It runs a single threaded tokio runtime on
/// its own thread and talks to the host only through the buffer pool, the control flags
/// and the statistics.
#[derive(Debug)]
pub(crate) struct NetworkReactor {
    control: Arc<ReactorControl>,
    stats: Arc<ReceiverStats>,
    parser: MicrosliceParser,
    assembler: MillisliceAssembler,
    tick_period: Duration,
    read_size: usize,
}

impl NetworkReactor {
    pub fn new(
        config: &ReceiverConfig,
        pool: BufferPool,
        control: Arc<ReactorControl>,
        stats: Arc<ReceiverStats>,
    ) -> Self {
        Self {
            control,
            stats,
            parser: MicrosliceParser::new(config.max_microslice_size),
            assembler: MillisliceAssembler::new(
                pool,
                config.millislice_width_ticks,
                config.millislice_overlap_ticks,
            ),
            tick_period: config.tick_period(),
            read_size: config.max_microslice_size.max(MICROSLICE_HEADER_SIZE),
        }
    }

    /// Thread entry point. Returns when `run_receiver` is cleared
    pub fn run(mut self, listener: std::net::TcpListener) -> std::io::Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;
        runtime.block_on(self.event_loop(listener))
    }

    async fn event_loop(&mut self, listener: std::net::TcpListener) -> std::io::Result<()> {
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let mut deadline = Deadline::new();
        log::debug!("Reactor listening on {}", listener.local_addr()?);

        while self.control.running() {
            if self.control.suspend_requested() {
                self.park().await;
                continue;
            }
            if let Some(stream) = self.do_accept(&listener, &mut deadline).await {
                self.do_read(stream, &mut deadline).await;
            }
        }

        self.discard_in_flight();
        log::debug!("Reactor shut down");
        Ok(())
    }

    /// Wait one tick period for a connection
    async fn do_accept(
        &mut self,
        listener: &TcpListener,
        deadline: &mut Deadline,
    ) -> Option<TcpStream> {
        deadline.set(DeadlineTarget::Acceptor, self.tick_period);
        tokio::select! {
            result = listener.accept() => {
                deadline.disarm();
                match result {
                    Ok((stream, peer)) => {
                        log::info!("Accepted data connection from {peer}");
                        if let Err(e) = stream.set_nodelay(true) {
                            log::warn!("Could not disable Nagle on data connection: {e}");
                        }
                        self.stats.record_connection();
                        Some(stream)
                    }
                    Err(e) => {
                        log::error!("Accept on data socket failed: {e}");
                        None
                    }
                }
            }
            _ = deadline.expired(DeadlineTarget::Acceptor) => {
                log::trace!("Accept timed out, checking run state");
                None
            }
        }
    }

    /// Service one connection until it ends, readout fails or the reactor shuts down
    async fn do_read(&mut self, mut stream: TcpStream, deadline: &mut Deadline) {
        let mut buffer = vec![0u8; self.read_size];
        loop {
            if !self.control.running() {
                return;
            }
            if self.control.suspend_requested() {
                self.park().await;
                continue;
            }

            let wanted = self.parser.bytes_needed().min(buffer.len());
            deadline.set(DeadlineTarget::DataSocket, self.tick_period);
            let result = tokio::select! {
                result = stream.read(&mut buffer[..wanted]) => Some(result),
                _ = deadline.expired(DeadlineTarget::DataSocket) => None,
            };

            let n = match result {
                None => {
                    log::trace!("Read timed out, checking run state");
                    continue;
                }
                Some(Ok(0)) => {
                    log::info!("Data connection closed by peer");
                    self.end_session();
                    return;
                }
                Some(Ok(n)) => n,
                Some(Err(e)) => {
                    log::error!("Read on data connection failed: {e}");
                    self.end_session();
                    return;
                }
            };
            deadline.disarm();
            self.stats.record_bytes_received(n);

            match self.handle_bytes(&buffer[..n]) {
                Ok(()) => (),
                Err(ReactorError::Assembly(AssemblerError::Pool(e))) => {
                    log::error!("Readout halted until the next run start: {e}");
                    drop(stream);
                    self.fail().await;
                    return;
                }
                Err(e) => {
                    log::error!("Dropping data connection: {e}");
                    self.stats.record_framing_error();
                    self.end_session();
                    return;
                }
            }
        }
    }

    /// Push received bytes through the parser and assembler
    fn handle_bytes(&mut self, mut data: &[u8]) -> Result<(), ReactorError> {
        let result = loop {
            if data.is_empty() {
                break Ok(());
            }
            let (n, microslice) = match self.parser.consume(data) {
                Ok(r) => r,
                Err(e) => break Err(ReactorError::from(e)),
            };
            if let Some(ms) = microslice {
                if let Err(e) = self.assembler.add_microslice(&ms) {
                    break Err(ReactorError::from(e));
                }
            }
            data = &data[n..];
        };
        self.publish_stats();
        result
    }

    fn publish_stats(&self) {
        self.stats
            .publish(self.parser.stats(), self.assembler.stats());
    }

    /// Throw away the partial microslice and the partial millislice
    fn discard_in_flight(&mut self) {
        self.parser.discard_partial();
        self.assembler.discard_in_flight();
        self.publish_stats();
    }

    /// The connection is gone; the next one starts from a clean parser and window
    fn end_session(&mut self) {
        self.discard_in_flight();
        self.parser.restart();
    }

    /// Acknowledge a suspension and wait for the host to resume or shut down
    async fn park(&mut self) {
        self.discard_in_flight();
        self.control.readout_suspended.store(true, Ordering::SeqCst);
        log::debug!("Readout suspended");
        while self.control.suspend_requested() && self.control.running() {
            tokio::time::sleep(self.tick_period).await;
        }
        if self.control.running() {
            self.parser.reset();
            self.assembler.reset();
            self.publish_stats();
            self.control.readout_suspended.store(false, Ordering::SeqCst);
            log::debug!("Readout resumed with fresh run state");
        }
    }

    /// Readout cannot continue; hold until the host stops the run
    async fn fail(&mut self) {
        self.end_session();
        self.control.failed.store(true, Ordering::SeqCst);
        while !self.control.suspend_requested() && self.control.running() {
            tokio::time::sleep(self.tick_period).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_fires_only_for_its_target() {
        let mut deadline = Deadline::new();
        deadline.set(DeadlineTarget::Acceptor, Duration::from_millis(5));
        let other = tokio::time::timeout(
            Duration::from_millis(20),
            deadline.expired(DeadlineTarget::DataSocket),
        )
        .await;
        assert!(other.is_err());
        let own = tokio::time::timeout(
            Duration::from_millis(50),
            deadline.expired(DeadlineTarget::Acceptor),
        )
        .await;
        assert!(own.is_ok());
        assert_eq!(deadline.target, DeadlineTarget::None);
    }

    #[tokio::test]
    async fn test_zero_timeout_disarms() {
        let mut deadline = Deadline::new();
        deadline.set(DeadlineTarget::DataSocket, Duration::from_millis(5));
        deadline.set(DeadlineTarget::DataSocket, Duration::ZERO);
        let result = tokio::time::timeout(
            Duration::from_millis(20),
            deadline.expired(DeadlineTarget::DataSocket),
        )
        .await;
        assert!(result.is_err());
    }
}
