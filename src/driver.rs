//! The top-level capture loop and its shutdown sequence.
//!
//! ```text
//!   Capturing ──(exhausted | command done | interrupt)──▶ Draining(deadline)
//!   Draining ──(deadline)──▶ Flushed ──(storage closed, report built)──▶ ReportedAndExit
//! ```
//!
//! Draining keeps processing packets; it only bounds how long the run
//! continues. Once the deadline passes every direction is marked closing and
//! the reassembler is flushed, which ends every reader task.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, trace, warn};

use crate::assembly::Assembler;
use crate::capture::{CapturedPacket, PacketSource, Scope};
use crate::config::Config;
use crate::launch::LaunchedCommand;
use crate::report::Report;
use crate::storage::EventRecorder;
use crate::tracker::{PacketAccountant, StreamRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Capturing,
    Draining { deadline: Instant },
    Flushed,
    ReportedAndExit,
}

/// Why the capture loop started draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReason {
    Exhausted,
    CommandFinished,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub after_exhaustion: Duration,
    pub after_command: Duration,
    pub join_grace: Duration,
    pub log_packets: bool,
}

impl From<&Config> for DriverConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            after_exhaustion: cfg.drain.after_exhaustion(),
            after_command: cfg.drain.after_command(),
            join_grace: cfg.drain.join_grace(),
            log_packets: cfg.log_packets,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DriverSummary {
    pub packets: u64,
    pub in_scope: u64,
    pub streams_opened: u64,
    pub connections: usize,
    /// Reader tasks still tracked at the end of the drain that finished
    /// within the grace period.
    pub tasks_joined: usize,
    pub tasks_abandoned: usize,
    pub reason: Option<DrainReason>,
}

pub struct Driver {
    config: DriverConfig,
    scope: Box<dyn Scope>,
    registry: Arc<StreamRegistry>,
    assembler: Assembler<Arc<StreamRegistry>>,
    accountant: PacketAccountant,
    phase: Phase,
    summary: DriverSummary,
}

impl Driver {
    pub fn new(
        config: DriverConfig,
        scope: Box<dyn Scope>,
        registry: Arc<StreamRegistry>,
        assembler: Assembler<Arc<StreamRegistry>>,
    ) -> Self {
        Self {
            config,
            scope,
            accountant: PacketAccountant::new(registry.clone()),
            registry,
            assembler,
            phase: Phase::Capturing,
            summary: DriverSummary::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Runs until the drain deadline, then flushes everything and waits a
    /// bounded time for the reader tasks to finish.
    pub async fn run<I>(
        &mut self,
        mut packets: PacketSource,
        mut command: Option<LaunchedCommand>,
        interrupt: I,
    ) -> anyhow::Result<DriverSummary>
    where
        I: Future<Output = ()>,
    {
        if self.phase != Phase::Capturing {
            anyhow::bail!("driver already ran");
        }
        tokio::pin!(interrupt);
        let mut interrupted = false;
        let mut exhausted = false;

        loop {
            let deadline = match self.phase {
                Phase::Draining { deadline } => Some(deadline),
                _ => None,
            };

            tokio::select! {
                biased;

                _ = &mut interrupt, if !interrupted => {
                    interrupted = true;
                    info!("interrupt received");
                    self.begin_drain(Duration::ZERO, DrainReason::Interrupted);
                }

                _ = wait_deadline(deadline), if deadline.is_some() => break,

                status = wait_command(&mut command), if command.is_some() => {
                    if let Some(cmd) = command.take() {
                        let elapsed = cmd.started.elapsed();
                        match status {
                            Ok(status) => info!(command = %cmd.program, %status, ?elapsed, "command finished"),
                            Err(e) => warn!(command = %cmd.program, error = %e, ?elapsed, "error waiting for command"),
                        }
                    }
                    self.begin_drain(self.config.after_command, DrainReason::CommandFinished);
                }

                packet = packets.recv(), if !exhausted => match packet {
                    Some(packet) => self.process(&packet),
                    None => {
                        exhausted = true;
                        info!(packets = self.summary.packets, "capture source exhausted");
                        self.begin_drain(self.config.after_exhaustion, DrainReason::Exhausted);
                    }
                },
            }
        }

        packets.stop();
        if let Some(cmd) = &command {
            info!(command = %cmd.program, "command still running, no longer waiting for it");
        }
        self.flush().await;
        Ok(self.summary.clone())
    }

    /// Closes storage, waiting for pending writes, and builds the report.
    pub async fn report(&mut self, recorder: &EventRecorder) -> anyhow::Result<Report> {
        if self.phase != Phase::Flushed {
            anyhow::bail!("report requested before the capture was flushed");
        }
        let records = recorder.close().await?;
        self.phase = Phase::ReportedAndExit;
        Ok(Report::from_records(&records))
    }

    fn process(&mut self, packet: &CapturedPacket) {
        self.summary.packets += 1;
        if self.config.log_packets {
            trace!(
                net = %packet.net,
                transport = %packet.transport,
                seq = packet.tcp.seq,
                payload = packet.payload.len(),
                "packet"
            );
        }
        if !self.scope.in_scope(packet) {
            return;
        }
        self.summary.in_scope += 1;
        self.accountant.account_packet(packet);
        self.assembler.assemble(packet);
    }

    /// Enters or shortens the drain. A later, longer deadline never extends
    /// an earlier one.
    fn begin_drain(&mut self, delay: Duration, reason: DrainReason) {
        let deadline = Instant::now() + delay;
        match self.phase {
            Phase::Draining { deadline: current } if current <= deadline => {}
            _ => {
                debug!(?reason, ?delay, "draining");
                self.phase = Phase::Draining { deadline };
                self.summary.reason = Some(reason);
            }
        }
    }

    async fn flush(&mut self) {
        self.registry.close_all();
        self.assembler.flush_all();

        let mut tasks = self.registry.take_tasks();
        let joined = timeout(self.config.join_grace, async {
            for task in tasks.iter_mut() {
                if let Err(e) = task.await {
                    warn!(error = %e, "reader task failed");
                }
            }
        })
        .await;

        let abandoned = tasks.iter().filter(|t| !t.is_finished()).count();
        if joined.is_err() {
            warn!(abandoned, "reader tasks still running after the drain");
        }

        self.summary.streams_opened = self.assembler.streams_opened();
        self.summary.connections = self.registry.len();
        self.summary.tasks_joined = tasks.len() - abandoned;
        self.summary.tasks_abandoned = abandoned;
        self.phase = Phase::Flushed;
        info!(
            packets = self.summary.packets,
            connections = self.summary.connections,
            "capture flushed"
        );
    }
}

/// Resolves when `signal` reports an interrupt. A signal that could not be
/// registered never resolves, so the capture is not cut short by it.
pub async fn interrupt_from<S>(signal: S)
where
    S: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        warn!(error = %e, "cannot listen for interrupts");
        std::future::pending::<()>().await;
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_command(
    command: &mut Option<LaunchedCommand>,
) -> std::io::Result<std::process::ExitStatus> {
    match command {
        Some(cmd) => cmd.child.wait().await,
        None => std::future::pending().await,
    }
}
