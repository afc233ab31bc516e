//! The interception session: coordinator, workers, and their plumbing.
//!
//! [`SessionEngine`] owns the two background workers (poisoner + sniffer),
//! the raw-socket handles they run on, and the shared shutdown flag. Stop is
//! cooperative with a hard fallback: workers poll the flag at every
//! suspension point, and if they fail to exit within the deadline they are
//! detached after every target has been deactivated, so a wedged worker can
//! no longer poison anyone.
//!
//! Capture delivery is a typed bounded queue per session; no callbacks into
//! global state, no singletons. The sniffer holds the producer side and the
//! consumer drains [`SessionEngine::frames`] at its own cadence.

pub mod link;
pub mod poisoner;
pub mod queue;
pub mod sniffer;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use pnet::datalink::NetworkInterface;
use pnet::util::MacAddr;
use serde::Serialize;

use crate::config;
use crate::core::detect::ArpAlert;
use crate::core::targets::TargetTable;
use crate::error::{Error, Result};
use crate::inventory::ScanResult;
use self::queue::FrameQueue;

/// How a session stop concluded. `Forced` means the deadline elapsed and
/// the workers were detached; callers may want to alarm on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopOutcome {
    Clean,
    Forced,
}

/// Coordinator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// Lifecycle and anomaly events surfaced to the session's sink.
#[derive(Debug, Clone, Serialize)]
pub enum SessionEvent {
    Started { interface: String, targets: usize },
    Stopped { outcome: StopOutcome },
    Alert(ArpAlert),
}

/// Per-session event sink. Invoked from worker threads; must not block.
pub type EventSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Everything a session needs, derived once at start and immutable for the
/// session's lifetime.
pub struct SessionConfig {
    pub interface: NetworkInterface,
    pub attacker_mac: MacAddr,
    pub if_index: u32,
    pub gateway_ip: Ipv4Addr,
    pub targets: Arc<TargetTable>,
}

impl SessionConfig {
    /// Resolve a scan result plus target indices into a session config:
    /// validates the interface, reads the attacker MAC and interface index,
    /// and installs the target table.
    pub fn resolve(scan: &ScanResult, indices: &[usize]) -> Result<Self> {
        let interface = link::resolve_interface(&scan.interface)?;
        let attacker_mac = link::local_mac(&interface);
        let if_index = interface.index;
        let targets = Arc::new(TargetTable::install(scan, indices));
        Ok(Self {
            interface,
            attacker_mac,
            if_index,
            gateway_ip: scan.gateway_ip,
            targets,
        })
    }
}

/// A running interception session.
pub struct SessionEngine {
    shutdown: Arc<AtomicBool>,
    state: Mutex<SessionState>,
    targets: Arc<TargetTable>,
    interface_name: String,
    frames: Arc<FrameQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    fatal: Arc<Mutex<Option<Error>>>,
    events: EventSink,
}

impl SessionEngine {
    /// Start poisoning and sniffing.
    ///
    /// Opening the transmit socket doubles as the privilege check: it is the
    /// first raw-socket operation and fails fast with `PrivilegeDenied`.
    /// Any setup failure leaves nothing running.
    pub fn start(config: SessionConfig, events: EventSink) -> Result<Self> {
        let SessionConfig {
            interface,
            attacker_mac,
            if_index,
            gateway_ip,
            targets,
        } = config;

        tracing::info!(
            "starting session on {} (index {if_index}, mac {attacker_mac}), \
             {} target(s), impersonating {gateway_ip}",
            interface.name,
            targets.len()
        );

        let tx = link::open_tx(&interface)?;
        let rx = link::open_rx(&interface)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(FrameQueue::default());
        let fatal: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let mut workers = Vec::with_capacity(2);

        {
            let targets = Arc::clone(&targets);
            let shutdown = Arc::clone(&shutdown);
            let fatal = Arc::clone(&fatal);
            let handle = std::thread::Builder::new()
                .name("arp-poisoner".into())
                .spawn(move || {
                    if let Err(e) = poisoner::run_poison_loop(
                        tx,
                        targets,
                        attacker_mac,
                        gateway_ip,
                        Arc::clone(&shutdown),
                    ) {
                        tracing::error!("poisoner aborted: {e}");
                        *fatal.lock().unwrap() = Some(e);
                        shutdown.store(true, Ordering::Relaxed);
                    }
                })
                .map_err(|e| Error::Session(format!("cannot spawn poisoner: {e}")))?;
            workers.push(handle);
        }

        {
            let targets = Arc::clone(&targets);
            let shutdown = Arc::clone(&shutdown);
            let fatal = Arc::clone(&fatal);
            let frames = Arc::clone(&frames);
            let events = Arc::clone(&events);
            let shutdown_err = Arc::clone(&shutdown);
            let handle = std::thread::Builder::new()
                .name("sniffer".into())
                .spawn(move || {
                    if let Err(e) = sniffer::run_sniff_loop(
                        rx,
                        targets,
                        attacker_mac,
                        frames,
                        events,
                        Arc::clone(&shutdown),
                    ) {
                        tracing::error!("sniffer aborted: {e}");
                        *fatal.lock().unwrap() = Some(e);
                        shutdown.store(true, Ordering::Relaxed);
                    }
                })
                .map_err(|e| {
                    // Don't leave a half-started session behind.
                    shutdown_err.store(true, Ordering::Relaxed);
                    Error::Session(format!("cannot spawn sniffer: {e}"))
                })?;
            workers.push(handle);
        }

        events(SessionEvent::Started {
            interface: interface.name.clone(),
            targets: targets.len(),
        });

        Ok(Self {
            shutdown,
            state: Mutex::new(SessionState::Running),
            targets,
            interface_name: interface.name,
            frames,
            workers: Mutex::new(workers),
            fatal,
            events,
        })
    }

    /// The session's capture queue. Consumers drain it at their own cadence
    /// and can watch `dropped()` for overflow loss.
    pub fn frames(&self) -> Arc<FrameQueue> {
        Arc::clone(&self.frames)
    }

    pub fn interface(&self) -> &str {
        &self.interface_name
    }

    pub fn targets(&self) -> &TargetTable {
        &self.targets
    }

    /// Current coordinator state. A fatal worker error while running reads
    /// as `Error` (the workers have already initiated shutdown themselves).
    pub fn state(&self) -> SessionState {
        let state = *self.state.lock().unwrap();
        if state == SessionState::Running && self.fatal.lock().unwrap().is_some() {
            SessionState::Error
        } else {
            state
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Take the fatal worker error, if one was recorded.
    pub fn take_error(&self) -> Option<Error> {
        self.fatal.lock().unwrap().take()
    }

    /// Stop with the configured default deadline.
    pub fn stop_default(&self) -> StopOutcome {
        self.stop(Duration::from_millis(config::STOP_DEADLINE_MS))
    }

    /// Stop the session within a bounded deadline. Never hangs.
    ///
    /// The flag is set and every target deactivated before any waiting
    /// happens; even a misbehaving copy of the poison loop sends nothing
    /// further for an inactive target. Workers are then polled in short
    /// intervals and joined. When the deadline elapses instead, the workers
    /// are detached and the target count is cleared on top of the
    /// deactivation, so a lingering worker finds an empty table.
    pub fn stop(&self, deadline: Duration) -> StopOutcome {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                SessionState::Stopped => return StopOutcome::Clean,
                SessionState::Stopping => {}
                _ => *state = SessionState::Stopping,
            }
        }

        self.shutdown.store(true, Ordering::Relaxed);
        self.targets.deactivate_all();

        let workers: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        let started = Instant::now();
        let poll = Duration::from_millis(config::STOP_POLL_INTERVAL_MS);

        let outcome = loop {
            if workers.iter().all(|w| w.is_finished()) {
                for worker in workers {
                    if worker.join().is_err() {
                        tracing::warn!("worker panicked during shutdown");
                    }
                }
                break StopOutcome::Clean;
            }
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                tracing::warn!(
                    "stop deadline ({deadline:?}) elapsed, detaching workers"
                );
                drop(workers);
                self.targets.clear();
                break StopOutcome::Forced;
            }
            std::thread::sleep(poll.min(deadline - elapsed));
        };

        *self.state.lock().unwrap() = SessionState::Stopped;
        (self.events)(SessionEvent::Stopped { outcome });
        tracing::info!("session stopped ({outcome:?})");
        outcome
    }
}

impl Drop for SessionEngine {
    fn drop(&mut self) {
        // Last-resort release: flag the workers down and neutralize the
        // target set even if stop() was never called.
        self.shutdown.store(true, Ordering::Relaxed);
        self.targets.deactivate_all();
        if *self.state.lock().unwrap() != SessionState::Stopped {
            tracing::warn!("SessionEngine dropped while active, workers flagged down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Device;

    fn table_of(n: usize) -> Arc<TargetTable> {
        let devices = (0..n)
            .map(|i| Device {
                ip: Ipv4Addr::new(10, 0, 0, 1 + i as u8),
                mac: MacAddr::new(0x02, 0, 0, 0, 0, i as u8),
                is_gateway: false,
            })
            .collect();
        let scan = ScanResult {
            devices,
            gateway_ip: Ipv4Addr::new(10, 0, 0, 254),
            interface: "eth0".into(),
        };
        let indices: Vec<usize> = (0..n).collect();
        Arc::new(TargetTable::install(&scan, &indices))
    }

    /// A running engine without sockets: workers are supplied by the test.
    fn engine_with(workers: Vec<JoinHandle<()>>, targets: Arc<TargetTable>) -> SessionEngine {
        SessionEngine {
            shutdown: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(SessionState::Running),
            targets,
            interface_name: "eth0".into(),
            frames: Arc::new(FrameQueue::default()),
            workers: Mutex::new(workers),
            fatal: Arc::new(Mutex::new(None)),
            events: Arc::new(|_| {}),
        }
    }

    #[test]
    fn test_clean_stop_retains_target_count() {
        let targets = table_of(3);
        let engine = engine_with(Vec::new(), Arc::clone(&targets));

        let outcome = engine.stop(Duration::from_secs(1));

        assert_eq!(outcome, StopOutcome::Clean);
        assert!(engine.shutdown.load(Ordering::Relaxed));
        assert_eq!(engine.state(), SessionState::Stopped);
        // Entries survive a clean stop; only the active flags clear.
        assert_eq!(targets.len(), 3);
        assert_eq!(targets.active_count(), 0);
    }

    #[test]
    fn test_forced_stop_clears_target_count() {
        let targets = table_of(3);
        let stuck = std::thread::Builder::new()
            .name("stuck-worker".into())
            .spawn(|| std::thread::sleep(Duration::from_millis(400)))
            .expect("failed to spawn stuck worker");
        let engine = engine_with(vec![stuck], Arc::clone(&targets));

        let outcome = engine.stop(Duration::from_millis(50));

        assert_eq!(outcome, StopOutcome::Forced);
        assert_eq!(engine.state(), SessionState::Stopped);
        assert_eq!(targets.len(), 0);
        assert_eq!(targets.active_count(), 0);
    }

    #[test]
    fn test_stop_outcome_serializes_as_variant_name() {
        assert_eq!(serde_json::to_string(&StopOutcome::Clean).unwrap(), "\"Clean\"");
        assert_eq!(serde_json::to_string(&StopOutcome::Forced).unwrap(), "\"Forced\"");
    }

    #[test]
    fn test_session_event_serializes() {
        let ev = SessionEvent::Started {
            interface: "eth0".into(),
            targets: 3,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["Started"]["interface"], "eth0");
        assert_eq!(json["Started"]["targets"], 3);
    }
}
