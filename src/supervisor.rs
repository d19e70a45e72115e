//! Connection state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (Disconnected | Terminated)
//!                     |
//!                     +-> Disconnected (after backoff)
//! ```
//!
//! A failed connect and a device error inside a session both wait one fixed
//! backoff and start over. There is no retry budget. `Terminated` is only
//! reached through the stop flag, or when the session body fails with an
//! error that is not a device error.

use crate::device::{Device, DeviceConnector};
use crate::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Terminated,
}

/// Waits out the reconnect backoff.
pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

/// Sleeps on the current thread, waking early when the stop flag is raised.
pub struct ThreadSleeper {
    stop: Arc<AtomicBool>,
}

impl ThreadSleeper {
    const SLICE: Duration = Duration::from_millis(100);

    pub fn new(stop: Arc<AtomicBool>) -> Self {
        Self { stop }
    }
}

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stop.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(Self::SLICE.min(deadline - now));
        }
    }
}

pub struct ConnectionSupervisor<C: DeviceConnector, S: Sleeper> {
    connector: C,
    sleeper: S,
    backoff: Duration,
    stop: Arc<AtomicBool>,
    state: ConnectionState,
    backoffs: u64,
    sessions: u64,
}

impl<C: DeviceConnector, S: Sleeper> ConnectionSupervisor<C, S> {
    pub fn new(connector: C, sleeper: S, backoff: Duration, stop: Arc<AtomicBool>) -> Self {
        Self {
            connector,
            sleeper,
            backoff,
            stop,
            state: ConnectionState::Disconnected,
            backoffs: 0,
            sessions: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of backoff waits taken so far.
    pub fn backoffs(&self) -> u64 {
        self.backoffs
    }

    /// Number of sessions that reached `Connected`.
    pub fn sessions(&self) -> u64 {
        self.sessions
    }

    /// Drive the state machine until `Terminated`, running `body` once per
    /// connected session. `body` returning `Ok` means it saw the stop flag.
    pub fn run<F>(&mut self, mut body: F) -> Result<(), Error>
    where
        F: FnMut(&mut C::Device) -> Result<(), Error>,
    {
        loop {
            match self.state {
                ConnectionState::Disconnected => {
                    if self.stop_requested() {
                        self.transition(ConnectionState::Terminated);
                    } else {
                        self.transition(ConnectionState::Connecting);
                    }
                }
                ConnectionState::Connecting => match self.connector.connect() {
                    Ok(mut device) => {
                        self.transition(ConnectionState::Connected);
                        self.sessions += 1;
                        let result = body(&mut device);
                        close_quietly(&mut device);
                        self.after_session(result)?;
                    }
                    Err(err) => {
                        warn!(
                            "Device not available ({}), retrying in {}s",
                            err,
                            self.backoff.as_secs()
                        );
                        self.wait_backoff();
                        self.transition(ConnectionState::Disconnected);
                    }
                },
                // Sessions run to completion inside `Connecting`, so the loop
                // never observes `Connected` here.
                ConnectionState::Connected => self.transition(ConnectionState::Disconnected),
                ConnectionState::Terminated => return Ok(()),
            }
        }
    }

    fn after_session(&mut self, result: Result<(), Error>) -> Result<(), Error> {
        match result {
            Ok(()) => {
                self.transition(ConnectionState::Terminated);
                Ok(())
            }
            Err(err) if err.is_session_error() => {
                if self.stop_requested() {
                    self.transition(ConnectionState::Terminated);
                    return Ok(());
                }
                warn!(
                    "Lost connection to device ({}), reconnecting in {}s",
                    err,
                    self.backoff.as_secs()
                );
                self.transition(ConnectionState::Disconnected);
                self.wait_backoff();
                Ok(())
            }
            Err(err) => {
                error!("Session failed with a non-recoverable error: {}", err);
                self.transition(ConnectionState::Terminated);
                Err(err)
            }
        }
    }

    fn wait_backoff(&mut self) {
        self.backoffs += 1;
        self.sleeper.sleep(self.backoff);
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn transition(&mut self, next: ConnectionState) {
        if next == ConnectionState::Connected || next == ConnectionState::Terminated {
            info!("Connection: {:?} -> {:?}", self.state, next);
        } else {
            debug!("Connection: {:?} -> {:?}", self.state, next);
        }
        self.state = next;
    }
}

fn close_quietly<D: Device>(device: &mut D) {
    if let Err(err) = device.close() {
        debug!("Ignoring error while closing device: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::memory::MemoryDevice;
    use crate::device::DeviceError;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Default)]
    struct CountingSleeper {
        waits: Vec<Duration>,
    }

    impl Sleeper for &mut CountingSleeper {
        fn sleep(&mut self, duration: Duration) {
            self.waits.push(duration);
        }
    }

    /// Fails `failures` times, then hands out fresh in-memory devices.
    struct FlakyConnector {
        failures: usize,
        attempts: usize,
        handed_out: Vec<Rc<Cell<bool>>>,
    }

    impl FlakyConnector {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                attempts: 0,
                handed_out: Vec::new(),
            }
        }

        fn closed(&self) -> Vec<bool> {
            self.handed_out.iter().map(|flag| flag.get()).collect()
        }
    }

    impl DeviceConnector for FlakyConnector {
        type Device = MemoryDevice;

        fn connect(&mut self) -> Result<MemoryDevice, DeviceError> {
            self.attempts += 1;
            if self.failures > 0 {
                self.failures -= 1;
                return Err(DeviceError::disconnected("no camera on the bus"));
            }
            let device = MemoryDevice::new();
            self.handed_out.push(device.closed_flag());
            Ok(device)
        }
    }

    #[test]
    fn test_connects_after_two_backoffs() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut sleeper = CountingSleeper::default();
        let connector = FlakyConnector::new(2);
        let mut supervisor =
            ConnectionSupervisor::new(connector, &mut sleeper, Duration::from_secs(5), stop.clone());

        let mut connected_after = None;
        supervisor
            .run(|_device| {
                connected_after = Some(());
                stop.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert!(connected_after.is_some());
        assert_eq!(supervisor.backoffs(), 2);
        assert_eq!(supervisor.sessions(), 1);
        assert_eq!(supervisor.state(), ConnectionState::Terminated);
        assert_eq!(supervisor.connector.attempts, 3);
        drop(supervisor);
        assert_eq!(sleeper.waits, vec![Duration::from_secs(5); 2]);
    }

    #[test]
    fn test_session_error_reconnects() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut sleeper = CountingSleeper::default();
        let connector = FlakyConnector::new(0);
        let mut supervisor =
            ConnectionSupervisor::new(connector, &mut sleeper, Duration::from_secs(5), stop.clone());

        let mut sessions = 0;
        supervisor
            .run(|_device| {
                sessions += 1;
                if sessions < 3 {
                    Err(DeviceError::disconnected("cable pulled").into())
                } else {
                    stop.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        assert_eq!(sessions, 3);
        assert_eq!(supervisor.sessions(), 3);
        assert_eq!(supervisor.backoffs(), 2);
        assert_eq!(supervisor.connector.closed(), vec![true; 3]);
    }

    #[test]
    fn test_device_is_closed_after_disconnect_and_after_stop() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut sleeper = CountingSleeper::default();
        let mut supervisor = ConnectionSupervisor::new(
            FlakyConnector::new(0),
            &mut sleeper,
            Duration::from_secs(5),
            stop.clone(),
        );

        let mut sessions = 0;
        supervisor
            .run(|device| {
                sessions += 1;
                assert!(!device.is_closed());
                if sessions == 1 {
                    return Err(DeviceError::disconnected("cable pulled").into());
                }
                stop.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert_eq!(supervisor.connector.closed(), vec![true, true]);
        assert_eq!(supervisor.state(), ConnectionState::Terminated);
    }

    #[test]
    fn test_stop_before_connect_terminates_immediately() {
        let stop = Arc::new(AtomicBool::new(true));
        let mut sleeper = CountingSleeper::default();
        let connector = FlakyConnector::new(0);
        let mut supervisor =
            ConnectionSupervisor::new(connector, &mut sleeper, Duration::from_secs(5), stop);

        supervisor.run(|_device| Ok(())).unwrap();
        assert_eq!(supervisor.sessions(), 0);
        assert_eq!(supervisor.connector.attempts, 0);
    }

    #[test]
    fn test_non_device_error_is_fatal() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut sleeper = CountingSleeper::default();
        let connector = FlakyConnector::new(0);
        let mut supervisor =
            ConnectionSupervisor::new(connector, &mut sleeper, Duration::from_secs(5), stop);

        let err = supervisor
            .run(|_device| Err(Error::InvalidConfig("broken".to_string())))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert_eq!(supervisor.state(), ConnectionState::Terminated);
        assert_eq!(supervisor.backoffs(), 0);
        assert_eq!(supervisor.connector.closed(), vec![true]);
    }

    #[test]
    fn test_thread_sleeper_wakes_on_stop() {
        let stop = Arc::new(AtomicBool::new(true));
        let mut sleeper = ThreadSleeper::new(stop);
        let started = Instant::now();
        sleeper.sleep(Duration::from_secs(60));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
