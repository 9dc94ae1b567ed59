//! The dispatch thread: one per multiplexer instance.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::{Builder, JoinHandle},
    time::Duration,
};

use mio::Events;

use crate::poll::{IoEvent, Multiplexer, WAKE_TOKEN};

const EVENTS_CAPACITY: usize = 1024;

/// Owns the background thread that blocks in the multiplexer's wait call
/// and hands each readiness event to a dispatch closure.
///
/// The dispatch closure is expected to be fast: it toggles interest bits
/// and submits the actual I/O to a worker pool. Submission may block on
/// pool backpressure, which stalls dispatch by design.
pub struct Reactor {
    mux: Arc<Multiplexer>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    pub fn spawn<F>(name: &str, mux: Arc<Multiplexer>, dispatch: F) -> Reactor
    where
        F: Fn(IoEvent) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let loop_running = running.clone();
        let loop_mux = mux.clone();
        let thread = Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut events = Events::with_capacity(EVENTS_CAPACITY);
                while loop_running.load(Ordering::SeqCst) {
                    match loop_mux.wait(&mut events, None) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            tracing::error!("error waiting for readiness events: {e}");
                            break;
                        }
                    }
                    for event in events.iter() {
                        if event.token() == WAKE_TOKEN {
                            continue;
                        }
                        dispatch(IoEvent::from_mio(event));
                    }
                }
            })
            .expect("failed to spawn dispatch thread");

        Reactor {
            mux,
            running,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Signal the dispatch thread to exit and join it.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.mux.wake();
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Condvar-backed stop flag for periodic background threads (reapers,
/// reconnect retries). `wait_for` doubles as an interruptible sleep.
pub struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Sleep up to `timeout`; returns true once the signal has fired.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let stopped = self.stopped.lock().unwrap();
        let (stopped, _) = self
            .cv
            .wait_timeout_while(stopped, timeout, |stopped| !*stopped)
            .unwrap();
        *stopped
    }

    /// Block until the signal fires.
    pub fn wait(&self) {
        let stopped = self.stopped.lock().unwrap();
        let _guard = self.cv.wait_while(stopped, |stopped| !*stopped).unwrap();
    }

    pub fn trigger(&self) {
        *self.stopped.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.stopped.lock().unwrap()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn test_reactor_starts_and_stops() {
        let mux = Arc::new(Multiplexer::new().unwrap());
        let dispatched = Arc::new(AtomicUsize::new(0));
        let count = dispatched.clone();

        let reactor = Reactor::spawn("test-mux", mux, move |_event| {
            count.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(50));
        reactor.stop();
        // the wake event is filtered, so nothing is dispatched
        assert_eq!(dispatched.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mux = Arc::new(Multiplexer::new().unwrap());
        let reactor = Reactor::spawn("test-mux", mux, |_| {});
        reactor.stop();
        reactor.stop();
    }

    #[test]
    fn test_stop_signal_interrupts_sleep() {
        let signal = Arc::new(StopSignal::new());
        let sleeper = signal.clone();
        let start = Instant::now();

        let handle = std::thread::spawn(move || sleeper.wait_for(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        signal.trigger();

        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_stop_signal_times_out_quietly() {
        let signal = StopSignal::new();
        assert!(!signal.wait_for(Duration::from_millis(10)));
        assert!(!signal.is_triggered());
    }
}
