// resurrect.rs - One-shot, re-armable resurrection timer
//
// A single background thread sleeps until armed, waits out the delay, then
// runs the sweep. The sweep's return value re-arms the timer (some nodes are
// still dead) or leaves it idle. Arming an already armed timer is a no-op.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

#[derive(Default)]
struct TimerState {
    deadline: Option<Instant>,
    stopped: bool,
}

#[derive(Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    signal: Condvar,
}

pub struct ResurrectionTimer {
    shared: Arc<TimerShared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ResurrectionTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResurrectionTimer")
            .field("armed", &self.is_armed())
            .finish()
    }
}

impl ResurrectionTimer {
    /// Spawns the timer thread, initially idle.
    ///
    /// `sweep` returns the delay before the next sweep, or `None` to go idle.
    pub fn start<F>(sweep: F) -> Self
    where
        F: Fn() -> Option<Duration> + Send + 'static,
    {
        let shared = Arc::new(TimerShared::default());
        let thread_shared = Arc::clone(&shared);
        let join = thread::spawn(move || run(&thread_shared, sweep));
        ResurrectionTimer {
            shared,
            join: Mutex::new(Some(join)),
        }
    }

    /// Schedules a sweep after `delay` unless one is already pending.
    ///
    /// Returns true when this call armed the timer.
    pub fn arm(&self, delay: Duration) -> bool {
        let mut state = self.shared.state.lock();
        if state.stopped || state.deadline.is_some() {
            return false;
        }
        state.deadline = Some(Instant::now() + delay);
        drop(state);
        self.shared.signal.notify_all();
        true
    }

    pub fn is_armed(&self) -> bool {
        self.shared.state.lock().deadline.is_some()
    }

    /// Stops the thread and waits for it unless called from the timer thread
    /// itself. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            state.deadline = None;
        }
        self.shared.signal.notify_all();

        let join = self.join.lock().take();
        if let Some(join) = join {
            if join.thread().id() != thread::current().id() && join.join().is_err() {
                error!("resurrection thread panicked");
            }
        }
    }
}

impl Drop for ResurrectionTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<F>(shared: &TimerShared, sweep: F)
where
    F: Fn() -> Option<Duration>,
{
    let mut state = shared.state.lock();
    loop {
        if state.stopped {
            return;
        }
        match state.deadline {
            None => shared.signal.wait(&mut state),
            Some(deadline) if Instant::now() < deadline => {
                shared.signal.wait_until(&mut state, deadline);
            }
            Some(_) => {
                state.deadline = None;
                drop(state);
                let next = sweep();
                state = shared.state.lock();
                if let Some(delay) = next {
                    if !state.stopped && state.deadline.is_none() {
                        state.deadline = Some(Instant::now() + delay);
                        debug!(?delay, "resurrection timer re-armed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_once_per_arm() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = ResurrectionTimer::start(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            None
        });

        assert!(timer.arm(Duration::from_millis(20)));
        assert!(!timer.arm(Duration::from_millis(20)));
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
        timer.stop();
    }

    #[test]
    fn sweep_can_rearm() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = ResurrectionTimer::start(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Some(Duration::from_millis(10))
            } else {
                None
            }
        });

        timer.arm(Duration::from_millis(10));
        thread::sleep(Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn stop_is_idempotent_and_disarms() {
        let timer = ResurrectionTimer::start(|| None);
        timer.stop();
        timer.stop();
        assert!(!timer.arm(Duration::from_millis(1)));
    }
}
