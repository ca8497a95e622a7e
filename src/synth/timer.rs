// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
use tracing::{debug, info, span, warn, Level};

use super::TimerCallback;

/// Default priority for the timer thread when IMUSE_TIMER_PRIORITY is unset.
const DEFAULT_TIMER_THREAD_PRIORITY: u8 = 70;

/// A cancel handle is shared between the owner of a thread and the thread itself. It's the
/// thread's responsibility to check it between units of work.
#[derive(Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Creates a new cancel handle.
    pub fn new() -> CancelHandle {
        CancelHandle::default()
    }

    /// Returns true if the handle has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cancels the handle. Cancelling twice is harmless.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Reads IMUSE_TIMER_PRIORITY (0-99) once when the timer starts.
fn timer_thread_priority() -> Option<ThreadPriorityValue> {
    std::env::var("IMUSE_TIMER_PRIORITY")
        .ok()
        .and_then(|v| {
            let n = v.parse::<u8>().ok()?;
            (n < 100).then(|| ThreadPriorityValue::try_from(n).ok())?
        })
        .or_else(|| ThreadPriorityValue::try_from(DEFAULT_TIMER_THREAD_PRIORITY).ok())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| {
            v == "1"
                || v.eq_ignore_ascii_case("true")
                || v.eq_ignore_ascii_case("yes")
                || v.eq_ignore_ascii_case("on")
        })
        .unwrap_or(false)
}

/// Raises the priority of the calling thread. Realtime FIFO scheduling is attempted on unix
/// unless IMUSE_DISABLE_RT_TIMER is set.
fn configure_timer_thread_priority() {
    let Some(priority) = timer_thread_priority() else {
        return;
    };
    let tp = ThreadPriority::Crossplatform(priority);
    if let Err(e) = set_current_thread_priority(tp) {
        debug!(error = ?e, "Unable to raise timer thread priority");
    }

    #[cfg(unix)]
    if !env_flag("IMUSE_DISABLE_RT_TIMER") {
        use thread_priority::unix::{
            set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
            ThreadSchedulePolicy,
        };
        match set_thread_priority_and_policy(
            thread_native_id(),
            tp,
            ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
        ) {
            Ok(()) => info!("Enabled RT SCHED_FIFO for timer thread"),
            Err(e) => warn!(error = %e, "Failed to set RT SCHED_FIFO for timer thread"),
        }
    }
}

/// A thread that fires a callback once per period until stopped.
pub(crate) struct Timer {
    cancel_handle: CancelHandle,
    join: Option<JoinHandle<()>>,
}

impl Timer {
    /// Starts the timer thread.
    pub fn start(period: Duration, callback: TimerCallback) -> Timer {
        let cancel_handle = CancelHandle::new();
        let join = {
            let cancel_handle = cancel_handle.clone();
            thread::spawn(move || {
                let span = span!(Level::INFO, "imuse timer");
                let _enter = span.enter();

                configure_timer_thread_priority();
                info!(period = ?period, "Timer started.");

                let mut next = Instant::now();
                loop {
                    if cancel_handle.is_cancelled() {
                        info!("Timer stopped.");
                        return;
                    }
                    callback();

                    next += period;
                    let now = Instant::now();
                    if next > now {
                        spin_sleep::sleep(next - now);
                    } else if now - next > period * 10 {
                        // Fell far behind (suspended process, debugger). Don't try to catch up.
                        warn!(behind = ?(now - next), "Timer fell behind, resynchronizing.");
                        next = now;
                    }
                }
            })
        };

        Timer {
            cancel_handle,
            join: Some(join),
        }
    }

    /// Stops the timer thread and waits for it to exit.
    pub fn stop(&mut self) {
        self.cancel_handle.cancel();
        if let Some(join) = self.join.take() {
            // The callback may be the thread doing the stopping.
            if join.thread().id() == thread::current().id() {
                return;
            }
            if join.join().is_err() {
                warn!("Timer thread panicked.");
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use crate::testutil::eventually;

    use super::{CancelHandle, Timer};

    #[test]
    fn cancel_handle() {
        let cancel_handle = CancelHandle::new();
        assert!(!cancel_handle.is_cancelled());
        let clone = cancel_handle.clone();
        clone.cancel();
        assert!(cancel_handle.is_cancelled());
        clone.cancel();
        assert!(cancel_handle.is_cancelled());
    }

    #[test]
    fn timer_fires_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut timer = {
            let count = count.clone();
            Timer::start(
                Duration::from_millis(1),
                Arc::new(move || {
                    count.fetch_add(1, Ordering::Relaxed);
                }),
            )
        };

        eventually(
            || count.load(Ordering::Relaxed) >= 5,
            "Timer never fired five times",
        );
        timer.stop();
        let stopped_at = count.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(stopped_at, count.load(Ordering::Relaxed));
    }
}
