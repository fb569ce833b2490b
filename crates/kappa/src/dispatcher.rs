//! The dispatcher: lifecycle state machine, poll loop, and suspension
//! primitives.
//!
//! One dispatcher multiplexes continuations over three event sources: the
//! primary selector (fd readiness and sleep timers), a manager selector
//! (the optional polling timer), and a wake-up event registered on both.
//! Everything is strictly single-threaded and cooperative; continuations
//! suspend only by calling one of the primitives below.
//!
//! Suspended work is owned by exactly one of three places:
//! `suspended` (resume on a readiness event), `ready` (run next poll), or
//! a per-semaphore queue in `blocked`. The waiting table maps selector
//! tokens back to suspended ids.

use std::collections::{BTreeMap, VecDeque};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::cont::{Cont, Next};
use crate::error::{Error, Result};
use crate::id::Id;
use crate::selector::{Ready, Selector, WakeEvent, READ, WRITE};
use crate::semaphore::Semaphore;
use crate::trace;
use crate::waiting::WaitingTable;

/// Dispatcher lifecycle.
///
/// `Unready` until first use, `Stopped` between runs, `Running` while the
/// poll loop executes, `Stopping` transiently during teardown.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    Unready,
    Stopped,
    Running,
    Stopping,
}

/// The OS-facing half, absent while `Unready`.
struct IoCore {
    selector: Selector<Id>,
    manager: Selector<Instant>,
    wake: WakeEvent,
    wake_token: usize,
    manager_wake_token: usize,
    /// The periodic polling timer on `manager`, when `run` was given a
    /// nonzero interval.
    timer: Option<usize>,
}

pub struct Dispatcher {
    state: State,
    /// Continuations parked on a semaphore: FIFO of waiter ids per
    /// semaphore, ordered across semaphores by id.
    blocked: BTreeMap<Semaphore, VecDeque<Id>>,
    /// Selector token → id for in-flight registrations.
    waiting: WaitingTable,
    /// Id → continuation to resume when its event fires.
    suspended: BTreeMap<Id, Cont>,
    /// Continuations runnable right now, FIFO.
    ready: VecDeque<Cont>,
    last_id: Id,
    io: Option<IoCore>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher {
            state: State::Unready,
            blocked: BTreeMap::new(),
            waiting: WaitingTable::new(),
            suspended: BTreeMap::new(),
            ready: VecDeque::new(),
            last_id: Id::INVALID,
            io: None,
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Build the selectors and the wake-up event. Idempotent; called
    /// lazily by anything that needs an initialized dispatcher.
    fn init(&mut self) -> Result<()> {
        if self.state != State::Unready {
            return Ok(());
        }
        let mut selector = Selector::new()?;
        let mut manager = Selector::new()?;
        let wake = WakeEvent::new()?;
        let wake_token = selector.register_event(&wake, Id::WAKEUP)?;
        let manager_wake_token = manager.register_event(&wake, Instant::now())?;

        self.waiting = WaitingTable::new();
        self.waiting.put(wake_token, Id::WAKEUP);
        self.ready.clear();
        self.last_id = Id::INVALID;
        // Prime the wake event so the first blocking select of a run
        // returns immediately and re-evaluates the queues; enqueues made
        // while stopped do not trigger it themselves.
        wake.trigger();
        self.io = Some(IoCore {
            selector,
            manager,
            wake,
            wake_token,
            manager_wake_token,
            timer: None,
        });
        self.state = State::Stopped;
        trace!("init: wake token={}", wake_token);
        Ok(())
    }

    /// Enter the poll loop until the dispatcher runs out of work or a
    /// continuation calls [`stop`](Self::stop).
    ///
    /// A zero `interval` returns as soon as the dispatcher goes idle; a
    /// nonzero one keeps it alive, waking at that wall-clock period.
    /// Errors from continuations or the selectors propagate to the caller
    /// and terminate the run abnormally.
    ///
    /// # Panics
    ///
    /// Calling `run` on a dispatcher that is not stopped (e.g. from inside
    /// a running continuation) is a programming error and asserts.
    pub fn run(&mut self, interval: Duration) -> Result<()> {
        self.init()?;
        assert!(
            self.state == State::Stopped,
            "run() requires a stopped dispatcher, state is {:?}",
            self.state
        );
        if interval > Duration::ZERO {
            let io = self.io_mut();
            let token = io.manager.register_timer_periodic(interval, Instant::now());
            io.timer = Some(token);
            trace!("run: polling every {:?}", interval);
        }
        self.state = State::Running;
        while self.state == State::Running {
            self.poll()?;
        }
        Ok(())
    }

    /// One poll iteration; a no-op unless running.
    pub fn poll(&mut self) -> Result<()> {
        if self.state != State::Running {
            return Ok(());
        }

        // Readiness first. The wake-after discipline guarantees this
        // cannot stall while runnable work exists: anything that enqueued
        // since the last iteration also triggered the wake event.
        if self.waiting.waiters() > 0 {
            let events = self.io_mut().selector.select(None)?;
            for Ready { token, data } in events {
                if self.state != State::Running {
                    // A step stopped the dispatcher mid-batch; the
                    // remaining events died with the old selector.
                    break;
                }
                let id = self.waiting.get(token);
                debug_assert_eq!(id, data, "waiting table diverged from registration payload");
                if id == Id::WAKEUP {
                    continue;
                }
                self.io_mut().selector.unregister(token)?;
                let cont = self
                    .suspended
                    .remove(&id)
                    .ok_or(Error::MissingRegistration(id))?;
                self.trampoline(cont)?;
            }
        }

        // Drain the yields observed now — and only those. Entries pushed
        // by the running steps wait for the next iteration, which bounds
        // reentrancy and keeps yield storms from starving readiness.
        let observed = self.ready.len();
        for _ in 0..observed {
            if self.state != State::Running {
                break;
            }
            let Some(cont) = self.ready.pop_front() else {
                break;
            };
            self.trampoline(cont)?;
        }

        // Idle handling: finish, or sit on the manager until the polling
        // timer ticks or a wake-up arrives.
        if self.state == State::Running && self.is_empty() {
            if self.io_mut().timer.is_none() {
                self.stop()?;
            } else if let Err(e) = self.io_mut().manager.select(None) {
                self.stop()?;
                return Err(Error::Os(e));
            }
        }
        Ok(())
    }

    /// Cancel all work and release every OS handle.
    ///
    /// Suspended and parked continuations are dropped without being
    /// stepped. The dispatcher re-initializes to `Stopped`, ready for a
    /// fresh `run`. Ignored unless running.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != State::Running {
            return Ok(());
        }
        self.state = State::Stopping;
        trace!("stop: dropping {} continuations", self.len());
        if let Some(io) = self.io.take() {
            let IoCore {
                mut selector,
                mut manager,
                wake,
                wake_token,
                manager_wake_token,
                timer,
            } = io;
            if let Some(token) = timer {
                let _ = manager.unregister(token);
            }
            let _ = manager.unregister(manager_wake_token);
            drop(manager);
            let _ = selector.unregister(wake_token);
            drop(wake);
            drop(selector);
        }
        self.blocked.clear();
        self.suspended.clear();
        self.state = State::Unready;
        self.init()
    }

    /// Interrupt any blocking select so the poll loop re-evaluates.
    ///
    /// Running: triggers the wake event. Unready: initializes. Otherwise
    /// ignored — nothing is selecting.
    pub fn wake_up(&mut self) {
        match self.state {
            State::Running => {
                if let Some(io) = self.io.as_ref() {
                    io.wake.trigger();
                }
            }
            State::Unready => {
                // Best effort; a failure here resurfaces on first real use.
                let _ = self.init();
            }
            State::Stopped | State::Stopping => {}
        }
    }

    // ── Introspection ───────────────────────────────────────────────

    pub fn state(&self) -> State {
        self.state
    }

    /// Total count of continuations the dispatcher is tracking, over all
    /// three owners (suspended, runnable, and semaphore-parked entries).
    pub fn len(&self) -> usize {
        let parked: usize = self.blocked.values().map(VecDeque::len).sum();
        self.suspended.len() + self.ready.len() + parked
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Allocation ──────────────────────────────────────────────────

    /// Issue the next registration id, initializing lazily.
    pub fn next_id(&mut self) -> Result<Id> {
        self.init()?;
        self.last_id = self.last_id.next();
        Ok(self.last_id)
    }

    /// A fresh semaphore whose identity comes from this dispatcher's id
    /// allocator.
    pub fn new_semaphore(&mut self) -> Result<Semaphore> {
        Ok(Semaphore::new(self.next_id()?))
    }

    // ── Trampoline ──────────────────────────────────────────────────

    /// Drive a continuation until it suspends or finishes. Runs on the
    /// caller's stack; the queues are only touched by the primitives the
    /// steps themselves invoke.
    pub fn trampoline(&mut self, c: Cont) -> Result<()> {
        let mut next = Some(c);
        while let Some(cont) = next {
            #[cfg(feature = "telemetry")]
            let started = Instant::now();
            next = cont.step(self)?;
            #[cfg(feature = "telemetry")]
            trace!("step took {:?}", started.elapsed());
        }
        Ok(())
    }

    // ── Suspension primitives ───────────────────────────────────────
    //
    // Each primitive takes ownership of the running continuation and
    // returns what the trampoline should do next. Every exit, including
    // the failing ones, wakes the dispatcher so a blocking select
    // re-evaluates the queues — except `wait`'s slow path, which by
    // contract has nothing new to schedule.

    /// Requeue `c` behind everything currently runnable.
    pub fn yield_now(&mut self, c: Cont) -> Result<Next> {
        self.ready.push_back(c);
        self.wake_up();
        Ok(None)
    }

    /// Resume `c` after `interval`. Rejects intervals under a
    /// millisecond.
    pub fn sleep(&mut self, c: Cont, interval: Duration) -> Result<Next> {
        let result = self.sleep_inner(c, interval);
        self.wake_up();
        result
    }

    /// Millisecond convenience over [`sleep`](Self::sleep).
    pub fn sleep_ms(&mut self, c: Cont, millis: u64) -> Result<Next> {
        self.sleep(c, Duration::from_millis(millis))
    }

    /// Fractional-second convenience over [`sleep`](Self::sleep);
    /// truncates to whole milliseconds.
    pub fn sleep_secs(&mut self, c: Cont, secs: f64) -> Result<Next> {
        self.sleep(c, Duration::from_millis((secs * 1000.0) as u64))
    }

    fn sleep_inner(&mut self, c: Cont, interval: Duration) -> Result<Next> {
        if interval < Duration::from_millis(1) {
            return Err(Error::InvalidArgument(
                "sleep interval must be at least one millisecond",
            ));
        }
        let id = self.next_id()?;
        let token = self.io_mut().selector.register_timer(interval, id);
        self.waiting.put(token, id);
        self.suspended.insert(id, c);
        trace!("sleep: id={} token={} interval={:?}", id, token, interval);
        Ok(None)
    }

    /// Resume `c` when `fd` reports readiness for `interest`
    /// (`READ | WRITE`). The registration is one-shot; the caller keeps
    /// ownership of the fd.
    pub fn io(&mut self, c: Cont, fd: RawFd, interest: u8) -> Result<Next> {
        let result = self.io_inner(c, fd, interest);
        self.wake_up();
        result
    }

    fn io_inner(&mut self, c: Cont, fd: RawFd, interest: u8) -> Result<Next> {
        if interest & (READ | WRITE) == 0 {
            return Err(Error::InvalidArgument(
                "io interest set must not be empty",
            ));
        }
        let id = self.next_id()?;
        let token = self.io_mut().selector.register_fd(fd, interest, id)?;
        self.waiting.put(token, id);
        self.suspended.insert(id, c);
        trace!("io: id={} token={} fd={} interest={:02b}", id, token, fd, interest);
        Ok(None)
    }

    /// Park `c` until `sem` is signalled.
    ///
    /// If the signal already arrived, `c` just joins the tail of the
    /// ready queue — behind any yields already enqueued this iteration.
    pub fn wait(&mut self, c: Cont, sem: &Semaphore) -> Result<Next> {
        if sem.is_ready() {
            self.ready.push_back(c);
            self.wake_up();
            return Ok(None);
        }
        let id = self.next_id()?;
        self.suspended.insert(id, c);
        self.blocked.entry(sem.clone()).or_default().push_back(id);
        trace!("wait: id={} sem={}", id, sem.id());
        // Deliberately no wake: nothing is runnable until a signal.
        Ok(None)
    }

    /// Signal `sem` and hand at most one parked waiter to the ready
    /// queue. The caller's step continues inline.
    pub fn signal(&mut self, sem: &Semaphore) -> Result<()> {
        let result = self.signal_inner(sem);
        self.wake_up();
        result
    }

    fn signal_inner(&mut self, sem: &Semaphore) -> Result<()> {
        sem.signal();
        sem.with_ready(|| self.transfer_one(sem)).transpose()?;
        Ok(())
    }

    /// Signal `sem` and release every waiter parked on it, in wait order.
    pub fn signal_all(&mut self, sem: &Semaphore) -> Result<()> {
        let result = self.signal_all_inner(sem);
        self.wake_up();
        result
    }

    fn signal_all_inner(&mut self, sem: &Semaphore) -> Result<()> {
        sem.signal();
        if sem.is_ready() {
            while self.transfer_one(sem)? {}
        }
        Ok(())
    }

    /// Move the longest-parked waiter for `sem` to the ready tail.
    fn transfer_one(&mut self, sem: &Semaphore) -> Result<bool> {
        let Some(queue) = self.blocked.get_mut(sem) else {
            return Ok(false);
        };
        let Some(id) = queue.pop_front() else {
            self.blocked.remove(sem);
            return Ok(false);
        };
        if queue.is_empty() {
            self.blocked.remove(sem);
        }
        let cont = self
            .suspended
            .remove(&id)
            .ok_or(Error::MissingRegistration(id))?;
        self.ready.push_back(cont);
        trace!("signal: released id={} from sem={}", id, sem.id());
        Ok(true)
    }

    /// Duplicate the running continuation. The clone joins the ready
    /// queue; the original keeps running in the trampoline, so both
    /// branches proceed from here.
    pub fn fork(&mut self, c: Cont) -> Result<Next> {
        self.ready.push_back(c.clone());
        self.wake_up();
        Ok(Some(c))
    }

    /// Enqueue an unstarted continuation for the next poll iteration.
    /// The public entry point for new work; usable before `run`.
    pub fn spawn(&mut self, c: Cont) -> Result<()> {
        self.init()?;
        self.ready.push_back(c);
        self.wake_up();
        Ok(())
    }

    /// Finish the running continuation.
    pub fn discard(&mut self, c: Cont) -> Result<Next> {
        drop(c);
        Ok(None)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn io_mut(&mut self) -> &mut IoCore {
        self.io.as_mut().expect("dispatcher not initialized")
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::new()
    }
}
