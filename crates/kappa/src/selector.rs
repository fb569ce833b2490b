//! Selector bridge over the `polling` crate.
//!
//! Wraps the OS readiness primitive (epoll/kqueue) behind the small
//! capability set the dispatcher needs: fd registrations, one-shot and
//! periodic timers, a user-triggerable wake-up event, and a blocking
//! select. Every registered resource — real fd or virtual timer — is
//! interned into a slab, and the slab key is the token the rest of the
//! dispatcher indexes by. Slab keys are small and densely reused, which is
//! what keeps the waiting table a flat vector.
//!
//! Timers carry no fd at all: deadlines live in an ordered set and are
//! folded into the poller's wait timeout, with due timers surfaced as
//! synthetic events.

use std::collections::BTreeSet;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use polling::{Event, Events, PollMode, Poller};
use slab::Slab;

use crate::trace;

// ── Interest flags ──────────────────────────────────────────────────

pub const READ: u8 = 0b01;
pub const WRITE: u8 = 0b10;

// ── Wake-up event ───────────────────────────────────────────────────

/// A user-triggerable readiness source: a nonblocking pipe.
///
/// `trigger` writes a single byte and is idempotent — once the pipe holds
/// any data, further triggers are free to fail with `WouldBlock`. The
/// write is async-signal-safe, so triggering from a signal handler or
/// another thread is sound; everything else about the dispatcher is not.
pub(crate) struct WakeEvent {
    reader: OwnedFd,
    writer: OwnedFd,
}

impl WakeEvent {
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = rustix::pipe::pipe()?;
        rustix::fs::fcntl_setfl(&reader, rustix::fs::OFlags::NONBLOCK)?;
        rustix::fs::fcntl_setfl(&writer, rustix::fs::OFlags::NONBLOCK)?;
        Ok(WakeEvent { reader, writer })
    }

    pub fn trigger(&self) {
        loop {
            match rustix::io::write(&self.writer, &[1u8]) {
                Ok(_) => break,
                Err(e) if e == rustix::io::Errno::INTR => continue,
                // A full pipe already guarantees the next select returns.
                Err(_) => break,
            }
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}

/// Read the pipe dry so a level-triggered registration goes quiet.
fn drain(raw: RawFd) {
    let fd = unsafe { BorrowedFd::borrow_raw(raw) };
    let mut buf = [0u8; 64];
    loop {
        match rustix::io::read(fd, &mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e == rustix::io::Errno::INTR => continue,
            Err(_) => break,
        }
    }
}

// ── Sources ─────────────────────────────────────────────────────────

enum Source {
    /// An OS fd registered one-shot; the dispatcher unregisters it after
    /// the event is consumed.
    Fd { raw: RawFd },
    /// A virtual timer. One-shot unless `period` is set.
    Timer { period: Option<Duration> },
    /// The read end of a wake-up pipe, registered level-triggered.
    Event { raw: RawFd },
}

struct Entry<T> {
    source: Source,
    data: T,
}

/// A readiness delivery: which token fired, with its registration payload.
pub(crate) struct Ready<T> {
    pub token: usize,
    pub data: T,
}

// ── Selector ────────────────────────────────────────────────────────

pub(crate) struct Selector<T> {
    poller: Poller,
    sources: Slab<Entry<T>>,
    deadlines: BTreeSet<(Instant, usize)>,
    events: Events,
}

impl<T: Copy> Selector<T> {
    pub fn new() -> io::Result<Self> {
        Ok(Selector {
            poller: Poller::new()?,
            sources: Slab::new(),
            deadlines: BTreeSet::new(),
            events: Events::new(),
        })
    }

    /// Register an fd for one-shot readiness. `interest` is a non-empty
    /// subset of `READ | WRITE`; the caller keeps ownership of the fd.
    pub fn register_fd(&mut self, fd: RawFd, interest: u8, data: T) -> io::Result<usize> {
        let entry = self.sources.vacant_entry();
        let token = entry.key();
        let ev = Event::new(token, interest & READ != 0, interest & WRITE != 0);
        // The caller must keep the fd open until unregister; same contract
        // as handing a raw fd to epoll itself.
        unsafe {
            self.poller.add(fd, ev)?;
        }
        entry.insert(Entry {
            source: Source::Fd { raw: fd },
            data,
        });
        trace!("register fd={} token={} interest={:02b}", fd, token, interest);
        Ok(token)
    }

    /// Register a one-shot timer due `after` from now.
    pub fn register_timer(&mut self, after: Duration, data: T) -> usize {
        self.insert_timer(after, None, data)
    }

    /// Register a timer that fires every `every`, rearming itself.
    pub fn register_timer_periodic(&mut self, every: Duration, data: T) -> usize {
        self.insert_timer(every, Some(every), data)
    }

    fn insert_timer(&mut self, after: Duration, period: Option<Duration>, data: T) -> usize {
        let deadline = Instant::now() + after;
        let token = self.sources.insert(Entry {
            source: Source::Timer { period },
            data,
        });
        self.deadlines.insert((deadline, token));
        trace!("register timer token={} after={:?} periodic={}", token, after, period.is_some());
        token
    }

    /// Register a wake-up event level-triggered. The pipe is drained on
    /// every delivery, so the registration stays quiet between triggers.
    pub fn register_event(&mut self, wake: &WakeEvent, data: T) -> io::Result<usize> {
        let raw = wake.raw_fd();
        let entry = self.sources.vacant_entry();
        let token = entry.key();
        unsafe {
            self.poller
                .add_with_mode(raw, Event::readable(token), PollMode::Level)?;
        }
        entry.insert(Entry {
            source: Source::Event { raw },
            data,
        });
        trace!("register event fd={} token={}", raw, token);
        Ok(token)
    }

    /// Remove a registration. Unknown tokens are ignored; fds may already
    /// be closed by their owner, so poller deletion errors are too.
    pub fn unregister(&mut self, token: usize) -> io::Result<()> {
        if !self.sources.contains(token) {
            return Ok(());
        }
        let entry = self.sources.remove(token);
        match entry.source {
            Source::Fd { raw } | Source::Event { raw } => {
                let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
                let _ = self.poller.delete(&borrowed);
            }
            Source::Timer { .. } => {
                self.deadlines.retain(|&(_, t)| t != token);
            }
        }
        trace!("unregister token={}", token);
        Ok(())
    }

    /// Block until at least one source is ready, or `timeout` lapses.
    ///
    /// `None` blocks indefinitely — indefinitely meaning until an fd
    /// event, a due timer, or a wake-up trigger. Due timers are delivered
    /// together with whatever fd readiness is available at that instant.
    pub fn select(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Ready<T>>> {
        let limit = timeout.map(|t| Instant::now() + t);
        loop {
            let mut ready = Vec::new();
            let now = Instant::now();

            // Surface due timers, rearming periodic ones.
            while let Some(&(when, token)) = self.deadlines.first() {
                if when > now {
                    break;
                }
                self.deadlines.pop_first();
                let entry = &self.sources[token];
                if let Source::Timer { period: Some(p) } = entry.source {
                    self.deadlines.insert((when + p, token));
                }
                ready.push(Ready {
                    token,
                    data: entry.data,
                });
            }

            // Fold the next deadline and the caller limit into the OS wait.
            let os_timeout = if !ready.is_empty() {
                Some(Duration::ZERO)
            } else {
                let next = self
                    .deadlines
                    .first()
                    .map(|&(when, _)| when.saturating_duration_since(now));
                let cap = limit.map(|l| l.saturating_duration_since(now));
                match (next, cap) {
                    (None, None) => None,
                    (Some(t), None) | (None, Some(t)) => Some(t),
                    (Some(a), Some(b)) => Some(a.min(b)),
                }
            };

            self.events.clear();
            self.poller.wait(&mut self.events, os_timeout)?;
            for ev in self.events.iter() {
                let Some(entry) = self.sources.get(ev.key) else {
                    continue;
                };
                if let Source::Event { raw } = entry.source {
                    drain(raw);
                }
                ready.push(Ready {
                    token: ev.key,
                    data: entry.data,
                });
            }

            if !ready.is_empty() {
                return Ok(ready);
            }
            if let Some(l) = limit {
                if Instant::now() >= l {
                    return Ok(ready);
                }
            }
            // Timer deadline passed during the wait, or a spurious wake;
            // go around and re-collect.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oneshot_timer_fires_once_within_tolerance() {
        let mut sel: Selector<u32> = Selector::new().unwrap();
        let token = sel.register_timer(Duration::from_millis(20), 7);

        let start = Instant::now();
        let ready = sel.select(None).unwrap();
        let elapsed = start.elapsed();

        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].token, token);
        assert_eq!(ready[0].data, 7);
        assert!(elapsed >= Duration::from_millis(20), "fired too early: {:?}", elapsed);
        // Generous bound — CI machines can be slow.
        assert!(elapsed <= Duration::from_millis(500), "fired too late: {:?}", elapsed);

        // One-shot: nothing further within a bounded wait.
        sel.unregister(token).unwrap();
        let again = sel.select(Some(Duration::from_millis(30))).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn periodic_timer_rearms() {
        let mut sel: Selector<u32> = Selector::new().unwrap();
        let token = sel.register_timer_periodic(Duration::from_millis(10), 1);

        for _ in 0..3 {
            let ready = sel.select(None).unwrap();
            assert!(ready.iter().any(|r| r.token == token));
        }
    }

    #[test]
    fn trigger_unblocks_select() {
        let mut sel: Selector<u32> = Selector::new().unwrap();
        let wake = WakeEvent::new().unwrap();
        let token = sel.register_event(&wake, 42).unwrap();

        wake.trigger();
        let ready = sel.select(None).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].token, token);
        assert_eq!(ready[0].data, 42);

        // Drained: a bounded select now times out quietly.
        let again = sel.select(Some(Duration::from_millis(20))).unwrap();
        assert!(again.is_empty());

        // And a fresh trigger is seen again.
        wake.trigger();
        let third = sel.select(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(third.len(), 1);
    }

    #[test]
    fn trigger_is_idempotent_per_delivery() {
        let mut sel: Selector<u32> = Selector::new().unwrap();
        let wake = WakeEvent::new().unwrap();
        sel.register_event(&wake, 0).unwrap();

        wake.trigger();
        wake.trigger();
        wake.trigger();

        let ready = sel.select(None).unwrap();
        assert_eq!(ready.len(), 1, "coalesced triggers deliver once");
        let again = sel.select(Some(Duration::from_millis(20))).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn fd_readiness_reports_registered_payload() {
        let mut sel: Selector<u32> = Selector::new().unwrap();
        // A second pipe stands in for an arbitrary readable fd.
        let pipe = WakeEvent::new().unwrap();
        let token = sel.register_fd(pipe.raw_fd(), READ, 9).unwrap();

        pipe.trigger();
        let ready = sel.select(None).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].token, token);
        assert_eq!(ready[0].data, 9);
        sel.unregister(token).unwrap();
    }

    #[test]
    fn tokens_are_reused_after_unregister() {
        let mut sel: Selector<u32> = Selector::new().unwrap();
        let a = sel.register_timer(Duration::from_secs(60), 0);
        sel.unregister(a).unwrap();
        let b = sel.register_timer(Duration::from_secs(60), 0);
        assert_eq!(a, b, "slab keys stay dense");
        sel.unregister(b).unwrap();
    }
}
