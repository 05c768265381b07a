use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    rc::Rc,
};

type Task = Box<dyn FnOnce()>;

/// A handle to a scheduled timer, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

/// A single-threaded run loop handle.
///
/// The session never blocks; everything it defers goes through this handle.
/// Time is virtual: it only moves when the owner calls [`Executor::advance`],
/// which makes timer behavior fully deterministic under test.
#[derive(Clone, Default)]
pub struct Executor {
    inner: Rc<RefCell<Inner>>,
}

#[derive(Default)]
struct Inner {
    now: u64,
    next_token: u64,
    ready: VecDeque<Task>,
    // Keyed by (deadline, token) so ties fire in schedule order.
    timers: BTreeMap<(u64, u64), Task>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current virtual time in milliseconds.
    pub fn now(&self) -> u64 {
        self.inner.borrow().now
    }

    /// Schedule a callback for the next run of the loop.
    pub fn schedule(&self, task: impl FnOnce() + 'static) {
        self.inner.borrow_mut().ready.push_back(Box::new(task));
    }

    /// Schedule a callback to fire once `delay_ms` of virtual time has passed.
    pub fn schedule_delayed(&self, delay_ms: u64, task: impl FnOnce() + 'static) -> TimerHandle {
        let mut inner = self.inner.borrow_mut();

        let token = inner.next_token;
        inner.next_token += 1;

        let deadline = inner.now + delay_ms;
        inner.timers.insert((deadline, token), Box::new(task));

        TimerHandle(token)
    }

    /// Cancel a pending timer. Returns false if it already fired.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut inner = self.inner.borrow_mut();

        let key = inner
            .timers
            .keys()
            .find(|(_, token)| *token == handle.0)
            .copied();

        match key {
            Some(key) => inner.timers.remove(&key).is_some(),
            None => false,
        }
    }

    /// Run until there is no immediate work left, including work scheduled
    /// by the tasks themselves. Timers do not fire unless already due.
    pub fn run_ready(&self) {
        loop {
            let task = {
                let mut inner = self.inner.borrow_mut();

                let due = inner
                    .timers
                    .keys()
                    .next()
                    .copied()
                    .filter(|(deadline, _)| *deadline <= inner.now);

                match due {
                    Some(key) => inner.timers.remove(&key),
                    None => inner.ready.pop_front(),
                }
            };

            // The borrow is released before the task runs so it can reschedule.
            match task {
                Some(task) => task(),
                None => return,
            }
        }
    }

    /// Move virtual time forward and run everything that became due.
    pub fn advance(&self, ms: u64) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.now += ms;
        }

        self.run_ready();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_in_order() {
        let executor = Executor::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let log = log.clone();
            executor.schedule(move || log.borrow_mut().push(i));
        }

        executor.run_ready();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn scheduled_tasks_can_reschedule() {
        let executor = Executor::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        {
            let log = log.clone();
            let executor2 = executor.clone();
            executor.schedule(move || {
                log.borrow_mut().push("outer");
                let log = log.clone();
                executor2.schedule(move || log.borrow_mut().push("inner"));
            });
        }

        executor.run_ready();
        assert_eq!(*log.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn timers_fire_on_advance() {
        let executor = Executor::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        {
            let log = log.clone();
            executor.schedule_delayed(100, move || log.borrow_mut().push(100));
        }
        {
            let log = log.clone();
            executor.schedule_delayed(50, move || log.borrow_mut().push(50));
        }

        executor.run_ready();
        assert!(log.borrow().is_empty());

        executor.advance(50);
        assert_eq!(*log.borrow(), vec![50]);

        executor.advance(50);
        assert_eq!(*log.borrow(), vec![50, 100]);
    }

    #[test]
    fn cancelled_timers_do_not_fire() {
        let executor = Executor::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let handle = {
            let log = log.clone();
            executor.schedule_delayed(10, move || log.borrow_mut().push(()))
        };

        assert!(executor.cancel(handle));
        assert!(!executor.cancel(handle));

        executor.advance(20);
        assert!(log.borrow().is_empty());
    }
}
