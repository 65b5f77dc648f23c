//! Timer and idle-slice scheduling used by periodic finders.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashMap},
    fmt,
    rc::Rc,
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

pub type TimerCallback = Box<dyn FnOnce()>;

pub trait Timers {
    /// Time elapsed on this driver's clock.
    fn now(&self) -> Duration;

    fn set_timeout(&self, delay: Duration, callback: TimerCallback) -> TimerId;

    fn clear_timeout(&self, id: TimerId);

    /// Whether [`Timers::request_idle`] waits for an idle slice. Without idle support the
    /// finder runs directly on the timer fire.
    fn idle_scheduling(&self) -> bool {
        false
    }

    /// Run `callback` in the next idle slice, or after `timeout` at the latest.
    fn request_idle(&self, timeout: Duration, callback: TimerCallback) -> TimerId {
        let _ = timeout;
        self.set_timeout(Duration::ZERO, callback)
    }

    fn cancel_idle(&self, id: TimerId) {
        self.clear_timeout(id)
    }
}

struct ManualState {
    now: Duration,
    next_id: u64,
    pending: BTreeMap<(Duration, u64), TimerCallback>,
    due: HashMap<u64, Duration>,
    idle: bool,
}

/// A virtual clock. Nothing fires until [`ManualTimers::advance`] moves time forward.
#[derive(Clone)]
pub struct ManualTimers {
    state: Rc<RefCell<ManualState>>,
}

impl Default for ManualTimers {
    fn default() -> Self {
        ManualTimers {
            state: Rc::new(RefCell::new(ManualState {
                now: Duration::ZERO,
                next_id: 0,
                pending: BTreeMap::new(),
                due: HashMap::new(),
                idle: false,
            })),
        }
    }
}

impl fmt::Debug for ManualTimers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("ManualTimers")
            .field("now", &state.now)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report idle support. Idle callbacks run at the current instant on the next advance.
    pub fn with_idle_scheduling(self) -> Self {
        self.state.borrow_mut().idle = true;
        self
    }

    pub fn pending(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Move the clock forward by `by`, firing every callback that comes due on the way in
    /// deadline order. Callbacks scheduled while advancing fire too if they come due in time.
    pub fn advance(&self, by: Duration) {
        let target = self.state.borrow().now + by;
        loop {
            let next = {
                let mut state = self.state.borrow_mut();
                let key = match state.pending.keys().next() {
                    Some(key) if key.0 <= target => *key,
                    _ => break,
                };
                state.due.remove(&key.1);
                state.now = state.now.max(key.0);
                state.pending.remove(&key)
            };
            if let Some(callback) = next {
                callback();
            }
        }
        let mut state = self.state.borrow_mut();
        state.now = state.now.max(target);
    }

    /// Fire whatever is due without moving the clock.
    pub fn run_pending(&self) {
        self.advance(Duration::ZERO);
    }
}

impl Timers for ManualTimers {
    fn now(&self) -> Duration {
        self.state.borrow().now
    }

    fn set_timeout(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        let due = state.now + delay;
        state.pending.insert((due, id), callback);
        state.due.insert(id, due);
        TimerId(id)
    }

    fn clear_timeout(&self, id: TimerId) {
        let mut state = self.state.borrow_mut();
        if let Some(due) = state.due.remove(&id.0) {
            state.pending.remove(&(due, id.0));
        }
    }

    fn idle_scheduling(&self) -> bool {
        self.state.borrow().idle
    }
}

/// Timers backed by the tokio runtime. Callbacks are `!Send`, so every timer is a
/// `spawn_local` task: use from inside a [`tokio::task::LocalSet`].
pub struct TokioTimers {
    start: Instant,
    next_id: Cell<u64>,
    tasks: Rc<RefCell<HashMap<u64, JoinHandle<()>>>>,
}

impl Default for TokioTimers {
    fn default() -> Self {
        TokioTimers {
            start: Instant::now(),
            next_id: Cell::new(0),
            tasks: Rc::new(RefCell::new(HashMap::new())),
        }
    }
}

impl fmt::Debug for TokioTimers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioTimers")
            .field("pending", &self.tasks.borrow().len())
            .finish()
    }
}

impl TokioTimers {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Timers for TokioTimers {
    fn now(&self) -> Duration {
        Instant::now().duration_since(self.start)
    }

    fn set_timeout(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let tasks = self.tasks.clone();
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            tasks.borrow_mut().remove(&id);
            callback();
        });
        if !handle.is_finished() {
            self.tasks.borrow_mut().insert(id, handle);
        }
        TimerId(id)
    }

    fn clear_timeout(&self, id: TimerId) {
        if let Some(handle) = self.tasks.borrow_mut().remove(&id.0) {
            handle.abort();
        }
    }
}

impl Drop for TokioTimers {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.borrow_mut().drain() {
            handle.abort();
        }
    }
}
