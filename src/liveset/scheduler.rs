use std::{cell::RefCell, collections::VecDeque, fmt, rc::Rc};

type Job = Box<dyn FnOnce()>;

/// Cooperative job queue shared by every [`super::LiveSet`] of one parser tree.
///
/// Change batches are never delivered from inside the call that produced them. They are queued
/// here and run when the owner calls [`Scheduler::flush`].
///
/// Jobs come in two tiers. Regular jobs propagate changes between sets. Settled jobs only run
/// once no regular job is left, so a set that delivers through them hands its observers the
/// net result of a whole flush in one batch.
#[derive(Clone, Default)]
pub struct Scheduler {
    queue: Rc<RefCell<VecDeque<Job>>>,
    settled: Rc<RefCell<VecDeque<Job>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, job: impl FnOnce() + 'static) {
        self.queue.borrow_mut().push_back(Box::new(job));
    }

    /// Queue `job` behind every regular job, including regular jobs queued later.
    pub fn schedule_settled(&self, job: impl FnOnce() + 'static) {
        self.settled.borrow_mut().push_back(Box::new(job));
    }

    /// Run queued jobs, including jobs queued while flushing, until both tiers are empty.
    pub fn flush(&self) {
        self.run(true);
    }

    /// Run regular jobs until none are left. Settled jobs stay queued for the next flush.
    pub fn propagate(&self) {
        self.run(false);
    }

    fn run(&self, settle: bool) {
        let mut ran = 0usize;
        loop {
            // The borrows must end before the job runs: jobs schedule more jobs.
            let job = self.queue.borrow_mut().pop_front();
            let job = match job {
                Some(job) => Some(job),
                None if settle => self.settled.borrow_mut().pop_front(),
                None => None,
            };
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => break,
            }
        }
        if ran > 0 {
            tracing::trace!("[Scheduler] ran {ran} jobs");
        }
    }

    pub fn is_idle(&self) -> bool {
        self.queue.borrow().is_empty() && self.settled.borrow().is_empty()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.queue.borrow().len())
            .field("settled", &self.settled.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use test_log::test;

    #[test]
    fn flush_runs_nested_jobs_in_order() {
        let scheduler = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let log = log.clone();
            let inner = scheduler.clone();
            scheduler.schedule(move || {
                log.borrow_mut().push(1);
                let log = log.clone();
                inner.schedule(move || log.borrow_mut().push(3));
            });
        }
        {
            let log = log.clone();
            scheduler.schedule(move || log.borrow_mut().push(2));
        }
        assert!(!scheduler.is_idle());
        scheduler.flush();
        assert!(scheduler.is_idle());
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn settled_jobs_wait_for_regular_work() {
        let scheduler = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let log = log.clone();
            scheduler.schedule_settled(move || log.borrow_mut().push("settled"));
        }
        {
            let log = log.clone();
            let inner = scheduler.clone();
            scheduler.schedule(move || {
                log.borrow_mut().push("first");
                let log = log.clone();
                inner.schedule(move || log.borrow_mut().push("second"));
            });
        }
        scheduler.propagate();
        assert_eq!(*log.borrow(), vec!["first", "second"]);
        assert!(!scheduler.is_idle());
        scheduler.flush();
        assert_eq!(*log.borrow(), vec!["first", "second", "settled"]);
        assert!(scheduler.is_idle());
    }
}
