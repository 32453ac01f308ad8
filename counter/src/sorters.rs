//! Sorting-thread allocation across concurrently processed bins.
//!
//! Bins arrive largest first. Each gets a thread share proportional to its
//! memory footprint, so a handful of huge bins take the whole machine while
//! many small bins sort one per thread. `get_next` blocks until both a job
//! and its thread share are available; jobs are handed out in arrival order.

use crate::queues::BinJob;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct ManagerState {
    jobs: VecDeque<(BinJob, usize)>,
    free_threads: usize,
    queue_done: bool,
}

pub struct SortersManager {
    state: Mutex<ManagerState>,
    changed: Condvar,
    total_threads: usize,
    max_mem: u64,
}

impl SortersManager {
    pub fn new(total_threads: usize, max_mem: u64) -> SortersManager {
        SortersManager {
            state: Mutex::new(ManagerState {
                jobs: VecDeque::new(),
                free_threads: total_threads,
                queue_done: false,
            }),
            changed: Condvar::new(),
            total_threads,
            max_mem: max_mem.max(1),
        }
    }

    fn thread_share(&self, req_size: u64) -> usize {
        let per_thread = (self.max_mem / self.total_threads as u64).max(1);
        ((req_size / per_thread) as usize + 1).clamp(1, self.total_threads)
    }

    pub fn push_job(&self, job: BinJob, req_size: u64) {
        let share = self.thread_share(req_size);
        let mut state = self.state.lock().unwrap();
        state.jobs.push_back((job, share));
        self.changed.notify_all();
    }

    pub fn notify_queue_completed(&self) {
        let mut state = self.state.lock().unwrap();
        state.queue_done = true;
        self.changed.notify_all();
    }

    /// Next bin with its assigned thread count; `None` when drained.
    pub fn get_next(&self) -> Option<(BinJob, usize)> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(&(_, share)) = state.jobs.front() {
                if share <= state.free_threads {
                    let (job, share) = state.jobs.pop_front().expect("front exists");
                    state.free_threads -= share;
                    return Some((job, share));
                }
            } else if state.queue_done {
                return None;
            }
            state = self.changed.wait(state).unwrap();
        }
    }

    pub fn return_threads(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        state.free_threads += n;
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(bin_id: u32) -> BinJob {
        BinJob {
            bin_id,
            data: None,
            size: 0,
            n_rec: 0,
            n_plus_x_recs: 0,
        }
    }

    #[test]
    fn thread_share_scales_with_size_test() {
        let m = SortersManager::new(8, 8 << 30);
        assert_eq!(m.thread_share(1 << 20), 1);
        assert_eq!(m.thread_share(4 << 30), 5);
        assert_eq!(m.thread_share(100 << 30), 8);
    }

    #[test]
    fn jobs_in_order_and_threads_returned_test() {
        let m = SortersManager::new(4, 1 << 30);
        m.push_job(job(0), 1 << 30); // wants all 4
        m.push_job(job(1), 1);
        m.notify_queue_completed();
        let (j0, t0) = m.get_next().unwrap();
        assert_eq!(j0.bin_id, 0);
        assert_eq!(t0, 4);
        // big job holds every thread; the next pop must wait for the return
        std::thread::scope(|scope| {
            let handle = scope.spawn(|| m.get_next().map(|(j, t)| (j.bin_id, t)));
            std::thread::sleep(std::time::Duration::from_millis(20));
            m.return_threads(t0);
            assert_eq!(handle.join().unwrap(), Some((1, 1)));
        });
        assert!(m.get_next().is_none());
    }
}
