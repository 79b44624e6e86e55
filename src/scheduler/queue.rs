//! Shared FIFO of pending jobs.

use std::collections::VecDeque;

use tokio::sync::Mutex;

use crate::content::ContentItem;
use crate::job::TestJob;

/// What a worker should do next.
#[derive(Debug)]
pub enum Dispatch {
    /// Run this job.
    Job(TestJob),
    /// Nothing pending, but a job in flight elsewhere may still be requeued.
    Wait,
    /// Nothing pending and nothing in flight.
    Done,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<TestJob>,
    in_flight: usize,
}

/// Pending jobs in dispatch order.
///
/// Workers take from the front. A job returned after an infrastructure error
/// goes back to the front so it is the next one dispatched. Every dispatched
/// job is in flight until it is either [completed](Self::complete) or
/// [requeued](Self::requeue).
#[derive(Debug, Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
}

impl JobQueue {
    /// Creates a queue holding one pending job per item, in order.
    pub fn new(items: impl IntoIterator<Item = ContentItem>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: items.into_iter().map(TestJob::new).collect(),
                in_flight: 0,
            }),
        }
    }

    /// Takes the next job, marking it in flight.
    pub async fn dispatch(&self) -> Dispatch {
        let mut state = self.state.lock().await;
        match state.pending.pop_front() {
            Some(job) => {
                state.in_flight += 1;
                Dispatch::Job(job)
            }
            None if state.in_flight > 0 => Dispatch::Wait,
            None => Dispatch::Done,
        }
    }

    /// Marks a dispatched job as finished.
    pub async fn complete(&self) {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// Returns a dispatched job to the head of the queue.
    pub async fn requeue(&self, job: TestJob) {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        state.pending.push_front(job);
    }

    /// Removes and returns every pending job.
    pub async fn drain(&self) -> Vec<TestJob> {
        self.state.lock().await.pending.drain(..).collect()
    }

    /// Number of pending jobs.
    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Returns `true` if nothing is pending.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }
}
