//! Jobs scheduled against the audio clock.
//!
//! Nothing here sleeps: the engine asks for the next due frame, renders up to
//! it, then pops and runs whatever is due. Each job carries the guard it must
//! check when it fires.

use crate::cancel::CancellationToken;

#[derive(Debug, Clone)]
pub enum Job {
    /// End of a fade-out-to-stop; runs only if the stop token still matches.
    FinalizeStop { token: u64 },
    /// Countdown timer ran out.
    TimerExpired { cancel: CancellationToken },
    /// Ambience-only lead-in is over; the voice starts.
    PreludeElapsed { cancel: CancellationToken },
    /// Closing fade after the voice ended is over.
    SessionFinished { cancel: CancellationToken },
}

#[derive(Debug)]
struct Scheduled {
    due: u64,
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
pub struct Timeline {
    jobs: Vec<Scheduled>,
    seq: u64,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `job` to run once the clock reaches `due`. Jobs with the same due
    /// frame run in scheduling order.
    pub fn schedule(&mut self, due: u64, job: Job) {
        self.seq += 1;
        let entry = Scheduled {
            due,
            seq: self.seq,
            job,
        };
        let at = self
            .jobs
            .partition_point(|j| (j.due, j.seq) <= (entry.due, entry.seq));
        self.jobs.insert(at, entry);
    }

    pub fn next_due(&self) -> Option<u64> {
        self.jobs.first().map(|j| j.due)
    }

    /// Remove and return every job due at or before `now`, in order.
    pub fn pop_due(&mut self, now: u64) -> Vec<Job> {
        let n = self.jobs.partition_point(|j| j.due <= now);
        self.jobs.drain(..n).map(|j| j.job).collect()
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
