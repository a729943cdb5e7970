//! Labels: points where a process handles pending events and runs jobs.

use std::time::{Duration, Instant};

use super::fault::FaultKind;
use super::DistProcess;
use crate::config::{Handling, Unmatched};
use crate::error::{ProcessError, ProcessResult};

/// Exit code of a process crashed by fault injection.
pub const CRASH_EXIT_CODE: i32 = 10;

impl DistProcess {
    /// Handles pending events without blocking and runs jobs allowed at the label.
    pub fn label(&mut self, name: &str) -> ProcessResult<()> {
        self.label_with(name, false, None)
    }

    /// Same as [`DistProcess::label`], optionally blocking for events.
    ///
    /// `timeout` arms the label timer on first use. Once it runs out the
    /// timer is disarmed and [`DistProcess::timer_expired`] becomes true.
    pub fn label_with(&mut self, name: &str, block: bool, timeout: Option<Duration>) -> ProcessResult<()> {
        if self.faults.fails(FaultKind::Hang) {
            log::warn!("{}: hanged at {}", self.id, name);
            self.hanged()?;
        }
        if self.faults.fails(FaultKind::Crash) {
            log::error!("{}: crashed at {}", self.id, name);
            return Err(ProcessError::Exit(CRASH_EXIT_CODE));
        }

        // Queued jobs are runnable now, so do not wait for more events.
        let block = block && self.jobq.is_empty();
        let handled = match self.config.handling {
            Handling::One => self.label_one(block, timeout)?,
            Handling::All => self.label_all(block, timeout)?,
        };
        if handled {
            self.process_jobqueue(name)?;
        }
        Ok(())
    }

    /// Whether the last label timeout ran out.
    pub fn timer_expired(&self) -> bool {
        self.timer_expired
    }

    /// Time left on the label timer, `None` once it runs out.
    fn time_left(&mut self, timeout: Option<Duration>) -> Option<Option<Duration>> {
        let Some(timeout) = timeout else {
            return Some(None);
        };
        let started = *self.timer.get_or_insert_with(Instant::now);
        let left = timeout.saturating_sub(started.elapsed());
        if left.is_zero() {
            self.timer = None;
            self.timer_expired = true;
            return None;
        }
        Some(Some(left))
    }

    fn label_one(&mut self, block: bool, timeout: Option<Duration>) -> ProcessResult<bool> {
        let Some(left) = self.time_left(timeout) else {
            return Ok(false);
        };
        self.process_event(block, left)?;
        Ok(true)
    }

    fn label_all(&mut self, block: bool, timeout: Option<Duration>) -> ProcessResult<bool> {
        let pending = self.mailbox.len();
        let limit = if block { pending.max(1) } else { pending };
        for _ in 0..limit {
            let Some(left) = self.time_left(timeout) else {
                return Ok(false);
            };
            if !self.process_event(block, left)? {
                break;
            }
        }
        Ok(true)
    }

    /// Runs queued jobs whose handler is allowed at the label.
    fn process_jobqueue(&mut self, label: &str) -> ProcessResult<()> {
        let mut leftovers = Vec::new();
        while let Some(job) = self.jobq.pop_front() {
            if !job.handler.permits(label) {
                leftovers.push(job);
                continue;
            }
            let func = job.handler.func();
            match func(self, &job.bindings) {
                Ok(()) if self.config.handling == Handling::One => break,
                Ok(()) => {}
                Err(ProcessError::Failed(e)) => {
                    log::error!("{}: handler {} failed: {}", self.id, job.handler.name(), e);
                }
                Err(e) => {
                    self.restore_leftovers(leftovers);
                    return Err(e);
                }
            }
        }
        self.restore_leftovers(leftovers);
        Ok(())
    }

    fn restore_leftovers(&mut self, leftovers: Vec<super::Job>) {
        if self.config.unmatched == Unmatched::Keep {
            self.jobq.extend(leftovers);
        }
    }

    /// Waits at the label until `pred` holds or the timeout runs out.
    /// Returns the final value of the predicate.
    pub fn wait_until<F>(&mut self, label: &str, timeout: Option<Duration>, pred: F) -> ProcessResult<bool>
    where
        F: Fn(&DistProcess) -> bool,
    {
        self.timer = None;
        self.timer_expired = false;
        loop {
            if pred(self) {
                self.timer = None;
                return Ok(true);
            }
            self.label_with(label, true, timeout)?;
            if self.timer_expired {
                return Ok(pred(self));
            }
        }
    }
}
