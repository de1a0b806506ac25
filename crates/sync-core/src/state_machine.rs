use crate::{error::SyncError, types::SchedulerPhase};

/// What to do with a fetch result when it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDisposition {
    /// Same run that issued the fetch; merge it.
    Apply,
    /// The scheduler was stopped or restarted meanwhile; drop it.
    Discard,
}

/// Scheduler lifecycle with a generation counter.
///
/// `generation` increases on every start and stop, so results captured under an
/// older generation are recognisably stale. The in-flight slot is independent of
/// the running flag: a restart never opens a second fetch while one from the
/// previous run is still outstanding.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStateMachine {
    running: bool,
    generation: u64,
    in_flight: Option<u64>,
}

impl SchedulerStateMachine {
    pub fn phase(&self) -> SchedulerPhase {
        match (self.running, self.in_flight) {
            (false, _) => SchedulerPhase::Stopped,
            (true, None) => SchedulerPhase::Idle,
            (true, Some(_)) => SchedulerPhase::Fetching,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn has_fetch_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// `Stopped -> Idle`. Returns the generation of the new run.
    pub fn start(&mut self) -> Result<u64, SyncError> {
        if self.running {
            return Err(SyncError::invalid_state(self.phase(), "start"));
        }
        self.running = true;
        self.generation = self.generation.wrapping_add(1);
        Ok(self.generation)
    }

    /// `Idle|Fetching -> Stopped`. An in-flight fetch keeps its slot until it lands.
    pub fn stop(&mut self) -> Result<u64, SyncError> {
        if !self.running {
            return Err(SyncError::invalid_state(self.phase(), "stop"));
        }
        self.running = false;
        self.generation = self.generation.wrapping_add(1);
        Ok(self.generation)
    }

    /// `Idle -> Fetching`. Returns `None` (tick dropped) when stopped or busy.
    pub fn try_begin_fetch(&mut self) -> Option<u64> {
        if !self.running || self.in_flight.is_some() {
            return None;
        }
        self.in_flight = Some(self.generation);
        Some(self.generation)
    }

    /// `Fetching -> Idle`, deciding whether the result still applies.
    pub fn finish_fetch(&mut self, generation: u64) -> FetchDisposition {
        if self.in_flight == Some(generation) {
            self.in_flight = None;
        }
        if self.is_current(generation) {
            FetchDisposition::Apply
        } else {
            FetchDisposition::Discard
        }
    }

    /// Whether an async result captured under `generation` may still be applied.
    pub fn is_current(&self, generation: u64) -> bool {
        self.running && self.generation == generation
    }

    /// Generation of the current run, or a contract error when stopped.
    pub fn require_running(&self, action: &str) -> Result<u64, SyncError> {
        if self.running {
            Ok(self.generation)
        } else {
            Err(SyncError::invalid_state(self.phase(), action))
        }
    }
}
