use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use sync_core::{
    ActivityKind, ActivityThrottle, ConversationEvent, EventChannel, Reconciler, SchedulerPhase,
    SchedulerStateMachine, SyncConfig, SyncError, UserRef,
};
use sync_transport::ChatTransport;

use crate::clock::Clock;

/// State shared by the scheduler, outbox and typing tasks of one conversation.
///
/// Lock order is always `machine` before `reconciler`. Neither lock is held
/// across an await point.
pub(crate) struct ConversationShared {
    pub(crate) conversation_id: String,
    pub(crate) config: SyncConfig,
    pub(crate) transport: Arc<dyn ChatTransport>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: EventChannel,
    machine: Mutex<SchedulerStateMachine>,
    reconciler: Mutex<Reconciler>,
    throttle: Mutex<ActivityThrottle>,
    pins_dirty: AtomicBool,
    rounds: AtomicU64,
}

impl fmt::Debug for ConversationShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationShared")
            .field("conversation_id", &self.conversation_id)
            .field("phase", &self.phase())
            .field("pins_dirty", &self.pins_dirty())
            .finish_non_exhaustive()
    }
}

impl ConversationShared {
    pub(crate) fn new(
        conversation_id: String,
        local_user: UserRef,
        config: SyncConfig,
        transport: Arc<dyn ChatTransport>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let reconciler = Reconciler::new(conversation_id.clone(), local_user, &config);
        let events = EventChannel::new(config.event_buffer);
        let throttle = ActivityThrottle::new(config.typing_throttle_ms);
        Arc::new(Self {
            conversation_id,
            config,
            transport,
            clock,
            events,
            machine: Mutex::new(SchedulerStateMachine::default()),
            reconciler: Mutex::new(reconciler),
            throttle: Mutex::new(throttle),
            pins_dirty: AtomicBool::new(false),
            rounds: AtomicU64::new(0),
        })
    }

    pub(crate) fn with_machine<R>(
        &self,
        f: impl FnOnce(&mut SchedulerStateMachine) -> R,
    ) -> Result<R, SyncError> {
        let mut machine = self
            .machine
            .lock()
            .map_err(|_| SyncError::internal("poisoned scheduler lock"))?;
        Ok(f(&mut machine))
    }

    pub(crate) fn with_reconciler<R>(
        &self,
        f: impl FnOnce(&mut Reconciler) -> R,
    ) -> Result<R, SyncError> {
        let mut reconciler = self
            .reconciler
            .lock()
            .map_err(|_| SyncError::internal("poisoned conversation lock"))?;
        Ok(f(&mut reconciler))
    }

    /// Run `f` against the reconciler only while `generation` is the live run.
    ///
    /// Returns `Ok(None)` for a stale generation.
    pub(crate) fn with_current<R>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut Reconciler) -> R,
    ) -> Result<Option<R>, SyncError> {
        let machine = self
            .machine
            .lock()
            .map_err(|_| SyncError::internal("poisoned scheduler lock"))?;
        if !machine.is_current(generation) {
            return Ok(None);
        }
        let mut reconciler = self
            .reconciler
            .lock()
            .map_err(|_| SyncError::internal("poisoned conversation lock"))?;
        Ok(Some(f(&mut reconciler)))
    }

    /// Run `f` with both locks held, passing the live generation.
    ///
    /// Fails with an invalid-state error while stopped. A concurrent `stop`
    /// cannot land between the generation check and `f`.
    pub(crate) fn with_running<R>(
        &self,
        action: &str,
        f: impl FnOnce(u64, &mut Reconciler) -> Result<R, SyncError>,
    ) -> Result<R, SyncError> {
        let machine = self
            .machine
            .lock()
            .map_err(|_| SyncError::internal("poisoned scheduler lock"))?;
        let generation = machine.require_running(action)?;
        let mut reconciler = self
            .reconciler
            .lock()
            .map_err(|_| SyncError::internal("poisoned conversation lock"))?;
        f(generation, &mut reconciler)
    }

    /// Claim the outgoing activity slot for `kind`. Shared by typing and media sends.
    pub(crate) fn claim_activity(&self, kind: ActivityKind, now_ms: u64) -> Result<bool, SyncError> {
        Ok(self
            .throttle
            .lock()
            .map_err(|_| SyncError::internal("poisoned throttle lock"))?
            .should_publish(kind, now_ms))
    }

    pub(crate) fn reset_activity(&self) -> Result<(), SyncError> {
        self.throttle
            .lock()
            .map_err(|_| SyncError::internal("poisoned throttle lock"))?
            .reset();
        Ok(())
    }

    pub(crate) fn phase(&self) -> SchedulerPhase {
        self.with_machine(|machine| machine.phase())
            .unwrap_or(SchedulerPhase::Stopped)
    }

    pub(crate) fn mark_pins_dirty(&self) {
        self.pins_dirty.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_pins_dirty(&self) -> bool {
        self.pins_dirty.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn pins_dirty(&self) -> bool {
        self.pins_dirty.load(Ordering::SeqCst)
    }

    /// Count a started fetch round. Returns its 1-based number.
    pub(crate) fn next_round(&self) -> u64 {
        self.rounds.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn emit(&self, event: ConversationEvent) {
        self.events.emit(event);
    }

    pub(crate) fn emit_phase(&self, phase: SchedulerPhase) {
        self.emit(ConversationEvent::PhaseChanged {
            conversation_id: self.conversation_id.clone(),
            phase,
        });
    }
}
