//! Periodic and triggered fetch rounds for one conversation.
//!
//! At most one round is in flight per conversation. Ticks and triggers that
//! arrive while a round is running are dropped, not queued, but every one of them
//! still expires stale typing indicators.

use std::{sync::Arc, time::Duration};

use sync_core::{
    ConversationEvent, FetchDisposition, PinnedMessage, RawMessage, Reconciler, RemoteActivity,
    SchedulerPhase, SyncError, TriggerReason,
};
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::shared::ConversationShared;

#[derive(Debug)]
struct RunningSyncTask {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Timer-driven fetch loop with a generation counter.
#[derive(Debug)]
pub struct SyncScheduler {
    shared: Arc<ConversationShared>,
    sync_task: Mutex<Option<RunningSyncTask>>,
}

impl SyncScheduler {
    pub(crate) fn new(shared: Arc<ConversationShared>) -> Self {
        Self {
            shared,
            sync_task: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.shared.phase()
    }

    /// `Stopped -> Idle` and spawn the periodic loop. The first round starts
    /// right away and includes the pinned list.
    pub async fn start(&self) -> Result<(), SyncError> {
        let mut guard = self.sync_task.lock().await;
        let generation = self.shared.with_machine(|machine| machine.start())??;
        self.shared.mark_pins_dirty();
        self.shared.emit_phase(self.shared.phase());
        debug!(
            conversation_id = %self.shared.conversation_id,
            generation,
            "sync scheduler started"
        );

        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let shared = Arc::clone(&self.shared);
        let period = Duration::from_millis(shared.config.poll_interval_ms.max(1));
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_child.cancelled() => break,
                    _ = interval.tick() => {
                        tick(&shared, TriggerReason::Periodic);
                    }
                }
            }
            trace!(conversation_id = %shared.conversation_id, generation, "sync loop exited");
        });

        *guard = Some(RunningSyncTask { stop, task });
        Ok(())
    }

    /// Cancel the timer. A fetch still in flight completes and is discarded.
    ///
    /// Sends still in flight are marked failed; their late results are stale.
    /// The activity throttle is cleared so a restart announces again at once.
    pub async fn stop(&self) -> Result<(), SyncError> {
        let mut guard = self.sync_task.lock().await;
        let generation = self.shared.with_machine(|machine| machine.stop())??;
        let abandoned = self
            .shared
            .with_reconciler(|reconciler| reconciler.abandon_in_flight_sends())?;
        self.shared.reset_activity()?;
        for client_temp_id in &abandoned {
            self.shared.emit(ConversationEvent::SendFailed {
                conversation_id: self.shared.conversation_id.clone(),
                client_temp_id: client_temp_id.clone(),
                code: "send_abandoned".to_owned(),
            });
        }
        if !abandoned.is_empty() {
            self.shared.emit(ConversationEvent::MessagesChanged {
                conversation_id: self.shared.conversation_id.clone(),
                introduced_new: false,
            });
        }
        self.shared.emit_phase(SchedulerPhase::Stopped);
        debug!(
            conversation_id = %self.shared.conversation_id,
            generation,
            "sync scheduler stopped"
        );

        if let Some(running) = guard.take() {
            running.stop.cancel();
            let _ = running.task.await;
        }
        Ok(())
    }

    /// Run a round now unless one is already in flight.
    ///
    /// Returns `false` when the request was dropped.
    pub fn trigger_immediate(&self, reason: TriggerReason) -> bool {
        tick(&self.shared, reason)
    }
}

/// One scheduler tick: prune typing, then start a round if the slot is free.
pub(crate) fn tick(shared: &Arc<ConversationShared>, reason: TriggerReason) -> bool {
    let now_ms = shared.clock.now_ms();
    match shared.with_reconciler(|reconciler| reconciler.prune_typing(now_ms)) {
        Ok(0) => {}
        Ok(expired) => {
            trace!(conversation_id = %shared.conversation_id, expired, "typing expired");
            shared.emit(ConversationEvent::TypingChanged {
                conversation_id: shared.conversation_id.clone(),
            });
        }
        Err(err) => warn!(conversation_id = %shared.conversation_id, error = %err, "typing prune skipped"),
    }

    let generation = match shared.with_machine(|machine| machine.try_begin_fetch()) {
        Ok(Some(generation)) => generation,
        Ok(None) => {
            trace!(conversation_id = %shared.conversation_id, ?reason, "tick dropped");
            return false;
        }
        Err(err) => {
            warn!(conversation_id = %shared.conversation_id, error = %err, "tick skipped");
            return false;
        }
    };

    let round = shared.next_round();
    let cadence = u64::from(shared.config.pin_refresh_rounds);
    let include_pins = shared.take_pins_dirty() || (cadence > 0 && round % cadence == 0);
    let overlap = shared.config.refetch_overlap;
    let since_id = shared
        .with_reconciler(|reconciler| {
            reconciler.set_in_flight(true);
            reconciler.state().sync_cursor(overlap)
        })
        .unwrap_or_else(|err| {
            warn!(conversation_id = %shared.conversation_id, error = %err, "fetching without cursor");
            None
        });

    debug!(
        conversation_id = %shared.conversation_id,
        generation,
        round,
        ?reason,
        ?since_id,
        include_pins,
        "fetch round started"
    );
    shared.emit_phase(SchedulerPhase::Fetching);
    tokio::spawn(run_fetch(
        Arc::clone(shared),
        generation,
        since_id,
        include_pins,
    ));
    true
}

struct FetchRound {
    messages: Vec<RawMessage>,
    typing: Vec<RemoteActivity>,
    pins: Option<Vec<PinnedMessage>>,
}

enum RoundOutcome {
    Applied(Vec<ConversationEvent>),
    Failed(SyncError),
    Discarded,
}

async fn fetch_round(
    shared: &ConversationShared,
    since_id: Option<u64>,
    include_pins: bool,
) -> Result<FetchRound, SyncError> {
    let transport = &shared.transport;
    let conversation_id = shared.conversation_id.as_str();
    let budget = Duration::from_millis(shared.config.request_timeout_ms);

    let pins = async {
        if include_pins {
            transport.fetch_pins(conversation_id).await.map(Some)
        } else {
            Ok(None)
        }
    };
    let work = async {
        let (messages, typing, pins) = tokio::try_join!(
            transport.fetch_messages(conversation_id, since_id),
            transport.fetch_typing(conversation_id),
            pins,
        )?;
        Ok::<_, SyncError>(FetchRound {
            messages,
            typing,
            pins,
        })
    };

    tokio::time::timeout(budget, work)
        .await
        .map_err(|_| SyncError::timeout("fetch round", budget))?
}

async fn run_fetch(
    shared: Arc<ConversationShared>,
    generation: u64,
    since_id: Option<u64>,
    include_pins: bool,
) {
    let result = fetch_round(&shared, since_id, include_pins).await;
    let now_ms = shared.clock.now_ms();

    let landed = shared.with_machine(|machine| {
        let disposition = machine.finish_fetch(generation);
        let outcome = shared.with_reconciler(|reconciler| {
            reconciler.set_in_flight(false);
            match (disposition, result) {
                (FetchDisposition::Discard, _) => RoundOutcome::Discarded,
                (FetchDisposition::Apply, Ok(round)) => {
                    match apply_round(&shared.conversation_id, reconciler, round, now_ms) {
                        Ok(events) => RoundOutcome::Applied(events),
                        Err(err) => {
                            reconciler.record_error(err.clone());
                            RoundOutcome::Failed(err)
                        }
                    }
                }
                (FetchDisposition::Apply, Err(err)) => {
                    reconciler.record_error(err.clone());
                    RoundOutcome::Failed(err)
                }
            }
        });
        (outcome, machine.phase())
    });

    let (outcome, phase) = match landed {
        Ok((Ok(outcome), phase)) => (outcome, phase),
        Ok((Err(err), _)) | Err(err) => {
            warn!(conversation_id = %shared.conversation_id, error = %err, "fetch result lost");
            return;
        }
    };

    match outcome {
        RoundOutcome::Applied(events) => {
            trace!(conversation_id = %shared.conversation_id, generation, "fetch round applied");
            for event in events {
                shared.emit(event);
            }
        }
        RoundOutcome::Failed(err) => {
            if include_pins {
                shared.mark_pins_dirty();
            }
            warn!(
                conversation_id = %shared.conversation_id,
                code = %err.code,
                error = %err,
                "fetch round failed, retrying on next tick"
            );
            shared.emit(ConversationEvent::SyncFailed {
                conversation_id: shared.conversation_id.clone(),
                code: err.code,
                message: err.message,
            });
        }
        RoundOutcome::Discarded => {
            if include_pins {
                shared.mark_pins_dirty();
            }
            debug!(
                conversation_id = %shared.conversation_id,
                generation,
                "discarding fetch result from previous run"
            );
        }
    }

    if phase != SchedulerPhase::Stopped {
        shared.emit_phase(phase);
    }
}

fn apply_round(
    conversation_id: &str,
    reconciler: &mut Reconciler,
    round: FetchRound,
    now_ms: u64,
) -> Result<Vec<ConversationEvent>, SyncError> {
    let mut events = Vec::new();

    let report = reconciler.reconcile(conversation_id, round.messages)?;
    if report.changed() {
        events.push(ConversationEvent::MessagesChanged {
            conversation_id: conversation_id.to_owned(),
            introduced_new: report.introduced_new(),
        });
    }
    if reconciler.apply_typing_snapshot(round.typing, now_ms) {
        events.push(ConversationEvent::TypingChanged {
            conversation_id: conversation_id.to_owned(),
        });
    }
    if let Some(pins) = round.pins
        && reconciler.merge_pins(pins)
    {
        events.push(ConversationEvent::PinsChanged {
            conversation_id: conversation_id.to_owned(),
        });
    }
    reconciler.record_sync(now_ms);
    Ok(events)
}
