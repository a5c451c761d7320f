use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::errors::ApiError;
use crate::api::ServiceClient;
use crate::config::Config;
use crate::models::{AccountEvent, Account, Challenge};
use crate::services::archive_service::GameRecord;
use crate::services::challenge_service::{ChallengePolicy, PolicyDecision, PolicySnapshot};
use crate::workers::game_worker::GameWorker;
use crate::workers::matchmaker::MatchmakerEvent;

/// Deferred challenges beyond this are dropped from the head of the queue.
const PENDING_CAP: usize = 20;
/// Pause between reconnect rounds once the client's own retries are spent.
const RECONNECT_PAUSE: Duration = Duration::from_secs(60);

#[derive(Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    Duplicate,
    Full,
}

enum Step {
    Frame(Result<Option<AccountEvent>, ApiError>),
    Shutdown,
}

/// The active-worker map. Spawning is keyed by game id, so redelivered
/// `gameStart` frames after a reconnect never double-start a worker.
pub struct WorkerSlots {
    cap: usize,
    active: HashMap<String, Option<JoinHandle<()>>>,
}

impl WorkerSlots {
    pub fn new(cap: usize) -> Self {
        WorkerSlots {
            cap,
            active: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn has_free_slot(&self) -> bool {
        self.active.len() < self.cap
    }

    pub fn try_claim(&mut self, game_id: &str) -> ClaimOutcome {
        if self.active.contains_key(game_id) {
            return ClaimOutcome::Duplicate;
        }
        if self.active.len() >= self.cap {
            return ClaimOutcome::Full;
        }
        self.active.insert(game_id.to_string(), None);
        ClaimOutcome::Claimed
    }

    pub fn attach(&mut self, game_id: &str, handle: JoinHandle<()>) {
        if let Some(slot) = self.active.get_mut(game_id) {
            *slot = Some(handle);
        }
    }

    pub fn release(&mut self, game_id: &str) -> bool {
        self.active.remove(game_id).is_some()
    }

    pub fn drain_handles(&mut self) -> Vec<JoinHandle<()>> {
        self.active
            .drain()
            .filter_map(|(_, handle)| handle)
            .collect()
    }
}

/// Consumes the account-wide event stream and fans out: challenges to the
/// policy, game starts to fresh workers, finish events to the slot map and
/// the matchmaker.
pub struct ControlLoop {
    client: Arc<ServiceClient>,
    config: Arc<Config>,
    account: Account,
    policy: ChallengePolicy,
    slots: WorkerSlots,
    pending: VecDeque<Challenge>,
    archive_tx: mpsc::UnboundedSender<GameRecord>,
    matchmaker_tx: mpsc::Sender<MatchmakerEvent>,
    challenging_rx: watch::Receiver<Option<String>>,
    shutdown: watch::Receiver<bool>,
}

impl ControlLoop {
    pub fn new(
        client: Arc<ServiceClient>,
        config: Arc<Config>,
        account: Account,
        archive_tx: mpsc::UnboundedSender<GameRecord>,
        matchmaker_tx: mpsc::Sender<MatchmakerEvent>,
        challenging_rx: watch::Receiver<Option<String>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let policy = ChallengePolicy::new(config.challenge.clone(), config.max_games);
        let slots = WorkerSlots::new(config.max_games);
        ControlLoop {
            client,
            config,
            account,
            policy,
            slots,
            pending: VecDeque::new(),
            archive_tx,
            matchmaker_tx,
            challenging_rx,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            if self.is_shutting_down() {
                break;
            }

            let mut stream = match self.client.open_event_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Opening the event stream failed: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_PAUSE) => {},
                        _ = self.shutdown.changed() => {},
                    }
                    continue;
                }
            };
            info!("Event stream open");

            loop {
                // Decide first, act after: the select only produces a step,
                // so its borrows are released before any handler runs.
                let step = tokio::select! {
                    frame = stream.next_event::<AccountEvent>() => Step::Frame(frame),
                    _ = self.shutdown.changed() => Step::Shutdown,
                };

                match step {
                    Step::Frame(Ok(Some(event))) => self.handle_event(event).await,
                    Step::Frame(Ok(None)) => {
                        warn!("Event stream ended, reconnecting");
                        break;
                    }
                    Step::Frame(Err(ApiError::Protocol(msg))) => {
                        // One bad frame is no reason to drop the stream.
                        warn!("Skipping undecodable event frame: {}", msg);
                    }
                    Step::Frame(Err(e)) => {
                        warn!("Event stream failed ({}), reconnecting", e);
                        break;
                    }
                    Step::Shutdown => {}
                }
                if self.is_shutting_down() {
                    break;
                }
            }

            stream.close();
        }

        self.drain().await;
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn handle_event(&mut self, event: AccountEvent) {
        match event {
            AccountEvent::Challenge { challenge } => self.handle_challenge(challenge).await,
            AccountEvent::GameStart { game } => self.handle_game_start(&game.id).await,
            AccountEvent::GameFinish { game } => self.handle_game_finish(&game.id).await,
            AccountEvent::ChallengeDeclined { challenge } => {
                let _ = self
                    .matchmaker_tx
                    .send(MatchmakerEvent::ChallengeDeclined {
                        challenge_id: challenge.id,
                    })
                    .await;
            }
            AccountEvent::ChallengeCanceled { challenge } => {
                let _ = self
                    .matchmaker_tx
                    .send(MatchmakerEvent::ChallengeCanceled {
                        challenge_id: challenge.id,
                    })
                    .await;
            }
        }
    }

    async fn handle_challenge(&mut self, challenge: Challenge) {
        // Our own outbound challenges come back on the stream too.
        if challenge
            .challenger
            .name
            .eq_ignore_ascii_case(&self.account.username)
        {
            return;
        }

        let snapshot = self.snapshot();
        match self.policy.evaluate(&challenge, &snapshot) {
            PolicyDecision::Accept => {
                info!(
                    "Accepting challenge {} from {} ({} {})",
                    challenge.id,
                    challenge.challenger.name,
                    challenge.variant,
                    challenge.time_control.show()
                );
                if let Err(e) = self.client.accept_challenge(&challenge.id).await {
                    warn!("Accepting challenge {} failed: {}", challenge.id, e);
                }
            }
            PolicyDecision::Decline(reason) => {
                info!(
                    "Declining challenge {} from {}: {}",
                    challenge.id,
                    challenge.challenger.name,
                    reason.as_str()
                );
                if let Err(e) = self
                    .client
                    .decline_challenge(&challenge.id, reason.as_str())
                    .await
                {
                    warn!("Declining challenge {} failed: {}", challenge.id, e);
                }
            }
            PolicyDecision::Defer => {
                info!(
                    "Deferring challenge {} from {} until a slot frees up",
                    challenge.id, challenge.challenger.name
                );
                push_pending(&mut self.pending, challenge, PENDING_CAP);
            }
        }
    }

    async fn handle_game_start(&mut self, game_id: &str) {
        if self.is_shutting_down() {
            info!("Shutting down, aborting incoming game {}", game_id);
            let _ = self.client.abort_game(game_id).await;
            return;
        }

        match self.slots.try_claim(game_id) {
            ClaimOutcome::Duplicate => {
                info!("Worker for game {} already running", game_id);
            }
            ClaimOutcome::Full => {
                warn!("No free worker slot for game {}, aborting it", game_id);
                if let Err(e) = self.client.abort_game(game_id).await {
                    warn!("Aborting game {} failed: {}", game_id, e);
                }
            }
            ClaimOutcome::Claimed => {
                info!(
                    "Starting worker for game {} ({}/{} slots)",
                    game_id,
                    self.slots.len(),
                    self.config.max_games
                );
                let handle = GameWorker::spawn(
                    self.client.clone(),
                    self.config.clone(),
                    self.account.clone(),
                    game_id.to_string(),
                    self.archive_tx.clone(),
                    self.shutdown.clone(),
                );
                self.slots.attach(game_id, handle);
                let _ = self
                    .matchmaker_tx
                    .send(MatchmakerEvent::GameStarted {
                        active: self.slots.len(),
                    })
                    .await;
            }
        }
    }

    async fn handle_game_finish(&mut self, game_id: &str) {
        if self.slots.release(game_id) {
            info!(
                "Game {} finished ({}/{} slots)",
                game_id,
                self.slots.len(),
                self.config.max_games
            );
        }
        let _ = self
            .matchmaker_tx
            .send(MatchmakerEvent::GameFinished {
                active: self.slots.len(),
            })
            .await;
        self.revisit_pending().await;
    }

    /// A slot freed up: give deferred challenges another pass through the
    /// policy.
    async fn revisit_pending(&mut self) {
        while self.slots.has_free_slot() {
            let Some(challenge) = self.pending.pop_front() else {
                return;
            };
            self.handle_challenge(challenge).await;
        }
    }

    fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            active_games: self.slots.len(),
            challenging_user: self.challenging_rx.borrow().clone(),
        }
    }

    /// Graceful shutdown: no new games are accepted (handled above), and
    /// running workers get the drain interval to resign and flush their
    /// archive records.
    async fn drain(&mut self) {
        let handles = self.slots.drain_handles();
        if handles.is_empty() {
            return;
        }
        info!(
            "Draining {} worker(s) for up to {}s",
            handles.len(),
            self.config.shutdown_drain_secs
        );
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.shutdown_drain_secs);
        for handle in handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("Worker did not finish inside the drain interval");
            }
        }
    }
}

fn push_pending(pending: &mut VecDeque<Challenge>, challenge: Challenge, cap: usize) {
    if pending.len() >= cap {
        if let Some(dropped) = pending.pop_front() {
            warn!("Pending queue full, dropping challenge {}", dropped.id);
        }
    }
    pending.push_back(challenge);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slots_enforce_the_cap() {
        let mut slots = WorkerSlots::new(2);
        assert_eq!(slots.try_claim("G1"), ClaimOutcome::Claimed);
        assert_eq!(slots.try_claim("G2"), ClaimOutcome::Claimed);
        assert_eq!(slots.try_claim("G3"), ClaimOutcome::Full);
        assert_eq!(slots.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_game_ids_claim_once() {
        let mut slots = WorkerSlots::new(2);
        assert_eq!(slots.try_claim("G1"), ClaimOutcome::Claimed);
        assert_eq!(slots.try_claim("G1"), ClaimOutcome::Duplicate);
        assert_eq!(slots.len(), 1);
    }

    #[tokio::test]
    async fn test_release_frees_the_slot() {
        let mut slots = WorkerSlots::new(1);
        assert_eq!(slots.try_claim("G1"), ClaimOutcome::Claimed);
        assert_eq!(slots.try_claim("G2"), ClaimOutcome::Full);

        assert!(slots.release("G1"));
        assert!(!slots.release("G1"));
        assert_eq!(slots.try_claim("G2"), ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn test_attached_handles_are_drained() {
        let mut slots = WorkerSlots::new(2);
        slots.try_claim("G1");
        slots.attach("G1", tokio::spawn(async {}));
        slots.try_claim("G2");

        let handles = slots.drain_handles();
        assert_eq!(handles.len(), 1);
        assert_eq!(slots.len(), 0);
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn test_pending_queue_drops_from_the_head() {
        fn challenge(id: &str) -> Challenge {
            serde_json::from_value(serde_json::json!({
                "id": id,
                "timeControl": {"initial": 180, "increment": 2},
                "challenger": {"name": "B1"}
            }))
            .unwrap()
        }

        let mut pending = VecDeque::new();
        for i in 0..4 {
            push_pending(&mut pending, challenge(&format!("C{}", i)), 3);
        }

        assert_eq!(pending.len(), 3);
        let ids: Vec<&str> = pending.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["C1", "C2", "C3"]);
    }
}
