use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::api::ServiceClient;
use crate::config::MatchmakingConfig;

/// An issued challenge is abandoned after this long without a game start.
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(90);

/// Notifications from the control loop; the matchmaker never reads the
/// event stream itself.
#[derive(Debug, Clone)]
pub enum MatchmakerEvent {
    GameStarted { active: usize },
    GameFinished { active: usize },
    ChallengeDeclined { challenge_id: String },
    ChallengeCanceled { challenge_id: String },
}

#[derive(Debug, Clone)]
struct OutstandingChallenge {
    opponent: String,
    challenge_id: Option<String>,
    issued_at: Instant,
}

enum Step {
    Tick,
    Event(Option<MatchmakerEvent>),
    Shutdown,
}

/// Periodic task that keeps the bot busy: while a worker slot is idle and
/// nothing is outstanding, it challenges one opponent from the configured
/// pool, preferring whoever has been left alone the longest.
pub struct Matchmaker {
    client: Arc<ServiceClient>,
    config: MatchmakingConfig,
    max_games: usize,
    events: mpsc::Receiver<MatchmakerEvent>,
    /// Publishes the opponent currently being challenged, for the
    /// challenge policy's snapshot.
    challenging_tx: watch::Sender<Option<String>>,
    shutdown: watch::Receiver<bool>,
    active_games: usize,
    outstanding: Option<OutstandingChallenge>,
    cooldowns: HashMap<String, Instant>,
    last_challenged: HashMap<String, Instant>,
}

impl Matchmaker {
    pub fn new(
        client: Arc<ServiceClient>,
        config: MatchmakingConfig,
        max_games: usize,
        events: mpsc::Receiver<MatchmakerEvent>,
        challenging_tx: watch::Sender<Option<String>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Matchmaker {
            client,
            config,
            max_games,
            events,
            challenging_tx,
            shutdown,
            active_games: 0,
            outstanding: None,
            cooldowns: HashMap::new(),
            last_challenged: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        loop {
            let step = tokio::select! {
                _ = ticker.tick() => Step::Tick,
                event = self.events.recv() => Step::Event(event),
                _ = self.shutdown.changed() => Step::Shutdown,
            };
            match step {
                Step::Tick => self.poll().await,
                Step::Event(Some(event)) => self.handle_event(event),
                Step::Event(None) => return,
                Step::Shutdown => {
                    if *self.shutdown.borrow() {
                        info!("Matchmaker shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn poll(&mut self) {
        self.expire_outstanding(Instant::now());
        if self.outstanding.is_some()
            || !self.config.enabled
            || self.active_games >= self.max_games
        {
            return;
        }

        let Some(opponent) = self.pick_opponent(Instant::now()) else {
            return;
        };

        let clock = self.config.time_control;
        info!(
            "Challenging {} ({} {}+{})",
            opponent, self.config.variant, clock.initial, clock.increment
        );
        match self
            .client
            .create_challenge(
                &opponent,
                &self.config.variant,
                clock.initial,
                clock.increment,
                self.config.rated,
            )
            .await
        {
            Ok(challenge_id) => {
                self.last_challenged.insert(opponent.clone(), Instant::now());
                let _ = self.challenging_tx.send(Some(opponent.clone()));
                self.outstanding = Some(OutstandingChallenge {
                    opponent,
                    challenge_id,
                    issued_at: Instant::now(),
                });
            }
            Err(e) => {
                warn!("Challenging {} failed: {}", opponent, e);
                self.start_cooldown(&opponent);
            }
        }
    }

    fn handle_event(&mut self, event: MatchmakerEvent) {
        match event {
            MatchmakerEvent::GameStarted { active } => {
                self.active_games = active;
                if let Some(outstanding) = self.outstanding.take() {
                    info!("Challenge to {} turned into a game", outstanding.opponent);
                    let _ = self.challenging_tx.send(None);
                }
            }
            MatchmakerEvent::GameFinished { active } => {
                self.active_games = active;
            }
            MatchmakerEvent::ChallengeDeclined { challenge_id }
            | MatchmakerEvent::ChallengeCanceled { challenge_id } => {
                self.note_resolved(&challenge_id);
            }
        }
    }

    /// A decline or cancel for our outstanding challenge sends the opponent
    /// into cooldown.
    fn note_resolved(&mut self, challenge_id: &str) {
        let ours = match &self.outstanding {
            Some(outstanding) => outstanding
                .challenge_id
                .as_deref()
                .map(|id| id == challenge_id)
                // Without a recorded id, assume a resolution concerns ours.
                .unwrap_or(true),
            None => false,
        };
        if !ours {
            return;
        }
        if let Some(outstanding) = self.outstanding.take() {
            info!("Challenge to {} was declined", outstanding.opponent);
            self.start_cooldown(&outstanding.opponent);
            let _ = self.challenging_tx.send(None);
        }
    }

    fn expire_outstanding(&mut self, now: Instant) {
        let timed_out = matches!(
            &self.outstanding,
            Some(o) if now.duration_since(o.issued_at) >= CHALLENGE_TIMEOUT
        );
        if !timed_out {
            return;
        }
        if let Some(outstanding) = self.outstanding.take() {
            warn!(
                "Challenge to {} got no game within {}s",
                outstanding.opponent,
                CHALLENGE_TIMEOUT.as_secs()
            );
            self.start_cooldown(&outstanding.opponent);
            let _ = self.challenging_tx.send(None);
        }
    }

    fn start_cooldown(&mut self, opponent: &str) {
        self.cooldowns.insert(
            opponent.to_string(),
            Instant::now() + Duration::from_secs(self.config.cooldown_secs),
        );
    }

    /// Recency-penalised uniform draw: opponents off cooldown are ordered
    /// by how long ago we last challenged them, and one is drawn uniformly
    /// from the least-recently-challenged half.
    fn pick_opponent(&self, now: Instant) -> Option<String> {
        let mut pool: Vec<&String> = self
            .config
            .opponents
            .iter()
            .filter(|opponent| {
                self.cooldowns
                    .get(*opponent)
                    .map(|until| *until <= now)
                    .unwrap_or(true)
            })
            .collect();
        if pool.is_empty() {
            return None;
        }

        // Never-challenged opponents sort first.
        pool.sort_by_key(|opponent| self.last_challenged.get(*opponent).copied());
        let half = (pool.len() + 1) / 2;
        pool[..half]
            .choose(&mut rand::thread_rng())
            .map(|opponent| (*opponent).to_string())
    }
}
