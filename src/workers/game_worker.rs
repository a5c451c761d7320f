use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::errors::ApiError;
use crate::api::stream::NdjsonStream;
use crate::api::ServiceClient;
use crate::config::{Config, DrawConfig};
use crate::engine::errors::EngineError;
use crate::engine::limits::SearchLimits;
use crate::engine::{self, Engine};
use crate::models::event::ChatLine;
use crate::models::{
    Account, Color, GameDescriptor, GameEvent, GameFull, GameState, GameStateFrame,
    MoveListTransition, TimeControl,
};
use crate::services::archive_service::GameRecord;
use crate::services::board_service::BoardService;
use crate::services::chat_service::{ChatContext, ChatService};

/// Consecutive rejected engine moves before the game is given up.
const MAX_BAD_MOVES: u32 = 2;
/// Engine restarts per game; the next death resigns.
const MAX_ENGINE_RESTARTS: u32 = 1;

/// Everything mutable about one game in progress.
struct ActiveGame {
    descriptor: GameDescriptor,
    state: GameState,
    /// Remaining clock after each half-move, for the archive record.
    clocks: Vec<Option<u64>>,
    engine: Box<dyn Engine>,
    chat: ChatService,
    last_score: Option<i32>,
    engine_restarts: u32,
    bad_moves: u32,
    draw_answered: bool,
    takeback_answered: bool,
    /// We accepted a takeback; the next truncation is legitimate.
    takeback_pending: bool,
    /// One reopen attempt per stream incident.
    reopened: bool,
}

enum Step {
    Frame(Result<Option<GameEvent>, ApiError>),
    Shutdown,
}

/// What a frame or a turn means for the worker's main loop.
enum Flow {
    Continue,
    /// Terminal status observed or the game was given up.
    Closed,
    /// The stream and our state disagree; reread the full state.
    Refresh,
}

/// Per-game state machine: Opening (stream + engine setup), Running (frame
/// loop and move cycle), Recovering (one engine restart) and Closing
/// (engine quit + archive record).
pub struct GameWorker {
    client: Arc<ServiceClient>,
    config: Arc<Config>,
    account: Account,
    game_id: String,
    archive_tx: mpsc::UnboundedSender<GameRecord>,
    shutdown: watch::Receiver<bool>,
}

impl GameWorker {
    pub fn spawn(
        client: Arc<ServiceClient>,
        config: Arc<Config>,
        account: Account,
        game_id: String,
        archive_tx: mpsc::UnboundedSender<GameRecord>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let worker = GameWorker {
            client,
            config,
            account,
            game_id,
            archive_tx,
            shutdown,
        };
        tokio::spawn(worker.run())
    }

    async fn run(mut self) {
        info!("Worker for game {} starting", self.game_id);
        match self.play().await {
            Ok(()) => info!("Worker for game {} finished", self.game_id),
            Err(e) => error!(
                "Worker for game {} gave up before the game got going: {} (no archive record)",
                self.game_id, e
            ),
        }
    }

    async fn play(&mut self) -> Result<(), ApiError> {
        // Opening: stream first, then the engine.
        let mut stream = self.client.open_game_stream(&self.game_id).await?;
        let full = match stream.next_event::<GameEvent>().await? {
            Some(GameEvent::GameFull(full)) => full,
            other => {
                return Err(ApiError::Protocol(format!(
                    "expected gameFull as the first frame, got {:?}",
                    other.map(|e| frame_name(&e))
                )))
            }
        };

        let descriptor = derive_descriptor(&self.account.username, &full)?;
        let state = GameState::from_frame(&full.state);
        info!(
            "Game {}: {:?} vs {} ({} {})",
            self.game_id,
            descriptor.our_color,
            descriptor.opponent.name,
            descriptor.variant,
            descriptor.time_control.show()
        );

        let engine = match engine::spawn(&self.config.engine).await {
            Ok(engine) => engine,
            Err(e) => {
                error!("Game {}: engine spawn failed: {}", self.game_id, e);
                self.abandon_before_start(&state).await;
                self.send_record(&descriptor, &state, &[]);
                return Ok(());
            }
        };

        let mut game = ActiveGame {
            clocks: vec![None; state.moves.len()],
            descriptor,
            state,
            engine,
            chat: ChatService::new(self.config.chat.clone()),
            last_score: None,
            engine_restarts: 0,
            bad_moves: 0,
            draw_answered: false,
            takeback_answered: false,
            takeback_pending: false,
            reopened: false,
        };

        let result = self.running(&mut stream, &mut game).await;

        // Closing: engine down, one archive record out, stream closed.
        game.engine.quit().await;
        stream.close();
        self.send_record(&game.descriptor, &game.state, &game.clocks);
        result
    }

    async fn running(
        &mut self,
        stream: &mut NdjsonStream,
        game: &mut ActiveGame,
    ) -> Result<(), ApiError> {
        // The gameFull frame may already put us on move.
        let mut flow = if game.state.is_our_turn(game.descriptor.our_color) {
            self.take_turn(game).await?
        } else {
            Flow::Continue
        };

        loop {
            match flow {
                Flow::Continue => {}
                Flow::Closed => return Ok(()),
                Flow::Refresh => {
                    if !self.reopen(stream, game).await {
                        warn!(
                            "Game {}: could not recover the stream, conceding",
                            self.game_id
                        );
                        self.concede(&game.state).await;
                        return Ok(());
                    }
                    if game.state.status.is_terminal() {
                        return Ok(());
                    }
                    flow = if game.state.is_our_turn(game.descriptor.our_color) {
                        self.take_turn(game).await?
                    } else {
                        Flow::Continue
                    };
                    continue;
                }
            }

            let step = tokio::select! {
                frame = stream.next_event::<GameEvent>() => Step::Frame(frame),
                _ = self.shutdown.changed() => Step::Shutdown,
            };

            flow = match step {
                Step::Shutdown => {
                    if !*self.shutdown.borrow() {
                        continue;
                    }
                    info!("Game {}: shutdown requested, conceding", self.game_id);
                    self.concede(&game.state).await;
                    return Ok(());
                }
                Step::Frame(Ok(Some(event))) => {
                    game.reopened = false;
                    self.on_event(game, event).await?
                }
                Step::Frame(Ok(None)) => {
                    if game.state.status.is_terminal() {
                        return Ok(());
                    }
                    warn!("Game {}: stream ended early", self.game_id);
                    Flow::Refresh
                }
                Step::Frame(Err(ApiError::Protocol(msg))) => {
                    warn!("Game {}: skipping undecodable frame: {}", self.game_id, msg);
                    Flow::Continue
                }
                Step::Frame(Err(e)) => {
                    warn!("Game {}: stream failed: {}", self.game_id, e);
                    Flow::Refresh
                }
            };
        }
    }

    async fn on_event(&mut self, game: &mut ActiveGame, event: GameEvent) -> Result<Flow, ApiError> {
        match event {
            GameEvent::GameState(frame) => self.on_state(game, &frame).await,
            GameEvent::ChatLine(line) => {
                self.on_chat(game, &line).await;
                Ok(Flow::Continue)
            }
            GameEvent::OpponentGone {
                gone,
                claim_win_in_seconds,
            } => {
                if gone {
                    // Keep playing; the service decides about the claim.
                    info!(
                        "Game {}: opponent gone (claim in {:?}s)",
                        self.game_id, claim_win_in_seconds
                    );
                }
                Ok(Flow::Continue)
            }
            GameEvent::GameFull(full) => {
                // A full frame mid-stream is a resync; adopt it wholesale.
                game.state = GameState::from_frame(&full.state);
                game.clocks.resize(game.state.moves.len(), None);
                game.takeback_pending = false;
                if game.state.is_our_turn(game.descriptor.our_color) {
                    return self.take_turn(game).await;
                }
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_state(
        &mut self,
        game: &mut ActiveGame,
        frame: &GameStateFrame,
    ) -> Result<Flow, ApiError> {
        let incoming = frame.move_list();
        match game.state.classify(&incoming) {
            MoveListTransition::Diverged => {
                warn!(
                    "Game {}: move list diverged from ours, rereading full state",
                    self.game_id
                );
                return Ok(Flow::Refresh);
            }
            MoveListTransition::Truncated(removed) => {
                if !game.takeback_pending {
                    warn!(
                        "Game {}: move list shrank by {} without a takeback",
                        self.game_id, removed
                    );
                    return Ok(Flow::Refresh);
                }
                info!("Game {}: takeback removed {} half-move(s)", self.game_id, removed);
                game.takeback_pending = false;
                game.clocks.truncate(incoming.len());
                game.state.apply(frame);
            }
            MoveListTransition::Extended(added) => {
                extend_clocks(&mut game.clocks, &incoming, added, frame);
                game.state.apply(frame);
            }
            MoveListTransition::Unchanged => game.state.apply(frame),
        }

        if game.state.status.is_terminal() {
            info!(
                "Game {} over: {} (winner: {:?})",
                self.game_id,
                game.state.status.as_tag(),
                game.state.winner
            );
            return Ok(Flow::Closed);
        }

        self.answer_draw_offer(game).await;
        self.answer_takeback(game).await;

        if game.state.is_our_turn(game.descriptor.our_color) {
            return self.take_turn(game).await;
        }
        Ok(Flow::Continue)
    }

    /// One full move cycle: position, search, legality gate, submission.
    /// Submissions never overlap; the next search starts only after this
    /// one is acknowledged or definitively failed.
    async fn take_turn(&mut self, game: &mut ActiveGame) -> Result<Flow, ApiError> {
        loop {
            let initial_fen = game.descriptor.initial_fen.clone();
            let moves = game.state.moves.clone();

            if let Err(e) = game.engine.set_position(initial_fen.as_deref(), &moves).await {
                if !self.recover_engine(game, e).await {
                    return Ok(Flow::Closed);
                }
                continue;
            }

            let limits = SearchLimits::from_game(&game.state, game.descriptor.our_color, &self.config.engine);
            let result = match game.engine.search(&limits).await {
                Ok(result) => result,
                Err(EngineError::BadMove(output)) => {
                    warn!("Game {}: engine emitted a non-move: {}", self.game_id, output);
                    game.bad_moves += 1;
                    if game.bad_moves >= MAX_BAD_MOVES {
                        self.concede(&game.state).await;
                        return Ok(Flow::Closed);
                    }
                    continue;
                }
                Err(e) => {
                    if !self.recover_engine(game, e).await {
                        return Ok(Flow::Closed);
                    }
                    continue;
                }
            };

            if let Some(score) = result.score_cp {
                game.last_score = Some(score);
            }

            // Our own legality gate; the service never gets a move we can
            // already see is impossible.
            if game.descriptor.is_standard_variant() {
                if let Err(e) =
                    BoardService::check_move(initial_fen.as_deref(), &moves, &result.best_move)
                {
                    warn!(
                        "Game {}: engine move {} fails locally: {}",
                        self.game_id, result.best_move, e
                    );
                    game.bad_moves += 1;
                    if game.bad_moves >= MAX_BAD_MOVES {
                        self.concede(&game.state).await;
                        return Ok(Flow::Closed);
                    }
                    continue;
                }
            }

            info!(
                "Game {}: playing {} (eval {:?})",
                self.game_id, result.best_move, game.last_score
            );
            match self
                .client
                .make_move(&self.game_id, &result.best_move, false)
                .await
            {
                Ok(()) => {
                    game.bad_moves = 0;
                    return Ok(Flow::Continue);
                }
                Err(ApiError::Conflict) => {
                    // Already played or rejected as illegal; the stream has
                    // the truth.
                    warn!(
                        "Game {}: service refused {}, resyncing",
                        self.game_id, result.best_move
                    );
                    game.bad_moves += 1;
                    if game.bad_moves >= MAX_BAD_MOVES {
                        self.concede(&game.state).await;
                        return Ok(Flow::Closed);
                    }
                    return Ok(Flow::Refresh);
                }
                Err(e) => {
                    warn!("Game {}: submitting move failed: {}", self.game_id, e);
                    // The retry budget is spent; wait for the stream to
                    // tell us where the game stands.
                    return Ok(Flow::Continue);
                }
            }
        }
    }

    /// Recovering: one restart with the same binary. The restarted engine
    /// gets the full current move list before its first search.
    async fn recover_engine(&mut self, game: &mut ActiveGame, cause: EngineError) -> bool {
        if game.engine_restarts >= MAX_ENGINE_RESTARTS {
            error!(
                "Game {}: engine failed again ({}), conceding",
                self.game_id, cause
            );
            self.concede(&game.state).await;
            return false;
        }
        game.engine_restarts += 1;
        warn!(
            "Game {}: engine failed ({}), attempting restart",
            self.game_id, cause
        );

        game.engine.quit().await;
        match engine::spawn(&self.config.engine).await {
            Ok(engine) => {
                game.engine = engine;
                info!("Game {}: engine restarted", self.game_id);
                true
            }
            Err(e) => {
                error!("Game {}: engine restart failed: {}", self.game_id, e);
                self.concede(&game.state).await;
                false
            }
        }
    }

    async fn answer_draw_offer(&mut self, game: &mut ActiveGame) {
        if !game.state.opponent_offers_draw(game.descriptor.our_color) {
            game.draw_answered = false;
            return;
        }
        if game.draw_answered {
            return;
        }
        game.draw_answered = true;

        let accept = should_accept_draw(&self.config.draw, game.state.moves.len(), game.last_score);
        info!(
            "Game {}: opponent offers a draw, {}",
            self.game_id,
            if accept { "accepting" } else { "declining" }
        );
        if let Err(e) = self.client.handle_draw_offer(&self.game_id, accept).await {
            warn!("Game {}: answering draw offer failed: {}", self.game_id, e);
        }
    }

    async fn answer_takeback(&mut self, game: &mut ActiveGame) {
        if !game.state.opponent_asks_takeback(game.descriptor.our_color) {
            game.takeback_answered = false;
            return;
        }
        if game.takeback_answered {
            return;
        }
        game.takeback_answered = true;

        let accept = self.config.takeback.enabled;
        info!(
            "Game {}: opponent asks for a takeback, {}",
            self.game_id,
            if accept { "accepting" } else { "declining" }
        );
        if accept {
            game.takeback_pending = true;
        }
        if let Err(e) = self.client.handle_takeback_offer(&self.game_id, accept).await {
            warn!("Game {}: answering takeback failed: {}", self.game_id, e);
            game.takeback_pending = false;
        }
    }

    async fn on_chat(&mut self, game: &mut ActiveGame, line: &ChatLine) {
        info!(
            "Game {} [{}] {}: {}",
            self.game_id,
            line.room.as_str(),
            line.username,
            line.text
        );
        let engine_name = game.engine.name().to_string();
        let context = ChatContext {
            our_name: &self.account.username,
            engine_name: &engine_name,
            last_score_cp: game.last_score,
        };
        if let Some(reply) = game.chat.respond(line, &context).await {
            if let Err(e) = self
                .client
                .chat(&self.game_id, line.room.as_str(), &reply)
                .await
            {
                warn!("Game {}: sending chat reply failed: {}", self.game_id, e);
            }
        }
    }

    /// Reopen the stream once per incident and resync from its gameFull.
    async fn reopen(&mut self, stream: &mut NdjsonStream, game: &mut ActiveGame) -> bool {
        if game.reopened {
            return false;
        }
        game.reopened = true;
        stream.close();

        match self.client.open_game_stream(&self.game_id).await {
            Ok(new_stream) => {
                *stream = new_stream;
                match stream.next_event::<GameEvent>().await {
                    Ok(Some(GameEvent::GameFull(full))) => {
                        game.state = GameState::from_frame(&full.state);
                        game.clocks.resize(game.state.moves.len(), None);
                        game.takeback_pending = false;
                        // The resync counts as progress, so the next
                        // incident gets its own reopen attempt.
                        game.reopened = false;
                        info!("Game {}: stream reopened and state resynced", self.game_id);
                        true
                    }
                    _ => false,
                }
            }
            Err(e) => {
                warn!("Game {}: reopening stream failed: {}", self.game_id, e);
                false
            }
        }
    }

    /// Resign rather than leave the game hanging. Every give-up path goes
    /// through here: stream loss, bad-move exhaustion, a second engine
    /// death, shutdown.
    async fn concede(&self, state: &GameState) {
        if state.status.is_terminal() {
            return;
        }
        if let Err(e) = self.client.resign_game(&self.game_id).await {
            warn!("Game {}: resigning failed: {}", self.game_id, e);
        }
    }

    /// The engine never came up during Opening, so we never produced a
    /// move: abort while the service still allows it, resign otherwise.
    async fn abandon_before_start(&self, state: &GameState) {
        if state.status.is_terminal() {
            return;
        }
        let result = if state.moves.len() < 2 {
            self.client.abort_game(&self.game_id).await
        } else {
            self.client.resign_game(&self.game_id).await
        };
        if let Err(e) = result {
            warn!("Game {}: leaving the game failed: {}", self.game_id, e);
        }
    }

    fn send_record(&self, descriptor: &GameDescriptor, state: &GameState, clocks: &[Option<u64>]) {
        let mut clocks = clocks.to_vec();
        clocks.resize(state.moves.len(), None);
        let (white, black) = match descriptor.our_color {
            Color::White => (&descriptor.us, &descriptor.opponent),
            Color::Black => (&descriptor.opponent, &descriptor.us),
        };
        let record = GameRecord {
            game_id: self.game_id.clone(),
            site: format!("{}/{}", self.config.url.trim_end_matches('/'), self.game_id),
            white: white.name.clone(),
            black: black.name.clone(),
            variant: descriptor.variant.clone(),
            time_control: descriptor.time_control.show(),
            rated: descriptor.rated,
            initial_fen: descriptor.initial_fen.clone(),
            moves: state.moves.clone(),
            clocks_ms: clocks,
            status: state.status,
            winner: state.winner,
            finished_at: Utc::now(),
        };
        if self.archive_tx.send(record).is_err() {
            warn!(
                "Archiver is gone, dropping record for game {}",
                self.game_id
            );
        }
    }
}

/// Work out which side we play and freeze the immutable game facts.
pub(crate) fn derive_descriptor(our_name: &str, full: &GameFull) -> Result<GameDescriptor, ApiError> {
    let our_color = if full.white.name.eq_ignore_ascii_case(our_name) {
        Color::White
    } else if full.black.name.eq_ignore_ascii_case(our_name) {
        Color::Black
    } else {
        return Err(ApiError::Protocol(format!(
            "account {} is not a player in game {}",
            our_name, full.id
        )));
    };

    let (us, opponent) = match our_color {
        Color::White => (full.white.clone(), full.black.clone()),
        Color::Black => (full.black.clone(), full.white.clone()),
    };

    let time_control = if let Some(clock) = full.clock {
        TimeControl::Clock {
            initial: (clock.initial / 1000) as u32,
            increment: (clock.increment / 1000) as u32,
        }
    } else if let Some(days) = full.days_per_turn {
        TimeControl::Correspondence { days }
    } else {
        TimeControl::Unlimited {}
    };

    let initial_fen = match full.initial_fen.as_deref() {
        None | Some("startpos") => None,
        Some(fen) => Some(fen.to_string()),
    };

    Ok(GameDescriptor {
        id: full.id.clone(),
        our_color,
        us,
        opponent,
        variant: full.variant.clone(),
        time_control,
        rated: full.rated,
        initial_fen,
    })
}

/// Clock entries for freshly observed half-moves: the mover's remaining
/// time from the frame that delivered them.
fn extend_clocks(
    clocks: &mut Vec<Option<u64>>,
    incoming: &[String],
    added: usize,
    frame: &GameStateFrame,
) {
    for index in (incoming.len() - added)..incoming.len() {
        let mover_is_white = index % 2 == 0;
        clocks.push(Some(if mover_is_white {
            frame.wtime
        } else {
            frame.btime
        }));
    }
}

fn should_accept_draw(config: &DrawConfig, half_moves: usize, last_score: Option<i32>) -> bool {
    if !config.enabled {
        return false;
    }
    if (half_moves / 2) < config.min_moves as usize {
        return false;
    }
    match last_score {
        Some(score) => score.unsigned_abs() <= config.score_window_cp,
        None => false,
    }
}

fn frame_name(event: &GameEvent) -> &'static str {
    match event {
        GameEvent::GameFull(_) => "gameFull",
        GameEvent::GameState(_) => "gameState",
        GameEvent::ChatLine(_) => "chatLine",
        GameEvent::OpponentGone { .. } => "opponentGone",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game_full(raw: serde_json::Value) -> GameFull {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_descriptor_assigns_our_color() {
        let full = game_full(serde_json::json!({
            "id": "G1",
            "variant": "standard",
            "rated": false,
            "clock": {"initial": 180000, "increment": 2000},
            "white": {"name": "knightwatch", "title": "BOT"},
            "black": {"name": "B1", "title": "BOT"},
            "state": {"moves": "", "status": "started"}
        }));

        let descriptor = derive_descriptor("knightwatch", &full).unwrap();
        assert_eq!(descriptor.our_color, Color::White);
        assert_eq!(descriptor.opponent.name, "B1");
        assert_eq!(
            descriptor.time_control,
            TimeControl::Clock {
                initial: 180,
                increment: 2
            }
        );
        assert!(descriptor.initial_fen.is_none());

        let descriptor = derive_descriptor("B1", &full).unwrap();
        assert_eq!(descriptor.our_color, Color::Black);
        assert_eq!(descriptor.opponent.name, "knightwatch");
    }

    #[test]
    fn test_descriptor_rejects_foreign_games() {
        let full = game_full(serde_json::json!({
            "id": "G1",
            "white": {"name": "a"},
            "black": {"name": "b"},
            "state": {"moves": "", "status": "started"}
        }));
        assert!(matches!(
            derive_descriptor("knightwatch", &full),
            Err(ApiError::Protocol(_))
        ));
    }

    #[test]
    fn test_descriptor_normalises_startpos() {
        let full = game_full(serde_json::json!({
            "id": "G1",
            "initialFen": "startpos",
            "white": {"name": "knightwatch"},
            "black": {"name": "B1"},
            "state": {"moves": "", "status": "started"}
        }));
        let descriptor = derive_descriptor("knightwatch", &full).unwrap();
        assert!(descriptor.initial_fen.is_none());
        assert_eq!(descriptor.time_control, TimeControl::Unlimited {});
    }

    #[test]
    fn test_clock_recording_tracks_the_mover() {
        let mut clocks: Vec<Option<u64>> = vec![];
        let frame: GameStateFrame = serde_json::from_value(serde_json::json!({
            "moves": "e2e4",
            "wtime": 179000, "btime": 180000, "winc": 2000, "binc": 2000,
            "status": "started"
        }))
        .unwrap();
        extend_clocks(&mut clocks, &frame.move_list(), 1, &frame);
        assert_eq!(clocks, vec![Some(179_000)]);

        let frame: GameStateFrame = serde_json::from_value(serde_json::json!({
            "moves": "e2e4 e7e5",
            "wtime": 179000, "btime": 178500, "winc": 2000, "binc": 2000,
            "status": "started"
        }))
        .unwrap();
        extend_clocks(&mut clocks, &frame.move_list(), 1, &frame);
        assert_eq!(clocks, vec![Some(179_000), Some(178_500)]);
    }

    #[test]
    fn test_draw_acceptance_window() {
        let config: DrawConfig = serde_json::from_value(serde_json::json!({
            "enabled": true,
            "score-window-cp": 20,
            "min-moves": 10
        }))
        .unwrap();

        // Not enough moves yet.
        assert!(!should_accept_draw(&config, 10, Some(0)));
        // Enough moves, score inside the window.
        assert!(should_accept_draw(&config, 20, Some(15)));
        assert!(should_accept_draw(&config, 20, Some(-20)));
        // Score outside the window.
        assert!(!should_accept_draw(&config, 20, Some(80)));
        // No score reported: do not gamble.
        assert!(!should_accept_draw(&config, 20, None));

        let disabled: DrawConfig =
            serde_json::from_value(serde_json::json!({"enabled": false})).unwrap();
        assert!(!should_accept_draw(&disabled, 40, Some(0)));
    }
}
