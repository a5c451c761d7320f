use crate::config::{ChallengeConfig, GameMode};
use crate::models::{Challenge, TimeControl};

/// Decline codes understood by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    Generic,
    Later,
    TooFast,
    TooSlow,
    TimeControl,
    Rated,
    Casual,
    Standard,
    Variant,
    NoBot,
    OnlyBot,
}

impl DeclineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeclineReason::Generic => "generic",
            DeclineReason::Later => "later",
            DeclineReason::TooFast => "tooFast",
            DeclineReason::TooSlow => "tooSlow",
            DeclineReason::TimeControl => "timeControl",
            DeclineReason::Rated => "rated",
            DeclineReason::Casual => "casual",
            DeclineReason::Standard => "standard",
            DeclineReason::Variant => "variant",
            DeclineReason::NoBot => "noBot",
            DeclineReason::OnlyBot => "onlyBot",
        }
    }

    /// Anything outside the documented set degrades to `generic`.
    pub fn from_str(reason: &str) -> DeclineReason {
        match reason {
            "later" => DeclineReason::Later,
            "tooFast" => DeclineReason::TooFast,
            "tooSlow" => DeclineReason::TooSlow,
            "timeControl" => DeclineReason::TimeControl,
            "rated" => DeclineReason::Rated,
            "casual" => DeclineReason::Casual,
            "standard" => DeclineReason::Standard,
            "variant" => DeclineReason::Variant,
            "noBot" => DeclineReason::NoBot,
            "onlyBot" => DeclineReason::OnlyBot,
            _ => DeclineReason::Generic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Accept,
    Decline(DeclineReason),
    /// All predicates pass but no worker slot is free; the control loop
    /// re-evaluates later.
    Defer,
}

/// Snapshot of the mutable state the policy is allowed to see. Everything
/// else comes from configuration, so two evaluations on identical inputs
/// give identical output.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    pub active_games: usize,
    /// Opponent the matchmaker is currently challenging, if any.
    pub challenging_user: Option<String>,
}

pub struct ChallengePolicy {
    config: ChallengeConfig,
    max_games: usize,
}

impl ChallengePolicy {
    pub fn new(config: ChallengeConfig, max_games: usize) -> Self {
        ChallengePolicy { config, max_games }
    }

    /// Evaluate the predicates in their fixed order; the first failure
    /// decides the decline code.
    pub fn evaluate(&self, challenge: &Challenge, snapshot: &PolicySnapshot) -> PolicyDecision {
        let config = &self.config;
        let challenger = &challenge.challenger;

        if config
            .block_list
            .iter()
            .any(|blocked| blocked.eq_ignore_ascii_case(&challenger.name))
        {
            return PolicyDecision::Decline(DeclineReason::Generic);
        }

        if !config.variants.iter().any(|v| *v == challenge.variant) {
            return PolicyDecision::Decline(DeclineReason::Variant);
        }

        if !config
            .time_controls
            .contains(&challenge.time_control.category())
        {
            return PolicyDecision::Decline(DeclineReason::TimeControl);
        }

        if let TimeControl::Clock { initial, increment } = challenge.time_control {
            if initial < config.min_initial {
                return PolicyDecision::Decline(DeclineReason::TooFast);
            }
            if initial > config.max_initial {
                return PolicyDecision::Decline(DeclineReason::TooSlow);
            }
            if increment < config.min_increment {
                return PolicyDecision::Decline(DeclineReason::TooFast);
            }
            if increment > config.max_increment {
                return PolicyDecision::Decline(DeclineReason::TooSlow);
            }
        }

        if challenge.rated && !config.modes.contains(&GameMode::Rated) {
            return PolicyDecision::Decline(DeclineReason::Casual);
        }
        if !challenge.rated && !config.modes.contains(&GameMode::Casual) {
            return PolicyDecision::Decline(DeclineReason::Rated);
        }

        if config.standard_start_only && !challenge.is_standard_start() {
            return PolicyDecision::Decline(DeclineReason::Standard);
        }

        if config.only_bot && !challenger.is_bot() {
            return PolicyDecision::Decline(DeclineReason::OnlyBot);
        }
        if !config.accept_bot && challenger.is_bot() {
            return PolicyDecision::Decline(DeclineReason::NoBot);
        }

        // An outbound challenge holds a prospective slot, except when this
        // is the very opponent it is aimed at.
        let reserved = match &snapshot.challenging_user {
            Some(user) if !user.eq_ignore_ascii_case(&challenger.name) => 1,
            _ => 0,
        };
        if snapshot.active_games + reserved >= self.max_games {
            return PolicyDecision::Defer;
        }

        PolicyDecision::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChallengeConfig {
        serde_json::from_value(serde_json::json!({
            "variants": ["standard"],
            "time-controls": ["ultraBullet", "bullet", "blitz"],
            "min-initial": 30,
            "max-initial": 600,
            "min-increment": 0,
            "max-increment": 10,
            "modes": ["casual"],
            "accept-bot": true,
            "only-bot": true
        }))
        .unwrap()
    }

    fn challenge(raw: serde_json::Value) -> Challenge {
        serde_json::from_value(raw).unwrap()
    }

    fn blitz_bot_challenge() -> Challenge {
        challenge(serde_json::json!({
            "id": "X1",
            "variant": "standard",
            "timeControl": {"initial": 180, "increment": 2},
            "rated": false,
            "challenger": {"name": "B1", "title": "BOT"}
        }))
    }

    #[test]
    fn test_conforming_challenge_is_accepted() {
        let policy = ChallengePolicy::new(config(), 2);
        let decision = policy.evaluate(&blitz_bot_challenge(), &PolicySnapshot::default());
        assert_eq!(decision, PolicyDecision::Accept);
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let policy = ChallengePolicy::new(config(), 2);
        let challenge = blitz_bot_challenge();
        let snapshot = PolicySnapshot {
            active_games: 1,
            challenging_user: None,
        };
        assert_eq!(
            policy.evaluate(&challenge, &snapshot),
            policy.evaluate(&challenge, &snapshot)
        );
    }

    #[test]
    fn test_too_fast_initial_is_declined() {
        let policy = ChallengePolicy::new(config(), 2);
        let fast = challenge(serde_json::json!({
            "id": "X2",
            "variant": "standard",
            "timeControl": {"initial": 15, "increment": 0},
            "rated": false,
            "challenger": {"name": "B1", "title": "BOT"}
        }));
        assert_eq!(
            policy.evaluate(&fast, &PolicySnapshot::default()),
            PolicyDecision::Decline(DeclineReason::TooFast)
        );
    }

    #[test]
    fn test_unknown_variant_is_declined() {
        let policy = ChallengePolicy::new(config(), 2);
        let horde = challenge(serde_json::json!({
            "id": "X3",
            "variant": "horde",
            "timeControl": {"initial": 180, "increment": 2},
            "rated": false,
            "challenger": {"name": "B1", "title": "BOT"}
        }));
        assert_eq!(
            policy.evaluate(&horde, &PolicySnapshot::default()),
            PolicyDecision::Decline(DeclineReason::Variant)
        );
    }

    #[test]
    fn test_block_list_wins_over_every_other_predicate() {
        let mut config = config();
        config.block_list = vec!["Pest".to_string()];
        let policy = ChallengePolicy::new(config, 2);
        // Wrong variant too, but the block list is checked first.
        let blocked = challenge(serde_json::json!({
            "id": "X4",
            "variant": "horde",
            "timeControl": {"initial": 180, "increment": 2},
            "challenger": {"name": "pest"}
        }));
        assert_eq!(
            policy.evaluate(&blocked, &PolicySnapshot::default()),
            PolicyDecision::Decline(DeclineReason::Generic)
        );
    }

    #[test]
    fn test_boundary_values_are_accepted() {
        let policy = ChallengePolicy::new(config(), 2);
        for (initial, increment) in [(30, 0), (600, 10)] {
            let edge = challenge(serde_json::json!({
                "id": "X5",
                "variant": "standard",
                "timeControl": {"initial": initial, "increment": increment},
                "rated": false,
                "challenger": {"name": "B1", "title": "BOT"}
            }));
            assert_eq!(
                policy.evaluate(&edge, &PolicySnapshot::default()),
                PolicyDecision::Accept,
                "{}+{}",
                initial,
                increment
            );
        }
    }

    #[test]
    fn test_category_outside_allowed_set_is_declined() {
        let policy = ChallengePolicy::new(config(), 2);
        let classical = challenge(serde_json::json!({
            "id": "X6",
            "variant": "standard",
            "timeControl": {"initial": 600, "increment": 30},
            "rated": false,
            "challenger": {"name": "B1", "title": "BOT"}
        }));
        // 600+30 estimates to classical, which the config does not allow;
        // the category predicate fires before the increment bound.
        assert_eq!(
            policy.evaluate(&classical, &PolicySnapshot::default()),
            PolicyDecision::Decline(DeclineReason::TimeControl)
        );
    }

    #[test]
    fn test_rated_challenge_declined_when_casual_only() {
        let policy = ChallengePolicy::new(config(), 2);
        let rated = challenge(serde_json::json!({
            "id": "X7",
            "variant": "standard",
            "timeControl": {"initial": 180, "increment": 2},
            "rated": true,
            "challenger": {"name": "B1", "title": "BOT"}
        }));
        assert_eq!(
            policy.evaluate(&rated, &PolicySnapshot::default()),
            PolicyDecision::Decline(DeclineReason::Casual)
        );
    }

    #[test]
    fn test_human_declined_when_only_bots() {
        let policy = ChallengePolicy::new(config(), 2);
        let human = challenge(serde_json::json!({
            "id": "X8",
            "variant": "standard",
            "timeControl": {"initial": 180, "increment": 2},
            "rated": false,
            "challenger": {"name": "someone", "rating": 1900}
        }));
        assert_eq!(
            policy.evaluate(&human, &PolicySnapshot::default()),
            PolicyDecision::Decline(DeclineReason::OnlyBot)
        );
    }

    #[test]
    fn test_bot_declined_when_bots_refused() {
        let mut config = config();
        config.only_bot = false;
        config.accept_bot = false;
        let policy = ChallengePolicy::new(config, 2);
        assert_eq!(
            policy.evaluate(&blitz_bot_challenge(), &PolicySnapshot::default()),
            PolicyDecision::Decline(DeclineReason::NoBot)
        );
    }

    #[test]
    fn test_arbitrary_position_declined_when_standard_only() {
        let mut config = config();
        config.standard_start_only = true;
        let policy = ChallengePolicy::new(config, 2);
        let custom = challenge(serde_json::json!({
            "id": "X9",
            "variant": "standard",
            "timeControl": {"initial": 180, "increment": 2},
            "initialFen": "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR b KQkq - 0 1",
            "challenger": {"name": "B1", "title": "BOT"}
        }));
        assert_eq!(
            policy.evaluate(&custom, &PolicySnapshot::default()),
            PolicyDecision::Decline(DeclineReason::Standard)
        );
    }

    #[test]
    fn test_full_slots_defer_instead_of_declining() {
        let policy = ChallengePolicy::new(config(), 1);
        let snapshot = PolicySnapshot {
            active_games: 1,
            challenging_user: None,
        };
        assert_eq!(
            policy.evaluate(&blitz_bot_challenge(), &snapshot),
            PolicyDecision::Defer
        );
    }

    #[test]
    fn test_outbound_challenge_reserves_a_slot() {
        let policy = ChallengePolicy::new(config(), 1);
        let snapshot = PolicySnapshot {
            active_games: 0,
            challenging_user: Some("OtherBot".to_string()),
        };
        assert_eq!(
            policy.evaluate(&blitz_bot_challenge(), &snapshot),
            PolicyDecision::Defer
        );

        // Unless the challenge comes from the opponent the slot is held for.
        let snapshot = PolicySnapshot {
            active_games: 0,
            challenging_user: Some("B1".to_string()),
        };
        assert_eq!(
            policy.evaluate(&blitz_bot_challenge(), &snapshot),
            PolicyDecision::Accept
        );
    }

    #[test]
    fn test_decline_reasons_round_trip() {
        let reasons = [
            DeclineReason::Generic,
            DeclineReason::Later,
            DeclineReason::TooFast,
            DeclineReason::TooSlow,
            DeclineReason::TimeControl,
            DeclineReason::Rated,
            DeclineReason::Casual,
            DeclineReason::Standard,
            DeclineReason::Variant,
            DeclineReason::NoBot,
            DeclineReason::OnlyBot,
        ];
        for reason in reasons {
            assert_eq!(DeclineReason::from_str(reason.as_str()), reason);
        }
    }

    #[test]
    fn test_unknown_reason_degrades_to_generic() {
        assert_eq!(
            DeclineReason::from_str("politelyNo"),
            DeclineReason::Generic
        );
    }
}
