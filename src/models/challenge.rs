use serde::{Deserialize, Deserializer, Serialize};

/// Identity of an account on the remote service, as embedded in challenge
/// and game frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Player {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub rating: Option<u32>,
    #[serde(default)]
    pub provisional: bool,
}

impl Player {
    pub fn is_bot(&self) -> bool {
        self.title.as_deref() == Some("BOT")
    }
}

/// Where a challenge came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeSource {
    Lobby,
    Friend,
    Tournament,
}

/// Time control requested for a game. The service sends clock values in
/// seconds inside challenge frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeControl {
    Clock {
        initial: u32,
        increment: u32,
    },
    Correspondence {
        #[serde(rename = "daysPerTurn", alias = "days")]
        days: u32,
    },
    Unlimited {},
}

/// Speed buckets used by the challenge policy. Category boundaries follow
/// the service's estimate of total game duration: initial + 40 * increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimeControlCategory {
    UltraBullet,
    Bullet,
    Blitz,
    Rapid,
    Classical,
    Correspondence,
}

impl TimeControl {
    pub fn category(&self) -> TimeControlCategory {
        match self {
            TimeControl::Clock { initial, increment } => {
                let estimated = initial + 40 * increment;
                if estimated < 30 {
                    TimeControlCategory::UltraBullet
                } else if estimated < 180 {
                    TimeControlCategory::Bullet
                } else if estimated < 480 {
                    TimeControlCategory::Blitz
                } else if estimated < 1500 {
                    TimeControlCategory::Rapid
                } else {
                    TimeControlCategory::Classical
                }
            }
            TimeControl::Correspondence { .. } | TimeControl::Unlimited {} => {
                TimeControlCategory::Correspondence
            }
        }
    }

    /// Compact rendering for logs and PGN tags, e.g. "180+2".
    pub fn show(&self) -> String {
        match self {
            TimeControl::Clock { initial, increment } => format!("{}+{}", initial, increment),
            TimeControl::Correspondence { days } => format!("{}d", days),
            TimeControl::Unlimited {} => "-".to_string(),
        }
    }
}

/// An incoming (or outgoing) challenge as observed on the event stream.
/// Immutable once read.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: String,
    pub challenger: Player,
    #[serde(default = "standard_variant", deserialize_with = "variant_tag")]
    pub variant: String,
    #[serde(default)]
    pub rated: bool,
    pub time_control: TimeControl,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub source: Option<ChallengeSource>,
    #[serde(default)]
    pub initial_fen: Option<String>,
}

impl Challenge {
    /// True when the game would begin from the standard starting position.
    pub fn is_standard_start(&self) -> bool {
        if self.variant == "fromPosition" {
            return false;
        }
        match self.initial_fen.as_deref() {
            None | Some("startpos") => true,
            Some(_) => false,
        }
    }
}

fn standard_variant() -> String {
    "standard".to_string()
}

/// The variant arrives either as a bare tag ("standard") or as an object
/// with a `key` field, depending on the frame; both decode to the tag.
pub(crate) fn variant_tag<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Tag(String),
        Keyed { key: String },
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::Tag(tag) => tag,
        Repr::Keyed { key } => key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_frame_decodes() {
        let raw = r#"{
            "id": "X1",
            "variant": "standard",
            "timeControl": {"initial": 180, "increment": 2},
            "rated": false,
            "challenger": {"name": "B1", "title": "BOT"}
        }"#;

        let challenge: Challenge = serde_json::from_str(raw).unwrap();
        assert_eq!(challenge.id, "X1");
        assert_eq!(challenge.variant, "standard");
        assert!(!challenge.rated);
        assert!(challenge.challenger.is_bot());
        assert_eq!(
            challenge.time_control,
            TimeControl::Clock {
                initial: 180,
                increment: 2
            }
        );
    }

    #[test]
    fn test_challenge_variant_as_object() {
        let raw = r#"{
            "id": "X2",
            "variant": {"key": "chess960", "name": "Chess960"},
            "timeControl": {"initial": 60, "increment": 0},
            "challenger": {"name": "someone"}
        }"#;

        let challenge: Challenge = serde_json::from_str(raw).unwrap();
        assert_eq!(challenge.variant, "chess960");
    }

    #[test]
    fn test_unlimited_time_control() {
        let raw = r#"{
            "id": "X3",
            "timeControl": {},
            "challenger": {"name": "someone"}
        }"#;

        let challenge: Challenge = serde_json::from_str(raw).unwrap();
        assert_eq!(challenge.time_control, TimeControl::Unlimited {});
        assert_eq!(
            challenge.time_control.category(),
            TimeControlCategory::Correspondence
        );
    }

    #[test]
    fn test_category_boundaries() {
        let cases = [
            (15, 0, TimeControlCategory::UltraBullet),
            (30, 0, TimeControlCategory::Bullet),
            (60, 1, TimeControlCategory::Bullet),
            (180, 2, TimeControlCategory::Blitz),
            (600, 5, TimeControlCategory::Rapid),
            (1800, 0, TimeControlCategory::Classical),
        ];
        for (initial, increment, expected) in cases {
            let tc = TimeControl::Clock { initial, increment };
            assert_eq!(tc.category(), expected, "{}+{}", initial, increment);
        }
    }

    #[test]
    fn test_standard_start_detection() {
        let mut challenge: Challenge = serde_json::from_str(
            r#"{"id": "X", "timeControl": {"initial": 60, "increment": 0}, "challenger": {"name": "a"}}"#,
        )
        .unwrap();
        assert!(challenge.is_standard_start());

        challenge.initial_fen = Some("startpos".to_string());
        assert!(challenge.is_standard_start());

        challenge.initial_fen =
            Some("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1".to_string());
        assert!(!challenge.is_standard_start());
    }

    #[test]
    fn test_time_control_show() {
        assert_eq!(
            TimeControl::Clock {
                initial: 180,
                increment: 2
            }
            .show(),
            "180+2"
        );
        assert_eq!(TimeControl::Correspondence { days: 3 }.show(), "3d");
        assert_eq!(TimeControl::Unlimited {}.show(), "-");
    }
}
