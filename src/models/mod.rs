pub mod account;
pub mod challenge;
pub mod event;
pub mod game;

pub use account::Account;
pub use challenge::{Challenge, ChallengeSource, Player, TimeControl, TimeControlCategory};
pub use event::{AccountEvent, ChatLine, ChatRoom, GameEvent, GameFull};
pub use game::{Color, GameDescriptor, GameState, GameStateFrame, GameStatus, MoveListTransition};
