use serde::{Deserialize, Serialize};

/// Our own profile as returned by the account endpoint. Startup refuses to
/// run unless the account carries the bot title.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub title: Option<String>,
}

impl Account {
    pub fn is_bot(&self) -> bool {
        self.title.as_deref() == Some("BOT")
    }
}
