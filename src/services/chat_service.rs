use serde_json::json;
use tracing::{info, warn};

use crate::config::ChatConfig;
use crate::models::ChatLine;

/// The service truncates chat messages at this length.
const MAX_CHAT_CHARS: usize = 140;
const COMMAND_PREFIX: char = '!';
const AI_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Game facts a reply may draw on.
pub struct ChatContext<'a> {
    pub our_name: &'a str,
    pub engine_name: &'a str,
    pub last_score_cp: Option<i32>,
}

/// Answers chat lines in the player and spectator rooms. Known commands get
/// a canned reply; free-form messages optionally go to a local
/// Ollama-compatible model. Anything else stays silent.
pub struct ChatService {
    config: ChatConfig,
    http: reqwest::Client,
    history: Vec<(String, String)>,
}

impl ChatService {
    pub fn new(config: ChatConfig) -> Self {
        ChatService {
            config,
            http: reqwest::Client::new(),
            history: Vec::new(),
        }
    }

    /// Reply to a chat line, or stay silent. Our own messages are never
    /// answered.
    pub async fn respond(&mut self, line: &ChatLine, context: &ChatContext<'_>) -> Option<String> {
        if line.username.eq_ignore_ascii_case(context.our_name) {
            return None;
        }

        if let Some(command) = line.text.strip_prefix(COMMAND_PREFIX) {
            return command_reply(command.trim().to_lowercase().as_str(), context)
                .map(|reply| safe_message(&reply));
        }

        if self.config.ai_enabled {
            return self.ai_reply(&line.text, context).await;
        }

        None
    }

    /// Ask the configured model for a free-form reply. Failures degrade to
    /// silence; chat must never interfere with play.
    async fn ai_reply(&mut self, user_text: &str, context: &ChatContext<'_>) -> Option<String> {
        let score = match context.last_score_cp {
            Some(cp) => format_score(cp),
            None => "unknown".to_string(),
        };
        let system = format!(
            "You are a chess bot playing a game online. The current evaluation is {}. \
             Keep answers to at most two short sentences.",
            score
        );

        self.history.push(("user".to_string(), user_text.to_string()));
        let mut prompt = format!("SYSTEM: {}\n", system);
        for (role, content) in self.history.iter().rev().take(5).rev() {
            prompt.push_str(&format!("{}: {}\n", role.to_uppercase(), content));
        }
        prompt.push_str("ASSISTANT:");

        let payload = json!({
            "model": self.config.ai_model,
            "prompt": prompt,
            "stream": false,
            "options": {"num_predict": 50, "temperature": 0.7}
        });

        let url = format!("{}/api/generate", self.config.ai_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .timeout(AI_TIMEOUT)
            .json(&payload)
            .send()
            .await;

        let reply = match response {
            Ok(response) if response.status().is_success() => response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("response").and_then(|r| r.as_str()).map(str::to_string)),
            Ok(response) => {
                warn!("AI chat endpoint answered {}", response.status());
                None
            }
            Err(e) => {
                warn!("AI chat request failed: {}", e);
                None
            }
        };

        let reply = safe_message(reply?.trim());
        if reply.is_empty() {
            return None;
        }
        self.history.push(("assistant".to_string(), reply.clone()));
        info!("AI chat reply: {}", reply);
        Some(reply)
    }
}

fn command_reply(command: &str, context: &ChatContext<'_>) -> Option<String> {
    match command {
        "help" | "commands" => Some(
            "Supported commands: !help, !name, !eval, !ping".to_string(),
        ),
        "name" => Some(format!(
            "{} running {} (knightwatch v{})",
            context.our_name,
            context.engine_name,
            env!("CARGO_PKG_VERSION")
        )),
        "eval" => Some(match context.last_score_cp {
            Some(cp) => format!("Engine eval: {}", format_score(cp)),
            None => "No evaluation yet.".to_string(),
        }),
        "ping" => Some("pong".to_string()),
        _ => None,
    }
}

fn format_score(cp: i32) -> String {
    if cp >= 10_000 {
        "winning with forced mate".to_string()
    } else if cp <= -10_000 {
        "losing to forced mate".to_string()
    } else {
        format!("{:+.2}", f64::from(cp) / 100.0)
    }
}

/// Collapse whitespace and cap at the service's chat limit, preferring a
/// word boundary and marking the cut with an ellipsis.
pub fn safe_message(text: &str) -> String {
    let clean = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if clean.chars().count() <= MAX_CHAT_CHARS {
        return clean;
    }

    let hard: String = clean.chars().take(MAX_CHAT_CHARS - 1).collect();
    let cut = match hard.rfind(' ') {
        Some(boundary) if boundary >= 30 => &hard[..boundary],
        _ => hard.as_str(),
    };
    format!("{}…", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatRoom;

    fn context() -> ChatContext<'static> {
        ChatContext {
            our_name: "knightwatch",
            engine_name: "Stockfish 16",
            last_score_cp: Some(35),
        }
    }

    fn line(username: &str, text: &str) -> ChatLine {
        ChatLine {
            room: ChatRoom::Player,
            username: username.to_string(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_known_commands_get_replies() {
        let mut service = ChatService::new(ChatConfig::default());
        let ctx = context();

        let help = service.respond(&line("opponent", "!help"), &ctx).await;
        assert!(help.unwrap().contains("!eval"));

        let name = service.respond(&line("opponent", "!name"), &ctx).await;
        assert!(name.unwrap().contains("Stockfish 16"));

        let eval = service.respond(&line("opponent", "!eval"), &ctx).await;
        assert_eq!(eval.unwrap(), "Engine eval: +0.35");

        let ping = service.respond(&line("opponent", "!ping"), &ctx).await;
        assert_eq!(ping.unwrap(), "pong");
    }

    #[tokio::test]
    async fn test_own_messages_are_ignored() {
        let mut service = ChatService::new(ChatConfig::default());
        let reply = service.respond(&line("knightwatch", "!ping"), &context()).await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_unknown_commands_and_plain_text_stay_silent() {
        let mut service = ChatService::new(ChatConfig::default());
        let ctx = context();
        assert!(service.respond(&line("opponent", "!dance"), &ctx).await.is_none());
        assert!(service
            .respond(&line("opponent", "nice move"), &ctx)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_eval_without_score() {
        let mut service = ChatService::new(ChatConfig::default());
        let ctx = ChatContext {
            last_score_cp: None,
            ..context()
        };
        let reply = service.respond(&line("opponent", "!eval"), &ctx).await;
        assert_eq!(reply.unwrap(), "No evaluation yet.");
    }

    #[test]
    fn test_mate_scores_render_as_words() {
        assert_eq!(format_score(10_000), "winning with forced mate");
        assert_eq!(format_score(-10_000), "losing to forced mate");
        assert_eq!(format_score(-250), "-2.50");
    }

    #[test]
    fn test_safe_message_collapses_whitespace() {
        assert_eq!(safe_message("a  b\n\nc\t d"), "a b c d");
    }

    #[test]
    fn test_safe_message_caps_at_limit() {
        let long = "word ".repeat(60);
        let capped = safe_message(&long);
        assert!(capped.chars().count() <= MAX_CHAT_CHARS);
        assert!(capped.ends_with('…'));
        // The cut lands on a word boundary, never mid-word.
        let without_ellipsis = capped.trim_end_matches('…').trim_end();
        assert!(without_ellipsis.ends_with("word"));
    }

    #[test]
    fn test_short_messages_pass_through() {
        assert_eq!(safe_message("gg wp"), "gg wp");
    }
}
