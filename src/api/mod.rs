pub mod errors;
pub mod rate_limit;
pub mod retry;
pub mod stream;

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::errors::ApiError;
use crate::api::rate_limit::{EndpointClass, RateLimiter};
use crate::api::retry::RetryPolicy;
use crate::api::stream::NdjsonStream;
use crate::models::Account;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Client for the remote game service. Owns the bearer credential, the
/// per-class rate budgets and the retry policy; every other component goes
/// through it for network I/O.
pub struct ServiceClient {
    http: reqwest::Client,
    base: String,
    token: String,
    limiter: RateLimiter,
    retry: RetryPolicy,
    watchdog: Duration,
}

impl ServiceClient {
    pub fn new(base_url: &str, token: &str, watchdog: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("knightwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(ServiceClient {
            http,
            base: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            limiter: RateLimiter::new(),
            retry: RetryPolicy::default(),
            watchdog,
        })
    }

    // ---- account ----

    pub async fn profile(&self) -> Result<Account, ApiError> {
        let value = self
            .execute(Method::GET, "/api/account", None, EndpointClass::Account, true)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| ApiError::Protocol(format!("profile response: {}", e)))
    }

    // ---- streams ----

    pub async fn open_event_stream(&self) -> Result<NdjsonStream, ApiError> {
        self.open_stream("/api/stream/event", EndpointClass::EventStream)
            .await
    }

    pub async fn open_game_stream(&self, game_id: &str) -> Result<NdjsonStream, ApiError> {
        self.open_stream(
            &format!("/api/bot/game/stream/{}", game_id),
            EndpointClass::GameStream,
        )
        .await
    }

    // ---- challenge actions ----

    pub async fn accept_challenge(&self, challenge_id: &str) -> Result<(), ApiError> {
        self.post(
            &format!("/api/challenge/{}/accept", challenge_id),
            &[],
            EndpointClass::Challenge,
        )
        .await
        .map(|_| ())
    }

    pub async fn decline_challenge(&self, challenge_id: &str, reason: &str) -> Result<(), ApiError> {
        self.post(
            &format!("/api/challenge/{}/decline", challenge_id),
            &[("reason", reason.to_string())],
            EndpointClass::Challenge,
        )
        .await
        .map(|_| ())
    }

    /// Issue an outbound challenge; returns the challenge id the service
    /// assigned, when it reports one.
    pub async fn create_challenge(
        &self,
        opponent: &str,
        variant: &str,
        initial: u32,
        increment: u32,
        rated: bool,
    ) -> Result<Option<String>, ApiError> {
        let value = self
            .post(
                &format!("/api/challenge/{}", opponent),
                &[
                    ("rated", rated.to_string()),
                    ("clock.limit", initial.to_string()),
                    ("clock.increment", increment.to_string()),
                    ("variant", variant.to_string()),
                    ("color", "random".to_string()),
                ],
                EndpointClass::Challenge,
            )
            .await?;

        let id = value
            .get("challenge")
            .and_then(|c| c.get("id"))
            .or_else(|| value.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(id)
    }

    // ---- game actions ----

    pub async fn abort_game(&self, game_id: &str) -> Result<(), ApiError> {
        self.post(
            &format!("/api/bot/game/{}/abort", game_id),
            &[],
            EndpointClass::GameAction,
        )
        .await
        .map(|_| ())
    }

    pub async fn resign_game(&self, game_id: &str) -> Result<(), ApiError> {
        self.post(
            &format!("/api/bot/game/{}/resign", game_id),
            &[],
            EndpointClass::GameAction,
        )
        .await
        .map(|_| ())
    }

    pub async fn make_move(
        &self,
        game_id: &str,
        uci: &str,
        offering_draw: bool,
    ) -> Result<(), ApiError> {
        let mut path = format!("/api/bot/game/{}/move/{}", game_id, uci);
        if offering_draw {
            path.push_str("?offeringDraw=true");
        }
        self.post(&path, &[], EndpointClass::GameAction)
            .await
            .map(|_| ())
    }

    pub async fn handle_draw_offer(&self, game_id: &str, accept: bool) -> Result<(), ApiError> {
        self.post(
            &format!(
                "/api/bot/game/{}/draw/{}",
                game_id,
                if accept { "yes" } else { "no" }
            ),
            &[],
            EndpointClass::GameAction,
        )
        .await
        .map(|_| ())
    }

    pub async fn handle_takeback_offer(&self, game_id: &str, accept: bool) -> Result<(), ApiError> {
        self.post(
            &format!(
                "/api/bot/game/{}/takeback/{}",
                game_id,
                if accept { "yes" } else { "no" }
            ),
            &[],
            EndpointClass::GameAction,
        )
        .await
        .map(|_| ())
    }

    pub async fn chat(&self, game_id: &str, room: &str, text: &str) -> Result<(), ApiError> {
        self.post(
            &format!("/api/bot/game/{}/chat", game_id),
            &[("room", room.to_string()), ("text", text.to_string())],
            EndpointClass::Chat,
        )
        .await
        .map(|_| ())
    }

    // ---- plumbing ----

    async fn post(
        &self,
        path: &str,
        form: &[(&str, String)],
        class: EndpointClass,
    ) -> Result<Value, ApiError> {
        // Every POST here mutates service state, so none is idempotent.
        self.execute(Method::POST, path, Some(form), class, false)
            .await
    }

    /// One request with rate-budget gating, retry and backoff. Idempotent
    /// requests retry on transport errors and 5xx; the rest on transport
    /// errors only.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(&str, String)]>,
        class: EndpointClass,
        idempotent: bool,
    ) -> Result<Value, ApiError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            if let Some(wait) = self.limiter.delay_for(class) {
                debug!("Budget for {:?} blocks {}ms before {}", class, wait.as_millis(), path);
                tokio::time::sleep(wait).await;
            }

            match self.send_once(method.clone(), path, form).await {
                Ok(value) => {
                    self.limiter.note_success(class);
                    return Ok(value);
                }
                Err(err) => {
                    if let ApiError::RateLimited(hint) = &err {
                        self.limiter.note_rate_limited(class, *hint);
                    }
                    if !self.retry.should_retry(&err, attempt, idempotent) {
                        return Err(err);
                    }
                    warn!(
                        "Request {} {} failed on attempt {}: {}",
                        method, path, attempt, err
                    );
                    if !matches!(err, ApiError::RateLimited(_)) {
                        tokio::time::sleep(self.retry.jittered(attempt)).await;
                    }
                }
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(&str, String)]>,
    ) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base, path);
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT);
        if let Some(form) = form {
            request = request.form(form);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            let body = response.text().await?;
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            // Some endpoints answer with bare "ok" lines rather than JSON.
            Ok(serde_json::from_str(&body).unwrap_or(Value::Null))
        } else {
            Err(Self::status_error(status, &response_hint(response).await))
        }
    }

    fn status_error(status: StatusCode, hint: &Option<Duration>) -> ApiError {
        match status.as_u16() {
            401 | 403 => ApiError::Unauthorized,
            404 => ApiError::NotFound,
            // 400 covers moves the service refuses (illegal or already
            // played); both resolve the same way for the caller.
            400 | 409 => ApiError::Conflict,
            429 => ApiError::RateLimited(*hint),
            code if (500..600).contains(&code) => ApiError::Server(code),
            code => ApiError::Protocol(format!("unexpected status {}", code)),
        }
    }

    async fn open_stream(
        &self,
        path: &str,
        class: EndpointClass,
    ) -> Result<NdjsonStream, ApiError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            if let Some(wait) = self.limiter.delay_for(class) {
                tokio::time::sleep(wait).await;
            }

            let url = format!("{}{}", self.base, path);
            let result = async {
                let response = self
                    .http
                    .get(&url)
                    .bearer_auth(&self.token)
                    .send()
                    .await?;
                let status = response.status();
                if status.is_success() {
                    Ok(response)
                } else {
                    Err(Self::status_error(status, &response_hint(response).await))
                }
            }
            .await;

            match result {
                Ok(response) => {
                    self.limiter.note_success(class);
                    return Ok(NdjsonStream::from_response(response, self.watchdog));
                }
                Err(err) => {
                    if let ApiError::RateLimited(hint) = &err {
                        self.limiter.note_rate_limited(class, *hint);
                    }
                    if !self.retry.should_retry(&err, attempt, true) {
                        return Err(err);
                    }
                    warn!("Opening stream {} failed on attempt {}: {}", path, attempt, err);
                    if !matches!(err, ApiError::RateLimited(_)) {
                        tokio::time::sleep(self.retry.jittered(attempt)).await;
                    }
                }
            }
        }
    }
}

/// Pull the Retry-After hint out of a 429 before the response is dropped.
async fn response_hint(response: reqwest::Response) -> Option<Duration> {
    let hint = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    // Drain the body so the connection can be reused.
    let _ = response.bytes().await;
    hint
}
