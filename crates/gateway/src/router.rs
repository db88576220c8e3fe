//! Request routing and business logic
//!
//! The dispatch loop hands every inbound request here; handlers talk to
//! the session table, the user service and the signaling client and
//! always come back with a response envelope. Handler failures surface as
//! 4xx/5xx responses, never as faults.

use std::sync::Arc;

use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::session::{SessionError, SessionTable};
use crate::signaling::SignalingClient;
use crate::users::UserService;
use crate::wire::{RequestEnvelope, ResponseEnvelope};

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
}

pub struct Router {
    sessions: Arc<SessionTable>,
    signaling: Arc<SignalingClient>,
    users: UserService,
}

impl Router {
    pub fn new(
        sessions: Arc<SessionTable>,
        signaling: Arc<SignalingClient>,
        users: UserService,
    ) -> Self {
        Self {
            sessions,
            signaling,
            users,
        }
    }

    /// Route one request to its handler.
    pub async fn handle(&self, request: RequestEnvelope) -> ResponseEnvelope {
        tracing::debug!(method = %request.method, target = %request.target, "routing request");

        let segments: Vec<&str> = request
            .target
            .split('?')
            .next()
            .unwrap_or_default()
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        match (request.method.as_str(), segments.as_slice()) {
            ("POST", ["api", "login"]) => self.login(&request).await,
            ("POST", ["api", "meetings"]) => self.create_meeting(&request).await,
            ("GET", ["api", "meetings", room, "participants"]) => {
                let room = room.to_string();
                self.list_participants(&request, &room).await
            }
            ("GET", ["api", "health"]) => self.health(),
            _ => ResponseEnvelope::not_found(&request.target),
        }
    }

    async fn login(&self, request: &RequestEnvelope) -> ResponseEnvelope {
        let credentials: LoginRequest = match request.json() {
            Ok(body) => body,
            Err(e) => return ResponseEnvelope::bad_request(&format!("invalid login body: {}", e)),
        };

        let Some(owner) = self
            .users
            .log_in(&credentials.username, &credentials.password)
            .await
        else {
            return ResponseEnvelope::unauthorized("unknown user or wrong password");
        };

        match self.sessions.new_session(&owner) {
            Ok(token) => {
                tracing::info!(username = %owner, "login succeeded");
                ResponseEnvelope::json(StatusCode::OK, &LoginResponse { token })
            }
            Err(SessionError::CapacityExceeded) => ResponseEnvelope::error(
                StatusCode::SERVICE_UNAVAILABLE,
                "session_capacity",
                "session table is full, try again shortly",
            ),
        }
    }

    async fn create_meeting(&self, request: &RequestEnvelope) -> ResponseEnvelope {
        let owner = match self.authorize(request) {
            Ok(owner) => owner,
            Err(response) => return response,
        };

        match self.signaling.create_room().await {
            Ok(result) => {
                tracing::info!(username = %owner, "meeting created");
                ResponseEnvelope::json(StatusCode::CREATED, &result.body)
            }
            Err(e) => {
                tracing::warn!(username = %owner, error = %e, "meeting creation failed");
                ResponseEnvelope::bad_request("meeting creation failed")
            }
        }
    }

    async fn list_participants(&self, request: &RequestEnvelope, room: &str) -> ResponseEnvelope {
        if let Err(response) = self.authorize(request) {
            return response;
        }

        match self.signaling.list_participants(room).await {
            Ok(result) => ResponseEnvelope::json(StatusCode::OK, &result.body),
            Err(e) => {
                tracing::warn!(room, error = %e, "participant listing failed");
                ResponseEnvelope::bad_request("participant listing failed")
            }
        }
    }

    fn health(&self) -> ResponseEnvelope {
        ResponseEnvelope::json(
            StatusCode::OK,
            &serde_json::json!({
                "status": "ok",
                "signaling_ready": self.signaling.is_ready(),
                "active_sessions": self.sessions.session_count(),
            }),
        )
    }

    /// Bearer-token auth: validates (and refreshes) the session, then
    /// resolves the owner.
    fn authorize(&self, request: &RequestEnvelope) -> Result<String, ResponseEnvelope> {
        let token = request
            .bearer_token()
            .ok_or_else(|| ResponseEnvelope::unauthorized("missing bearer token"))?;

        if !self.sessions.validate_session(token) {
            return Err(ResponseEnvelope::unauthorized("invalid or expired session"));
        }
        self.sessions
            .get_username_by_token(token)
            .ok_or_else(|| ResponseEnvelope::unauthorized("invalid or expired session"))
    }
}
