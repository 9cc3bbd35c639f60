//! Challenge-response authentication.
//!
//! ```text
//! Idle -> ChallengeRequested -> ChallengeReceived -> Signed -> Authenticated
//!   \________________________________________________________-> Failed
//! ```
//!
//! A handshake is single use. Reconnecting starts a new one from `Idle`.

use crate::correlator::Correlator;
use crate::error::{ClientError, Result};
use crate::signer::{AuthPolicy, SignError, SignRequest, Signer};
use nitrobet_core::message::{Allowance, AuthRequestParams, AuthVerifyParams, method};
use nitrobet_core::{Address, ServerMessage};
use std::time::Duration;

/// Established authentication with the clearnode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub address: Address,
    pub session_key: Address,
    /// Bearer token, if the clearnode issued one.
    pub token: Option<String>,
    /// Unix seconds.
    pub issued_at: u64,
    /// Unix seconds.
    pub expires_at: u64,
}

impl AuthSession {
    pub fn is_expired_at(&self, unix_secs: u64) -> bool {
        unix_secs >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(nitrobet_core::now_millis() / 1000)
    }
}

/// Why a handshake ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    Timeout,
    SignatureDenied(String),
    AuthRejected(String),
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    ChallengeRequested,
    ChallengeReceived { challenge: String },
    Signed,
    Authenticated(AuthSession),
    Failed(AuthFailure),
}

/// Session parameters requested during authentication.
#[derive(Debug, Clone)]
pub struct AuthParams {
    pub address: Address,
    pub session_key: Address,
    pub application: String,
    pub scope: String,
    pub duration_secs: u64,
    pub allowances: Vec<Allowance>,
}

#[derive(Debug)]
pub struct AuthHandshake {
    state: AuthState,
}

impl Default for AuthHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthHandshake {
    pub fn new() -> Self {
        Self {
            state: AuthState::Idle,
        }
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub fn session(&self) -> Option<&AuthSession> {
        match &self.state {
            AuthState::Authenticated(session) => Some(session),
            _ => None,
        }
    }

    fn transition(&mut self, next: AuthState) {
        tracing::debug!(from = ?self.state, to = ?next, "auth transition");
        self.state = next;
    }

    fn fail(&mut self, failure: AuthFailure, err: ClientError) -> ClientError {
        tracing::warn!(?failure, "authentication failed");
        self.transition(AuthState::Failed(failure));
        err
    }

    /// Drive the handshake to completion.
    pub async fn run(
        &mut self,
        correlator: &Correlator,
        signer: &dyn Signer,
        params: &AuthParams,
        timeout: Duration,
    ) -> Result<AuthSession> {
        if self.state != AuthState::Idle {
            return Err(ClientError::invalid_state("authenticate", &self.state));
        }

        let issued_at = nitrobet_core::now_millis() / 1000;
        let request = AuthRequestParams {
            address: params.address.clone(),
            session_key: params.session_key.clone(),
            application: params.application.clone(),
            scope: params.scope.clone(),
            expires_at: issued_at + params.duration_secs,
            allowances: params.allowances.clone(),
        };

        self.transition(AuthState::ChallengeRequested);
        let challenge = match correlator.request(method::AUTH_REQUEST, &request, timeout).await {
            Ok(ServerMessage::AuthChallenge(c)) => c.challenge_message,
            Ok(other) => {
                let reason = format!("expected auth_challenge, got {other:?}");
                return Err(self.fail(
                    AuthFailure::AuthRejected(reason.clone()),
                    ClientError::AuthRejected(reason),
                ));
            }
            Err(e) => return Err(self.fail_on(e)),
        };
        self.transition(AuthState::ChallengeReceived {
            challenge: challenge.clone(),
        });

        let policy = AuthPolicy {
            challenge: challenge.clone(),
            scope: request.scope.clone(),
            wallet: request.address.clone(),
            session_key: request.session_key.clone(),
            application: request.application.clone(),
            expires_at: request.expires_at,
            allowances: request.allowances.clone(),
        };
        let signature = match signer.sign(&SignRequest::Auth(policy)).await {
            Ok(sig) => sig,
            Err(e) => {
                let reason = match e {
                    SignError::Rejected => "challenge signature rejected".to_string(),
                    SignError::Failed(msg) => msg,
                };
                return Err(self.fail(
                    AuthFailure::SignatureDenied(reason.clone()),
                    ClientError::SignatureDenied(reason),
                ));
            }
        };
        self.transition(AuthState::Signed);

        let verify = AuthVerifyParams { challenge };
        let reply = correlator
            .request_with_sig(method::AUTH_VERIFY, &verify, vec![signature.0], timeout)
            .await;
        let now_secs = nitrobet_core::now_millis() / 1000;
        match reply {
            Ok(ServerMessage::AuthVerify(result)) if result.success && result.expires_at <= now_secs => {
                let reason = format!("session already expired at {}", result.expires_at);
                Err(self.fail(
                    AuthFailure::AuthRejected(reason.clone()),
                    ClientError::AuthRejected(reason),
                ))
            }
            Ok(ServerMessage::AuthVerify(result)) if result.success && result.address == params.address => {
                let session = AuthSession {
                    address: result.address,
                    session_key: result.session_key,
                    token: result.jwt_token,
                    issued_at,
                    expires_at: result.expires_at,
                };
                tracing::info!(address = %session.address, expires_at = session.expires_at, "authenticated");
                self.transition(AuthState::Authenticated(session.clone()));
                Ok(session)
            }
            Ok(other) => {
                let reason = format!("verification refused: {other:?}");
                Err(self.fail(
                    AuthFailure::AuthRejected(reason.clone()),
                    ClientError::AuthRejected(reason),
                ))
            }
            Err(e) => Err(self.fail_on(e)),
        }
    }

    fn fail_on(&mut self, err: ClientError) -> ClientError {
        match err {
            ClientError::Timeout { .. } => self.fail(AuthFailure::Timeout, err),
            ClientError::NotConnected => self.fail(AuthFailure::Disconnected, err),
            ClientError::SignatureDenied(ref reason) => {
                let reason = reason.clone();
                self.fail(AuthFailure::SignatureDenied(reason), err)
            }
            ClientError::Remote { ref message, .. } => {
                let message = message.clone();
                self.fail(
                    AuthFailure::AuthRejected(message.clone()),
                    ClientError::AuthRejected(message),
                )
            }
            other => {
                let reason = other.to_string();
                self.fail(AuthFailure::AuthRejected(reason.clone()), ClientError::AuthRejected(reason))
            }
        }
    }
}
