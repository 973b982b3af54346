//! Challenge/response authentication
//!
//! Runs on a freshly opened socket before the client accepts requests:
//!
//! ```text
//! cached, unexpired token:   auth_verify{jwt} ──────────────▶ success
//!
//! otherwise:                 auth_request ──▶ auth_challenge
//!                            auth_verify{challenge} + EIP-712 sig ──▶ success
//! ```
//!
//! Every request is signed by the session key. The policy binding the
//! challenge to that session key is signed by the wallet.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use ew_core::config::WalletConfig;
use ew_core::time::{current_time_millis, current_time_secs, expiry_after, MonotonicIds};
use ew_core::typed_data::{AuthPolicy, PolicyAllowance, TypedData};
use ew_core::{Address, Signer};
use ew_protocol::message::{
    AllowanceParam, AuthChallenge, AuthRequestParams, AuthVerifyResult, ChallengeVerifyParams,
    TokenVerifyParams,
};
use ew_protocol::{InboundFrame, RequestFrame, RpcMethod, RpcResponse};

use crate::client::sign_request;
use crate::error::{AuthError, TransportError};
use crate::transport::{Socket, SocketEvent};

/// Store key of the cached token
pub const AUTH_TOKEN_KEY: &str = "auth_token";

/// What to authenticate as; reused verbatim by every reconnect attempt
#[derive(Clone)]
pub struct AuthParams {
    /// Primary identity; signs the EIP-712 policy
    pub wallet: Arc<dyn Signer>,
    /// Application identity bound into the policy
    pub application: Address,
    pub app_name: String,
    pub scope: String,
    /// EIP-712 domain name
    pub domain_name: String,
    /// Requested authorization lifetime
    pub ttl: Duration,
    pub allowances: Vec<AllowanceParam>,
}

impl AuthParams {
    /// Build from configuration and a wallet signer
    pub fn from_config(config: &WalletConfig, wallet: Arc<dyn Signer>) -> Self {
        Self {
            wallet,
            application: config.application,
            app_name: config.app_name.clone(),
            scope: config.scope.clone(),
            domain_name: config.domain_name.clone(),
            ttl: config.auth_ttl,
            allowances: config
                .allowances
                .iter()
                .map(|a| AllowanceParam {
                    asset: a.asset.clone(),
                    amount: a.amount.clone(),
                })
                .collect(),
        }
    }
}

impl fmt::Debug for AuthParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthParams")
            .field("wallet", &self.wallet.address())
            .field("application", &self.application)
            .field("app_name", &self.app_name)
            .field("scope", &self.scope)
            .field("domain_name", &self.domain_name)
            .field("ttl", &self.ttl)
            .field("allowances", &self.allowances)
            .finish()
    }
}

/// A reusable token issued by the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
    /// Unix seconds
    pub expires_at: u64,
}

impl AuthToken {
    /// Whether the token is still usable at `now` (unix seconds)
    pub fn is_valid_at(&self, now: u64) -> bool {
        !self.token.is_empty() && self.expires_at > now
    }
}

/// Result of a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    /// Token to cache for the next connect, if the node issued one
    pub token: Option<AuthToken>,
    /// Whether the fast path was taken
    pub used_cached_token: bool,
}

/// Drives the handshake on one socket
#[derive(Clone)]
pub struct AuthNegotiator {
    /// Session key; signs every request frame
    session: Arc<dyn Signer>,
    ids: Arc<MonotonicIds>,
    /// Deadline for each round-trip
    timeout: Duration,
}

impl AuthNegotiator {
    pub fn new(session: Arc<dyn Signer>, ids: Arc<MonotonicIds>, timeout: Duration) -> Self {
        Self {
            session,
            ids,
            timeout,
        }
    }

    /// Authenticate, preferring `cached` when it is unexpired
    pub async fn negotiate(
        &self,
        socket: &mut Socket,
        params: &AuthParams,
        cached: Option<&AuthToken>,
    ) -> Result<AuthOutcome, AuthError> {
        match cached.filter(|t| t.is_valid_at(current_time_secs())) {
            Some(token) => self.verify_token(socket, token).await,
            None => self.challenge_response(socket, params).await,
        }
    }

    async fn verify_token(
        &self,
        socket: &mut Socket,
        token: &AuthToken,
    ) -> Result<AuthOutcome, AuthError> {
        tracing::debug!("Authenticating with cached token");
        let params = TokenVerifyParams {
            jwt: token.token.clone(),
        };
        let id = self
            .send(socket, RpcMethod::AuthVerify, serde_json::to_value(params).map_err(codec)?)
            .await?;
        let response = self.await_reply(socket, id).await?;
        let result = verify_result(&response)?;

        let token = match result.jwt_token {
            Some(jwt) if !jwt.is_empty() => AuthToken {
                token: jwt,
                expires_at: token.expires_at,
            },
            _ => token.clone(),
        };

        Ok(AuthOutcome {
            token: Some(token),
            used_cached_token: true,
        })
    }

    async fn challenge_response(
        &self,
        socket: &mut Socket,
        params: &AuthParams,
    ) -> Result<AuthOutcome, AuthError> {
        let wallet = params.wallet.address();
        let participant = self.session.address();
        let expire = expiry_after(params.ttl);

        tracing::debug!(%wallet, %participant, "Requesting auth challenge");
        let request = AuthRequestParams {
            address: wallet.to_hex(),
            session_key: participant.to_hex(),
            app_name: params.app_name.clone(),
            application: params.application.to_hex(),
            allowances: params.allowances.clone(),
            expire,
            scope: params.scope.clone(),
        };
        let id = self
            .send(socket, RpcMethod::AuthRequest, serde_json::to_value(request).map_err(codec)?)
            .await?;

        let reply = self.await_reply(socket, id).await?;
        if reply.rpc_method() != Some(RpcMethod::AuthChallenge) {
            return Err(AuthError::Malformed(format!(
                "expected auth_challenge, got {}",
                reply.method
            )));
        }
        let challenge: AuthChallenge = reply.first()?;

        let typed = TypedData::new(
            params.domain_name.clone(),
            AuthPolicy {
                challenge: challenge.challenge_message.clone(),
                scope: params.scope.clone(),
                wallet,
                application: params.application,
                participant,
                expire,
                allowances: params
                    .allowances
                    .iter()
                    .map(|a| PolicyAllowance {
                        asset: a.asset.clone(),
                        amount: a.amount.clone(),
                    })
                    .collect(),
            },
        );
        let policy_signature = params.wallet.sign_typed_data(&typed).await?;

        let verify = ChallengeVerifyParams {
            challenge: challenge.challenge_message,
        };
        let frame = RequestFrame::new(
            self.ids.next_id(),
            RpcMethod::AuthVerify,
            vec![serde_json::to_value(verify).map_err(codec)?],
            current_time_millis(),
        )
        .with_signature(policy_signature.to_hex());
        let id = frame.id;
        socket.send_text(frame.encode()?)?;

        let response = self.await_reply(socket, id).await?;
        let result = verify_result(&response)?;

        Ok(AuthOutcome {
            token: result
                .jwt_token
                .filter(|jwt| !jwt.is_empty())
                .map(|token| AuthToken {
                    token,
                    expires_at: expire,
                }),
            used_cached_token: false,
        })
    }

    /// Sign with the session key and write one request
    async fn send(
        &self,
        socket: &Socket,
        method: RpcMethod,
        params: serde_json::Value,
    ) -> Result<u64, AuthError> {
        let frame = RequestFrame::new(self.ids.next_id(), method, vec![params], current_time_millis());
        let frame = sign_request(self.session.as_ref(), frame).await?;
        socket.send_text(frame.encode()?)?;
        Ok(frame.id)
    }

    /// Wait for the answer to `id`, skipping unrelated frames
    async fn await_reply(&self, socket: &mut Socket, id: u64) -> Result<RpcResponse, AuthError> {
        let deadline = Instant::now() + self.timeout;

        loop {
            let event = tokio::time::timeout_at(deadline, socket.recv())
                .await
                .map_err(|_| AuthError::Timeout)?;

            let text = match event {
                Some(SocketEvent::Text(text)) => text,
                Some(SocketEvent::Closed(reason)) => {
                    return Err(TransportError::Closed(reason).into())
                }
                None => return Err(TransportError::Closed(None).into()),
            };

            let frame = match InboundFrame::decode(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("Dropping malformed frame during auth: {}", e);
                    continue;
                }
            };

            match frame {
                InboundFrame::Response(res) if res.rpc_method() == Some(RpcMethod::AuthFailure) => {
                    return Err(AuthError::Rejected(failure_reason(&res.result)));
                }
                InboundFrame::Response(res) if res.id == id => return Ok(res),
                InboundFrame::Error(err) if err.id == id => {
                    return Err(AuthError::Protocol {
                        code: err.code,
                        message: err.message,
                    });
                }
                InboundFrame::Push(push) if push.rpc_method() == Some(RpcMethod::AuthFailure) => {
                    let reason = match &push.payload {
                        serde_json::Value::Array(items) => failure_reason(items),
                        other => other.to_string(),
                    };
                    return Err(AuthError::Rejected(reason));
                }
                other => {
                    tracing::debug!("Ignoring frame during auth: {:?}", other.request_id());
                }
            }
        }
    }
}

fn verify_result(response: &RpcResponse) -> Result<AuthVerifyResult, AuthError> {
    let result: AuthVerifyResult = response.first()?;
    if !result.success {
        return Err(AuthError::Rejected("auth_verify unsuccessful".into()));
    }
    Ok(result)
}

fn failure_reason(result: &[serde_json::Value]) -> String {
    result
        .first()
        .and_then(|v| v.get("error").or(Some(v)))
        .map(|v| match v.as_str() {
            Some(s) => s.to_string(),
            None => v.to_string(),
        })
        .unwrap_or_else(|| "auth_failure".into())
}

fn codec(e: serde_json::Error) -> AuthError {
    AuthError::Malformed(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ew_core::keys::{keccak256, recover_address};
    use ew_core::KeyManager;
    use ew_protocol::encode_response;
    use ew_protocol::PUSH_REQUEST_ID;
    use serde_json::json;

    use crate::transport::{Outbound, SocketPeer};

    fn params(wallet: &KeyManager) -> AuthParams {
        AuthParams {
            wallet: wallet.signer(),
            application: Address::from_bytes([0xaa; 20]),
            app_name: "event-wallet".into(),
            scope: "app.event-wallet".into(),
            domain_name: "event-wallet".into(),
            ttl: Duration::from_secs(3600),
            allowances: vec![AllowanceParam {
                asset: "usdc".into(),
                amount: "100".into(),
            }],
        }
    }

    fn negotiator(session: &KeyManager) -> AuthNegotiator {
        AuthNegotiator::new(
            session.signer(),
            Arc::new(MonotonicIds::new()),
            Duration::from_secs(5),
        )
    }

    async fn next_request(peer: &mut SocketPeer) -> RequestFrame {
        match peer.recv().await {
            Some(Outbound::Text(text)) => RequestFrame::decode(&text).unwrap(),
            other => panic!("expected a request, got {:?}", other),
        }
    }

    #[test]
    fn test_token_validity() {
        let token = AuthToken {
            token: "jwt".into(),
            expires_at: 100,
        };
        assert!(token.is_valid_at(99));
        assert!(!token.is_valid_at(100));
        assert!(!AuthToken {
            token: String::new(),
            expires_at: 100
        }
        .is_valid_at(0));
    }

    #[tokio::test]
    async fn test_challenge_response_signatures() {
        let wallet = KeyManager::generate();
        let session = KeyManager::generate();
        let (mut socket, mut peer) = Socket::pair();
        let auth = negotiator(&session);
        let params = params(&wallet);

        let node = tokio::spawn(async move {
            let request = next_request(&mut peer).await;
            assert_eq!(request.method, "auth_request");
            let signed = keccak256(&request.canonical_bytes().unwrap());
            let sig = request.signatures()[0].parse().unwrap();
            assert_eq!(recover_address(&signed, &sig).unwrap(), session.address());

            let body: AuthRequestParams = request.first_param().unwrap();
            peer.send_text(encode_response(
                request.id,
                "auth_challenge",
                vec![json!({"challenge_message": "c-42"})],
                1,
            ))
            .await;

            let verify = next_request(&mut peer).await;
            assert_eq!(verify.method, "auth_verify");
            let typed = TypedData::new(
                "event-wallet",
                AuthPolicy {
                    challenge: "c-42".into(),
                    scope: body.scope,
                    wallet: body.address.parse().unwrap(),
                    application: body.application.parse().unwrap(),
                    participant: body.session_key.parse().unwrap(),
                    expire: body.expire,
                    allowances: vec![PolicyAllowance {
                        asset: "usdc".into(),
                        amount: "100".into(),
                    }],
                },
            );
            let sig = verify.signatures()[0].parse().unwrap();
            let signer = recover_address(&typed.digest().unwrap(), &sig).unwrap();

            peer.send_text(encode_response(
                verify.id,
                "auth_verify",
                vec![json!({"success": true, "jwt_token": "jwt-1"})],
                2,
            ))
            .await;
            (signer, peer)
        });

        let outcome = auth.negotiate(&mut socket, &params, None).await.unwrap();
        let (signer, _peer) = node.await.unwrap();

        assert_eq!(signer, wallet.address());
        assert!(!outcome.used_cached_token);
        assert_eq!(outcome.token.unwrap().token, "jwt-1");
    }

    #[tokio::test]
    async fn test_expired_token_takes_full_path() {
        let wallet = KeyManager::generate();
        let session = KeyManager::generate();
        let (mut socket, mut peer) = Socket::pair();
        let auth = negotiator(&session);
        let params = params(&wallet);
        let expired = AuthToken {
            token: "old".into(),
            expires_at: 1,
        };

        let node = tokio::spawn(async move {
            let request = next_request(&mut peer).await;
            peer.send_text(ew_protocol::encode_error(request.id, "denied", "no", 1))
                .await;
            request.method
        });

        let err = auth
            .negotiate(&mut socket, &params, Some(&expired))
            .await
            .unwrap_err();
        assert_eq!(node.await.unwrap(), "auth_request");
        assert!(matches!(err, AuthError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_auth_failure_push_rejects() {
        let wallet = KeyManager::generate();
        let session = KeyManager::generate();
        let (mut socket, mut peer) = Socket::pair();
        let auth = negotiator(&session);

        let node = tokio::spawn(async move {
            let _ = next_request(&mut peer).await;
            peer.send_text(encode_response(
                PUSH_REQUEST_ID,
                "auth_failure",
                vec![json!({"error": "bad signature"})],
                1,
            ))
            .await;
            peer
        });

        let err = auth
            .negotiate(&mut socket, &params(&wallet), None)
            .await
            .unwrap_err();
        let _peer = node.await.unwrap();
        assert!(matches!(err, AuthError::Rejected(reason) if reason == "bad signature"));
    }

    #[tokio::test]
    async fn test_closed_socket_maps_to_auth_error() {
        let wallet = KeyManager::generate();
        let session = KeyManager::generate();
        let (mut socket, peer) = Socket::pair();
        peer.close(Some("going away".into())).await;

        let err = negotiator(&session)
            .negotiate(&mut socket, &params(&wallet), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::Transport(TransportError::Closed(Some(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_node_times_out() {
        let wallet = KeyManager::generate();
        let session = KeyManager::generate();
        let (mut socket, _peer) = Socket::pair();

        let err = negotiator(&session)
            .negotiate(&mut socket, &params(&wallet), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Timeout));
    }
}
