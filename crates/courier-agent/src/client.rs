use async_trait::async_trait;
use courier_proto::{
    AcquireLeaseRequest, ApiErrorBody, Command, CommandResult, CompleteCommandRequest,
    HeartbeatRequest, HeartbeatResponse, LeaseGrant, PairingCompleteRequest,
    PairingCompleteResponse, ReleaseLeaseRequest, SelfRevokeRequest, DEVICE_CREDENTIAL_HEADER,
    LEASE_TOKEN_HEADER,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::{channel::PushChannel, AgentError};

/// Credential plus lease token, sent as separate headers on every leased call.
#[derive(Clone)]
pub struct LeaseAuth {
    pub credential: String,
    pub lease_id: Uuid,
    pub lease_token: String,
}

impl std::fmt::Debug for LeaseAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseAuth")
            .field("lease_id", &self.lease_id)
            .finish_non_exhaustive()
    }
}

/// Manager endpoints the agent consumes.
#[async_trait]
pub trait ManagerApi: Send + Sync {
    async fn complete_pairing(
        &self,
        request: &PairingCompleteRequest,
    ) -> Result<PairingCompleteResponse, AgentError>;
    async fn acquire_lease(
        &self,
        credential: &str,
        request: &AcquireLeaseRequest,
    ) -> Result<LeaseGrant, AgentError>;
    async fn heartbeat(
        &self,
        auth: &LeaseAuth,
        request: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, AgentError>;
    async fn release_lease(
        &self,
        auth: &LeaseAuth,
        request: &ReleaseLeaseRequest,
    ) -> Result<(), AgentError>;
    async fn self_revoke(
        &self,
        credential: &str,
        request: &SelfRevokeRequest,
    ) -> Result<(), AgentError>;
    async fn poll_commands(&self, auth: &LeaseAuth) -> Result<Vec<Command>, AgentError>;
    async fn ack_command(&self, auth: &LeaseAuth, command_id: Uuid) -> Result<(), AgentError>;
    async fn complete_command(
        &self,
        auth: &LeaseAuth,
        command_id: Uuid,
        result: &CommandResult,
    ) -> Result<(), AgentError>;
    /// Opens the push channel for a lease. Callers fall back to polling on error.
    async fn open_channel(&self, auth: &LeaseAuth) -> Result<PushChannel, AgentError>;
}

#[derive(Clone)]
pub struct ManagerClient {
    http: Client,
    base_url: String,
}

impl ManagerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: Client::new(),
            base_url,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn leased(&self, builder: RequestBuilder, auth: &LeaseAuth) -> RequestBuilder {
        builder
            .header(DEVICE_CREDENTIAL_HEADER, &auth.credential)
            .header(LEASE_TOKEN_HEADER, &auth.lease_token)
    }

    async fn json<T: DeserializeOwned>(res: Response) -> Result<T, AgentError> {
        if res.status().is_success() {
            Ok(res.json::<T>().await?)
        } else {
            Err(Self::failure(res).await)
        }
    }

    async fn empty(res: Response) -> Result<(), AgentError> {
        if res.status().is_success() {
            Ok(())
        } else {
            Err(Self::failure(res).await)
        }
    }

    async fn failure(res: Response) -> AgentError {
        let status = res.status();
        let text = res.text().await.unwrap_or_default();
        let body = serde_json::from_str::<ApiErrorBody>(&text).ok();
        classify(status, body, text)
    }
}

fn classify(status: StatusCode, body: Option<ApiErrorBody>, raw: String) -> AgentError {
    let code = body.as_ref().map(|b| b.error.clone()).unwrap_or_default();
    match (status, code.as_str()) {
        (StatusCode::UNAUTHORIZED, _) => AgentError::Unauthenticated,
        (StatusCode::GONE, _) | (_, "lease_expired") => AgentError::LeaseExpired,
        (StatusCode::CONFLICT, "lease_conflict") => AgentError::LeaseConflict {
            current_device_name: body
                .and_then(|b| b.current_device_name)
                .unwrap_or_else(|| "another device".into()),
        },
        _ => match body {
            Some(body) => AgentError::Api {
                status: status.as_u16(),
                error: body.error,
                message: body.message,
            },
            None => AgentError::Api {
                status: status.as_u16(),
                error: "unexpected_status".into(),
                message: (!raw.is_empty()).then_some(raw),
            },
        },
    }
}

#[async_trait]
impl ManagerApi for ManagerClient {
    async fn complete_pairing(
        &self,
        request: &PairingCompleteRequest,
    ) -> Result<PairingCompleteResponse, AgentError> {
        let res = self
            .http
            .post(self.url("/pairing/complete"))
            .json(request)
            .send()
            .await?;
        Self::json(res).await
    }

    async fn acquire_lease(
        &self,
        credential: &str,
        request: &AcquireLeaseRequest,
    ) -> Result<LeaseGrant, AgentError> {
        let res = self
            .http
            .post(self.url("/leases"))
            .header(DEVICE_CREDENTIAL_HEADER, credential)
            .json(request)
            .send()
            .await?;
        Self::json(res).await
    }

    async fn heartbeat(
        &self,
        auth: &LeaseAuth,
        request: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, AgentError> {
        let url = self.url(&format!("/leases/{}/heartbeat", auth.lease_id));
        let res = self
            .leased(self.http.post(url), auth)
            .json(request)
            .send()
            .await?;
        Self::json(res).await
    }

    async fn release_lease(
        &self,
        auth: &LeaseAuth,
        request: &ReleaseLeaseRequest,
    ) -> Result<(), AgentError> {
        let url = self.url(&format!("/leases/{}/release", auth.lease_id));
        let res = self
            .leased(self.http.post(url), auth)
            .json(request)
            .send()
            .await?;
        Self::empty(res).await
    }

    async fn self_revoke(
        &self,
        credential: &str,
        request: &SelfRevokeRequest,
    ) -> Result<(), AgentError> {
        let res = self
            .http
            .post(self.url("/devices/self-revoke"))
            .header(DEVICE_CREDENTIAL_HEADER, credential)
            .json(request)
            .send()
            .await?;
        Self::empty(res).await
    }

    async fn poll_commands(&self, auth: &LeaseAuth) -> Result<Vec<Command>, AgentError> {
        let res = self
            .leased(self.http.get(self.url("/commands/pending")), auth)
            .send()
            .await?;
        Self::json(res).await
    }

    async fn ack_command(&self, auth: &LeaseAuth, command_id: Uuid) -> Result<(), AgentError> {
        let url = self.url(&format!("/commands/{command_id}/ack"));
        let res = self.leased(self.http.post(url), auth).send().await?;
        Self::empty(res).await
    }

    async fn complete_command(
        &self,
        auth: &LeaseAuth,
        command_id: Uuid,
        result: &CommandResult,
    ) -> Result<(), AgentError> {
        let url = self.url(&format!("/commands/{command_id}/complete"));
        let res = self
            .leased(self.http.post(url), auth)
            .json(&CompleteCommandRequest {
                result: result.clone(),
            })
            .send()
            .await?;
        Self::empty(res).await
    }

    async fn open_channel(&self, auth: &LeaseAuth) -> Result<PushChannel, AgentError> {
        PushChannel::connect(&self.base_url, auth).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(error: &str, holder: Option<&str>) -> Option<ApiErrorBody> {
        Some(ApiErrorBody {
            error: error.into(),
            message: None,
            current_device_name: holder.map(str::to_string),
        })
    }

    #[test]
    fn maps_protocol_errors() {
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, body("unauthenticated", None), String::new()),
            AgentError::Unauthenticated
        ));
        assert!(matches!(
            classify(StatusCode::GONE, body("lease_expired", None), String::new()),
            AgentError::LeaseExpired
        ));
        match classify(
            StatusCode::CONFLICT,
            body("lease_conflict", Some("front desk")),
            String::new(),
        ) {
            AgentError::LeaseConflict {
                current_device_name,
            } => assert_eq!(current_device_name, "front desk"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            classify(StatusCode::CONFLICT, body("no_active_lease", None), String::new()),
            AgentError::Api { status: 409, .. }
        ));
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY, None, "upstream".into()),
            AgentError::Api { status: 502, .. }
        ));
    }

    #[test]
    fn trims_trailing_slash() {
        let client = ManagerClient::new("http://localhost:8080/");
        assert_eq!(client.url("/leases"), "http://localhost:8080/leases");
    }
}
