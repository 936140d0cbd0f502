use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use courier_proto::{DEVICE_CREDENTIAL_HEADER, LEASE_TOKEN_HEADER};

use crate::{state::AppState, store::DeviceRecord};

use super::{map_state_err, ApiError};

/// Device identity resolved from the `x-device-credential` header.
#[derive(Clone, Debug)]
pub struct DeviceAuth(pub DeviceRecord);

#[async_trait]
impl FromRequestParts<AppState> for DeviceAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let credential =
            header_value(&parts.headers, DEVICE_CREDENTIAL_HEADER).ok_or(ApiError::Unauthenticated)?;
        state
            .authenticate(&credential)
            .await
            .map(DeviceAuth)
            .map_err(map_state_err)
    }
}

/// Raw `x-lease-token` header. Validated against the device by the handler, since the
/// lease id may come from the path.
#[derive(Clone, Debug)]
pub struct LeaseToken(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for LeaseToken
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        header_value(&parts.headers, LEASE_TOKEN_HEADER)
            .map(LeaseToken)
            .ok_or(ApiError::Unauthenticated)
    }
}

impl LeaseToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}
