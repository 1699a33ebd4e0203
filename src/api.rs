//! Device-facing server contract and its HTTP client

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::chunk_wire::{self, WireChunk};
use crate::error::{AuthError, ProctorError, Result};
use crate::serve::CreateSessionResponse;
use crate::service::ProctorService;
use crate::types::{
    AnalysisSample, Calibration, CalibrationAck, DataLossRisk, JoinGrant, RecordingChunk,
    RoleConfig, SessionReport, UploadAck, Violation,
};

/// Everything a device needs from the server.
///
/// Credentials are passed explicitly; the server derives session and role from them.
#[async_trait]
pub trait ProctorApi: Send + Sync {
    async fn exchange_token(&self, token: &str) -> Result<JoinGrant>;
    async fn get_recording(&self, credential: &str) -> Result<bool>;
    async fn set_recording(&self, credential: &str, recording: bool) -> Result<bool>;
    async fn upload_chunk(&self, credential: &str, chunk: &RecordingChunk) -> Result<UploadAck>;
    async fn report_violation(&self, credential: &str, violation: &Violation) -> Result<()>;
    async fn report_analysis(&self, credential: &str, sample: &AnalysisSample) -> Result<()>;
    /// Answers with the session baseline, which may be another device's
    async fn report_calibration(
        &self,
        credential: &str,
        calibration: &Calibration,
    ) -> Result<CalibrationAck>;
    async fn report_data_loss(&self, credential: &str, risk: &DataLossRisk) -> Result<()>;
    async fn disconnect(&self, credential: &str) -> Result<()>;
    async fn end_session(&self, credential: &str) -> Result<()>;
}

/// In-process embedding: devices talk straight to the service
#[async_trait]
impl ProctorApi for ProctorService {
    async fn exchange_token(&self, token: &str) -> Result<JoinGrant> {
        ProctorService::exchange_token(self, token).await
    }

    async fn get_recording(&self, credential: &str) -> Result<bool> {
        ProctorService::get_recording(self, credential).await
    }

    async fn set_recording(&self, credential: &str, recording: bool) -> Result<bool> {
        ProctorService::set_recording(self, credential, recording).await
    }

    async fn upload_chunk(&self, credential: &str, chunk: &RecordingChunk) -> Result<UploadAck> {
        ProctorService::upload_chunk(self, credential, WireChunk::from_chunk(chunk)).await
    }

    async fn report_violation(&self, credential: &str, violation: &Violation) -> Result<()> {
        ProctorService::report_violation(self, credential, violation).await
    }

    async fn report_analysis(&self, credential: &str, sample: &AnalysisSample) -> Result<()> {
        ProctorService::report_analysis(self, credential, sample).await
    }

    async fn report_calibration(
        &self,
        credential: &str,
        calibration: &Calibration,
    ) -> Result<CalibrationAck> {
        ProctorService::report_calibration(self, credential, calibration).await
    }

    async fn report_data_loss(&self, credential: &str, risk: &DataLossRisk) -> Result<()> {
        ProctorService::report_data_loss(self, credential, risk).await
    }

    async fn disconnect(&self, credential: &str) -> Result<()> {
        ProctorService::disconnect(self, credential).await
    }

    async fn end_session(&self, credential: &str) -> Result<()> {
        ProctorService::end_session(self, credential).await
    }
}

/// JSON error body returned by the HTTP layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

impl ErrorBody {
    /// Machine-readable code for an error, mirrored by [`ErrorBody::into_error`]
    pub fn code_for(err: &ProctorError) -> &'static str {
        match err {
            ProctorError::Auth(AuthError::TokenInvalid) => "token_invalid",
            ProctorError::Auth(AuthError::TokenExpired) => "token_expired",
            ProctorError::Auth(AuthError::TokenUsed) => "token_used",
            ProctorError::Auth(AuthError::CredentialInvalid) => "credential_invalid",
            ProctorError::Auth(AuthError::RoleNotPermitted(_)) => "role_not_permitted",
            ProctorError::Auth(AuthError::SessionEnded) => "session_ended",
            ProctorError::NotFound(_) => "not_found",
            ProctorError::Conflict(_) => "conflict",
            ProctorError::InvalidInput(_) | ProctorError::Json(_) => "invalid_input",
            _ => "internal",
        }
    }

    pub fn into_error(self, status: StatusCode) -> ProctorError {
        match self.code.as_str() {
            "token_invalid" => AuthError::TokenInvalid.into(),
            "token_expired" => AuthError::TokenExpired.into(),
            "token_used" => AuthError::TokenUsed.into(),
            "credential_invalid" => AuthError::CredentialInvalid.into(),
            "role_not_permitted" => AuthError::RoleNotPermitted(self.error).into(),
            "session_ended" => AuthError::SessionEnded.into(),
            "not_found" => ProctorError::NotFound(self.error),
            "conflict" => ProctorError::Conflict(self.error),
            "invalid_input" => ProctorError::InvalidInput(self.error),
            _ => ProctorError::Server {
                status: status.as_u16(),
                message: self.error,
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

#[derive(Serialize, Deserialize)]
pub struct RecordingBody {
    pub recording: bool,
}

/// HTTP implementation of [`ProctorApi`]
#[derive(Clone)]
pub struct HttpApi {
    base_url: url::Url,
    client: Client,
}

impl HttpApi {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = url::Url::parse(base_url)
            .map_err(|e| ProctorError::Config(format!("invalid server url '{}': {}", base_url, e)))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProctorError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { base_url, client })
    }

    fn url(&self, path: &str) -> Result<url::Url> {
        self.base_url
            .join(path)
            .map_err(|e| ProctorError::Config(format!("invalid path '{}': {}", path, e)))
    }

    /// Turn a non-success response into the matching error
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => body.into_error(status),
            Err(_) => ProctorError::Server {
                status: status.as_u16(),
                message: text,
            },
        })
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
        Ok(Self::check(response).await?.json::<T>().await?)
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        credential: Option<&str>,
        body: &B,
    ) -> Result<T> {
        let mut request = self.client.post(self.url(path)?).json(body);
        if let Some(credential) = credential {
            request = request.header(AUTHORIZATION, format!("Bearer {}", credential));
        }
        Self::json(request.send().await?).await
    }

    async fn post_empty(&self, path: &str, credential: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(path)?)
            .header(AUTHORIZATION, format!("Bearer {}", credential))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Operator call: create a session
    pub async fn create_session(&self, roles: RoleConfig) -> Result<CreateSessionResponse> {
        self.post_json("/api/sessions", None, &roles).await
    }

    /// Operator call: integrity summary
    pub async fn session_report(&self, session_id: &str) -> Result<SessionReport> {
        let response = self
            .client
            .get(self.url(&format!("/api/sessions/{}/report", session_id))?)
            .send()
            .await?;
        Self::json(response).await
    }

    pub async fn list_violations(&self, session_id: &str) -> Result<Vec<Violation>> {
        let response = self
            .client
            .get(self.url(&format!("/api/sessions/{}/violations", session_id))?)
            .send()
            .await?;
        Self::json(response).await
    }
}

#[async_trait]
impl ProctorApi for HttpApi {
    async fn exchange_token(&self, token: &str) -> Result<JoinGrant> {
        self.post_json(
            "/api/join",
            None,
            &TokenRequest {
                token: token.to_string(),
            },
        )
        .await
    }

    async fn get_recording(&self, credential: &str) -> Result<bool> {
        let response = self
            .client
            .get(self.url("/api/recording")?)
            .header(AUTHORIZATION, format!("Bearer {}", credential))
            .send()
            .await?;
        Ok(Self::json::<RecordingBody>(response).await?.recording)
    }

    async fn set_recording(&self, credential: &str, recording: bool) -> Result<bool> {
        let response = self
            .client
            .put(self.url("/api/recording")?)
            .header(AUTHORIZATION, format!("Bearer {}", credential))
            .json(&RecordingBody { recording })
            .send()
            .await?;
        Ok(Self::json::<RecordingBody>(response).await?.recording)
    }

    async fn upload_chunk(&self, credential: &str, chunk: &RecordingChunk) -> Result<UploadAck> {
        let response = self
            .client
            .post(self.url("/api/chunks")?)
            .header(AUTHORIZATION, format!("Bearer {}", credential))
            .header(CONTENT_TYPE, chunk_wire::CONTENT_TYPE)
            .body(chunk_wire::encode_chunk(chunk))
            .send()
            .await?;
        Self::json(response).await
    }

    async fn report_violation(&self, credential: &str, violation: &Violation) -> Result<()> {
        self.post_json::<_, serde_json::Value>("/api/violations", Some(credential), violation)
            .await?;
        Ok(())
    }

    async fn report_analysis(&self, credential: &str, sample: &AnalysisSample) -> Result<()> {
        self.post_json::<_, serde_json::Value>("/api/analysis", Some(credential), sample)
            .await?;
        Ok(())
    }

    async fn report_calibration(
        &self,
        credential: &str,
        calibration: &Calibration,
    ) -> Result<CalibrationAck> {
        self.post_json("/api/calibration", Some(credential), calibration)
            .await
    }

    async fn report_data_loss(&self, credential: &str, risk: &DataLossRisk) -> Result<()> {
        self.post_json::<_, serde_json::Value>("/api/data-loss", Some(credential), risk)
            .await?;
        Ok(())
    }

    async fn disconnect(&self, credential: &str) -> Result<()> {
        self.post_empty("/api/disconnect", credential).await
    }

    async fn end_session(&self, credential: &str) -> Result<()> {
        self.post_empty("/api/end", credential).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_back_to_auth_errors() {
        for err in [
            AuthError::TokenInvalid,
            AuthError::TokenExpired,
            AuthError::TokenUsed,
            AuthError::CredentialInvalid,
            AuthError::SessionEnded,
        ] {
            let code = ErrorBody::code_for(&ProctorError::Auth(err.clone()));
            let body = ErrorBody {
                error: err.to_string(),
                code: code.to_string(),
            };
            match body.into_error(StatusCode::UNAUTHORIZED) {
                ProctorError::Auth(back) => assert_eq!(back, err),
                other => panic!("expected auth error, got {:?}", other),
            }
        }
    }

    #[test]
    fn unknown_code_becomes_server_error() {
        let body = ErrorBody {
            error: "boom".into(),
            code: "internal".into(),
        };
        assert!(matches!(
            body.into_error(StatusCode::INTERNAL_SERVER_ERROR),
            ProctorError::Server { status: 500, .. }
        ));
    }

    #[test]
    fn base_url_must_parse() {
        assert!(HttpApi::new("not a url").is_err());
        assert!(HttpApi::new("http://127.0.0.1:3000").is_ok());
    }
}
