//! Typed calls against the judging service.

use crate::error::{self, ClientError, SchemaValidationError};
use crate::model::{
    NewSubmission, PageMeta, Problem, SessionUser, StatusLog, Submission, SubmissionFilter,
    SubmissionPage,
};
use crate::transport::{path_segment, ApiClient, ApiRequest, TokenPair};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

/// Authoritative lookup of a single job, the one thing the synchronizer
/// needs from the service.
#[async_trait]
pub trait SubmissionFetcher: Send + Sync {
    async fn fetch(&self, job_id: &str) -> Result<Submission, ClientError>;
}

#[derive(Deserialize)]
struct LoginBody {
    user: SessionUser,
    tokens: TokenPair,
}

#[derive(Clone)]
pub struct JudgeApi {
    client: ApiClient,
}

impl JudgeApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<SessionUser, ClientError> {
        let body: LoginBody = self
            .client
            .request(
                ApiRequest::post(
                    "/auth/login",
                    json!({ "username": username, "password": password }),
                )
                .without_auth(),
            )
            .await?;
        self.client.credentials().set(body.tokens.into_credential(None));
        info!(user = %body.user.username, "signed in");
        Ok(body.user)
    }

    pub fn logout(&self) {
        self.client.credentials().clear();
        info!("signed out");
    }

    pub async fn get_submission(&self, id: &str) -> Result<Submission, ClientError> {
        self.client
            .get(format!("/submissions/{}", path_segment(id)))
            .await
    }

    pub async fn list_submissions(
        &self,
        filter: &SubmissionFilter,
    ) -> Result<SubmissionPage, ClientError> {
        let payload = self
            .client
            .request_payload(ApiRequest::get(format!(
                "/submissions{}",
                filter.query_string()
            )))
            .await?;
        // Some deployments nest the page inside `data`.
        let (items, meta) = match payload.data {
            Value::Object(mut page) if page.contains_key("data") => (
                page.remove("data").unwrap_or(Value::Null),
                page.remove("meta").or(payload.meta),
            ),
            items => (items, payload.meta),
        };
        let meta = match meta.filter(|m| !m.is_null()) {
            Some(meta) => Some(decode_meta(meta)?),
            None => None,
        };
        Ok(SubmissionPage {
            items: error::decode_list(items)?,
            meta,
        })
    }

    pub async fn create_submission(&self, input: &NewSubmission) -> Result<Submission, ClientError> {
        let body = serde_json::to_value(input)
            .map_err(|err| SchemaValidationError::at("$", err.to_string()))?;
        let created: Submission = self.client.post("/submissions", body).await?;
        info!(job_id = %created.id, "submission created");
        Ok(created)
    }

    pub async fn status_logs(&self, id: &str) -> Result<Vec<StatusLog>, ClientError> {
        let value = self
            .client
            .request_value(ApiRequest::get(format!("/submissions/{}/logs", path_segment(id))))
            .await?;
        Ok(error::decode_list(value)?)
    }

    pub async fn list_problems(&self) -> Result<Vec<Problem>, ClientError> {
        let value = self.client.request_value(ApiRequest::get("/problems")).await?;
        Ok(error::decode_list(value)?)
    }

    pub async fn get_problem(&self, id: &str) -> Result<Problem, ClientError> {
        self.client.get(format!("/problems/{}", path_segment(id))).await
    }
}

#[async_trait]
impl SubmissionFetcher for JudgeApi {
    async fn fetch(&self, job_id: &str) -> Result<Submission, ClientError> {
        self.get_submission(job_id).await
    }
}

fn decode_meta(meta: Value) -> Result<PageMeta, SchemaValidationError> {
    serde_json::from_value(meta).map_err(|err| SchemaValidationError::at("$.meta", err.to_string()))
}
