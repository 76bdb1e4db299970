use anyhow::{Context, Result};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, Method, RequestBuilder, Response,
};
use serde_json::Value;
use tracing::{debug, error};

use shared_config::AppConfig;

/// Non-success PostgREST responses, carried inside `anyhow::Error` so callers
/// can `downcast_ref` to decide whether a retry makes sense.
#[derive(Debug, thiserror::Error)]
pub enum SupabaseError {
    #[error("Authentication error: {0}")]
    Unauthorized(String),
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },
}

impl SupabaseError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SupabaseError::Unauthorized(_))
    }
}

pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.trim_end_matches('/').to_string(),
            anon_key: config.supabase_anon_key.clone(),
        }
    }

    fn get_headers(&self, auth_token: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        headers.insert(
            "apikey",
            HeaderValue::from_str(&self.anon_key).context("anon key is not a valid header value")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = auth_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))
                    .context("auth token is not a valid header value")?,
            );
        }

        Ok(headers)
    }

    fn build(&self, method: Method, path: &str, auth_token: Option<&str>, body: Option<Value>) -> Result<RequestBuilder> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making request to {}", url);

        let mut req = self.client.request(method, &url).headers(self.get_headers(auth_token)?);
        if let Some(body_data) = body {
            req = req.json(&body_data);
        }
        Ok(req)
    }

    async fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response.text().await.unwrap_or_default();
        error!("API error ({}): {}", status, error_text);

        Err(match status.as_u16() {
            401 | 403 => SupabaseError::Unauthorized(error_text),
            404 => SupabaseError::NotFound(error_text),
            code => SupabaseError::Api {
                status: code,
                body: error_text,
            },
        }
        .into())
    }

    /// Inserts a row without asking PostgREST to echo it back.
    pub async fn insert(&self, table: &str, row: Value, auth_token: Option<&str>) -> Result<()> {
        let path = format!("/rest/v1/{}", table);
        let response = self
            .build(Method::POST, &path, auth_token, Some(row))?
            .header("Prefer", "return=minimal")
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    pub fn get_base_url(&self) -> &str {
        &self.base_url
    }
}
