use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::{debug, warn};

use soulbrowser_envelope::ReplyTo;

use crate::errors::AgentError;
use crate::wire::CallbackPayload;

/// Posts execution results back to the `reply` address carried by each envelope.
#[derive(Clone, Default)]
pub struct CallbackClient {
    http: reqwest::Client,
}

impl CallbackClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub async fn post(&self, reply: &ReplyTo, payload: &CallbackPayload) -> Result<(), AgentError> {
        let response = self
            .http
            .post(&reply.url)
            .header(CONTENT_TYPE, "application/json")
            .header(
                AUTHORIZATION,
                format!("Bearer {}", reply.callback_token.as_str()),
            )
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            debug!(target: "callback", command_id = %payload.command_id, "callback delivered");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        warn!(
            target: "callback",
            command_id = %payload.command_id,
            status = status.as_u16(),
            "callback rejected"
        );
        Err(AgentError::CallbackRejected {
            status: status.as_u16(),
            body,
        })
    }
}
