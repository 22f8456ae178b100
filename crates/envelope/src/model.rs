use serde::{Deserialize, Serialize};
use serde_json::Value;

use soulbrowser_core_types::{
    now_ms, CallbackToken, ClientId, CommandId, TabId, TraceId,
};

pub const ALG_ES256: &str = "ES256";

/// Envelopes never live shorter than this, whatever the caller asks for.
pub const MIN_TTL_MS: u64 = 1_000;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JwsHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyTo {
    pub url: String,
    pub callback_token: CallbackToken,
}

/// Payload of a signed command. `op` is opaque to the bus.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub iss: String,
    pub aud: String,
    pub command_id: CommandId,
    pub trace_id: TraceId,
    pub issued_at: i64,
    pub ttl_ms: u64,
    pub target: EnvelopeTarget,
    pub op: Value,
    pub reply: ReplyTo,
}

impl CommandEnvelope {
    /// Mint a fresh envelope with new command id, trace id and callback token.
    pub fn issue(
        iss: impl Into<String>,
        aud: impl Into<String>,
        target: EnvelopeTarget,
        op: Value,
        reply_url: impl Into<String>,
        ttl_ms: u64,
    ) -> Self {
        Self {
            iss: iss.into(),
            aud: aud.into(),
            command_id: CommandId::issue(),
            trace_id: TraceId::issue(),
            issued_at: now_ms(),
            ttl_ms: ttl_ms.max(MIN_TTL_MS),
            target,
            op,
            reply: ReplyTo {
                url: reply_url.into(),
                callback_token: CallbackToken::issue(),
            },
        }
    }

    pub fn with_trace(mut self, trace_id: TraceId) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn expires_at_ms(&self) -> i64 {
        self.issued_at
            .saturating_add(i64::try_from(self.ttl_ms).unwrap_or(i64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn issue_floors_ttl_and_serialises_camel_case() {
        let env = CommandEnvelope::issue(
            "control-server",
            "browser-extension",
            EnvelopeTarget {
                tab_id: Some(TabId(7)),
                ..Default::default()
            },
            json!({"method": "Page.navigate", "params": {"url": "https://example.com"}}),
            "http://127.0.0.1:8801/control/callback",
            10,
        );
        assert_eq!(env.ttl_ms, MIN_TTL_MS);
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["target"], json!({"tabId": 7}));
        assert!(value["commandId"].as_str().unwrap().starts_with("cmd_"));
        assert!(value["reply"]["callbackToken"]
            .as_str()
            .unwrap()
            .starts_with("ct_"));
        assert_eq!(env.expires_at_ms(), env.issued_at + 1_000);
    }

    #[test]
    fn huge_ttl_saturates_instead_of_expiring() {
        let mut env = CommandEnvelope::issue(
            "control-server",
            "browser-extension",
            EnvelopeTarget::default(),
            json!({"method": "Page.reload"}),
            "http://127.0.0.1:8801/control/callback",
            30_000,
        );
        env.ttl_ms = u64::MAX;
        assert_eq!(env.expires_at_ms(), i64::MAX);
        env.ttl_ms = i64::MAX as u64 + 1;
        assert_eq!(env.expires_at_ms(), i64::MAX);
    }
}
