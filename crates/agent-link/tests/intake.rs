use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use soulbrowser_agent_link::{AgentError, EnvelopeIntake};
use soulbrowser_core_types::TabId;
use soulbrowser_envelope::{
    CommandEnvelope, EnvelopeTarget, JwksCache, SignatureEncoding, SigningKey, StaticJwksSource,
    Verifier, DEFAULT_CLOCK_SKEW_MS,
};

fn intake_for(key: &SigningKey) -> EnvelopeIntake {
    let cache = JwksCache::new(
        Arc::new(StaticJwksSource::new(key.jwks())),
        Duration::from_secs(300),
    );
    EnvelopeIntake::new(Verifier::new(cache, DEFAULT_CLOCK_SKEW_MS), DEFAULT_CLOCK_SKEW_MS)
        .with_audience("browser-extension")
}

fn signed(key: &SigningKey, aud: &str) -> (CommandEnvelope, String) {
    let envelope = CommandEnvelope::issue(
        "control-server",
        aud,
        EnvelopeTarget {
            tab_id: Some(TabId(3)),
            ..Default::default()
        },
        json!({"kind": "cdp.send", "method": "Page.reload"}),
        "http://127.0.0.1:8801/control/callback",
        30_000,
    );
    let jws = key.sign(&envelope, SignatureEncoding::P1363).unwrap().jws;
    (envelope, jws)
}

#[tokio::test]
async fn second_delivery_of_a_command_is_refused() {
    let key = SigningKey::generate().unwrap();
    let intake = intake_for(&key);
    let (envelope, jws) = signed(&key, "browser-extension");

    let accepted = intake.accept(&jws).await.unwrap();
    assert_eq!(accepted.payload, envelope);

    let err = intake.accept(&jws).await.unwrap_err();
    assert!(matches!(err, AgentError::Replay { .. }));
    assert_eq!(err.code(), "REPLAY");
    assert_eq!(intake.seen_len(), 1);
}

#[tokio::test]
async fn wrong_audience_is_rejected_and_not_remembered() {
    let key = SigningKey::generate().unwrap();
    let intake = intake_for(&key);
    let (_, jws) = signed(&key, "someone-else");

    let err = intake.accept(&jws).await.unwrap_err();
    assert_eq!(err.code(), "AUDIENCE_MISMATCH");
    assert_eq!(intake.seen_len(), 0);
}

#[tokio::test]
async fn envelope_errors_pass_through_with_their_code() {
    let key = SigningKey::generate().unwrap();
    let intake = intake_for(&key);
    let (envelope, jws) = signed(&key, "browser-extension");

    let late = envelope.expires_at_ms() + DEFAULT_CLOCK_SKEW_MS as i64 + 1;
    let err = intake.accept_at(&jws, late).await.unwrap_err();
    assert_eq!(err.code(), "EXPIRED");

    let err = intake.accept("not-a-jws").await.unwrap_err();
    assert_eq!(err.code(), "MALFORMED");
}

#[tokio::test]
async fn prune_drops_ids_past_their_verification_window() {
    let key = SigningKey::generate().unwrap();
    let intake = intake_for(&key);
    let (envelope, jws) = signed(&key, "browser-extension");
    intake.accept(&jws).await.unwrap();

    assert_eq!(intake.prune(envelope.issued_at), 0);
    let after = envelope.expires_at_ms() + DEFAULT_CLOCK_SKEW_MS as i64 + 1;
    assert_eq!(intake.prune(after), 1);
    assert_eq!(intake.seen_len(), 0);
}
