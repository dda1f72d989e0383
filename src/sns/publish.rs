//! Notification envelopes, the signature stub, and per-subscription
//! delivery to queue sinks and http(s) endpoints.

use std::collections::HashMap;

use base64::Engine;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use sha1::{Digest, Sha1};
use tracing::{info, warn};

use super::error::SnsError;
use super::topic::Subscription;
use super::types::MessageAttributeValue;
use crate::sqs::state::SqsState;
use crate::sqs::types::MessageAttributeValue as QueueAttributeValue;

pub const SIGNING_CERT_PATH: &str = "/SimpleNotificationService/local.pem";

/// Placeholder certificate served for API parity only; consumers are
/// expected to disable signature verification against this emulator.
pub const STUB_CERT_PEM: &str = "-----BEGIN CERTIFICATE-----\n\
MIIBLocalEmulatorStubCertificateNotForVerificationUseAAAAAAAAAAAA\n\
-----END CERTIFICATE-----\n";

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "Type")]
    pub message_type: String,
    #[serde(rename = "MessageId")]
    pub message_id: String,
    #[serde(rename = "TopicArn")]
    pub topic_arn: String,
    #[serde(rename = "Subject", skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "SignatureVersion")]
    pub signature_version: String,
    #[serde(rename = "Signature")]
    pub signature: String,
    #[serde(rename = "SigningCertURL")]
    pub signing_cert_url: String,
    #[serde(rename = "UnsubscribeURL")]
    pub unsubscribe_url: String,
    #[serde(rename = "SubscribeURL", skip_serializing_if = "Option::is_none")]
    pub subscribe_url: Option<String>,
    #[serde(rename = "Token", skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(rename = "MessageAttributes", skip_serializing_if = "Option::is_none")]
    pub message_attributes: Option<HashMap<String, EnvelopeAttribute>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeAttribute {
    #[serde(rename = "Type")]
    pub data_type: String,
    #[serde(rename = "Value")]
    pub value: String,
}

pub fn rfc3339_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Alternating name/value lines in the fixed field order, one per line.
fn canonical_string(pairs: &[(&str, &str)]) -> String {
    let mut out = String::new();
    for (name, value) in pairs {
        out.push_str(name);
        out.push('\n');
        out.push_str(value);
        out.push('\n');
    }
    out
}

pub fn canonical_notification(
    message: &str,
    message_id: &str,
    subject: Option<&str>,
    timestamp: &str,
    topic_arn: &str,
) -> String {
    match subject {
        Some(subject) => canonical_string(&[
            ("Message", message),
            ("MessageId", message_id),
            ("Subject", subject),
            ("Timestamp", timestamp),
            ("TopicArn", topic_arn),
            ("Type", "Notification"),
        ]),
        None => canonical_string(&[
            ("Message", message),
            ("MessageId", message_id),
            ("Timestamp", timestamp),
            ("TopicArn", topic_arn),
            ("Type", "Notification"),
        ]),
    }
}

pub fn canonical_confirmation(
    message: &str,
    message_id: &str,
    subscribe_url: &str,
    timestamp: &str,
    token: &str,
    topic_arn: &str,
    message_type: &str,
) -> String {
    canonical_string(&[
        ("Message", message),
        ("MessageId", message_id),
        ("SubscribeURL", subscribe_url),
        ("Timestamp", timestamp),
        ("Token", token),
        ("TopicArn", topic_arn),
        ("Type", message_type),
    ])
}

/// Signature stub: base64 over the SHA-1 digest of the canonical string.
/// API shape only; there is no verifiable key behind it.
pub fn sign(canonical: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(canonical.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

fn envelope_attributes(
    attributes: &HashMap<String, MessageAttributeValue>,
) -> Option<HashMap<String, EnvelopeAttribute>> {
    if attributes.is_empty() {
        return None;
    }
    Some(
        attributes
            .iter()
            .map(|(name, attr)| {
                let value = attr
                    .string_value
                    .clone()
                    .or_else(|| attr.binary_value.clone())
                    .unwrap_or_default();
                (
                    name.clone(),
                    EnvelopeAttribute {
                        data_type: attr.data_type.clone(),
                        value,
                    },
                )
            })
            .collect(),
    )
}

fn queue_attributes(
    attributes: &HashMap<String, MessageAttributeValue>,
) -> HashMap<String, QueueAttributeValue> {
    attributes
        .iter()
        .map(|(name, attr)| {
            (
                name.clone(),
                QueueAttributeValue {
                    data_type: attr.data_type.clone(),
                    string_value: attr.string_value.clone(),
                    binary_value: attr.binary_value.clone(),
                },
            )
        })
        .collect()
}

pub fn build_notification(
    base_url: &str,
    message_id: &str,
    topic_arn: &str,
    subscription_arn: &str,
    subject: Option<&str>,
    message: &str,
    attributes: &HashMap<String, MessageAttributeValue>,
) -> Envelope {
    let timestamp = rfc3339_now();
    let signature = sign(&canonical_notification(
        message, message_id, subject, &timestamp, topic_arn,
    ));
    Envelope {
        message_type: "Notification".to_string(),
        message_id: message_id.to_string(),
        topic_arn: topic_arn.to_string(),
        subject: subject.map(str::to_string),
        message: message.to_string(),
        timestamp,
        signature_version: "1".to_string(),
        signature,
        signing_cert_url: format!("{base_url}{SIGNING_CERT_PATH}"),
        unsubscribe_url: format!(
            "{base_url}/?Action=Unsubscribe&SubscriptionArn={subscription_arn}"
        ),
        subscribe_url: None,
        token: None,
        message_attributes: envelope_attributes(attributes),
    }
}

pub fn build_subscription_confirmation(
    base_url: &str,
    message_id: &str,
    topic_arn: &str,
    token: &str,
) -> Envelope {
    let message = format!(
        "You have chosen to subscribe to the topic {topic_arn}.\nTo confirm the subscription, visit the SubscribeURL included in this message."
    );
    let subscribe_url = format!(
        "{base_url}/?Action=ConfirmSubscription&TopicArn={topic_arn}&Token={token}"
    );
    let timestamp = rfc3339_now();
    let signature = sign(&canonical_confirmation(
        &message,
        message_id,
        &subscribe_url,
        &timestamp,
        token,
        topic_arn,
        "SubscriptionConfirmation",
    ));
    Envelope {
        message_type: "SubscriptionConfirmation".to_string(),
        message_id: message_id.to_string(),
        topic_arn: topic_arn.to_string(),
        subject: None,
        message,
        timestamp,
        signature_version: "1".to_string(),
        signature,
        signing_cert_url: format!("{base_url}{SIGNING_CERT_PATH}"),
        unsubscribe_url: format!("{base_url}/?Action=Unsubscribe&SubscriptionArn={topic_arn}"),
        subscribe_url: Some(subscribe_url),
        token: Some(token.to_string()),
        message_attributes: None,
    }
}

/// Resolves the per-protocol message when `MessageStructure=json` is set:
/// the body must be a JSON object with a `default` key, and the value
/// under the subscription's protocol wins over the default.
pub fn message_for_protocol(
    message: &str,
    message_structure: Option<&str>,
    protocol: &str,
) -> Result<String, SnsError> {
    if message_structure != Some("json") {
        return Ok(message.to_string());
    }
    let map: HashMap<String, String> = serde_json::from_str(message).map_err(|e| {
        SnsError::InvalidParameterValue(format!("MessageStructure=json requires a JSON object: {e}"))
    })?;
    let default = map.get("default").ok_or_else(|| {
        SnsError::InvalidParameterValue("Message must contain a default key".into())
    })?;
    Ok(map.get(protocol).unwrap_or(default).clone())
}

pub async fn deliver_to_queue(
    sqs: &SqsState,
    sub: &Subscription,
    envelope: &Envelope,
    message: &str,
    attributes: &HashMap<String, MessageAttributeValue>,
) {
    let queue = sub.queue_name();
    let (body, attrs) = if sub.raw_delivery {
        (message.to_string(), queue_attributes(attributes))
    } else {
        (
            serde_json::to_string(envelope).unwrap_or_default(),
            HashMap::new(),
        )
    };
    match sqs.deliver_from_topic(queue, body, attrs).await {
        Ok(()) => {
            info!(queue = %queue, message_id = %envelope.message_id, "delivered notification to queue");
        }
        Err(err) => {
            warn!(queue = %queue, error = err.message(), "dropping notification for queue subscription");
        }
    }
}

/// POSTs the envelope (or the bare message in raw mode). A response status
/// in [200, 499] counts as success; failures are logged, never retried.
pub async fn deliver_to_endpoint(client: &reqwest::Client, sub: &Subscription, envelope: &Envelope) {
    let body = if sub.raw_delivery {
        envelope.message.clone()
    } else {
        serde_json::to_string(envelope).unwrap_or_default()
    };
    let result = client
        .post(&sub.endpoint)
        .header("x-amz-sns-message-type", envelope.message_type.as_str())
        .header("x-amz-sns-message-id", envelope.message_id.as_str())
        .header("x-amz-sns-topic-arn", envelope.topic_arn.as_str())
        .header("x-amz-sns-subscription-arn", sub.arn.as_str())
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await;

    match result {
        Ok(resp) if (200..500).contains(&resp.status().as_u16()) => {
            info!(endpoint = %sub.endpoint, message_id = %envelope.message_id, "delivered notification to endpoint");
        }
        Ok(resp) => {
            warn!(endpoint = %sub.endpoint, status = %resp.status(), "endpoint rejected notification");
        }
        Err(err) => {
            warn!(endpoint = %sub.endpoint, error = %err, "notification delivery failed");
        }
    }
}
