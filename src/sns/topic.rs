use std::collections::HashMap;

use serde::Deserialize;
use uuid::Uuid;

use super::error::SnsError;
use super::types::MessageAttributeValue;

/// Attribute name to allowed string values. A message satisfies the policy
/// iff every named attribute is present with type `String` and a value in
/// the allowed set.
pub type FilterPolicy = HashMap<String, Vec<String>>;

pub fn parse_filter_policy(s: &str) -> Result<FilterPolicy, SnsError> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Allowed {
        One(String),
        Many(Vec<String>),
    }

    let raw: HashMap<String, Allowed> = serde_json::from_str(s)
        .map_err(|e| SnsError::InvalidParameterValue(format!("Invalid FilterPolicy: {e}")))?;
    Ok(raw
        .into_iter()
        .map(|(name, allowed)| {
            let values = match allowed {
                Allowed::One(v) => vec![v],
                Allowed::Many(vs) => vs,
            };
            (name, values)
        })
        .collect())
}

pub fn filter_matches(
    policy: &FilterPolicy,
    attributes: &HashMap<String, MessageAttributeValue>,
) -> bool {
    policy.iter().all(|(name, allowed)| {
        attributes
            .get(name)
            .filter(|attr| attr.data_type == "String")
            .and_then(|attr| attr.string_value.as_ref())
            .map(|value| allowed.contains(value))
            .unwrap_or(false)
    })
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub arn: String,
    pub topic_arn: String,
    /// One of `sqs`, `http`, `https`.
    pub protocol: String,
    pub endpoint: String,
    pub raw_delivery: bool,
    pub filter_policy: Option<FilterPolicy>,
}

impl Subscription {
    pub fn new(topic_arn: &str, protocol: String, endpoint: String) -> Self {
        Subscription {
            arn: format!("{topic_arn}:{}", Uuid::new_v4()),
            topic_arn: topic_arn.to_string(),
            protocol,
            endpoint,
            raw_delivery: false,
            filter_policy: None,
        }
    }

    /// Queue subscriptions resolve their target by the trailing segment of
    /// the endpoint ARN.
    pub fn queue_name(&self) -> &str {
        self.endpoint.rsplit(':').next().unwrap_or(&self.endpoint)
    }
}

/// One slot per topic: the http(s) subscription waiting on its
/// confirmation token.
#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub subscription_arn: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct Topic {
    pub name: String,
    pub arn: String,
    pub subscriptions: Vec<Subscription>,
    pub pending_confirmation: Option<PendingConfirmation>,
}

impl Topic {
    pub fn new(name: String, arn: String) -> Self {
        Topic {
            name,
            arn,
            subscriptions: Vec::new(),
            pending_confirmation: None,
        }
    }
}
