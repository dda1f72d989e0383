use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::SnsError;
use super::publish;
use super::topic::{filter_matches, parse_filter_policy, PendingConfirmation, Subscription, Topic};
use super::types::*;
use crate::sqs::state::SqsState;
use crate::timing::RandomLatency;

const PROTOCOLS: [&str; 3] = ["sqs", "http", "https"];

/// Process-wide topic registry plus the delivery collaborators: the queue
/// store for sqs sinks and an HTTP client for http(s) subscribers.
pub struct SnsState {
    topics: RwLock<HashMap<String, Topic>>,
    account_id: String,
    region: String,
    base_url: String,
    sqs: Arc<SqsState>,
    http: reqwest::Client,
    pub latency: RandomLatency,
}

impl SnsState {
    pub fn new(
        account_id: String,
        region: String,
        host: &str,
        port: u16,
        latency: RandomLatency,
        sqs: Arc<SqsState>,
    ) -> Self {
        SnsState {
            topics: RwLock::new(HashMap::new()),
            account_id,
            region,
            base_url: format!("http://{host}:{port}"),
            sqs,
            http: reqwest::Client::new(),
            latency,
        }
    }

    pub fn topic_arn(&self, name: &str) -> String {
        format!("arn:aws:sns:{}:{}:{}", self.region, self.account_id, name)
    }

    fn not_found() -> SnsError {
        SnsError::TopicNotFound("The specified topic does not exist".into())
    }

    // --- Topic management ---

    pub async fn create_topic(&self, req: CreateTopicRequest) -> Result<CreateTopicResponse, SnsError> {
        if req.name.is_empty() {
            return Err(SnsError::InvalidParameterValue(
                "Topic name must not be empty".into(),
            ));
        }
        let arn = self.topic_arn(&req.name);
        let mut topics = self.topics.write().await;
        if !topics.contains_key(&arn) {
            info!(topic = %req.name, "creating topic");
            topics.insert(arn.clone(), Topic::new(req.name, arn.clone()));
        }
        Ok(CreateTopicResponse { topic_arn: arn })
    }

    pub async fn delete_topic(&self, req: DeleteTopicRequest) -> Result<(), SnsError> {
        let mut topics = self.topics.write().await;
        if topics.remove(&req.topic_arn).is_none() {
            return Err(Self::not_found());
        }
        info!(topic_arn = %req.topic_arn, "deleted topic");
        Ok(())
    }

    pub async fn list_topics(&self) -> ListTopicsResponse {
        let topics = self.topics.read().await;
        let mut arns: Vec<String> = topics.keys().cloned().collect();
        arns.sort();
        ListTopicsResponse {
            topics: arns
                .into_iter()
                .map(|topic_arn| TopicArnEntry { topic_arn })
                .collect(),
        }
    }

    // --- Subscription management ---

    pub async fn subscribe(&self, req: SubscribeRequest) -> Result<SubscribeResponse, SnsError> {
        if !PROTOCOLS.contains(&req.protocol.as_str()) {
            return Err(SnsError::InvalidParameterValue(format!(
                "Unsupported protocol: {}",
                req.protocol
            )));
        }
        let endpoint = req.endpoint.unwrap_or_default();
        if endpoint.is_empty() {
            return Err(SnsError::InvalidParameterValue(
                "Endpoint must not be empty".into(),
            ));
        }

        let mut sub = Subscription::new(&req.topic_arn, req.protocol.clone(), endpoint);
        if let Some(attrs) = req.attributes {
            for (key, value) in attrs {
                match key.as_str() {
                    "RawMessageDelivery" => sub.raw_delivery = value == "true",
                    "FilterPolicy" => sub.filter_policy = Some(parse_filter_policy(&value)?),
                    _ => {}
                }
            }
        }

        // Queue endpoints resolve to a queue that exists or is created on
        // demand.
        if sub.protocol == "sqs" {
            self.sqs.ensure_queue(sub.queue_name()).await;
        }

        let confirmation = {
            let mut topics = self.topics.write().await;
            let topic = topics.get_mut(&req.topic_arn).ok_or_else(Self::not_found)?;

            let arn = sub.arn.clone();
            // Re-subscribing the same endpoint re-issues the ARN in place
            // instead of appending a second subscription.
            match topic
                .subscriptions
                .iter()
                .position(|existing| existing.endpoint == sub.endpoint)
            {
                Some(pos) => topic.subscriptions[pos].arn = arn.clone(),
                None => topic.subscriptions.push(sub.clone()),
            }

            if sub.protocol == "http" || sub.protocol == "https" {
                let token = Uuid::new_v4().to_string();
                topic.pending_confirmation = Some(PendingConfirmation {
                    subscription_arn: arn.clone(),
                    token: token.clone(),
                });
                Some(token)
            } else {
                None
            }
        };

        // The confirmation challenge is posted outside the registry lock.
        if let Some(token) = confirmation {
            let envelope = publish::build_subscription_confirmation(
                &self.base_url,
                &Uuid::new_v4().to_string(),
                &req.topic_arn,
                &token,
            );
            publish::deliver_to_endpoint(&self.http, &sub, &envelope).await;
        }

        info!(topic_arn = %req.topic_arn, subscription_arn = %sub.arn, protocol = %sub.protocol, "subscribed");
        Ok(SubscribeResponse {
            subscription_arn: sub.arn,
        })
    }

    pub async fn confirm_subscription(
        &self,
        req: ConfirmSubscriptionRequest,
    ) -> Result<ConfirmSubscriptionResponse, SnsError> {
        let mut topics = self.topics.write().await;
        let topic = topics.get_mut(&req.topic_arn).ok_or_else(Self::not_found)?;
        match topic.pending_confirmation.take() {
            Some(pending) if pending.token == req.token => Ok(ConfirmSubscriptionResponse {
                subscription_arn: pending.subscription_arn,
            }),
            other => {
                topic.pending_confirmation = other;
                Err(SnsError::SubscriptionNotFound(
                    "No pending subscription matches the token".into(),
                ))
            }
        }
    }

    pub async fn unsubscribe(&self, req: UnsubscribeRequest) -> Result<(), SnsError> {
        let mut topics = self.topics.write().await;
        for topic in topics.values_mut() {
            if let Some(pos) = topic
                .subscriptions
                .iter()
                .position(|s| s.arn == req.subscription_arn)
            {
                topic.subscriptions.remove(pos);
                info!(subscription_arn = %req.subscription_arn, "unsubscribed");
                return Ok(());
            }
        }
        Err(SnsError::SubscriptionNotFound(
            "The specified subscription does not exist".into(),
        ))
    }

    pub async fn list_subscriptions(&self) -> ListSubscriptionsResponse {
        let topics = self.topics.read().await;
        let mut entries: Vec<SubscriptionEntry> = topics
            .values()
            .flat_map(|t| t.subscriptions.iter())
            .map(|s| self.subscription_entry(s))
            .collect();
        entries.sort_by(|a, b| a.subscription_arn.cmp(&b.subscription_arn));
        ListSubscriptionsResponse {
            subscriptions: entries,
        }
    }

    pub async fn list_subscriptions_by_topic(
        &self,
        req: ListSubscriptionsByTopicRequest,
    ) -> Result<ListSubscriptionsResponse, SnsError> {
        let topics = self.topics.read().await;
        let topic = topics.get(&req.topic_arn).ok_or_else(Self::not_found)?;
        Ok(ListSubscriptionsResponse {
            subscriptions: topic
                .subscriptions
                .iter()
                .map(|s| self.subscription_entry(s))
                .collect(),
        })
    }

    fn subscription_entry(&self, s: &Subscription) -> SubscriptionEntry {
        SubscriptionEntry {
            subscription_arn: s.arn.clone(),
            owner: self.account_id.clone(),
            protocol: s.protocol.clone(),
            endpoint: s.endpoint.clone(),
            topic_arn: s.topic_arn.clone(),
        }
    }

    pub async fn get_subscription_attributes(
        &self,
        req: GetSubscriptionAttributesRequest,
    ) -> Result<GetSubscriptionAttributesResponse, SnsError> {
        let topics = self.topics.read().await;
        let sub = topics
            .values()
            .flat_map(|t| t.subscriptions.iter())
            .find(|s| s.arn == req.subscription_arn)
            .ok_or_else(|| {
                SnsError::SubscriptionNotFound(
                    "The specified subscription does not exist".into(),
                )
            })?;

        let mut attributes = HashMap::new();
        attributes.insert("Owner".to_string(), self.account_id.clone());
        attributes.insert(
            "RawMessageDelivery".to_string(),
            sub.raw_delivery.to_string(),
        );
        attributes.insert("TopicArn".to_string(), sub.topic_arn.clone());
        attributes.insert("Endpoint".to_string(), sub.endpoint.clone());
        attributes.insert("PendingConfirmation".to_string(), "false".to_string());
        attributes.insert(
            "ConfirmationWasAuthenticated".to_string(),
            "true".to_string(),
        );
        attributes.insert("SubscriptionArn".to_string(), sub.arn.clone());
        attributes.insert("Protocol".to_string(), sub.protocol.clone());
        if let Some(ref policy) = sub.filter_policy {
            attributes.insert(
                "FilterPolicy".to_string(),
                serde_json::to_string(policy).unwrap_or_default(),
            );
        }
        Ok(GetSubscriptionAttributesResponse { attributes })
    }

    pub async fn set_subscription_attributes(
        &self,
        req: SetSubscriptionAttributesRequest,
    ) -> Result<(), SnsError> {
        let value = req.attribute_value.unwrap_or_default();
        let mut topics = self.topics.write().await;
        let sub = topics
            .values_mut()
            .flat_map(|t| t.subscriptions.iter_mut())
            .find(|s| s.arn == req.subscription_arn)
            .ok_or_else(|| {
                SnsError::SubscriptionNotFound(
                    "The specified subscription does not exist".into(),
                )
            })?;

        match req.attribute_name.as_str() {
            "RawMessageDelivery" => sub.raw_delivery = value == "true",
            "FilterPolicy" => {
                sub.filter_policy = if value.is_empty() {
                    None
                } else {
                    Some(parse_filter_policy(&value)?)
                };
            }
            // Recognized but not enforced.
            "DeliveryPolicy" | "FilterPolicyScope" | "RedrivePolicy" | "SubscriptionRoleArn" => {}
            _ => {
                return Err(SnsError::InvalidParameterValue(format!(
                    "Invalid attribute name: {}",
                    req.attribute_name
                )));
            }
        }
        Ok(())
    }

    // --- Publish ---

    pub async fn publish(&self, req: PublishRequest) -> Result<PublishResponse, SnsError> {
        let topic_arn = req
            .topic_arn
            .or(req.target_arn)
            .ok_or_else(|| SnsError::InvalidParameterValue("TopicArn is required".into()))?;
        if req.message.is_empty() {
            return Err(SnsError::InvalidParameterValue(
                "Message must not be empty".into(),
            ));
        }

        let subscriptions = {
            let topics = self.topics.read().await;
            topics
                .get(&topic_arn)
                .ok_or_else(Self::not_found)?
                .subscriptions
                .clone()
        };

        // The message id is issued regardless of delivery outcomes.
        let message_id = Uuid::new_v4().to_string();
        self.fan_out(
            &topic_arn,
            &message_id,
            &req.message,
            req.subject.as_deref(),
            req.message_structure.as_deref(),
            &req.message_attributes.unwrap_or_default(),
            subscriptions,
        )
        .await;

        Ok(PublishResponse { message_id })
    }

    pub async fn publish_batch(
        &self,
        req: PublishBatchRequest,
    ) -> Result<PublishBatchResponse, SnsError> {
        let entries = req.publish_batch_request_entries;
        if entries.is_empty() {
            return Err(SnsError::EmptyBatchRequest(
                "Batch request must contain at least one entry".into(),
            ));
        }
        if entries.len() > 10 {
            return Err(SnsError::TooManyEntriesInBatchRequest(
                "Batch request must contain at most 10 entries".into(),
            ));
        }
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.id.as_str()) {
                return Err(SnsError::BatchEntryIdsNotDistinct(
                    "Batch entry IDs must be distinct".into(),
                ));
            }
        }

        let subscriptions = {
            let topics = self.topics.read().await;
            topics
                .get(&req.topic_arn)
                .ok_or_else(Self::not_found)?
                .subscriptions
                .clone()
        };

        let mut successful = Vec::new();
        let mut failed = Vec::new();
        for entry in entries {
            if entry.message.is_empty() {
                failed.push(BatchResultErrorEntry {
                    id: entry.id,
                    code: "InvalidParameterValue".to_string(),
                    message: "Message must not be empty".to_string(),
                    sender_fault: true,
                });
                continue;
            }
            let message_id = Uuid::new_v4().to_string();
            self.fan_out(
                &req.topic_arn,
                &message_id,
                &entry.message,
                entry.subject.as_deref(),
                entry.message_structure.as_deref(),
                &entry.message_attributes.unwrap_or_default(),
                subscriptions.clone(),
            )
            .await;
            successful.push(PublishBatchResultEntry {
                id: entry.id,
                message_id,
            });
        }

        Ok(PublishBatchResponse { successful, failed })
    }

    #[allow(clippy::too_many_arguments)]
    async fn fan_out(
        &self,
        topic_arn: &str,
        message_id: &str,
        message: &str,
        subject: Option<&str>,
        message_structure: Option<&str>,
        attributes: &HashMap<String, MessageAttributeValue>,
        subscriptions: Vec<Subscription>,
    ) {
        for sub in subscriptions {
            if let Some(ref policy) = sub.filter_policy {
                if !filter_matches(policy, attributes) {
                    debug!(subscription_arn = %sub.arn, "filter policy mismatch, skipping");
                    continue;
                }
            }
            let derived = match publish::message_for_protocol(message, message_structure, &sub.protocol)
            {
                Ok(m) => m,
                Err(err) => {
                    warn!(subscription_arn = %sub.arn, error = err.message(), "skipping subscription");
                    continue;
                }
            };
            let envelope = publish::build_notification(
                &self.base_url,
                message_id,
                topic_arn,
                &sub.arn,
                subject,
                &derived,
                attributes,
            );
            match sub.protocol.as_str() {
                "sqs" => {
                    publish::deliver_to_queue(&self.sqs, &sub, &envelope, &derived, attributes)
                        .await;
                }
                "http" | "https" => {
                    publish::deliver_to_endpoint(&self.http, &sub, &envelope).await;
                }
                other => warn!(protocol = %other, "unsupported subscription protocol"),
            }
        }
    }

    // --- Reload & introspection ---

    /// Atomically replaces the registry, used by config hot reload.
    pub async fn replace_all(&self, replacement: Vec<Topic>) {
        let mut topics = self.topics.write().await;
        *topics = replacement
            .into_iter()
            .map(|t| (t.arn.clone(), t))
            .collect();
    }

    pub async fn topic_exists(&self, arn: &str) -> bool {
        self.topics.read().await.contains_key(arn)
    }

    pub async fn pending_confirmation(&self, topic_arn: &str) -> Option<PendingConfirmation> {
        self.topics
            .read()
            .await
            .get(topic_arn)
            .and_then(|t| t.pending_confirmation.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqs::queue::QueueAttributes;
    use crate::sqs::types::{GetQueueAttributesRequest, ReceiveMessageRequest};

    fn sqs_state() -> Arc<SqsState> {
        Arc::new(SqsState::new(
            "queue".into(),
            "local".into(),
            "localhost",
            4100,
            QueueAttributes::default(),
            false,
            RandomLatency::default(),
        ))
    }

    fn sns_state(sqs: Arc<SqsState>) -> SnsState {
        SnsState::new(
            "queue".into(),
            "local".into(),
            "localhost",
            4100,
            RandomLatency::default(),
            sqs,
        )
    }

    fn string_attr(value: &str) -> MessageAttributeValue {
        MessageAttributeValue {
            data_type: "String".into(),
            string_value: Some(value.into()),
            binary_value: None,
        }
    }

    async fn subscribe_queue(
        sns: &SnsState,
        topic_arn: &str,
        queue: &str,
        attrs: Option<HashMap<String, String>>,
    ) -> String {
        sns.subscribe(SubscribeRequest {
            topic_arn: topic_arn.to_string(),
            protocol: "sqs".into(),
            endpoint: Some(format!("arn:aws:sqs:local:queue:{queue}")),
            attributes: attrs,
        })
        .await
        .unwrap()
        .subscription_arn
    }

    async fn queue_messages(sqs: &SqsState, queue: &str) -> Vec<String> {
        sqs.receive_message(ReceiveMessageRequest {
            queue_url: format!("http://localhost:4100/queue/{queue}"),
            max_number_of_messages: Some(10),
            wait_time_seconds: Some(0),
        })
        .await
        .unwrap()
        .messages
        .unwrap_or_default()
        .into_iter()
        .map(|m| m.body)
        .collect()
    }

    #[tokio::test]
    async fn create_topic_is_idempotent() {
        let sns = sns_state(sqs_state());
        let a = sns
            .create_topic(CreateTopicRequest { name: "t".into() })
            .await
            .unwrap();
        let b = sns
            .create_topic(CreateTopicRequest { name: "t".into() })
            .await
            .unwrap();
        assert_eq!(a.topic_arn, b.topic_arn);
        assert_eq!(a.topic_arn, "arn:aws:sns:local:queue:t");
    }

    #[tokio::test]
    async fn delete_missing_topic_is_not_found() {
        let sns = sns_state(sqs_state());
        let err = sns
            .delete_topic(DeleteTopicRequest {
                topic_arn: "arn:aws:sns:local:queue:ghost".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SnsError::TopicNotFound(_)));
    }

    #[tokio::test]
    async fn subscribe_creates_queue_on_demand() {
        let sqs = sqs_state();
        let sns = sns_state(sqs.clone());
        let arn = sns
            .create_topic(CreateTopicRequest { name: "t".into() })
            .await
            .unwrap()
            .topic_arn;
        subscribe_queue(&sns, &arn, "made-on-demand", None).await;
        assert!(sqs.queue_exists("made-on-demand").await);
    }

    #[tokio::test]
    async fn duplicate_endpoint_replaces_arn_in_place() {
        let sns = sns_state(sqs_state());
        let arn = sns
            .create_topic(CreateTopicRequest { name: "t".into() })
            .await
            .unwrap()
            .topic_arn;

        let first = subscribe_queue(&sns, &arn, "q", None).await;
        let second = subscribe_queue(&sns, &arn, "q", None).await;
        assert_ne!(first, second);

        let listed = sns
            .list_subscriptions_by_topic(ListSubscriptionsByTopicRequest {
                topic_arn: arn.clone(),
            })
            .await
            .unwrap();
        assert_eq!(listed.subscriptions.len(), 1);
        assert_eq!(listed.subscriptions[0].subscription_arn, second);
        assert!(second.starts_with(&format!("{arn}:")));
    }

    #[tokio::test]
    async fn unsubscribe_removes_in_place() {
        let sns = sns_state(sqs_state());
        let arn = sns
            .create_topic(CreateTopicRequest { name: "t".into() })
            .await
            .unwrap()
            .topic_arn;
        let a = subscribe_queue(&sns, &arn, "a", None).await;
        let b = subscribe_queue(&sns, &arn, "b", None).await;
        let c = subscribe_queue(&sns, &arn, "c", None).await;

        sns.unsubscribe(UnsubscribeRequest {
            subscription_arn: b,
        })
        .await
        .unwrap();

        let listed = sns
            .list_subscriptions_by_topic(ListSubscriptionsByTopicRequest { topic_arn: arn })
            .await
            .unwrap();
        let arns: Vec<&str> = listed
            .subscriptions
            .iter()
            .map(|s| s.subscription_arn.as_str())
            .collect();
        assert_eq!(arns, vec![a.as_str(), c.as_str()]);

        let err = sns
            .unsubscribe(UnsubscribeRequest {
                subscription_arn: "arn:aws:sns:local:queue:t:gone".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SnsError::SubscriptionNotFound(_)));
    }

    #[tokio::test]
    async fn subscription_attribute_dispatch() {
        let sns = sns_state(sqs_state());
        let arn = sns
            .create_topic(CreateTopicRequest { name: "t".into() })
            .await
            .unwrap()
            .topic_arn;
        let sub = subscribe_queue(&sns, &arn, "q", None).await;

        let set = |name: &str, value: &str| SetSubscriptionAttributesRequest {
            subscription_arn: sub.clone(),
            attribute_name: name.to_string(),
            attribute_value: Some(value.to_string()),
        };

        sns.set_subscription_attributes(set("RawMessageDelivery", "true"))
            .await
            .unwrap();
        sns.set_subscription_attributes(set("FilterPolicy", r#"{"foo": ["bar"]}"#))
            .await
            .unwrap();
        // Recognized names that do not mutate state.
        for name in ["DeliveryPolicy", "FilterPolicyScope", "RedrivePolicy", "SubscriptionRoleArn"] {
            sns.set_subscription_attributes(set(name, "whatever"))
                .await
                .unwrap();
        }
        let err = sns
            .set_subscription_attributes(set("NoSuchAttribute", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SnsError::InvalidParameterValue(_)));

        let err = sns
            .set_subscription_attributes(set("FilterPolicy", "not json"))
            .await
            .unwrap_err();
        assert!(matches!(err, SnsError::InvalidParameterValue(_)));

        let attrs = sns
            .get_subscription_attributes(GetSubscriptionAttributesRequest {
                subscription_arn: sub.clone(),
            })
            .await
            .unwrap()
            .attributes;
        assert_eq!(attrs["RawMessageDelivery"], "true");
        assert_eq!(attrs["Owner"], "queue");
        assert_eq!(attrs["PendingConfirmation"], "false");
        assert_eq!(attrs["ConfirmationWasAuthenticated"], "true");
        assert!(attrs["FilterPolicy"].contains("bar"));
    }

    #[tokio::test]
    async fn publish_filters_and_delivers_raw() {
        let sqs = sqs_state();
        let sns = sns_state(sqs.clone());
        let arn = sns
            .create_topic(CreateTopicRequest { name: "t".into() })
            .await
            .unwrap()
            .topic_arn;
        subscribe_queue(
            &sns,
            &arn,
            "q",
            Some(HashMap::from([
                ("RawMessageDelivery".to_string(), "true".to_string()),
                ("FilterPolicy".to_string(), r#"{"foo": ["bar"]}"#.to_string()),
            ])),
        )
        .await;

        sns.publish(PublishRequest {
            topic_arn: Some(arn.clone()),
            target_arn: None,
            message: "hi".into(),
            subject: None,
            message_structure: None,
            message_attributes: Some(HashMap::from([("foo".to_string(), string_attr("bar"))])),
        })
        .await
        .unwrap();
        assert_eq!(queue_messages(&sqs, "q").await, vec!["hi".to_string()]);

        sns.publish(PublishRequest {
            topic_arn: Some(arn),
            target_arn: None,
            message: "hi2".into(),
            subject: None,
            message_structure: None,
            message_attributes: Some(HashMap::from([("foo".to_string(), string_attr("baz"))])),
        })
        .await
        .unwrap();
        assert!(queue_messages(&sqs, "q").await.is_empty());
    }

    #[tokio::test]
    async fn publish_wraps_in_envelope_when_not_raw() {
        let sqs = sqs_state();
        let sns = sns_state(sqs.clone());
        let arn = sns
            .create_topic(CreateTopicRequest { name: "t".into() })
            .await
            .unwrap()
            .topic_arn;
        subscribe_queue(&sns, &arn, "q", None).await;

        sns.publish(PublishRequest {
            topic_arn: Some(arn.clone()),
            target_arn: None,
            message: "payload".into(),
            subject: Some("greeting".into()),
            message_structure: None,
            message_attributes: None,
        })
        .await
        .unwrap();

        let bodies = queue_messages(&sqs, "q").await;
        let envelope: serde_json::Value = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(envelope["Type"], "Notification");
        assert_eq!(envelope["Message"], "payload");
        assert_eq!(envelope["Subject"], "greeting");
        assert_eq!(envelope["TopicArn"], arn);
        assert_eq!(envelope["SignatureVersion"], "1");
    }

    #[tokio::test]
    async fn publish_json_structure_selects_protocol_message() {
        let sqs = sqs_state();
        let sns = sns_state(sqs.clone());
        let arn = sns
            .create_topic(CreateTopicRequest { name: "t".into() })
            .await
            .unwrap()
            .topic_arn;
        subscribe_queue(
            &sns,
            &arn,
            "q",
            Some(HashMap::from([(
                "RawMessageDelivery".to_string(),
                "true".to_string(),
            )])),
        )
        .await;

        sns.publish(PublishRequest {
            topic_arn: Some(arn),
            target_arn: None,
            message: r#"{"default": "plain", "sqs": "for-queues"}"#.into(),
            subject: None,
            message_structure: Some("json".into()),
            message_attributes: None,
        })
        .await
        .unwrap();
        assert_eq!(queue_messages(&sqs, "q").await, vec!["for-queues".to_string()]);
    }

    #[tokio::test]
    async fn publish_to_missing_topic_is_not_found() {
        let sns = sns_state(sqs_state());
        let err = sns
            .publish(PublishRequest {
                topic_arn: Some("arn:aws:sns:local:queue:ghost".into()),
                target_arn: None,
                message: "hi".into(),
                subject: None,
                message_structure: None,
                message_attributes: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SnsError::TopicNotFound(_)));
    }

    #[tokio::test]
    async fn publish_batch_enforces_batch_rules() {
        let sns = sns_state(sqs_state());
        let arn = sns
            .create_topic(CreateTopicRequest { name: "t".into() })
            .await
            .unwrap()
            .topic_arn;

        let entry = |id: &str| PublishBatchEntry {
            id: id.to_string(),
            message: "m".to_string(),
            subject: None,
            message_structure: None,
            message_attributes: None,
        };

        let empty = sns
            .publish_batch(PublishBatchRequest {
                topic_arn: arn.clone(),
                publish_batch_request_entries: vec![],
            })
            .await;
        assert!(matches!(empty, Err(SnsError::EmptyBatchRequest(_))));

        let too_many = sns
            .publish_batch(PublishBatchRequest {
                topic_arn: arn.clone(),
                publish_batch_request_entries: (0..11).map(|i| entry(&format!("id{i}"))).collect(),
            })
            .await;
        assert!(matches!(
            too_many,
            Err(SnsError::TooManyEntriesInBatchRequest(_))
        ));

        let dup = sns
            .publish_batch(PublishBatchRequest {
                topic_arn: arn.clone(),
                publish_batch_request_entries: vec![entry("same"), entry("same")],
            })
            .await;
        assert!(matches!(dup, Err(SnsError::BatchEntryIdsNotDistinct(_))));

        let ok = sns
            .publish_batch(PublishBatchRequest {
                topic_arn: arn,
                publish_batch_request_entries: vec![entry("a"), entry("b")],
            })
            .await
            .unwrap();
        assert_eq!(ok.successful.len(), 2);
        assert_ne!(ok.successful[0].message_id, ok.successful[1].message_id);
    }

    #[tokio::test]
    async fn queue_attributes_checked_after_fanout() {
        let sqs = sqs_state();
        let sns = sns_state(sqs.clone());
        let arn = sns
            .create_topic(CreateTopicRequest { name: "t".into() })
            .await
            .unwrap()
            .topic_arn;
        subscribe_queue(&sns, &arn, "counted", None).await;

        sns.publish(PublishRequest {
            topic_arn: Some(arn),
            target_arn: None,
            message: "one".into(),
            subject: None,
            message_structure: None,
            message_attributes: None,
        })
        .await
        .unwrap();

        let attrs = sqs
            .get_queue_attributes(GetQueueAttributesRequest {
                queue_url: "http://localhost:4100/queue/counted".into(),
                attribute_names: None,
            })
            .await
            .unwrap();
        assert_eq!(attrs.attributes["ApproximateNumberOfMessages"], "1");
    }
}
