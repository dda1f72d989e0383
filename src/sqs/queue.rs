use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use base64::Engine;
use chrono::{DateTime, Utc};
use md5::{Digest as Md5Digest, Md5};
use uuid::Uuid;

use super::error::SqsError;
use super::types::{MessageAttributeValue, ReceiveMessageResult};
use crate::timing::now_millis;

/// Rolling window during which a repeated deduplication id is suppressed.
pub const DEDUPLICATION_WINDOW_SECS: i64 = 300;

pub const MAX_VISIBILITY_TIMEOUT: u32 = 43200;

fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// MD5 over the canonical encoding of a message-attribute map. AWS SDKs
/// recompute and verify this digest, so the encoding is fixed: keys in
/// ascending order, each field length-prefixed with a big-endian u32, a
/// transport tag byte of 1 for string values and 2 for binary values, and
/// binary values hashed in decoded form.
pub fn compute_md5_of_attributes(attrs: &HashMap<String, MessageAttributeValue>) -> Option<String> {
    if attrs.is_empty() {
        return None;
    }
    let mut keys: Vec<&String> = attrs.keys().collect();
    keys.sort();

    let mut buf: Vec<u8> = Vec::new();
    for key in keys {
        let attr = &attrs[key];
        let name_bytes = key.as_bytes();
        buf.extend_from_slice(&(name_bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(name_bytes);

        let dt_bytes = attr.data_type.as_bytes();
        buf.extend_from_slice(&(dt_bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(dt_bytes);

        if attr.data_type.starts_with("Binary") {
            buf.push(2);
            if let Some(ref bv) = attr.binary_value {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(bv)
                    .unwrap_or_default();
                buf.extend_from_slice(&(decoded.len() as u32).to_be_bytes());
                buf.extend_from_slice(&decoded);
            }
        } else {
            buf.push(1);
            if let Some(ref sv) = attr.string_value {
                let sv_bytes = sv.as_bytes();
                buf.extend_from_slice(&(sv_bytes.len() as u32).to_be_bytes());
                buf.extend_from_slice(sv_bytes);
            }
        }
    }

    Some(md5_hex(&buf))
}

#[derive(Debug, Clone)]
pub struct RedrivePolicy {
    pub dead_letter_target_arn: String,
    pub max_receive_count: u32,
}

impl RedrivePolicy {
    pub fn from_json(s: &str) -> Result<Self, SqsError> {
        let v: serde_json::Value = serde_json::from_str(s).map_err(|e| {
            SqsError::InvalidAttributeValue(format!("Invalid RedrivePolicy JSON: {e}"))
        })?;
        let arn = v
            .get("deadLetterTargetArn")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                SqsError::InvalidAttributeValue(
                    "RedrivePolicy must contain deadLetterTargetArn".into(),
                )
            })?
            .to_string();
        let max_count = v
            .get("maxReceiveCount")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| {
                SqsError::InvalidAttributeValue("RedrivePolicy must contain maxReceiveCount".into())
            })? as u32;
        if max_count < 1 {
            return Err(SqsError::InvalidAttributeValue(
                "maxReceiveCount must be at least 1".into(),
            ));
        }
        Ok(RedrivePolicy {
            dead_letter_target_arn: arn,
            max_receive_count: max_count,
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({
            "deadLetterTargetArn": self.dead_letter_target_arn,
            "maxReceiveCount": self.max_receive_count,
        })
        .to_string()
    }

    /// Queues are resolved by the trailing ARN segment so configs with a
    /// region that does not match the server's still work.
    pub fn dead_letter_queue_name(&self) -> &str {
        self.dead_letter_target_arn
            .rsplit(':')
            .next()
            .unwrap_or(&self.dead_letter_target_arn)
    }
}

#[derive(Debug, Clone)]
pub struct QueueAttributes {
    pub visibility_timeout: u32,
    pub delay_seconds: u32,
    pub maximum_message_size: u32,
    pub message_retention_period: u32,
    pub receive_message_wait_time_seconds: u32,
    pub redrive_policy: Option<RedrivePolicy>,
}

impl Default for QueueAttributes {
    fn default() -> Self {
        QueueAttributes {
            visibility_timeout: 30,
            delay_seconds: 0,
            maximum_message_size: 262144,
            message_retention_period: 345600,
            receive_message_wait_time_seconds: 0,
            redrive_policy: None,
        }
    }
}

impl QueueAttributes {
    /// Applies a raw attribute map. Values must parse as non-negative
    /// integers (RedrivePolicy: JSON); DLQ existence is the store's check.
    pub fn apply(&mut self, attrs: &HashMap<String, String>) -> Result<(), SqsError> {
        for (key, value) in attrs {
            match key.as_str() {
                "VisibilityTimeout" => {
                    let v = parse_non_negative(key, value)?;
                    if v > MAX_VISIBILITY_TIMEOUT {
                        return Err(SqsError::InvalidParameterValue(
                            "VisibilityTimeout must be between 0 and 43200".into(),
                        ));
                    }
                    self.visibility_timeout = v;
                }
                "DelaySeconds" => {
                    self.delay_seconds = parse_non_negative(key, value)?;
                }
                "MaximumMessageSize" => {
                    self.maximum_message_size = parse_non_negative(key, value)?;
                }
                "MessageRetentionPeriod" => {
                    self.message_retention_period = parse_non_negative(key, value)?;
                }
                "ReceiveMessageWaitTimeSeconds" => {
                    let v = parse_non_negative(key, value)?;
                    if v > 20 {
                        return Err(SqsError::InvalidParameterValue(
                            "ReceiveMessageWaitTimeSeconds must be between 0 and 20".into(),
                        ));
                    }
                    self.receive_message_wait_time_seconds = v;
                }
                "RedrivePolicy" => {
                    if value.is_empty() {
                        self.redrive_policy = None;
                    } else {
                        self.redrive_policy = Some(RedrivePolicy::from_json(value)?);
                    }
                }
                _ => {
                    return Err(SqsError::InvalidParameterValue(format!(
                        "Unknown attribute: {key}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: String,
    pub body: String,
    pub md5_of_body: String,
    pub md5_of_message_attributes: Option<String>,
    pub message_attributes: HashMap<String, MessageAttributeValue>,
    /// Empty while the message is visible; `<message-uuid>#<fresh-uuid>`
    /// while in flight.
    pub receipt_handle: String,
    pub receipt_time: Instant,
    pub visibility_deadline: Instant,
    /// Completed deliveries: bumped when visibility expires or is reset,
    /// not on receive.
    pub retry_count: u32,
    pub first_receive_timestamp: Option<u64>,
    pub group_id: String,
    pub dedup_id: String,
    pub sequence_number: String,
    pub sent_time: Instant,
    pub delay_seconds: u32,
}

impl Message {
    pub fn is_in_flight(&self) -> bool {
        !self.receipt_handle.is_empty()
    }

    pub fn is_delayed(&self, now: Instant) -> bool {
        self.sent_time + Duration::from_secs(self.delay_seconds as u64) > now
    }
}

/// Result of a send: the wire-visible digests plus whether the message was
/// actually appended (a deduplicated send still reports success).
pub struct SendOutcome {
    pub message_id: String,
    pub md5_of_message_body: String,
    pub md5_of_message_attributes: Option<String>,
    pub sequence_number: Option<String>,
    pub appended: bool,
}

pub struct Queue {
    pub name: String,
    pub arn: String,
    pub url: String,
    pub is_fifo: bool,
    pub enable_duplicates: bool,
    pub attributes: QueueAttributes,
    pub messages: VecDeque<Message>,
    pub locked_groups: HashSet<String>,
    pub group_sequences: HashMap<String, u64>,
    pub duplicates: HashMap<String, DateTime<Utc>>,
}

impl Queue {
    pub fn new(
        name: String,
        arn: String,
        url: String,
        attributes: QueueAttributes,
        enable_duplicates: bool,
    ) -> Self {
        let is_fifo = name.ends_with(".fifo");
        Queue {
            name,
            arn,
            url,
            is_fifo,
            enable_duplicates,
            attributes,
            messages: VecDeque::new(),
            locked_groups: HashSet::new(),
            group_sequences: HashMap::new(),
            duplicates: HashMap::new(),
        }
    }

    pub fn send_message(
        &mut self,
        body: String,
        attributes: HashMap<String, MessageAttributeValue>,
        delay_seconds: Option<u32>,
        group_id: String,
        dedup_id: String,
    ) -> Result<SendOutcome, SqsError> {
        let max_size = self.attributes.maximum_message_size as usize;
        if max_size > 0 && body.len() > max_size {
            return Err(SqsError::MessageTooBig(format!(
                "Message body must be shorter than {max_size} bytes"
            )));
        }

        let md5_of_body = md5_hex(body.as_bytes());
        let md5_of_attrs = compute_md5_of_attributes(&attributes);
        let message_id = Uuid::new_v4().to_string();

        // Message-level delay wins over the queue default when non-zero.
        let delay = match delay_seconds {
            Some(d) if d > 0 => d,
            _ => self.attributes.delay_seconds,
        };

        let sequence_number = if self.is_fifo {
            let counter = self.group_sequences.entry(group_id.clone()).or_insert(0);
            *counter += 1;
            Some(counter.to_string())
        } else {
            None
        };

        let duplicate = self.is_fifo
            && self.enable_duplicates
            && !dedup_id.is_empty()
            && self.duplicates.contains_key(&dedup_id);

        // The window is refreshed on every send carrying a deduplication
        // id, including suppressed ones.
        if !dedup_id.is_empty() {
            self.duplicates.insert(dedup_id.clone(), Utc::now());
        }

        if !duplicate {
            let now = Instant::now();
            self.messages.push_back(Message {
                message_id: message_id.clone(),
                body,
                md5_of_body: md5_of_body.clone(),
                md5_of_message_attributes: md5_of_attrs.clone(),
                message_attributes: attributes,
                receipt_handle: String::new(),
                receipt_time: now,
                visibility_deadline: now,
                retry_count: 0,
                first_receive_timestamp: None,
                group_id,
                dedup_id,
                sequence_number: sequence_number.clone().unwrap_or_default(),
                sent_time: now,
                delay_seconds: delay,
            });
        }

        Ok(SendOutcome {
            message_id,
            md5_of_message_body: md5_of_body,
            md5_of_message_attributes: md5_of_attrs,
            sequence_number,
            appended: !duplicate,
        })
    }

    /// Selects up to `max` eligible messages in insertion order and marks
    /// them in flight. Eligible: visible, past its delay window, and (for
    /// FIFO queues) not in a locked group.
    pub fn receive_messages(&mut self, max: usize, sender_id: &str) -> Vec<ReceiveMessageResult> {
        let now = Instant::now();
        let now_ms = now_millis();
        let visibility = Duration::from_secs(self.attributes.visibility_timeout as u64);

        let mut out = Vec::new();
        for i in 0..self.messages.len() {
            if out.len() >= max {
                break;
            }
            let eligible = {
                let m = &self.messages[i];
                !m.is_in_flight()
                    && !m.is_delayed(now)
                    && !(self.is_fifo && self.locked_groups.contains(&m.group_id))
            };
            if !eligible {
                continue;
            }

            if self.is_fifo {
                self.locked_groups.insert(self.messages[i].group_id.clone());
            }

            let m = &mut self.messages[i];
            m.receipt_handle = format!("{}#{}", m.message_id, Uuid::new_v4());
            m.receipt_time = now;
            m.visibility_deadline = now + visibility;
            if m.first_receive_timestamp.is_none() {
                m.first_receive_timestamp = Some(now_ms);
            }

            let mut attrs = HashMap::new();
            attrs.insert(
                "ApproximateFirstReceiveTimestamp".to_string(),
                m.first_receive_timestamp.unwrap().to_string(),
            );
            attrs.insert("SenderId".to_string(), sender_id.to_string());
            attrs.insert(
                "ApproximateReceiveCount".to_string(),
                (m.retry_count + 1).to_string(),
            );
            attrs.insert("SentTimestamp".to_string(), now_ms.to_string());

            out.push(ReceiveMessageResult {
                message_id: m.message_id.clone(),
                receipt_handle: m.receipt_handle.clone(),
                body: m.body.clone(),
                md5_of_body: m.md5_of_body.clone(),
                md5_of_message_attributes: m.md5_of_message_attributes.clone(),
                attributes: attrs,
                message_attributes: if m.message_attributes.is_empty() {
                    None
                } else {
                    Some(m.message_attributes.clone())
                },
            });
        }
        out
    }

    pub fn delete_message(&mut self, receipt_handle: &str) -> Result<(), SqsError> {
        let pos = self
            .messages
            .iter()
            .position(|m| m.receipt_handle == receipt_handle && !receipt_handle.is_empty())
            .ok_or_else(|| SqsError::MessageDoesNotExist("Message not found".into()))?;
        let msg = self.messages.remove(pos).unwrap();
        if !msg.dedup_id.is_empty() {
            self.duplicates.remove(&msg.dedup_id);
        }
        self.locked_groups.remove(&msg.group_id);
        Ok(())
    }

    /// Timeout 0 resets the message to visible (bumping its retry count,
    /// possibly moving it to the DLQ, returned to the caller for the
    /// cross-queue append); any other timeout just pushes the deadline.
    pub fn change_message_visibility(
        &mut self,
        receipt_handle: &str,
        timeout: u32,
    ) -> Result<Option<(String, Message)>, SqsError> {
        if timeout > MAX_VISIBILITY_TIMEOUT {
            return Err(SqsError::InvalidParameterValue(
                "VisibilityTimeout must be between 0 and 43200".into(),
            ));
        }
        let pos = self
            .messages
            .iter()
            .position(|m| m.receipt_handle == receipt_handle && !receipt_handle.is_empty())
            .ok_or_else(|| SqsError::MessageNotInFlight("The message is not in flight".into()))?;

        let now = Instant::now();
        if timeout > 0 {
            self.messages[pos].visibility_deadline = now + Duration::from_secs(timeout as u64);
            return Ok(None);
        }

        let (group, over_limit) = {
            let m = &mut self.messages[pos];
            m.receipt_handle.clear();
            m.receipt_time = now;
            m.visibility_deadline =
                now + Duration::from_secs(self.attributes.visibility_timeout as u64);
            m.retry_count += 1;
            let over = self
                .attributes
                .redrive_policy
                .as_ref()
                .map(|rp| m.retry_count > rp.max_receive_count)
                .unwrap_or(false);
            (m.group_id.clone(), over)
        };
        self.locked_groups.remove(&group);

        if over_limit {
            let dlq = self
                .attributes
                .redrive_policy
                .as_ref()
                .unwrap()
                .dead_letter_queue_name()
                .to_string();
            let msg = self.messages.remove(pos).unwrap();
            return Ok(Some((dlq, msg)));
        }
        Ok(None)
    }

    pub fn purge(&mut self) {
        self.messages.clear();
        self.duplicates.clear();
        self.locked_groups.clear();
    }

    pub fn expire_dedup(&mut self, now: DateTime<Utc>) {
        self.duplicates.retain(|_, accepted| {
            now.signed_duration_since(*accepted)
                < chrono::Duration::seconds(DEDUPLICATION_WINDOW_SECS)
        });
    }

    /// Resets in-flight messages whose visibility deadline has passed and
    /// returns those whose retry count pushed them over the redrive limit.
    /// Removals never advance the scan index, so neighbors are not skipped.
    pub fn expire_visibility(&mut self, now: Instant) -> Vec<(String, Message)> {
        let mut moved = Vec::new();
        let mut i = 0;
        while i < self.messages.len() {
            let expired = {
                let m = &self.messages[i];
                m.is_in_flight() && m.visibility_deadline <= now
            };
            if !expired {
                i += 1;
                continue;
            }

            let (group, over_limit) = {
                let m = &mut self.messages[i];
                m.receipt_handle.clear();
                m.receipt_time = now;
                m.retry_count += 1;
                let over = self
                    .attributes
                    .redrive_policy
                    .as_ref()
                    .map(|rp| m.retry_count > rp.max_receive_count)
                    .unwrap_or(false);
                (m.group_id.clone(), over)
            };
            self.locked_groups.remove(&group);

            if over_limit {
                let dlq = self
                    .attributes
                    .redrive_policy
                    .as_ref()
                    .unwrap()
                    .dead_letter_queue_name()
                    .to_string();
                let msg = self.messages.remove(i).unwrap();
                moved.push((dlq, msg));
            } else {
                i += 1;
            }
        }
        moved
    }

    pub fn visible_count(&self) -> usize {
        let now = Instant::now();
        self.messages
            .iter()
            .filter(|m| !m.is_in_flight() && !m.is_delayed(now))
            .count()
    }

    pub fn not_visible_count(&self) -> usize {
        let now = Instant::now();
        self.messages
            .iter()
            .filter(|m| m.is_in_flight() || m.is_delayed(now))
            .count()
    }

    pub fn get_attributes(&self, names: &Option<Vec<String>>) -> HashMap<String, String> {
        let all = match names {
            None => true,
            Some(names) => names.is_empty() || names.iter().any(|n| n == "All"),
        };
        let include = |name: &str| -> bool {
            all || names
                .as_ref()
                .map(|n| n.iter().any(|x| x == name))
                .unwrap_or(false)
        };

        let mut result = HashMap::new();
        if include("DelaySeconds") {
            result.insert(
                "DelaySeconds".into(),
                self.attributes.delay_seconds.to_string(),
            );
        }
        if include("MaximumMessageSize") {
            result.insert(
                "MaximumMessageSize".into(),
                self.attributes.maximum_message_size.to_string(),
            );
        }
        if include("MessageRetentionPeriod") {
            result.insert(
                "MessageRetentionPeriod".into(),
                self.attributes.message_retention_period.to_string(),
            );
        }
        if include("ReceiveMessageWaitTimeSeconds") {
            result.insert(
                "ReceiveMessageWaitTimeSeconds".into(),
                self.attributes.receive_message_wait_time_seconds.to_string(),
            );
        }
        if include("VisibilityTimeout") {
            result.insert(
                "VisibilityTimeout".into(),
                self.attributes.visibility_timeout.to_string(),
            );
        }
        if include("ApproximateNumberOfMessages") {
            result.insert(
                "ApproximateNumberOfMessages".into(),
                self.visible_count().to_string(),
            );
        }
        if include("ApproximateNumberOfMessagesNotVisible") {
            result.insert(
                "ApproximateNumberOfMessagesNotVisible".into(),
                self.not_visible_count().to_string(),
            );
        }
        // Stubbed for API parity.
        if include("CreatedTimestamp") {
            result.insert("CreatedTimestamp".into(), "0000000000".into());
        }
        if include("LastModifiedTimestamp") {
            result.insert("LastModifiedTimestamp".into(), "0000000000".into());
        }
        if include("QueueArn") {
            result.insert("QueueArn".into(), self.arn.clone());
        }
        if include("RedrivePolicy") {
            if let Some(ref rp) = self.attributes.redrive_policy {
                result.insert("RedrivePolicy".into(), rp.to_json());
            }
        }
        result
    }
}

fn parse_non_negative(key: &str, value: &str) -> Result<u32, SqsError> {
    value.parse::<u32>().map_err(|_| {
        SqsError::InvalidParameterValue(format!("Invalid value for {key}: {value}"))
    })
}
