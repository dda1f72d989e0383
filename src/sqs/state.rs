use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};

use super::error::SqsError;
use super::queue::{Queue, QueueAttributes};
use super::types::*;
use crate::timing::RandomLatency;

/// Granularity of the long-poll wait loop.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct QueueEntry {
    pub queue: Queue,
    pub notify: Arc<Notify>,
}

impl QueueEntry {
    fn new(queue: Queue) -> Self {
        QueueEntry {
            queue,
            notify: Arc::new(Notify::new()),
        }
    }
}

/// Process-wide queue registry. Mutations and the reaper hold the write
/// lock; listings run under the read lock.
pub struct SqsState {
    queues: RwLock<HashMap<String, QueueEntry>>,
    account_id: String,
    region: String,
    base_url: String,
    default_attributes: QueueAttributes,
    enable_duplicates: bool,
    pub latency: RandomLatency,
}

impl SqsState {
    pub fn new(
        account_id: String,
        region: String,
        host: &str,
        port: u16,
        default_attributes: QueueAttributes,
        enable_duplicates: bool,
        latency: RandomLatency,
    ) -> Self {
        SqsState {
            queues: RwLock::new(HashMap::new()),
            account_id,
            region,
            base_url: format!("http://{host}:{port}"),
            default_attributes,
            enable_duplicates,
            latency,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn queue_url(&self, name: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.account_id, name)
    }

    pub fn queue_arn(&self, name: &str) -> String {
        format!("arn:aws:sqs:{}:{}:{}", self.region, self.account_id, name)
    }

    pub fn new_queue(&self, name: &str) -> Queue {
        Queue::new(
            name.to_string(),
            self.queue_arn(name),
            self.queue_url(name),
            self.default_attributes.clone(),
            self.enable_duplicates,
        )
    }

    fn resolve_queue_name(queue_url: &str) -> Result<String, SqsError> {
        queue_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(String::from)
            .ok_or_else(|| SqsError::QueueNotFound("Invalid queue URL".into()))
    }

    fn validate_batch_ids(ids: &[&String]) -> Result<(), SqsError> {
        if ids.is_empty() {
            return Err(SqsError::EmptyBatchRequest(
                "Batch request must contain at least one entry".into(),
            ));
        }
        if ids.len() > 10 {
            return Err(SqsError::TooManyEntriesInBatchRequest(
                "Batch request must contain at most 10 entries".into(),
            ));
        }
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(id.as_str()) {
                return Err(SqsError::BatchEntryIdsNotDistinct(
                    "Batch entry IDs must be distinct".into(),
                ));
            }
        }
        Ok(())
    }

    fn not_found() -> SqsError {
        SqsError::QueueNotFound("The specified queue does not exist".into())
    }

    // --- Queue management ---

    pub async fn create_queue(
        &self,
        req: CreateQueueRequest,
    ) -> Result<CreateQueueResponse, SqsError> {
        if req.queue_name.is_empty() {
            return Err(SqsError::InvalidParameterValue(
                "QueueName must not be empty".into(),
            ));
        }

        let mut queues = self.queues.write().await;

        // Idempotent: an existing queue is returned untouched.
        if let Some(entry) = queues.get(&req.queue_name) {
            return Ok(CreateQueueResponse {
                queue_url: entry.queue.url.clone(),
            });
        }

        let mut queue = self.new_queue(&req.queue_name);
        if let Some(ref attrs) = req.attributes {
            queue.attributes.apply(attrs)?;
        }
        if let Some(ref rp) = queue.attributes.redrive_policy {
            if !queues.contains_key(rp.dead_letter_queue_name()) {
                return Err(SqsError::InvalidAttributeValue(format!(
                    "RedrivePolicy references missing dead-letter queue: {}",
                    rp.dead_letter_queue_name()
                )));
            }
        }

        info!(queue = %req.queue_name, "creating queue");
        let url = queue.url.clone();
        queues.insert(req.queue_name, QueueEntry::new(queue));
        Ok(CreateQueueResponse { queue_url: url })
    }

    pub async fn delete_queue(&self, req: DeleteQueueRequest) -> Result<(), SqsError> {
        let name = Self::resolve_queue_name(&req.queue_url)?;
        let mut queues = self.queues.write().await;
        if queues.remove(&name).is_none() {
            return Err(Self::not_found());
        }
        info!(queue = %name, "deleted queue");
        Ok(())
    }

    pub async fn get_queue_url(
        &self,
        req: GetQueueUrlRequest,
    ) -> Result<GetQueueUrlResponse, SqsError> {
        let queues = self.queues.read().await;
        queues
            .get(&req.queue_name)
            .map(|e| GetQueueUrlResponse {
                queue_url: e.queue.url.clone(),
            })
            .ok_or_else(Self::not_found)
    }

    pub async fn list_queues(&self, req: ListQueuesRequest) -> ListQueuesResponse {
        let queues = self.queues.read().await;
        let mut names: Vec<&String> = queues.keys().collect();
        names.sort();
        if let Some(ref prefix) = req.queue_name_prefix {
            names.retain(|n| n.starts_with(prefix.as_str()));
        }
        let urls: Vec<String> = names.iter().map(|n| queues[*n].queue.url.clone()).collect();
        ListQueuesResponse {
            queue_urls: if urls.is_empty() { None } else { Some(urls) },
        }
    }

    pub async fn get_queue_attributes(
        &self,
        req: GetQueueAttributesRequest,
    ) -> Result<GetQueueAttributesResponse, SqsError> {
        let name = Self::resolve_queue_name(&req.queue_url)?;
        let queues = self.queues.read().await;
        let entry = queues.get(&name).ok_or_else(Self::not_found)?;
        Ok(GetQueueAttributesResponse {
            attributes: entry.queue.get_attributes(&req.attribute_names),
        })
    }

    pub async fn set_queue_attributes(
        &self,
        req: SetQueueAttributesRequest,
    ) -> Result<(), SqsError> {
        let name = Self::resolve_queue_name(&req.queue_url)?;
        let mut queues = self.queues.write().await;
        if !queues.contains_key(&name) {
            return Err(Self::not_found());
        }

        // Stage the change so a bad attribute leaves the queue untouched.
        let mut staged = queues[&name].queue.attributes.clone();
        staged.apply(&req.attributes)?;
        if let Some(ref rp) = staged.redrive_policy {
            if !queues.contains_key(rp.dead_letter_queue_name()) {
                return Err(SqsError::InvalidAttributeValue(format!(
                    "RedrivePolicy references missing dead-letter queue: {}",
                    rp.dead_letter_queue_name()
                )));
            }
        }
        queues.get_mut(&name).unwrap().queue.attributes = staged;
        Ok(())
    }

    pub async fn purge_queue(&self, req: PurgeQueueRequest) -> Result<(), SqsError> {
        let name = Self::resolve_queue_name(&req.queue_url)?;
        let mut queues = self.queues.write().await;
        let entry = queues.get_mut(&name).ok_or_else(Self::not_found)?;
        entry.queue.purge();
        info!(queue = %name, "purged queue");
        Ok(())
    }

    // --- Messages ---

    pub async fn send_message(
        &self,
        req: SendMessageRequest,
    ) -> Result<SendMessageResponse, SqsError> {
        let name = Self::resolve_queue_name(&req.queue_url)?;
        let mut queues = self.queues.write().await;
        let entry = queues.get_mut(&name).ok_or_else(Self::not_found)?;

        let outcome = entry.queue.send_message(
            req.message_body,
            req.message_attributes.unwrap_or_default(),
            req.delay_seconds,
            req.message_group_id.unwrap_or_default(),
            req.message_deduplication_id.unwrap_or_default(),
        )?;
        if outcome.appended {
            entry.notify.notify_waiters();
        }

        Ok(SendMessageResponse {
            message_id: outcome.message_id,
            md5_of_message_body: outcome.md5_of_message_body,
            md5_of_message_attributes: outcome.md5_of_message_attributes,
            sequence_number: outcome.sequence_number,
        })
    }

    pub async fn send_message_batch(
        &self,
        req: SendMessageBatchRequest,
    ) -> Result<SendMessageBatchResponse, SqsError> {
        let ids: Vec<&String> = req.entries.iter().map(|e| &e.id).collect();
        Self::validate_batch_ids(&ids)?;

        let name = Self::resolve_queue_name(&req.queue_url)?;
        let mut queues = self.queues.write().await;
        let entry = queues.get_mut(&name).ok_or_else(Self::not_found)?;

        let mut successful = Vec::new();
        let mut failed = Vec::new();
        let mut any_appended = false;

        for e in req.entries {
            match entry.queue.send_message(
                e.message_body,
                e.message_attributes.unwrap_or_default(),
                e.delay_seconds,
                e.message_group_id.unwrap_or_default(),
                e.message_deduplication_id.unwrap_or_default(),
            ) {
                Ok(outcome) => {
                    any_appended |= outcome.appended;
                    successful.push(SendMessageBatchResultEntry {
                        id: e.id,
                        message_id: outcome.message_id,
                        md5_of_message_body: outcome.md5_of_message_body,
                        md5_of_message_attributes: outcome.md5_of_message_attributes,
                        sequence_number: outcome.sequence_number,
                    });
                }
                Err(err) => {
                    failed.push(BatchResultErrorEntry {
                        id: e.id,
                        code: err.error_code().to_string(),
                        message: err.message().to_string(),
                        sender_fault: true,
                    });
                }
            }
        }

        if any_appended {
            entry.notify.notify_waiters();
        }
        Ok(SendMessageBatchResponse { successful, failed })
    }

    /// Long-poll receive: retries every 100 ms (or sooner, on append) until
    /// the wait deadline. Dropping the future (the client hanging up)
    /// abandons the wait.
    pub async fn receive_message(
        &self,
        req: ReceiveMessageRequest,
    ) -> Result<ReceiveMessageResponse, SqsError> {
        let name = Self::resolve_queue_name(&req.queue_url)?;
        let max = req.max_number_of_messages.unwrap_or(1).clamp(1, 10) as usize;

        let mut deadline: Option<Instant> = None;
        loop {
            let notify = {
                let mut queues = self.queues.write().await;
                let entry = queues.get_mut(&name).ok_or_else(Self::not_found)?;
                let results = entry.queue.receive_messages(max, &self.account_id);
                if !results.is_empty() {
                    return Ok(ReceiveMessageResponse {
                        messages: Some(results),
                    });
                }
                if deadline.is_none() {
                    let wait = req
                        .wait_time_seconds
                        .unwrap_or(entry.queue.attributes.receive_message_wait_time_seconds)
                        .min(20);
                    deadline = Some(Instant::now() + Duration::from_secs(wait as u64));
                }
                entry.notify.clone()
            };

            if Instant::now() >= deadline.unwrap() {
                return Ok(ReceiveMessageResponse { messages: None });
            }
            let _ = tokio::time::timeout(POLL_INTERVAL, notify.notified()).await;
        }
    }

    pub async fn delete_message(&self, req: DeleteMessageRequest) -> Result<(), SqsError> {
        let name = Self::resolve_queue_name(&req.queue_url)?;
        let mut queues = self.queues.write().await;
        let entry = queues.get_mut(&name).ok_or_else(|| {
            SqsError::MessageDoesNotExist("The specified queue does not exist".into())
        })?;
        entry.queue.delete_message(&req.receipt_handle)?;
        // Deleting can unlock a FIFO group, making its next message eligible.
        entry.notify.notify_waiters();
        Ok(())
    }

    pub async fn delete_message_batch(
        &self,
        req: DeleteMessageBatchRequest,
    ) -> Result<DeleteMessageBatchResponse, SqsError> {
        let ids: Vec<&String> = req.entries.iter().map(|e| &e.id).collect();
        Self::validate_batch_ids(&ids)?;

        let name = Self::resolve_queue_name(&req.queue_url)?;
        let mut queues = self.queues.write().await;
        let entry = queues.get_mut(&name).ok_or_else(|| {
            SqsError::MessageDoesNotExist("The specified queue does not exist".into())
        })?;

        let mut successful = Vec::new();
        let mut failed = Vec::new();
        for e in req.entries {
            match entry.queue.delete_message(&e.receipt_handle) {
                Ok(()) => successful.push(DeleteMessageBatchResultEntry { id: e.id }),
                Err(_) => failed.push(BatchResultErrorEntry {
                    id: e.id,
                    code: "1".to_string(),
                    message: "Message not found".to_string(),
                    sender_fault: true,
                }),
            }
        }
        entry.notify.notify_waiters();
        Ok(DeleteMessageBatchResponse { successful, failed })
    }

    pub async fn change_message_visibility(
        &self,
        req: ChangeMessageVisibilityRequest,
    ) -> Result<(), SqsError> {
        let name = Self::resolve_queue_name(&req.queue_url)?;
        let mut queues = self.queues.write().await;
        let entry = queues.get_mut(&name).ok_or_else(Self::not_found)?;
        let moved = entry
            .queue
            .change_message_visibility(&req.receipt_handle, req.visibility_timeout)?;
        if req.visibility_timeout == 0 {
            entry.notify.notify_waiters();
        }
        if let Some((dlq_name, msg)) = moved {
            match queues.get_mut(&dlq_name) {
                Some(target) => {
                    info!(queue = %name, dlq = %dlq_name, message_id = %msg.message_id,
                        "retry limit exceeded, moving message to dead-letter queue");
                    target.queue.messages.push_back(msg);
                    target.notify.notify_waiters();
                }
                None => {
                    warn!(queue = %name, dlq = %dlq_name, "dead-letter queue missing, dropping message");
                }
            }
        }
        Ok(())
    }

    // --- Fan-out sink ---

    /// Appends a topic-delivered message under the queue's lock.
    pub async fn deliver_from_topic(
        &self,
        queue_name: &str,
        body: String,
        attributes: HashMap<String, MessageAttributeValue>,
    ) -> Result<(), SqsError> {
        let mut queues = self.queues.write().await;
        let entry = queues.get_mut(queue_name).ok_or_else(Self::not_found)?;
        let outcome = entry.queue.send_message(
            body,
            attributes,
            None,
            String::new(),
            String::new(),
        )?;
        if outcome.appended {
            entry.notify.notify_waiters();
        }
        Ok(())
    }

    // --- Reaper & reload ---

    /// One reaper pass: expire deduplication entries, reset expired
    /// in-flight messages, and apply dead-letter transfers.
    pub async fn reap(&self) {
        let mut queues = self.queues.write().await;
        let now_utc = Utc::now();
        let now = Instant::now();

        let names: Vec<String> = queues.keys().cloned().collect();
        for name in names {
            let moved = {
                let entry = queues.get_mut(&name).unwrap();
                entry.queue.expire_dedup(now_utc);
                entry.queue.expire_visibility(now)
            };
            for (dlq_name, msg) in moved {
                match queues.get_mut(&dlq_name) {
                    Some(target) => {
                        info!(queue = %name, dlq = %dlq_name, message_id = %msg.message_id,
                            "retry limit exceeded, moving message to dead-letter queue");
                        target.queue.messages.push_back(msg);
                        target.notify.notify_waiters();
                    }
                    None => {
                        warn!(queue = %name, dlq = %dlq_name, "dead-letter queue missing, dropping message");
                    }
                }
            }
        }
    }

    /// Atomically replaces the registry, used by config hot reload.
    pub async fn replace_all(&self, replacement: Vec<Queue>) {
        let mut queues = self.queues.write().await;
        *queues = replacement
            .into_iter()
            .map(|q| (q.name.clone(), QueueEntry::new(q)))
            .collect();
    }

    /// Creates the queue with default attributes if it does not exist yet.
    pub async fn ensure_queue(&self, name: &str) {
        let mut queues = self.queues.write().await;
        if !queues.contains_key(name) {
            info!(queue = %name, "creating queue on demand");
            queues.insert(name.to_string(), QueueEntry::new(self.new_queue(name)));
        }
    }

    pub async fn queue_exists(&self, name: &str) -> bool {
        self.queues.read().await.contains_key(name)
    }
}
