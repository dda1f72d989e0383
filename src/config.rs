//! YAML environment configuration: a top-level map from environment name
//! to settings, with seeded queues, topics, and subscriptions, plus a
//! polling hot-reload task that atomically replaces both registries.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::sns::state::SnsState;
use crate::sns::topic::{parse_filter_policy, Subscription, Topic};
use crate::sqs::queue::{Queue, QueueAttributes, RedrivePolicy};
use crate::sqs::state::SqsState;
use crate::timing::RandomLatency;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_yaml::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "unable to read config: {e}"),
            ConfigError::Parse(e) => write!(f, "unable to parse config: {e}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct EnvironmentConfig {
    pub host: String,
    pub port: u16,
    pub sqs_port: u16,
    pub sns_port: u16,
    pub region: String,
    #[serde(rename = "AccountID")]
    pub account_id: String,
    pub log_to_file: bool,
    pub log_file: String,
    pub enable_duplicates: bool,
    pub queue_attribute_defaults: QueueAttributeDefaults,
    pub queues: Vec<QueueConfig>,
    pub topics: Vec<TopicConfig>,
    pub random_latency: RandomLatency,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        EnvironmentConfig {
            host: "localhost".into(),
            port: 4100,
            sqs_port: 0,
            sns_port: 0,
            region: "local".into(),
            account_id: "queue".into(),
            log_to_file: false,
            log_file: "./aws-messaging-local.log".into(),
            enable_duplicates: false,
            queue_attribute_defaults: QueueAttributeDefaults::default(),
            queues: Vec::new(),
            topics: Vec::new(),
            random_latency: RandomLatency::default(),
        }
    }
}

impl EnvironmentConfig {
    /// Separate listeners only when both service ports are configured.
    pub fn split_ports(&self) -> Option<(u16, u16)> {
        if self.sqs_port != 0 && self.sns_port != 0 {
            Some((self.sqs_port, self.sns_port))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct QueueAttributeDefaults {
    pub visibility_timeout: u32,
    pub delay_seconds: u32,
    pub maximum_message_size: u32,
    pub message_retention_period: u32,
    pub receive_message_wait_time_seconds: u32,
}

impl Default for QueueAttributeDefaults {
    fn default() -> Self {
        let base = QueueAttributes::default();
        QueueAttributeDefaults {
            visibility_timeout: base.visibility_timeout,
            delay_seconds: base.delay_seconds,
            maximum_message_size: base.maximum_message_size,
            message_retention_period: base.message_retention_period,
            receive_message_wait_time_seconds: base.receive_message_wait_time_seconds,
        }
    }
}

impl QueueAttributeDefaults {
    pub fn to_attributes(&self) -> QueueAttributes {
        QueueAttributes {
            visibility_timeout: self.visibility_timeout,
            delay_seconds: self.delay_seconds,
            maximum_message_size: self.maximum_message_size,
            message_retention_period: self.message_retention_period,
            receive_message_wait_time_seconds: self.receive_message_wait_time_seconds,
            redrive_policy: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct QueueConfig {
    pub name: String,
    pub visibility_timeout: Option<u32>,
    pub delay_seconds: Option<u32>,
    pub maximum_message_size: Option<u32>,
    pub message_retention_period: Option<u32>,
    pub receive_message_wait_time_seconds: Option<u32>,
    pub redrive_policy: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct TopicConfig {
    pub name: String,
    pub subscriptions: Vec<TopicSubscriptionConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct TopicSubscriptionConfig {
    pub queue_name: String,
    pub raw: bool,
    pub filter_policy: Option<String>,
}

pub fn load_file(path: &Path) -> Result<HashMap<String, EnvironmentConfig>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
    serde_yaml::from_str(&text).map_err(ConfigError::Parse)
}

/// Loads one environment, falling back to built-in defaults when the file
/// or the environment is missing.
pub fn load_environment(path: &Path, environment: &str) -> EnvironmentConfig {
    match load_file(path) {
        Ok(mut environments) => match environments.remove(environment) {
            Some(env) => env,
            None => {
                warn!(environment, path = %path.display(), "environment not found, using defaults");
                EnvironmentConfig::default()
            }
        },
        Err(err) => {
            warn!(error = %err, "using default configuration");
            EnvironmentConfig::default()
        }
    }
}

/// Builds the queue registry from config. Redrive policies are applied in
/// a second pass so a DLQ may be declared after its source queue.
pub fn build_queues(env: &EnvironmentConfig, sqs: &SqsState) -> Vec<Queue> {
    let mut queues: Vec<Queue> = Vec::new();

    for qc in &env.queues {
        if qc.name.is_empty() {
            warn!("skipping queue config without a name");
            continue;
        }
        let mut queue = sqs.new_queue(&qc.name);
        if let Some(v) = qc.visibility_timeout {
            queue.attributes.visibility_timeout = v;
        }
        if let Some(v) = qc.delay_seconds {
            queue.attributes.delay_seconds = v;
        }
        if let Some(v) = qc.maximum_message_size {
            queue.attributes.maximum_message_size = v;
        }
        if let Some(v) = qc.message_retention_period {
            queue.attributes.message_retention_period = v;
        }
        if let Some(v) = qc.receive_message_wait_time_seconds {
            queue.attributes.receive_message_wait_time_seconds = v;
        }
        queues.push(queue);
    }

    // Subscription targets that were never declared as queues.
    for tc in &env.topics {
        for sc in &tc.subscriptions {
            if !sc.queue_name.is_empty() && !queues.iter().any(|q| q.name == sc.queue_name) {
                queues.push(sqs.new_queue(&sc.queue_name));
            }
        }
    }

    for qc in &env.queues {
        let Some(ref policy_json) = qc.redrive_policy else {
            continue;
        };
        match RedrivePolicy::from_json(policy_json) {
            Ok(policy) => {
                let dlq = policy.dead_letter_queue_name().to_string();
                if queues.iter().any(|q| q.name == dlq) {
                    if let Some(queue) = queues.iter_mut().find(|q| q.name == qc.name) {
                        queue.attributes.redrive_policy = Some(policy);
                    }
                } else {
                    warn!(queue = %qc.name, dlq = %dlq, "redrive policy references unknown queue, ignoring");
                }
            }
            Err(err) => {
                warn!(queue = %qc.name, error = err.message(), "invalid redrive policy, ignoring");
            }
        }
    }

    queues
}

pub fn build_topics(env: &EnvironmentConfig, sqs: &SqsState, sns: &SnsState) -> Vec<Topic> {
    let mut topics = Vec::new();
    for tc in &env.topics {
        if tc.name.is_empty() {
            warn!("skipping topic config without a name");
            continue;
        }
        let arn = sns.topic_arn(&tc.name);
        let mut topic = Topic::new(tc.name.clone(), arn.clone());
        for sc in &tc.subscriptions {
            if sc.queue_name.is_empty() {
                continue;
            }
            let mut sub =
                Subscription::new(&arn, "sqs".to_string(), sqs.queue_arn(&sc.queue_name));
            sub.raw_delivery = sc.raw;
            if let Some(ref fp) = sc.filter_policy {
                match parse_filter_policy(fp) {
                    Ok(policy) => sub.filter_policy = Some(policy),
                    Err(err) => {
                        warn!(topic = %tc.name, queue = %sc.queue_name, error = err.message(),
                            "invalid filter policy, ignoring");
                    }
                }
            }
            topic.subscriptions.push(sub);
        }
        topics.push(topic);
    }
    topics
}

/// Replaces both registries from the environment config.
pub async fn seed(env: &EnvironmentConfig, sqs: &SqsState, sns: &SnsState) {
    sqs.replace_all(build_queues(env, sqs)).await;
    sns.replace_all(build_topics(env, sqs, sns)).await;
    info!(
        queues = env.queues.len(),
        topics = env.topics.len(),
        "loaded configuration"
    );
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

/// Polls the config file's mtime once per second and re-seeds both
/// registries when it changes. Parse failures keep the running state.
pub fn spawn_watcher(
    path: PathBuf,
    environment: String,
    sqs: Arc<SqsState>,
    sns: Arc<SnsState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = mtime(&path);
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let current = mtime(&path);
            if current.is_none() || current == last {
                continue;
            }
            last = current;
            match load_file(&path) {
                Ok(mut environments) => match environments.remove(&environment) {
                    Some(env) => {
                        info!(path = %path.display(), "configuration changed, reloading");
                        seed(&env, &sqs, &sns).await;
                    }
                    None => {
                        error!(environment = %environment, "environment missing after reload, keeping current state");
                    }
                },
                Err(err) => {
                    error!(error = %err, "config reload failed, keeping current state");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
Local:
  Host: localhost
  Port: 4100
  Region: local
  AccountID: queue
  EnableDuplicates: true
  QueueAttributeDefaults:
    VisibilityTimeout: 15
    ReceiveMessageWaitTimeSeconds: 5
  Queues:
    - Name: failed
    - Name: main
      VisibilityTimeout: 1
      RedrivePolicy: '{"maxReceiveCount": 2, "deadLetterTargetArn": "arn:aws:sqs::000000000000:failed"}'
  Topics:
    - Name: events
      Subscriptions:
        - QueueName: sink
          Raw: true
          FilterPolicy: '{"foo": ["bar"]}'
  RandomLatency:
    Min: 0
    Max: 0
"#;

    fn states(env: &EnvironmentConfig) -> (Arc<SqsState>, SnsState) {
        let sqs = Arc::new(SqsState::new(
            env.account_id.clone(),
            env.region.clone(),
            &env.host,
            env.port,
            env.queue_attribute_defaults.to_attributes(),
            env.enable_duplicates,
            env.random_latency,
        ));
        let sns = SnsState::new(
            env.account_id.clone(),
            env.region.clone(),
            &env.host,
            env.port,
            env.random_latency,
            sqs.clone(),
        );
        (sqs, sns)
    }

    #[test]
    fn parses_environment_map() {
        let environments: HashMap<String, EnvironmentConfig> =
            serde_yaml::from_str(SAMPLE).unwrap();
        let env = &environments["Local"];
        assert_eq!(env.host, "localhost");
        assert_eq!(env.port, 4100);
        assert!(env.enable_duplicates);
        assert_eq!(env.queue_attribute_defaults.visibility_timeout, 15);
        assert_eq!(env.queues.len(), 2);
        assert_eq!(env.queues[1].visibility_timeout, Some(1));
        assert_eq!(env.topics[0].subscriptions[0].queue_name, "sink");
        assert!(env.topics[0].subscriptions[0].raw);
    }

    #[test]
    fn defaults_match_documented_values() {
        let env = EnvironmentConfig::default();
        assert_eq!(env.host, "localhost");
        assert_eq!(env.port, 4100);
        assert_eq!(env.region, "local");
        assert_eq!(env.account_id, "queue");
        assert_eq!(env.queue_attribute_defaults.visibility_timeout, 30);
        assert_eq!(env.queue_attribute_defaults.maximum_message_size, 262144);
        assert!(env.split_ports().is_none());
    }

    #[test]
    fn split_ports_requires_both() {
        let mut env = EnvironmentConfig::default();
        env.sqs_port = 9324;
        assert!(env.split_ports().is_none());
        env.sns_port = 9911;
        assert_eq!(env.split_ports(), Some((9324, 9911)));
    }

    #[tokio::test]
    async fn seeding_builds_queues_topics_and_redrive() {
        let environments: HashMap<String, EnvironmentConfig> =
            serde_yaml::from_str(SAMPLE).unwrap();
        let env = &environments["Local"];
        let (sqs, sns) = states(env);

        seed(env, &sqs, &sns).await;

        assert!(sqs.queue_exists("main").await);
        assert!(sqs.queue_exists("failed").await);
        // Subscription target created even though never declared.
        assert!(sqs.queue_exists("sink").await);
        assert!(sns.topic_exists("arn:aws:sns:local:queue:events").await);

        let attrs = sqs
            .get_queue_attributes(crate::sqs::types::GetQueueAttributesRequest {
                queue_url: "http://localhost:4100/queue/main".into(),
                attribute_names: None,
            })
            .await
            .unwrap();
        assert_eq!(attrs.attributes["VisibilityTimeout"], "1");
        assert!(attrs.attributes["RedrivePolicy"].contains("failed"));

        // Defaults flow into undeclared attributes.
        let failed_attrs = sqs
            .get_queue_attributes(crate::sqs::types::GetQueueAttributesRequest {
                queue_url: "http://localhost:4100/queue/failed".into(),
                attribute_names: None,
            })
            .await
            .unwrap();
        assert_eq!(failed_attrs.attributes["VisibilityTimeout"], "15");
        assert_eq!(failed_attrs.attributes["ReceiveMessageWaitTimeSeconds"], "5");
    }

    #[tokio::test]
    async fn reseed_replaces_registries() {
        let environments: HashMap<String, EnvironmentConfig> =
            serde_yaml::from_str(SAMPLE).unwrap();
        let env = &environments["Local"];
        let (sqs, sns) = states(env);
        seed(env, &sqs, &sns).await;

        let mut trimmed = env.clone();
        trimmed.queues = vec![QueueConfig {
            name: "only".into(),
            ..QueueConfig::default()
        }];
        trimmed.topics.clear();
        seed(&trimmed, &sqs, &sns).await;

        assert!(sqs.queue_exists("only").await);
        assert!(!sqs.queue_exists("main").await);
        assert!(!sns.topic_exists("arn:aws:sns:local:queue:events").await);
    }

    #[test]
    fn invalid_redrive_is_dropped_not_fatal() {
        let mut env = EnvironmentConfig::default();
        env.queues = vec![QueueConfig {
            name: "solo".into(),
            redrive_policy: Some(
                r#"{"maxReceiveCount": 2, "deadLetterTargetArn": "arn:aws:sqs::queue:absent"}"#
                    .into(),
            ),
            ..QueueConfig::default()
        }];
        let (sqs, _) = states(&env);
        let queues = build_queues(&env, &sqs);
        assert_eq!(queues.len(), 1);
        assert!(queues[0].attributes.redrive_policy.is_none());
    }
}
