use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tracing::debug;

use super::error::SnsError;
use super::publish::{SIGNING_CERT_PATH, STUB_CERT_PEM};
use super::state::SnsState;
use super::types::*;
use crate::wire::{self, xml_escape, Params, Protocol};

pub const NS: &str = "http://sns.amazonaws.com/doc/2010-03-31/";
const JSON_SHAPE_PREFIX: &str = "com.amazonaws.sns";

pub fn router(state: Arc<SnsState>) -> Router {
    Router::new()
        .route("/", post(handle_root))
        .route(SIGNING_CERT_PATH, get(signing_cert))
        .with_state(state)
}

async fn signing_cert() -> Response {
    ([("content-type", "application/x-pem-file")], STUB_CERT_PEM).into_response()
}

async fn handle_root(
    State(state): State<Arc<SnsState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, headers, body).await
}

pub async fn handle(state: Arc<SnsState>, headers: HeaderMap, body: Bytes) -> Response {
    state.latency.apply().await;
    let protocol = wire::detect_protocol(&headers);
    let result = match protocol {
        Protocol::Json => handle_json(state, &headers, &body).await,
        Protocol::Query => handle_query(state, &headers, &body).await,
    };
    result.unwrap_or_else(|err| {
        debug!(code = err.error_code(), message = err.message(), "request failed");
        wire::error_response(
            protocol,
            NS,
            JSON_SHAPE_PREFIX,
            err.status_code(),
            err.error_code(),
            err.message(),
        )
    })
}

// --- JSON 1.0 protocol ---

macro_rules! dispatch {
    ($state:expr, $body:expr, $req_type:ty, $method:ident) => {{
        let req: $req_type = serde_json::from_slice($body)
            .map_err(|e| SnsError::InvalidParameterValue(e.to_string()))?;
        let resp = $state.$method(req).await?;
        Ok(wire::json_ok(&resp))
    }};
}

macro_rules! dispatch_empty {
    ($state:expr, $body:expr, $req_type:ty, $method:ident) => {{
        let req: $req_type = serde_json::from_slice($body)
            .map_err(|e| SnsError::InvalidParameterValue(e.to_string()))?;
        $state.$method(req).await?;
        Ok(wire::json_ok(&serde_json::json!({})))
    }};
}

async fn handle_json(
    state: Arc<SnsState>,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, SnsError> {
    let (_, action) = wire::json_action(headers)
        .ok_or_else(|| SnsError::InvalidAction("Missing X-Amz-Target header".into()))?;

    match action.as_str() {
        "CreateTopic" => dispatch!(state, body, CreateTopicRequest, create_topic),
        "DeleteTopic" => dispatch_empty!(state, body, DeleteTopicRequest, delete_topic),
        "ListTopics" => Ok(wire::json_ok(&state.list_topics().await)),
        "Subscribe" => dispatch!(state, body, SubscribeRequest, subscribe),
        "Unsubscribe" => dispatch_empty!(state, body, UnsubscribeRequest, unsubscribe),
        "ConfirmSubscription" => {
            dispatch!(state, body, ConfirmSubscriptionRequest, confirm_subscription)
        }
        "ListSubscriptions" => Ok(wire::json_ok(&state.list_subscriptions().await)),
        "ListSubscriptionsByTopic" => dispatch!(
            state,
            body,
            ListSubscriptionsByTopicRequest,
            list_subscriptions_by_topic
        ),
        "GetSubscriptionAttributes" => dispatch!(
            state,
            body,
            GetSubscriptionAttributesRequest,
            get_subscription_attributes
        ),
        "SetSubscriptionAttributes" => dispatch_empty!(
            state,
            body,
            SetSubscriptionAttributesRequest,
            set_subscription_attributes
        ),
        "Publish" => dispatch!(state, body, PublishRequest, publish),
        "PublishBatch" => dispatch!(state, body, PublishBatchRequest, publish_batch),
        _ => Err(SnsError::InvalidAction(format!("Unknown action: {action}"))),
    }
}

// --- Query protocol ---

async fn handle_query(
    state: Arc<SnsState>,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, SnsError> {
    let params = wire::parse_params(headers, body);
    let action = params
        .get("Action")
        .cloned()
        .ok_or_else(|| SnsError::InvalidAction("Missing Action parameter".into()))?;

    match action.as_str() {
        "CreateTopic" => handle_create_topic(state, &params).await,
        "DeleteTopic" => {
            state
                .delete_topic(DeleteTopicRequest {
                    topic_arn: require(&params, "TopicArn")?,
                })
                .await?;
            Ok(wire::xml_empty(NS, "DeleteTopic"))
        }
        "ListTopics" => handle_list_topics(state).await,
        "Subscribe" => handle_subscribe(state, &params).await,
        "Unsubscribe" => {
            state
                .unsubscribe(UnsubscribeRequest {
                    subscription_arn: require(&params, "SubscriptionArn")?,
                })
                .await?;
            Ok(wire::xml_empty(NS, "Unsubscribe"))
        }
        "ConfirmSubscription" => handle_confirm_subscription(state, &params).await,
        "ListSubscriptions" => {
            let resp = state.list_subscriptions().await;
            Ok(wire::xml_ok(
                NS,
                "ListSubscriptions",
                &subscriptions_xml(&resp.subscriptions),
            ))
        }
        "ListSubscriptionsByTopic" => {
            let resp = state
                .list_subscriptions_by_topic(ListSubscriptionsByTopicRequest {
                    topic_arn: require(&params, "TopicArn")?,
                })
                .await?;
            Ok(wire::xml_ok(
                NS,
                "ListSubscriptionsByTopic",
                &subscriptions_xml(&resp.subscriptions),
            ))
        }
        "GetSubscriptionAttributes" => handle_get_subscription_attributes(state, &params).await,
        "SetSubscriptionAttributes" => {
            state
                .set_subscription_attributes(SetSubscriptionAttributesRequest {
                    subscription_arn: require(&params, "SubscriptionArn")?,
                    attribute_name: require(&params, "AttributeName")?,
                    attribute_value: params.get("AttributeValue").cloned(),
                })
                .await?;
            Ok(wire::xml_empty(NS, "SetSubscriptionAttributes"))
        }
        "Publish" => handle_publish(state, &params).await,
        "PublishBatch" => handle_publish_batch(state, &params).await,
        _ => Err(SnsError::InvalidAction(format!("Unknown action: {action}"))),
    }
}

// --- form parsing helpers ---

fn require(params: &Params, key: &str) -> Result<String, SnsError> {
    params.get(key).cloned().ok_or_else(|| {
        SnsError::InvalidParameterValue(format!("Missing required parameter: {key}"))
    })
}

/// `MessageAttributes.entry.N.Name` + `.Value.DataType` / `.Value.StringValue`
/// / `.Value.BinaryValue` into an attribute map.
fn parse_message_attributes(
    params: &Params,
    prefix: &str,
) -> HashMap<String, MessageAttributeValue> {
    let mut map = HashMap::new();
    for i in 1.. {
        let Some(name) = params.get(&format!("{prefix}.entry.{i}.Name")) else {
            break;
        };
        let data_type = params
            .get(&format!("{prefix}.entry.{i}.Value.DataType"))
            .cloned()
            .unwrap_or_else(|| "String".to_string());
        map.insert(
            name.clone(),
            MessageAttributeValue {
                data_type,
                string_value: params
                    .get(&format!("{prefix}.entry.{i}.Value.StringValue"))
                    .cloned(),
                binary_value: params
                    .get(&format!("{prefix}.entry.{i}.Value.BinaryValue"))
                    .cloned(),
            },
        );
    }
    map
}

// --- query handlers ---

async fn handle_create_topic(state: Arc<SnsState>, params: &Params) -> Result<Response, SnsError> {
    let resp = state
        .create_topic(CreateTopicRequest {
            name: require(params, "Name")?,
        })
        .await?;
    Ok(wire::xml_ok(
        NS,
        "CreateTopic",
        &format!("    <TopicArn>{}</TopicArn>", xml_escape(&resp.topic_arn)),
    ))
}

async fn handle_list_topics(state: Arc<SnsState>) -> Result<Response, SnsError> {
    let resp = state.list_topics().await;
    let mut body = String::from("    <Topics>\n");
    for t in &resp.topics {
        body.push_str(&format!(
            "      <member><TopicArn>{}</TopicArn></member>\n",
            xml_escape(&t.topic_arn)
        ));
    }
    body.push_str("    </Topics>");
    Ok(wire::xml_ok(NS, "ListTopics", &body))
}

async fn handle_subscribe(state: Arc<SnsState>, params: &Params) -> Result<Response, SnsError> {
    let attributes = wire::parse_entry_pairs(params, "Attributes");
    let resp = state
        .subscribe(SubscribeRequest {
            topic_arn: require(params, "TopicArn")?,
            protocol: require(params, "Protocol")?,
            endpoint: params.get("Endpoint").cloned(),
            attributes: if attributes.is_empty() {
                None
            } else {
                Some(attributes)
            },
        })
        .await?;
    Ok(wire::xml_ok(
        NS,
        "Subscribe",
        &format!(
            "    <SubscriptionArn>{}</SubscriptionArn>",
            xml_escape(&resp.subscription_arn)
        ),
    ))
}

async fn handle_confirm_subscription(
    state: Arc<SnsState>,
    params: &Params,
) -> Result<Response, SnsError> {
    let resp = state
        .confirm_subscription(ConfirmSubscriptionRequest {
            topic_arn: require(params, "TopicArn")?,
            token: require(params, "Token")?,
        })
        .await?;
    Ok(wire::xml_ok(
        NS,
        "ConfirmSubscription",
        &format!(
            "    <SubscriptionArn>{}</SubscriptionArn>",
            xml_escape(&resp.subscription_arn)
        ),
    ))
}

fn subscriptions_xml(subs: &[SubscriptionEntry]) -> String {
    let mut body = String::from("    <Subscriptions>\n");
    for s in subs {
        body.push_str(&format!(
            "      <member>\n        <TopicArn>{}</TopicArn>\n        <Protocol>{}</Protocol>\n        <SubscriptionArn>{}</SubscriptionArn>\n        <Owner>{}</Owner>\n        <Endpoint>{}</Endpoint>\n      </member>\n",
            xml_escape(&s.topic_arn),
            xml_escape(&s.protocol),
            xml_escape(&s.subscription_arn),
            xml_escape(&s.owner),
            xml_escape(&s.endpoint),
        ));
    }
    body.push_str("    </Subscriptions>");
    body
}

async fn handle_get_subscription_attributes(
    state: Arc<SnsState>,
    params: &Params,
) -> Result<Response, SnsError> {
    let resp = state
        .get_subscription_attributes(GetSubscriptionAttributesRequest {
            subscription_arn: require(params, "SubscriptionArn")?,
        })
        .await?;

    let mut keys: Vec<&String> = resp.attributes.keys().collect();
    keys.sort();
    let mut body = String::from("    <Attributes>\n");
    for key in keys {
        body.push_str(&format!(
            "      <entry><key>{}</key><value>{}</value></entry>\n",
            xml_escape(key),
            xml_escape(&resp.attributes[key]),
        ));
    }
    body.push_str("    </Attributes>");
    Ok(wire::xml_ok(NS, "GetSubscriptionAttributes", &body))
}

async fn handle_publish(state: Arc<SnsState>, params: &Params) -> Result<Response, SnsError> {
    let attributes = parse_message_attributes(params, "MessageAttributes");
    let resp = state
        .publish(PublishRequest {
            topic_arn: params.get("TopicArn").cloned(),
            target_arn: params.get("TargetArn").cloned(),
            message: require(params, "Message")?,
            subject: params.get("Subject").cloned(),
            message_structure: params.get("MessageStructure").cloned(),
            message_attributes: if attributes.is_empty() {
                None
            } else {
                Some(attributes)
            },
        })
        .await?;
    Ok(wire::xml_ok(
        NS,
        "Publish",
        &format!("    <MessageId>{}</MessageId>", xml_escape(&resp.message_id)),
    ))
}

async fn handle_publish_batch(state: Arc<SnsState>, params: &Params) -> Result<Response, SnsError> {
    let mut entries = Vec::new();
    for i in 1.. {
        let prefix = format!("PublishBatchRequestEntries.member.{i}");
        let Some(id) = params.get(&format!("{prefix}.Id")) else {
            break;
        };
        let attributes = parse_message_attributes(params, &format!("{prefix}.MessageAttributes"));
        entries.push(PublishBatchEntry {
            id: id.clone(),
            message: require(params, &format!("{prefix}.Message"))?,
            subject: params.get(&format!("{prefix}.Subject")).cloned(),
            message_structure: params.get(&format!("{prefix}.MessageStructure")).cloned(),
            message_attributes: if attributes.is_empty() {
                None
            } else {
                Some(attributes)
            },
        });
    }

    let resp = state
        .publish_batch(PublishBatchRequest {
            topic_arn: require(params, "TopicArn")?,
            publish_batch_request_entries: entries,
        })
        .await?;

    let mut body = String::from("    <Successful>\n");
    for s in &resp.successful {
        body.push_str(&format!(
            "      <member><Id>{}</Id><MessageId>{}</MessageId></member>\n",
            xml_escape(&s.id),
            xml_escape(&s.message_id),
        ));
    }
    body.push_str("    </Successful>\n    <Failed>\n");
    for f in &resp.failed {
        body.push_str(&format!(
            "      <member><Id>{}</Id><Code>{}</Code><Message>{}</Message><SenderFault>{}</SenderFault></member>\n",
            xml_escape(&f.id),
            xml_escape(&f.code),
            xml_escape(&f.message),
            f.sender_fault,
        ));
    }
    body.push_str("    </Failed>");
    Ok(wire::xml_ok(NS, "PublishBatch", &body))
}
