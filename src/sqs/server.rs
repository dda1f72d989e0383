use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use tracing::debug;

use super::error::SqsError;
use super::state::SqsState;
use super::types::*;
use crate::wire::{self, xml_escape, Params, Protocol};

pub const NS: &str = "http://queue.amazonaws.com/doc/2012-11-05/";
const JSON_SHAPE_PREFIX: &str = "com.amazonaws.sqs";

pub fn router(state: Arc<SqsState>) -> Router {
    Router::new()
        .route("/", post(handle_root))
        .route("/queue/{queueName}", post(handle_queue_path))
        .with_state(state)
}

async fn handle_root(
    State(state): State<Arc<SqsState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, headers, body, None).await
}

async fn handle_queue_path(
    Path(queue_name): Path<String>,
    State(state): State<Arc<SqsState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, headers, body, Some(queue_name)).await
}

pub async fn handle(
    state: Arc<SqsState>,
    headers: HeaderMap,
    body: Bytes,
    path_queue: Option<String>,
) -> Response {
    state.latency.apply().await;
    let protocol = wire::detect_protocol(&headers);
    let result = match protocol {
        Protocol::Json => handle_json(state, &headers, &body, path_queue).await,
        Protocol::Query => handle_query(state, &headers, &body, path_queue).await,
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
    ($state:expr, $value:expr, $req_type:ty, $method:ident) => {{
        let req: $req_type = serde_json::from_value($value)
            .map_err(|e| SqsError::InvalidParameterValue(e.to_string()))?;
        let resp = $state.$method(req).await?;
        Ok(wire::json_ok(&resp))
    }};
}

macro_rules! dispatch_empty {
    ($state:expr, $value:expr, $req_type:ty, $method:ident) => {{
        let req: $req_type = serde_json::from_value($value)
            .map_err(|e| SqsError::InvalidParameterValue(e.to_string()))?;
        $state.$method(req).await?;
        Ok(wire::json_ok(&serde_json::json!({})))
    }};
}

async fn handle_json(
    state: Arc<SqsState>,
    headers: &HeaderMap,
    body: &Bytes,
    path_queue: Option<String>,
) -> Result<Response, SqsError> {
    let (_, action) = wire::json_action(headers)
        .ok_or_else(|| SqsError::InvalidAction("Missing X-Amz-Target header".into()))?;

    let mut value: serde_json::Value = if body.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_slice(body)
            .map_err(|e| SqsError::InvalidParameterValue(e.to_string()))?
    };
    // The path-qualified route supplies the queue when the body omits it.
    if let (Some(obj), Some(name)) = (value.as_object_mut(), path_queue) {
        obj.entry("QueueUrl")
            .or_insert(serde_json::Value::String(name));
    }

    match action.as_str() {
        "CreateQueue" => dispatch!(state, value, CreateQueueRequest, create_queue),
        "DeleteQueue" => dispatch_empty!(state, value, DeleteQueueRequest, delete_queue),
        "GetQueueUrl" => dispatch!(state, value, GetQueueUrlRequest, get_queue_url),
        "ListQueues" => {
            let req: ListQueuesRequest = serde_json::from_value(value)
                .map_err(|e| SqsError::InvalidParameterValue(e.to_string()))?;
            Ok(wire::json_ok(&state.list_queues(req).await))
        }
        "GetQueueAttributes" => {
            dispatch!(state, value, GetQueueAttributesRequest, get_queue_attributes)
        }
        "SetQueueAttributes" => {
            dispatch_empty!(state, value, SetQueueAttributesRequest, set_queue_attributes)
        }
        "PurgeQueue" => dispatch_empty!(state, value, PurgeQueueRequest, purge_queue),
        "SendMessage" => dispatch!(state, value, SendMessageRequest, send_message),
        "SendMessageBatch" => {
            dispatch!(state, value, SendMessageBatchRequest, send_message_batch)
        }
        "ReceiveMessage" => dispatch!(state, value, ReceiveMessageRequest, receive_message),
        "DeleteMessage" => dispatch_empty!(state, value, DeleteMessageRequest, delete_message),
        "DeleteMessageBatch" => {
            dispatch!(state, value, DeleteMessageBatchRequest, delete_message_batch)
        }
        "ChangeMessageVisibility" => dispatch_empty!(
            state,
            value,
            ChangeMessageVisibilityRequest,
            change_message_visibility
        ),
        _ => Err(SqsError::InvalidAction(format!("Unknown action: {action}"))),
    }
}

// --- Query protocol ---

async fn handle_query(
    state: Arc<SqsState>,
    headers: &HeaderMap,
    body: &Bytes,
    path_queue: Option<String>,
) -> Result<Response, SqsError> {
    let params = wire::parse_params(headers, body);
    let action = params
        .get("Action")
        .cloned()
        .ok_or_else(|| SqsError::InvalidAction("Missing Action parameter".into()))?;

    match action.as_str() {
        "CreateQueue" => handle_create_queue(state, &params).await,
        "DeleteQueue" => {
            let req = DeleteQueueRequest {
                queue_url: queue_url_param(&params, &path_queue)?,
            };
            state.delete_queue(req).await?;
            Ok(wire::xml_empty(NS, "DeleteQueue"))
        }
        "GetQueueUrl" => handle_get_queue_url(state, &params).await,
        "ListQueues" => handle_list_queues(state, &params).await,
        "GetQueueAttributes" => handle_get_queue_attributes(state, &params, &path_queue).await,
        "SetQueueAttributes" => {
            let req = SetQueueAttributesRequest {
                queue_url: queue_url_param(&params, &path_queue)?,
                attributes: wire::parse_name_value_pairs(&params, "Attribute"),
            };
            state.set_queue_attributes(req).await?;
            Ok(wire::xml_empty(NS, "SetQueueAttributes"))
        }
        "PurgeQueue" => {
            let req = PurgeQueueRequest {
                queue_url: queue_url_param(&params, &path_queue)?,
            };
            state.purge_queue(req).await?;
            Ok(wire::xml_empty(NS, "PurgeQueue"))
        }
        "SendMessage" => handle_send_message(state, &params, &path_queue).await,
        "SendMessageBatch" => handle_send_message_batch(state, &params, &path_queue).await,
        "ReceiveMessage" => handle_receive_message(state, &params, &path_queue).await,
        "DeleteMessage" => {
            let req = DeleteMessageRequest {
                queue_url: queue_url_param(&params, &path_queue)?,
                receipt_handle: require(&params, "ReceiptHandle")?,
            };
            state.delete_message(req).await?;
            Ok(wire::xml_empty(NS, "DeleteMessage"))
        }
        "DeleteMessageBatch" => handle_delete_message_batch(state, &params, &path_queue).await,
        "ChangeMessageVisibility" => {
            let req = ChangeMessageVisibilityRequest {
                queue_url: queue_url_param(&params, &path_queue)?,
                receipt_handle: require(&params, "ReceiptHandle")?,
                visibility_timeout: parse_u32(&params, "VisibilityTimeout")?.ok_or_else(|| {
                    SqsError::InvalidParameterValue(
                        "Missing required parameter: VisibilityTimeout".into(),
                    )
                })?,
            };
            state.change_message_visibility(req).await?;
            Ok(wire::xml_empty(NS, "ChangeMessageVisibility"))
        }
        _ => Err(SqsError::InvalidAction(format!("Unknown action: {action}"))),
    }
}

// --- form parsing helpers ---

fn require(params: &Params, key: &str) -> Result<String, SqsError> {
    params.get(key).cloned().ok_or_else(|| {
        SqsError::InvalidParameterValue(format!("Missing required parameter: {key}"))
    })
}

fn queue_url_param(params: &Params, path_queue: &Option<String>) -> Result<String, SqsError> {
    params
        .get("QueueUrl")
        .cloned()
        .or_else(|| path_queue.clone())
        .ok_or_else(|| {
            SqsError::InvalidParameterValue("Missing required parameter: QueueUrl".into())
        })
}

fn parse_u32(params: &Params, key: &str) -> Result<Option<u32>, SqsError> {
    match params.get(key) {
        None => Ok(None),
        Some(v) => v.parse::<u32>().map(Some).map_err(|_| {
            SqsError::InvalidParameterValue(format!("Invalid value for {key}: {v}"))
        }),
    }
}

/// `Prefix.N.Name` + `Prefix.N.Value.DataType` / `.StringValue` /
/// `.BinaryValue` into an attribute map.
fn parse_message_attributes(
    params: &Params,
    prefix: &str,
) -> HashMap<String, MessageAttributeValue> {
    let mut map = HashMap::new();
    for i in 1.. {
        let Some(name) = params.get(&format!("{prefix}.{i}.Name")) else {
            break;
        };
        let data_type = params
            .get(&format!("{prefix}.{i}.Value.DataType"))
            .cloned()
            .unwrap_or_else(|| "String".to_string());
        map.insert(
            name.clone(),
            MessageAttributeValue {
                data_type,
                string_value: params.get(&format!("{prefix}.{i}.Value.StringValue")).cloned(),
                binary_value: params.get(&format!("{prefix}.{i}.Value.BinaryValue")).cloned(),
            },
        );
    }
    map
}

// --- query handlers ---

async fn handle_create_queue(
    state: Arc<SqsState>,
    params: &Params,
) -> Result<Response, SqsError> {
    let attributes = wire::parse_name_value_pairs(params, "Attribute");
    let req = CreateQueueRequest {
        queue_name: require(params, "QueueName")?,
        attributes: if attributes.is_empty() {
            None
        } else {
            Some(attributes)
        },
    };
    let resp = state.create_queue(req).await?;
    Ok(wire::xml_ok(
        NS,
        "CreateQueue",
        &format!("    <QueueUrl>{}</QueueUrl>", xml_escape(&resp.queue_url)),
    ))
}

async fn handle_get_queue_url(
    state: Arc<SqsState>,
    params: &Params,
) -> Result<Response, SqsError> {
    let resp = state
        .get_queue_url(GetQueueUrlRequest {
            queue_name: require(params, "QueueName")?,
        })
        .await?;
    Ok(wire::xml_ok(
        NS,
        "GetQueueUrl",
        &format!("    <QueueUrl>{}</QueueUrl>", xml_escape(&resp.queue_url)),
    ))
}

async fn handle_list_queues(
    state: Arc<SqsState>,
    params: &Params,
) -> Result<Response, SqsError> {
    let resp = state
        .list_queues(ListQueuesRequest {
            queue_name_prefix: params.get("QueueNamePrefix").cloned(),
        })
        .await;
    let mut body = String::new();
    for url in resp.queue_urls.unwrap_or_default() {
        body.push_str(&format!("    <QueueUrl>{}</QueueUrl>\n", xml_escape(&url)));
    }
    Ok(wire::xml_ok(NS, "ListQueues", body.trim_end_matches('\n')))
}

async fn handle_get_queue_attributes(
    state: Arc<SqsState>,
    params: &Params,
    path_queue: &Option<String>,
) -> Result<Response, SqsError> {
    let names = wire::parse_string_list(params, "AttributeName");
    let req = GetQueueAttributesRequest {
        queue_url: queue_url_param(params, path_queue)?,
        attribute_names: if names.is_empty() { None } else { Some(names) },
    };
    let resp = state.get_queue_attributes(req).await?;

    let mut keys: Vec<&String> = resp.attributes.keys().collect();
    keys.sort();
    let mut body = String::new();
    for key in keys {
        body.push_str(&format!(
            "    <Attribute><Name>{}</Name><Value>{}</Value></Attribute>\n",
            xml_escape(key),
            xml_escape(&resp.attributes[key]),
        ));
    }
    Ok(wire::xml_ok(
        NS,
        "GetQueueAttributes",
        body.trim_end_matches('\n'),
    ))
}

fn send_result_xml(
    message_id: &str,
    md5_of_body: &str,
    md5_of_attrs: &Option<String>,
    sequence_number: &Option<String>,
) -> String {
    let mut body = format!(
        "    <MD5OfMessageBody>{}</MD5OfMessageBody>\n    <MessageId>{}</MessageId>",
        xml_escape(md5_of_body),
        xml_escape(message_id),
    );
    if let Some(md5) = md5_of_attrs {
        body.push_str(&format!(
            "\n    <MD5OfMessageAttributes>{}</MD5OfMessageAttributes>",
            xml_escape(md5)
        ));
    }
    if let Some(seq) = sequence_number {
        body.push_str(&format!(
            "\n    <SequenceNumber>{}</SequenceNumber>",
            xml_escape(seq)
        ));
    }
    body
}

async fn handle_send_message(
    state: Arc<SqsState>,
    params: &Params,
    path_queue: &Option<String>,
) -> Result<Response, SqsError> {
    let attributes = parse_message_attributes(params, "MessageAttribute");
    let req = SendMessageRequest {
        queue_url: queue_url_param(params, path_queue)?,
        message_body: require(params, "MessageBody")?,
        delay_seconds: parse_u32(params, "DelaySeconds")?,
        message_attributes: if attributes.is_empty() {
            None
        } else {
            Some(attributes)
        },
        message_deduplication_id: params.get("MessageDeduplicationId").cloned(),
        message_group_id: params.get("MessageGroupId").cloned(),
    };
    let resp = state.send_message(req).await?;
    Ok(wire::xml_ok(
        NS,
        "SendMessage",
        &send_result_xml(
            &resp.message_id,
            &resp.md5_of_message_body,
            &resp.md5_of_message_attributes,
            &resp.sequence_number,
        ),
    ))
}

fn batch_error_xml(failed: &[BatchResultErrorEntry]) -> String {
    let mut body = String::new();
    for f in failed {
        body.push_str(&format!(
            "    <BatchResultErrorEntry><Id>{}</Id><Code>{}</Code><Message>{}</Message><SenderFault>{}</SenderFault></BatchResultErrorEntry>\n",
            xml_escape(&f.id),
            xml_escape(&f.code),
            xml_escape(&f.message),
            f.sender_fault,
        ));
    }
    body
}

async fn handle_send_message_batch(
    state: Arc<SqsState>,
    params: &Params,
    path_queue: &Option<String>,
) -> Result<Response, SqsError> {
    let mut entries = Vec::new();
    for i in 1.. {
        let prefix = format!("SendMessageBatchRequestEntry.{i}");
        let Some(id) = params.get(&format!("{prefix}.Id")) else {
            break;
        };
        let attributes = parse_message_attributes(params, &format!("{prefix}.MessageAttribute"));
        entries.push(SendMessageBatchEntry {
            id: id.clone(),
            message_body: require(params, &format!("{prefix}.MessageBody"))?,
            delay_seconds: parse_u32(params, &format!("{prefix}.DelaySeconds"))?,
            message_attributes: if attributes.is_empty() {
                None
            } else {
                Some(attributes)
            },
            message_deduplication_id: params.get(&format!("{prefix}.MessageDeduplicationId")).cloned(),
            message_group_id: params.get(&format!("{prefix}.MessageGroupId")).cloned(),
        });
    }

    let resp = state
        .send_message_batch(SendMessageBatchRequest {
            queue_url: queue_url_param(params, path_queue)?,
            entries,
        })
        .await?;

    let mut body = String::new();
    for s in &resp.successful {
        body.push_str(&format!(
            "    <SendMessageBatchResultEntry>\n      <Id>{}</Id>\n{}\n    </SendMessageBatchResultEntry>\n",
            xml_escape(&s.id),
            send_result_xml(
                &s.message_id,
                &s.md5_of_message_body,
                &s.md5_of_message_attributes,
                &s.sequence_number,
            )
            .replace("    <", "      <"),
        ));
    }
    body.push_str(&batch_error_xml(&resp.failed));
    Ok(wire::xml_ok(
        NS,
        "SendMessageBatch",
        body.trim_end_matches('\n'),
    ))
}

fn message_xml(m: &ReceiveMessageResult) -> String {
    let mut body = format!(
        "    <Message>\n      <MessageId>{}</MessageId>\n      <ReceiptHandle>{}</ReceiptHandle>\n      <MD5OfBody>{}</MD5OfBody>\n      <Body>{}</Body>\n",
        xml_escape(&m.message_id),
        xml_escape(&m.receipt_handle),
        xml_escape(&m.md5_of_body),
        xml_escape(&m.body),
    );
    if let Some(ref md5) = m.md5_of_message_attributes {
        body.push_str(&format!(
            "      <MD5OfMessageAttributes>{}</MD5OfMessageAttributes>\n",
            xml_escape(md5)
        ));
    }
    let mut attr_names: Vec<&String> = m.attributes.keys().collect();
    attr_names.sort();
    for name in attr_names {
        body.push_str(&format!(
            "      <Attribute><Name>{}</Name><Value>{}</Value></Attribute>\n",
            xml_escape(name),
            xml_escape(&m.attributes[name]),
        ));
    }
    if let Some(ref attrs) = m.message_attributes {
        let mut names: Vec<&String> = attrs.keys().collect();
        names.sort();
        for name in names {
            let attr = &attrs[name];
            let mut value = format!("<DataType>{}</DataType>", xml_escape(&attr.data_type));
            if let Some(ref sv) = attr.string_value {
                value.push_str(&format!("<StringValue>{}</StringValue>", xml_escape(sv)));
            }
            if let Some(ref bv) = attr.binary_value {
                value.push_str(&format!("<BinaryValue>{}</BinaryValue>", xml_escape(bv)));
            }
            body.push_str(&format!(
                "      <MessageAttribute><Name>{}</Name><Value>{}</Value></MessageAttribute>\n",
                xml_escape(name),
                value,
            ));
        }
    }
    body.push_str("    </Message>");
    body
}

async fn handle_receive_message(
    state: Arc<SqsState>,
    params: &Params,
    path_queue: &Option<String>,
) -> Result<Response, SqsError> {
    let req = ReceiveMessageRequest {
        queue_url: queue_url_param(params, path_queue)?,
        max_number_of_messages: parse_u32(params, "MaxNumberOfMessages")?,
        wait_time_seconds: parse_u32(params, "WaitTimeSeconds")?,
    };
    let resp = state.receive_message(req).await?;

    let body = resp
        .messages
        .unwrap_or_default()
        .iter()
        .map(message_xml)
        .collect::<Vec<_>>()
        .join("\n");
    Ok(wire::xml_ok(NS, "ReceiveMessage", &body))
}

async fn handle_delete_message_batch(
    state: Arc<SqsState>,
    params: &Params,
    path_queue: &Option<String>,
) -> Result<Response, SqsError> {
    let mut entries = Vec::new();
    for i in 1.. {
        let prefix = format!("DeleteMessageBatchRequestEntry.{i}");
        let Some(id) = params.get(&format!("{prefix}.Id")) else {
            break;
        };
        entries.push(DeleteMessageBatchEntry {
            id: id.clone(),
            receipt_handle: require(params, &format!("{prefix}.ReceiptHandle"))?,
        });
    }

    let resp = state
        .delete_message_batch(DeleteMessageBatchRequest {
            queue_url: queue_url_param(params, path_queue)?,
            entries,
        })
        .await?;

    let mut body = String::new();
    for s in &resp.successful {
        body.push_str(&format!(
            "    <DeleteMessageBatchResultEntry><Id>{}</Id></DeleteMessageBatchResultEntry>\n",
            xml_escape(&s.id),
        ));
    }
    body.push_str(&batch_error_xml(&resp.failed));
    Ok(wire::xml_ok(
        NS,
        "DeleteMessageBatch",
        body.trim_end_matches('\n'),
    ))
}
