use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use aws_messaging_local::sns::server;
use aws_messaging_local::sns::state::SnsState;
use aws_messaging_local::sqs::queue::QueueAttributes;
use aws_messaging_local::sqs::state::SqsState;
use aws_messaging_local::sqs::types::ReceiveMessageRequest;
use aws_messaging_local::timing::RandomLatency;

fn services() -> (Arc<SqsState>, Arc<SnsState>) {
    let sqs = Arc::new(SqsState::new(
        "queue".into(),
        "local".into(),
        "localhost",
        4100,
        QueueAttributes::default(),
        false,
        RandomLatency::default(),
    ));
    let sns = Arc::new(SnsState::new(
        "queue".into(),
        "local".into(),
        "localhost",
        4100,
        RandomLatency::default(),
        sqs.clone(),
    ));
    (sqs, sns)
}

fn xml_tag(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_string())
}

async fn form_request(app: &axum::Router, body: String) -> (StatusCode, String) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/")
                .header("content-type", "application/x-www-form-urlencoded")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

async fn json_request(
    app: &axum::Router,
    action: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/")
                .header("content-type", "application/x-amz-json-1.0")
                .header("x-amz-target", format!("AmazonSNS.{action}"))
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value)
}

async fn queue_bodies(sqs: &SqsState, queue: &str) -> Vec<String> {
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

// --- End-to-end scenario: fan-out with filter, raw delivery ---

#[tokio::test]
async fn fanout_respects_filter_policy() {
    let (sqs, sns) = services();
    let app = server::router(sns.clone());

    let (status, body) = form_request(&app, "Action=CreateTopic&Name=t".to_string()).await;
    assert_eq!(status, StatusCode::OK);
    let topic_arn = xml_tag(&body, "TopicArn").unwrap();

    let (status, body) = form_request(
        &app,
        format!(
            "Action=Subscribe&TopicArn={topic_arn}&Protocol=sqs\
             &Endpoint=arn%3Aaws%3Asqs%3Alocal%3Aqueue%3Aq\
             &Attributes.entry.1.key=RawMessageDelivery&Attributes.entry.1.value=true\
             &Attributes.entry.2.key=FilterPolicy&Attributes.entry.2.value=%7B%22foo%22%3A%20%5B%22bar%22%5D%7D"
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(xml_tag(&body, "SubscriptionArn").unwrap().starts_with(&topic_arn));

    let (status, _) = form_request(
        &app,
        format!(
            "Action=Publish&TopicArn={topic_arn}&Message=hi\
             &MessageAttributes.entry.1.Name=foo\
             &MessageAttributes.entry.1.Value.DataType=String\
             &MessageAttributes.entry.1.Value.StringValue=bar"
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(queue_bodies(&sqs, "q").await, vec!["hi".to_string()]);

    let (status, _) = form_request(
        &app,
        format!(
            "Action=Publish&TopicArn={topic_arn}&Message=hi2\
             &MessageAttributes.entry.1.Name=foo\
             &MessageAttributes.entry.1.Value.DataType=String\
             &MessageAttributes.entry.1.Value.StringValue=baz"
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(queue_bodies(&sqs, "q").await.is_empty());
}

#[tokio::test]
async fn non_raw_fanout_wraps_envelope() {
    let (sqs, sns) = services();
    let app = server::router(sns.clone());

    let (_, body) = form_request(&app, "Action=CreateTopic&Name=wrapped".to_string()).await;
    let topic_arn = xml_tag(&body, "TopicArn").unwrap();

    form_request(
        &app,
        format!(
            "Action=Subscribe&TopicArn={topic_arn}&Protocol=sqs&Endpoint=arn%3Aaws%3Asqs%3Alocal%3Aqueue%3Asink"
        ),
    )
    .await;

    let (status, body) = form_request(
        &app,
        format!("Action=Publish&TopicArn={topic_arn}&Message=payload&Subject=greet"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let message_id = xml_tag(&body, "MessageId").unwrap();

    let bodies = queue_bodies(&sqs, "sink").await;
    let envelope: serde_json::Value = serde_json::from_str(&bodies[0]).unwrap();
    assert_eq!(envelope["Type"], "Notification");
    assert_eq!(envelope["MessageId"], message_id.as_str());
    assert_eq!(envelope["Message"], "payload");
    assert_eq!(envelope["Subject"], "greet");
    assert_eq!(envelope["SignatureVersion"], "1");
    assert!(envelope["Signature"].is_string());
    assert!(envelope["SigningCertURL"]
        .as_str()
        .unwrap()
        .ends_with("/SimpleNotificationService/local.pem"));
    assert!(envelope["UnsubscribeURL"]
        .as_str()
        .unwrap()
        .contains("Action=Unsubscribe"));
    assert!(envelope["Timestamp"].as_str().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn subscribe_confirm_flow_for_http_endpoints() {
    let (_sqs, sns) = services();
    let app = server::router(sns.clone());

    let (_, body) = form_request(&app, "Action=CreateTopic&Name=webby".to_string()).await;
    let topic_arn = xml_tag(&body, "TopicArn").unwrap();

    // Nothing listens on this port; the challenge POST fails and is only
    // logged, while the pending slot is recorded.
    let (status, _) = form_request(
        &app,
        format!(
            "Action=Subscribe&TopicArn={topic_arn}&Protocol=http&Endpoint=http%3A%2F%2F127.0.0.1%3A59999%2Fhook"
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let pending = sns.pending_confirmation(&topic_arn).await.unwrap();

    let (status, body) = form_request(
        &app,
        format!("Action=ConfirmSubscription&TopicArn={topic_arn}&Token=not-the-token"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(xml_tag(&body, "Code").unwrap(), "SubscriptionNotFound");

    let (status, body) = form_request(
        &app,
        format!(
            "Action=ConfirmSubscription&TopicArn={topic_arn}&Token={}",
            pending.token
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        xml_tag(&body, "SubscriptionArn").unwrap(),
        pending.subscription_arn
    );
}

#[tokio::test]
async fn subscription_lifecycle_over_wire() {
    let (_sqs, sns) = services();
    let app = server::router(sns);

    let (_, body) = form_request(&app, "Action=CreateTopic&Name=life".to_string()).await;
    let topic_arn = xml_tag(&body, "TopicArn").unwrap();

    let (_, body) = form_request(
        &app,
        format!(
            "Action=Subscribe&TopicArn={topic_arn}&Protocol=sqs&Endpoint=arn%3Aaws%3Asqs%3Alocal%3Aqueue%3Alq"
        ),
    )
    .await;
    let sub_arn = xml_tag(&body, "SubscriptionArn").unwrap();

    let (status, body) = form_request(
        &app,
        format!("Action=GetSubscriptionAttributes&SubscriptionArn={sub_arn}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("<key>RawMessageDelivery</key>"));
    assert!(body.contains("<key>PendingConfirmation</key><value>false</value>"));
    assert!(body.contains("<key>ConfirmationWasAuthenticated</key><value>true</value>"));

    let (status, body) = form_request(
        &app,
        format!("Action=ListSubscriptionsByTopic&TopicArn={topic_arn}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(&sub_arn));

    let (status, _) = form_request(
        &app,
        format!("Action=Unsubscribe&SubscriptionArn={sub_arn}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = form_request(
        &app,
        format!("Action=Unsubscribe&SubscriptionArn={sub_arn}"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(xml_tag(&body, "Code").unwrap(), "SubscriptionNotFound");
}

#[tokio::test]
async fn topic_errors_surface_as_404() {
    let (_sqs, sns) = services();
    let app = server::router(sns);

    let (status, body) = form_request(
        &app,
        "Action=DeleteTopic&TopicArn=arn%3Aaws%3Asns%3Alocal%3Aqueue%3Aghost".to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(xml_tag(&body, "Code").unwrap(), "TopicNotFound");
}

#[tokio::test]
async fn json_protocol_round_trip() {
    let (sqs, sns) = services();
    let app = server::router(sns);

    let (status, value) = json_request(&app, "CreateTopic", serde_json::json!({"Name": "jt"})).await;
    assert_eq!(status, StatusCode::OK);
    let topic_arn = value["TopicArn"].as_str().unwrap().to_string();

    let (status, value) = json_request(
        &app,
        "Subscribe",
        serde_json::json!({
            "TopicArn": topic_arn,
            "Protocol": "sqs",
            "Endpoint": "arn:aws:sqs:local:queue:jsink",
            "Attributes": {"RawMessageDelivery": "true"}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(value["SubscriptionArn"].as_str().unwrap().starts_with(&topic_arn));

    let (status, value) = json_request(
        &app,
        "Publish",
        serde_json::json!({"TopicArn": topic_arn, "Message": "json hi"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(value["MessageId"].is_string());
    assert_eq!(queue_bodies(&sqs, "jsink").await, vec!["json hi".to_string()]);
}

#[tokio::test]
async fn publish_batch_over_wire() {
    let (sqs, sns) = services();
    let app = server::router(sns);

    let (_, body) = form_request(&app, "Action=CreateTopic&Name=batchy".to_string()).await;
    let topic_arn = xml_tag(&body, "TopicArn").unwrap();
    form_request(
        &app,
        format!(
            "Action=Subscribe&TopicArn={topic_arn}&Protocol=sqs&Endpoint=arn%3Aaws%3Asqs%3Alocal%3Aqueue%3Absink\
             &Attributes.entry.1.key=RawMessageDelivery&Attributes.entry.1.value=true"
        ),
    )
    .await;

    let (status, body) = form_request(
        &app,
        format!(
            "Action=PublishBatch&TopicArn={topic_arn}\
             &PublishBatchRequestEntries.member.1.Id=a&PublishBatchRequestEntries.member.1.Message=one\
             &PublishBatchRequestEntries.member.2.Id=b&PublishBatchRequestEntries.member.2.Message=two"
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("<Id>a</Id>"));
    assert!(body.contains("<Id>b</Id>"));

    let mut bodies = queue_bodies(&sqs, "bsink").await;
    bodies.sort();
    assert_eq!(bodies, vec!["one".to_string(), "two".to_string()]);

    let (status, body) = form_request(
        &app,
        format!(
            "Action=PublishBatch&TopicArn={topic_arn}\
             &PublishBatchRequestEntries.member.1.Id=same&PublishBatchRequestEntries.member.1.Message=x\
             &PublishBatchRequestEntries.member.2.Id=same&PublishBatchRequestEntries.member.2.Message=y"
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(xml_tag(&body, "Code").unwrap(), "BatchEntryIdsNotDistinct");
}

#[tokio::test]
async fn signing_cert_route_serves_stub_pem() {
    let (_sqs, sns) = services();
    let app = server::router(sns);

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/SimpleNotificationService/local.pem")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.starts_with("-----BEGIN CERTIFICATE-----"));
}
