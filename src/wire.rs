//! Shared pieces of the two AWS wire protocols: the form-encoded "query"
//! protocol answered with XML, and AWS JSON 1.0 dispatched by the
//! `X-Amz-Target` header.

use std::collections::HashMap;

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

pub type Params = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Query,
    Json,
}

pub fn detect_protocol(headers: &HeaderMap) -> Protocol {
    if headers.contains_key("x-amz-target") {
        return Protocol::Json;
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.starts_with("application/x-amz-json") {
        Protocol::Json
    } else {
        Protocol::Query
    }
}

/// Action name from `X-Amz-Target: AmazonSQS.SendMessage` style headers.
pub fn json_action(headers: &HeaderMap) -> Option<(String, String)> {
    let target = headers.get("x-amz-target")?.to_str().ok()?;
    let (service, action) = target.split_once('.')?;
    Some((service.to_string(), action.to_string()))
}

/// Parses a query-protocol body: urlencoded forms directly, multipart
/// forms via the boundary in the content type.
pub fn parse_params(headers: &HeaderMap, body: &[u8]) -> Params {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.starts_with("multipart/form-data") {
        return parse_multipart(content_type, body);
    }
    form_urlencoded::parse(body).into_owned().collect()
}

fn parse_multipart(content_type: &str, body: &[u8]) -> Params {
    let mut params = Params::new();
    let Some(boundary) = content_type
        .split("boundary=")
        .nth(1)
        .map(|b| b.trim_matches('"').trim())
    else {
        return params;
    };
    let delimiter = format!("--{boundary}");
    let text = String::from_utf8_lossy(body);
    for part in text.split(delimiter.as_str()) {
        let Some((head, value)) = part.split_once("\r\n\r\n") else {
            continue;
        };
        let Some(name) = head
            .split("name=\"")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
        else {
            continue;
        };
        let value = value.trim_end_matches("--").trim_end_matches("\r\n");
        params.insert(name.to_string(), value.to_string());
    }
    params
}

/// The action, wherever the protocol put it.
pub fn peek_action(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    match detect_protocol(headers) {
        Protocol::Json => json_action(headers).map(|(_, action)| action),
        Protocol::Query => parse_params(headers, body).remove("Action"),
    }
}

// --- Responses ---

pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

pub fn request_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn xml_ok(ns: &str, action: &str, result_body: &str) -> Response {
    let xml = format!(
        r#"<{action}Response xmlns="{ns}">
  <{action}Result>
{result_body}
  </{action}Result>
  <ResponseMetadata>
    <RequestId>{rid}</RequestId>
  </ResponseMetadata>
</{action}Response>"#,
        rid = request_id(),
    );
    (StatusCode::OK, [("content-type", "text/xml")], xml).into_response()
}

pub fn xml_empty(ns: &str, action: &str) -> Response {
    let xml = format!(
        r#"<{action}Response xmlns="{ns}">
  <{action}Result/>
  <ResponseMetadata>
    <RequestId>{rid}</RequestId>
  </ResponseMetadata>
</{action}Response>"#,
        rid = request_id(),
    );
    (StatusCode::OK, [("content-type", "text/xml")], xml).into_response()
}

pub fn json_ok<T: serde::Serialize>(value: &T) -> Response {
    axum::Json(serde_json::to_value(value).unwrap_or_default()).into_response()
}

pub fn error_response(
    protocol: Protocol,
    ns: &str,
    shape_prefix: &str,
    status: StatusCode,
    code: &str,
    message: &str,
) -> Response {
    match protocol {
        Protocol::Query => {
            let xml = format!(
                r#"<ErrorResponse xmlns="{ns}">
  <Error>
    <Type>Sender</Type>
    <Code>{code}</Code>
    <Message>{message}</Message>
  </Error>
  <RequestId>{rid}</RequestId>
</ErrorResponse>"#,
                code = xml_escape(code),
                message = xml_escape(message),
                rid = request_id(),
            );
            (status, [("content-type", "text/xml")], xml).into_response()
        }
        Protocol::Json => {
            let body = serde_json::json!({
                "__type": format!("{shape_prefix}#{code}"),
                "message": message,
            });
            (status, axum::Json(body)).into_response()
        }
    }
}

// --- Indexed query-parameter helpers (1-indexed, stop on first gap) ---

/// `Attribute.N.Name` / `Attribute.N.Value` pairs into a map.
pub fn parse_name_value_pairs(params: &Params, prefix: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for i in 1.. {
        let name_key = format!("{prefix}.{i}.Name");
        let value_key = format!("{prefix}.{i}.Value");
        match (params.get(&name_key), params.get(&value_key)) {
            (Some(name), Some(value)) => {
                map.insert(name.clone(), value.clone());
            }
            _ => break,
        }
    }
    map
}

/// `Prefix.entry.N.key` / `Prefix.entry.N.value` pairs into a map.
pub fn parse_entry_pairs(params: &Params, prefix: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for i in 1.. {
        let name_key = format!("{prefix}.entry.{i}.key");
        let value_key = format!("{prefix}.entry.{i}.value");
        match (params.get(&name_key), params.get(&value_key)) {
            (Some(name), Some(value)) => {
                map.insert(name.clone(), value.clone());
            }
            _ => break,
        }
    }
    map
}

/// `Prefix.N` values into a list.
pub fn parse_string_list(params: &Params, prefix: &str) -> Vec<String> {
    let mut items = Vec::new();
    for i in 1.. {
        match params.get(&format!("{prefix}.{i}")) {
            Some(value) => items.push(value.clone()),
            None => break,
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn form_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        headers
    }

    #[test]
    fn detects_json_by_target_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-target", HeaderValue::from_static("AmazonSQS.SendMessage"));
        assert_eq!(detect_protocol(&headers), Protocol::Json);
        assert_eq!(
            json_action(&headers),
            Some(("AmazonSQS".to_string(), "SendMessage".to_string()))
        );
    }

    #[test]
    fn detects_query_by_default() {
        assert_eq!(detect_protocol(&form_headers()), Protocol::Query);
    }

    #[test]
    fn parses_urlencoded_params() {
        let params = parse_params(&form_headers(), b"Action=SendMessage&MessageBody=hi%20there");
        assert_eq!(params["Action"], "SendMessage");
        assert_eq!(params["MessageBody"], "hi there");
    }

    #[test]
    fn parses_multipart_params() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("multipart/form-data; boundary=xyz"),
        );
        let body = "--xyz\r\nContent-Disposition: form-data; name=\"Action\"\r\n\r\nListQueues\r\n--xyz\r\nContent-Disposition: form-data; name=\"QueueNamePrefix\"\r\n\r\nlocal\r\n--xyz--\r\n";
        let params = parse_params(&headers, body.as_bytes());
        assert_eq!(params["Action"], "ListQueues");
        assert_eq!(params["QueueNamePrefix"], "local");
    }

    #[test]
    fn indexed_pairs_stop_on_first_gap() {
        let mut params = Params::new();
        params.insert("Attribute.1.Name".into(), "DelaySeconds".into());
        params.insert("Attribute.1.Value".into(), "5".into());
        params.insert("Attribute.3.Name".into(), "VisibilityTimeout".into());
        params.insert("Attribute.3.Value".into(), "10".into());

        let map = parse_name_value_pairs(&params, "Attribute");
        assert_eq!(map.len(), 1);
        assert_eq!(map["DelaySeconds"], "5");
    }

    #[test]
    fn xml_escaping_covers_markup() {
        assert_eq!(xml_escape("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&apos;");
    }
}
