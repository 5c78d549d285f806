//! Signed calls to the AWS Query APIs used by SQS and SNS.
//!
//! Both services accept form-encoded `Action=...&Version=...` POST requests
//! and answer with XML documents. Requests are signed with AWS Signature
//! Version 4 using static credentials, optionally with a session token.
//!
//! Responses are parsed into a small element tree ([`XmlNode`]) that the
//! provider queries by element name.

use crate::error::{BrokerError, ConfigurationError};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use url::Url;

#[cfg(test)]
#[path = "aws_query_tests.rs"]
mod tests;

// ============================================================================
// Error Types
// ============================================================================

/// Failures of a single Query API call
#[derive(Debug, thiserror::Error)]
pub(crate) enum AwsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("{code}: {message}")]
    Service {
        code: String,
        message: String,
        transient: bool,
    },

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl AwsError {
    /// Map into the bridge error taxonomy
    pub(crate) fn into_broker_error(
        self,
        backend: &'static str,
        operation: &'static str,
    ) -> BrokerError {
        match self {
            Self::Authentication(message) => BrokerError::AuthenticationFailed { backend, message },
            Self::Network(message) => BrokerError::ConnectionFailed { backend, message },
            Self::Service {
                code,
                message,
                transient,
            } => BrokerError::Backend {
                backend,
                operation,
                code,
                message,
                transient,
            },
            Self::Malformed(message) => BrokerError::MalformedResponse {
                backend,
                operation,
                message,
            },
        }
    }
}

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

const SIGNING_ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Static credentials used to sign requests
#[derive(Clone)]
pub(crate) struct AwsCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

/// AWS Signature Version 4 signer for one service in one region
#[derive(Clone)]
pub(crate) struct AwsV4Signer {
    credentials: AwsCredentials,
    region: String,
    service: &'static str,
}

impl AwsV4Signer {
    pub(crate) fn new(credentials: AwsCredentials, region: String, service: &'static str) -> Self {
        Self {
            credentials,
            region,
            service,
        }
    }

    /// Sign a request without query string.
    ///
    /// Returns the headers to add: `Authorization`, `x-amz-date` and, with a
    /// session token, `x-amz-security-token`.
    pub(crate) fn sign_request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        // Canonical headers must be sorted by name
        let mut canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let mut signed_headers = String::from("host;x-amz-date");
        if let Some(token) = &self.credentials.session_token {
            canonical_headers.push_str(&format!("x-amz-security-token:{}\n", token));
            signed_headers.push_str(";x-amz-security-token");
        }

        let payload_hash = hex::encode(Sha256::digest(body.as_bytes()));
        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method, path, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            SIGNING_ALGORITHM,
            amz_date,
            credential_scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signing_key = derive_signing_key(
            &self.credentials.secret_key,
            &date_stamp,
            &self.region,
            self.service,
        );
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            SIGNING_ALGORITHM,
            self.credentials.access_key,
            credential_scope,
            signed_headers,
            signature
        );

        let mut headers = vec![
            ("Authorization".to_string(), authorization),
            ("x-amz-date".to_string(), amz_date),
        ];
        if let Some(token) = &self.credentials.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers
    }
}

/// Derive the signing key through the 4-level HMAC chain:
/// secret -> date -> region -> service -> "aws4_request"
pub(crate) fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Vec<u8> {
    let k_secret = format!("AWS4{}", secret_key);
    let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

// ============================================================================
// Query API Client
// ============================================================================

/// Client for one Query API service endpoint
pub(crate) struct QueryApiClient {
    http_client: HttpClient,
    endpoint: Url,
    host: String,
    signer: AwsV4Signer,
    api_version: &'static str,
}

impl QueryApiClient {
    pub(crate) fn new(
        http_client: HttpClient,
        endpoint: &str,
        signer: AwsV4Signer,
        api_version: &'static str,
    ) -> Result<Self, ConfigurationError> {
        let endpoint = Url::parse(endpoint).map_err(|e| ConfigurationError::Invalid {
            message: format!("invalid endpoint '{}': {}", endpoint, e),
        })?;

        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ConfigurationError::Invalid {
                    message: format!("endpoint '{}' has no host", endpoint),
                })
            }
        };

        Ok(Self {
            http_client,
            endpoint,
            host,
            signer,
            api_version,
        })
    }

    pub(crate) fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    /// Invoke `action` with the given parameters and parse the XML reply
    pub(crate) async fn call(
        &self,
        action: &str,
        params: &[(&str, &str)],
    ) -> Result<XmlNode, AwsError> {
        let body = form_encode(action, self.api_version, params);
        let headers = self.signer.sign_request(
            "POST",
            &self.host,
            self.endpoint.path(),
            &body,
            &Utc::now(),
        );

        let mut request = self
            .http_client
            .post(self.endpoint.clone())
            .header("content-type", "application/x-www-form-urlencoded; charset=utf-8");
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                AwsError::Network(format!("Request timeout: {}", e))
            } else if e.is_connect() {
                AwsError::Network(format!("Connection failed: {}", e))
            } else {
                AwsError::Network(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .map_err(|e| AwsError::Network(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(parse_error_response(&response_body, status.as_u16()));
        }

        XmlNode::parse(&response_body)
    }
}

/// Build the form body; parameters keep their order
pub(crate) fn form_encode(action: &str, version: &str, params: &[(&str, &str)]) -> String {
    let mut pairs = vec![("Action", action), ("Version", version)];
    pairs.extend_from_slice(params);

    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// ============================================================================
// XML Responses
// ============================================================================

/// Element of a parsed XML response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct XmlNode {
    pub name: String,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    /// Parse a document into a tree rooted at a synthetic `#document` node
    pub(crate) fn parse(xml: &str) -> Result<Self, AwsError> {
        // Leaf text is kept verbatim; message bodies must survive unchanged.
        let mut reader = Reader::from_str(xml);

        let mut stack = vec![XmlNode {
            name: "#document".to_string(),
            ..Default::default()
        }];
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => stack.push(XmlNode {
                    name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
                    ..Default::default()
                }),
                Ok(Event::Empty(ref e)) => {
                    let node = XmlNode {
                        name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
                        ..Default::default()
                    };
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(node);
                    }
                }
                Ok(Event::Text(e)) => {
                    let text = e
                        .unescape()
                        .map_err(|e| AwsError::Malformed(format!("Failed to parse XML: {}", e)))?;
                    if let Some(node) = stack.last_mut() {
                        node.text.push_str(&text);
                    }
                }
                Ok(Event::CData(e)) => {
                    if let Some(node) = stack.last_mut() {
                        node.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                    }
                }
                Ok(Event::End(_)) => {
                    if stack.len() < 2 {
                        return Err(AwsError::Malformed("unbalanced closing tag".to_string()));
                    }
                    if let Some(mut node) = stack.pop() {
                        if !node.children.is_empty() {
                            node.text = node.text.trim().to_string();
                        }
                        if let Some(parent) = stack.last_mut() {
                            parent.children.push(node);
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(AwsError::Malformed(format!("XML parsing error: {}", e))),
                _ => {}
            }
            buf.clear();
        }

        if stack.len() != 1 {
            return Err(AwsError::Malformed("unexpected end of document".to_string()));
        }
        let mut document = stack.remove(0);
        document.text = document.text.trim().to_string();
        Ok(document)
    }

    /// First descendant (depth-first) with the given name
    pub(crate) fn find(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find_map(|child| {
            if child.name == name {
                Some(child)
            } else {
                child.find(name)
            }
        })
    }

    /// Text of the first descendant with the given name
    pub(crate) fn find_text(&self, name: &str) -> Option<&str> {
        self.find(name).map(|node| node.text.as_str())
    }

    /// Direct children with the given name
    pub(crate) fn children_named<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a XmlNode> + 'n
    where
        'a: 'n,
    {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// Text of the direct child with the given name
    pub(crate) fn child_text(&self, name: &str) -> Option<&str> {
        self.children
            .iter()
            .find(|child| child.name == name)
            .map(|node| node.text.as_str())
    }

    /// All descendants (depth-first) with the given name
    pub(crate) fn find_all<'a>(&'a self, name: &str) -> Vec<&'a XmlNode> {
        let mut found = Vec::new();
        for child in &self.children {
            if child.name == name {
                found.push(child);
            } else {
                found.extend(child.find_all(name));
            }
        }
        found
    }
}

/// Map an AWS error document onto [`AwsError`]
pub(crate) fn parse_error_response(xml: &str, status_code: u16) -> AwsError {
    let document = XmlNode::parse(xml).ok();
    let error = document.as_ref().and_then(|doc| doc.find("Error"));

    let code = error
        .and_then(|e| e.child_text("Code"))
        .unwrap_or("Unknown")
        .to_string();
    let message = error
        .and_then(|e| e.child_text("Message"))
        .unwrap_or("Unknown error")
        .to_string();

    match code.as_str() {
        "InvalidClientTokenId"
        | "UnrecognizedClientException"
        | "SignatureDoesNotMatch"
        | "IncompleteSignature"
        | "ExpiredToken"
        | "InvalidAccessKeyId"
        | "AccessDenied"
        | "AuthorizationError" => AwsError::Authentication(format!("{}: {}", code, message)),
        "Throttling"
        | "ThrottlingException"
        | "RequestThrottled"
        | "AWS.SimpleQueueService.RequestThrottled"
        | "ServiceUnavailable"
        | "InternalError"
        | "InternalFailure" => AwsError::Service {
            code,
            message,
            transient: true,
        },
        _ if status_code == 401 || status_code == 403 => {
            AwsError::Authentication(format!("{}: {}", code, message))
        }
        _ => AwsError::Service {
            code,
            message,
            transient: status_code >= 500,
        },
    }
}
