//! Turns accumulated builder state into a wire-ready `HttpRequest`.
//!
//! # Design
//! Three layers contribute headers and parameters, most specific first:
//!
//! 1. the request builder,
//! 2. the optional `PreparationDelegate`,
//! 3. the service-wide generic headers (`Authorization`, `User-Agent`,
//!    `Accept`, `Content-Type`, `Content-Length`).
//!
//! The generic layer is applied last and always wins. A header name set by
//! more than one layer is a usage defect handled per `ViolationPolicy`; in
//! report mode the first value set between builder and delegate is kept.
//!
//! Parameters never override each other. For GET, HEAD and DELETE they are
//! appended to the query after whatever query the path already carried. For
//! POST and PUT, delegate parameters are merged into the body when its
//! serializer supports that, and appended to the query otherwise.

use std::sync::Arc;

use serde_json::{Map, Value};
use url::Url;

use crate::config::ViolationPolicy;
use crate::error::{BuilderError, ServiceError};
use crate::http::{
    find_header, ExpectedStatusCodes, HttpMethod, HttpRequest, QualityOfService, RequestBody, TaskKind,
};
use crate::multipart::{generate_boundary, MultipartBody, MultipartPart};
use crate::queue::CompletionQueue;
use crate::serializer::{form_pairs, SerializerRegistry, MIME_JSON};
use crate::tracker::DownloadTarget;
use crate::types::DeserializeTarget;

/// Supplies per-request headers and parameters, e.g. device or locale
/// information. Called synchronously while a request is prepared, so it must
/// return quickly.
pub trait PreparationDelegate: Send + Sync {
    fn additional_headers(&self, _method: HttpMethod, _url: &Url) -> Vec<(String, String)> {
        Vec::new()
    }

    fn additional_parameters(&self, _method: HttpMethod, _url: &Url) -> Map<String, Value> {
        Map::new()
    }
}

/// Everything a builder accumulated for one request.
pub(crate) struct RequestDraft {
    pub method: HttpMethod,
    /// Path relative to the base URL, or an absolute URL when `absolute`.
    pub path: String,
    pub absolute: bool,
    pub quality_of_service: QualityOfService,
    pub target: Option<DeserializeTarget>,
    pub raw_data: bool,
    pub content_encoding: Option<String>,
    pub headers: Vec<(String, String)>,
    pub expected_codes: ExpectedStatusCodes,
    pub parameters: Option<Map<String, Value>>,
    pub allows_background: bool,
    pub queue: Option<Arc<dyn CompletionQueue>>,
    pub parts: Vec<MultipartPart>,
    pub multipart: bool,
    pub as_upload: bool,
    pub download: Option<DownloadTarget>,
}

impl RequestDraft {
    pub fn new(method: HttpMethod, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            absolute: false,
            quality_of_service: QualityOfService::Default,
            target: None,
            raw_data: false,
            content_encoding: None,
            headers: Vec::new(),
            expected_codes: ExpectedStatusCodes::default(),
            parameters: None,
            allows_background: false,
            queue: None,
            parts: Vec::new(),
            multipart: false,
            as_upload: false,
            download: None,
        }
    }

    pub fn is_multipart(&self) -> bool {
        self.multipart || !self.parts.is_empty()
    }

    /// Sets a builder-layer header; a later value for the same name replaces
    /// the earlier one.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Submit-time validation of the accumulated state.
    pub fn validate(&self) -> Result<(), BuilderError> {
        if self.target.is_some() && self.raw_data {
            return Err(BuilderError::DeserializeAndRawData);
        }
        if self.parameters.is_some() && self.is_multipart() {
            return Err(BuilderError::BodyAndMultipart);
        }
        if self.multipart && self.parts.is_empty() {
            return Err(BuilderError::EmptyMultipart);
        }
        if self.as_upload && !self.method.carries_body() {
            return Err(BuilderError::UploadWithoutBody(self.method));
        }
        Ok(())
    }
}

pub(crate) struct RequestFactory {
    base_url: Url,
    user_agent: Option<String>,
    violations: ViolationPolicy,
    delegate: Option<Arc<dyn PreparationDelegate>>,
}

impl RequestFactory {
    pub fn new(base_url: Url, user_agent: Option<String>, violations: ViolationPolicy) -> Self {
        Self {
            base_url,
            user_agent,
            violations,
            delegate: None,
        }
    }

    pub fn set_delegate(&mut self, delegate: Arc<dyn PreparationDelegate>) {
        self.delegate = Some(delegate);
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn build(
        &self,
        draft: &RequestDraft,
        authorization: Option<&str>,
        serializers: &SerializerRegistry,
    ) -> Result<HttpRequest, ServiceError> {
        let mut url = self.resolve(draft)?;

        let (delegate_headers, delegate_parameters) = match &self.delegate {
            Some(delegate) if !draft.absolute => (
                delegate.additional_headers(draft.method, &url),
                delegate.additional_parameters(draft.method, &url),
            ),
            _ => (Vec::new(), Map::new()),
        };

        let mut content_type = None;
        let body = if draft.is_multipart() {
            append_query(&mut url, &delegate_parameters)?;
            let multipart = MultipartBody::new(draft.parts.clone(), generate_boundary());
            content_type = Some(multipart.content_type());
            RequestBody::Multipart(multipart)
        } else if draft.method.carries_body() {
            let encoding = draft.content_encoding.as_deref().unwrap_or(MIME_JSON);
            let serializer = serializers
                .explicit_serializer_for(encoding)
                .ok_or_else(|| BuilderError::UnknownContentEncoding(encoding.to_string()))?;
            let mut parameters = draft.parameters.clone();
            if serializer.supports_additional_parameters() && !delegate_parameters.is_empty() {
                let merged = parameters.get_or_insert_with(Map::new);
                for (key, value) in delegate_parameters {
                    merged.entry(key).or_insert(value);
                }
            } else {
                append_query(&mut url, &delegate_parameters)?;
            }
            match parameters {
                Some(parameters) => {
                    let bytes = serializer.serialize(&Value::Object(parameters), encoding)?;
                    content_type = Some(if serializer.appends_charset() {
                        format!("{encoding}; charset=utf-8")
                    } else {
                        encoding.to_string()
                    });
                    RequestBody::Bytes(bytes)
                }
                None => RequestBody::Empty,
            }
        } else {
            if let Some(parameters) = &draft.parameters {
                append_query(&mut url, parameters)?;
            }
            append_query(&mut url, &delegate_parameters)?;
            RequestBody::Empty
        };

        let mut headers = draft.headers.clone();
        for (name, value) in delegate_headers {
            if find_header(&headers, &name).is_some() {
                self.header_collision(&name, "the preparation delegate");
                continue;
            }
            headers.push((name, value));
        }

        let accept = if draft.raw_data || draft.download.is_some() {
            "*/*"
        } else {
            MIME_JSON
        };
        let mut generic: Vec<(&str, String)> = Vec::with_capacity(5);
        if let (Some(authorization), false) = (authorization, draft.absolute) {
            generic.push(("Authorization", authorization.to_string()));
        }
        if let Some(user_agent) = &self.user_agent {
            generic.push(("User-Agent", user_agent.clone()));
        }
        generic.push(("Accept", accept.to_string()));
        if let Some(content_type) = content_type {
            generic.push(("Content-Type", content_type));
        }
        match &body {
            RequestBody::Bytes(bytes) => generic.push(("Content-Length", bytes.len().to_string())),
            RequestBody::Multipart(multipart) => {
                generic.push(("Content-Length", multipart.content_length().to_string()))
            }
            RequestBody::Empty => {}
        }
        for (name, value) in generic {
            if let Some(position) = headers.iter().position(|(n, _)| n.eq_ignore_ascii_case(name)) {
                self.header_collision(name, "the service");
                headers.remove(position);
            }
            headers.push((name.to_string(), value));
        }

        let kind = if draft.download.is_some() {
            TaskKind::Download
        } else if draft.as_upload {
            TaskKind::Upload
        } else {
            TaskKind::Data
        };

        Ok(HttpRequest {
            method: draft.method,
            url,
            headers,
            body,
            kind,
            quality_of_service: draft.quality_of_service,
            allows_background: draft.allows_background,
        })
    }

    fn resolve(&self, draft: &RequestDraft) -> Result<Url, ServiceError> {
        if draft.absolute {
            let url = Url::parse(&draft.path)
                .map_err(|e| ServiceError::InvalidRequest(format!("invalid URL {}: {e}", draft.path)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ServiceError::InvalidRequest(format!(
                    "unsupported URL scheme in {}",
                    draft.path
                )));
            }
            return Ok(url);
        }

        let url = self
            .base_url
            .join(draft.path.trim_start_matches('/'))
            .map_err(|e| ServiceError::InvalidRequest(format!("invalid path {}: {e}", draft.path)))?;
        let same_origin = url.scheme() == self.base_url.scheme()
            && url.host_str() == self.base_url.host_str()
            && url.port_or_known_default() == self.base_url.port_or_known_default();
        if !same_origin {
            let message = format!("path {} escapes the service host {}", draft.path, self.base_url);
            match self.violations {
                ViolationPolicy::Panic => panic!("{message}"),
                ViolationPolicy::Report => {
                    tracing::warn!(path = %draft.path, "{message}");
                    return Err(ServiceError::InvalidRequest(message));
                }
            }
        }
        Ok(url)
    }

    fn header_collision(&self, name: &str, layer: &str) {
        match self.violations {
            ViolationPolicy::Panic => panic!("header {name} is also set by {layer}"),
            ViolationPolicy::Report => {
                tracing::warn!(header = name, layer, "header set more than once")
            }
        }
    }
}

fn append_query(url: &mut Url, parameters: &Map<String, Value>) -> Result<(), ServiceError> {
    if parameters.is_empty() {
        return Ok(());
    }
    let pairs = form_pairs(parameters)?;
    url.query_pairs_mut().extend_pairs(pairs);
    Ok(())
}
