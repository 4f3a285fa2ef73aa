use std::{collections::BTreeMap, fmt, fs, path::Path, str::FromStr};

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, HOST, USER_AGENT},
    Method, Url,
};

use crate::{error::BuildError, logging::RunLogger, params::RequestParam};

pub const USER_AGENT_TOKEN: &str = concat!("volley/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_CONTENT_TYPE: &str = "text/html";
const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Immutable skeleton of every outgoing request.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub host: Option<String>,
    pub basic_auth: Option<BasicAuth>,
    pub content_type: String,
}

impl RequestTemplate {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            host: None,
            basic_auth: None,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContentMode {
    #[default]
    Text,
    Json,
    Form,
}

impl FromStr for ContentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "" | "TEXT" => Ok(ContentMode::Text),
            "JSON" => Ok(ContentMode::Json),
            "FORM" | "DATA" => Ok(ContentMode::Form),
            other => Err(format!("unknown content mode '{other}'")),
        }
    }
}

impl fmt::Display for ContentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContentMode::Text => "TEXT",
            ContentMode::Json => "JSON",
            ContentMode::Form => "FORM",
        })
    }
}

/// A fully materialized request, owned by one attempt.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Materialize `template` with `param` as body according to `mode`.
pub fn build(
    template: &RequestTemplate,
    param: &RequestParam,
    mode: ContentMode,
    logger: &RunLogger,
) -> Result<PreparedRequest, BuildError> {
    let mut headers = template.headers.clone();

    let user_agent = match headers.get(USER_AGENT).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing} {USER_AGENT_TOKEN}"),
        _ => USER_AGENT_TOKEN.to_string(),
    };
    headers.insert(USER_AGENT, header_value(&user_agent, "user-agent")?);

    if let Some(host) = &template.host {
        headers.insert(HOST, header_value(host, "host")?);
    }

    if let Some(auth) = &template.basic_auth {
        let token = STANDARD.encode(format!("{}:{}", auth.username, auth.password));
        headers.insert(
            AUTHORIZATION,
            header_value(&format!("Basic {token}"), "authorization")?,
        );
    }

    let (body, content_type) = match mode {
        ContentMode::Text => (param.content.clone(), template.content_type.clone()),
        ContentMode::Json => (param.content.clone(), JSON_CONTENT_TYPE.to_string()),
        ContentMode::Form => {
            let form = MultipartForm::from_mapping(&param.content, logger)?;
            let content_type = form.content_type();
            (form.finish(), content_type)
        }
    };
    headers.insert(CONTENT_TYPE, header_value(&content_type, "content-type")?);

    Ok(PreparedRequest {
        method: template.method.clone(),
        url: template.url.clone(),
        headers,
        body,
    })
}

fn header_value(value: &str, name: &'static str) -> Result<HeaderValue, BuildError> {
    HeaderValue::from_str(value).map_err(|_| BuildError::Header(name))
}

/// multipart/form-data encoder for flat mappings. Produces the whole body up
/// front so it can be sent with a declared length.
struct MultipartForm {
    boundary: String,
    buf: BytesMut,
}

impl MultipartForm {
    fn new() -> Self {
        let mut rng = rand::rng();
        let boundary = (0..30)
            .map(|_| format!("{:02x}", rng.random::<u8>()))
            .collect::<String>();
        Self {
            boundary,
            buf: BytesMut::new(),
        }
    }

    /// Parse `{"field":"value","file":"@/path"}` into a form. Unreadable files
    /// are dropped with a warning; an empty result from a non-empty mapping is
    /// an error.
    fn from_mapping(raw: &[u8], logger: &RunLogger) -> Result<Self, BuildError> {
        let mapping: BTreeMap<String, String> = serde_json::from_slice(raw)?;
        let mut form = Self::new();
        let mut dropped = 0;

        let (files, fields): (Vec<_>, Vec<_>) =
            mapping.iter().partition(|(_, value)| value.starts_with('@'));

        for (key, value) in files {
            let path = &value[1..];
            match fs::read(path) {
                Ok(contents) => form.file(key, path, &contents),
                Err(err) => {
                    logger.form_field_skipped(key, path, &err);
                    dropped += 1;
                }
            }
        }
        for (key, value) in fields {
            form.field(key, value);
        }

        if !mapping.is_empty() && dropped == mapping.len() {
            return Err(BuildError::FormUnusable { dropped });
        }
        Ok(form)
    }

    fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    fn part_header(&mut self, disposition: &str, content_type: Option<&str>) {
        self.buf.put_slice(b"--");
        self.buf.put_slice(self.boundary.as_bytes());
        self.buf.put_slice(b"\r\nContent-Disposition: ");
        self.buf.put_slice(disposition.as_bytes());
        self.buf.put_slice(b"\r\n");
        if let Some(content_type) = content_type {
            self.buf.put_slice(b"Content-Type: ");
            self.buf.put_slice(content_type.as_bytes());
            self.buf.put_slice(b"\r\n");
        }
        self.buf.put_slice(b"\r\n");
    }

    fn field(&mut self, name: &str, value: &str) {
        self.part_header(&format!("form-data; name=\"{}\"", escape_quotes(name)), None);
        self.buf.put_slice(value.as_bytes());
        self.buf.put_slice(b"\r\n");
    }

    fn file(&mut self, name: &str, path: &str, contents: &[u8]) {
        let filename = Path::new(path)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        self.part_header(
            &format!(
                "form-data; name=\"{}\"; filename=\"{}\"",
                escape_quotes(name),
                escape_quotes(&filename)
            ),
            Some("application/octet-stream"),
        );
        self.buf.put_slice(contents);
        self.buf.put_slice(b"\r\n");
    }

    fn finish(mut self) -> Bytes {
        self.buf.put_slice(b"--");
        self.buf.put_slice(self.boundary.as_bytes());
        self.buf.put_slice(b"--\r\n");
        self.buf.freeze()
    }
}

fn escape_quotes(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
