use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context};
use log::warn;
use reqwest::{
    header::{HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE},
    Method, Url,
};
use serde::Deserialize;

use crate::{
    client::ClientConfig,
    error::PlanError,
    params::{RequestParam, RequestParamSet},
    request::{BasicAuth, RequestTemplate, DEFAULT_CONTENT_TYPE},
    scheduler::{Bound, RunPlan},
    worker::{Selection, SendMode},
};

/// A load run as written in a TOML plan file. Command line flags are applied
/// on top of it.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PlanConfig {
    /// Target URL.
    pub url: String,
    pub method: String,
    /// Extra headers as `Name: value`.
    pub headers: Vec<String>,
    pub accept: Option<String>,
    /// Inline request body, used as the first variant.
    pub body: Option<String>,
    /// File with one request body variant per line.
    pub body_file: Option<PathBuf>,
    pub content_type: String,
    /// Basic auth as `username:password`.
    pub auth: Option<String>,
    pub host: Option<String>,
    /// TEXT, JSON or FORM.
    pub format: String,
    /// Empty for the summary, or "csv".
    pub output: String,

    pub qps: u32,
    pub concurrency: usize,
    pub requests: usize,
    /// Run for this many seconds instead of a fixed request count.
    pub duration_secs: u64,
    /// Per-request timeout, 0 for none.
    pub timeout_secs: u64,

    pub http2: bool,
    pub proxy: Option<String>,
    /// Runtime worker threads, defaults to the number of cores.
    pub cpus: Option<usize>,

    pub disable_compression: bool,
    pub disable_keepalive: bool,
    pub disable_redirects: bool,
    pub disable_output: bool,
    pub random_input: bool,
    #[serde(rename = "async")]
    pub async_send: bool,

    #[serde(flatten)]
    pub other_fields: HashMap<String, toml::Value>,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "GET".to_string(),
            headers: Vec::new(),
            accept: None,
            body: None,
            body_file: None,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            auth: None,
            host: None,
            format: "TEXT".to_string(),
            output: String::new(),
            qps: 0,
            concurrency: 50,
            requests: 0,
            duration_secs: 0,
            timeout_secs: 60,
            http2: false,
            proxy: None,
            cpus: None,
            disable_compression: false,
            disable_keepalive: false,
            disable_redirects: false,
            disable_output: false,
            random_input: false,
            async_send: false,
            other_fields: HashMap::new(),
        }
    }
}

impl PlanConfig {
    pub fn load(path: &Path) -> Result<Self, PlanConfigLoadError> {
        let raw = fs::read_to_string(path).map_err(PlanConfigLoadError::Io)?;
        let config: Self = toml::from_str(&raw).map_err(PlanConfigLoadError::Parse)?;

        for field in &config.other_fields {
            warn!(
                "Unknown configuration '{}' with value {:?}",
                field.0, field.1
            );
        }

        Ok(config)
    }

    pub fn plan(&self) -> anyhow::Result<RunPlan> {
        let bound = if self.duration_secs > 0 {
            Bound::Duration(Duration::from_secs(self.duration_secs))
        } else {
            Bound::Count(self.requests)
        };
        let proxy = self
            .proxy
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| Url::parse(p).map_err(|_| PlanError::Proxy(p.to_string())))
            .transpose()?;

        let plan = RunPlan {
            concurrency: self.concurrency,
            bound,
            qps: self.qps,
            client: ClientConfig {
                timeout: (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs)),
                disable_compression: self.disable_compression,
                disable_keep_alive: self.disable_keepalive,
                disable_redirects: self.disable_redirects,
                http2: self.http2,
                proxy,
            },
            send_mode: if self.async_send {
                SendMode::Async
            } else {
                SendMode::Sync
            },
            selection: if self.random_input {
                Selection::Random
            } else {
                Selection::Sequential
            },
            capture_output: !self.disable_output,
            content_mode: self.format.parse().map_err(|e: String| anyhow!(e))?,
            output: self.output.parse().map_err(|e: String| anyhow!(e))?,
        };
        plan.validate()?;
        Ok(plan)
    }

    pub fn template(&self) -> anyhow::Result<RequestTemplate> {
        if self.url.is_empty() {
            return Err(anyhow!("a target url is required"));
        }
        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .with_context(|| format!("invalid method '{}'", self.method))?;
        let url = Url::parse(&self.url).with_context(|| format!("invalid url '{}'", self.url))?;

        let mut template = RequestTemplate::new(method, url);
        template.content_type = self.content_type.clone();
        for raw in &self.headers {
            let (name, value) = parse_header(raw)?;
            if name == CONTENT_TYPE {
                template.content_type = value.to_str()?.to_string();
            } else {
                template.headers.insert(name, value);
            }
        }
        if let Some(accept) = self.accept.as_deref().filter(|a| !a.is_empty()) {
            template.headers.insert(ACCEPT, HeaderValue::from_str(accept)?);
        }
        if let Some(auth) = self.auth.as_deref().filter(|a| !a.is_empty()) {
            template.basic_auth = Some(parse_auth(auth)?);
        }
        template.host = self.host.clone().filter(|h| !h.is_empty());
        Ok(template)
    }

    /// The inline body first, then one variant per non-empty line of the
    /// body file.
    pub fn params(&self) -> anyhow::Result<RequestParamSet> {
        let mut params = RequestParamSet::default();
        if let Some(body) = self.body.as_deref().filter(|b| !b.is_empty()) {
            params.push(RequestParam::new(body.to_string()));
        }
        if let Some(path) = &self.body_file {
            let raw = fs::read(path)
                .with_context(|| format!("could not read body file {}", path.display()))?;
            params.append(RequestParamSet::from_lines(&raw));
        }
        Ok(params)
    }
}

fn parse_header(raw: &str) -> anyhow::Result<(HeaderName, HeaderValue)> {
    let parsed = raw
        .split_once(':')
        .map(|(name, value)| (name.trim(), value.trim()))
        .filter(|(name, value)| !name.is_empty() && !value.is_empty());
    let Some((name, value)) = parsed else {
        return Err(anyhow!(
            "could not parse the provided input; input = {raw}"
        ));
    };
    Ok((
        HeaderName::from_bytes(name.as_bytes())?,
        HeaderValue::from_str(value)?,
    ))
}

fn parse_auth(raw: &str) -> anyhow::Result<BasicAuth> {
    match raw.split_once(':') {
        Some((username, password)) if !username.is_empty() && !password.is_empty() => {
            Ok(BasicAuth {
                username: username.to_string(),
                password: password.to_string(),
            })
        }
        _ => Err(anyhow!(
            "could not parse the provided input; input = {raw}"
        )),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PlanConfigLoadError {
    #[error("Could not open plan file")]
    Io(#[from] std::io::Error),
    #[error("Could not parse plan file")]
    Parse(#[from] toml::de::Error),
}
