use std::{sync::Arc, time::Duration};

use bytes::BytesMut;
use reqwest::{
    header::{HeaderValue, CONTENT_LENGTH},
    Body, Client, Response,
};

use crate::{
    error::DispatchError,
    logging::RunLogger,
    params::RequestParam,
    probe::{Mark, PhaseProbe, Phases, ProbedBody, ACTIVE_PROBE},
    request::PreparedRequest,
};

/// Terminal outcome of one attempted request.
#[derive(Debug)]
pub struct RequestResult {
    /// `0` when no response was received.
    pub status: u16,
    pub duration: Duration,
    pub phases: Phases,
    pub content_length: u64,
    pub error: Option<DispatchError>,
}

impl RequestResult {
    pub fn failed(error: DispatchError, duration: Duration) -> Self {
        Self {
            status: 0,
            duration,
            phases: Phases::default(),
            content_length: 0,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status != 0
    }
}

struct Exchange {
    status: u16,
    content_length: u64,
    error: Option<DispatchError>,
}

/// Sends prepared requests over one worker's client and times them.
#[derive(Clone)]
pub struct Dispatcher {
    client: Client,
    timeout: Option<Duration>,
    capture_output: bool,
    logger: RunLogger,
}

impl Dispatcher {
    pub fn new(
        client: Client,
        timeout: Option<Duration>,
        capture_output: bool,
        logger: RunLogger,
    ) -> Self {
        Self {
            client,
            timeout,
            capture_output,
            logger,
        }
    }

    pub async fn send(&self, request: PreparedRequest, param: &RequestParam) -> RequestResult {
        let probe = Arc::new(PhaseProbe::new());
        let exchange = ACTIVE_PROBE
            .scope(probe.clone(), self.exchange(request, param, &probe))
            .await;
        let finished = probe.offset();
        let duration = probe.origin().elapsed();

        match exchange {
            Ok(exchange) => RequestResult {
                status: exchange.status,
                duration,
                phases: probe.phases(finished),
                content_length: exchange.content_length,
                error: exchange.error,
            },
            Err(err) => {
                self.logger.transport_failure(&err);
                RequestResult {
                    phases: probe.phases(finished),
                    ..RequestResult::failed(err, duration)
                }
            }
        }
    }

    async fn exchange(
        &self,
        request: PreparedRequest,
        param: &RequestParam,
        probe: &Arc<PhaseProbe>,
    ) -> Result<Exchange, DispatchError> {
        let PreparedRequest {
            method,
            url,
            mut headers,
            body,
        } = request;

        let mut builder = self.client.request(method, url);
        if !body.is_empty() {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
            builder = builder.body(Body::wrap_stream(ProbedBody::new(body, probe.clone())));
        }

        let response = builder
            .headers(headers)
            .send()
            .await
            .map_err(|err| DispatchError::from_reqwest(err, self.timeout))?;
        probe.mark(Mark::FirstByte);

        let status = response.status().as_u16();
        let declared = response.content_length();
        let (drained, error) = self.drain(response, param).await;

        Ok(Exchange {
            status,
            content_length: declared.unwrap_or(drained),
            error,
        })
    }

    /// Read the body to the end so the connection can go back to the pool.
    async fn drain(&self, mut response: Response, param: &RequestParam) -> (u64, Option<DispatchError>) {
        let mut drained = 0u64;
        let mut captured = self.capture_output.then(BytesMut::new);

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    drained += chunk.len() as u64;
                    if let Some(buf) = captured.as_mut() {
                        buf.extend_from_slice(&chunk);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    self.logger.body_read_failure(&err);
                    return (drained, Some(DispatchError::Body(err)));
                }
            }
        }

        if let Some(buf) = captured {
            self.logger
                .response_captured(&param.as_text(), &String::from_utf8_lossy(&buf));
        }
        (drained, None)
    }
}
