use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use reqwest::{
    dns::{Addrs, Name, Resolve, Resolving},
    redirect, Client, Proxy, Url,
};
use tower::{Layer, Service};

use crate::probe::{Mark, ACTIVE_PROBE};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Transport settings shared by every worker. Each worker builds its own
/// [`Client`] from it, so no connection pool is shared between workers.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub timeout: Option<Duration>,
    pub disable_compression: bool,
    pub disable_keep_alive: bool,
    pub disable_redirects: bool,
    pub http2: bool,
    pub proxy: Option<Url>,
}

impl ClientConfig {
    pub fn build(&self) -> Result<Client, reqwest::Error> {
        let mut builder = Client::builder()
            .danger_accept_invalid_certs(true)
            .dns_resolver(Arc::new(ProbingResolver))
            .connector_layer(MarkConnected)
            .no_proxy();

        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if self.disable_compression {
            builder = builder.no_gzip();
        }
        if self.disable_keep_alive {
            builder = builder.pool_max_idle_per_host(0);
        }
        if self.disable_redirects {
            builder = builder.redirect(redirect::Policy::none());
        }
        if !self.http2 {
            builder = builder.http1_only();
        }
        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(Proxy::all(proxy.clone())?);
        }

        builder.build()
    }
}

/// System resolver that stamps DNS start/done on the attempt being polled.
struct ProbingResolver;

impl Resolve for ProbingResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let probe = ACTIVE_PROBE.try_with(Arc::clone).ok();
        Box::pin(async move {
            if let Some(probe) = &probe {
                probe.mark(Mark::DnsStart);
            }
            let resolved = tokio::net::lookup_host((name.as_str(), 0)).await;
            if let Some(probe) = &probe {
                probe.mark(Mark::DnsDone);
            }
            let addrs: Vec<SocketAddr> = resolved
                .map_err(|err| Box::new(err) as BoxError)?
                .collect();
            Ok::<Addrs, BoxError>(Box::new(addrs.into_iter()))
        })
    }
}

/// Wraps the client's connector so a fresh connection stamps `Acquired` on
/// the attempt that asked for it, once TCP (and TLS, if any) is up.
#[derive(Debug, Clone, Copy)]
struct MarkConnected;

impl<S> Layer<S> for MarkConnected {
    type Service = MarkConnectedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MarkConnectedService { inner }
    }
}

#[derive(Debug, Clone)]
struct MarkConnectedService<S> {
    inner: S,
}

impl<S, Req> Service<Req> for MarkConnectedService<S>
where
    S: Service<Req>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, target: Req) -> Self::Future {
        // the connect may finish on another task, so look up the attempt now
        let probe = ACTIVE_PROBE.try_with(Arc::clone).ok();
        let connecting = self.inner.call(target);
        Box::pin(async move {
            let conn = connecting.await?;
            if let Some(probe) = probe {
                probe.mark(Mark::Acquired);
            }
            Ok(conn)
        })
    }
}
