use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::{
    sync::{
        broadcast::{self, error::TryRecvError},
        mpsc::{self, error::TrySendError},
    },
    task::JoinSet,
};

use crate::{
    dispatch::{Dispatcher, RequestResult},
    logging::RunLogger,
    params::{RequestParam, RequestParamSet},
    ratelimit::Throttle,
    request::{build, ContentMode, RequestTemplate},
};

/// Read-only data shared by every worker of a run.
pub struct RunContext {
    pub template: RequestTemplate,
    pub params: RequestParamSet,
    pub content_mode: ContentMode,
    pub concurrency: usize,
    pub logger: RunLogger,
}

impl RunContext {
    pub fn new(
        template: RequestTemplate,
        params: RequestParamSet,
        content_mode: ContentMode,
        concurrency: usize,
        logger: RunLogger,
    ) -> Self {
        Self {
            template,
            params,
            content_mode,
            concurrency: concurrency.max(1),
            logger,
        }
    }
}

/// Where one worker hands its results. Offers never wait; a full channel
/// drops the result and counts it.
#[derive(Clone)]
struct Outlet {
    worker: usize,
    results: mpsc::Sender<RequestResult>,
    dropped: Arc<AtomicU64>,
}

impl Outlet {
    fn emit(&self, result: RequestResult, logger: &RunLogger) {
        match self.results.try_send(result) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                logger.result_dropped(self.worker);
            }
        }
    }
}

/// How a worker picks the variant for its next attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Selection {
    /// Round-robin by global index `k * C + id`.
    #[default]
    Sequential,
    Random,
}

impl Selection {
    pub fn pick<'a, R: Rng>(
        &self,
        params: &'a RequestParamSet,
        global_index: usize,
        rng: &mut R,
    ) -> &'a RequestParam {
        match self {
            Selection::Sequential => params.sequential(global_index),
            Selection::Random => params.random(rng),
        }
    }
}

/// Global request index of a worker's `k`-th attempt.
pub fn global_index(k: usize, concurrency: usize, id: usize) -> usize {
    k * concurrency + id
}

/// Whether a worker waits for each attempt before issuing the next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SendMode {
    #[default]
    Sync,
    /// Fan out attempts, joining all of them before the worker exits.
    Async,
}

#[derive(Debug, Clone, Copy)]
pub enum Quota {
    Count(usize),
    Until { start: Instant, deadline: Duration },
}

impl Quota {
    fn exhausted(&self, issued: usize) -> bool {
        match self {
            Quota::Count(count) => issued >= *count,
            Quota::Until { start, deadline } => start.elapsed() > *deadline,
        }
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quota::Count(count) => write!(f, "{count} requests"),
            Quota::Until { deadline, .. } => write!(f, "{deadline:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub id: usize,
    pub issued: usize,
    pub dropped: u64,
}

pub struct Worker {
    id: usize,
    context: Arc<RunContext>,
    dispatcher: Dispatcher,
    outlet: Outlet,
    stop: broadcast::Receiver<()>,
    throttle: Throttle,
    quota: Quota,
    selection: Selection,
    send_mode: SendMode,
}

impl Worker {
    pub fn new(
        id: usize,
        context: Arc<RunContext>,
        dispatcher: Dispatcher,
        results: mpsc::Sender<RequestResult>,
        stop: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id,
            context,
            dispatcher,
            outlet: Outlet {
                worker: id,
                results,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            stop,
            throttle: Throttle::unlimited(),
            quota: Quota::Count(0),
            selection: Selection::default(),
            send_mode: SendMode::default(),
        }
    }

    pub fn throttle(mut self, throttle: Throttle) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn quota(mut self, quota: Quota) -> Self {
        self.quota = quota;
        self
    }

    pub fn selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    pub fn send_mode(mut self, send_mode: SendMode) -> Self {
        self.send_mode = send_mode;
        self
    }

    fn stop_requested(&mut self) -> bool {
        !matches!(self.stop.try_recv(), Err(TryRecvError::Empty))
    }

    pub async fn run(mut self) -> WorkerReport {
        let mut rng = StdRng::from_os_rng();
        let mut in_flight = JoinSet::new();
        let mut issued = 0usize;

        loop {
            if self.stop_requested() {
                self.context.logger.stop_observed(self.id);
                break;
            }
            if self.quota.exhausted(issued) {
                break;
            }
            if self.throttle.is_active() {
                tokio::select! {
                    biased;
                    _ = self.stop.recv() => {
                        self.context.logger.stop_observed(self.id);
                        break;
                    }
                    _ = self.throttle.tick() => {}
                }
                if self.quota.exhausted(issued) {
                    break;
                }
            }

            let index = global_index(issued, self.context.concurrency, self.id);
            let param = self
                .selection
                .pick(&self.context.params, index, &mut rng)
                .clone();
            issued += 1;

            match self.send_mode {
                SendMode::Sync => {
                    let result = attempt(&self.context, &self.dispatcher, &param).await;
                    self.outlet.emit(result, &self.context.logger);
                }
                SendMode::Async => {
                    let context = self.context.clone();
                    let dispatcher = self.dispatcher.clone();
                    let outlet = self.outlet.clone();
                    in_flight.spawn(async move {
                        let result = attempt(&context, &dispatcher, &param).await;
                        outlet.emit(result, &context.logger);
                    });
                    while let Some(joined) = in_flight.try_join_next() {
                        if let Err(err) = joined {
                            self.context.logger.worker_panicked(&err);
                        }
                    }
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = joined {
                self.context.logger.worker_panicked(&err);
            }
        }

        self.context.logger.worker_finished(self.id, issued);
        WorkerReport {
            id: self.id,
            issued,
            dropped: self.outlet.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn attempt(
    context: &RunContext,
    dispatcher: &Dispatcher,
    param: &RequestParam,
) -> RequestResult {
    let started = Instant::now();
    match build(&context.template, param, context.content_mode, &context.logger) {
        Ok(request) => dispatcher.send(request, param).await,
        Err(err) => {
            context.logger.build_failure(&err);
            RequestResult::failed(err.into(), started.elapsed())
        }
    }
}
