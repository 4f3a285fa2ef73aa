use std::{
    fmt,
    future::Future,
    pin::pin,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    sync::{broadcast, mpsc},
    task::JoinSet,
};

use crate::{
    client::ClientConfig,
    dispatch::Dispatcher,
    error::PlanError,
    logging::RunLogger,
    params::RequestParamSet,
    ratelimit::Throttle,
    report::{OutputFormat, Reporter},
    request::{ContentMode, RequestTemplate},
    worker::{Quota, RunContext, Selection, SendMode, Worker, WorkerReport},
};

/// Upper bound on buffered results for duration runs.
const DURATION_RESULT_BUFFER: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// Total attempts across all workers.
    Count(usize),
    Duration(Duration),
}

/// Everything needed to drive one run, checked by [`RunPlan::validate`].
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub concurrency: usize,
    pub bound: Bound,
    /// Requests per second across all workers, 0 for unlimited.
    pub qps: u32,
    pub client: ClientConfig,
    pub send_mode: SendMode,
    pub selection: Selection,
    pub capture_output: bool,
    pub content_mode: ContentMode,
    pub output: OutputFormat,
}

impl Default for RunPlan {
    fn default() -> Self {
        Self {
            concurrency: 50,
            bound: Bound::Count(200),
            qps: 0,
            client: ClientConfig::default(),
            send_mode: SendMode::Sync,
            selection: Selection::Sequential,
            capture_output: true,
            content_mode: ContentMode::Text,
            output: OutputFormat::Summary,
        }
    }
}

impl RunPlan {
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.concurrency < 1 {
            return Err(PlanError::Concurrency);
        }
        match self.bound {
            Bound::Count(count) if count < self.concurrency => {
                return Err(PlanError::CountBelowConcurrency {
                    count,
                    concurrency: self.concurrency,
                });
            }
            Bound::Duration(duration) if duration.is_zero() => {
                return Err(PlanError::Duration);
            }
            _ => {}
        }
        if self.send_mode == SendMode::Async && self.qps == 0 {
            return Err(PlanError::AsyncWithoutRateLimit);
        }
        Ok(())
    }

    fn result_buffer(&self) -> usize {
        match self.bound {
            Bound::Count(count) => count.clamp(1, DURATION_RESULT_BUFFER),
            Bound::Duration(_) => DURATION_RESULT_BUFFER,
        }
    }

    fn quota(&self, start: Instant) -> Quota {
        match self.bound {
            Bound::Count(count) => Quota::Count(count / self.concurrency),
            Bound::Duration(deadline) => Quota::Until { start, deadline },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the reporter learns about the run once it is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub elapsed: Duration,
    pub issued: usize,
    /// Results discarded because the result channel was full.
    pub dropped: u64,
    pub interrupted: bool,
}

/// Controller of a single run. Consumed by [`Scheduler::run`].
pub struct Scheduler {
    plan: RunPlan,
    context: Arc<RunContext>,
    state: RunState,
}

impl Scheduler {
    pub fn new(
        plan: RunPlan,
        template: RequestTemplate,
        params: RequestParamSet,
        logger: RunLogger,
    ) -> Result<Self, PlanError> {
        plan.validate()?;
        let context = RunContext::new(
            template,
            params,
            plan.content_mode,
            plan.concurrency,
            logger,
        );
        Ok(Self {
            plan,
            context: Arc::new(context),
            state: RunState::Idle,
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, to: RunState) {
        if self.state != to {
            self.context
                .logger
                .state_changed(&self.state.to_string(), &to.to_string());
            self.state = to;
        }
    }

    /// Drive the run to completion, or until `interrupt` resolves. Workers
    /// are always joined and the reporter is stopped exactly once.
    pub async fn run<R, I>(mut self, mut reporter: R, interrupt: I) -> Result<RunSummary, PlanError>
    where
        R: Reporter + 'static,
        I: Future<Output = ()>,
    {
        let logger = self.context.logger.clone();
        let clients = (0..self.plan.concurrency)
            .map(|_| self.plan.client.build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(PlanError::Client)?;

        let (results_tx, results_rx) = mpsc::channel(self.plan.result_buffer());
        let (stop_tx, _) = broadcast::channel::<()>(1);
        let reporting = tokio::spawn(async move {
            reporter.start(results_rx).await;
            reporter
        });

        self.transition(RunState::Running);
        let start = Instant::now();
        let quota = self.plan.quota(start);
        logger.run_started(self.plan.concurrency, &quota, self.plan.qps);

        let mut workers = JoinSet::new();
        for (id, client) in clients.into_iter().enumerate() {
            let dispatcher = Dispatcher::new(
                client,
                self.plan.client.timeout,
                self.plan.capture_output,
                logger.clone(),
            );
            let worker = Worker::new(
                id,
                self.context.clone(),
                dispatcher,
                results_tx.clone(),
                stop_tx.subscribe(),
            )
            .quota(quota)
            .selection(self.plan.selection)
            .send_mode(self.plan.send_mode)
            .throttle(Throttle::new(self.plan.qps, self.plan.concurrency));
            workers.spawn(worker.run());
        }
        drop(results_tx);

        let mut interrupt = pin!(interrupt);
        let mut interrupted = false;
        let mut reports: Vec<WorkerReport> = Vec::with_capacity(self.plan.concurrency);
        loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok(report)) => reports.push(report),
                    Some(Err(err)) => logger.worker_panicked(&err),
                    None => {
                        self.transition(RunState::Draining);
                        break;
                    }
                },
                () = &mut interrupt, if !interrupted => {
                    interrupted = true;
                    logger.interrupted();
                    self.transition(RunState::Draining);
                    let _ = stop_tx.send(());
                }
            }
        }

        let summary = RunSummary {
            elapsed: start.elapsed(),
            issued: reports.iter().map(|r| r.issued).sum(),
            dropped: reports.iter().map(|r| r.dropped).sum(),
            interrupted,
        };

        match reporting.await {
            Ok(mut reporter) => reporter.stop(&summary).await,
            Err(err) => logger.worker_panicked(&err),
        }
        self.transition(RunState::Stopped);
        logger.run_finished(summary.elapsed, summary.issued, summary.dropped);
        Ok(summary)
    }
}
