#[cfg(feature = "mimalloc")]
mod mimalloc {
    use mimalloc::MiMalloc;

    #[global_allocator]
    static GLOBAL: MiMalloc = MiMalloc;
}

use std::{env, process};

use volley::{
    cli::{self, Command, USAGE},
    config::PlanConfig,
    logging::RunLogger,
    report::StreamReporter,
    scheduler::Scheduler,
};

fn main() {
    let _ = dotenvy::dotenv();
    #[cfg(debug_assertions)]
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .init();
    #[cfg(not(debug_assertions))]
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match cli::parse(env::args().skip(1)) {
        Ok(Command::Run(config)) => *config,
        Ok(Command::Help) => {
            eprint!("{USAGE}");
            return;
        }
        Err(err) => usage_and_exit(&format!("{err:#}")),
    };

    match run(config) {
        Ok(true) => process::exit(1),
        Ok(false) => {}
        Err(err) => {
            log::error!("{err:#}");
            process::exit(1);
        }
    }
}

/// Returns whether the run was interrupted.
fn run(config: PlanConfig) -> anyhow::Result<bool> {
    let (plan, template, params) = match (config.plan(), config.template()) {
        (Ok(plan), Ok(template)) => (plan, template, config.params()?),
        (Err(err), _) | (_, Err(err)) => usage_and_exit(&format!("{err:#}")),
    };

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    if let Some(cpus) = config.cpus.filter(|cpus| *cpus > 0) {
        runtime.worker_threads(cpus);
    }
    let runtime = runtime.enable_all().build()?;

    runtime.block_on(async move {
        let logger = RunLogger::from_env();
        let reporter = StreamReporter::stdout(plan.output, logger.clone());
        let scheduler = Scheduler::new(plan, template, params, logger)?;
        let summary = scheduler.run(reporter, shutdown_signal()).await?;
        Ok::<_, anyhow::Error>(summary.interrupted)
    })
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use futures::future::{select_all, FutureExt};
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                let _ = select_all([sigint.recv().boxed(), sigterm.recv().boxed()]).await;
            }
            _ => ctrl_c().await,
        }
    }
    #[cfg(not(unix))]
    ctrl_c().await;

    log::info!("Received signal, stopping...");
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn usage_and_exit(msg: &str) -> ! {
    if !msg.is_empty() {
        eprintln!("{msg}\n");
    }
    eprintln!("{USAGE}");
    process::exit(1);
}
