/// End-to-end runs through the scheduler against in-process HTTP servers.
use std::{
    io::{self, Write},
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use reqwest::{Method, Url};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use volley::{
    client::ClientConfig,
    dispatch::RequestResult,
    error::DispatchError,
    logging::{Level, MemoryDiagnostics, RunLogger},
    params::{RequestParam, RequestParamSet},
    report::{OutputFormat, Reporter, StreamReporter},
    request::{ContentMode, RequestTemplate},
    scheduler::{Bound, RunPlan, RunSummary, Scheduler},
    worker::{Selection, SendMode},
};

#[derive(Clone, Default)]
struct Bodies(Arc<Mutex<Vec<Vec<u8>>>>);

impl Bodies {
    fn all(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().clone()
    }
}

/// HTTP/1.1 keep-alive server recording every request body.
async fn recording_server(delay: Duration) -> (SocketAddr, Bodies) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let bodies = Bodies::default();
    let sink = bodies.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream, delay, sink.clone()));
        }
    });
    (addr, bodies)
}

async fn serve(mut stream: TcpStream, delay: Duration, bodies: Bodies) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let head_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < head_end + length {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        let body: Vec<u8> = buf.drain(..head_end + length).skip(head_end).collect();
        bodies.0.lock().unwrap().push(body);

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let reply = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        if stream.write_all(reply).await.is_err() {
            return;
        }
    }
}

/// Accepts and holds connections without ever answering.
async fn silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

#[derive(Clone, Default)]
struct Collector {
    results: Arc<Mutex<Vec<RequestResult>>>,
    summaries: Arc<Mutex<Vec<RunSummary>>>,
}

#[async_trait]
impl Reporter for Collector {
    async fn start(&mut self, mut results: mpsc::Receiver<RequestResult>) {
        while let Some(result) = results.recv().await {
            self.results.lock().unwrap().push(result);
        }
    }

    async fn stop(&mut self, summary: &RunSummary) {
        self.summaries.lock().unwrap().push(*summary);
    }
}

fn url(addr: SocketAddr) -> Url {
    Url::parse(&format!("http://{addr}/load")).unwrap()
}

fn plan(concurrency: usize, bound: Bound) -> RunPlan {
    RunPlan {
        concurrency,
        bound,
        capture_output: false,
        client: ClientConfig {
            timeout: Some(Duration::from_secs(5)),
            ..ClientConfig::default()
        },
        ..RunPlan::default()
    }
}

fn variants(values: &[&str]) -> RequestParamSet {
    RequestParamSet::new(values.iter().map(|v| RequestParam::new(v.to_string())).collect())
}

#[tokio::test]
async fn count_mode_sends_n_minus_remainder_in_order() {
    let (addr, bodies) = recording_server(Duration::ZERO).await;
    let mut plan = plan(4, Bound::Count(22));
    plan.selection = Selection::Sequential;
    let scheduler = Scheduler::new(
        plan,
        RequestTemplate::new(Method::POST, url(addr)),
        variants(&["a", "b", "c", "d", "e"]),
        RunLogger::new(Arc::new(MemoryDiagnostics::new())),
    )
    .unwrap();
    let collector = Collector::default();

    let summary = scheduler
        .run(collector.clone(), std::future::pending())
        .await
        .unwrap();

    // 22 - 22 % 4
    assert_eq!(summary.issued, 20);
    assert_eq!(summary.dropped, 0);
    let results = collector.results.lock().unwrap();
    assert_eq!(results.len(), 20);
    for result in results.iter() {
        assert_eq!(result.status, 200);
        let p = result.phases;
        assert!(p.dns <= p.conn);
        assert!(p.conn + p.write + p.wait + p.read <= result.duration);
    }

    let sent = bodies.all();
    for variant in [b"a", b"b", b"c", b"d", b"e"] {
        let hits = sent.iter().filter(|b| b.as_slice() == variant).count();
        assert_eq!(hits, 4, "variant {:?}", variant);
    }
    assert_eq!(collector.summaries.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn empty_variant_set_sends_empty_bodies() {
    let (addr, bodies) = recording_server(Duration::ZERO).await;
    let mut plan = plan(2, Bound::Count(4));
    plan.selection = Selection::Random;
    let scheduler = Scheduler::new(
        plan,
        RequestTemplate::new(Method::POST, url(addr)),
        RequestParamSet::default(),
        RunLogger::new(Arc::new(MemoryDiagnostics::new())),
    )
    .unwrap();

    let summary = scheduler
        .run(Collector::default(), std::future::pending())
        .await
        .unwrap();

    assert_eq!(summary.issued, 4);
    assert!(bodies.all().iter().all(Vec::is_empty));
}

#[tokio::test]
async fn unresponsive_target_reports_timeouts() {
    let addr = silent_server().await;
    let mut plan = plan(1, Bound::Count(2));
    plan.client.timeout = Some(Duration::from_millis(200));
    let memory = Arc::new(MemoryDiagnostics::new());
    let scheduler = Scheduler::new(
        plan,
        RequestTemplate::new(Method::GET, url(addr)),
        RequestParamSet::default(),
        RunLogger::new(memory.clone()),
    )
    .unwrap();
    let collector = Collector::default();

    scheduler
        .run(collector.clone(), std::future::pending())
        .await
        .unwrap();

    let results = collector.results.lock().unwrap();
    assert_eq!(results.len(), 2);
    for result in results.iter() {
        assert_eq!(result.status, 0);
        assert!(matches!(result.error, Some(DispatchError::Timeout(_))));
        assert_eq!(result.phases.read, Duration::ZERO);
    }
    assert!(memory.contains(Level::Error, "timeout"));
}

#[tokio::test]
async fn interrupt_joins_async_attempts_and_stops_issuing() {
    let (addr, bodies) = recording_server(Duration::from_millis(100)).await;
    let mut plan = plan(2, Bound::Count(10_000));
    plan.qps = 40;
    plan.send_mode = SendMode::Async;
    let scheduler = Scheduler::new(
        plan,
        RequestTemplate::new(Method::GET, url(addr)),
        RequestParamSet::default(),
        RunLogger::new(Arc::new(MemoryDiagnostics::new())),
    )
    .unwrap();
    let collector = Collector::default();

    let summary = scheduler
        .run(
            collector.clone(),
            tokio::time::sleep(Duration::from_millis(250)),
        )
        .await
        .unwrap();
    let sent_at_stop = bodies.all().len();

    assert!(summary.interrupted);
    assert!(summary.issued > 0 && summary.issued < 10_000);
    // every issued attempt finished and reached the reporter
    assert_eq!(collector.results.lock().unwrap().len(), summary.issued);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(bodies.all().len(), sent_at_stop);
}

#[tokio::test]
async fn duration_mode_stops_after_deadline() {
    let (addr, _) = recording_server(Duration::ZERO).await;
    let mut plan = plan(2, Bound::Duration(Duration::from_millis(300)));
    plan.qps = 100;
    let scheduler = Scheduler::new(
        plan,
        RequestTemplate::new(Method::GET, url(addr)),
        RequestParamSet::default(),
        RunLogger::new(Arc::new(MemoryDiagnostics::new())),
    )
    .unwrap();
    let started = Instant::now();

    let summary = scheduler
        .run(Collector::default(), std::future::pending())
        .await
        .unwrap();

    assert!(summary.issued > 0);
    assert!(!summary.interrupted);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn form_with_missing_file_still_sends_remaining_fields() {
    let (addr, bodies) = recording_server(Duration::ZERO).await;
    let mut plan = plan(1, Bound::Count(1));
    plan.content_mode = ContentMode::Form;
    let memory = Arc::new(MemoryDiagnostics::new());
    let scheduler = Scheduler::new(
        plan,
        RequestTemplate::new(Method::POST, url(addr)),
        variants(&[r#"{"name":"alice","doc":"@/definitely/not/here.bin"}"#]),
        RunLogger::new(memory.clone()),
    )
    .unwrap();
    let collector = Collector::default();

    scheduler
        .run(collector.clone(), std::future::pending())
        .await
        .unwrap();

    assert_eq!(collector.results.lock().unwrap()[0].status, 200);
    let body = String::from_utf8(bodies.all().remove(0)).unwrap();
    assert!(body.contains("name=\"name\""));
    assert!(body.contains("alice"));
    assert!(!body.contains("name=\"doc\""));
    assert!(memory.contains(Level::Warn, "form field 'doc' skipped"));
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn csv_reporter_writes_a_row_per_attempt() {
    let (addr, _) = recording_server(Duration::ZERO).await;
    let mut plan = plan(2, Bound::Count(6));
    plan.output = OutputFormat::Csv;
    let logger = RunLogger::new(Arc::new(MemoryDiagnostics::new()));
    let buf = SharedBuf::default();
    let reporter = StreamReporter::new(plan.output, Box::new(buf.clone()), logger.clone());
    let scheduler = Scheduler::new(
        plan,
        RequestTemplate::new(Method::GET, url(addr)),
        RequestParamSet::default(),
        logger,
    )
    .unwrap();

    let summary = scheduler.run(reporter, std::future::pending()).await.unwrap();

    let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    let rows: Vec<&str> = text.lines().skip(1).collect();
    assert_eq!(rows.len(), summary.issued);
    assert!(rows.iter().all(|row| row.contains(",200,")));
}
