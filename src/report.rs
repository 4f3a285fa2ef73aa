use std::{
    collections::BTreeMap,
    fmt,
    io::{self, Write},
    str::FromStr,
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{dispatch::RequestResult, logging::RunLogger, scheduler::RunSummary};

const PERCENTILES: [f64; 7] = [10.0, 25.0, 50.0, 75.0, 90.0, 95.0, 99.0];
const HISTOGRAM_BUCKETS: usize = 10;
const CSV_HEADER: &str =
    "response-time,DNS+dialup,DNS,Request-write,Response-delay,Response-read,status-code,content-length";

/// Consumer of a run's result stream.
#[async_trait]
pub trait Reporter: Send {
    /// Consume results until every sender is gone.
    async fn start(&mut self, results: mpsc::Receiver<RequestResult>);

    /// Finalize the report. Called exactly once, after `start` returned.
    async fn stop(&mut self, summary: &RunSummary);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Summary,
    Csv,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "summary" => Ok(OutputFormat::Summary),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err("Invalid output type; only csv is supported.".to_string()),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputFormat::Summary => "summary",
            OutputFormat::Csv => "csv",
        })
    }
}

/// Running totals over every result seen so far. Pure data, no I/O.
#[derive(Debug, Default)]
pub struct Aggregate {
    latencies: Vec<Duration>,
    dns: Duration,
    conn: Duration,
    write: Duration,
    wait: Duration,
    read: Duration,
    bytes: u64,
    status_codes: BTreeMap<u16, usize>,
    errors: BTreeMap<String, usize>,
}

impl Aggregate {
    pub fn record(&mut self, result: &RequestResult) {
        if let Some(err) = &result.error {
            *self.errors.entry(err.to_string()).or_default() += 1;
            return;
        }
        self.latencies.push(result.duration);
        self.dns += result.phases.dns;
        self.conn += result.phases.conn;
        self.write += result.phases.write;
        self.wait += result.phases.wait;
        self.read += result.phases.read;
        self.bytes += result.content_length;
        *self.status_codes.entry(result.status).or_default() += 1;
    }

    /// Results that produced a response.
    pub fn responses(&self) -> usize {
        self.latencies.len()
    }

    pub fn failures(&self) -> usize {
        self.errors.values().sum()
    }

    pub fn status_codes(&self) -> &BTreeMap<u16, usize> {
        &self.status_codes
    }

    pub fn errors(&self) -> &BTreeMap<String, usize> {
        &self.errors
    }

    fn average(&self, total: Duration) -> f64 {
        match self.latencies.len() {
            0 => 0.0,
            n => total.as_secs_f64() / n as f64,
        }
    }

    fn render(&self, out: &mut dyn Write, summary: &RunSummary) -> io::Result<()> {
        let mut sorted: Vec<f64> = self.latencies.iter().map(Duration::as_secs_f64).collect();
        sorted.sort_by(f64::total_cmp);

        let total_secs = summary.elapsed.as_secs_f64().max(0.001);
        let responses = sorted.len();

        writeln!(out, "\nSummary:")?;
        writeln!(out, "  Total:\t{total_secs:.4} secs")?;
        if let (Some(fastest), Some(slowest)) = (sorted.first(), sorted.last()) {
            let total: f64 = sorted.iter().sum();
            writeln!(out, "  Slowest:\t{slowest:.4} secs")?;
            writeln!(out, "  Fastest:\t{fastest:.4} secs")?;
            writeln!(out, "  Average:\t{:.4} secs", total / responses as f64)?;
        }
        writeln!(out, "  Requests/sec:\t{:.4}", responses as f64 / total_secs)?;
        if self.bytes > 0 {
            writeln!(out, "  Total data:\t{} bytes", self.bytes)?;
            writeln!(out, "  Size/request:\t{} bytes", self.bytes / responses.max(1) as u64)?;
        }
        if summary.dropped > 0 {
            writeln!(out, "  Dropped results:\t{}", summary.dropped)?;
        }
        if summary.interrupted {
            writeln!(out, "  Interrupted after {} attempts", summary.issued)?;
        }

        if !sorted.is_empty() {
            writeln!(out, "\nResponse time histogram:")?;
            for (mark, count) in histogram(&sorted, HISTOGRAM_BUCKETS) {
                writeln!(out, "  {mark:.3} [{count}]")?;
            }

            writeln!(out, "\nLatency distribution:")?;
            for pct in PERCENTILES {
                writeln!(out, "  {pct}% in {:.4} secs", percentile(&sorted, pct))?;
            }

            writeln!(out, "\nDetails (average):")?;
            writeln!(out, "  DNS+dialup:\t{:.4} secs", self.average(self.conn))?;
            writeln!(out, "  DNS-lookup:\t{:.4} secs", self.average(self.dns))?;
            writeln!(out, "  req write:\t{:.4} secs", self.average(self.write))?;
            writeln!(out, "  resp wait:\t{:.4} secs", self.average(self.wait))?;
            writeln!(out, "  resp read:\t{:.4} secs", self.average(self.read))?;
        }

        if !self.status_codes.is_empty() {
            writeln!(out, "\nStatus code distribution:")?;
            for (code, count) in &self.status_codes {
                writeln!(out, "  [{code}]\t{count} responses")?;
            }
        }

        if !self.errors.is_empty() {
            writeln!(out, "\nError distribution:")?;
            for (err, count) in &self.errors {
                writeln!(out, "  [{count}]\t{err}")?;
            }
        }
        writeln!(out)
    }
}

/// Nearest-rank percentile over ascending samples.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Equal-width buckets between the fastest and slowest sample, each
/// labelled with its upper bound.
fn histogram(sorted: &[f64], buckets: usize) -> Vec<(f64, usize)> {
    let (Some(&fastest), Some(&slowest)) = (sorted.first(), sorted.last()) else {
        return Vec::new();
    };
    let width = (slowest - fastest) / buckets as f64;
    let mut counts = vec![0usize; buckets + 1];
    for sample in sorted {
        let slot = if width > 0.0 {
            (((sample - fastest) / width) as usize).min(buckets)
        } else {
            buckets
        };
        counts[slot] += 1;
    }
    counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| (fastest + width * i as f64, count))
        .collect()
}

fn csv_row(result: &RequestResult) -> String {
    let p = result.phases;
    format!(
        "{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{},{}",
        result.duration.as_secs_f64(),
        p.conn.as_secs_f64(),
        p.dns.as_secs_f64(),
        p.write.as_secs_f64(),
        p.wait.as_secs_f64(),
        p.read.as_secs_f64(),
        result.status,
        result.content_length,
    )
}

/// Reporter that writes either a final summary or one csv row per result.
pub struct StreamReporter {
    format: OutputFormat,
    out: Box<dyn Write + Send>,
    aggregate: Aggregate,
    logger: RunLogger,
}

impl StreamReporter {
    pub fn new(format: OutputFormat, out: Box<dyn Write + Send>, logger: RunLogger) -> Self {
        Self {
            format,
            out,
            aggregate: Aggregate::default(),
            logger,
        }
    }

    pub fn stdout(format: OutputFormat, logger: RunLogger) -> Self {
        Self::new(format, Box::new(io::stdout()), logger)
    }

    pub fn aggregate(&self) -> &Aggregate {
        &self.aggregate
    }

    fn write_checked(&mut self, write: impl FnOnce(&mut dyn Write) -> io::Result<()>) {
        if let Err(err) = write(&mut *self.out).and_then(|()| self.out.flush()) {
            self.logger.report_write_failure(&err);
        }
    }
}

#[async_trait]
impl Reporter for StreamReporter {
    async fn start(&mut self, mut results: mpsc::Receiver<RequestResult>) {
        if self.format == OutputFormat::Csv {
            self.write_checked(|out| writeln!(out, "{CSV_HEADER}"));
        }
        while let Some(result) = results.recv().await {
            self.aggregate.record(&result);
            if self.format == OutputFormat::Csv {
                let row = csv_row(&result);
                self.write_checked(|out| writeln!(out, "{row}"));
            }
        }
    }

    async fn stop(&mut self, summary: &RunSummary) {
        if self.format == OutputFormat::Summary {
            let aggregate = std::mem::take(&mut self.aggregate);
            self.write_checked(|out| aggregate.render(out, summary));
            self.aggregate = aggregate;
        }
    }
}
