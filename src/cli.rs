use std::path::PathBuf;

use anyhow::{anyhow, Context};

use crate::config::PlanConfig;

pub const USAGE: &str = "Usage: volley [options...] <url>

Options:
  -m    HTTP method, one of GET, POST, PUT, DELETE, HEAD, OPTIONS. Default is [GET].
  -qps  Rate limit, in requests per second (QPS). If not set, send as fast as possible.
  -n    Number of requests to run.
  -t    Run for this many seconds instead of a request count. Default is [0].
  -f    POST data type, one of TEXT, JSON, FORM. Default is [TEXT].
  -c    Number of concurrent workers to run. Total number of requests cannot
        be smaller than the concurrency level. Default is [50].
  -H    Custom HTTP header. You can specify as many as needed by repeating the flag.
        For example, -H \"Accept: text/html\" -H \"Content-Type: application/xml\".
  -T    Timeout for each request in seconds. Default is 60, use 0 for infinite.
  -A    HTTP Accept header.
  -d    HTTP request body.
  -D    HTTP request body from file, one body per line.
  -C    Content-type, defaults to \"text/html\".
  -a    Basic authentication, username:password.
  -x    HTTP Proxy address as host:port.
  -h2   Enable HTTP/2.
  -o    Output type. If none provided, a summary is printed.
        \"csv\" is the only supported alternative.
  -config <file>        Load a TOML plan file. Flags override its values.

  -host                 HTTP Host header.
  -cpus                 Number of runtime worker threads.
  -disable-compression  Disable compression.
  -disable-keepalive    Disable keep-alive, prevents re-use of TCP
                        connections between different HTTP requests.
  -disable-redirects    Disable following of HTTP redirects.
  -disable-output       Disable response output.
  -random-input         Pick request bodies at random instead of in order.
  -async                Send requests asynchronously within each worker.
";

#[derive(Debug)]
pub enum Command {
    Help,
    Run(Box<PlanConfig>),
}

/// Parse arguments (without the program name). A `-config` file is loaded
/// first wherever it appears, then every other flag is applied on top.
pub fn parse<I>(args: I) -> anyhow::Result<Command>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().collect();

    let mut config = match config_path(&args)? {
        Some(path) => PlanConfig::load(&path)
            .with_context(|| format!("failed to load plan file {}", path.display()))?,
        None => PlanConfig::default(),
    };

    let mut args = args.into_iter();
    let mut positional = Vec::new();
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| args.next().with_context(|| format!("{flag} requires a value"));
        match arg.as_str() {
            "-h" | "-help" | "--help" => return Ok(Command::Help),
            "-config" => {
                value("-config")?;
            }
            "-m" => config.method = value("-m")?,
            "-H" => config.headers.push(value("-H")?),
            "-d" => config.body = Some(value("-d")?),
            "-D" => config.body_file = Some(PathBuf::from(value("-D")?)),
            "-A" => config.accept = Some(value("-A")?),
            "-C" => config.content_type = value("-C")?,
            "-a" => config.auth = Some(value("-a")?),
            "-host" => config.host = Some(value("-host")?),
            "-f" => config.format = value("-f")?,
            "-o" => config.output = value("-o")?,
            "-x" => config.proxy = Some(value("-x")?),
            "-qps" => config.qps = number(&value("-qps")?, "-qps")?,
            "-c" => config.concurrency = number(&value("-c")?, "-c")?,
            "-n" => config.requests = number(&value("-n")?, "-n")?,
            "-t" => config.duration_secs = number(&value("-t")?, "-t")?,
            "-T" => config.timeout_secs = number(&value("-T")?, "-T")?,
            "-cpus" => config.cpus = Some(number(&value("-cpus")?, "-cpus")?),
            "-h2" => config.http2 = true,
            "-disable-compression" => config.disable_compression = true,
            "-disable-keepalive" => config.disable_keepalive = true,
            "-disable-redirects" => config.disable_redirects = true,
            "-disable-output" => config.disable_output = true,
            "-random-input" => config.random_input = true,
            "-async" => config.async_send = true,
            other if other.starts_with('-') && other.len() > 1 => {
                return Err(anyhow!("unknown arg: {other}"));
            }
            _ => positional.push(arg),
        }
    }

    match positional.as_slice() {
        [] if !config.url.is_empty() => {}
        [url] => config.url = url.clone(),
        [] => return Err(anyhow!("a target url is required")),
        [_, extra, ..] => return Err(anyhow!("unexpected argument: {extra}")),
    }

    Ok(Command::Run(Box::new(config)))
}

fn config_path(args: &[String]) -> anyhow::Result<Option<PathBuf>> {
    match args.iter().position(|arg| arg == "-config") {
        Some(at) => args
            .get(at + 1)
            .map(|path| Some(PathBuf::from(path)))
            .context("-config requires a value"),
        None => Ok(None),
    }
}

fn number<T: std::str::FromStr>(raw: &str, flag: &str) -> anyhow::Result<T> {
    raw.parse()
        .map_err(|_| anyhow!("{flag} expects a non-negative number, got '{raw}'"))
}
