use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use gpt_bridge::metrics::BRIDGE_METRICS;
use gpt_bridge::streaming::{LineFramer, TextField, is_done};
use gpt_bridge::{
    BlockingClient, BlockingOffload, BridgeConfig, Establisher, HttpRequest, SessionRegistry,
    channel, probe_session_token, stream_to_channel,
};
use http::Method;
use std::io::Write;
use std::sync::Arc;
use tracing::{info, warn};

/// Streaming bridge to chat-completion upstreams
#[derive(Parser)]
#[command(name = "gpt-bridge")]
#[command(version)]
#[command(about = "Stream responses from chat upstreams through an optional HTTP proxy")]
struct Cli {
    /// TOML configuration file; environment variables are used when absent
    #[arg(short, long)]
    config: Option<String>,

    /// Proxy URL, overrides the configuration
    #[arg(long)]
    proxy: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a request and print the body as it streams in
    Fetch(FetchArgs),

    /// Harvest a session cookie from an upstream
    Probe {
        #[command(flatten)]
        target: TargetArgs,

        /// Substring identifying the wanted Set-Cookie value
        #[arg(long, default_value = "__cf_bm=")]
        marker: String,
    },
}

#[derive(Args)]
struct TargetArgs {
    /// Upstream host name
    host: String,

    /// Request path, including any query string
    #[arg(default_value = "/")]
    path: String,

    #[arg(short, long, default_value_t = 443)]
    port: u16,

    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Extra header as `Name: value`, repeatable
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,
}

#[derive(Args)]
struct FetchArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Status code the upstream must answer with
    #[arg(short, long, default_value_t = 200)]
    status: u16,

    /// Frame the body into `data: ` lines and print the extracted text
    #[arg(long)]
    lines: bool,

    /// Field or JSON pointer to extract with --lines
    #[arg(long)]
    field: Option<String>,

    /// Use the blocking client on the worker pool
    #[arg(long)]
    blocking: bool,
}

impl TargetArgs {
    fn authority(&self) -> String {
        if self.port == 443 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn request(&self) -> anyhow::Result<HttpRequest> {
        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .with_context(|| format!("invalid method {}", self.method))?;

        let mut request = HttpRequest::new(method, self.authority(), self.path.as_str());
        for header in &self.headers {
            let Some((name, value)) = header.split_once(':') else {
                bail!("header `{}` is not in `Name: value` form", header);
            };
            request = request.header(name.trim(), value.trim())?;
        }
        if let Some(data) = &self.data {
            request = request.body(data.clone());
        }
        Ok(request)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("gpt_bridge={}", cli.log_level).into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig::from_env()?,
    };
    if let Some(proxy) = cli.proxy {
        config.network.http_proxy = Some(proxy);
    }
    config.validate()?;

    match cli.command {
        Commands::Fetch(args) => fetch(&config, args).await?,
        Commands::Probe { target, marker } => probe(&config, target, &marker).await?,
    }

    info!(metrics = %BRIDGE_METRICS.snapshot(), "done");
    Ok(())
}

async fn fetch(config: &BridgeConfig, args: FetchArgs) -> anyhow::Result<()> {
    let request = args.target.request()?;
    let (tx, mut rx) = channel(config.channel.capacity);

    let producer = if args.blocking {
        let offload = BlockingOffload::new(config.workers.work_thread_num);
        offload.stream(
            BlockingClient::new(config.network.clone()),
            request,
            args.status,
            tx,
        )
    } else {
        let establisher = Arc::new(Establisher::from_config(&config.network)?);
        let endpoint = establisher.endpoint(&args.target.host, args.target.port);
        let status = args.status;
        tokio::spawn(async move { stream_to_channel(&endpoint, &request, status, tx).await })
    };

    let mut framer = args.lines.then(LineFramer::new);
    let field = TextField::parse(args.field.as_deref().unwrap_or_default());
    let mut stdout = std::io::stdout();

    loop {
        let item = tokio::select! {
            item = rx.recv() => item,
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, abandoning stream");
                rx.close();
                break;
            }
        };
        let Some(item) = item else {
            break;
        };
        let fragment = item?;
        match framer.as_mut() {
            Some(framer) => {
                for line in framer.feed(&fragment) {
                    print_line(&mut stdout, &field, &line)?;
                }
            }
            None => stdout.write_all(&fragment)?,
        }
        stdout.flush()?;
    }
    if let Some(line) = framer.as_mut().and_then(LineFramer::finish) {
        print_line(&mut stdout, &field, &line)?;
    }
    writeln!(stdout)?;

    producer.await?;
    Ok(())
}

fn print_line(out: &mut impl Write, field: &TextField, line: &str) -> std::io::Result<()> {
    if is_done(line) {
        return Ok(());
    }
    match field.extract(line) {
        Ok(Some(text)) => write!(out, "{}", text),
        Ok(None) => Ok(()),
        Err(_) => writeln!(out, "{}", line),
    }
}

async fn probe(config: &BridgeConfig, target: TargetArgs, marker: &str) -> anyhow::Result<()> {
    let establisher = Arc::new(Establisher::from_config(&config.network)?);
    let endpoint = establisher.endpoint(&target.host, target.port);
    let request = target.request()?;

    let sessions = SessionRegistry::with_ttl(config.session.ttl());
    let pool = sessions.pool(&target.host);
    let entry = pool
        .acquire(|| probe_session_token(&endpoint, &request, marker))
        .await?;
    println!("{}", entry.token);
    Ok(())
}
