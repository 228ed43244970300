use std::io::{IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use citegrab_core::context::BrowsingContext;
use citegrab_core::{
    BatchJob, ClipboardWriter, Config, CrossWindowFlow, FetchProxyClient, ResultPage,
    SingleItemFlow, config_file, run_batch,
};
use citegrab_scholar::{HttpContextOpener, HttpFetchProxy, ScholarSession};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

mod output;

use output::ColorMode;

/// Copy BibTeX citations from Google Scholar search results
#[derive(Parser, Debug)]
#[command(name = "citegrab", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Write citations to this file instead of the clipboard
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// How long to wait for the BibTeX link, in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch the citation of the first result for a query
    Fetch {
        /// Free-text search query
        query: String,
    },

    /// Fetch citations for one query per line, staggered
    Batch {
        /// File with one query per line (stdin if omitted)
        file: Option<PathBuf>,
    },

    /// Copy the citation of one result on a results page
    Item {
        /// Results page URL
        url: Url,

        /// Zero-based position of the result on the page
        #[arg(long, default_value_t = 0)]
        index: usize,
    },

    /// Fetch citations by cluster id, without the citation pop-over
    Direct {
        /// One or more free-text queries
        #[arg(required = true)]
        queries: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_deref())?;

    let config = build_config(&cli)?;
    let color = ColorMode(!cli.no_color && std::io::stderr().is_terminal());

    match cli.command {
        Command::Fetch { query } => fetch(&config, &query, color).await,
        Command::Batch { file } => batch(&config, file.as_deref(), color).await,
        Command::Item { url, index } => item(&config, &url, index, color).await,
        Command::Direct { queries } => direct(&config, &queries, color).await,
    }
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("citegrab=info"));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("log file path has no file name: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Defaults, then config files, then environment, then flags.
fn build_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::default();
    config.apply_file(&config_file::load_config())?;

    if let Ok(base) = std::env::var("CITEGRAB_BASE_URL") {
        Url::parse(&base).map_err(|e| anyhow::anyhow!("CITEGRAB_BASE_URL {base:?}: {e}"))?;
        config.base_url = base;
    }
    if let Some(ms) = std::env::var("CITEGRAB_OBSERVE_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        config.observe_timeout = Duration::from_millis(ms);
    }

    if let Some(ms) = cli.timeout_ms {
        config.observe_timeout = Duration::from_millis(ms);
    }
    if let Some(path) = &cli.output {
        config.output_path = Some(path.clone());
        config.clipboard_strategies = vec!["file".into()];
    }
    Ok(config)
}

/// Collaborators shared by every subcommand.
struct Pipeline {
    session: ScholarSession,
    opener: Arc<HttpContextOpener>,
    clipboard: Arc<ClipboardWriter>,
    single: Arc<SingleItemFlow>,
    cross: Arc<CrossWindowFlow>,
}

impl Pipeline {
    fn new(config: &Config, notifier: citegrab_core::Notifier) -> anyhow::Result<Self> {
        let session = ScholarSession::new(config)?;
        let opener = Arc::new(HttpContextOpener::new(session.clone()));
        let client = FetchProxyClient::new(Arc::new(HttpFetchProxy::new(session.clone())));
        let clipboard = Arc::new(ClipboardWriter::from_names(
            &config.clipboard_strategies,
            config.output_path.as_deref(),
        ));
        if clipboard.strategy_names().is_empty() {
            tracing::warn!("no clipboard strategy is available; citations will not be delivered");
        }

        let single = Arc::new(SingleItemFlow::new(
            config,
            client.clone(),
            clipboard.clone(),
            notifier.clone(),
        ));
        let cross = Arc::new(CrossWindowFlow::new(
            config,
            opener.clone(),
            client,
            clipboard.clone(),
            notifier,
        )?);
        Ok(Self {
            session,
            opener,
            clipboard,
            single,
            cross,
        })
    }
}

async fn fetch(config: &Config, query: &str, color: ColorMode) -> anyhow::Result<()> {
    let pipeline = Pipeline::new(config, output::notifier(color, None))?;
    pipeline.cross.clear_destination().await;
    let outcome = pipeline.cross.run(query).await;
    if let Some(reason) = outcome.reason() {
        anyhow::bail!("no citation for {query:?}: {}", output::describe(reason));
    }
    Ok(())
}

async fn batch(config: &Config, file: Option<&Path>, color: ColorMode) -> anyhow::Result<()> {
    let text = match file {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let job = BatchJob::from_lines(&text, config.batch_stagger);
    if job.is_empty() {
        anyhow::bail!("no queries to look up");
    }
    let total = job.len();

    let bar = indicatif::ProgressBar::new(total as u64);
    bar.set_style(
        indicatif::ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(120));

    let pipeline = Pipeline::new(config, output::notifier(color, Some(bar.clone())))?;

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });

    let results = run_batch(job, pipeline.cross.clone(), cancel.clone()).await;
    bar.finish_and_clear();

    let succeeded = results.iter().filter(|r| r.outcome.is_success()).count();
    output::print_tally(succeeded, total, color);
    if cancel.is_cancelled() {
        anyhow::bail!("interrupted after {} of {total} queries", results.len());
    }
    if succeeded < total {
        anyhow::bail!("{} of {total} queries failed", total - succeeded);
    }
    Ok(())
}

async fn item(config: &Config, url: &Url, index: usize, color: ColorMode) -> anyhow::Result<()> {
    let pipeline = Pipeline::new(config, output::notifier(color, None))?;
    let context = pipeline.opener.load(url).await?;

    let page = ResultPage::new(context.document().clone(), pipeline.single.clone());
    let wired = page.wire_items();
    let Some(target) = wired.get(index) else {
        context.close();
        anyhow::bail!("page has {} citable results, no result at index {index}", wired.len());
    };

    let outcome = page.extract(target.item).await;
    context.close();
    match outcome.as_ref().and_then(|o| o.reason()) {
        Some(reason) => anyhow::bail!("{}", output::describe(reason)),
        None => Ok(()),
    }
}

async fn direct(config: &Config, queries: &[String], color: ColorMode) -> anyhow::Result<()> {
    let pipeline = Pipeline::new(config, output::notifier(color, None))?;
    let results = citegrab_scholar::direct_batch(&pipeline.session, queries).await;
    for r in &results {
        let line = match r.outcome.reason() {
            None => format!("✓ \"{}\"", r.query),
            Some(reason) => format!("✗ \"{}\": {}", r.query, output::describe(reason)),
        };
        eprintln!("{line}");
    }

    let joined = citegrab_scholar::join_bodies(&results);
    let succeeded = results.iter().filter(|r| r.outcome.is_success()).count();
    if succeeded > 0 {
        if pipeline.clipboard.write(&joined).await.is_none() {
            // Nothing accepted the text; print it so it is not lost.
            println!("{joined}");
        }
    }
    output::print_tally(succeeded, queries.len(), color);
    if succeeded < queries.len() {
        anyhow::bail!("{} of {} queries failed", queries.len() - succeeded, queries.len());
    }
    Ok(())
}
