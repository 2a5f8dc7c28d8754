use std::future::pending;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use pulseboard_client::{
    ClientConfig, HttpLaneLauncher, SocketConfig, TransferOptions, WsTransport, run_channel,
    run_transfer,
};
use pulseboard_sync::{
    Backing, BulkTransfer, Channel, ChannelEvent, CollectionConfig, Control, EvictionEdge,
    FilterDecl, GenericOpPolicy, LaneDecl, MapControl, MemoryDocument, MemoryPreferences,
    PlaceFilter, RowCollection, RowControl, TransferOutcome, TransferPlan,
};
use tracing::warn;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "pulseboard")]
#[command(about = "Live dashboard channel and bulk transfer client")]
pub struct PulseboardCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Subscribe to a dashboard socket and print widget state as it changes
    Watch(WatchArgs),
    /// Run a bulk transfer until the server finishes or it is cancelled
    Bulk(BulkArgs),
}

#[derive(clap::Args, Debug)]
pub struct WatchArgs {
    /// Socket URL (defaults to PULSEBOARD_SOCKET_URL)
    #[arg(long)]
    pub url: Option<Url>,
    /// Row widget to bind, repeatable
    #[arg(long = "rows", value_name = "NAME")]
    pub rows: Vec<String>,
    /// Table widget to bind, repeatable
    #[arg(long = "table", value_name = "NAME")]
    pub tables: Vec<String>,
    /// Map widget to bind, repeatable
    #[arg(long = "map", value_name = "NAME")]
    pub maps: Vec<String>,
    /// Map layer group hidden from the start, repeatable
    #[arg(long = "hide-group", value_name = "GROUP")]
    pub hidden_groups: Vec<String>,
    /// Keep at most this many rows per row widget
    #[arg(long)]
    pub max_rows: Option<usize>,
    /// Edge evicted once a bounded widget is full
    #[arg(long, value_enum, default_value_t = Edge::Tail)]
    pub evict: Edge,
    /// Accept SET_CONTENT into regions named with --region
    #[arg(long)]
    pub allow_content: bool,
    /// Content region, repeatable
    #[arg(long = "region", value_name = "ID")]
    pub regions: Vec<String>,
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,
}

#[derive(clap::Args, Debug)]
pub struct BulkArgs {
    /// Transfer control endpoint (defaults to PULSEBOARD_TRANSFER_URL)
    #[arg(long)]
    pub url: Option<Url>,
    /// Base URL lanes are fetched from (defaults to PULSEBOARD_LANE_BASE_URL)
    #[arg(long)]
    pub lane_base: Option<Url>,
    /// Boolean filter as NAME=true|false, repeatable, sent in the given order
    #[arg(long = "filter", value_name = "NAME=BOOL", value_parser = parse_filter)]
    pub filters: Vec<(String, bool)>,
    /// Lane as RESOURCE or RESOURCE:FILTER, repeatable
    #[arg(long = "lane", value_name = "RESOURCE[:FILTER]", value_parser = parse_lane)]
    pub lanes: Vec<LaneDecl>,
    #[arg(long)]
    pub batch_size_bytes: Option<u64>,
    #[arg(long)]
    pub download_dir: Option<PathBuf>,
    #[arg(long, requires = "place_id")]
    pub provider_id: Option<String>,
    #[arg(long, requires = "provider_id")]
    pub place_id: Option<String>,
    #[arg(long)]
    pub start_ms: Option<i64>,
    #[arg(long)]
    pub end_ms: Option<i64>,
    /// Stop after the first batch instead of starting the next round once
    /// its lanes settle
    #[arg(long)]
    pub no_auto_continue: bool,
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Edge {
    Head,
    Tail,
}

impl From<Edge> for EvictionEdge {
    fn from(edge: Edge) -> Self {
        match edge {
            Edge::Head => EvictionEdge::Head,
            Edge::Tail => EvictionEdge::Tail,
        }
    }
}

fn parse_filter(raw: &str) -> std::result::Result<(String, bool), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=BOOL, got {raw}"))?;
    let value = value
        .parse::<bool>()
        .map_err(|_| format!("filter {name} must be true or false"))?;
    if name.is_empty() {
        return Err("filter name is empty".to_string());
    }
    Ok((name.to_string(), value))
}

fn parse_lane(raw: &str) -> std::result::Result<LaneDecl, String> {
    match raw.split_once(':') {
        Some((resource, filter)) if !resource.is_empty() && !filter.is_empty() => {
            Ok(LaneDecl::when(resource, filter))
        }
        Some(_) => Err(format!("expected RESOURCE:FILTER, got {raw}")),
        None if raw.is_empty() => Err("lane resource is empty".to_string()),
        None => Ok(LaneDecl::always(raw)),
    }
}

pub async fn run() -> Result<()> {
    let cli = PulseboardCli::parse();
    let config = ClientConfig::from_env().context("read PULSEBOARD_* environment")?;
    match cli.command {
        Commands::Watch(args) => watch(args, config).await,
        Commands::Bulk(args) => bulk(args, config).await,
    }
}

async fn stop_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!("ctrl-c handler unavailable: {error}");
        pending::<()>().await;
    }
}

fn apply_timeout(config: &mut ClientConfig, timeout_ms: Option<u64>) -> Result<()> {
    if let Some(timeout_ms) = timeout_ms {
        if timeout_ms == 0 {
            return Err(anyhow!("--connect-timeout-ms must be greater than zero"));
        }
        config.connect_timeout = Duration::from_millis(timeout_ms);
    }
    Ok(())
}

async fn watch(args: WatchArgs, mut config: ClientConfig) -> Result<()> {
    if args.url.is_some() {
        config.socket_url = args.url.clone();
    }
    apply_timeout(&mut config, args.connect_timeout_ms)?;
    let url = config.require_socket_url()?.clone();
    if args.rows.is_empty() && args.tables.is_empty() && args.maps.is_empty() {
        return Err(anyhow!("bind at least one widget with --rows, --table or --map"));
    }

    let document = MemoryDocument::new();
    let policy = if args.allow_content {
        GenericOpPolicy::content_only()
    } else {
        GenericOpPolicy::deny_all()
    };
    let (transport, mut events) = WsTransport::new(SocketConfig::from(&config));
    let mut channel = Channel::connect(url, transport, policy)?;
    if args.allow_content {
        for region in &args.regions {
            document.add_region(region.as_str());
        }
        channel.set_content_surface(Box::new(document.clone()));
    }

    let bound = |backing| CollectionConfig {
        max_length: args.max_rows,
        eviction_edge: args.evict.into(),
        backing,
    };
    for (names, backing) in [(&args.rows, Backing::Nested), (&args.tables, Backing::Tabular)] {
        for name in names {
            document.add_region(format!("{name}_contents"));
            document.add_region(format!("{name}_header"));
            let collection = RowCollection::attach(&document, name, bound(backing))?;
            channel.bind(Box::new(RowControl::new(collection)))?;
        }
    }
    for name in &args.maps {
        let mut control = MapControl::new(name.as_str());
        if let Some(layers) = control.layers_mut() {
            for group in &args.hidden_groups {
                layers.hide_group(group);
            }
        }
        channel.bind(Box::new(control))?;
    }

    let disconnect = run_channel(&mut channel, &mut events, stop_signal(), |channel, event| {
        match event {
            ChannelEvent::Opened => println!("connected to {}", channel.url()),
            ChannelEvent::Dispatched(report) => {
                for name in &report.dispatched {
                    print_widget(channel, &document, name);
                }
                for (name, error) in &report.errors {
                    println!("! {name}: {error}");
                }
            }
            ChannelEvent::Errored(_) | ChannelEvent::Disconnected(_) | ChannelEvent::Ignored => {}
        }
    })
    .await?;

    println!(
        "disconnected ({}{})",
        if disconnect.graceful { "graceful" } else { "error" },
        disconnect
            .code
            .map(|code| format!(", code {code}"))
            .unwrap_or_default()
    );
    if args.allow_content {
        for region in &args.regions {
            println!("[{region}] {}", document.render_text(region));
        }
    }
    Ok(())
}

fn print_widget<T: pulseboard_sync::Transport>(
    channel: &Channel<T>,
    document: &MemoryDocument,
    name: &str,
) {
    let Some(control) = channel.control(name) else {
        return;
    };
    if control.rows().is_some() {
        println!("== {name}");
        for cells in document.rows(&format!("{name}_header")) {
            println!("   {}", cells.join(" | "));
        }
        for cells in document.rows(&format!("{name}_contents")) {
            println!(" - {}", cells.join(" | "));
        }
    } else if let Some(layers) = control.layers() {
        println!(
            "== {name}: {} items ({} on the primary layer)",
            layers.len(),
            layers.primary_len()
        );
    }
}

/// Transfer plan from flags over the environment configuration.
pub fn transfer_plan(args: &BulkArgs, config: &mut ClientConfig) -> Result<TransferPlan> {
    if args.url.is_some() {
        config.transfer_url = args.url.clone();
    }
    if args.lane_base.is_some() {
        config.lane_base_url = args.lane_base.clone();
    }
    if let Some(dir) = &args.download_dir {
        config.download_dir = dir.clone();
    }
    apply_timeout(config, args.connect_timeout_ms)?;

    let mut plan = TransferPlan::new(config.require_transfer_url()?.clone(), config.resolve_lane_base()?);
    for (name, value) in &args.filters {
        plan = plan.with_filter(FilterDecl::new(name.as_str(), *value));
    }
    let lanes = if args.lanes.is_empty() {
        vec![LaneDecl::always("user_tunnel")]
    } else {
        args.lanes.clone()
    };
    for lane in lanes {
        plan = plan.with_lane(lane);
    }
    if let (Some(provider_id), Some(place_id)) = (&args.provider_id, &args.place_id) {
        plan.place = Some(PlaceFilter {
            provider_id: provider_id.clone(),
            place_id: place_id.clone(),
        });
    }
    plan.start_epoch_ms = args.start_ms;
    plan.end_epoch_ms = args.end_ms;
    Ok(plan)
}

async fn bulk(args: BulkArgs, mut config: ClientConfig) -> Result<()> {
    let plan = transfer_plan(&args, &mut config)?;
    std::fs::create_dir_all(&config.download_dir)
        .with_context(|| format!("create download dir {}", config.download_dir.display()))?;

    let (launcher, mut lanes) = HttpLaneLauncher::new(config.download_dir.clone());
    let mut transfer = BulkTransfer::new(plan, MemoryPreferences::new(), launcher);
    transfer.set_batch_size(args.batch_size_bytes.unwrap_or(config.batch_size_bytes))?;
    let (transport, mut events) = WsTransport::new(SocketConfig::from(&config));
    transfer.start(transport)?;
    println!("transfer started: {}", transfer.build_request().query_string());

    let options = TransferOptions {
        auto_continue: !args.no_auto_continue,
    };
    if !options.auto_continue {
        println!("single batch: ctrl-c ends the transfer once the batch is saved");
    }
    let outcome = run_transfer(&mut transfer, &mut events, &mut lanes, options, stop_signal()).await?;
    let progress = transfer.progress();
    match outcome {
        TransferOutcome::Completed => println!("{}", transfer.affordances().continue_label.as_str()),
        TransferOutcome::Cancelled { progress } => println!("cancelled at {progress:.0}%"),
        TransferOutcome::Interrupted { .. } => {}
    }
    if let Some(session) = transfer.session() {
        for (lane, status) in &session.lanes {
            println!("  {} {:?}", lane.resource, status);
        }
    }
    println!("total {:.0}%, batch {:.0}%", progress.total, progress.batch);
    outcome.into_result()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use clap::error::ErrorKind;

    use super::{Commands, Edge, PulseboardCli, transfer_plan};
    use pulseboard_client::ClientConfig;
    use url::Url;

    #[test]
    fn cli_requires_subcommand() {
        let err = match PulseboardCli::try_parse_from(["pulseboard"]) {
            Ok(_) => panic!("expected missing subcommand parse error"),
            Err(err) => err,
        };
        assert_eq!(
            err.kind(),
            ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
    }

    #[test]
    fn watch_collects_widgets() -> anyhow::Result<()> {
        let cli = PulseboardCli::try_parse_from([
            "pulseboard",
            "watch",
            "--url",
            "ws://dash.local/socket",
            "--rows",
            "followers",
            "--table",
            "users",
            "--map",
            "map",
            "--max-rows",
            "20",
            "--evict",
            "head",
        ])?;
        let Commands::Watch(args) = cli.command else {
            panic!("expected watch");
        };
        assert_eq!(args.rows, vec!["followers"]);
        assert_eq!(args.tables, vec!["users"]);
        assert_eq!(args.maps, vec!["map"]);
        assert_eq!(args.max_rows, Some(20));
        assert_eq!(args.evict, Edge::Head);
        Ok(())
    }

    #[test]
    fn bulk_flags_override_environment() -> anyhow::Result<()> {
        let cli = PulseboardCli::try_parse_from([
            "pulseboard",
            "bulk",
            "--url",
            "wss://dash.example/bulk_download/17",
            "--filter",
            "users=true",
            "--filter",
            "tweets=false",
            "--lane",
            "user_tunnel",
            "--lane",
            "tweet_tunnel:tweets",
            "--start-ms",
            "1000",
        ])?;
        let Commands::Bulk(args) = cli.command else {
            panic!("expected bulk");
        };
        let mut config = ClientConfig {
            transfer_url: Some(Url::parse("ws://ignored.local/")?),
            ..ClientConfig::default()
        };
        let plan = transfer_plan(&args, &mut config)?;
        assert_eq!(plan.endpoint.as_str(), "wss://dash.example/bulk_download/17");
        assert_eq!(plan.lane_base.as_str(), "https://dash.example/");
        assert_eq!(plan.filters.len(), 2);
        assert_eq!(plan.lanes[1].required_filter.as_deref(), Some("tweets"));
        assert_eq!(plan.start_epoch_ms, Some(1000));
        Ok(())
    }

    #[test]
    fn bulk_continues_rounds_unless_told_not_to() -> anyhow::Result<()> {
        let cli = PulseboardCli::try_parse_from(["pulseboard", "bulk"])?;
        let Commands::Bulk(args) = cli.command else {
            panic!("expected bulk");
        };
        assert!(!args.no_auto_continue);

        let cli = PulseboardCli::try_parse_from(["pulseboard", "bulk", "--no-auto-continue"])?;
        let Commands::Bulk(args) = cli.command else {
            panic!("expected bulk");
        };
        assert!(args.no_auto_continue);
        Ok(())
    }

    #[test]
    fn bulk_rejects_malformed_filters_and_half_places() {
        for argv in [
            vec!["pulseboard", "bulk", "--filter", "users"],
            vec!["pulseboard", "bulk", "--filter", "users=maybe"],
            vec!["pulseboard", "bulk", "--lane", "tweet_tunnel:"],
            vec!["pulseboard", "bulk", "--provider-id", "p1"],
        ] {
            assert!(PulseboardCli::try_parse_from(argv.clone()).is_err(), "{argv:?}");
        }
    }
}
