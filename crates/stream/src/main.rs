//! Live annotation stream.
//!
//! Connects to the push endpoint with changes applied as they arrive and logs each one while it
//! is highlighted. Runs until interrupted or until the reconnect budget is spent.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use margin_config::Config;
use margin_proto::AnnotationId;
use margin_proto::push::{ClientMessage, StreamFilter};
use margin_sync::services::streamer::{JsonLinesConnector, StaticEndpoint};
use margin_sync::{ConnectionState, Route, StoreHandle, StreamerConfig, StreamerService};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "margin-stream")]
#[command(about = "Follow live annotation changes")]
struct Args {
	/// Configuration file (defaults to the per-user config location).
	#[arg(short, long, value_name = "PATH")]
	config: Option<PathBuf>,

	/// Push endpoint URL.
	#[arg(long)]
	url: Option<String>,

	/// Access token attached to the connection.
	#[arg(long)]
	token: Option<String>,

	/// Only show changes in this group.
	#[arg(short, long)]
	group: Option<String>,

	/// Only show changes on this document. Repeatable; takes precedence over `--group`.
	#[arg(long = "uri", value_name = "URI")]
	uris: Vec<String>,

	/// Enable verbose logging.
	#[arg(short, long)]
	verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();
	setup_tracing(args.verbose);

	let config = match &args.config {
		Some(path) => Config::load(path)?,
		None => match margin_config::default_path() {
			Some(path) => Config::load_or_default(path)?,
			None => Config::default(),
		},
	};

	let url = args
		.url
		.clone()
		.or_else(|| config.streamer.url.clone())
		.ok_or("no push endpoint configured; pass --url or set streamer.url")?;
	let token = args.token.clone().or_else(|| config.streamer.access_token.clone());
	let endpoint = StaticEndpoint::parse(&url, token)?;

	let store = StoreHandle::with_anchor_timeout(Route::Stream, config.sync.anchor_timeout());
	let streamer = StreamerService::start(
		store.clone(),
		Arc::new(endpoint),
		Arc::new(JsonLinesConnector),
		streamer_config(&config),
	);

	if let Some(filter) = filter_for(&args, &config) {
		streamer.set_config("filter", ClientMessage::filter(&filter)).await?;
	}
	tracing::info!(url = %url, client_id = %streamer.client_id(), "connecting");
	streamer.connect().await?;

	let shutdown = CancellationToken::new();
	tokio::spawn({
		let shutdown = shutdown.clone();
		async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				tracing::info!("interrupted");
			}
			shutdown.cancel();
		}
	});

	let mut state = streamer.subscribe_state();
	let mut revisions = store.subscribe();
	let mut shown = BTreeSet::new();
	let mut outcome = Ok(());
	loop {
		tokio::select! {
			_ = shutdown.cancelled() => break,
			Ok(()) = state.changed() => {
				let current = *state.borrow_and_update();
				tracing::debug!(state = ?current, "connection state");
				if current == ConnectionState::GaveUp {
					outcome = Err("push endpoint unreachable".into());
					break;
				}
			}
			Ok(()) = revisions.changed() => {
				revisions.borrow_and_update();
				report(&store, &mut shown);
			}
		}
	}

	streamer.shutdown().await;
	outcome
}

/// The stream view applies every change as it arrives, whatever the file says.
fn streamer_config(config: &Config) -> StreamerConfig {
	StreamerConfig {
		apply_immediately: true,
		..StreamerConfig::from(&config.streamer)
	}
}

/// Command-line selection wins over the config file; documents win over a group.
fn filter_for(args: &Args, config: &Config) -> Option<StreamFilter> {
	let uris = if args.uris.is_empty() { &config.stream.uris } else { &args.uris };
	if !uris.is_empty() {
		return Some(StreamFilter::for_uris(uris.iter().cloned()));
	}
	args.group
		.as_deref()
		.or(config.stream.group.as_deref())
		.map(StreamFilter::for_group)
}

/// Logs annotations that became highlighted since the last revision.
fn report(store: &StoreHandle, shown: &mut BTreeSet<AnnotationId>) {
	store.read(|s| {
		let highlighted = s.annotations().highlighted();
		for id in highlighted.difference(shown) {
			let Some(record) = s.annotations().find_by_id(id) else {
				continue;
			};
			tracing::info!(
				id = %id,
				uri = record.uri.as_deref().unwrap_or(""),
				user = record.user.as_deref().unwrap_or(""),
				text = record.text.as_deref().unwrap_or(""),
				"annotation"
			);
		}
		*shown = highlighted.clone();
		tracing::debug!(total = s.annotations().len(), "collection changed");
	});
}

fn setup_tracing(verbose: bool) {
	use tracing_subscriber::EnvFilter;
	use tracing_subscriber::fmt::format::FmtSpan;
	use tracing_subscriber::prelude::*;

	let default_filter = if verbose { "margin=trace,debug" } else { "margin=debug,info" };
	let filter = || EnvFilter::try_from_env("MARGIN_LOG").unwrap_or_else(|_| EnvFilter::new(default_filter));

	if let Ok(log_dir) = std::env::var("MARGIN_LOG_DIR") {
		let log_dir = PathBuf::from(log_dir);
		let _ = std::fs::create_dir_all(&log_dir);
		let log_path = log_dir.join(format!("margin-stream.{}.log", std::process::id()));

		if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(&log_path) {
			let layer = tracing_subscriber::fmt::layer()
				.with_writer(file)
				.with_ansi(false)
				.with_span_events(FmtSpan::CLOSE)
				.with_target(true);

			tracing_subscriber::registry().with(filter()).with(layer).init();
			tracing::info!(path = ?log_path, "margin-stream tracing initialized");
			return;
		}
	}

	tracing_subscriber::fmt()
		.with_env_filter(filter())
		.with_writer(std::io::stderr)
		.init();
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	fn args(extra: &[&str]) -> Args {
		Args::parse_from(std::iter::once("margin-stream").chain(extra.iter().copied()))
	}

	#[test]
	fn documents_beat_groups() {
		let config = Config::default();
		let filter = filter_for(&args(&["--group", "g", "--uri", "http://x/1"]), &config);
		assert_eq!(filter, Some(StreamFilter::for_uris(["http://x/1"])));
	}

	#[test]
	fn command_line_beats_config() {
		let mut config = Config::default();
		config.stream.group = Some("from-config".into());
		assert_eq!(
			filter_for(&args(&["-g", "cli"]), &config),
			Some(StreamFilter::for_group("cli"))
		);
		assert_eq!(
			filter_for(&args(&[]), &config),
			Some(StreamFilter::for_group("from-config"))
		);
		assert_eq!(filter_for(&args(&[]), &Config::default()), None);
	}

	#[test]
	fn stream_always_applies_immediately() {
		let mut file = Config::default();
		file.streamer.max_reconnect_attempts = 2;
		let config = streamer_config(&file);
		assert!(config.apply_immediately);
		assert_eq!(config.reconnect.max_attempts, 2);
		assert_eq!(config.highlight_duration, file.streamer.highlight_duration());
	}
}
