use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hypsync_client::{
    AnnoFetcher, AnnotationIndex, FetchOptions, HypApi, Memoizer, Pipeline, Prefilter,
    PrintHandler, Subscriber, SyncConfig, SyncHandler,
};
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
struct Args {
    /// API token; falls back to HYP_API_TOKEN.
    #[clap(long)]
    token: Option<String>,
    /// Username the token belongs to; falls back to HYP_USERNAME.
    #[clap(long)]
    username: Option<String>,
    /// Group to synchronize; falls back to HYP_GROUP, then __world__.
    #[clap(long)]
    group: Option<String>,
    #[clap(long, default_value = "hypothes.is")]
    domain: String,
    /// Cache file holding the group replica.
    #[clap(short, long)]
    cache: PathBuf,
    /// Stop the backfill after this many rows.
    #[clap(long)]
    max_results: Option<usize>,
    /// Keep following the event stream after the backfill.
    #[clap(long)]
    follow: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let token = args
        .token
        .or_else(|| std::env::var("HYP_API_TOKEN").ok())
        .context("no API token; pass --token or set HYP_API_TOKEN")?;
    let username = args
        .username
        .or_else(|| std::env::var("HYP_USERNAME").ok())
        .context("no username; pass --username or set HYP_USERNAME")?;
    let group = args
        .group
        .or_else(|| std::env::var("HYP_GROUP").ok())
        .unwrap_or_else(|| "__world__".to_owned());

    let config = SyncConfig::new(token, username, group).with_domain(args.domain);
    let api = HypApi::new(&config)?;
    let memoizer = Arc::new(Memoizer::new(args.cache, AnnoFetcher::new(api)));

    let annos = match args.max_results {
        Some(max_results) => {
            let annos = memoizer
                .fetcher()
                .annos(FetchOptions {
                    max_results: Some(max_results),
                    ..FetchOptions::default()
                })
                .await?;
            memoizer.persist(&annos).await?;
            annos
        }
        None => memoizer.get_annos().await?,
    };
    info!(
        "{} annotations cached for group {}",
        annos.len(),
        memoizer.group()
    );

    if args.follow {
        let index = Arc::new(Mutex::new(AnnotationIndex::from_records(annos)));
        let pipeline = Pipeline::new()
            .with(PrintHandler)
            .with(SyncHandler::new(index, memoizer.clone()));
        let subscriber = Arc::new(Subscriber::new(
            Subscriber::endpoint_for_domain(&config.domain),
            config.api_token.clone(),
            Prefilter::group(&config.group),
            pipeline,
        ));

        let killer = Arc::clone(&subscriber);
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.expect("listen to ctrlc");
            killer.kill();
        });

        subscriber.listen().await?;
    }
    Ok(())
}
