//! community-feed binary entry point

use clap::{Parser, Subcommand};
use community_feed::{
    AppState,
    auth::{CallbackListener, OAuthClientMetadata},
    config::{self, AppConfig},
    data::{AccountStore, AtUri},
    service::{HydrationMemo, ModerationOpts, community_post},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Setting holding the loopback port the current tokens were issued for
const LOOPBACK_PORT_SETTING: &str = "oauth_loopback_port";

#[derive(Parser)]
#[command(name = "community-feed")]
#[command(about = "Read atproto community feeds from the command line", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Print metrics in the Prometheus text format before exiting
    #[arg(long, env = "COMMUNITY_FEED_PRINT_METRICS")]
    print_metrics: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with a handle, DID or PDS URL
    Login { handle: String },
    /// Sign the current account out of this device
    Logout,
    /// Community timeline
    Timeline {
        /// Pages to load
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
    /// Community feed of an actor
    Feed {
        actor: String,
        /// Pages to load
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
    /// Single community post
    Post { uri: String },
    /// Trends and trending topics
    Trending,
    /// Open Collective link status of the current account
    OcStatus,
}

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize metrics
/// 4. Open device storage and AppState
/// 5. Run the command
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging
    init_logging(&config);
    tracing::info!(
        public_api = %config.service.public_api,
        storage = %config.storage.path.display(),
        "Configuration loaded"
    );

    // 3. Initialize metrics
    community_feed::metrics::init_metrics();

    // 4. Open device storage
    let store = AccountStore::connect(&config.storage.path).await?;

    // 5. Run the command
    match cli.command {
        Commands::Login { handle } => login(config, store, &handle).await?,
        command => {
            let state = resume(config, store).await?;
            run(&state, command).await?;
        }
    }

    if cli.print_metrics {
        print!("{}", community_feed::metrics::gather_text());
    }
    Ok(())
}

fn init_logging(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("community_feed={},tower_http=debug", config.logging.level).into()
    });

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    }
}

/// Sign in through a loopback redirect
async fn login(config: AppConfig, store: AccountStore, handle: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listener = CallbackListener::bind(config.oauth.loopback_port).await?;
    let metadata =
        OAuthClientMetadata::for_environment(&config.oauth, &listener.redirect_host(), Some(listener.port()));
    store
        .set_setting(LOOPBACK_PORT_SETTING, &listener.port().to_string())
        .await?;

    let state = AppState::new(config, store, metadata)?;
    let authorize_url = state.sessions.sign_in(handle).await?;
    println!("Open this URL in a browser to sign in:\n\n  {authorize_url}\n");

    let params = listener.wait().await?;
    match state.sessions.complete_sign_in(&params).await {
        Some(established) => println!("Signed in as @{}", established.account.handle),
        None => println!("Sign-in did not complete; continuing signed out"),
    }
    Ok(())
}

/// Build state with the client identity of the last sign-in and resume it
async fn resume(config: AppConfig, store: AccountStore) -> Result<AppState, Box<dyn std::error::Error>> {
    let port = store
        .get_setting(LOOPBACK_PORT_SETTING)
        .await?
        .and_then(|port| port.parse::<u16>().ok())
        .unwrap_or(config.oauth.loopback_port);
    let metadata = OAuthClientMetadata::for_environment(&config.oauth, "127.0.0.1", Some(port));

    let state = AppState::new(config, store, metadata)?;
    if let Err(err) = state.sessions.resume_current().await {
        tracing::warn!(error = %err, "Continuing signed out");
    }
    Ok(state)
}

async fn run(state: &AppState, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Login { .. } => {}
        Commands::Logout => {
            state.sessions.logout().await?;
            println!("Signed out");
        }
        Commands::Timeline { pages } => {
            let query = state.timeline_query().await;
            print_feed(state, &query, pages).await?;
        }
        Commands::Feed { actor, pages } => {
            let query = state.feed_query(Some(&actor)).await;
            print_feed(state, &query, pages).await?;
        }
        Commands::Post { uri } => {
            AtUri::parse(&uri)?;
            let client = state.client().await;
            let post = community_post(&client, &state.posts, Some(&uri)).await?;
            let record = community_feed::api::PostRecord::from_value(&post.record);
            println!("@{} ({})\n{}", post.author.handle, post.indexed_at, record.text);
            println!(
                "replies {} reposts {} likes {}",
                post.reply_count.unwrap_or_default(),
                post.repost_count.unwrap_or_default(),
                post.like_count.unwrap_or_default()
            );
        }
        Commands::Trending => {
            let current = state.sessions.current().await;
            let preferences = current
                .as_ref()
                .and_then(|established| established.agent.preferences().cloned());

            match state.trending.get_trends(preferences.as_deref()).await {
                Ok(trends) => {
                    for trend in trends.trends {
                        println!("{} ({} posts)", trend.display_name, trend.post_count);
                    }
                }
                Err(err) => tracing::debug!(error = %err, "Trends unavailable"),
            }
            let topics = state.trending.get_trending_topics(preferences.as_deref()).await?;
            for topic in topics.topics.iter().chain(topics.suggested.iter()) {
                println!("#{}", topic.display_name.as_deref().unwrap_or(&topic.topic));
            }
        }
        Commands::OcStatus => {
            let current = state.sessions.current().await;
            let client = state.client().await;
            let did = current.as_ref().map(|established| established.account.did.as_str());
            let status = state.open_collective.link_status(&client, did).await?;
            match (&status.linked, &status.email) {
                (true, Some(email)) => println!("Linked to {email}"),
                (true, None) => println!("Linked"),
                (false, _) => println!("Not linked"),
            }
        }
    }
    Ok(())
}

async fn print_feed(
    state: &AppState,
    query: &community_feed::service::FeedQuery,
    pages: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut data = query.fetch_next_page().await?;
    for _ in 1..pages {
        if !data.has_next_page() {
            break;
        }
        data = query.fetch_next_page().await?;
    }

    let opts = match state.sessions.current().await {
        Some(established) => established.agent.moderation_opts(),
        None => std::sync::Arc::new(ModerationOpts::default()),
    };
    let posts = HydrationMemo::new().hydrate(&data, Some(&opts));
    for hydrated in posts.iter() {
        if hydrated.moderation.filter {
            continue;
        }
        let text = if hydrated.moderation.blur {
            "[content warning]"
        } else {
            hydrated.record.text.as_str()
        };
        println!("@{}: {}", hydrated.post.author.handle, text);
    }
    if data.has_next_page() {
        println!("(more available)");
    }
    Ok(())
}
