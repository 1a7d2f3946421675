use std::{sync::Arc, time::Duration};

use clap::Parser;
use reauth_reqwest::{auth_error, AuthMiddleware, FailureKind, Replayed};
use reauth_session::{
    sources::RefreshEndpoint, AccessToken, RefreshCoordinator, RefreshToken, Session,
    SessionListener, SessionStore, TokenGrant,
};
use reqwest_middleware::ClientBuilder;
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The endpoint that exchanges a refresh token for a new access token
    #[arg(short, long, env)]
    refresh_url: reqwest::Url,

    /// The resource to fetch periodically
    #[arg(short = 'u', long, env)]
    resource_url: reqwest::Url,

    /// The access token obtained at login
    #[arg(short, long, env, hide_env_values = true)]
    access_token: String,

    /// The refresh token obtained at login
    #[arg(short = 't', long, env, hide_env_values = true)]
    refresh_token: String,

    /// Seconds between requests
    #[arg(short, long, env, default_value_t = 5)]
    interval: u64,
}

struct LoggingListener;

impl SessionListener for LoggingListener {
    fn on_refreshed(&self, session: &Session) {
        tracing::info!(
            token = format_args!("{:#?}", session.access_token()),
            user = ?session.user(),
            "session refreshed"
        );
    }

    fn on_logged_out(&self) {
        tracing::warn!("session ended, log in again to continue");
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let store = SessionStore::new();
    store.add_listener(Arc::new(LoggingListener));
    store.login(
        TokenGrant::new(AccessToken::new(opts.access_token))
            .with_refresh_token(RefreshToken::new(opts.refresh_token)),
    );

    let endpoint = RefreshEndpoint::new(reqwest::Client::new(), opts.refresh_url);
    let coordinator = RefreshCoordinator::new(endpoint, store.clone());

    let client = ClientBuilder::new(reqwest::Client::new())
        .with(AuthMiddleware::new(coordinator))
        .build();

    let mut interval = time::interval(Duration::from_secs(opts.interval));
    while store.is_logged() {
        interval.tick().await;

        match client.get(opts.resource_url.clone()).send().await {
            Ok(resp) => {
                tracing::info!(
                    status = resp.status().as_u16(),
                    replayed = resp.extensions().get::<Replayed>().is_some(),
                    failure = ?resp.extensions().get::<FailureKind>(),
                    "fetched resource"
                );
            }
            Err(error) => match auth_error(&error) {
                Some(error) => tracing::error!(%error, "authentication failed"),
                None => tracing::warn!(%error, "request failed"),
            },
        }
    }

    Ok(())
}
