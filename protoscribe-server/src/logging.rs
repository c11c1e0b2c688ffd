//! Tracing setup.
//!
//! `RUST_LOG` wins when set. Otherwise the environment picks the level:
//! `local` → text at debug, `dev` → JSON at debug, `prod` → JSON at info.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Environment;

pub fn default_filter(env: Environment) -> String {
    let level = match env {
        Environment::Local | Environment::Dev => "debug",
        Environment::Prod => "info",
    };
    format!(
        "protoscribe={level},protoscribe_core={level},protoscribe_server={level},tower_http=info"
    )
}

pub fn init_tracing(env: Environment) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(env).into());

    let registry = tracing_subscriber::registry().with(filter);
    match env {
        Environment::Local => registry.with(tracing_subscriber::fmt::layer()).init(),
        Environment::Dev | Environment::Prod => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}
