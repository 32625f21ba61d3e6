mod admin;
mod cache;
mod config;
mod drivers;
mod expand;
mod frontend;
mod lineio;
mod mech;
mod metrics;
mod netpolicy;
mod passdb;
mod reply;
mod request;
mod scheme;
mod server;
mod userdb;
mod username;
mod worker_pool;
mod worker_server;

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::cache::AuthCache;
use crate::metrics::Metrics;
use crate::request::AuthContext;
use crate::username::UsernameRules;
use crate::worker_pool::WorkerPool;

const BANNER: &str = r#"
  ╔══════════════════════════════════════════════════╗
  ║                 M A U T H D  v0.4                ║
  ║          Mail Authentication Daemon              ║
  ║                    [ Rust ]                      ║
  ╚══════════════════════════════════════════════════╝
"#;

#[tokio::main]
async fn main() {
    let config = config::Config::load();

    // Set up tracing with the configured log level
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    eprintln!("{BANNER}");

    if let Err(e) = config.validate() {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }

    let chains = match config::load_chains(config.databases.as_deref().unwrap_or_default()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    let metrics = Arc::new(Metrics::new());
    let rules = UsernameRules::new(
        config.default_realm.clone(),
        &config.username_translation,
        &config.username_chars,
        config.username_format.clone(),
    );

    // cache and worker pool are master-side state
    let cache = (!config.worker && config.cache_enabled()).then(|| {
        AuthCache::new(
            config.cache_size_kib * 1024,
            Duration::from_secs(config.cache_ttl_secs),
            Duration::from_secs(config.cache_negative_ttl_secs),
        )
    });

    let has_blocking = chains
        .passdbs
        .iter()
        .chain(chains.masterdbs.iter())
        .any(|p| p.blocking)
        || chains.userdbs.iter().any(|u| u.blocking);
    let workers = (!config.worker && has_blocking).then(|| {
        WorkerPool::new(
            config.worker_socket.clone(),
            config.worker_max_count,
            Duration::from_secs(config.lookup_timeout_secs),
            Some(Arc::clone(&metrics)),
        )
    });

    let ctx = Arc::new(AuthContext {
        rules,
        master_user_separator: config.master_user_separator,
        anonymous_username: config.anonymous_username.clone(),
        ssl_username_from_cert: config.ssl_username_from_cert,
        passdbs: chains.passdbs,
        masterdbs: chains.masterdbs,
        userdbs: chains.userdbs,
        cache,
        workers,
        metrics,
    });

    if let Some(port) = config.admin_port
        && !config.worker
    {
        let state = admin::AdminState {
            ctx: Arc::clone(&ctx),
        };
        tokio::spawn(admin::serve(state, port));
    }

    if let Some(workers) = &ctx.workers {
        workers.prestart();
    }

    let result = if config.worker {
        worker_server::serve(ctx, &config.worker_socket, config.worker_max_requests).await
    } else {
        server::run(ctx, &config.socket_path).await
    };

    if let Err(e) = result {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}
