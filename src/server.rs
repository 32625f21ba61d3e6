//! UNIX listener — accepts front-end connections and spawns handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::UnixListener;
use tracing::info;

use crate::frontend;
use crate::request::AuthContext;

static CONN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Start the auth server on `path`.
pub async fn run(
    ctx: Arc<AuthContext>,
    path: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;

    info!(
        path,
        passdbs = ctx.passdbs.len(),
        masterdbs = ctx.masterdbs.len(),
        userdbs = ctx.userdbs.len(),
        cache = ctx.cache.is_some(),
        "mauthd listening"
    );

    loop {
        let (socket, _) = listener.accept().await?;
        let ctx = Arc::clone(&ctx);
        let conn_id = CONN_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;

        tokio::spawn(async move {
            frontend::handle_connection(socket, ctx, conn_id).await;
        });
    }
}
