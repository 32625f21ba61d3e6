//! Worker process — serves PASSV/PASSL/SETCRED/USER for the master.
//!
//! Each accepted connection is one master-side pool slot: line in,
//! driver call, line out. Drivers always run in-line here; blocking is
//! the whole point of the worker process. Replies are written and
//! flushed before the next command is read, which is what throttles a
//! master that stops reading.

use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

use crate::lineio::{self, LineError};
use crate::passdb::{AuthPassdb, PassdbResult};
use crate::reply::{self, Reply};
use crate::request::{AuthContext, AuthRequest};
use crate::scheme;
use crate::userdb::UserdbResult;

/// Accept master connections on `path` until the process dies.
pub async fn serve(
    ctx: Arc<AuthContext>,
    path: &str,
    max_requests: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    info!(path, "auth worker listening");

    let mut conn_id = 0u64;
    loop {
        let (stream, _) = listener.accept().await?;
        conn_id += 1;
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            handle_connection(ctx, stream, conn_id, max_requests).await;
        });
    }
}

async fn handle_connection(
    ctx: Arc<AuthContext>,
    stream: UnixStream,
    conn_id: u64,
    max_requests: usize,
) {
    debug!(conn_id, "master connected");
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut served = 0usize;
    let mut shutdown_sent = false;

    loop {
        let line = match lineio::read_line(&mut reader).await {
            Ok(l) => l,
            Err(LineError::TooLong) => {
                error!(
                    conn_id,
                    "BUG: Auth worker server sent us more than {} bytes",
                    lineio::MAX_LINE_LENGTH
                );
                return;
            }
            Err(_) => {
                debug!(conn_id, "master disconnected");
                return;
            }
        };

        if !line.contains('\t') {
            error!(conn_id, "BUG: invalid command line from master");
            return;
        }

        if let Some(reply) = handle_line(&ctx, &line) {
            if writer.write_all(reply.as_bytes()).await.is_err()
                || writer.flush().await.is_err()
            {
                return;
            }
        }

        served += 1;
        if served >= max_requests && !shutdown_sent {
            // ask the master to retire this connection gracefully
            shutdown_sent = true;
            info!(conn_id, served, "request limit reached, sending SHUTDOWN");
            if writer.write_all(b"SHUTDOWN\n").await.is_err() {
                return;
            }
        }
    }
}

/// Dispatch one command line; `None` means no reply is owed (the
/// master side treats the eventual timeout as its own bug).
pub(crate) fn handle_line(ctx: &AuthContext, line: &str) -> Option<String> {
    let (id_str, rest) = line.split_once('\t')?;
    let id: u32 = id_str.parse().ok()?;

    if let Some(args) = rest.strip_prefix("PASSV\t") {
        handle_passv(ctx, id, args)
    } else if let Some(args) = rest.strip_prefix("PASSL\t") {
        handle_passl(ctx, id, args)
    } else if let Some(args) = rest.strip_prefix("SETCRED\t") {
        handle_setcred(ctx, id, args)
    } else if let Some(args) = rest.strip_prefix("USER\t") {
        handle_user(ctx, id, args)
    } else {
        None
    }
}

/// Materialize the dummy in-process request from `key=value` args.
fn request_from_args(ctx: &AuthContext, args: &str) -> Option<AuthRequest> {
    let mut request = AuthRequest::new("worker", 0);
    request.state = crate::request::AuthRequestState::MechContinue;
    for field in args.split('\t') {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        request.import(ctx, key, &reply::unescape_value(value));
    }
    if request.user.is_empty() || request.service.is_empty() {
        return None;
    }
    request.original_username = Some(request.user.clone());
    Some(request)
}

fn find_passdb<'a>(ctx: &'a AuthContext, id: u32, include_master: bool) -> Option<&'a AuthPassdb> {
    ctx.passdbs
        .iter()
        .find(|p| p.id == id)
        .or_else(|| {
            include_master
                .then(|| ctx.masterdbs.iter().find(|p| p.id == id))
                .flatten()
        })
}

fn push_bare(out: &mut String, value: &str) {
    out.push('\t');
    out.push_str(&reply::escape_value(value));
}

/// Everything after the first userdb-reply record, `userdb_` prefixed.
fn append_userdb_fields(out: &mut String, userdb_reply: &Reply) {
    for record in userdb_reply.split().skip(1) {
        out.push_str("\tuserdb_");
        out.push_str(record);
    }
}

fn handle_passv(ctx: &AuthContext, id: u32, args: &str) -> Option<String> {
    let mut parts = args.splitn(3, '\t');
    let passdb_id: u32 = parts.next().and_then(|p| p.parse().ok()).or_else(|| {
        error!("BUG: Auth worker server sent us invalid PASSV");
        None
    })?;
    let Some(password) = parts.next() else {
        error!("BUG: Auth worker server sent us invalid PASSV");
        return None;
    };
    let args = parts.next().unwrap_or("");

    let Some(mut request) = request_from_args(ctx, args) else {
        error!("BUG: PASSV had missing parameters");
        return None;
    };
    let Some(entry) = find_passdb(ctx, passdb_id, true) else {
        error!("BUG: PASSV had invalid passdb ID");
        return None;
    };

    request.mech_password = Some(zeroize::Zeroizing::new(password.to_string()));
    let mut result = entry.driver.verify_plain(&mut request, password);
    if request.passdb_failure && result == PassdbResult::Ok {
        result = PassdbResult::PasswordMismatch;
    }

    let mut out = format!("{id}");
    if result == PassdbResult::Ok {
        out.push_str("\tOK");
    } else {
        out.push_str(&format!("\tFAIL\t{}", result.wire_code()));
    }
    if result != PassdbResult::InternalFailure {
        push_bare(&mut out, &request.user);
        push_bare(
            &mut out,
            request.passdb_password.as_deref().map(|p| p.as_str()).unwrap_or(""),
        );
        if request.no_password {
            out.push_str("\tnopassword");
        }
        append_userdb_fields(&mut out, &request.userdb_reply);
        if !request.extra_fields.is_empty() {
            out.push('\t');
            out.push_str(request.extra_fields.export());
        }
    }
    out.push('\n');
    Some(out)
}

fn handle_passl(ctx: &AuthContext, id: u32, args: &str) -> Option<String> {
    let (id_part, rest) = args.split_once('\t').or_else(|| {
        error!("BUG: Auth worker server sent us invalid PASSL");
        None
    })?;
    let passdb_id: u32 = id_part.parse().ok().or_else(|| {
        error!("BUG: Auth worker server sent us invalid PASSL");
        None
    })?;
    let (wanted_scheme, args) = match rest.split_once('\t') {
        Some((s, a)) => (s, a),
        None => (rest, ""),
    };

    let Some(mut request) = request_from_args(ctx, args) else {
        error!("BUG: PASSL had missing parameters");
        return None;
    };
    let Some(entry) = find_passdb(ctx, passdb_id, false) else {
        error!("BUG: PASSL had invalid passdb ID");
        return None;
    };

    request.credentials_scheme = wanted_scheme.to_string();
    let Some(result) = entry.driver.lookup_credentials(&mut request) else {
        error!("BUG: PASSL lookup not supported by given passdb");
        return None;
    };
    let tagged = request.passdb_password.as_deref().map(|p| p.to_string());
    let (mut result, credentials) = request.translate_tagged(result, tagged.as_deref());
    if request.passdb_failure && result == PassdbResult::Ok {
        result = PassdbResult::PasswordMismatch;
    }

    let mut out = format!("{id}");
    if result == PassdbResult::Ok {
        let credentials = credentials.unwrap_or_default();
        out.push_str("\tOK");
        push_bare(&mut out, &request.user);
        out.push_str(&format!(
            "\t{{{}.b64}}{}",
            request.credentials_scheme,
            scheme::b64_encode(&credentials)
        ));
        if !request.extra_fields.is_empty() {
            out.push('\t');
            out.push_str(request.extra_fields.export());
        }
        append_userdb_fields(&mut out, &request.userdb_reply);
    } else {
        out.push_str(&format!("\tFAIL\t{}", result.wire_code()));
    }
    out.push('\n');
    Some(out)
}

fn handle_setcred(ctx: &AuthContext, id: u32, args: &str) -> Option<String> {
    let (id_part, rest) = args.split_once('\t').or_else(|| {
        error!("BUG: Auth worker server sent us invalid SETCRED");
        None
    })?;
    let passdb_id: u32 = id_part.parse().ok()?;
    let (new_credentials, args) = match rest.split_once('\t') {
        Some((c, a)) => (c, a),
        None => (rest, ""),
    };

    let Some(mut request) = request_from_args(ctx, args) else {
        error!("BUG: SETCRED had missing parameters");
        return None;
    };
    let Some(entry) = find_passdb(ctx, passdb_id, false) else {
        error!("BUG: SETCRED had invalid passdb ID");
        return None;
    };

    let Some(success) = entry.driver.set_credentials(&mut request, new_credentials) else {
        error!("BUG: SETCRED not supported by given passdb");
        return None;
    };
    Some(format!("{id}\t{}\n", if success { "OK" } else { "FAIL" }))
}

fn handle_user(ctx: &AuthContext, id: u32, args: &str) -> Option<String> {
    let (id_part, args) = match args.split_once('\t') {
        Some((i, a)) => (i, a),
        None => (args, ""),
    };
    let userdb_id: u32 = id_part.parse().ok()?;

    let Some(mut request) = request_from_args(ctx, args) else {
        error!("BUG: USER had missing parameters");
        return None;
    };
    let Some(entry) = ctx.userdbs.iter().find(|u| u.id == userdb_id) else {
        error!("BUG: USER had invalid userdb ID");
        return None;
    };

    let result = entry.driver.lookup(&mut request);
    let out = match result {
        UserdbResult::InternalFailure => format!("{id}\tFAIL\t\n"),
        UserdbResult::UserUnknown => format!("{id}\tNOTFOUND\t\n"),
        UserdbResult::Ok => format!("{id}\tOK\t{}\n", request.userdb_reply.export()),
    };
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{create_passdb_driver, create_userdb_driver};
    use crate::metrics::Metrics;
    use crate::userdb::AuthUserdb;
    use crate::username::UsernameRules;
    use crate::worker_pool::WorkerPool;
    use std::time::Duration;

    fn worker_ctx() -> AuthContext {
        let (driver, _) =
            create_passdb_driver("static", "password=secret uid=1000", "PLAIN").unwrap();
        let userdb = create_userdb_driver("static", "uid=1000 gid=1000 home=/home/%n").unwrap();
        AuthContext {
            rules: UsernameRules::default(),
            master_user_separator: None,
            anonymous_username: "anonymous".into(),
            ssl_username_from_cert: false,
            passdbs: vec![AuthPassdb {
                id: 3,
                driver,
                pass: false,
                deny: false,
                master: false,
                blocking: false,
                cache_key: None,
                default_pass_scheme: "PLAIN".into(),
            }],
            masterdbs: vec![],
            userdbs: vec![AuthUserdb {
                id: 0,
                driver: userdb,
                blocking: false,
            }],
            cache: None,
            workers: None,
            metrics: std::sync::Arc::new(Metrics::new()),
        }
    }

    // ─── Command dispatch ────────────────────────────────────────────────

    #[test]
    fn passv_ok_reply_shape() {
        let ctx = worker_ctx();
        let reply = handle_line(&ctx, "7\tPASSV\t3\tsecret\tuser=alice\tservice=imap").unwrap();
        assert!(reply.starts_with("7\tOK\talice\t{PLAIN}secret"));
        assert!(reply.contains("\tuid=1000"));
        assert!(reply.ends_with('\n'));
    }

    #[test]
    fn passv_wrong_password_is_fail_code() {
        let ctx = worker_ctx();
        let reply = handle_line(&ctx, "8\tPASSV\t3\twrong\tuser=alice\tservice=imap").unwrap();
        assert!(reply.starts_with("8\tFAIL\t3\t"), "{reply}");
    }

    #[test]
    fn passv_unknown_passdb_id_gets_no_reply() {
        let ctx = worker_ctx();
        assert!(handle_line(&ctx, "9\tPASSV\t99\tpw\tuser=alice\tservice=imap").is_none());
    }

    #[test]
    fn passv_missing_parameters_gets_no_reply() {
        let ctx = worker_ctx();
        assert!(handle_line(&ctx, "9\tPASSV\t3\tpw\tuser=alice").is_none());
    }

    #[test]
    fn passl_translates_to_requested_scheme() {
        let ctx = worker_ctx();
        let reply = handle_line(&ctx, "4\tPASSL\t3\tSHA256\tuser=alice\tservice=imap").unwrap();
        assert!(reply.starts_with("4\tOK\talice\t{SHA256.b64}"), "{reply}");
    }

    #[test]
    fn passl_any_scheme_returns_stored() {
        let ctx = worker_ctx();
        let reply = handle_line(&ctx, "4\tPASSL\t3\t\tuser=alice\tservice=imap").unwrap();
        assert!(reply.starts_with("4\tOK\talice\t{PLAIN.b64}"), "{reply}");
    }

    #[test]
    fn user_lookup_ok_and_notfound() {
        let ctx = worker_ctx();
        let reply = handle_line(&ctx, "5\tUSER\t0\tuser=bob\tservice=imap").unwrap();
        assert!(reply.starts_with("5\tOK\t"));
        assert!(reply.contains("home=/home/bob"));

        assert!(handle_line(&ctx, "6\tUSER\t42\tuser=bob\tservice=imap").is_none());
    }

    #[test]
    fn unknown_command_is_ignored() {
        let ctx = worker_ctx();
        assert!(handle_line(&ctx, "1\tFROB\tx").is_none());
        assert!(handle_line(&ctx, "garbage-without-tab").is_none());
    }

    // ─── End to end through the pool ─────────────────────────────────────

    #[tokio::test]
    async fn master_offload_round_trip() {
        let path = format!(
            "{}/mauthd-ws-e2e-{}.sock",
            std::env::temp_dir().display(),
            std::process::id()
        );
        let _ = std::fs::remove_file(&path);

        let worker_side = std::sync::Arc::new(worker_ctx());
        let serve_path = path.clone();
        let _srv = tokio::spawn(async move {
            let _ = serve(worker_side, &serve_path, 1000).await;
        });
        // wait for the socket to exist
        for _ in 0..50 {
            if std::path::Path::new(&path).exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // master side: same passdb id, marked blocking
        let mut master_ctx = worker_ctx();
        master_ctx.passdbs[0].blocking = true;
        master_ctx.workers = Some(WorkerPool::new(
            path.clone(),
            2,
            Duration::from_secs(5),
            None,
        ));

        let mut request = AuthRequest::new("PLAIN", 1);
        request.user = "alice".into();
        request.original_username = Some("alice".into());
        request.service = "imap".into();
        request.state = crate::request::AuthRequestState::MechContinue;

        let result = request.verify_plain(&master_ctx, "secret").await;
        assert_eq!(result, PassdbResult::Ok);
        assert!(request.extra_fields.split().any(|f| f == "uid=1000"));

        let mut request = AuthRequest::new("PLAIN", 2);
        request.user = "alice".into();
        request.service = "imap".into();
        request.state = crate::request::AuthRequestState::MechContinue;
        let result = request.verify_plain(&master_ctx, "wrong").await;
        assert_eq!(result, PassdbResult::PasswordMismatch);

        std::fs::remove_file(&path).ok();
    }
}
