//! Front-end protocol — one connection from a login process.
//!
//! Line protocol:
//!   in:  `AUTH<TAB>id<TAB>mech[<TAB>key=value|flag]...[<TAB>resp=base64]`
//!        `CONT<TAB>id<TAB>base64`
//!   out: `OK<TAB>id<TAB>user=...` plus reply fields,
//!        `CONT<TAB>id<TAB>base64`, `FAIL<TAB>id[<TAB>field]...`
//!
//! The anti-bruteforce delay lives here, outside the pipeline: failed
//! attempts sleep a small random time before the FAIL line goes out,
//! unless the request opted out of it.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, error};

use crate::lineio::{self, LineError};
use crate::mech::{Mech, MechReply};
use crate::metrics::Metrics;
use crate::reply::{self, Reply};
use crate::request::{AuthRequest, AuthRequestState, AuthContext};
use crate::userdb::UserdbResult;

const FAILURE_DELAY_MAX_MS: u64 = 500;

pub async fn handle_connection(stream: UnixStream, ctx: Arc<AuthContext>, conn_id: u64) {
    Metrics::inc(&ctx.metrics.connections_total);
    Metrics::inc(&ctx.metrics.connections_active);

    let peer = stream.peer_cred().ok();
    let client_pid = peer.and_then(|c| c.pid()).unwrap_or(0).max(0) as u32;
    let connect_uid = peer.map(|c| c.uid()).unwrap_or(0);
    debug!(conn_id, client_pid, connect_uid, "front-end connected");

    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    // requests waiting for another mechanism round
    let mut pending: HashMap<u32, (Mech, AuthRequest)> = HashMap::new();

    loop {
        let line = match lineio::read_line(&mut reader).await {
            Ok(l) => l,
            Err(LineError::TooLong) => {
                error!(conn_id, "front-end sent more than {} bytes", lineio::MAX_LINE_LENGTH);
                break;
            }
            Err(_) => break,
        };

        match process_line(&ctx, conn_id, client_pid, connect_uid, &mut pending, &line).await {
            Some(response) => {
                if writer.write_all(response.as_bytes()).await.is_err()
                    || writer.flush().await.is_err()
                {
                    break;
                }
            }
            None => {
                error!(conn_id, "front-end protocol violation, closing");
                break;
            }
        }
    }

    debug!(conn_id, "front-end disconnected");
    Metrics::dec(&ctx.metrics.connections_active);
}

/// Handle one command line; `None` drops the connection.
async fn process_line(
    ctx: &AuthContext,
    conn_id: u64,
    client_pid: u32,
    connect_uid: u32,
    pending: &mut HashMap<u32, (Mech, AuthRequest)>,
    line: &str,
) -> Option<String> {
    if let Some(rest) = line.strip_prefix("AUTH\t") {
        let mut parts = rest.split('\t');
        let id: u32 = parts.next()?.parse().ok()?;
        let mech_name = parts.next()?;
        let Some(mech) = Mech::by_name(mech_name) else {
            return Some(format!("FAIL\t{id}\terror=Unsupported mechanism\n"));
        };

        let mut request = AuthRequest::new(mech.name(), conn_id);
        request.client_pid = client_pid;
        request.connect_uid = connect_uid;

        let mut initial = Vec::new();
        for param in parts {
            if let Some(b64) = param.strip_prefix("resp=") {
                match B64.decode(b64) {
                    Ok(data) => initial = data,
                    Err(_) => return Some(format!("FAIL\t{id}\terror=Invalid base64 data\n")),
                }
            } else {
                let (key, value) = reply::parse_field(param);
                // keys outside the request surface are ignored
                let _ = request.import(ctx, key, &value.map(reply::unescape_value).unwrap_or_default());
            }
        }

        Metrics::inc(&ctx.metrics.auth_requests);
        let outcome = mech.auth_initial(ctx, &mut request, &initial).await;
        Some(finish(ctx, id, mech, request, outcome, pending).await)
    } else if let Some(rest) = line.strip_prefix("CONT\t") {
        let (id_str, data_b64) = rest.split_once('\t').unwrap_or((rest, ""));
        let id: u32 = id_str.parse().ok()?;
        // a CONT for an id we never suspended is a front-end bug
        let (mech, mut request) = pending.remove(&id)?;
        let data = match B64.decode(data_b64) {
            Ok(d) => d,
            Err(_) => return Some(format!("FAIL\t{id}\terror=Invalid base64 data\n")),
        };
        let outcome = mech.auth_continue(ctx, &mut request, &data).await;
        Some(finish(ctx, id, mech, request, outcome, pending).await)
    } else {
        None
    }
}

async fn finish(
    ctx: &AuthContext,
    id: u32,
    mech: Mech,
    mut request: AuthRequest,
    outcome: MechReply,
    pending: &mut HashMap<u32, (Mech, AuthRequest)>,
) -> String {
    match outcome {
        MechReply::Continue(challenge) => {
            let encoded = B64.encode(&challenge);
            pending.insert(id, (mech, request));
            format!("CONT\t{id}\t{encoded}\n")
        }
        MechReply::Success => {
            if request.passdb_failure {
                // password was right, a secondary check wasn't
                return fail_reply(ctx, id, &mut request).await;
            }
            if !ctx.userdbs.is_empty() && !request.no_login {
                match request.lookup_user(ctx).await {
                    UserdbResult::Ok => {}
                    UserdbResult::UserUnknown => {
                        return fail_reply(ctx, id, &mut request).await;
                    }
                    UserdbResult::InternalFailure => {
                        request.internal_failure = true;
                        return fail_reply(ctx, id, &mut request).await;
                    }
                }
            }
            if request.no_login {
                // authenticated, but this user may not log in
                return fail_reply(ctx, id, &mut request).await;
            }

            request.successful = true;
            request.state = AuthRequestState::Finished;
            Metrics::inc(&ctx.metrics.auth_successes);

            let mut out = Reply::new();
            out.add("user", &request.user);
            out.add("service", &request.service);
            if let Some(mu) = &request.master_user {
                out.add("master_user", mu);
            }
            if let Some(ip) = &request.local_ip {
                out.add("lip", &ip.to_string());
            }
            if let Some(ip) = &request.remote_ip {
                out.add("rip", &ip.to_string());
            }
            if !request.extra_fields.is_empty() {
                out.import(request.extra_fields.export());
            }
            // userdb reply: first record is the user, already sent;
            // keys the passdb phase already reported win
            let mut seen: std::collections::HashSet<String> = out
                .split()
                .map(|r| reply::parse_field(r).0.to_string())
                .collect();
            let userdb_records: Vec<String> = request
                .userdb_reply
                .split()
                .skip(1)
                .map(str::to_string)
                .collect();
            for record in userdb_records {
                let (key, _) = reply::parse_field(&record);
                if seen.insert(key.to_string()) {
                    out.import(&record);
                }
            }
            if request.proxy
                && let Some(pw) = request.mech_password.as_deref()
            {
                // the front-end needs the password to log in remotely
                out.add("pass", pw);
            }
            format!("OK\t{id}\t{}\n", out.export())
        }
        MechReply::Failure => fail_reply(ctx, id, &mut request).await,
    }
}

async fn fail_reply(ctx: &AuthContext, id: u32, request: &mut AuthRequest) -> String {
    if request.internal_failure {
        Metrics::inc(&ctx.metrics.auth_internal_failures);
    } else {
        Metrics::inc(&ctx.metrics.auth_failures);
    }
    request.state = AuthRequestState::Finished;

    // nodelay, post-check failures, nologin and proxy results all
    // bypass the delay
    let skip_delay = request.no_failure_delay
        || request.passdb_failure
        || request.no_login
        || request.proxy;
    if !skip_delay {
        let delay = rand::thread_rng().gen_range(0..FAILURE_DELAY_MAX_MS);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let mut out = Reply::new();
    if !request.user.is_empty() {
        out.add("user", &request.user);
    }
    if request.internal_failure {
        out.add_flag("temp");
    }
    if request.no_failure_delay {
        out.add_flag("nodelay");
    }
    if out.is_empty() {
        format!("FAIL\t{id}\n")
    } else {
        format!("FAIL\t{id}\t{}\n", out.export())
    }
}
