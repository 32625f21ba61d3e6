//! Auth round-trip benchmark: measure mauthd lookup latency.
//!
//! Requires a running mauthd with a passdb that knows the bench user:
//!
//!   # Terminal 1: start mauthd
//!   ./target/release/mauthd --socket /tmp/mauthd-bench.sock \
//!       --databases bench-databases.toml
//!
//!   # Terminal 2: run benchmark
//!   cargo bench --bench pipeline
//!
//! Environment:
//!   MAUTHD_BENCH_SOCKET    socket path (default /tmp/mauthd-bench.sock)
//!   MAUTHD_BENCH_USER      username   (default alice)
//!   MAUTHD_BENCH_PASSWORD  password   (default secret)
//!
//! The benchmark reports round-trip latency of PLAIN authentications,
//! which with a cache configured shows the cached vs uncached split on
//! the first iteration.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

const WARMUP: usize = 20;
const ITERATIONS: usize = 500;

fn auth_line(id: u32, user: &str, password: &str) -> String {
    let resp = B64.encode(format!("\0{user}\0{password}"));
    format!("AUTH\t{id}\tPLAIN\tservice=imap\tresp={resp}\n")
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx]
}

fn main() {
    let socket = std::env::var("MAUTHD_BENCH_SOCKET")
        .unwrap_or_else(|_| "/tmp/mauthd-bench.sock".to_string());
    let user = std::env::var("MAUTHD_BENCH_USER").unwrap_or_else(|_| "alice".to_string());
    let password =
        std::env::var("MAUTHD_BENCH_PASSWORD").unwrap_or_else(|_| "secret".to_string());

    let stream = match UnixStream::connect(&socket) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot connect to {socket}: {e}");
            eprintln!("start mauthd first (see the header of this file)");
            std::process::exit(1);
        }
    };
    let mut reader = BufReader::new(stream.try_clone().expect("clone socket"));
    let mut writer = stream;

    let mut id = 0u32;
    let mut round_trip = |expect_ok: bool| -> Duration {
        id += 1;
        let line = auth_line(id, &user, &password);
        let start = Instant::now();
        writer.write_all(line.as_bytes()).expect("write");
        let mut reply = String::new();
        reader.read_line(&mut reply).expect("read");
        let elapsed = start.elapsed();
        if expect_ok && !reply.starts_with("OK\t") {
            eprintln!("unexpected reply: {}", reply.trim_end());
            std::process::exit(1);
        }
        elapsed
    };

    for _ in 0..WARMUP {
        round_trip(true);
    }

    let mut samples = Vec::with_capacity(ITERATIONS);
    for _ in 0..ITERATIONS {
        samples.push(round_trip(true));
    }
    samples.sort();

    let total: Duration = samples.iter().sum();
    println!("mauthd PLAIN auth round trip ({ITERATIONS} iterations)");
    println!("  mean   {:>10.1?}", total / ITERATIONS as u32);
    println!("  p50    {:>10.1?}", percentile(&samples, 0.50));
    println!("  p95    {:>10.1?}", percentile(&samples, 0.95));
    println!("  p99    {:>10.1?}", percentile(&samples, 0.99));
    println!("  max    {:>10.1?}", samples[samples.len() - 1]);
}
