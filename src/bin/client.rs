use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use pollpool::config::{CLIENT_LIFETIME, DEFAULT_PORT, TICK_INTERVAL};

#[derive(Parser)]
#[command(about = "Test client for the pollpool server")]
struct Args {
    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch one document and print the response (default)
    Smoke {
        /// Request path
        #[arg(default_value = "/")]
        path: String,
    },
    /// Open connections without sending anything and wait for the server to
    /// evict them
    Idle {
        #[arg(short, long, default_value_t = 16)]
        connections: usize,
    },
    /// One-shot GETs from concurrent threads, with a latency summary
    Bench {
        /// Number of concurrent client threads
        #[arg(short, long, default_value_t = 4)]
        connections: usize,
        /// Requests per thread (each on a fresh connection)
        #[arg(short, long, default_value_t = 10_000)]
        requests: usize,
        #[arg(long, default_value = "/")]
        path: String,
    },
}

fn get(addr: &str, path: &str) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    write!(stream, "GET {path} HTTP/1.0\r\nHost: {addr}\r\n\r\n")?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    Ok(response)
}

fn main() {
    let args = Args::parse();
    let addr = format!("127.0.0.1:{}", args.port);

    match args.command.unwrap_or(Command::Smoke { path: "/".into() }) {
        Command::Smoke { path } => smoke_test(&addr, &path),
        Command::Idle { connections } => idle_test(&addr, connections),
        Command::Bench {
            connections,
            requests,
            path,
        } => bench_test(&addr, connections, requests, &path),
    }
}

fn smoke_test(addr: &str, path: &str) {
    eprintln!("smoke test: GET {path} from {addr}");
    let response = get(addr, path).expect("request failed");
    let text = String::from_utf8_lossy(&response);
    let status = text.lines().next().unwrap_or("");
    assert!(status.starts_with("HTTP/1.0 "), "bad status line: {status:?}");
    println!("{text}");
    eprintln!("smoke test: {status}");
}

fn idle_test(addr: &str, connections: usize) {
    let limit = CLIENT_LIFETIME + TICK_INTERVAL * 2;
    eprintln!("idle test: {connections} silent connections to {addr}, expecting eviction within {limit:?}");

    let start = Instant::now();
    let streams: Vec<TcpStream> = (0..connections)
        .map(|_| TcpStream::connect(addr).expect("failed to connect"))
        .collect();

    let mut evicted = 0;
    for mut stream in streams {
        let remaining = limit.saturating_sub(start.elapsed()).max(Duration::from_millis(1));
        stream
            .set_read_timeout(Some(remaining))
            .expect("set timeout");
        let mut buf = [0u8; 1];
        match stream.read(&mut buf) {
            Ok(0) => evicted += 1,
            Ok(_) => eprintln!("  unexpected data on idle connection"),
            Err(e) if e.kind() == ErrorKind::ConnectionReset => evicted += 1,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                eprintln!("  connection still open after {:?}", start.elapsed());
            }
            Err(e) => eprintln!("  read failed: {e}"),
        }
    }

    eprintln!(
        "idle test: {evicted}/{connections} evicted after {:.1}s",
        start.elapsed().as_secs_f64()
    );
    assert_eq!(evicted, connections, "idle connections were not evicted");
}

fn percentile(sorted: &[u64], p: f64) -> f64 {
    let i = ((p / 100.0) * sorted.len() as f64) as usize;
    sorted[i.min(sorted.len() - 1)] as f64 / 1_000.0
}

fn bench_test(addr: &str, num_connections: usize, requests_per_conn: usize, path: &str) {
    eprintln!("bench: {num_connections} threads x {requests_per_conn} one-shot GET {path} to {addr}");

    let start = Instant::now();
    let handles: Vec<_> = (0..num_connections)
        .map(|_| {
            let addr = addr.to_string();
            let path = path.to_string();
            std::thread::spawn(move || {
                let mut samples = Vec::with_capacity(requests_per_conn);
                let mut failures = 0usize;
                for _ in 0..requests_per_conn {
                    let sent_at = Instant::now();
                    match get(&addr, &path) {
                        Ok(resp) if resp.starts_with(b"HTTP/1.0 200") => {
                            samples.push(sent_at.elapsed().as_nanos() as u64);
                        }
                        _ => failures += 1,
                    }
                }
                (samples, failures)
            })
        })
        .collect();

    let mut all_samples = Vec::new();
    let mut failures = 0;
    for h in handles {
        let (samples, failed) = h.join().expect("thread panicked");
        all_samples.extend(samples);
        failures += failed;
    }
    let elapsed = start.elapsed();

    if all_samples.is_empty() {
        eprintln!("bench: no successful requests ({failures} failed)");
        return;
    }
    all_samples.sort_unstable();
    let n = all_samples.len();
    eprintln!(
        "── summary ({:.1}s, {} ok, {} failed) ──────────────────────────",
        elapsed.as_secs_f64(),
        n,
        failures
    );
    eprintln!("  rps     {:.0}", n as f64 / elapsed.as_secs_f64());
    eprintln!("  p50     {:.1}µs", percentile(&all_samples, 50.0));
    eprintln!("  p95     {:.1}µs", percentile(&all_samples, 95.0));
    eprintln!("  p99     {:.1}µs", percentile(&all_samples, 99.0));
    eprintln!("  max     {:.1}µs", all_samples[n - 1] as f64 / 1_000.0);
}
