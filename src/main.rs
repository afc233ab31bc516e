use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use arpwedge::capture::{EventSink, SessionConfig, SessionEngine, SessionEvent};
use arpwedge::config;
use arpwedge::core::decode;
use arpwedge::inventory;
use arpwedge::traceroute::{self, TraceOptions};

#[derive(Parser)]
#[command(name = "arpwedge", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Discover hosts on the local subnet via the scanner helper
    Scan {
        /// Inventory helper command
        #[arg(long, default_value = config::SCAN_HELPER)]
        helper: String,
        /// Emit the scan result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Poison selected victims and capture their redirected traffic
    Intercept {
        /// Target selection against the scan listing, e.g. "1 3 5" or "all"
        #[arg(long, default_value = "all")]
        targets: String,
        /// Inventory helper command
        #[arg(long, default_value = config::SCAN_HELPER)]
        helper: String,
        /// Run for this many seconds; 0 means until Enter is pressed
        #[arg(long, default_value_t = 0)]
        duration: u64,
        /// Print a hex dump for every captured frame
        #[arg(long)]
        hex: bool,
    },
    /// Trace the route to a host with raw ICMP echoes
    Trace {
        host: String,
        #[arg(long, default_value_t = config::TRACE_MAX_HOPS)]
        max_hops: u8,
        #[arg(long, default_value_t = config::TRACE_PROBES_PER_HOP)]
        probes: usize,
        /// Per-probe timeout in seconds
        #[arg(long, default_value_t = config::TRACE_TIMEOUT_SECS)]
        timeout: u64,
    },
}

fn main() -> anyhow::Result<()> {
    arpwedge::install_panic_logger();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arpwedge=info".into()),
        )
        .init();

    match Cli::parse().command {
        Command::Scan { helper, json } => run_scan(&helper, json),
        Command::Intercept {
            targets,
            helper,
            duration,
            hex,
        } => run_intercept(&targets, &helper, duration, hex),
        Command::Trace {
            host,
            max_hops,
            probes,
            timeout,
        } => run_trace(&host, max_hops, probes, timeout),
    }
}

fn run_scan(helper: &str, json: bool) -> anyhow::Result<()> {
    let scan = inventory::scan(helper).context("inventory scan")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&scan)?);
    } else {
        print_listing(&scan);
    }
    Ok(())
}

fn print_listing(scan: &inventory::ScanResult) {
    println!("Interface: {}", scan.interface);
    println!("Gateway IP: {}\n", scan.gateway_ip);
    for (i, device) in scan.devices.iter().enumerate() {
        let tag = if device.is_gateway { " [GATEWAY]" } else { "" };
        println!("{}: {} ({}){tag}", i + 1, device.ip, device.mac);
    }
    println!("{}: ALL DEVICES", scan.devices.len() + 1);
}

fn run_intercept(targets: &str, helper: &str, duration: u64, hex: bool) -> anyhow::Result<()> {
    let scan = inventory::scan(helper).context("inventory scan")?;
    print_listing(&scan);

    let indices = inventory::parse_selection(targets, scan.devices.len());
    if indices.is_empty() {
        bail!("no targets selected (use --targets \"1 3 5\" or \"all\")");
    }

    let session = SessionConfig::resolve(&scan, &indices)?;
    let events: EventSink = Arc::new(|event| match event {
        SessionEvent::Alert(alert) => println!("{alert}"),
        SessionEvent::Started { interface, targets } => {
            println!("[*] session started on {interface} with {targets} target(s)");
        }
        SessionEvent::Stopped { outcome } => println!("[*] session stopped ({outcome:?})"),
    });
    let engine = SessionEngine::start(session, events).context("starting session")?;

    // Drain the capture queue on its own thread so a slow terminal never
    // backs up the sniffer.
    let frames = engine.frames();
    let consumer_stop = Arc::new(AtomicBool::new(false));
    let consumer = {
        let frames = Arc::clone(&frames);
        let stop = Arc::clone(&consumer_stop);
        std::thread::Builder::new()
            .name("capture-consumer".into())
            .spawn(move || {
                let mut count = 0u64;
                while !stop.load(Ordering::Relaxed) || !frames.is_empty() {
                    let Some(frame) = frames.pop() else {
                        std::thread::sleep(Duration::from_millis(20));
                        continue;
                    };
                    count += 1;
                    let tree = decode::decode(&frame.bytes);
                    println!(
                        "[{count}] target {} @{}.{:06}: {}",
                        frame.target_index + 1,
                        frame.captured_at.secs,
                        frame.captured_at.usecs,
                        tree.summary
                    );
                    if hex {
                        print!("{}", decode::hex_dump(&frame.bytes));
                    }
                }
            })
            .expect("failed to spawn capture consumer")
    };

    if duration > 0 {
        std::thread::sleep(Duration::from_secs(duration));
    } else {
        println!("Press Enter to stop.");
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
    }

    let outcome = engine.stop_default();
    consumer_stop.store(true, Ordering::Relaxed);
    let _ = consumer.join();

    if frames.dropped() > 0 {
        println!("[!] {} frame(s) lost to queue overflow", frames.dropped());
    }
    if let Some(err) = engine.take_error() {
        bail!("session ended with error: {err}");
    }
    println!("Stop outcome: {outcome:?}");
    Ok(())
}

fn run_trace(host: &str, max_hops: u8, probes: usize, timeout: u64) -> anyhow::Result<()> {
    let opts = TraceOptions {
        max_hops,
        probes_per_hop: probes,
        timeout: Duration::from_secs(timeout),
    };
    println!(
        "traceroute to {host}, {max_hops} hops max, {} byte packets",
        config::TRACE_PACKET_SIZE
    );
    let result = traceroute::trace(host, &opts).context("traceroute")?;
    for hop in &result.hops {
        println!("{hop}");
    }
    println!("\n=== Traceroute Results ===");
    println!("{}", result.summary());
    println!("Elapsed: {:.1?}", result.elapsed);
    Ok(())
}
