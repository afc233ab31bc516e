//! Centralized runtime constants for the interception engine.
//!
//! All tunable intervals, thresholds, and caps are collected here so they can
//! be found and adjusted in a single place rather than scattered across modules.

/// Maximum number of simultaneously poisoned targets. Install requests beyond
/// this are truncated after logging.
pub const MAX_TARGETS: usize = 150;

/// Largest frame the sniffer will copy into a capture event (bytes).
pub const MAX_FRAME_LEN: usize = 65536;

/// Capture-event queue capacity. On overflow the oldest frame is dropped and
/// the loss counter incremented.
pub const FRAME_QUEUE_CAPACITY: usize = 1024;

/// Poisoning cycle interval for small target sets (seconds).
pub const POISON_INTERVAL_SECS: u64 = 2;

/// Poisoning cycle interval once the target count exceeds
/// [`POISON_INTERVAL_THRESHOLD`] (seconds). Caps the aggregate packet rate.
pub const POISON_INTERVAL_LARGE_SECS: u64 = 3;

/// Target count above which the longer poisoning interval applies.
pub const POISON_INTERVAL_THRESHOLD: usize = 50;

/// Target count above which per-target send pacing kicks in.
pub const SEND_PACING_THRESHOLD: usize = 20;

/// Delay between per-target sends when pacing is active (milliseconds).
pub const SEND_PACING_MS: u64 = 10;

/// Granularity of the poisoner's inter-cycle sleep. Bounds the latency from a
/// stop request to loop exit.
pub const SHUTDOWN_CHECK_INTERVAL_MS: u64 = 100;

/// Receive timeout on the sniffer socket (milliseconds). Must stay short so
/// the sniff loop observes the shutdown flag promptly.
pub const RECV_TIMEOUT_MS: u64 = 10;

/// Consecutive hard receive errors before the sniffer gives up and the
/// condition is surfaced as a fatal session error.
pub const RECV_ERROR_LIMIT: u32 = 10;

/// Processed-frame debug log cadence for small target sets (frames).
pub const SNIFF_DEBUG_INTERVAL: u64 = 500;

/// Processed-frame debug log cadence when targets exceed
/// [`POISON_INTERVAL_THRESHOLD`] (frames).
pub const SNIFF_DEBUG_INTERVAL_LARGE: u64 = 2000;

/// Session stop deadline (milliseconds). A single knob: the original had two
/// callers disagreeing on 5000 vs 6000 ms.
pub const STOP_DEADLINE_MS: u64 = 5000;

/// Interval between worker-completion polls during stop (milliseconds).
pub const STOP_POLL_INTERVAL_MS: u64 = 500;

/// Entry capacity of each ARP-detector cache (FIFO-evicted when full).
pub const DETECTOR_CACHE_SIZE: usize = 64;

/// Distinct ARP-request targets tracked per source MAC.
pub const SCAN_TRACK_MAX: usize = 16;

/// Unique-target count at which the "possible scan" notice fires (once).
pub const SCAN_NOTICE_THRESHOLD: usize = 10;

/// Default command for the external host-inventory helper.
pub const SCAN_HELPER: &str = "./lan_scan.sh";

/// Traceroute: default hop limit.
pub const TRACE_MAX_HOPS: u8 = 30;

/// Traceroute: probes sent per hop.
pub const TRACE_PROBES_PER_HOP: usize = 3;

/// Traceroute: per-probe response timeout (seconds).
pub const TRACE_TIMEOUT_SECS: u64 = 3;

/// Traceroute: pause between probes (milliseconds).
pub const TRACE_PROBE_PACING_MS: u64 = 100;

/// Traceroute: total ICMP echo length including header (bytes).
pub const TRACE_PACKET_SIZE: usize = 64;
