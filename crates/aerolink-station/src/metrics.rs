//! # Prometheus Metrics
//!
//! Renders the latest published station snapshot in Prometheus text
//! exposition format and provides a lightweight HTTP server for scraping.

use std::fmt::Write;
use std::io::{Read, Write as IoWrite};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::snapshot::{PipelineSnapshot, Published, SnapshotHandle};

fn header(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn single(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    header(out, name, kind, help);
    let _ = writeln!(out, "{name} {value}");
}

fn bool_gauge(v: bool) -> u8 {
    u8::from(v)
}

/// Render a published snapshot as Prometheus text exposition format.
pub fn render_prometheus(published: &Published) -> String {
    let mut out = String::with_capacity(4096);

    single(
        &mut out,
        "aerolink_snapshot_sequence",
        "counter",
        "Sequence number of the rendered snapshot.",
        published.sequence,
    );

    let Some(snap) = published.snapshot.as_ref() else {
        return out;
    };
    render_pipeline(&mut out, snap);
    render_retransmissions(&mut out, snap);
    render_controllers(&mut out, snap);
    render_interfaces(&mut out, snap);
    out
}

fn render_pipeline(out: &mut String, s: &PipelineSnapshot) {
    let st = &s.stats;

    header(
        out,
        "aerolink_blocks_output_total",
        "counter",
        "Blocks output, by outcome.",
    );
    for (outcome, v) in [
        ("clean", st.blocks_clean),
        ("reconstructed", st.blocks_reconstructed),
        ("bad", st.blocks_bad),
    ] {
        let _ = writeln!(out, "aerolink_blocks_output_total{{outcome=\"{outcome}\"}} {v}");
    }

    header(
        out,
        "aerolink_video_packets_total",
        "counter",
        "Video packets received, by disposition.",
    );
    for (kind, v) in [
        ("received", st.packets_received),
        ("retransmitted", st.retransmitted_received),
        ("retransmitted_ignored", st.retransmitted_ignored),
        ("duplicate", st.duplicates),
        ("stale", st.stale),
        ("refused_start", st.refused_start),
        ("malformed", st.malformed),
        ("forwarded", st.forwarded_packets),
        ("lost", st.lost_packets),
    ] {
        let _ = writeln!(out, "aerolink_video_packets_total{{kind=\"{kind}\"}} {v}");
    }

    single(
        out,
        "aerolink_fec_failures_total",
        "counter",
        "FEC reconstructions that failed.",
        st.fec_failures,
    );
    single(
        out,
        "aerolink_window_discards_total",
        "counter",
        "Whole reception window discards.",
        st.window_discards,
    );
    single(
        out,
        "aerolink_full_resets_total",
        "counter",
        "Full reception state resets.",
        st.full_resets,
    );
    single(
        out,
        "aerolink_impaired_block_ratio",
        "gauge",
        "Share of output blocks that were reconstructed or bad.",
        format!("{:.6}", st.impaired_ratio()),
    );
    single(
        out,
        "aerolink_window_depth",
        "gauge",
        "Blocks currently in the reception window.",
        s.window_depth,
    );
    single(
        out,
        "aerolink_window_capacity",
        "gauge",
        "Reception window capacity in blocks.",
        s.window_capacity,
    );

    if let Some(slice) = s.slices.last() {
        header(
            out,
            "aerolink_last_slice_blocks",
            "gauge",
            "Blocks output in the latest closed stats slice, by outcome.",
        );
        for (outcome, v) in [
            ("clean", slice.clean),
            ("reconstructed", slice.reconstructed),
            ("bad", slice.bad),
        ] {
            let _ = writeln!(out, "aerolink_last_slice_blocks{{outcome=\"{outcome}\"}} {v}");
        }
        single(
            out,
            "aerolink_last_slice_max_fec_used",
            "gauge",
            "Most FEC packets used by one block in the latest closed slice.",
            slice.max_fec_used,
        );
    }

    if let Some(stream) = s.stream.as_ref() {
        single(
            out,
            "aerolink_stream_video_bitrate_bps",
            "gauge",
            "Video bitrate announced by the vehicle.",
            stream.video_bitrate_bps,
        );
        single(
            out,
            "aerolink_stream_keyframe_ms",
            "gauge",
            "Keyframe interval announced by the vehicle.",
            stream.keyframe_ms,
        );
    }

    header(out, "aerolink_queue_packets_total", "counter", "Outbound queue counters.");
    let q = &s.queue;
    for (kind, v) in [
        ("enqueued", q.enqueued),
        ("injected", q.injected),
        ("dequeued", q.dequeued),
        ("dropped_full", q.dropped_full),
        ("evicted", q.evicted),
    ] {
        let _ = writeln!(out, "aerolink_queue_packets_total{{kind=\"{kind}\"}} {v}");
    }
    single(
        out,
        "aerolink_queue_depth",
        "gauge",
        "Packets waiting in the outbound queue.",
        q.depth,
    );
}

fn render_retransmissions(out: &mut String, s: &PipelineSnapshot) {
    single(
        out,
        "aerolink_retransmissions_active",
        "gauge",
        "Whether retransmissions are in use (0 while the uplink is lost).",
        bool_gauge(s.retransmissions_active),
    );
    single(
        out,
        "aerolink_uplink_lost",
        "gauge",
        "Whether the vehicle stopped hearing the station.",
        bool_gauge(s.uplink_lost),
    );

    let r = &s.retransmissions;
    header(out, "aerolink_retransmission_total", "counter", "Retransmission counters.");
    for (kind, v) in [
        ("requests_sent", r.requests_sent),
        ("segments_requested", r.segments_requested),
        ("segments_retried", r.segments_retried),
        ("segments_received", r.segments_received),
        ("requests_completed", r.requests_completed),
        ("requests_dropped", r.requests_dropped),
        ("duplicate_responses", r.duplicate_responses),
        ("unmatched_responses", r.unmatched_responses),
    ] {
        let _ = writeln!(out, "aerolink_retransmission_total{{kind=\"{kind}\"}} {v}");
    }
    single(
        out,
        "aerolink_pending_requests",
        "gauge",
        "Retransmission requests awaiting answers.",
        s.pending.len(),
    );

    header(
        out,
        "aerolink_request_rtt_us",
        "gauge",
        "Retransmission request round-trip time in microseconds.",
    );
    for (stat, v) in [
        ("last", s.rtt.last_us),
        ("min", s.rtt.min_us),
        ("max", s.rtt.max_us),
        ("avg", s.rtt_avg_us),
    ] {
        if let Some(v) = v {
            let _ = writeln!(out, "aerolink_request_rtt_us{{stat=\"{stat}\"}} {v}");
        }
    }
}

fn render_controllers(out: &mut String, s: &PipelineSnapshot) {
    let q = &s.quality;
    single(
        out,
        "aerolink_quality_target_level",
        "gauge",
        "Video quality level requested from the vehicle.",
        q.target_level,
    );
    if let Some(acked) = q.acked_level {
        single(
            out,
            "aerolink_quality_acked_level",
            "gauge",
            "Video quality level acknowledged by the vehicle.",
            acked,
        );
    }
    header(out, "aerolink_quality_shifts_total", "counter", "Quality level shifts.");
    let _ = writeln!(out, "aerolink_quality_shifts_total{{direction=\"down\"}} {}", q.shifts_down);
    let _ = writeln!(out, "aerolink_quality_shifts_total{{direction=\"up\"}} {}", q.shifts_up);

    let k = &s.keyframe;
    single(
        out,
        "aerolink_keyframe_requested_ms",
        "gauge",
        "Keyframe interval requested from the vehicle.",
        k.requested_ms,
    );
    header(out, "aerolink_keyframe_shifts_total", "counter", "Keyframe interval shifts.");
    let _ = writeln!(out, "aerolink_keyframe_shifts_total{{direction=\"down\"}} {}", k.shifts_down);
    let _ = writeln!(out, "aerolink_keyframe_shifts_total{{direction=\"up\"}} {}", k.shifts_up);
    let _ = writeln!(out, "aerolink_keyframe_shifts_total{{direction=\"stall\"}} {}", k.stall_shifts);
}

fn render_interfaces(out: &mut String, s: &PipelineSnapshot) {
    header(
        out,
        "aerolink_interface_tx_load_bps",
        "gauge",
        "Transmit load over the last second.",
    );
    for m in &s.interfaces {
        let _ = writeln!(
            out,
            "aerolink_interface_tx_load_bps{{interface=\"{}\",kind=\"{}\"}} {}",
            m.name, m.kind, m.tx_load_bps
        );
    }
    header(
        out,
        "aerolink_interface_packets_sent_total",
        "counter",
        "Packets transmitted on the interface.",
    );
    for m in &s.interfaces {
        let _ = writeln!(
            out,
            "aerolink_interface_packets_sent_total{{interface=\"{}\"}} {}",
            m.name, m.packets_sent
        );
    }
    header(
        out,
        "aerolink_interface_send_errors_total",
        "counter",
        "Transmit errors on the interface.",
    );
    for m in &s.interfaces {
        let _ = writeln!(
            out,
            "aerolink_interface_send_errors_total{{interface=\"{}\"}} {}",
            m.name, m.send_errors
        );
    }
    header(
        out,
        "aerolink_interface_rx_quality",
        "gauge",
        "Receive quality reported for the interface (0-100).",
    );
    for m in &s.interfaces {
        let _ = writeln!(
            out,
            "aerolink_interface_rx_quality{{interface=\"{}\"}} {}",
            m.name, m.rx_quality
        );
    }
    single(
        out,
        "aerolink_unroutable_packets_total",
        "counter",
        "Outbound packets no interface could carry.",
        s.selector.unroutable,
    );
}

// ─── Server ─────────────────────────────────────────────────────────────────

/// A lightweight HTTP server that serves `/metrics` for Prometheus scraping.
///
/// Runs in a background thread and renders whatever snapshot was last
/// published when a request arrives.
pub struct MetricsServer {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl MetricsServer {
    /// Start the metrics server on the given address.
    pub fn start(bind_addr: SocketAddr, source: SnapshotHandle) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();

        let handle = thread::Builder::new()
            .name("aerolink-metrics".into())
            .spawn(move || serve_loop(listener, source, running_clone))
            .map_err(std::io::Error::other)?;

        tracing::info!(%addr, "prometheus metrics server listening");
        Ok(MetricsServer {
            running,
            handle: Some(handle),
            addr,
        })
    }

    /// The address the server is actually listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the server and join its thread. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_loop(listener: TcpListener, source: SnapshotHandle, running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => handle_connection(stream, &source),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                tracing::debug!(error = %e, "metrics accept error");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn handle_connection(mut stream: TcpStream, source: &SnapshotHandle) {
    // Accepted sockets may inherit non-blocking mode.
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));

    let mut buf = [0u8; 1024];
    let n = match stream.read(&mut buf) {
        Ok(n) => n,
        Err(_) => return,
    };
    let request = String::from_utf8_lossy(&buf[..n]);

    if request.starts_with("GET /metrics") {
        let body = render_prometheus(&source.load());
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let _ = stream.write_all(response.as_bytes());
    } else {
        let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        let _ = stream.write_all(response.as_bytes());
    }
}
