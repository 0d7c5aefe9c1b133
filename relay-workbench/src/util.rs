use crate::traffic::TrafficStats;
use packet_relay::buffer::PoolStats;
use packet_relay::context::ContextReport;
use packet_relay::interface::PacketInterface;
use std::sync::Arc;
use std::time::Duration;

pub fn print_context_reports(reports: &[ContextReport], elapsed: Duration) {
    println!("--- Forwarding contexts ---");
    let mut reports: Vec<_> = reports.iter().collect();
    reports.sort_unstable_by_key(|r| r.id);
    for report in reports {
        let counters = &report.counters;
        println!(
            "* ctx-{} ({} -> {})",
            report.id, report.source, report.destination
        );

        let rate = counters.forwarded as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        println!(
            "  * Forwarded packets: {} ({rate:.0} packets/s)",
            counters.forwarded
        );
        println!(
            "    | {} received in {} bursts, {} transmitted in {} bursts",
            counters.rx_packets, counters.rx_bursts, counters.forwarded, counters.tx_bursts
        );
        println!(
            "    | {} dropped because the relay ring was full",
            counters.relay_overflow_drops
        );
        println!(
            "    | {} dropped because the destination queue accepted only part of a burst",
            counters.tx_partial_drops
        );
        println!(
            "  * Latency probes: {} decoded ({} malformed, {} dropped because the stats ring was full)",
            counters.probes_decoded, counters.malformed_probes, counters.probe_overflow_drops
        );
        println!(
            "    | {} hop pairs with timestamps going backwards",
            counters.reordered_hops
        );
        if counters.publish_failures > 0 {
            println!(
                "  * Telemetry records that could not be published: {}",
                counters.publish_failures
            );
        }
        if report.abandoned_in_relay_ring + report.abandoned_in_stats_ring > 0 {
            println!(
                "  * Still queued at shutdown: {} in the relay ring, {} in the stats ring",
                report.abandoned_in_relay_ring, report.abandoned_in_stats_ring
            );
        }
    }
}

pub fn print_interface_counters(interfaces: &[Arc<dyn PacketInterface>]) {
    println!("--- Interfaces ---");
    for interface in interfaces {
        let counters = interface.counters();
        println!("* {}", interface.id());
        println!(
            "  * Received: {} packets ({} bytes), {} missed",
            counters.rx_packets, counters.rx_bytes, counters.rx_errors
        );
        println!(
            "  * Transmitted: {} packets ({} bytes), {} refused",
            counters.tx_packets, counters.tx_bytes, counters.tx_errors
        );
    }
}

pub fn print_traffic_stats(stats: &[(u16, TrafficStats)]) {
    println!("--- Generated traffic ---");
    for (port, stats) in stats {
        println!(
            "* port {port}: {} data frames, {} probes",
            stats.data_frames, stats.probes
        );
        println!(
            "  | {} frames did not fit in the receive queues",
            stats.rx_overflows
        );
        println!(
            "  | {} frames not generated because the buffer pool was empty",
            stats.pool_exhausted
        );
    }
}

pub fn print_pool_stats(stats: PoolStats) {
    println!("--- Buffer pool ---");
    println!(
        "* {} buffers, {} allocations, {} releases, {} failed allocations",
        stats.capacity, stats.allocated, stats.freed, stats.exhausted
    );
    println!("* Buffers still in use: {}", stats.in_use());
}
