/*
    Metrics - protocol counters and gauges

    Recorded through the `metrics` facade; nothing is exported unless the host
    installs a recorder. Call `init_metrics()` once at startup so descriptions
    are registered before the first sample.
*/

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register metric descriptions
pub fn init_metrics() {
    // Presence
    describe_counter!(
        "meshgate_heartbeats_sent_total",
        "Heartbeats published, labeled by result (ok, failed)"
    );
    describe_counter!(
        "meshgate_heartbeats_received_total",
        "Heartbeats accepted from other peers"
    );
    describe_counter!(
        "meshgate_presence_messages_dropped_total",
        "Presence payloads discarded, labeled by reason (malformed, self, stale)"
    );
    describe_gauge!("meshgate_peers_online", "Peers currently considered online");

    // Registry
    describe_counter!(
        "meshgate_registry_cycles_total",
        "Registry sync cycles, labeled by resolve source (resolved, empty, unavailable, overlapped)"
    );
    describe_counter!(
        "meshgate_registry_publishes_total",
        "Registry publish attempts, labeled by result (ok, failed, skipped)"
    );
    describe_gauge!("meshgate_registry_members", "Members in the merged registry view");
    describe_histogram!(
        "meshgate_registry_cycle_duration_seconds",
        "Wall time of one registry sync cycle"
    );

    // Negotiation
    describe_counter!(
        "meshgate_negotiation_messages_total",
        "Negotiation messages handled, labeled by type"
    );
    describe_counter!(
        "meshgate_negotiation_grants_total",
        "Peers granted access by this responder"
    );
    describe_counter!(
        "meshgate_negotiation_proof_rejected_total",
        "Proof submissions whose content did not match"
    );
}

pub fn heartbeat_sent(ok: bool) {
    let result = if ok { "ok" } else { "failed" };
    counter!("meshgate_heartbeats_sent_total", "result" => result).increment(1);
}

pub fn heartbeat_received() {
    counter!("meshgate_heartbeats_received_total").increment(1);
}

pub fn presence_message_dropped(reason: &'static str) {
    counter!("meshgate_presence_messages_dropped_total", "reason" => reason).increment(1);
}

pub fn set_peers_online(count: usize) {
    gauge!("meshgate_peers_online").set(count as f64);
}

pub fn registry_cycle(source: &'static str, duration_secs: f64) {
    counter!("meshgate_registry_cycles_total", "source" => source).increment(1);
    histogram!("meshgate_registry_cycle_duration_seconds").record(duration_secs);
}

pub fn registry_publish(result: &'static str) {
    counter!("meshgate_registry_publishes_total", "result" => result).increment(1);
}

pub fn set_registry_members(count: usize) {
    gauge!("meshgate_registry_members").set(count as f64);
}

pub fn negotiation_message(kind: &'static str) {
    counter!("meshgate_negotiation_messages_total", "type" => kind).increment(1);
}

pub fn negotiation_granted() {
    counter!("meshgate_negotiation_grants_total").increment(1);
}

pub fn negotiation_proof_rejected() {
    counter!("meshgate_negotiation_proof_rejected_total").increment(1);
}
