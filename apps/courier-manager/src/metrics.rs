use once_cell::sync::Lazy;
use prometheus::{
    core::Collector, Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn register<T: Collector + Clone + 'static>(metric: prometheus::Result<T>) -> T {
    // Names and labels are static.
    let metric = metric.expect("static metric definition");
    REGISTRY.register(Box::new(metric.clone())).ok();
    metric
}

pub static LEASES_ACQUIRED: Lazy<IntCounter> = Lazy::new(|| {
    register(IntCounter::new(
        "courier_leases_acquired_total",
        "Leases granted to devices",
    ))
});

pub static LEASES_ENDED: Lazy<IntCounterVec> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new("courier_leases_ended_total", "Leases ended, by cause"),
        &["reason"],
    ))
});

pub static LEASE_CONFLICTS: Lazy<IntCounter> = Lazy::new(|| {
    register(IntCounter::new(
        "courier_lease_conflicts_total",
        "Acquisitions refused because another device holds the lease",
    ))
});

pub static COMMANDS_ENQUEUED: Lazy<IntCounterVec> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new("courier_commands_enqueued_total", "Commands enqueued, by type"),
        &["command_type"],
    ))
});

pub static COMMANDS_DELIVERED: Lazy<IntCounterVec> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new(
            "courier_commands_delivered_total",
            "Commands handed to agents, by channel",
        ),
        &["channel"],
    ))
});

pub static COMMANDS_COMPLETED: Lazy<IntCounterVec> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new(
            "courier_commands_completed_total",
            "Command completions, by result status",
        ),
        &["status"],
    ))
});

pub static COMMANDS_DISCARDED: Lazy<IntCounter> = Lazy::new(|| {
    register(IntCounter::new(
        "courier_commands_discarded_total",
        "Commands dropped because their lease ended first",
    ))
});

pub static DUPLICATE_COMPLETIONS: Lazy<IntCounter> = Lazy::new(|| {
    register(IntCounter::new(
        "courier_duplicate_completions_total",
        "Completions ignored because the command was already completed",
    ))
});

pub static ACTIVE_CHANNELS: Lazy<IntGauge> = Lazy::new(|| {
    register(IntGauge::new(
        "courier_active_channels",
        "Push channels currently registered",
    ))
});

pub static MODERATOR_PAUSES: Lazy<IntCounterVec> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new("courier_moderator_pauses_total", "Moderator-wide pauses, by reason"),
        &["reason"],
    ))
});

pub static QUOTA_CONSUMED: Lazy<IntCounter> = Lazy::new(|| {
    register(IntCounter::new(
        "courier_quota_consumed_total",
        "Quota units charged for confirmed sends",
    ))
});

pub static FAILED_TASKS: Lazy<IntCounter> = Lazy::new(|| {
    register(IntCounter::new(
        "courier_failed_tasks_total",
        "Messages recorded as permanently failed",
    ))
});

pub fn export_prometheus() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
