use buspoll::config::PollerConfig;
use buspoll::status::{format_register_table, DeviceStatus, StatusReport};
use buspoll::{BusPoller, SimulatedBus, SimulatedBusConfig, TelemetryStore};
use clap::{App, Arg};
use colored::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, Level};

const DEFAULT_TICK_MS: &str = "10";
const DEFAULT_FAULT_RATE: &str = "0";
const STALENESS_CHECK_INTERVAL_MS: u64 = 1000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("buspoll")
        .version("0.1.0")
        .about("Time-sliced polling of field devices on a shared RS-485 bus")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON device configuration (default: built-in bench layout)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("tick")
                .short("t")
                .long("tick-ms")
                .value_name("MS")
                .help("Host loop period in milliseconds")
                .takes_value(true)
                .default_value(DEFAULT_TICK_MS)
                .validator(|v| match v.parse::<u64>() {
                    Ok(ms) if ms > 0 => Ok(()),
                    _ => Err("Tick period must be a positive integer".into()),
                }),
        )
        .arg(
            Arg::with_name("fault-rate")
                .short("f")
                .long("fault-rate")
                .value_name("PERCENT")
                .help("Simulated bus failure rate (0-100)")
                .takes_value(true)
                .default_value(DEFAULT_FAULT_RATE)
                .validator(|v| match v.parse::<f32>() {
                    Ok(rate) if (0.0..=100.0).contains(&rate) => Ok(()),
                    _ => Err("Fault rate must be between 0 and 100".into()),
                }),
        )
        .arg(
            Arg::with_name("duration")
                .short("d")
                .long("duration")
                .value_name("SECONDS")
                .help("Stop after this many seconds (default: run until Ctrl+C)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("dump-config")
                .long("dump-config")
                .help("Print the effective configuration as JSON and exit"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("Increase log verbosity (-v debug, -vv trace)"),
        )
        .get_matches();

    let level = match matches.occurrences_of("verbose") {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match matches.value_of("config") {
        Some(path) => PollerConfig::load(path)?,
        None => PollerConfig::default(),
    };

    if matches.is_present("dump-config") {
        println!("{}", config.to_json_pretty()?);
        return Ok(());
    }

    let tick_ms = matches.value_of("tick").unwrap_or(DEFAULT_TICK_MS).parse::<u64>()?;
    let fault_rate = matches
        .value_of("fault-rate")
        .unwrap_or(DEFAULT_FAULT_RATE)
        .parse::<f32>()?;
    let duration = matches
        .value_of("duration")
        .map(str::parse::<u64>)
        .transpose()?
        .map(Duration::from_secs);

    println!("{}", "Bus Poller".bright_blue().bold());
    println!("{}", "==========".bright_blue());

    let bus_config = SimulatedBusConfig::default().with_fault_rate(fault_rate);
    let mut poller = BusPoller::new(&config, |completions| SimulatedBus::new(bus_config, completions))?;
    poller.start();

    let watcher = tokio::spawn(watch_staleness(poller.store(), config.transaction_timeout_ms));

    let mut interval = time::interval(Duration::from_millis(tick_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let deadline = time::sleep(duration.unwrap_or(Duration::MAX));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Some(report) = poller.update() {
                    print_report(&report);
                }
            }
            _ = &mut shutdown => {
                info!("Interrupted");
                break;
            }
            () = &mut deadline, if duration.is_some() => {
                info!("Run duration elapsed");
                break;
            }
        }
    }

    poller.stop();
    watcher.abort();

    print_report(&poller.status_report());
    let stats = poller.get_transaction_stats();
    println!(
        "{} issued {} completed {} failed {} ({} timeouts, {} stale)",
        "Transactions:".bright_white().bold(),
        stats.total_issued,
        stats.total_completed,
        stats.total_failed,
        stats.timeouts_synthesized,
        stats.stale_events
    );
    println!(
        "{} {} us",
        "Longest update:".bright_white().bold(),
        poller.get_state().max_update_time_us
    );

    Ok(())
}

/// A second reader of the telemetry store, running beside the poll loop.
async fn watch_staleness(store: Arc<TelemetryStore>, timeout_ms: u64) {
    let mut interval = time::interval(Duration::from_millis(STALENESS_CHECK_INTERVAL_MS));
    loop {
        interval.tick().await;
        let stale = (0..store.len())
            .filter_map(|i| store.snapshot(buspoll::DeviceId(i)))
            .filter(|s| !s.valid)
            .count();
        let counters = store.counters();
        debug!(
            "watcher: {} stale slots, {} requests, {} errors (timeout {} ms)",
            stale, counters.requests_issued, counters.requests_failed, timeout_ms
        );
    }
}

fn print_report(report: &StatusReport) {
    println!();
    println!(
        "{} {}",
        format!("[{:>8} ms]", report.generated_at).dimmed(),
        report.summary_line().bright_white()
    );
    for device in &report.devices {
        print_device(device, report.generated_at);
    }
}

fn print_device(device: &DeviceStatus, now: u64) {
    let name = device.display_name();
    if !device.enabled {
        println!("  {} {}", name.dimmed(), "disabled".dimmed());
        return;
    }

    let state = match (device.valid, device.age_ms(now)) {
        (true, Some(age)) => format!("valid, {age} ms old").green(),
        (false, Some(age)) => format!("stale, last good {age} ms ago").yellow(),
        (_, None) => "no data yet".red(),
    };
    let failure = device
        .last_failure
        .map(|f| format!(" last failure: {f:?}"))
        .unwrap_or_default();
    println!(
        "  {} {} (failures {}){}",
        name.bright_cyan(),
        state,
        device.failure_count,
        failure.dimmed()
    );
    if device.last_updated_at.is_some() {
        print!("{}", format_register_table(device));
    }
}
