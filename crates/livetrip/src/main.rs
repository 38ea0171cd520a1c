//! `livetrip` - developer CLI for livetrip
//!
//! Drives trip sessions headlessly against the local SQLite store: seed
//! buses and routes, replay a recorded drive as a live broadcast, and inspect
//! the resulting live trip records.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use livetrip::cli::{
    BusesCommand, Cli, Command, ConfigCommand, SeedCommand, StatusCommand, TripCommand,
};
use livetrip::navigator::filter_buses;
use livetrip::permission::{
    permission_rationale, Capability, ConsentPermission, FixedPrompt, ImplicitPermission,
    PermissionGate,
};
use livetrip::session::Applied;
use livetrip::store::{BusRecord, RouteRecord};
use livetrip::{
    init_logging, Config, ReplayLocationSource, SessionDeps, SessionRegistry, SqliteTripStore,
    TripSession, TripStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    // Validation must report a broken file instead of failing to load it.
    if let Command::Config(ConfigCommand::Validate { file }) = &cli.command {
        let path = file
            .clone()
            .or_else(|| cli.config.clone())
            .unwrap_or_else(Config::default_config_path);
        println!("Validating configuration: {}", path.display());
        match Config::load_from(Some(path)) {
            Ok(_) => println!("Configuration is valid."),
            Err(e) => println!("Configuration error: {e}"),
        }
        return Ok(());
    }

    let config = Config::load_from(cli.config.clone())?;

    match cli.command {
        Command::Seed(cmd) => handle_seed(&config, cmd),
        Command::Buses(cmd) => handle_buses(&config, &cmd),
        Command::Trip(cmd) => handle_trip(&config, cmd).await,
        Command::Status(cmd) => handle_status(&config, &cmd).await,
        Command::Config(cmd) => handle_config(&config, &cmd),
    }
}

fn open_store(config: &Config) -> anyhow::Result<SqliteTripStore> {
    let path = config.database_path();
    let store = SqliteTripStore::open(&path)
        .with_context(|| format!("opening trip store at {}", path.display()))?;
    Ok(store.with_feed_interval(config.feed_poll_interval()))
}

fn handle_seed(config: &Config, cmd: SeedCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;
    match cmd {
        SeedCommand::Bus { id, route, model } => {
            store.put_bus(
                &id,
                &BusRecord {
                    model,
                    route_id: route,
                },
            )?;
            println!("Stored bus {id}");
        }
        SeedCommand::Route { id, from, to } => {
            store.put_route(&RouteRecord {
                id: id.clone(),
                start_point: from,
                end_point: to,
            })?;
            println!("Stored route {id}");
        }
    }
    Ok(())
}

fn handle_buses(config: &Config, cmd: &BusesCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let buses = store.list_buses()?;
    let shown = filter_buses(&buses, cmd.search.as_deref().unwrap_or(""));

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&shown)?);
        return Ok(());
    }

    if shown.is_empty() {
        println!("No buses found.");
        return Ok(());
    }
    for bus in shown {
        println!(
            "{:<10} {:<20} {}",
            bus.id,
            bus.record.model.as_deref().unwrap_or("-"),
            bus.record.route_id.as_deref().unwrap_or("(no route)")
        );
    }
    Ok(())
}

async fn handle_trip(config: &Config, cmd: TripCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;

    let mut replay = ReplayLocationSource::load(&cmd.track)
        .with_context(|| format!("loading track {}", cmd.track.display()))?;
    if let Some(pace) = cmd.pace {
        replay = replay.with_pace(Duration::from_millis(pace));
    }
    let replay = Arc::new(replay);

    let permission: Arc<dyn PermissionGate> = if cmd.deny_location {
        Arc::new(ConsentPermission::new(FixedPrompt(Capability::Denied)))
    } else {
        Arc::new(ImplicitPermission)
    };

    let deps = SessionDeps {
        store: Arc::new(store),
        location: Arc::clone(&replay) as Arc<dyn livetrip::LocationSource>,
        permission,
        registry: SessionRegistry::new(),
    };
    let mut session = TripSession::new(cmd.driver.clone(), deps, config.session_config());

    match session.select(cmd.bus.clone()).await? {
        Some(route) => println!(
            "Bus {} on route {}: {} -> {}",
            cmd.bus, route.id, route.start_point, route.end_point
        ),
        None => println!("Bus {} has no route assigned", cmd.bus),
    }

    let first = match session.start().await {
        Ok(fix) => fix,
        Err(e) => {
            if e.is_permission_error() {
                eprintln!("{}", permission_rationale());
            }
            return Err(e.into());
        }
    };
    println!("Trip started at {}", first.position);

    let deadline = async {
        match cmd.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let finished = replay.wait_finished();
    tokio::pin!(finished);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            () = &mut deadline => {
                info!("Duration elapsed");
                break;
            }
            () = &mut finished => {
                info!("Track finished");
                break;
            }
            applied = session.process_next() => match applied {
                Some(Applied::Forwarded(position)) => println!("  {position}"),
                Some(_) => {}
                None => break,
            },
        }
    }

    for applied in session.process_pending() {
        if let Applied::Forwarded(position) = applied {
            println!("  {position}");
        }
    }
    session.flush_writes().await;
    session.stop().await;

    let stats = session.stats();
    println!(
        "Trip stopped: {} fixes, {} writes ({} failed)",
        stats.fixes_received, stats.writes_issued, stats.writes_failed
    );
    Ok(())
}

async fn handle_status(config: &Config, cmd: &StatusCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let trip = store.get_live_trip(&cmd.bus).await?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&trip)?);
        return Ok(());
    }

    let Some(trip) = trip else {
        println!("No live trip for bus {}", cmd.bus);
        return Ok(());
    };

    println!("livetrip status");
    println!("---------------");
    println!("Bus:           {}", trip.bus_id);
    println!("Active:        {}", trip.is_active);
    println!("Driver:        {}", trip.driver_id.as_deref().unwrap_or("-"));
    println!("Route:         {}", trip.route_id.as_deref().unwrap_or("-"));
    match trip.last_location {
        Some(position) => println!("Last location: {position}"),
        None => println!("Last location: -"),
    }
    match trip.last_updated {
        Some(at) => println!("Last updated:  {}", at.to_rfc3339()),
        None => println!("Last updated:  -"),
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: &ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if *json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Location]");
                println!("  Fix timeout (ms):   {}", config.location.fix_timeout_ms);
                println!("  Fix max age (ms):   {}", config.location.fix_maximum_age_ms);
                println!("  High accuracy:      {}", config.location.high_accuracy);
                println!("  Distance filter:    {} m", config.location.distance_filter_m);
                println!("  Interval (ms):      {}", config.location.interval_ms);
                println!();
                println!("[Store]");
                println!("  Database path:      {}", config.database_path().display());
                println!("  Write timeout (ms): {}", config.store.write_timeout_ms);
                println!();
                println!("[Session]");
                println!("  Event buffer:       {}", config.session.event_buffer);
                println!();
                println!("[Auth]");
                println!("  Country code:       {}", config.auth.country_code);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { .. } => {}
    }
    Ok(())
}
