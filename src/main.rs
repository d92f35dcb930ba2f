pub mod config;
pub mod mqtt;
pub mod panel;
pub mod persistence;
pub mod telemetry;

use crate::config::PanelConfig;
use crate::mqtt::mqtt_handler::Session;
use crate::mqtt::transport::RumqttTransport;
use crate::panel::{FeederPanel, PET_WEIGHT_SERIES, WATER_LEVEL_SERIES};
use crate::persistence::series_store::SeriesStore;
use color_eyre::{eyre::eyre, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const HELP: &str =
    "commands: feed on|off | msg <text> | refresh level|weight | portion <n> | time <HHmm> | history | status | quit";

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = PanelConfig::load().await?;
    info!("Broker endpoint {}", config.broker.endpoint());

    let store = SeriesStore::open(config.series.dir.clone(), config.series.default_capacity);
    for (key, capacity) in &config.series.capacities {
        store.set_capacity(key, *capacity);
    }
    for key in [PET_WEIGHT_SERIES, WATER_LEVEL_SERIES] {
        let points = store.load(key).await;
        info!(
            "Restored {}/{} points of {}",
            points.len(),
            store.capacity(key),
            key
        );
    }

    let transport = RumqttTransport::new(config.broker.clone());
    let (session, session_handle) = Session::spawn(transport, config.session.clone());
    let panel = FeederPanel::attach(session.clone(), store.clone(), config.topics.clone())
        .await
        .map_err(|e| eyre!("Failed to attach panel: {}", e))?;
    session
        .connect()
        .await
        .map_err(|e| eyre!("Failed to start session: {}", e))?;

    let mut status_rx = session.watch_status();
    let _status_logger = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let line = status_rx.borrow_and_update().describe();
            info!("Session: {}", line);
        }
    });

    let mut panel_rx = panel.subscribe_state();
    let _panel_logger = tokio::spawn(async move {
        let mut last = panel_rx.borrow_and_update().clone();
        while panel_rx.changed().await.is_ok() {
            let current = panel_rx.borrow_and_update().clone();
            if current.dispenser_running != last.dispenser_running {
                info!(
                    "Food dispenser {}",
                    if current.dispenser_running { "running" } else { "stopped" }
                );
            }
            if current.water_level != last.water_level {
                if let Some(level) = &current.water_level {
                    info!("Water level {}", level);
                }
            }
            last = current;
        }
    });

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_command(&panel, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read console input: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    if let Err(e) = session.shutdown().await {
        warn!("Session shutdown: {}", e);
    }
    if let Err(e) = session_handle.await {
        warn!("Session worker ended abnormally: {}", e);
    }
    store.flush().await;
    info!("Bye");
    Ok(())
}

/// Runs one console command; returns false on `quit`.
async fn run_command(panel: &FeederPanel, line: &str) -> bool {
    let (command, argument) = match line.split_once(' ') {
        Some((command, argument)) => (command, argument.trim()),
        None => (line, ""),
    };

    let result = match (command, argument) {
        ("", _) => Ok(()),
        ("quit" | "exit", _) => return false,
        ("feed", "on") => panel.set_dispenser(true).await,
        ("feed", "off") => panel.set_dispenser(false).await,
        ("feed", "") => panel.toggle_dispenser().await,
        ("msg", text) => panel.send_message(text).await,
        ("refresh", "level") => panel.request_water_level().await,
        ("refresh", "weight") => panel.request_pet_weight().await,
        ("portion", value) => panel.set_portion(value).await,
        ("time", value) => panel.set_feed_time(value).await,
        ("history", _) => {
            let store = panel.store();
            for key in store.keys() {
                println!("{key} (last {}):", store.capacity(&key));
                for reading in store.snapshot(&key) {
                    println!("  {reading}");
                }
            }
            Ok(())
        }
        ("status", _) => {
            let state = panel.state();
            println!("session:   {}", panel.session().status().describe());
            println!("dispenser: {}", if state.dispenser_running { "ON" } else { "OFF" });
            match &state.water_level {
                Some(level) => println!("water:     {level}"),
                None => println!("water:     unknown"),
            }
            for (topic, payload) in &state.last_payloads {
                println!("{topic}: {payload}");
            }
            Ok(())
        }
        _ => {
            println!("{HELP}");
            Ok(())
        }
    };

    if let Err(e) = result {
        println!("{e}");
    }
    true
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
