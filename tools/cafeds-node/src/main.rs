// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! cafeds cluster node.
//!
//! Runs one participant of the ordered-broadcast cluster, as leader or
//! follower, with an optional waiter UI that reads orders from stdin.
//!
//! # Usage
//!
//! ```bash
//! # Start the initial leader
//! cafeds-node --id 10 --role leader --tcp-port 9000
//!
//! # Start a kitchen follower
//! cafeds-node --id 3 --role follower --tcp-port 9003
//!
//! # Start a waiter follower; type an order and press Enter to submit
//! cafeds-node --id 2 --role follower --tcp-port 9002 --ui waiter
//! ```

use std::io::BufRead;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cafeds::{text_payload, Node};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum RoleArg {
    Leader,
    Follower,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum UiArg {
    Waiter,
    Kitchen,
}

/// cafeds cluster node - totally-ordered command broadcast over a LAN
#[derive(Parser, Debug)]
#[command(name = "cafeds-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node id, unique on the subnet
    #[arg(long)]
    id: u32,

    /// Requested role; a second leader demotes itself automatically
    #[arg(long, value_enum)]
    role: RoleArg,

    /// TCP port for the order stream
    #[arg(long)]
    tcp_port: u16,

    /// Demo surface: waiter reads orders from stdin, kitchen just delivers
    #[arg(long, value_enum, default_value_t = UiArg::Kitchen)]
    ui: UiArg,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let role = match args.role {
        RoleArg::Leader => cafeds::Role::Leader,
        RoleArg::Follower => cafeds::Role::Follower,
    };
    let ui = match args.ui {
        UiArg::Waiter => cafeds::Ui::Waiter,
        UiArg::Kitchen => cafeds::Ui::Kitchen,
    };

    let node = match Node::new(args.id, role, args.tcp_port, ui) {
        Ok(node) => node,
        Err(err) => {
            eprintln!("cafeds-node: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = node.run() {
        eprintln!("cafeds-node: {}", err);
        std::process::exit(1);
    }

    info!(
        "node {} up as {} on tcp port {} (ui: {})",
        args.id,
        node.role(),
        args.tcp_port,
        node.ui()
    );

    let stopper = node.clone();
    ctrlc::set_handler(move || {
        info!("shutdown signal received, stopping node");
        stopper.stop();
    })?;

    if node.ui() == cafeds::Ui::Waiter {
        spawn_waiter_loop(node.clone());
    }

    while !node.is_stopped() {
        thread::sleep(Duration::from_millis(500));
    }
    Ok(())
}

/// Read orders from stdin, one per line, and submit them into the log.
fn spawn_waiter_loop(node: Node) {
    thread::spawn(move || {
        info!("WAITER: type an order and press Enter");
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            if node.is_stopped() {
                break;
            }
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Err(err) = node.submit_order(text_payload(line)) {
                info!("order not submitted: {}", err);
            }
        }
    });
}
