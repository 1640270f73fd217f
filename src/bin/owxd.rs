//! Smoke-test harness for `BusController::handle_command`: reads a bus
//! configuration line, then one command per line of stdin, printing each
//! response. Not the contracted interface — the host automation framework
//! links against the library directly.

use log::error;
use owx::config::BusConfig;
use owx::controller::BusController;
use std::io::{self, BufRead};

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let config_line = match args.next() {
        Some(line) => line,
        None => {
            eprintln!("usage: owxd \"<name> <backend-address>\"");
            std::process::exit(2);
        }
    };

    let config = match BusConfig::parse(&config_line) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration {config_line:?}: {e}");
            std::process::exit(2);
        }
    };

    let controller = match BusController::init(&config) {
        Ok(controller) => controller,
        Err(e) => {
            error!("failed to open bus: {e}");
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("stdin read error: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        println!("{}", controller.handle_command(&line));
    }
}
