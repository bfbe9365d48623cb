// src/main.rs

use std::backtrace::Backtrace;
use std::fs::File;
use std::io::Write;
use std::panic;
use std::path::PathBuf;

use log::{error, info, LevelFilter};

use cube_demo::DemoConfig;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const CRASH_LOG: &str = "crash.log";

fn main() {
    setup_diagnostics();

    // Optional first argument: a JSON config file.
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = match DemoConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Bad config: {e}");
            std::process::exit(1);
        }
    };

    info!("Starting cube demo ({}x{})", config.window.width, config.window.height);
    if let Err(e) = cube_demo::run(config) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

/// Sets up logging and crash dumping
fn setup_diagnostics() {
    env_logger::Builder::new()
        .filter_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .format_timestamp_millis()
        .format_target(false)
        .parse_default_env()
        .init();

    panic::set_hook(Box::new(|panic_info| {
        let backtrace = Backtrace::force_capture();

        let msg = match panic_info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };

        let location = panic_info
            .location()
            .map_or("Unknown location".to_string(), |loc| format!("{}:{}", loc.file(), loc.line()));

        let crash_msg = format!(
            "=== CRASH ===\nReason: {}\nLocation: {}\n\nStack Trace:\n{}",
            msg, location, backtrace
        );

        eprintln!("\x1b[31;1m{}\x1b[0m", crash_msg);

        if let Ok(mut file) = File::create(CRASH_LOG) {
            let _ = file.write_all(crash_msg.as_bytes());
            eprintln!("Crash report saved to {CRASH_LOG}");
        }
    }));
}
