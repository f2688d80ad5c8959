//! The launcher: minimal argument handling, logging setup, boot, wait,
//! exit-code mapping. Everything beyond `ember <image> [function]` belongs
//! to the surrounding tooling, not the runtime.

use std::env;
use std::process::ExitCode;

use log::error;

use ember_emulator::sys::crash_dump;
use ember_rt::runtime::{exit_code, Config};

fn main() -> ExitCode {
    init_logging();

    let mut args = env::args().skip(1);
    let Some(image_path) = args.next() else {
        eprintln!("usage: ember <module.embr> [entry-function]");
        return ExitCode::from(exit_code::EARLY_INIT as u8);
    };
    let entry = args.next().unwrap_or_else(|| "start".to_string());

    let image = match std::fs::read(&image_path) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("ember: cannot read {image_path}: {err}");
            return ExitCode::from(exit_code::EARLY_INIT as u8);
        }
    };

    let instance = match ember_rt::code::load_bytes(&image) {
        Ok(instance) => instance,
        Err(err) => {
            eprintln!("ember: cannot load {image_path}: {err}");
            return ExitCode::from(exit_code::MAIN_INIT as u8);
        }
    };

    let module = instance.name.name().to_string();
    let booted = match ember_emulator::boot(Config::default(), &module, &entry) {
        Ok(booted) => booted,
        Err(err) => {
            error!(target: "runtime", "boot failed: {err}");
            crash_dump::write_crash_dump();
            return ExitCode::from(exit_code::MAIN_INIT as u8);
        }
    };

    let status = booted.wait_and_shutdown();
    match u8::try_from(status) {
        Ok(code) => ExitCode::from(code),
        Err(_) => ExitCode::from(exit_code::RUNTIME_FATAL as u8),
    }
}

fn init_logging() {
    let mut builder = env_logger::Builder::from_env("EMBER_TRACE");
    builder.format_indent(Some(2));
    if let Ok(precision) = env::var("EMBER_TRACE_WITH_TIME") {
        match precision.as_str() {
            "s" => builder.format_timestamp_secs(),
            "ms" => builder.format_timestamp_millis(),
            "us" => builder.format_timestamp_micros(),
            "ns" => builder.format_timestamp_nanos(),
            other => {
                eprintln!(
                    "Ignoring invalid EMBER_TRACE_WITH_TIME value, expected one of [s, ms, us, ns], got '{other}'. Using 'ms' instead.."
                );
                builder.format_timestamp_millis()
            }
        };
    } else {
        builder.format_timestamp(None);
    }
    builder.init();
}
