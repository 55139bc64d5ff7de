use std::env;
use std::process;
use std::sync::Arc;

use volume_kit::control::sim::{BUFFER_FRAMES, CycleDriver, SAMPLE_RATE, seed_demo_session};
use volume_kit::{Device, DeviceConfig, DeviceError, NullNotifier};

const STATUS_CYCLES: u32 = 24;

fn print_status() -> Result<(), DeviceError> {
    let device = Device::new(DeviceConfig::default(), Arc::new(NullNotifier))?;
    seed_demo_session(&device)?;
    let mut driver = CycleDriver::new();
    for _ in 0..STATUS_CYCLES {
        driver.run_cycle(&device);
    }

    let status = device.status();
    println!(
        "Simulated   : {} cycles of {} frames at {} Hz",
        STATUS_CYCLES, BUFFER_FRAMES, SAMPLE_RATE
    );
    println!("Running     : {}", if status.is_running { "yes" } else { "no" });
    println!("Audible     : {:?}", status.audible_state);
    println!(
        "IO clients  : {} ({} excluding app)",
        status.io_counts.total, status.io_counts.excluding_app
    );
    println!(
        "Music player: pid={} bundle={}",
        status.music_player_pid,
        if status.music_player_bundle_id.is_empty() {
            "-"
        } else {
            &status.music_player_bundle_id
        }
    );
    println!("Free tasks  : {}", status.free_tasks);
    println!("Clients:");
    for client in &status.clients {
        println!(
            "  [{}] pid={} | {} | io={} | music={} | volume={:.2} | pan={}",
            client.client_id,
            client.process_id,
            client.bundle_id_str().unwrap_or("-"),
            if client.doing_io { "yes" } else { "no" },
            if client.is_music_player { "yes" } else { "no" },
            client.relative_volume,
            client.pan_position,
        );
    }
    if !status.app_volumes.is_empty() {
        println!("App volumes:");
        for record in &status.app_volumes {
            println!(
                "  {} | volume={:?} | pan={:?}",
                record.bundle_id.as_deref().unwrap_or("-"),
                record.relative_volume,
                record.pan_position,
            );
        }
    }
    Ok(())
}

fn main() {
    let mut args = env::args().skip(1);
    if let Some(arg) = args.next() {
        match arg.as_str() {
            "--status" | "-s" => {
                if let Err(err) = print_status() {
                    eprintln!("volumectl: {err}");
                    process::exit(1);
                }
                return;
            }
            "--help" | "-h" => {
                println!(
                    "Usage: volumectl [--status]\n\nWithout arguments the interactive console launches."
                );
                return;
            }
            other => {
                eprintln!("volumectl: unknown argument '{other}'");
                process::exit(1);
            }
        }
    }

    if let Err(err) = volume_kit::control::ui::run() {
        eprintln!("volumectl: {err}");
        process::exit(1);
    }
}
