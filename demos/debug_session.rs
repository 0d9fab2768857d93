//! Connect to the simulated debug device and print sensor data.
//!
//! Usage: cargo run --example debug_session
//! Set RUST_LOG=debug to watch the connection phases.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use wearable::{
    ConnectCallbacks, ConnectionStatus, DebugProvider, Device, DeviceConfig, GestureId, SensorId,
    SensorUpdateInterval, SessionEvent, WearableContext, WearableSession,
};

const RUN_FOR: Duration = Duration::from_secs(15);
const TICK: Duration = Duration::from_millis(16);

fn main() {
    env_logger::init();

    let ctx = WearableContext::system();
    let mut session = WearableSession::new(ctx.clone(), Box::new(DebugProvider::new(ctx)));
    let events = session.subscribe();

    session.register_requirement(
        DeviceConfig::disabled()
            .with_sensor(SensorId::RotationSixDof)
            .with_sensor(SensorId::Accelerometer)
            .with_interval(SensorUpdateInterval::EightyMs),
    );
    session.register_requirement(
        DeviceConfig::disabled()
            .with_gesture(GestureId::DoubleTap)
            .with_gesture(GestureId::HeadNod),
    );

    let found: Arc<Mutex<Vec<Device>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = found.clone();
    session.search_for_devices(
        move |devices: &[Device]| {
            if let Ok(mut found) = sink.lock() {
                found.extend_from_slice(devices);
            }
        },
        false,
    );
    println!("Searching for devices...");

    let start = Instant::now();
    let mut frames: u64 = 0;
    while start.elapsed() < RUN_FOR {
        session.update();

        if session.connection_status() == ConnectionStatus::Searching {
            let first = found.lock().ok().and_then(|f| f.first().cloned());
            if let Some(device) = first {
                println!("Found {} (rssi {})", device.name, device.rssi);
                session.connect_to_device(
                    device,
                    ConnectCallbacks::new()
                        .on_success(|| println!("Connected"))
                        .on_failure(|| eprintln!("Connection failed")),
                );
            }
        }

        for event in events.drain() {
            match event {
                SessionEvent::ConnectionStatusChanged { status, .. } => {
                    println!("status: {:?}", status);
                }
                SessionEvent::SensorsUpdated(frame) => {
                    frames += 1;
                    if frames % 10 == 1 {
                        let q = frame.rotation_six_dof.value;
                        let a = frame.acceleration.value;
                        println!(
                            "t={:<8.3} quat=[{:+.3}, {:+.3}, {:+.3}, {:+.3}]  accel=[{:+.3}, {:+.3}, {:+.3}]",
                            frame.timestamp, q.x, q.y, q.z, q.w, a.x, a.y, a.z,
                        );
                    }
                }
                SessionEvent::GestureDetected(gesture) => println!("gesture: {:?}", gesture),
                SessionEvent::ConfigurationSucceeded => {
                    println!("device configured: {}", session.resolver().final_config());
                }
                SessionEvent::ConfigurationFailed { sensor, gesture } => {
                    eprintln!("configuration failed: sensor={:?} gesture={:?}", sensor, gesture);
                }
                _ => {}
            }
        }

        std::thread::sleep(TICK);
    }

    session.shutdown();
    println!("\nTotal: {} frames in {:.1}s", frames, start.elapsed().as_secs_f64());
}
