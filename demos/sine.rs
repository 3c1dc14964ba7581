//! Plays a 440Hz sine on an output device
//!
//! Run with: cargo run --example sine --features cpal_backend -- [device index] [seconds]
//!
//! Without the cpal feature the sine goes to the dummy backend, which is quiet but
//! still paced in real time.

use std::thread;
use std::time::Duration;

use dasp_signal::Signal;
use soundout::{AudioContext, ErrorCode};

fn main() -> soundout::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let index: Option<usize> = args.next().and_then(|a| a.parse().ok());
    let seconds: f64 = args.next().and_then(|a| a.parse().ok()).unwrap_or(2.0);

    let mut ctx = AudioContext::create()?;
    ctx.connect()?;
    let index = match index {
        Some(index) => index,
        None => ctx.default_output_device_index()?,
    };
    let device = ctx.output_device(index)?;
    println!("Using: {} on {}", device.name(), ctx.backend_name().unwrap_or("?"));

    let mut stream = device.create_output_stream()?;
    stream.set_name("sine demo")?;

    let rate = device.nearest_sample_rate(48000).unwrap_or(48000);
    let mut signal = dasp_signal::rate(f64::from(rate)).const_hz(440.0).sine();
    stream.set_sample_rate(rate)?;
    stream.set_write_callback(move |out, _min, max| {
        let mut current = 0.0f32;
        out.write_frames(max, |_frame, channel| {
            if channel == 0 {
                current = signal.next() as f32 * 0.25;
            }
            current
        });
    })?;
    stream.open()?;

    let format = stream.format().cloned();
    if let Some(format) = format {
        println!(
            "Playing {} Hz, {}, {} channels, period {} frames",
            format.sample_rate,
            format.sample_format.name(),
            format.channels(),
            format.period_frames
        );
    }

    let token = stream.stop_token();
    thread::spawn(move || {
        thread::sleep(Duration::from_secs_f64(seconds));
        token.stop();
    });

    match stream.run() {
        Ok(()) => {}
        Err(e) if e.code() == ErrorCode::BackendDisconnected => {
            eprintln!("device went away: {e}");
        }
        Err(e) => return Err(e),
    }

    let stats = stream.stats();
    println!(
        "{} callbacks, {} frames, {} underflows",
        stats.callbacks, stats.frames_written, stats.underflows
    );

    stream.destroy();
    device.release();
    ctx.destroy()
}
