//! Lists output devices and what they support
//!
//! Run with: cargo run --example list_devices --features cpal_backend

use soundout::AudioContext;

fn main() -> soundout::Result<()> {
    tracing_subscriber::fmt::init();

    let mut ctx = AudioContext::create()?;
    ctx.connect()?;
    println!("backend: {}", ctx.backend_name().unwrap_or("none"));

    let default = ctx.default_output_device_index().ok();
    for (i, device) in ctx.list_output_devices()?.iter().enumerate() {
        let marker = if Some(i) == default { " (default)" } else { "" };
        println!("[{}] {}{}", i, device.name(), marker);
        println!("    id: {}  raw: {}", device.id(), device.is_raw());

        let formats: Vec<_> = device.formats().iter().map(|f| f.name()).collect();
        println!("    formats: {}", formats.join(", "));

        let rates: Vec<_> = device
            .sample_rates()
            .iter()
            .map(|r| {
                if r.min == r.max {
                    format!("{}", r.min)
                } else {
                    format!("{}-{}", r.min, r.max)
                }
            })
            .collect();
        println!("    sample rates: {}", rates.join(", "));

        let layouts: Vec<_> = device.layouts().iter().map(|l| l.name()).collect();
        println!("    layouts: {}", layouts.join(", "));

        let (min, max) = device.software_latency_range();
        println!(
            "    current: {} @ {} Hz, {}, latency {:?} ({:?}..{:?})",
            device.current_format().name(),
            device.current_sample_rate(),
            device.current_layout().name(),
            device.software_latency(),
            min,
            max
        );
    }

    ctx.destroy()
}
