use camlink::config::BusConfig;
use camlink::session::{CaptureController, PeripheralPhase, SessionReport};
use camlink::sim;
use camlink::storage::{DirStorage, Storage};
use clap::{App, Arg};
use colored::*;
use std::io::{BufRead, Write};
use std::path::Path;

const DEFAULT_OUTPUT_DIR: &str = "captured_images";
const DEFAULT_IMAGE_SIZE: &str = "245760";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("camlink")
        .version("0.1.0")
        .about("📷 Multi-camera capture controller for a shared serial bus")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Bus configuration file (JSON); defaults to the five-camera rig")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("output")
                .short("o")
                .long("output")
                .value_name("DIR")
                .help("Directory for assembled images")
                .takes_value(true)
                .default_value(DEFAULT_OUTPUT_DIR),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Report output format")
                .takes_value(true)
                .possible_values(&["table", "json"])
                .default_value("table"),
        )
        .arg(
            Arg::with_name("image-size")
                .long("image-size")
                .value_name("BYTES")
                .help("Simulated image size per camera")
                .takes_value(true)
                .default_value(DEFAULT_IMAGE_SIZE)
                .validator(|v| {
                    v.parse::<usize>()
                        .map(|_| ())
                        .map_err(|_| "must be a number".into())
                }),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => BusConfig::from_json_file(Path::new(path))?,
        None => BusConfig::default(),
    };
    let output_dir = matches.value_of("output").unwrap_or(DEFAULT_OUTPUT_DIR);
    let json_output = matches.value_of("format") == Some("json");
    let image_size: usize = matches
        .value_of("image-size")
        .unwrap_or(DEFAULT_IMAGE_SIZE)
        .parse()?;

    println!("📷 Multi-Camera Capture Controller");
    println!("==================================");
    println!(
        "{} peripheral(s) on the bus, {} byte transactions, images to {}",
        config.peripherals.len(),
        config.transaction_size,
        output_dir
    );
    println!("Commands: start | status | quit");

    let (arbiter, _rig) = sim::build_rig(&config, image_size);
    let mut controller = CaptureController::new(arbiter, &config);
    let mut storage = DirStorage::new(output_dir);

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        match line.trim() {
            "start" => {
                println!("Starting capture session...");
                let report = controller.start().clone();
                store_images(&report, &mut storage);
                print_report(&report, json_output)?;
            }
            "status" => match controller.status() {
                Some(report) => {
                    let report = report.clone();
                    print_report(&report, json_output)?;
                }
                None => println!("{}", "no capture session has run yet".yellow()),
            },
            "quit" | "exit" => break,
            "" => {}
            other => {
                println!(
                    "{} unknown command {:?}; try start, status, or quit",
                    "error:".red(),
                    other
                );
            }
        }
    }

    println!("Controller stopped");
    Ok(())
}

fn store_images(report: &SessionReport, storage: &mut dyn Storage) {
    for p in &report.peripherals {
        if let Some(image) = &p.image {
            match storage.save(p.id, report.session_id, &image.payload) {
                Ok(path) => println!("  saved {} -> {}", p.id, path.display()),
                Err(e) => println!("  {} storing {}: {}", "error".red(), p.id, e),
            }
        }
    }
}

fn print_report(report: &SessionReport, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let outcome = format!("{:?}", report.outcome);
    let outcome = match report.outcome {
        camlink::SessionOutcome::Complete => outcome.as_str().green(),
        camlink::SessionOutcome::PartiallyComplete => outcome.as_str().yellow(),
        camlink::SessionOutcome::Failed => outcome.as_str().red(),
    };
    println!(
        "Session {} finished in {} ms: {}",
        report.session_id, report.elapsed_ms, outcome
    );

    for p in &report.peripherals {
        let phase = format!("{:?}", p.phase);
        let phase = match p.phase {
            PeripheralPhase::Complete => phase.as_str().green(),
            PeripheralPhase::Failed => phase.as_str().red(),
            _ => phase.as_str().yellow(),
        };
        let chunks = match p.chunks_expected {
            Some(expected) => format!("{}/{}", p.chunks_received, expected),
            None => format!("{}/?", p.chunks_received),
        };
        match &p.error {
            Some(error) => println!(
                "  {:<14} {:<10} chunks {:<12} {}",
                p.id.to_string(),
                phase,
                chunks,
                error.as_str().red()
            ),
            None => println!("  {:<14} {:<10} chunks {}", p.id.to_string(), phase, chunks),
        }
    }
    Ok(())
}
