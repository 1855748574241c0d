use camlink::agent::PeripheralAgent;
use camlink::config::{PeripheralId, DEFAULT_CHUNK_PAYLOAD_SIZE, DEFAULT_TRANSACTION_SIZE};
use camlink::frame::{CommandOp, Frame, StatusCode};
use camlink::packet::PacketAssembler;
use camlink::sim::SimCamera;
use clap::{App, Arg};
use colored::*;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const DEFAULT_IMAGE_SIZE: &str = "245760";
const READY_WAIT: Duration = Duration::from_secs(5);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("camlink-peripheral")
        .version("0.1.0")
        .about("📸 Camera peripheral agent exerciser")
        .arg(
            Arg::with_name("slave-id")
                .long("slave-id")
                .value_name("ID")
                .help("Peripheral identity (1-255)")
                .takes_value(true)
                .required(true)
                .validator(|v| match v.parse::<u8>() {
                    Ok(id) if id > 0 => Ok(()),
                    _ => Err("id must be between 1 and 255".into()),
                }),
        )
        .arg(
            Arg::with_name("spi-bus")
                .long("spi-bus")
                .value_name("BUS")
                .help("Bus number the agent is attached to")
                .takes_value(true)
                .default_value("0"),
        )
        .arg(
            Arg::with_name("spi-device")
                .long("spi-device")
                .value_name("DEV")
                .help("Device number on the bus")
                .takes_value(true)
                .default_value("0"),
        )
        .arg(
            Arg::with_name("image-size")
                .long("image-size")
                .value_name("BYTES")
                .help("Simulated image size")
                .takes_value(true)
                .default_value(DEFAULT_IMAGE_SIZE),
        )
        .get_matches();

    let id = PeripheralId(matches.value_of("slave-id").unwrap_or("1").parse()?);
    let spi_bus: u8 = matches.value_of("spi-bus").unwrap_or("0").parse()?;
    let spi_device: u8 = matches.value_of("spi-device").unwrap_or("0").parse()?;
    let image_size: usize = matches
        .value_of("image-size")
        .unwrap_or(DEFAULT_IMAGE_SIZE)
        .parse()?;

    println!("📸 Camera Peripheral Agent");
    println!("==========================");
    println!("{id} on bus {spi_bus} device {spi_device}, {image_size} byte image");

    let mut agent = PeripheralAgent::new(
        id,
        DEFAULT_CHUNK_PAYLOAD_SIZE,
        DEFAULT_TRANSACTION_SIZE,
        Arc::new(Mutex::new(SimCamera::new(id, image_size))),
    );

    // Exercise the full protocol path locally: command, poll, stream,
    // reassemble, verify.
    let session = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let reply = agent.handle_frame(&Frame::command(CommandOp::Capture, session));
    println!("capture command -> {reply:?}");

    let started = Instant::now();
    loop {
        agent.update();
        let reply = agent.handle_frame(&Frame::command(CommandOp::QueryReady, session));
        match reply {
            Frame::Status { code: StatusCode::Ready, .. } => break,
            Frame::Status { code: StatusCode::NotReady, .. } => {
                if started.elapsed() > READY_WAIT {
                    println!("{}", "capture never became ready".red());
                    std::process::exit(1);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            other => {
                println!("{} unexpected readiness reply: {other:?}", "error:".red());
                std::process::exit(1);
            }
        }
    }
    println!("ready after {} ms", started.elapsed().as_millis());

    let mut assembler = PacketAssembler::new();
    let mut index = 0u16;
    loop {
        let reply = agent.handle_frame(&Frame::command(CommandOp::RequestChunk { index }, session));
        match reply {
            Frame::Chunk(chunk) => {
                let total = chunk.total;
                assembler.offer(chunk)?;
                index += 1;
                if index >= total {
                    break;
                }
            }
            other => {
                println!("{} unexpected chunk reply: {other:?}", "error:".red());
                std::process::exit(1);
            }
        }
    }

    let image = assembler.assemble()?;
    if image == SimCamera::expected_image(id, image_size) {
        println!(
            "{} streamed and reassembled {} bytes in {} chunks",
            "OK:".green(),
            image.len(),
            index
        );
        Ok(())
    } else {
        println!("{} reassembled image does not match capture", "FAIL:".red());
        std::process::exit(1);
    }
}
