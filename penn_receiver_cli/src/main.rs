use clap::{value_parser, Arg, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use libpenn_receiver::config::ReceiverConfig;
use libpenn_receiver::emulator::{EmulatorConfig, MicrosliceEmulator};
use libpenn_receiver::millislice::MillisliceReader;
use libpenn_receiver::receiver::MillisliceReceiver;

fn make_template_config(path: &Path) {
    let config = ReceiverConfig::default();
    match config.write_config_file(path) {
        Ok(()) => log::info!("Done."),
        Err(e) => log::error!("Could not write template config: {e}"),
    }
}

fn path_arg() -> Arg {
    Arg::new("path")
        .short('p')
        .long("path")
        .required(true)
        .help("Path to the configuration file")
}

fn init_logging(level: simplelog::LevelFilter) -> MultiProgress {
    let logger = simplelog::TermLogger::new(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");
    pb_manager
}

/// Run the receiver the way a DAQ host would: consume every filled millislice and hand the
/// buffer straight back
fn receive(config: ReceiverConfig, seconds: u64, pb_manager: &MultiProgress) {
    let reporting_interval = config.reporting_interval_millislices;
    let dump = config.debug_level >= 2;
    let mut receiver = match MillisliceReceiver::new(config) {
        Ok(r) => r,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    if let Err(e) = receiver.start() {
        log::error!("{e}");
        return;
    }

    let pb = if seconds > 0 {
        pb_manager.add(ProgressBar::new(seconds))
    } else {
        pb_manager.add(ProgressBar::new_spinner())
    };
    if let Ok(style) = ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {msg}") {
        pb.set_style(style);
    }

    let start = Instant::now();
    let mut millislices: u64 = 0;
    let mut bytes: u64 = 0;
    loop {
        if let Some(buffer) = receiver.retrieve_filled_buffer(Duration::from_millis(100)) {
            millislices += 1;
            bytes += buffer.len() as u64;
            if let Some(meta) = buffer.metadata() {
                if reporting_interval > 0 && millislices % reporting_interval == 0 {
                    log::info!(
                        "Millislice {} ends at tick {} with {} microslices and {} payloads, {} empty buffers left",
                        meta.sequence_id,
                        meta.end_timestamp,
                        meta.microslice_count,
                        meta.payload_count(),
                        receiver.empty_buffers_available()
                    );
                }
            }
            if dump {
                for unit in MillisliceReader::new(buffer.data()) {
                    match unit {
                        Ok(u) => log::trace!(
                            "  microslice {} size {} words {}",
                            u.header.sequence_id,
                            u.header.block_size,
                            u.words.len()
                        ),
                        Err(e) => log::error!("Malformed millislice content: {e}"),
                    }
                }
            }
            if let Err(e) = receiver.commit_empty_buffer(buffer) {
                log::error!("{e}");
            }
            pb.set_message(format!(
                "{} millislices, {}",
                millislices,
                human_bytes::human_bytes(bytes as f64)
            ));
        }

        if receiver.has_failed() {
            log::error!("Receiver readout failed, stopping.");
            break;
        }
        let elapsed = start.elapsed();
        if seconds > 0 {
            pb.set_position(elapsed.as_secs().min(seconds));
            if elapsed.as_secs() >= seconds {
                break;
            }
        } else {
            pb.tick();
        }
    }

    pb.finish();
    if let Err(e) = receiver.stop() {
        log::error!("{e}");
    }
    let dropped = receiver.release_filled_buffers();
    if dropped > 0 {
        log::warn!("Released {dropped} filled buffers that were never consumed");
    }
    receiver.release_empty_buffers();
}

fn emulate(matches: &ArgMatches, pb_manager: &MultiProgress) {
    let host = matches
        .get_one::<String>("host")
        .cloned()
        .unwrap_or_else(|| String::from("127.0.0.1"));
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8989);
    let count = matches.get_one::<u64>("count").copied().unwrap_or(1000);
    let rate = matches.get_one::<f64>("rate").copied().unwrap_or(1000.0);
    let config = EmulatorConfig {
        ticks_per_microslice: matches.get_one::<u32>("ticks").copied().unwrap_or(10),
        fragment_at_ticks: matches.get_one::<u32>("fragment").copied().unwrap_or(0),
        ..Default::default()
    };

    let addr: SocketAddr = match format!("{host}:{port}").parse() {
        Ok(a) => a,
        Err(e) => {
            log::error!("Bad receiver address {host}:{port}: {e}");
            return;
        }
    };
    let mut emulator = match MicrosliceEmulator::new(config) {
        Ok(e) => e,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };

    let pb = pb_manager.add(ProgressBar::new(count));
    match emulator.send_stream(addr, count, rate, |sent| pb.set_position(sent)) {
        Ok(_) => log::info!("Emulation complete."),
        Err(e) => log::error!("Emulation failed with error: {e}"),
    }
    pb.finish();
}

fn main() {
    // Create a cli
    let matches = Command::new("penn_receiver_cli")
        .arg_required_else_help(true)
        .subcommand(
            Command::new("new")
                .about("Make a template configuration yaml file")
                .arg(path_arg()),
        )
        .subcommand(
            Command::new("receive")
                .about("Run the receiver and consume millislices")
                .arg(path_arg())
                .arg(
                    Arg::new("seconds")
                        .short('s')
                        .long("seconds")
                        .value_parser(value_parser!(u64))
                        .default_value("0")
                        .help("Stop after this many seconds. 0 runs until the receiver fails"),
                ),
        )
        .subcommand(
            Command::new("emulate")
                .about("Send an emulated board stream to a receiver")
                .arg(Arg::new("host").long("host").default_value("127.0.0.1"))
                .arg(
                    Arg::new("port")
                        .long("port")
                        .value_parser(value_parser!(u16))
                        .default_value("8989"),
                )
                .arg(
                    Arg::new("count")
                        .short('n')
                        .long("count")
                        .value_parser(value_parser!(u64))
                        .default_value("1000")
                        .help("Number of microslices to send"),
                )
                .arg(
                    Arg::new("rate")
                        .short('r')
                        .long("rate")
                        .value_parser(value_parser!(f64))
                        .default_value("1000")
                        .help("Microslices per second. 0 sends as fast as possible"),
                )
                .arg(
                    Arg::new("ticks")
                        .long("ticks")
                        .value_parser(value_parser!(u32))
                        .default_value("10")
                        .help("Counter words per microslice"),
                )
                .arg(
                    Arg::new("fragment")
                        .long("fragment-at")
                        .value_parser(value_parser!(u32))
                        .default_value("0")
                        .help("Fragment each microslice after this many ticks. 0 disables"),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("new", sub)) => {
            let _ = init_logging(simplelog::LevelFilter::Info);
            let config_path = PathBuf::from(sub.get_one::<String>("path").expect("We require args"));
            log::info!(
                "Making a template config at {}...",
                config_path.to_string_lossy()
            );
            make_template_config(&config_path);
        }
        Some(("receive", sub)) => {
            let config_path = PathBuf::from(sub.get_one::<String>("path").expect("We require args"));
            let seconds = sub.get_one::<u64>("seconds").copied().unwrap_or(0);
            // Load our config before the logger so its debug level applies
            let config = ReceiverConfig::read_config_file(&config_path);
            let level = match &config {
                Ok(c) => c.log_level(),
                Err(_) => simplelog::LevelFilter::Info,
            };
            let pb_manager = init_logging(level);
            log::info!("Loading config from {}...", config_path.to_string_lossy());
            let config = match config {
                Ok(c) => c,
                Err(e) => {
                    log::error!("{e}");
                    return;
                }
            };
            log::info!("Config successfully loaded.");
            log::info!("Receive port: {}", config.receive_port);
            log::info!(
                "Millislice width: {} ticks ({:.3} ms), overlap {} ticks",
                config.millislice_width_ticks,
                config.millislice_duration() * 1000.0,
                config.millislice_overlap_ticks
            );
            log::info!(
                "Buffer pool: {} x {}",
                config.buffer_pool_capacity,
                human_bytes::human_bytes(config.raw_buffer_size as f64)
            );
            receive(config, seconds, &pb_manager);
            log::info!("Done.");
        }
        Some(("emulate", sub)) => {
            let pb_manager = init_logging(simplelog::LevelFilter::Info);
            emulate(sub, &pb_manager);
        }
        _ => (),
    }
}
