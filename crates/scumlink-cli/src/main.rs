//! ScumLink command line front end
//!
//! Finds the Scumbelina battery meter on a serial port (or a file pair),
//! then sets its clock, reads or writes its configuration, or downloads its
//! log.
//!
//! Usage:
//!   scumlink ports
//!   scumlink --port /dev/ttyACM0 set-time
//!   scumlink --config scumlink.json get-config
//!   scumlink --inbound rx.bin --outbound tx.bin download --output log.jsonl

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use scumlink_core::prelude::*;
use scumlink_core::protocol::{ChannelInvoker, Job};
use scumlink_core::transport::{list_ports, FileSettings};

/// Talk to a Scumbelina battery meter
#[derive(Parser, Debug)]
#[command(name = "scumlink", version, about)]
struct Cli {
    /// JSON link configuration; defaults apply when omitted
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Serial port to try first (e.g. /dev/ttyACM0, COM3)
    #[arg(long)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Assert DTR after opening the port
    #[arg(long)]
    dtr: bool,

    /// Use a file pair instead of a serial port: file the device writes to
    #[arg(long, requires = "outbound")]
    inbound: Option<PathBuf>,

    /// File pair: file the device reads from
    #[arg(long, requires = "inbound")]
    outbound: Option<PathBuf>,

    /// Enable the connection watchdog
    #[arg(long)]
    watchdog: bool,

    /// Give up if no meter answers within this many seconds
    #[arg(long, default_value_t = 30)]
    connect_timeout: u64,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// List serial ports
    Ports,
    /// Write the effective configuration to a file
    InitConfig {
        /// Destination path
        path: PathBuf,
    },
    /// Find the meter and report where it is
    Identify,
    /// Set the meter clock to the current time
    SetTime {
        /// Use UTC instead of local time
        #[arg(long)]
        utc: bool,
    },
    /// Print the meter configuration as JSON
    GetConfig,
    /// Write the meter configuration
    SetConfig {
        /// JSON file holding a meter configuration; factory defaults when omitted
        file: Option<PathBuf>,
    },
    /// Download logged samples as JSON lines
    Download {
        /// First Unix timestamp to include
        #[arg(long, default_value_t = 0)]
        start: u32,
        /// Last Unix timestamp to include
        #[arg(long, default_value_t = 999_999)]
        end: u32,
        /// Output file; stdout when omitted
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Stop after this many seconds without a sample
        #[arg(long, default_value_t = 10)]
        idle_timeout: u64,
    },
    /// Print protocol traffic until interrupted or the time runs out
    Monitor {
        /// Seconds to listen
        #[arg(long, default_value_t = 60)]
        seconds: u64,
    },
}

/// Configuration from the file (or defaults) with command line overrides
fn effective_config(cli: &Cli) -> Result<LinkConfig> {
    let mut config = match &cli.config {
        Some(path) => LinkConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => LinkConfig::default(),
    };

    if let (Some(inbound), Some(outbound)) = (&cli.inbound, &cli.outbound) {
        config.transport = TransportConfig::File(FileSettings {
            inbound: inbound.clone(),
            outbound: outbound.clone(),
        });
    } else if cli.port.is_some() || cli.baud.is_some() || cli.dtr {
        let TransportConfig::Serial(serial) = &mut config.transport else {
            bail!("--port, --baud and --dtr need a serial transport");
        };
        if let Some(port) = &cli.port {
            serial.port_name = port.clone();
        }
        if let Some(baud) = cli.baud {
            serial.baud_rate = baud;
        }
        serial.dtr_enable |= cli.dtr;
    }

    config.connection.watchdog.enabled |= cli.watchdog;
    Ok(config)
}

/// A running link: messenger, connection manager and the callback queue
struct Session {
    manager: ConnectionManager,
    meter: MeterClient,
    jobs: Receiver<Job>,
}

impl Session {
    fn open(config: &LinkConfig) -> Result<Self> {
        let format = config.frame.to_format()?;
        let messenger = Arc::new(Messenger::new(config.transport.build(), format)?);

        let (invoker, jobs) = ChannelInvoker::new();
        messenger.dispatcher().set_invoker(Arc::new(invoker));
        messenger.events().subscribe(|event| match event {
            MessengerEvent::LineSent(cmd) => debug!("Sent > {}", cmd),
            MessengerEvent::LineReceived(cmd) => debug!("Received > {}", cmd),
        });

        let manager = ConnectionManager::new(messenger.clone(), config.connection.clone());
        let meter = MeterClient::new(messenger);
        Ok(Self {
            manager,
            meter,
            jobs,
        })
    }

    /// Start the manager and block until the meter answers
    fn connect(&self, timeout: Duration) -> Result<String> {
        let (found_tx, found_rx) = mpsc::channel();
        self.manager.events().subscribe(move |event| match event {
            ConnectionEvent::Progress { description, level } if level.is_status() => {
                info!("{}", description)
            }
            ConnectionEvent::Progress { description, .. } => debug!("{}", description),
            ConnectionEvent::Found { endpoint } => {
                let _ = found_tx.send(endpoint.clone());
            }
            ConnectionEvent::Lost => warn!("Connection timeout, attempting to reconnect"),
            ConnectionEvent::StateChanged { .. } => {}
        });

        self.manager.start()?;
        found_rx
            .recv_timeout(timeout)
            .with_context(|| format!("no meter answered within {} s", timeout.as_secs()))
    }

    /// Run queued callbacks until `done` says stop or `idle` passes without one
    fn pump(&self, idle: Duration, mut done: impl FnMut() -> bool) {
        let mut last = Instant::now();
        while !done() {
            match self.jobs.recv_timeout(Duration::from_millis(50)) {
                Ok(job) => {
                    job();
                    last = Instant::now();
                }
                Err(mpsc::RecvTimeoutError::Timeout) if last.elapsed() < idle => {}
                Err(_) => break,
            }
        }
    }
}

fn download(
    session: &Session,
    start: u32,
    end: u32,
    output: Option<PathBuf>,
    idle: Duration,
) -> Result<usize> {
    let mut out: Box<dyn Write> = match &output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(io::stdout().lock()),
    };

    let (tx, rx) = mpsc::channel();
    session.meter.attach_download_handlers();
    session.meter.events().subscribe(move |event| {
        let _ = tx.send(event.clone());
    });

    if !session.meter.request_data_download(start, end) {
        bail!("meter did not start the download");
    }

    let mut count = 0usize;
    let mut finished = false;
    let mut failure = None;
    session.pump(idle, || {
        for event in rx.try_iter() {
            match event {
                DownloadEvent::Item(sample) => {
                    match serde_json::to_string(&sample) {
                        Ok(line) => {
                            if let Err(e) = writeln!(out, "{}", line) {
                                failure = Some(e.to_string());
                            }
                        }
                        Err(e) => failure = Some(e.to_string()),
                    }
                    count += 1;
                }
                DownloadEvent::Completed => finished = true,
                DownloadEvent::DeviceError => {
                    failure = Some("meter reported an error".to_string())
                }
                DownloadEvent::Notice(text) => debug!("{}", text),
                DownloadEvent::Started => {}
            }
        }
        finished || failure.is_some()
    });

    out.flush()?;
    if let Some(reason) = failure {
        bail!("download failed after {} samples: {}", count, reason);
    }
    if !finished {
        warn!("download went quiet before completing");
    }
    Ok(count)
}

fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Action::Ports => {
            for port in list_ports() {
                match (port.vid, port.pid) {
                    (Some(vid), Some(pid)) => println!(
                        "{} [{:04x}:{:04x}] {}",
                        port.name,
                        vid,
                        pid,
                        port.product.unwrap_or_default()
                    ),
                    _ => println!("{}", port.name),
                }
            }
            return Ok(());
        }
        Action::InitConfig { path } => {
            effective_config(&cli)?
                .save(path)
                .with_context(|| format!("writing {}", path.display()))?;
            info!("wrote {}", path.display());
            return Ok(());
        }
        _ => {}
    }

    let config = effective_config(&cli)?;
    let session = Session::open(&config)?;
    let endpoint = session.connect(Duration::from_secs(cli.connect_timeout))?;
    info!("meter found on {}", endpoint);

    match cli.command {
        Action::Ports | Action::InitConfig { .. } => {}
        Action::Identify => println!("{}", endpoint),
        Action::SetTime { utc } => {
            let now = if utc {
                Utc::now().naive_utc()
            } else {
                Local::now().naive_local()
            };
            if !session.meter.set_date_time(now) {
                bail!("meter did not acknowledge the new time");
            }
            println!("clock set to {}", now.format("%Y-%m-%d %H:%M:%S"));
        }
        Action::GetConfig => {
            let settings = session
                .meter
                .get_configuration()
                .context("meter did not send its configuration")?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Action::SetConfig { file } => {
            let settings = match file {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_str(&text)
                        .with_context(|| format!("parsing {}", path.display()))?
                }
                None => MeterConfiguration::default(),
            };
            if !session.meter.set_configuration(&settings)? {
                bail!("meter did not acknowledge the configuration");
            }
            println!("configuration written");
        }
        Action::Download {
            start,
            end,
            output,
            idle_timeout,
        } => {
            let count = download(
                &session,
                start,
                end,
                output,
                Duration::from_secs(idle_timeout),
            )?;
            info!("downloaded {} samples", count);
        }
        Action::Monitor { seconds } => {
            session.meter.attach_download_handlers();
            session.meter.events().subscribe(|event| info!("{:?}", event));
            let until = Instant::now() + Duration::from_secs(seconds);
            session.pump(Duration::from_secs(seconds), || Instant::now() >= until);
        }
    }

    session.manager.stop();
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    run(Cli::parse())
}
