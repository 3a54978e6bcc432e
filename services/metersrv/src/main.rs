//! metersrv - electricity meter acquisition service

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio::time::Instant;
use tracing::info;

use common::service_bootstrap::{self, ServiceInfo};
use common::wait_for_shutdown;
use errors::{log_service_error, ServiceErrorTrait};
use metersrv::{
    config::{MeterSrvConfig, OutputFormat},
    error::StorageError,
    read_all, record,
    scheduler::wall_clock_epoch,
    status::{indicator_from_config, FatalKind},
    transport::discover_serial_port,
    BusLock, CycleOptions, FileSink, MeterSrvError, ModbusRtuTransport, RegisterMap,
    ScheduleState, Scheduler, ServiceContext, StatusPanel, Transport, SERVICE_NAME,
    SERVICE_VERSION,
};

/// Command-line arguments for metersrv
#[derive(Parser, Debug)]
#[command(
    name = "metersrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Time-synced electricity meter acquisition",
    long_about = None
)]
struct Args {
    /// Configuration file (default: config/metersrv.yaml)
    #[arg(short = 'c', long, env = "METERSRV_CONFIG")]
    config: Option<PathBuf>,

    /// Validation mode - load and check the configuration, then exit
    #[arg(long)]
    validate: bool,

    /// Read the meter once, print the record to stdout and exit
    /// (non-zero when no field could be read)
    #[arg(long)]
    once: bool,

    /// Override the configured output format
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        },
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            let code = e
                .downcast_ref::<MeterSrvError>()
                .map(|e| e.exit_code())
                .unwrap_or(1);
            ExitCode::from(code.clamp(1, 255) as u8)
        },
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = MeterSrvConfig::load(args.config.as_deref()).map_err(MeterSrvError::from)?;

    let service = ServiceInfo::new(
        SERVICE_NAME,
        SERVICE_VERSION,
        "Time-synced electricity meter acquisition",
    );
    service_bootstrap::init_logging(&service, &config.logging, !args.no_color)
        .context("failed to initialize logging")?;
    if !args.no_color {
        service_bootstrap::print_startup_banner(&service);
    }

    config.validate().map_err(MeterSrvError::from)?;
    let map = config
        .meter
        .load_register_map()
        .map_err(MeterSrvError::from)?;
    info!("Meter model {} ({} fields)", map.model(), map.len());

    if args.validate {
        info!("Validation completed successfully");
        return Ok(());
    }

    let mut options = CycleOptions::from_config(&config);
    if let Some(format) = args.format {
        options.format = format;
    }

    if args.once {
        let mut transport = open_transport(&config)?;
        let lock = BusLock::from_config(&config.bus_lock).map_err(MeterSrvError::from)?;
        read_once(&map, transport.as_mut(), &lock, &options).await?;
        return Ok(());
    }

    let mut panel = StatusPanel::new(indicator_from_config(&config.status)?);
    panel.startup().await;

    let (transport, lock, sink) = match open_resources(&config, &map, options.format) {
        Ok(resources) => resources,
        Err(e) => {
            log_service_error("Startup failed", &e);
            panel.fatal(FatalKind::from(&e)).await;
            return Err(e.into());
        },
    };

    let epoch = if config.schedule.align_to_wall_clock {
        wall_clock_epoch(config.schedule.period)
    } else {
        Instant::now()
    };
    let ctx = ServiceContext::new(map, transport, lock, sink, panel, options);
    let mut scheduler = Scheduler::new(ctx, ScheduleState::new(config.schedule.period, epoch));

    let fatal = tokio::select! {
        result = scheduler.run() => result.err(),
        signal = wait_for_shutdown() => {
            info!("Received {}, shutting down", signal);
            None
        },
    };
    scheduler.shutdown(fatal.as_ref()).await;

    match fatal {
        Some(e) => {
            log_service_error("Fatal", &e);
            Err(e.into())
        },
        None => {
            info!("{} stopped", SERVICE_NAME);
            Ok(())
        },
    }
}

fn open_transport(config: &MeterSrvConfig) -> Result<Box<dyn Transport>, MeterSrvError> {
    let port = discover_serial_port(config.serial.port.as_deref())?;
    let transport = ModbusRtuTransport::open(&port, &config.serial, config.meter.slave_id)?;
    Ok(Box::new(transport))
}

#[allow(clippy::type_complexity)]
fn open_resources(
    config: &MeterSrvConfig,
    map: &RegisterMap,
    format: OutputFormat,
) -> Result<(Box<dyn Transport>, BusLock, Box<dyn metersrv::Sink>), MeterSrvError> {
    let transport = open_transport(config)?;
    let lock = BusLock::from_config(&config.bus_lock)?;
    info!(
        "Bus lock '{}' ({:?}, timeout {:?})",
        lock.name(),
        config.bus_lock.backend,
        config.bus_lock.effective_timeout()
    );
    let sink = FileSink::create(&config.output.dir, format, map)?;
    Ok((transport, lock, Box::new(sink)))
}

/// Single reading to stdout
async fn read_once(
    map: &RegisterMap,
    transport: &mut dyn Transport,
    lock: &BusLock,
    options: &CycleOptions,
) -> Result<(), MeterSrvError> {
    let mut guard = lock.acquire(&options.identity, options.bus_timeout).await?;
    let reading = read_all(map, transport, Utc::now()).await;
    guard.release()?;

    let mut out = Vec::new();
    if options.format == OutputFormat::Csv {
        out.extend(record::csv_header(map)?);
    }
    out.extend(record::encode(&reading, options.format)?);
    std::io::stdout()
        .write_all(&out)
        .map_err(StorageError::Write)?;

    match reading.total_failure() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
