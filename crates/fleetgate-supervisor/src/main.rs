use clap::Parser;
use fleetgate_core::roster::{assigned_devices, load_roster, AssignmentPolicy};
use fleetgate_storage::SqliteStore;
use fleetgate_supervisor::fleet::FleetState;
use fleetgate_supervisor::observer::{router, spawn_broadcast, ObserverState};
use fleetgate_supervisor::pool::{supervise_device, WorkerLauncher};
use std::{
    env,
    fmt::Display,
    fs::OpenOptions,
    future::IntoFuture,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DEFAULT_ADDR: &str = "127.0.0.1:8090";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    roster: PathBuf,
    pool_size: usize,
    policy: AssignmentPolicy,
    broadcast_interval: Duration,
    prediction_frequency: u32,
    prediction_threshold: f64,
    entities_dir: String,
    db: String,
    worker_bin: PathBuf,
    classifier_cmd: String,
    hold_commands: bool,
    write_timeout: Duration,
    log_dir: String,
    debug: bool,
}

#[derive(Parser, Debug)]
#[command(name = "fleetgate-supervisor")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    roster: String,
    #[arg(long)]
    pool_size: Option<usize>,
    #[arg(long, default_value_t = AssignmentPolicy::default())]
    policy: AssignmentPolicy,
    #[arg(long)]
    broadcast_interval_ms: Option<u64>,
    #[arg(long)]
    prediction_frequency: Option<u32>,
    #[arg(long)]
    prediction_threshold: Option<f64>,
    #[arg(long, default_value = "images")]
    entities_dir: String,
    #[arg(long, default_value = "")]
    db: String,
    #[arg(long, default_value = "")]
    worker_bin: String,
    #[arg(long, default_value = "")]
    classifier_cmd: String,
    /// Keep the latest undelivered command per device until a worker takes it.
    #[arg(long, default_value_t = false)]
    hold_commands: bool,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let config = load_config(Args::parse());
    let _log_guard = init_logging(&config);
    let code = run(config).await;
    std::process::exit(code);
}

async fn run(config: Config) -> i32 {
    let roster = match load_roster(&config.roster) {
        Ok(roster) => roster,
        Err(err) => {
            error!(event = "roster_invalid", path = %config.roster.display(), error = %err);
            return 1;
        }
    };
    let addr: SocketAddr = match config.addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(event = "invalid_addr", addr = %config.addr, error = %err);
            return 1;
        }
    };

    let fleet = Arc::new(FleetState::new(roster, config.hold_commands));
    let store = match SqliteStore::open(&config.db) {
        Ok(store) => Some(Arc::new(Mutex::new(store))),
        Err(err) => {
            warn!(event = "store_open_failed", db = %config.db, error = %err);
            None
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(event = "observer_bind_failed", addr = %addr, error = %err);
            return 1;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let launcher = Arc::new(WorkerLauncher::new(
        config.worker_bin.clone(),
        worker_args(&config),
    ));
    let assigned = assigned_devices(fleet.roster().len(), config.pool_size, config.policy);
    info!(
        event = "fleet_plan",
        devices = fleet.roster().len(),
        workers = assigned.len(),
        pool_size = config.pool_size,
        policy = %config.policy
    );
    let mut supervisors = Vec::with_capacity(assigned.len());
    for index in assigned {
        let device = fleet.roster()[index].clone();
        supervisors.push(tokio::spawn(supervise_device(
            fleet.clone(),
            launcher.clone(),
            device,
            shutdown_rx.clone(),
        )));
    }
    let broadcaster = spawn_broadcast(fleet.clone(), config.broadcast_interval, shutdown_rx);

    let app = router(ObserverState {
        fleet: fleet.clone(),
        store,
        write_timeout: config.write_timeout,
    });
    info!(event = "supervisor_start", addr = %addr, roster = %config.roster.display());

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .into_future();
    let code = tokio::select! {
        result = server => match result {
            Ok(()) => 0,
            Err(err) => {
                error!(event = "observer_server_failed", error = %err);
                1
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!(event = "shutdown_signal");
            0
        }
    };

    let _ = shutdown_tx.send(true);
    for handle in supervisors {
        let _ = handle.await;
    }
    let _ = broadcaster.await;
    info!(event = "supervisor_stopped");
    code
}

/// Flags every worker gets; the launcher appends `--device-key`.
fn worker_args(config: &Config) -> Vec<String> {
    let mut args = vec![
        "--prediction-frequency".to_string(),
        config.prediction_frequency.to_string(),
        "--prediction-threshold".to_string(),
        config.prediction_threshold.to_string(),
        "--entities-dir".to_string(),
        config.entities_dir.clone(),
        "--db".to_string(),
        config.db.clone(),
    ];
    if !config.classifier_cmd.trim().is_empty() {
        args.push("--classifier-cmd".to_string());
        args.push(config.classifier_cmd.clone());
    }
    if !config.log_dir.trim().is_empty() {
        args.push("--log-dir".to_string());
        args.push(config.log_dir.clone());
    }
    if config.debug {
        args.push("--debug".to_string());
    }
    args
}

fn load_config(args: Args) -> Config {
    let broadcast_ms = resolve_parsed(args.broadcast_interval_ms, "CLIENT_UPDATE_FREQUENCY", 1000);
    Config {
        addr: resolve_addr(&args.addr),
        roster: PathBuf::from(resolve_with_default(
            &args.roster,
            "FLEETGATE_ROSTER",
            "sensors.json",
        )),
        pool_size: resolve_parsed(args.pool_size, "FLEETGATE_POOL_SIZE", default_pool_size()).max(1),
        policy: args.policy,
        broadcast_interval: Duration::from_millis(broadcast_ms.max(1)),
        prediction_frequency: resolve_parsed(args.prediction_frequency, "PREDICTION_FREQUENCY", 10)
            .max(1),
        prediction_threshold: resolve_parsed(
            args.prediction_threshold,
            "PREDICTION_SCORE_THRESHOLD",
            0.5,
        ),
        entities_dir: args.entities_dir,
        db: resolve_with_default(&args.db, "FLEETGATE_DB", "fleetgate.db"),
        worker_bin: resolve_worker_bin(&args.worker_bin),
        classifier_cmd: args.classifier_cmd,
        hold_commands: args.hold_commands,
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        log_dir: resolve_with_default(&args.log_dir, "FLEETGATE_LOG_DIR", ""),
        debug: args.debug || env_true("FLEETGATE_DEBUG"),
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = env::var("FLEETGATE_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join("fleetgate-supervisor.log");
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = env::var("FLEETGATE_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    if let Ok(value) = env::var("CLIENT_WS_PORT") {
        match value.trim().parse::<u16>() {
            Ok(port) => return format!("0.0.0.0:{port}"),
            Err(err) => eprintln!("config_invalid: CLIENT_WS_PORT={value}: {err}"),
        }
    }
    DEFAULT_ADDR.to_string()
}

fn resolve_with_default(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

/// Flag, then environment, then `default`. Unparsable environment values are
/// reported and ignored; logging is not up yet.
fn resolve_parsed<T>(flag: Option<T>, env_key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(value) = flag {
        return value;
    }
    if let Ok(value) = env::var(env_key) {
        match value.trim().parse::<T>() {
            Ok(parsed) => return parsed,
            Err(err) => eprintln!("config_invalid: {env_key}={value}: {err}"),
        }
    }
    default
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn resolve_worker_bin(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    let name = format!("fleetgate-worker{}", env::consts::EXE_SUFFIX);
    match env::current_exe() {
        Ok(exe) => match exe.parent() {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        },
        Err(_) => PathBuf::from(name),
    }
}
