use clap::Parser;
use fleetgate_storage::SqliteStore;
use fleetgate_worker::classify::{load_entities, Classifier, CommandClassifier, StubClassifier};
use fleetgate_worker::control::{read_control, run_control, wait_for_assignment, write_reports};
use fleetgate_worker::persist::{PersistQueue, DEFAULT_QUEUE_CAPACITY};
use fleetgate_worker::server::{serve, WorkerContext};
use fleetgate_worker::session::{DeviceSession, SamplingSettings};
use std::{
    env,
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "fleetgate-worker")]
struct Args {
    /// Only used to name the log file; the device comes from `assign_device`.
    #[arg(long, default_value = "")]
    device_key: String,
    #[arg(long, default_value = "0.0.0.0")]
    device_host: String,
    #[arg(long)]
    prediction_frequency: Option<u32>,
    #[arg(long)]
    prediction_threshold: Option<f64>,
    #[arg(long, default_value = "")]
    entities_dir: String,
    #[arg(long, default_value = "")]
    db: String,
    #[arg(long, default_value = "")]
    classifier_cmd: String,
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    persist_queue: usize,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Clone, Debug)]
struct Config {
    device_key: String,
    device_host: String,
    prediction_frequency: u32,
    prediction_threshold: f64,
    entities_dir: PathBuf,
    db: PathBuf,
    classifier_cmd: String,
    persist_queue: usize,
    log_dir: String,
    debug: bool,
}

struct LogGuard {
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

/// stdout carries the control channel, so the console side is stderr.
struct MultiWriter {
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = load_config(args);
    let _log_guard = init_logging(&config);
    let code = run(config).await;
    std::process::exit(code);
}

async fn run(config: Config) -> i32 {
    let (ctrl_tx, mut ctrl_rx) = mpsc::channel(64);
    tokio::spawn(read_control(tokio::io::stdin(), ctrl_tx));

    let Some(assignment) = wait_for_assignment(&mut ctrl_rx).await else {
        info!(event = "control_closed_before_assignment");
        return 0;
    };
    let device = assignment.device;
    info!(
        event = "device_assigned",
        worker_id = assignment.worker_id,
        key = %device.key,
        port = device.port,
        detect_objects = device.detect_objects,
        save_sensor_data = device.save_sensor_data
    );

    let persist = if device.save_sensor_data || device.detect_objects {
        match SqliteStore::open(&config.db) {
            Ok(store) => {
                let (queue, _writer) = PersistQueue::spawn(store, config.persist_queue);
                Some(queue)
            }
            Err(err) => {
                error!(event = "store_open_failed", db = %config.db.display(), error = %err);
                None
            }
        }
    } else {
        None
    };

    let classifier: Arc<dyn Classifier> =
        match CommandClassifier::from_command_line(&config.classifier_cmd) {
            Some(command) => Arc::new(command),
            None => Arc::new(StubClassifier::default()),
        };

    let entities = if device.detect_objects {
        load_entities(&config.entities_dir)
    } else {
        Default::default()
    };
    let sampling = SamplingSettings {
        prediction_frequency: config.prediction_frequency,
        score_threshold: config.prediction_threshold,
        entities: Arc::new(entities),
    };

    let listener = match TcpListener::bind((config.device_host.as_str(), device.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(
                event = "device_bind_failed",
                host = %config.device_host,
                port = device.port,
                error = %err
            );
            return 1;
        }
    };
    info!(event = "device_listening", host = %config.device_host, port = device.port);

    let (report_tx, report_rx) = mpsc::channel(256);
    tokio::spawn(write_reports(
        tokio::io::stdout(),
        assignment.worker_id,
        report_rx,
    ));

    let ctx = Arc::new(WorkerContext {
        session: Mutex::new(DeviceSession::new(device, sampling)),
        classifier,
        persist,
        reports: report_tx,
    });
    if let Some(command) = assignment.early_command {
        ctx.push_command(command).await;
    }

    let server = tokio::spawn(serve(listener, ctx.clone()));

    tokio::select! {
        _ = run_control(ctrl_rx, &ctx) => {
            info!(event = "control_closed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!(event = "shutdown_signal");
        }
    }
    server.abort();

    if let Some(queue) = &ctx.persist {
        let stats = queue.stats();
        info!(
            event = "persist_summary",
            written = stats.written,
            dropped = stats.dropped,
            failed = stats.failed
        );
    }
    0
}

fn load_config(args: Args) -> Config {
    let device_key = args.device_key;
    Config {
        prediction_frequency: resolve_prediction_frequency(args.prediction_frequency),
        prediction_threshold: resolve_prediction_threshold(args.prediction_threshold),
        entities_dir: PathBuf::from(resolve_with_default(
            &args.entities_dir,
            "FLEETGATE_ENTITIES_DIR",
            "images",
        )),
        db: PathBuf::from(resolve_with_default(&args.db, "FLEETGATE_DB", "fleetgate.db")),
        classifier_cmd: resolve_with_default(
            &args.classifier_cmd,
            "FLEETGATE_CLASSIFIER_CMD",
            "",
        ),
        persist_queue: args.persist_queue,
        log_dir: resolve_with_default(&args.log_dir, "FLEETGATE_LOG_DIR", ""),
        debug: args.debug || env_true("FLEETGATE_DEBUG"),
        device_host: args.device_host,
        device_key,
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
    let writer = match open_log_file(&config.log_dir, &config.device_key) {
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
        .with_ansi(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

impl MultiWriter {
    fn new(file: Option<Arc<StdMutex<std::fs::File>>>) -> Self {
        Self { file }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, device_key: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let name = if device_key.trim().is_empty() {
        format!("pid-{}", std::process::id())
    } else {
        sanitize_component(device_key)
    };
    let path = dir.join(format!("fleetgate-worker-{name}.log"));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(StdMutex::new(file))),
    })
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn resolve_prediction_frequency(flag: Option<u32>) -> u32 {
    if let Some(value) = flag {
        return value.max(1);
    }
    if let Ok(value) = env::var("PREDICTION_FREQUENCY") {
        match value.trim().parse::<u32>() {
            Ok(parsed) => return parsed.max(1),
            Err(err) => eprintln!("config_invalid: PREDICTION_FREQUENCY={value}: {err}"),
        }
    }
    10
}

fn resolve_prediction_threshold(flag: Option<f64>) -> f64 {
    if let Some(value) = flag {
        return value;
    }
    if let Ok(value) = env::var("PREDICTION_SCORE_THRESHOLD") {
        match value.trim().parse::<f64>() {
            Ok(parsed) => return parsed,
            Err(err) => eprintln!("config_invalid: PREDICTION_SCORE_THRESHOLD={value}: {err}"),
        }
    }
    0.5
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

fn env_true(key: &str) -> bool {
    matches!(
        env::var(key).ok().as_deref().map(str::trim),
        Some("1" | "true" | "TRUE" | "yes" | "YES")
    )
}
