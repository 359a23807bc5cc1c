use clap::{App, Arg, ArgMatches};
use flint::logging;
use forge::config::Protocol;
use forge::pool::ServerSpec;
use forge::stats::Stats;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

mod config;
mod report;
mod worker;
mod workload;

use config::Settings;
use worker::{Worker, WorkerReport};

const EXIT_OK: i32 = 0;
const EXIT_USAGE: i32 = 1;
const EXIT_RUNTIME: i32 = 2;
const EXIT_CONNECT: i32 = 3;

static SIGINT_SEEN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signal: libc::c_int) {
    SIGINT_SEEN.store(true, Ordering::Relaxed);
}

fn install_sigint() {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
}

fn main() {
    std::process::exit(run());
}

fn build_cli<'a, 'b>() -> App<'a, 'b> {
    App::new("bellows")
        .version("0.1.0")
        .author("Bush Hammer Industries")
        .about("Load generator for memcached-class cache servers.")
        .arg(
            Arg::with_name("servers")
                .short("s")
                .long("servers")
                .takes_value(true)
                .help("Server list as host:port[:weight], comma separated (falls back to MEMCACHED_SERVERS)"),
        )
        .arg(
            Arg::with_name("threads")
                .short("T")
                .long("threads")
                .takes_value(true)
                .help("Number of worker threads"),
        )
        .arg(
            Arg::with_name("concurrency")
                .short("c")
                .long("concurrency")
                .takes_value(true)
                .help("Total number of connections"),
        )
        .arg(
            Arg::with_name("exec-num")
                .short("n")
                .long("exec-num")
                .takes_value(true)
                .help("Total number of operations for the run; 0 means unbounded"),
        )
        .arg(
            Arg::with_name("time")
                .short("t")
                .long("time")
                .takes_value(true)
                .help("Run time in seconds; 0 means unbounded"),
        )
        .arg(
            Arg::with_name("tps")
                .short("x")
                .long("tps")
                .takes_value(true)
                .help("Expected transactions per second across all connections; 0 disables pacing"),
        )
        .arg(
            Arg::with_name("value-size")
                .short("X")
                .long("value-size")
                .takes_value(true)
                .help("Fixed value size in bytes"),
        )
        .arg(
            Arg::with_name("window")
                .short("W")
                .long("window")
                .takes_value(true)
                .help("Key window size"),
        )
        .arg(
            Arg::with_name("division")
                .short("d")
                .long("division")
                .takes_value(true)
                .help("Keys per retrieval; above 1 every get becomes a multi-get"),
        )
        .arg(
            Arg::with_name("reconnect")
                .short("R")
                .long("reconnect")
                .help("Reconnect failed connections after the retry timeout"),
        )
        .arg(
            Arg::with_name("udp")
                .short("U")
                .long("udp")
                .help("Drive servers over UDP"),
        )
        .arg(
            Arg::with_name("binary")
                .short("B")
                .long("binary")
                .help("Use the binary protocol"),
        )
        .arg(
            Arg::with_name("config")
                .short("P")
                .long("config")
                .takes_value(true)
                .help("Path to a TOML configuration file"),
        )
        .arg(
            Arg::with_name("stats-file")
                .short("F")
                .long("stats-file")
                .takes_value(true)
                .help("Write the final counters and latency percentiles to this file"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("o")
                .long("verbose")
                .help("Verbose logging"),
        )
        .arg(
            Arg::with_name("print-version")
                .short("v")
                .help("Print version and exit"),
        )
}

fn parse_flag<T: FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>, i32> {
    match matches.value_of(name) {
        None => Ok(None),
        Some(text) => match text.parse::<T>() {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                eprintln!("Invalid value for --{}: {}", name, text);
                Err(EXIT_USAGE)
            }
        },
    }
}

fn apply_cli(settings: &mut Settings, matches: &ArgMatches) -> Result<(), i32> {
    if let Some(threads) = parse_flag(matches, "threads")? {
        settings.threads = threads;
    }
    if let Some(concurrency) = parse_flag(matches, "concurrency")? {
        settings.concurrency = concurrency;
    }
    if let Some(exec_num) = parse_flag(matches, "exec-num")? {
        settings.exec_num = exec_num;
    }
    if let Some(run_time) = parse_flag(matches, "time")? {
        settings.run_time = run_time;
    }
    if let Some(tps) = parse_flag(matches, "tps")? {
        settings.expected_tps = tps;
    }
    if let Some(value_size) = parse_flag(matches, "value-size")? {
        settings.workload.value_size = value_size;
    }
    if let Some(window) = parse_flag(matches, "window")? {
        settings.workload.window_size = window;
    }
    if let Some(division) = parse_flag(matches, "division")? {
        settings.workload.mget_batch = division;
    }
    if matches.is_present("reconnect") {
        settings.reconnect = true;
    }
    if matches.is_present("udp") {
        settings.udp = true;
    }
    if matches.is_present("binary") {
        settings.client.protocol = Protocol::Binary;
    }
    if matches.is_present("verbose") {
        settings.verbose = true;
    }

    Ok(())
}

fn run() -> i32 {
    let matches = build_cli().get_matches();

    if matches.is_present("print-version") {
        println!("bellows 0.1.0");
        return EXIT_OK;
    }

    let mut settings = match matches.value_of("config") {
        Some(path) => Settings::load(path),
        None => Settings::default(),
    };
    if let Err(code) = apply_cli(&mut settings, &matches) {
        return code;
    }

    if settings.threads == 0 || settings.concurrency < settings.threads {
        eprintln!(
            "Concurrency ({}) must be at least the thread count ({})",
            settings.concurrency, settings.threads
        );
        return EXIT_USAGE;
    }
    if settings.udp && settings.binary_protocol() {
        eprintln!("The binary protocol is not supported over UDP");
        return EXIT_USAGE;
    }
    if settings.exec_num == 0 && settings.run_time == 0 {
        eprintln!("Either an exec count (-n) or a run time (-t) is required");
        return EXIT_USAGE;
    }

    let server_list = matches
        .value_of("servers")
        .map(str::to_owned)
        .or_else(|| std::env::var("MEMCACHED_SERVERS").ok());
    let server_list = match server_list {
        Some(list) => list,
        None => {
            eprintln!("No servers given (use -s or MEMCACHED_SERVERS)");
            return EXIT_USAGE;
        }
    };

    let log = logging::init(if settings.verbose { "debug" } else { "info" });

    let specs = match ServerSpec::parse_list(&server_list, settings.udp) {
        Ok(specs) if !specs.is_empty() => specs,
        _ => {
            eprintln!("Could not parse server list: {}", server_list);
            return EXIT_USAGE;
        }
    };

    let mut addrs: Vec<SocketAddr> = Vec::with_capacity(specs.len());
    for spec in &specs {
        match spec.resolve() {
            Ok(addr) => addrs.push(addr),
            Err(_) => {
                eprintln!("Could not resolve server {}", spec.name());
                return EXIT_CONNECT;
            }
        }
    }

    logging::info!(log, "starting benchmark";
                   "servers" => addrs.len(),
                   "threads" => settings.threads,
                   "concurrency" => settings.concurrency,
                   "exec_num" => settings.exec_num,
                   "run_time" => settings.run_time,
                   "udp" => settings.udp,
                   "binary" => settings.binary_protocol());

    install_sigint();

    let settings = Arc::new(settings);
    let stats = Arc::new(Stats::new());
    let stop = Arc::new(AtomicBool::new(false));
    let active_conns = Arc::new(AtomicUsize::new(settings.concurrency));
    let started = Instant::now();

    // Shutdown monitor: SIGINT and the optional run-time limit both fold
    // into the global stop flag.
    let monitor = {
        let stop = stop.clone();
        let run_time = settings.run_time;
        thread::spawn(move || loop {
            if SIGINT_SEEN.load(Ordering::Relaxed) {
                stop.store(true, Ordering::Relaxed);
            }
            if run_time > 0 && started.elapsed() >= Duration::from_secs(run_time) {
                stop.store(true, Ordering::Relaxed);
            }
            if stop.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        })
    };

    let mut handles = Vec::with_capacity(settings.threads);
    for index in 0..settings.threads {
        let worker_settings = settings.clone();
        let worker_addrs = addrs.clone();
        let worker_stats = stats.clone();
        let worker_stop = stop.clone();
        let worker_active = active_conns.clone();
        let worker_log = log.clone();

        let handle = thread::Builder::new()
            .name(format!("bellows-worker-{}", index))
            .spawn(move || {
                Worker::new(
                    index,
                    worker_settings,
                    &worker_addrs,
                    worker_stats,
                    worker_stop,
                    worker_active,
                    &worker_log,
                )
                .run()
            });
        match handle {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                eprintln!("Could not spawn worker thread: {}", err);
                stop.store(true, Ordering::Relaxed);
                return EXIT_RUNTIME;
            }
        }
    }

    let mut reports: Vec<WorkerReport> = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.join() {
            Ok(report) => reports.push(report),
            Err(_) => {
                eprintln!("A worker thread panicked");
                return EXIT_RUNTIME;
            }
        }
    }

    stop.store(true, Ordering::Relaxed);
    drop(monitor.join());

    let summary = report::render(&stats, started.elapsed(), &reports);
    print!("{}", summary);

    if let Some(path) = matches.value_of("stats-file") {
        if let Err(err) = report::write_file(path, &summary) {
            eprintln!("Could not write stats file {}: {}", path, err);
            return EXIT_RUNTIME;
        }
    }

    // Every connection failing without a single completed operation means
    // the retry budget never produced a usable connection.
    let all_failed = !reports.is_empty()
        && reports
            .iter()
            .all(|report| report.conns > 0 && report.failed_conns == report.conns);
    let nothing_done: u64 = reports.iter().map(|report| report.completed_ops).sum();
    if all_failed && nothing_done == 0 {
        return EXIT_CONNECT;
    }

    EXIT_OK
}
