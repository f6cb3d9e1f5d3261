use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::unbounded;

use canbridge::adapter::CAN_SPEED_RANGE;
use canbridge::config::Config;
use canbridge::server::{Server, ServerConfig, ServerError};
use canbridge::supervisor::{Supervisor, SupervisorError};
use canbridge::{datafile, discover, pidfile, Registry, Router};

/// Liveness polling granularity of the top-level supervisor
const LIVENESS_TICK: Duration = Duration::from_millis(1);

// fatal exit codes
const EXIT_USAGE: i32 = 1;
const EXIT_SERVER: i32 = 2;
const EXIT_DEVICE: i32 = 3;
const EXIT_INSTANCE: i32 = 4;

fn main() {
    let config = Config::parse();
    setup_logging(&config);

    if let Some(path) = &config.check {
        std::process::exit(run_checker(path));
    }

    let speed = match config.speed {
        Some(speed) if CAN_SPEED_RANGE.contains(&speed) => speed,
        Some(speed) => {
            eprintln!("Wrong CAN bus speed value: {}, should be 10..3000", speed);
            std::process::exit(EXIT_USAGE);
        }
        None => {
            eprintln!("Point the CAN bus speed (--speed)");
            std::process::exit(EXIT_USAGE);
        }
    };

    let filter = config.device_filter();
    if discover::find_device(&filter).is_none() {
        eprintln!("Serial device not found!");
        std::process::exit(EXIT_DEVICE);
    }

    if let Err(err) = pidfile::acquire(&config.pidfile) {
        eprintln!("{}", err);
        std::process::exit(EXIT_INSTANCE);
    }
    install_signal_handler(config.pidfile.clone());

    let (broadcast_tx, broadcast_rx) = unbounded();
    let (outbound_tx, outbound_rx) = unbounded();
    let (ctrl_tx, ctrl_rx) = unbounded();
    let registry = Arc::new(Registry::new(broadcast_tx.clone(), outbound_tx));

    let server_config = ServerConfig {
        port: config.port,
        echo: config.echo,
        max_clients: config.max_clients,
    };

    // both long-lived threads restart on unexpected death; the receivers
    // are cloneable, so a fresh thread re-attaches to the same buses
    let spawn_server = {
        let registry = Arc::clone(&registry);
        let ctrl_tx = ctrl_tx.clone();
        let broadcast_tx = broadcast_tx.clone();
        let broadcast_rx = broadcast_rx.clone();
        move || -> JoinHandle<Result<(), ServerError>> {
            let router = Router::new(Arc::clone(&registry), ctrl_tx.clone(), broadcast_tx.clone());
            let config = server_config.clone();
            let broadcast_rx = broadcast_rx.clone();
            must_spawn("tcp-server", move || {
                Server::bind(&config, router, broadcast_rx)?.run()
            })
        }
    };
    let spawn_supervisor = {
        let registry = Arc::clone(&registry);
        move || -> JoinHandle<Result<(), SupervisorError>> {
            let filter = filter.clone();
            let outbound_rx = outbound_rx.clone();
            let ctrl_rx = ctrl_rx.clone();
            let registry = Arc::clone(&registry);
            must_spawn("can-supervisor", move || {
                Supervisor::connect(filter, 115_200, speed, outbound_rx, ctrl_rx, registry)?.run()
            })
        }
    };

    let mut server = spawn_server();
    let mut can = spawn_supervisor();
    log::info!("canbridge up on port {}", config.port);

    loop {
        if server.is_finished() {
            match server.join() {
                Ok(Err(err)) => {
                    log::error!("TCP server failed: {}", err);
                    shutdown(&config.pidfile, EXIT_SERVER);
                }
                _ => {
                    log::warn!("TCP server thread died, restarting");
                    server = spawn_server();
                }
            }
        }
        if can.is_finished() {
            match can.join() {
                Ok(Err(err)) => {
                    log::error!("CAN supervisor failed: {}", err);
                    shutdown(&config.pidfile, EXIT_DEVICE);
                }
                _ => {
                    log::warn!("CAN supervisor thread died, restarting");
                    can = spawn_supervisor();
                }
            }
        }
        thread::sleep(LIVENESS_TICK);
    }
}

fn run_checker(path: &std::path::Path) -> i32 {
    match datafile::check_file(path) {
        Ok(0) => {
            println!("{}: all lines valid", path.display());
            0
        }
        Ok(bad) => {
            eprintln!("{}: {} bad line(s)", path.display(), bad);
            EXIT_USAGE
        }
        Err(err) => {
            eprintln!("can't read {}: {}", path.display(), err);
            EXIT_USAGE
        }
    }
}

fn setup_logging(config: &Config) {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}] {}",
                chrono::Local::now().format("[%Y/%m/%d-%H:%M:%S]"),
                record.level(),
                message
            ))
        })
        .level(config.log_level())
        .chain(std::io::stderr());

    if let Some(path) = &config.logfile {
        match fern::log_file(path) {
            Ok(file) => dispatch = dispatch.chain(file),
            Err(err) => eprintln!("can't open log file {}: {}", path.display(), err),
        }
    }
    if let Err(err) = dispatch.apply() {
        eprintln!("can't initialize logging: {}", err);
    }
}

fn install_signal_handler(pid_path: PathBuf) {
    let result = ctrlc::set_handler(move || {
        log::info!("terminating on signal");
        pidfile::release(&pid_path);
        std::process::exit(0);
    });
    if let Err(err) = result {
        log::warn!("can't install signal handler: {}", err);
    }
}

fn must_spawn<T, F>(name: &str, f: F) -> JoinHandle<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match thread::Builder::new().name(name.to_owned()).spawn(f) {
        Ok(handle) => handle,
        Err(err) => {
            log::error!("can't spawn {} thread: {}", name, err);
            std::process::exit(EXIT_SERVER);
        }
    }
}

fn shutdown(pid_path: &std::path::Path, code: i32) -> ! {
    pidfile::release(pid_path);
    std::process::exit(code);
}
