//! Flora - A rule-based local proxy

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use flora::config::Config;
use flora::error::Result;
use flora::geoip::GeoIpDatabase;
use flora::Runtime;

const DEFAULT_CONFIG_FILE: &str = "flora.json";
const DEFAULT_GEOIP_FILE: &str = "geoip.dat";

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    let config_path = locate(args.config, DEFAULT_CONFIG_FILE);
    let config = Config::load(&config_path)?;

    // Initialize logging; config level wins over RUST_LOG
    let log_level = config
        .log
        .level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Flora v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Using config {:?}", config_path);

    let geoip_path = locate(args.geoip, DEFAULT_GEOIP_FILE);
    let geoip = match GeoIpDatabase::load(&geoip_path) {
        Ok(db) => {
            info!("Loaded GeoIP database {:?} ({} countries)", geoip_path, db.country_count());
            db
        }
        Err(e) => {
            warn!("GeoIP database unavailable, GEOIP rules will not match: {}", e);
            GeoIpDatabase::new()
        }
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runtime = Runtime::from_config(&config, Arc::new(geoip))?;
        runtime.run().await
    })?;

    info!("Goodbye!");
    Ok(())
}

/// Directory holding the running executable
fn exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

/// Use `given` if it exists, else retry it relative to the executable.
/// Without `given`, default to `name` next to the executable.
fn locate(given: Option<PathBuf>, name: &str) -> PathBuf {
    match given {
        Some(path) if path.exists() => path,
        Some(path) => match exe_dir() {
            Some(dir) if dir.join(&path).exists() => dir.join(path),
            _ => path,
        },
        None => exe_dir()
            .map(|dir| dir.join(name))
            .unwrap_or_else(|| PathBuf::from(name)),
    }
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    geoip: Option<PathBuf>,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut geoip = None;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-s" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "-d" | "--geoip" => {
                    if i + 1 < args.len() {
                        geoip = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg => {
                    eprintln!("Unknown argument: {}", arg);
                    print_help();
                    std::process::exit(1);
                }
            }
            i += 1;
        }

        Self {
            config,
            geoip,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"Flora - A rule-based local proxy

USAGE:
    flora [OPTIONS]

OPTIONS:
    -s, --config <FILE>     Path to configuration file (default: <exe dir>/flora.json)
    -d, --geoip <FILE>      Path to GeoIP database (default: <exe dir>/geoip.dat)
    -v, --version           Print version information
    -h, --help              Print help information

SIGNALS:
    SIGINT, SIGTERM         Restore system proxy settings and exit
    SIGUSR1                 Print connection and rule statistics
"#
    );
}

fn print_version() {
    println!("Flora v{}", env!("CARGO_PKG_VERSION"));
    println!("A rule-based SOCKS4/SOCKS5/HTTP proxy");
}
