//! Meridian driver daemon.
//!
//! Owns the counters region for one directory and, when `--name` is given,
//! runs the gossip name resolver.
//!
//! # Usage
//!
//! ```sh
//! meridian-driver --dir node-a --name a --resolver-bind 0.0.0.0:8050
//! meridian-driver --dir node-b --name b --bootstrap 10.0.0.1:8050
//! ```

use std::time::Duration;

use meridian::net::Endpoint;
use meridian::resolver::ResolverConfig;
use meridian::runtime::driver::{Driver, DriverConfig, DriverError};
use meridian::runtime::topology::CpuConfig;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

fn main() {
    meridian::init_tracing();
    if let Err(e) = run() {
        eprintln!("meridian-driver: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(config) = parse_args(&args)? else {
        print_usage();
        return Ok(());
    };

    let driver = Driver::spawn(config)?;
    eprintln!("meridian-driver: ready in directory {:?}", driver.directory());
    if let Some(endpoint) = driver.resolver_endpoint() {
        eprintln!("meridian-driver: resolver listening on {endpoint}");
    }

    // Runs until killed. The next start in this directory reclaims the
    // objects once their heartbeat has gone stale.
    let shutdown = driver.shutdown_flag();
    while !shutdown.load(std::sync::atomic::Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }
    driver.shutdown();
    Ok(())
}

fn parse_args(args: &[String]) -> Result<Option<DriverConfig>, CliError> {
    let mut config = DriverConfig::default();
    let mut resolver: Option<ResolverConfig> = None;

    let mut args = args.iter();
    while let Some(flag) = args.next() {
        let mut value = || {
            args.next()
                .map(String::as_str)
                .ok_or_else(|| CliError::Usage(format!("missing value for {flag}")))
        };
        match flag.as_str() {
            "--dir" | "-d" => config.directory = value()?.to_owned(),
            "--capacity" => config.counters_capacity = parse(flag, value()?)?,
            "--client-timeout-ms" => {
                config.client_liveness_timeout = Duration::from_millis(parse(flag, value()?)?);
            }
            "--reuse-timeout-ms" => {
                config.counter_reuse_timeout = Duration::from_millis(parse(flag, value()?)?);
            }
            "--delete-stale" => config.delete_stale_on_start = true,
            "--core" => config.cpu = CpuConfig::Pinned(parse(flag, value()?)?),
            "--no-pin" => config.cpu = CpuConfig::Disabled,
            "--name" | "-n" => {
                resolver.get_or_insert_with(ResolverConfig::default).name = value()?.to_owned();
            }
            "--resolver-bind" => {
                let bind = Endpoint::resolve(value()?).map_err(|e| CliError::Usage(e.to_string()))?;
                resolver.get_or_insert_with(ResolverConfig::default).bind = bind;
            }
            "--bootstrap" | "-b" => {
                resolver.get_or_insert_with(ResolverConfig::default).bootstrap =
                    Some(value()?.to_owned());
            }
            "--gossip-interval-ms" => {
                resolver
                    .get_or_insert_with(ResolverConfig::default)
                    .gossip_interval = Duration::from_millis(parse(flag, value()?)?);
            }
            "--neighbor-timeout-ms" => {
                resolver
                    .get_or_insert_with(ResolverConfig::default)
                    .neighbor_timeout = Duration::from_millis(parse(flag, value()?)?);
            }
            "--help" | "-h" => return Ok(None),
            other => return Err(CliError::Usage(format!("unknown argument: {other}"))),
        }
    }

    config.resolver = resolver;
    config.validate()?;
    Ok(Some(config))
}

fn parse<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, CliError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| CliError::Usage(format!("invalid value {value:?} for {flag}: {e}")))
}

fn print_usage() {
    eprintln!(
        r#"meridian-driver - shared-memory counters and gossip name resolution

USAGE:
    meridian-driver [OPTIONS]

OPTIONS:
    -d, --dir <NAME>              Directory clients connect to (default: default)
        --capacity <N>            Counter slots (default: 1024)
        --client-timeout-ms <MS>  Client liveness timeout (default: 10000)
        --reuse-timeout-ms <MS>   Delay before a freed slot is reused (default: 1000)
        --delete-stale            Remove existing objects without waiting for a
                                  crashed driver's heartbeat to go stale
        --core <N>                Pin the conductor to core N
        --no-pin                  Do not pin the conductor
    -n, --name <NAME>             Resolver name; enables the resolver
        --resolver-bind <ADDR>    Gossip socket address (default: 0.0.0.0:0)
    -b, --bootstrap <HOST:PORT>   Node to join through
        --gossip-interval-ms <MS> (default: 1000)
        --neighbor-timeout-ms <MS>(default: 10000)
    -h, --help                    Print this help message

Logging is controlled by RUST_LOG when built with --features tracing.
"#
    );
}
