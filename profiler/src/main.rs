mod cli;
mod config;
mod registration;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use cli::{Action, Opt};
use config::Config;
use profiler_symbols::{MetadataCache, SqliteMetadataCache};

fn main() {
    let opt = Opt::parse();

    let config = opt
        .config_path
        .as_deref()
        .map(Config::load)
        .unwrap_or_default();

    init_logging(config.merge_verbose(opt.verbose));

    let exit_code = match opt.action() {
        Action::Run => run(&opt, &config),
        Action::Register => match registration::register() {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("Error: {e}");
                2
            }
        },
        Action::Unregister => match registration::unregister() {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("Error: {e}");
                2
            }
        },
    };
    std::process::exit(exit_code);
}

fn init_logging(verbose: bool) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    builder.init();
}

fn run(opt: &Opt, config: &Config) -> i32 {
    let port = config.merge_port(opt.port);
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

    let cache: Option<Arc<dyn MetadataCache>> = config
        .cache_path
        .as_ref()
        .map(|s| PathBuf::from(s.as_str()))
        .and_then(|path| match SqliteMetadataCache::open(&path) {
            Ok(cache) => Some(Arc::new(cache) as Arc<dyn MetadataCache>),
            Err(e) => {
                log::warn!("metadata cache disabled, could not open {}: {e}", path.display());
                None
            }
        });

    let mut server = match profiler_frontend::Server::bind(addr, cache) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Error: could not start session acceptor: {e}");
            return 1;
        }
    };

    let bound = server.local_addr().unwrap_or(addr);
    log::info!("listening for collector sessions on {bound}");

    match server.run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    }
}
