// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::process;
use std::sync::{Arc, Mutex};

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{error, info, o, Drain, Logger};
use tokio::net::TcpListener;

use dap4_encoder::codec::{AtomicType, Values};
use dap4_encoder::config::DapConfig;
use dap4_encoder::dispatcher::RequestDispatcher;
use dap4_encoder::dmr::{Dataset, Dimension, Enumeration, Variable};
use dap4_encoder::dsp::memory::{MemoryData, MemoryProvider, MemoryRecord};
use dap4_encoder::dsp::{DspRegistry, PathPattern};
use dap4_encoder::server;

static APP: &'static str = "dapserve";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 8080;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Serves a small in-memory dataset over DAP4")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("Address to listen on")
                .long("host")
                .short("h")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port to listen on (Default: 8080)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .help("JSON configuration file")
                .long("config")
                .short("c")
                .takes_value(true),
        )
        .get_matches()
}

/// `sample.nc`: a time series, a station record and a sequence of casts.
fn sample_provider() -> MemoryProvider {
    let quality = Enumeration::new("quality", AtomicType::UInt8, &[("good", 0), ("suspect", 1)]);
    let dmr = Dataset::new("sample.nc")
        .with_dimension(Dimension::shared("time", 24))
        .with_enumeration(quality.clone())
        .with_variable(
            Variable::atomic("temperature", AtomicType::Float32)
                .with_dims(vec![Dimension::shared("time", 24)])
                .with_attribute("units", AtomicType::String, &["degC"]),
        )
        .with_variable(
            Variable::enumerated("flag", &quality)
                .with_dims(vec![Dimension::shared("time", 24)]),
        )
        .with_variable(Variable::structure(
            "station",
            vec![
                Variable::atomic("name", AtomicType::String),
                Variable::atomic("lat", AtomicType::Float64),
                Variable::atomic("lon", AtomicType::Float64),
            ],
        ))
        .with_variable(Variable::sequence(
            "casts",
            vec![
                Variable::atomic("depth", AtomicType::Float32),
                Variable::atomic("salinity", AtomicType::Float32),
            ],
        ))
        .with_attribute("title", AtomicType::String, &["dapserve sample"]);

    let cast = |depth: f32, salinity: f32| {
        MemoryRecord(vec![
            MemoryData::Atomic(Values::Float32(vec![depth])),
            MemoryData::Atomic(Values::Float32(vec![salinity])),
        ])
    };
    let data = vec![
        MemoryData::Atomic(Values::Float32(
            (0..24).map(|h| 12.0 + (h as f32 / 4.0).sin()).collect(),
        )),
        MemoryData::Atomic(Values::Enum((0..24).map(|h| (h % 7 == 0) as i64).collect())),
        MemoryData::Structure(vec![MemoryRecord(vec![
            MemoryData::Atomic(Values::String(vec!["Point Sur".to_string()])),
            MemoryData::Atomic(Values::Float64(vec![36.3])),
            MemoryData::Atomic(Values::Float64(vec![-121.9])),
        ])]),
        MemoryData::Sequence(vec![vec![cast(5.0, 33.1), cast(50.0, 33.6), cast(200.0, 34.2)]]),
    ];

    MemoryProvider::new()
        .with_dataset("sample.nc", dmr, data)
        .unwrap_or_else(|e| {
            eprintln!("Failed to build sample dataset: {}", e);
            process::exit(1)
        })
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => crate_version!()),
    );

    let config = match matches.value_of("config") {
        Some(path) => DapConfig::load(path).unwrap_or_else(|e| {
            eprintln!("Failed to load configuration: {}", e);
            process::exit(1)
        }),
        None => DapConfig::default(),
    };

    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!("Failed to parse host and port as valid socket address: {}", e);
            process::exit(1)
        });

    let registry = DspRegistry::new().with(
        PathPattern::Exact("sample.nc".to_string()),
        Arc::new(sample_provider()),
    );
    let dispatcher = Arc::new(
        RequestDispatcher::new(registry, config, Some(&root_log)).unwrap_or_else(|e| {
            eprintln!("Invalid configuration: {}", e);
            process::exit(1)
        }),
    );

    let listener = TcpListener::bind(&addr).await.expect("failed to bind");
    info!(root_log, "listening for dap4 requests"; "address" => addr);

    loop {
        match listener.accept().await {
            Ok((socket, _)) => {
                let process_log = root_log.clone();
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    server::make_task(socket, dispatcher, Some(&process_log)).await;
                });
            }
            Err(e) => error!(root_log, "failed to accept socket"; "err" => %e),
        }
    }
}
