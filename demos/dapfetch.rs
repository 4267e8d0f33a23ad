// Copyright 2020 Joyent, Inc.

use std::io::Error;
use std::net::SocketAddr;
use std::process;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use tokio::net::TcpStream;

use dap4_encoder::client;
use dap4_encoder::protocol::Chunk;

static APP: &'static str = "dapfetch";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 8080;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Fetches a DAP4 response and prints its chunks")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 8080)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("target")
                .help("Request path, e.g. /sample.nc.dap?dap4.ce=temperature[0:5]")
                .required(true)
                .index(1),
        )
        .get_matches()
}

fn chunk_handler(chunk: &Chunk) -> Result<(), Error> {
    if chunk.is_metadata() || chunk.is_error() {
        println!("{}", String::from_utf8_lossy(&chunk.payload));
    } else {
        println!(
            "{} chunk: {} bytes, {:?}",
            if chunk.is_end() { "END" } else { "DATA" },
            chunk.payload.len(),
            chunk.endian()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!("Failed to parse host and port as valid socket address: {}", e);
            process::exit(1)
        });
    let target = matches.value_of("target").unwrap_or("/");

    let mut stream = TcpStream::connect(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to connect to server: {}", e);
        process::exit(1)
    });

    if let Err(e) = client::send(target, &mut stream).await {
        eprintln!("Error: {}", e);
        process::exit(1)
    }
    match client::receive(&mut stream, chunk_handler).await {
        Ok((head, document)) => {
            eprintln!("status {} ({})", head.status, head.content_type);
            if !document.is_empty() {
                println!("{}", document);
            }
        }
        Err(e) => eprintln!("Error: {}", e),
    }
}
