/*
 * Copyright (C) 2024-2025 the seqwire authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use clap::{ArgAction, Parser};
use log::{error, info, LevelFilter};
use seqwire::extension::{ExtensionRegistry, PerMessageDeflate};
use seqwire::http1::{Request, Response};
use seqwire::log::get_simple_logger;
use seqwire::server::{Config, Handler, Server};
use seqwire::session::Session;
use seqwire::settings::Settings;
use serde_json::json;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::error::Error;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Parser)]
#[command(
    name = "seqwire-server",
    version,
    about = "Ordered HTTP/1.1 + WebSocket engine."
)]
struct CliArgs {
    #[arg(long, value_name = "file", help = "Config file.")]
    config: Option<String>,

    #[arg(long, value_name = "[addr:]port", help = "Listen address.")]
    listen: Option<String>,

    #[arg(long, value_name = "n", help = "Handler threads.")]
    handler_threads: Option<usize>,

    #[arg(
        long,
        value_name = "level",
        help = "Log level: error, warn, info, debug, trace."
    )]
    log_level: Option<String>,

    #[arg(long, action = ArgAction::SetTrue, help = "Verbose output. Same as --log-level=debug.")]
    verbose: bool,
}

struct DemoHandler {
    requests: AtomicU64,
}

impl DemoHandler {
    fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
        }
    }
}

impl Handler for DemoHandler {
    fn handle(&self, req: &Request) -> Response {
        let count = self.requests.fetch_add(1, Ordering::Relaxed) + 1;

        match req.uri.as_str() {
            "/" => Response::text(200, "OK", "hello from seqwire\n"),
            "/echo" => {
                let mut resp = Response::new(200, "OK");

                resp.body = req.body.clone();

                resp
            }
            "/status" => {
                let status = json!({ "requests": count });

                let mut resp =
                    Response::new(200, "OK").header("Content-Type", b"application/json");

                resp.body = status.to_string().into_bytes();

                resp
            }
            _ => Response::text(404, "Not Found", "not found\n"),
        }
    }

    fn accept_websocket(&self, req: &Request) -> bool {
        req.uri == "/ws"
    }

    fn websocket(&self, _req: &Request, session: &mut Session) {
        // echo every data frame until the peer closes
        while let Ok(frame) = session.recv() {
            if frame.is_control() {
                continue;
            }

            if session.send(frame).is_err() {
                break;
            }
        }
    }
}

fn make_config(args: &CliArgs) -> Result<(Config, bool, LevelFilter), Box<dyn Error>> {
    let mut settings = match &args.config {
        Some(path) => Settings::load_file(path)?,
        None => Settings::default(),
    };

    if let Some(listen) = &args.listen {
        // a bare port means all interfaces
        settings.listen = if listen.parse::<u16>().is_ok() {
            format!("0.0.0.0:{}", listen)
        } else {
            listen.clone()
        };
    }

    if let Some(threads) = args.handler_threads {
        settings.handler_threads = threads;
    }

    if args.verbose {
        settings.log_level = String::from("debug");
    } else if let Some(level) = &args.log_level {
        settings.log_level = level.clone();
    }

    let level: LevelFilter = settings
        .log_level
        .parse()
        .map_err(|_| format!("unknown log level: {}", settings.log_level))?;

    let config = settings.to_server_config()?;

    Ok((config, settings.allow_compression, level))
}

fn run() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();

    let (config, allow_compression, level) = make_config(&args)?;

    log::set_logger(get_simple_logger())?;
    log::set_max_level(level);

    let mut extensions = ExtensionRegistry::new();

    if allow_compression {
        extensions.install(Box::new(PerMessageDeflate::new()))?;
    }

    info!("starting...");

    let mut server = Server::start(config, DemoHandler::new(), extensions)?;

    info!("started");

    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    // block until asked to stop
    let _ = signals.forever().next();

    info!("stopping...");

    server.stop();

    info!("stopped");

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        error!("{}", e);
        eprintln!("error: {}", e);

        process::exit(1);
    }
}
