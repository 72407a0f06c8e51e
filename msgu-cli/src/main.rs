#![forbid(unsafe_code)]

//! MessageU interactive client: numbered menu over one server connection.

mod config;
mod store;

use std::io::{self, BufRead, Write};
use std::net::TcpStream;
use std::path::Path;

use anyhow::Context;
use clap::Parser;
use msgu_core::{Client, ClientError, MessageContent, ReceivedMessage};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Cli;
use crate::store::FileIdentityStore;

const MENU: &str = "\
MessageU client at your service.

110) Register
120) Request for clients list
130) Request for public key
140) Request for waiting messages
150) Send a text message
151) Send a request for symmetric key
152) Send your symmetric key
153) Send a file
0) Exit client
?";

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;
    let cfg = config::load(&cli)?;
    info!(server = %cfg.server, identity = %cfg.identity_path.display(), "starting");

    let transport = msgu_core::connect(cfg.server.as_str())
        .with_context(|| format!("connecting to {}", cfg.server))?
        .with_max_response_len(cfg.max_response_bytes);
    let store = FileIdentityStore::new(&cfg.identity_path);
    let mut client = Client::new(transport, Box::new(store))?.with_download_dir(&cfg.download_dir);

    let stdin = io::stdin();
    let mut input = stdin.lock();
    loop {
        println!("\n{MENU}");
        let Some(choice) = read_line(&mut input)? else {
            return Ok(());
        };
        let choice = choice.trim();
        match run_command(&mut client, &mut input, choice) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Exit) => return Ok(()),
            Err(e) => match e.downcast_ref::<ClientError>() {
                Some(err) if err.is_recoverable() => eprintln!("error: {err}"),
                // The request failed but the connection is still in step.
                Some(err) if !client.transport().is_desynchronized() => {
                    eprintln!("{choice} failed: {err}")
                }
                _ => return Err(e.context("server session failed")),
            },
        }
    }
}

enum Flow {
    Continue,
    Exit,
}

fn run_command(
    client: &mut Client<TcpStream>,
    input: &mut impl BufRead,
    choice: &str,
) -> anyhow::Result<Flow> {
    match choice {
        "110" => {
            let Some(name) = prompt(input, "Enter your name:")? else {
                return Ok(Flow::Exit);
            };
            let id = client.register(&name)?;
            println!("Registered as {name}, id {id}");
        }
        "120" => {
            let peers = client.list_peers()?;
            if peers.is_empty() {
                println!("No other clients registered.");
            }
            for peer in peers {
                println!("{}  {}", peer.id, peer.name);
            }
        }
        "130" => {
            let Some(name) = prompt(input, "Enter client name:")? else {
                return Ok(Flow::Exit);
            };
            client.get_public_key(&name)?;
            println!("Public key of {name} saved.");
        }
        "140" => {
            for msg in client.poll_messages()? {
                print_message(&msg);
            }
        }
        "150" => {
            let Some(name) = prompt(input, "Enter recipient name:")? else {
                return Ok(Flow::Exit);
            };
            let Some(text) = prompt(input, "Enter message:")? else {
                return Ok(Flow::Exit);
            };
            let receipt = client.send_text(&name, &text)?;
            println!("Message {} sent to {name}.", receipt.message_id);
        }
        "151" => {
            let Some(name) = prompt(input, "Enter recipient name:")? else {
                return Ok(Flow::Exit);
            };
            client.request_symmetric_key(&name)?;
            println!("Symmetric key requested from {name}.");
        }
        "152" => {
            let Some(name) = prompt(input, "Enter recipient name:")? else {
                return Ok(Flow::Exit);
            };
            client.send_symmetric_key(&name)?;
            println!("Symmetric key sent to {name}.");
        }
        "153" => {
            let Some(name) = prompt(input, "Enter recipient name:")? else {
                return Ok(Flow::Exit);
            };
            let Some(path) = prompt(input, "Enter file path:")? else {
                return Ok(Flow::Exit);
            };
            let receipt = client.send_file(Path::new(&path), &name)?;
            println!("File sent to {name} as message {}.", receipt.message_id);
        }
        "0" => return Ok(Flow::Exit),
        other => println!("Unknown option '{other}'."),
    }
    Ok(Flow::Continue)
}

fn print_message(msg: &ReceivedMessage) {
    let from = msg
        .sender_name
        .clone()
        .unwrap_or_else(|| msg.sender.to_string());
    println!("From: {from}");
    println!("Content:");
    match &msg.content {
        MessageContent::KeyRequest => println!("Request for symmetric key"),
        MessageContent::KeyInstalled => println!("Symmetric key received"),
        MessageContent::Text(text) => println!("{text}"),
        MessageContent::File { path, size } => {
            println!("File saved to {} ({size} bytes)", path.display())
        }
        MessageContent::Undecryptable { reason, .. } => {
            println!("can't decrypt message ({reason})")
        }
    }
    println!("-----<EOM>-----");
}

/// Prompt for one line. `None` at end of input.
fn prompt(input: &mut impl BufRead, label: &str) -> io::Result<Option<String>> {
    println!("{label}");
    read_line(input)
}

fn read_line(input: &mut impl BufRead) -> io::Result<Option<String>> {
    io::stdout().flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_owned()))
}
