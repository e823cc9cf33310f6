// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! sfbroker-subscriber - interactive subscriber client
//!
//! Connects to a broker, identifies itself, and prints every forwarded
//! message. Commands typed on stdin:
//!
//! ```text
//! subscribe <topic> [0|1]    # 1 = store-and-forward while offline
//! unsubscribe <topic>
//! exit
//! ```

use std::io::{self, BufRead, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::thread;

use clap::Parser;
use sfbroker::wire::ForwardFrames;
use sfbroker::{Command, MAX_IDENTITY_LEN};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

/// Subscribe to sfbroker topics and print forwarded messages
#[derive(Parser, Debug)]
#[command(name = "sfbroker-subscriber")]
#[command(version, about, long_about = None)]
struct Args {
    /// Subscriber identity (at most 10 bytes)
    id: String,

    /// Broker address
    ip: IpAddr,

    /// Broker port
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Log filter (e.g. warn, debug)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

/// What to do with one line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    /// Send this command line to the broker, then print the confirmation.
    Send { line: String, confirmation: &'static str },
    Exit,
    Usage(&'static str),
    Blank,
}

const USAGE: &str = "Usage: subscribe <topic> [0|1] | unsubscribe <topic> | exit";

/// Translate user input into a broker command.
///
/// `subscribe` without a flag asks for live delivery only.
fn interpret(line: &str) -> Input {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Blank;
    }
    if trimmed == "exit" {
        return Input::Exit;
    }

    let mut tokens = trimmed.split_whitespace();
    let line = match (tokens.next(), tokens.next(), tokens.next(), tokens.next()) {
        (Some("subscribe"), Some(topic), None, None) => format!("subscribe {} 0", topic),
        (Some("subscribe"), Some(topic), Some(flag), None) => {
            format!("subscribe {} {}", topic, flag)
        }
        (Some("unsubscribe"), Some(topic), None, None) => format!("unsubscribe {}", topic),
        _ => return Input::Usage(USAGE),
    };

    // Validate locally with the broker's own parser
    match Command::parse(&line) {
        Ok(Command::Subscribe { .. }) => Input::Send {
            line,
            confirmation: "Subscribed to topic.",
        },
        Ok(Command::Unsubscribe { .. }) => Input::Send {
            line,
            confirmation: "Unsubscribed from topic.",
        },
        Err(_) => Input::Usage(USAGE),
    }
}

/// Print forwarded messages until the broker closes the connection.
fn receive_loop(mut stream: TcpStream) {
    let mut frames = ForwardFrames::default();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                debug!("broker closed the connection");
                break;
            }
            Ok(n) => {
                frames.feed(&buf[..n]);
                while let Some(next) = frames.next_message() {
                    match next {
                        Ok(message) => println!("{}", message.render()),
                        Err(e) => {
                            error!("corrupt stream from broker: {}", e);
                            std::process::exit(1);
                        }
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("receive failed: {}", e);
                break;
            }
        }
    }
    std::process::exit(0);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if args.id.is_empty() || args.id.len() > MAX_IDENTITY_LEN {
        return Err(format!("ID must be 1 to {} bytes long", MAX_IDENTITY_LEN).into());
    }

    let mut stream = TcpStream::connect(SocketAddr::new(args.ip, args.port))?;
    stream.set_nodelay(true)?;
    let mut hello = args.id.clone().into_bytes();
    hello.push(0);
    stream.write_all(&hello)?;

    let reader = stream.try_clone()?;
    thread::Builder::new()
        .name("sfbroker-rx".into())
        .spawn(move || receive_loop(reader))?;

    for line in io::stdin().lock().lines() {
        match interpret(&line?) {
            Input::Send { line, confirmation } => {
                stream.write_all(line.as_bytes())?;
                stream.write_all(b"\n")?;
                println!("{}", confirmation);
            }
            Input::Exit => break,
            Input::Usage(usage) => eprintln!("{}", usage),
            Input::Blank => {}
        }
    }

    stream.shutdown(std::net::Shutdown::Both)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_defaults_to_live_only() {
        assert_eq!(
            interpret("subscribe a/b"),
            Input::Send {
                line: "subscribe a/b 0".to_string(),
                confirmation: "Subscribed to topic."
            }
        );
        assert_eq!(
            interpret("  subscribe a/* 1 "),
            Input::Send {
                line: "subscribe a/* 1".to_string(),
                confirmation: "Subscribed to topic."
            }
        );
    }

    #[test]
    fn test_unsubscribe_and_exit() {
        assert_eq!(
            interpret("unsubscribe x"),
            Input::Send {
                line: "unsubscribe x".to_string(),
                confirmation: "Unsubscribed from topic."
            }
        );
        assert_eq!(interpret("exit\n"), Input::Exit);
        assert_eq!(interpret("   "), Input::Blank);
    }

    #[test]
    fn test_invalid_input_prints_usage() {
        assert_eq!(interpret("subscribe"), Input::Usage(USAGE));
        assert_eq!(interpret("subscribe a 5"), Input::Usage(USAGE));
        assert_eq!(interpret("publish a"), Input::Usage(USAGE));
        assert_eq!(
            interpret(&format!("subscribe {}", "t".repeat(51))),
            Input::Usage(USAGE)
        );
    }
}
