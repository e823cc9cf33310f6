// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! sfbroker-publish - send one typed datagram
//!
//! ```bash
//! sfbroker-publish --broker 127.0.0.1:12345 upb/ec/temp short-real 21.50
//! sfbroker-publish --broker 127.0.0.1:12345 counters/a int -- -42
//! sfbroker-publish --broker 127.0.0.1:12345 status string "all good"
//! ```

use std::net::{SocketAddr, UdpSocket};

use clap::{Parser, ValueEnum};
use sfbroker::wire::encode_datagram;
use sfbroker::PayloadValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Kind {
    Int,
    ShortReal,
    Float,
    String,
}

/// Publish a single message to an sfbroker UDP port
#[derive(Parser, Debug)]
#[command(name = "sfbroker-publish")]
#[command(version, about, long_about = None)]
struct Args {
    /// Broker UDP address
    #[arg(short, long, default_value = "127.0.0.1:12345")]
    broker: SocketAddr,

    /// Topic (at most 50 bytes)
    topic: String,

    /// Payload type
    #[arg(value_enum)]
    kind: Kind,

    /// Value, written as it should be displayed
    value: String,
}

/// Split a decimal literal into (negative, digits without point, decimals).
fn split_decimal(text: &str) -> Result<(bool, String, usize), String> {
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int, frac) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if int.is_empty() && frac.is_empty() {
        return Err(format!("not a number: {:?}", text));
    }
    if !int.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        return Err(format!("not a number: {:?}", text));
    }
    Ok((negative, format!("{}{}", int, frac), frac.len()))
}

/// Build the payload value for `text`, keeping the written precision.
fn parse_value(kind: Kind, text: &str) -> Result<PayloadValue, String> {
    match kind {
        Kind::Int => text
            .parse::<i64>()
            .map(PayloadValue::Int)
            .map_err(|e| format!("invalid int {:?}: {}", text, e)),
        Kind::ShortReal => {
            let (negative, digits, decimals) = split_decimal(text)?;
            if negative || decimals > 2 {
                return Err("short-real must be non-negative with at most 2 decimals".into());
            }
            let scaled = format!("{}{}", digits, "0".repeat(2 - decimals));
            scaled
                .parse::<u16>()
                .map(PayloadValue::ShortReal)
                .map_err(|_| format!("short-real {:?} out of range", text))
        }
        Kind::Float => {
            let (negative, digits, decimals) = split_decimal(text)?;
            let magnitude = digits
                .parse::<u32>()
                .map_err(|_| format!("float {:?} out of range", text))?;
            let power = u8::try_from(decimals).map_err(|_| "too many decimals".to_string())?;
            Ok(PayloadValue::Float {
                negative,
                magnitude,
                power,
            })
        }
        Kind::String => Ok(PayloadValue::String(text.to_string())),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let value = parse_value(args.kind, &args.value)?;
    let datagram = encode_datagram(&args.topic, &value)?;

    let bind: SocketAddr = if args.broker.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };
    let socket = UdpSocket::bind(bind)?;
    socket.send_to(&datagram, args.broker)?;
    println!("{} - {} - {}", args.broker, args.topic, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_value(Kind::Int, "-42"), Ok(PayloadValue::Int(-42)));
        assert!(parse_value(Kind::Int, "4.2").is_err());
    }

    #[test]
    fn test_parse_short_real() {
        assert_eq!(
            parse_value(Kind::ShortReal, "50"),
            Ok(PayloadValue::ShortReal(5000))
        );
        assert_eq!(
            parse_value(Kind::ShortReal, "21.5"),
            Ok(PayloadValue::ShortReal(2150))
        );
        assert!(parse_value(Kind::ShortReal, "1.234").is_err());
        assert!(parse_value(Kind::ShortReal, "-1").is_err());
        assert!(parse_value(Kind::ShortReal, "700").is_err());
    }

    #[test]
    fn test_parse_float_keeps_precision() {
        let value = parse_value(Kind::Float, "-3.00").unwrap();
        assert_eq!(
            value,
            PayloadValue::Float {
                negative: true,
                magnitude: 300,
                power: 2
            }
        );
        assert_eq!(value.to_string(), "-3.00");
        assert!(parse_value(Kind::Float, "abc").is_err());
        assert!(parse_value(Kind::Float, ".").is_err());
    }
}
