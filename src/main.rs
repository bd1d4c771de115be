use anyhow::{bail, Context, Result};
use log::{info, warn};
use scale_link::scales::{ScaleFamily, ScaleProtocol};
use scale_link::system::ScaleState;

const USAGE: &str = "usage: scale-link <chipsea|felicita> <hex packet>...";

fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let digits: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits in {:?}", text);
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte {:?} in {:?}", &digits[i..i + 2], text))
        })
        .collect()
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_millis()
        .init();

    let mut args = std::env::args().skip(1);
    let family: ScaleFamily = args
        .next()
        .context(USAGE)?
        .parse()
        .map_err(anyhow::Error::msg)?;
    let packets: Vec<String> = args.collect();
    if packets.is_empty() {
        bail!(USAGE);
    }

    info!("Decoding {} packet(s) as {}", packets.len(), family);
    let protocol = family.protocol();

    for text in &packets {
        let packet = parse_hex(text)?;
        let line = match protocol.decode(&packet) {
            Ok(reading) => {
                serde_json::to_value(ScaleState::from_reading(&reading, family.variant()))?
            }
            Err(e) => {
                warn!("Dropping packet {}: {}", text, e);
                serde_json::json!({ "packet": text, "error": e.to_string() })
            }
        };
        println!("{}", line);
    }

    Ok(())
}
