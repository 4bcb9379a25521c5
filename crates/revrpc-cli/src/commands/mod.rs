//! CLI subcommand implementations.

pub mod resource;
pub mod user;

use anyhow::{Context, Result};
use std::path::Path;

/// Payload bytes from a DATA argument: `@path` reads a file, otherwise the
/// text itself, hex-decoded when `hex` is set.
pub fn parse_data(data: &str, hex: bool) -> Result<Vec<u8>> {
    let raw = match data.strip_prefix('@') {
        Some(path) => {
            let bytes = std::fs::read(Path::new(path))
                .with_context(|| format!("cannot read {path}"))?;
            if !hex {
                return Ok(bytes);
            }
            String::from_utf8(bytes).context("hex file is not text")?
        }
        None => data.to_string(),
    };
    if hex {
        let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        return hex::decode(cleaned).context("DATA is not valid hex");
    }
    Ok(raw.into_bytes())
}

/// Reply bytes as printable text: hex when asked for or not UTF-8.
pub fn format_reply(reply: Vec<u8>, hex: bool) -> String {
    if hex {
        return hex::encode(reply);
    }
    match String::from_utf8(reply) {
        Ok(text) => text,
        Err(e) => hex::encode(e.into_bytes()),
    }
}
