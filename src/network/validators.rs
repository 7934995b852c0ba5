use anyhow::{anyhow, Result};

use crate::partition::Bank;

/// Largest flash dump served in one request
pub const MAX_FLASH_DUMP: usize = 4096;

pub fn parse_content_length(header: Option<&str>) -> Result<u32> {
    let value = header.ok_or_else(|| anyhow!("Missing Content-Length"))?;
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| anyhow!("Content-Length '{}' is not a valid size", value))
}

fn parse_hex(text: &str) -> Result<u32> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    if digits.is_empty() {
        return Err(anyhow!("Empty hex value"));
    }
    u32::from_str_radix(digits, 16).map_err(|_| anyhow!("'{}' is not a hex number", text))
}

/// `<hex start>-<hex length>` as used by `/api/flash/...`
pub fn parse_flash_range(range: &str) -> Result<(u32, usize)> {
    let (start, length) = range
        .split_once('-')
        .ok_or_else(|| anyhow!("Flash range must look like <start>-<length>"))?;
    let start = parse_hex(start)?;
    let length = parse_hex(length)? as usize;
    if length == 0 {
        return Err(anyhow!("Flash range length cannot be zero"));
    }
    if length > MAX_FLASH_DUMP {
        return Err(anyhow!("Flash range length must be {} bytes or less", MAX_FLASH_DUMP));
    }
    if start.checked_add(length as u32).is_none() {
        return Err(anyhow!("Flash range wraps the address space"));
    }
    Ok((start, length))
}

/// Optional `bank=a|b` query parameter of `POST /api/ota`
pub fn parse_bank_query(uri: &str) -> Result<Option<Bank>> {
    let Some((_, query)) = uri.split_once('?') else {
        return Ok(None);
    };
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("bank=") {
            return match value.to_ascii_lowercase().as_str() {
                "a" | "0" => Ok(Some(Bank::A)),
                "b" | "1" => Ok(Some(Bank::B)),
                _ => Err(anyhow!("Unknown bank '{}'", value)),
            };
        }
    }
    Ok(None)
}

/// Hardware tags live in a 16-byte header field
pub fn validate_hardware_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(anyhow!("Hardware tag cannot be empty"));
    }
    if tag.len() > 16 {
        return Err(anyhow!("Hardware tag must be 16 characters or less"));
    }
    if !tag.chars().all(|c| c.is_ascii_graphic()) {
        return Err(anyhow!("Hardware tag must be printable ASCII without spaces"));
    }
    Ok(())
}
