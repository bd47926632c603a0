//! Size-string handling for the Proxmox API.
//!
//! Proxmox accepts sizes with single-letter binary suffixes (`K`, `M`,
//! `G`, `T`, `P`) while catalog rows and user input arrive in a mix of
//! `GiB`/`GB`/`G` spellings, sometimes with embedded whitespace.

use anyhow::{Result, anyhow, bail};

use crate::GB;

/// Normalize a human size string into the single-letter form Proxmox
/// expects: `"10 GiB"`, `"10GiB"` and `"10GB"` all become `"10G"`.
///
/// The numeric part is preserved verbatim (including fractions); only
/// whitespace and the unit spelling are rewritten. A plain number with
/// no unit passes through unchanged.
pub fn normalize_size_for_proxmox(input: &str) -> Result<String> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        bail!("empty size string");
    }

    let split = compact
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(compact.len());
    let (num, unit) = compact.split_at(split);
    if num.is_empty() || num.parse::<f64>().is_err() {
        bail!("invalid size string: {}", input);
    }
    if unit.is_empty() {
        return Ok(num.to_string());
    }

    let suffix = match unit.to_ascii_uppercase().as_str() {
        "K" | "KB" | "KIB" => "K",
        "M" | "MB" | "MIB" => "M",
        "G" | "GB" | "GIB" => "G",
        "T" | "TB" | "TIB" => "T",
        "P" | "PB" | "PIB" => "P",
        other => bail!("unknown size unit '{}' in: {}", other, input),
    };
    Ok(format!("{}{}", num, suffix))
}

/// Parse a size string (with or without a unit suffix) into bytes.
///
/// Suffixes are binary multiples, matching Proxmox semantics. A bare
/// number is taken as bytes.
pub fn parse_size_bytes(input: &str) -> Result<u64> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let split = compact
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(compact.len());
    let (num, unit) = compact.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| anyhow!("invalid size string: {}", input))?;

    let mult: u64 = match unit.to_ascii_uppercase().as_str() {
        "" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        "P" | "PB" | "PIB" => 1 << 50,
        other => bail!("unknown size unit '{}' in: {}", other, input),
    };
    Ok((value * mult as f64).round() as u64)
}

/// Round a byte count up to a whole number of GiB.
///
/// Thin-provisioned block storage rejects fractional sizes at volume
/// creation, so a 3.5G source always gets a 4G target.
pub fn ceil_to_gib(bytes: u64) -> u64 {
    bytes.div_ceil(GB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_unit_spellings() {
        for input in ["10 GiB", "10GiB", "10GB", "10G", "10 G"] {
            assert_eq!(normalize_size_for_proxmox(input).unwrap(), "10G");
        }
        assert_eq!(normalize_size_for_proxmox("512 MiB").unwrap(), "512M");
        assert_eq!(normalize_size_for_proxmox("4KiB").unwrap(), "4K");
        assert_eq!(normalize_size_for_proxmox("2 TiB").unwrap(), "2T");
        assert_eq!(normalize_size_for_proxmox("1PiB").unwrap(), "1P");
    }

    #[test]
    fn preserves_fractions_and_bare_numbers() {
        assert_eq!(normalize_size_for_proxmox("3.5G").unwrap(), "3.5G");
        assert_eq!(normalize_size_for_proxmox("1024").unwrap(), "1024");
    }

    #[test]
    fn rejects_garbage() {
        assert!(normalize_size_for_proxmox("").is_err());
        assert!(normalize_size_for_proxmox("GiB").is_err());
        assert!(normalize_size_for_proxmox("10XB").is_err());
    }

    #[test]
    fn parses_bytes() {
        assert_eq!(parse_size_bytes("32G").unwrap(), 32 * GB);
        assert_eq!(parse_size_bytes("10 GiB").unwrap(), 10 * GB);
        assert_eq!(parse_size_bytes("512M").unwrap(), 512 << 20);
        assert_eq!(parse_size_bytes("1024").unwrap(), 1024);
    }

    #[test]
    fn rounds_up_to_whole_gib() {
        assert_eq!(ceil_to_gib(GB), 1);
        assert_eq!(ceil_to_gib(GB + 1), 2);
        // a 3.5G source becomes a 4G target
        assert_eq!(ceil_to_gib(parse_size_bytes("3.5G").unwrap()), 4);
    }
}
