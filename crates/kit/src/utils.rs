use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use rand::Rng;

/// Prefix carried by every instance this tool defines, so stale ones can be
/// found and cleaned up.
pub(crate) const INSTANCE_PREFIX: &str = "vmit-";

/// Parse size string (e.g., "10G", "5120M", "1T") to bytes
pub(crate) fn parse_size(size_str: &str) -> Result<u64> {
    let size_str = size_str.trim().to_uppercase();

    if size_str.is_empty() {
        return Err(eyre!("Empty size string"));
    }

    let (number_str, multiplier) = if let Some(num) = size_str.strip_suffix("TB") {
        (num, 1024_u64.pow(4))
    } else if let Some(num) = size_str.strip_suffix("GB") {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = size_str.strip_suffix("MB") {
        (num, 1024 * 1024)
    } else if let Some(num) = size_str.strip_suffix("KB") {
        (num, 1024)
    } else if let Some(num) = size_str.strip_suffix('T') {
        (num, 1024_u64.pow(4))
    } else if let Some(num) = size_str.strip_suffix('G') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = size_str.strip_suffix('M') {
        (num, 1024 * 1024)
    } else if let Some(num) = size_str.strip_suffix('K') {
        (num, 1024)
    } else if let Some(num) = size_str.strip_suffix('B') {
        (num, 1)
    } else {
        // No unit suffix, assume bytes
        (&*size_str, 1)
    };

    let number: u64 = number_str
        .parse()
        .map_err(|_| eyre!("Invalid number in size: {}", number_str))?;

    number
        .checked_mul(multiplier)
        .ok_or_else(|| eyre!("Size out of range: {}", size_str))
}

/// Parse a memory string (like "2G", "1024M", "512") to megabytes
pub(crate) fn parse_memory_to_mb(memory_str: &str) -> Result<u32> {
    let memory_str = memory_str.trim();

    if memory_str.is_empty() {
        return Err(eyre!("Memory string cannot be empty"));
    }

    // Bare numbers are megabytes; suffixes are binary units.
    let (number_str, bytes_per_unit) = if let Some(num) = memory_str
        .strip_suffix('G')
        .or_else(|| memory_str.strip_suffix('g'))
    {
        (num, 1024.0 * 1024.0 * 1024.0)
    } else if let Some(num) = memory_str
        .strip_suffix('M')
        .or_else(|| memory_str.strip_suffix('m'))
    {
        (num, 1024.0 * 1024.0)
    } else if let Some(num) = memory_str
        .strip_suffix('K')
        .or_else(|| memory_str.strip_suffix('k'))
    {
        (num, 1024.0)
    } else {
        (memory_str, 1024.0 * 1024.0)
    };

    let number: f64 = number_str
        .parse()
        .context("Invalid number in memory specification")?;
    if !number.is_finite() || number <= 0.0 {
        return Err(eyre!("Memory must be positive: {}", memory_str));
    }

    let mib = 1024.0 * 1024.0;
    Ok(((number * bytes_per_unit) / mib) as u32)
}

/// Generate a run identifier: UTC timestamp plus a random suffix so two runs
/// started within the same second never collide.
pub(crate) fn generate_run_id() -> String {
    let suffix: u16 = rand::rng().random();
    format!(
        "{}-{:04x}",
        chrono::Utc::now().format("%Y%m%d%H%M%S"),
        suffix
    )
}

fn sanitize(profile: &str) -> String {
    profile
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Derive the hypervisor instance name for one run of a profile.
pub(crate) fn instance_name(profile: &str, run_id: &str) -> String {
    format!("{INSTANCE_PREFIX}{}-{run_id}", sanitize(profile))
}

/// Name of the long-lived instance a profile reverts between runs.
pub(crate) fn baseline_name(profile: &str) -> String {
    format!("{INSTANCE_PREFIX}{}{BASELINE_SUFFIX}", sanitize(profile))
}

/// Suffix distinguishing baseline instances from per-run ones.
pub(crate) const BASELINE_SUFFIX: &str = "-base";

/// Decode one line of captured output, dropping the line terminator.
/// Invalid UTF-8 is replaced rather than rejected.
pub(crate) fn decode_line(buf: &[u8]) -> String {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    let buf = buf.strip_suffix(b"\r").unwrap_or(buf);
    String::from_utf8_lossy(buf).into_owned()
}

/// Whether a profile name is usable as a store key and instance name component.
pub(crate) fn is_valid_profile_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 48
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("20G").unwrap(), 20 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("5120m").unwrap(), 5120 * 1024 * 1024);
        assert_eq!(parse_size("1TB").unwrap(), 1024_u64.pow(4));
        assert_eq!(parse_size("512").unwrap(), 512);
        assert!(parse_size("").is_err());
        assert!(parse_size("lots").is_err());
        assert!(parse_size("99999999999T").is_err());
    }

    #[test]
    fn test_parse_memory_to_mb() {
        assert_eq!(parse_memory_to_mb("4G").unwrap(), 4096);
        assert_eq!(parse_memory_to_mb("2048M").unwrap(), 2048);
        assert_eq!(parse_memory_to_mb("512").unwrap(), 512);
        assert_eq!(parse_memory_to_mb("1.5g").unwrap(), 1536);
        assert!(parse_memory_to_mb("").is_err());
        assert!(parse_memory_to_mb("-1G").is_err());
    }

    #[test]
    fn test_instance_names_are_unique_per_run() {
        let run_id = generate_run_id();
        let a = instance_name("workstation", &run_id);
        assert!(a.starts_with("vmit-workstation-"));
        assert!(a.ends_with(&run_id));
        assert_ne!(a, instance_name("workstation", "20260101000000-0001"));
        assert_ne!(a, instance_name("vm", &run_id));
    }

    #[test]
    fn test_instance_name_sanitizes() {
        assert_eq!(instance_name("a b/c", "r1"), "vmit-a-b-c-r1");
    }

    #[test]
    fn test_baseline_name_is_stable() {
        assert_eq!(baseline_name("vm"), "vmit-vm-base");
        assert_eq!(baseline_name("a b"), "vmit-a-b-base");
    }

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"Starting install\n"), "Starting install");
        assert_eq!(decode_line(b"crlf\r\n"), "crlf");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"\xff\xfe progress\n"), "\u{fffd}\u{fffd} progress");
    }

    #[test]
    fn test_profile_name_validation() {
        assert!(is_valid_profile_name("vm"));
        assert!(is_valid_profile_name("work_station-2"));
        assert!(!is_valid_profile_name(""));
        assert!(!is_valid_profile_name("../etc"));
        assert!(!is_valid_profile_name("a b"));
    }
}
