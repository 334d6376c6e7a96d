use anyhow::Result;
use blake2::{Blake2b512, Digest};
use num_bigint::BigUint;
use rand::{rngs::OsRng, RngCore};
use std::{
    fs::{create_dir_all, remove_file, write, File},
    io::Read,
    path::Path,
};

/// Number of independent 256-bit draws concatenated into one entropy string.
const ENTROPY_DRAWS: usize = 32;

/// Formats a zkey index the way artifact names expect it: decimal,
/// left-padded to width five.
pub fn format_zkey_index(index: u64) -> String {
    format!("{:05}", index)
}

pub fn zkey_filename(circuit_prefix: &str, index: u64) -> String {
    format!("{}_{}.zkey", circuit_prefix, format_zkey_index(index))
}

/// Name of the newest verified zkey of a circuit.
pub fn last_zkey_filename(circuit_prefix: &str, completed_contributions: u64) -> String {
    zkey_filename(circuit_prefix, completed_contributions)
}

/// Name the next contribution will be stored under.
pub fn next_zkey_filename(circuit_prefix: &str, completed_contributions: u64) -> String {
    zkey_filename(circuit_prefix, completed_contributions + 1)
}

pub fn zkey_storage_path(circuit_prefix: &str, filename: &str) -> String {
    format!("circuits/{}/contributions/{}", circuit_prefix, filename)
}

pub fn bucket_name(ceremony_prefix: &str, bucket_postfix: &str) -> String {
    format!("{}{}", ceremony_prefix, bucket_postfix)
}

/// Renders a millisecond delta as `dd:hh:mm:ss` with two-digit components.
/// Negative deltas clamp to zero.
pub fn format_countdown(millis: i64) -> String {
    let total_seconds = millis.max(0) / 1000;
    let days = total_seconds / 86_400;
    let hours = total_seconds % 86_400 / 3_600;
    let minutes = total_seconds % 3_600 / 60;
    let seconds = total_seconds % 60;
    format!("{:02}:{:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

/// Entropy for one zkey contribution: 32 independent uniform draws from
/// `[0, 2^256)`, rendered in decimal and concatenated.
pub fn generate_entropy() -> String {
    let mut rng = OsRng;
    let mut entropy = String::new();
    for _ in 0..ENTROPY_DRAWS {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        entropy.push_str(&BigUint::from_bytes_be(&bytes).to_str_radix(10));
    }
    entropy
}

/// BLAKE2b-512 digest of a zkey artifact.
pub fn contribution_hash(zkey: &[u8]) -> Vec<u8> {
    let mut hasher = Blake2b512::new();
    hasher.update(zkey);
    hasher.finalize().to_vec()
}

/// Renders a digest the way ceremony transcripts do: four-byte hex
/// groups, sixteen bytes per line, prefixed by a label.
pub fn format_hash(digest: &[u8], prefix: &str) -> String {
    let mut out = String::from(prefix);
    for row in digest.chunks(16) {
        out.push_str("\n\t\t");
        let groups: Vec<String> = row.chunks(4).map(hex::encode).collect();
        out.push_str(&groups.join(" "));
    }
    out
}

pub fn read_from_file(path: &Path) -> Result<Vec<u8>> {
    let mut contents = vec![];
    File::open(path)?.read_to_end(&mut contents)?;
    Ok(contents)
}

/// Writes `bytes` to `path`, creating parent directories as needed.
pub fn write_to_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    write(path, bytes)?;
    Ok(())
}

pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_zkey_index() {
        assert_eq!(format_zkey_index(0), "00000");
        assert_eq!(format_zkey_index(42), "00042");
        assert_eq!(format_zkey_index(99_999), "99999");
    }

    #[test]
    fn test_zkey_names_and_paths() {
        assert_eq!(last_zkey_filename("multiplier2", 4), "multiplier2_00004.zkey");
        assert_eq!(next_zkey_filename("multiplier2", 4), "multiplier2_00005.zkey");
        assert_eq!(
            zkey_storage_path("multiplier2", "multiplier2_00005.zkey"),
            "circuits/multiplier2/contributions/multiplier2_00005.zkey"
        );
        assert_eq!(bucket_name("my-ceremony", "-ph2-ceremony"), "my-ceremony-ph2-ceremony");
    }

    #[test]
    fn test_format_countdown() {
        assert_eq!(format_countdown(3_600_500), "00:01:00:00");
        assert_eq!(format_countdown(24_000), "00:00:00:24");
        assert_eq!(format_countdown(90_061_000), "01:01:01:01");
        assert_eq!(format_countdown(-5_000), "00:00:00:00");
    }

    #[test]
    fn entropy_strings_are_decimal_and_fresh() {
        let first = generate_entropy();
        let second = generate_entropy();
        assert!(first.chars().all(|c| c.is_ascii_digit()));
        // 32 draws of at least one digit each; in practice far longer.
        assert!(first.len() >= ENTROPY_DRAWS);
        assert_ne!(first, second);
    }

    #[test]
    fn format_hash_groups_bytes() {
        let digest: Vec<u8> = (0u8..32).collect();
        let formatted = format_hash(&digest, "Contribution Hash: ");
        assert!(formatted.starts_with("Contribution Hash: \n\t\t"));
        assert!(formatted.contains("00010203 04050607 08090a0b 0c0d0e0f"));
        assert!(formatted.contains("10111213 14151617 18191a1b 1c1d1e1f"));
        assert_eq!(formatted.matches("\n\t\t").count(), 2);
    }

    #[test]
    fn contribution_hash_is_stable() {
        let a = contribution_hash(b"zkey bytes");
        let b = contribution_hash(b"zkey bytes");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, contribution_hash(b"other bytes"));
    }
}
