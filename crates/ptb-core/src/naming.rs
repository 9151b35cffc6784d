use anyhow::{Result, bail};
use rand::Rng;
use sha2::{Digest, Sha256};

pub const TAP_PREFIX: &str = "ptb-t-";
pub const BRIDGE_PREFIX: &str = "ptb-b-";
pub const INTERCHANGE_DIR_PREFIX: &str = "ptb-i-";

/// Validate an identifier used as an Instance, Application or Network name:
/// lowercase alphanumeric and hyphens, 1-63 chars, no leading/trailing hyphen.
pub fn validate_id(id: &str, kind: &str) -> Result<()> {
    if id.is_empty() || id.len() > 63 {
        bail!("{} ID must be 1-63 characters, got {}", kind, id.len());
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "{} ID must be lowercase alphanumeric + hyphens: {:?}",
            kind,
            id
        );
    }
    if id.starts_with('-') || id.ends_with('-') {
        bail!("{} ID must not start or end with a hyphen: {:?}", kind, id);
    }
    Ok(())
}

fn rand_hex8() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| std::char::from_digit(rng.gen_range(0..16u32), 16).unwrap())
        .collect()
}

/// A random candidate TAP name of the form `ptb-t-XXXXXXXX`.
pub fn random_tap_name() -> String {
    format!("{TAP_PREFIX}{}", rand_hex8())
}

/// A random candidate bridge name of the form `ptb-b-XXXXXXXX`.
pub fn random_bridge_name() -> String {
    format!("{BRIDGE_PREFIX}{}", rand_hex8())
}

/// Deterministic MAC base derived from `sha256(unique_run_name ∥ instance_name)[0:11]`:
/// 5 full bytes plus the high nibble of a 6th. The low nibble of the 6th byte
/// is left free for the NIC index, filled in by [`mac_for_nic`].
pub fn mac_base(unique_run_name: &str, instance_name: &str) -> [u8; 6] {
    let mut hasher = Sha256::new();
    hasher.update(unique_run_name.as_bytes());
    hasher.update(instance_name.as_bytes());
    let digest = hasher.finalize();
    let mut base = [0u8; 6];
    base[0..5].copy_from_slice(&digest[0..5]);
    base[5] = digest[5] & 0xf0;
    // Locally administered, unicast.
    base[0] = (base[0] & 0xfe) | 0x02;
    base
}

/// Render the full MAC address for a given NIC index (0 = management,
/// 1..N = extras), encoded in the low nibble of the last byte.
pub fn mac_for_nic(base: &[u8; 6], nic_index: u8) -> String {
    let mut mac = *base;
    mac[5] = (mac[5] & 0xf0) | (nic_index & 0x0f);
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Generate an InstanceRuntimeState UUID.
pub fn generate_instance_uuid() -> uuid::Uuid {
    uuid::Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id_valid() {
        assert!(validate_id("acme", "Tenant").is_ok());
        assert!(validate_id("my-pool-1", "Pool").is_ok());
        assert!(validate_id("a", "Tenant").is_ok());
    }

    #[test]
    fn test_validate_id_invalid() {
        assert!(validate_id("", "Tenant").is_err());
        assert!(validate_id("UPPER", "Tenant").is_err());
        assert!(validate_id("-leading", "Tenant").is_err());
        assert!(validate_id("trailing-", "Tenant").is_err());
        assert!(validate_id("has space", "Tenant").is_err());
        assert!(validate_id(&"a".repeat(64), "Tenant").is_err());
    }

    #[test]
    fn test_random_names_have_prefix_and_length() {
        let tap = random_tap_name();
        assert!(tap.starts_with(TAP_PREFIX));
        assert_eq!(tap.len(), TAP_PREFIX.len() + 8);

        let bridge = random_bridge_name();
        assert!(bridge.starts_with(BRIDGE_PREFIX));
    }

    #[test]
    fn test_mac_base_is_deterministic_and_distinct() {
        let a = mac_base("run1", "alice");
        let b = mac_base("run1", "alice");
        assert_eq!(a, b);

        let c = mac_base("run1", "bob");
        assert_ne!(a, c);
    }

    #[test]
    fn test_mac_for_nic_encodes_index_in_low_nibble() {
        let base = mac_base("run1", "alice");
        let mgmt = mac_for_nic(&base, 0);
        let extra = mac_for_nic(&base, 3);
        assert_ne!(mgmt, extra);

        let last_nibble = extra.rsplit(':').next().unwrap();
        assert_eq!(u8::from_str_radix(last_nibble, 16).unwrap() & 0x0f, 3);

        // Only the NIC index differs between the two renders.
        let (mgmt_prefix, _) = mgmt.rsplit_once(':').unwrap();
        let (extra_prefix, _) = extra.rsplit_once(':').unwrap();
        assert_eq!(mgmt_prefix, extra_prefix);
    }

    #[test]
    fn test_mac_is_locally_administered_unicast() {
        let base = mac_base("run1", "alice");
        assert_eq!(base[0] & 0x01, 0); // unicast
        assert_eq!(base[0] & 0x02, 0x02); // locally administered
    }
}
