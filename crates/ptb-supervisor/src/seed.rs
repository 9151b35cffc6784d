//! Cloud-init seed generation (§4.3 step 2): meta-data/user-data/network-config
//! rendered from a minimal named-hole templater, then packed into a small ISO.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use ptb_fabric::runner::{CommandRunner, run_checked};

const META_DATA_TEMPLATE: &str = "instance-id: {{INSTANCE_ID}}\nlocal-hostname: {{HOSTNAME}}\n";

const USER_DATA_TEMPLATE: &str = "#cloud-config\nhostname: {{HOSTNAME}}\nfqdn: {{FQDN}}\nmanage_etc_hosts: true\n";

const NETWORK_CONFIG_TEMPLATE: &str = "version: 2\nethernets:\n  mgmt0:\n    match:\n      macaddress: \"{{MGMT_MAC}}\"\n    set-name: mgmt0\n    addresses: [{{MGMT_ADDRESS}}/{{MGMT_PREFIX}}]\n    gateway4: {{MGMT_GATEWAY}}\n";

/// Replace every `{{NAME}}` hole in `template` with its value. Unlike
/// `ptb-core::config`'s environment substitution, holes here are always
/// fully known at call time, so an unresolved hole is a programmer error.
fn render(template: &str, holes: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in holes {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
    }
    out
}

/// Parameters needed to render an Instance's cloud-init seed.
pub struct SeedParams<'a> {
    pub instance_id: &'a str,
    pub hostname: &'a str,
    pub mgmt_mac: &'a str,
    pub mgmt_address: &'a str,
    pub mgmt_prefix: u8,
    pub mgmt_gateway: &'a str,
}

fn fqdn_for(hostname: &str) -> String {
    let parts: Vec<&str> = hostname.split('.').collect();
    if parts.len() > 2 {
        parts[1..].join(".")
    } else {
        String::new()
    }
}

/// Render the three cloud-init files into `seed_dir` (created if absent).
pub fn write_seed_files(seed_dir: &Path, params: &SeedParams) -> Result<()> {
    std::fs::create_dir_all(seed_dir)
        .with_context(|| format!("creating cloud-init seed dir {}", seed_dir.display()))?;

    let meta_data = render(
        META_DATA_TEMPLATE,
        &[("INSTANCE_ID", params.instance_id), ("HOSTNAME", params.hostname)],
    );
    std::fs::write(seed_dir.join("meta-data"), meta_data)?;

    let fqdn = fqdn_for(params.hostname);
    let user_data = render(
        USER_DATA_TEMPLATE,
        &[("HOSTNAME", params.hostname), ("FQDN", &fqdn)],
    );
    std::fs::write(seed_dir.join("user-data"), user_data)?;

    let prefix = params.mgmt_prefix.to_string();
    let network_config = render(
        NETWORK_CONFIG_TEMPLATE,
        &[
            ("MGMT_MAC", params.mgmt_mac),
            ("MGMT_ADDRESS", params.mgmt_address),
            ("MGMT_PREFIX", &prefix),
            ("MGMT_GATEWAY", params.mgmt_gateway),
        ],
    );
    std::fs::write(seed_dir.join("network-config"), network_config)?;

    Ok(())
}

/// Pack a rendered seed directory into a cidata ISO via `genisoimage`.
pub fn build_seed_iso(runner: &dyn CommandRunner, seed_dir: &Path, iso_path: &Path) -> Result<()> {
    let seed_dir_str = seed_dir.to_string_lossy().into_owned();
    let iso_path_str = iso_path.to_string_lossy().into_owned();
    run_checked(
        runner,
        "genisoimage",
        &[
            "-output",
            &iso_path_str,
            "-volid",
            "cidata",
            "-joliet",
            "-rock",
            &seed_dir_str,
        ],
    )?;
    Ok(())
}

/// Render and pack the seed ISO in one step, returning its path.
pub fn generate_seed(
    runner: &dyn CommandRunner,
    staging_dir: &Path,
    params: &SeedParams,
) -> Result<PathBuf> {
    let seed_dir = staging_dir.join("cloud-init");
    write_seed_files(&seed_dir, params)?;
    let iso_path = staging_dir.join("seed.iso");
    build_seed_iso(runner, &seed_dir, &iso_path)?;
    Ok(iso_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptb_fabric::runner::mock::MockRunner;

    fn sample_params() -> SeedParams<'static> {
        SeedParams {
            instance_id: "alice",
            hostname: "alice.testbed",
            mgmt_mac: "02:aa:bb:cc:dd:00",
            mgmt_address: "10.0.0.5",
            mgmt_prefix: 24,
            mgmt_gateway: "10.0.0.1",
        }
    }

    #[test]
    fn test_render_substitutes_every_hole() {
        let out = render("{{A}}-{{B}}", &[("A", "x"), ("B", "y")]);
        assert_eq!(out, "x-y");
    }

    #[test]
    fn test_write_seed_files_creates_three_files() {
        let dir = tempfile::tempdir().unwrap();
        let params = sample_params();
        write_seed_files(dir.path(), &params).unwrap();

        assert!(dir.path().join("meta-data").exists());
        let user_data = std::fs::read_to_string(dir.path().join("user-data")).unwrap();
        assert!(user_data.contains("alice.testbed"));
        let net_cfg = std::fs::read_to_string(dir.path().join("network-config")).unwrap();
        assert!(net_cfg.contains("10.0.0.5/24"));
        assert!(net_cfg.contains("02:aa:bb:cc:dd:00"));
    }

    #[test]
    fn test_fqdn_is_empty_for_two_part_hostname() {
        assert_eq!(fqdn_for("alice.testbed"), "");
        assert_eq!(fqdn_for("alice.lan.testbed"), "lan.testbed");
    }

    #[test]
    fn test_generate_seed_invokes_genisoimage() {
        let runner = MockRunner::new();
        let dir = tempfile::tempdir().unwrap();
        let params = sample_params();

        let iso = generate_seed(&runner, dir.path(), &params).unwrap();

        assert_eq!(iso, dir.path().join("seed.iso"));
        assert!(runner.calls.borrow().iter().any(|c| c.starts_with("genisoimage")));
    }
}
