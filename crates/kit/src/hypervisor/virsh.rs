//! libvirt backend driving `virsh` and `qemu-img`.

use std::io::Write as _;
use std::net::IpAddr;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use indoc::formatdoc;
use rand::Rng;
use tracing::{debug, info, warn};

use super::{Hypervisor, HypervisorError, VmInstance, VmSpec, VmState};
use crate::command_run::{CommandError, CommandRun};
use crate::config::HypervisorConfig;

/// Create a virsh command with optional connection URI
fn virsh_command(connect_uri: Option<&str>) -> Command {
    let mut cmd = Command::new("virsh");
    if let Some(uri) = connect_uri {
        cmd.arg("-c").arg(uri);
    }
    cmd
}

/// Errors virsh reports when the domain is already gone or already stopped.
fn is_absent(e: &CommandError) -> bool {
    let stderr = e.stderr();
    [
        "failed to get domain",
        "Domain not found",
        "domain is not running",
        "no domain with matching name",
    ]
    .iter()
    .any(|needle| stderr.contains(needle))
}

/// Whether `virsh domstate` output describes a domain that is still executing.
fn is_active_state(state: &str) -> bool {
    matches!(
        state.trim(),
        "running" | "paused" | "in shutdown" | "pmsuspended" | "blocked"
    )
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

/// Locally administered MAC in the range libvirt itself uses.
fn generate_mac() -> String {
    let mut rng = rand::rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.random::<u8>(),
        rng.random::<u8>(),
        rng.random::<u8>()
    )
}

/// Parse the table printed by `virsh domifaddr`, returning the first
/// address, preferring IPv4.
fn parse_domifaddr(output: &str) -> Option<IpAddr> {
    let addrs: Vec<IpAddr> = output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            // Name  MAC address  Protocol  Address
            let addr = cols.get(3)?;
            let ip = addr.split('/').next()?;
            ip.parse().ok()
        })
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

/// Parse `virsh net-dhcp-leases`, returning the address leased to `mac`.
fn parse_dhcp_leases(output: &str, mac: &str) -> Option<IpAddr> {
    output.lines().find_map(|line| {
        let cols: Vec<&str> = line.split_whitespace().collect();
        // Expiry date (2 columns)  MAC  Protocol  IP address  Hostname  Client ID
        if cols.len() < 5 || !cols[2].eq_ignore_ascii_case(mac) {
            return None;
        }
        cols[4].split('/').next()?.parse().ok()
    })
}

fn domain_xml(spec: &VmSpec, disk: &Utf8Path, mac: &str, cfg: &HypervisorConfig) -> String {
    let cdrom = cfg
        .boot_image
        .as_deref()
        .map(|iso| {
            formatdoc! {"
                    <disk type='file' device='cdrom'>
                      <driver name='qemu' type='raw'/>
                      <source file='{iso}'/>
                      <target dev='sda' bus='sata'/>
                      <readonly/>
                    </disk>",
                iso = xml_escape(iso.as_str())
            }
        })
        .unwrap_or_default();
    formatdoc! {"
        <domain type='kvm'>
          <name>{name}</name>
          <memory unit='MiB'>{memory}</memory>
          <vcpu>{vcpus}</vcpu>
          <os>
            <type arch='x86_64' machine='q35'>hvm</type>
            <boot dev='hd'/>
            <boot dev='cdrom'/>
          </os>
          <features><acpi/><apic/></features>
          <cpu mode='host-passthrough'/>
          <on_reboot>restart</on_reboot>
          <devices>
            <disk type='file' device='disk'>
              <driver name='qemu' type='qcow2'/>
              <source file='{disk}'/>
              <target dev='vda' bus='virtio'/>
            </disk>
        {cdrom}
            <interface type='network'>
              <source network='{network}'/>
              <mac address='{mac}'/>
              <model type='virtio'/>
            </interface>
            <serial type='pty'/>
            <console type='pty'/>
          </devices>
        </domain>
        ",
        name = xml_escape(&spec.name),
        memory = spec.memory_mb,
        vcpus = spec.vcpus,
        disk = xml_escape(disk.as_str()),
        network = xml_escape(&cfg.network),
    }
}

/// [`Hypervisor`] backed by a libvirt connection.
#[derive(Debug, Clone)]
pub(crate) struct Virsh {
    cfg: HypervisorConfig,
}

impl Virsh {
    pub(crate) fn new(cfg: HypervisorConfig) -> Self {
        Self { cfg }
    }

    fn virsh(&self) -> Command {
        virsh_command(Some(self.cfg.connect.as_str()))
    }

    fn run_virsh(&self, op: &str, args: &[&str]) -> Result<(), HypervisorError> {
        self.virsh()
            .args(args)
            .run()
            .map_err(|e| HypervisorError::from_command(op, e))
    }

    fn virsh_output(&self, op: &str, args: &[&str]) -> Result<String, HypervisorError> {
        self.virsh()
            .args(args)
            .run_get_string()
            .map_err(|e| HypervisorError::from_command(op, e))
    }

    /// Like [`Self::run_virsh`] but treats an absent domain as success.
    fn run_virsh_idempotent(&self, op: &str, args: &[&str]) -> Result<(), HypervisorError> {
        match self.virsh().args(args).run() {
            Ok(()) => Ok(()),
            Err(e) if is_absent(&e) => {
                debug!("{op}: already absent: {}", e.stderr());
                Ok(())
            }
            Err(e) => Err(HypervisorError::from_command(op, e)),
        }
    }

    fn disk_path(&self, name: &str) -> Utf8PathBuf {
        self.cfg.pool_dir.join(format!("{name}.qcow2"))
    }

    fn dhcp_address(&self, mac: &str) -> Result<Option<IpAddr>, HypervisorError> {
        let out = self.virsh_output("net-dhcp-leases", &["net-dhcp-leases", &self.cfg.network])?;
        Ok(parse_dhcp_leases(&out, mac))
    }
}

impl Hypervisor for Virsh {
    fn create(&self, spec: &VmSpec) -> Result<VmInstance, HypervisorError> {
        let disk = self.disk_path(&spec.name);
        info!("Creating {} ({} MiB, {} vCPU)", spec.name, spec.memory_mb, spec.vcpus);
        Command::new("qemu-img")
            .args(["create", "-q", "-f", "qcow2", disk.as_str()])
            .arg(spec.disk_size.to_string())
            .run()
            .map_err(|e| HypervisorError::from_command("create-disk", e))?;

        let mac = generate_mac();
        let xml = domain_xml(spec, &disk, &mac, &self.cfg);
        let define = (|| {
            let mut tmp = tempfile::Builder::new()
                .prefix(&spec.name)
                .suffix(".xml")
                .tempfile()
                .map_err(|source| HypervisorError::Spawn {
                    tool: "tempfile".into(),
                    source,
                })?;
            tmp.write_all(xml.as_bytes())
                .map_err(|source| HypervisorError::Spawn {
                    tool: "tempfile".into(),
                    source,
                })?;
            let path = tmp.path().to_string_lossy().into_owned();
            self.run_virsh("define", &["define", &path])
        })();
        if let Err(e) = define {
            if let Err(rm) = std::fs::remove_file(&disk) {
                warn!("Failed to remove {disk}: {rm}");
            }
            return Err(e);
        }

        Ok(VmInstance {
            name: spec.name.clone(),
            disk_path: disk,
            mac: Some(mac),
            address: None,
            state: VmState::Defined,
        })
    }

    fn start(&self, vm: &VmInstance) -> Result<(), HypervisorError> {
        self.run_virsh("start", &["start", &vm.name])
    }

    fn stop(&self, vm: &VmInstance, force: bool) -> Result<(), HypervisorError> {
        if force {
            self.run_virsh_idempotent("stop", &["destroy", &vm.name])
        } else {
            self.run_virsh_idempotent("stop", &["shutdown", &vm.name])
        }
    }

    fn snapshot_create(&self, vm: &VmInstance, name: &str) -> Result<(), HypervisorError> {
        self.run_virsh(
            "snapshot-create",
            &[
                "snapshot-create-as",
                "--domain",
                &vm.name,
                "--name",
                name,
                "--description",
                "Clean installer state",
                "--atomic",
            ],
        )
    }

    fn snapshot_revert(&self, vm: &VmInstance, name: &str) -> Result<(), HypervisorError> {
        self.run_virsh(
            "snapshot-revert",
            &["snapshot-revert", "--domain", &vm.name, "--snapshotname", name],
        )
    }

    fn snapshot_list(&self, vm: &VmInstance) -> Result<Vec<String>, HypervisorError> {
        let out = self.virsh_output(
            "snapshot-list",
            &["snapshot-list", "--domain", &vm.name, "--name"],
        )?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }

    fn snapshot_delete(&self, vm: &VmInstance, name: &str) -> Result<(), HypervisorError> {
        self.run_virsh(
            "snapshot-delete",
            &["snapshot-delete", "--domain", &vm.name, "--snapshotname", name],
        )
    }

    fn is_active(&self, vm: &VmInstance) -> Result<bool, HypervisorError> {
        let out = self.virsh_output("domstate", &["domstate", &vm.name])?;
        Ok(is_active_state(&out))
    }

    fn get_address(&self, vm: &VmInstance) -> Result<Option<IpAddr>, HypervisorError> {
        let out = self.virsh_output(
            "domifaddr",
            &["domifaddr", &vm.name, "--source", "lease"],
        )?;
        if let Some(ip) = parse_domifaddr(&out) {
            return Ok(Some(ip));
        }
        match vm.mac.as_deref() {
            Some(mac) => self.dhcp_address(mac),
            None => Ok(None),
        }
    }

    fn destroy(&self, vm: &VmInstance) -> Result<(), HypervisorError> {
        self.run_virsh_idempotent("destroy", &["destroy", &vm.name])?;
        self.run_virsh_idempotent(
            "undefine",
            &["undefine", &vm.name, "--snapshots-metadata", "--nvram"],
        )?;
        match std::fs::remove_file(&vm.disk_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(HypervisorError::Spawn {
                    tool: format!("rm {}", vm.disk_path),
                    source,
                })
            }
        }
        info!("Destroyed {}", vm.name);
        Ok(())
    }

    fn list_instances(&self, prefix: &str) -> Result<Vec<String>, HypervisorError> {
        let out = self.virsh_output("list", &["list", "--all", "--name"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|n| n.starts_with(prefix))
            .map(ToOwned::to_owned)
            .collect())
    }

    fn adopt(&self, name: &str) -> VmInstance {
        VmInstance {
            name: name.to_owned(),
            disk_path: self.disk_path(name),
            mac: None,
            address: None,
            state: VmState::Defined,
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_parse_domifaddr() {
        let out = indoc! {"
             Name       MAC address          Protocol     Address
            -------------------------------------------------------------------------------
             vnet3      52:54:00:6b:3c:58    ipv6         fe80::5054:ff:fe6b:3c58/64
             vnet3      52:54:00:6b:3c:58    ipv4         192.168.122.45/24
        "};
        assert_eq!(
            parse_domifaddr(out),
            Some("192.168.122.45".parse().unwrap())
        );
        assert_eq!(parse_domifaddr(""), None);
        assert_eq!(
            parse_domifaddr(" Name MAC address Protocol Address\n------\n"),
            None
        );
    }

    #[test]
    fn test_parse_dhcp_leases() {
        let out = indoc! {"
             Expiry Time           MAC address         Protocol   IP address          Hostname   Client ID or DUID
            ------------------------------------------------------------------------------------------------------------
             2026-10-16 12:00:01   52:54:00:aa:bb:cc   ipv4       192.168.122.77/24   nixos      01:52:54:00:aa:bb:cc
        "};
        assert_eq!(
            parse_dhcp_leases(out, "52:54:00:AA:BB:CC"),
            Some("192.168.122.77".parse().unwrap())
        );
        assert_eq!(parse_dhcp_leases(out, "52:54:00:00:00:01"), None);
    }

    #[test]
    fn test_is_active_state() {
        assert!(is_active_state("running\n\n"));
        assert!(is_active_state("paused"));
        assert!(!is_active_state("shut off\n"));
        assert!(!is_active_state("crashed"));
    }

    #[test]
    fn test_is_absent() {
        let err = |stderr: &str| CommandError::Exit {
            program: "virsh".into(),
            exit_code: Some(1),
            stderr: stderr.into(),
        };
        assert!(is_absent(&err(
            "error: failed to get domain 'vmit-vm-x'"
        )));
        assert!(is_absent(&err("error: Requested operation is not valid: domain is not running")));
        assert!(!is_absent(&err("error: permission denied")));
    }

    #[test]
    fn test_domain_xml() {
        let cfg = HypervisorConfig {
            boot_image: Some("/isos/nixos <latest>.iso".into()),
            ..Default::default()
        };
        let spec = VmSpec {
            name: "vmit-vm-20260101000000-0001".into(),
            memory_mb: 4096,
            vcpus: 2,
            disk_size: 20 << 30,
        };
        let xml = domain_xml(
            &spec,
            Utf8Path::new("/var/lib/libvirt/images/x.qcow2"),
            "52:54:00:01:02:03",
            &cfg,
        );
        assert!(xml.contains("<name>vmit-vm-20260101000000-0001</name>"));
        assert!(xml.contains("<memory unit='MiB'>4096</memory>"));
        assert!(xml.contains("<source network='default'/>"));
        assert!(xml.contains("nixos &lt;latest&gt;.iso"));
        assert!(xml.find("<boot dev='hd'/>") < xml.find("<boot dev='cdrom'/>"));
    }

    #[test]
    fn test_generate_mac() {
        let mac = generate_mac();
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
    }
}
