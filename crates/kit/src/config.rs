//! Configuration file handling
//!
//! Everything has a default, so running without a configuration file tests
//! the three stock profiles with the built-in ruleset. A `vmit.toml` replaces
//! individual settings; `[[rule]]` and `[[profile]]` arrays replace the
//! defaults wholesale.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::classifier::{default_rules, RuleSpec, Ruleset, INSTALL_COMPLETE};
use crate::hypervisor::VmSpec;
use crate::remote::Credential;
use crate::utils::{is_valid_profile_name, parse_memory_to_mb, parse_size};

/// Directory on the guest the installer payload is copied to.
pub(crate) const REMOTE_PAYLOAD_DIR: &str = "/tmp/vmit-payload";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub paths: PathsConfig,
    pub hypervisor: HypervisorConfig,
    pub ssh: SshConfig,
    pub timeouts: Timeouts,
    pub retention: Retention,
    /// Maximum number of profiles tested at once.
    pub concurrency: usize,
    #[serde(rename = "rule")]
    pub rules: Vec<RuleSpec>,
    #[serde(rename = "profile")]
    pub profiles: Vec<Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            hypervisor: HypervisorConfig::default(),
            ssh: SshConfig::default(),
            timeouts: Timeouts::default(),
            retention: Retention::default(),
            concurrency: 1,
            rules: default_rules(),
            profiles: ["vm", "workstation", "server"]
                .into_iter()
                .map(Profile::named)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub state_file: Utf8PathBuf,
    pub log_dir: Utf8PathBuf,
    /// Local directory copied to the guest before the installer runs.
    pub payload_dir: Option<Utf8PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_file: "/var/tmp/vmit/state.json".into(),
            log_dir: "/var/tmp/vmit/logs".into(),
            payload_dir: None,
        }
    }
}

/// What happens to an instance once its run is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Teardown {
    /// Remove the instance and its disk.
    #[default]
    Destroy,
    /// Keep one `vmit-<profile>-base` instance per profile. Each run reverts
    /// it to the baseline snapshot before starting and again at the end.
    Revert,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HypervisorConfig {
    /// libvirt connection URI
    pub connect: String,
    pub pool_dir: Utf8PathBuf,
    pub network: String,
    /// Installer medium attached as a CD-ROM.
    pub boot_image: Option<Utf8PathBuf>,
    /// Baseline snapshot taken right after an instance is defined.
    pub snapshot: String,
    pub teardown: Teardown,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            connect: "qemu:///system".into(),
            pool_dir: "/var/lib/libvirt/images".into(),
            network: "default".into(),
            boot_image: None,
            snapshot: "clean-state".into(),
            teardown: Teardown::Destroy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    pub user: String,
    pub identity: Option<Utf8PathBuf>,
    pub password: Option<String>,
    /// Credentials for the installed system; fall back to the installer's.
    pub validate_user: Option<String>,
    pub validate_identity: Option<Utf8PathBuf>,
    pub validate_password: Option<String>,
    /// Per-connection timeout in seconds.
    pub connect_timeout: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "nixos".into(),
            identity: None,
            password: Some("nixos".into()),
            validate_user: Some("testuser".into()),
            validate_identity: None,
            validate_password: Some("testuser".into()),
            connect_timeout: 5,
        }
    }
}

impl SshConfig {
    pub fn installer_credential(&self) -> Credential {
        Credential {
            user: self.user.clone(),
            identity: self.identity.clone(),
            password: self.password.clone(),
        }
    }

    pub fn validate_credential(&self) -> Credential {
        match &self.validate_user {
            Some(user) => Credential {
                user: user.clone(),
                identity: self.validate_identity.clone(),
                password: self.validate_password.clone(),
            },
            None => self.installer_credential(),
        }
    }
}

/// Timeouts, all in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub network: u64,
    pub remote_exec: u64,
    pub install: u64,
    pub reboot_grace: u64,
    pub reboot: u64,
    pub validate_command: u64,
    pub run: u64,
    pub poll_interval: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            network: 120,
            remote_exec: 120,
            install: 3600,
            reboot_grace: 30,
            reboot: 300,
            validate_command: 300,
            run: 3 * 3600,
            poll_interval: 2,
        }
    }
}

impl Timeouts {
    pub fn network(&self) -> Duration {
        Duration::from_secs(self.network)
    }
    pub fn remote_exec(&self) -> Duration {
        Duration::from_secs(self.remote_exec)
    }
    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install)
    }
    pub fn reboot_grace(&self) -> Duration {
        Duration::from_secs(self.reboot_grace)
    }
    pub fn reboot(&self) -> Duration {
        Duration::from_secs(self.reboot)
    }
    pub fn validate_command(&self) -> Duration {
        Duration::from_secs(self.validate_command)
    }
    pub fn run(&self) -> Duration {
        Duration::from_secs(self.run)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Retention {
    pub runs_per_profile: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            runs_per_profile: 5,
        }
    }
}

/// A named configuration target under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Profile {
    pub name: String,
    pub memory: String,
    pub vcpus: u32,
    pub disk_size: String,
    pub install_command: String,
    pub target_disk: String,
    /// Extra environment for the installer.
    pub env: BTreeMap<String, String>,
    /// Shell commands run on the installed system; all must exit 0.
    pub validate: Vec<String>,
    pub skip: bool,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: String::new(),
            memory: "4G".into(),
            vcpus: 2,
            disk_size: "20G".into(),
            install_command: format!("{REMOTE_PAYLOAD_DIR}/install.sh"),
            target_disk: "/dev/vda".into(),
            env: BTreeMap::new(),
            validate: vec!["true".into()],
            skip: false,
        }
    }
}

impl Profile {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Hypervisor resources for an instance of this profile.
    pub fn vm_spec(&self, instance_name: &str) -> Result<VmSpec> {
        Ok(VmSpec {
            name: instance_name.to_owned(),
            memory_mb: parse_memory_to_mb(&self.memory)
                .with_context(|| format!("Profile {}: memory", self.name))?,
            vcpus: self.vcpus,
            disk_size: parse_size(&self.disk_size)
                .with_context(|| format!("Profile {}: disk_size", self.name))?,
        })
    }

    /// The single shell command line that runs the installer payload.
    pub fn installer_command_line(&self, elevate: bool) -> Result<String> {
        let mut words: Vec<String> = Vec::new();
        if elevate {
            words.push("sudo".into());
        }
        words.push("env".into());
        let env = [
            ("INSTALL_PROFILE", self.name.as_str()),
            ("INSTALL_DISK", self.target_disk.as_str()),
            ("INSTALL_NONINTERACTIVE", "1"),
        ]
        .into_iter()
        .chain(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        for (k, v) in env {
            let kv = format!("{k}={v}");
            words.push(
                shlex::try_quote(&kv)
                    .map_err(|e| eyre!("Profile {}: {e}", self.name))?
                    .into_owned(),
            );
        }
        // The command itself is a shell fragment and is passed through untouched.
        Ok(format!("{} {}", words.join(" "), self.install_command))
    }
}

impl Config {
    /// Load configuration from `path`, or defaults if no path was given.
    pub fn load(path: Option<&Utf8Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Reading configuration {path}"))?;
        let config: Config =
            toml::from_str(&text).with_context(|| format!("Parsing configuration {path}"))?;
        Ok(config)
    }

    /// Compile the configured ruleset.
    pub fn ruleset(&self) -> Result<Ruleset> {
        Ruleset::new(&self.rules)
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Check everything that would otherwise only fail mid-run.
    pub fn validate(&self) -> Result<()> {
        let rules = self.ruleset()?;
        if !rules.emits_marker(INSTALL_COMPLETE) {
            return Err(eyre!(
                "No marker rule emits {INSTALL_COMPLETE}; no run could ever complete installation"
            ));
        }
        if self.profiles.is_empty() {
            return Err(eyre!("No profiles configured"));
        }
        let mut seen = BTreeSet::new();
        for p in &self.profiles {
            if !is_valid_profile_name(&p.name) {
                return Err(eyre!("Invalid profile name: {:?}", p.name));
            }
            if !seen.insert(p.name.as_str()) {
                return Err(eyre!("Duplicate profile: {}", p.name));
            }
            if p.vcpus == 0 {
                return Err(eyre!("Profile {}: vcpus must be positive", p.name));
            }
            if p.install_command.trim().is_empty() {
                return Err(eyre!("Profile {}: empty install_command", p.name));
            }
            p.vm_spec(&p.name)?;
            p.installer_command_line(false)?;
        }
        let t = &self.timeouts;
        for (name, v) in [
            ("network", t.network),
            ("remote_exec", t.remote_exec),
            ("install", t.install),
            ("reboot", t.reboot),
            ("validate_command", t.validate_command),
            ("run", t.run),
            ("poll_interval", t.poll_interval),
        ] {
            if v == 0 {
                return Err(eyre!("timeouts.{name} must be positive"));
            }
        }
        if self.concurrency == 0 {
            return Err(eyre!("concurrency must be positive"));
        }
        if self.retention.runs_per_profile == 0 {
            return Err(eyre!("retention.runs_per_profile must be positive"));
        }
        if let Some(dir) = &self.paths.payload_dir {
            if !dir.is_dir() {
                return Err(eyre!("payload_dir {dir} is not a directory"));
            }
        }
        Ok(())
    }
}
