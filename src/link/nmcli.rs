use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info, warn};

use super::{probe_local_address, LinkError, LinkInfo, LinkSettings, NetworkLink};

/// Wi-Fi association through NetworkManager's command line client.
#[derive(Debug, Clone)]
pub struct NmcliLink {
    program: PathBuf,
}

impl Default for NmcliLink {
    fn default() -> Self {
        Self {
            program: PathBuf::from("nmcli"),
        }
    }
}

impl NmcliLink {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, command: &'static str, args: &[String]) -> Result<(), LinkError> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| LinkError::Spawn { command, source })?;

        if output.status.success() {
            return Ok(());
        }
        Err(LinkError::CommandFailed {
            command,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

impl NetworkLink for NmcliLink {
    fn associate(&mut self, settings: &LinkSettings) -> Result<LinkInfo, LinkError> {
        let ssid = settings
            .ssid
            .as_deref()
            .ok_or(LinkError::NotConfigured("network.ssid"))?;

        if let Err(e) = self.run("nmcli general hostname", &hostname_args(settings)) {
            warn!("Could not set hostname {}: {}", settings.hostname, e);
        }

        info!("Connecting to SSID {}...", ssid);
        self.run("nmcli device wifi connect", &connect_args(ssid, settings))?;

        let address = probe_local_address(&settings.probe_host, settings.probe_port)?;
        info!("Connected to SSID {}, IP {}", ssid, address);
        Ok(LinkInfo { address })
    }
}

fn hostname_args(settings: &LinkSettings) -> Vec<String> {
    vec![
        "general".to_string(),
        "hostname".to_string(),
        settings.hostname.clone(),
    ]
}

fn connect_args(ssid: &str, settings: &LinkSettings) -> Vec<String> {
    let mut args = vec![
        "--wait".to_string(),
        settings.wait.as_secs().max(1).to_string(),
        "device".to_string(),
        "wifi".to_string(),
        "connect".to_string(),
        ssid.to_string(),
    ];
    if let Some(password) = &settings.password {
        args.push("password".to_string());
        args.push(password.clone());
    }
    args.push("ifname".to_string());
    args.push(settings.interface.clone());
    debug!("nmcli connect on {} (wait {}s)", settings.interface, args[1]);
    args
}
