//! Top-level process config, the JSON file passed on the command line
//! (spec.md §6).

use serde::Deserialize;
use std::path::PathBuf;

/// One capture endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureConfig {
    /// Live pcap capture.
    Pcap {
        /// Interface name.
        interface: String,
        /// BPF filter string.
        filter: String,
    },
    /// Listening UDP/TCP socket.
    Socket {
        /// Address to bind.
        #[serde(rename = "listen-on")]
        listen_on: String,
        /// Port, either a bare number or a string (operators sometimes quote
        /// it in existing config files).
        port: PortValue,
    },
}

/// A port given as either a JSON number or string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    /// Numeric form.
    Number(u16),
    /// String form.
    Text(String),
}

/// `templates` block.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplatesConfig {
    /// Template cache file path, consumed only by the (external) decoder.
    pub db: PathBuf,
    /// Whether to accept templates whose epoch is ahead of wall-clock.
    #[serde(rename = "allow-templates-in-future", default)]
    pub allow_templates_in_future: bool,
}

/// Top-level process config.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Device list file.
    pub devices: PathBuf,
    /// Root directory of monitoring-object subdirectories.
    #[serde(rename = "mo-dir")]
    pub mo_dir: PathBuf,
    /// FWM SQL export directory.
    #[serde(rename = "export-dir")]
    pub export_dir: PathBuf,
    /// IP-list directory (filter DSL include files, if supported).
    #[serde(rename = "iplists-dir")]
    pub iplists_dir: PathBuf,
    /// MAVG notification-file directory.
    #[serde(rename = "notifications-dir")]
    pub notifications_dir: PathBuf,
    /// CLSF directory tree root.
    #[serde(rename = "clsf-dir")]
    pub clsf_dir: PathBuf,
    /// GeoIP database path.
    pub geodb: PathBuf,
    /// SQL-exporter script invoked (no arguments) once per FWM dumper pass
    /// that produced at least one export file (spec.md §4.5 "Post-emit").
    #[serde(rename = "db-exporter-path", default)]
    pub db_exporter_path: Option<String>,
    /// Template cache config.
    pub templates: TemplatesConfig,
    /// NetFlow/IPFIX capture endpoints.
    #[serde(default)]
    pub capture: Vec<CaptureConfig>,
    /// sFlow capture endpoints.
    #[serde(rename = "sflow-capture", default)]
    pub sflow_capture: Vec<CaptureConfig>,
}

impl Config {
    /// Loads and parses a config file from disk.
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| crate::error::FlowError::Config {
            path: path.display().to_string(),
            msg: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sample_config() {
        let json = r#"{
            "devices": "/etc/flowcore/devices",
            "mo-dir": "/etc/flowcore/mo",
            "export-dir": "/var/lib/flowcore/export",
            "iplists-dir": "/etc/flowcore/iplists",
            "notifications-dir": "/var/lib/flowcore/notif",
            "clsf-dir": "/var/lib/flowcore/clsf",
            "geodb": "/usr/share/GeoIP/GeoIP2-City.mmdb",
            "db-exporter-path": "/usr/local/bin/flowcore-export.sh",
            "templates": { "db": "/var/lib/flowcore/templates", "allow-templates-in-future": false },
            "capture": [ { "pcap": {"interface":"eth0","filter":"udp port 2055"} } ],
            "sflow-capture": [ { "socket": {"listen-on":"0.0.0.0","port":6343} } ]
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.capture.len(), 1);
        assert_eq!(cfg.sflow_capture.len(), 1);
        assert_eq!(cfg.db_exporter_path.as_deref(), Some("/usr/local/bin/flowcore-export.sh"));
    }

    #[test]
    fn db_exporter_path_defaults_to_none() {
        let json = r#"{
            "devices": "/etc/flowcore/devices",
            "mo-dir": "/etc/flowcore/mo",
            "export-dir": "/var/lib/flowcore/export",
            "iplists-dir": "/etc/flowcore/iplists",
            "notifications-dir": "/var/lib/flowcore/notif",
            "clsf-dir": "/var/lib/flowcore/clsf",
            "geodb": "/usr/share/GeoIP/GeoIP2-City.mmdb",
            "templates": { "db": "/var/lib/flowcore/templates", "allow-templates-in-future": false }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert!(cfg.db_exporter_path.is_none());
    }
}
