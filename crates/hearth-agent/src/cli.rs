//! Command line of the agent launcher.

use clap::Parser;
use hearth_config::system::DEFAULT_AGENT_BIND;
use hearth_config::{AgentSettings, load_agent_settings};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "hearth-agent")]
#[command(about = "Runs Hearth recipes on behalf of a master", long_about = None)]
pub struct Args {
    /// Agent settings file (KDL)
    #[arg(long, env = "HEARTH_AGENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Name the master knows this agent by
    #[arg(long, env = "HEARTH_AGENT_NAME")]
    pub name: Option<String>,

    /// Address to listen on
    #[arg(long, env = "HEARTH_AGENT_BIND")]
    pub bind: Option<SocketAddr>,

    /// Directory for working copies and recipe output
    #[arg(long, env = "HEARTH_AGENT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Resource this agent offers, as `name` or `name=version`
    #[arg(long = "resource", value_parser = parse_resource)]
    pub resources: Vec<(String, Option<String>)>,

    /// Log as JSON lines
    #[arg(long, env = "HEARTH_LOG_JSON")]
    pub log_json: bool,
}

impl Args {
    /// Settings from the config file, if any, overridden by flags.
    pub fn settings(&self) -> anyhow::Result<AgentSettings> {
        let mut settings = match &self.config {
            Some(path) => load_agent_settings(path)?,
            None => AgentSettings {
                name: self
                    .name
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("--name is required without --config"))?,
                bind: DEFAULT_AGENT_BIND.parse()?,
                data_dir: self
                    .data_dir
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("--data-dir is required without --config"))?,
                resources: BTreeMap::new(),
            },
        };

        if let Some(name) = &self.name {
            settings.name = name.clone();
        }
        if let Some(bind) = self.bind {
            settings.bind = bind;
        }
        if let Some(data_dir) = &self.data_dir {
            settings.data_dir = data_dir.clone();
        }
        settings.resources.extend(self.resources.iter().cloned());
        Ok(settings)
    }
}

fn parse_resource(value: &str) -> Result<(String, Option<String>), String> {
    let (name, version) = match value.split_once('=') {
        Some((name, version)) => (name, Some(version.to_string())),
        None => (value, None),
    };
    if name.is_empty() {
        return Err(format!("invalid resource '{value}'"));
    }
    Ok((name.to_string(), version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_flags_without_config() {
        let args = Args::try_parse_from([
            "hearth-agent",
            "--name",
            "linux-1",
            "--data-dir",
            "/var/lib/hearth",
            "--resource",
            "gcc=13",
            "--resource",
            "docker",
        ])
        .unwrap();
        let settings = args.settings().unwrap();

        assert_eq!(settings.name, "linux-1");
        assert_eq!(settings.bind.port(), 8765);
        assert_eq!(settings.data_dir, Path::new("/var/lib/hearth"));
        assert_eq!(settings.resources.get("gcc"), Some(&Some("13".to_string())));
        assert_eq!(settings.resources.get("docker"), Some(&None));
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agent.kdl");
        std::fs::write(
            &path,
            r#"
            name "from-file"
            bind "127.0.0.1:9000"
            data-dir "/srv/hearth"
            resource "make"
            "#,
        )
        .unwrap();

        let args = Args::try_parse_from([
            "hearth-agent",
            "--config",
            path.to_str().unwrap(),
            "--bind",
            "127.0.0.1:9100",
        ])
        .unwrap();
        let settings = args.settings().unwrap();

        assert_eq!(settings.name, "from-file");
        assert_eq!(settings.bind.port(), 9100);
        assert_eq!(settings.data_dir, Path::new("/srv/hearth"));
        assert!(settings.resources.contains_key("make"));
    }

    #[test]
    fn test_name_is_required_without_config() {
        let args = Args::try_parse_from(["hearth-agent", "--data-dir", "/tmp/x"]).unwrap();
        assert!(args.settings().is_err());
        assert!(parse_resource("=1").is_err());
    }
}
