//! YAML configuration
//!
//! The config file names a timezone, the sources to snapshot, and the
//! remotes to upload to. Values are validated up front so a bad policy or
//! timezone never reaches the planner.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// IANA timezone name governing all bucket arithmetic. Changing it
    /// re-buckets every snapshot and can expire backups.
    pub timezone: String,
    pub sources: Vec<SourceConfig>,
    pub remotes: Vec<RemoteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// The subvolume to back up.
    pub path: PathBuf,
    /// Directory receiving the read-only snapshots.
    pub snapshots: PathBuf,
    pub upload_to_remotes: Vec<UploadConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadConfig {
    /// A remote id declared under `remotes`.
    pub id: String,
    /// Preservation policy, e.g. `1y 3m 30d`.
    pub preserve: String,
    /// Commands the send stream passes through before upload, e.g. a
    /// compressor. Each entry is an argv list.
    #[serde(default)]
    pub pipe_through: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    pub id: String,
    pub s3: remote::S3Remote,
}

impl Config {
    pub fn timezone(&self) -> Result<Tz> {
        self.timezone
            .parse()
            .map_err(|_| anyhow!("unknown timezone: {}", self.timezone))
    }

    pub fn remote(&self, id: &str) -> Result<&RemoteConfig> {
        self.remotes
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| anyhow!("upload refers to undeclared remote: {id}"))
    }

    fn validate(&self) -> Result<()> {
        self.timezone()?;

        let mut remote_ids = HashSet::new();
        for remote in &self.remotes {
            if !remote_ids.insert(remote.id.as_str()) {
                return Err(anyhow!("duplicate remote id: {}", remote.id));
            }
        }

        if self.sources.is_empty() {
            return Err(anyhow!("at least one source is required"));
        }
        for source in &self.sources {
            if source.upload_to_remotes.is_empty() {
                return Err(anyhow!(
                    "source {} uploads to no remotes",
                    source.path.display()
                ));
            }
            for upload in &source.upload_to_remotes {
                self.remote(&upload.id)?;
                schedule::Params::parse(&upload.preserve).map_err(|e| {
                    anyhow!("source {}: {e}", source.path.display())
                })?;
                if upload.pipe_through.iter().any(Vec::is_empty) {
                    return Err(anyhow!("empty pipe_through command"));
                }
            }
        }
        Ok(())
    }
}

pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("could not read {}", path.display()))?;
    parse(&text).with_context(|| format!("invalid config {}", path.display()))
}

pub fn parse(text: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(text)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"
timezone: UTC
sources:
  - path: /data
    snapshots: /snaps
    upload_to_remotes:
      - id: primary
        preserve: 1y 30d
        pipe_through: [[gzip, "-9"]]
remotes:
  - id: primary
    s3:
      bucket: my-bucket
      endpoint:
        region_name: us-east-1
        endpoint_url: http://localhost:9000
"#;

    #[test]
    fn parses_a_full_config() {
        let config = parse(GOOD).unwrap();
        assert_eq!(config.timezone().unwrap(), chrono_tz::Tz::UTC);
        let source = &config.sources[0];
        assert_eq!(source.path, PathBuf::from("/data"));
        assert_eq!(source.upload_to_remotes[0].pipe_through, vec![vec!["gzip", "-9"]]);
        let remote = config.remote("primary").unwrap();
        assert_eq!(remote.s3.bucket, "my-bucket");
        assert_eq!(
            remote.s3.endpoint.endpoint_url.as_deref(),
            Some("http://localhost:9000")
        );
    }

    #[test]
    fn rejects_unknown_timezone() {
        let text = GOOD.replace("timezone: UTC", "timezone: Mars/Olympus");
        assert!(parse(&text).is_err());
    }

    #[test]
    fn rejects_bad_policy() {
        let text = GOOD.replace("preserve: 1y 30d", "preserve: 1parsec");
        assert!(parse(&text).is_err());
    }

    #[test]
    fn rejects_dangling_remote_reference() {
        let text = GOOD.replace("- id: primary\n        preserve", "- id: offsite\n        preserve");
        assert!(parse(&text).is_err());
    }

    #[test]
    fn rejects_duplicate_remote_ids() {
        let dup = GOOD.replace(
            "remotes:\n  - id: primary",
            "remotes:\n  - id: primary\n    s3: {bucket: other}\n  - id: primary",
        );
        assert!(parse(&dup).is_err());
    }

    #[test]
    fn rejects_unknown_fields() {
        let text = GOOD.replace("timezone: UTC", "timezone: UTC\nfrequency: daily");
        assert!(parse(&text).is_err());
    }
}
