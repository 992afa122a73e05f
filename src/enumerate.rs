//! Drive enumeration seam.
//!
//! Platform device discovery and type inference live outside the core; the
//! core only consumes the listing. The binary uses the config-backed
//! implementation; a real platform enumerator plugs in behind the same
//! trait.

use async_trait::async_trait;

use crate::config::Config;
use crate::domain::{normalize_letter, DriveKind, DriveSpec};

/// One discovered volume.
#[derive(Debug, Clone)]
pub struct EnumeratedDrive {
    pub letter: String,
    pub kind: DriveKind,
    pub size_bytes: Option<u64>,
    pub removable: bool,
    pub spec: DriveSpec,
}

#[async_trait]
pub trait DriveEnumerator: Send + Sync {
    async fn list(&self) -> Vec<EnumeratedDrive>;
}

/// Enumerator backed by the `[drives]` config table.
pub struct ConfigEnumerator {
    drives: Vec<EnumeratedDrive>,
}

impl ConfigEnumerator {
    pub fn new(config: &Config) -> Self {
        let drives = config
            .drives
            .iter()
            .filter_map(|(raw, spec)| {
                let letter = match normalize_letter(raw) {
                    Some(letter) => letter,
                    None => {
                        tracing::warn!(raw = %raw, "Ignoring drive with invalid letter");
                        return None;
                    }
                };
                Some(EnumeratedDrive {
                    letter,
                    kind: spec.kind,
                    size_bytes: None,
                    removable: spec.kind == DriveKind::Removable,
                    spec: spec.clone(),
                })
            })
            .collect();
        Self { drives }
    }
}

#[async_trait]
impl DriveEnumerator for ConfigEnumerator {
    async fn list(&self) -> Vec<EnumeratedDrive> {
        self.drives.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_config_enumerator_normalizes_letters() {
        let yaml = r#"
drives:
  "e:":
    interval-sec: 20
    type: hdd
  "bogus-name":
    interval-sec: 20
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let listed = ConfigEnumerator::new(&config).list().await;

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].letter, "E");
        assert_eq!(listed[0].kind, DriveKind::Hdd);
        assert!(!listed[0].removable);
    }
}
