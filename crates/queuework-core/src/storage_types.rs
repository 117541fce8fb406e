use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Disk kinds a blob can live on.
///
/// Documents and archive jobs record the disk by name (`s3`, `local`); the
/// storage layer picks the matching backend at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    Local,
}

impl StorageBackend {
    /// Remote object disks support ranged reads and signed URLs natively.
    pub fn is_remote(&self) -> bool {
        matches!(self, StorageBackend::S3)
    }
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "s3" => Ok(StorageBackend::S3),
            "local" => Ok(StorageBackend::Local),
            _ => Err(anyhow::anyhow!("Invalid storage backend: {}", s)),
        }
    }
}

impl Display for StorageBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            StorageBackend::S3 => write!(f, "s3"),
            StorageBackend::Local => write!(f, "local"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("S3".parse::<StorageBackend>().unwrap(), StorageBackend::S3);
        assert_eq!(
            "local".parse::<StorageBackend>().unwrap(),
            StorageBackend::Local
        );
        assert!("nfs".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn only_s3_is_remote() {
        assert!(StorageBackend::S3.is_remote());
        assert!(!StorageBackend::Local.is_remote());
    }
}
