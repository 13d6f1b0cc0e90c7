//! Mount options in the comma-separated `slot=N,ro,cache_size=BYTES` form.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::StorageError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MountOptions {
    /// Volume slot exposed as the filesystem root.
    pub slot: usize,
    pub read_only: bool,
    /// Cache byte budget while mounted. `None` keeps the configured budget.
    pub cache_size: Option<u64>,
}

impl MountOptions {
    pub fn slot(slot: usize) -> Self {
        Self {
            slot,
            ..Self::default()
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_cache_size(mut self, bytes: u64) -> Self {
        self.cache_size = Some(bytes);
        self
    }
}

impl FromStr for MountOptions {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut options = Self::default();
        for option in s.split(',').map(str::trim).filter(|option| !option.is_empty()) {
            match option.split_once('=').map(|(key, value)| (key.trim(), value.trim())) {
                None if option == "ro" => options.read_only = true,
                None if option == "rw" => options.read_only = false,
                Some(("slot", value)) => options.slot = parse_number(option, value)?,
                Some(("cache_size", value)) => options.cache_size = Some(parse_number(option, value)?),
                _ => return Err(StorageError::invalid_argument(format!("unknown mount option {option:?}"))),
            }
        }
        Ok(options)
    }
}

fn parse_number<T: FromStr>(option: &str, value: &str) -> Result<T, StorageError> {
    value
        .parse()
        .map_err(|_| StorageError::invalid_argument(format!("bad value in mount option {option:?}")))
}

impl std::fmt::Display for MountOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot={}", self.slot)?;
        if self.read_only {
            f.write_str(",ro")?;
        }
        if let Some(bytes) = self.cache_size {
            write!(f, ",cache_size={bytes}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_options() {
        let options: MountOptions = "slot=1,ro,cache_size=1048576".parse().unwrap();
        assert_eq!(options, MountOptions::slot(1).read_only().with_cache_size(1_048_576));
    }

    #[test]
    fn test_parse_tolerates_spaces_and_empties() {
        let options: MountOptions = " slot = 1 ,, ro ,rw".parse().unwrap();
        assert_eq!(options, MountOptions::slot(1));
    }

    #[test]
    fn test_empty_string_is_defaults() {
        assert_eq!("".parse::<MountOptions>().unwrap(), MountOptions::default());
    }

    #[test]
    fn test_rejects_unknown_and_malformed() {
        for bad in ["slot=x", "cache_size=-1", "noatime", "slot"] {
            assert!(
                matches!(bad.parse::<MountOptions>(), Err(StorageError::InvalidArgument { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_display_matches_parse() {
        let options = MountOptions::slot(0).read_only().with_cache_size(4096);
        assert_eq!(options.to_string(), "slot=0,ro,cache_size=4096");
        assert_eq!(MountOptions::slot(1).to_string(), "slot=1");
        assert_eq!(options.to_string().parse::<MountOptions>().unwrap(), options);
    }
}
