//! Object key layout for the staging and production areas.
//!
//! Staging keys are content addressed under a date path: `yy/MM/dd/<hash>`.
//! Production keys reuse the staging key's date segments so a file lands
//! under the day it was staged: `yy/MM/dd/<generated id>/<target name>`.

use chrono::{Datelike, NaiveDate};

use crate::error::{FerryError, Result};

/// A parsed staging key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingKey {
    year: String,
    month: String,
    day: String,
    object: String,
}

impl StagingKey {
    /// Parse `yy/MM/dd/<rest>`; the three date segments must be numeric.
    pub fn parse(key: &str) -> Result<Self> {
        let mut parts = key.splitn(4, '/');
        let mut date_segment = |name: &str| -> Result<String> {
            match parts.next() {
                Some(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
                    Ok(s.to_string())
                }
                _ => Err(FerryError::InvalidKey(
                    key.to_string(),
                    format!("missing or non-numeric {name} segment"),
                )),
            }
        };
        let year = date_segment("year")?;
        let month = date_segment("month")?;
        let day = date_segment("day")?;

        let object = match parts.next() {
            Some(rest) if !rest.is_empty() && rest.split('/').all(|s| !s.is_empty()) => {
                rest.to_string()
            }
            _ => {
                return Err(FerryError::InvalidKey(
                    key.to_string(),
                    "missing object segment after date path".to_string(),
                ));
            }
        };

        Ok(Self {
            year,
            month,
            day,
            object,
        })
    }

    /// Build the staging key for content staged on `date`.
    pub fn for_date(date: NaiveDate, content_hash: &str) -> String {
        format!(
            "{:02}/{:02}/{:02}/{}",
            date.year() % 100,
            date.month(),
            date.day(),
            content_hash
        )
    }

    /// The `yy/MM/dd` prefix.
    pub fn date_path(&self) -> String {
        format!("{}/{}/{}", self.year, self.month, self.day)
    }

    /// Everything after the date path (normally the content hash).
    pub fn object(&self) -> &str {
        &self.object
    }

    /// Production key for a file staged under this key.
    pub fn production_key(&self, generated_id: &str, target_name: &str) -> Result<String> {
        for (what, segment) in [("generated id", generated_id), ("target name", target_name)] {
            if segment.is_empty() || segment.contains('/') || segment == "." || segment == ".." {
                return Err(FerryError::InvalidKey(
                    segment.to_string(),
                    format!("{what} must be a single non-empty path segment"),
                ));
            }
        }
        Ok(format!(
            "{}/{}/{}",
            self.date_path(),
            generated_id,
            target_name
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_key_reuses_staging_date() {
        let key = StagingKey::parse("24/05/01/hash1").unwrap();
        assert_eq!(key.date_path(), "24/05/01");
        assert_eq!(key.object(), "hash1");
        assert_eq!(key.production_key("u1", "a.txt").unwrap(), "24/05/01/u1/a.txt");
    }

    #[test]
    fn test_for_date_formats_two_digit_segments() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert_eq!(StagingKey::for_date(date, "abc"), "24/05/01/abc");
    }

    #[test]
    fn test_rejects_keys_without_date_path() {
        assert!(StagingKey::parse("tmp/path/hash").is_err());
        assert!(StagingKey::parse("24/05/01").is_err());
        assert!(StagingKey::parse("24/05/01/").is_err());
        assert!(StagingKey::parse("24//01/hash").is_err());
    }

    #[test]
    fn test_rejects_target_names_that_escape_the_batch_directory() {
        let key = StagingKey::parse("24/05/01/hash1").unwrap();
        assert!(key.production_key("u1", "../x").is_err());
        assert!(key.production_key("u1", "..").is_err());
        assert!(key.production_key("", "a.txt").is_err());
    }
}
