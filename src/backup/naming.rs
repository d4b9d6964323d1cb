// dbsnapshot/src/backup/naming.rs
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use regex::Regex;

use crate::config::DatabaseEngine;

/// Second precision; sortable lexicographically.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
pub const COMPRESSION_EXTENSION: &str = "gz";

/// `{database}-{YYYYMMDD-HHMMSS}.{dump_ext}.gz`
///
/// The embedded timestamp is the only age signal the pruner trusts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub database: String,
    pub created_at: DateTime<Utc>,
    pub dump_extension: &'static str,
}

impl ArtifactName {
    pub fn new(database: &str, engine: DatabaseEngine, created_at: DateTime<Utc>) -> Self {
        Self {
            database: database.to_string(),
            created_at: created_at.with_nanosecond(0).unwrap_or(created_at),
            dump_extension: engine.dump_extension(),
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}-{}.{}.{}",
            self.database,
            self.created_at.format(TIMESTAMP_FORMAT),
            self.dump_extension,
            COMPRESSION_EXTENSION
        )
    }
}

/// Recognizes artifact names for one database. Anything that does not match is foreign
/// and must be left alone.
#[derive(Debug, Clone)]
pub struct ArtifactPattern {
    database: String,
    dump_extension: &'static str,
    regex: Regex,
}

impl ArtifactPattern {
    pub fn new(database: &str, engine: DatabaseEngine) -> Self {
        let dump_extension = engine.dump_extension();
        let regex = Regex::new(&format!(
            r"^{}-(\d{{8}}-\d{{6}})\.{}\.{}$",
            regex::escape(database),
            regex::escape(dump_extension),
            COMPRESSION_EXTENSION
        ))
        .expect("artifact pattern is built from escaped literals");
        Self {
            database: database.to_string(),
            dump_extension,
            regex,
        }
    }

    pub fn parse(&self, candidate: &str) -> Option<ArtifactName> {
        let captures = self.regex.captures(candidate)?;
        let stamp = captures.get(1)?.as_str();
        let created_at = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
            .ok()?
            .and_utc();
        Some(ArtifactName {
            database: self.database.clone(),
            created_at,
            dump_extension: self.dump_extension,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn file_name_follows_scheme() {
        let name = ArtifactName::new("depoauto", DatabaseEngine::Postgres, at(2024, 3, 9, 4, 5, 6));
        assert_eq!(name.file_name(), "depoauto-20240309-040506.sql.gz");
    }

    #[test]
    fn sub_second_precision_is_dropped() {
        let created = at(2024, 3, 9, 4, 5, 6).with_nanosecond(750_000_000).unwrap();
        let a = ArtifactName::new("app", DatabaseEngine::Postgres, created);
        let b = ArtifactName::new("app", DatabaseEngine::Postgres, at(2024, 3, 9, 4, 5, 6));
        // Same-second invocations share a name.
        assert_eq!(a.file_name(), b.file_name());

        let c = ArtifactName::new("app", DatabaseEngine::Postgres, at(2024, 3, 9, 4, 5, 7));
        assert_ne!(a.file_name(), c.file_name());
        assert!(a.file_name() < c.file_name());
    }

    #[test]
    fn pattern_parses_own_names() {
        let pattern = ArtifactPattern::new("my-app_db", DatabaseEngine::Postgres);
        let name = ArtifactName::new("my-app_db", DatabaseEngine::Postgres, at(2023, 12, 31, 23, 59, 59));
        let parsed = pattern.parse(&name.file_name()).expect("own name must parse");
        assert_eq!(parsed, name);
    }

    #[test]
    fn pattern_rejects_foreign_names() {
        let pattern = ArtifactPattern::new("app", DatabaseEngine::Postgres);
        for candidate in [
            "other-20240101-000000.sql.gz",
            "app-20240101-000000.sql",
            "app-20240101-000000.sql.gz.sha256",
            "app-2024010-000000.sql.gz",
            "app-20241301-000000.sql.gz",
            "app-20240101-250000.sql.gz",
            ".app-20240101-000000.sql.gz.Xa3b.partial",
            "app-staging-20240101-000000.sql.gz",
            "notes.txt",
        ] {
            assert!(pattern.parse(candidate).is_none(), "{} must not match", candidate);
        }
    }
}
