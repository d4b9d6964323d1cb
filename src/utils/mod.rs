pub mod interrupt;
pub mod setting;

use std::path::PathBuf;
use which::which;

use crate::errors::BackupError;

/// Locates a database client tool (`pg_dump`, `psql`, ...) in the system PATH.
pub fn find_executable(tool: &'static str) -> Result<PathBuf, BackupError> {
    which(tool).map_err(|_| BackupError::ToolMissing { tool })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn missing_tool_is_reported_by_name() {
        let err = find_executable("dbsnapshot-no-such-tool").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolMissing);
        assert!(err.to_string().contains("dbsnapshot-no-such-tool"));
    }
}
