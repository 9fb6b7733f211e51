pub mod bash;
pub mod edit;
pub mod glob;
pub mod grep;
pub mod read;
pub mod web_fetch;
pub mod write;

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use flotilla_core::error::{FlotillaError, Result};

pub use self::bash::BashTool;
pub use self::edit::EditTool;
pub use self::glob::GlobTool;
pub use self::grep::GrepTool;
pub use self::read::ReadTool;
pub use self::web_fetch::WebFetchTool;
pub use self::write::WriteTool;

/// Resolve a tool-supplied path against the working directory.
pub(crate) fn resolve_path(path: &str, work_dir: &Path) -> PathBuf {
    let candidate = PathBuf::from(path);
    if candidate.is_absolute() {
        candidate
    } else {
        work_dir.join(candidate)
    }
}

/// Decode tool input, mapping schema mismatches onto `invalid_input`.
pub(crate) fn parse_input<T: DeserializeOwned>(tool: &str, input: serde_json::Value) -> Result<T> {
    serde_json::from_value(input)
        .map_err(|e| FlotillaError::invalid_input(format!("{}: {}", tool, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_and_absolute() {
        let wd = Path::new("/work");
        assert_eq!(resolve_path("a/b.md", wd), PathBuf::from("/work/a/b.md"));
        assert_eq!(resolve_path("/etc/hosts", wd), PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn test_parse_input_reports_tool() {
        #[derive(serde::Deserialize, Debug)]
        struct In {
            #[allow(dead_code)]
            path: String,
        }
        let err = parse_input::<In>("read", serde_json::json!({})).unwrap_err();
        assert!(err.is(flotilla_core::error::ErrorKind::InvalidInput));
        assert!(err.to_string().contains("read"));
    }
}
