//! Job identity: a unique-per-invocation string tagging intermediate files and
//! deployed artifacts.

use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};

/// Builds the `<basename>-<user>-<YYYY-MM-DD-HH-MM>` job identity.
///
/// Uniqueness is per-minute: launching two jobs with the same executable
/// basename within the same minute produces a collision, which is the
/// documented invariant (see the data model section of the spec) rather than
/// something this function guards against.
pub fn job_identity(local_executable: &Path, user: &str, now: SystemTime) -> String {
    let basename = local_executable
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| local_executable.to_string_lossy().into_owned());
    format!("{}-{}-{}", basename, user, format_minute(now))
}

fn format_minute(t: SystemTime) -> String {
    DateTime::<Utc>::from(t).format("%Y-%m-%d-%H-%M").to_string()
}
