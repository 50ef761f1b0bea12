//! Version strings for the clonifier binary.
//!
//! Release builds may set `CLONIFIER_GIT_REV` at compile time to embed the
//! revision they were built from.

use std::sync::LazyLock;

/// The package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git revision baked in at build time (empty string if not set).
pub const GIT_REV: &str = match option_env!("CLONIFIER_GIT_REV") {
    Some(rev) => rev,
    None => "",
};

static FULL_VERSION: LazyLock<String> = LazyLock::new(|| {
    if GIT_REV.is_empty() {
        PKG_VERSION.to_string()
    } else {
        format!("{} ({})", PKG_VERSION, GIT_REV)
    }
});

static LONG_VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}\nwire protocol: JSON lines, binary format v{}",
        full_version(),
        crate::worker::engine::BIN_FORMAT_VERSION
    )
});

/// `"X.Y.Z"`, or `"X.Y.Z (abcdef0)"` when built with a git revision.
///
/// ```
/// use clonifier::version::full_version;
///
/// assert!(full_version().starts_with(env!("CARGO_PKG_VERSION")));
/// ```
pub fn full_version() -> String {
    FULL_VERSION.clone()
}

/// Version for clap's `-V`.
pub fn clap_version() -> &'static str {
    FULL_VERSION.as_str()
}

/// Version for clap's `--version`, with the sequence format revision.
pub fn long_version() -> &'static str {
    LONG_VERSION.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_version_format() {
        let version = full_version();
        if GIT_REV.is_empty() {
            assert_eq!(version, PKG_VERSION);
        } else {
            assert!(version.contains(GIT_REV));
        }
    }

    #[test]
    fn test_clap_version_is_full_version() {
        assert_eq!(clap_version(), full_version());
    }

    #[test]
    fn test_long_version_names_format() {
        let long = long_version();
        assert!(long.starts_with(&full_version()));
        assert!(long.contains("binary format v"));
    }
}
