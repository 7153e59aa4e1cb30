//! Server version parsing and feature detection.

/// Numeric server version, taken from the `server_version` parameter status.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ServerVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self { major, minor, patch }
    }

    /// Parse the leading `[0-9.]` run of a `server_version` value.
    ///
    /// Development and vendor builds report values like `9.4devel` or
    /// `9.4.1 (Debian 9.4.1-1)`; everything after the numeric run is ignored.
    pub fn parse(value: &str) -> Option<Self> {
        let end = value
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(value.len());
        let mut parts = value[..end].split('.').filter(|p| !p.is_empty());

        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);

        Some(Self { major, minor, patch })
    }
}

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl std::fmt::Debug for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Capability flags derived from the server version.
///
/// Consulted by the reset path (DISCARD ALL vs UNLISTEN) and exposed to the
/// command layer for SQL generation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ServerCaps {
    pub supports_savepoint: bool,
    pub supports_extra_float_digits: bool,
    pub supports_extra_float_digits_3: bool,
    pub supports_application_name: bool,
    pub supports_discard: bool,
    pub supports_ssl_renegotiation_limit: bool,
    pub supports_estring_prefix: bool,
    pub supports_hex_byte_format: bool,
    pub supports_range_types: bool,
    /// Tracked from the `standard_conforming_strings` parameter status,
    /// not from the version.
    pub use_conformant_strings: bool,
}

impl ServerCaps {
    pub fn detect(v: ServerVersion) -> Self {
        Self {
            supports_savepoint: v >= ServerVersion::new(8, 0, 0),
            supports_extra_float_digits: v >= ServerVersion::new(7, 4, 0),
            supports_extra_float_digits_3: v >= ServerVersion::new(9, 0, 0),
            supports_application_name: v >= ServerVersion::new(9, 0, 0),
            supports_discard: v >= ServerVersion::new(8, 3, 0),
            supports_ssl_renegotiation_limit: supports_renegotiation_limit(v),
            supports_estring_prefix: v >= ServerVersion::new(8, 1, 0),
            supports_hex_byte_format: v >= ServerVersion::new(9, 0, 0),
            supports_range_types: v >= ServerVersion::new(9, 2, 0),
            use_conformant_strings: false,
        }
    }
}

/// The `ssl_renegotiation_limit` setting only exists in the maintenance
/// releases that introduced it for each branch.
fn supports_renegotiation_limit(v: ServerVersion) -> bool {
    const RANGES: &[(ServerVersion, ServerVersion)] = &[
        (ServerVersion::new(7, 4, 29), ServerVersion::new(8, 0, 0)),
        (ServerVersion::new(8, 0, 25), ServerVersion::new(8, 1, 0)),
        (ServerVersion::new(8, 1, 21), ServerVersion::new(8, 2, 0)),
        (ServerVersion::new(8, 2, 17), ServerVersion::new(8, 3, 0)),
        (ServerVersion::new(8, 3, 10), ServerVersion::new(8, 4, 0)),
    ];

    v >= ServerVersion::new(8, 4, 3)
        || RANGES.iter().any(|(lo, hi)| v >= *lo && v < *hi)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_plain() {
        assert_eq!(ServerVersion::parse("9.4.1"), Some(ServerVersion::new(9, 4, 1)));
        assert_eq!(ServerVersion::parse("10.3"), Some(ServerVersion::new(10, 3, 0)));
        assert_eq!(ServerVersion::parse("15"), Some(ServerVersion::new(15, 0, 0)));
    }

    #[test]
    fn parse_trims_suffix() {
        assert_eq!(ServerVersion::parse("9.4devel"), Some(ServerVersion::new(9, 4, 0)));
        assert_eq!(
            ServerVersion::parse("9.4.1 (Debian 9.4.1-1)"),
            Some(ServerVersion::new(9, 4, 1)),
        );
        assert_eq!(ServerVersion::parse("devel"), None);
    }

    #[test]
    fn caps_thresholds() {
        let caps = ServerCaps::detect(ServerVersion::new(9, 4, 1));
        assert!(caps.supports_savepoint);
        assert!(caps.supports_application_name);
        assert!(caps.supports_discard);
        assert!(caps.supports_hex_byte_format);
        assert!(caps.supports_range_types);

        let caps = ServerCaps::detect(ServerVersion::new(8, 2, 0));
        assert!(caps.supports_savepoint);
        assert!(caps.supports_estring_prefix);
        assert!(!caps.supports_discard);
        assert!(!caps.supports_application_name);
        assert!(!caps.supports_range_types);

        let caps = ServerCaps::detect(ServerVersion::new(7, 3, 0));
        assert!(!caps.supports_savepoint);
        assert!(!caps.supports_extra_float_digits);
    }

    #[test]
    fn renegotiation_limit_ranges() {
        assert!(supports_renegotiation_limit(ServerVersion::new(9, 4, 0)));
        assert!(supports_renegotiation_limit(ServerVersion::new(8, 4, 3)));
        assert!(!supports_renegotiation_limit(ServerVersion::new(8, 4, 2)));
        assert!(supports_renegotiation_limit(ServerVersion::new(8, 3, 10)));
        assert!(!supports_renegotiation_limit(ServerVersion::new(8, 3, 9)));
        assert!(supports_renegotiation_limit(ServerVersion::new(7, 4, 30)));
        assert!(!supports_renegotiation_limit(ServerVersion::new(7, 4, 28)));
    }
}
