//! System-wide constants and default paths.

/// Default root directory for Strata state on Linux.
pub const DEFAULT_ROOT: &str = "/var/lib/strata";

/// Subdirectory (relative to the root) holding per-layer metadata.
pub const LAYER_DB_DIR: &str = "layerdb";

/// Subdirectory (relative to the root) holding image configs.
pub const IMAGE_DB_DIR: &str = "imagedb";

/// Subdirectory (relative to the root) handed to graph drivers.
pub const DRIVER_DIR: &str = "drivers";

/// The only digest algorithm accepted for content addressing.
pub const DIGEST_ALGORITHM: &str = "sha256";

/// SHA-256 digest length in hex characters.
pub const SHA256_HEX_LENGTH: usize = 64;

/// Maximum number of layers in a single chain.
///
/// Union filesystems cap how many lower directories can be stacked.
pub const MAX_LAYER_DEPTH: usize = 125;

/// Suffix appended to a mount id to name its init layer.
pub const INIT_LAYER_SUFFIX: &str = "-init";
