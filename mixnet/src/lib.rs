//! This crate rexports all mixnet crates in mixnet-rs.

pub use mixnet_core as core;
pub use mixnet_crypto as crypto;
pub use mixnet_packet as packet;

/// The mixnet crate version string in the form "major.minor.patch" (e.g. "1.2.3")
pub fn crate_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
/// The mixnet crate major version represented as unsigned integer
pub fn crate_version_major() -> u32 {
    env!("CARGO_PKG_VERSION_MAJOR").parse().expect("Invalid major version")
}
/// The mixnet crate minor version represented as unsigned integer
pub fn crate_version_minor() -> u32 {
    env!("CARGO_PKG_VERSION_MINOR").parse().expect("Invalid minor version")
}
/// The mixnet crate patch version represented as unsigned integer
pub fn crate_version_patch() -> u32 {
    env!("CARGO_PKG_VERSION_PATCH").parse().expect("Invalid patch version")
}
