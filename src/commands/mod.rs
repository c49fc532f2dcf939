pub mod build;
pub mod inventory;
pub mod score;
pub mod status;

pub const BUILD_MANIFEST_FILE: &str = "build_manifest.json";
