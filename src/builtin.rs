//! Templates and formats compiled into the binary.

use crate::error::ExtractionResult;
use crate::format::FormatRegistry;
use crate::loader::MemoryLoader;

/// The built-in format catalog.
pub const CATALOG: &str = include_str!("../formats/formats.toml");

macro_rules! templates {
    ($($path:literal),* $(,)?) => {
        &[$(($path, include_str!(concat!("../templates/", $path, ".sql")))),*]
    };
}

/// Built-in templates, by logical path.
pub const TEMPLATES: &[(&str, &str)] = templates![
    "rdb/v1_3/createTripTable",
    "rdb/v1_3/createStationTable",
    "rdb/v1_3/createSpeciesListTable",
    "rdb/v1_3/createSpeciesLengthTable",
    "cost/v1_4/injectionStationTable",
    "cost/v1_4/injectionSpeciesLengthTable",
    "free2/v1_9/createTripTable",
    "survival_test/v1_0/injectionStationTable",
    "survival_test/v1_0/createSurvivalTestTable",
    "survival_test/v1_0/createReleaseTable",
    "pmfm_trip/v1_0/injectionTripTable",
    "rjb/v1_0/injectionTripTable",
];

pub fn templates() -> MemoryLoader {
    let mut loader = MemoryLoader::new();
    for (path, text) in TEMPLATES {
        loader.insert(*path, *text);
    }
    loader
}

pub fn registry() -> ExtractionResult<FormatRegistry> {
    FormatRegistry::from_toml(CATALOG)
}
