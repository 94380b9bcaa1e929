//! Loads [`filtermate_core::config::Config`] from a YAML file, mirroring
//! the way this crate's sibling tile server loads its own config:
//! `${VAR}`-style environment substitution via `subst`, with any
//! recognized-but-misplaced or entirely unknown key surfaced as a
//! warning rather than a hard parse failure.

use std::fs;
use std::path::{Path, PathBuf};

use filtermate_core::config::Config;
use thiserror::Error;

/// A key present in the config file that isn't part of [`Config`]'s
/// shape, at the two levels deep the schema actually goes.
const KNOWN_SCHEMA: &[(&str, &[&str])] = &[
    (
        "mv",
        &[
            "feature_threshold_postgres",
            "complexity_threshold_postgres",
            "feature_threshold_spatialite",
            "complexity_threshold_spatialite",
            "bbox_column_min_features",
            "async_cluster_min_features",
            "async_cluster_max_features",
        ],
    ),
    (
        "buffer",
        &[
            "simplify_before_buffer",
            "simplify_tolerance_factor",
            "min_tolerance",
            "max_tolerance",
            "default_segments",
            "endcap_style",
        ],
    ),
    ("predicate_ordering", &["enabled"]),
    (
        "execution",
        &["two_phase_min_complexity", "lazy_cursor_chunk_size", "progressive_max_ids_per_in_clause"],
    ),
    ("cache", &["stats_ttl_ms", "source_geometry_max_entries"]),
];

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, String),
}

/// Reads `path`, substituting `${VAR}` references against the process
/// environment, and returns the parsed config plus any unrecognized
/// keys found (dotted `section.key` paths, for a warning log line).
pub fn read_config(path: &Path) -> Result<(Config, Vec<String>), ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|e| ConfigLoadError::Io(path.to_path_buf(), e))?;
    parse_config(&contents, &OsEnv, path)
}

/// Parses already-read YAML `contents` against `env`, separated from
/// [`read_config`] so tests can substitute a fake environment.
pub fn parse_config<'a, M>(contents: &str, env: &'a M, path: &Path) -> Result<(Config, Vec<String>), ConfigLoadError>
where
    M: subst::VariableMap<'a>,
    M::Value: AsRef<str>,
{
    let raw: serde_yaml::Value =
        serde_yaml::from_str(contents).map_err(|e| ConfigLoadError::Parse(path.to_path_buf(), e.to_string()))?;
    let warnings = unrecognized_keys(&raw);

    let config: Config = subst::yaml::from_str(contents, env).map_err(|e| ConfigLoadError::Parse(path.to_path_buf(), e.to_string()))?;
    Ok((config, warnings))
}

/// A `std::env::var`-backed [`subst::VariableMap`], the same role
/// martin's `OsEnv` plays for its own config loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEnv;

impl<'a> subst::VariableMap<'a> for OsEnv {
    type Value = String;

    fn get(&'a self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

fn unrecognized_keys(value: &serde_yaml::Value) -> Vec<String> {
    let mut warnings = Vec::new();
    let Some(map) = value.as_mapping() else {
        return warnings;
    };
    for (key, val) in map {
        let Some(key) = key.as_str() else { continue };
        match KNOWN_SCHEMA.iter().find(|(section, _)| *section == key) {
            None => warnings.push(key.to_string()),
            Some((_, fields)) => {
                if let Some(sub) = val.as_mapping() {
                    for (subkey, _) in sub {
                        if let Some(subkey) = subkey.as_str() {
                            if !fields.contains(&subkey) {
                                warnings.push(format!("{key}.{subkey}"));
                            }
                        }
                    }
                }
            }
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    struct FauxEnv;

    impl<'a> subst::VariableMap<'a> for FauxEnv {
        type Value = &'static str;

        fn get(&'a self, key: &str) -> Option<&'static str> {
            match key {
                "STATS_TTL" => Some("60000"),
                _ => None,
            }
        }
    }

    #[test]
    fn parses_recognized_config() {
        let yaml = indoc::indoc! {"
            mv:
              feature_threshold_postgres: 200000
            cache:
              stats_ttl_ms: ${STATS_TTL}
        "};
        let (config, warnings) = parse_config(yaml, &FauxEnv, Path::new("<test>")).expect("parse");
        assert_eq!(config.mv.feature_threshold_postgres, 200_000);
        assert_eq!(config.cache.stats_ttl_ms, 60_000);
        assert!(warnings.is_empty());
    }

    #[test]
    fn flags_unrecognized_top_level_and_nested_keys() {
        let yaml = indoc::indoc! {"
            mv:
              feature_threshold_postgres: 200000
              typo_field: 1
            not_a_real_section:
              value: true
        "};
        let (_config, warnings) = parse_config(yaml, &FauxEnv, Path::new("<test>")).expect("parse");
        assert!(warnings.contains(&"mv.typo_field".to_string()));
        assert!(warnings.contains(&"not_a_real_section".to_string()));
    }

    #[test]
    fn missing_env_var_fails_substitution() {
        let yaml = indoc::indoc! {"
            cache:
              stats_ttl_ms: ${UNSET_VAR}
        "};
        assert!(parse_config(yaml, &FauxEnv, Path::new("<test>")).is_err());
    }
}
