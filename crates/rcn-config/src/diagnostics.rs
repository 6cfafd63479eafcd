use serde::de::DeserializeOwned;

/// Non-fatal findings from loading a config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiagnostics {
    /// Keys the schema does not know, as full TOML paths (`mapping.max_dept`).
    pub unknown_keys: Vec<String>,
    pub warnings: Vec<ConfigWarning>,
}

impl ConfigDiagnostics {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unknown_keys.is_empty() && self.warnings.is_empty()
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    InvalidValue { toml_path: String, message: String },
    LoggingLevelInvalid { value: String, normalized: String },
}

pub(crate) fn deserialize_toml_with_unknown_keys<T: DeserializeOwned>(
    text: &str,
) -> Result<(T, Vec<String>), toml::de::Error> {
    let mut unknown = Vec::<String>::new();
    let deserializer = toml::de::Deserializer::new(text);
    let value = serde_ignored::deserialize(deserializer, |path| {
        unknown.push(normalize_serde_ignored_path(path));
    })?;
    unknown.sort();
    unknown.dedup();
    Ok((value, unknown))
}

fn normalize_serde_ignored_path(path: serde_ignored::Path) -> String {
    // `serde_ignored` renders a leading `.` and sequence indices as `.0`.
    let raw = path.to_string();
    let raw = raw.trim_start_matches('.');
    raw.split('.')
        .enumerate()
        .fold(String::new(), |mut out, (idx, segment)| {
            let is_index =
                idx > 0 && !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit());
            if is_index {
                out.push('[');
                out.push_str(segment);
                out.push(']');
                return out;
            }

            if !out.is_empty() {
                out.push('.');
            }
            out.push_str(segment);
            out
        })
}
