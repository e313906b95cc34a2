use std::path::{Path, PathBuf};

use super::{SETTINGS_FILE_NAME, SettingsError, VigilSettings};
use crate::app_dirs;

/// Resolve the settings file path, ensuring the parent directory exists.
pub fn settings_path() -> Result<PathBuf, SettingsError> {
    Ok(app_dirs::app_root_dir()?.join(SETTINGS_FILE_NAME))
}

/// Load settings from the app root, returning defaults when no file exists.
pub fn load_or_default() -> Result<VigilSettings, SettingsError> {
    let path = settings_path()?;
    if !path.exists() {
        tracing::info!(path = %path.display(), "no settings file; using defaults");
        return Ok(VigilSettings::default());
    }
    load_from_path(&path)
}

/// Load and validate settings from a specific file.
pub fn load_from_path(path: &Path) -> Result<VigilSettings, SettingsError> {
    let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let settings: VigilSettings =
        toml::from_str(&text).map_err(|source| SettingsError::ParseToml {
            path: path.to_path_buf(),
            source,
        })?;
    settings.validate()?;
    Ok(settings)
}

/// Persist settings to the app root.
pub fn save(settings: &VigilSettings) -> Result<(), SettingsError> {
    save_to_path(settings, &settings_path()?)
}

/// Write settings atomically to `path`.
pub fn save_to_path(settings: &VigilSettings, path: &Path) -> Result<(), SettingsError> {
    let data = toml::to_string_pretty(settings).map_err(|source| SettingsError::SerializeToml {
        path: path.to_path_buf(),
        source,
    })?;
    crate::atomic_file::write_atomic(path, data.as_bytes()).map_err(|source| {
        SettingsError::Write {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let mut settings = VigilSettings::default();
        settings.queue.capacity = 321;
        settings.federated.enabled = true;
        settings.federated.endpoint = Some("https://aggregator.example/v1/updates".into());

        save_to_path(&settings, &path).unwrap();
        let loaded = load_from_path(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "queue = [").unwrap();
        match load_from_path(&path) {
            Err(SettingsError::ParseToml { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn invalid_values_fail_validation_on_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "[model]\nfeature_len = 0\n").unwrap();
        assert!(matches!(
            load_from_path(&path),
            Err(SettingsError::Invalid {
                field: "model.feature_len",
                ..
            })
        ));
    }
}
