use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::scenario::{Scenario, ScenarioLoader};

pub struct FileSystemScenarioLoader {
    path: PathBuf,
}

impl FileSystemScenarioLoader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ScenarioLoader for FileSystemScenarioLoader {
    fn load(&self) -> Result<Scenario> {
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read scenario: {}", self.path.display()))?;

        let scenario: Scenario = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse scenario: {}", self.path.display()))?;

        log::info!(
            "Loaded scenario {} with {} pools and {} steps",
            self.path.display(),
            scenario.pools.len(),
            scenario.steps.len()
        );

        Ok(scenario)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn loads_scenario_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "steps": [{{ "op": "set_frame_index", "frame_index": 3 }}] }}"#
        )
        .unwrap();

        let scenario = FileSystemScenarioLoader::new(file.path()).load().unwrap();
        assert_eq!(scenario.steps.len(), 1);
    }

    #[test]
    fn missing_file_names_the_path() {
        let error = FileSystemScenarioLoader::new("/nonexistent/scenario.json")
            .load()
            .unwrap_err();

        assert!(format!("{error}").contains("/nonexistent/scenario.json"));
    }
}
