use std::{
    collections::HashSet,
    env,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use regex::{Captures, Regex};
use tracing::{debug, error};

use crate::manifest::core::Manifest;

pub const YAML_CONFIG_NAME: &str = "bulkwrite.yaml";

#[derive(thiserror::Error, Debug)]
pub enum SubstituteEnvVariablesError {
    #[error("Invalid substitution pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Environment variable {0} not found")]
    MissingVariable(String),
}

fn substitute_env_variables(contents: &str) -> Result<String, SubstituteEnvVariablesError> {
    let re = Regex::new(r"\$\{([^}]+)\}")?;
    let mut missing = None;

    let result = re.replace_all(contents, |caps: &Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(val) => val,
            Err(_) => {
                error!("Environment variable {} not found", var_name);
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(SubstituteEnvVariablesError::MissingVariable(var_name)),
        None => Ok(result.into_owned()),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ValidateManifestError {
    #[error("Entity mapping names {0} must be unique")]
    EntityNameMustBeUnique(String),

    #[error("Entity mapping names can not be empty")]
    EntityNameCanNotBeEmpty,

    #[error("Entity {0} maps field {1} to an empty column name")]
    EmptyColumnName(String, String),

    #[error("batch_size must be greater than 0")]
    BatchSizeMustBePositive,
}

fn validate_manifest(manifest: &Manifest) -> Result<(), ValidateManifestError> {
    let mut seen = HashSet::new();
    let duplicate_entity_names: Vec<String> = manifest
        .entities
        .iter()
        .filter_map(|e| if seen.insert(&e.name) { None } else { Some(e.name.clone()) })
        .collect();

    if !duplicate_entity_names.is_empty() {
        return Err(ValidateManifestError::EntityNameMustBeUnique(
            duplicate_entity_names.join(", "),
        ));
    }

    for entity in &manifest.entities {
        if entity.name.trim().is_empty() {
            return Err(ValidateManifestError::EntityNameCanNotBeEmpty);
        }

        if let Some((field, _)) = entity.columns.iter().find(|(_, column)| column.trim().is_empty())
        {
            return Err(ValidateManifestError::EmptyColumnName(entity.name.clone(), field.clone()));
        }
    }

    if manifest.config.as_ref().is_some_and(|config| config.batch_size == 0) {
        return Err(ValidateManifestError::BatchSizeMustBePositive);
    }

    Ok(())
}

#[derive(thiserror::Error, Debug)]
pub enum ReadManifestError {
    #[error("Could not open file: {0}")]
    CouldNotOpenFile(#[from] std::io::Error),

    #[error("Could not parse manifest: {0}")]
    CouldNotParseManifest(#[from] serde_yaml::Error),

    #[error("Could not substitute env variables: {0}")]
    CouldNotSubstituteEnvVariables(#[from] SubstituteEnvVariablesError),

    #[error("Could not validate manifest: {0}")]
    CouldNotValidateManifest(#[from] ValidateManifestError),
}

fn extract_environment_path(contents: &str, file_path: &Path) -> Option<PathBuf> {
    let re = Regex::new(r"(?m)^environment_path:\s*(.+)$").ok()?;
    re.captures(contents).and_then(|cap| cap.get(1)).map(|m| {
        let path_str = m.as_str().trim().replace('\"', "");
        let base_dir = file_path.parent().unwrap_or(Path::new(""));
        let full_path = base_dir.join(path_str);
        full_path.canonicalize().unwrap_or(full_path)
    })
}

/// Reads a manifest, loading `.env` (or the file named by `environment_path`) and substituting
/// every `${VAR}` before parsing.
pub fn read_manifest(file_path: &Path) -> Result<Manifest, ReadManifestError> {
    let mut file = File::open(file_path)?;
    let mut contents = String::new();

    file.read_to_string(&mut contents)?;

    match extract_environment_path(&contents, file_path) {
        Some(path) => {
            if let Err(e) = dotenv::from_path(&path) {
                debug!("Could not load environment file {}: {}", path.display(), e);
            }
        }
        None => {
            dotenv::dotenv().ok();
        }
    }

    contents = substitute_env_variables(&contents)?;

    let manifest: Manifest = serde_yaml::from_str(&contents)?;
    validate_manifest(&manifest)?;

    Ok(manifest)
}
