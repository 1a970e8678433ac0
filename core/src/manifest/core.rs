use serde::{Deserialize, Serialize};

use crate::manifest::{config::BulkWriteConfig, entities::EntityMapping};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Manifest {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Env file loaded before `${VAR}` substitution, relative to the manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<BulkWriteConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<EntityMapping>,
}

impl Manifest {
    pub fn config(&self) -> BulkWriteConfig {
        self.config.clone().unwrap_or_default()
    }
}
