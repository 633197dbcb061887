use serde::{Deserialize, Serialize};

use super::cluster::Target;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageLoadRequest {
    pub images: Vec<String>,
    pub target: Target,
    #[serde(default)]
    pub keep_tarball: bool,
}

/// Images loaded into one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedImages {
    pub cluster: String,
    pub images: Vec<String>,
}
