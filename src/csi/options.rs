use crate::csi::error::{CsiError, CsiResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const DEFAULT_IMAGE_FORMAT: &str = "2";
const DEFAULT_CEPH_ID: &str = "admin";

/// Root of dynamically provisioned CephFS volumes.
pub const PROVISIONED_VOLUMES_ROOT: &str = "/csi-volumes";

/// Image placement parameters taken from a `CreateVolume` storage class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageParameters {
    pub monitors: String,
    pub pool: String,
    pub image_format: String,
    pub image_features: Option<String>,
    pub admin_id: String,
    pub user_id: String,
}

impl ImageParameters {
    pub fn from_parameters(params: &HashMap<String, String>) -> CsiResult<Self> {
        let monitors = required(params, "monitors")?;
        let pool = required(params, "pool")?;

        let image_format = params
            .get("imageFormat")
            .cloned()
            .unwrap_or_else(|| DEFAULT_IMAGE_FORMAT.to_string());
        if image_format != "1" && image_format != "2" {
            return Err(CsiError::invalid_argument(format!(
                "invalid image format {}, supported formats are 1 and 2",
                image_format
            )));
        }

        let image_features = params.get("imageFeatures").filter(|f| !f.is_empty()).cloned();
        if let Some(features) = &image_features {
            if image_format != "2" {
                return Err(CsiError::invalid_argument(
                    "image features are only supported with image format 2",
                ));
            }
            if let Some(unsupported) = features.split(',').find(|f| *f != "layering") {
                return Err(CsiError::invalid_argument(format!(
                    "image feature {} is not supported, only layering is",
                    unsupported
                )));
            }
        }

        Ok(Self {
            monitors,
            pool,
            image_format,
            image_features,
            admin_id: params.get("adminid").cloned().unwrap_or_else(|| DEFAULT_CEPH_ID.into()),
            user_id: params.get("userid").cloned().unwrap_or_else(|| DEFAULT_CEPH_ID.into()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MounterKind {
    #[default]
    Kernel,
    Fuse,
}

/// Per-volume options handed to the node in the volume attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeOptions {
    pub monitors: String,
    pub pool: Option<String>,
    pub root_path: Option<String>,
    pub mounter: MounterKind,
    pub provision_volume: bool,
}

impl VolumeOptions {
    pub fn from_attributes(attrs: &HashMap<String, String>) -> CsiResult<Self> {
        let monitors = required(attrs, "monitors")?;

        let provision_volume = match required(attrs, "provisionVolume")?.as_str() {
            "true" => true,
            "false" => false,
            other => {
                return Err(CsiError::invalid_argument(format!(
                    "invalid provisionVolume value {}, expected true or false",
                    other
                )));
            }
        };

        let mounter = match attrs.get("mounter").map(String::as_str) {
            None | Some("") | Some("kernel") => MounterKind::Kernel,
            Some("fuse") => MounterKind::Fuse,
            Some(other) => {
                return Err(CsiError::invalid_argument(format!(
                    "unknown mounter {}, expected kernel or fuse",
                    other
                )));
            }
        };

        let pool = attrs.get("pool").filter(|p| !p.is_empty()).cloned();
        let root_path = attrs.get("rootPath").filter(|p| !p.is_empty()).cloned();

        if provision_volume && pool.is_none() {
            return Err(CsiError::invalid_argument("pool is required when provisionVolume is true"));
        }
        if !provision_volume && root_path.is_none() {
            return Err(CsiError::invalid_argument(
                "rootPath is required when provisionVolume is false",
            ));
        }

        Ok(Self { monitors, pool, root_path, mounter, provision_volume })
    }

    /// Namespace the dedicated user of a provisioned volume is confined to.
    pub fn namespace(volume_id: &str) -> String {
        format!("ns-{}", volume_id)
    }

    /// Path mounted for this volume; provisioned volumes live under [`PROVISIONED_VOLUMES_ROOT`].
    pub fn mount_root(&self, volume_id: &str) -> String {
        if self.provision_volume {
            format!("{}/{}", PROVISIONED_VOLUMES_ROOT, volume_id)
        } else {
            self.root_path.clone().unwrap_or_else(|| "/".to_string())
        }
    }
}

fn required(params: &HashMap<String, String>, key: &str) -> CsiResult<String> {
    match params.get(key) {
        Some(value) if !value.is_empty() => Ok(value.clone()),
        _ => Err(CsiError::invalid_argument(format!("missing required parameter {}", key))),
    }
}
