use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::DistributionErrorCode;
use crate::{Error, OciDigest, Result};

pub mod media_type {
    pub const IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const OCTET_STREAM: &str = "application/octet-stream";

    /// Manifest media types a registry accepts on push.
    pub fn is_manifest(mt: &str) -> bool {
        matches!(
            mt,
            IMAGE_MANIFEST | IMAGE_INDEX | DOCKER_MANIFEST | DOCKER_MANIFEST_LIST
        )
    }
}

/// A content descriptor: media type, digest, and size, optionally annotated
/// for referrers listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: OciDigest,
    pub size: u64,
    #[serde(rename = "artifactType", default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, size: u64, digest: OciDigest) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            artifact_type: None,
            annotations: None,
        }
    }

    /// Descriptor for raw content, digested with the default algorithm.
    pub fn from_content(media_type: impl Into<String>, content: &[u8]) -> Self {
        Self::new(media_type, content.len() as u64, OciDigest::from(content))
    }
}

/// A manifest document. One tolerant shape covers both image manifests
/// (config + layers) and indexes (manifests); exactly one of the two families
/// of fields is populated in well-formed documents.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion", default)]
    pub schema_version: i32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(rename = "artifactType", default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Manifest {
    pub fn from_slice(bs: &[u8]) -> Result<Self> {
        serde_json::from_slice(bs).map_err(|e| {
            tracing::warn!("unable to deserialize manifest: {e:?}");
            Error::coded_message(
                DistributionErrorCode::ManifestInvalid,
                format!("unable to deserialize manifest: {e}"),
            )
        })
    }

    pub fn is_index(&self) -> bool {
        self.config.is_none() && !self.manifests.is_empty()
    }

    /// Descriptors of everything this manifest references within its own
    /// repository: config and layers for image manifests, child manifests
    /// for indexes. The subject is not included; referrers may dangle.
    pub fn references(&self) -> impl Iterator<Item = &Descriptor> {
        self.config
            .iter()
            .chain(self.layers.iter())
            .chain(self.manifests.iter())
    }

    /// The artifact type exposed in referrers listings: `artifactType` when
    /// set, otherwise the config media type of an image manifest.
    pub fn referrer_artifact_type(&self) -> Option<&str> {
        self.artifact_type
            .as_deref()
            .or_else(|| self.config.as_ref().map(|c| c.media_type.as_str()))
    }
}

/// An OCI image index document, as served by the referrers endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Index {
    #[serde(rename = "schemaVersion")]
    pub schema_version: i32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
}

impl Index {
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: media_type::IMAGE_INDEX.to_string(),
            manifests,
        }
    }
}

/// Response body of `/v2/<name>/tags/list`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TagList {
    pub name: String,
    pub tags: Vec<String>,
}

/// Response body of the out-of-spec `/v2/_catalog` endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepositoryList {
    pub repositories: Vec<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn manifest_parses_image_and_index() {
        let image = br#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
                "size": 3
            },
            "layers": []
        }"#;
        let m = Manifest::from_slice(image).unwrap();
        assert!(!m.is_index());
        assert_eq!(m.references().count(), 1);

        let index = br#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
                "size": 120
            }]
        }"#;
        let m = Manifest::from_slice(index).unwrap();
        assert!(m.is_index());
        assert_eq!(m.references().count(), 1);

        assert!(Manifest::from_slice(b"not json").is_err());
    }

    #[test]
    fn referrer_artifact_type_falls_back_to_config() {
        let m = Manifest {
            config: Some(Descriptor::from_content("application/spdx+json", b"{}")),
            ..Default::default()
        };
        assert_eq!(m.referrer_artifact_type(), Some("application/spdx+json"));

        let m = Manifest {
            artifact_type: Some("application/example".into()),
            config: Some(Descriptor::from_content(media_type::IMAGE_CONFIG, b"{}")),
            ..Default::default()
        };
        assert_eq!(m.referrer_artifact_type(), Some("application/example"));
    }

    #[test]
    fn descriptor_serde_shape() {
        let d = Descriptor::from_content(media_type::IMAGE_CONFIG, b"abc");
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["mediaType"], media_type::IMAGE_CONFIG);
        assert_eq!(v["size"], 3);
        assert!(v.get("artifactType").is_none());
        assert!(v.get("annotations").is_none());
    }
}
