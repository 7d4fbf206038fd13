//! Resize preset catalog and target naming.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresetError {
    #[error("Preset catalog is empty")]
    EmptyCatalog,

    #[error("Preset {width}x{height} has a zero dimension")]
    ZeroDimension { width: u32, height: u32 },

    #[error("Preset {width}x{height} is listed more than once")]
    Duplicate { width: u32, height: u32 },

    #[error("Cannot derive a target from '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },
}

impl PresetError {
    pub fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }
}

/// One output variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResizePreset {
    width: u32,
    height: u32,
}

impl ResizePreset {
    pub fn new(width: u32, height: u32) -> Result<Self, PresetError> {
        if width == 0 || height == 0 {
            return Err(PresetError::ZeroDimension { width, height });
        }
        Ok(Self { width, height })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// `_{width}x{height}`, appended to the file stem
    pub fn suffix(&self) -> String {
        format!("_{}x{}", self.width, self.height)
    }
}

impl TryFrom<[u32; 2]> for ResizePreset {
    type Error = PresetError;

    fn try_from([width, height]: [u32; 2]) -> Result<Self, Self::Error> {
        Self::new(width, height)
    }
}

impl fmt::Display for ResizePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Ordered, validated list of presets loaded once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetCatalog {
    presets: Vec<ResizePreset>,
}

impl PresetCatalog {
    pub fn new(presets: Vec<ResizePreset>) -> Result<Self, PresetError> {
        if presets.is_empty() {
            return Err(PresetError::EmptyCatalog);
        }
        let mut seen = HashSet::with_capacity(presets.len());
        for preset in &presets {
            if !seen.insert(*preset) {
                return Err(PresetError::Duplicate {
                    width: preset.width,
                    height: preset.height,
                });
            }
        }
        Ok(Self { presets })
    }

    /// Build from `[width, height]` pairs as they appear in configuration
    pub fn from_pairs(pairs: &[[u32; 2]]) -> Result<Self, PresetError> {
        let presets = pairs
            .iter()
            .map(|pair| ResizePreset::try_from(*pair))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(presets)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResizePreset> {
        self.presets.iter()
    }

    pub fn presets(&self) -> &[ResizePreset] {
        &self.presets
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }
}

struct UriParts<'a> {
    /// Everything up to and including the last `/` of the path
    prefix: &'a str,
    stem: &'a str,
    /// Extension including its dot, or empty
    extension: &'a str,
    /// Query string and/or fragment including the leading `?`/`#`
    tail: &'a str,
}

fn split_uri(uri: &str) -> Result<UriParts<'_>, PresetError> {
    let (base, tail) = match uri.find(['?', '#']) {
        Some(idx) => uri.split_at(idx),
        None => (uri, ""),
    };

    let path_start = match base.find("://") {
        Some(scheme_end) => {
            let authority_start = scheme_end + 3;
            base[authority_start..]
                .find('/')
                .map(|idx| authority_start + idx)
                .ok_or_else(|| PresetError::invalid_uri(uri, "no path"))?
        }
        None => 0,
    };

    let segment_start = base[path_start..]
        .rfind('/')
        .map_or(path_start, |idx| path_start + idx + 1);
    let segment = &base[segment_start..];
    if segment.is_empty() {
        return Err(PresetError::invalid_uri(uri, "no file name"));
    }

    let (stem, extension) = match segment.rfind('.') {
        Some(dot) if dot > 0 => segment.split_at(dot),
        _ => (segment, ""),
    };

    Ok(UriParts {
        prefix: &base[..segment_start],
        stem,
        extension,
        tail,
    })
}

/// Base file name of `uri` without its extension
pub fn file_stem(uri: &str) -> Result<&str, PresetError> {
    split_uri(uri).map(|parts| parts.stem)
}

/// Replace the file stem of `uri` with `{stem}_{width}x{height}`.
///
/// Path, extension, query and fragment are preserved. Pure: the same input
/// always yields the same target.
pub fn derive_target_uri(uri: &str, preset: &ResizePreset) -> Result<String, PresetError> {
    let parts = split_uri(uri)?;
    Ok(format!(
        "{}{}{}{}{}",
        parts.prefix,
        parts.stem,
        preset.suffix(),
        parts.extension,
        parts.tail
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn preset(width: u32, height: u32) -> ResizePreset {
        ResizePreset::new(width, height).unwrap()
    }

    #[test]
    fn test_derive_target_uri_for_bucket_root() {
        let uri = "https://b.s3.amazonaws.com/u1.png";
        assert_eq!(
            derive_target_uri(uri, &preset(100, 100)).unwrap(),
            "https://b.s3.amazonaws.com/u1_100x100.png"
        );
        assert_eq!(
            derive_target_uri(uri, &preset(200, 200)).unwrap(),
            "https://b.s3.amazonaws.com/u1_200x200.png"
        );
    }

    #[test]
    fn test_derive_target_uri_preserves_path_query_and_fragment() {
        assert_eq!(
            derive_target_uri(
                "https://cdn.example.com/a/b.c/photo.final.jpeg?v=2#top",
                &preset(64, 32)
            )
            .unwrap(),
            "https://cdn.example.com/a/b.c/photo.final_64x32.jpeg?v=2#top"
        );
    }

    #[test]
    fn test_derive_target_uri_without_extension() {
        assert_eq!(
            derive_target_uri("https://b.s3.amazonaws.com/raw/u1", &preset(10, 20)).unwrap(),
            "https://b.s3.amazonaws.com/raw/u1_10x20"
        );
        assert_eq!(
            derive_target_uri("uploads/.hidden", &preset(1, 1)).unwrap(),
            "uploads/.hidden_1x1"
        );
    }

    #[test]
    fn test_derive_target_uri_rejects_missing_file_name() {
        assert!(matches!(
            derive_target_uri("https://b.s3.amazonaws.com", &preset(1, 1)),
            Err(PresetError::InvalidUri { .. })
        ));
        assert!(matches!(
            derive_target_uri("https://b.s3.amazonaws.com/dir/", &preset(1, 1)),
            Err(PresetError::InvalidUri { .. })
        ));
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("https://b.s3.amazonaws.com/u1.png").unwrap(), "u1");
        assert_eq!(file_stem("s3://bucket/x/y.tar.gz").unwrap(), "y.tar");
    }

    #[test]
    fn test_catalog_validation() {
        let catalog = PresetCatalog::from_pairs(&[[100, 100], [200, 150]]).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.presets()[1].to_string(), "200x150");

        assert_eq!(PresetCatalog::from_pairs(&[]), Err(PresetError::EmptyCatalog));
        assert_eq!(
            PresetCatalog::from_pairs(&[[100, 0]]),
            Err(PresetError::ZeroDimension { width: 100, height: 0 })
        );
        assert_eq!(
            PresetCatalog::from_pairs(&[[100, 100], [100, 100]]),
            Err(PresetError::Duplicate { width: 100, height: 100 })
        );
    }

    proptest! {
        #[test]
        fn test_target_naming_is_deterministic(
            dir in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,3}",
            stem in "[a-zA-Z0-9_-]{1,16}",
            ext in prop::option::of("(png|jpg|jpeg|webp|gif)"),
            width in 1u32..5000,
            height in 1u32..5000,
        ) {
            let name = match &ext {
                Some(ext) => format!("{stem}.{ext}"),
                None => stem.clone(),
            };
            let uri = format!("https://bucket.s3.amazonaws.com/{dir}/{name}");
            let preset = ResizePreset::new(width, height).unwrap();

            let first = derive_target_uri(&uri, &preset).unwrap();
            let second = derive_target_uri(&uri, &preset).unwrap();
            prop_assert_eq!(&first, &second);

            let expected_name = match &ext {
                Some(ext) => format!("{stem}_{width}x{height}.{ext}"),
                None => format!("{stem}_{width}x{height}"),
            };
            let expected_suffix = format!("/{dir}/{expected_name}");
            prop_assert!(first.ends_with(&expected_suffix));
        }
    }
}
