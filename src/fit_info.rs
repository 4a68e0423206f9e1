use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use log::{debug, info};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errs::{SpanError, SpanResult};
use crate::genome::Genome;
use crate::model::EnrichmentModel;

pub const FIT_INFORMATION_VERSION: u32 = 5;
const DESCRIPTOR_SUFFIX: &str = ".span.json";
const MODEL_SUFFIX: &str = ".model.json";

/// Fragment size configuration: a fixed shift or automatic inference by
/// the coverage source. Serializes as an integer or the string `"auto"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fragment {
    Auto,
    Size(u32),
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fragment::Auto => write!(f, "auto"),
            Fragment::Size(size) => write!(f, "{size}"),
        }
    }
}

impl Serialize for Fragment {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match self {
            Fragment::Auto => serializer.serialize_str("auto"),
            Fragment::Size(size) => serializer.serialize_u32(*size),
        }
    }
}

struct FragmentVisitor;

impl<'de> Visitor<'de> for FragmentVisitor {
    type Value = Fragment;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"auto\" or a non-negative fragment size")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Fragment, E> {
        if value == "auto" {
            Ok(Fragment::Auto)
        } else {
            value
                .parse::<u32>()
                .map(Fragment::Size)
                .map_err(|_| E::custom(format!("bad fragment {value}")))
        }
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Fragment, E> {
        u32::try_from(value)
            .map(Fragment::Size)
            .map_err(|_| E::custom(format!("fragment {value} too large")))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Fragment, E> {
        u32::try_from(value)
            .map(Fragment::Size)
            .map_err(|_| E::custom(format!("bad fragment {value}")))
    }
}

impl<'de> Deserialize<'de> for Fragment {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Fragment, D::Error> {
        deserializer.deserialize_any(FragmentVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackPaths {
    pub treatment: PathBuf,
    pub control: Option<PathBuf>,
}

/// Serializable descriptor of one fit: inputs, binning configuration and
/// the model tag. The `id` is the content address of every cache keyed by
/// this fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitInformation {
    pub build: String,
    pub paths: Vec<TrackPaths>,
    pub labels: Vec<String>,
    pub fragment: Fragment,
    pub unique: bool,
    pub bin_size: u32,
    #[serde(rename = "chromosomes_sizes")]
    pub chromosome_sizes: IndexMap<String, u64>,
    #[serde(rename = "fit.information.fqn")]
    pub fqn: String,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapability: Option<PathBuf>,
}

impl FitInformation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        genome: &Genome,
        paths: Vec<TrackPaths>,
        labels: Vec<String>,
        fragment: Fragment,
        unique: bool,
        bin_size: u32,
        fqn: &str,
        mapability: Option<PathBuf>,
    ) -> Self {
        Self {
            build: genome.build().to_owned(),
            paths,
            labels,
            fragment,
            unique,
            bin_size,
            chromosome_sizes: genome.chrom_sizes(),
            fqn: fqn.to_owned(),
            version: FIT_INFORMATION_VERSION,
            mapability,
        }
    }

    /// Reproducible identifier: sorted input path stems, fragment, bin
    /// size, uniqueness and the mapability stem. Chromosome order does not
    /// participate, so permuting the input chromosome list leaves the id
    /// unchanged.
    pub fn id(&self) -> String {
        let mut stems = self
            .paths
            .iter()
            .flat_map(|tracks| {
                std::iter::once(&tracks.treatment)
                    .chain(tracks.control.iter())
            })
            .map(|path| stem_of(path))
            .collect::<Vec<String>>();
        stems.sort();
        let mut parts = stems;
        parts.push(self.bin_size.to_string());
        parts.push(self.fragment.to_string());
        if self.unique {
            parts.push("unique".to_owned());
        }
        if let Some(mapability) = &self.mapability {
            parts.push(stem_of(mapability));
        }
        parts.join("_")
    }

    pub fn descriptor_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}{DESCRIPTOR_SUFFIX}", self.id()))
    }

    pub fn model_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}{MODEL_SUFFIX}", self.id()))
    }

    pub fn save(&self, dir: &Path) -> SpanResult<PathBuf> {
        let path = self.descriptor_path(dir);
        let json = serde_json::to_string_pretty(self).map_err(|e| {
            SpanError::SchemaMismatch(format!(
                "failed to serialize fit information, {e}"
            ))
        })?;
        std::fs::write(&path, json).map_err(|e| {
            SpanError::invalid_input(format!(
                "failed to write {path:?}, {e}"
            ))
        })?;
        debug!("saved fit information to {path:?}");
        Ok(path)
    }

    pub fn load(path: &Path) -> SpanResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SpanError::invalid_input(format!(
                "failed to read {path:?}, {e}"
            ))
        })?;
        let info: FitInformation = serde_json::from_str(&contents)
            .map_err(|e| {
                SpanError::SchemaMismatch(format!(
                    "failed to parse fit information from {path:?}, {e}"
                ))
            })?;
        if info.version != FIT_INFORMATION_VERSION {
            return Err(SpanError::SchemaMismatch(format!(
                "unsupported fit information version {}, expected \
                 {FIT_INFORMATION_VERSION}",
                info.version
            )));
        }
        if info.fqn.is_empty() {
            return Err(SpanError::SchemaMismatch(
                "fit information is missing fit.information.fqn"
                    .to_owned(),
            ));
        }
        Ok(info)
    }

    /// Reject descriptors produced against another genome build.
    pub fn check_build(&self, genome: &Genome) -> SpanResult<()> {
        if self.build != genome.build() {
            return Err(SpanError::SchemaMismatch(format!(
                "fit information was computed for build {}, genome is {}",
                self.build,
                genome.build()
            )));
        }
        Ok(())
    }

    /// Persist a trained model next to the descriptor, keyed by the same
    /// id.
    pub fn save_model(
        &self,
        dir: &Path,
        model: &EnrichmentModel,
    ) -> SpanResult<PathBuf> {
        let path = self.model_path(dir);
        let json = serde_json::to_string(model).map_err(|e| {
            SpanError::SchemaMismatch(format!(
                "failed to serialize model, {e}"
            ))
        })?;
        std::fs::write(&path, json).map_err(|e| {
            SpanError::invalid_input(format!(
                "failed to write {path:?}, {e}"
            ))
        })?;
        info!("saved model to {path:?}");
        Ok(path)
    }

    /// Load a previously trained model for this fit, if cached.
    pub fn load_model(
        &self,
        dir: &Path,
    ) -> SpanResult<Option<EnrichmentModel>> {
        let path = self.model_path(dir);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            SpanError::invalid_input(format!(
                "failed to read {path:?}, {e}"
            ))
        })?;
        let model = serde_json::from_str(&contents).map_err(|e| {
            SpanError::SchemaMismatch(format!(
                "failed to parse cached model from {path:?}, {e}"
            ))
        })?;
        info!("loaded cached model from {path:?}");
        Ok(Some(model))
    }
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "track".to_owned())
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod fit_info_tests {
    use indexmap::indexmap;

    use super::*;

    fn genome() -> Genome {
        Genome::new(
            "hg_test",
            indexmap! {
                "chr1".to_owned() => 1000u64,
                "chr2".to_owned() => 500u64,
            },
        )
        .unwrap()
    }

    fn info() -> FitInformation {
        FitInformation::new(
            &genome(),
            vec![TrackPaths {
                treatment: PathBuf::from("/data/k4me3_rep1.bam"),
                control: Some(PathBuf::from("/data/input.bam")),
            }],
            vec!["k4me3_rep1".to_owned()],
            Fragment::Size(150),
            true,
            200,
            "span.fit.nb2z",
            None,
        )
    }

    #[test]
    fn test_id_is_stable_and_sorted() {
        let id = info().id();
        assert_eq!(id, "input_k4me3_rep1_200_150_unique");
        // same inputs, same id
        assert_eq!(info().id(), id);
    }

    #[test]
    fn test_id_ignores_chromosome_order() {
        let mut permuted = info();
        permuted.chromosome_sizes = indexmap! {
            "chr2".to_owned() => 500u64,
            "chr1".to_owned() => 1000u64,
        };
        assert_eq!(permuted.id(), info().id());
    }

    #[test]
    fn test_id_varies_with_configuration() {
        let base = info();
        let mut other = base.clone();
        other.bin_size = 100;
        assert_ne!(other.id(), base.id());
        let mut auto = base.clone();
        auto.fragment = Fragment::Auto;
        assert!(auto.id().contains("auto"));
        let mut mapped = base.clone();
        mapped.mapability = Some(PathBuf::from("/maps/hg_test_100.bw"));
        assert!(mapped.id().ends_with("hg_test_100"));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let original = info();
        let path = original.save(dir.path()).unwrap();
        let loaded = FitInformation::load(&path).unwrap();
        assert_eq!(loaded, original);
        loaded.check_build(&genome()).unwrap();
    }

    #[test]
    fn test_load_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut stale = info();
        stale.version = 4;
        let path = stale.save(dir.path()).unwrap();
        let err = FitInformation::load(&path).unwrap_err();
        assert!(matches!(err, SpanError::SchemaMismatch(_)));
    }

    #[test]
    fn test_load_rejects_missing_fqn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.span.json");
        std::fs::write(
            &path,
            r#"{"build": "hg_test", "paths": [], "labels": [],
                "fragment": "auto", "unique": false, "bin_size": 200,
                "chromosomes_sizes": {}, "version": 5}"#,
        )
        .unwrap();
        let err = FitInformation::load(&path).unwrap_err();
        assert!(matches!(err, SpanError::SchemaMismatch(_)));
    }

    #[test]
    fn test_build_mismatch_is_rejected() {
        let other = Genome::new(
            "mm_test",
            indexmap! { "chr1".to_owned() => 1000u64 },
        )
        .unwrap();
        let err = info().check_build(&other).unwrap_err();
        assert!(matches!(err, SpanError::SchemaMismatch(_)));
    }

    #[test]
    fn test_fragment_serialization_forms() {
        let auto: Fragment = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(auto, Fragment::Auto);
        let sized: Fragment = serde_json::from_str("147").unwrap();
        assert_eq!(sized, Fragment::Size(147));
        assert_eq!(serde_json::to_string(&Fragment::Auto).unwrap(), "\"auto\"");
        assert_eq!(serde_json::to_string(&Fragment::Size(147)).unwrap(), "147");
        assert!(serde_json::from_str::<Fragment>("\"nope\"").is_err());
    }

    #[test]
    fn test_model_cache_round_trip() {
        use crate::dataframe::{DataFrame, TREATMENT_COLUMN};
        use crate::model::ModelType;

        let dir = tempfile::tempdir().unwrap();
        let descriptor = info();
        assert_eq!(descriptor.load_model(dir.path()).unwrap(), None);

        let mut df = DataFrame::with_rows(100);
        df.add_int_column(
            TREATMENT_COLUMN,
            (0..100).map(|i| if i % 9 == 0 { 25 } else { i % 3 }).collect(),
        )
        .unwrap();
        let model = ModelType::Nb2z.build(&[&df]).unwrap();
        descriptor.save_model(dir.path(), &model).unwrap();
        let cached = descriptor.load_model(dir.path()).unwrap().unwrap();
        assert_eq!(cached, model);
    }
}
