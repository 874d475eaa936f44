use anyhow::{bail, Context};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::semantic::TextProjection;

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_EMBEDDER_URL: &str = "http://localhost:8000";
const DEFAULT_EMBEDDER_MODEL: &str = "sbert";
/// Output size of the sentence transformer the embedder ships with
const DEFAULT_DIMENSIONS: usize = 512;
const DEFAULT_EMBED_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HEALTHCHECK_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HEALTHCHECK_SLEEP_SECS: u64 = 5;
const DEFAULT_TOP_N: usize = 10;
const DEFAULT_SAMPLE_SIZE: usize = 1000;
const DEFAULT_BATCH_SIZE: usize = 64;
const DEFAULT_ADDR: &str = "0.0.0.0:8020";

/// Bounds applied to fields without an explicit entry in `field_bounds`
pub const DEFAULT_FIELD_BOUNDS: FieldBounds = FieldBounds { min: 0, max: 1000 };

/// Embedding service connection settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbedderConfig {
    /// Base url of the embedding service
    #[serde(default = "default_embedder_url")]
    pub url: String,

    /// Model name, hashed into index files to detect model changes
    #[serde(default = "default_embedder_model")]
    pub model: String,

    /// Length of every embedding
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Upper bound for a single embedding call
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_healthcheck_timeout_secs")]
    pub healthcheck_timeout_secs: u64,

    #[serde(default = "default_healthcheck_sleep_secs")]
    pub healthcheck_sleep_secs: u64,

    /// 0 means keep trying forever
    #[serde(default)]
    pub healthcheck_max_attempts: u32,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            url: default_embedder_url(),
            model: default_embedder_model(),
            dimensions: DEFAULT_DIMENSIONS,
            timeout_secs: DEFAULT_EMBED_TIMEOUT_SECS,
            healthcheck_timeout_secs: DEFAULT_HEALTHCHECK_TIMEOUT_SECS,
            healthcheck_sleep_secs: DEFAULT_HEALTHCHECK_SLEEP_SECS,
            healthcheck_max_attempts: 0,
        }
    }
}

impl EmbedderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Neighbors returned per query
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_n: DEFAULT_TOP_N,
        }
    }
}

/// How the index file is brought up to date after a write
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistStrategy {
    /// Write only the new entries and the header, then verify the durable count
    #[default]
    Append,
    /// Rewrite the whole file and reload the live index from it
    Rewrite,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub strategy: PersistStrategy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Populate empty collections from their `source` on startup
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Rows drawn from each source; all rows when unset
    #[serde(default = "default_sample_size")]
    pub sample_size: Option<usize>,

    /// Fixed seed for reproducible samples
    #[serde(default)]
    pub seed: Option<u64>,

    /// Rows written per locked batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_size: default_sample_size(),
            seed: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldBounds {
    pub min: usize,
    pub max: usize,
}

/// One collection: an index file, a table file and the projection joining them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub name: String,

    /// Index file, relative to the base path unless absolute
    pub index_file: PathBuf,

    /// Table file, relative to the base path unless absolute
    pub table_file: PathBuf,

    /// Table columns, in order
    pub fields: Vec<String>,

    /// Template rendered into the embedder input
    pub projection: String,

    /// Bulk source used for bootstrapping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,

    /// Length bounds checked on records added over HTTP
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub field_bounds: IndexMap<String, FieldBounds>,
}

impl CollectionConfig {
    pub fn bounds(&self, field: &str) -> FieldBounds {
        self.field_bounds
            .get(field)
            .copied()
            .unwrap_or(DEFAULT_FIELD_BOUNDS)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedder: EmbedderConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_collections")]
    pub collections: Vec<CollectionConfig>,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedder: EmbedderConfig::default(),
            search: SearchConfig::default(),
            persistence: PersistenceConfig::default(),
            bootstrap: BootstrapConfig::default(),
            server: ServerConfig::default(),
            collections: default_collections(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_embedder_url() -> String {
    DEFAULT_EMBEDDER_URL.to_string()
}

fn default_embedder_model() -> String {
    DEFAULT_EMBEDDER_MODEL.to_string()
}

fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}

fn default_embed_timeout_secs() -> u64 {
    DEFAULT_EMBED_TIMEOUT_SECS
}

fn default_healthcheck_timeout_secs() -> u64 {
    DEFAULT_HEALTHCHECK_TIMEOUT_SECS
}

fn default_healthcheck_sleep_secs() -> u64 {
    DEFAULT_HEALTHCHECK_SLEEP_SECS
}

fn default_top_n() -> usize {
    DEFAULT_TOP_N
}

fn default_true() -> bool {
    true
}

fn default_sample_size() -> Option<usize> {
    Some(DEFAULT_SAMPLE_SIZE)
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_addr() -> String {
    DEFAULT_ADDR.to_string()
}

fn bounds(pairs: &[(&str, usize, usize)]) -> IndexMap<String, FieldBounds> {
    pairs
        .iter()
        .map(|(field, min, max)| (field.to_string(), FieldBounds { min: *min, max: *max }))
        .collect()
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// The stock resume and vacancy collections.
fn default_collections() -> Vec<CollectionConfig> {
    vec![
        CollectionConfig {
            name: "res".to_string(),
            index_file: PathBuf::from("flat_res.index"),
            table_file: PathBuf::from("resumes.csv"),
            fields: strings(&[
                "gend_age", "salary", "job_title", "city", "employment", "schedule",
                "experience", "last_wp", "last_jt", "edu", "upd_date", "auto",
            ]),
            projection: "Ищет работу на должность: {job_title}; {experience}; {edu}".to_string(),
            source: Some(PathBuf::from("init_data/resume_train_no_index.csv")),
            field_bounds: bounds(&[
                ("job_title", 5, 30),
                ("experience", 20, 2000),
                ("edu", 3, 100),
            ]),
        },
        CollectionConfig {
            name: "vac".to_string(),
            index_file: PathBuf::from("flat_vac.index"),
            table_file: PathBuf::from("vacancies.csv"),
            fields: strings(&[
                "employer", "vac_title", "sal_from", "sal_to", "req_exp", "sch_type",
                "keywords", "descr", "area", "key_req", "spec", "tags", "publ_date",
            ]),
            projection: "{descr}; {key_req}; {spec}. Требуемый опыт: {req_exp}".to_string(),
            source: Some(PathBuf::from("init_data/vac_train_no_index.csv")),
            field_bounds: bounds(&[
                ("employer", 2, 100),
                ("req_exp", 3, 100),
                ("descr", 50, 2000),
                ("key_req", 10, 500),
                ("spec", 10, 500),
            ]),
        },
    ]
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.search.top_n == 0 {
            bail!("search.top_n must be greater than 0");
        }

        let emb = &self.embedder;
        if emb.dimensions == 0 || emb.dimensions > u32::MAX as usize {
            bail!("embedder.dimensions must be in 1..={}, got {}", u32::MAX, emb.dimensions);
        }
        if emb.timeout_secs == 0 {
            bail!("embedder.timeout_secs must be greater than 0");
        }
        if emb.model.trim().is_empty() {
            bail!("embedder.model must not be empty");
        }

        if self.bootstrap.batch_size == 0 {
            bail!("bootstrap.batch_size must be greater than 0");
        }

        let mut names = HashSet::new();
        let mut files = HashSet::new();
        for collection in &self.collections {
            let name = &collection.name;
            if name.trim().is_empty() {
                bail!("collection name must not be empty");
            }
            if !names.insert(name.as_str()) {
                bail!("collection '{name}' is declared twice");
            }

            for file in [&collection.index_file, &collection.table_file] {
                let path = self.resolve(file);
                if !files.insert(path.clone()) {
                    bail!(
                        "collection '{name}': file {} is already used by another store",
                        path.display()
                    );
                }
            }

            if collection.fields.is_empty() {
                bail!("collection '{name}' has no fields");
            }
            let mut fields = HashSet::new();
            for field in &collection.fields {
                if field == "position" {
                    bail!("collection '{name}': 'position' is reserved for the key column");
                }
                if !fields.insert(field.as_str()) {
                    bail!("collection '{name}': field '{field}' is declared twice");
                }
            }

            let projection = TextProjection::parse(&collection.projection)
                .with_context(|| format!("collection '{name}': invalid projection"))?;
            if let Some(unknown) = projection.fields().find(|f| !fields.contains(f)) {
                bail!("collection '{name}': projection uses unknown field '{unknown}'");
            }

            for (field, b) in &collection.field_bounds {
                if !fields.contains(field.as_str()) {
                    bail!("collection '{name}': bounds given for unknown field '{field}'");
                }
                if b.min > b.max {
                    bail!("collection '{name}': bounds for '{field}' have min > max");
                }
            }
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, writing the default one first if missing.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        let path = base_path.join(CONFIG_FILE);

        if !path.exists() {
            log::info!("writing default config to {}", path.display());
            let config = Self {
                base_path: base_path.to_path_buf(),
                ..Default::default()
            };
            config.save()?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        if let Ok(url) = std::env::var("RVS_EMBEDDER_URL") {
            config.embedder.url = url;
        }

        config.validate()?;

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = self.base_path.join(CONFIG_FILE);
        let temp_path = self.base_path.join(format!("{CONFIG_FILE}-tmp"));

        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(&temp_path, config_str.as_bytes())?;
        std::fs::rename(&temp_path, &path)?;

        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a configured path against the base path.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionConfig> {
        self.collections.iter().find(|c| c.name == name)
    }

    #[cfg(test)]
    pub fn with_base_path(mut self, base_path: &Path) -> Self {
        self.base_path = base_path.to_path_buf();
        self
    }
}
