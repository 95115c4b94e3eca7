//! Projects bound to the active character card, and the CRUD API over them.

use anyhow::Context;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::archive::DEFAULT_HOME_PAGE;
use crate::bridge::value::{host_fn, HostValue};
use crate::download::format_bytes;
use crate::import::{self, ImportOptions};
use crate::registry::Registry;
use crate::store::VfsStore;
use crate::vfs_format::ImportResult;

pub const DEFAULT_ZIP_NAME: &str = "webzip.zip";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum ProjectSource {
    Embedded {
        #[serde(rename = "zipBase64")]
        zip_base64: String,
    },
    Url {
        #[serde(rename = "zipUrl")]
        zip_url: String,
    },
    Local,
}

impl ProjectSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            ProjectSource::Embedded { .. } => SourceKind::Embedded,
            ProjectSource::Url { .. } => SourceKind::Url,
            ProjectSource::Local => SourceKind::Local,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Embedded,
    Url,
    Local,
}

impl SourceKind {
    pub fn parse(raw: &str) -> Result<Self, ProjectError> {
        match raw.trim() {
            "embedded" => Ok(Self::Embedded),
            "url" => Ok(Self::Url),
            "local" => Ok(Self::Local),
            other => Err(ProjectError::InvalidSource(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Embedded => "embedded",
            Self::Url => "url",
            Self::Local => "local",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub placeholder: String,
    pub home_page: String,
    #[serde(default)]
    pub show_title_in_chat: bool,
    #[serde(default)]
    pub fix_root_relative_urls: bool,
    pub zip_name: String,
    #[serde(default)]
    pub zip_sha256: String,
    #[serde(flatten)]
    pub source: ProjectSource,
}

impl Project {
    /// Shape check applied to every card loaded from storage.
    pub fn is_well_formed(&self) -> bool {
        let filled = |s: &str| !s.trim().is_empty();
        if !filled(&self.id) || !filled(&self.placeholder) || !filled(&self.home_page) || !filled(&self.zip_name) {
            return false;
        }
        match &self.source {
            ProjectSource::Embedded { zip_base64 } => filled(zip_base64) && filled(&self.zip_sha256),
            ProjectSource::Url { zip_url } => filled(zip_url),
            ProjectSource::Local => filled(&self.zip_sha256),
        }
    }

    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.zip_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardData {
    #[serde(default)]
    pub projects: Vec<Project>,
}

/// Where the active card's project list lives.
pub trait CardStore: Send + Sync {
    fn load(&self) -> anyhow::Result<CardData>;
    fn save(&self, card: &CardData) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryCardStore {
    card: Mutex<CardData>,
}

impl MemoryCardStore {
    pub fn new(card: CardData) -> Self {
        Self {
            card: Mutex::new(card),
        }
    }
}

impl CardStore for MemoryCardStore {
    fn load(&self) -> anyhow::Result<CardData> {
        Ok(self.card.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn save(&self, card: &CardData) -> anyhow::Result<()> {
        *self.card.lock().unwrap_or_else(|p| p.into_inner()) = card.clone();
        Ok(())
    }
}

/// Card data as a JSON file. A missing file is an empty card.
pub struct JsonFileCardStore {
    path: PathBuf,
}

impl JsonFileCardStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CardStore for JsonFileCardStore {
    fn load(&self) -> anyhow::Result<CardData> {
        if !self.path.exists() {
            return Ok(CardData::default());
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read card file: {}", self.path.display()))?;
        let raw: Value = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse card file: {}", self.path.display()))?;
        let projects = raw
            .get("projects")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|p| serde_json::from_value::<Project>(p.clone()).ok())
                    .filter(Project::is_well_formed)
                    .collect()
            })
            .unwrap_or_default();
        Ok(CardData { projects })
    }

    fn save(&self, card: &CardData) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(card)?;
        std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace card file: {}", self.path.display()))?;
        Ok(())
    }
}

/// Zip bytes in a request: a byte array, or a base64 string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipBytes(pub Vec<u8>);

impl<'de> Deserialize<'de> for ZipBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bytes(Vec<u8>),
            Base64(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Bytes(b) => Ok(ZipBytes(b)),
            Repr::Base64(s) => base64::engine::general_purpose::STANDARD
                .decode(s.trim())
                .map(ZipBytes)
                .map_err(serde::de::Error::custom),
        }
    }
}

impl Serialize for ZipBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
    }
}

/// Payload of every project operation. Unset fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_zip_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_all: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_page: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_title_in_chat: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_root_relative_urls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_url: Option<String>,
    /// Embedded zip to store on the card as-is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_base64: Option<String>,
    /// Zip to import into the VFS.
    #[serde(alias = "zipBlob", skip_serializing_if = "Option::is_none")]
    pub zip_array_buffer: Option<ZipBytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_zip_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_home_page: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_embedded_to_card: Option<bool>,
    #[serde(rename = "__hbAllowBroadcastZipTarget", skip_serializing_if = "Option::is_none")]
    pub allow_broadcast_zip_target: Option<bool>,
}

fn trimmed(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl ProjectInput {
    pub fn from_value(value: Value) -> Result<Self, ProjectError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(_) => {
                serde_json::from_value(value).map_err(|e| ProjectError::InvalidInput(e.to_string()))
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn has_target(&self) -> bool {
        trimmed(&self.target_project_id).is_some() || trimmed(&self.target_zip_sha256).is_some()
    }

    fn has_import_zip(&self) -> bool {
        self.zip_array_buffer.is_some() || trimmed(&self.import_zip_base64).is_some()
    }

    /// Archive to run through the import pipeline, if the request carries one.
    fn import_bytes(&self) -> Result<Option<Vec<u8>>, ProjectError> {
        if let Some(ZipBytes(bytes)) = &self.zip_array_buffer {
            return Ok(Some(bytes.clone()));
        }
        trimmed(&self.import_zip_base64).map(decode_base64).transpose()
    }
}

fn decode_base64(data: &str) -> Result<Vec<u8>, ProjectError> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| ProjectError::BadBase64(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GetProjectResult {
    pub projects: Vec<Project>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<Project>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateProjectResult {
    pub project: Project,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imported: Option<ImportResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProjectResult {
    pub target_project_id: String,
    pub project: Project,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imported: Option<ImportResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteProjectResult {
    pub deleted_project_id: String,
    pub deleted_project: Project,
    pub remaining_count: usize,
}

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("project not found: {0}")]
    NotFound(String),
    #[error("no project uses zipSha256 {0}")]
    NoProjectForZip(String),
    #[error("several projects use zipSha256 {0}; pass targetProjectId to pick one")]
    AmbiguousZip(String),
    #[error("missing target: pass targetProjectId or targetZipSha256")]
    MissingTarget,
    #[error("invalid source: {0}")]
    InvalidSource(String),
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("placeholder already used by another project: {0}")]
    PlaceholderTaken(String),
    #[error("source={kind} requires {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("zip is {size}, over the embedded limit ({limit_mb} MB); use source=local or source=url")]
    EmbeddedTooLarge { size: String, limit_mb: u64 },
    #[error("source=embedded must store zipBase64 on the card; use source=local to skip it")]
    EmbeddedNotPersisted,
    #[error("invalid base64 zip data: {0}")]
    BadBase64(String),
    #[error("invalid project payload: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Offer `desired` (or `{{WEB_<n+1>}}`), suffixed `_2`, `_3`, ... until unused.
pub fn ensure_unique_placeholder(projects: &[Project], desired: &str) -> String {
    let taken = |p: &str| projects.iter().any(|existing| existing.placeholder == p);
    let base = match desired.trim() {
        "" => format!("{{{{WEB_{}}}}}", projects.len() + 1),
        other => other.to_string(),
    };
    if !taken(&base) {
        return base;
    }
    for i in 2..1000 {
        let candidate = match base.strip_suffix("}}") {
            Some(head) => format!("{head}_{i}}}}}"),
            None => format!("{base}_{i}"),
        };
        if !taken(&candidate) {
            return candidate;
        }
    }
    base
}

/// Last path segment of `url`, with `.zip` appended when missing.
pub fn guess_zip_name_from_url(url: &str) -> String {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return DEFAULT_ZIP_NAME.to_string();
    };
    let last = parsed
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .last()
        .unwrap_or(DEFAULT_ZIP_NAME);
    if last.ends_with(".zip") {
        last.to_string()
    } else {
        format!("{last}.zip")
    }
}

/// Random RFC 4122 version 4 id.
pub fn generate_project_id() -> String {
    let mut b: [u8; 16] = rand::thread_rng().gen();
    b[6] = (b[6] & 0x0f) | 0x40;
    b[8] = (b[8] & 0x3f) | 0x80;
    let h = hex::encode(b);
    format!("{}-{}-{}-{}-{}", &h[0..8], &h[8..12], &h[12..16], &h[16..20], &h[20..32])
}

fn resolve_target(
    projects: &[Project],
    target_project_id: Option<&str>,
    target_zip_sha256: Option<&str>,
) -> Result<usize, ProjectError> {
    if let Some(id) = target_project_id {
        return projects
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| ProjectError::NotFound(id.to_string()));
    }
    if let Some(sha) = target_zip_sha256 {
        let matches: Vec<usize> = projects
            .iter()
            .enumerate()
            .filter(|(_, p)| p.zip_sha256 == sha)
            .map(|(i, _)| i)
            .collect();
        return match matches.as_slice() {
            [] => Err(ProjectError::NoProjectForZip(sha.to_string())),
            [only] => Ok(*only),
            _ => Err(ProjectError::AmbiguousZip(sha.to_string())),
        };
    }
    Err(ProjectError::MissingTarget)
}

#[derive(Debug, Clone)]
pub struct ProjectDefaults {
    pub placeholder: String,
    pub fix_root_relative_urls: bool,
    pub embedded_zip_max_bytes: u64,
}

/// Project CRUD over one card, importing archives through the shared pipeline.
pub struct ProjectService {
    store: Arc<VfsStore>,
    cards: Arc<dyn CardStore>,
    extension_base: String,
    defaults: ProjectDefaults,
    /// Serialises read-modify-write cycles on the card.
    write_lock: tokio::sync::Mutex<()>,
}

impl ProjectService {
    pub fn new(
        store: Arc<VfsStore>,
        cards: Arc<dyn CardStore>,
        extension_base: impl Into<String>,
        defaults: ProjectDefaults,
    ) -> Self {
        Self {
            store,
            cards,
            extension_base: extension_base.into(),
            defaults,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<VfsStore> {
        &self.store
    }

    fn check_embedded_size(&self, len: usize) -> Result<(), ProjectError> {
        let limit = self.defaults.embedded_zip_max_bytes;
        if (len as u64) <= limit {
            return Ok(());
        }
        Err(ProjectError::EmbeddedTooLarge {
            size: format_bytes(len as f64),
            limit_mb: ((limit as f64) / 1024.0 / 1024.0).round() as u64,
        })
    }

    async fn import(&self, bytes: Vec<u8>, fix: bool, preferred: Option<&str>) -> Result<ImportResult, ProjectError> {
        let options = ImportOptions {
            fix_root_relative_urls: fix,
            preferred_home_page: preferred.map(str::to_string),
            inject_resizer: false,
        };
        Ok(import::import_zip(&self.store, &self.extension_base, bytes, &options).await?)
    }

    pub fn get_project(&self, input: &ProjectInput) -> Result<GetProjectResult, ProjectError> {
        let card = self.cards.load()?;
        let include_all = input.include_all.unwrap_or(false);
        if include_all || !input.has_target() {
            return Ok(GetProjectResult {
                projects: card.projects,
                project: None,
            });
        }
        let idx = resolve_target(
            &card.projects,
            trimmed(&input.target_project_id),
            trimmed(&input.target_zip_sha256),
        )?;
        let project = card.projects[idx].clone();
        Ok(GetProjectResult {
            projects: card.projects,
            project: Some(project),
        })
    }

    pub async fn create_project(&self, input: ProjectInput) -> Result<CreateProjectResult, ProjectError> {
        let _guard = self.write_lock.lock().await;
        let mut card = self.cards.load()?;

        let has_import = input.has_import_zip();
        let inferred = if has_import {
            SourceKind::Local
        } else if trimmed(&input.zip_url).is_some() {
            SourceKind::Url
        } else if trimmed(&input.zip_base64).is_some() {
            SourceKind::Embedded
        } else {
            SourceKind::Local
        };
        let source = match &input.source {
            Some(raw) => SourceKind::parse(raw)?,
            None => inferred,
        };

        let desired = trimmed(&input.placeholder).unwrap_or(&self.defaults.placeholder);
        let placeholder = ensure_unique_placeholder(&card.projects, desired);
        let mut id = generate_project_id();
        while card.projects.iter().any(|p| p.id == id) {
            id = generate_project_id();
        }

        let title = trimmed(&input.title).map(str::to_string);
        let show_title_in_chat = input.show_title_in_chat.unwrap_or(false);
        let fix = input
            .fix_root_relative_urls
            .unwrap_or(self.defaults.fix_root_relative_urls);
        let zip_url = trimmed(&input.zip_url).unwrap_or_default().to_string();
        let mut zip_name = trimmed(&input.zip_name).unwrap_or_default().to_string();
        let mut home_page = trimmed(&input.home_page).unwrap_or_default().to_string();
        let mut zip_sha256 = trimmed(&input.zip_sha256).unwrap_or_default().to_string();
        let mut embedded_base64 = trimmed(&input.zip_base64).unwrap_or_default().to_string();
        let mut imported = None;

        if source == SourceKind::Url && zip_url.is_empty() {
            return Err(ProjectError::MissingField {
                kind: "url",
                field: "zipUrl",
            });
        }

        if let Some(bytes) = input.import_bytes()? {
            if source == SourceKind::Embedded {
                if input.persist_embedded_to_card == Some(false) {
                    return Err(ProjectError::EmbeddedNotPersisted);
                }
                self.check_embedded_size(bytes.len())?;
                if embedded_base64.is_empty() {
                    embedded_base64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
                }
            }
            let preferred = trimmed(&input.preferred_home_page).or(trimmed(&input.home_page));
            let result = self.import(bytes, fix, preferred).await?;
            zip_sha256 = result.project_id.clone();
            home_page = result.home_page.clone();
            imported = Some(result);
        }

        if zip_name.is_empty() {
            zip_name = match source {
                SourceKind::Url => guess_zip_name_from_url(&zip_url),
                _ => DEFAULT_ZIP_NAME.to_string(),
            };
        }
        if home_page.is_empty() {
            home_page = DEFAULT_HOME_PAGE.to_string();
        }

        let source = match source {
            SourceKind::Embedded => {
                if embedded_base64.is_empty() {
                    return Err(ProjectError::MissingField {
                        kind: "embedded",
                        field: "zipBase64",
                    });
                }
                if zip_sha256.is_empty() {
                    return Err(ProjectError::MissingField {
                        kind: "embedded",
                        field: "zipSha256",
                    });
                }
                if !has_import {
                    self.check_embedded_size(decode_base64(&embedded_base64)?.len())?;
                }
                ProjectSource::Embedded {
                    zip_base64: embedded_base64,
                }
            }
            SourceKind::Url => ProjectSource::Url { zip_url },
            SourceKind::Local => {
                if zip_sha256.is_empty() {
                    return Err(ProjectError::MissingField {
                        kind: "local",
                        field: "zipSha256",
                    });
                }
                ProjectSource::Local
            }
        };

        let project = Project {
            id,
            title,
            placeholder,
            home_page,
            show_title_in_chat,
            fix_root_relative_urls: fix,
            zip_name,
            zip_sha256,
            source,
        };
        card.projects.push(project.clone());
        self.cards.save(&card)?;
        log::info!(
            "created project {} ({}) with placeholder {}",
            project.id,
            project.display_name(),
            project.placeholder
        );
        Ok(CreateProjectResult { project, imported })
    }

    pub async fn update_project(&self, input: ProjectInput) -> Result<UpdateProjectResult, ProjectError> {
        let _guard = self.write_lock.lock().await;
        let mut card = self.cards.load()?;
        let result = match input.import_bytes()? {
            Some(bytes) => self.import_and_overwrite(&mut card, input, bytes).await?,
            None => self.overwrite(&mut card, &input)?,
        };
        self.cards.save(&card)?;
        log::info!("updated project {}", result.target_project_id);
        Ok(result)
    }

    async fn import_and_overwrite(
        &self,
        card: &mut CardData,
        input: ProjectInput,
        bytes: Vec<u8>,
    ) -> Result<UpdateProjectResult, ProjectError> {
        let idx = resolve_target(
            &card.projects,
            trimmed(&input.target_project_id),
            trimmed(&input.target_zip_sha256),
        )?;
        let current = card.projects[idx].clone();
        let fix = input.fix_root_relative_urls.unwrap_or(current.fix_root_relative_urls);
        let preferred = trimmed(&input.preferred_home_page)
            .or(trimmed(&input.home_page))
            .or(Some(current.home_page.trim()).filter(|s| !s.is_empty()))
            .map(str::to_string);

        let source = match &input.source {
            Some(raw) => SourceKind::parse(raw)?,
            None => current.source.kind(),
        };
        let mut zip_base64 = None;
        if source == SourceKind::Embedded {
            if input.persist_embedded_to_card == Some(false) {
                return Err(ProjectError::EmbeddedNotPersisted);
            }
            self.check_embedded_size(bytes.len())?;
            zip_base64 = Some(base64::engine::general_purpose::STANDARD.encode(&bytes));
        }

        let mut overwrite = ProjectInput {
            target_project_id: Some(current.id.clone()),
            source: Some(source.as_str().to_string()),
            zip_name: Some(
                input
                    .zip_name
                    .as_deref()
                    .map(str::trim)
                    .unwrap_or(&current.zip_name)
                    .to_string(),
            ),
            home_page: Some(current.home_page.clone()),
            zip_sha256: Some(current.zip_sha256.clone()),
            fix_root_relative_urls: Some(fix),
            zip_url: match source {
                SourceKind::Url => input.zip_url.clone(),
                _ => None,
            },
            zip_base64,
            ..ProjectInput::default()
        };
        // Validate on a copy before anything is imported.
        self.overwrite(&mut card.clone(), &overwrite)?;

        let imported = self.import(bytes, fix, preferred.as_deref()).await?;
        overwrite.home_page = Some(imported.home_page.clone());
        overwrite.zip_sha256 = Some(imported.project_id.clone());
        let mut result = self.overwrite(card, &overwrite)?;
        result.imported = Some(imported);
        Ok(result)
    }

    fn overwrite(&self, card: &mut CardData, input: &ProjectInput) -> Result<UpdateProjectResult, ProjectError> {
        let idx = resolve_target(
            &card.projects,
            trimmed(&input.target_project_id),
            trimmed(&input.target_zip_sha256),
        )?;
        let current = &card.projects[idx];
        let source = match &input.source {
            Some(raw) => SourceKind::parse(raw)?,
            None => current.source.kind(),
        };

        let pick = |given: &Option<String>, current: &str| -> String {
            given.as_deref().unwrap_or(current).trim().to_string()
        };
        let title = match &input.title {
            Some(t) => Some(t.trim()).filter(|t| !t.is_empty()).map(str::to_string),
            None => current.title.clone(),
        };
        let placeholder = pick(&input.placeholder, &current.placeholder);
        let home_page = pick(&input.home_page, &current.home_page);
        let zip_name = pick(&input.zip_name, &current.zip_name);
        let zip_sha256 = pick(&input.zip_sha256, &current.zip_sha256);
        let show_title_in_chat = input.show_title_in_chat.unwrap_or(current.show_title_in_chat);
        let fix = input.fix_root_relative_urls.unwrap_or(current.fix_root_relative_urls);

        if placeholder.is_empty() {
            return Err(ProjectError::EmptyField("placeholder"));
        }
        if home_page.is_empty() {
            return Err(ProjectError::EmptyField("homePage"));
        }
        if zip_name.is_empty() {
            return Err(ProjectError::EmptyField("zipName"));
        }
        let duplicated = card
            .projects
            .iter()
            .enumerate()
            .any(|(i, p)| i != idx && p.placeholder == placeholder);
        if duplicated {
            return Err(ProjectError::PlaceholderTaken(placeholder));
        }

        let source = match source {
            SourceKind::Url => {
                let zip_url = match (&input.zip_url, &current.source) {
                    (Some(u), _) => u.trim().to_string(),
                    (None, ProjectSource::Url { zip_url }) => zip_url.clone(),
                    (None, _) => String::new(),
                };
                if zip_url.is_empty() {
                    return Err(ProjectError::MissingField {
                        kind: "url",
                        field: "zipUrl",
                    });
                }
                ProjectSource::Url { zip_url }
            }
            SourceKind::Embedded => {
                let zip_base64 = match (&input.zip_base64, &current.source) {
                    (Some(b), _) => b.trim().to_string(),
                    (None, ProjectSource::Embedded { zip_base64 }) => zip_base64.clone(),
                    (None, _) => String::new(),
                };
                if zip_base64.is_empty() {
                    return Err(ProjectError::MissingField {
                        kind: "embedded",
                        field: "zipBase64",
                    });
                }
                if zip_sha256.is_empty() {
                    return Err(ProjectError::MissingField {
                        kind: "embedded",
                        field: "zipSha256",
                    });
                }
                if input.zip_base64.is_some() {
                    self.check_embedded_size(decode_base64(&zip_base64)?.len())?;
                }
                ProjectSource::Embedded { zip_base64 }
            }
            SourceKind::Local => {
                if zip_sha256.is_empty() {
                    return Err(ProjectError::MissingField {
                        kind: "local",
                        field: "zipSha256",
                    });
                }
                ProjectSource::Local
            }
        };

        let project = Project {
            id: current.id.clone(),
            title,
            placeholder,
            home_page,
            show_title_in_chat,
            fix_root_relative_urls: fix,
            zip_name,
            zip_sha256,
            source,
        };
        card.projects[idx] = project.clone();
        Ok(UpdateProjectResult {
            target_project_id: project.id.clone(),
            project,
            imported: None,
        })
    }

    pub async fn delete_project(&self, input: ProjectInput) -> Result<DeleteProjectResult, ProjectError> {
        let _guard = self.write_lock.lock().await;
        let mut card = self.cards.load()?;
        let idx = resolve_target(
            &card.projects,
            trimmed(&input.target_project_id),
            trimmed(&input.target_zip_sha256),
        )?;
        let deleted = card.projects.remove(idx);
        self.cards.save(&card)?;
        log::info!("deleted project {} ({})", deleted.id, deleted.display_name());
        Ok(DeleteProjectResult {
            deleted_project_id: deleted.id.clone(),
            deleted_project: deleted,
            remaining_count: card.projects.len(),
        })
    }

    /// Expose the CRUD operations as the `Higanbana` global (and its `higanbana` alias).
    pub fn install_api(self: &Arc<Self>, registry: &Registry) -> bool {
        fn op<T, F, Fut>(service: &Arc<ProjectService>, f: F) -> HostValue
        where
            T: Serialize,
            F: Fn(Arc<ProjectService>, ProjectInput) -> Fut + Send + Sync + 'static,
            Fut: std::future::Future<Output = Result<T, ProjectError>> + Send + 'static,
        {
            let service = Arc::clone(service);
            host_fn(move |args| {
                let payload = args.into_iter().next().unwrap_or(Value::Null);
                let call = ProjectInput::from_value(payload).map(|input| f(Arc::clone(&service), input));
                async move {
                    let out = call.map_err(|e| e.to_string())?.await.map_err(|e| e.to_string())?;
                    serde_json::to_value(out)
                        .map(HostValue::Data)
                        .map_err(|e| e.to_string())
                }
            })
        }

        let get = op(self, |s, input| async move { s.get_project(&input) });
        let api = HostValue::object([
            ("getProject".to_string(), get.clone()),
            ("getProjectConfig".to_string(), get),
            (
                "createProject".to_string(),
                op(self, |s, input| async move { s.create_project(input).await }),
            ),
            (
                "updateProject".to_string(),
                op(self, |s, input| async move { s.update_project(input).await }),
            ),
            (
                "deleteProject".to_string(),
                op(self, |s, input| async move { s.delete_project(input).await }),
            ),
        ]);
        let upper = registry.install("Higanbana", api.clone());
        let lower = registry.install("higanbana", api);
        upper || lower
    }
}
