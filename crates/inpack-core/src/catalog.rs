//! Component catalog: the already-parsed set of installable components.
//!
//! The in-memory [`Catalog`] is what the resolver consumes. For the CLI a
//! catalog can also be loaded from a TOML file:
//!
//! ```toml
//! default_codec = "zstd"
//!
//! [[component]]
//! id = "core"
//! label = "Core files"
//!
//! [[component.artifact]]
//! path = "bin/app"
//! source = "build/app"
//!
//! [[component]]
//! id = "docs"
//! depends = ["core"]
//!
//! [[component.artifact]]
//! path = "share/doc"
//! source = "docs/"        # directories expand recursively
//! codec = "gzip"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use walkdir::WalkDir;

use inpack_schema::types::PathError;
use inpack_schema::{CodecId, ComponentId, ContainerPath, EntryFlags};

/// Errors loading a catalog file.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// The catalog file could not be read.
    #[error("cannot read catalog {path}: {source}")]
    Io {
        /// Catalog file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be deserialized into a catalog.
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// An artifact declares an invalid container path.
    #[error("component '{component}': invalid container path: {source}")]
    InvalidPath {
        /// Declaring component.
        component: String,
        /// Validation failure.
        #[source]
        source: PathError,
    },

    /// An artifact declares both or neither of `source` and `content`.
    #[error("component '{component}', artifact '{path}': exactly one of `source` or `content` is required")]
    SourceConflict {
        /// Declaring component.
        component: String,
        /// Declared container path.
        path: String,
    },

    /// A declared source file or directory cannot be inspected.
    #[error("component '{component}': source {path} is not accessible: {source}")]
    Source {
        /// Declaring component.
        component: String,
        /// Resolved source path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Where an artifact's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    /// A file on disk.
    File(PathBuf),
    /// Inline bytes.
    Bytes(Arc<[u8]>),
}

/// One file destined for a container path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Content source.
    pub source: ArtifactSource,
    /// Identity used for de-duplication.
    pub container_path: ContainerPath,
    /// Target path template; defaults to `${INSTALL_PATH}/<container path>`.
    pub target: Option<String>,
    /// Explicit codec; the build default applies when absent.
    pub codec: Option<CodecId>,
    /// Deploy flags copied into the file entry.
    pub flags: EntryFlags,
    /// Replace an earlier component's claim on the same container path
    /// instead of being dropped.
    pub override_earlier: bool,
}

impl Artifact {
    /// A file artifact with default options.
    pub fn file(container_path: ContainerPath, source: impl Into<PathBuf>) -> Self {
        Self::with_source(container_path, ArtifactSource::File(source.into()))
    }

    /// An inline-bytes artifact with default options.
    pub fn bytes(container_path: ContainerPath, data: impl Into<Arc<[u8]>>) -> Self {
        Self::with_source(container_path, ArtifactSource::Bytes(data.into()))
    }

    fn with_source(container_path: ContainerPath, source: ArtifactSource) -> Self {
        Self {
            source,
            container_path,
            target: None,
            codec: None,
            flags: EntryFlags::default(),
            override_earlier: false,
        }
    }
}

/// A named, independently selectable unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    /// Identifier, expected to be unique in the catalog.
    pub id: ComponentId,
    /// Human label.
    pub label: String,
    /// Artifacts in declaration order.
    pub artifacts: Vec<Artifact>,
    /// Dependency identifiers in declaration order.
    pub depends: Vec<ComponentId>,
}

impl Component {
    /// A component with no artifacts or dependencies.
    pub fn new(id: impl Into<ComponentId>) -> Self {
        let id = id.into();
        Self {
            label: id.to_string(),
            id,
            artifacts: Vec::new(),
            depends: Vec::new(),
        }
    }

    /// Append an artifact.
    pub fn artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Append a dependency.
    pub fn depends_on(mut self, id: impl Into<ComponentId>) -> Self {
        self.depends.push(id.into());
        self
    }
}

/// Immutable set of components.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    components: Vec<Component>,
    default_codec: Option<CodecId>,
}

impl Catalog {
    /// Build a catalog from components in declaration order.
    pub fn new(components: Vec<Component>) -> Self {
        Self {
            components,
            default_codec: None,
        }
    }

    /// Components in declaration order.
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Codec requested by the catalog file, if any.
    pub fn default_codec(&self) -> Option<&CodecId> {
        self.default_codec.as_ref()
    }

    /// All components carrying `id`. More than one means the id is ambiguous.
    pub fn matching(&self, id: &str) -> Vec<&Component> {
        self.components
            .iter()
            .filter(|c| c.id.as_str() == id)
            .collect()
    }

    /// Identifiers in declaration order.
    pub fn ids(&self) -> Vec<ComponentId> {
        self.components.iter().map(|c| c.id.clone()).collect()
    }

    /// Load a TOML catalog. Relative sources resolve against the file's directory.
    ///
    /// # Errors
    ///
    /// Returns a [`CatalogError`] if the file cannot be read or parsed, or if
    /// any artifact declaration is invalid.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&content, base)
    }

    /// Parse a TOML catalog with sources relative to `base_dir`.
    ///
    /// # Errors
    ///
    /// See [`Catalog::load`].
    pub fn from_toml_str(content: &str, base_dir: &Path) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(content)?;

        let mut components = Vec::with_capacity(file.components.len());
        for decl in file.components {
            let mut artifacts = Vec::new();
            for artifact in &decl.artifacts {
                artifacts.extend(expand_artifact(&decl.id, artifact, base_dir)?);
            }
            components.push(Component {
                label: decl.label.unwrap_or_else(|| decl.id.clone()),
                id: ComponentId::new(decl.id),
                artifacts,
                depends: decl.depends.into_iter().map(ComponentId::new).collect(),
            });
        }

        Ok(Self {
            components,
            default_codec: file.default_codec.map(CodecId::new),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    default_codec: Option<String>,
    #[serde(default, rename = "component")]
    components: Vec<ComponentDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ComponentDecl {
    id: String,
    label: Option<String>,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default, rename = "artifact")]
    artifacts: Vec<ArtifactDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ArtifactDecl {
    path: String,
    source: Option<PathBuf>,
    content: Option<String>,
    target: Option<String>,
    codec: Option<String>,
    #[serde(default)]
    overwrite_if_newer: bool,
    #[serde(default)]
    loose: bool,
    #[serde(default)]
    requires_elevation: bool,
    #[serde(default, rename = "override")]
    override_earlier: bool,
}

fn expand_artifact(
    component: &str,
    decl: &ArtifactDecl,
    base_dir: &Path,
) -> Result<Vec<Artifact>, CatalogError> {
    let invalid_path = |source| CatalogError::InvalidPath {
        component: component.to_string(),
        source,
    };
    let container_path = ContainerPath::parse(&decl.path).map_err(invalid_path)?;

    let template = |artifact: Artifact| Artifact {
        target: decl.target.clone(),
        codec: decl.codec.as_deref().map(CodecId::from),
        flags: EntryFlags {
            overwrite_if_newer: decl.overwrite_if_newer,
            loose: decl.loose,
            requires_elevation: decl.requires_elevation,
        },
        override_earlier: decl.override_earlier,
        ..artifact
    };

    match (&decl.source, &decl.content) {
        (None, Some(content)) => Ok(vec![template(Artifact::bytes(
            container_path,
            content.as_bytes(),
        ))]),
        (Some(source), None) => {
            let source = base_dir.join(source);
            let meta = fs::metadata(&source).map_err(|e| CatalogError::Source {
                component: component.to_string(),
                path: source.clone(),
                source: e,
            })?;

            if !meta.is_dir() {
                return Ok(vec![template(Artifact::file(container_path, source))]);
            }

            // A target template only makes sense for a single file.
            if decl.target.is_some() {
                tracing::warn!(
                    component,
                    path = %container_path,
                    "ignoring `target` on a directory source"
                );
            }

            // Symlinks are followed and packed as the files they point to.
            let mut expanded = Vec::new();
            for entry in WalkDir::new(&source).follow_links(true).sort_by_file_name() {
                let entry = entry.map_err(|e| CatalogError::Source {
                    component: component.to_string(),
                    path: source.clone(),
                    source: e.into(),
                })?;
                let file_type = entry.file_type();
                if file_type.is_dir() {
                    continue;
                }
                if !file_type.is_file() {
                    tracing::warn!(
                        component,
                        path = %entry.path().display(),
                        "skipping special file in directory source"
                    );
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&source)
                    .unwrap_or(entry.path())
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                let child = container_path.join(&relative).map_err(invalid_path)?;
                let mut artifact = template(Artifact::file(child, entry.path()));
                artifact.target = None;
                expanded.push(artifact);
            }
            Ok(expanded)
        }
        _ => Err(CatalogError::SourceConflict {
            component: component.to_string(),
            path: decl.path.clone(),
        }),
    }
}
