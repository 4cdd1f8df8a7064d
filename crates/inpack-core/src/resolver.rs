//! Dependency resolution: component request to ordered, de-duplicated artifacts.

use std::collections::HashMap;

use thiserror::Error;

use inpack_schema::{ComponentId, ContainerPath};

use crate::catalog::{Artifact, Catalog, Component};

/// Failures resolving a component request. All are raised before any
/// archive IO happens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// An identifier matches more than one catalog component.
    #[error("component '{id}' is ambiguous ({matches} components share this id)")]
    AmbiguousComponent {
        /// Requested identifier.
        id: ComponentId,
        /// Number of matching components.
        matches: usize,
    },

    /// An identifier matches no catalog component.
    #[error("{}", missing_message(.id, .required_by.as_ref()))]
    MissingDependency {
        /// Unknown identifier.
        id: ComponentId,
        /// Component that declared the dependency; `None` for a top-level request.
        required_by: Option<ComponentId>,
    },

    /// A dependency edge leads back to a component still being visited.
    #[error("circular dependency: {}", format_chain(.chain))]
    CyclicDependency {
        /// Visiting stack from the first repeated component back to itself.
        chain: Vec<ComponentId>,
    },
}

impl ResolutionError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::AmbiguousComponent { .. } => 10,
            Self::MissingDependency { .. } => 11,
            Self::CyclicDependency { .. } => 12,
        }
    }
}

fn missing_message(id: &ComponentId, required_by: Option<&ComponentId>) -> String {
    match required_by {
        Some(parent) => format!("component '{parent}' depends on unknown component '{id}'"),
        None => format!("component '{id}' not found in catalog"),
    }
}

fn format_chain(chain: &[ComponentId]) -> String {
    chain
        .iter()
        .map(ComponentId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// One artifact selected for the build, with the component that claimed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    /// Claiming component.
    pub component: ComponentId,
    /// The artifact itself.
    pub artifact: Artifact,
}

/// A claim on a container path that did not make it into the resolved set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shadowed {
    /// Contested container path.
    pub container_path: ContainerPath,
    /// Component whose claim was discarded.
    pub dropped: ComponentId,
    /// Component whose claim is in the resolved set.
    pub kept: ComponentId,
    /// `true` when the discarded claim was the earlier one, replaced by an
    /// explicit override.
    pub overridden: bool,
}

/// Ordered, de-duplicated artifact list produced by [`resolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedSet {
    /// Artifacts in visitation order; container paths are unique.
    pub artifacts: Vec<ResolvedArtifact>,
    /// Claims discarded during de-duplication, in the order they were seen.
    pub shadowed: Vec<Shadowed>,
    /// Components in visitation order (dependencies before dependents).
    pub components: Vec<ComponentId>,
}

impl ResolvedSet {
    /// Number of artifacts.
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    /// Returns `true` if nothing was resolved.
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Container paths in order.
    pub fn paths(&self) -> impl Iterator<Item = &ContainerPath> {
        self.artifacts.iter().map(|r| &r.artifact.container_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

struct Walk<'a> {
    catalog: &'a Catalog,
    marks: HashMap<ComponentId, Mark>,
    stack: Vec<ComponentId>,
    claims: HashMap<ContainerPath, usize>,
    out: ResolvedSet,
}

/// Resolve `requested` against `catalog` into an ordered artifact list.
///
/// Performs a depth-first walk in request order. Each component's
/// dependencies are visited before its own artifacts are appended, and each
/// component is visited at most once. When two components claim the same
/// container path the first one visited wins, unless the later artifact is
/// marked as an override, in which case it replaces the earlier claim at
/// the earlier claim's position.
///
/// # Errors
///
/// Returns a [`ResolutionError`] for an unknown or ambiguous identifier or a
/// dependency cycle.
pub fn resolve(
    catalog: &Catalog,
    requested: &[ComponentId],
) -> Result<ResolvedSet, ResolutionError> {
    let mut walk = Walk {
        catalog,
        marks: HashMap::new(),
        stack: Vec::new(),
        claims: HashMap::new(),
        out: ResolvedSet::default(),
    };

    for id in requested {
        walk.visit(id, None)?;
    }

    tracing::debug!(
        components = walk.out.components.len(),
        artifacts = walk.out.artifacts.len(),
        shadowed = walk.out.shadowed.len(),
        "resolved component request"
    );
    Ok(walk.out)
}

impl<'a> Walk<'a> {
    fn visit(
        &mut self,
        id: &ComponentId,
        required_by: Option<&ComponentId>,
    ) -> Result<(), ResolutionError> {
        match self.marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = self.stack.iter().position(|c| c == id).unwrap_or(0);
                let mut chain = self.stack[start..].to_vec();
                chain.push(id.clone());
                return Err(ResolutionError::CyclicDependency { chain });
            }
            None => {}
        }

        let component = self.lookup(id, required_by)?;

        self.marks.insert(id.clone(), Mark::Visiting);
        self.stack.push(id.clone());

        for dep in &component.depends {
            self.visit(dep, Some(id))?;
        }

        self.stack.pop();
        self.marks.insert(id.clone(), Mark::Done);
        self.out.components.push(id.clone());

        for artifact in &component.artifacts {
            self.claim(id, artifact);
        }
        Ok(())
    }

    fn lookup(
        &self,
        id: &ComponentId,
        required_by: Option<&ComponentId>,
    ) -> Result<&'a Component, ResolutionError> {
        match self.catalog.matching(id.as_str()).as_slice() {
            [] => Err(ResolutionError::MissingDependency {
                id: id.clone(),
                required_by: required_by.cloned(),
            }),
            [component] => Ok(*component),
            many => Err(ResolutionError::AmbiguousComponent {
                id: id.clone(),
                matches: many.len(),
            }),
        }
    }

    fn claim(&mut self, component: &ComponentId, artifact: &Artifact) {
        let path = &artifact.container_path;
        let Some(&index) = self.claims.get(path) else {
            self.claims.insert(path.clone(), self.out.artifacts.len());
            self.out.artifacts.push(ResolvedArtifact {
                component: component.clone(),
                artifact: artifact.clone(),
            });
            return;
        };

        let holder = self.out.artifacts[index].component.clone();
        if artifact.override_earlier {
            tracing::debug!(%path, from = %holder, to = %component, "claim overridden");
            self.out.artifacts[index] = ResolvedArtifact {
                component: component.clone(),
                artifact: artifact.clone(),
            };
            self.out.shadowed.push(Shadowed {
                container_path: path.clone(),
                dropped: holder,
                kept: component.clone(),
                overridden: true,
            });
        } else {
            tracing::debug!(%path, kept = %holder, dropped = %component, "duplicate claim dropped");
            self.out.shadowed.push(Shadowed {
                container_path: path.clone(),
                dropped: component.clone(),
                kept: holder,
                overridden: false,
            });
        }
    }
}
