//! Target path templates.
//!
//! A template such as `${INSTALL_PATH}/bin/$TOOL` is expanded against a
//! variable map. `INSTALL_PATH` is always the target root; `$$` produces a
//! literal dollar sign. The expanded path must stay inside the target root.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use inpack_schema::ContainerPath;

/// Variable bound to the target root.
pub const INSTALL_PATH: &str = "INSTALL_PATH";

/// Prefix reserved for inpack's own bookkeeping under the target root.
pub const RESERVED_PREFIX: &str = ".inpack";

/// Template expansion failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// The template references a variable with no binding.
    #[error("target '{template}' uses undefined variable '{name}'")]
    UnknownVariable {
        /// Offending template.
        template: String,
        /// Variable name.
        name: String,
    },

    /// Unterminated `${` or a `$` not followed by a name.
    #[error("target '{0}' is malformed")]
    Malformed(String),

    /// The expanded path leaves the target root.
    #[error("target '{template}' resolves outside the target root")]
    Escape {
        /// Offending template.
        template: String,
    },

    /// The expanded path lands in inpack's bookkeeping area.
    #[error("target '{0}' is inside the reserved .inpack directory")]
    Reserved(String),
}

/// A template expanded against one target root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Absolute target path.
    pub path: PathBuf,
    /// Path relative to the root, `/`-separated; used as the receipt key.
    pub relative: String,
}

/// Default template for an entry: `${INSTALL_PATH}/<container path>`.
pub fn default_template(path: &ContainerPath) -> String {
    format!("${{{INSTALL_PATH}}}/{path}")
}

/// Expand `template` under `root`.
///
/// Relative expansions are taken relative to `root`. `root` should be
/// absolute; see [`std::path::absolute`].
///
/// # Errors
///
/// Returns a [`TemplateError`] if a variable is undefined, the syntax is
/// malformed, or the result escapes `root`.
pub fn resolve_target(
    template: &str,
    root: &Path,
    vars: &BTreeMap<String, String>,
) -> Result<ResolvedTarget, TemplateError> {
    let expanded = expand(template, root, vars)?;
    let expanded = PathBuf::from(expanded);
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        root.join(expanded)
    };

    let escape = || TemplateError::Escape {
        template: template.to_string(),
    };

    let relative = joined.strip_prefix(root).map_err(|_| escape())?;
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(escape());
    }

    let segments: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if segments.is_empty() {
        return Err(escape());
    }
    if segments[0].starts_with(RESERVED_PREFIX) {
        return Err(TemplateError::Reserved(template.to_string()));
    }

    Ok(ResolvedTarget {
        path: root.join(relative),
        relative: segments.join("/"),
    })
}

fn expand(
    template: &str,
    root: &Path,
    vars: &BTreeMap<String, String>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    let malformed = || TemplateError::Malformed(template.to_string());

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let name = match chars.peek() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
                continue;
            }
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some((_, '}')) => break,
                        Some((_, ch)) => name.push(ch),
                        None => return Err(malformed()),
                    }
                }
                name
            }
            _ => {
                let mut name = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        name.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                name
            }
        };

        if name.is_empty() {
            return Err(malformed());
        }
        if name == INSTALL_PATH {
            out.push_str(&root.to_string_lossy());
        } else if let Some(value) = vars.get(&name) {
            out.push_str(value);
        } else {
            return Err(TemplateError::UnknownVariable {
                template: template.to_string(),
                name,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PathBuf {
        std::path::absolute("target-root").unwrap()
    }

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn default_template_lands_under_root() {
        let path = ContainerPath::parse("bin/app").unwrap();
        let t = resolve_target(&default_template(&path), &root(), &vars(&[])).unwrap();
        assert_eq!(t.path, root().join("bin").join("app"));
        assert_eq!(t.relative, "bin/app");
    }

    #[test]
    fn expands_both_variable_forms() {
        let t = resolve_target(
            "$INSTALL_PATH/${SUB}/$NAME.cfg",
            &root(),
            &vars(&[("SUB", "etc"), ("NAME", "app")]),
        )
        .unwrap();
        assert_eq!(t.relative, "etc/app.cfg");
    }

    #[test]
    fn relative_templates_resolve_against_root() {
        let t = resolve_target("share/$$literal", &root(), &vars(&[])).unwrap();
        assert_eq!(t.relative, "share/$literal");
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        assert_eq!(
            resolve_target("$NOPE/x", &root(), &vars(&[])),
            Err(TemplateError::UnknownVariable {
                template: "$NOPE/x".into(),
                name: "NOPE".into(),
            })
        );
        assert!(matches!(
            resolve_target("${INSTALL_PATH/x", &root(), &vars(&[])),
            Err(TemplateError::Malformed(_))
        ));
        assert!(matches!(
            resolve_target("$/x", &root(), &vars(&[])),
            Err(TemplateError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_escapes() {
        for template in ["${INSTALL_PATH}/../etc/passwd", "/etc/passwd", "${INSTALL_PATH}"] {
            assert!(
                matches!(
                    resolve_target(template, &root(), &vars(&[])),
                    Err(TemplateError::Escape { .. })
                ),
                "{template}"
            );
        }
    }

    #[test]
    fn rejects_reserved_directory() {
        assert!(matches!(
            resolve_target("${INSTALL_PATH}/.inpack/receipt.json", &root(), &vars(&[])),
            Err(TemplateError::Reserved(_))
        ));
    }
}
