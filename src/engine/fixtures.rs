use anyhow::{Context, Result};
use hyper::body::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::cli::config::{FixtureConfig, FixtureKind};

#[derive(Debug, Clone)]
pub enum Fixture {
    Binary {
        bytes: Bytes,
        filename: String,
        content_type: String,
    },
    Json {
        /// The whole document, serialized once.
        whole: Bytes,
        /// Each array element serialized once; empty for non-array documents.
        items: Arc<[Bytes]>,
    },
}

impl Fixture {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Fixture::Binary { .. } => "binary",
            Fixture::Json { .. } => "json",
        }
    }

    pub fn json(value: serde_json::Value) -> Result<Self> {
        let whole = Bytes::from(serde_json::to_vec(&value)?);
        let items = match &value {
            serde_json::Value::Array(elems) => elems
                .iter()
                .map(|e| serde_json::to_vec(e).map(Bytes::from))
                .collect::<serde_json::Result<Vec<_>>>()?,
            _ => Vec::new(),
        };
        Ok(Fixture::Json {
            whole,
            items: items.into(),
        })
    }
}

/// Immutable fixture set, loaded once before the run and shared by reference.
#[derive(Debug, Default, Clone)]
pub struct FixtureRegistry {
    fixtures: HashMap<String, Fixture>,
}

impl FixtureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every declared fixture. Relative paths resolve against `base_dir`.
    pub fn load<'a>(
        decls: impl IntoIterator<Item = (&'a String, &'a FixtureConfig)>,
        base_dir: &Path,
    ) -> Result<Self> {
        let mut registry = Self::new();
        for (name, decl) in decls {
            let path = base_dir.join(&decl.path);
            let raw = std::fs::read(&path)
                .with_context(|| format!("fixture `{}`: reading {}", name, path.display()))?;
            let fixture = match decl.kind {
                FixtureKind::Binary => Fixture::Binary {
                    filename: decl.filename.clone().unwrap_or_else(|| {
                        path.file_name()
                            .map(|f| f.to_string_lossy().into_owned())
                            .unwrap_or_else(|| name.clone())
                    }),
                    content_type: decl
                        .content_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    bytes: Bytes::from(raw),
                },
                FixtureKind::Json => {
                    let value: serde_json::Value = serde_json::from_slice(&raw)
                        .with_context(|| format!("fixture `{}`: parsing {}", name, path.display()))?;
                    Fixture::json(value)?
                }
            };
            tracing::debug!(fixture = %name, kind = fixture.kind_name(), "loaded fixture");
            registry.insert(name.clone(), fixture);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, name: impl Into<String>, fixture: Fixture) {
        self.fixtures.insert(name.into(), fixture);
    }

    pub fn get(&self, name: &str) -> Option<&Fixture> {
        self.fixtures.get(name)
    }

    pub fn len(&self) -> usize {
        self.fixtures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixtures.is_empty()
    }
}
