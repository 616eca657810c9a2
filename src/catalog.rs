//! Static table of provisionable templates.

use std::collections::HashMap;
use std::path::Path;

use crate::error::CatalogError;
use crate::model::Template;

/// Read-only template lookup, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    templates: HashMap<String, Template>,
}

impl Catalog {
    /// Build a catalog, rejecting duplicate ids and zero lifetimes.
    pub fn new(templates: Vec<Template>) -> Result<Self, CatalogError> {
        let mut map = HashMap::with_capacity(templates.len());
        for template in templates {
            if template.lifetime_seconds == 0 {
                return Err(CatalogError::ZeroLifetime(template.template_id));
            }
            if map.contains_key(&template.template_id) {
                return Err(CatalogError::DuplicateTemplate(template.template_id));
            }
            map.insert(template.template_id.clone(), template);
        }
        Ok(Self { templates: map })
    }

    /// Load a JSON array of templates from `path`.
    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        let templates: Vec<Template> = serde_json::from_str(&raw)?;
        Self::new(templates)
    }

    /// The two challenges shipped with the default deployment.
    pub fn builtin() -> Self {
        let templates = [
            Template {
                template_id: "b73f33df893b2fce40d845b298c5f29696298d9f1e226144c72c00c263fb41bf"
                    .to_string(),
                tag: "web_01:latest".to_string(),
                challenge_id: 1,
                challenge_name: "TEST_Challenge".to_string(),
                lifetime_seconds: 60,
            },
            Template {
                template_id: "a4cc40b2f5d86078b76210cf023472ed569409bb153a36ca4202bee3bd9458a0"
                    .to_string(),
                tag: "redletter:latest".to_string(),
                challenge_id: 7,
                challenge_name: "REDLETTER".to_string(),
                lifetime_seconds: 60,
            },
        ];
        Self {
            templates: templates
                .into_iter()
                .map(|t| (t.template_id.clone(), t))
                .collect(),
        }
    }

    pub fn lookup(&self, template_id: &str) -> Option<&Template> {
        self.templates.get(template_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Template> {
        self.templates.values()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
