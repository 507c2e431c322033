use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::enums::FieldKind;

/// Definition of one concrete field on a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    /// Query-side phrases that should resolve to this field
    /// (e.g. "grand total" -> invoice_total).
    pub search_hints: Vec<String>,
}

/// Read-mostly template configuration consumed by the indexer and router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSchema {
    pub template_id: String,
    pub fields: Vec<FieldDef>,
    /// Semantic category -> concrete field names
    /// (e.g. "amount" -> [invoice_total, payment_amount]).
    pub canonical_map: BTreeMap<String, Vec<String>>,
    /// Phrases meaning "this concept is not extracted here"; the router
    /// answers these without touching the backend.
    pub not_extracted_terms: Vec<String>,
}

impl TemplateSchema {
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Expand a canonical term into the concrete fields that actually exist
    /// on this template, sorted for determinism.
    pub fn expand_canonical(&self, term: &str) -> Vec<String> {
        let mut fields: Vec<String> = self
            .canonical_map
            .get(term)
            .map(|names| {
                names
                    .iter()
                    .filter(|n| self.has_field(n))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        fields.sort();
        fields.dedup();
        fields
    }

    /// Resolve a query-side term: exact field name, then canonical category,
    /// then search hints. Returns every matching field (OR semantics).
    pub fn resolve_term(&self, term: &str) -> Vec<String> {
        let lower = term.to_lowercase();
        if self.has_field(&lower) {
            return vec![lower];
        }

        let canonical = self.expand_canonical(&lower);
        if !canonical.is_empty() {
            return canonical;
        }

        let mut hinted: Vec<String> = self
            .fields
            .iter()
            .filter(|f| f.search_hints.iter().any(|h| h.eq_ignore_ascii_case(&lower)))
            .map(|f| f.name.clone())
            .collect();
        hinted.sort();
        hinted.dedup();
        hinted
    }
}

/// Access to the external schema/template store.
pub trait SchemaStore: Send + Sync {
    fn template(&self, template_id: &str) -> Option<TemplateSchema>;

    fn templates(&self) -> Vec<TemplateSchema>;
}

/// In-memory schema store loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaStore {
    templates: BTreeMap<String, TemplateSchema>,
}

impl StaticSchemaStore {
    pub fn new(templates: Vec<TemplateSchema>) -> Self {
        Self {
            templates: templates
                .into_iter()
                .map(|t| (t.template_id.clone(), t))
                .collect(),
        }
    }
}

impl SchemaStore for StaticSchemaStore {
    fn template(&self, template_id: &str) -> Option<TemplateSchema> {
        self.templates.get(template_id).cloned()
    }

    fn templates(&self) -> Vec<TemplateSchema> {
        self.templates.values().cloned().collect()
    }
}
