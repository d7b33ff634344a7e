use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Slug of the well-known template whose clauses are seeded on first use.
pub const DEFAULT_TEMPLATE_SLUG: &str = "default";

/// Selection of configuration (template) ids driving one analysis run.
///
/// Ordering and duplicates in the request are irrelevant: `[A, B]` and
/// `[B, A, A]` are the same selection, which makes this the cache key for
/// stored analysis results.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateSet(BTreeSet<String>);

impl TemplateSet {
    /// Build a set from raw ids, trimming whitespace and dropping blanks.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            ids.into_iter()
                .map(|id| id.as_ref().trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
        )
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }

    /// Stored form: a JSON array of sorted ids.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.0)
    }

    /// Parse the stored form. Malformed input yields `None` so callers can
    /// treat it as a cache miss instead of an error.
    #[must_use]
    pub fn from_json(raw: &str) -> Option<Self> {
        match serde_json::from_str::<Vec<String>>(raw) {
            Ok(ids) => Some(Self::new(ids)),
            Err(e) => {
                tracing::warn!(error = %e, "Malformed stored template selection");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A standard clause belonging to a template, sent to the analysis service
/// as the reference the document is compared against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceClause {
    pub category: String,
    pub clause_item: String,
    pub standard_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
}

impl ReferenceClause {
    #[must_use]
    pub fn new(category: &str, clause_item: &str, standard_text: &str) -> Self {
        Self {
            category: category.to_string(),
            clause_item: clause_item.to_string(),
            standard_text: standard_text.to_string(),
            risk_level: None,
        }
    }
}

/// Reference clauses used for one run, keyed by template id.
pub type ClauseSnapshot = BTreeMap<String, Vec<ReferenceClause>>;

/// Stored analysis for a document: one opaque result blob per template,
/// the exact selection that produced it, and the clauses it was run against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub id: Uuid,
    pub document_id: Uuid,
    pub results_by_template: BTreeMap<String, serde_json::Value>,
    pub selected_template_ids: TemplateSet,
    pub reference_clauses: ClauseSnapshot,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisResult {
    /// Whether this stored result can serve a request for `requested`.
    #[must_use]
    pub fn matches_selection(&self, requested: &TemplateSet) -> bool {
        &self.selected_template_ids == requested
    }
}

/// Clauses seeded into the default template the first time it is used.
#[must_use]
pub fn default_reference_clauses() -> Vec<ReferenceClause> {
    vec![
        ReferenceClause::new(
            "Pricing and payment",
            "Total price and payment terms",
            "Party A shall remit each instalment by wire transfer or cheque within 30 days of the \
             scheduled date; instalment dates are listed clause by clause.",
        ),
        ReferenceClause::new(
            "Delivery and transport",
            "Delivery period",
            "Party B shall arrange hardware delivery within 30 days of the contract taking effect.",
        ),
        ReferenceClause::new(
            "Delivery and transport",
            "Transfer of title and risk",
            "Title and risk in the hardware pass to Party A on delivery.",
        ),
        ReferenceClause::new(
            "Delivery and transport",
            "Transport and insurance",
            "Party B arranges transport and insurance to the destination at its own cost.",
        ),
        ReferenceClause::new(
            "Warranty and service",
            "Hardware warranty period and limits",
            "Hardware warranty matches the host system warranty; unauthorised modification or \
             operation outside the maintenance procedure ends the warranty obligation.",
        ),
        ReferenceClause::new(
            "Warranty and service",
            "Remote service and network requirements",
            "Party A provides a stable, secure network; Party B is not liable for digital \
             services that cannot be delivered because remote access is disabled.",
        ),
        ReferenceClause::new(
            "IP, confidentiality and compliance",
            "Ownership of intellectual property",
            "Intellectual property in services and products remains with Party B and the \
             manufacturer; software and documentation may not be copied or resold.",
        ),
        ReferenceClause::new(
            "IP, confidentiality and compliance",
            "Confidentiality",
            "Both parties keep pricing, configuration and IP-related information confidential \
             unless the other party agrees in writing.",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_set_ignores_order_and_duplicates() {
        let a = TemplateSet::new(["A", "B"]);
        let b = TemplateSet::new(["B", "A", "A"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn template_set_trims_and_drops_blanks() {
        let set = TemplateSet::new([" X ", "", "   "]);
        assert_eq!(set.to_vec(), vec!["X".to_string()]);
    }

    #[test]
    fn template_set_json_is_sorted() {
        let set = TemplateSet::new(["b", "a"]);
        assert_eq!(set.to_json().unwrap(), r#"["a","b"]"#);
        assert_eq!(TemplateSet::from_json(r#"["b","a"]"#), Some(set));
    }

    #[test]
    fn malformed_template_json_is_none() {
        assert!(TemplateSet::from_json("not json").is_none());
        assert!(TemplateSet::from_json(r#"{"a":1}"#).is_none());
    }

    #[test]
    fn matches_selection_is_set_equality() {
        let now = Utc::now();
        let result = AnalysisResult {
            id: Uuid::now_v7(),
            document_id: Uuid::now_v7(),
            results_by_template: BTreeMap::new(),
            selected_template_ids: TemplateSet::new(["A", "B"]),
            reference_clauses: ClauseSnapshot::new(),
            created_at: now,
            updated_at: now,
        };
        assert!(result.matches_selection(&TemplateSet::new(["B", "A"])));
        assert!(!result.matches_selection(&TemplateSet::new(["A"])));
        assert!(!result.matches_selection(&TemplateSet::new(["A", "B", "C"])));
    }

    #[test]
    fn default_clauses_are_not_empty() {
        assert!(!default_reference_clauses().is_empty());
    }
}
