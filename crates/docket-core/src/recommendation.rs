use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditLog, AuditSource, AuditStatus, NewAuditEntry};
use crate::extraction::{Endpoint, ExtractionClient};
use crate::service_info::{Aspect, ServiceInfoSnapshot};
use crate::storage::Storage;

pub const RECOMMENDATION_PATH: &str = "/api/v1/service_plan_recommendation";

const RATIONALE_MAX_CHARS: usize = 30;
const SNIPPET_MAX_CHARS: usize = 360;

/// Both markers appear in the service type of a standard service plan.
const STANDARD_PLAN_MARKERS: [&str; 2] = ["智", "保"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePlanClause {
    pub category: Option<String>,
    pub clause_item: String,
    pub requirement: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePlan {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub clauses: Vec<ServicePlanClause>,
    pub created_at: DateTime<Utc>,
}

impl ServicePlan {
    #[must_use]
    pub fn new(name: impl Into<String>, description: Option<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            description,
            clauses: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_clause(mut self, clause: ServicePlanClause) -> Self {
        self.clauses.push(clause);
        self
    }
}

/// A plan-bearing item with no explicit service type, described for matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClauseInput {
    pub clause_id: String,
    pub clause_type: Aspect,
    pub clause_text: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub structured_attributes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_snippet: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanCandidate {
    pub plan_id: String,
    pub plan_name: String,
    pub description: Option<String>,
    pub clauses: Vec<ServicePlanClause>,
}

impl From<&ServicePlan> for PlanCandidate {
    fn from(plan: &ServicePlan) -> Self {
        Self {
            plan_id: plan.id.to_string(),
            plan_name: plan.name.clone(),
            description: plan.description.clone(),
            clauses: plan.clauses.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClausePlanMatch {
    pub clause_id: String,
    pub clause_type: String,
    pub recommended_plan_id: Option<String>,
    pub recommended_plan_name: Option<String>,
    pub rationale: String,
    pub alternative_plan_ids: Vec<String>,
    pub alternative_plan_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePlanRecommendation {
    pub summary: String,
    pub overall_plan_id: Option<String>,
    pub overall_plan_name: Option<String>,
    pub overall_adjustment_notes: Option<String>,
    pub matches: Vec<ClausePlanMatch>,
}

/// Response as sent by the remote service, before normalization.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawRecommendation {
    summary: Option<String>,
    overall_plan_id: Option<String>,
    overall_plan_name: Option<String>,
    overall_adjustment_notes: Option<String>,
    matches: Option<Vec<RawMatch>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawMatch {
    clause_id: String,
    clause_type: String,
    recommended_plan_id: Option<String>,
    recommended_plan_name: Option<String>,
    rationale: Option<String>,
    alternative_plan_ids: Option<Vec<String>>,
    alternative_plan_names: Option<Vec<String>>,
}

impl From<RawRecommendation> for ServicePlanRecommendation {
    fn from(raw: RawRecommendation) -> Self {
        Self {
            summary: raw.summary.as_deref().map(str::trim).unwrap_or_default().to_string(),
            overall_plan_id: trimmed(raw.overall_plan_id),
            overall_plan_name: trimmed(raw.overall_plan_name),
            overall_adjustment_notes: trimmed(raw.overall_adjustment_notes),
            matches: raw
                .matches
                .unwrap_or_default()
                .into_iter()
                .map(|m| ClausePlanMatch {
                    clause_id: m.clause_id,
                    clause_type: m.clause_type,
                    recommended_plan_id: trimmed(m.recommended_plan_id),
                    recommended_plan_name: trimmed(m.recommended_plan_name),
                    rationale: truncate_with_ellipsis(
                        m.rationale.as_deref().unwrap_or_default().trim(),
                        RATIONALE_MAX_CHARS,
                    ),
                    alternative_plan_ids: non_blank(m.alternative_plan_ids),
                    alternative_plan_names: non_blank(m.alternative_plan_names),
                })
                .collect(),
        }
    }
}

/// Whether a service type names one of the standard plans.
#[must_use]
pub fn is_standard_service_type(service_type: Option<&str>) -> bool {
    service_type.is_some_and(|s| STANDARD_PLAN_MARKERS.iter().all(|m| s.contains(m)))
}

/// Recommendation is derived only when no item is classified under a
/// standard plan and at least one item carries no service type at all.
#[must_use]
pub fn should_recommend(snapshot: &ServiceInfoSnapshot) -> bool {
    let classified = snapshot.service_types().any(is_standard_service_type);
    !classified && !build_clause_inputs(snapshot).is_empty()
}

/// Describe every item lacking an explicit service type.
#[must_use]
pub fn build_clause_inputs(snapshot: &ServiceInfoSnapshot) -> Vec<ClauseInput> {
    let mut clauses = Vec::new();

    for (index, item) in snapshot.onsite_sla.iter().enumerate() {
        if has_service_type(item.service_type.as_deref()) {
            continue;
        }
        let devices: Vec<String> = item
            .devices
            .iter()
            .filter_map(|d| d.device_name.clone())
            .collect();
        let mut attrs = BTreeMap::new();
        attrs.insert("responseTimeHours".into(), number_or(item.response_time_hours, "not provided"));
        attrs.insert("onSiteTimeHours".into(), number_or(item.on_site_time_hours, "not provided"));
        attrs.insert(
            "coverage".into(),
            item.coverage.clone().unwrap_or_else(|| "not stated".into()),
        );
        let mut parts = vec![
            item.response_time_hours.map_or_else(
                || "response time not provided".to_string(),
                |h| format!("response within {} hours", fmt_number(h)),
            ),
            item.on_site_time_hours.map_or_else(
                || "on-site time not provided".to_string(),
                |h| format!("on site within {} hours", fmt_number(h)),
            ),
            item.coverage
                .as_ref()
                .map_or_else(|| "coverage not stated".to_string(), |c| format!("coverage {c}")),
        ];
        if !devices.is_empty() {
            parts.push(format!("devices: {}", devices.join(", ")));
            attrs.insert("devices".into(), devices.join(", "));
        }
        clauses.push(clause(
            format!("onsite-{index}"),
            Aspect::OnsiteSla,
            &parts,
            attrs,
            item.original_contract_snippet.as_deref(),
        ));
    }

    for (index, item) in snapshot.yearly_maintenance.iter().enumerate() {
        if has_service_type(item.service_type.as_deref()) {
            continue;
        }
        let mut attrs = BTreeMap::new();
        attrs.insert("standardPmPerYear".into(), number_or(item.standard_pm_per_year, "not provided"));
        let mut parts = vec![item.standard_pm_per_year.map_or_else(
            || "standard maintenance count not provided".to_string(),
            |n| format!("{} standard maintenance visits per year", fmt_number(n)),
        )];
        if let Some(n) = item.smart_pm_per_year {
            parts.push(format!("{} smart maintenance visits per year", fmt_number(n)));
            attrs.insert("smartPmPerYear".into(), fmt_number(n));
        }
        if let Some(n) = item.remote_pm_per_year {
            parts.push(format!("{} remote maintenance visits per year", fmt_number(n)));
            attrs.insert("remotePmPerYear".into(), fmt_number(n));
        }
        if !item.scope.is_empty() {
            parts.push(format!("scope: {}", item.scope.join(", ")));
            attrs.insert("scope".into(), item.scope.join(", "));
        }
        if let Some(d) = &item.deliverables {
            parts.push(format!("deliverables: {d}"));
            attrs.insert("deliverables".into(), d.clone());
        }
        if let Some(s) = &item.scheduling {
            parts.push(format!("scheduling: {s}"));
            attrs.insert("scheduling".into(), s.clone());
        }
        clauses.push(clause(
            format!("yearly-{index}"),
            Aspect::YearlyMaintenance,
            &parts,
            attrs,
            item.original_contract_snippet.as_deref(),
        ));
    }

    for (index, item) in snapshot.remote_maintenance.iter().enumerate() {
        if has_service_type(item.service_type.as_deref()) {
            continue;
        }
        let mut attrs = BTreeMap::new();
        let counts: Vec<String> = item
            .pm_per_year_by_modality
            .iter()
            .map(|(modality, n)| {
                attrs.insert(format!("remotePm.{modality}"), fmt_number(*n));
                format!("{modality} {} per year", fmt_number(*n))
            })
            .collect();
        let mut parts = vec![
            item.platform
                .as_ref()
                .map_or_else(|| "platform not stated".to_string(), |p| format!("platform: {p}")),
            if counts.is_empty() {
                "no remote maintenance frequency provided".to_string()
            } else {
                format!("remote maintenance: {}", counts.join(", "))
            },
        ];
        if let Some(p) = &item.platform {
            attrs.insert("platform".into(), p.clone());
        }
        if let Some(n) = item.max_users_per_device {
            parts.push(format!("at most {} users per device", fmt_number(n)));
            attrs.insert("maxUsersPerDevice".into(), fmt_number(n));
        }
        if !item.reports.is_empty() {
            parts.push(format!("reports: {}", item.reports.join(", ")));
            attrs.insert("reports".into(), item.reports.join(", "));
        }
        clauses.push(clause(
            format!("remote-{index}"),
            Aspect::RemoteMaintenance,
            &parts,
            attrs,
            item.original_contract_snippet.as_deref(),
        ));
    }

    for (index, item) in snapshot.training_supports.iter().enumerate() {
        if has_service_type(item.service_type.as_deref()) {
            continue;
        }
        let mut attrs = BTreeMap::new();
        let mut parts = vec![item.training_category.as_ref().map_or_else(
            || "training category not stated".to_string(),
            |c| format!("training category: {c}"),
        )];
        if let Some(c) = &item.training_category {
            attrs.insert("trainingCategory".into(), c.clone());
        }
        if !item.applicable_devices.is_empty() {
            parts.push(format!("devices: {}", item.applicable_devices.join(", ")));
            attrs.insert("applicableDevices".into(), item.applicable_devices.join(", "));
        }
        for (key, label, value) in [
            ("trainingTimes", "sessions", item.training_times),
            ("trainingDays", "days per session", item.training_days),
            ("trainingSeats", "seats", item.training_seats),
        ] {
            if let Some(n) = value {
                parts.push(format!("{} {label}", fmt_number(n)));
                attrs.insert(key.into(), fmt_number(n));
            }
        }
        if let Some(p) = &item.training_period {
            parts.push(format!("period: {p}"));
            attrs.insert("trainingPeriod".into(), p.clone());
        }
        if let Some(c) = &item.training_cost {
            parts.push(format!("cost: {c}"));
            attrs.insert("trainingCost".into(), c.clone());
        }
        clauses.push(clause(
            format!("training-{index}"),
            Aspect::TrainingSupport,
            &parts,
            attrs,
            item.original_contract_snippet.as_deref(),
        ));
    }

    for (index, item) in snapshot.key_spare_parts.iter().enumerate() {
        if has_service_type(item.service_type.as_deref()) {
            continue;
        }
        let mut attrs = BTreeMap::new();
        let mut parts = vec![if item.covered_items.is_empty() {
            "covered parts not stated".to_string()
        } else {
            attrs.insert("coveredItems".into(), item.covered_items.join(", "));
            format!("covered parts: {}", item.covered_items.join(", "))
        }];
        if let Some(p) = &item.replacement_policy {
            parts.push(format!("replacement policy: {p}"));
            attrs.insert("replacementPolicy".into(), p.clone());
        }
        if let Some(required) = item.old_part_return_required {
            let text = if required { "required" } else { "not required" };
            parts.push(format!("old part return {text}"));
            attrs.insert("oldPartReturnRequired".into(), required.to_string());
        }
        if let Some(pct) = item.non_return_penalty_pct {
            parts.push(format!("non-return penalty up to {}%", fmt_number(pct)));
            attrs.insert("nonReturnPenaltyPct".into(), fmt_number(pct));
        }
        if let Some(l) = &item.logistics_by {
            parts.push(format!("logistics by {l}"));
            attrs.insert("logisticsBy".into(), l.clone());
        }
        if let Some(days) = item.lead_time_business_days {
            parts.push(format!("lead time {} business days", fmt_number(days)));
            attrs.insert("leadTimeBusinessDays".into(), fmt_number(days));
        }
        clauses.push(clause(
            format!("spare-{index}"),
            Aspect::KeySpareParts,
            &parts,
            attrs,
            item.original_contract_snippet.as_deref(),
        ));
    }

    clauses
}

/// Best-effort plan matching for ambiguous service items.
///
/// Never fails: every problem is logged and audited, and yields `None`.
#[derive(Clone)]
pub struct Recommender {
    storage: Storage,
    audit: AuditLog,
    client: ExtractionClient,
    base_url: Option<Url>,
    timeout: Duration,
}

impl Recommender {
    #[must_use]
    pub const fn new(
        storage: Storage,
        audit: AuditLog,
        client: ExtractionClient,
        base_url: Option<Url>,
        timeout: Duration,
    ) -> Self {
        Self {
            storage,
            audit,
            client,
            base_url,
            timeout,
        }
    }

    pub async fn recommend(
        &self,
        document_id: Uuid,
        snapshot: &ServiceInfoSnapshot,
    ) -> Option<ServicePlanRecommendation> {
        if !should_recommend(snapshot) {
            return None;
        }

        let started = Instant::now();
        let entry =
            NewAuditEntry::new(AuditAction::ServicePlanRecommendation, AuditSource::Remote)
                .document(document_id);

        let Some(base_url) = &self.base_url else {
            tracing::warn!(%document_id, "Recommendation service not configured, skipping");
            self.audit
                .record(
                    entry
                        .status(AuditStatus::Skipped)
                        .description("Recommendation service not configured"),
                )
                .await;
            return None;
        };

        let plans = match self.storage.list_service_plans().await {
            Ok(plans) => plans,
            Err(e) => {
                tracing::error!(%document_id, error = %e, "Failed to load service plans");
                self.audit
                    .record(entry.duration(started.elapsed()).failed(&e))
                    .await;
                return None;
            }
        };

        if plans.is_empty() {
            self.audit
                .record(
                    entry
                        .status(AuditStatus::Skipped)
                        .description("No candidate service plans"),
                )
                .await;
            return None;
        }

        let clauses = build_clause_inputs(snapshot);
        let candidates: Vec<PlanCandidate> = plans.iter().map(PlanCandidate::from).collect();
        let body = serde_json::json!({ "clauses": clauses, "candidates": candidates });

        let endpoint = match Endpoint::new(
            "service_plan_recommendation",
            base_url,
            RECOMMENDATION_PATH,
            body,
        ) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.audit.record(entry.failed(&e)).await;
                return None;
            }
        };

        match self.client.call::<RawRecommendation>(&endpoint, self.timeout).await {
            Ok(raw) => {
                let recommendation = ServicePlanRecommendation::from(raw);
                self.audit
                    .record(
                        entry
                            .description("Service plan recommended")
                            .duration(started.elapsed())
                            .metadata(serde_json::json!({
                                "clauses": clauses.len(),
                                "candidates": candidates.len(),
                                "overallPlanId": recommendation.overall_plan_id,
                            })),
                    )
                    .await;
                Some(recommendation)
            }
            Err(e) => {
                tracing::warn!(%document_id, error = %e, "Service plan recommendation failed");
                self.audit
                    .record(entry.duration(started.elapsed()).failed(&e))
                    .await;
                None
            }
        }
    }
}

fn clause(
    clause_id: String,
    clause_type: Aspect,
    parts: &[String],
    structured_attributes: BTreeMap<String, String>,
    snippet: Option<&str>,
) -> ClauseInput {
    ClauseInput {
        clause_id,
        clause_type,
        clause_text: parts.join("; "),
        structured_attributes,
        original_snippet: snippet.map(|s| {
            let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
            truncate_with_ellipsis(&collapsed, SNIPPET_MAX_CHARS)
        }),
    }
}

fn has_service_type(value: Option<&str>) -> bool {
    value.is_some_and(|s| !s.trim().is_empty())
}

fn fmt_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{n:.0}")
    } else {
        n.to_string()
    }
}

fn number_or(value: Option<f64>, fallback: &str) -> String {
    value.map_or_else(|| fallback.to_string(), fmt_number)
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn non_blank(values: Option<Vec<String>>) -> Vec<String> {
    values
        .unwrap_or_default()
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_info::{OnsiteSlaItem, TrainingSupportItem, YearlyMaintenanceItem};

    #[test]
    fn standard_service_type_needs_both_markers() {
        assert!(is_standard_service_type(Some("精智保")));
        assert!(!is_standard_service_type(Some("智享")));
        assert!(!is_standard_service_type(None));
    }

    #[test]
    fn recommends_only_for_unclassified_items() {
        let mut snapshot = ServiceInfoSnapshot::default();
        assert!(!should_recommend(&snapshot));

        snapshot.onsite_sla.push(OnsiteSlaItem {
            response_time_hours: Some(4.0),
            ..OnsiteSlaItem::default()
        });
        assert!(should_recommend(&snapshot));

        snapshot.yearly_maintenance.push(YearlyMaintenanceItem {
            service_type: Some("精智保".into()),
            ..YearlyMaintenanceItem::default()
        });
        assert!(!should_recommend(&snapshot));
    }

    #[test]
    fn explicit_non_standard_types_are_not_ambiguous() {
        let mut snapshot = ServiceInfoSnapshot::default();
        snapshot.training_supports.push(TrainingSupportItem {
            service_type: Some("custom".into()),
            ..TrainingSupportItem::default()
        });
        assert!(build_clause_inputs(&snapshot).is_empty());
        assert!(!should_recommend(&snapshot));
    }

    #[test]
    fn clause_inputs_describe_items() {
        let mut snapshot = ServiceInfoSnapshot::default();
        snapshot.onsite_sla.push(OnsiteSlaItem {
            response_time_hours: Some(4.0),
            coverage: Some("24x7".into()),
            original_contract_snippet: Some("  respond   within\nfour hours ".into()),
            ..OnsiteSlaItem::default()
        });
        let clauses = build_clause_inputs(&snapshot);
        assert_eq!(clauses.len(), 1);
        assert_eq!(clauses[0].clause_id, "onsite-0");
        assert_eq!(clauses[0].clause_type, Aspect::OnsiteSla);
        assert!(clauses[0].clause_text.contains("response within 4 hours"));
        assert!(clauses[0].clause_text.contains("on-site time not provided"));
        assert_eq!(
            clauses[0].original_snippet.as_deref(),
            Some("respond within four hours")
        );
        assert_eq!(clauses[0].structured_attributes["coverage"], "24x7");
    }

    #[test]
    fn normalizes_remote_response() {
        let raw: RawRecommendation = serde_json::from_value(serde_json::json!({
            "summary": "  best fit  ",
            "overallPlanId": " ",
            "matches": [{
                "clauseId": "onsite-0",
                "clauseType": "onsite_sla",
                "recommendedPlanId": " p1 ",
                "rationale": "a".repeat(40),
                "alternativePlanIds": ["", " p2 "],
                "alternativePlanNames": null
            }]
        }))
        .unwrap();
        let rec = ServicePlanRecommendation::from(raw);
        assert_eq!(rec.summary, "best fit");
        assert_eq!(rec.overall_plan_id, None);
        assert_eq!(rec.matches[0].recommended_plan_id.as_deref(), Some("p1"));
        assert_eq!(rec.matches[0].rationale.chars().count(), 31);
        assert!(rec.matches[0].rationale.ends_with('…'));
        assert_eq!(rec.matches[0].alternative_plan_ids, vec!["p2".to_string()]);
    }

    #[test]
    fn fmt_number_drops_trailing_zero() {
        assert_eq!(fmt_number(4.0), "4");
        assert_eq!(fmt_number(2.5), "2.5");
    }
}
