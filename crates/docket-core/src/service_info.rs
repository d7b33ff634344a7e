use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditLog, AuditSource, AuditStatus, NewAuditEntry};
use crate::extraction::{Endpoint, FanOut};
use crate::recommendation::{Recommender, ServicePlanRecommendation};
use crate::storage::Storage;
use crate::{Error, Result};

/// One independent service-info extraction call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aspect {
    OnsiteSla,
    YearlyMaintenance,
    RemoteMaintenance,
    TrainingSupport,
    ContractCompliance,
    AfterSalesSupport,
    KeySpareParts,
}

impl Aspect {
    pub const ALL: [Self; 7] = [
        Self::OnsiteSla,
        Self::YearlyMaintenance,
        Self::RemoteMaintenance,
        Self::TrainingSupport,
        Self::ContractCompliance,
        Self::AfterSalesSupport,
        Self::KeySpareParts,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OnsiteSla => "onsite_sla",
            Self::YearlyMaintenance => "yearly_maintenance",
            Self::RemoteMaintenance => "remote_maintenance",
            Self::TrainingSupport => "training_support",
            Self::ContractCompliance => "contract_compliance",
            Self::AfterSalesSupport => "after_sales_support",
            Self::KeySpareParts => "key_spare_parts",
        }
    }

    #[must_use]
    pub fn path(&self) -> String {
        format!("/api/v1/{}_extraction", self.as_str())
    }
}

impl std::fmt::Display for Aspect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Remote responses use snake_case and loose types; stored snapshots use
// camelCase. Every field accepts both names and falls back to "absent".

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    #[serde(alias = "device_name", deserialize_with = "lenient::string")]
    pub device_name: Option<String>,
    #[serde(alias = "registration_number", deserialize_with = "lenient::string")]
    pub registration_number: Option<String>,
    #[serde(alias = "device_model", deserialize_with = "lenient::string")]
    pub device_model: Option<String>,
    #[serde(alias = "host_system_number", deserialize_with = "lenient::string")]
    pub host_system_number: Option<String>,
    #[serde(alias = "installation_date", deserialize_with = "lenient::string")]
    pub installation_date: Option<String>,
    #[serde(alias = "service_start_date", deserialize_with = "lenient::string")]
    pub service_start_date: Option<String>,
    #[serde(alias = "service_end_date", deserialize_with = "lenient::string")]
    pub service_end_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OnsiteSlaItem {
    #[serde(alias = "service_type", deserialize_with = "lenient::string")]
    pub service_type: Option<String>,
    #[serde(alias = "response_time_hours", deserialize_with = "lenient::number")]
    pub response_time_hours: Option<f64>,
    #[serde(alias = "on_site_time_hours", deserialize_with = "lenient::number")]
    pub on_site_time_hours: Option<f64>,
    #[serde(deserialize_with = "lenient::string")]
    pub coverage: Option<String>,
    #[serde(alias = "original_contract_snippet", deserialize_with = "lenient::string")]
    pub original_contract_snippet: Option<String>,
    #[serde(deserialize_with = "lenient::objects")]
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct YearlyMaintenanceItem {
    #[serde(alias = "service_type", deserialize_with = "lenient::string")]
    pub service_type: Option<String>,
    #[serde(alias = "standard_pm_per_year", deserialize_with = "lenient::number")]
    pub standard_pm_per_year: Option<f64>,
    #[serde(alias = "smart_pm_per_year", deserialize_with = "lenient::number")]
    pub smart_pm_per_year: Option<f64>,
    #[serde(alias = "remote_pm_per_year", deserialize_with = "lenient::number")]
    pub remote_pm_per_year: Option<f64>,
    #[serde(deserialize_with = "lenient::string_list")]
    pub scope: Vec<String>,
    #[serde(deserialize_with = "lenient::string")]
    pub deliverables: Option<String>,
    #[serde(deserialize_with = "lenient::string")]
    pub scheduling: Option<String>,
    #[serde(alias = "original_contract_snippet", deserialize_with = "lenient::string")]
    pub original_contract_snippet: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteMaintenanceItem {
    #[serde(alias = "service_type", deserialize_with = "lenient::string")]
    pub service_type: Option<String>,
    #[serde(deserialize_with = "lenient::string")]
    pub platform: Option<String>,
    /// Remote preventive maintenance visits per year, by modality.
    #[serde(alias = "pm_per_year_by_modality", deserialize_with = "lenient::number_map")]
    pub pm_per_year_by_modality: BTreeMap<String, f64>,
    #[serde(alias = "max_users_per_device", deserialize_with = "lenient::number")]
    pub max_users_per_device: Option<f64>,
    #[serde(deserialize_with = "lenient::string_list")]
    pub reports: Vec<String>,
    #[serde(alias = "original_contract_snippet", deserialize_with = "lenient::string")]
    pub original_contract_snippet: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrainingSupportItem {
    #[serde(alias = "service_type", deserialize_with = "lenient::string")]
    pub service_type: Option<String>,
    #[serde(alias = "training_category", deserialize_with = "lenient::string")]
    pub training_category: Option<String>,
    #[serde(alias = "applicable_devices", deserialize_with = "lenient::string_list")]
    pub applicable_devices: Vec<String>,
    #[serde(alias = "training_times", deserialize_with = "lenient::number")]
    pub training_times: Option<f64>,
    #[serde(alias = "training_period", deserialize_with = "lenient::string")]
    pub training_period: Option<String>,
    #[serde(alias = "training_days", deserialize_with = "lenient::number")]
    pub training_days: Option<f64>,
    #[serde(alias = "training_seats", deserialize_with = "lenient::number")]
    pub training_seats: Option<f64>,
    #[serde(alias = "training_cost", deserialize_with = "lenient::string")]
    pub training_cost: Option<String>,
    #[serde(alias = "original_contract_snippet", deserialize_with = "lenient::string")]
    pub original_contract_snippet: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContractCompliance {
    #[serde(
        alias = "information_confidentiality_requirements",
        deserialize_with = "lenient::boolean"
    )]
    pub information_confidentiality_requirements: Option<bool>,
    #[serde(alias = "liability_of_breach", deserialize_with = "lenient::string")]
    pub liability_of_breach: Option<String>,
    #[serde(alias = "parts_return_requirements", deserialize_with = "lenient::string")]
    pub parts_return_requirements: Option<String>,
    #[serde(alias = "delivery_requirements", deserialize_with = "lenient::string")]
    pub delivery_requirements: Option<String>,
    #[serde(alias = "transportation_insurance", deserialize_with = "lenient::string")]
    pub transportation_insurance: Option<String>,
    #[serde(alias = "delivery_location", deserialize_with = "lenient::string")]
    pub delivery_location: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AfterSalesSupport {
    #[serde(alias = "guarantee_running_rate", deserialize_with = "lenient::number")]
    pub guarantee_running_rate: Option<f64>,
    #[serde(alias = "guarantee_mechanism", deserialize_with = "lenient::string")]
    pub guarantee_mechanism: Option<String>,
    #[serde(alias = "service_report_form", deserialize_with = "lenient::string")]
    pub service_report_form: Option<String>,
    #[serde(alias = "remote_service", deserialize_with = "lenient::string")]
    pub remote_service: Option<String>,
    #[serde(alias = "hotline_support", deserialize_with = "lenient::string")]
    pub hotline_support: Option<String>,
    #[serde(alias = "tax_free_parts_priority", deserialize_with = "lenient::boolean")]
    pub tax_free_parts_priority: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeySparePartItem {
    #[serde(alias = "service_type", deserialize_with = "lenient::string")]
    pub service_type: Option<String>,
    #[serde(alias = "covered_items", deserialize_with = "lenient::string_list")]
    pub covered_items: Vec<String>,
    #[serde(alias = "replacement_policy", deserialize_with = "lenient::string")]
    pub replacement_policy: Option<String>,
    #[serde(alias = "old_part_return_required", deserialize_with = "lenient::boolean")]
    pub old_part_return_required: Option<bool>,
    #[serde(alias = "non_return_penalty_pct", deserialize_with = "lenient::number")]
    pub non_return_penalty_pct: Option<f64>,
    #[serde(alias = "logistics_by", deserialize_with = "lenient::string")]
    pub logistics_by: Option<String>,
    #[serde(alias = "lead_time_business_days", deserialize_with = "lenient::number")]
    pub lead_time_business_days: Option<f64>,
    #[serde(alias = "original_contract_snippet", deserialize_with = "lenient::string")]
    pub original_contract_snippet: Option<String>,
}

/// Aggregate of every service-info aspect for one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceInfoSnapshot {
    pub onsite_sla: Vec<OnsiteSlaItem>,
    pub yearly_maintenance: Vec<YearlyMaintenanceItem>,
    pub remote_maintenance: Vec<RemoteMaintenanceItem>,
    pub training_supports: Vec<TrainingSupportItem>,
    pub contract_compliance: Option<ContractCompliance>,
    pub after_sales_support: Option<AfterSalesSupport>,
    pub key_spare_parts: Vec<KeySparePartItem>,
    pub service_plan_recommendation: Option<ServicePlanRecommendation>,
}

impl ServiceInfoSnapshot {
    /// Merge the raw per-aspect responses of one successful fan-out pass.
    #[must_use]
    pub fn from_stage(responses: &BTreeMap<String, Value>) -> Self {
        let get = |aspect: Aspect| responses.get(aspect.as_str()).unwrap_or(&Value::Null);

        Self {
            onsite_sla: parse_items(get(Aspect::OnsiteSla)),
            yearly_maintenance: parse_items(get(Aspect::YearlyMaintenance)),
            remote_maintenance: parse_items(get(Aspect::RemoteMaintenance)),
            training_supports: parse_items(get(Aspect::TrainingSupport)),
            contract_compliance: parse_single(get(Aspect::ContractCompliance)),
            after_sales_support: parse_single(get(Aspect::AfterSalesSupport)),
            key_spare_parts: parse_items(get(Aspect::KeySpareParts)),
            service_plan_recommendation: None,
        }
    }

    /// Parse a stored snapshot, falling back to the empty shape when the
    /// stored JSON is missing or malformed.
    #[must_use]
    pub fn from_stored(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::default();
        };
        serde_json::from_str(raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Malformed stored service-info snapshot");
            Self::default()
        })
    }

    /// Service types of every plan-bearing item.
    pub fn service_types(&self) -> impl Iterator<Item = Option<&str>> {
        self.onsite_sla
            .iter()
            .map(|i| i.service_type.as_deref())
            .chain(self.yearly_maintenance.iter().map(|i| i.service_type.as_deref()))
            .chain(self.remote_maintenance.iter().map(|i| i.service_type.as_deref()))
            .chain(self.training_supports.iter().map(|i| i.service_type.as_deref()))
            .chain(self.key_spare_parts.iter().map(|i| i.service_type.as_deref()))
    }

    #[must_use]
    pub fn has_structured_content(&self) -> bool {
        !self.onsite_sla.is_empty()
            || !self.yearly_maintenance.is_empty()
            || !self.remote_maintenance.is_empty()
            || !self.training_supports.is_empty()
            || !self.key_spare_parts.is_empty()
            || self.contract_compliance.is_some()
            || self.after_sales_support.is_some()
    }

    /// Item counts per aspect, used in audit metadata.
    #[must_use]
    pub fn counts(&self) -> Value {
        serde_json::json!({
            "onsiteSla": self.onsite_sla.len(),
            "yearlyMaintenance": self.yearly_maintenance.len(),
            "remoteMaintenance": self.remote_maintenance.len(),
            "trainingSupports": self.training_supports.len(),
            "contractCompliance": self.contract_compliance.is_some(),
            "afterSalesSupport": self.after_sales_support.is_some(),
            "keySpareParts": self.key_spare_parts.len(),
        })
    }
}

/// Runs the service-info stage: fan out over every aspect, merge, optionally
/// derive a plan recommendation, then persist the snapshot once.
#[derive(Clone)]
pub struct ServiceInfoStage {
    storage: Storage,
    audit: AuditLog,
    fanout: FanOut,
    base_url: Url,
    timeout: Duration,
    recommender: Option<Recommender>,
}

impl ServiceInfoStage {
    #[must_use]
    pub const fn new(
        storage: Storage,
        audit: AuditLog,
        fanout: FanOut,
        base_url: Url,
        timeout: Duration,
        recommender: Option<Recommender>,
    ) -> Self {
        Self {
            storage,
            audit,
            fanout,
            base_url,
            timeout,
            recommender,
        }
    }

    pub fn endpoints(&self, content: &str) -> Result<Vec<Endpoint>> {
        Aspect::ALL
            .iter()
            .map(|aspect| {
                Endpoint::new(
                    aspect.as_str(),
                    &self.base_url,
                    &aspect.path(),
                    serde_json::json!({ "content": content }),
                )
            })
            .collect()
    }

    pub async fn run(&self, document_id: Uuid, content: &str) -> Result<ServiceInfoSnapshot> {
        let started = Instant::now();
        let entry = NewAuditEntry::new(AuditAction::ServiceInfoExtraction, AuditSource::Remote)
            .document(document_id);

        if content.trim().is_empty() {
            self.audit
                .record(
                    entry
                        .status(AuditStatus::Skipped)
                        .description("No extractable content")
                        .duration(started.elapsed()),
                )
                .await;
            return Err(Error::MissingContent);
        }

        match self.extract(document_id, content).await {
            Ok(snapshot) => {
                self.audit
                    .record(
                        entry
                            .description("Service info extracted")
                            .duration(started.elapsed())
                            .metadata(serde_json::json!({
                                "counts": snapshot.counts(),
                                "recommended": snapshot.service_plan_recommendation.is_some(),
                            })),
                    )
                    .await;
                Ok(snapshot)
            }
            Err(e) => {
                self.audit
                    .record(
                        entry
                            .description("Service info extraction failed")
                            .duration(started.elapsed())
                            .failed(&e),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn extract(&self, document_id: Uuid, content: &str) -> Result<ServiceInfoSnapshot> {
        let endpoints = self.endpoints(content)?;
        let responses = self
            .fanout
            .run::<Value>(&endpoints, self.timeout)
            .await?;

        let mut snapshot = ServiceInfoSnapshot::from_stage(&responses);

        if let Some(recommender) = &self.recommender {
            snapshot.service_plan_recommendation =
                recommender.recommend(document_id, &snapshot).await;
        }

        self.storage
            .upsert_service_info(document_id, &snapshot)
            .await?;

        Ok(snapshot)
    }
}

/// Array responses, or an object wrapping them under `items`.
fn items(value: &Value) -> impl Iterator<Item = &Value> {
    let list = match value {
        Value::Array(list) => Some(list),
        Value::Object(map) => map.get("items").and_then(Value::as_array),
        _ => None,
    };
    list.into_iter().flatten().filter(|v| v.is_object())
}

fn single(value: &Value) -> Option<&Value> {
    match value {
        Value::Object(map) if !map.is_empty() => Some(value),
        _ => None,
    }
}

fn parse_items<T: DeserializeOwned>(value: &Value) -> Vec<T> {
    items(value).filter_map(|v| T::deserialize(v).ok()).collect()
}

fn parse_single<T: DeserializeOwned>(value: &Value) -> Option<T> {
    single(value).and_then(|v| T::deserialize(v).ok())
}

pub(crate) fn nullable_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

pub(crate) fn nullable_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => s
            .replace(',', "")
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite()),
        _ => None,
    }
}

pub(crate) fn nullable_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Some(true),
            "false" | "no" | "n" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        _ => None,
    }
}

/// `deserialize_with` adapters over the readers above. None of them fail.
mod lenient {
    use std::collections::BTreeMap;

    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(super::nullable_string(&Value::deserialize(d)?))
    }

    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(super::nullable_number(&Value::deserialize(d)?))
    }

    pub fn boolean<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        Ok(super::nullable_bool(&Value::deserialize(d)?))
    }

    pub fn string_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(value
            .as_array()
            .map(|list| list.iter().filter_map(super::nullable_string).collect())
            .unwrap_or_default())
    }

    pub fn number_map<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<BTreeMap<String, f64>, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(value
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| super::nullable_number(v).map(|n| (k.clone(), n)))
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn objects<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        Ok(super::parse_items(&Value::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn aspect_paths() {
        assert_eq!(Aspect::ALL.len(), 7);
        assert_eq!(Aspect::OnsiteSla.path(), "/api/v1/onsite_sla_extraction");
        assert_eq!(
            Aspect::KeySpareParts.path(),
            "/api/v1/key_spare_parts_extraction"
        );
    }

    #[test]
    fn lenient_scalars() {
        assert_eq!(nullable_string(&json!("  x ")), Some("x".into()));
        assert_eq!(nullable_string(&json!("   ")), None);
        assert_eq!(nullable_string(&json!(3)), None);
        assert_eq!(nullable_number(&json!("1,200")), Some(1200.0));
        assert_eq!(nullable_number(&json!("n/a")), None);
        assert_eq!(nullable_number(&json!(4)), Some(4.0));
        assert_eq!(nullable_bool(&json!("Yes")), Some(true));
        assert_eq!(nullable_bool(&json!(0)), Some(false));
        assert_eq!(nullable_bool(&json!("maybe")), None);
    }

    #[test]
    fn merges_stage_responses() {
        let mut responses = BTreeMap::new();
        responses.insert(
            "onsite_sla".to_string(),
            json!({ "items": [{
                "service_type": " ",
                "response_time_hours": "4",
                "coverage": "24x7",
                "devices": [{ "device_name": "CT-1" }]
            }]}),
        );
        responses.insert(
            "remote_maintenance".to_string(),
            json!([{ "platform": "InSite", "pm_per_year_by_modality": { "CT": 2, "MR": "x" } }]),
        );
        responses.insert(
            "contract_compliance".to_string(),
            json!({ "information_confidentiality_requirements": "yes" }),
        );
        responses.insert("after_sales_support".to_string(), json!({}));
        responses.insert("key_spare_parts".to_string(), json!("garbage"));

        let snapshot = ServiceInfoSnapshot::from_stage(&responses);
        assert_eq!(snapshot.onsite_sla.len(), 1);
        assert_eq!(snapshot.onsite_sla[0].service_type, None);
        assert_eq!(snapshot.onsite_sla[0].response_time_hours, Some(4.0));
        assert_eq!(
            snapshot.onsite_sla[0].devices[0].device_name.as_deref(),
            Some("CT-1")
        );
        assert_eq!(
            snapshot.remote_maintenance[0].pm_per_year_by_modality.len(),
            1
        );
        assert_eq!(
            snapshot
                .contract_compliance
                .as_ref()
                .and_then(|c| c.information_confidentiality_requirements),
            Some(true)
        );
        assert!(snapshot.after_sales_support.is_none());
        assert!(snapshot.key_spare_parts.is_empty());
        assert!(snapshot.has_structured_content());
    }

    #[test]
    fn items_accept_either_key_style() {
        let remote: KeySparePartItem = serde_json::from_value(json!({
            "service_type": "Gold",
            "lead_time_business_days": "3",
            "old_part_return_required": "no",
            "covered_items": ["tube", " ", 7]
        }))
        .unwrap();
        let stored: KeySparePartItem = serde_json::from_value(json!({
            "serviceType": "Gold",
            "leadTimeBusinessDays": 3.0,
            "oldPartReturnRequired": false,
            "coveredItems": ["tube"]
        }))
        .unwrap();
        assert_eq!(remote, stored);
        assert_eq!(remote.covered_items, vec!["tube"]);
    }

    #[test]
    fn malformed_stored_snapshot_is_empty() {
        assert_eq!(
            ServiceInfoSnapshot::from_stored(Some("{not json")),
            ServiceInfoSnapshot::default()
        );
        assert!(!ServiceInfoSnapshot::from_stored(None).has_structured_content());
    }
}
