//! Process aggregate: upstream links, discovered documents, and the merge
//! rules applied after each extraction visit.
//!
//! `links` and `documents` are stored as JSON columns; they deserialize into
//! the typed maps here and are only manipulated through this module.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Category value that allows document extraction under partial access.
pub const RESTRICTED_CATEGORY: &str = "restricted";

/// Timestamp format used inside the legacy JSON columns.
const LEGACY_TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Render a timestamp in the legacy `links`/`documents` column format.
pub fn legacy_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(LEGACY_TS_FORMAT).to_string()
}

fn process_number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{5}\.\d{6}/\d{4}-\d{2}$").unwrap())
}

fn document_number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{8}$").unwrap())
}

/// Validate the `NNNNN.NNNNNN/YYYY-DD` process number format.
pub fn is_valid_process_number(number: &str) -> bool {
    process_number_regex().is_match(number)
}

/// Validate the 8-digit document number format.
pub fn is_valid_document_number(number: &str) -> bool {
    document_number_regex().is_match(number)
}

/// Access level the upstream grants through a given link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Integral,
    Partial,
    Error,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Integral => "integral",
            Self::Partial => "partial",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "integral" => Some(Self::Integral),
            "partial" => Some(Self::Partial),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Categorization workflow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryStatus {
    Pending,
    Categorized,
}

impl CategoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Categorized => "categorized",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "categorized" => Some(Self::Categorized),
            _ => None,
        }
    }
}

/// Download state of a single document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    NotDownloaded,
    Downloaded,
    Error,
    /// Download succeeded but the object-store upload did not; a later run
    /// finishes the job.
    Partial,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotDownloaded => "not_downloaded",
            Self::Downloaded => "downloaded",
            Self::Error => "error",
            Self::Partial => "partial",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "not_downloaded" => Some(Self::NotDownloaded),
            "downloaded" => Some(Self::Downloaded),
            "error" => Some(Self::Error),
            "partial" => Some(Self::Partial),
            _ => None,
        }
    }

    /// Whether this document still needs a download attempt.
    pub fn needs_download(&self) -> bool {
        matches!(self, Self::NotDownloaded | Self::Error | Self::Partial)
    }
}

/// Link liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Active,
    Inactive,
}

/// One historical check of a link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkCheck {
    pub checked_at: String,
    pub status: LinkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_type: Option<AccessType>,
}

/// Stored state of one upstream access link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRecord {
    pub status: LinkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_type: Option<AccessType>,
    pub last_checked: String,
    #[serde(default)]
    pub history: Vec<LinkCheck>,
}

/// Stored state of one document attached to the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    #[serde(rename = "type")]
    pub doc_type: String,
    pub date: String,
    pub status: DocumentStatus,
    pub last_checked: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
}

/// A document row as observed on the upstream process page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedDocument {
    pub number: String,
    pub doc_type: String,
    pub date: String,
    pub signer: Option<String>,
}

/// Result of checking one link during a visit.
#[derive(Debug, Clone)]
pub struct LinkResult {
    pub link_id: String,
    pub status: LinkStatus,
    pub access: Option<AccessType>,
}

/// Everything a per-process worker learned in its single navigation.
#[derive(Debug, Clone, Default)]
pub struct VisitOutcome {
    /// Every link the worker attempted, in order.
    pub link_results: Vec<LinkResult>,
    pub authority: Option<String>,
    pub unit: Option<String>,
    /// `None` when document extraction was skipped for this visit.
    pub documents: Option<Vec<ObservedDocument>>,
    pub checked_at: Option<DateTime<Utc>>,
}

/// A legal process mirrored from one tenant's upstream account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub id: String,
    pub tenant_id: String,
    pub process_number: String,
    pub links: BTreeMap<String, LinkRecord>,
    pub documents: BTreeMap<String, DocumentRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_type: Option<AccessType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_current_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_status: Option<CategoryStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    pub no_valid_links: bool,
    pub last_updated: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Process {
    /// Create an empty process for a tenant, as first seen during discovery.
    pub fn new(tenant_id: &str, process_number: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            process_number: process_number.to_string(),
            links: BTreeMap::new(),
            documents: BTreeMap::new(),
            access_type: None,
            best_current_link: None,
            category: None,
            category_status: None,
            authority: None,
            unit: None,
            nickname: None,
            no_valid_links: false,
            last_updated: legacy_timestamp(now),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a visit with the given access level may list documents,
    /// judged against the process state *before* the visit is merged.
    pub fn allows_document_extraction(&self, access: AccessType) -> bool {
        match access {
            AccessType::Integral => true,
            AccessType::Partial => {
                if self.category_status != Some(CategoryStatus::Categorized) {
                    return false;
                }
                self.category.as_deref() == Some(RESTRICTED_CATEGORY)
            }
            AccessType::Error => false,
        }
    }

    /// Merge a worker's visit into the stored state.
    ///
    /// Manual edits (`category`, `nickname`) and prior `downloaded` statuses
    /// are preserved. Returns the new-document delta: numbers not previously
    /// stored, plus numbers stored with an `error` status that reappeared.
    pub fn apply_visit(&mut self, visit: &VisitOutcome) -> Vec<String> {
        let checked_at = visit.checked_at.unwrap_or_else(Utc::now);
        let ts = legacy_timestamp(checked_at);

        for result in &visit.link_results {
            let record = self
                .links
                .entry(result.link_id.clone())
                .or_insert_with(|| LinkRecord {
                    status: result.status,
                    access_type: result.access,
                    last_checked: ts.clone(),
                    history: Vec::new(),
                });
            record.status = result.status;
            if result.access.is_some() {
                record.access_type = result.access;
            }
            record.last_checked = ts.clone();
            record.history.push(LinkCheck {
                checked_at: ts.clone(),
                status: result.status,
                access_type: result.access,
            });
        }

        self.recompute_access();
        self.apply_category_policy();

        if self.authority.is_none() {
            self.authority = visit.authority.clone();
        }
        if self.unit.is_none() {
            self.unit = visit.unit.clone();
        }

        let mut new_documents = Vec::new();
        if let Some(observed) = &visit.documents {
            for doc in observed {
                match self.documents.get_mut(&doc.number) {
                    Some(record) => {
                        if record.status == DocumentStatus::Error {
                            new_documents.push(doc.number.clone());
                        }
                        record.doc_type = doc.doc_type.clone();
                        record.date = doc.date.clone();
                        record.last_checked = ts.clone();
                        if doc.signer.is_some() {
                            record.signer = doc.signer.clone();
                        }
                    }
                    None => {
                        new_documents.push(doc.number.clone());
                        self.documents.insert(
                            doc.number.clone(),
                            DocumentRecord {
                                doc_type: doc.doc_type.clone(),
                                date: doc.date.clone(),
                                status: DocumentStatus::NotDownloaded,
                                last_checked: ts.clone(),
                                signer: doc.signer.clone(),
                            },
                        );
                    }
                }
            }
        }

        self.last_updated = ts;
        self.updated_at = checked_at;
        new_documents
    }

    /// Derive the process-level access type and `no_valid_links` flag from
    /// the link map. Integral wins over partial regardless of which worker
    /// finished last.
    fn recompute_access(&mut self) {
        let active: Vec<&LinkRecord> = self
            .links
            .values()
            .filter(|l| l.status == LinkStatus::Active)
            .collect();

        self.no_valid_links = !self.links.is_empty() && active.is_empty();

        self.access_type = if active
            .iter()
            .any(|l| l.access_type == Some(AccessType::Integral))
        {
            Some(AccessType::Integral)
        } else if active
            .iter()
            .any(|l| l.access_type == Some(AccessType::Partial))
        {
            Some(AccessType::Partial)
        } else if !self.links.is_empty() {
            Some(AccessType::Error)
        } else {
            None
        };

        self.best_current_link = self.pick_best_link();
    }

    /// Best link: active, integral preferred, most recent check first, ties
    /// broken by lexicographic link id.
    fn pick_best_link(&self) -> Option<String> {
        self.links
            .iter()
            .filter(|(_, l)| l.status == LinkStatus::Active)
            .max_by(|(id_a, a), (id_b, b)| {
                let integral_a = a.access_type == Some(AccessType::Integral);
                let integral_b = b.access_type == Some(AccessType::Integral);
                integral_a
                    .cmp(&integral_b)
                    .then(a.last_checked.cmp(&b.last_checked))
                    // Inverted so the lexicographically smallest id wins ties.
                    .then(id_b.cmp(id_a))
            })
            .map(|(id, _)| id.clone())
    }

    /// Categorization policy after access is known (§4.1 step 2).
    fn apply_category_policy(&mut self) {
        match self.access_type {
            Some(AccessType::Integral) => {
                self.category = Some(RESTRICTED_CATEGORY.to_string());
                self.category_status = Some(CategoryStatus::Categorized);
            }
            Some(AccessType::Partial) => {
                if self.category_status != Some(CategoryStatus::Categorized) {
                    self.category_status = Some(CategoryStatus::Pending);
                }
            }
            _ => {}
        }
    }

    /// Document numbers the downloader should fetch by default.
    pub fn pending_download_numbers(&self) -> Vec<String> {
        self.documents
            .iter()
            .filter(|(_, d)| d.status.needs_download())
            .map(|(n, _)| n.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visit(link_id: &str, access: AccessType, docs: Option<Vec<ObservedDocument>>) -> VisitOutcome {
        VisitOutcome {
            link_results: vec![LinkResult {
                link_id: link_id.to_string(),
                status: LinkStatus::Active,
                access: Some(access),
            }],
            authority: Some("Dr. Silva".to_string()),
            unit: None,
            documents: docs,
            checked_at: Some(Utc::now()),
        }
    }

    fn doc(number: &str, doc_type: &str) -> ObservedDocument {
        ObservedDocument {
            number: number.to_string(),
            doc_type: doc_type.to_string(),
            date: "01/07/2024".to_string(),
            signer: None,
        }
    }

    #[test]
    fn process_number_format() {
        assert!(is_valid_process_number("12345.001234/2024-56"));
        assert!(!is_valid_process_number("12345.1234/2024-56"));
        assert!(!is_valid_process_number("1234.001234/2024-56"));
        assert!(!is_valid_process_number("12345.001234/2024-5"));
        assert!(!is_valid_process_number(""));
    }

    #[test]
    fn document_number_format() {
        assert!(is_valid_document_number("10000001"));
        assert!(!is_valid_document_number("1000001"));
        assert!(!is_valid_document_number("100000011"));
        assert!(!is_valid_document_number("1000000a"));
    }

    #[test]
    fn integral_visit_categorizes_as_restricted() {
        let mut process = Process::new("t1", "12345.001234/2024-56");
        let delta = process.apply_visit(&visit(
            "ABC",
            AccessType::Integral,
            Some(vec![doc("10000001", "Order"), doc("10000002", "Petition")]),
        ));

        assert_eq!(delta, vec!["10000001", "10000002"]);
        assert_eq!(process.access_type, Some(AccessType::Integral));
        assert_eq!(process.category.as_deref(), Some(RESTRICTED_CATEGORY));
        assert_eq!(process.category_status, Some(CategoryStatus::Categorized));
        assert_eq!(process.authority.as_deref(), Some("Dr. Silva"));
        assert_eq!(process.best_current_link.as_deref(), Some("ABC"));
        assert!(!process.no_valid_links);
        assert_eq!(
            process.documents["10000001"].status,
            DocumentStatus::NotDownloaded
        );
    }

    #[test]
    fn partial_visit_on_new_process_goes_pending() {
        let mut process = Process::new("t1", "12345.001234/2024-56");
        process.apply_visit(&visit("ABC", AccessType::Partial, None));

        assert_eq!(process.access_type, Some(AccessType::Partial));
        assert_eq!(process.category_status, Some(CategoryStatus::Pending));
        assert_eq!(process.category, None);
    }

    #[test]
    fn integral_wins_over_partial_regardless_of_order() {
        let mut process = Process::new("t1", "12345.001234/2024-56");
        process.apply_visit(&visit("DEF", AccessType::Integral, None));
        process.apply_visit(&visit("ABC", AccessType::Partial, None));

        assert_eq!(process.access_type, Some(AccessType::Integral));
        assert_eq!(process.best_current_link.as_deref(), Some("DEF"));
        assert_eq!(process.links["ABC"].history.len(), 1);
        assert_eq!(process.links["DEF"].history.len(), 1);
    }

    #[test]
    fn all_links_dead_sets_no_valid_links() {
        let mut process = Process::new("t1", "12345.001234/2024-56");
        process.apply_visit(&visit("ABC", AccessType::Integral, None));

        let dead = VisitOutcome {
            link_results: vec![
                LinkResult {
                    link_id: "ABC".to_string(),
                    status: LinkStatus::Inactive,
                    access: None,
                },
                LinkResult {
                    link_id: "DEF".to_string(),
                    status: LinkStatus::Inactive,
                    access: None,
                },
            ],
            ..Default::default()
        };
        process.apply_visit(&dead);

        assert!(process.no_valid_links);
        assert_eq!(process.best_current_link, None);
        assert!(process
            .links
            .values()
            .all(|l| l.status == LinkStatus::Inactive));
    }

    #[test]
    fn downloaded_status_survives_remerge() {
        let mut process = Process::new("t1", "12345.001234/2024-56");
        process.apply_visit(&visit(
            "ABC",
            AccessType::Integral,
            Some(vec![doc("10000001", "Order")]),
        ));
        process.documents.get_mut("10000001").unwrap().status = DocumentStatus::Downloaded;

        let delta = process.apply_visit(&visit(
            "ABC",
            AccessType::Integral,
            Some(vec![doc("10000001", "Order")]),
        ));

        assert!(delta.is_empty());
        assert_eq!(
            process.documents["10000001"].status,
            DocumentStatus::Downloaded
        );
    }

    #[test]
    fn errored_document_counts_as_new_again() {
        let mut process = Process::new("t1", "12345.001234/2024-56");
        process.apply_visit(&visit(
            "ABC",
            AccessType::Integral,
            Some(vec![doc("10000001", "Order")]),
        ));
        process.documents.get_mut("10000001").unwrap().status = DocumentStatus::Error;

        let delta = process.apply_visit(&visit(
            "ABC",
            AccessType::Integral,
            Some(vec![doc("10000001", "Order")]),
        ));
        assert_eq!(delta, vec!["10000001"]);
    }

    #[test]
    fn manual_category_edit_is_preserved() {
        let mut process = Process::new("t1", "12345.001234/2024-56");
        process.apply_visit(&visit("ABC", AccessType::Partial, None));

        // Operator categorizes the process manually.
        process.category = Some(RESTRICTED_CATEGORY.to_string());
        process.category_status = Some(CategoryStatus::Categorized);
        process.nickname = Some("land dispute".to_string());

        process.apply_visit(&visit("ABC", AccessType::Partial, None));
        assert_eq!(process.category.as_deref(), Some(RESTRICTED_CATEGORY));
        assert_eq!(process.category_status, Some(CategoryStatus::Categorized));
        assert_eq!(process.nickname.as_deref(), Some("land dispute"));
    }

    #[test]
    fn extraction_policy_follows_category() {
        let mut process = Process::new("t1", "12345.001234/2024-56");
        assert!(process.allows_document_extraction(AccessType::Integral));
        assert!(!process.allows_document_extraction(AccessType::Partial));
        assert!(!process.allows_document_extraction(AccessType::Error));

        process.category = Some(RESTRICTED_CATEGORY.to_string());
        process.category_status = Some(CategoryStatus::Categorized);
        assert!(process.allows_document_extraction(AccessType::Partial));

        // Category edited away from restricted: partial access is no longer
        // sufficient.
        process.category = Some("public".to_string());
        assert!(!process.allows_document_extraction(AccessType::Partial));
    }

    #[test]
    fn best_link_tie_breaks_lexicographically() {
        let mut process = Process::new("t1", "12345.001234/2024-56");
        let ts = Utc::now();
        let both = VisitOutcome {
            link_results: vec![
                LinkResult {
                    link_id: "ZZZ".to_string(),
                    status: LinkStatus::Active,
                    access: Some(AccessType::Partial),
                },
                LinkResult {
                    link_id: "AAA".to_string(),
                    status: LinkStatus::Active,
                    access: Some(AccessType::Partial),
                },
            ],
            checked_at: Some(ts),
            ..Default::default()
        };
        process.apply_visit(&both);
        assert_eq!(process.best_current_link.as_deref(), Some("AAA"));
    }

    #[test]
    fn link_json_shape_matches_storage_contract() {
        let record = LinkRecord {
            status: LinkStatus::Active,
            access_type: Some(AccessType::Integral),
            last_checked: "2024-07-01 12:00:00".to_string(),
            history: vec![LinkCheck {
                checked_at: "2024-07-01 12:00:00".to_string(),
                status: LinkStatus::Active,
                access_type: Some(AccessType::Integral),
            }],
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "active");
        assert_eq!(json["access_type"], "integral");
        assert_eq!(json["history"][0]["checked_at"], "2024-07-01 12:00:00");
    }

    #[test]
    fn document_json_shape_matches_storage_contract() {
        let record = DocumentRecord {
            doc_type: "Order".to_string(),
            date: "01/07/2024".to_string(),
            status: DocumentStatus::NotDownloaded,
            last_checked: "2024-07-01 12:00:00".to_string(),
            signer: Some("Dr. Silva".to_string()),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "Order");
        assert_eq!(json["status"], "not_downloaded");
        assert_eq!(json["signer"], "Dr. Silva");
    }
}
