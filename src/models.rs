use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ListingSource {
    Rightmove,
    Zoopla,
    Espc,
    S1homes,
    Onthemarket,
    Agent,
    Other,
}

impl ListingSource {
    pub const ALL: [ListingSource; 7] = [
        ListingSource::Rightmove,
        ListingSource::Zoopla,
        ListingSource::Espc,
        ListingSource::S1homes,
        ListingSource::Onthemarket,
        ListingSource::Agent,
        ListingSource::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ListingSource::Rightmove => "rightmove",
            ListingSource::Zoopla => "zoopla",
            ListingSource::Espc => "espc",
            ListingSource::S1homes => "s1homes",
            ListingSource::Onthemarket => "onthemarket",
            ListingSource::Agent => "agent",
            ListingSource::Other => "other",
        }
    }

    pub fn from_label(input: &str) -> Option<Self> {
        let wanted = input.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|source| source.as_str() == wanted)
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    pub id: Uuid,
    pub listing_url: String,
    pub source: ListingSource,
    pub address: String,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    pub price_raw: String,
    #[serde(default)]
    pub price_numeric: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub agent_url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub extra_image_urls: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub created_by_user_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub first_seen_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_checked_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Listing {
    pub fn as_ref_summary(&self) -> ListingRef {
        ListingRef {
            id: self.id,
            listing_url: self.listing_url.clone(),
            address: self.address.clone(),
            is_active: self.is_active,
        }
    }
}

/// Identity of an already stored listing, surfaced on duplicate conflicts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListingRef {
    pub id: Uuid,
    pub listing_url: String,
    pub address: String,
    pub is_active: bool,
}

/// Candidate listing payload as submitted by a caller. Every field is optional
/// on the wire so that the ingestion guard, not the deserializer, decides
/// what is missing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingDraft {
    #[serde(default)]
    pub listing_url: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub price_raw: Option<String>,
    #[serde(default)]
    pub price_numeric: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub agent_url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub extra_image_urls: Option<Vec<String>>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// Validated, normalized listing ready for insertion.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NewListing {
    pub listing_url: String,
    pub source: ListingSource,
    pub address: String,
    pub postcode: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub price_raw: String,
    pub price_numeric: Option<f64>,
    pub description: Option<String>,
    pub agent_name: Option<String>,
    pub agent_url: Option<String>,
    pub image_url: Option<String>,
    pub extra_image_urls: Option<Vec<String>>,
    pub is_active: bool,
    pub created_by_user_id: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ListingPatch {
    #[serde(default)]
    pub listing_url: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub price_raw: Option<String>,
    #[serde(default)]
    pub price_numeric: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub agent_url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub extra_image_urls: Option<Vec<String>>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default, skip_deserializing)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationStatus {
    Explicit,
    Likely,
    Competitive,
}

impl ClassificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationStatus::Explicit => "explicit",
            ClassificationStatus::Likely => "likely",
            ClassificationStatus::Competitive => "competitive",
        }
    }

    /// Maps a label produced by the completion backend onto the taxonomy.
    ///
    /// Anything outside the three known labels becomes `Competitive`, so an
    /// out-of-taxonomy answer is always read as "not a confirmed fixed-price
    /// deal".
    pub fn from_model_label(label: &str) -> Self {
        match label {
            "explicit" => ClassificationStatus::Explicit,
            "likely" => ClassificationStatus::Likely,
            _ => ClassificationStatus::Competitive,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub status: ClassificationStatus,
    pub confidence_score: u8,
    #[serde(default)]
    pub classification_reason: Option<String>,
    #[serde(default)]
    pub ai_model_used: Option<String>,
    #[serde(default = "Utc::now")]
    pub classified_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NewClassification {
    pub listing_id: Uuid,
    pub status: ClassificationStatus,
    pub confidence_score: u8,
    pub classification_reason: String,
    pub ai_model_used: String,
    pub classified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Friendliness {
    High,
    Medium,
    Low,
}

impl Friendliness {
    pub fn from_label(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "high" => Some(Friendliness::High),
            "medium" => Some(Friendliness::Medium),
            "low" => Some(Friendliness::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostcodeStats {
    pub postcode: String,
    pub avg_sale_over_asking: f64,
    #[serde(default)]
    pub total_sales: u64,
    pub fixed_price_friendliness: Friendliness,
}

/// Admin payload for postcode statistics; validated before it becomes a
/// [`PostcodeStats`] row.
#[derive(Debug, Clone, Deserialize)]
pub struct PostcodeStatsInput {
    pub postcode: String,
    pub avg_sale_over_asking: f64,
    #[serde(default)]
    pub total_sales: i64,
    pub fixed_price_friendliness: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbabilityBand {
    Zero,
    High,
    Medium,
    Low,
    Unknown,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuccessProbability {
    pub probability: ProbabilityBand,
    pub reason: Option<String>,
    pub avg_over_asking: Option<f64>,
    pub friendliness: Option<Friendliness>,
}

impl SuccessProbability {
    pub fn unknown(reason: impl Into<String>) -> Self {
        Self {
            probability: ProbabilityBand::Unknown,
            reason: Some(reason.into()),
            avg_over_asking: None,
            friendliness: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListingView {
    #[serde(flatten)]
    pub listing: Listing,
    pub classification: Option<Classification>,
    pub success_probability: SuccessProbability,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    Explicit,
    ExplicitAndLikely,
    All,
}

impl ConfidenceLevel {
    pub fn admits(&self, status: ClassificationStatus) -> bool {
        match self {
            ConfidenceLevel::Explicit => status == ClassificationStatus::Explicit,
            ConfidenceLevel::ExplicitAndLikely => matches!(
                status,
                ClassificationStatus::Explicit | ClassificationStatus::Likely
            ),
            ConfidenceLevel::All => true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingFilters {
    #[serde(default)]
    pub skip: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub user_budget: Option<f64>,
    #[serde(default)]
    pub confidence_level: Option<ConfidenceLevel>,
}

/// The (status, confidence, reason) triple every classification produces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Verdict {
    pub status: ClassificationStatus,
    pub confidence_score: u8,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub message: String,
    pub listing: Listing,
    pub classification: Verdict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyOutcome {
    pub message: String,
    pub listing_id: Uuid,
    pub classification: Verdict,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Removal {
    /// Marked inactive because a classification still references it.
    Deactivated,
    Deleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemovalOutcome {
    pub message: String,
    pub listing_id: Uuid,
    pub removal: Removal,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostcodeStatsSaved {
    pub message: String,
    pub stats: PostcodeStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostcodeStatsList {
    pub total: usize,
    pub stats: Vec<PostcodeStats>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub listing_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub only_unclassified: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BatchItemStatus {
    Success,
    Failed,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub listing_id: Uuid,
    pub status: BatchItemStatus,
    pub classification: Option<Verdict>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub message: String,
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<BatchItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusBreakdown {
    pub explicit: usize,
    pub likely: usize,
    pub competitive: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfidenceDistribution {
    pub high_confidence: usize,
    pub medium_confidence: usize,
    pub low_confidence: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationStats {
    pub total_listings: usize,
    pub total_classified: usize,
    pub unclassified: usize,
    pub classification_rate: f64,
    pub breakdown: StatusBreakdown,
    pub average_confidence_score: f64,
    pub confidence_distribution: ConfidenceDistribution,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionStats {
    pub total_listings: usize,
    pub active_listings: usize,
    pub inactive_listings: usize,
    pub total_classified: usize,
    pub unclassified: usize,
    pub classification_rate: f64,
    pub listings_by_source: BTreeMap<ListingSource, usize>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_listing: Option<ListingRef>,
}
