use crate::classify::Classifier;
use crate::ingest::{self, IngestRejection};
use crate::models::{
    BatchItem, BatchItemStatus, BatchReport, BatchRequest, Classification, ClassificationStats,
    ClassificationStatus, ClassifyOutcome, ConfidenceDistribution, Friendliness, IngestOutcome,
    IngestionStats, Listing, ListingDraft, ListingFilters, ListingPatch, ListingRef, ListingSource,
    ListingView, NewClassification, PostcodeStats, PostcodeStatsInput, PostcodeStatsList,
    PostcodeStatsSaved, Removal, RemovalOutcome, StatusBreakdown, SuccessProbability, Verdict,
};
use crate::pricing::parse_price;
use crate::probability::{self, normalize_postcode};
use crate::security::{AuthContext, Role};
use crate::store::{ListingQuery, RowStore, StoreError};
use chrono::Utc;
use std::{collections::BTreeMap, future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

const MAX_SKIP: usize = 10_000;
const MAX_PAGE: usize = 100;
const MAX_BATCH: usize = 50;
const DEFAULT_BATCH: usize = 10;
const MAX_AMOUNT: f64 = 10_000_000.0;
const MAX_POSTCODE_FILTER_CHARS: usize = 10;
const MAX_CITY_FILTER_CHARS: usize = 100;
const LISTING_MANAGERS: &[Role] = &[Role::Admin, Role::Agent];

/// Listing service: ingestion, reads enriched with classification and
/// success probability, manual and batch classification, and statistics.
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn RowStore>,
    classifier: Classifier,
}

impl Pipeline {
    pub fn new(store: Arc<dyn RowStore>, classifier: Classifier) -> Self {
        Self { store, classifier }
    }

    pub async fn ingest(
        &self,
        draft: ListingDraft,
        caller: &AuthContext,
    ) -> Result<IngestOutcome, PipelineError> {
        let (listing, classification) = self.admit_and_classify(draft, caller).await?;
        Ok(IngestOutcome {
            message: "Listing ingested successfully".into(),
            listing,
            classification,
        })
    }

    pub async fn create_listing(
        &self,
        draft: ListingDraft,
        caller: &AuthContext,
    ) -> Result<Listing, PipelineError> {
        let (listing, _) = self.admit_and_classify(draft, caller).await?;
        Ok(listing)
    }

    /// Validate, reject duplicates, insert, then classify. A classification
    /// that cannot be persisted is logged; the listing stays created.
    async fn admit_and_classify(
        &self,
        draft: ListingDraft,
        caller: &AuthContext,
    ) -> Result<(Listing, Verdict), PipelineError> {
        require_role(caller, LISTING_MANAGERS, "authorize")?;

        let candidate = ingest::admit(self.store.as_ref(), draft, Some(caller.user_id.clone()))
            .await
            .map_err(|rejection| match rejection {
                IngestRejection::Invalid(err) => PipelineError::invalid_input("validate", err.to_string()),
                IngestRejection::Duplicate(existing) => PipelineError::conflict("duplicate_check", existing),
                IngestRejection::Store(err) => PipelineError::store("duplicate_check", err),
            })?;

        let listing = timed("insert", self.store.insert_listing(&candidate))
            .await
            .map_err(|err| PipelineError::store("insert", err))?;

        info!(
            target = "fixedprice.ingest",
            listing_id = %listing.id,
            source = listing.source.as_str(),
            user_id = %caller.user_id,
            "listing_created"
        );

        let verdict = self.classify_and_record(&listing).await;
        Ok((listing, verdict))
    }

    async fn classify_and_record(&self, listing: &Listing) -> Verdict {
        let verdict = timed(
            "classify",
            self.classifier.classify(
                listing.description.as_deref().unwrap_or_default(),
                &listing.price_raw,
            ),
        )
        .await;

        if let Err(err) = self.upsert_classification(listing.id, &verdict).await {
            error!(
                target = "fixedprice.store",
                listing_id = %listing.id,
                error = %err,
                "classification_persist_failed"
            );
        }
        verdict
    }

    /// Replaces the listing's classification row, or creates it. The
    /// existence check and the write are separate calls.
    async fn upsert_classification(
        &self,
        listing_id: Uuid,
        verdict: &Verdict,
    ) -> Result<Classification, StoreError> {
        let row = NewClassification {
            listing_id,
            status: verdict.status,
            confidence_score: verdict.confidence_score,
            classification_reason: verdict.reason.clone(),
            ai_model_used: self.classifier.model_id().to_string(),
            classified_at: Utc::now(),
        };
        match self.store.find_classification(listing_id).await? {
            Some(_) => self.store.update_classification(&row).await,
            None => self.store.insert_classification(&row).await,
        }
    }

    pub async fn update_listing(
        &self,
        id: Uuid,
        mut patch: ListingPatch,
        caller: &AuthContext,
    ) -> Result<Listing, PipelineError> {
        require_role(caller, LISTING_MANAGERS, "authorize")?;
        let existing = self.load_listing(id, "load").await?;
        if !caller.can_manage(existing.created_by_user_id.as_deref()) {
            return Err(PipelineError::forbidden(
                "authorize",
                "You can only update your own listings.",
            ));
        }

        ingest::validate_patch(&mut patch)
            .map_err(|err| PipelineError::invalid_input("validate", err.to_string()))?;

        if let Some(url) = patch.listing_url.as_deref()
            && url != existing.listing_url
            && let Some(other) = self
                .store
                .find_listing_by_url(url)
                .await
                .map_err(|err| PipelineError::store("duplicate_check", err))?
            && other.id != id
        {
            return Err(PipelineError::conflict("duplicate_check", other));
        }

        if patch.price_numeric.is_none()
            && let Some(price_raw) = patch.price_raw.as_deref()
            && price_raw != existing.price_raw
        {
            patch.price_numeric = parse_price(price_raw);
        }
        patch.updated_at = Some(Utc::now());

        let updated = self
            .store
            .update_listing(id, &patch)
            .await
            .map_err(|err| PipelineError::store("update", err))?
            .ok_or_else(|| PipelineError::not_found("update", "Listing not found"))?;

        info!(target = "fixedprice.ingest", listing_id = %id, user_id = %caller.user_id, "listing_updated");
        Ok(updated)
    }

    pub async fn remove_listing(
        &self,
        id: Uuid,
        caller: &AuthContext,
    ) -> Result<RemovalOutcome, PipelineError> {
        require_role(caller, LISTING_MANAGERS, "authorize")?;
        let existing = self.load_listing(id, "load").await?;
        if !caller.can_manage(existing.created_by_user_id.as_deref()) {
            return Err(PipelineError::forbidden(
                "authorize",
                "You can only delete your own listings.",
            ));
        }

        let referenced = self
            .store
            .find_classification(id)
            .await
            .map_err(|err| PipelineError::store("load_classification", err))?
            .is_some();

        let removal = if referenced {
            let patch = ListingPatch {
                is_active: Some(false),
                updated_at: Some(Utc::now()),
                ..ListingPatch::default()
            };
            self.store
                .update_listing(id, &patch)
                .await
                .map_err(|err| PipelineError::store("deactivate", err))?
                .ok_or_else(|| PipelineError::not_found("deactivate", "Listing not found"))?;
            Removal::Deactivated
        } else {
            let deleted = self
                .store
                .delete_listing(id)
                .await
                .map_err(|err| PipelineError::store("delete", err))?;
            if !deleted {
                return Err(PipelineError::not_found("delete", "Listing not found"));
            }
            Removal::Deleted
        };

        info!(target = "fixedprice.ingest", listing_id = %id, ?removal, "listing_removed");
        Ok(RemovalOutcome {
            message: match removal {
                Removal::Deactivated => "Listing deactivated".into(),
                Removal::Deleted => "Listing deleted".into(),
            },
            listing_id: id,
            removal,
        })
    }

    pub async fn get_listing(
        &self,
        id: Uuid,
        budget: Option<f64>,
    ) -> Result<ListingView, PipelineError> {
        check_amount("user_budget", budget)?;
        let listing = self.load_listing(id, "load").await?;
        let classification = self
            .store
            .find_classification(id)
            .await
            .map_err(|err| PipelineError::store("load_classification", err))?;
        let success_probability = self.probability_for(&listing, budget).await;
        Ok(ListingView {
            listing,
            classification,
            success_probability,
        })
    }

    /// Active listings, newest first. With a confidence level set, listings
    /// without a classification are left out and paging applies after the
    /// confidence filter.
    pub async fn list_listings(
        &self,
        filters: ListingFilters,
        caller: Option<&AuthContext>,
    ) -> Result<Vec<ListingView>, PipelineError> {
        let skip = filters.skip.unwrap_or(0);
        if skip > MAX_SKIP {
            return Err(PipelineError::invalid_input(
                "filters",
                format!("skip must be between 0 and {MAX_SKIP}"),
            ));
        }
        let limit = filters.limit.unwrap_or(MAX_PAGE);
        if !(1..=MAX_PAGE).contains(&limit) {
            return Err(PipelineError::invalid_input(
                "filters",
                format!("limit must be between 1 and {MAX_PAGE}"),
            ));
        }
        check_amount("max_price", filters.max_price)?;
        check_amount("user_budget", filters.user_budget)?;
        let postcode = bounded_filter("postcode", filters.postcode, MAX_POSTCODE_FILTER_CHARS)?
            .map(|value| normalize_postcode(&value))
            .filter(|value| !value.is_empty());
        let city = bounded_filter("city", filters.city, MAX_CITY_FILTER_CHARS)?;

        if filters.confidence_level.is_some() {
            match caller {
                None => {
                    return Err(PipelineError::forbidden(
                        "filters",
                        "Authentication required to use confidence level filters",
                    ));
                }
                Some(ctx) if !ctx.can_filter_by_confidence() => {
                    return Err(PipelineError::forbidden(
                        "filters",
                        "Subscriber access required to use confidence level filters",
                    ));
                }
                Some(_) => {}
            }
        }

        let paged_in_store = filters.confidence_level.is_none();
        let query = ListingQuery {
            active: Some(true),
            postcode_contains: postcode,
            city_contains: city,
            max_price: filters.max_price,
            newest_first: true,
            offset: if paged_in_store { skip } else { 0 },
            limit: paged_in_store.then_some(limit),
            ..ListingQuery::default()
        };
        let listings = self
            .store
            .query_listings(&query)
            .await
            .map_err(|err| PipelineError::store("query", err))?;

        let mut views = Vec::with_capacity(listings.len().min(limit));
        let mut skipped = 0;
        for listing in listings {
            let classification = self
                .store
                .find_classification(listing.id)
                .await
                .map_err(|err| PipelineError::store("load_classification", err))?;

            if let Some(level) = filters.confidence_level {
                let admitted = classification
                    .as_ref()
                    .is_some_and(|row| level.admits(row.status));
                if !admitted {
                    continue;
                }
                if skipped < skip {
                    skipped += 1;
                    continue;
                }
            }

            let success_probability = self.probability_for(&listing, filters.user_budget).await;
            views.push(ListingView {
                listing,
                classification,
                success_probability,
            });
            if views.len() >= limit {
                break;
            }
        }
        Ok(views)
    }

    async fn probability_for(&self, listing: &Listing, budget: Option<f64>) -> SuccessProbability {
        match probability::estimate_for_listing(self.store.as_ref(), listing, budget).await {
            Ok(estimate) => estimate,
            Err(err) => {
                warn!(
                    target = "fixedprice.store",
                    listing_id = %listing.id,
                    error = %err,
                    "postcode_stats_lookup_failed"
                );
                SuccessProbability::unknown("postcode statistics unavailable")
            }
        }
    }

    pub async fn classify_listing(&self, id: Uuid) -> Result<ClassifyOutcome, PipelineError> {
        let listing = self.load_listing(id, "load").await?;
        let description = listing.description.as_deref().unwrap_or_default();
        if description.trim().is_empty() && listing.price_raw.trim().is_empty() {
            return Err(PipelineError::invalid_input(
                "classify",
                "Listing has no description or price to classify",
            ));
        }

        let verdict = timed(
            "classify",
            self.classifier.classify(description, &listing.price_raw),
        )
        .await;
        self.upsert_classification(id, &verdict)
            .await
            .map_err(|err| {
                PipelineError::internal("persist_classification", format!("Classification failed: {err}"))
            })?;

        Ok(ClassifyOutcome {
            message: "Listing classified successfully".into(),
            listing_id: id,
            classification: verdict,
        })
    }

    /// Classifies active listings one at a time. A failure on one listing is
    /// recorded in its item and does not stop the batch.
    pub async fn classify_batch(&self, request: BatchRequest) -> Result<BatchReport, PipelineError> {
        let limit = request.limit.unwrap_or(DEFAULT_BATCH);
        if !(1..=MAX_BATCH).contains(&limit) {
            return Err(PipelineError::invalid_input(
                "batch",
                format!("limit must be between 1 and {MAX_BATCH}"),
            ));
        }
        let only_unclassified = request.only_unclassified.unwrap_or(true);

        let query = ListingQuery {
            active: Some(true),
            ids: request.listing_ids.filter(|ids| !ids.is_empty()),
            limit: (!only_unclassified).then_some(limit),
            ..ListingQuery::default()
        };
        let listings = self
            .store
            .query_listings(&query)
            .await
            .map_err(|err| PipelineError::store("query", err))?;

        let candidates = if only_unclassified {
            let mut pending = Vec::new();
            for listing in listings {
                let classified = self
                    .store
                    .find_classification(listing.id)
                    .await
                    .map_err(|err| PipelineError::store("load_classification", err))?
                    .is_some();
                if !classified {
                    pending.push(listing);
                    if pending.len() >= limit {
                        break;
                    }
                }
            }
            pending
        } else {
            listings
        };

        if candidates.is_empty() {
            return Ok(BatchReport {
                message: "No listings to classify".into(),
                processed: 0,
                successful: 0,
                failed: 0,
                results: Vec::new(),
            });
        }

        let mut results = Vec::with_capacity(candidates.len());
        for listing in &candidates {
            let verdict = timed(
                "classify",
                self.classifier.classify(
                    listing.description.as_deref().unwrap_or_default(),
                    &listing.price_raw,
                ),
            )
            .await;
            let item = match self.upsert_classification(listing.id, &verdict).await {
                Ok(_) => BatchItem {
                    listing_id: listing.id,
                    status: BatchItemStatus::Success,
                    classification: Some(verdict),
                    error: None,
                },
                Err(err) => {
                    warn!(
                        target = "fixedprice.classify",
                        listing_id = %listing.id,
                        error = %err,
                        "batch_item_failed"
                    );
                    BatchItem {
                        listing_id: listing.id,
                        status: BatchItemStatus::Failed,
                        classification: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            results.push(item);
        }

        let successful = results
            .iter()
            .filter(|item| item.status == BatchItemStatus::Success)
            .count();
        info!(
            target = "fixedprice.classify",
            processed = results.len(),
            successful,
            "batch_classification_completed"
        );
        Ok(BatchReport {
            message: "Batch classification completed".into(),
            processed: results.len(),
            successful,
            failed: results.len() - successful,
            results,
        })
    }

    pub async fn classification_stats(&self) -> Result<ClassificationStats, PipelineError> {
        let total_listings = self
            .store
            .query_listings(&ListingQuery {
                active: Some(true),
                ..ListingQuery::default()
            })
            .await
            .map_err(|err| PipelineError::store("query", err))?
            .len();
        let classifications = self
            .store
            .list_classifications()
            .await
            .map_err(|err| PipelineError::store("load_classification", err))?;

        let count = |status: ClassificationStatus| {
            classifications
                .iter()
                .filter(|c| c.status == status)
                .count()
        };
        let band = |range: std::ops::RangeInclusive<u8>| {
            classifications
                .iter()
                .filter(|c| range.contains(&c.confidence_score))
                .count()
        };
        let total_classified = classifications.len();
        let average = if total_classified == 0 {
            0.0
        } else {
            classifications
                .iter()
                .map(|c| f64::from(c.confidence_score))
                .sum::<f64>()
                / total_classified as f64
        };

        Ok(ClassificationStats {
            total_listings,
            total_classified,
            unclassified: total_listings.saturating_sub(total_classified),
            classification_rate: rate(total_classified, total_listings),
            breakdown: StatusBreakdown {
                explicit: count(ClassificationStatus::Explicit),
                likely: count(ClassificationStatus::Likely),
                competitive: count(ClassificationStatus::Competitive),
            },
            average_confidence_score: round2(average),
            confidence_distribution: ConfidenceDistribution {
                high_confidence: band(70..=100),
                medium_confidence: band(50..=69),
                low_confidence: band(0..=49),
            },
        })
    }

    pub async fn ingestion_stats(&self) -> Result<IngestionStats, PipelineError> {
        let listings = self
            .store
            .query_listings(&ListingQuery::default())
            .await
            .map_err(|err| PipelineError::store("query", err))?;
        let total_classified = self
            .store
            .list_classifications()
            .await
            .map_err(|err| PipelineError::store("load_classification", err))?
            .len();

        let total_listings = listings.len();
        let active_listings = listings.iter().filter(|l| l.is_active).count();
        let mut listings_by_source: BTreeMap<ListingSource, usize> =
            ListingSource::ALL.into_iter().map(|source| (source, 0)).collect();
        for listing in &listings {
            *listings_by_source.entry(listing.source).or_default() += 1;
        }

        Ok(IngestionStats {
            total_listings,
            active_listings,
            inactive_listings: total_listings - active_listings,
            total_classified,
            unclassified: total_listings.saturating_sub(total_classified),
            classification_rate: rate(total_classified, total_listings),
            listings_by_source,
        })
    }

    pub async fn upsert_postcode_stats(
        &self,
        input: PostcodeStatsInput,
    ) -> Result<PostcodeStatsSaved, PipelineError> {
        let stats = validate_postcode_stats(input)?;
        let existed = self
            .store
            .get_postcode_stats(&stats.postcode)
            .await
            .map_err(|err| PipelineError::store("load_postcode_stats", err))?
            .is_some();
        let stats = self
            .store
            .upsert_postcode_stats(&stats)
            .await
            .map_err(|err| PipelineError::store("save_postcode_stats", err))?;
        Ok(PostcodeStatsSaved {
            message: if existed {
                "Postcode stats updated successfully".into()
            } else {
                "Postcode stats added successfully".into()
            },
            stats,
        })
    }

    pub async fn get_postcode_stats(&self, postcode: &str) -> Result<PostcodeStats, PipelineError> {
        let key = normalize_postcode(postcode);
        self.store
            .get_postcode_stats(&key)
            .await
            .map_err(|err| PipelineError::store("load_postcode_stats", err))?
            .ok_or_else(|| {
                PipelineError::not_found(
                    "load_postcode_stats",
                    format!("No statistics found for postcode {key}"),
                )
            })
    }

    pub async fn list_postcode_stats(&self) -> Result<PostcodeStatsList, PipelineError> {
        let mut stats = self
            .store
            .list_postcode_stats()
            .await
            .map_err(|err| PipelineError::store("load_postcode_stats", err))?;
        stats.sort_by(|a, b| a.postcode.cmp(&b.postcode));
        Ok(PostcodeStatsList {
            total: stats.len(),
            stats,
        })
    }

    async fn load_listing(&self, id: Uuid, stage: &'static str) -> Result<Listing, PipelineError> {
        self.store
            .get_listing(id)
            .await
            .map_err(|err| PipelineError::store(stage, err))?
            .ok_or_else(|| PipelineError::not_found(stage, "Listing not found"))
    }
}

async fn timed<T, Fut>(stage: &'static str, fut: Fut) -> T
where
    Fut: Future<Output = T>,
{
    let started = Instant::now();
    let out = fut.await;
    crate::metrics::stage_elapsed(stage, started.elapsed().as_millis());
    out
}

fn require_role(
    caller: &AuthContext,
    allowed: &[Role],
    stage: &'static str,
) -> Result<(), PipelineError> {
    if caller.has_role(allowed) {
        Ok(())
    } else {
        Err(PipelineError::forbidden(stage, "Insufficient role for this operation"))
    }
}

fn check_amount(field: &'static str, value: Option<f64>) -> Result<(), PipelineError> {
    match value {
        Some(amount) if !(0.0..=MAX_AMOUNT).contains(&amount) => Err(PipelineError::invalid_input(
            "filters",
            format!("{field} must be between 0 and {MAX_AMOUNT}"),
        )),
        _ => Ok(()),
    }
}

fn bounded_filter(
    field: &'static str,
    value: Option<String>,
    max_chars: usize,
) -> Result<Option<String>, PipelineError> {
    let Some(value) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    if value.chars().count() > max_chars {
        return Err(PipelineError::invalid_input(
            "filters",
            format!("{field} must be at most {max_chars} characters"),
        ));
    }
    Ok(Some(value))
}

fn validate_postcode_stats(input: PostcodeStatsInput) -> Result<PostcodeStats, PipelineError> {
    let postcode = normalize_postcode(&input.postcode);
    if postcode.is_empty() {
        return Err(PipelineError::invalid_input("validate", "postcode is required"));
    }
    if !input.avg_sale_over_asking.is_finite() || !(0.0..=100.0).contains(&input.avg_sale_over_asking)
    {
        return Err(PipelineError::invalid_input(
            "validate",
            "avg_sale_over_asking must be between 0 and 100",
        ));
    }
    let total_sales = u64::try_from(input.total_sales)
        .map_err(|_| PipelineError::invalid_input("validate", "total_sales must be non-negative"))?;
    let fixed_price_friendliness = Friendliness::from_label(&input.fixed_price_friendliness)
        .ok_or_else(|| {
            PipelineError::invalid_input(
                "validate",
                "fixed_price_friendliness must be one of: high, medium, low",
            )
        })?;
    Ok(PostcodeStats {
        postcode,
        avg_sale_over_asking: input.avg_sale_over_asking,
        total_sales,
        fixed_price_friendliness,
    })
}

fn rate(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        round2(part as f64 / total as f64 * 100.0)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
    existing: Option<ListingRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    NotFound,
    Forbidden,
    Conflict,
    Internal,
}

impl PipelineError {
    fn with_kind(stage: &'static str, message: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
            existing: None,
        }
    }

    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::InvalidInput)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::NotFound)
    }

    pub fn forbidden(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Forbidden)
    }

    pub fn conflict(stage: &'static str, existing: ListingRef) -> Self {
        Self {
            existing: Some(existing),
            ..Self::with_kind(stage, "Listing already exists", PipelineErrorKind::Conflict)
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Internal)
    }

    fn store(stage: &'static str, err: StoreError) -> Self {
        Self::internal(stage, err.to_string())
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }

    pub fn existing(&self) -> Option<&ListingRef> {
        self.existing.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassifierConfig;
    use crate::llm::{CompletionBackend, CompletionError, LlmMessage};
    use crate::models::{ConfidenceLevel, NewListing, ProbabilityBand};
    use crate::store::{
        ClassificationRepository, ListingRepository, MemoryStore, PostcodeStatsRepository,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Applies the price-text taxonomy to the listing section of the prompt.
    struct TaxonomyBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionBackend for TaxonomyBackend {
        async fn complete(&self, messages: &[LlmMessage]) -> Result<String, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let listing = messages[1]
                .content
                .split("CLASSIFICATION CATEGORIES:")
                .next()
                .unwrap_or_default()
                .to_lowercase();
            let (status, score) = if listing.contains("closing date") {
                ("competitive", 90)
            } else if listing.contains("fixed price") {
                ("explicit", 95)
            } else {
                ("likely", 60)
            };
            Ok(format!(
                r#"{{"status":"{status}","confidence_score":{score},"reason":"test"}}"#
            ))
        }
    }

    struct UnavailableBackend;

    #[async_trait]
    impl CompletionBackend for UnavailableBackend {
        async fn complete(&self, _messages: &[LlmMessage]) -> Result<String, CompletionError> {
            Err(CompletionError::Http("HTTP 503".into()))
        }
    }

    /// Memory store whose classification writes always fail.
    #[derive(Clone, Default)]
    struct ReadOnlyClassifications {
        inner: MemoryStore,
    }

    #[async_trait]
    impl ListingRepository for ReadOnlyClassifications {
        async fn find_listing_by_url(&self, url: &str) -> Result<Option<ListingRef>, StoreError> {
            self.inner.find_listing_by_url(url).await
        }
        async fn get_listing(&self, id: Uuid) -> Result<Option<Listing>, StoreError> {
            self.inner.get_listing(id).await
        }
        async fn insert_listing(&self, listing: &NewListing) -> Result<Listing, StoreError> {
            self.inner.insert_listing(listing).await
        }
        async fn update_listing(
            &self,
            id: Uuid,
            patch: &ListingPatch,
        ) -> Result<Option<Listing>, StoreError> {
            self.inner.update_listing(id, patch).await
        }
        async fn delete_listing(&self, id: Uuid) -> Result<bool, StoreError> {
            self.inner.delete_listing(id).await
        }
        async fn query_listings(&self, query: &ListingQuery) -> Result<Vec<Listing>, StoreError> {
            self.inner.query_listings(query).await
        }
    }

    #[async_trait]
    impl ClassificationRepository for ReadOnlyClassifications {
        async fn find_classification(
            &self,
            listing_id: Uuid,
        ) -> Result<Option<Classification>, StoreError> {
            self.inner.find_classification(listing_id).await
        }
        async fn insert_classification(
            &self,
            _classification: &NewClassification,
        ) -> Result<Classification, StoreError> {
            Err(StoreError::Request("HTTP 503 Service Unavailable".into()))
        }
        async fn update_classification(
            &self,
            _classification: &NewClassification,
        ) -> Result<Classification, StoreError> {
            Err(StoreError::Request("HTTP 503 Service Unavailable".into()))
        }
        async fn list_classifications(&self) -> Result<Vec<Classification>, StoreError> {
            self.inner.list_classifications().await
        }
    }

    #[async_trait]
    impl PostcodeStatsRepository for ReadOnlyClassifications {
        async fn get_postcode_stats(
            &self,
            postcode: &str,
        ) -> Result<Option<PostcodeStats>, StoreError> {
            self.inner.get_postcode_stats(postcode).await
        }
        async fn upsert_postcode_stats(
            &self,
            stats: &PostcodeStats,
        ) -> Result<PostcodeStats, StoreError> {
            self.inner.upsert_postcode_stats(stats).await
        }
        async fn list_postcode_stats(&self) -> Result<Vec<PostcodeStats>, StoreError> {
            self.inner.list_postcode_stats().await
        }
    }

    fn pipeline_with(store: Arc<dyn RowStore>, backend: Arc<dyn CompletionBackend>) -> Pipeline {
        Pipeline::new(store, Classifier::new(backend, ClassifierConfig::default()))
    }

    fn pipeline(store: &MemoryStore) -> (Pipeline, Arc<TaxonomyBackend>) {
        let backend = Arc::new(TaxonomyBackend {
            calls: AtomicUsize::new(0),
        });
        (pipeline_with(Arc::new(store.clone()), backend.clone()), backend)
    }

    fn caller(role: Role, user_id: &str) -> AuthContext {
        AuthContext {
            user_id: user_id.into(),
            role,
            key_id: "key-01".into(),
        }
    }

    fn draft(url: &str, price_raw: &str) -> ListingDraft {
        ListingDraft {
            listing_url: Some(url.into()),
            source: Some("agent".into()),
            address: Some("14 Marchmont Road, Edinburgh".into()),
            postcode: Some("eh9 1hy".into()),
            city: Some("Edinburgh".into()),
            price_raw: Some(price_raw.into()),
            description: Some("Bright tenement flat.".into()),
            ..ListingDraft::default()
        }
    }

    async fn seed_stats(store: &MemoryStore, postcode: &str, avg: f64) {
        store
            .upsert_postcode_stats(&PostcodeStats {
                postcode: postcode.into(),
                avg_sale_over_asking: avg,
                total_sales: 12,
                fixed_price_friendliness: Friendliness::High,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ingest_stores_listing_and_classification() {
        let store = MemoryStore::new();
        let (pipeline, backend) = pipeline(&store);
        let agent = caller(Role::Agent, "agent-1");

        let outcome = pipeline
            .ingest(draft("https://agents.example/1", "Fixed Price £250,000"), &agent)
            .await
            .unwrap();

        assert_eq!(outcome.listing.price_numeric, Some(250_000.0));
        assert_eq!(outcome.listing.postcode.as_deref(), Some("EH91HY"));
        assert_eq!(outcome.listing.created_by_user_id.as_deref(), Some("agent-1"));
        assert_eq!(outcome.classification.status, ClassificationStatus::Explicit);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        let stored = store.find_classification(outcome.listing.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ClassificationStatus::Explicit);
        assert_eq!(stored.ai_model_used.as_deref(), Some("gpt-4o"));
    }

    #[tokio::test]
    async fn duplicate_url_conflicts_with_existing_identity() {
        let store = MemoryStore::new();
        let (pipeline, backend) = pipeline(&store);
        let admin = caller(Role::Admin, "admin");

        let first = pipeline
            .create_listing(draft("https://agents.example/1", "£200,000"), &admin)
            .await
            .unwrap();
        let err = pipeline
            .create_listing(draft("https://agents.example/1", "£210,000"), &admin)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), PipelineErrorKind::Conflict);
        assert_eq!(err.existing().map(|r| r.id), Some(first.id));
        assert_eq!(store.listing_count().await, 1);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_draft_is_rejected_before_any_write() {
        let store = MemoryStore::new();
        let (pipeline, backend) = pipeline(&store);
        let mut bad = draft("not a url", "£1");
        bad.address = Some("x".into());

        let err = pipeline
            .ingest(bad, &caller(Role::Admin, "admin"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert_eq!(store.listing_count().await, 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn buyers_cannot_create_listings() {
        let store = MemoryStore::new();
        let (pipeline, _) = pipeline(&store);
        let err = pipeline
            .create_listing(draft("https://agents.example/1", "£1"), &caller(Role::Buyer, "b"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Forbidden);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_backend_still_creates_listing() {
        let store = MemoryStore::new();
        let pipeline = pipeline_with(Arc::new(store.clone()), Arc::new(UnavailableBackend));

        let outcome = pipeline
            .ingest(
                draft("https://agents.example/1", "Fixed Price £250,000"),
                &caller(Role::Admin, "admin"),
            )
            .await
            .unwrap();

        assert_eq!(outcome.classification.status, ClassificationStatus::Competitive);
        assert_eq!(outcome.classification.confidence_score, 0);
        let stored = store.find_classification(outcome.listing.id).await.unwrap();
        assert_eq!(stored.map(|c| c.confidence_score), Some(0));
    }

    #[tokio::test]
    async fn classification_write_failure_does_not_fail_creation() {
        let store = ReadOnlyClassifications::default();
        let backend = Arc::new(TaxonomyBackend {
            calls: AtomicUsize::new(0),
        });
        let pipeline = pipeline_with(Arc::new(store.clone()), backend);

        let outcome = pipeline
            .ingest(
                draft("https://agents.example/1", "Fixed Price £250,000"),
                &caller(Role::Admin, "admin"),
            )
            .await
            .unwrap();

        assert_eq!(outcome.classification.status, ClassificationStatus::Explicit);
        assert_eq!(store.inner.listing_count().await, 1);
        assert!(store.inner.list_classifications().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reclassification_replaces_the_single_row() {
        let store = MemoryStore::new();
        let (pipeline, _) = pipeline(&store);
        let admin = caller(Role::Admin, "admin");
        let listing = pipeline
            .create_listing(draft("https://agents.example/1", "Offers Over £200,000"), &admin)
            .await
            .unwrap();
        assert_eq!(
            store.find_classification(listing.id).await.unwrap().unwrap().status,
            ClassificationStatus::Likely
        );

        let patch = ListingPatch {
            price_raw: Some("Offers Over £200,000. Closing date set for 14 March.".into()),
            ..ListingPatch::default()
        };
        pipeline.update_listing(listing.id, patch, &admin).await.unwrap();
        let outcome = pipeline.classify_listing(listing.id).await.unwrap();

        assert_eq!(outcome.classification.status, ClassificationStatus::Competitive);
        let rows = store.list_classifications().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ClassificationStatus::Competitive);
    }

    #[tokio::test]
    async fn classify_requires_some_text() {
        let store = MemoryStore::new();
        let (pipeline, backend) = pipeline(&store);
        let listing = store
            .insert_listing(&NewListing {
                listing_url: "https://agents.example/blank".into(),
                source: ListingSource::Agent,
                address: "1 Blank Street".into(),
                postcode: None,
                city: None,
                region: None,
                price_raw: " ".into(),
                price_numeric: None,
                description: None,
                agent_name: None,
                agent_url: None,
                image_url: None,
                extra_image_urls: None,
                is_active: true,
                created_by_user_id: None,
            })
            .await
            .unwrap();

        let err = pipeline.classify_listing(listing.id).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        let missing = pipeline.classify_listing(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(missing.kind(), PipelineErrorKind::NotFound);
    }

    #[tokio::test]
    async fn agents_only_update_their_own_listings() {
        let store = MemoryStore::new();
        let (pipeline, _) = pipeline(&store);
        let owner = caller(Role::Agent, "agent-1");
        let listing = pipeline
            .create_listing(draft("https://agents.example/1", "£200,000"), &owner)
            .await
            .unwrap();

        let patch = ListingPatch {
            price_raw: Some("Offers Over £180k".into()),
            ..ListingPatch::default()
        };
        let err = pipeline
            .update_listing(listing.id, patch.clone(), &caller(Role::Agent, "agent-2"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Forbidden);

        let updated = pipeline.update_listing(listing.id, patch, &owner).await.unwrap();
        assert_eq!(updated.price_raw, "Offers Over £180k");
        assert_eq!(updated.price_numeric, Some(180_000.0));
        assert!(updated.updated_at >= listing.updated_at);
    }

    #[tokio::test]
    async fn url_change_onto_existing_listing_conflicts() {
        let store = MemoryStore::new();
        let (pipeline, _) = pipeline(&store);
        let admin = caller(Role::Admin, "admin");
        let first = pipeline
            .create_listing(draft("https://agents.example/1", "£1"), &admin)
            .await
            .unwrap();
        let second = pipeline
            .create_listing(draft("https://agents.example/2", "£1"), &admin)
            .await
            .unwrap();

        let patch = ListingPatch {
            listing_url: Some("https://agents.example/1".into()),
            ..ListingPatch::default()
        };
        let err = pipeline.update_listing(second.id, patch, &admin).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Conflict);
        assert_eq!(err.existing().map(|r| r.id), Some(first.id));

        let bad_source = ListingPatch {
            source: Some("purplebricks".into()),
            ..ListingPatch::default()
        };
        let err = pipeline.update_listing(second.id, bad_source, &admin).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn classified_listings_are_deactivated_not_deleted() {
        let store = MemoryStore::new();
        let (pipeline, _) = pipeline(&store);
        let admin = caller(Role::Admin, "admin");
        let classified = pipeline
            .create_listing(draft("https://agents.example/1", "£1"), &admin)
            .await
            .unwrap();
        let bare = store
            .insert_listing(&ingest::validate_draft(draft("https://agents.example/2", "£1"), None).unwrap())
            .await
            .unwrap();

        let soft = pipeline.remove_listing(classified.id, &admin).await.unwrap();
        assert_eq!(soft.removal, Removal::Deactivated);
        let kept = store.get_listing(classified.id).await.unwrap().unwrap();
        assert!(!kept.is_active);

        let hard = pipeline.remove_listing(bare.id, &admin).await.unwrap();
        assert_eq!(hard.removal, Removal::Deleted);
        assert!(store.get_listing(bare.id).await.unwrap().is_none());

        let err = pipeline
            .remove_listing(kept.id, &caller(Role::Agent, "agent-9"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn reads_attach_classification_and_probability() {
        let store = MemoryStore::new();
        let (pipeline, _) = pipeline(&store);
        seed_stats(&store, "EH91HY", 4.0).await;
        let listing = pipeline
            .create_listing(
                draft("https://agents.example/1", "Fixed Price £250,000"),
                &caller(Role::Admin, "admin"),
            )
            .await
            .unwrap();

        let view = pipeline.get_listing(listing.id, None).await.unwrap();
        assert_eq!(view.success_probability.probability, ProbabilityBand::High);
        assert_eq!(
            view.classification.map(|c| c.status),
            Some(ClassificationStatus::Explicit)
        );

        let short = pipeline.get_listing(listing.id, Some(200_000.0)).await.unwrap();
        assert_eq!(short.success_probability.probability, ProbabilityBand::Zero);

        let err = pipeline.get_listing(Uuid::new_v4(), None).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::NotFound);
    }

    #[tokio::test]
    async fn confidence_filter_is_gated_and_applied() {
        let store = MemoryStore::new();
        let (pipeline, _) = pipeline(&store);
        let admin = caller(Role::Admin, "admin");
        for (n, price) in ["Fixed Price £200,000", "Offers Over £210,000", "Offers Over £1. Closing date Friday"]
            .into_iter()
            .enumerate()
        {
            pipeline
                .create_listing(draft(&format!("https://agents.example/{n}"), price), &admin)
                .await
                .unwrap();
        }

        let explicit_only = ListingFilters {
            confidence_level: Some(ConfidenceLevel::Explicit),
            ..ListingFilters::default()
        };
        let anonymous = pipeline.list_listings(explicit_only.clone(), None).await.unwrap_err();
        assert_eq!(anonymous.kind(), PipelineErrorKind::Forbidden);
        let agent = caller(Role::Agent, "agent-1");
        let err = pipeline
            .list_listings(explicit_only.clone(), Some(&agent))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Forbidden);

        let subscriber = caller(Role::Subscriber, "sub-1");
        let views = pipeline
            .list_listings(explicit_only, Some(&subscriber))
            .await
            .unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].listing.price_raw, "Fixed Price £200,000");

        let both = ListingFilters {
            confidence_level: Some(ConfidenceLevel::ExplicitAndLikely),
            ..ListingFilters::default()
        };
        assert_eq!(pipeline.list_listings(both, Some(&subscriber)).await.unwrap().len(), 2);

        let everything = pipeline.list_listings(ListingFilters::default(), None).await.unwrap();
        assert_eq!(everything.len(), 3);
    }

    #[tokio::test]
    async fn list_filters_are_bounded_and_applied() {
        let store = MemoryStore::new();
        let (pipeline, _) = pipeline(&store);
        let admin = caller(Role::Admin, "admin");
        pipeline
            .create_listing(draft("https://agents.example/1", "£150,000"), &admin)
            .await
            .unwrap();
        let mut glasgow = draft("https://agents.example/2", "£350,000");
        glasgow.city = Some("Glasgow".into());
        glasgow.postcode = Some("G12 8QQ".into());
        pipeline.create_listing(glasgow, &admin).await.unwrap();

        let by_postcode = pipeline
            .list_listings(
                ListingFilters {
                    postcode: Some("g12".into()),
                    ..ListingFilters::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(by_postcode.len(), 1);
        assert_eq!(by_postcode[0].listing.city.as_deref(), Some("Glasgow"));

        let cheap = pipeline
            .list_listings(
                ListingFilters {
                    max_price: Some(200_000.0),
                    ..ListingFilters::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(cheap.len(), 1);

        for bad in [
            ListingFilters {
                limit: Some(0),
                ..ListingFilters::default()
            },
            ListingFilters {
                limit: Some(101),
                ..ListingFilters::default()
            },
            ListingFilters {
                skip: Some(10_001),
                ..ListingFilters::default()
            },
            ListingFilters {
                user_budget: Some(-1.0),
                ..ListingFilters::default()
            },
        ] {
            let err = pipeline.list_listings(bad, None).await.unwrap_err();
            assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        }
    }

    #[tokio::test]
    async fn batch_classifies_only_unclassified_by_default() {
        let store = MemoryStore::new();
        let (pipeline, backend) = pipeline(&store);
        pipeline
            .create_listing(draft("https://agents.example/1", "£1"), &caller(Role::Admin, "a"))
            .await
            .unwrap();
        for n in 2..=4 {
            store
                .insert_listing(
                    &ingest::validate_draft(draft(&format!("https://agents.example/{n}"), "Fixed Price £1"), None)
                        .unwrap(),
                )
                .await
                .unwrap();
        }

        let report = pipeline
            .classify_batch(BatchRequest {
                limit: Some(2),
                ..BatchRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.successful, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

        let rest = pipeline.classify_batch(BatchRequest::default()).await.unwrap();
        assert_eq!(rest.processed, 1);
        let done = pipeline.classify_batch(BatchRequest::default()).await.unwrap();
        assert_eq!(done.processed, 0);
        assert_eq!(done.message, "No listings to classify");

        let err = pipeline
            .classify_batch(BatchRequest {
                limit: Some(51),
                ..BatchRequest::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn batch_records_per_item_failures() {
        let store = ReadOnlyClassifications::default();
        let backend = Arc::new(TaxonomyBackend {
            calls: AtomicUsize::new(0),
        });
        let pipeline = pipeline_with(Arc::new(store.clone()), backend);
        for n in 1..=2 {
            store
                .insert_listing(
                    &ingest::validate_draft(draft(&format!("https://agents.example/{n}"), "£1"), None).unwrap(),
                )
                .await
                .unwrap();
        }

        let report = pipeline.classify_batch(BatchRequest::default()).await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 2);
        assert!(report.results.iter().all(|item| item.error.is_some()));
    }

    #[tokio::test]
    async fn stats_summarise_listings_and_classifications() {
        let store = MemoryStore::new();
        let (pipeline, _) = pipeline(&store);
        let admin = caller(Role::Admin, "admin");
        let explicit = pipeline
            .create_listing(draft("https://agents.example/1", "Fixed Price £1"), &admin)
            .await
            .unwrap();
        pipeline
            .create_listing(draft("https://agents.example/2", "Offers Over £1"), &admin)
            .await
            .unwrap();
        store
            .insert_listing(&ingest::validate_draft(draft("https://www.rightmove.co.uk/p/3", "£1"), None).unwrap())
            .await
            .unwrap();
        pipeline
            .update_listing(
                explicit.id,
                ListingPatch {
                    is_active: Some(false),
                    ..ListingPatch::default()
                },
                &admin,
            )
            .await
            .unwrap();

        let classification = pipeline.classification_stats().await.unwrap();
        assert_eq!(classification.total_listings, 2);
        assert_eq!(classification.total_classified, 2);
        assert_eq!(classification.breakdown.explicit, 1);
        assert_eq!(classification.breakdown.likely, 1);
        assert_eq!(classification.average_confidence_score, 77.5);
        assert_eq!(classification.confidence_distribution.high_confidence, 1);
        assert_eq!(classification.confidence_distribution.medium_confidence, 1);

        let ingestion = pipeline.ingestion_stats().await.unwrap();
        assert_eq!(ingestion.total_listings, 3);
        assert_eq!(ingestion.active_listings, 2);
        assert_eq!(ingestion.inactive_listings, 1);
        assert_eq!(ingestion.unclassified, 1);
        assert_eq!(ingestion.classification_rate, 66.67);
        assert_eq!(ingestion.listings_by_source[&ListingSource::Rightmove], 1);
        assert_eq!(ingestion.listings_by_source[&ListingSource::Agent], 2);
        assert_eq!(ingestion.listings_by_source[&ListingSource::Zoopla], 0);
    }

    #[tokio::test]
    async fn postcode_stats_are_validated_and_normalized() {
        let store = MemoryStore::new();
        let (pipeline, _) = pipeline(&store);
        let input = |avg: f64, sales: i64, friendliness: &str| PostcodeStatsInput {
            postcode: "eh1 1aa".into(),
            avg_sale_over_asking: avg,
            total_sales: sales,
            fixed_price_friendliness: friendliness.into(),
        };

        let added = pipeline.upsert_postcode_stats(input(6.5, 40, "Medium")).await.unwrap();
        assert_eq!(added.message, "Postcode stats added successfully");
        assert_eq!(added.stats.postcode, "EH11AA");
        let updated = pipeline.upsert_postcode_stats(input(3.0, 41, "high")).await.unwrap();
        assert_eq!(updated.message, "Postcode stats updated successfully");

        for bad in [input(101.0, 1, "high"), input(1.0, -1, "high"), input(1.0, 1, "great")] {
            let err = pipeline.upsert_postcode_stats(bad).await.unwrap_err();
            assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        }

        let fetched = pipeline.get_postcode_stats("EH1 1AA").await.unwrap();
        assert_eq!(fetched.fixed_price_friendliness, Friendliness::High);
        assert_eq!(pipeline.list_postcode_stats().await.unwrap().total, 1);
        let missing = pipeline.get_postcode_stats("ZZ1").await.unwrap_err();
        assert_eq!(missing.kind(), PipelineErrorKind::NotFound);
    }
}
