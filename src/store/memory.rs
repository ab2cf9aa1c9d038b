use super::{
    ClassificationRepository, ListingQuery, ListingRepository, PostcodeStatsRepository,
    StoreError,
};
use crate::models::{
    Classification, Listing, ListingPatch, ListingRef, ListingSource, NewClassification,
    NewListing, PostcodeStats,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Process-local row store used when no Supabase project is configured and
/// as the store behind tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Tables>>,
}

#[derive(Default)]
struct Tables {
    listings: Vec<Listing>,
    classifications: HashMap<Uuid, Classification>,
    postcode_stats: BTreeMap<String, PostcodeStats>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn listing_count(&self) -> usize {
        self.inner.read().await.listings.len()
    }
}

#[async_trait]
impl ListingRepository for MemoryStore {
    async fn find_listing_by_url(&self, url: &str) -> Result<Option<ListingRef>, StoreError> {
        let tables = self.inner.read().await;
        Ok(tables
            .listings
            .iter()
            .find(|listing| listing.listing_url == url)
            .map(Listing::as_ref_summary))
    }

    async fn get_listing(&self, id: Uuid) -> Result<Option<Listing>, StoreError> {
        let tables = self.inner.read().await;
        Ok(tables.listings.iter().find(|l| l.id == id).cloned())
    }

    async fn insert_listing(&self, listing: &NewListing) -> Result<Listing, StoreError> {
        let now = Utc::now();
        let row = Listing {
            id: Uuid::new_v4(),
            listing_url: listing.listing_url.clone(),
            source: listing.source,
            address: listing.address.clone(),
            postcode: listing.postcode.clone(),
            city: listing.city.clone(),
            region: listing.region.clone(),
            price_raw: listing.price_raw.clone(),
            price_numeric: listing.price_numeric,
            description: listing.description.clone(),
            agent_name: listing.agent_name.clone(),
            agent_url: listing.agent_url.clone(),
            image_url: listing.image_url.clone(),
            extra_image_urls: listing.extra_image_urls.clone(),
            is_active: listing.is_active,
            created_by_user_id: listing.created_by_user_id.clone(),
            first_seen_at: now,
            last_checked_at: now,
            created_at: now,
            updated_at: now,
        };
        let mut tables = self.inner.write().await;
        if tables
            .listings
            .iter()
            .any(|existing| existing.listing_url == row.listing_url)
        {
            return Err(StoreError::Request(
                "duplicate key value violates unique constraint \"listings_listing_url_key\""
                    .into(),
            ));
        }
        tables.listings.push(row.clone());
        Ok(row)
    }

    async fn update_listing(
        &self,
        id: Uuid,
        patch: &ListingPatch,
    ) -> Result<Option<Listing>, StoreError> {
        let mut tables = self.inner.write().await;
        let Some(row) = tables.listings.iter_mut().find(|l| l.id == id) else {
            return Ok(None);
        };
        apply_patch(row, patch)?;
        Ok(Some(row.clone()))
    }

    async fn delete_listing(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.inner.write().await;
        let before = tables.listings.len();
        tables.listings.retain(|l| l.id != id);
        let removed = tables.listings.len() != before;
        if removed {
            tables.classifications.remove(&id);
        }
        Ok(removed)
    }

    async fn query_listings(&self, query: &ListingQuery) -> Result<Vec<Listing>, StoreError> {
        let tables = self.inner.read().await;
        let city = query.city_contains.as_deref().map(str::to_lowercase);
        let mut rows: Vec<Listing> = tables
            .listings
            .iter()
            .filter(|l| query.active.is_none_or(|active| l.is_active == active))
            .filter(|l| query.ids.as_ref().is_none_or(|ids| ids.contains(&l.id)))
            .filter(|l| {
                query.postcode_contains.as_deref().is_none_or(|needle| {
                    l.postcode.as_deref().is_some_and(|pc| pc.contains(needle))
                })
            })
            .filter(|l| {
                city.as_deref().is_none_or(|needle| {
                    l.city
                        .as_deref()
                        .is_some_and(|c| c.to_lowercase().contains(needle))
                })
            })
            .filter(|l| {
                query
                    .max_price
                    .is_none_or(|max| l.price_numeric.is_some_and(|price| price <= max))
            })
            .cloned()
            .collect();

        if query.newest_first {
            rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }

        let rows = rows.into_iter().skip(query.offset);
        Ok(match query.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        })
    }
}

fn apply_patch(row: &mut Listing, patch: &ListingPatch) -> Result<(), StoreError> {
    if let Some(url) = &patch.listing_url {
        row.listing_url = url.clone();
    }
    if let Some(source) = &patch.source {
        row.source = ListingSource::from_label(source)
            .ok_or_else(|| StoreError::Request(format!("invalid source value `{source}`")))?;
    }
    if let Some(address) = &patch.address {
        row.address = address.clone();
    }
    if let Some(postcode) = &patch.postcode {
        row.postcode = Some(postcode.clone()).filter(|v| !v.is_empty());
    }
    if let Some(city) = &patch.city {
        row.city = Some(city.clone());
    }
    if let Some(region) = &patch.region {
        row.region = Some(region.clone());
    }
    if let Some(price_raw) = &patch.price_raw {
        row.price_raw = price_raw.clone();
    }
    if let Some(price) = patch.price_numeric {
        row.price_numeric = Some(price);
    }
    if let Some(description) = &patch.description {
        row.description = Some(description.clone());
    }
    if let Some(agent_name) = &patch.agent_name {
        row.agent_name = Some(agent_name.clone());
    }
    if let Some(agent_url) = &patch.agent_url {
        row.agent_url = Some(agent_url.clone());
    }
    if let Some(image_url) = &patch.image_url {
        row.image_url = Some(image_url.clone());
    }
    if let Some(extra) = &patch.extra_image_urls {
        row.extra_image_urls = Some(extra.clone());
    }
    if let Some(active) = patch.is_active {
        row.is_active = active;
    }
    row.updated_at = patch.updated_at.unwrap_or_else(Utc::now);
    Ok(())
}

#[async_trait]
impl ClassificationRepository for MemoryStore {
    async fn find_classification(
        &self,
        listing_id: Uuid,
    ) -> Result<Option<Classification>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .classifications
            .get(&listing_id)
            .cloned())
    }

    async fn insert_classification(
        &self,
        classification: &NewClassification,
    ) -> Result<Classification, StoreError> {
        let row = Classification {
            id: Uuid::new_v4(),
            listing_id: classification.listing_id,
            status: classification.status,
            confidence_score: classification.confidence_score,
            classification_reason: Some(classification.classification_reason.clone()),
            ai_model_used: Some(classification.ai_model_used.clone()),
            classified_at: classification.classified_at,
            created_at: Utc::now(),
        };
        let mut tables = self.inner.write().await;
        tables
            .classifications
            .insert(classification.listing_id, row.clone());
        Ok(row)
    }

    async fn update_classification(
        &self,
        classification: &NewClassification,
    ) -> Result<Classification, StoreError> {
        let mut tables = self.inner.write().await;
        let row = tables
            .classifications
            .get_mut(&classification.listing_id)
            .ok_or(StoreError::MissingRow("classifications"))?;
        row.status = classification.status;
        row.confidence_score = classification.confidence_score;
        row.classification_reason = Some(classification.classification_reason.clone());
        row.ai_model_used = Some(classification.ai_model_used.clone());
        row.classified_at = classification.classified_at;
        Ok(row.clone())
    }

    async fn list_classifications(&self) -> Result<Vec<Classification>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .classifications
            .values()
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PostcodeStatsRepository for MemoryStore {
    async fn get_postcode_stats(
        &self,
        postcode: &str,
    ) -> Result<Option<PostcodeStats>, StoreError> {
        Ok(self.inner.read().await.postcode_stats.get(postcode).cloned())
    }

    async fn upsert_postcode_stats(
        &self,
        stats: &PostcodeStats,
    ) -> Result<PostcodeStats, StoreError> {
        let mut tables = self.inner.write().await;
        tables
            .postcode_stats
            .insert(stats.postcode.clone(), stats.clone());
        Ok(stats.clone())
    }

    async fn list_postcode_stats(&self) -> Result<Vec<PostcodeStats>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .postcode_stats
            .values()
            .cloned()
            .collect())
    }
}
