pub mod memory;
pub mod supabase;

pub use memory::MemoryStore;
pub use supabase::SupabaseClient;

use crate::models::{
    Classification, Listing, ListingPatch, ListingRef, NewClassification, NewListing,
    PostcodeStats,
};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("store returned no row for {0}")]
    MissingRow(&'static str),
}

/// Simple predicate filter over listings. `None` fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct ListingQuery {
    pub active: Option<bool>,
    pub ids: Option<Vec<Uuid>>,
    /// Substring match against the normalized postcode.
    pub postcode_contains: Option<String>,
    /// Case-insensitive substring match against the city.
    pub city_contains: Option<String>,
    pub max_price: Option<f64>,
    pub offset: usize,
    pub limit: Option<usize>,
    pub newest_first: bool,
}

#[async_trait]
pub trait ListingRepository: Send + Sync {
    async fn find_listing_by_url(&self, url: &str) -> Result<Option<ListingRef>, StoreError>;
    async fn get_listing(&self, id: Uuid) -> Result<Option<Listing>, StoreError>;
    async fn insert_listing(&self, listing: &NewListing) -> Result<Listing, StoreError>;
    async fn update_listing(
        &self,
        id: Uuid,
        patch: &ListingPatch,
    ) -> Result<Option<Listing>, StoreError>;
    async fn delete_listing(&self, id: Uuid) -> Result<bool, StoreError>;
    async fn query_listings(&self, query: &ListingQuery) -> Result<Vec<Listing>, StoreError>;
}

#[async_trait]
pub trait ClassificationRepository: Send + Sync {
    async fn find_classification(
        &self,
        listing_id: Uuid,
    ) -> Result<Option<Classification>, StoreError>;
    async fn insert_classification(
        &self,
        classification: &NewClassification,
    ) -> Result<Classification, StoreError>;
    async fn update_classification(
        &self,
        classification: &NewClassification,
    ) -> Result<Classification, StoreError>;
    async fn list_classifications(&self) -> Result<Vec<Classification>, StoreError>;
}

#[async_trait]
pub trait PostcodeStatsRepository: Send + Sync {
    /// Exact match on an already normalized postcode.
    async fn get_postcode_stats(&self, postcode: &str)
    -> Result<Option<PostcodeStats>, StoreError>;
    /// Inserts, or updates the row with the same postcode.
    async fn upsert_postcode_stats(
        &self,
        stats: &PostcodeStats,
    ) -> Result<PostcodeStats, StoreError>;
    async fn list_postcode_stats(&self) -> Result<Vec<PostcodeStats>, StoreError>;
}

/// Everything the listing service needs from persistence.
pub trait RowStore: ListingRepository + ClassificationRepository + PostcodeStatsRepository {}

impl<T> RowStore for T where T: ListingRepository + ClassificationRepository + PostcodeStatsRepository
{}
