use super::{
    ClassificationRepository, ListingQuery, ListingRepository, PostcodeStatsRepository,
    StoreError,
};
use crate::config::env_opt;
use crate::http::build_client;
use crate::models::{
    Classification, Listing, ListingPatch, ListingRef, NewClassification, NewListing,
    PostcodeStats,
};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

const LISTINGS: &str = "listings";
const CLASSIFICATIONS: &str = "classifications";
const POSTCODE_STATS: &str = "postcode_stats";
const LISTING_REF_COLUMNS: &str = "id,listing_url,address,is_active";

/// PostgREST client for a Supabase project, authenticated with the service
/// role key.
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    http: Client,
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = env_opt("SUPABASE_URL")?;
        let service_key = env_opt("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|| env_opt("SUPABASE_SERVICE_KEY"))
            .or_else(|| env_opt("SUPABASE_KEY"))?;
        Some(Self::new(base_url, service_key, build_client()))
    }

    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>, http: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            http,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/rest/v1/{}", self.base_url, path))
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn select<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, StoreError> {
        rows(self.request(Method::GET, path)).await
    }

    async fn write<B, T>(&self, method: Method, path: &str, body: &B, prefer: &str) -> Result<Vec<T>, StoreError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        rows(
            self.request(method, path)
                .header("Prefer", prefer)
                .json(body),
        )
        .await
    }
}

async fn rows<T: DeserializeOwned>(request: RequestBuilder) -> Result<Vec<T>, StoreError> {
    let response = request
        .send()
        .await
        .map_err(|err| StoreError::Request(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(StoreError::Request(format!("HTTP {status}: {body}")));
    }

    response
        .json()
        .await
        .map_err(|err| StoreError::Deserialize(err.to_string()))
}

/// Builds `table?k=v&...` with every value percent-encoded.
fn table_path(table: &str, params: &[(&str, String)]) -> String {
    if params.is_empty() {
        return table.to_string();
    }
    let query = params
        .iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{table}?{query}")
}

fn listing_query_params(query: &ListingQuery) -> Vec<(&'static str, String)> {
    let mut params = vec![("select", "*".to_string())];
    if let Some(active) = query.active {
        params.push(("is_active", format!("eq.{active}")));
    }
    if let Some(ids) = &query.ids {
        let ids = ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(",");
        params.push(("id", format!("in.({ids})")));
    }
    if let Some(postcode) = &query.postcode_contains {
        params.push(("postcode", format!("ilike.*{postcode}*")));
    }
    if let Some(city) = &query.city_contains {
        params.push(("city", format!("ilike.*{city}*")));
    }
    if let Some(max_price) = query.max_price {
        params.push(("price_numeric", format!("lte.{max_price}")));
    }
    if query.newest_first {
        params.push(("order", "created_at.desc".to_string()));
    }
    if query.offset > 0 {
        params.push(("offset", query.offset.to_string()));
    }
    if let Some(limit) = query.limit {
        params.push(("limit", limit.to_string()));
    }
    params
}

#[async_trait]
impl ListingRepository for SupabaseClient {
    async fn find_listing_by_url(&self, url: &str) -> Result<Option<ListingRef>, StoreError> {
        let path = table_path(
            LISTINGS,
            &[
                ("listing_url", format!("eq.{url}")),
                ("select", LISTING_REF_COLUMNS.to_string()),
                ("limit", "1".to_string()),
            ],
        );
        let mut found: Vec<ListingRef> = self.select(&path).await?;
        Ok(found.pop())
    }

    async fn get_listing(&self, id: Uuid) -> Result<Option<Listing>, StoreError> {
        let path = table_path(
            LISTINGS,
            &[
                ("id", format!("eq.{id}")),
                ("select", "*".to_string()),
                ("limit", "1".to_string()),
            ],
        );
        let mut found: Vec<Listing> = self.select(&path).await?;
        Ok(found.pop())
    }

    async fn insert_listing(&self, listing: &NewListing) -> Result<Listing, StoreError> {
        let mut inserted: Vec<Listing> = self
            .write(Method::POST, LISTINGS, listing, "return=representation")
            .await?;
        inserted.pop().ok_or(StoreError::MissingRow(LISTINGS))
    }

    async fn update_listing(
        &self,
        id: Uuid,
        patch: &ListingPatch,
    ) -> Result<Option<Listing>, StoreError> {
        let path = table_path(LISTINGS, &[("id", format!("eq.{id}"))]);
        let mut updated: Vec<Listing> = self
            .write(Method::PATCH, &path, patch, "return=representation")
            .await?;
        Ok(updated.pop())
    }

    async fn delete_listing(&self, id: Uuid) -> Result<bool, StoreError> {
        let path = table_path(LISTINGS, &[("id", format!("eq.{id}"))]);
        let removed: Vec<ListingRef> = rows(
            self.request(Method::DELETE, &path)
                .header("Prefer", "return=representation"),
        )
        .await?;
        Ok(!removed.is_empty())
    }

    async fn query_listings(&self, query: &ListingQuery) -> Result<Vec<Listing>, StoreError> {
        let path = table_path(LISTINGS, &listing_query_params(query));
        self.select(&path).await
    }
}

#[async_trait]
impl ClassificationRepository for SupabaseClient {
    async fn find_classification(
        &self,
        listing_id: Uuid,
    ) -> Result<Option<Classification>, StoreError> {
        let path = table_path(
            CLASSIFICATIONS,
            &[
                ("listing_id", format!("eq.{listing_id}")),
                ("select", "*".to_string()),
                ("limit", "1".to_string()),
            ],
        );
        let mut found: Vec<Classification> = self.select(&path).await?;
        Ok(found.pop())
    }

    async fn insert_classification(
        &self,
        classification: &NewClassification,
    ) -> Result<Classification, StoreError> {
        let mut inserted: Vec<Classification> = self
            .write(
                Method::POST,
                CLASSIFICATIONS,
                classification,
                "return=representation",
            )
            .await?;
        inserted.pop().ok_or(StoreError::MissingRow(CLASSIFICATIONS))
    }

    async fn update_classification(
        &self,
        classification: &NewClassification,
    ) -> Result<Classification, StoreError> {
        let path = table_path(
            CLASSIFICATIONS,
            &[("listing_id", format!("eq.{}", classification.listing_id))],
        );
        let mut updated: Vec<Classification> = self
            .write(Method::PATCH, &path, classification, "return=representation")
            .await?;
        updated.pop().ok_or(StoreError::MissingRow(CLASSIFICATIONS))
    }

    async fn list_classifications(&self) -> Result<Vec<Classification>, StoreError> {
        let path = table_path(CLASSIFICATIONS, &[("select", "*".to_string())]);
        self.select(&path).await
    }
}

#[async_trait]
impl PostcodeStatsRepository for SupabaseClient {
    async fn get_postcode_stats(
        &self,
        postcode: &str,
    ) -> Result<Option<PostcodeStats>, StoreError> {
        let path = table_path(
            POSTCODE_STATS,
            &[
                ("postcode", format!("eq.{postcode}")),
                ("select", "*".to_string()),
                ("limit", "1".to_string()),
            ],
        );
        let mut found: Vec<PostcodeStats> = self.select(&path).await?;
        Ok(found.pop())
    }

    async fn upsert_postcode_stats(
        &self,
        stats: &PostcodeStats,
    ) -> Result<PostcodeStats, StoreError> {
        let path = table_path(POSTCODE_STATS, &[("on_conflict", "postcode".to_string())]);
        let mut written: Vec<PostcodeStats> = self
            .write(
                Method::POST,
                &path,
                stats,
                "resolution=merge-duplicates,return=representation",
            )
            .await?;
        written.pop().ok_or(StoreError::MissingRow(POSTCODE_STATS))
    }

    async fn list_postcode_stats(&self) -> Result<Vec<PostcodeStats>, StoreError> {
        let path = table_path(
            POSTCODE_STATS,
            &[("select", "*".to_string()), ("order", "postcode.asc".to_string())],
        );
        self.select(&path).await
    }
}
