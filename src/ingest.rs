//! Pre-ingestion guard for listing payloads.
//!
//! Rules run in a fixed order: required fields, URL shape, source detection
//! from the URL host, source enum, address length, price text. A listing whose
//! URL already exists is rejected separately with the stored listing's
//! identity so callers can update instead of retrying the create.

use crate::models::{ListingDraft, ListingPatch, ListingRef, ListingSource, NewListing};
use crate::pricing::parse_price;
use crate::probability::normalize_postcode;
use crate::store::{ListingRepository, StoreError};
use reqwest::Url;
use thiserror::Error;
use tracing::debug;

const MIN_ADDRESS_CHARS: usize = 5;

const KNOWN_PORTALS: &[(&str, ListingSource)] = &[
    ("rightmove.co.uk", ListingSource::Rightmove),
    ("zoopla.co.uk", ListingSource::Zoopla),
    ("espc.com", ListingSource::Espc),
    ("s1homes.com", ListingSource::S1homes),
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid source `{0}`. Must be one of: rightmove, zoopla, espc, s1homes, onthemarket, agent, other")]
    InvalidSource(String),
    #[error("Address must be at least 5 characters")]
    AddressTooShort,
    #[error("Price text is required")]
    MissingPrice,
    #[error("price_numeric must be non-negative")]
    NegativePrice,
    #[error("Invalid agent URL: {0}")]
    InvalidAgentUrl(String),
}

#[derive(Debug, Error)]
pub enum IngestRejection {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("Listing already exists")]
    Duplicate(ListingRef),
    #[error("duplicate lookup failed: {0}")]
    Store(#[from] StoreError),
}

/// Validates a draft, rejects duplicates by exact URL match and attaches a
/// parsed numeric price when the caller did not supply one.
pub async fn admit<S>(
    store: &S,
    draft: ListingDraft,
    owner: Option<String>,
) -> Result<NewListing, IngestRejection>
where
    S: ListingRepository + ?Sized,
{
    let mut listing = validate_draft(draft, owner)?;

    if let Some(existing) = store.find_listing_by_url(&listing.listing_url).await? {
        debug!(
            target = "fixedprice.ingest",
            listing_url = %listing.listing_url,
            existing_id = %existing.id,
            "duplicate_listing_rejected"
        );
        return Err(IngestRejection::Duplicate(existing));
    }

    if listing.price_numeric.is_none() {
        listing.price_numeric = parse_price(&listing.price_raw);
    }

    Ok(listing)
}

pub fn validate_draft(
    draft: ListingDraft,
    owner: Option<String>,
) -> Result<NewListing, ValidationError> {
    let listing_url = required(&draft.listing_url, "listing_url")?;
    let declared_source = required(&draft.source, "source")?;
    let address = required(&draft.address, "address")?;
    let price_raw = required(&draft.price_raw, "price_raw")?;

    let url = parse_listing_url(listing_url)?;
    let source = resolve_source(declared_source, &url)?;

    let address = address.trim();
    if address.chars().count() < MIN_ADDRESS_CHARS {
        return Err(ValidationError::AddressTooShort);
    }

    let price_raw = price_raw.trim();
    if price_raw.is_empty() {
        return Err(ValidationError::MissingPrice);
    }

    if draft.price_numeric.is_some_and(|value| value < 0.0) {
        return Err(ValidationError::NegativePrice);
    }

    let agent_url = non_blank(draft.agent_url);
    if let Some(agent_url) = &agent_url {
        parse_listing_url(agent_url)
            .map_err(|_| ValidationError::InvalidAgentUrl(agent_url.clone()))?;
    }

    Ok(NewListing {
        listing_url: listing_url.trim().to_string(),
        source,
        address: address.to_string(),
        postcode: draft
            .postcode
            .as_deref()
            .map(normalize_postcode)
            .filter(|value| !value.is_empty()),
        city: non_blank(draft.city),
        region: non_blank(draft.region),
        price_raw: price_raw.to_string(),
        price_numeric: draft.price_numeric,
        description: non_blank(draft.description),
        agent_name: non_blank(draft.agent_name),
        agent_url,
        image_url: non_blank(draft.image_url),
        extra_image_urls: draft.extra_image_urls.map(|urls| {
            urls.into_iter()
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty())
                .collect()
        }),
        is_active: draft.is_active.unwrap_or(true),
        created_by_user_id: owner,
    })
}

/// Applies the guard's field rules to a partial update. Only present fields
/// are checked; `updated_at` is left to the caller.
pub fn validate_patch(patch: &mut ListingPatch) -> Result<(), ValidationError> {
    let detected = match patch.listing_url.as_deref() {
        Some(raw) => {
            let url = parse_listing_url(raw)?;
            patch.listing_url = Some(raw.trim().to_string());
            Some(detect_source(&url))
        }
        None => None,
    };

    let source = match (detected, patch.source.as_deref()) {
        (Some(found), _) if found != ListingSource::Other => Some(found),
        (_, Some(declared)) => Some(
            ListingSource::from_label(declared)
                .ok_or_else(|| ValidationError::InvalidSource(declared.trim().to_string()))?,
        ),
        _ => None,
    };
    if let Some(source) = source {
        patch.source = Some(source.as_str().to_string());
    }

    if let Some(address) = patch.address.as_deref() {
        let address = address.trim();
        if address.chars().count() < MIN_ADDRESS_CHARS {
            return Err(ValidationError::AddressTooShort);
        }
        patch.address = Some(address.to_string());
    }

    if let Some(price_raw) = patch.price_raw.as_deref() {
        let price_raw = price_raw.trim();
        if price_raw.is_empty() {
            return Err(ValidationError::MissingPrice);
        }
        patch.price_raw = Some(price_raw.to_string());
    }

    if patch.price_numeric.is_some_and(|value| value < 0.0) {
        return Err(ValidationError::NegativePrice);
    }

    if let Some(agent_url) = patch.agent_url.as_deref().filter(|v| !v.trim().is_empty()) {
        parse_listing_url(agent_url)
            .map_err(|_| ValidationError::InvalidAgentUrl(agent_url.to_string()))?;
    }

    if let Some(postcode) = patch.postcode.as_deref() {
        patch.postcode = Some(normalize_postcode(postcode));
    }

    Ok(())
}

/// Accepts http(s) URLs with a host.
pub fn parse_listing_url(raw: &str) -> Result<Url, ValidationError> {
    let trimmed = raw.trim();
    let parsed = Url::parse(trimmed).map_err(|_| ValidationError::InvalidUrl(trimmed.into()))?;
    let scheme_ok = matches!(parsed.scheme(), "http" | "https");
    let has_host = parsed.host_str().is_some_and(|host| !host.is_empty());
    if !scheme_ok || !has_host {
        return Err(ValidationError::InvalidUrl(trimmed.into()));
    }
    Ok(parsed)
}

/// Maps a URL host onto a known property portal, `Other` when none match.
pub fn detect_source(url: &Url) -> ListingSource {
    let Some(host) = url.host_str() else {
        return ListingSource::Other;
    };
    let host = host.to_lowercase();
    KNOWN_PORTALS
        .iter()
        .find(|(domain, _)| host == *domain || host.ends_with(&format!(".{domain}")))
        .map(|(_, source)| *source)
        .unwrap_or(ListingSource::Other)
}

/// Detection wins over the declared source unless it lands in the generic
/// `other` bucket.
fn resolve_source(declared: &str, url: &Url) -> Result<ListingSource, ValidationError> {
    let detected = detect_source(url);
    let declared_label = declared.trim().to_lowercase();
    if detected != ListingSource::Other && detected.as_str() != declared_label {
        debug!(
            target = "fixedprice.ingest",
            declared = %declared_label,
            detected = detected.as_str(),
            "source_overridden_by_url"
        );
        return Ok(detected);
    }
    ListingSource::from_label(&declared_label)
        .ok_or_else(|| ValidationError::InvalidSource(declared.trim().to_string()))
}

fn required<'a>(
    value: &'a Option<String>,
    field: &'static str,
) -> Result<&'a str, ValidationError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or(ValidationError::MissingField(field))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
