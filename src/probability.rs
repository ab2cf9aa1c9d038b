use crate::models::{Listing, ProbabilityBand, SuccessProbability};
use crate::store::{PostcodeStatsRepository, StoreError};

pub const NO_POSTCODE: &str = "no postcode provided";
pub const NO_AREA_DATA: &str = "no historical data for this area";

/// Strips all whitespace and uppercases, so `"EH1 1AA"` and `"eh11aa"` share
/// a key.
pub fn normalize_postcode(raw: &str) -> String {
    raw.chars()
        .filter(|ch| !ch.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Bands a price against an area's average sale-over-asking percentage.
/// A budget below the asking price is `zero` regardless of the area.
pub fn band_for(asking_price: f64, budget: f64, avg_over_asking: f64) -> ProbabilityBand {
    if asking_price > budget {
        return ProbabilityBand::Zero;
    }
    if avg_over_asking <= 5.0 {
        ProbabilityBand::High
    } else if avg_over_asking <= 10.0 {
        ProbabilityBand::Medium
    } else {
        ProbabilityBand::Low
    }
}

/// Estimates how likely a buyer is to secure the listing at its asking price.
///
/// Exactly one stats lookup is made, and none when the listing has no
/// postcode. Without a budget the buyer is assumed to afford the asking price
/// exactly. A missing asking price is treated as zero.
pub async fn estimate<S>(
    stats: &S,
    postcode: Option<&str>,
    asking_price: Option<f64>,
    budget: Option<f64>,
) -> Result<SuccessProbability, StoreError>
where
    S: PostcodeStatsRepository + ?Sized,
{
    let Some(postcode) = postcode
        .map(normalize_postcode)
        .filter(|value| !value.is_empty())
    else {
        return Ok(SuccessProbability::unknown(NO_POSTCODE));
    };

    let Some(area) = stats.get_postcode_stats(&postcode).await? else {
        return Ok(SuccessProbability::unknown(NO_AREA_DATA));
    };

    let asking_price = asking_price.unwrap_or(0.0);
    let budget = budget.unwrap_or(asking_price);
    let probability = band_for(asking_price, budget, area.avg_sale_over_asking);

    Ok(SuccessProbability {
        probability,
        reason: (probability == ProbabilityBand::Zero).then(|| "budget below asking price".to_string()),
        avg_over_asking: Some(area.avg_sale_over_asking),
        friendliness: Some(area.fixed_price_friendliness),
    })
}

pub async fn estimate_for_listing<S>(
    stats: &S,
    listing: &Listing,
    budget: Option<f64>,
) -> Result<SuccessProbability, StoreError>
where
    S: PostcodeStatsRepository + ?Sized,
{
    estimate(
        stats,
        listing.postcode.as_deref(),
        listing.price_numeric,
        budget,
    )
    .await
}
