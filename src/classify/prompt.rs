use crate::llm::LlmMessage;

pub const SYSTEM_PROMPT: &str =
    "You are a helpful assistant specialized in Scottish property market analysis.";

const TAXONOMY: &str = r#"
CLASSIFICATION CATEGORIES:

1. EXPLICIT FIXED PRICE ("explicit"):
   The listing clearly and unambiguously states a fixed price with no competitive bidding language.
   Key indicators:
   - "Fixed Price £X" or "Fixed Price: £X"
   - "£X" with no "offers over", "offers invited" or "closing date" language
   - "Price: £X" standing alone
   - "Asking Price: £X" when no competitive indicators are present
   - Statements such as "No offers over", "Fixed at £X", "Price set at £X"
   Examples: "Fixed Price £250,000"; "Asking Price £195,000. No closing date set."

2. LIKELY FIXED PRICE ("likely"):
   The price text uses "offers over", "guide price" or "offers in the region of" language, but the
   description signals that the seller is open to a fixed-price outcome. Buyer-friendly, not guaranteed.
   Key indicators:
   - "Offers Over £X (Fixed Price Considered)" or "Fixed price offers welcome"
   - Quick sale, relocation, urgency or "motivated seller" language
   - "No closing date" alongside offers-over language
   - Flexibility such as "open to offers", "negotiable", "flexible on price"
   Examples: "Offers Over £200,000. Fixed price offers will be considered.";
   "Offers Over £175,000. Seller relocating and seeking quick sale."

3. COMPETITIVE BIDDING ("competitive"):
   A traditional Scottish competitive sale with no fixed-price option.
   Key indicators:
   - "Closing date set" or "Closing date: [date]"
   - "Offers invited" with no fixed-price qualifier
   - "Highly sought after", "Expected to exceed asking price", "Multiple offers expected"
   - "Offers in excess of £X"
   - "Offers Over £X" with no buyer-friendly qualifying language
   Examples: "Offers Over £250,000. Closing date set for [date]."; "Offers invited. Closing date: [date]."

TIE-BREAK RULES:
- Ambiguity between "likely" and "competitive" resolves to "competitive".
- Ambiguity between "explicit" and "likely" resolves to "explicit" only when the signal is unambiguous; otherwise "likely".
- Any mention of a closing date pushes the listing to "competitive" unless unambiguous fixed-price language elsewhere overrides it.

CONFIDENCE SCORING:
- 90-100: very clear indicators, unambiguous language
- 70-89: strong indicators with minor ambiguity
- 50-69: moderate indicators, some ambiguity
- 30-49: weak indicators, significant ambiguity
- 0-29: very unclear, minimal indicators

Respond ONLY with a JSON object with exactly these fields:
{
  "status": "explicit" | "likely" | "competitive",
  "confidence_score": <integer 0-100>,
  "reason": "<concise explanation, at most 2 sentences>"
}
"#;

/// Renders the taxonomy and the listing's text into a single completion
/// request. The rules are static; only the listing section varies.
pub fn build_messages(price_text: &str, description: &str) -> Vec<LlmMessage> {
    let user = format!(
        "You are an expert in the Scottish property market. Classify the pricing strategy of this listing.\n\n\
         LISTING TO ANALYZE:\nPrice: {}\nDescription: {}\n{TAXONOMY}\nJSON:",
        price_text.trim(),
        description.trim(),
    );
    vec![LlmMessage::system(SYSTEM_PROMPT), LlmMessage::user(user)]
}
