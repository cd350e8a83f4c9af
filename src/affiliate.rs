//! Monetized outbound links for product references.

use urlencoding::encode;

const AWIN_REDIRECT: &str = "https://www.awin1.com/cread.php";
const ZALANDO_MERCHANT_ID: &str = "12345";
const ZALANDO_PARTNER_ID: &str = "DE_AFF_12345";
const HM_PARTNER_ID: &str = "HM_PARTNER_99";
const HM_UTM_SOURCE: &str = "vogue_ai";
const GENERIC_TAG: &str = "vogue-ai-21";
const GENERIC_UTM_MEDIUM: &str = "ai_stylist";

/// Link returned when there is nothing to link to.
pub const PLACEHOLDER_LINK: &str = "#";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Partner {
    Zalando,
    HennesMauritz,
    Generic,
}

// Order matters: a brand mentioning both networks goes through Zalando.
fn partner_for(brand: &str) -> Partner {
    let brand = brand.to_lowercase();
    if brand.contains("zalando") {
        Partner::Zalando
    } else if brand.contains("h&m") || brand.contains("hm") {
        Partner::HennesMauritz
    } else {
        Partner::Generic
    }
}

/// Map a merchant URL to its affiliate form for the given brand.
pub fn resolve(original_url: &str, brand: &str) -> String {
    if original_url.is_empty() {
        return PLACEHOLDER_LINK.to_string();
    }

    match partner_for(brand) {
        Partner::Zalando => format!(
            "{AWIN_REDIRECT}?awinmid={ZALANDO_MERCHANT_ID}&awinaffid={ZALANDO_PARTNER_ID}&ued={}",
            encode(original_url)
        ),
        Partner::HennesMauritz => append_query(
            original_url,
            &format!("affiliate_id={HM_PARTNER_ID}&utm_source={HM_UTM_SOURCE}"),
        ),
        Partner::Generic => append_query(
            original_url,
            &format!("tag={GENERIC_TAG}&utm_medium={GENERIC_UTM_MEDIUM}"),
        ),
    }
}

fn append_query(url: &str, params: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{params}")
}
