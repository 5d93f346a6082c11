use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Location assigned to descriptors created on first lookup.
pub const UNASSIGNED_LOCATION: &str = "UNASSIGNED";

/// Static descriptive attributes of a product (short code + home location).
///
/// Rarely changes, so it is served from the long-TTL cache instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDescriptor {
    pub product_id: String,
    pub code: String,
    pub default_location: String,
    pub created_at: DateTime<Utc>,
}

impl ProductDescriptor {
    /// Default descriptor for a product seen for the first time.
    pub fn derive(product_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            product_id: product_id.to_string(),
            code: short_code(product_id),
            default_location: UNASSIGNED_LOCATION.to_string(),
            created_at: now,
        }
    }
}

/// Short code: first letter upper-cased, with a few fixed two-letter codes.
fn short_code(product_id: &str) -> String {
    let trimmed = product_id.trim();
    if trimmed.eq_ignore_ascii_case("computadora") {
        return "CO".to_string();
    }
    trimmed
        .chars()
        .next()
        .map(|c| c.to_uppercase().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_codes() {
        let now = Utc::now();
        assert_eq!(ProductDescriptor::derive("zapatos", now).code, "Z");
        assert_eq!(ProductDescriptor::derive("Computadora", now).code, "CO");
        assert_eq!(ProductDescriptor::derive("mesa", now).default_location, UNASSIGNED_LOCATION);
    }
}
