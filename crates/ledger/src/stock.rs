use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult};

/// Ledger key: one product at one location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockKey {
    pub product_id: String,
    pub location_id: String,
}

impl StockKey {
    /// Build a key, trimming both parts and rejecting blanks.
    pub fn new(product_id: impl AsRef<str>, location_id: impl AsRef<str>) -> DomainResult<Self> {
        let product_id = product_id.as_ref().trim();
        let location_id = location_id.as_ref().trim();
        if product_id.is_empty() {
            return Err(DomainError::validation("product_id cannot be empty"));
        }
        if location_id.is_empty() {
            return Err(DomainError::validation("location_id cannot be empty"));
        }
        Ok(Self {
            product_id: product_id.to_string(),
            location_id: location_id.to_string(),
        })
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}@{}", self.product_id, self.location_id)
    }
}

/// Authoritative quantity record for one (product, location).
///
/// Records are created lazily with zero quantities and are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    pub product_id: String,
    pub location_id: String,
    pub quantity_on_hand: i64,
    pub quantity_reserved: i64,
    pub updated_at: DateTime<Utc>,
}

impl StockRecord {
    /// Fresh zero-quantity record.
    pub fn empty(key: &StockKey, now: DateTime<Utc>) -> Self {
        Self {
            product_id: key.product_id.clone(),
            location_id: key.location_id.clone(),
            quantity_on_hand: 0,
            quantity_reserved: 0,
            updated_at: now,
        }
    }

    pub fn key(&self) -> StockKey {
        StockKey {
            product_id: self.product_id.clone(),
            location_id: self.location_id.clone(),
        }
    }

    pub fn available(&self) -> i64 {
        self.quantity_on_hand - self.quantity_reserved
    }

    /// Quantity-on-hand after applying `delta`, refusing to go negative.
    pub fn quantity_after(&self, delta: i64) -> DomainResult<i64> {
        let after = self
            .quantity_on_hand
            .checked_add(delta)
            .ok_or_else(|| DomainError::validation("quantity overflow"))?;
        if after < 0 {
            return Err(DomainError::insufficient_stock(self.quantity_on_hand, -delta));
        }
        Ok(after)
    }

    /// Apply `delta` in place (only ever called inside a store's atomic unit).
    pub fn apply_delta(&mut self, delta: i64, now: DateTime<Utc>) -> DomainResult<()> {
        self.quantity_on_hand = self.quantity_after(delta)?;
        self.updated_at = now;
        Ok(())
    }

    pub fn status(&self) -> LocationStatus {
        LocationStatus {
            product_id: self.product_id.clone(),
            location_id: self.location_id.clone(),
            on_hand: self.quantity_on_hand,
            reserved: self.quantity_reserved,
            available: self.available(),
            updated_at: self.updated_at,
        }
    }
}

/// Stock status for a single location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationStatus {
    pub product_id: String,
    pub location_id: String,
    pub on_hand: i64,
    pub reserved: i64,
    pub available: i64,
    pub updated_at: DateTime<Utc>,
}

/// Product-wide stock status aggregated across every known location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductStatus {
    pub product_id: String,
    pub total_on_hand: i64,
    pub total_reserved: i64,
    pub total_available: i64,
    pub location_count: usize,
    pub locations: Vec<LocationStatus>,
}

impl ProductStatus {
    /// Aggregate per-location statuses. Records of other products are ignored.
    ///
    /// Fails with a validation error when a total does not fit in an `i64`.
    pub fn aggregate(
        product_id: impl Into<String>,
        locations: impl IntoIterator<Item = LocationStatus>,
    ) -> DomainResult<Self> {
        let product_id = product_id.into();
        let mut locations: Vec<LocationStatus> = locations
            .into_iter()
            .filter(|l| l.product_id == product_id)
            .collect();
        locations.sort_by(|a, b| a.location_id.cmp(&b.location_id));

        let total_on_hand = checked_total(locations.iter().map(|l| l.on_hand))?;
        let total_reserved = checked_total(locations.iter().map(|l| l.reserved))?;
        let total_available = checked_total(locations.iter().map(|l| l.available))?;

        Ok(Self {
            product_id,
            total_on_hand,
            total_reserved,
            total_available,
            location_count: locations.len(),
            locations,
        })
    }
}

fn checked_total(mut values: impl Iterator<Item = i64>) -> DomainResult<i64> {
    values.try_fold(0_i64, |acc, v| {
        acc.checked_add(v)
            .ok_or_else(|| DomainError::validation("stock total overflow"))
    })
}
