//! The behavioral axis catalog.
//!
//! Each axis is clustered independently of all others. The declaration order
//! of [`Axis`] is the canonical order for every ordered output (profile
//! iteration, interpretation strings, reports), so `Ord` is derived from it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SegmentationError;

/// One independent behavioral dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    PurchaseFrequency,
    SpendingLevel,
    CategoryExploration,
    PriceSensitivity,
    ShoppingTiming,
    LoyaltyTrajectory,
    BasketComposition,
    ProductAffinity,
    ReturnBehavior,
    FulfillmentExperience,
    ChannelPreference,
    PaymentBehavior,
    EngagementMomentum,
    SupportHistory,
}

/// Which team the axis was designed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisCategory {
    Marketing,
    Support,
}

/// Upstream data an axis needs before it can be extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Orders,
    Items,
    Tickets,
}

/// What upstream data a store actually has. Orders are always present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCapabilities {
    pub has_item_data: bool,
    pub has_ticket_data: bool,
}

impl StoreCapabilities {
    /// A store with every data source wired up.
    pub fn full() -> Self {
        Self {
            has_item_data: true,
            has_ticket_data: true,
        }
    }

    /// A store without a ticketing integration.
    pub fn without_tickets() -> Self {
        Self {
            has_item_data: true,
            has_ticket_data: false,
        }
    }

    pub fn provides(&self, source: DataSource) -> bool {
        match source {
            DataSource::Orders => true,
            DataSource::Items => self.has_item_data,
            DataSource::Tickets => self.has_ticket_data,
        }
    }
}

impl Default for StoreCapabilities {
    fn default() -> Self {
        Self::full()
    }
}

const ORDERS: &[DataSource] = &[DataSource::Orders];
const ORDERS_ITEMS: &[DataSource] = &[DataSource::Orders, DataSource::Items];
const ORDERS_TICKETS: &[DataSource] = &[DataSource::Orders, DataSource::Tickets];

impl Axis {
    /// Every axis in declared order.
    pub const ALL: [Axis; 14] = [
        Axis::PurchaseFrequency,
        Axis::SpendingLevel,
        Axis::CategoryExploration,
        Axis::PriceSensitivity,
        Axis::ShoppingTiming,
        Axis::LoyaltyTrajectory,
        Axis::BasketComposition,
        Axis::ProductAffinity,
        Axis::ReturnBehavior,
        Axis::FulfillmentExperience,
        Axis::ChannelPreference,
        Axis::PaymentBehavior,
        Axis::EngagementMomentum,
        Axis::SupportHistory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Axis::PurchaseFrequency => "purchase_frequency",
            Axis::SpendingLevel => "spending_level",
            Axis::CategoryExploration => "category_exploration",
            Axis::PriceSensitivity => "price_sensitivity",
            Axis::ShoppingTiming => "shopping_timing",
            Axis::LoyaltyTrajectory => "loyalty_trajectory",
            Axis::BasketComposition => "basket_composition",
            Axis::ProductAffinity => "product_affinity",
            Axis::ReturnBehavior => "return_behavior",
            Axis::FulfillmentExperience => "fulfillment_experience",
            Axis::ChannelPreference => "channel_preference",
            Axis::PaymentBehavior => "payment_behavior",
            Axis::EngagementMomentum => "engagement_momentum",
            Axis::SupportHistory => "support_history",
        }
    }

    /// Ordered feature names consumed by this axis.
    ///
    /// Extraction always produces exactly these names in this order; the
    /// scaler and clusterer rely on the fixed width.
    pub fn feature_names(&self) -> &'static [&'static str] {
        match self {
            Axis::PurchaseFrequency => &[
                "order_count",
                "mean_days_between_orders",
                "purchase_regularity",
            ],
            Axis::SpendingLevel => &["avg_order_value", "max_order_value", "order_value_cv"],
            Axis::CategoryExploration => &[
                "distinct_categories",
                "category_entropy",
                "top_category_share",
            ],
            Axis::PriceSensitivity => &[
                "discounted_order_ratio",
                "avg_discount_rate",
                "avg_order_discount",
            ],
            Axis::ShoppingTiming => &["weekend_order_ratio", "evening_order_ratio", "hour_spread"],
            Axis::LoyaltyTrajectory => &["tenure_days", "recency_days", "spend_trend"],
            Axis::BasketComposition => &[
                "avg_units_per_order",
                "avg_distinct_products_per_order",
                "max_units_per_order",
            ],
            Axis::ProductAffinity => &[
                "distinct_products",
                "repeat_product_ratio",
                "top_product_share",
            ],
            Axis::ReturnBehavior => &[
                "item_return_rate",
                "refund_value_ratio",
                "orders_with_return_ratio",
            ],
            Axis::FulfillmentExperience => &[
                "avg_delivery_days",
                "late_delivery_ratio",
                "cancellation_ratio",
            ],
            Axis::ChannelPreference => &[
                "mobile_order_ratio",
                "distinct_channels",
                "primary_channel_share",
            ],
            Axis::PaymentBehavior => &[
                "distinct_payment_methods",
                "installment_order_ratio",
                "failed_payment_ratio",
            ],
            Axis::EngagementMomentum => &[
                "orders_last_90_days",
                "recent_spend_share",
                "recency_to_gap_ratio",
            ],
            Axis::SupportHistory => &[
                "ticket_count",
                "tickets_per_order",
                "avg_resolution_hours",
                "negative_sentiment_ratio",
                "escalation_ratio",
            ],
        }
    }

    pub fn dimension(&self) -> usize {
        self.feature_names().len()
    }

    /// Candidate segment counts tried during discovery.
    pub fn k_range(&self) -> (usize, usize) {
        match self {
            Axis::ChannelPreference | Axis::PaymentBehavior | Axis::SupportHistory => (2, 5),
            _ => (2, 6),
        }
    }

    pub fn category(&self) -> AxisCategory {
        match self {
            Axis::PurchaseFrequency
            | Axis::SpendingLevel
            | Axis::CategoryExploration
            | Axis::PriceSensitivity
            | Axis::ShoppingTiming
            | Axis::LoyaltyTrajectory
            | Axis::BasketComposition
            | Axis::ProductAffinity => AxisCategory::Marketing,
            _ => AxisCategory::Support,
        }
    }

    pub fn required_sources(&self) -> &'static [DataSource] {
        match self {
            Axis::CategoryExploration
            | Axis::BasketComposition
            | Axis::ProductAffinity
            | Axis::ReturnBehavior => ORDERS_ITEMS,
            Axis::SupportHistory => ORDERS_TICKETS,
            _ => ORDERS,
        }
    }

    /// Whether every data source this axis needs exists for the store.
    pub fn available_for_store(&self, store: &StoreCapabilities) -> bool {
        self.required_sources().iter().all(|s| store.provides(*s))
    }

    /// Axes that can be extracted for the given store, in declared order.
    pub fn available(store: &StoreCapabilities) -> Vec<Axis> {
        Axis::ALL
            .iter()
            .copied()
            .filter(|a| a.available_for_store(store))
            .collect()
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Axis {
    type Err = SegmentationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Axis::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s.trim())
            .ok_or_else(|| SegmentationError::invalid_parameter(format!("unknown axis: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_shape() {
        assert_eq!(Axis::ALL.len(), 14);
        let marketing = Axis::ALL
            .iter()
            .filter(|a| a.category() == AxisCategory::Marketing)
            .count();
        assert_eq!(marketing, 8);

        for axis in Axis::ALL {
            let (k_min, k_max) = axis.k_range();
            assert!(k_min >= 2 && k_min <= k_max, "{} has bad k range", axis);
            assert!(axis.dimension() >= 3);
        }
    }

    #[test]
    fn test_declared_order_is_ord() {
        let mut shuffled = vec![Axis::SupportHistory, Axis::PurchaseFrequency, Axis::ReturnBehavior];
        shuffled.sort();
        assert_eq!(
            shuffled,
            vec![Axis::PurchaseFrequency, Axis::ReturnBehavior, Axis::SupportHistory]
        );
    }

    #[test]
    fn test_support_history_needs_tickets() {
        let no_tickets = StoreCapabilities::without_tickets();
        assert!(!Axis::SupportHistory.available_for_store(&no_tickets));
        assert!(Axis::ReturnBehavior.available_for_store(&no_tickets));
        assert_eq!(Axis::available(&no_tickets).len(), 13);

        let orders_only = StoreCapabilities {
            has_item_data: false,
            has_ticket_data: false,
        };
        assert!(!Axis::BasketComposition.available_for_store(&orders_only));
        assert!(Axis::PurchaseFrequency.available_for_store(&orders_only));
    }

    #[test]
    fn test_parse_and_display() {
        for axis in Axis::ALL {
            assert_eq!(axis.to_string().parse::<Axis>().unwrap(), axis);
        }
        assert!("not_an_axis".parse::<Axis>().is_err());
        assert_eq!(
            serde_json::to_string(&Axis::LoyaltyTrajectory).unwrap(),
            "\"loyalty_trajectory\""
        );
    }
}
