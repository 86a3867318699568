//! Per-axis feature extraction from raw customer history.
//!
//! The same extractor is used for the discovery population and for scoring a
//! single customer, so both live in the identical feature space.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::axis::Axis;
use crate::error::{SegResult, SegmentationError};
use crate::history::{CustomerHistory, Order, OrderItem, SupportTicket};

const SECONDS_PER_DAY: f64 = 86_400.0;
const RECENT_WINDOW_DAYS: i64 = 90;
const EVENING_START_HOUR: u32 = 18;
const NEGATIVE_SENTIMENT: f64 = 0.0;

/// Fixed-width feature values for one customer on one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    customer_id: String,
    axis: Axis,
    values: Vec<f64>,
}

impl FeatureVector {
    /// Build a vector from values in the axis's feature order.
    ///
    /// # Errors
    /// `InvalidParameter` if the width does not match the axis or a value is
    /// not finite.
    pub fn new(customer_id: impl Into<String>, axis: Axis, values: Vec<f64>) -> SegResult<Self> {
        if values.len() != axis.dimension() {
            return Err(SegmentationError::invalid_parameter(format!(
                "{} expects {} features, got {}",
                axis,
                axis.dimension(),
                values.len()
            )));
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(SegmentationError::invalid_parameter(format!(
                "non-finite feature value {} on {}",
                bad, axis
            )));
        }
        Ok(Self {
            customer_id: customer_id.into(),
            axis,
            values,
        })
    }

    /// The all-default vector used when a customer has no usable history.
    pub fn defaults(customer_id: impl Into<String>, axis: Axis) -> Self {
        Self {
            customer_id: customer_id.into(),
            axis,
            values: vec![0.0; axis.dimension()],
        }
    }

    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    pub fn names(&self) -> &'static [&'static str] {
        self.axis.feature_names()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn view(&self) -> ArrayView1<'_, f64> {
        ArrayView1::from(self.values.as_slice())
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names()
            .iter()
            .position(|n| *n == name)
            .map(|i| self.values[i])
    }

    /// Iterate `(feature_name, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        self.names().iter().copied().zip(self.values.iter().copied())
    }
}

/// Extracts feature vectors relative to a fixed reference instant.
#[derive(Debug, Clone, Copy)]
pub struct FeatureExtractor {
    as_of: DateTime<Utc>,
}

impl FeatureExtractor {
    /// Records after `as_of` are ignored, so the same history always yields
    /// the same features for the same reference instant.
    pub fn new(as_of: DateTime<Utc>) -> Self {
        Self { as_of }
    }

    pub fn as_of(&self) -> DateTime<Utc> {
        self.as_of
    }

    /// Extract one axis for one customer.
    ///
    /// A customer without orders gets the all-default vector. The only error
    /// is a corrupt history.
    pub fn extract(&self, axis: Axis, history: &CustomerHistory) -> SegResult<FeatureVector> {
        history.validate()?;
        Ok(self.extract_validated(axis, &HistoryView::new(history, self.as_of)))
    }

    /// Extract several axes, validating the history once.
    pub fn extract_axes(
        &self,
        axes: &[Axis],
        history: &CustomerHistory,
    ) -> SegResult<BTreeMap<Axis, FeatureVector>> {
        history.validate()?;
        let view = HistoryView::new(history, self.as_of);
        Ok(axes
            .iter()
            .map(|axis| (*axis, self.extract_validated(*axis, &view)))
            .collect())
    }

    fn extract_validated(&self, axis: Axis, view: &HistoryView<'_>) -> FeatureVector {
        if view.all_orders.is_empty() {
            return FeatureVector::defaults(view.customer_id, axis);
        }

        let mut values = match axis {
            Axis::PurchaseFrequency => purchase_frequency(view),
            Axis::SpendingLevel => spending_level(view),
            Axis::CategoryExploration => category_exploration(view),
            Axis::PriceSensitivity => price_sensitivity(view),
            Axis::ShoppingTiming => shopping_timing(view),
            Axis::LoyaltyTrajectory => loyalty_trajectory(view),
            Axis::BasketComposition => basket_composition(view),
            Axis::ProductAffinity => product_affinity(view),
            Axis::ReturnBehavior => return_behavior(view),
            Axis::FulfillmentExperience => fulfillment_experience(view),
            Axis::ChannelPreference => channel_preference(view),
            Axis::PaymentBehavior => payment_behavior(view),
            Axis::EngagementMomentum => engagement_momentum(view),
            Axis::SupportHistory => support_history(view),
        };

        for (name, value) in axis.feature_names().iter().zip(values.iter_mut()) {
            if !value.is_finite() {
                debug!(
                    customer = view.customer_id,
                    %axis,
                    feature = *name,
                    "Replacing non-finite feature with default"
                );
                *value = 0.0;
            }
        }

        FeatureVector {
            customer_id: view.customer_id.to_string(),
            axis,
            values,
        }
    }
}

/// History restricted to the reference instant, with orders sorted.
struct HistoryView<'a> {
    customer_id: &'a str,
    as_of: DateTime<Utc>,
    /// Every order up to `as_of`, including cancelled ones.
    all_orders: Vec<&'a Order>,
    /// Non-cancelled orders, chronological.
    active: Vec<&'a Order>,
    items_by_order: HashMap<&'a str, Vec<&'a OrderItem>>,
    tickets: Vec<&'a SupportTicket>,
}

impl<'a> HistoryView<'a> {
    fn new(history: &'a CustomerHistory, as_of: DateTime<Utc>) -> Self {
        let all_orders: Vec<&Order> = history
            .orders_chronological()
            .into_iter()
            .filter(|o| o.placed_at <= as_of)
            .collect();
        let active: Vec<&Order> = all_orders.iter().copied().filter(|o| !o.cancelled).collect();

        let mut items_by_order: HashMap<&str, Vec<&OrderItem>> = HashMap::new();
        for item in &history.items {
            items_by_order
                .entry(item.order_id.as_str())
                .or_default()
                .push(item);
        }

        Self {
            customer_id: &history.customer_id,
            as_of,
            all_orders,
            active,
            items_by_order,
            tickets: history
                .tickets
                .iter()
                .filter(|t| t.created_at <= as_of)
                .collect(),
        }
    }

    /// Items of non-cancelled orders.
    fn active_items(&self) -> impl Iterator<Item = &'a OrderItem> + '_ {
        self.active
            .iter()
            .filter_map(|o| self.items_by_order.get(o.order_id.as_str()))
            .flat_map(|items| items.iter().copied())
    }

    fn gaps_in_days(&self) -> Vec<f64> {
        self.active
            .windows(2)
            .map(|pair| days_between(pair[0].placed_at, pair[1].placed_at))
            .collect()
    }

    fn recency_days(&self) -> Option<f64> {
        self.active
            .last()
            .map(|o| days_between(o.placed_at, self.as_of).max(0.0))
    }
}

fn purchase_frequency(view: &HistoryView<'_>) -> Vec<f64> {
    let gaps = view.gaps_in_days();
    let (mean_gap, regularity) = if gaps.is_empty() {
        (0.0, 0.0)
    } else {
        let mean_gap = mean(&gaps);
        let cv = coefficient_of_variation(&gaps);
        (mean_gap, 1.0 / (1.0 + cv))
    };
    vec![view.active.len() as f64, mean_gap, regularity]
}

fn spending_level(view: &HistoryView<'_>) -> Vec<f64> {
    let totals: Vec<f64> = view.active.iter().map(|o| o.total).collect();
    let max = totals.iter().copied().fold(0.0, f64::max);
    vec![mean(&totals), max, coefficient_of_variation(&totals)]
}

fn category_exploration(view: &HistoryView<'_>) -> Vec<f64> {
    let mut units_by_category: BTreeMap<&str, f64> = BTreeMap::new();
    for item in view.active_items() {
        let category = item.category.as_deref().unwrap_or("uncategorized");
        *units_by_category.entry(category).or_insert(0.0) += item.quantity as f64;
    }

    let total: f64 = units_by_category.values().sum();
    if total <= 0.0 {
        return vec![0.0; 3];
    }

    let entropy = units_by_category
        .values()
        .map(|units| units / total)
        .filter(|p| *p > 0.0)
        .map(|p| -p * p.log2())
        .sum::<f64>();
    let top_share = units_by_category.values().copied().fold(0.0, f64::max) / total;

    vec![units_by_category.len() as f64, entropy, top_share]
}

fn price_sensitivity(view: &HistoryView<'_>) -> Vec<f64> {
    let discounted = view.active.iter().filter(|o| o.discount > 0.0).count();
    let rates: Vec<f64> = view
        .active
        .iter()
        .filter(|o| o.total + o.discount > 0.0)
        .map(|o| o.discount / (o.total + o.discount))
        .collect();
    let discounts: Vec<f64> = view.active.iter().map(|o| o.discount).collect();

    vec![
        ratio(discounted, view.active.len()),
        mean(&rates),
        mean(&discounts),
    ]
}

fn shopping_timing(view: &HistoryView<'_>) -> Vec<f64> {
    let weekend = view
        .active
        .iter()
        .filter(|o| matches!(o.placed_at.weekday(), Weekday::Sat | Weekday::Sun))
        .count();
    let evening = view
        .active
        .iter()
        .filter(|o| o.placed_at.hour() >= EVENING_START_HOUR)
        .count();
    let hours: Vec<f64> = view.active.iter().map(|o| o.placed_at.hour() as f64).collect();

    vec![
        ratio(weekend, view.active.len()),
        ratio(evening, view.active.len()),
        std_dev(&hours),
    ]
}

fn loyalty_trajectory(view: &HistoryView<'_>) -> Vec<f64> {
    let (Some(first), Some(recency)) = (view.active.first(), view.recency_days()) else {
        return vec![0.0; 3];
    };
    let tenure = days_between(first.placed_at, view.as_of).max(0.0);

    let spend_trend = if view.active.len() < 2 {
        0.0
    } else {
        // Compare average order value of the later half against the earlier half
        let (early, late) = view.active.split_at(view.active.len() / 2);
        let early_avg = mean(&early.iter().map(|o| o.total).collect::<Vec<_>>());
        let late_avg = mean(&late.iter().map(|o| o.total).collect::<Vec<_>>());
        let denom = early_avg + late_avg;
        if denom > 0.0 {
            (late_avg - early_avg) / denom
        } else {
            0.0
        }
    };

    vec![tenure, recency, spend_trend]
}

fn basket_composition(view: &HistoryView<'_>) -> Vec<f64> {
    let mut units = Vec::new();
    let mut distinct = Vec::new();
    for order in &view.active {
        let Some(items) = view.items_by_order.get(order.order_id.as_str()) else {
            continue;
        };
        units.push(items.iter().map(|i| i.quantity as f64).sum::<f64>());
        distinct.push(
            items
                .iter()
                .map(|i| i.product_id.as_str())
                .collect::<HashSet<_>>()
                .len() as f64,
        );
    }

    let max_units = units.iter().copied().fold(0.0, f64::max);
    vec![mean(&units), mean(&distinct), max_units]
}

fn product_affinity(view: &HistoryView<'_>) -> Vec<f64> {
    let mut orders_by_product: BTreeMap<&str, HashSet<&str>> = BTreeMap::new();
    let mut units_by_product: BTreeMap<&str, f64> = BTreeMap::new();
    for item in view.active_items() {
        orders_by_product
            .entry(item.product_id.as_str())
            .or_default()
            .insert(item.order_id.as_str());
        *units_by_product.entry(item.product_id.as_str()).or_insert(0.0) += item.quantity as f64;
    }

    let distinct = orders_by_product.len();
    let repeated = orders_by_product.values().filter(|o| o.len() >= 2).count();
    let total_units: f64 = units_by_product.values().sum();
    let top_share = if total_units > 0.0 {
        units_by_product.values().copied().fold(0.0, f64::max) / total_units
    } else {
        0.0
    };

    vec![distinct as f64, ratio(repeated, distinct), top_share]
}

fn return_behavior(view: &HistoryView<'_>) -> Vec<f64> {
    let mut units = 0.0;
    let mut returned_units = 0.0;
    let mut value = 0.0;
    let mut returned_value = 0.0;
    let mut orders_with_items = 0usize;
    let mut orders_with_return = 0usize;

    for order in &view.active {
        let Some(items) = view.items_by_order.get(order.order_id.as_str()) else {
            continue;
        };
        orders_with_items += 1;
        if items.iter().any(|i| i.returned) {
            orders_with_return += 1;
        }
        for item in items {
            units += item.quantity as f64;
            value += item.line_value();
            if item.returned {
                returned_units += item.quantity as f64;
                returned_value += item.line_value();
            }
        }
    }

    vec![
        safe_div(returned_units, units),
        safe_div(returned_value, value),
        ratio(orders_with_return, orders_with_items),
    ]
}

fn fulfillment_experience(view: &HistoryView<'_>) -> Vec<f64> {
    let delivery_days: Vec<f64> = view
        .all_orders
        .iter()
        .filter_map(|o| o.delivered_at.map(|d| days_between(o.placed_at, d).max(0.0)))
        .collect();

    let mut promised = 0usize;
    let mut late = 0usize;
    for order in &view.all_orders {
        if let (Some(promised_at), Some(delivered_at)) = (order.promised_at, order.delivered_at) {
            promised += 1;
            if delivered_at > promised_at {
                late += 1;
            }
        }
    }

    let cancelled = view.all_orders.iter().filter(|o| o.cancelled).count();

    vec![
        mean(&delivery_days),
        ratio(late, promised),
        ratio(cancelled, view.all_orders.len()),
    ]
}

fn channel_preference(view: &HistoryView<'_>) -> Vec<f64> {
    let mut by_channel: HashMap<String, usize> = HashMap::new();
    for order in &view.active {
        if let Some(channel) = &order.channel {
            *by_channel.entry(channel.to_ascii_lowercase()).or_insert(0) += 1;
        }
    }

    let mobile: usize = by_channel
        .iter()
        .filter(|(c, _)| c.contains("mobile") || c.contains("app"))
        .map(|(_, n)| n)
        .sum();
    let with_channel: usize = by_channel.values().sum();
    let primary = by_channel.values().copied().max().unwrap_or(0);

    vec![
        ratio(mobile, view.active.len()),
        by_channel.len() as f64,
        ratio(primary, with_channel),
    ]
}

fn payment_behavior(view: &HistoryView<'_>) -> Vec<f64> {
    let methods: HashSet<String> = view
        .active
        .iter()
        .filter_map(|o| o.payment_method.as_ref())
        .map(|m| m.to_ascii_lowercase())
        .collect();
    let installments = view.active.iter().filter(|o| o.installments).count();
    let failed = view.all_orders.iter().filter(|o| o.payment_failed).count();

    vec![
        methods.len() as f64,
        ratio(installments, view.active.len()),
        ratio(failed, view.all_orders.len()),
    ]
}

fn engagement_momentum(view: &HistoryView<'_>) -> Vec<f64> {
    let window_start = view.as_of - Duration::days(RECENT_WINDOW_DAYS);
    let recent: Vec<&&Order> = view
        .active
        .iter()
        .filter(|o| o.placed_at >= window_start)
        .collect();

    let total_spend: f64 = view.active.iter().map(|o| o.total).sum();
    let recent_spend: f64 = recent.iter().map(|o| o.total).sum();

    let gaps = view.gaps_in_days();
    let recency_to_gap = match view.recency_days() {
        Some(recency) if !gaps.is_empty() => safe_div(recency, mean(&gaps)),
        _ => 0.0,
    };

    vec![
        recent.len() as f64,
        safe_div(recent_spend, total_spend),
        recency_to_gap,
    ]
}

fn support_history(view: &HistoryView<'_>) -> Vec<f64> {
    let tickets = &view.tickets;
    let resolution_hours: Vec<f64> = tickets
        .iter()
        .filter_map(|t| {
            t.resolved_at
                .map(|r| ((r - t.created_at).num_seconds() as f64 / 3600.0).max(0.0))
        })
        .collect();
    let with_sentiment = tickets.iter().filter(|t| t.sentiment.is_some()).count();
    let negative = tickets
        .iter()
        .filter(|t| t.sentiment.is_some_and(|s| s < NEGATIVE_SENTIMENT))
        .count();
    let escalated = tickets.iter().filter(|t| t.escalated).count();

    vec![
        tickets.len() as f64,
        ratio(tickets.len(), view.all_orders.len()),
        mean(&resolution_hours),
        ratio(negative, with_sentiment),
        ratio(escalated, tickets.len()),
    ]
}

fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / SECONDS_PER_DAY
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn safe_div(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Population standard deviation; zero for fewer than two values.
fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

fn coefficient_of_variation(values: &[f64]) -> f64 {
    safe_div(std_dev(values), mean(values))
}
