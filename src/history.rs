//! Customer order, item and ticket history, and CSV loading using Polars

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{SegResult, SegmentationError};

/// A single placed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub placed_at: DateTime<Utc>,
    /// Amount paid, after discount.
    pub total: f64,
    /// Discount applied to the order.
    pub discount: f64,
    pub channel: Option<String>,
    pub payment_method: Option<String>,
    pub installments: bool,
    pub payment_failed: bool,
    pub cancelled: bool,
    pub promised_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Create a plain, paid, undiscounted order.
    pub fn new(order_id: impl Into<String>, placed_at: DateTime<Utc>, total: f64) -> Self {
        Self {
            order_id: order_id.into(),
            placed_at,
            total,
            discount: 0.0,
            channel: None,
            payment_method: None,
            installments: false,
            payment_failed: false,
            cancelled: false,
            promised_at: None,
            delivered_at: None,
        }
    }

    pub fn with_discount(mut self, discount: f64) -> Self {
        self.discount = discount;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_payment_method(mut self, method: impl Into<String>) -> Self {
        self.payment_method = Some(method.into());
        self
    }

    pub fn with_delivery(
        mut self,
        promised_at: Option<DateTime<Utc>>,
        delivered_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.promised_at = promised_at;
        self.delivered_at = delivered_at;
        self
    }

    pub fn cancelled(mut self) -> Self {
        self.cancelled = true;
        self
    }
}

/// A line item belonging to an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub order_id: String,
    pub product_id: String,
    pub category: Option<String>,
    pub quantity: u32,
    pub unit_price: f64,
    pub returned: bool,
}

impl OrderItem {
    pub fn new(
        order_id: impl Into<String>,
        product_id: impl Into<String>,
        category: Option<&str>,
        quantity: u32,
        unit_price: f64,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            product_id: product_id.into(),
            category: category.map(str::to_string),
            quantity,
            unit_price,
            returned: false,
        }
    }

    pub fn returned(mut self) -> Self {
        self.returned = true;
        self
    }

    pub fn line_value(&self) -> f64 {
        self.quantity as f64 * self.unit_price
    }
}

/// A support ticket raised by the customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportTicket {
    pub ticket_id: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Sentiment in [-1, 1]; negative values are unhappy customers.
    pub sentiment: Option<f64>,
    pub escalated: bool,
}

/// Everything the extractor knows about one customer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerHistory {
    pub customer_id: String,
    pub orders: Vec<Order>,
    pub items: Vec<OrderItem>,
    pub tickets: Vec<SupportTicket>,
}

impl CustomerHistory {
    pub fn new(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            ..Default::default()
        }
    }

    pub fn with_orders(mut self, orders: Vec<Order>) -> Self {
        self.orders = orders;
        self
    }

    pub fn with_items(mut self, items: Vec<OrderItem>) -> Self {
        self.items = items;
        self
    }

    pub fn with_tickets(mut self, tickets: Vec<SupportTicket>) -> Self {
        self.tickets = tickets;
        self
    }

    /// Reject histories that cannot be turned into meaningful features.
    pub fn validate(&self) -> SegResult<()> {
        let mut order_ids = HashSet::with_capacity(self.orders.len());
        for order in &self.orders {
            if !order_ids.insert(order.order_id.as_str()) {
                return Err(SegmentationError::corrupt_history(
                    &self.customer_id,
                    format!("duplicate order id {}", order.order_id),
                ));
            }
            if !order.total.is_finite() || order.total < 0.0 {
                return Err(SegmentationError::corrupt_history(
                    &self.customer_id,
                    format!("order {} has invalid total {}", order.order_id, order.total),
                ));
            }
            if !order.discount.is_finite() || order.discount < 0.0 {
                return Err(SegmentationError::corrupt_history(
                    &self.customer_id,
                    format!(
                        "order {} has invalid discount {}",
                        order.order_id, order.discount
                    ),
                ));
            }
        }

        for item in &self.items {
            if !order_ids.contains(item.order_id.as_str()) {
                return Err(SegmentationError::corrupt_history(
                    &self.customer_id,
                    format!("item references unknown order {}", item.order_id),
                ));
            }
            if !item.unit_price.is_finite() || item.unit_price < 0.0 {
                return Err(SegmentationError::corrupt_history(
                    &self.customer_id,
                    format!(
                        "item {} has invalid unit price {}",
                        item.product_id, item.unit_price
                    ),
                ));
            }
        }

        for ticket in &self.tickets {
            if ticket.sentiment.is_some_and(|s| !s.is_finite()) {
                return Err(SegmentationError::corrupt_history(
                    &self.customer_id,
                    format!("ticket {} has non-finite sentiment", ticket.ticket_id),
                ));
            }
        }

        Ok(())
    }

    /// Orders sorted by placement time.
    pub fn orders_chronological(&self) -> Vec<&Order> {
        let mut orders: Vec<&Order> = self.orders.iter().collect();
        orders.sort_by(|a, b| {
            a.placed_at
                .cmp(&b.placed_at)
                .then_with(|| a.order_id.cmp(&b.order_id))
        });
        orders
    }
}

/// Source of per-customer histories.
pub trait HistorySource: Send + Sync {
    /// Load one customer's full history.
    fn load(&self, customer_id: &str) -> SegResult<CustomerHistory>;

    /// All customers this source knows about, sorted.
    fn customer_ids(&self) -> Vec<String>;
}

/// History source backed by an in-memory map.
#[derive(Debug, Default)]
pub struct InMemoryHistorySource {
    histories: HashMap<String, CustomerHistory>,
}

impl InMemoryHistorySource {
    pub fn new(histories: impl IntoIterator<Item = CustomerHistory>) -> Self {
        Self {
            histories: histories
                .into_iter()
                .map(|h| (h.customer_id.clone(), h))
                .collect(),
        }
    }
}

impl HistorySource for InMemoryHistorySource {
    fn load(&self, customer_id: &str) -> SegResult<CustomerHistory> {
        self.histories
            .get(customer_id)
            .cloned()
            .ok_or_else(|| SegmentationError::HistoryUnavailable {
                customer_id: customer_id.to_string(),
                reason: "customer not found".to_string(),
            })
    }

    fn customer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.histories.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Load order, item and ticket exports and group them per customer.
///
/// # Arguments
/// * `orders_path` - CSV with one row per order (required)
/// * `items_path` - CSV with one row per line item, joined to orders by `order_id`
/// * `tickets_path` - CSV with one row per support ticket
///
/// # Returns
/// * Histories sorted by customer id
pub fn load_histories(
    orders_path: &Path,
    items_path: Option<&Path>,
    tickets_path: Option<&Path>,
) -> SegResult<Vec<CustomerHistory>> {
    let orders_df = read_csv(orders_path)?;
    if orders_df.height() == 0 {
        return Err(SegmentationError::invalid_parameter(format!(
            "no orders found in {}",
            orders_path.display()
        )));
    }

    let mut histories: BTreeMap<String, CustomerHistory> = BTreeMap::new();
    let mut owner_by_order: HashMap<String, String> = HashMap::new();

    let mut skipped = 0usize;
    for (customer_id, order) in parse_orders(&orders_df)? {
        match (customer_id, order) {
            (Some(customer_id), Some(order)) => {
                owner_by_order.insert(order.order_id.clone(), customer_id.clone());
                histories
                    .entry(customer_id.clone())
                    .or_insert_with(|| CustomerHistory::new(customer_id))
                    .orders
                    .push(order);
            }
            _ => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(skipped, "Skipped malformed order rows");
    }

    if let Some(path) = items_path {
        let items_df = read_csv(path)?
            .lazy()
            // Drop lines that cannot contribute to any feature
            .filter(
                col("quantity")
                    .gt(lit(0))
                    .and(col("unit_price").gt_eq(lit(0.0))),
            )
            .collect()?;

        let mut orphaned = 0usize;
        for item in parse_items(&items_df)? {
            match owner_by_order.get(&item.order_id) {
                Some(owner) => {
                    if let Some(history) = histories.get_mut(owner) {
                        history.items.push(item);
                    }
                }
                None => orphaned += 1,
            }
        }
        if orphaned > 0 {
            warn!(orphaned, "Skipped items referencing unknown orders");
        }
    }

    if let Some(path) = tickets_path {
        let tickets_df = read_csv(path)?;
        for (customer_id, ticket) in parse_tickets(&tickets_df)? {
            if let Some(history) = histories.get_mut(&customer_id) {
                history.tickets.push(ticket);
            }
        }
    }

    info!(
        customers = histories.len(),
        orders = owner_by_order.len(),
        "Loaded customer histories"
    );

    Ok(histories.into_values().collect())
}

fn read_csv(path: &Path) -> SegResult<DataFrame> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;
    Ok(df)
}

type OrderRow = (Option<String>, Option<Order>);

fn parse_orders(df: &DataFrame) -> SegResult<Vec<OrderRow>> {
    let height = df.height();
    let customer_ids = string_column(df, "customer_id")?;
    let order_ids = string_column(df, "order_id")?;
    let placed = string_column(df, "placed_at")?;
    let totals = float_column(df, "total")?;
    let discounts = optional_float_column(df, "discount")?;
    let channels = optional_string_column(df, "channel")?;
    let methods = optional_string_column(df, "payment_method")?;
    let installments = optional_string_column(df, "installments")?;
    let failed = optional_string_column(df, "payment_failed")?;
    let cancelled = optional_string_column(df, "cancelled")?;
    let promised = optional_string_column(df, "promised_at")?;
    let delivered = optional_string_column(df, "delivered_at")?;

    let rows = (0..height)
        .map(|i| {
            let order = match (&order_ids[i], placed[i].as_deref().and_then(parse_timestamp), totals[i]) {
                (Some(order_id), Some(placed_at), Some(total)) => Some(Order {
                    order_id: order_id.clone(),
                    placed_at,
                    total,
                    discount: discounts[i].unwrap_or(0.0),
                    channel: channels[i].clone(),
                    payment_method: methods[i].clone(),
                    installments: parse_flag(installments[i].as_deref()),
                    payment_failed: parse_flag(failed[i].as_deref()),
                    cancelled: parse_flag(cancelled[i].as_deref()),
                    promised_at: promised[i].as_deref().and_then(parse_timestamp),
                    delivered_at: delivered[i].as_deref().and_then(parse_timestamp),
                }),
                _ => None,
            };
            (customer_ids[i].clone(), order)
        })
        .collect();

    Ok(rows)
}

fn parse_items(df: &DataFrame) -> SegResult<Vec<OrderItem>> {
    let order_ids = string_column(df, "order_id")?;
    let product_ids = string_column(df, "product_id")?;
    let categories = optional_string_column(df, "category")?;
    let quantities = float_column(df, "quantity")?;
    let prices = float_column(df, "unit_price")?;
    let returned = optional_string_column(df, "returned")?;

    let items = (0..df.height())
        .filter_map(|i| {
            Some(OrderItem {
                order_id: order_ids[i].clone()?,
                product_id: product_ids[i].clone()?,
                category: categories[i].clone(),
                quantity: quantities[i]?.round() as u32,
                unit_price: prices[i]?,
                returned: parse_flag(returned[i].as_deref()),
            })
        })
        .collect();

    Ok(items)
}

fn parse_tickets(df: &DataFrame) -> SegResult<Vec<(String, SupportTicket)>> {
    let ticket_ids = string_column(df, "ticket_id")?;
    let customer_ids = string_column(df, "customer_id")?;
    let created = string_column(df, "created_at")?;
    let resolved = optional_string_column(df, "resolved_at")?;
    let sentiments = optional_float_column(df, "sentiment")?;
    let escalated = optional_string_column(df, "escalated")?;

    let tickets = (0..df.height())
        .filter_map(|i| {
            let ticket = SupportTicket {
                ticket_id: ticket_ids[i].clone()?,
                created_at: created[i].as_deref().and_then(parse_timestamp)?,
                resolved_at: resolved[i].as_deref().and_then(parse_timestamp),
                sentiment: sentiments[i],
                escalated: parse_flag(escalated[i].as_deref()),
            };
            Some((customer_ids[i].clone()?, ticket))
        })
        .collect();

    Ok(tickets)
}

fn string_column(df: &DataFrame, name: &str) -> SegResult<Vec<Option<String>>> {
    let series = df.column(name)?.cast(&DataType::String)?;
    let values = series
        .str()?
        .into_iter()
        .map(|v| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
        .collect();
    Ok(values)
}

fn optional_string_column(df: &DataFrame, name: &str) -> SegResult<Vec<Option<String>>> {
    if df.column(name).is_ok() {
        string_column(df, name)
    } else {
        Ok(vec![None; df.height()])
    }
}

fn float_column(df: &DataFrame, name: &str) -> SegResult<Vec<Option<f64>>> {
    let series = df.column(name)?.cast(&DataType::Float64)?;
    let values = series.f64()?.into_iter().collect();
    Ok(values)
}

fn optional_float_column(df: &DataFrame, name: &str) -> SegResult<Vec<Option<f64>>> {
    if df.column(name).is_ok() {
        float_column(df, name)
    } else {
        Ok(vec![None; df.height()])
    }
}

/// Parse RFC 3339 timestamps, naive date-times (assumed UTC) or plain dates.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn parse_flag(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|s| s.trim().to_ascii_lowercase()).as_deref(),
        Some("true" | "t" | "1" | "yes" | "y")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn ts(raw: &str) -> DateTime<Utc> {
        parse_timestamp(raw).unwrap()
    }

    fn create_orders_csv() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "order_id,customer_id,placed_at,total,discount,channel,payment_method,cancelled").unwrap();
        writeln!(file, "o-1,c-1,2024-01-05T10:00:00Z,120.5,10,web,card,false").unwrap();
        writeln!(file, "o-2,c-1,2024-02-05T19:30:00Z,80,0,mobile_app,card,false").unwrap();
        writeln!(file, "o-3,c-2,2024-03-01 08:00:00,45,5,web,paypal,true").unwrap();
        writeln!(file, "o-4,,2024-03-01,45,5,web,paypal,false").unwrap();
        file
    }

    fn create_items_csv() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "order_id,product_id,category,quantity,unit_price,returned").unwrap();
        writeln!(file, "o-1,p-1,shoes,1,100.5,false").unwrap();
        writeln!(file, "o-1,p-2,socks,2,10,true").unwrap();
        writeln!(file, "o-2,p-1,shoes,0,80,false").unwrap();
        writeln!(file, "o-9,p-3,hats,1,20,false").unwrap();
        file
    }

    #[test]
    fn test_load_histories() {
        let orders = create_orders_csv();
        let items = create_items_csv();

        let histories = load_histories(orders.path(), Some(items.path()), None).unwrap();
        assert_eq!(histories.len(), 2);

        let c1 = &histories[0];
        assert_eq!(c1.customer_id, "c-1");
        assert_eq!(c1.orders.len(), 2);
        // Zero-quantity and orphaned lines are dropped
        assert_eq!(c1.items.len(), 2);
        assert!(c1.items.iter().any(|i| i.returned));
        assert_eq!(c1.orders[1].channel.as_deref(), Some("mobile_app"));

        let c2 = &histories[1];
        assert!(c2.orders[0].cancelled);
        assert!(c2.validate().is_ok());
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2024-01-05T10:00:00Z").is_some());
        assert!(parse_timestamp("2024-01-05T10:00:00").is_some());
        assert!(parse_timestamp("2024-01-05 10:00:00").is_some());
        assert!(parse_timestamp("2024-01-05").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_validate_rejects_orphan_items() {
        let history = CustomerHistory::new("c-1")
            .with_orders(vec![Order::new("o-1", ts("2024-01-01"), 10.0)])
            .with_items(vec![OrderItem::new("o-2", "p-1", None, 1, 5.0)]);

        let err = history.validate().unwrap_err();
        assert!(err.to_string().contains("unknown order o-2"));
    }

    #[test]
    fn test_validate_rejects_non_finite_totals() {
        let history = CustomerHistory::new("c-1")
            .with_orders(vec![Order::new("o-1", ts("2024-01-01"), f64::NAN)]);
        assert!(matches!(
            history.validate(),
            Err(SegmentationError::CorruptHistory { .. })
        ));
    }

    #[test]
    fn test_in_memory_source() {
        let source = InMemoryHistorySource::new(vec![
            CustomerHistory::new("b"),
            CustomerHistory::new("a"),
        ]);
        assert_eq!(source.customer_ids(), vec!["a".to_string(), "b".to_string()]);
        assert!(source.load("a").is_ok());
        assert!(matches!(
            source.load("zzz"),
            Err(SegmentationError::HistoryUnavailable { .. })
        ));
    }
}
