use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::{DataAccess, Query};
use crate::feed::filter::value_text;
use crate::feed::Row;
use crate::views::reload::Loader;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    New,
    Pending,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::Pending => "pending",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Accepts the status codes and the labels older rows were saved with.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "new" | "Yangi" => Some(OrderStatus::New),
            "pending" | "Jarayonda" => Some(OrderStatus::Pending),
            "completed" | "Tugallandi" => Some(OrderStatus::Completed),
            "cancelled" | "Bekor qilindi" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    pub fn of(order: &Row) -> Option<Self> {
        order.get("status").and_then(Value::as_str).and_then(Self::parse)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub new: usize,
    pub pending: usize,
    pub completed: usize,
    pub cancelled: usize,
}

/// The orders screen: every order newest first with its customer and line
/// items nested, plus the pickers for the order form.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OrdersModel {
    pub orders: Vec<Row>,
    pub customers: Vec<Row>,
    pub products: Vec<Row>,
}

pub fn customer_name(order: &Row) -> &str {
    order
        .get("customer_name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .or_else(|| {
            order
                .get("customers")
                .and_then(|customer| customer.get("name"))
                .and_then(Value::as_str)
        })
        .unwrap_or("Unknown")
}

impl OrdersModel {
    /// Orders whose customer name contains `search` (case-insensitive) and,
    /// if given, with `status`.
    pub fn filtered(&self, search: &str, status: Option<OrderStatus>) -> Vec<&Row> {
        let needle = search.trim().to_lowercase();
        self.orders
            .iter()
            .filter(|order| customer_name(order).to_lowercase().contains(&needle))
            .filter(|order| status.is_none() || OrderStatus::of(order) == status)
            .collect()
    }

    pub fn total(orders: &[&Row]) -> f64 {
        orders
            .iter()
            .filter_map(|order| order.get("total").and_then(Value::as_f64))
            .sum()
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for order in &self.orders {
            match OrderStatus::of(order) {
                Some(OrderStatus::New) => counts.new += 1,
                Some(OrderStatus::Pending) => counts.pending += 1,
                Some(OrderStatus::Completed) => counts.completed += 1,
                Some(OrderStatus::Cancelled) => counts.cancelled += 1,
                None => {}
            }
        }
        counts
    }
}

/// Loads `OrdersModel`. Relations are stitched together here from plain
/// table reads, so any `DataAccess` backend can serve it.
#[derive(Clone, Debug, Default)]
pub struct OrdersLoader;

fn id_of(row: &Row) -> Option<String> {
    row.get("id").and_then(value_text)
}

fn index_by_id(rows: Vec<Row>) -> HashMap<String, Row> {
    rows.into_iter()
        .filter_map(|row| id_of(&row).map(|id| (id, row)))
        .collect()
}

impl Loader for OrdersLoader {
    type Model = OrdersModel;

    fn load(&self, data: &dyn DataAccess) -> Result<OrdersModel> {
        let mut orders = data.query("orders", &Query::new().order("created_at", false))?;
        let customers = index_by_id(data.query("customers", &Query::new().select("id, name, phone"))?);
        let products = index_by_id(data.query("products", &Query::new().select("id, name"))?);
        let items = data.query(
            "order_items",
            &Query::new().select("id, order_id, product_id, quantity, price, product_name"),
        )?;

        let mut items_by_order: HashMap<String, Vec<Value>> = HashMap::new();
        for mut item in items {
            let product = item
                .get("product_id")
                .and_then(value_text)
                .and_then(|id| products.get(&id).cloned())
                .map_or(Value::Null, Value::Object);
            item.insert("products".to_string(), product);
            if let Some(order_id) = item.get("order_id").and_then(value_text) {
                items_by_order.entry(order_id).or_default().push(Value::Object(item));
            }
        }

        for order in &mut orders {
            let customer = order
                .get("customer_id")
                .and_then(value_text)
                .and_then(|id| customers.get(&id).cloned())
                .map_or(Value::Null, Value::Object);
            let items = id_of(order)
                .and_then(|id| items_by_order.remove(&id))
                .unwrap_or_default();
            order.insert("customers".to_string(), customer);
            order.insert("order_items".to_string(), Value::Array(items));
        }

        let customers = data.query(
            "customers",
            &Query::new().select("id, name").order("name", true),
        )?;
        let products = data.query(
            "products",
            &Query::new()
                .select("id, name, sale_price")
                .eq("is_active", true)
                .order("name", true),
        )?;

        log::debug!("Loaded {} orders", orders.len());
        Ok(OrdersModel {
            orders,
            customers,
            products,
        })
    }
}
