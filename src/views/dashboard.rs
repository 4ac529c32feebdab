use anyhow::Result;
use chrono::{Datelike, Days, Local, NaiveDate, Weekday};
use serde::Serialize;
use serde_json::Value;

use crate::data::{DataAccess, Query};
use crate::feed::Row;
use crate::views::reload::Loader;

const RECENT_ORDERS: usize = 5;
const CHART_DAYS: u64 = 7;

/// Income and expense booked on one day.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DailyTotals {
    pub date: NaiveDate,
    pub weekday: Weekday,
    pub income: f64,
    pub expense: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DashboardStats {
    /// Units in stock across all products.
    pub total_stock: f64,
    pub employee_count: usize,
    pub order_count: usize,
    pub income: f64,
    pub expense: f64,
    pub recent_orders: Vec<Row>,
    /// The last seven days, oldest first, ending today.
    pub weekly: Vec<DailyTotals>,
}

impl DashboardStats {
    pub fn profit(&self) -> f64 {
        self.income - self.expense
    }
}

/// Loads the dashboard's headline numbers. Any change to `orders` reloads it.
#[derive(Clone, Debug, Default)]
pub struct DashboardLoader {
    today: Option<NaiveDate>,
}

impl DashboardLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the end of the weekly series instead of using the local date.
    pub fn as_of(today: NaiveDate) -> Self {
        Self { today: Some(today) }
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }
}

fn number(row: &Row, column: &str) -> f64 {
    match row.get(column) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or_default(),
        Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
        _ => 0.0,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Entry {
    Income,
    Expense,
}

fn entry_kind(row: &Row) -> Option<Entry> {
    match row.get("type").and_then(Value::as_str) {
        Some("income") => Some(Entry::Income),
        Some("expense") => Some(Entry::Expense),
        _ => None,
    }
}

fn entry_date(row: &Row) -> Option<NaiveDate> {
    let text = row.get("date").and_then(Value::as_str)?;
    // Timestamps count on the day they start with.
    NaiveDate::parse_from_str(text.get(..10).unwrap_or(text), "%Y-%m-%d").ok()
}

impl Loader for DashboardLoader {
    type Model = DashboardStats;

    fn load(&self, data: &dyn DataAccess) -> Result<DashboardStats> {
        let products = data.query("products", &Query::new().select("quantity"))?;
        let employees = data.query("employees", &Query::new().select("id"))?;
        let orders = data.query("orders", &Query::new().select("id"))?;
        let recent_orders = data.query(
            "orders",
            &Query::new()
                .order("created_at", false)
                .limit(RECENT_ORDERS),
        )?;
        let transactions = data.query("transactions", &Query::new().select("type, amount, date"))?;

        let today = self.today();
        let mut weekly: Vec<DailyTotals> = (0..CHART_DAYS)
            .rev()
            .filter_map(|back| today.checked_sub_days(Days::new(back)))
            .map(|date| DailyTotals {
                date,
                weekday: date.weekday(),
                income: 0.0,
                expense: 0.0,
            })
            .collect();

        let mut stats = DashboardStats {
            total_stock: products.iter().map(|p| number(p, "quantity")).sum(),
            employee_count: employees.len(),
            order_count: orders.len(),
            recent_orders,
            ..Default::default()
        };
        for entry in &transactions {
            let Some(kind) = entry_kind(entry) else {
                continue;
            };
            let amount = number(entry, "amount");
            let day = entry_date(entry).and_then(|date| weekly.iter_mut().find(|d| d.date == date));
            match kind {
                Entry::Income => {
                    stats.income += amount;
                    if let Some(day) = day {
                        day.income += amount;
                    }
                }
                Entry::Expense => {
                    stats.expense += amount;
                    if let Some(day) = day {
                        day.expense += amount;
                    }
                }
            }
        }
        stats.weekly = weekly;

        log::debug!(
            "Dashboard: stock={} employees={} orders={} profit={}",
            stats.total_stock,
            stats.employee_count,
            stats.order_count,
            stats.profit()
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SqliteBackend;
    use rusqlite_migration::{Migrations, M};
    use serde_json::json;

    fn backend() -> Result<SqliteBackend> {
        let backend = SqliteBackend::open_memory()?;
        backend.migrate(&Migrations::new(vec![M::up(
            "CREATE TABLE products (id TEXT NOT NULL PRIMARY KEY, name TEXT, quantity INTEGER);
             CREATE TABLE employees (id TEXT NOT NULL PRIMARY KEY, name TEXT);
             CREATE TABLE orders (id TEXT NOT NULL PRIMARY KEY, total INTEGER, created_at TEXT);
             CREATE TABLE transactions (id TEXT NOT NULL PRIMARY KEY, type TEXT, amount REAL, date TEXT);",
        )]))?;
        Ok(backend)
    }

    fn insert(backend: &SqliteBackend, table: &str, value: Value) -> Result<()> {
        backend.insert(table, value.as_object().cloned().unwrap())?;
        Ok(())
    }

    #[test]
    fn aggregates_the_dashboard() -> Result<()> {
        let backend = backend()?;
        insert(&backend, "products", json!({"name": "Mouse", "quantity": 10}))?;
        insert(&backend, "products", json!({"name": "Cable", "quantity": 5}))?;
        insert(&backend, "products", json!({"name": "Hub"}))?;
        insert(&backend, "employees", json!({"name": "Dilnoza"}))?;
        for day in 1..=7 {
            insert(
                &backend,
                "orders",
                json!({"total": day * 1000, "created_at": format!("2026-03-0{}T10:00:00Z", day)}),
            )?;
        }
        insert(&backend, "transactions", json!({"type": "income", "amount": 500.0, "date": "2026-03-10"}))?;
        insert(&backend, "transactions", json!({"type": "expense", "amount": 120.0, "date": "2026-03-08"}))?;
        insert(&backend, "transactions", json!({"type": "income", "amount": 80.0, "date": "2026-01-01"}))?;
        insert(&backend, "transactions", json!({"type": "transfer", "amount": 999.0, "date": "2026-03-10"}))?;

        let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let stats = DashboardLoader::as_of(today).load(&backend)?;

        assert_eq!(stats.total_stock, 15.0);
        assert_eq!(stats.employee_count, 1);
        assert_eq!(stats.order_count, 7);
        assert_eq!(stats.income, 580.0);
        assert_eq!(stats.expense, 120.0);
        assert_eq!(stats.profit(), 460.0);

        assert_eq!(stats.recent_orders.len(), 5);
        assert_eq!(stats.recent_orders[0]["total"], 7000);

        assert_eq!(stats.weekly.len(), 7);
        assert_eq!(stats.weekly[0].date, NaiveDate::from_ymd_opt(2026, 3, 4).unwrap());
        assert_eq!(stats.weekly[6].date, today);
        assert_eq!(stats.weekly[6].weekday, Weekday::Tue);
        assert_eq!(stats.weekly[6].income, 500.0);
        assert_eq!(stats.weekly[4].expense, 120.0);
        Ok(())
    }

    #[test]
    fn empty_tables_give_zeroes() -> Result<()> {
        let stats = DashboardLoader::new().load(&backend()?)?;
        assert_eq!(stats.total_stock, 0.0);
        assert_eq!(stats.profit(), 0.0);
        assert!(stats.recent_orders.is_empty());
        assert_eq!(stats.weekly.len(), 7);
        Ok(())
    }
}
