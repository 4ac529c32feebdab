use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde_json::{json, Value};

use crate::config::TelegramConfig;
use crate::feed::filter::value_text;
use crate::feed::Row;
use crate::notifications::store::{Notification, NotificationSink};

/// Posts messages to a Telegram chat through the bot API. Sends are fire and
/// forget: failures are logged and never retried.
#[derive(Clone)]
pub struct TelegramNotifier {
    config: TelegramConfig,
    client: Client,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { config, client })
    }

    pub fn payload(&self, text: &str) -> Value {
        json!({
            "chat_id": self.config.chat_id,
            "text": text,
            "parse_mode": "HTML",
        })
    }

    pub fn send_blocking(&self, text: &str) -> Result<()> {
        let url = self.config.send_message_url()?;
        let response: Value = self
            .client
            .post(url)
            .json(&self.payload(text))
            .send()?
            .json()
            .context("Telegram returned a non-JSON response")?;
        if response.get("ok").and_then(Value::as_bool) != Some(true) {
            anyhow::bail!("Telegram API error: {}", response);
        }
        Ok(())
    }

    /// Sends on a background thread.
    pub fn send(&self, text: String) -> JoinHandle<()> {
        let notifier = self.clone();
        thread::spawn(move || {
            if let Err(e) = notifier.send_blocking(&text) {
                log::error!("Telegram notification error: {:#}", e);
            }
        })
    }
}

impl NotificationSink for TelegramNotifier {
    fn on_notification(&mut self, notification: &Notification) {
        self.send(format_order_message(&notification.source));
    }
}

/// The chat message for a new order row.
pub fn format_order_message(row: &Row) -> String {
    let field = |name: &str| {
        row.get(name)
            .and_then(value_text)
            .map(|text| escape_html(&text))
            .unwrap_or_else(|| "-".to_string())
    };
    let total = row
        .get("total")
        .and_then(Value::as_f64)
        .map(group_thousands)
        .unwrap_or_else(|| field("total"));

    format!(
        "🔔 <b>New order!</b>\n\n\
         👤 Customer: {}\n\
         📞 Phone: {}\n\
         💰 Total: {}\n\
         📅 Date: {}\n\
         ⚡ Status: {}",
        field("customer_name"),
        field("customer_phone"),
        total,
        field("created_at"),
        field("status"),
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// `1234567.5` -> `1 234 567.5`
fn group_thousands(amount: f64) -> String {
    let text = if amount.fract() == 0.0 {
        format!("{}", amount as i64)
    } else {
        format!("{}", amount)
    };
    let (sign, rest) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text.as_str()),
    };
    let (whole, fraction) = match rest.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (rest, None),
    };

    let mut grouped = String::new();
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(digit);
    }
    match fraction {
        Some(fraction) => format!("{}{}.{}", sign, grouped, fraction),
        None => format!("{}{}", sign, grouped),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_uses_html_mode() -> Result<()> {
        let notifier = TelegramNotifier::new(TelegramConfig::new("123:abc", "-100200")?)?;
        let payload = notifier.payload("hi");
        assert_eq!(payload["chat_id"], "-100200");
        assert_eq!(payload["text"], "hi");
        assert_eq!(payload["parse_mode"], "HTML");
        Ok(())
    }

    #[test]
    fn formats_order_rows() {
        let row = json!({
            "id": "abc123",
            "customer_name": "Aziz <VIP>",
            "customer_phone": "+998 90 123 45 67",
            "total": 150000,
            "status": "new",
            "source": "website",
        });
        let message = format_order_message(row.as_object().unwrap());
        assert!(message.starts_with("🔔 <b>New order!</b>"));
        assert!(message.contains("Customer: Aziz &lt;VIP&gt;"));
        assert!(message.contains("Phone: +998 90 123 45 67"));
        assert!(message.contains("Total: 150 000"));
        assert!(message.contains("Status: new"));
        assert!(message.contains("Date: -"));
        assert!(!message.contains("Product"));
        assert!(!message.contains("Quantity"));
    }

    #[test]
    fn groups_thousands() {
        assert_eq!(group_thousands(0.0), "0");
        assert_eq!(group_thousands(999.0), "999");
        assert_eq!(group_thousands(1000.0), "1 000");
        assert_eq!(group_thousands(1234567.5), "1 234 567.5");
        assert_eq!(group_thousands(-150000.0), "-150 000");
    }

    #[test]
    fn unreachable_api_is_only_logged() -> Result<()> {
        let mut config = TelegramConfig::new("123:abc", "-100200")?;
        config.api_base = url::Url::parse("http://127.0.0.1:9/")?;
        let notifier = TelegramNotifier::new(config)?;
        assert!(notifier.send_blocking("hello").is_err());
        // The background send swallows the same failure.
        notifier.send("hello".to_string()).join().unwrap();
        Ok(())
    }
}
