// Outbound transactional email.
//
// Delivery itself belongs to the provider: we POST a JSON message to its HTTP
// API. Without a configured provider the message is only logged.
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use log::{info, warn};

use crate::server::config::EmailConfig;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(rename = "replyTo", skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

#[derive(Error, Debug)]
pub enum MailError {
    #[error("email provider rejected the message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("email transport failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailError>;
}

pub fn from_config(config: &EmailConfig) -> Arc<dyn Mailer> {
    match &config.api_url {
        Some(url) => {
            info!("[MAIL] Using transactional provider at {}", url);
            Arc::new(HttpMailer::new(url.clone(), config.api_key.clone(), config.from.clone()))
        }
        None => {
            warn!("[MAIL] EMAIL_API_URL not set, outgoing email will only be logged");
            Arc::new(LogMailer)
        }
    }
}

pub struct HttpMailer {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    from: String,
}

#[derive(Serialize)]
struct ProviderMessage<'a> {
    from: &'a str,
    #[serde(flatten)]
    email: &'a OutgoingEmail,
}

impl HttpMailer {
    pub fn new(api_url: String, api_key: Option<String>, from: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, api_url, api_key, from }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailError> {
        let mut request = self.client.post(&self.api_url).json(&ProviderMessage {
            from: &self.from,
            email: &email,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Rejected { status: status.as_u16(), body });
        }
        info!("[MAIL] Sent \"{}\" to {}", email.subject, email.to);
        Ok(())
    }
}

pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailError> {
        info!("[MAIL] (not delivered) to={} subject=\"{}\"", email.to, email.subject);
        Ok(())
    }
}

/// Keeps every message in memory. Used by tests and local tooling.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn last_to(&self, to: &str) -> Option<OutgoingEmail> {
        self.sent().into_iter().rev().find(|e| e.to == to)
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(email);
        }
        Ok(())
    }
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn otp_email(to: &str, code: &str, ttl: Duration) -> OutgoingEmail {
    let minutes = (ttl.as_secs() / 60).max(1);
    OutgoingEmail {
        to: to.to_string(),
        subject: "Your OTP Code for Home Chef Registration".to_string(),
        text: format!("Your OTP code is {}. It will expire in {} minutes.", code, minutes),
        html: Some(format!(
            "<h2>Welcome to Home Chef!</h2><p>Your OTP code is: <b>{}</b></p><p>This code is valid for {} minutes.</p>",
            code, minutes
        )),
        reply_to: None,
    }
}

pub struct Receipt<'a> {
    pub customer_email: &'a str,
    pub customer_name: &'a str,
    pub dish_name: &'a str,
    pub quantity: i64,
    pub total_price: f64,
    pub payment_status: &'a str,
}

pub fn receipt_email(receipt: &Receipt<'_>) -> OutgoingEmail {
    let row = |label: &str, value: &str| {
        format!(
            "<tr><td style=\"padding: 8px; border-bottom: 1px solid #eee;\"><b>{}</b></td><td style=\"padding: 8px; border-bottom: 1px solid #eee;\">{}</td></tr>",
            label,
            escape_html(value)
        )
    };
    let html = format!(
        "<div style=\"font-family: Arial, sans-serif; padding: 20px;\">\
         <h2 style=\"color: #ff6600;\">Order Receipt - Home Chef</h2>\
         <p>Dear <b>{}</b>,</p><p>Thank you for ordering from Home Chef! Here are your order details:</p>\
         <table style=\"border-collapse: collapse; width: 100%;\">{}{}{}{}</table>\
         <p>We'll notify you once your order is dispatched.</p></div>",
        escape_html(receipt.customer_name),
        row("Dish", receipt.dish_name),
        row("Quantity", &receipt.quantity.to_string()),
        row("Total Price", &format!("Rs. {:.2}", receipt.total_price)),
        row("Payment", receipt.payment_status),
    );
    OutgoingEmail {
        to: receipt.customer_email.to_string(),
        subject: "Home Chef - Order Receipt".to_string(),
        text: format!(
            "Dear {}, your order of {} x {} (Rs. {:.2}) has been received. Payment: {}.",
            receipt.customer_name, receipt.quantity, receipt.dish_name, receipt.total_price, receipt.payment_status
        ),
        html: Some(html),
        reply_to: None,
    }
}

pub fn contact_email(inbox: &str, name: &str, email: &str, subject: &str, message: &str) -> OutgoingEmail {
    OutgoingEmail {
        to: inbox.to_string(),
        subject: format!("New Inquiry: {}", subject),
        text: format!("From: {}\nEmail: {}\nMessage: {}", name, email, message),
        html: None,
        reply_to: Some(email.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_escapes_customer_input() {
        let email = receipt_email(&Receipt {
            customer_email: "a@b.c",
            customer_name: "<script>",
            dish_name: "Dal & Rice",
            quantity: 2,
            total_price: 300.0,
            payment_status: "Paid",
        });
        let html = email.html.unwrap();
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("Dal &amp; Rice"));
        assert!(html.contains("Rs. 300.00"));
    }

    #[test]
    fn otp_email_mentions_code_and_lifetime() {
        let email = otp_email("x@y.z", "482913", Duration::from_secs(300));
        assert!(email.text.contains("482913"));
        assert!(email.text.contains("5 minutes"));
    }

    #[tokio::test]
    async fn recording_mailer_keeps_messages() {
        let mailer = RecordingMailer::new();
        mailer.send(contact_email("inbox@x", "Ravi", "ravi@x", "Hi", "Hello")).await.unwrap();
        let last = mailer.last_to("inbox@x").unwrap();
        assert_eq!(last.subject, "New Inquiry: Hi");
        assert_eq!(last.reply_to.as_deref(), Some("ravi@x"));
    }
}
