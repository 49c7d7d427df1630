// Public email endpoints: the contact form and order receipts.
use crate::server::app::SharedState;
use crate::server::error::{ApiError, ApiResult};
use crate::server::mailer::{contact_email, receipt_email, OutgoingEmail, Receipt};
use crate::server::users::looks_like_email;
use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use log::{error, info};

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ContactRequest {
    pub name: String,
    pub email: String,
    pub subject: String,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ReceiptRequest {
    pub customer_email: String,
    pub customer_name: String,
    pub dish_name: String,
    pub quantity: i64,
    pub total_price: f64,
    pub payment_status: Option<String>,
}

async fn deliver(state: &SharedState, email: OutgoingEmail, failure: &str) -> ApiResult<()> {
    let to = email.to.clone();
    state.mailer.send(email).await.map_err(|e| {
        error!("[MAIL] Delivery to {} failed: {}", to, e);
        ApiError::Upstream(failure.to_string())
    })
}

async fn send_contact(
    State(state): State<SharedState>,
    Json(req): Json<ContactRequest>,
) -> ApiResult<Json<Value>> {
    let (name, email, message) = (req.name.trim(), req.email.trim(), req.message.trim());
    if name.is_empty() || email.is_empty() || message.is_empty() {
        return Err(ApiError::validation("All fields required"));
    }
    if !looks_like_email(email) {
        return Err(ApiError::validation("Invalid email address"));
    }

    let outgoing = contact_email(&state.config.email.contact_inbox, name, email, req.subject.trim(), message);
    deliver(&state, outgoing, "Failed to send message").await?;
    info!("[CONTACT] Inquiry from {} forwarded", email);
    Ok(Json(json!({ "success": true, "message": "Message sent successfully" })))
}

async fn send_receipt(
    State(state): State<SharedState>,
    Json(req): Json<ReceiptRequest>,
) -> ApiResult<Json<Value>> {
    let customer_email = req.customer_email.trim();
    if customer_email.is_empty() || req.customer_name.trim().is_empty() || req.dish_name.trim().is_empty() {
        return Err(ApiError::validation("Missing required fields"));
    }

    let receipt = Receipt {
        customer_email,
        customer_name: req.customer_name.trim(),
        dish_name: req.dish_name.trim(),
        quantity: req.quantity,
        total_price: req.total_price,
        payment_status: req.payment_status.as_deref().unwrap_or("Pending"),
    };
    deliver(&state, receipt_email(&receipt), "Failed to send receipt").await?;
    info!("[CONTACT] Receipt sent to {}", customer_email);
    Ok(Json(json!({ "success": true, "message": "Receipt email sent successfully" })))
}

/// Routes mounted at /api/contact
pub fn contact_router() -> Router<SharedState> {
    Router::new().route("/", post(send_contact))
}

/// Routes mounted at /api/order-email
pub fn receipt_router() -> Router<SharedState> {
    Router::new().route("/send", post(send_receipt))
}
