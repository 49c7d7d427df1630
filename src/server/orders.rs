// Order lifecycle: placement by customers, status moves by delivery partners,
// chefs and admins, and the dashboard statistics built on top of them.
use crate::common::models::{from_timestamp, Dish, Order, OrderStatus, Role, User};
use crate::server::app::SharedState;
use crate::server::auth::{
    require_auth, require_role, CurrentUser, CHEF_ONLY, CUSTOMER_ONLY, DELIVERY_ONLY, ORDER_HANDLERS, ORDER_VIEWERS,
};
use crate::server::database::Database;
use crate::server::dishes;
use crate::server::error::{ApiError, ApiResult};
use crate::server::events::{ServerEvent, Topic};
use crate::server::stats::{self, ChefStats, DeliveryEarnings, WeeklyStat};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{sqlite::SqliteRow, Row};
use std::collections::HashMap;
use log::{info, warn};

const ORDER_COLUMNS: &str = "o.id, o.customer_id, o.customer_name, o.customer_email, o.delivery_address, o.dish_id, \
     o.quantity, o.total_price, o.status, o.delivery_partner_id, o.created_at, o.updated_at";

fn row_to_order(row: &SqliteRow) -> Result<Order, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(Order {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        customer_name: row.try_get("customer_name")?,
        customer_email: row.try_get("customer_email")?,
        delivery_address: row.try_get("delivery_address")?,
        dish_id: row.try_get("dish_id")?,
        quantity: row.try_get("quantity")?,
        total_price: row.try_get("total_price")?,
        status: status.parse().map_err(|e: String| sqlx::Error::Decode(e.into()))?,
        delivery_partner_id: row.try_get("delivery_partner_id")?,
        created_at: from_timestamp(row.try_get("created_at")?),
        updated_at: from_timestamp(row.try_get("updated_at")?),
        dish: None,
    })
}

async fn fetch_orders(db: &Database, filter: &str, binds: &[&str]) -> Result<Vec<Order>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM orders o {} ORDER BY o.created_at DESC, o.rowid DESC",
        ORDER_COLUMNS, filter
    );
    let mut query = sqlx::query(&sql);
    for value in binds {
        query = query.bind(*value);
    }
    let rows = query.fetch_all(&db.pool).await?;
    let orders: Vec<Order> = rows.iter().map(row_to_order).collect::<Result<_, _>>()?;
    with_dishes(db, orders).await
}

/// Embeds each order's dish. Deleted dishes still resolve.
async fn with_dishes(db: &Database, mut orders: Vec<Order>) -> Result<Vec<Order>, sqlx::Error> {
    let mut cache: HashMap<String, Option<Dish>> = HashMap::new();
    for order in orders.iter_mut() {
        if !cache.contains_key(&order.dish_id) {
            let dish = dishes::find_dish_any(db, &order.dish_id).await?;
            cache.insert(order.dish_id.clone(), dish);
        }
        order.dish = cache.get(&order.dish_id).cloned().flatten();
    }
    Ok(orders)
}

pub async fn find_order(db: &Database, id: &str) -> Result<Option<Order>, sqlx::Error> {
    Ok(fetch_orders(db, "WHERE o.id = ?", &[id]).await?.pop())
}

pub async fn all_orders(db: &Database) -> Result<Vec<Order>, sqlx::Error> {
    fetch_orders(db, "", &[]).await
}

pub async fn orders_for_customer(db: &Database, customer_id: &str) -> Result<Vec<Order>, sqlx::Error> {
    fetch_orders(db, "WHERE o.customer_id = ?", &[customer_id]).await
}

/// Every order placed on one of the chef's dishes, including dishes since removed.
pub async fn orders_for_chef(db: &Database, chef_id: &str) -> Result<Vec<Order>, sqlx::Error> {
    fetch_orders(
        db,
        "JOIN dishes d ON d.id = o.dish_id WHERE d.chef_id = ?",
        &[chef_id],
    )
    .await
}

pub async fn delivered_by_partner(db: &Database, partner_id: &str) -> Result<Vec<Order>, sqlx::Error> {
    fetch_orders(
        db,
        "WHERE o.delivery_partner_id = ? AND o.status = ?",
        &[partner_id, OrderStatus::Delivered.as_str()],
    )
    .await
}

/// Sockets that should hear about changes to `order`.
pub fn order_audience(order: &Order) -> Vec<Topic> {
    let mut audience = vec![
        Topic::User(order.customer_id.clone()),
        Topic::Role(Role::Delivery),
        Topic::Role(Role::Admin),
    ];
    if let Some(dish) = &order.dish {
        audience.push(Topic::Chef(dish.chef_id.clone()));
    }
    audience
}

/// Deletes the order only while it is still Pending. False when it has moved on.
pub async fn delete_if_pending(db: &Database, id: &str) -> Result<bool, sqlx::Error> {
    let res = sqlx::query("DELETE FROM orders WHERE id = ? AND status = ?")
        .bind(id)
        .bind(OrderStatus::Pending.as_str())
        .execute(&db.pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Writes the customer-editable fields only while the order is still Pending.
pub async fn save_pending_edit(db: &Database, order: &Order, now: i64) -> Result<bool, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE orders SET quantity = ?, total_price = ?, delivery_address = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(order.quantity)
    .bind(order.total_price)
    .bind(&order.delivery_address)
    .bind(now)
    .bind(&order.id)
    .bind(OrderStatus::Pending.as_str())
    .execute(&db.pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Persists a status move only if the stored status is still `previous`.
pub async fn save_status(db: &Database, order: &Order, previous: OrderStatus, now: i64) -> Result<bool, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE orders SET status = ?, delivery_partner_id = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(order.status.as_str())
    .bind(&order.delivery_partner_id)
    .bind(now)
    .bind(&order.id)
    .bind(previous.as_str())
    .execute(&db.pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateOrderRequest {
    pub customer_name: String,
    pub customer_email: String,
    pub delivery_address: String,
    pub dish_id: String,
    pub quantity: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOrderRequest {
    pub quantity: Option<i64>,
    pub delivery_address: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

async fn create_order(
    State(state): State<SharedState>,
    CurrentUser(customer): CurrentUser,
    Json(req): Json<CreateOrderRequest>,
) -> ApiResult<(StatusCode, Json<Order>)> {
    let customer_name = req.customer_name.trim();
    let customer_email = req.customer_email.trim();
    let delivery_address = req.delivery_address.trim();
    let dish_id = req.dish_id.trim();
    let quantity = req.quantity.unwrap_or(0);
    if customer_name.is_empty() || customer_email.is_empty() || delivery_address.is_empty() || dish_id.is_empty() {
        return Err(ApiError::validation("All fields are required"));
    }
    if quantity < 1 {
        return Err(ApiError::validation("Quantity must be at least 1"));
    }

    let dish = dishes::find_dish(&state.db, dish_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Dish not found"))?;
    if !dish.available {
        return Err(ApiError::validation("Dish is not available"));
    }

    let now = Utc::now().timestamp();
    let order = Order {
        id: uuid::Uuid::new_v4().to_string(),
        customer_id: customer.id.clone(),
        customer_name: customer_name.to_string(),
        customer_email: customer_email.to_string(),
        delivery_address: delivery_address.to_string(),
        dish_id: dish.id.clone(),
        quantity,
        total_price: dish.price * quantity as f64,
        status: OrderStatus::Pending,
        delivery_partner_id: None,
        created_at: from_timestamp(now),
        updated_at: from_timestamp(now),
        dish: Some(dish),
    };

    sqlx::query(
        "INSERT INTO orders (id, customer_id, customer_name, customer_email, delivery_address, dish_id, quantity, total_price, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&order.id)
    .bind(&order.customer_id)
    .bind(&order.customer_name)
    .bind(&order.customer_email)
    .bind(&order.delivery_address)
    .bind(&order.dish_id)
    .bind(order.quantity)
    .bind(order.total_price)
    .bind(order.status.as_str())
    .bind(now)
    .bind(now)
    .execute(&state.db.pool)
    .await?;

    info!(
        "[ORDERS] Customer {} placed order {} ({} x {}, total {:.2})",
        customer.id, order.id, order.quantity, order.dish_id, order.total_price
    );
    state
        .events
        .publish(order_audience(&order), ServerEvent::OrderCreated { id: order.id.clone() });
    Ok((StatusCode::CREATED, Json(order)))
}

async fn list_orders(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Vec<Order>>> {
    let orders = match user.role {
        Role::Customer => orders_for_customer(&state.db, &user.id).await?,
        _ => all_orders(&state.db).await?,
    };
    Ok(Json(orders))
}

async fn my_orders(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Vec<Order>>> {
    Ok(Json(orders_for_customer(&state.db, &user.id).await?))
}

async fn update_order(
    State(state): State<SharedState>,
    CurrentUser(customer): CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateOrderRequest>,
) -> ApiResult<Json<Order>> {
    let mut order = find_order(&state.db, &id)
        .await?
        .filter(|o| o.customer_id == customer.id)
        .ok_or_else(|| ApiError::not_found("Order not found"))?;
    if order.status != OrderStatus::Pending {
        return Err(ApiError::validation("Only pending orders can be edited"));
    }

    if let Some(address) = req.delivery_address {
        let address = address.trim();
        if address.is_empty() {
            return Err(ApiError::validation("Delivery address cannot be empty"));
        }
        order.delivery_address = address.to_string();
    }
    if let Some(quantity) = req.quantity {
        if quantity < 1 {
            return Err(ApiError::validation("Quantity must be at least 1"));
        }
        let price = order
            .dish
            .as_ref()
            .map(|d| d.price)
            .ok_or_else(|| ApiError::not_found("Dish not found"))?;
        order.quantity = quantity;
        order.total_price = price * quantity as f64;
    }

    let now = Utc::now().timestamp();
    if !save_pending_edit(&state.db, &order, now).await? {
        return Err(ApiError::validation("Only pending orders can be edited"));
    }
    order.updated_at = from_timestamp(now);

    info!("[ORDERS] Customer {} edited order {}", customer.id, order.id);
    Ok(Json(order))
}

async fn cancel_order(
    State(state): State<SharedState>,
    CurrentUser(customer): CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let order = find_order(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("Order not found"))?;
    if order.customer_id != customer.id {
        return Err(ApiError::forbidden("Not authorized to cancel this order"));
    }
    if order.status != OrderStatus::Pending {
        return Err(ApiError::validation("Only pending orders can be cancelled"));
    }

    if !delete_if_pending(&state.db, &order.id).await? {
        return Err(ApiError::validation("Only pending orders can be cancelled"));
    }
    info!("[ORDERS] Customer {} cancelled order {}", customer.id, order.id);
    Ok(Json(json!({ "message": "Order cancelled successfully" })))
}

/// Applies a status move for `actor`, assigning a delivery partner on first pickup.
pub fn apply_status(order: &mut Order, next: OrderStatus, actor: &User) -> ApiResult<()> {
    if !order.status.can_transition_to(next) {
        return Err(ApiError::Conflict(format!(
            "Cannot change order status from {} to {}",
            order.status, next
        )));
    }
    if actor.role == Role::Delivery
        && matches!(next, OrderStatus::Accepted | OrderStatus::PickedUp)
        && order.delivery_partner_id.is_none()
    {
        order.delivery_partner_id = Some(actor.id.clone());
    }
    order.status = next;
    Ok(())
}

async fn update_status(
    State(state): State<SharedState>,
    CurrentUser(actor): CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> ApiResult<Json<Order>> {
    let next: OrderStatus = req
        .status
        .parse()
        .map_err(|_| ApiError::validation(format!("Invalid status: {}", req.status)))?;
    let mut order = find_order(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("Order not found"))?;

    let previous = order.status;
    if let Err(e) = apply_status(&mut order, next, &actor) {
        warn!("[ORDERS] {} {} rejected: {} -> {}", actor.role, actor.id, previous, next);
        return Err(e);
    }

    let now = Utc::now().timestamp();
    if !save_status(&state.db, &order, previous, now).await? {
        warn!("[ORDERS] Order {} changed under {} {}, move to {} dropped", order.id, actor.role, actor.id, next);
        return Err(ApiError::Conflict(format!(
            "Order status changed from {} while updating, reload and retry",
            previous
        )));
    }
    order.updated_at = from_timestamp(now);

    info!("[ORDERS] Order {} moved {} -> {} by {} {}", order.id, previous, next, actor.role, actor.id);
    state.events.publish(
        order_audience(&order),
        ServerEvent::OrderUpdated { order_id: order.id.clone(), status: order.status },
    );
    Ok(Json(order))
}

async fn chef_stats(
    State(state): State<SharedState>,
    CurrentUser(chef): CurrentUser,
) -> ApiResult<Json<ChefStats>> {
    let orders = orders_for_chef(&state.db, &chef.id).await?;
    Ok(Json(stats::chef_stats(&orders)))
}

async fn chef_weekly_stats(
    State(state): State<SharedState>,
    CurrentUser(chef): CurrentUser,
) -> ApiResult<Json<Vec<WeeklyStat>>> {
    let orders = orders_for_chef(&state.db, &chef.id).await?;
    Ok(Json(stats::chef_weekly_stats(&orders)))
}

async fn delivery_earnings(
    State(state): State<SharedState>,
    CurrentUser(partner): CurrentUser,
) -> ApiResult<Json<DeliveryEarnings>> {
    let orders = delivered_by_partner(&state.db, &partner.id).await?;
    Ok(Json(stats::delivery_earnings(orders, Utc::now())))
}

/// Routes mounted at /api/orders
pub fn router(state: SharedState) -> Router<SharedState> {
    let customer = Router::new()
        .route("/", post(create_order))
        .route("/myorders", get(my_orders))
        .route("/{id}", put(update_order).delete(cancel_order))
        .route_layer(from_fn_with_state(CUSTOMER_ONLY, require_role));

    let viewers = Router::new()
        .route("/", get(list_orders))
        .route_layer(from_fn_with_state(ORDER_VIEWERS, require_role));

    let handlers = Router::new()
        .route("/{id}/status", put(update_status))
        .route_layer(from_fn_with_state(ORDER_HANDLERS, require_role));

    let chef = Router::new()
        .route("/chef-stats", get(chef_stats))
        .route("/chef-weekly-stats", get(chef_weekly_stats))
        .route_layer(from_fn_with_state(CHEF_ONLY, require_role));

    let delivery = Router::new()
        .route("/delivery/earnings", get(delivery_earnings))
        .route_layer(from_fn_with_state(DELIVERY_ONLY, require_role));

    Router::new()
        .merge(customer)
        .merge(viewers)
        .merge(handlers)
        .merge(chef)
        .merge(delivery)
        .route_layer(from_fn_with_state(state, require_auth))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_order() -> Order {
        Order {
            id: "o1".into(),
            customer_id: "c1".into(),
            customer_name: "Asha".into(),
            customer_email: "asha@example.com".into(),
            delivery_address: "12 Lane".into(),
            dish_id: "d1".into(),
            quantity: 2,
            total_price: 300.0,
            status: OrderStatus::Pending,
            delivery_partner_id: None,
            created_at: from_timestamp(0),
            updated_at: from_timestamp(0),
            dish: None,
        }
    }

    fn actor(id: &str, role: Role) -> User {
        User {
            id: id.into(),
            name: id.into(),
            email: format!("{}@example.com", id),
            password_hash: String::new(),
            role,
            verified: true,
            phone: None,
            address: None,
            created_at: from_timestamp(0),
        }
    }

    #[test]
    fn delivery_partner_claims_order_on_accept() {
        let mut order = pending_order();
        apply_status(&mut order, OrderStatus::Accepted, &actor("p1", Role::Delivery)).unwrap();
        assert_eq!(order.delivery_partner_id.as_deref(), Some("p1"));

        apply_status(&mut order, OrderStatus::PickedUp, &actor("p2", Role::Delivery)).unwrap();
        assert_eq!(order.delivery_partner_id.as_deref(), Some("p1"));
    }

    #[test]
    fn chefs_and_admins_do_not_claim() {
        let mut order = pending_order();
        apply_status(&mut order, OrderStatus::Accepted, &actor("chef", Role::Chef)).unwrap();
        assert!(order.delivery_partner_id.is_none());
    }

    #[test]
    fn illegal_moves_leave_order_untouched() {
        let mut order = pending_order();
        let err = apply_status(&mut order, OrderStatus::Delivered, &actor("a", Role::Admin)).unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(order.delivery_partner_id.is_none());
    }

    #[test]
    fn audience_includes_chef_when_dish_known() {
        let mut order = pending_order();
        assert!(!order_audience(&order).iter().any(|t| matches!(t, Topic::Chef(_))));
        order.dish = Some(Dish {
            id: "d1".into(),
            chef_id: "chef-9".into(),
            name: "Thali".into(),
            description: None,
            price: 150.0,
            quantity: 5,
            available: true,
            images: vec![],
            created_at: from_timestamp(0),
            chef: None,
        });
        let audience = order_audience(&order);
        assert!(audience.contains(&Topic::Chef("chef-9".into())));
        assert!(audience.contains(&Topic::User("c1".into())));
        assert!(audience.contains(&Topic::Role(Role::Delivery)));
    }

    /// In-memory store holding one order for `pending_order()` in the given status.
    async fn store_with_order(status: OrderStatus) -> Database {
        let db = Database::open("sqlite::memory:").await.unwrap();
        for (id, role) in [("c1", "customer"), ("chef-9", "chef")] {
            sqlx::query("INSERT INTO users (id, name, email, password_hash, role, created_at) VALUES (?, ?, ?, 'x', ?, 0)")
                .bind(id)
                .bind(id)
                .bind(format!("{}@example.com", id))
                .bind(role)
                .execute(&db.pool)
                .await
                .unwrap();
        }
        sqlx::query("INSERT INTO dishes (id, chef_id, name, price, created_at) VALUES ('d1', 'chef-9', 'Thali', 150.0, 0)")
            .execute(&db.pool)
            .await
            .unwrap();
        let order = pending_order();
        sqlx::query(
            "INSERT INTO orders (id, customer_id, customer_name, customer_email, delivery_address, dish_id, quantity, total_price, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0)",
        )
        .bind(&order.id)
        .bind(&order.customer_id)
        .bind(&order.customer_name)
        .bind(&order.customer_email)
        .bind(&order.delivery_address)
        .bind(&order.dish_id)
        .bind(order.quantity)
        .bind(order.total_price)
        .bind(status.as_str())
        .execute(&db.pool)
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn cancel_skips_orders_accepted_meanwhile() {
        let db = store_with_order(OrderStatus::Accepted).await;
        assert!(!delete_if_pending(&db, "o1").await.unwrap());
        let stored = find_order(&db, "o1").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Accepted);

        let db = store_with_order(OrderStatus::Pending).await;
        assert!(delete_if_pending(&db, "o1").await.unwrap());
        assert!(find_order(&db, "o1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn edit_skips_orders_accepted_meanwhile() {
        let db = store_with_order(OrderStatus::Accepted).await;
        let mut edited = pending_order();
        edited.quantity = 5;
        edited.total_price = 750.0;
        assert!(!save_pending_edit(&db, &edited, 10).await.unwrap());
        let stored = find_order(&db, "o1").await.unwrap().unwrap();
        assert_eq!(stored.quantity, 2);
        assert_eq!(stored.total_price, 300.0);
    }

    #[tokio::test]
    async fn status_write_requires_the_status_it_was_checked_against() {
        let db = store_with_order(OrderStatus::Accepted).await;
        let mut order = pending_order();
        apply_status(&mut order, OrderStatus::Cancelled, &actor("a", Role::Admin)).unwrap();
        // Stored row is Accepted, not the Pending this move was validated against
        assert!(!save_status(&db, &order, OrderStatus::Pending, 10).await.unwrap());
        assert_eq!(find_order(&db, "o1").await.unwrap().unwrap().status, OrderStatus::Accepted);

        assert!(save_status(&db, &order, OrderStatus::Accepted, 10).await.unwrap());
        assert_eq!(find_order(&db, "o1").await.unwrap().unwrap().status, OrderStatus::Cancelled);
    }
}
