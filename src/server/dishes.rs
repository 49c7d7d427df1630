use crate::common::models::{from_timestamp, ChefSummary, Dish};
use crate::server::app::SharedState;
use crate::server::auth::{require_auth, require_role, CurrentUser, CHEF_ONLY};
use crate::server::database::Database;
use crate::server::error::{ApiError, ApiResult};
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
use log::info;

const DISH_SELECT: &str = r#"
    SELECT d.id, d.chef_id, d.name, d.description, d.price, d.quantity, d.available, d.images, d.created_at,
           u.name AS chef_name, u.email AS chef_email
    FROM dishes d
    LEFT JOIN users u ON u.id = d.chef_id
"#;

pub(crate) fn row_to_dish(row: &SqliteRow) -> Result<Dish, sqlx::Error> {
    let images: String = row.try_get("images")?;
    let chef_id: String = row.try_get("chef_id")?;
    let chef_name: Option<String> = row.try_get("chef_name")?;
    let chef_email: Option<String> = row.try_get("chef_email")?;
    let chef = match (chef_name, chef_email) {
        (Some(name), Some(email)) => Some(ChefSummary { id: chef_id.clone(), name, email }),
        _ => None,
    };
    Ok(Dish {
        id: row.try_get("id")?,
        chef_id,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        price: row.try_get("price")?,
        quantity: row.try_get("quantity")?,
        available: row.try_get::<i64, _>("available")? != 0,
        images: serde_json::from_str(&images).unwrap_or_default(),
        created_at: from_timestamp(row.try_get("created_at")?),
        chef,
    })
}

pub async fn list_dishes(db: &Database) -> Result<Vec<Dish>, sqlx::Error> {
    let sql = format!("{} WHERE d.deleted_at IS NULL ORDER BY d.created_at DESC, d.rowid DESC", DISH_SELECT);
    let rows = sqlx::query(&sql).fetch_all(&db.pool).await?;
    rows.iter().map(row_to_dish).collect()
}

/// Catalog lookup; soft-deleted dishes are invisible.
pub async fn find_dish(db: &Database, id: &str) -> Result<Option<Dish>, sqlx::Error> {
    let sql = format!("{} WHERE d.id = ? AND d.deleted_at IS NULL", DISH_SELECT);
    let row = sqlx::query(&sql).bind(id).fetch_optional(&db.pool).await?;
    row.as_ref().map(row_to_dish).transpose()
}

/// Lookup that still resolves soft-deleted dishes, for orders that reference them.
pub async fn find_dish_any(db: &Database, id: &str) -> Result<Option<Dish>, sqlx::Error> {
    let sql = format!("{} WHERE d.id = ?", DISH_SELECT);
    let row = sqlx::query(&sql).bind(id).fetch_optional(&db.pool).await?;
    row.as_ref().map(row_to_dish).transpose()
}

async fn save_dish(db: &Database, dish: &Dish) -> Result<(), sqlx::Error> {
    let images = serde_json::to_string(&dish.images).unwrap_or_else(|_| "[]".to_string());
    sqlx::query(
        "UPDATE dishes SET name = ?, description = ?, price = ?, quantity = ?, available = ?, images = ? WHERE id = ?",
    )
    .bind(&dish.name)
    .bind(&dish.description)
    .bind(dish.price)
    .bind(dish.quantity)
    .bind(dish.available as i64)
    .bind(images)
    .bind(&dish.id)
    .execute(&db.pool)
    .await?;
    Ok(())
}

fn check_price(price: f64) -> ApiResult<f64> {
    if price.is_finite() && price >= 0.0 {
        Ok(price)
    } else {
        Err(ApiError::validation("Price must be a non-negative number"))
    }
}

fn check_quantity(quantity: i64) -> ApiResult<i64> {
    if quantity >= 0 {
        Ok(quantity)
    } else {
        Err(ApiError::validation("Quantity cannot be negative"))
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateDishRequest {
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub quantity: Option<i64>,
    pub available: Option<bool>,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateDishRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub quantity: Option<i64>,
    pub available: Option<bool>,
    pub images: Option<Vec<String>>,
}

async fn get_dishes(State(state): State<SharedState>) -> ApiResult<Json<Vec<Dish>>> {
    Ok(Json(list_dishes(&state.db).await?))
}

async fn get_dish(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult<Json<Dish>> {
    find_dish(&state.db, &id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Dish not found"))
}

async fn create_dish(
    State(state): State<SharedState>,
    CurrentUser(chef): CurrentUser,
    Json(req): Json<CreateDishRequest>,
) -> ApiResult<(StatusCode, Json<Dish>)> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("Dish name is required"));
    }
    let price = check_price(req.price)?;
    let quantity = check_quantity(req.quantity.unwrap_or(0))?;

    let id = uuid::Uuid::new_v4().to_string();
    let images = serde_json::to_string(&req.images).unwrap_or_else(|_| "[]".to_string());
    sqlx::query(
        "INSERT INTO dishes (id, chef_id, name, description, price, quantity, available, images, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&chef.id)
    .bind(name)
    .bind(&req.description)
    .bind(price)
    .bind(quantity)
    .bind(req.available.unwrap_or(true) as i64)
    .bind(images)
    .bind(Utc::now().timestamp())
    .execute(&state.db.pool)
    .await?;

    info!("[DISHES] Chef {} added dish {} ({})", chef.id, id, name);
    let dish = find_dish(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("dish {} vanished after insert", id)))?;
    Ok((StatusCode::CREATED, Json(dish)))
}

async fn owned_dish(db: &Database, id: &str, chef_id: &str) -> ApiResult<Dish> {
    let dish = find_dish(db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Dish not found"))?;
    if dish.chef_id != chef_id {
        return Err(ApiError::forbidden("Not authorized to modify this dish"));
    }
    Ok(dish)
}

async fn update_dish(
    State(state): State<SharedState>,
    CurrentUser(chef): CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateDishRequest>,
) -> ApiResult<Json<Dish>> {
    let mut dish = owned_dish(&state.db, &id, &chef.id).await?;

    if let Some(name) = req.name.filter(|n| !n.trim().is_empty()) {
        dish.name = name.trim().to_string();
    }
    if req.description.is_some() {
        dish.description = req.description;
    }
    if let Some(price) = req.price {
        dish.price = check_price(price)?;
    }
    if let Some(quantity) = req.quantity {
        dish.quantity = check_quantity(quantity)?;
    }
    if let Some(available) = req.available {
        dish.available = available;
    }
    if let Some(images) = req.images {
        dish.images = images;
    }

    save_dish(&state.db, &dish).await?;
    info!("[DISHES] Chef {} updated dish {}", chef.id, dish.id);
    Ok(Json(dish))
}

async fn delete_dish(
    State(state): State<SharedState>,
    CurrentUser(chef): CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let dish = owned_dish(&state.db, &id, &chef.id).await?;
    sqlx::query("UPDATE dishes SET deleted_at = ?, available = 0 WHERE id = ?")
        .bind(Utc::now().timestamp())
        .bind(&dish.id)
        .execute(&state.db.pool)
        .await?;
    info!("[DISHES] Chef {} removed dish {}", chef.id, dish.id);
    Ok(Json(json!({ "message": "Dish removed" })))
}

/// Routes mounted at /api/dishes
pub fn router(state: SharedState) -> Router<SharedState> {
    let chef_routes = Router::new()
        .route("/", post(create_dish))
        .route("/{id}", put(update_dish).delete(delete_dish))
        .route_layer(from_fn_with_state(CHEF_ONLY, require_role))
        .route_layer(from_fn_with_state(state, require_auth));

    Router::new()
        .route("/", get(get_dishes))
        .route("/{id}", get(get_dish))
        .merge(chef_routes)
}
