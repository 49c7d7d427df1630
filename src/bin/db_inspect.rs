use homechef::server::database::Database;
use sqlx::Row;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let db_path = std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:data/homechef.db".to_string());
    println!("Connecting to {}", db_path);
    let db = Database::connect(&db_path).await?;

    println!("\n-- users --");
    let rows = sqlx::query("SELECT id, name, email, role, verified, deleted_at FROM users ORDER BY created_at")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let name: String = r.try_get("name").unwrap_or_default();
        let email: String = r.try_get("email").unwrap_or_default();
        let role: String = r.try_get("role").unwrap_or_default();
        let verified: i64 = r.try_get("verified").unwrap_or(0);
        let deleted_at: Option<i64> = r.try_get("deleted_at").unwrap_or(None);
        println!(
            "id={} name={} email={} role={} verified={} deleted={}",
            id, name, email, role, verified != 0, deleted_at.is_some()
        );
    }

    println!("\n-- dishes --");
    let rows = sqlx::query("SELECT id, chef_id, name, price, quantity, available, deleted_at FROM dishes ORDER BY created_at")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let chef_id: String = r.try_get("chef_id").unwrap_or_default();
        let name: String = r.try_get("name").unwrap_or_default();
        let price: f64 = r.try_get("price").unwrap_or(0.0);
        let quantity: i64 = r.try_get("quantity").unwrap_or(0);
        let available: i64 = r.try_get("available").unwrap_or(0);
        let deleted_at: Option<i64> = r.try_get("deleted_at").unwrap_or(None);
        println!(
            "id={} chef={} name={} price={:.2} qty={} available={} deleted={}",
            id, chef_id, name, price, quantity, available != 0, deleted_at.is_some()
        );
    }

    println!("\n-- orders (last 10) --");
    let rows = sqlx::query(
        "SELECT id, customer_id, dish_id, quantity, total_price, status, delivery_partner_id, updated_at FROM orders ORDER BY updated_at DESC LIMIT 10",
    )
    .fetch_all(&db.pool)
    .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let customer_id: String = r.try_get("customer_id").unwrap_or_default();
        let dish_id: String = r.try_get("dish_id").unwrap_or_default();
        let quantity: i64 = r.try_get("quantity").unwrap_or(0);
        let total_price: f64 = r.try_get("total_price").unwrap_or(0.0);
        let status: String = r.try_get("status").unwrap_or_default();
        let partner: Option<String> = r.try_get("delivery_partner_id").unwrap_or(None);
        let updated_at: i64 = r.try_get("updated_at").unwrap_or(0);
        println!(
            "id={} customer={} dish={} qty={} total={:.2} status={} partner={} updated_at={}",
            id, customer_id, dish_id, quantity, total_price, status, partner.as_deref().unwrap_or("-"), updated_at
        );
    }

    println!("\n-- pending otp codes --");
    let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM otp_codes").fetch_one(&db.pool).await?;
    println!("count={}", pending);

    Ok(())
}
