use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use homechef::common::models::Role;
use homechef::server::app::{build_router, AppState, SharedState};
use homechef::server::config::ServerConfig;
use homechef::server::events::ServerEvent;
use homechef::server::mailer::{Mailer, RecordingMailer};
use homechef::server::otp::OtpEntry;
use homechef::server::users::{self, NewUser};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    state: SharedState,
    mailer: Arc<RecordingMailer>,
}

impl TestApp {
    async fn new() -> Self {
        let mailer = Arc::new(RecordingMailer::new());
        let as_dyn: Arc<dyn Mailer> = mailer.clone();
        let state = AppState::in_memory(ServerConfig::for_tests(), as_dyn).await.unwrap();
        Self { router: build_router(state.clone()), state, mailer }
    }

    async fn call(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap_or(Value::Null) };
        (status, value)
    }

    async fn get(&self, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        self.call(Method::GET, uri, token, None).await
    }

    async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        self.call(Method::POST, uri, token, Some(body)).await
    }

    async fn put(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        self.call(Method::PUT, uri, token, Some(body)).await
    }

    async fn delete(&self, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        self.call(Method::DELETE, uri, token, None).await
    }

    /// Registers through the public endpoint and returns (user id, token).
    async fn register(&self, name: &str, email: &str, role: &str) -> (String, String) {
        let (status, body) = self
            .post(
                "/api/auth/register",
                None,
                json!({ "name": name, "email": email, "password": "secret-pass", "role": role }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        (body["user"]["id"].as_str().unwrap().to_string(), body["token"].as_str().unwrap().to_string())
    }

    async fn admin(&self) -> String {
        let admin = users::create_user(
            &self.state.db,
            NewUser {
                name: "Root",
                email: "admin@homechef.local",
                password: "admin-pass",
                role: Role::Admin,
                verified: true,
                phone: None,
                address: None,
            },
            16,
        )
        .await
        .unwrap();
        self.state.tokens.issue(&admin).unwrap()
    }

    async fn dish(&self, chef_token: &str, name: &str, price: f64) -> String {
        let (status, body) = self
            .post("/api/dishes", Some(chef_token), json!({ "name": name, "price": price, "quantity": 20 }))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body["id"].as_str().unwrap().to_string()
    }

    async fn order(&self, customer_token: &str, dish_id: &str, quantity: i64) -> Value {
        let (status, body) = self
            .post(
                "/api/orders",
                Some(customer_token),
                json!({
                    "customerName": "Asha",
                    "customerEmail": "asha@example.com",
                    "deliveryAddress": "12 MG Road",
                    "dishId": dish_id,
                    "quantity": quantity
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body
    }
}

fn code_in(text: &str) -> String {
    text.split(|c: char| !c.is_ascii_digit())
        .find(|part| part.len() == 6)
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn health_is_public() {
    let app = TestApp::new().await;
    let (status, body) = app.get("/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn missing_or_bad_token_is_unauthorized() {
    let app = TestApp::new().await;
    let (status, body) = app.get("/api/orders", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["message"].is_string());

    let (status, _) = app.get("/api/orders", Some("not-a-jwt")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.get("/api/auth/profile", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_role_is_forbidden() {
    let app = TestApp::new().await;
    let (_, customer) = app.register("Asha", "asha@example.com", "customer").await;
    let (_, community) = app.register("Kiran", "kiran@example.com", "community").await;

    assert_eq!(app.get("/api/users", Some(&customer)).await.0, StatusCode::FORBIDDEN);
    assert_eq!(app.get("/api/orders/chef-stats", Some(&customer)).await.0, StatusCode::FORBIDDEN);
    assert_eq!(app.get("/api/orders", Some(&community)).await.0, StatusCode::FORBIDDEN);
    assert_eq!(
        app.post("/api/dishes", Some(&customer), json!({ "name": "X", "price": 1.0 })).await.0,
        StatusCode::FORBIDDEN
    );
}

#[tokio::test]
async fn tokens_of_deleted_users_stop_working() {
    let app = TestApp::new().await;
    let (_, token) = app.register("Asha", "asha@example.com", "customer").await;
    assert_eq!(app.get("/api/auth/profile", Some(&token)).await.0, StatusCode::OK);
    assert_eq!(app.delete("/api/auth/profile", Some(&token)).await.0, StatusCode::OK);
    assert_eq!(app.get("/api/auth/profile", Some(&token)).await.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn self_registration_rules() {
    let app = TestApp::new().await;
    let (status, _) = app
        .post("/api/auth/register", None, json!({ "name": "Eve", "email": "eve@example.com", "password": "pw", "role": "admin" }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .post("/api/auth/register", None, json!({ "name": "Eve", "email": "eve@example.com", "password": "pw" }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["user"]["role"], "customer");
    assert!(body["user"].get("passwordHash").is_none());

    let (status, _) = app
        .post("/api/auth/register", None, json!({ "name": "Eve 2", "email": "EVE@example.com", "password": "pw" }))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn otp_registration_then_login() {
    let app = TestApp::new().await;

    let (status, _) = app.post("/api/otp/send", None, json!({ "email": "new@example.com" })).await;
    assert_eq!(status, StatusCode::OK);
    let mail = app.mailer.last_to("new@example.com").unwrap();
    let code = code_in(&mail.text);
    let wrong = if code == "000000" { "111111" } else { "000000" };

    let signup = |otp: &str| json!({ "name": "Neha", "email": "new@example.com", "password": "s3cret!", "otp": otp });

    let (status, body) = app.post("/api/otp/verify", None, signup(wrong)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid OTP");

    let (status, body) = app.post("/api/otp/verify", None, signup(&code)).await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["user"]["role"], "customer");
    assert_eq!(body["user"]["verified"], true);

    let (status, body) = app.post("/api/otp/verify", None, signup(&code)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "No OTP request found for this email");

    let (status, body) = app
        .post("/api/auth/login", None, json!({ "email": "new@example.com", "password": "s3cret!" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["token"].as_str().is_some_and(|t| !t.is_empty()));

    let (status, _) = app
        .post("/api/auth/login", None, json!({ "email": "new@example.com", "password": "nope" }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.post("/api/otp/send", None, json!({ "email": "new@example.com" })).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn expired_otp_is_removed() {
    let app = TestApp::new().await;
    app.state
        .otp
        .put(
            "late@example.com",
            OtpEntry {
                code_digest: homechef::common::crypto::CryptoManager::otp_digest("late@example.com", "123456"),
                expires_at: chrono::Utc::now().timestamp() - 10,
            },
        )
        .await
        .unwrap();

    let body = json!({ "name": "Late", "email": "late@example.com", "password": "pw", "otp": 123456 });
    let (status, resp) = app.post("/api/otp/verify", None, body.clone()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(resp["message"], "OTP expired");

    let (_, resp) = app.post("/api/otp/verify", None, body).await;
    assert_eq!(resp["message"], "No OTP request found for this email");
}

#[tokio::test]
async fn order_total_and_cancel() {
    let app = TestApp::new().await;
    let (_, chef) = app.register("Chef Ravi", "ravi@example.com", "chef").await;
    let (_, customer) = app.register("Asha", "asha@example.com", "customer").await;
    let dish = app.dish(&chef, "Veg Thali", 150.0).await;

    let order = app.order(&customer, &dish, 2).await;
    assert_eq!(order["totalPrice"], 300.0);
    assert_eq!(order["status"], "Pending");
    let order_id = order["id"].as_str().unwrap();

    let (_, mine) = app.get("/api/orders/myorders", Some(&customer)).await;
    assert_eq!(mine.as_array().unwrap().len(), 1);
    assert_eq!(mine[0]["dish"]["name"], "Veg Thali");

    let (status, _) = app.delete(&format!("/api/orders/{}", order_id), Some(&customer)).await;
    assert_eq!(status, StatusCode::OK);

    let (_, mine) = app.get("/api/orders/myorders", Some(&customer)).await;
    assert!(mine.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn order_validation() {
    let app = TestApp::new().await;
    let (_, chef) = app.register("Chef Ravi", "ravi@example.com", "chef").await;
    let (_, customer) = app.register("Asha", "asha@example.com", "customer").await;
    let dish = app.dish(&chef, "Dosa", 80.0).await;

    let base = json!({
        "customerName": "Asha",
        "customerEmail": "asha@example.com",
        "deliveryAddress": "12 MG Road",
        "dishId": dish,
        "quantity": 0
    });
    assert_eq!(app.post("/api/orders", Some(&customer), base).await.0, StatusCode::BAD_REQUEST);

    let missing = json!({ "customerName": "Asha", "dishId": dish, "quantity": 1 });
    assert_eq!(app.post("/api/orders", Some(&customer), missing).await.0, StatusCode::BAD_REQUEST);

    let unknown = json!({
        "customerName": "Asha",
        "customerEmail": "asha@example.com",
        "deliveryAddress": "12 MG Road",
        "dishId": "no-such-dish",
        "quantity": 1
    });
    assert_eq!(app.post("/api/orders", Some(&customer), unknown).await.0, StatusCode::NOT_FOUND);

    let (status, _) = app
        .put(&format!("/api/dishes/{}", dish), Some(&chef), json!({ "available": false }))
        .await;
    assert_eq!(status, StatusCode::OK);
    let off_menu = json!({
        "customerName": "Asha",
        "customerEmail": "asha@example.com",
        "deliveryAddress": "12 MG Road",
        "dishId": dish,
        "quantity": 1
    });
    let (status, body) = app.post("/api/orders", Some(&customer), off_menu).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Dish is not available");
    let (_, mine) = app.get("/api/orders/myorders", Some(&customer)).await;
    assert!(mine.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn customers_only_see_their_orders() {
    let app = TestApp::new().await;
    let (_, chef) = app.register("Chef Ravi", "ravi@example.com", "chef").await;
    let (_, first) = app.register("Asha", "asha@example.com", "customer").await;
    let (_, second) = app.register("Bala", "bala@example.com", "customer").await;
    let (_, rider) = app.register("Dev", "dev@example.com", "delivery").await;
    let dish = app.dish(&chef, "Idli", 40.0).await;

    app.order(&first, &dish, 1).await;
    app.order(&second, &dish, 3).await;

    let (_, seen) = app.get("/api/orders", Some(&first)).await;
    assert_eq!(seen.as_array().unwrap().len(), 1);
    assert_eq!(seen[0]["quantity"], 1);

    for token in [&rider, &chef] {
        let (status, seen) = app.get("/api/orders", Some(token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(seen.as_array().unwrap().len(), 2);
    }
}

#[tokio::test]
async fn status_moves_follow_the_lifecycle() {
    let app = TestApp::new().await;
    let (_, chef) = app.register("Chef Ravi", "ravi@example.com", "chef").await;
    let (_, customer) = app.register("Asha", "asha@example.com", "customer").await;
    let (rider_id, rider) = app.register("Dev", "dev@example.com", "delivery").await;
    let (_, other_rider) = app.register("Mira", "mira@example.com", "delivery").await;
    let dish = app.dish(&chef, "Poha", 60.0).await;
    let order = app.order(&customer, &dish, 1).await;
    let status_uri = format!("/api/orders/{}/status", order["id"].as_str().unwrap());
    let order_uri = format!("/api/orders/{}", order["id"].as_str().unwrap());

    let (status, body) = app.put(&status_uri, Some(&rider), json!({ "status": "Delivered" })).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["message"].as_str().unwrap().contains("Pending"));

    let (status, _) = app.put(&status_uri, Some(&rider), json!({ "status": "Shipped" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.put(&status_uri, Some(&customer), json!({ "status": "Accepted" })).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app.put(&status_uri, Some(&rider), json!({ "status": "Accepted" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Accepted");
    assert_eq!(body["deliveryPartnerId"], rider_id.as_str());

    // No longer pending: the customer can neither edit nor cancel
    let (status, _) = app.put(&order_uri, Some(&customer), json!({ "quantity": 5 })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = app.delete(&order_uri, Some(&customer)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (_, mine) = app.get("/api/orders/myorders", Some(&customer)).await;
    assert_eq!(mine[0]["quantity"], 1);
    assert_eq!(mine[0]["totalPrice"], 60.0);
    assert_eq!(mine[0]["status"], "Accepted");

    assert_eq!(app.put(&status_uri, Some(&rider), json!({ "status": "Picked Up" })).await.0, StatusCode::OK);
    assert_eq!(app.put(&status_uri, Some(&rider), json!({ "status": "Delivered" })).await.0, StatusCode::OK);
    assert_eq!(
        app.put(&status_uri, Some(&chef), json!({ "status": "Cancelled" })).await.0,
        StatusCode::CONFLICT
    );

    let (status, earnings) = app.get("/api/orders/delivery/earnings", Some(&rider)).await;
    assert_eq!(status, StatusCode::OK);
    assert!((earnings["totalEarnings"].as_f64().unwrap() - 6.0).abs() < 1e-9);
    assert_eq!(earnings["weeklyTrend"].as_array().unwrap().len(), 7);
    assert_eq!(earnings["deliveredOrders"].as_array().unwrap().len(), 1);

    // Earnings only cover orders assigned to the requesting partner
    let (status, earnings) = app.get("/api/orders/delivery/earnings", Some(&other_rider)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(earnings["totalEarnings"].to_string(), "0.0");
    assert!(earnings["deliveredOrders"].as_array().unwrap().is_empty());

    let (_, chef_earnings) = app.get("/api/chefs/earnings", Some(&chef)).await;
    assert_eq!(chef_earnings["totalEarnings"], 60.0);
    assert_eq!(chef_earnings["delivered"], 1);
}

#[tokio::test]
async fn quantity_edit_recomputes_total() {
    let app = TestApp::new().await;
    let (_, chef) = app.register("Chef Ravi", "ravi@example.com", "chef").await;
    let (_, customer) = app.register("Asha", "asha@example.com", "customer").await;
    let (_, other) = app.register("Bala", "bala@example.com", "customer").await;
    let dish = app.dish(&chef, "Veg Thali", 150.0).await;
    let order = app.order(&customer, &dish, 2).await;
    let uri = format!("/api/orders/{}", order["id"].as_str().unwrap());

    let (status, _) = app.put(&uri, Some(&other), json!({ "quantity": 1 })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = app.delete(&uri, Some(&other)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .put(&uri, Some(&customer), json!({ "quantity": 3, "deliveryAddress": "7 Park Street" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalPrice"], 450.0);
    assert_eq!(body["deliveryAddress"], "7 Park Street");
}

#[tokio::test]
async fn dishes_are_owned_by_their_chef() {
    let app = TestApp::new().await;
    let (chef_id, chef) = app.register("Chef Ravi", "ravi@example.com", "chef").await;
    let (_, rival) = app.register("Chef Mala", "mala@example.com", "chef").await;
    let (_, customer) = app.register("Asha", "asha@example.com", "customer").await;
    let dish = app.dish(&chef, "Upma", 50.0).await;
    let uri = format!("/api/dishes/{}", dish);

    let (status, listed) = app.get("/api/dishes", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed[0]["chef"]["id"], chef_id.as_str());

    assert_eq!(app.put(&uri, Some(&rival), json!({ "price": 1.0 })).await.0, StatusCode::FORBIDDEN);
    assert_eq!(
        app.post("/api/dishes", Some(&chef), json!({ "name": "Bad", "price": -5.0 })).await.0,
        StatusCode::BAD_REQUEST
    );

    let (status, body) = app.put(&uri, Some(&chef), json!({ "price": 55.0, "available": true })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["price"], 55.0);

    let order = app.order(&customer, &dish, 1).await;
    assert_eq!(app.delete(&uri, Some(&chef)).await.0, StatusCode::OK);
    assert_eq!(app.get(&uri, None).await.0, StatusCode::NOT_FOUND);

    let (_, mine) = app.get("/api/orders/myorders", Some(&customer)).await;
    assert_eq!(mine[0]["id"], order["id"]);
    assert_eq!(mine[0]["dish"]["name"], "Upma");
}

#[tokio::test]
async fn admin_manages_users_and_chefs() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let (chef_id, _) = app.register("Chef Ravi", "ravi@example.com", "chef").await;
    let (customer_id, _) = app.register("Asha", "asha@example.com", "customer").await;

    let (status, everyone) = app.get("/api/users", Some(&admin)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(everyone.as_array().unwrap().len(), 3);

    let (status, chefs) = app.get("/api/chefs", Some(&admin)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(chefs.as_array().unwrap().len(), 1);
    assert_eq!(chefs[0]["verified"], false);

    let (status, chef) = app.put(&format!("/api/chefs/{}/verify", chef_id), Some(&admin), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(chef["verified"], true);
    assert_eq!(
        app.put(&format!("/api/chefs/{}/verify", customer_id), Some(&admin), json!({})).await.0,
        StatusCode::NOT_FOUND
    );

    let (status, created) = app
        .post("/api/users", Some(&admin), json!({ "name": "Rider", "email": "rider@example.com", "password": "pw", "role": "delivery" }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["role"], "delivery");

    assert_eq!(app.delete(&format!("/api/users/{}", customer_id), Some(&admin)).await.0, StatusCode::OK);
    let (_, everyone) = app.get("/api/users", Some(&admin)).await;
    assert_eq!(everyone.as_array().unwrap().len(), 3);

    // Deleted accounts keep their address reserved
    let (status, _) = app
        .post("/api/auth/register", None, json!({ "name": "Asha", "email": "asha@example.com", "password": "pw" }))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn profile_and_password() {
    let app = TestApp::new().await;
    let (_, token) = app.register("Asha", "asha@example.com", "customer").await;

    let (status, body) = app
        .put("/api/auth/profile", Some(&token), json!({ "name": "Asha K", "phone": "98765" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["name"], "Asha K");

    let (status, _) = app
        .put("/api/auth/profile/password", Some(&token), json!({ "oldPassword": "wrong", "newPassword": "fresh" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .put("/api/auth/profile/password", Some(&token), json!({ "oldPassword": "secret-pass", "newPassword": "fresh" }))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .post("/api/auth/login", None, json!({ "email": "asha@example.com", "password": "fresh" }))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn chef_dashboard_stats() {
    let app = TestApp::new().await;
    let (_, chef) = app.register("Chef Ravi", "ravi@example.com", "chef").await;
    let (_, customer) = app.register("Asha", "asha@example.com", "customer").await;
    let thali = app.dish(&chef, "Thali", 150.0).await;
    let dosa = app.dish(&chef, "Dosa", 80.0).await;
    app.order(&customer, &thali, 2).await;
    app.order(&customer, &dosa, 1).await;
    app.order(&customer, &dosa, 1).await;

    let (status, stats) = app.get("/api/orders/chef-stats", Some(&chef)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["revenue"], 460.0);
    assert_eq!(stats["orders"], 3);
    assert_eq!(stats["topDish"], "Dosa");
    assert_eq!(stats["monthlySales"].as_array().unwrap().len(), 1);

    let (status, weekly) = app.get("/api/orders/chef-weekly-stats", Some(&chef)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(weekly[0]["orders"], 3);
    assert!(weekly[0]["weekRange"].as_str().unwrap().contains(" - "));
}

#[tokio::test]
async fn feedback_accepts_anonymous_but_not_bad_tokens() {
    let app = TestApp::new().await;
    let (_, customer) = app.register("Asha", "asha@example.com", "customer").await;
    let admin = app.admin().await;

    let (status, body) = app.post("/api/feedback", None, json!({ "message": "Lovely food", "rating": 5 })).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["customerName"], "Anonymous");

    let (status, body) = app.post("/api/feedback", Some(&customer), json!({ "message": "Late delivery" })).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["customerName"], "Asha");
    let feedback_id = body["id"].as_str().unwrap().to_string();

    assert_eq!(
        app.post("/api/feedback", Some("garbage"), json!({ "message": "x" })).await.0,
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        app.post("/api/feedback", None, json!({ "message": "x", "rating": 9 })).await.0,
        StatusCode::BAD_REQUEST
    );

    assert_eq!(app.get("/api/feedback", Some(&customer)).await.0, StatusCode::FORBIDDEN);
    let (_, all) = app.get("/api/feedback", Some(&admin)).await;
    assert_eq!(all.as_array().unwrap().len(), 2);

    let uri = format!("/api/feedback/{}", feedback_id);
    let (status, body) = app.put(&uri, Some(&admin), json!({ "rating": 3 })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rating"], 3);
    assert_eq!(app.delete(&uri, Some(&admin)).await.0, StatusCode::OK);
    assert_eq!(app.delete(&uri, Some(&admin)).await.0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn posts_newest_first() {
    let app = TestApp::new().await;
    let (_, token) = app.register("Kiran", "kiran@example.com", "community").await;

    assert_eq!(
        app.post("/api/posts", None, json!({ "title": "t", "content": "c" })).await.0,
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        app.post("/api/posts", Some(&token), json!({ "title": "", "content": "c" })).await.0,
        StatusCode::BAD_REQUEST
    );

    app.post("/api/posts", Some(&token), json!({ "title": "First", "content": "one" })).await;
    let (_, second) = app.post("/api/posts", Some(&token), json!({ "title": "Second", "content": "two" })).await;
    assert_eq!(second["author"], "Kiran");

    let (_, posts) = app.get("/api/posts", None).await;
    assert_eq!(posts[0]["title"], "Second");
    assert_eq!(posts[1]["title"], "First");

    let uri = format!("/api/posts/{}", second["id"].as_str().unwrap());
    let (status, edited) = app.put(&uri, Some(&token), json!({ "content": "two, edited" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(edited["title"], "Second");
    assert_eq!(edited["content"], "two, edited");
    assert_eq!(app.delete(&uri, Some(&token)).await.0, StatusCode::OK);
    assert_eq!(app.delete(&uri, Some(&token)).await.0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn chat_history_and_broadcast() {
    let app = TestApp::new().await;
    let mut events = app.state.events.subscribe();

    for text in ["hello", "anyone cooking tonight?"] {
        let (status, _) = app
            .post("/api/chat", None, json!({ "roomId": "foodies", "sender": "Kiran", "message": text, "senderRole": "community" }))
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }
    let (status, _) = app
        .post("/api/chat", None, json!({ "roomId": "foodies", "sender": "Ravi", "message": "hi", "senderRole": "chef" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, history) = app.get("/api/chat/foodies", None).await;
    let texts: Vec<_> = history.as_array().unwrap().iter().map(|m| m["message"].as_str().unwrap()).collect();
    assert_eq!(texts, vec!["hello", "anyone cooking tonight?"]);

    let envelope = events.recv().await.unwrap();
    match envelope.event {
        ServerEvent::ReceiveMessage(msg) => assert_eq!(msg.message, "hello"),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn order_events_reach_the_right_audience() {
    use homechef::server::events::Topic;

    let app = TestApp::new().await;
    let (chef_id, chef) = app.register("Chef Ravi", "ravi@example.com", "chef").await;
    let (customer_id, customer) = app.register("Asha", "asha@example.com", "customer").await;
    let dish = app.dish(&chef, "Thali", 150.0).await;

    let mut events = app.state.events.subscribe();
    let order = app.order(&customer, &dish, 1).await;

    let envelope = events.recv().await.unwrap();
    assert_eq!(envelope.event, ServerEvent::OrderCreated { id: order["id"].as_str().unwrap().to_string() });
    assert!(envelope.audience.contains(&Topic::User(customer_id)));
    assert!(envelope.audience.contains(&Topic::Chef(chef_id)));
    assert!(envelope.audience.contains(&Topic::Role(Role::Delivery)));
}

#[tokio::test]
async fn contact_and_receipt_mail() {
    let app = TestApp::new().await;

    let (status, _) = app
        .post("/api/contact", None, json!({ "name": "Ravi", "email": "ravi@example.com", "subject": "Catering", "message": "Need 50 plates" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    let mail = app.mailer.last_to("inbox@homechef.local").unwrap();
    assert_eq!(mail.subject, "New Inquiry: Catering");
    assert_eq!(mail.reply_to.as_deref(), Some("ravi@example.com"));

    assert_eq!(
        app.post("/api/contact", None, json!({ "name": "Ravi", "email": "", "message": "x" })).await.0,
        StatusCode::BAD_REQUEST
    );

    let (status, _) = app
        .post(
            "/api/order-email/send",
            None,
            json!({ "customerEmail": "asha@example.com", "customerName": "Asha", "dishName": "Thali", "quantity": 2, "totalPrice": 300.0, "paymentStatus": "Paid" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let receipt = app.mailer.last_to("asha@example.com").unwrap();
    assert!(receipt.html.unwrap().contains("Thali"));

    assert_eq!(
        app.post("/api/order-email/send", None, json!({ "customerEmail": "asha@example.com" })).await.0,
        StatusCode::BAD_REQUEST
    );
}
