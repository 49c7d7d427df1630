// Aggregations behind the chef and delivery dashboards. Everything here is a
// pure function over order snapshots; all calendar bucketing is done in UTC.
use crate::common::models::{Order, OrderStatus};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Share of an order's total paid to the delivery partner.
pub const DELIVERY_COMMISSION: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChefStats {
    pub revenue: f64,
    pub orders: usize,
    pub top_dish: String,
    pub monthly_sales: Vec<MonthlySales>,
    pub dish_stats: Vec<DishStat>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlySales {
    pub month: String,
    pub revenue: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DishStat {
    pub name: String,
    pub orders: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyStat {
    pub week_start: NaiveDate,
    pub week_range: String,
    pub orders: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayEarnings {
    pub day: String,
    pub earnings: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryEarnings {
    pub total_earnings: f64,
    pub today_earnings: f64,
    pub weekly_earnings: f64,
    pub weekly_trend: Vec<DayEarnings>,
    pub delivered_orders: Vec<Order>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChefEarnings {
    pub total_earnings: f64,
    pub total_orders: usize,
    pub delivered: usize,
}

/// Sums from a positive zero, so empty totals serialize as `0.0`.
fn total(values: impl Iterator<Item = f64>) -> f64 {
    values.fold(0.0, |acc, x| acc + x)
}

fn dish_name(order: &Order) -> &str {
    order.dish.as_ref().map(|d| d.name.as_str()).unwrap_or("Unknown")
}

/// Sunday on or before `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_sunday() as i64)
}

/// Revenue, order count, best seller and per-month sales over a chef's orders.
pub fn chef_stats(orders: &[Order]) -> ChefStats {
    let revenue = total(orders.iter().map(|o| o.total_price));

    let mut months: BTreeMap<(i32, u32), f64> = BTreeMap::new();
    let mut per_dish: BTreeMap<&str, usize> = BTreeMap::new();
    for order in orders {
        let key = (order.created_at.year(), order.created_at.month());
        *months.entry(key).or_default() += order.total_price;
        *per_dish.entry(dish_name(order)).or_default() += 1;
    }

    // Names iterate alphabetically and only a strictly larger count takes the lead
    let top_dish = per_dish
        .iter()
        .fold(None::<(&str, usize)>, |best, (name, count)| match best {
            Some((_, best_count)) if best_count >= *count => best,
            _ => Some((name, *count)),
        })
        .map(|(name, _)| name.to_string())
        .unwrap_or_else(|| "-".to_string());

    let monthly_sales = months
        .into_iter()
        .filter_map(|((year, month), revenue)| {
            NaiveDate::from_ymd_opt(year, month, 1).map(|first| MonthlySales {
                month: first.format("%b %Y").to_string(),
                revenue,
            })
        })
        .collect();

    let dish_stats = per_dish
        .into_iter()
        .map(|(name, orders)| DishStat { name: name.to_string(), orders })
        .collect();

    ChefStats { revenue, orders: orders.len(), top_dish, monthly_sales, dish_stats }
}

/// Order counts per Sunday-start week, oldest week first.
pub fn chef_weekly_stats(orders: &[Order]) -> Vec<WeeklyStat> {
    let mut weeks: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    for order in orders {
        *weeks.entry(week_start(order.created_at.date_naive())).or_default() += 1;
    }
    weeks
        .into_iter()
        .map(|(start, orders)| {
            let end = start + Duration::days(6);
            WeeklyStat {
                week_start: start,
                week_range: format!("{} - {}", start.format("%b %-d"), end.format("%b %-d")),
                orders,
            }
        })
        .collect()
}

/// Earnings of one delivery partner. `orders` should already be limited to
/// the partner's assignments; anything not Delivered is ignored. The delivery
/// time of an order is its last update.
pub fn delivery_earnings(orders: Vec<Order>, now: DateTime<Utc>) -> DeliveryEarnings {
    let delivered: Vec<Order> = orders
        .into_iter()
        .filter(|o| o.status == OrderStatus::Delivered)
        .collect();
    let cut = |o: &Order| o.total_price * DELIVERY_COMMISSION;

    let today = now.date_naive();
    let week_ago = now - Duration::days(7);

    let total_earnings = total(delivered.iter().map(cut));
    let today_earnings = total(delivered.iter().filter(|o| o.updated_at.date_naive() == today).map(cut));
    let weekly_earnings = total(delivered.iter().filter(|o| o.updated_at >= week_ago).map(cut));

    let weekly_trend = (0..7)
        .rev()
        .map(|back| {
            let day = today - Duration::days(back);
            DayEarnings {
                day: day.format("%b %-d").to_string(),
                earnings: total(delivered.iter().filter(|o| o.updated_at.date_naive() == day).map(cut)),
            }
        })
        .collect();

    DeliveryEarnings {
        total_earnings,
        today_earnings,
        weekly_earnings,
        weekly_trend,
        delivered_orders: delivered,
    }
}

pub fn chef_earnings(orders: &[Order]) -> ChefEarnings {
    let delivered: Vec<&Order> = orders.iter().filter(|o| o.status == OrderStatus::Delivered).collect();
    ChefEarnings {
        total_earnings: total(delivered.iter().map(|o| o.total_price)),
        total_orders: orders.len(),
        delivered: delivered.len(),
    }
}
