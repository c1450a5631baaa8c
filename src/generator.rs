//! Synthetic rows for the two workloads.

use chrono::{NaiveDateTime, Utc};
use fake::Fake;
use fake::faker::address::en::{CityName, CountryName};
use fake::faker::internet::en::SafeEmail;
use fake::faker::name::en::Name;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use crate::schema::{Column, ColumnData, Record};

const PRODUCTS: &[&str] = &["Shoes", "Shirt", "Phone", "Laptop", "Book"];
const PROMO_WEIGHT: u32 = 5;
const PAYMENT_METHODS: &[&str] = &["Credit Card", "PayPal", "Crypto", "Gift Card"];
const MIN_QUANTITY: i32 = 1;
const MAX_QUANTITY: i32 = 5;
const MIN_PRICE: f64 = 10.0;
const MAX_PRICE: f64 = 500.0;

/// Fills a reusable buffer with one batch per call.
pub trait BatchGenerator: Send + 'static {
    type Row: Record;

    fn fill(&mut self, batch_size: usize, out: &mut Vec<Self::Row>);
}

#[derive(Debug, Clone, PartialEq)]
pub struct LakeRow {
    pub id: i64,
    pub name: String,
}

const LAKE_COLUMNS: &[Column] = &[
    Column::new("id", "BIGINT", "INT8[]"),
    Column::new("name", "TEXT", "TEXT[]"),
];

impl Record for LakeRow {
    const COLUMNS: &'static [Column] = LAKE_COLUMNS;
    const PRIMARY_KEY: &'static str = "id";

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn to_columns(rows: &[Self]) -> Vec<ColumnData> {
        vec![
            ColumnData::Int8(rows.iter().map(|r| r.id).collect()),
            ColumnData::Text(rows.iter().map(|r| r.name.clone()).collect()),
        ]
    }
}

/// Ids are drawn uniformly from `1..=key_space`, so concurrent workers may
/// collide; the insert skips those.
pub struct LakeGenerator {
    rng: StdRng,
    worker_index: usize,
    key_space: u64,
}

impl LakeGenerator {
    pub fn new(worker_index: usize, key_space: u64) -> Self {
        Self::with_rng(worker_index, key_space, StdRng::from_entropy())
    }

    pub fn with_rng(worker_index: usize, key_space: u64, rng: StdRng) -> Self {
        Self {
            rng,
            worker_index,
            key_space: key_space.clamp(1, i64::MAX as u64),
        }
    }
}

impl BatchGenerator for LakeGenerator {
    type Row = LakeRow;

    fn fill(&mut self, batch_size: usize, out: &mut Vec<LakeRow>) {
        for i in 0..batch_size {
            out.push(LakeRow {
                id: self.rng.gen_range(1..=self.key_space) as i64,
                name: format!("Lake_{}_{}", self.worker_index, i),
            });
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRow {
    pub transaction_id: String,
    pub timestamp: NaiveDateTime,
    pub customer_name: String,
    pub email: String,
    pub product: String,
    pub quantity: i32,
    pub price_per_unit: f64,
    pub payment_method: String,
    pub city: String,
    pub country: String,
}

const TRANSACTION_COLUMNS: &[Column] = &[
    Column::new("transaction_id", "VARCHAR(36)", "TEXT[]"),
    Column::new("timestamp", "TIMESTAMP NOT NULL", "TIMESTAMP[]"),
    Column::new("customer_name", "VARCHAR(255)", "TEXT[]"),
    Column::new("email", "VARCHAR(255)", "TEXT[]"),
    Column::new("product", "VARCHAR(255)", "TEXT[]"),
    Column::new("quantity", "INT", "INT4[]"),
    Column::new("price_per_unit", "DECIMAL(10, 2)", "FLOAT8[]"),
    Column::new("payment_method", "VARCHAR(255)", "TEXT[]"),
    Column::new("city", "VARCHAR(255)", "TEXT[]"),
    Column::new("country", "VARCHAR(255)", "TEXT[]"),
];

impl Record for TransactionRow {
    const COLUMNS: &'static [Column] = TRANSACTION_COLUMNS;
    const PRIMARY_KEY: &'static str = "transaction_id";

    fn key(&self) -> String {
        self.transaction_id.clone()
    }

    fn to_columns(rows: &[Self]) -> Vec<ColumnData> {
        let text = |f: fn(&TransactionRow) -> &String| {
            ColumnData::Text(rows.iter().map(|r| f(r).clone()).collect())
        };
        vec![
            text(|r| &r.transaction_id),
            ColumnData::Timestamp(rows.iter().map(|r| r.timestamp).collect()),
            text(|r| &r.customer_name),
            text(|r| &r.email),
            text(|r| &r.product),
            ColumnData::Int4(rows.iter().map(|r| r.quantity).collect()),
            ColumnData::Float8(rows.iter().map(|r| r.price_per_unit).collect()),
            text(|r| &r.payment_method),
            text(|r| &r.city),
            text(|r| &r.country),
        ]
    }
}

/// Retail transactions with promotional items weighted up.
pub struct TransactionGenerator {
    rng: StdRng,
    products: WeightedIndex<u32>,
}

impl TransactionGenerator {
    pub fn new(promo_items: &[String]) -> Self {
        Self::with_rng(promo_items, StdRng::from_entropy())
    }

    pub fn with_rng(promo_items: &[String], rng: StdRng) -> Self {
        let weights = PRODUCTS.iter().map(|p| {
            if promo_items.iter().any(|promo| promo == p) {
                PROMO_WEIGHT
            } else {
                1
            }
        });
        Self {
            rng,
            // All weights are positive, construction cannot fail.
            products: WeightedIndex::new(weights).unwrap_or_else(|_| unreachable!()),
        }
    }

    fn pick(&mut self, options: &[&'static str]) -> &'static str {
        options.choose(&mut self.rng).copied().unwrap_or_default()
    }

    pub fn next_row(&mut self) -> TransactionRow {
        let customer_name: String = Name().fake_with_rng(&mut self.rng);
        let email: String = SafeEmail().fake_with_rng(&mut self.rng);
        let city: String = CityName().fake_with_rng(&mut self.rng);
        let country: String = CountryName().fake_with_rng(&mut self.rng);
        let price: f64 = self.rng.gen_range(MIN_PRICE..=MAX_PRICE);

        TransactionRow {
            transaction_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().naive_utc(),
            customer_name,
            email,
            product: PRODUCTS[self.products.sample(&mut self.rng)].to_string(),
            quantity: self.rng.gen_range(MIN_QUANTITY..=MAX_QUANTITY),
            price_per_unit: (price * 100.0).round() / 100.0,
            payment_method: self.pick(PAYMENT_METHODS).to_string(),
            city,
            country,
        }
    }
}

impl BatchGenerator for TransactionGenerator {
    type Row = TransactionRow;

    fn fill(&mut self, batch_size: usize, out: &mut Vec<TransactionRow>) {
        out.extend((0..batch_size).map(|_| self.next_row()));
    }
}
