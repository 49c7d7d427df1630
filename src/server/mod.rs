pub mod app;
pub mod auth;
pub mod chat;
pub mod config;
pub mod contact;
pub mod database;
pub mod dishes;
pub mod error;
pub mod events;
pub mod feedback;
pub mod mailer;
pub mod orders;
pub mod otp;
pub mod posts;
pub mod stats;
pub mod users;
pub mod websocket;
