//! Akimori - backend for an anime streaming community
//!
//! Accounts and profiles with XP levels, a two-currency wallet ledger,
//! cosmetic items sold through a shop, promo codes tied to payments,
//! direct chats with live WebSocket delivery, and a local mirror of the
//! Kodik video catalog.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod models;
pub mod services;
