//! Command handlers

pub mod database;
pub mod inventory;
pub mod record;
