mod database;

pub use database::{DbRepo, MessageRepo, UserRepo};
