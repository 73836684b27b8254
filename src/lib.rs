pub mod amqp;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod export;
pub mod gateway;
pub mod health;
pub mod incoming;
