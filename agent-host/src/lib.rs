//! Agent host - durable, addressable agent actors
//!
//! Each agent is a ractor actor identified by name, backed by its own SQLite
//! database, and reachable over WebSockets or one of the MCP transports. Idle
//! agents hibernate and are woken again by traffic or by their alarm.

pub mod agent;
pub mod api;
pub mod config;
pub mod connection;
pub mod cron;
pub mod demo;
pub mod host;
pub mod mcp;
pub mod scheduler;
pub mod storage;
