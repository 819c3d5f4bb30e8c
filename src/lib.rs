//! # browser-pilot
//!
//! Remote browser automation agent.
//!
//! This library provides:
//! - A registry of atomic browser actions with declared, validated parameters
//! - Background tasks with a monotonic lifecycle and cooperative cancellation
//! - Per-task plans that run their steps strictly in order
//! - Live updates (task changes, page state, throttled screenshots) over WebSocket
//!
//! ## Architecture
//!
//! ```text
//!   HTTP / WebSocket ──► TaskManager ──► AgentService ──► ActionRegistry ──► Actuator
//!                            │                │                               (Chrome, CDP)
//!                            ▼                ▼
//!                      NotificationHub ◄── FrameBroadcaster
//!                            │
//!                            ▼
//!                       observers
//! ```
//!
//! ## Modules
//! - `actuator`: the controlled browser behind a trait
//! - `controller`: action catalogue, validation and dispatch
//! - `task`: task records, manager and plan state machine
//! - `notify`: subscriptions, fan-out and screenshot throttling
//! - `agent`: sequences, plans and natural-language dispatch
//! - `api`: HTTP and WebSocket surface

pub mod actuator;
pub mod agent;
pub mod api;
pub mod config;
pub mod controller;
pub mod notify;
pub mod task;

pub use config::Config;
