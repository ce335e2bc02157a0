//! Vigil - Sensor monitoring with threshold rules and alert notification.
//!
//! # Overview
//!
//! Monitors report readings per channel. Each reading is calibrated, checked
//! for spikes against the previous valid reading and stored. Valid readings on
//! enabled channels are evaluated in the background against the channel's
//! rules; a match opens an alert, repeated matches nag the rule's contacts
//! until someone acknowledges, and the first non-matching reading resolves
//! the alert and sends a recovery notice.
//!
//! # Guarantees
//!
//! - At most one active alert per (channel, rule)
//! - Readings of one channel are evaluated in arrival order
//! - An alert is acknowledged at most once; the first acknowledger wins
//! - A failed notification never blocks other notifications or alert state
//!
//! # Modules
//!
//! - [`model`]: Monitors, channels, readings, rules, alerts and contacts
//! - [`storage`]: SQLite storage layer
//! - [`ingest`]: Reading ingestion and spike detection
//! - [`rules`]: Threshold conditions and rule evaluation
//! - [`lifecycle`]: Alert open/nag/resolve transitions
//! - [`worker`]: Evaluation queue, per-channel lanes and the rule resumer
//! - [`notify`]: Message rendering and delivery gateways
//! - [`ack`]: Alert acknowledgement
//! - [`api`]: HTTP API handlers
//! - [`config`]: Environment configuration

pub mod ack;
pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod lifecycle;
pub mod model;
pub mod notify;
pub mod rules;
pub mod storage;
pub mod units;
pub mod worker;
