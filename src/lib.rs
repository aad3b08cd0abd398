//! # flowcore
//!
//! In-memory, per-thread analytics core for a NetFlow/IPFIX/sFlow collector:
//! a filter DSL, fixed-window merging (FWM), moving-average limit detection
//! (MAVG), and top-K classification (CLSF), fed by an external decoder and
//! dispatched per ingest thread against a tree of monitoring objects.
//!
//! ## Scope
//!
//! This crate owns the aggregation core: parsing and evaluating the filter
//! language, maintaining per-thread lock-free banks, merging them on a
//! background cadence, and driving MAVG's over/under-limit state machine.
//! It does not decode NetFlow/IPFIX/sFlow wire formats, capture packets, look
//! up GeoIP/ASN databases, or run SQL export scripts — those are external
//! collaborators this crate defines narrow seams for
//! ([`field::accessor::GeoipLookup`], [`flow::FlowRecord`],
//! [`process::spawn_detached`]).
//!
//! ## Module map
//!
//! - [`field`] — declarative field table, raw accessor, computed function fields.
//! - [`filter`] — the filter DSL: lexer, parser, postfix evaluator.
//! - [`flow`] — the flat [`flow::FlowRecord`] contract populated by an external decoder.
//! - [`okvs`] — in-memory ordered key-value store with arena-bounded transactions.
//! - [`bank`] — per-thread double-buffered [`okvs::Okvs`] pair with a lock-free swap.
//! - [`engines`] — FWM, MAVG, CLSF: the three aggregation engines.
//! - [`mo`] — the monitoring-object tree: per-MO config, fieldsets, engine ownership.
//! - [`dispatch`] — per-flow, per-ingest-thread dispatch across the MO tree.
//! - [`reload`] — the background hot-reload coordinator.
//! - [`runtime`] — the FWM/MAVG/CLSF background poll loops (dumper, reactor,
//!   underlimit checker, dumper, merger).
//! - [`geoip`] — a CSV-backed [`field::accessor::GeoipLookup`] implementation.
//! - [`sniff`] — DNS answer / TLS SNI extraction from sampled payload bytes.
//! - [`context`] — process-wide shared state (config, mfreq table, geoip, stop/reload flags).
//! - [`config`] — top-level process config types.
//! - [`process`] — detached external process launcher for action scripts.
//! - [`logging`] — global `tracing` subscriber installation.
//! - [`error`] — the crate-wide error type.

pub mod bank;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod engines;
pub mod error;
pub mod field;
pub mod filter;
pub mod flow;
pub mod geoip;
pub mod logging;
pub mod mo;
pub mod okvs;
pub mod process;
pub mod reload;
pub mod runtime;
pub mod sniff;

pub use error::{FlowError, Result};
pub use flow::FlowRecord;
