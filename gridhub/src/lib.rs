/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Gridhub – orchestration core for an untrusted worker fleet
//!
//! The hub admits container-based tasks, places them onto worker nodes with a
//! resource- and trust-aware scheduler, tracks worker liveness, and accepts or
//! rejects each task via trust-weighted cross-validation when several workers
//! execute it redundantly.
//!
//! ```text
//! lib.rs
//! ├── config/        – hub tunables, YAML loading, validation
//! ├── error          – HubError taxonomy
//! ├── model          – Node / Task / Assignment + typed payload projections
//! ├── clock          – wall-clock port (mockable) + monotonic deadlines
//! ├── store/         – transactional store port + in-memory reference impl
//! ├── ports          – ImageValidator + EventBus ports and stock impls
//! ├── scheduler/     – scheduling policy, placer, queue manager, assignment engine
//! ├── liveness       – heartbeat ingestion + node health scan
//! ├── validator      – trust-weighted result validation
//! ├── orchestrator   – tick composition + periodic drivers
//! └── api            – Hub: the transport-agnostic operation surface
//! ```
//!
//! Transports (HTTP/gRPC), durable persistence, the image-pull worker and the
//! worker-side container runner are host concerns: the core consumes them as
//! ports and never links against them.

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod liveness;
pub mod model;
pub mod orchestrator;
pub mod ports;
pub mod scheduler;
pub mod store;
pub mod validator;
