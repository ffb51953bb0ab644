//! Session Controller (SC) Service Library
//!
//! Admission and lifecycle engine for paid one-to-one marketplace sessions
//! (livestream, chat, call):
//!
//! - Per-host waitlists that live on the host while offline and on the
//!   channel while a channel is active
//! - A single occupant ("temp host") per channel, driven through a closed
//!   state machine (REQUESTED, ACCEPTED, REJECTED, TERMINATED_BY_*)
//! - Per-minute billing with a tentative end time derived from balance
//! - Recording start/stop around accepted sessions
//! - Scheduled balance, recording-health and wait-time checks delegated to
//!   an external dispatcher
//!
//! # Architecture
//!
//! ```text
//! HTTP (axum) ──► SessionControllerHandle ──► HostActor (one per host)
//!                                                 │
//!                                                 ▼
//!                                           SessionEngine
//!                         UnitOfWork (versioned reads, one atomic commit)
//!                                                 │
//!                         post-commit side effects, best-effort:
//!                         recording stop, notifications, realtime events,
//!                         scheduled checks
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Controller and per-host actors
//! - [`engine`] - Waitlist, state machine, billing and lifecycle operations
//! - [`store`] - Aggregate store (Redis / in-memory) and unit of work
//! - [`services`] - Recording, dispatcher and event bus clients
//! - [`models`] - Aggregates and enums
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with stable codes and HTTP statuses

pub mod actors;
pub mod clock;
pub mod config;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod routes;
pub mod services;
pub mod store;
