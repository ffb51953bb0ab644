//! # SC Test Utilities
//!
//! Shared test utilities for the Session Controller (SC) service.
//!
//! Everything runs against the in-memory store with mock collaborators, so
//! engine, actor and HTTP tests need no Redis or external services.
//!
//! ## Modules
//!
//! - `fixtures` - Host and participant builders that seed the store
//! - `harness` - `TestEngine`: engine wired to mocks and a manual clock
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let env = TestEngine::new();
//!     TestHost::new("h1").with_rate(SessionType::Chat, 10.0).seed(&env.store).await;
//!     TestParticipant::new("alice").with_balance(100.0).seed(&env.store).await;
//!
//!     env.engine.enable_channel("h1", SessionType::Chat, "dev").await.unwrap();
//! }
//! ```

pub mod fixtures;
pub mod harness;

pub use fixtures::*;
pub use harness::*;
