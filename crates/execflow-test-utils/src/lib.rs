//! Test helpers shared across execflow crates.

pub mod fixtures;
pub mod mock_agent;

pub use fixtures::{test_key, TEST_KEY_B64};
pub use mock_agent::MockAgent;
